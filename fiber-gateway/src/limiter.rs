// fiber-gateway: Two-tier rate limiter
// Distributed token bucket in the kv-store with a local in-process fallback
// and hysteresis between the two. A process-wide safety cap guards
// everything else.

use std::num::NonZeroU32;
use std::sync::Mutex;

use fiber_store::Kv;
use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota};

use crate::config::RateLimitSettings;
use crate::state::CurrentUser;

/// Limiter tier currently in effect, reported via X-RateLimit-Policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Distributed,
    Local,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Distributed => "distributed",
            Mode::Local => "local",
        }
    }
}

/// Headers attached to rate-limited endpoints.
#[derive(Debug, Clone)]
pub struct RateHeaders {
    pub policy: &'static str,
    pub limit: String,
    pub remaining: String,
    pub reset: Option<String>,
    pub retry_after: Option<String>,
}

impl RateHeaders {
    pub fn as_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![
            ("X-RateLimit-Policy".to_string(), self.policy.to_string()),
            ("X-RateLimit-Limit".to_string(), self.limit.clone()),
            ("X-RateLimit-Remaining".to_string(), self.remaining.clone()),
        ];
        if let Some(reset) = &self.reset {
            pairs.push(("X-RateLimit-Reset".to_string(), reset.clone()));
        }
        if let Some(retry) = &self.retry_after {
            pairs.push(("Retry-After".to_string(), retry.clone()));
        }
        pairs
    }
}

/// Limiter decision.
#[derive(Debug, Clone)]
pub enum RateOutcome {
    Allowed(RateHeaders),
    Rejected(RateHeaders),
    /// Global safety cap drained: 503, no retry guidance.
    Overloaded,
}

struct Hysteresis {
    mode: Mode,
    health_streak: u32,
}

/// Hysteresis threshold: consecutive kv successes before returning to the
/// distributed tier.
const RECOVERY_STREAK: u32 = 5;
const DISTRIBUTED_KEY_TTL_SEC: i64 = 600;

pub struct RateLimiter {
    settings: RateLimitSettings,
    state: Mutex<Hysteresis>,
    global_cap: DefaultDirectRateLimiter,
    local: DefaultKeyedRateLimiter<String>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        let global_max =
            NonZeroU32::new(settings.global_max.max(1)).unwrap_or(NonZeroU32::MIN);
        let local_rate =
            NonZeroU32::new(settings.local_rate_per_sec.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            state: Mutex::new(Hysteresis {
                mode: Mode::Distributed,
                health_streak: 0,
            }),
            global_cap: governor::RateLimiter::direct(
                Quota::per_second(global_max).allow_burst(global_max),
            ),
            local: governor::RateLimiter::keyed(
                Quota::per_second(local_rate).allow_burst(local_rate),
            ),
            settings,
        }
    }

    /// Resolve the client address: X-Forwarded-For is trusted only when the
    /// direct peer is a configured proxy.
    pub fn client_ip(&self, forwarded_for: Option<&str>, peer: &str) -> String {
        if let Some(xff) = forwarded_for {
            let trusted = self
                .settings
                .trusted_proxies
                .iter()
                .any(|p| peer.starts_with(p.as_str()));
            if trusted {
                if let Some(first) = xff.split(',').next() {
                    return first.trim().to_string();
                }
            }
        }
        peer.to_string()
    }

    /// Identity key: authenticated user first, client address otherwise.
    pub fn identity_key(&self, user: &CurrentUser, client_ip: &str) -> String {
        if user.role.is_authenticated() && user.username != "anonymous" {
            format!("user:{}", user.username)
        } else {
            format!("ip:{}", client_ip)
        }
    }

    pub fn mode(&self) -> Mode {
        self.state.lock().map(|s| s.mode).unwrap_or(Mode::Local)
    }

    /// Full check for the ingest path: global cap, then distributed bucket,
    /// then the local fallback.
    pub async fn check_ingest(&self, kv: &Kv, key_id: &str) -> RateOutcome {
        if self.global_cap.check().is_err() {
            tracing::error!("global rate cap exceeded");
            return RateOutcome::Overloaded;
        }

        let redis_key = format!("limiter:ingest:{}", key_id);
        match kv
            .rate_limit(
                &redis_key,
                self.settings.ingest_rate_per_sec,
                self.settings.ingest_burst,
                1,
                DISTRIBUTED_KEY_TTL_SEC,
            )
            .await
        {
            Ok(decision) => {
                let recovered = self.record_health(true);
                if recovered || self.mode() == Mode::Distributed {
                    let headers = RateHeaders {
                        policy: Mode::Distributed.as_str(),
                        limit: decision.limit.to_string(),
                        remaining: (decision.remaining as i64).to_string(),
                        reset: Some(decision.reset_ts.to_string()),
                        retry_after: (!decision.allowed)
                            .then(|| decision.retry_after_sec.to_string()),
                    };
                    return if decision.allowed {
                        RateOutcome::Allowed(headers)
                    } else {
                        RateOutcome::Rejected(headers)
                    };
                }
                // Still in local mode until the streak completes.
                self.check_local(key_id)
            }
            Err(e) => {
                tracing::error!(error = %e, "distributed rate limit failed");
                self.record_health(false);
                self.check_local(key_id)
            }
        }
    }

    fn check_local(&self, key_id: &str) -> RateOutcome {
        let limit = self.settings.local_rate_per_sec.to_string();
        if self.local.check_key(&key_id.to_string()).is_ok() {
            RateOutcome::Allowed(RateHeaders {
                policy: Mode::Local.as_str(),
                limit,
                remaining: "0".to_string(),
                reset: None,
                retry_after: None,
            })
        } else {
            RateOutcome::Rejected(RateHeaders {
                policy: Mode::Local.as_str(),
                limit,
                remaining: "0".to_string(),
                reset: None,
                retry_after: Some("1".to_string()),
            })
        }
    }

    /// Update hysteresis. Returns true when this success completed the
    /// recovery streak (mode flipped back to distributed).
    fn record_health(&self, success: bool) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if success {
            state.health_streak += 1;
            if state.mode == Mode::Local && state.health_streak >= RECOVERY_STREAK {
                tracing::info!("kv-store recovered, switching limiter to distributed mode");
                state.mode = Mode::Distributed;
                state.health_streak = 0;
                return true;
            }
            state.mode == Mode::Distributed
        } else {
            state.health_streak = 0;
            if state.mode == Mode::Distributed {
                tracing::warn!("kv-store failure, switching limiter to local mode");
                state.mode = Mode::Local;
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RateLimitSettings {
        RateLimitSettings {
            ingest_rate_per_sec: 1.0,
            ingest_burst: 10,
            local_rate_per_sec: 5,
            global_max: 200,
            trusted_proxies: vec!["127.0.0.1".to_string(), "10.".to_string()],
        }
    }

    #[test]
    fn test_xff_ignored_for_untrusted_peer() {
        let limiter = RateLimiter::new(settings());
        let ip = limiter.client_ip(Some("1.2.3.4, 5.6.7.8"), "203.0.113.9");
        assert_eq!(ip, "203.0.113.9");
    }

    #[test]
    fn test_xff_honored_for_trusted_proxy() {
        let limiter = RateLimiter::new(settings());
        let ip = limiter.client_ip(Some("1.2.3.4, 5.6.7.8"), "10.0.0.7");
        assert_eq!(ip, "1.2.3.4");
    }

    #[test]
    fn test_identity_prefers_user_over_ip() {
        let limiter = RateLimiter::new(settings());
        let user = CurrentUser {
            username: "alice".to_string(),
            role: fiber_core::Role::Viewer,
            jti: None,
            exp: None,
        };
        assert_eq!(limiter.identity_key(&user, "1.2.3.4"), "user:alice");
        let anon = CurrentUser::anonymous();
        assert_eq!(limiter.identity_key(&anon, "1.2.3.4"), "ip:1.2.3.4");
    }

    #[test]
    fn test_local_bucket_rejects_after_burst() {
        let limiter = RateLimiter::new(settings());
        let mut rejected = false;
        for _ in 0..10 {
            if let RateOutcome::Rejected(headers) = limiter.check_local("ip:1.1.1.1") {
                assert_eq!(headers.policy, "local");
                assert_eq!(headers.retry_after.as_deref(), Some("1"));
                rejected = true;
                break;
            }
        }
        assert!(rejected);
    }

    #[test]
    fn test_hysteresis_requires_streak_to_recover() {
        let limiter = RateLimiter::new(settings());
        limiter.record_health(false);
        assert_eq!(limiter.mode(), Mode::Local);
        for _ in 0..4 {
            assert!(!limiter.record_health(true));
            assert_eq!(limiter.mode(), Mode::Local);
        }
        assert!(limiter.record_health(true));
        assert_eq!(limiter.mode(), Mode::Distributed);
    }

    #[test]
    fn test_failure_resets_streak() {
        let limiter = RateLimiter::new(settings());
        limiter.record_health(false);
        for _ in 0..3 {
            limiter.record_health(true);
        }
        limiter.record_health(false);
        for _ in 0..4 {
            limiter.record_health(true);
            assert_eq!(limiter.mode(), Mode::Local);
        }
    }
}
