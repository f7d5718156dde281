// fiber-auth: Credential store
// Env-sourced user:password pairs; passwords held as SHA-256 digests only.

use std::collections::HashMap;

use fiber_core::{sha256_hex, Role};

use crate::{AuthError, AuthResult};

/// In-memory credential store built from the `USER_CREDENTIALS` secret
/// (`user:pass,user2:pass2`) plus the admin/operator role lists.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    password_hashes: HashMap<String, String>,
    admin_users: Vec<String>,
    operator_users: Vec<String>,
}

impl CredentialStore {
    pub fn from_config(
        credentials: &str,
        admin_users: Vec<String>,
        operator_users: Vec<String>,
    ) -> AuthResult<Self> {
        let mut password_hashes = HashMap::new();
        for entry in credentials.split(',') {
            let Some((user, pass)) = entry.split_once(':') else {
                continue;
            };
            password_hashes.insert(
                user.trim().to_string(),
                sha256_hex(pass.trim().as_bytes()),
            );
        }
        if password_hashes.is_empty() {
            return Err(AuthError::Config(
                "USER_CREDENTIALS contains no user:password entries".to_string(),
            ));
        }
        Ok(Self {
            password_hashes,
            admin_users,
            operator_users,
        })
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        match self.password_hashes.get(username) {
            Some(expected) => *expected == sha256_hex(password.as_bytes()),
            None => false,
        }
    }

    /// Role lookup. Unknown users are anonymous.
    pub fn role_of(&self, username: &str) -> Role {
        if self.admin_users.iter().any(|u| u == username) {
            Role::Admin
        } else if self.operator_users.iter().any(|u| u == username) {
            Role::Operator
        } else if self.password_hashes.contains_key(username) {
            Role::Viewer
        } else {
            Role::Anonymous
        }
    }

    pub fn user_count(&self) -> usize {
        self.password_hashes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        CredentialStore::from_config(
            "admin:s3cret, viewer:pass",
            vec!["admin".to_string()],
            vec!["ops".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_verify_good_and_bad_password() {
        let s = store();
        assert!(s.verify("admin", "s3cret"));
        assert!(!s.verify("admin", "wrong"));
        assert!(!s.verify("ghost", "s3cret"));
    }

    #[test]
    fn test_roles_resolve_from_lists() {
        let s = store();
        assert_eq!(s.role_of("admin"), Role::Admin);
        assert_eq!(s.role_of("viewer"), Role::Viewer);
        assert_eq!(s.role_of("ghost"), Role::Anonymous);
    }

    #[test]
    fn test_empty_credentials_rejected() {
        assert!(CredentialStore::from_config("", vec![], vec![]).is_err());
        assert!(CredentialStore::from_config("no-colon-here", vec![], vec![]).is_err());
    }
}
