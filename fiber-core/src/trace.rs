// fiber-core: Trace id helpers

use uuid::Uuid;

/// Short trace id, matching the probe's 8-char correlation ids.
pub fn generate_trace_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_is_short() {
        let id = generate_trace_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() || c == '-'));
    }

    #[test]
    fn test_trace_ids_are_unique() {
        assert_ne!(generate_trace_id(), generate_trace_id());
    }
}
