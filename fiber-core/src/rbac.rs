// fiber-core: Role and permission tables

use serde::{Deserialize, Serialize};

/// Roles, strictly ordered: ADMIN > OPERATOR > VIEWER > ANONYMOUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Operator,
    Viewer,
    Anonymous,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "ADMIN",
            Role::Operator => "OPERATOR",
            Role::Viewer => "VIEWER",
            Role::Anonymous => "ANONYMOUS",
        }
    }

    pub fn permissions(&self) -> &'static [&'static str] {
        match self {
            Role::Admin => &[
                "admin:roles",
                "admin:audit",
                "view:metrics",
                "monitor:nodes",
                "write:node:create",
                "write:node:delete",
            ],
            Role::Operator => &["view:metrics", "monitor:nodes", "write:node:create"],
            Role::Viewer => &["view:metrics"],
            Role::Anonymous => &[],
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions().contains(&permission)
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Role::Anonymous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_hierarchy_is_superset() {
        for p in Role::Viewer.permissions() {
            assert!(Role::Operator.has_permission(p));
        }
        for p in Role::Operator.permissions() {
            assert!(Role::Admin.has_permission(p));
        }
    }

    #[test]
    fn test_operator_cannot_delete_nodes() {
        assert!(!Role::Operator.has_permission("write:node:delete"));
        assert!(Role::Admin.has_permission("write:node:delete"));
    }

    #[test]
    fn test_anonymous_has_nothing() {
        assert!(Role::Anonymous.permissions().is_empty());
        assert!(!Role::Anonymous.is_authenticated());
    }

    #[test]
    fn test_serde_uppercase() {
        assert_eq!(serde_json::to_string(&Role::Operator).unwrap(), "\"OPERATOR\"");
        let r: Role = serde_json::from_str("\"ADMIN\"").unwrap();
        assert_eq!(r, Role::Admin);
    }
}
