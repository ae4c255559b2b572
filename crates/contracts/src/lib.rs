use serde::{Deserialize, Serialize};

pub mod command;
pub mod transform;

pub use command::{
    MembershipPlan, PayloadMode, RawPayload, RoleAttributes, RoleCommand, ValidationError,
    normalize,
};
pub use transform::{RoleRecord, transform_role};

/// Role id used by clients to address a role that does not exist yet.
pub const NEW_ROLE_SENTINEL: i64 = -1;

/// First server version with shared-object security labels (`pg_shseclabel`).
pub const SECURITY_LABEL_MIN_VERSION: i32 = 90200;

pub fn is_update_mode(role_id: Option<i64>) -> bool {
    matches!(role_id, Some(rid) if rid != NEW_ROLE_SENTINEL)
}

/// Scalar role attributes that may appear in `ALTER ROLE ... WITH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoleAttribute {
    CanLogin,
    Superuser,
    CreateDb,
    CreateRole,
    Inherit,
    Replication,
    ConnectionLimit,
    ValidUntil,
    Password,
}

impl RoleAttribute {
    pub const ALL: [RoleAttribute; 9] = [
        RoleAttribute::CanLogin,
        RoleAttribute::Superuser,
        RoleAttribute::CreateDb,
        RoleAttribute::CreateRole,
        RoleAttribute::Inherit,
        RoleAttribute::Replication,
        RoleAttribute::ConnectionLimit,
        RoleAttribute::ValidUntil,
        RoleAttribute::Password,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RoleAttribute::CanLogin => "canLogin",
            RoleAttribute::Superuser => "superuser",
            RoleAttribute::CreateDb => "createDb",
            RoleAttribute::CreateRole => "createRole",
            RoleAttribute::Inherit => "inherit",
            RoleAttribute::Replication => "replication",
            RoleAttribute::ConnectionLimit => "connectionLimit",
            RoleAttribute::ValidUntil => "validUntil",
            RoleAttribute::Password => "password",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipGrant {
    pub role: String,
    pub admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityLabel {
    pub provider: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleVariable {
    pub database: Option<String>,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableRef {
    pub database: Option<String>,
    pub name: String,
}

/// A repeating role collection as sent by the client.
///
/// New roles carry the complete desired set; existing roles carry a diff
/// against their current state. `K` is the key type used to address removals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collection<T, K> {
    Replace(Vec<T>),
    Delta {
        added: Vec<T>,
        deleted: Vec<K>,
        changed: Vec<T>,
    },
}

impl<T, K> Collection<T, K> {
    /// Entries that end up assigned on the role, in request order.
    pub fn assigned(&self) -> Vec<&T> {
        match self {
            Collection::Replace(entries) => entries.iter().collect(),
            Collection::Delta { added, changed, .. } => added.iter().chain(changed).collect(),
        }
    }

    pub fn removed(&self) -> &[K] {
        match self {
            Collection::Replace(_) => &[],
            Collection::Delta { deleted, .. } => deleted,
        }
    }
}

/// Role as returned by `list` and `properties` after the row transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleProperties {
    pub oid: i64,
    pub name: String,
    pub can_login: bool,
    pub superuser: bool,
    pub create_db: bool,
    pub create_role: bool,
    pub inherit: bool,
    pub replication: bool,
    pub catalog_update: bool,
    pub connection_limit: i32,
    pub password: String,
    pub valid_until: Option<String>,
    pub description: Option<String>,
    pub membership: Vec<MembershipGrant>,
    pub security_labels: Option<Vec<SecurityLabel>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleNodeRecord {
    pub oid: i64,
    pub name: String,
    pub can_login: bool,
    pub is_superuser: bool,
}

/// Browser tree node for a role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    pub label: String,
    pub icon: String,
    pub inode: bool,
    #[serde(rename = "_type")]
    pub node_type: String,
    #[serde(rename = "_id")]
    pub node_id: i64,
    #[serde(rename = "_pid")]
    pub parent_id: i64,
    pub module: String,
    pub can_login: bool,
    pub is_superuser: bool,
}

impl TreeNode {
    pub const NODE_TYPE: &'static str = "role";

    pub fn role(record: &RoleNodeRecord, server_id: i64) -> Self {
        let icon = if record.can_login {
            "icon-role"
        } else {
            "icon-group"
        };

        Self {
            id: format!("{}/{}", Self::NODE_TYPE, record.oid),
            label: record.name.clone(),
            icon: icon.to_string(),
            inode: false,
            node_type: Self::NODE_TYPE.to_string(),
            node_id: record.oid,
            parent_id: server_id,
            module: format!("pgadmin.node.{}", Self::NODE_TYPE),
            can_login: record.can_login,
            is_superuser: record.is_superuser,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableOption {
    pub name: String,
    pub vartype: String,
    pub min_val: Option<f64>,
    pub max_val: Option<f64>,
    pub enumvals: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_mode_requires_a_real_role_id() {
        assert!(!is_update_mode(None));
        assert!(!is_update_mode(Some(NEW_ROLE_SENTINEL)));
        assert!(is_update_mode(Some(0)));
        assert!(is_update_mode(Some(16384)));
    }

    #[test]
    fn login_roles_and_groups_get_distinct_icons() {
        let login = TreeNode::role(
            &RoleNodeRecord {
                oid: 16384,
                name: "app_user".to_string(),
                can_login: true,
                is_superuser: false,
            },
            7,
        );
        assert_eq!(login.id, "role/16384");
        assert_eq!(login.icon, "icon-role");
        assert_eq!(login.parent_id, 7);
        assert_eq!(login.module, "pgadmin.node.role");

        let group = TreeNode::role(
            &RoleNodeRecord {
                oid: 16385,
                name: "readers".to_string(),
                can_login: false,
                is_superuser: false,
            },
            7,
        );
        assert_eq!(group.icon, "icon-group");
    }

    #[test]
    fn tree_node_serializes_underscored_keys() {
        let node = TreeNode::role(
            &RoleNodeRecord {
                oid: 10,
                name: "postgres".to_string(),
                can_login: true,
                is_superuser: true,
            },
            1,
        );

        let value = serde_json::to_value(&node).expect("tree node should serialize");
        assert_eq!(value["_type"], "role");
        assert_eq!(value["_id"], 10);
        assert_eq!(value["_pid"], 1);
        assert_eq!(value["inode"], false);
        assert_eq!(value["is_superuser"], true);
    }

    #[test]
    fn delta_collection_assigns_added_then_changed() {
        let collection: Collection<&str, &str> = Collection::Delta {
            added: vec!["a"],
            deleted: vec!["b"],
            changed: vec!["c"],
        };
        assert_eq!(collection.assigned(), vec![&"a", &"c"]);
        assert_eq!(collection.removed(), &["b"]);

        let replace: Collection<&str, &str> = Collection::Replace(vec!["x"]);
        assert!(replace.removed().is_empty());
    }
}
