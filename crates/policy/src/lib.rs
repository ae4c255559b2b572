use pgrole_contracts::{RoleAttribute, SECURITY_LABEL_MIN_VERSION, is_update_mode};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    List,
    Properties,
    Create,
    Update,
    Drop,
    Msql,
    Sql,
    Node,
    Nodes,
    Variables,
    Voptions,
    Dependencies,
    Dependents,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::List => "list",
            Action::Properties => "properties",
            Action::Create => "create",
            Action::Update => "update",
            Action::Drop => "drop",
            Action::Msql => "msql",
            Action::Sql => "sql",
            Action::Node => "node",
            Action::Nodes => "nodes",
            Action::Variables => "variables",
            Action::Voptions => "voptions",
            Action::Dependencies => "dependencies",
            Action::Dependents => "dependents",
        }
    }

    pub fn is_implemented(self) -> bool {
        !matches!(self, Action::Dependencies | Action::Dependents)
    }

    pub fn is_mutation(self) -> bool {
        matches!(self, Action::Create | Action::Update | Action::Drop)
    }
}

/// SQL template set, keyed by the oldest server release it supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VersionBucket {
    Post84,
    Post90,
    Post91,
    Post94,
}

/// Minimum `server_version_num` per bucket, newest first.
pub const VERSION_BUCKETS: [(i32, VersionBucket); 4] = [
    (90500, VersionBucket::Post94),
    (90200, VersionBucket::Post91),
    (90100, VersionBucket::Post90),
    (0, VersionBucket::Post84),
];

impl VersionBucket {
    pub fn letter(self) -> char {
        match self {
            VersionBucket::Post84 => 'A',
            VersionBucket::Post90 => 'B',
            VersionBucket::Post91 => 'C',
            VersionBucket::Post94 => 'D',
        }
    }

    pub fn dir(self) -> &'static str {
        match self {
            VersionBucket::Post84 => "post8_4",
            VersionBucket::Post90 => "post9_0",
            VersionBucket::Post91 => "post9_1",
            VersionBucket::Post94 => "post9_4",
        }
    }

    /// This bucket followed by every older one.
    pub fn fallback_chain(self) -> impl Iterator<Item = VersionBucket> {
        VERSION_BUCKETS
            .into_iter()
            .map(|(_, bucket)| bucket)
            .filter(move |bucket| *bucket <= self)
    }
}

pub fn select_bucket(server_version: i32) -> VersionBucket {
    VERSION_BUCKETS
        .into_iter()
        .find(|(min, _)| server_version >= *min)
        .map(|(_, bucket)| bucket)
        .unwrap_or(VersionBucket::Post84)
}

pub fn allowed_alter_attributes(server_version: i32) -> Vec<RoleAttribute> {
    RoleAttribute::ALL
        .into_iter()
        .filter(|attribute| {
            *attribute != RoleAttribute::Replication
                || server_version >= SECURITY_LABEL_MIN_VERSION
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogTable {
    Extended,
    Restricted,
}

impl CatalogTable {
    pub fn for_privilege(can_read_authid: bool) -> Self {
        if can_read_authid {
            CatalogTable::Extended
        } else {
            CatalogTable::Restricted
        }
    }

    pub fn qualified_name(self) -> &'static str {
        match self {
            CatalogTable::Extended => "pg_catalog.pg_authid",
            CatalogTable::Restricted => "pg_catalog.pg_roles",
        }
    }
}

/// Which checks the gate runs for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GatePlan {
    pub probe_catalog: bool,
    pub check_permission: bool,
    pub fetch_snapshot: bool,
}

pub fn gate_plan(action: Action, role_id: Option<i64>) -> GatePlan {
    GatePlan {
        probe_catalog: matches!(action, Action::List | Action::Properties),
        check_permission: action.is_mutation(),
        fetch_snapshot: match action {
            Action::Drop | Action::Update => true,
            Action::Msql => is_update_mode(role_id),
            _ => false,
        },
    }
}

/// The session user as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub id: i64,
    pub name: String,
    pub is_superuser: bool,
    pub can_create_role: bool,
    pub can_create_db: bool,
}

/// Current flags of the role a mutation targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleSnapshot {
    pub oid: i64,
    pub name: String,
    pub can_login: bool,
    pub is_superuser: bool,
    pub catalog_update: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forbidden {
    pub action: Action,
}

impl Forbidden {
    pub fn message(&self) -> String {
        format!(
            "The current user does not have permission to {} the role!",
            self.action.as_str()
        )
    }
}

impl std::fmt::Display for Forbidden {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for Forbidden {}

/// Superusers and role creators may mutate any role; any user may update
/// their own role.
pub fn authorize(action: Action, user: &UserInfo, role_id: Option<i64>) -> Result<(), Forbidden> {
    if !action.is_mutation() || user.is_superuser || user.can_create_role {
        return Ok(());
    }

    if action == Action::Update && role_id == Some(user.id) {
        return Ok(());
    }

    Err(Forbidden { action })
}
