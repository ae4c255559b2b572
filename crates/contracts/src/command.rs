use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    Collection, MembershipGrant, RoleAttribute, RoleVariable, SECURITY_LABEL_MIN_VERSION,
    SecurityLabel, VariableRef, is_update_mode,
};

/// Form/query keys whose values are JSON documents rather than plain strings.
pub const STRUCTURED_FIELDS: &[&str] = &[
    "canLogin",
    "superuser",
    "createDb",
    "createRole",
    "inherit",
    "replication",
    "catalogUpdate",
    "variables",
    "membership",
    "securityLabels",
];

const MEMBERSHIP_CREATE_FORMAT: &str = "
Role membership information must be passed as an array of JSON object in the
following format:

membership:[{
    role: [rolename],
    admin: true/false
    },
    ...
]";

const MEMBERSHIP_UPDATE_FORMAT: &str = "
Role membership information must be passed a string representing an array of
JSON object in the following format:
membership:{
    'added': [{
        role: [rolename],
        admin: true/false
        },
        ...
        ],
    'deleted': [{
        role: [rolename],
        admin: true/false
        },
        ...
        ],
    'changed': [{
        role: [rolename],
        admin: true/false
        },
        ...
        ]
";

const SECURITY_LABEL_CREATE_FORMAT: &str = "
Security Label must be passed as an array of JSON object in the following
format:
securityLabels:[{
    provider: <provider>,
    label: <label>
    },
    ...
]";

const SECURITY_LABEL_UPDATE_FORMAT: &str = "
Security Label must be passed as an array of JSON object in the following
format:
securityLabels:{
    'added': [{
        provider: <provider>,
        label: <label>
        },
        ...
        ],
    'deleted': [{
        provider: <provider>,
        label: <label>
        },
        ...
        ],
    'changed': [{
        provider: <provider>,
        label: <label>
        },
        ...
        ]
";

const VARIABLES_CREATE_FORMAT: &str = "
Configuration parameters/variables must be passed as an array of JSON object in
the following format (create mode):
variables:[{
    database: <database> or null,
    name: <configuration>,
    value: <value>
    },
    ...
]";

const VARIABLES_UPDATE_FORMAT: &str = "
Configuration parameters/variables must be passed as an array of JSON object in
the following format (update mode):
variables:{
    'added': [{
        database: <database> or null,
        name: <configuration>,
        value: <value>
        },
        ...
        ],
    'deleted': [{
        database: <database> or null,
        name: <configuration>,
        value: <value>
        },
        ...
        ],
    'changed': [{
        database: <database> or null,
        name: <configuration>,
        value: <value>
        },
        ...
        ]
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidBody(String),
    MissingField(&'static str),
    InvalidValue(&'static str),
    Malformed {
        field: &'static str,
        description: &'static str,
    },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidBody(_) => "ERR_INVALID_BODY",
            ValidationError::MissingField(_) => "ERR_MISSING_FIELD",
            ValidationError::InvalidValue(_) => "ERR_INVALID_VALUE",
            ValidationError::Malformed { .. } => "ERR_MALFORMED_FIELD",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ValidationError::InvalidBody(reason) => format!("Invalid request body: {}", reason),
            ValidationError::MissingField("name") => "Name is not provided!".to_string(),
            ValidationError::MissingField(field) => format!("{} is not provided!", field),
            ValidationError::InvalidValue("connectionLimit") => {
                "Connection limit must be an integer value or equals to -1!".to_string()
            }
            ValidationError::InvalidValue(field) => format!("Invalid value for {}!", field),
            ValidationError::Malformed { description, .. } => description.to_string(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadMode {
    Create,
    Update,
}

impl PayloadMode {
    pub fn for_role_id(role_id: Option<i64>) -> Self {
        if is_update_mode(role_id) {
            PayloadMode::Update
        } else {
            PayloadMode::Create
        }
    }
}

/// Request body decoded into loose JSON fields, before validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPayload {
    fields: Map<String, Value>,
}

impl RawPayload {
    pub fn from_json(body: &[u8]) -> Result<Self, ValidationError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(fields)) => Ok(Self { fields }),
            Ok(_) => Err(ValidationError::InvalidBody(
                "expected a JSON object".to_string(),
            )),
            Err(err) => Err(ValidationError::InvalidBody(err.to_string())),
        }
    }

    /// Builds a payload from form or query pairs. Structured keys carry JSON
    /// text; every other key is kept as a plain string.
    pub fn from_pairs<I>(pairs: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut fields = Map::new();
        for (key, raw) in pairs {
            let value = match STRUCTURED_FIELDS.iter().copied().find(|f| *f == key) {
                Some(field) => serde_json::from_str::<Value>(&raw)
                    .map_err(|_| ValidationError::InvalidValue(field))?,
                None => Value::String(raw),
            };
            fields.insert(key, value);
        }
        Ok(Self { fields })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Scalar attributes of a role command. `Some(None)` means the client sent an
/// explicit `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleAttributes {
    pub can_login: Option<bool>,
    pub superuser: Option<bool>,
    pub create_db: Option<bool>,
    pub create_role: Option<bool>,
    pub inherit: Option<bool>,
    pub replication: Option<bool>,
    pub catalog_update: Option<bool>,
    pub connection_limit: Option<Option<i64>>,
    pub valid_until: Option<Option<String>>,
    pub password: Option<Option<String>>,
}

impl RoleAttributes {
    pub fn is_present(&self, attribute: RoleAttribute) -> bool {
        match attribute {
            RoleAttribute::CanLogin => self.can_login.is_some(),
            RoleAttribute::Superuser => self.superuser.is_some(),
            RoleAttribute::CreateDb => self.create_db.is_some(),
            RoleAttribute::CreateRole => self.create_role.is_some(),
            RoleAttribute::Inherit => self.inherit.is_some(),
            RoleAttribute::Replication => self.replication.is_some(),
            RoleAttribute::ConnectionLimit => self.connection_limit.is_some(),
            RoleAttribute::ValidUntil => self.valid_until.is_some(),
            RoleAttribute::Password => self.password.is_some(),
        }
    }

    pub fn present(&self) -> Vec<RoleAttribute> {
        RoleAttribute::ALL
            .into_iter()
            .filter(|attribute| self.is_present(*attribute))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleCommand {
    pub name: Option<String>,
    pub attributes: RoleAttributes,
    pub description: Option<Option<String>>,
    pub membership: Option<Collection<MembershipGrant, String>>,
    pub security_labels: Option<Collection<SecurityLabel, String>>,
    pub variables: Option<Collection<RoleVariable, VariableRef>>,
}

impl RoleCommand {
    pub fn membership_plan(&self) -> MembershipPlan {
        self.membership
            .as_ref()
            .map(MembershipPlan::from_collection)
            .unwrap_or_default()
    }
}

/// Membership changes flattened into the four statement groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipPlan {
    pub members: Vec<String>,
    pub admins: Vec<String>,
    pub revoked_admins: Vec<String>,
    pub revoked: Vec<String>,
}

impl MembershipPlan {
    pub fn from_collection(collection: &Collection<MembershipGrant, String>) -> Self {
        let mut plan = MembershipPlan::default();
        match collection {
            Collection::Replace(grants) => {
                for grant in grants {
                    plan.grant(grant);
                }
            }
            Collection::Delta {
                added,
                deleted,
                changed,
            } => {
                for grant in added {
                    plan.grant(grant);
                }
                plan.revoked.extend(deleted.iter().cloned());
                for grant in changed {
                    if grant.admin {
                        plan.admins.push(grant.role.clone());
                    } else {
                        plan.revoked_admins.push(grant.role.clone());
                    }
                }
            }
        }
        plan
    }

    fn grant(&mut self, grant: &MembershipGrant) {
        if grant.admin {
            self.admins.push(grant.role.clone());
        } else {
            self.members.push(grant.role.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
            && self.admins.is_empty()
            && self.revoked_admins.is_empty()
            && self.revoked.is_empty()
    }
}

pub fn normalize(
    payload: &RawPayload,
    mode: PayloadMode,
    server_version: i32,
) -> Result<RoleCommand, ValidationError> {
    let name = optional_text(payload, "name")?.flatten();
    let name = name.filter(|n| !n.is_empty());
    if mode == PayloadMode::Create && name.is_none() {
        return Err(ValidationError::MissingField("name"));
    }

    let attributes = RoleAttributes {
        can_login: optional_bool(payload, "canLogin")?,
        superuser: optional_bool(payload, "superuser")?,
        create_db: optional_bool(payload, "createDb")?,
        create_role: optional_bool(payload, "createRole")?,
        inherit: optional_bool(payload, "inherit")?,
        replication: optional_bool(payload, "replication")?,
        catalog_update: optional_bool(payload, "catalogUpdate")?,
        connection_limit: connection_limit(payload)?,
        valid_until: optional_text(payload, "validUntil")?
            .map(|v| v.filter(|s| !s.trim().is_empty())),
        password: optional_text(payload, "password")?,
    };

    let description = optional_text(payload, "description")?;

    let membership = match present(payload, "membership") {
        None => None,
        Some(value) => Some(parse_collection(
            value,
            mode,
            CollectionShape {
                field: "membership",
                create_format: MEMBERSHIP_CREATE_FORMAT,
                update_format: MEMBERSHIP_UPDATE_FORMAT,
            },
            membership_grant,
            role_ref,
        )?),
    };

    let security_labels = match present(payload, "securityLabels") {
        Some(value) if server_version >= SECURITY_LABEL_MIN_VERSION => Some(parse_collection(
            value,
            mode,
            CollectionShape {
                field: "securityLabels",
                create_format: SECURITY_LABEL_CREATE_FORMAT,
                update_format: SECURITY_LABEL_UPDATE_FORMAT,
            },
            security_label,
            provider_ref,
        )?),
        _ => None,
    };

    let variables = match present(payload, "variables") {
        None => None,
        Some(value) => Some(parse_collection(
            value,
            mode,
            CollectionShape {
                field: "variables",
                create_format: VARIABLES_CREATE_FORMAT,
                update_format: VARIABLES_UPDATE_FORMAT,
            },
            role_variable,
            variable_ref,
        )?),
    };

    Ok(RoleCommand {
        name,
        attributes,
        description,
        membership,
        security_labels,
        variables,
    })
}

struct CollectionShape {
    field: &'static str,
    create_format: &'static str,
    update_format: &'static str,
}

fn parse_collection<T, K>(
    value: &Value,
    mode: PayloadMode,
    shape: CollectionShape,
    entry: fn(&Value) -> Option<T>,
    removal: fn(&Value) -> Option<K>,
) -> Result<Collection<T, K>, ValidationError> {
    let description = match mode {
        PayloadMode::Create => shape.create_format,
        PayloadMode::Update => shape.update_format,
    };
    let malformed = || ValidationError::Malformed {
        field: shape.field,
        description,
    };

    match mode {
        PayloadMode::Create => {
            let items = value.as_array().ok_or_else(malformed)?;
            let entries = items
                .iter()
                .map(|item| entry(item).ok_or_else(malformed))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Collection::Replace(entries))
        }
        PayloadMode::Update => {
            let obj = value.as_object().ok_or_else(malformed)?;

            let added = delta_list(obj.get("added"), entry).ok_or_else(malformed)?;
            let deleted = delta_list(obj.get("deleted"), removal).ok_or_else(malformed)?;
            let changed = delta_list(obj.get("changed"), entry).ok_or_else(malformed)?;

            Ok(Collection::Delta {
                added,
                deleted,
                changed,
            })
        }
    }
}

/// `None` when the key holds something other than a list of valid elements.
/// A missing key is an empty list.
fn delta_list<T>(value: Option<&Value>, parse: fn(&Value) -> Option<T>) -> Option<Vec<T>> {
    match value {
        None => Some(Vec::new()),
        Some(value) => value.as_array()?.iter().map(parse).collect(),
    }
}

fn membership_grant(value: &Value) -> Option<MembershipGrant> {
    let obj = value.as_object()?;
    Some(MembershipGrant {
        role: obj.get("role")?.as_str()?.to_string(),
        admin: obj.get("admin")?.as_bool()?,
    })
}

fn role_ref(value: &Value) -> Option<String> {
    Some(value.as_object()?.get("role")?.as_str()?.to_string())
}

fn security_label(value: &Value) -> Option<SecurityLabel> {
    let obj = value.as_object()?;
    Some(SecurityLabel {
        provider: obj.get("provider")?.as_str()?.to_string(),
        label: obj.get("label")?.as_str()?.to_string(),
    })
}

fn provider_ref(value: &Value) -> Option<String> {
    Some(value.as_object()?.get("provider")?.as_str()?.to_string())
}

fn role_variable(value: &Value) -> Option<RoleVariable> {
    let obj = value.as_object()?;
    Some(RoleVariable {
        database: database_scope(obj)?,
        name: obj.get("name")?.as_str()?.to_string(),
        value: scalar_text(obj.get("value")?)?,
    })
}

fn variable_ref(value: &Value) -> Option<VariableRef> {
    let obj = value.as_object()?;
    Some(VariableRef {
        database: database_scope(obj)?,
        name: obj.get("name")?.as_str()?.to_string(),
    })
}

/// Outer `None` means the scope is malformed; inner `None` means all databases.
fn database_scope(obj: &Map<String, Value>) -> Option<Option<String>> {
    match obj.get("database") {
        None | Some(Value::Null) => Some(None),
        Some(Value::String(db)) if db.is_empty() => Some(None),
        Some(Value::String(db)) => Some(Some(db.clone())),
        Some(_) => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn present<'a>(payload: &'a RawPayload, key: &str) -> Option<&'a Value> {
    payload.get(key).filter(|v| !v.is_null())
}

fn optional_bool(
    payload: &RawPayload,
    key: &'static str,
) -> Result<Option<bool>, ValidationError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ValidationError::InvalidValue(key)),
    }
}

fn optional_text(
    payload: &RawPayload,
    key: &'static str,
) -> Result<Option<Option<String>>, ValidationError> {
    match payload.get(key) {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(Value::String(s)) => Ok(Some(Some(s.clone()))),
        Some(_) => Err(ValidationError::InvalidValue(key)),
    }
}

fn connection_limit(payload: &RawPayload) -> Result<Option<Option<i64>>, ValidationError> {
    const KEY: &str = "connectionLimit";

    let limit = match payload.get(KEY) {
        None => return Ok(None),
        Some(Value::Null) => return Ok(Some(None)),
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        Some(_) => None,
    };

    // pg_authid.rolconnlimit is an int4.
    match limit {
        Some(limit) if (-1..=i64::from(i32::MAX)).contains(&limit) => Ok(Some(Some(limit))),
        _ => Err(ValidationError::InvalidValue(KEY)),
    }
}
