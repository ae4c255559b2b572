use std::borrow::Cow;

use minijinja::value::ValueKind;
use minijinja::{Environment, Value, context};
use pgrole_contracts::{
    MembershipPlan, RoleAttribute, RoleCommand, RoleProperties, RoleVariable, SecurityLabel,
    VariableRef,
};
use pgrole_policy::{CatalogTable, RoleSnapshot, VERSION_BUCKETS, VersionBucket};
use serde::Serialize;

use crate::DriverError;

/// Role-level SQL rendered from per-version template sets.
///
/// Template names are `<bucket dir>/<file>`. A bucket only carries the files
/// that differ from the previous release; anything else is served from the
/// next older bucket. Includes inside a template resolve against the
/// including template's bucket.
pub struct SqlTemplates {
    env: Environment<'static>,
}

impl SqlTemplates {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_loader(embedded_template_loader);
        env.set_path_join_callback(join_template_path);
        env.add_filter("qtIdent", qt_ident);
        env.add_filter("qtIdents", qt_idents);
        env.add_filter("qtLiteral", qt_literal);
        Self { env }
    }

    /// Bucket whose copy of `file` is used for `bucket`.
    pub fn source_bucket(bucket: VersionBucket, file: &str) -> Option<VersionBucket> {
        bucket
            .fallback_chain()
            .find(|candidate| template_source(candidate.dir(), file).is_some())
    }

    pub fn render(
        &self,
        bucket: VersionBucket,
        file: &str,
        ctx: Value,
    ) -> Result<String, DriverError> {
        let tmpl = self.env.get_template(&format!("{}/{}", bucket.dir(), file))?;
        Ok(tmpl.render(ctx)?)
    }

    pub fn properties(
        &self,
        bucket: VersionBucket,
        table: CatalogTable,
        role_id: Option<i64>,
    ) -> Result<String, DriverError> {
        self.render(
            bucket,
            "properties.sql",
            context! { roles_table => table.qualified_name(), rid => role_id },
        )
    }

    pub fn nodes(
        &self,
        bucket: VersionBucket,
        table: CatalogTable,
        role_id: Option<i64>,
    ) -> Result<String, DriverError> {
        self.render(
            bucket,
            "nodes.sql",
            context! { roles_table => table.qualified_name(), rid => role_id },
        )
    }

    pub fn permission(&self, bucket: VersionBucket, role_id: i64) -> Result<String, DriverError> {
        self.render(bucket, "permission.sql", context! { rid => role_id })
    }

    pub fn variables(&self, bucket: VersionBucket, role_id: i64) -> Result<String, DriverError> {
        self.render(bucket, "variables.sql", context! { rid => role_id })
    }

    pub fn variable_options(&self, bucket: VersionBucket) -> Result<String, DriverError> {
        self.render(bucket, "voptions.sql", context! {})
    }

    /// `preview` masks passwords.
    pub fn create(
        &self,
        bucket: VersionBucket,
        data: &RoleSqlData,
        preview: bool,
    ) -> Result<String, DriverError> {
        self.render(
            bucket,
            "create.sql",
            context! { data => data, dummy => preview },
        )
    }

    pub fn update(
        &self,
        bucket: VersionBucket,
        data: &RoleSqlData,
        snapshot: &RoleSnapshot,
        preview: bool,
    ) -> Result<String, DriverError> {
        self.render(
            bucket,
            "update.sql",
            context! { data => data, snapshot => snapshot, dummy => preview },
        )
    }

    /// Commented CREATE script reproducing an existing role.
    pub fn reverse_engineered(
        &self,
        bucket: VersionBucket,
        data: &RoleSqlData,
    ) -> Result<String, DriverError> {
        self.render(bucket, "sql.sql", context! { data => data, dummy => false })
    }
}

impl Default for SqlTemplates {
    fn default() -> Self {
        Self::new()
    }
}

/// Changes to a repeating collection, flattened for the templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Changes<T, K> {
    pub assigned: Vec<T>,
    pub removed: Vec<K>,
}

impl<T, K> Default for Changes<T, K> {
    fn default() -> Self {
        Self {
            assigned: Vec::new(),
            removed: Vec::new(),
        }
    }
}

impl<T: Clone, K: Clone> Changes<T, K> {
    fn from_collection(collection: Option<&pgrole_contracts::Collection<T, K>>) -> Self {
        match collection {
            Some(collection) => Self {
                assigned: collection.assigned().into_iter().cloned().collect(),
                removed: collection.removed().to_vec(),
            },
            None => Self::default(),
        }
    }
}

/// Template view of a role command. Tri-state inputs are resolved here so
/// templates only see concrete values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSqlData {
    /// Requested name; on update a value different from the current name renames.
    pub name: Option<String>,
    /// Name later statements address.
    pub target: String,
    pub can_login: Option<bool>,
    pub superuser: Option<bool>,
    pub create_db: Option<bool>,
    pub create_role: Option<bool>,
    pub inherit: Option<bool>,
    pub replication: Option<bool>,
    pub catalog_update: Option<bool>,
    pub connection_limit: Option<i64>,
    pub valid_until: Option<String>,
    pub password: Option<String>,
    pub clear_password: bool,
    pub set_description: bool,
    pub description: Option<String>,
    /// Attributes for `ALTER ROLE ... WITH`, limited to what the server allows.
    pub alter: Vec<&'static str>,
    pub membership: MembershipPlan,
    pub security_labels: Changes<SecurityLabel, String>,
    pub variables: Changes<RoleVariable, VariableRef>,
}

impl RoleSqlData {
    pub fn for_create(command: &RoleCommand, allowed: &[RoleAttribute]) -> Self {
        let attrs = &command.attributes;
        let name = command.name.clone();
        let description = command
            .description
            .clone()
            .flatten()
            .filter(|d| !d.is_empty());

        Self {
            target: name.clone().unwrap_or_default(),
            name,
            can_login: attrs.can_login,
            superuser: attrs.superuser,
            create_db: attrs.create_db,
            create_role: attrs.create_role,
            inherit: attrs.inherit,
            replication: attrs
                .replication
                .filter(|_| allowed.contains(&RoleAttribute::Replication)),
            catalog_update: attrs.catalog_update,
            connection_limit: attrs.connection_limit.flatten(),
            valid_until: attrs.valid_until.clone().flatten(),
            password: attrs.password.clone().flatten(),
            clear_password: false,
            set_description: description.is_some(),
            description,
            alter: alter_list(command, allowed),
            membership: command.membership_plan(),
            security_labels: Changes::from_collection(command.security_labels.as_ref()),
            variables: Changes::from_collection(command.variables.as_ref()),
        }
    }

    pub fn for_update(
        command: &RoleCommand,
        snapshot: &RoleSnapshot,
        allowed: &[RoleAttribute],
    ) -> Self {
        let attrs = &command.attributes;
        let name = command.name.clone();
        let target = name.clone().unwrap_or_else(|| snapshot.name.clone());

        Self {
            name,
            target,
            can_login: attrs.can_login,
            superuser: attrs.superuser,
            create_db: attrs.create_db,
            create_role: attrs.create_role,
            inherit: attrs.inherit,
            replication: attrs.replication,
            catalog_update: attrs.catalog_update,
            connection_limit: attrs.connection_limit.map(|limit| limit.unwrap_or(-1)),
            valid_until: attrs
                .valid_until
                .clone()
                .map(|until| until.unwrap_or_else(|| "infinity".to_string())),
            password: attrs.password.clone().flatten(),
            clear_password: matches!(attrs.password, Some(None)),
            set_description: command.description.is_some(),
            description: command
                .description
                .clone()
                .flatten()
                .filter(|d| !d.is_empty()),
            alter: alter_list(command, allowed),
            membership: command.membership_plan(),
            security_labels: Changes::from_collection(command.security_labels.as_ref()),
            variables: Changes::from_collection(command.variables.as_ref()),
        }
    }

    /// Data for re-creating an existing role; the password is never known.
    pub fn from_properties(
        props: &RoleProperties,
        variables: Vec<RoleVariable>,
        allowed: &[RoleAttribute],
    ) -> Self {
        let mut membership = MembershipPlan::default();
        for grant in &props.membership {
            if grant.admin {
                membership.admins.push(grant.role.clone());
            } else {
                membership.members.push(grant.role.clone());
            }
        }

        Self {
            name: Some(props.name.clone()),
            target: props.name.clone(),
            can_login: Some(props.can_login),
            superuser: Some(props.superuser),
            create_db: Some(props.create_db),
            create_role: Some(props.create_role),
            inherit: Some(props.inherit),
            replication: Some(props.replication)
                .filter(|_| allowed.contains(&RoleAttribute::Replication)),
            catalog_update: Some(props.catalog_update),
            connection_limit: Some(i64::from(props.connection_limit)),
            valid_until: props.valid_until.clone(),
            password: None,
            clear_password: false,
            set_description: props.description.is_some(),
            description: props.description.clone(),
            alter: Vec::new(),
            membership,
            security_labels: Changes {
                assigned: props.security_labels.clone().unwrap_or_default(),
                removed: Vec::new(),
            },
            variables: Changes {
                assigned: variables,
                removed: Vec::new(),
            },
        }
    }
}

fn alter_list(command: &RoleCommand, allowed: &[RoleAttribute]) -> Vec<&'static str> {
    command
        .attributes
        .present()
        .into_iter()
        .filter(|attribute| allowed.contains(attribute))
        .map(RoleAttribute::as_str)
        .collect()
}

const RESERVED_KEYWORDS: &[&str] = &[
    "all",
    "analyse",
    "analyze",
    "and",
    "any",
    "array",
    "as",
    "asc",
    "asymmetric",
    "authorization",
    "binary",
    "both",
    "case",
    "cast",
    "check",
    "collate",
    "collation",
    "column",
    "concurrently",
    "constraint",
    "create",
    "cross",
    "current_catalog",
    "current_date",
    "current_role",
    "current_schema",
    "current_time",
    "current_timestamp",
    "current_user",
    "default",
    "deferrable",
    "desc",
    "distinct",
    "do",
    "else",
    "end",
    "except",
    "false",
    "fetch",
    "for",
    "foreign",
    "freeze",
    "from",
    "full",
    "grant",
    "group",
    "having",
    "ilike",
    "in",
    "initially",
    "inner",
    "intersect",
    "into",
    "is",
    "isnull",
    "join",
    "lateral",
    "leading",
    "left",
    "like",
    "limit",
    "localtime",
    "localtimestamp",
    "natural",
    "not",
    "notnull",
    "null",
    "offset",
    "on",
    "only",
    "or",
    "order",
    "outer",
    "overlaps",
    "placing",
    "primary",
    "references",
    "returning",
    "right",
    "select",
    "session_user",
    "similar",
    "some",
    "symmetric",
    "system_user",
    "table",
    "tablesample",
    "then",
    "to",
    "trailing",
    "true",
    "union",
    "unique",
    "user",
    "using",
    "variadic",
    "verbose",
    "when",
    "where",
    "window",
    "with",
];

/// Quotes `name` unless it is a plain lower-case identifier that is not a
/// reserved keyword.
pub fn quote_ident(name: &str) -> String {
    let mut chars = name.chars();
    let simple = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$');

    if simple && !RESERVED_KEYWORDS.contains(&name) {
        return name.to_string();
    }

    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    if escaped.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{}'", escaped)
    }
}

fn qt_ident(value: String) -> String {
    quote_ident(&value)
}

fn qt_idents(values: Vec<String>) -> String {
    values
        .iter()
        .map(|value| quote_ident(value))
        .collect::<Vec<_>>()
        .join(", ")
}

fn qt_literal(value: Value) -> String {
    match value.kind() {
        ValueKind::Undefined | ValueKind::None => "NULL".to_string(),
        ValueKind::Bool | ValueKind::Number => value.to_string(),
        _ => match value.as_str() {
            Some(text) => quote_literal(text),
            None => quote_literal(&value.to_string()),
        },
    }
}

fn join_template_path<'x>(name: &'x str, parent: &'x str) -> Cow<'x, str> {
    if name.contains('/') {
        return Cow::Borrowed(name);
    }

    match parent.split_once('/') {
        Some((dir, _)) => Cow::Owned(format!("{}/{}", dir, name)),
        None => Cow::Borrowed(name),
    }
}

fn embedded_template_loader(name: &str) -> Result<Option<String>, minijinja::Error> {
    let Some((dir, file)) = name.split_once('/') else {
        return Ok(None);
    };
    let Some(bucket) = VERSION_BUCKETS
        .into_iter()
        .map(|(_, bucket)| bucket)
        .find(|bucket| bucket.dir() == dir)
    else {
        return Ok(None);
    };

    Ok(bucket
        .fallback_chain()
        .find_map(|candidate| template_source(candidate.dir(), file))
        .map(str::to_string))
}

fn template_source(dir: &str, file: &str) -> Option<&'static str> {
    match (dir, file) {
        ("post8_4", "properties.sql") => Some(include_str!("../templates/post8_4/properties.sql")),
        ("post8_4", "nodes.sql") => Some(include_str!("../templates/post8_4/nodes.sql")),
        ("post8_4", "permission.sql") => Some(include_str!("../templates/post8_4/permission.sql")),
        ("post8_4", "create.sql") => Some(include_str!("../templates/post8_4/create.sql")),
        ("post8_4", "update.sql") => Some(include_str!("../templates/post8_4/update.sql")),
        ("post8_4", "sql.sql") => Some(include_str!("../templates/post8_4/sql.sql")),
        ("post8_4", "members.sql") => Some(include_str!("../templates/post8_4/members.sql")),
        ("post8_4", "settings.sql") => Some(include_str!("../templates/post8_4/settings.sql")),
        ("post8_4", "comment.sql") => Some(include_str!("../templates/post8_4/comment.sql")),
        ("post8_4", "variables.sql") => Some(include_str!("../templates/post8_4/variables.sql")),
        ("post8_4", "voptions.sql") => Some(include_str!("../templates/post8_4/voptions.sql")),

        ("post9_0", "properties.sql") => Some(include_str!("../templates/post9_0/properties.sql")),
        ("post9_0", "settings.sql") => Some(include_str!("../templates/post9_0/settings.sql")),
        ("post9_0", "variables.sql") => Some(include_str!("../templates/post9_0/variables.sql")),

        ("post9_1", "properties.sql") => Some(include_str!("../templates/post9_1/properties.sql")),
        ("post9_1", "create.sql") => Some(include_str!("../templates/post9_1/create.sql")),
        ("post9_1", "update.sql") => Some(include_str!("../templates/post9_1/update.sql")),
        ("post9_1", "seclabels.sql") => Some(include_str!("../templates/post9_1/seclabels.sql")),

        ("post9_4", "properties.sql") => Some(include_str!("../templates/post9_4/properties.sql")),
        ("post9_4", "permission.sql") => Some(include_str!("../templates/post9_4/permission.sql")),
        ("post9_4", "create.sql") => Some(include_str!("../templates/post9_4/create.sql")),
        ("post9_4", "update.sql") => Some(include_str!("../templates/post9_4/update.sql")),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_ident_only_quotes_when_needed() {
        assert_eq!(quote_ident("reporting"), "reporting");
        assert_eq!(quote_ident("_r2$"), "_r2$");
        assert_eq!(quote_ident("Admins"), "\"Admins\"");
        assert_eq!(quote_ident("user"), "\"user\"");
        assert_eq!(quote_ident("1abc"), "\"1abc\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_ident(""), "\"\"");
    }

    #[test]
    fn quote_literal_escapes_quotes_and_backslashes() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal("a\\b"), "E'a\\\\b'");
    }

    #[test]
    fn qt_literal_renders_scalars_bare() {
        assert_eq!(qt_literal(Value::from(())), "NULL");
        assert_eq!(qt_literal(Value::from(true)), "true");
        assert_eq!(qt_literal(Value::from(42)), "42");
        assert_eq!(qt_literal(Value::from("x'y")), "'x''y'");
    }

    #[test]
    fn includes_join_against_parent_bucket() {
        assert_eq!(
            join_template_path("members.sql", "post9_1/create.sql"),
            "post9_1/members.sql"
        );
        assert_eq!(
            join_template_path("post8_4/members.sql", "post9_1/create.sql"),
            "post8_4/members.sql"
        );
    }

    #[test]
    fn loader_falls_back_to_older_buckets() {
        let members = embedded_template_loader("post9_4/members.sql")
            .expect("loader should not fail")
            .expect("members.sql should resolve");
        assert_eq!(members, include_str!("../templates/post8_4/members.sql"));

        assert!(
            embedded_template_loader("post9_4/missing.sql")
                .expect("loader should not fail")
                .is_none()
        );
        assert!(
            embedded_template_loader("post7_4/nodes.sql")
                .expect("loader should not fail")
                .is_none()
        );
    }
}
