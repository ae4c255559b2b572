use chrono::{DateTime, Utc};

use crate::{MembershipGrant, RoleProperties, SecurityLabel};

/// A role row as read from the catalog, before it is shaped for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleRecord {
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
    pub password: Option<String>,
    pub valid_until: Option<DateTime<Utc>>,
    pub description: Option<String>,
    /// `<0|1><rolename>`, the digit being the admin option.
    pub membership: Vec<String>,
    /// `provider=label`; `None` when the server has no security labels.
    pub security_labels: Option<Vec<String>>,
}

pub fn transform_role(record: RoleRecord) -> RoleProperties {
    RoleProperties {
        oid: record.oid,
        name: record.name,
        can_login: record.can_login,
        superuser: record.superuser,
        create_db: record.create_db,
        create_role: record.create_role,
        inherit: record.inherit,
        replication: record.replication,
        catalog_update: record.catalog_update,
        connection_limit: record.connection_limit,
        password: String::new(),
        valid_until: record.valid_until.map(|ts| ts.to_rfc3339()),
        description: record.description,
        membership: record
            .membership
            .iter()
            .filter_map(|entry| {
                let grant = parse_membership_entry(entry);
                if grant.is_none() {
                    tracing::warn!(
                        role_id = record.oid,
                        entry = %entry,
                        "skipping malformed membership entry"
                    );
                }
                grant
            })
            .collect(),
        security_labels: record.security_labels.map(|labels| {
            labels
                .iter()
                .filter_map(|entry| {
                    let label = parse_security_label(entry);
                    if label.is_none() {
                        tracing::warn!(
                            role_id = record.oid,
                            entry = %entry,
                            "skipping malformed security label"
                        );
                    }
                    label
                })
                .collect()
        }),
    }
}

pub fn parse_membership_entry(entry: &str) -> Option<MembershipGrant> {
    let mut chars = entry.chars();
    let admin = match chars.next()? {
        '1' => true,
        '0' => false,
        _ => return None,
    };
    let role = chars.as_str();
    if role.is_empty() {
        return None;
    }

    Some(MembershipGrant {
        role: role.to_string(),
        admin,
    })
}

pub fn parse_security_label(entry: &str) -> Option<SecurityLabel> {
    let (provider, label) = entry.split_once('=')?;
    if provider.is_empty() {
        return None;
    }

    Some(SecurityLabel {
        provider: provider.to_string(),
        label: label.to_string(),
    })
}
