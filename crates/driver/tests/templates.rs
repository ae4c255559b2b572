use pgrole_contracts::{
    MembershipGrant, PayloadMode, RawPayload, RoleCommand, RoleProperties, RoleVariable,
    SecurityLabel, normalize,
};
use pgrole_driver::{RoleSqlData, SqlTemplates};
use pgrole_policy::{
    CatalogTable, RoleSnapshot, VersionBucket, allowed_alter_attributes, select_bucket,
};
use serde_json::json;

fn command(body: serde_json::Value, mode: PayloadMode, version: i32) -> RoleCommand {
    let payload =
        RawPayload::from_json(body.to_string().as_bytes()).expect("test payload should decode");
    normalize(&payload, mode, version).expect("test payload should normalize")
}

fn render_create(body: serde_json::Value, version: i32, preview: bool) -> String {
    let cmd = command(body, PayloadMode::Create, version);
    let data = RoleSqlData::for_create(&cmd, &allowed_alter_attributes(version));
    SqlTemplates::new()
        .create(select_bucket(version), &data, preview)
        .expect("create.sql should render")
}

fn snapshot(is_superuser: bool, catalog_update: bool) -> RoleSnapshot {
    RoleSnapshot {
        oid: 16390,
        name: "reporting".to_string(),
        can_login: true,
        is_superuser,
        catalog_update,
    }
}

fn render_update(body: serde_json::Value, version: i32, snap: &RoleSnapshot) -> String {
    let cmd = command(body, PayloadMode::Update, version);
    let data = RoleSqlData::for_update(&cmd, snap, &allowed_alter_attributes(version));
    SqlTemplates::new()
        .update(select_bucket(version), &data, snap, false)
        .expect("update.sql should render")
}

#[test]
fn buckets_only_override_what_changed() {
    assert_eq!(
        SqlTemplates::source_bucket(VersionBucket::Post90, "create.sql"),
        Some(VersionBucket::Post84)
    );
    assert_eq!(
        SqlTemplates::source_bucket(VersionBucket::Post94, "variables.sql"),
        Some(VersionBucket::Post90)
    );
    assert_eq!(
        SqlTemplates::source_bucket(VersionBucket::Post94, "update.sql"),
        Some(VersionBucket::Post94)
    );
    assert_eq!(
        SqlTemplates::source_bucket(VersionBucket::Post90, "seclabels.sql"),
        None
    );
}

#[test]
fn create_renders_attributes_and_membership() {
    let sql = render_create(
        json!({
            "name": "reporting",
            "canLogin": true,
            "password": "s3cret",
            "connectionLimit": 5,
            "membership": [{"role": "a", "admin": true}, {"role": "b", "admin": false}],
        }),
        80400,
        false,
    );

    assert!(sql.starts_with("CREATE ROLE reporting WITH\n\tLOGIN\n\tNOSUPERUSER\n"));
    assert!(sql.contains("\tCONNECTION LIMIT 5\n"));
    assert!(sql.contains("\tPASSWORD 's3cret'\n"));
    assert!(sql.contains("\tINHERIT;\n"));
    assert!(sql.contains("GRANT b TO reporting;"));
    assert!(sql.contains("GRANT a TO reporting WITH ADMIN OPTION;"));
    assert!(!sql.contains("REPLICATION"));
}

#[test]
fn create_preview_masks_password() {
    let sql = render_create(
        json!({"name": "reporting", "password": "s3cret"}),
        90600,
        true,
    );
    assert!(sql.contains("PASSWORD 'xxxxxx'"));
    assert!(!sql.contains("s3cret"));
}

#[test]
fn replication_and_security_labels_start_at_9_2() {
    let body = json!({
        "name": "replicator",
        "replication": true,
        "securityLabels": [{"provider": "selinux", "label": "system_u:object_r:sepgsql_t:s0"}],
    });

    let old = render_create(body.clone(), 90100, false);
    assert!(!old.contains("REPLICATION"));
    assert!(!old.contains("SECURITY LABEL"));

    let new = render_create(body, 90200, false);
    assert!(new.contains("\tREPLICATION\n"));
    assert!(new.contains(
        "SECURITY LABEL FOR selinux ON ROLE replicator IS 'system_u:object_r:sepgsql_t:s0';"
    ));
}

#[test]
fn superuser_catalog_update_is_only_written_before_9_5() {
    let body = json!({"name": "admin", "superuser": true, "catalogUpdate": false});

    let old = render_create(body.clone(), 90400, false);
    assert!(old.contains(
        "UPDATE pg_catalog.pg_authid SET rolcatupdate = false WHERE rolname = 'admin';"
    ));

    let new = render_create(body, 90500, false);
    assert!(!new.contains("rolcatupdate"));
}

#[test]
fn database_scoped_variables_need_9_0() {
    let body = json!({
        "name": "reporting",
        "variables": [{"database": "app", "name": "work_mem", "value": "64MB"}],
    });

    let old = render_create(body.clone(), 80400, false);
    assert!(old.contains("ALTER ROLE reporting SET work_mem TO '64MB';"));

    let new = render_create(body, 90100, false);
    assert!(new.contains("ALTER ROLE reporting IN DATABASE app SET work_mem TO '64MB';"));
}

#[test]
fn update_renames_first_and_resolves_nulls() {
    let sql = render_update(
        json!({
            "name": "reports",
            "connectionLimit": null,
            "validUntil": null,
            "password": null,
            "membership": {"changed": [{"role": "c", "admin": false}]},
        }),
        90600,
        &snapshot(false, false),
    );

    let expected = "ALTER ROLE reporting\n\tRENAME TO reports;\n\
ALTER ROLE reports WITH\n\tCONNECTION LIMIT -1\n\tVALID UNTIL 'infinity'\n\tPASSWORD NULL;\n\
REVOKE ADMIN OPTION FOR c FROM reports;";
    assert_eq!(sql.trim_end(), expected);
}

#[test]
fn update_without_changes_renders_nothing() {
    let sql = render_update(json!({"name": "reporting"}), 90600, &snapshot(false, false));
    assert!(sql.trim().is_empty());
}

#[test]
fn update_revokes_and_resets() {
    let sql = render_update(
        json!({
            "canLogin": false,
            "membership": {"deleted": [{"role": "Old Group"}], "added": [{"role": "x", "admin": true}]},
            "variables": {"deleted": [{"name": "work_mem", "database": null}]},
            "securityLabels": {"deleted": [{"provider": "dummy"}]},
            "description": null,
        }),
        90500,
        &snapshot(false, false),
    );

    assert!(sql.contains("ALTER ROLE reporting WITH\n\tNOLOGIN;\n"));
    assert!(sql.contains("REVOKE \"Old Group\" FROM reporting;"));
    assert!(sql.contains("GRANT x TO reporting WITH ADMIN OPTION;"));
    assert!(sql.contains("ALTER ROLE reporting RESET work_mem;"));
    assert!(sql.contains("SECURITY LABEL FOR dummy ON ROLE reporting IS NULL;"));
    assert!(sql.contains("COMMENT ON ROLE reporting IS NULL;"));
}

#[test]
fn catalog_update_change_applies_to_superusers() {
    let body = json!({"catalogUpdate": true});

    let sql = render_update(body.clone(), 90400, &snapshot(true, false));
    assert!(sql.contains(
        "UPDATE pg_catalog.pg_authid SET rolcatupdate = true WHERE rolname = 'reporting';"
    ));

    let unchanged = render_update(body.clone(), 90400, &snapshot(true, true));
    assert!(!unchanged.contains("rolcatupdate"));

    let not_superuser = render_update(body.clone(), 90400, &snapshot(false, false));
    assert!(!not_superuser.contains("rolcatupdate"));

    let new_server = render_update(body, 90500, &snapshot(true, false));
    assert!(!new_server.contains("rolcatupdate"));
}

#[test]
fn reverse_engineered_sql_recreates_the_role() {
    let props = RoleProperties {
        oid: 16390,
        name: "reporting".to_string(),
        can_login: true,
        superuser: false,
        create_db: true,
        create_role: false,
        inherit: true,
        replication: false,
        catalog_update: false,
        connection_limit: -1,
        password: String::new(),
        valid_until: Some("2030-01-31T12:00:00+00:00".to_string()),
        description: Some("Reporting login".to_string()),
        membership: vec![MembershipGrant {
            role: "readers".to_string(),
            admin: false,
        }],
        security_labels: Some(vec![SecurityLabel {
            provider: "dummy".to_string(),
            label: "classified".to_string(),
        }]),
    };
    let variables = vec![RoleVariable {
        database: None,
        name: "work_mem".to_string(),
        value: "64MB".to_string(),
    }];

    let data = RoleSqlData::from_properties(&props, variables, &allowed_alter_attributes(90600));
    let sql = SqlTemplates::new()
        .reverse_engineered(select_bucket(90600), &data)
        .expect("sql.sql should render");

    assert!(sql.starts_with(
        "-- Role: reporting\n-- DROP ROLE reporting;\n\nCREATE ROLE reporting WITH\n\tLOGIN\n"
    ));
    assert!(sql.contains("\tCREATEDB\n"));
    assert!(sql.contains("\tNOREPLICATION\n"));
    assert!(sql.contains("\tVALID UNTIL '2030-01-31T12:00:00+00:00'\n"));
    assert!(!sql.contains("CONNECTION LIMIT"));
    assert!(!sql.contains("PASSWORD"));
    assert!(sql.contains("GRANT readers TO reporting;"));
    assert!(sql.contains("SECURITY LABEL FOR dummy ON ROLE reporting IS 'classified';"));
    assert!(sql.contains("ALTER ROLE reporting SET work_mem TO '64MB';"));
    assert!(sql.contains("COMMENT ON ROLE reporting IS 'Reporting login';"));
}

#[test]
fn catalog_queries_follow_table_and_bucket() {
    let templates = SqlTemplates::new();

    let listed = templates
        .properties(VersionBucket::Post84, CatalogTable::Restricted, None)
        .expect("properties.sql should render");
    assert!(listed.contains("FROM\n\tpg_catalog.pg_roles r\n"));
    assert!(listed.contains("false AS rolreplication"));
    assert!(listed.contains("NULL::text[] AS seclabels"));
    assert!(!listed.contains("WHERE\n\tr.oid"));

    let single = templates
        .properties(VersionBucket::Post94, CatalogTable::Extended, Some(16390))
        .expect("properties.sql should render");
    assert!(single.contains("pg_catalog.pg_authid r"));
    assert!(single.contains("r.oid = 16390::oid"));
    assert!(single.contains("false AS rolcatupdate"));
    assert!(single.contains("pg_catalog.pg_shseclabel"));

    let permission = templates
        .permission(VersionBucket::Post91, 16390)
        .expect("permission.sql should render");
    assert!(permission.contains("r.rolcatupdate"));

    let variables = templates
        .variables(VersionBucket::Post84, 16390)
        .expect("variables.sql should render");
    assert!(variables.contains("r.rolconfig"));
}

#[test]
fn unbounded_valid_until_is_projected_as_null() {
    let templates = SqlTemplates::new();
    for bucket in [
        VersionBucket::Post84,
        VersionBucket::Post90,
        VersionBucket::Post91,
        VersionBucket::Post94,
    ] {
        let sql = templates
            .properties(bucket, CatalogTable::Restricted, Some(16390))
            .expect("properties.sql should render");
        assert!(sql.contains(
            "CASE WHEN r.rolvaliduntil IN ('infinity'::timestamptz, '-infinity'::timestamptz) THEN NULL"
        ));
    }
}
