use chrono::{DateTime, Utc};
use sqlx::Executor;
use pgrole_contracts::{RoleNodeRecord, RoleRecord, RoleVariable, VariableOption};
use pgrole_policy::{CatalogTable, RoleSnapshot, UserInfo};

use crate::manager::with_timeout;
use crate::templates::quote_ident;
use crate::{DriverError, ServerConnection, SqlTemplates};

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SessionUserRow {
    id: i64,
    name: String,
    is_superuser: bool,
    can_create_role: bool,
    can_create_db: bool,
}

impl From<SessionUserRow> for UserInfo {
    fn from(row: SessionUserRow) -> Self {
        UserInfo {
            id: row.id,
            name: row.name,
            is_superuser: row.is_superuser,
            can_create_role: row.can_create_role,
            can_create_db: row.can_create_db,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RoleRow {
    oid: i64,
    rolname: String,
    rolcanlogin: bool,
    rolsuper: bool,
    rolcreatedb: bool,
    rolcreaterole: bool,
    rolinherit: bool,
    rolreplication: bool,
    rolcatupdate: bool,
    rolconnlimit: i32,
    rolpassword: Option<String>,
    rolvaliduntil: Option<DateTime<Utc>>,
    description: Option<String>,
    rolmembership: Vec<String>,
    seclabels: Option<Vec<String>>,
}

impl From<RoleRow> for RoleRecord {
    fn from(row: RoleRow) -> Self {
        RoleRecord {
            oid: row.oid,
            name: row.rolname,
            can_login: row.rolcanlogin,
            superuser: row.rolsuper,
            create_db: row.rolcreatedb,
            create_role: row.rolcreaterole,
            inherit: row.rolinherit,
            replication: row.rolreplication,
            catalog_update: row.rolcatupdate,
            connection_limit: row.rolconnlimit,
            password: row.rolpassword,
            valid_until: row.rolvaliduntil,
            description: row.description,
            membership: row.rolmembership,
            security_labels: row.seclabels,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NodeRow {
    oid: i64,
    rolname: String,
    rolcanlogin: bool,
    rolsuper: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct PermissionRow {
    oid: i64,
    rolname: String,
    rolcanlogin: bool,
    rolsuper: bool,
    rolcatupdate: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct VariableRow {
    database: Option<String>,
    setting: String,
}

#[derive(Debug, sqlx::FromRow)]
struct VariableOptionRow {
    name: String,
    vartype: String,
    min_val: Option<f64>,
    max_val: Option<f64>,
    enumvals: Option<Vec<String>>,
}

/// Splits a stored `name=value` setting.
fn parse_setting(database: Option<String>, setting: &str) -> Option<RoleVariable> {
    let (name, value) = setting.split_once('=')?;
    Some(RoleVariable {
        database,
        name: name.to_string(),
        value: value.to_string(),
    })
}

impl ServerConnection {
    pub async fn can_read_authid(&mut self) -> Result<bool, DriverError> {
        let (conn, timeout) = self.session();
        with_timeout(
            timeout,
            sqlx::query_scalar::<_, bool>("SELECT has_table_privilege('pg_authid', 'SELECT')")
                .fetch_one(conn),
        )
        .await
    }

    pub async fn role_records(
        &mut self,
        templates: &SqlTemplates,
        table: CatalogTable,
        role_id: Option<i64>,
    ) -> Result<Vec<RoleRecord>, DriverError> {
        let sql = templates.properties(self.bucket(), table, role_id)?;
        let (conn, timeout) = self.session();
        let rows = with_timeout(
            timeout,
            sqlx::query_as::<_, RoleRow>(&sql).fetch_all(conn),
        )
        .await?;
        Ok(rows.into_iter().map(RoleRecord::from).collect())
    }

    pub async fn role_nodes(
        &mut self,
        templates: &SqlTemplates,
        table: CatalogTable,
        role_id: Option<i64>,
    ) -> Result<Vec<RoleNodeRecord>, DriverError> {
        let sql = templates.nodes(self.bucket(), table, role_id)?;
        let (conn, timeout) = self.session();
        let rows = with_timeout(timeout, sqlx::query_as::<_, NodeRow>(&sql).fetch_all(conn)).await?;
        Ok(rows
            .into_iter()
            .map(|row| RoleNodeRecord {
                oid: row.oid,
                name: row.rolname,
                can_login: row.rolcanlogin,
                is_superuser: row.rolsuper,
            })
            .collect())
    }

    pub async fn role_snapshot(
        &mut self,
        templates: &SqlTemplates,
        role_id: i64,
    ) -> Result<Option<RoleSnapshot>, DriverError> {
        let sql = templates.permission(self.bucket(), role_id)?;
        let (conn, timeout) = self.session();
        let row = with_timeout(
            timeout,
            sqlx::query_as::<_, PermissionRow>(&sql).fetch_optional(conn),
        )
        .await?;
        Ok(row.map(|row| RoleSnapshot {
            oid: row.oid,
            name: row.rolname,
            can_login: row.rolcanlogin,
            is_superuser: row.rolsuper,
            catalog_update: row.rolcatupdate,
        }))
    }

    pub async fn role_oid_by_name(
        &mut self,
        table: CatalogTable,
        name: &str,
    ) -> Result<Option<i64>, DriverError> {
        let sql = format!(
            "SELECT oid::bigint FROM {} WHERE rolname = $1",
            table.qualified_name()
        );
        let (conn, timeout) = self.session();
        with_timeout(
            timeout,
            sqlx::query_scalar::<_, i64>(&sql)
                .bind(name)
                .fetch_optional(conn),
        )
        .await
    }

    pub async fn role_variables(
        &mut self,
        templates: &SqlTemplates,
        role_id: i64,
    ) -> Result<Vec<RoleVariable>, DriverError> {
        let sql = templates.variables(self.bucket(), role_id)?;
        let (conn, timeout) = self.session();
        let rows =
            with_timeout(timeout, sqlx::query_as::<_, VariableRow>(&sql).fetch_all(conn)).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| parse_setting(row.database, &row.setting))
            .collect())
    }

    pub async fn variable_options(
        &mut self,
        templates: &SqlTemplates,
    ) -> Result<Vec<VariableOption>, DriverError> {
        let sql = templates.variable_options(self.bucket())?;
        let (conn, timeout) = self.session();
        let rows = with_timeout(
            timeout,
            sqlx::query_as::<_, VariableOptionRow>(&sql).fetch_all(conn),
        )
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| VariableOption {
                name: row.name,
                vartype: row.vartype,
                min_val: row.min_val,
                max_val: row.max_val,
                enumvals: row.enumvals,
            })
            .collect())
    }

    /// Runs rendered SQL, possibly several statements, as one round trip.
    /// Without bind arguments the simple query protocol is used.
    pub async fn execute_script(&mut self, sql: &str) -> Result<(), DriverError> {
        let (conn, timeout) = self.session();
        with_timeout(timeout, conn.execute(sql)).await?;
        Ok(())
    }

    pub async fn drop_role(&mut self, name: &str) -> Result<(), DriverError> {
        self.execute_script(&format!("DROP ROLE {};", quote_ident(name)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    // Axum handlers need every awaited future to be Send.
    #[allow(dead_code)]
    fn script_execution_is_send(conn: &mut ServerConnection) {
        let fut = conn.execute_script("SELECT 1; SELECT 2");
        assert_send(&fut);
    }

    #[test]
    fn settings_split_on_first_equals() {
        let var = parse_setting(Some("app".to_string()), "search_path=a,b=c")
            .expect("setting should parse");
        assert_eq!(var.name, "search_path");
        assert_eq!(var.value, "a,b=c");
        assert_eq!(var.database.as_deref(), Some("app"));

        assert!(parse_setting(None, "broken").is_none());
    }
}
