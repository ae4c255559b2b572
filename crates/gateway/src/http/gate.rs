use std::future::Future;

use axum::http::StatusCode;
use pgrole_contracts::{NEW_ROLE_SENTINEL, RoleAttribute};
use pgrole_driver::{DriverError, ServerConnection, SqlTemplates};
use pgrole_policy::{
    Action, CatalogTable, Forbidden, RoleSnapshot, UserInfo, VersionBucket,
    allowed_alter_attributes, authorize, gate_plan, select_bucket,
};

use super::{ApiError, json_error};

/// What the gate needs from a bound database session.
pub(super) trait GateSession {
    fn server_version(&self) -> i32;

    fn user(&self) -> &UserInfo;

    fn is_connected(&mut self) -> impl Future<Output = bool> + Send;

    fn can_read_authid(&mut self) -> impl Future<Output = Result<bool, DriverError>> + Send;

    fn role_snapshot(
        &mut self,
        role_id: i64,
    ) -> impl Future<Output = Result<Option<RoleSnapshot>, DriverError>> + Send;
}

pub(super) struct LiveSession<'a> {
    pub conn: &'a mut ServerConnection,
    pub templates: &'a SqlTemplates,
}

impl GateSession for LiveSession<'_> {
    fn server_version(&self) -> i32 {
        self.conn.version()
    }

    fn user(&self) -> &UserInfo {
        self.conn.user()
    }

    async fn is_connected(&mut self) -> bool {
        self.conn.is_connected().await
    }

    async fn can_read_authid(&mut self) -> Result<bool, DriverError> {
        self.conn.can_read_authid().await
    }

    async fn role_snapshot(&mut self, role_id: i64) -> Result<Option<RoleSnapshot>, DriverError> {
        self.conn.role_snapshot(self.templates, role_id).await
    }
}

/// Per-request facts the handlers run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct RoleContext {
    pub version: i32,
    pub bucket: VersionBucket,
    pub catalog: CatalogTable,
    pub allowed: Vec<RoleAttribute>,
    pub snapshot: Option<RoleSnapshot>,
}

#[derive(Debug)]
pub(super) enum GateRejection {
    ConnectionLost,
    Forbidden(Forbidden),
    NotFound,
    Internal(String),
}

impl GateRejection {
    pub fn code(&self) -> &'static str {
        match self {
            GateRejection::ConnectionLost => "ERR_CONNECTION_LOST",
            GateRejection::Forbidden(_) => "ERR_FORBIDDEN",
            GateRejection::NotFound => "ERR_NOT_FOUND",
            GateRejection::Internal(_) => "ERR_INTERNAL",
        }
    }

    pub fn into_api_error(self) -> ApiError {
        let code = self.code();
        match self {
            GateRejection::ConnectionLost => json_error(
                StatusCode::PRECONDITION_REQUIRED,
                code,
                "Connection to the server has been lost!",
            ),
            GateRejection::Forbidden(forbidden) => {
                json_error(StatusCode::FORBIDDEN, code, forbidden.message())
            }
            GateRejection::NotFound => json_error(
                StatusCode::GONE,
                code,
                "Couldn't find the specific role in the database server!",
            ),
            GateRejection::Internal(message) => {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, code, message)
            }
        }
    }
}

/// Runs the checks `gate_plan` selects for `action`, in order, stopping at
/// the first rejection.
pub(super) async fn run_gate<S: GateSession>(
    session: &mut S,
    action: Action,
    role_id: Option<i64>,
) -> Result<RoleContext, GateRejection> {
    if !session.is_connected().await {
        return Err(GateRejection::ConnectionLost);
    }

    // Role oids are never negative; -1 only names a new role in a preview.
    if let Some(rid) = role_id
        && rid < 0
        && !(matches!(action, Action::Msql) && rid == NEW_ROLE_SENTINEL)
    {
        return Err(GateRejection::NotFound);
    }

    let version = session.server_version();
    let plan = gate_plan(action, role_id);

    let catalog = if plan.probe_catalog {
        let readable = session.can_read_authid().await.map_err(|err| {
            GateRejection::Internal(format!(
                "Error checking the permission to the pg_authid!\n{}",
                err
            ))
        })?;
        CatalogTable::for_privilege(readable)
    } else {
        CatalogTable::Restricted
    };

    if plan.check_permission {
        authorize(action, session.user(), role_id).map_err(GateRejection::Forbidden)?;
    }

    let snapshot = match role_id.filter(|_| plan.fetch_snapshot) {
        Some(role_id) => match session.role_snapshot(role_id).await {
            Ok(Some(snapshot)) => Some(snapshot),
            Ok(None) => return Err(GateRejection::NotFound),
            Err(err) => {
                return Err(GateRejection::Internal(format!(
                    "ERROR: fetching the role information!\n{}",
                    err
                )));
            }
        },
        None => None,
    };

    Ok(RoleContext {
        version,
        bucket: select_bucket(version),
        catalog,
        allowed: allowed_alter_attributes(version),
        snapshot,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeSession {
        version: i32,
        user: UserInfo,
        connected: bool,
        authid_readable: Result<bool, ()>,
        roles: Vec<RoleSnapshot>,
        authid_probes: usize,
        snapshot_fetches: usize,
    }

    impl FakeSession {
        fn new(user: UserInfo) -> Self {
            Self {
                version: 90600,
                user,
                connected: true,
                authid_readable: Ok(true),
                roles: vec![snapshot(10, "postgres", true), snapshot(16390, "app_user", false)],
                authid_probes: 0,
                snapshot_fetches: 0,
            }
        }
    }

    impl GateSession for FakeSession {
        fn server_version(&self) -> i32 {
            self.version
        }

        fn user(&self) -> &UserInfo {
            &self.user
        }

        async fn is_connected(&mut self) -> bool {
            self.connected
        }

        async fn can_read_authid(&mut self) -> Result<bool, DriverError> {
            self.authid_probes += 1;
            self.authid_readable
                .map_err(|_| DriverError::ConnectionLost("probe failed".to_string()))
        }

        async fn role_snapshot(
            &mut self,
            role_id: i64,
        ) -> Result<Option<RoleSnapshot>, DriverError> {
            self.snapshot_fetches += 1;
            Ok(self.roles.iter().find(|r| r.oid == role_id).cloned())
        }
    }

    fn snapshot(oid: i64, name: &str, is_superuser: bool) -> RoleSnapshot {
        RoleSnapshot {
            oid,
            name: name.to_string(),
            can_login: true,
            is_superuser,
            catalog_update: is_superuser,
        }
    }

    fn superuser() -> UserInfo {
        UserInfo {
            id: 10,
            name: "postgres".to_string(),
            is_superuser: true,
            can_create_role: true,
            can_create_db: true,
        }
    }

    fn plain_user() -> UserInfo {
        UserInfo {
            id: 16390,
            name: "app_user".to_string(),
            is_superuser: false,
            can_create_role: false,
            can_create_db: false,
        }
    }

    #[tokio::test]
    async fn disconnected_session_is_rejected_first() {
        let mut session = FakeSession::new(superuser());
        session.connected = false;

        let rejection = run_gate(&mut session, Action::Drop, Some(16390))
            .await
            .unwrap_err();
        assert_eq!(rejection.code(), "ERR_CONNECTION_LOST");
        assert_eq!(session.snapshot_fetches, 0);

        let (status, body) = rejection.into_api_error();
        assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);
        assert_eq!(body.errormsg, "Connection to the server has been lost!");
    }

    #[tokio::test]
    async fn list_probes_authid_and_picks_catalog() {
        let mut session = FakeSession::new(plain_user());
        let ctx = run_gate(&mut session, Action::List, None).await.unwrap();
        assert_eq!(ctx.catalog, CatalogTable::Extended);
        assert_eq!(session.authid_probes, 1);

        session.authid_readable = Ok(false);
        let ctx = run_gate(&mut session, Action::Properties, Some(10))
            .await
            .unwrap();
        assert_eq!(ctx.catalog, CatalogTable::Restricted);
        assert!(ctx.snapshot.is_none());
    }

    #[tokio::test]
    async fn failed_authid_probe_is_internal() {
        let mut session = FakeSession::new(superuser());
        session.authid_readable = Err(());

        let rejection = run_gate(&mut session, Action::List, None).await.unwrap_err();
        let (status, body) = rejection.into_api_error();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(
            body.errormsg
                .starts_with("Error checking the permission to the pg_authid!\n")
        );
    }

    #[tokio::test]
    async fn non_mutations_skip_the_permission_check() {
        let mut session = FakeSession::new(plain_user());
        for action in [Action::Nodes, Action::Sql, Action::Variables, Action::Voptions] {
            assert!(run_gate(&mut session, action, Some(10)).await.is_ok());
        }
        assert_eq!(session.authid_probes, 0);
        assert_eq!(session.snapshot_fetches, 0);
    }

    #[tokio::test]
    async fn plain_user_cannot_drop_even_itself() {
        let mut session = FakeSession::new(plain_user());
        let rejection = run_gate(&mut session, Action::Drop, Some(16390))
            .await
            .unwrap_err();

        assert_eq!(session.snapshot_fetches, 0);
        let (status, body) = rejection.into_api_error();
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(
            body.errormsg,
            "The current user does not have permission to drop the role!"
        );
    }

    #[tokio::test]
    async fn plain_user_may_update_its_own_role_only() {
        let mut session = FakeSession::new(plain_user());
        let ctx = run_gate(&mut session, Action::Update, Some(16390))
            .await
            .unwrap();
        assert_eq!(ctx.snapshot.map(|s| s.name), Some("app_user".to_string()));

        let rejection = run_gate(&mut session, Action::Update, Some(10))
            .await
            .unwrap_err();
        assert_eq!(rejection.code(), "ERR_FORBIDDEN");

        let rejection = run_gate(&mut session, Action::Create, None)
            .await
            .unwrap_err();
        assert_eq!(rejection.code(), "ERR_FORBIDDEN");
    }

    #[tokio::test]
    async fn missing_target_role_is_gone() {
        let mut session = FakeSession::new(superuser());
        let rejection = run_gate(&mut session, Action::Drop, Some(99999))
            .await
            .unwrap_err();

        let (status, body) = rejection.into_api_error();
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(
            body.errormsg,
            "Couldn't find the specific role in the database server!"
        );
    }

    #[tokio::test]
    async fn msql_fetches_a_snapshot_only_for_real_ids() {
        let mut session = FakeSession::new(plain_user());

        let ctx = run_gate(&mut session, Action::Msql, None).await.unwrap();
        assert!(ctx.snapshot.is_none());
        let ctx = run_gate(&mut session, Action::Msql, Some(-1)).await.unwrap();
        assert!(ctx.snapshot.is_none());
        assert_eq!(session.snapshot_fetches, 0);

        let ctx = run_gate(&mut session, Action::Msql, Some(10)).await.unwrap();
        assert_eq!(ctx.snapshot.map(|s| s.oid), Some(10));
    }

    #[tokio::test]
    async fn negative_role_ids_are_gone_without_querying() {
        let mut session = FakeSession::new(superuser());
        for action in [Action::Properties, Action::Node, Action::Sql, Action::Drop] {
            let rejection = run_gate(&mut session, action, Some(-5)).await.unwrap_err();
            assert_eq!(rejection.code(), "ERR_NOT_FOUND");
        }
        let rejection = run_gate(&mut session, Action::Msql, Some(-2))
            .await
            .unwrap_err();
        let (status, _) = rejection.into_api_error();
        assert_eq!(status, StatusCode::GONE);

        assert_eq!(session.authid_probes, 0);
        assert_eq!(session.snapshot_fetches, 0);
        assert!(run_gate(&mut session, Action::Msql, Some(-1)).await.is_ok());
    }

    #[tokio::test]
    async fn context_carries_bucket_and_alter_attributes() {
        let mut session = FakeSession::new(superuser());
        session.version = 90199;
        let ctx = run_gate(&mut session, Action::Create, None).await.unwrap();
        assert_eq!(ctx.bucket, VersionBucket::Post90);
        assert!(!ctx.allowed.contains(&RoleAttribute::Replication));

        session.version = 90500;
        let ctx = run_gate(&mut session, Action::Create, None).await.unwrap();
        assert_eq!(ctx.bucket, VersionBucket::Post94);
        assert!(ctx.allowed.contains(&RoleAttribute::Replication));
    }
}
