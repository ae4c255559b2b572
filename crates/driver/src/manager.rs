use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pgrole_policy::{UserInfo, VersionBucket, select_bucket};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPoolOptions};
use sqlx::{ConnectOptions, Connection, PgPool, Postgres};

use crate::DriverError;
use crate::catalog::SessionUserRow;
use crate::info_cache::ServerInfoCache;

const SESSION_USER_SQL: &str = "SELECT r.oid::bigint AS id, r.rolname AS name, r.rolsuper AS is_superuser, r.rolcreaterole AS can_create_role, r.rolcreatedb AS can_create_db FROM pg_catalog.pg_roles r WHERE r.rolname = current_user";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub server_id: i64,
    pub group_id: i64,
    pub db_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub info_ttl: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 4,
            connect_timeout: Duration::from_millis(2000),
            query_timeout: Duration::from_millis(5000),
            info_ttl: Duration::from_millis(60_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: i32,
    pub user: UserInfo,
}

struct ServerEntry {
    group_id: i64,
    pool: PgPool,
}

#[derive(Clone)]
pub struct ConnectionManager {
    servers: Arc<HashMap<i64, ServerEntry>>,
    settings: PoolSettings,
    info_cache: ServerInfoCache,
}

impl ConnectionManager {
    /// Pools connect on first use, so an unreachable server does not block
    /// startup.
    pub fn from_servers(
        targets: &[ServerTarget],
        settings: PoolSettings,
    ) -> Result<Self, DriverError> {
        let mut servers = HashMap::with_capacity(targets.len());
        for target in targets {
            // Statement logging would echo rendered SQL, passwords included.
            let options = target
                .db_url
                .parse::<PgConnectOptions>()?
                .disable_statement_logging();
            let pool = PgPoolOptions::new()
                .max_connections(settings.max_connections)
                .acquire_timeout(settings.connect_timeout)
                .connect_lazy_with(options);
            servers.insert(
                target.server_id,
                ServerEntry {
                    group_id: target.group_id,
                    pool,
                },
            );
        }

        Ok(Self {
            servers: Arc::new(servers),
            settings,
            info_cache: ServerInfoCache::new(settings.info_ttl),
        })
    }

    pub fn server_ids(&self) -> Vec<i64> {
        let mut ids = self.servers.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Binds one pooled session for the duration of a request.
    pub async fn connection(
        &self,
        group_id: i64,
        server_id: i64,
    ) -> Result<ServerConnection, DriverError> {
        let entry = self
            .servers
            .get(&server_id)
            .filter(|entry| entry.group_id == group_id)
            .ok_or(DriverError::UnknownServer {
                group_id,
                server_id,
            })?;

        let mut conn = tokio::time::timeout(self.settings.connect_timeout, entry.pool.acquire())
            .await
            .map_err(|_| DriverError::ConnectionLost("timed out acquiring a session".to_string()))?
            .map_err(|err| DriverError::ConnectionLost(err.to_string()))?;

        let info = match self.info_cache.get(server_id).await {
            Some(info) => info,
            None => {
                let info = fetch_server_info(&mut conn, self.settings.query_timeout).await?;
                tracing::debug!(
                    server_id,
                    server_version = info.version,
                    "server info refreshed"
                );
                self.info_cache.put(server_id, info.clone()).await;
                info
            }
        };

        Ok(ServerConnection {
            info,
            conn,
            query_timeout: self.settings.query_timeout,
        })
    }

    /// Drops cached session-user info, e.g. after the user's own role changed.
    pub async fn forget_server_info(&self, server_id: i64) {
        self.info_cache.invalidate(server_id).await;
    }

    pub async fn ping(&self, server_id: i64) -> bool {
        let Some(entry) = self.servers.get(&server_id) else {
            return false;
        };

        matches!(
            tokio::time::timeout(
                self.settings.connect_timeout,
                sqlx::query("SELECT 1").execute(&entry.pool),
            )
            .await,
            Ok(Ok(_))
        )
    }
}

#[derive(Debug)]
pub struct ServerConnection {
    info: ServerInfo,
    conn: PoolConnection<Postgres>,
    query_timeout: Duration,
}

impl ServerConnection {
    pub fn version(&self) -> i32 {
        self.info.version
    }

    pub fn user(&self) -> &UserInfo {
        &self.info.user
    }

    pub fn bucket(&self) -> VersionBucket {
        select_bucket(self.info.version)
    }

    pub async fn is_connected(&mut self) -> bool {
        matches!(
            tokio::time::timeout(self.query_timeout, self.conn.ping()).await,
            Ok(Ok(()))
        )
    }

    pub(crate) fn session(&mut self) -> (&mut PgConnection, Duration) {
        (&mut *self.conn, self.query_timeout)
    }
}

pub(crate) async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, DriverError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| DriverError::Timeout)?
        .map_err(DriverError::from)
}

async fn fetch_server_info(
    conn: &mut PgConnection,
    timeout: Duration,
) -> Result<ServerInfo, DriverError> {
    let raw = with_timeout(
        timeout,
        sqlx::query_scalar::<_, String>("SHOW server_version_num").fetch_one(&mut *conn),
    )
    .await?;
    let version = raw.trim().parse::<i32>().map_err(|_| {
        DriverError::InvalidServerInfo(format!("server_version_num `{}`", raw.trim()))
    })?;

    let user = with_timeout(
        timeout,
        sqlx::query_as::<_, SessionUserRow>(SESSION_USER_SQL).fetch_optional(&mut *conn),
    )
    .await?
    .ok_or_else(|| {
        DriverError::InvalidServerInfo("session user is not visible in pg_roles".to_string())
    })?;

    Ok(ServerInfo {
        version,
        user: user.into(),
    })
}
