mod catalog;
mod info_cache;
mod manager;
pub mod templates;

pub use manager::{ConnectionManager, PoolSettings, ServerConnection, ServerInfo, ServerTarget};
pub use templates::{RoleSqlData, SqlTemplates, quote_ident, quote_literal};

#[derive(Debug)]
pub enum DriverError {
    Timeout,
    ConnectionLost(String),
    UnknownServer { group_id: i64, server_id: i64 },
    InvalidServerInfo(String),
    Sqlx(sqlx::Error),
    Template(minijinja::Error),
}

impl std::fmt::Display for DriverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverError::Timeout => write!(f, "database operation timed out"),
            DriverError::ConnectionLost(reason) => write!(f, "connection lost: {}", reason),
            DriverError::UnknownServer {
                group_id,
                server_id,
            } => write!(
                f,
                "server {} is not configured in group {}",
                server_id, group_id
            ),
            DriverError::InvalidServerInfo(reason) => {
                write!(f, "unexpected server information: {}", reason)
            }
            // Database errors surface the server's own message.
            DriverError::Sqlx(sqlx::Error::Database(err)) => write!(f, "{}", err.message()),
            DriverError::Sqlx(err) => write!(f, "{}", err),
            DriverError::Template(err) => write!(f, "template error: {}", err),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<sqlx::Error> for DriverError {
    fn from(value: sqlx::Error) -> Self {
        DriverError::Sqlx(value)
    }
}

impl From<minijinja::Error> for DriverError {
    fn from(value: minijinja::Error) -> Self {
        DriverError::Template(value)
    }
}

impl DriverError {
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionLost(_)
                | DriverError::Sqlx(
                    sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
                )
        )
    }
}
