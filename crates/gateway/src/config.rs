use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use pgrole_driver::{PoolSettings, ServerTarget};

const SERVER_KEY_PREFIX: &str = "PGROLE_SERVER_";
const SERVER_URL_SUFFIX: &str = "_DB_URL";
const DEFAULT_GROUP_ID: i64 = 1;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub servers: Vec<ServerTarget>,
    pub db_max_connections: u32,
    pub db_connect_timeout_ms: u64,
    pub db_query_timeout_ms: u64,
    pub server_info_ttl_ms: u64,
    pub local_auth_shared_secret: Option<String>,
    pub metrics_require_auth: bool,
}

#[derive(Debug, Clone)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("PGROLE_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("PGROLE_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "PGROLE_BIND_ADDR",
        )?;

        let local_auth_shared_secret = kv
            .get("PGROLE_LOCAL_AUTH_SHARED_SECRET")
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let dev_allow_nonlocal_bind = parse_flag(
            kv.get("PGROLE_DEV_ALLOW_NONLOCAL_BIND"),
            false,
            "PGROLE_DEV_ALLOW_NONLOCAL_BIND",
        )?;

        if !bind_addr.ip().is_loopback() && local_auth_shared_secret.is_none() {
            if dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()) {
                // Dev-only escape hatch for containers.
            } else {
                return Err(StartupError {
                    code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                    message: "non-local bind requires PGROLE_LOCAL_AUTH_SHARED_SECRET; refuse startup"
                        .to_string(),
                });
            }
        }

        let metrics_require_auth = parse_flag(
            kv.get("PGROLE_METRICS_REQUIRE_AUTH"),
            false,
            "PGROLE_METRICS_REQUIRE_AUTH",
        )?;
        if metrics_require_auth && local_auth_shared_secret.is_none() {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "PGROLE_METRICS_REQUIRE_AUTH needs PGROLE_LOCAL_AUTH_SHARED_SECRET"
                    .to_string(),
            });
        }

        let servers = parse_servers(kv)?;

        let db_max_connections = parse_u32(
            kv.get("PGROLE_DB_MAX_CONNECTIONS"),
            4,
            "PGROLE_DB_MAX_CONNECTIONS",
        )?;
        if db_max_connections == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "PGROLE_DB_MAX_CONNECTIONS must be >= 1".to_string(),
            });
        }

        let db_connect_timeout_ms = parse_u64(
            kv.get("PGROLE_DB_CONNECT_TIMEOUT_MS"),
            2000,
            "PGROLE_DB_CONNECT_TIMEOUT_MS",
        )?;
        let db_query_timeout_ms = parse_u64(
            kv.get("PGROLE_DB_QUERY_TIMEOUT_MS"),
            5000,
            "PGROLE_DB_QUERY_TIMEOUT_MS",
        )?;
        if db_connect_timeout_ms == 0 || db_query_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "database timeouts must be > 0".to_string(),
            });
        }

        let server_info_ttl_ms = parse_u64(
            kv.get("PGROLE_SERVER_INFO_TTL_MS"),
            60_000,
            "PGROLE_SERVER_INFO_TTL_MS",
        )?;

        Ok(Self {
            bind_addr,
            servers,
            db_max_connections,
            db_connect_timeout_ms,
            db_query_timeout_ms,
            server_info_ttl_ms,
            local_auth_shared_secret,
            metrics_require_auth,
        })
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_connections: self.db_max_connections,
            connect_timeout: Duration::from_millis(self.db_connect_timeout_ms),
            query_timeout: Duration::from_millis(self.db_query_timeout_ms),
            info_ttl: Duration::from_millis(self.server_info_ttl_ms),
        }
    }
}

/// Collects `PGROLE_SERVER_<sid>_DB_URL` entries, ordered by server id.
fn parse_servers(kv: &HashMap<String, String>) -> Result<Vec<ServerTarget>, StartupError> {
    let mut servers = BTreeMap::new();

    for (key, value) in kv {
        let Some(raw_id) = key
            .strip_prefix(SERVER_KEY_PREFIX)
            .and_then(|rest| rest.strip_suffix(SERVER_URL_SUFFIX))
        else {
            continue;
        };

        let server_id = raw_id.parse::<i64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must name an integer server id", key),
        })?;

        let db_url = value.trim();
        if db_url.is_empty() {
            return Err(StartupError {
                code: "ERR_MISSING_CONFIG",
                message: format!("{} must be non-empty", key),
            });
        }

        let group_key = format!("{}{}_GROUP_ID", SERVER_KEY_PREFIX, raw_id);
        let group_id = parse_i64(kv.get(&group_key), DEFAULT_GROUP_ID, &group_key)?;

        servers.insert(
            server_id,
            ServerTarget {
                server_id,
                group_id,
                db_url: db_url.to_string(),
            },
        );
    }

    if servers.is_empty() {
        return Err(StartupError {
            code: "ERR_MISSING_CONFIG",
            message: "at least one PGROLE_SERVER_<id>_DB_URL is required".to_string(),
        });
    }

    Ok(servers.into_values().collect())
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_i64(value: Option<&String>, default: i64, key: &str) -> Result<i64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<i64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn parse_flag(value: Option<&String>, default: bool, key: &'static str) -> Result<bool, StartupError> {
    match value.map(|v| v.trim()) {
        None | Some("") => Ok(default),
        Some(_) => parse_bool(value).ok_or_else(|| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a boolean", key),
        }),
    }
}

fn is_unspecified_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}
