use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use pgrole_contracts::{
    NEW_ROLE_SENTINEL, PayloadMode, RoleProperties, TreeNode, ValidationError, normalize,
    transform_role,
};
use pgrole_driver::{DriverError, RoleSqlData, ServerConnection};
use pgrole_policy::{Action, CatalogTable};
use serde::Serialize;

use super::gate::{LiveSession, RoleContext, run_gate};
use super::payload::decode_payload;
use super::{
    ApiError, AppState, envelope, extract_request_id, instrumented, json_error,
    validate_local_auth_shared_secret,
};

const ROLES: &str = "/v1/groups/{gid}/servers/{sid}/roles";
const ROLE: &str = "/v1/groups/{gid}/servers/{sid}/roles/{rid}";
const NODES: &str = "/v1/groups/{gid}/servers/{sid}/roles/nodes";
const NODE: &str = "/v1/groups/{gid}/servers/{sid}/roles/nodes/{rid}";
const SQL: &str = "/v1/groups/{gid}/servers/{sid}/roles/sql/{rid}";
const MSQL: &str = "/v1/groups/{gid}/servers/{sid}/roles/msql";
const MSQL_ROLE: &str = "/v1/groups/{gid}/servers/{sid}/roles/msql/{rid}";
const DEPENDENCIES: &str = "/v1/groups/{gid}/servers/{sid}/roles/dependency/{rid}";
const DEPENDENTS: &str = "/v1/groups/{gid}/servers/{sid}/roles/dependent/{rid}";
const VARIABLES: &str = "/v1/groups/{gid}/servers/{sid}/roles/variables/{rid}";
const VOPTIONS: &str = "/v1/groups/{gid}/servers/{sid}/roles/vopts";

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(ROLES, get(list).post(create))
        .route(ROLE, get(properties).put(update).delete(drop_role))
        .route(NODES, get(nodes))
        .route(NODE, get(node))
        .route(SQL, get(sql))
        .route(MSQL, get(msql_new))
        .route(MSQL_ROLE, get(msql_existing))
        .route(DEPENDENCIES, get(dependencies))
        .route(DEPENDENTS, get(dependents))
        .route(VARIABLES, get(variables))
        .route(VOPTIONS, get(voptions))
}

macro_rules! role_span {
    ($name:literal, $request_id:expr, $server_id:expr) => {
        tracing::info_span!(
            $name,
            request_id = %$request_id,
            server_id = $server_id,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        )
    };
    ($name:literal, $request_id:expr, $server_id:expr, $role_id:expr) => {
        tracing::info_span!(
            $name,
            request_id = %$request_id,
            server_id = $server_id,
            role_id = $role_id,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        )
    };
}

#[derive(Debug, Serialize)]
struct NodeResponse {
    node: TreeNode,
}

fn internal(message: String) -> ApiError {
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "ERR_INTERNAL", message)
}

fn gone(message: &str) -> ApiError {
    json_error(StatusCode::GONE, "ERR_NOT_FOUND", message)
}

fn validation_error(err: ValidationError) -> ApiError {
    json_error(StatusCode::PRECONDITION_REQUIRED, err.code(), err.message())
}

fn connection_error(err: DriverError) -> ApiError {
    match err {
        DriverError::UnknownServer { .. } => gone("Could not find the specified server."),
        err if err.is_connection_lost() => json_error(
            StatusCode::PRECONDITION_REQUIRED,
            "ERR_CONNECTION_LOST",
            "Connection to the server has been lost!",
        ),
        err => internal(err.to_string()),
    }
}

/// Counts and logs a request turned away before its handler ran.
fn reject(action: Action, (status, body): ApiError) -> ApiError {
    tracing::warn!(
        action = action.as_str(),
        code = %body.code,
        status = status.as_u16(),
        "roles.request_rejected"
    );
    crate::metrics::observe_gate_rejection(action.as_str(), &body.code);
    (status, body)
}

fn check_secret(state: &AppState, headers: &HeaderMap, action: Action) -> Result<(), ApiError> {
    validate_local_auth_shared_secret(headers, state.config.local_auth_shared_secret.as_deref())
        .map_err(|err| reject(action, err))
}

/// Binds a session for the request and runs the gate on it.
async fn admit(
    state: &AppState,
    action: Action,
    group_id: i64,
    server_id: i64,
    role_id: Option<i64>,
) -> Result<(ServerConnection, RoleContext), ApiError> {
    let mut conn = state
        .connections
        .connection(group_id, server_id)
        .await
        .map_err(|err| reject(action, connection_error(err)))?;

    let mut session = LiveSession {
        conn: &mut conn,
        templates: &state.templates,
    };
    let ctx = run_gate(&mut session, action, role_id)
        .await
        .map_err(|rejection| reject(action, rejection.into_api_error()))?;

    Ok((conn, ctx))
}

fn record_mutation<T>(action: Action, result: &Result<T, DriverError>) {
    let outcome = if result.is_ok() { "success" } else { "error" };
    crate::metrics::observe_role_mutation(action.as_str(), outcome);
}

async fn fetch_node(
    state: &AppState,
    conn: &mut ServerConnection,
    catalog: CatalogTable,
    server_id: i64,
    role_id: i64,
) -> Result<TreeNode, ApiError> {
    let records = conn
        .role_nodes(&state.templates, catalog, Some(role_id))
        .await
        .map_err(|err| {
            internal(format!(
                "Error fetching the roles information from the database server!\n{}",
                err
            ))
        })?;

    records
        .first()
        .map(|record| TreeNode::role(record, server_id))
        .ok_or_else(|| gone("Couldn't find the role information!"))
}

async fn list(
    State(state): State<AppState>,
    Path((gid, sid)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.list", request_id, sid);

    instrumented(ROLES, "GET", &request_id, span, async move {
        check_secret(&state, &headers, Action::List)?;
        let (mut conn, ctx) = admit(&state, Action::List, gid, sid, None).await?;

        let records = conn
            .role_records(&state.templates, ctx.catalog, None)
            .await
            .map_err(|err| {
                internal(format!(
                    "Error fetching the roles from the database server!\n{}",
                    err
                ))
            })?;

        Ok(Json(
            records
                .into_iter()
                .map(transform_role)
                .collect::<Vec<RoleProperties>>(),
        ))
    })
    .await
}

async fn properties(
    State(state): State<AppState>,
    Path((gid, sid, rid)): Path<(i64, i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.properties", request_id, sid, rid);

    instrumented(ROLE, "GET", &request_id, span, async move {
        check_secret(&state, &headers, Action::Properties)?;
        let (mut conn, ctx) = admit(&state, Action::Properties, gid, sid, Some(rid)).await?;

        let records = conn
            .role_records(&state.templates, ctx.catalog, Some(rid))
            .await
            .map_err(|err| {
                internal(format!(
                    "Error fetching the roles from the database server!\n{}",
                    err
                ))
            })?;

        let record = records
            .into_iter()
            .next()
            .ok_or_else(|| gone("Couldn't find the role information!"))?;
        Ok(Json(transform_role(record)))
    })
    .await
}

async fn nodes(
    State(state): State<AppState>,
    Path((gid, sid)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.nodes", request_id, sid);

    instrumented(NODES, "GET", &request_id, span, async move {
        check_secret(&state, &headers, Action::Nodes)?;
        let (mut conn, ctx) = admit(&state, Action::Nodes, gid, sid, None).await?;

        let records = conn
            .role_nodes(&state.templates, ctx.catalog, None)
            .await
            .map_err(|err| {
                internal(format!(
                    "Error fetching the roles information from the database server!\n{}",
                    err
                ))
            })?;

        Ok(envelope(
            records
                .iter()
                .map(|record| TreeNode::role(record, sid))
                .collect::<Vec<_>>(),
        ))
    })
    .await
}

async fn node(
    State(state): State<AppState>,
    Path((gid, sid, rid)): Path<(i64, i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.node", request_id, sid, rid);

    instrumented(NODE, "GET", &request_id, span, async move {
        check_secret(&state, &headers, Action::Node)?;
        let (mut conn, ctx) = admit(&state, Action::Node, gid, sid, Some(rid)).await?;
        let node = fetch_node(&state, &mut conn, ctx.catalog, sid, rid).await?;
        Ok(envelope(node))
    })
    .await
}

async fn create(
    State(state): State<AppState>,
    Path((gid, sid)): Path<(i64, i64)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.create", request_id, sid);

    instrumented(ROLES, "POST", &request_id, span, async move {
        let action = Action::Create;
        check_secret(&state, &headers, action)?;
        let raw = decode_payload(&headers, query.as_deref(), &body)
            .map_err(|err| reject(action, validation_error(err)))?;

        let (mut conn, ctx) = admit(&state, action, gid, sid, None).await?;
        let command = normalize(&raw, PayloadMode::Create, ctx.version)
            .map_err(|err| reject(action, validation_error(err)))?;

        let data = RoleSqlData::for_create(&command, &ctx.allowed);
        let sql = state
            .templates
            .create(ctx.bucket, &data, false)
            .map_err(|err| internal(format!("ERROR: Couldn't create the role!\n{}", err)))?;

        let executed = conn.execute_script(&sql).await;
        record_mutation(action, &executed);
        executed.map_err(|err| internal(format!("ERROR: Couldn't create the role!\n{}", err)))?;

        let oid = conn
            .role_oid_by_name(ctx.catalog, &data.target)
            .await
            .map_err(|err| {
                internal(format!(
                    "ERROR: Couldn't fetch the role information!\n{}",
                    err
                ))
            })?
            .ok_or_else(|| gone("Couldn't find the role information!"))?;

        tracing::info!(role_id = oid, "roles.created");
        let node = fetch_node(&state, &mut conn, ctx.catalog, sid, oid).await?;
        Ok(Json(NodeResponse { node }))
    })
    .await
}

async fn update(
    State(state): State<AppState>,
    Path((gid, sid, rid)): Path<(i64, i64, i64)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.update", request_id, sid, rid);

    instrumented(ROLE, "PUT", &request_id, span, async move {
        let action = Action::Update;
        check_secret(&state, &headers, action)?;
        let raw = decode_payload(&headers, query.as_deref(), &body)
            .map_err(|err| reject(action, validation_error(err)))?;

        let (mut conn, ctx) = admit(&state, action, gid, sid, Some(rid)).await?;
        let command = normalize(&raw, PayloadMode::Update, ctx.version)
            .map_err(|err| reject(action, validation_error(err)))?;
        let snapshot = ctx
            .snapshot
            .as_ref()
            .ok_or_else(|| gone("Couldn't find the specific role in the database server!"))?;

        let data = RoleSqlData::for_update(&command, snapshot, &ctx.allowed);
        let sql = state
            .templates
            .update(ctx.bucket, &data, snapshot, false)
            .map_err(|err| internal(format!("ERROR: Couldn't update the role!\n{}", err)))?;

        if !sql.trim().is_empty() {
            let executed = conn.execute_script(&sql).await;
            record_mutation(action, &executed);
            executed
                .map_err(|err| internal(format!("ERROR: Couldn't update the role!\n{}", err)))?;
            state.connections.forget_server_info(sid).await;
            tracing::info!("roles.updated");
        }

        let node = fetch_node(&state, &mut conn, ctx.catalog, sid, rid).await?;
        Ok(Json(NodeResponse { node }))
    })
    .await
}

async fn drop_role(
    State(state): State<AppState>,
    Path((gid, sid, rid)): Path<(i64, i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.drop", request_id, sid, rid);

    instrumented(ROLE, "DELETE", &request_id, span, async move {
        let action = Action::Drop;
        check_secret(&state, &headers, action)?;
        let (mut conn, ctx) = admit(&state, action, gid, sid, Some(rid)).await?;
        let snapshot = ctx
            .snapshot
            .ok_or_else(|| gone("Couldn't find the specific role in the database server!"))?;

        let dropped = conn.drop_role(&snapshot.name).await;
        record_mutation(action, &dropped);
        dropped.map_err(|err| internal(format!("ERROR: Couldn't drop the user!\n{}", err)))?;

        state.connections.forget_server_info(sid).await;
        tracing::info!("roles.dropped");
        Ok(envelope(serde_json::Value::Null))
    })
    .await
}

async fn sql(
    State(state): State<AppState>,
    Path((gid, sid, rid)): Path<(i64, i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.sql", request_id, sid, rid);

    instrumented(SQL, "GET", &request_id, span, async move {
        check_secret(&state, &headers, Action::Sql)?;
        let (mut conn, ctx) = admit(&state, Action::Sql, gid, sid, Some(rid)).await?;
        let failed = |err: DriverError| {
            internal(format!(
                "ERROR: Couldn't generate reversed engineered Query for the role/user!\n{}",
                err
            ))
        };

        let record = conn
            .role_records(&state.templates, ctx.catalog, Some(rid))
            .await
            .map_err(failed)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                gone("ERROR: Couldn't generate reversed engineered Query for the role/user!")
            })?;
        let variables = conn
            .role_variables(&state.templates, rid)
            .await
            .map_err(failed)?;

        let props = transform_role(record);
        let data = RoleSqlData::from_properties(&props, variables, &ctx.allowed);
        let script = state
            .templates
            .reverse_engineered(ctx.bucket, &data)
            .map_err(failed)?;
        Ok(Json(script))
    })
    .await
}

async fn msql_new(
    State(state): State<AppState>,
    Path((gid, sid)): Path<(i64, i64)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.msql", request_id, sid, NEW_ROLE_SENTINEL);

    instrumented(MSQL, "GET", &request_id, span, async move {
        preview(&state, &headers, query.as_deref(), &body, gid, sid, None).await
    })
    .await
}

async fn msql_existing(
    State(state): State<AppState>,
    Path((gid, sid, rid)): Path<(i64, i64, i64)>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.msql", request_id, sid, rid);

    instrumented(MSQL_ROLE, "GET", &request_id, span, async move {
        preview(&state, &headers, query.as_deref(), &body, gid, sid, Some(rid)).await
    })
    .await
}

/// Renders the statements a create or update would run, with passwords
/// masked. Nothing is executed.
async fn preview(
    state: &AppState,
    headers: &HeaderMap,
    query: Option<&str>,
    body: &[u8],
    group_id: i64,
    server_id: i64,
    role_id: Option<i64>,
) -> Result<Json<super::Envelope<String>>, ApiError> {
    let action = Action::Msql;
    check_secret(state, headers, action)?;
    let raw = decode_payload(headers, query, body)
        .map_err(|err| reject(action, validation_error(err)))?;

    let (_conn, ctx) = admit(state, action, group_id, server_id, role_id).await?;
    let mode = PayloadMode::for_role_id(role_id);
    let command =
        normalize(&raw, mode, ctx.version).map_err(|err| reject(action, validation_error(err)))?;

    let rendered = match (mode, ctx.snapshot.as_ref()) {
        (PayloadMode::Update, Some(snapshot)) => {
            let data = RoleSqlData::for_update(&command, snapshot, &ctx.allowed);
            state.templates.update(ctx.bucket, &data, snapshot, true)
        }
        (PayloadMode::Update, None) => {
            return Err(gone(
                "Couldn't find the specific role in the database server!",
            ));
        }
        (PayloadMode::Create, _) => {
            let data = RoleSqlData::for_create(&command, &ctx.allowed);
            state.templates.create(ctx.bucket, &data, true)
        }
    };

    let sql = rendered.map_err(|err| internal(err.to_string()))?;
    Ok(envelope(sql))
}

fn not_implemented(state: &AppState, headers: &HeaderMap, action: Action) -> Result<Json<()>, ApiError> {
    check_secret(state, headers, action)?;
    Err(json_error(
        StatusCode::NOT_IMPLEMENTED,
        "ERR_NOT_IMPLEMENTED",
        "Not implemented.",
    ))
}

async fn dependencies(
    State(state): State<AppState>,
    Path((_gid, sid, rid)): Path<(i64, i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.dependencies", request_id, sid, rid);

    instrumented(DEPENDENCIES, "GET", &request_id, span, async move {
        not_implemented(&state, &headers, Action::Dependencies)
    })
    .await
}

async fn dependents(
    State(state): State<AppState>,
    Path((_gid, sid, rid)): Path<(i64, i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.dependents", request_id, sid, rid);

    instrumented(DEPENDENTS, "GET", &request_id, span, async move {
        not_implemented(&state, &headers, Action::Dependents)
    })
    .await
}

async fn variables(
    State(state): State<AppState>,
    Path((gid, sid, rid)): Path<(i64, i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.variables", request_id, sid, rid);

    instrumented(VARIABLES, "GET", &request_id, span, async move {
        check_secret(&state, &headers, Action::Variables)?;
        let (mut conn, _ctx) = admit(&state, Action::Variables, gid, sid, Some(rid)).await?;

        let variables = conn
            .role_variables(&state.templates, rid)
            .await
            .map_err(|err| {
                internal(format!(
                    "Error fetching the variable information for the given role!\n{}",
                    err
                ))
            })?;
        Ok(envelope(variables))
    })
    .await
}

async fn voptions(
    State(state): State<AppState>,
    Path((gid, sid)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> Response {
    let request_id = extract_request_id(&headers);
    let span = role_span!("roles.voptions", request_id, sid);

    instrumented(VOPTIONS, "GET", &request_id, span, async move {
        check_secret(&state, &headers, Action::Voptions)?;
        let (mut conn, _ctx) = admit(&state, Action::Voptions, gid, sid, None).await?;

        let options = conn
            .variable_options(&state.templates)
            .await
            .map_err(|err| {
                internal(format!(
                    "Error fetching the variable options for role!\n{}",
                    err
                ))
            })?;
        Ok(envelope(options))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_server_is_gone_and_lost_sessions_are_preconditions() {
        let (status, body) = connection_error(DriverError::UnknownServer {
            group_id: 1,
            server_id: 9,
        });
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body.code, "ERR_NOT_FOUND");

        let (status, body) =
            connection_error(DriverError::ConnectionLost("reset by peer".to_string()));
        assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);
        assert_eq!(body.errormsg, "Connection to the server has been lost!");

        let (status, _) = connection_error(DriverError::Timeout);
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn validation_failures_are_precondition_required() {
        let (status, body) = validation_error(ValidationError::MissingField("name"));
        assert_eq!(status, StatusCode::PRECONDITION_REQUIRED);
        assert_eq!(body.code, "ERR_MISSING_FIELD");
        assert_eq!(body.errormsg, "Name is not provided!");
    }

    fn test_state(secret: Option<&str>) -> AppState {
        let mut kv = std::collections::HashMap::from([(
            "PGROLE_SERVER_1_DB_URL".to_string(),
            "postgres://postgres@127.0.0.1:1/postgres".to_string(),
        )]);
        if let Some(secret) = secret {
            kv.insert(
                "PGROLE_LOCAL_AUTH_SHARED_SECRET".to_string(),
                secret.to_string(),
            );
        }
        let config = crate::config::GatewayConfig::from_kv(&kv).unwrap();
        let connections = pgrole_driver::ConnectionManager::from_servers(
            &config.servers,
            config.pool_settings(),
        )
        .unwrap();
        AppState {
            config,
            connections,
            templates: std::sync::Arc::new(pgrole_driver::SqlTemplates::new()),
        }
    }

    #[tokio::test]
    async fn dependency_endpoints_are_not_implemented() {
        let state = test_state(None);
        for action in [Action::Dependencies, Action::Dependents] {
            assert!(!action.is_implemented());
            let (status, body) = not_implemented(&state, &HeaderMap::new(), action).unwrap_err();
            assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
            assert_eq!(body.code, "ERR_NOT_IMPLEMENTED");
        }
    }

    #[tokio::test]
    async fn shared_secret_is_checked_before_anything_else() {
        let state = test_state(Some("local-secret"));
        let (status, body) =
            not_implemented(&state, &HeaderMap::new(), Action::Dependencies).unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.code, "ERR_AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn unknown_server_is_rejected_before_connecting() {
        let state = test_state(None);
        let (status, body) = admit(&state, Action::List, 1, 42, None).await.unwrap_err();
        assert_eq!(status, StatusCode::GONE);
        assert_eq!(body.errormsg, "Could not find the specified server.");

        let (status, _) = admit(&state, Action::List, 2, 1, None).await.unwrap_err();
        assert_eq!(status, StatusCode::GONE);
    }

    async fn spawn_gateway() -> (
        std::net::SocketAddr,
        tokio::sync::oneshot::Sender<()>,
        tokio::task::JoinHandle<()>,
    ) {
        let config = crate::config::GatewayConfig::from_kv(&std::collections::HashMap::from([
            (
                "PGROLE_SERVER_1_DB_URL".to_string(),
                "postgres://postgres@127.0.0.1:1/postgres".to_string(),
            ),
            ("PGROLE_DB_CONNECT_TIMEOUT_MS".to_string(), "300".to_string()),
        ]))
        .unwrap();
        let app = crate::http::router(config).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });
        (addr, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn mutating_routes_are_served_over_http() {
        let (addr, shutdown, task) = spawn_gateway().await;
        let client = reqwest::Client::new();
        let roles_url = format!("http://{}/v1/groups/1/servers/1/roles", addr);
        let role_url = format!("{}/16390", roles_url);

        let malformed = client
            .post(&roles_url)
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), reqwest::StatusCode::PRECONDITION_REQUIRED);

        let requests = [
            client
                .post(&roles_url)
                .json(&serde_json::json!({"name": "app_reader"})),
            client
                .put(&role_url)
                .json(&serde_json::json!({"connectionLimit": 5})),
            client.delete(&role_url),
        ];
        for request in requests {
            let response = request
                .header(crate::http::REQUEST_ID_HEADER, "req-mutation")
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::PRECONDITION_REQUIRED);
            assert_eq!(
                response
                    .headers()
                    .get(crate::http::REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok()),
                Some("req-mutation")
            );
            let body = response.json::<serde_json::Value>().await.unwrap();
            assert_eq!(body["code"], serde_json::json!("ERR_CONNECTION_LOST"));
        }

        let _ = shutdown.send(());
        let _ = task.await;
    }

    #[test]
    fn route_table_is_rooted_under_the_server() {
        for route in [
            ROLES, ROLE, NODES, NODE, SQL, MSQL, MSQL_ROLE, DEPENDENCIES, DEPENDENTS, VARIABLES,
            VOPTIONS,
        ] {
            assert!(route.starts_with(ROLES));
        }
    }
}
