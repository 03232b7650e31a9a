use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use kvmigrate_api::{MigrateResult, MigratorApi, StatusReport, API_CONTRACT_VERSION, APP_SCHEMA_VERSION};
use kvmigrate_core::{Edition, MigrationError};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: MigratorApi,
    target: String,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct VersionResponse {
    schema_version: String,
    replay_count: u32,
    edition: Edition,
    edition_name: &'static str,
    instance_id: String,
    app_schema_version: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct StatusQuery {
    target: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "kvmigrate-service")]
#[command(about = "Local HTTP service that migrates the store on startup and reports its version")]
struct Args {
    #[arg(long, default_value = "./kvmigrate.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    #[arg(long, default_value = APP_SCHEMA_VERSION)]
    target: String,
    #[arg(long, default_value = "community", value_parser = parse_edition)]
    edition: Edition,
}

fn parse_edition(raw: &str) -> Result<Edition, String> {
    Edition::parse(raw).ok_or_else(|| format!("unknown edition `{raw}`"))
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn internal(err: &anyhow::Error) -> ServiceError {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/version", get(version))
        .route("/v1/db/status", get(db_status))
        .with_state(state)
}

/// Bring the store up to the configured target. Serving must not start when this fails.
fn startup_migration(state: &ServiceState) -> Result<MigrateResult> {
    let result = state
        .api
        .migrate(&state.target, false)
        .with_context(|| format!("startup migration of {} failed", state.api.db_path().display()))?;
    info!(
        from = %result.current_version,
        to = ?result.after_version,
        executed = result.executed_steps.as_ref().map_or(0, Vec::len),
        "database ready"
    );
    Ok(result)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let state = ServiceState { api: MigratorApi::new(args.db, args.edition), target: args.target };
    if let Err(err) = startup_migration(&state) {
        error!(error = %format!("{err:#}"), "refusing to start");
        return Err(err);
    }

    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<HealthResponse>>, ServiceError> {
    let updating = state.api.is_updating().map_err(|err| ServiceState::internal(&err))?;
    if updating {
        return Err(ServiceState::error(
            StatusCode::SERVICE_UNAVAILABLE,
            "database migration is in progress or was interrupted",
        ));
    }
    Ok(Json(envelope(HealthResponse { status: "ready" })))
}

async fn version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<VersionResponse>>, ServiceError> {
    let record = state.api.current_version().map_err(|err| ServiceState::internal(&err))?;
    Ok(Json(envelope(VersionResponse {
        schema_version: record.schema_version,
        replay_count: record.replay_count,
        edition: record.edition,
        edition_name: record.edition.as_str(),
        instance_id: record.instance_id,
        app_schema_version: APP_SCHEMA_VERSION,
    })))
}

async fn db_status(
    State(state): State<ServiceState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<ServiceEnvelope<StatusReport>>, ServiceError> {
    let target = query.target.unwrap_or_else(|| state.target.clone());
    let status = state.api.status(&target).map_err(|err| {
        if is_invalid_target(&err) {
            ServiceState::error(StatusCode::BAD_REQUEST, format!("{err:#}"))
        } else {
            ServiceState::internal(&err)
        }
    })?;
    Ok(Json(envelope(status)))
}

fn is_invalid_target(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<MigrationError>())
        .any(MigrationError::is_invalid_target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use kvmigrate_core::ConnectionExt;
    use kvmigrate_store_sqlite::SqliteStore;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("kvmigrate-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn state_for(db_path: PathBuf) -> ServiceState {
        ServiceState {
            api: MigratorApi::new(db_path, Edition::Community),
            target: APP_SCHEMA_VERSION.to_string(),
        }
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        };
        let status = response.status();

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => (status, value),
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn data_str<'a>(value: &'a serde_json::Value, key: &str) -> Option<&'a str> {
        value.get("data").and_then(|data| data.get(key)).and_then(serde_json::Value::as_str)
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (status, value) = get_json(app(state_for(unique_temp_db_path())), "/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(data_str(&value, "status"), Some("ok"));
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn migrated_store_is_ready_and_reports_version() {
        let state = state_for(unique_temp_db_path());
        let migrated = startup_migration(&state)
            .unwrap_or_else(|err| panic!("startup migration failed: {err:#}"));
        assert_eq!(migrated.after_version.as_deref(), Some(APP_SCHEMA_VERSION));

        let (status, value) = get_json(app(state.clone()), "/v1/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(data_str(&value, "status"), Some("ready"));

        let (status, value) = get_json(app(state.clone()), "/v1/version").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(data_str(&value, "schema_version"), Some(APP_SCHEMA_VERSION));
        assert_eq!(data_str(&value, "edition_name"), Some("community"));

        let (status, value) = get_json(app(state), "/v1/db/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            value.get("data").and_then(|data| data.get("up_to_date")),
            Some(&serde_json::Value::Bool(true))
        );
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn failed_startup_migration_keeps_store_unready() {
        let db_path = unique_temp_db_path();
        {
            let store = SqliteStore::open(&db_path)
                .unwrap_or_else(|err| panic!("failed to open store: {err:#}"));
            store
                .put_typed("version", "DB_VERSION", &12_i64)
                .and_then(|()| store.put_typed("version", "EDITION", &1_i64))
                .and_then(|()| store.put_typed("version", "INSTANCE_ID", &"svc"))
                .unwrap_or_else(|err| panic!("failed to seed legacy keys: {err}"));
        }
        let state = state_for(db_path);

        let err = match startup_migration(&state) {
            Ok(result) => panic!("expected startup migration to fail, got {result:?}"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains("1.21.0"));

        let (status, value) = get_json(app(state.clone()), "/v1/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );

        let (status, _) = get_json(app(state), "/v1/health").await;
        assert_eq!(status, StatusCode::OK);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn status_rejects_invalid_target() {
        let (status, value) =
            get_json(app(state_for(unique_temp_db_path())), "/v1/db/status?target=latest").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(value.get("error").and_then(serde_json::Value::as_str).is_some());

        let (status, _) = get_json(app(state_for(unique_temp_db_path())), "/v1/version").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn unreadable_store_is_a_server_error() {
        let db_path = unique_temp_db_path();
        {
            let store = SqliteStore::open(&db_path)
                .unwrap_or_else(|err| panic!("failed to open store: {err:#}"));
            store
                .put_typed(
                    "version",
                    "VERSION",
                    &serde_json::json!({
                        "SchemaVersion": "garbage",
                        "MigratorCount": 0,
                        "Edition": 1,
                        "InstanceID": "svc"
                    }),
                )
                .unwrap_or_else(|err| panic!("failed to seed version record: {err}"));
        }
        let state = state_for(db_path);

        let (status, value) = get_json(app(state.clone()), "/v1/db/status").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|message| message.contains("garbage")));

        let (status, _) = get_json(app(state), "/v1/db/status?target=latest").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
