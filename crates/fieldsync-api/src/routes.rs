use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use fieldsync_core::{
    BatchId, BatchReport, BatchStatusView, EngineHealth, EntityType, RecordId, RecordStatusView,
    SyncBatch, SyncEngine, SyncRequest, SyncStatus, UserId, WriteOutcome,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    engine: Arc<SyncEngine>,
}

impl AppState {
    pub const fn new(config: Arc<AppConfig>, engine: Arc<SyncEngine>) -> Self {
        Self { config, engine }
    }
}

pub fn app_router(state: AppState) -> Router {
    let sync_routes = Router::new()
        .route("/sync/batches", post(submit_batch))
        .route("/sync/batches/{batch_id}", get(batch_status))
        .route("/sync/records", post(submit_record))
        .route("/sync/records/{id}", get(record_status));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .nest("/v1", sync_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    timestamp: i64,
    #[serde(flatten)]
    engine: EngineHealth,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        timestamp: Utc::now().timestamp(),
        engine: state.engine.health(),
    })
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.engine.metrics().render_prometheus(),
    )
}

async fn submit_batch(
    State(state): State<AppState>,
    Json(batch): Json<SyncBatch>,
) -> Result<Json<BatchReport>, AppError> {
    let records = batch.records.len();
    let report = state
        .engine
        .submit_batch(batch, Some(state.config.request_timeout))
        .await?;
    tracing::info!(
        endpoint = "sync_batches",
        batch_id = %report.batch_id,
        records,
        committed = report.committed,
        conflicts = report.conflicts,
        failed = report.failed,
        pending = report.pending,
        "Accepted sync batch"
    );
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
struct SubmitRecordRequest {
    id: RecordId,
    user_id: UserId,
    entity_type: EntityType,
    data: serde_json::Value,
    version: i64,
    #[serde(default)]
    batch_id: Option<BatchId>,
}

#[derive(Debug, Serialize)]
struct SubmitRecordResponse {
    id: RecordId,
    status: SyncStatus,
    version: i64,
    shard_id: u32,
    attempts: u32,
}

async fn submit_record(
    State(state): State<AppState>,
    Json(request): Json<SubmitRecordRequest>,
) -> Result<Json<SubmitRecordResponse>, AppError> {
    let incoming_version = request.version;
    let batch_id = request.batch_id;
    let sync_request = SyncRequest {
        id: request.id,
        user_id: request.user_id,
        entity_type: request.entity_type,
        data: request.data,
        version: request.version,
    };
    let receipt = state
        .engine
        .submit_record(sync_request, batch_id, Some(state.config.request_timeout))
        .await?;

    let version = match receipt.outcome {
        WriteOutcome::Replayed { stored_version } => stored_version,
        WriteOutcome::Inserted | WriteOutcome::Updated { .. } => incoming_version,
    };
    Ok(Json(SubmitRecordResponse {
        id: receipt.id,
        status: receipt.outcome.status(),
        version,
        shard_id: receipt.shard_id,
        attempts: receipt.attempts,
    }))
}

async fn record_status(
    State(state): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<Json<RecordStatusView>, AppError> {
    Ok(Json(state.engine.record_status(&id).await?))
}

async fn batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<BatchId>,
) -> Result<Json<BatchStatusView>, AppError> {
    Ok(Json(state.engine.batch_status(&batch_id).await?))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use fieldsync_core::{EngineConfig, MemoryConnector, MemoryHost, ReadSource};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    async fn state() -> (AppState, MemoryHost) {
        let connector = MemoryConnector::new();
        let primary = MemoryHost::new();
        let spec = connector.add_host("primary", primary.clone());
        let engine = SyncEngine::connect(EngineConfig::new(spec.clone()), Arc::new(connector))
            .await
            .unwrap();
        let config = AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            request_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(1),
            engine: EngineConfig::new(spec),
        };
        (AppState::new(Arc::new(config), Arc::new(engine)), primary)
    }

    fn record_request(version: i64, data: serde_json::Value) -> SubmitRecordRequest {
        SubmitRecordRequest {
            id: RecordId::new(),
            user_id: UserId::new(),
            entity_type: EntityType::parse("specimen").unwrap(),
            data,
            version,
            batch_id: None,
        }
    }

    #[tokio::test]
    async fn batch_submission_then_status() {
        let (state, primary) = state().await;
        let user_id = UserId::new();
        let batch = SyncBatch::new(vec![SyncRequest {
            id: RecordId::new(),
            user_id,
            entity_type: EntityType::parse("specimen").unwrap(),
            data: json!({"taxon": "Trilobita"}),
            version: 1,
        }]);
        let batch_id = batch.batch_id;
        let id = batch.records[0].id;

        let Json(report) = submit_batch(State(state.clone()), Json(batch)).await.unwrap();
        assert_eq!(report.committed, 1);
        assert_eq!(primary.len(), 1);

        let Json(view) = record_status(State(state.clone()), Path(id)).await.unwrap();
        assert_eq!(view.status, SyncStatus::Committed);
        assert_eq!(view.source, ReadSource::Primary);

        let Json(batch_view) = batch_status(State(state), Path(batch_id)).await.unwrap();
        assert!(batch_view.complete);
    }

    #[tokio::test]
    async fn conflicting_record_is_409() {
        let (state, _) = state().await;
        let first = record_request(5, json!({"note": "original"}));
        let rival = SubmitRecordRequest {
            id: first.id,
            user_id: first.user_id,
            ..record_request(5, json!({"note": "rival"}))
        };

        let Json(accepted) = submit_record(State(state.clone()), Json(first)).await.unwrap();
        assert_eq!(accepted.status, SyncStatus::Committed);
        assert_eq!(accepted.version, 5);

        let err = submit_record(State(state), Json(rival)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn record_claimed_by_another_user_is_409() {
        let (state, _) = state().await;
        let first = record_request(1, json!({"note": "mine"}));
        let foreign = SubmitRecordRequest {
            id: first.id,
            ..record_request(2, json!({"note": "theirs"}))
        };

        submit_record(State(state.clone()), Json(first)).await.unwrap();
        let err = submit_record(State(state), Json(foreign)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_record_is_404() {
        let (state, _) = state().await;
        let err = record_status(State(state), Path(RecordId::new()))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_batch_is_400() {
        let (state, _) = state().await;
        let err = submit_batch(State(state), Json(SyncBatch::new(Vec::new())))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn metrics_and_health_report_engine_state() {
        let (state, _) = state().await;
        submit_record(State(state.clone()), Json(record_request(1, json!({}))))
            .await
            .unwrap();

        let text = state.engine.metrics().render_prometheus();
        assert!(text.contains("fieldsync_write_attempts_total"));
        let response = metrics(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let Json(health) = healthz(State(state)).await;
        let body = serde_json::to_value(&health).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["breaker"]["state"], "closed");
    }
}
