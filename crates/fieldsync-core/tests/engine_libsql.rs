use std::sync::Arc;
use std::time::Duration;

use fieldsync_core::{
    EngineConfig, EntityType, Error, HostSpec, LibSqlConnector, ReadSource, RecordId, SyncBatch,
    SyncEngine, SyncRequest, SyncStatus, UserId,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

fn file_spec(dir: &TempDir, name: &str) -> HostSpec {
    HostSpec::new(format!("file:{}", dir.path().join(name).display()))
}

fn request(user_id: UserId, version: i64, data: serde_json::Value) -> SyncRequest {
    SyncRequest {
        id: RecordId::new(),
        user_id,
        entity_type: EntityType::parse("sample").unwrap(),
        data,
        version,
    }
}

async fn engine(dir: &TempDir) -> SyncEngine {
    let mut config = EngineConfig::new(file_spec(dir, "primary.db"))
        .with_replicas(vec![file_spec(dir, "replica.db")]);
    config.max_concurrent_writes = 2;
    config.writer.retry_base = Duration::from_millis(10);
    SyncEngine::connect(config, Arc::new(LibSqlConnector::new()))
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_lifecycle_on_libsql() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    let user = UserId::new();

    let batch = SyncBatch::new(vec![
        request(user, 1, json!({"ph": 6.8})),
        request(user, 1, json!({"ph": 7.1})),
        request(user, 3, json!({"ph": 5.9, "note": "creek bed"})),
    ]);
    let batch_id = batch.batch_id;
    let report = engine.submit_batch(batch.clone(), None).await.unwrap();
    assert_eq!(report.committed, 3);

    // Replaying the upload changes nothing
    let replay = engine.submit_batch(batch, None).await.unwrap();
    assert_eq!(replay.committed, 3);

    let status = engine.batch_status(&batch_id).await.unwrap();
    assert!(status.complete);
    assert_eq!(status.total, 3);
    // The replica has never seen a heartbeat, so reads stay on the primary
    assert!(status.records.iter().all(|r| r.source == ReadSource::Primary));

    engine.heartbeat().await.unwrap();
    engine.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn version_conflict_on_libsql() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir).await;
    let original = request(UserId::new(), 5, json!({"count": 12}));
    let id = original.id;
    engine
        .submit_record(original.clone(), None, None)
        .await
        .unwrap();

    let mut rival = original.clone();
    rival.data = json!({"count": 13});
    let err = engine.submit_record(rival, None, None).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { stored_version: 5, .. }));

    let conflicted = engine.record_status(&id).await.unwrap();
    assert_eq!(conflicted.status, SyncStatus::Conflict);
    assert_eq!(conflicted.version, 5);

    let mut newer = original;
    newer.version = 6;
    newer.data = json!({"count": 14});
    engine.submit_record(newer, None, None).await.unwrap();

    let settled = engine.record_status(&id).await.unwrap();
    assert_eq!(settled.status, SyncStatus::Committed);
    assert_eq!(settled.version, 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_primary_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let missing = HostSpec::new(format!(
        "file:{}",
        dir.path().join("no-such-dir").join("primary.db").display()
    ));
    let result = SyncEngine::connect(EngineConfig::new(missing), Arc::new(LibSqlConnector::new())).await;
    assert!(matches!(result, Err(Error::Connection { .. })));
}
