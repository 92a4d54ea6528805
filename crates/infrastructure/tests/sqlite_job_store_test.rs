use std::sync::Arc;
use std::time::Duration;

use jobforge_core::config::{PersistenceBackend, PersistenceConfig};
use jobforge_domain::{Job, JobStatus, JobStore, PriorityTier};
use jobforge_infrastructure::database::{create_job_store, SqliteDatabase, SqliteJobStore};
use jobforge_infrastructure::job_registry::JobRegistry;
use jobforge_testing_utils::JobBuilder;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// 在临时目录中创建SQLite数据库
async fn setup_test_database() -> (TempDir, SqliteDatabase) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("jobs.db").display());
    let database = SqliteDatabase::connect(&url, 2).await.unwrap();
    database.migrate().await.unwrap();
    (dir, database)
}

fn sample_job() -> Job {
    JobBuilder::new("transcode")
        .with_tier(PriorityTier::High)
        .with_tenant("studio")
        .with_estimate(Duration::from_secs(12))
        .with_timeout(Duration::from_secs(60))
        .with_payload(serde_json::json!({"input": "a.mov", "preset": "h264"}))
        .build()
}

#[tokio::test]
async fn test_sqlite_round_trip_preserves_every_field() {
    let (_dir, database) = setup_test_database().await;
    let store = SqliteJobStore::new(database.pool().clone());

    let mut job = sample_job();
    job.mark_running().unwrap();
    job.begin_attempt().unwrap();
    job.complete(serde_json::json!({"frames": 1200, "quality": 0.93})).unwrap();
    store.save(&job).await.unwrap();

    let loaded = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(loaded, job);
}

#[tokio::test]
async fn test_sqlite_ignores_stale_revisions() {
    let (_dir, database) = setup_test_database().await;
    let store = SqliteJobStore::new(database.pool().clone());

    let stale = sample_job();
    let mut fresh = stale.clone();
    fresh.mark_running().unwrap();

    store.save(&fresh).await.unwrap();
    store.save(&stale).await.unwrap();

    let loaded = store.find_by_id(fresh.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, JobStatus::Running);
    assert_eq!(loaded.revision, fresh.revision);
}

#[tokio::test]
async fn test_sqlite_load_all_and_delete() {
    let (_dir, database) = setup_test_database().await;
    let store = SqliteJobStore::new(database.pool().clone());

    let first = JobBuilder::new("a")
        .with_submitted_at(chrono::Utc::now() - chrono::Duration::seconds(10))
        .build();
    let second = JobBuilder::new("b").build();
    store.save(&second).await.unwrap();
    store.save(&first).await.unwrap();

    let all = store.load_all().await.unwrap();
    assert_eq!(
        all.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![first.id, second.id]
    );

    assert!(store.delete(first.id).await.unwrap());
    assert!(!store.delete(first.id).await.unwrap());
    assert_eq!(store.load_all().await.unwrap().len(), 1);
    database.health_check().await.unwrap();
    database.close().await;
}

#[tokio::test]
async fn test_registry_writes_through_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let config = PersistenceConfig {
        backend: PersistenceBackend::Sqlite,
        url: format!("sqlite://{}", dir.path().join("registry.db").display()),
        max_connections: 2,
    };
    let store: Arc<dyn JobStore> = create_job_store(&config).await.unwrap();
    let registry = JobRegistry::new(store.clone());

    let job = registry.register(sample_job()).await.unwrap();
    registry
        .begin_dispatch(job.id, CancellationToken::new())
        .await
        .unwrap();
    registry
        .update(job.id, |tracked| tracked.job.begin_attempt())
        .await
        .unwrap();

    let persisted = store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(persisted.status, JobStatus::Running);
    assert_eq!(persisted.attempt_count, 1);

    // 重新打开同一个数据库文件，记录仍然存在
    let reopened = create_job_store(&config).await.unwrap();
    let reloaded = reopened.load_all().await.unwrap();
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded[0].id, job.id);
}
