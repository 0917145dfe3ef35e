//! Pipeline activity survives being written to a `sled`-backed store.

use std::sync::Arc;

use dispatch_core::config::PipelineConfig;
use dispatch_core::pipeline::{AnalyticsSource, Pipeline, RawSnapshot, UserActivity};

struct EmptySource;

#[async_trait::async_trait]
impl AnalyticsSource for EmptySource {
    async fn comprehensive_summary(&self, _user_id: &str) -> Result<RawSnapshot, String> {
        Err("no analytics source in this test".to_string())
    }
    async fn basic_summary(&self, _user_id: &str) -> Result<RawSnapshot, String> {
        Err("no analytics source in this test".to_string())
    }
}

#[tokio::test]
async fn interaction_activity_is_persisted_to_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(sled::open(dir.path()).unwrap());

    let pipeline = Pipeline::new(PipelineConfig::default(), Arc::new(EmptySource), Some(Arc::clone(&db)));
    pipeline.register_interaction("u_persist").await;

    let raw = db.get("activity:u_persist").unwrap().expect("activity should be persisted");
    let activity: UserActivity = serde_json::from_slice(&raw).unwrap();
    assert_eq!(activity.user_id, "u_persist");
}

#[tokio::test]
async fn a_fresh_pipeline_over_the_same_store_restores_activity() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(sled::open(dir.path()).unwrap());

    let first = Pipeline::new(PipelineConfig::default(), Arc::new(EmptySource), Some(Arc::clone(&db)));
    first.register_interaction("u_restart").await;

    let second = Pipeline::new(PipelineConfig::default(), Arc::new(EmptySource), Some(Arc::clone(&db)));
    second.start();
    // `spawn_restore` runs as a background task on `start()`; give it a tick.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let raw = db.get("activity:u_restart").unwrap().expect("activity should still be on disk");
    let activity: UserActivity = serde_json::from_slice(&raw).unwrap();
    assert_eq!(activity.user_id, "u_restart");

    second.stop();
}
