//! Runs against a real database when `TEST_DATABASE_URL` is set.

use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use common::error::AppError;
use db::{
    PgStore, Store,
    dtos::{
        key::{KeyCreateRequest, KeyRef},
        ledger::ResetGate,
    },
};
use uuid::Uuid;

async fn store() -> Option<PgStore> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let pool = db::setup(&url, 20).await.expect("test database");
    Some(PgStore::new(pool))
}

async fn manual_key(store: &PgStore, limit: f64) -> (Uuid, KeyRef) {
    let project = format!("test-{}", Uuid::new_v4());
    let hash = Uuid::new_v4().to_string();
    let key = store
        .create_key(KeyCreateRequest {
            project: project.clone(),
            key_hash: hash.clone(),
            limit,
            valid_to: Utc::now() + TimeDelta::days(1),
            tags: vec!["x-voice:olga".into()],
            ip_white_list: String::new(),
            description: "integration".into(),
            external_id: None,
        })
        .await
        .unwrap();
    (
        key.id,
        KeyRef {
            project,
            hash,
            manual: true,
        },
    )
}

#[tokio::test]
async fn concurrent_reserves_admit_exactly_the_limit() {
    let Some(store) = store().await else {
        return;
    };
    let store = Arc::new(store);
    let (key_id, key_ref) = manual_key(&store, 50.0).await;

    let calls = (0..20).map(|_| {
        let store = store.clone();
        let key_ref = key_ref.clone();
        async move { store.reserve(&key_ref, "10.0.0.1", 5.0).await.unwrap() }
    });
    let results = futures::future::join_all(calls).await;

    assert_eq!(results.iter().filter(|r| r.admitted).count(), 10);
    let key = store.get_key(key_id).await.unwrap();
    assert_eq!(key.quota_value, 50.0);
    assert_eq!(key.quota_value_failed, 50.0);
}

#[tokio::test]
async fn racing_ip_provisioning_creates_one_row() {
    let Some(store) = store().await else {
        return;
    };
    let store = Arc::new(store);
    let project = format!("ip-{}", Uuid::new_v4());

    let calls = (0..10).map(|_| {
        let store = store.clone();
        let project = project.clone();
        async move { store.check_create_ip_key(&project, "10.1.1.1", 1000.0).await.unwrap() }
    });
    let mut ids = futures::future::join_all(calls).await;
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn grants_and_restores() {
    let Some(store) = store().await else {
        return;
    };
    let (key_id, key_ref) = manual_key(&store, 100.0).await;

    let first = store.grant_credits(key_id, "op-1", 50.0, "topup").await.unwrap();
    let second = store.grant_credits(key_id, "op-1", 80.0, "topup").await.unwrap();
    assert!(first.applied());
    assert!(!second.applied());
    assert_eq!(second.key().quota_limit, 150.0);

    store.reserve(&key_ref, "ip", 10.0).await.unwrap();
    let balance = store.restore(&key_ref, 10.0).await.unwrap();
    assert_eq!(balance.remaining, 150.0);

    assert!(matches!(
        store.grant_credits(key_id, "op-2", -200.0, "fix").await,
        Err(AppError::Validation(_))
    ));
}

#[tokio::test]
async fn reset_gate_blocks_second_run() {
    let Some(store) = store().await else {
        return;
    };
    let project = format!("reset-{}", Uuid::new_v4());
    let now = Utc::now();
    let hour = Duration::from_secs(3600);

    assert!(matches!(
        store.begin_reset(&project, now, hour).await.unwrap(),
        ResetGate::Proceed { .. }
    ));
    assert!(matches!(
        store.begin_reset(&project, now, hour).await.unwrap(),
        ResetGate::InProgress { .. }
    ));
    store
        .finish_reset(&project, now + TimeDelta::days(30))
        .await
        .unwrap();
    assert!(matches!(
        store.begin_reset(&project, now, hour).await.unwrap(),
        ResetGate::Done { .. }
    ));
}

#[tokio::test]
async fn racing_resets_top_up_once() {
    let Some(store) = store().await else {
        return;
    };
    let store = Arc::new(store);
    let project = format!("reset-{}", Uuid::new_v4());
    let key_id = store.check_create_ip_key(&project, "10.2.2.2", 1000.0).await.unwrap();
    store.reserve(&KeyRef::ip(&project, "10.2.2.2"), "10.2.2.2", 300.0).await.unwrap();

    let now = Utc::now();
    let period_start = now - TimeDelta::days(1);
    let calls = (0..5).map(|_| {
        let store = store.clone();
        async move {
            let operation_id = Uuid::new_v4().to_string();
            store.reset_key(key_id, &operation_id, 1000.0, period_start, now).await.unwrap()
        }
    });
    let results = futures::future::join_all(calls).await;

    assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
    let key = store.get_key(key_id).await.unwrap();
    assert_eq!(key.quota_limit, 1300.0);
    assert_eq!(key.remaining(), 1000.0);
    assert_eq!(store.get_operations(key_id).await.unwrap().len(), 1);
}
