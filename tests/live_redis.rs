//! Live Redis store tests against a running Redis instance.
//!
//! - Marked `#[ignore]` so they only run when a Redis node is available.
//! - Reads the connection URL from `QUADERNO_TEST_REDIS_URL`, falling back
//!   to the local default.
//! - Each test works under a unique namespace, so leftovers from aborted
//!   runs cannot poison later ones.

use std::time::Duration;

use serde_json::{Map, Value, json};
use serial_test::serial;
use uuid::Uuid;

use quaderno::cache::store::{LockOutcome, RedisStore};
use quaderno::cache::{codec, keys};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

async fn live_store() -> TestResult<RedisStore> {
    let url = std::env::var("QUADERNO_TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = redis::Client::open(url.as_str())?;
    let connection = client.get_multiplexed_async_connection().await?;
    Ok(RedisStore::new(connection))
}

fn test_namespace(label: &str) -> String {
    format!("test_{label}_{}", Uuid::new_v4().simple())
}

#[tokio::test]
#[serial]
#[ignore]
async fn lock_admits_exactly_one_concurrent_caller() -> TestResult<()> {
    let store = live_store().await?;
    let name = test_namespace("lock");

    let slow = store.execute_with_lock(&name, 30, || async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        "ran"
    });
    let contender = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.execute_with_lock(&name, 30, || async { "ran" }).await
    };

    let (first, second) = tokio::join!(slow, contender);
    assert!(matches!(first?, LockOutcome::Completed("ran")));
    assert!(second?.was_skipped());

    // The lock is released once the holder finishes.
    let third = store.execute_with_lock(&name, 30, || async { "ran" }).await?;
    assert!(matches!(third, LockOutcome::Completed("ran")));
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn stale_holder_does_not_release_a_newer_lock() -> TestResult<()> {
    let store = live_store().await?;
    let name = test_namespace("stale_lock");

    // The first holder's task outlives its 1s TTL, so a second caller
    // acquires the lock while the first is still running.
    let stale = store.execute_with_lock(&name, 1, || async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        "stale"
    });
    let successor = async {
        tokio::time::sleep(Duration::from_millis(1100)).await;
        store
            .execute_with_lock(&name, 30, || async {
                tokio::time::sleep(Duration::from_millis(600)).await;
                "successor"
            })
            .await
    };
    // Starts after the stale holder finishes; the successor still runs, so
    // its lock must still be in place.
    let contender = async {
        tokio::time::sleep(Duration::from_millis(1600)).await;
        store
            .execute_with_lock(&name, 30, || async { "contender" })
            .await
    };

    let (stale, successor, contender) = tokio::join!(stale, successor, contender);
    assert!(matches!(stale?, LockOutcome::Completed("stale")));
    assert!(matches!(successor?, LockOutcome::Completed("successor")));
    assert!(contender?.was_skipped());
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn empty_list_rebuild_clears_the_key() -> TestResult<()> {
    let store = live_store().await?;
    let key = test_namespace("emails");

    store
        .update_list_cache(
            &key,
            &["a@example.com".to_string(), "b@example.com".to_string()],
            60,
        )
        .await?;
    assert_eq!(
        store.pop_list_head(&key).await?,
        Some("a@example.com".to_string())
    );

    store.update_list_cache(&key, &[], 60).await?;
    assert_eq!(store.pop_list_head(&key).await?, None);
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn nested_rebuild_removes_orphaned_children() -> TestResult<()> {
    let store = live_store().await?;
    let parent_ns = test_namespace("session");
    let session_id = Uuid::new_v4().to_string();

    let two_children = vec![json!({
        "id": session_id,
        "question_results": [
            {"id": "qr-1", "score": 1.5},
            {"id": "qr-2", "score": 0.0},
        ],
    })];
    store
        .cache_nested_objects_to_hashes(
            &parent_ns,
            &two_children,
            "id",
            "question_results",
            "qresult",
            "id",
            60,
        )
        .await?;

    let pattern = keys::children_pattern(&parent_ns, &session_id, "qresult");
    assert_eq!(store.scan_keys(&pattern).await?.len(), 2);

    // qr-2 disappears from the source; the rebuild must evict its hash.
    let one_child = vec![json!({
        "id": session_id,
        "question_results": [{"id": "qr-1", "score": 1.5}],
    })];
    store
        .cache_nested_objects_to_hashes(
            &parent_ns,
            &one_child,
            "id",
            "question_results",
            "qresult",
            "id",
            60,
        )
        .await?;

    let remaining = store.scan_keys(&pattern).await?;
    assert_eq!(remaining.len(), 1);
    assert!(remaining[0].ends_with("qresult:qr-1"));

    store.delete_keys_by_pattern(&format!("{parent_ns}:*")).await?;
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn pattern_delete_covers_more_than_one_scan_page() -> TestResult<()> {
    let store = live_store().await?;
    let namespace = test_namespace("bulk");

    // 250 keys forces the SCAN cursor past its page size of 100.
    let items: Vec<Value> = (0..250)
        .map(|index| json!({"id": format!("item-{index}"), "payload": index}))
        .collect();
    let outcome = store.set_items_to_cache(&namespace, &items, "id", 60).await?;
    assert_eq!(outcome.written, 250);
    assert_eq!(outcome.failed, 0);

    let deleted = store
        .delete_keys_by_pattern(&format!("{namespace}:*"))
        .await?;
    assert_eq!(deleted, 250);
    assert!(store.scan_keys(&format!("{namespace}:*")).await?.is_empty());
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn flattened_hash_round_trips_through_codec() -> TestResult<()> {
    let store = live_store().await?;
    let namespace = test_namespace("info");

    let mut obj = Map::new();
    obj.insert("id".to_string(), json!("abc-123"));
    obj.insert("score".to_string(), json!(7.5));
    obj.insert("actual_end_time".to_string(), Value::Null);
    obj.insert(
        "student".to_string(),
        json!({"full_name": "Ada", "email": "ada@example.com"}),
    );

    assert!(store.set_flattened_object_to_hash(&namespace, &obj, "id", 60).await?);

    let key = keys::item_key(&namespace, "abc-123");
    let hash = store.read_hash(&key).await?;
    assert_eq!(hash.get("student__full_name").map(String::as_str), Some("Ada"));
    assert_eq!(hash.get("actual_end_time").map(String::as_str), Some("null"));
    assert_eq!(
        hash.get("actual_end_time").map(|raw| codec::parse_value(raw)),
        Some(Value::Null)
    );
    assert_eq!(
        hash.get("score").map(|raw| codec::parse_value(raw)),
        Some(json!(7.5))
    );

    store.delete_key(&key).await?;
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore]
async fn user_index_sets_rebuild_and_mutate() -> TestResult<()> {
    let store = live_store().await?;
    let prefix = test_namespace("user_idx");
    let user_id = Uuid::new_v4();
    let key = keys::index_key(&prefix, user_id);

    let entries = vec![(user_id, vec!["s-1".to_string(), "s-2".to_string()])];
    let outcome = store.rebuild_user_index_sets(&prefix, &entries, 60).await?;
    assert_eq!(outcome.written, 1);

    let mut members = store.set_members(&key).await?;
    members.sort();
    assert_eq!(members, vec!["s-1".to_string(), "s-2".to_string()]);

    store.add_to_set(&key, "s-3", 60).await?;
    store.remove_from_set(&key, "s-1", 60).await?;
    let mut members = store.set_members(&key).await?;
    members.sort();
    assert_eq!(members, vec!["s-2".to_string(), "s-3".to_string()]);

    store.delete_key(&key).await?;
    Ok(())
}
