//! Redis store operations.
//!
//! Each operation is independent and idempotent. The cache is advisory:
//! callers on write paths log and swallow [`CacheError`], only the
//! cache-backed read endpoints surface store failures to clients.

use std::collections::HashMap;
use std::future::Future;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::codec;
use super::keys;

const SCAN_COUNT: usize = 100;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("cached value is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Result of a lock-guarded critical section.
///
/// `Skipped` is expected concurrent-process behavior, not an error.
#[derive(Debug)]
pub enum LockOutcome<T> {
    Completed(T),
    Skipped,
}

impl<T> LockOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Skipped => None,
        }
    }

    pub fn was_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }
}

/// Per-item accounting for batched writes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Redis-backed cache store over a multiplexed connection.
///
/// Cloning is cheap; the underlying connection is shared.
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    // ========================================================================
    // Blob and hash writes
    // ========================================================================

    /// Writes one JSON blob per item at `{namespace}:{id}`.
    ///
    /// Items without a usable id are logged and skipped. All writes go out
    /// in one pipeline; if the pipeline fails, items are retried one by one
    /// so a single bad command cannot sink the whole batch.
    pub async fn set_items_to_cache(
        &self,
        namespace: &str,
        items: &[Value],
        id_field: &str,
        ttl_seconds: u64,
    ) -> Result<BatchOutcome, CacheError> {
        let mut outcome = BatchOutcome::default();
        let mut entries: Vec<(String, String)> = Vec::with_capacity(items.len());

        for item in items {
            let id = item.as_object().and_then(|obj| value_to_id(obj.get(id_field)));
            match id {
                Some(id) => entries.push((keys::item_key(namespace, &id), item.to_string())),
                None => {
                    warn!(
                        target = "cache::store::set_items_to_cache",
                        namespace,
                        id_field,
                        "item missing id field, skipped"
                    );
                    outcome.skipped += 1;
                }
            }
        }

        if entries.is_empty() {
            return Ok(outcome);
        }

        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        for (key, payload) in &entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(payload)
                .arg("EX")
                .arg(ttl_seconds)
                .ignore();
        }

        match pipe.query_async::<()>(&mut conn).await {
            Ok(()) => outcome.written += entries.len(),
            Err(err) => {
                warn!(
                    target = "cache::store::set_items_to_cache",
                    namespace,
                    error = %err,
                    "pipeline failed, retrying items individually"
                );
                for (key, payload) in &entries {
                    let write = redis::cmd("SET")
                        .arg(key)
                        .arg(payload)
                        .arg("EX")
                        .arg(ttl_seconds)
                        .query_async::<()>(&mut conn)
                        .await;
                    match write {
                        Ok(()) => outcome.written += 1,
                        Err(err) => {
                            warn!(
                                target = "cache::store::set_items_to_cache",
                                key,
                                error = %err,
                                "item write failed"
                            );
                            outcome.failed += 1;
                        }
                    }
                }
            }
        }

        info!(
            target = "cache::store::set_items_to_cache",
            namespace,
            written = outcome.written,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "blob batch written"
        );
        Ok(outcome)
    }

    /// Flattens one object into a single hash at `{namespace}:{id}`.
    ///
    /// Returns `false` when the object has no usable id (logged, nothing
    /// written). The hash write and its TTL go out in the same pipeline.
    pub async fn set_flattened_object_to_hash(
        &self,
        namespace: &str,
        obj: &Map<String, Value>,
        id_field: &str,
        ttl_seconds: u64,
    ) -> Result<bool, CacheError> {
        let Some(id) = value_to_id(obj.get(id_field)) else {
            warn!(
                target = "cache::store::set_flattened_object_to_hash",
                namespace,
                id_field,
                "object missing id field, skipped"
            );
            return Ok(false);
        };

        let key = keys::item_key(namespace, &id);
        let fields: Vec<(String, String)> = codec::flatten(obj).into_iter().collect();
        if fields.is_empty() {
            return Ok(false);
        }

        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, ttl_seconds as i64)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(true)
    }

    /// Writes one hash per child of each parent at
    /// `{parent_ns}:{parent_id}:{child_ns}:{child_id}`.
    ///
    /// Existing child hashes under a parent are pattern-deleted first so a
    /// child removed at the source leaves no orphan. One parent failing is
    /// logged and the batch continues.
    #[allow(clippy::too_many_arguments)]
    pub async fn cache_nested_objects_to_hashes(
        &self,
        parent_ns: &str,
        parents: &[Value],
        parent_id_field: &str,
        child_list_field: &str,
        child_ns: &str,
        child_id_field: &str,
        ttl_seconds: u64,
    ) -> Result<BatchOutcome, CacheError> {
        let mut outcome = BatchOutcome::default();
        let mut conn = self.conn();

        for parent in parents {
            let Some(parent_obj) = parent.as_object() else {
                outcome.skipped += 1;
                continue;
            };
            let Some(parent_id) = value_to_id(parent_obj.get(parent_id_field)) else {
                warn!(
                    target = "cache::store::cache_nested_objects_to_hashes",
                    parent_ns,
                    parent_id_field,
                    "parent missing id field, skipped"
                );
                outcome.skipped += 1;
                continue;
            };

            let result = self
                .cache_children_of_parent(
                    &mut conn,
                    parent_ns,
                    &parent_id,
                    parent_obj,
                    child_list_field,
                    child_ns,
                    child_id_field,
                    ttl_seconds,
                )
                .await;

            match result {
                Ok(()) => outcome.written += 1,
                Err(err) => {
                    warn!(
                        target = "cache::store::cache_nested_objects_to_hashes",
                        parent_ns,
                        parent_id,
                        error = %err,
                        "parent caching failed, continuing batch"
                    );
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    async fn cache_children_of_parent(
        &self,
        conn: &mut MultiplexedConnection,
        parent_ns: &str,
        parent_id: &str,
        parent: &Map<String, Value>,
        child_list_field: &str,
        child_ns: &str,
        child_id_field: &str,
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        // Drop stale children before rewriting the surviving set.
        self.delete_keys_by_pattern(&keys::children_pattern(parent_ns, parent_id, child_ns))
            .await?;

        let children = parent
            .get(child_list_field)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        if children.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        let mut queued = 0usize;
        for child in children {
            let Some(child_obj) = child.as_object() else {
                continue;
            };
            let Some(child_id) = value_to_id(child_obj.get(child_id_field)) else {
                warn!(
                    target = "cache::store::cache_nested_objects_to_hashes",
                    parent_ns,
                    parent_id,
                    child_id_field,
                    "child missing id field, skipped"
                );
                continue;
            };

            let key = keys::child_key(parent_ns, parent_id, child_ns, &child_id);
            let fields = codec::child_hash_fields(child_obj);
            if fields.is_empty() {
                continue;
            }
            pipe.hset_multiple(&key, &fields)
                .ignore()
                .expire(&key, ttl_seconds as i64)
                .ignore();
            queued += 1;
        }

        if queued > 0 {
            pipe.query_async::<()>(conn).await?;
        }
        Ok(())
    }

    /// Merges stringified fields into an existing or new hash and refreshes
    /// its TTL, in one pipeline.
    pub async fn merge_hash_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.hset_multiple(key, fields)
            .ignore()
            .expire(key, ttl_seconds as i64)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Writes or merges one nested child hash.
    pub async fn write_child_hash(
        &self,
        key: &str,
        child: &Map<String, Value>,
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        self.merge_hash_fields(key, &codec::child_hash_fields(child), ttl_seconds)
            .await
    }

    /// Atomically replaces a list: `DEL`, `RPUSH`, `EXPIRE` in one pipeline.
    ///
    /// Empty input only deletes; an empty dataset clears the cache rather
    /// than caching an empty list.
    pub async fn update_list_cache(
        &self,
        key: &str,
        values: &[String],
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.del(key).ignore();
        if !values.is_empty() {
            pipe.rpush(key, values)
                .ignore()
                .expire(key, ttl_seconds as i64)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Deletes every key matching `pattern` via cursor SCAN, never a
    /// blocking full-keyspace KEYS. Returns the number of keys removed.
    pub async fn delete_keys_by_pattern(&self, pattern: &str) -> Result<u64, CacheError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;

            if !batch.is_empty() {
                let () = conn.del(&batch).await?;
                deleted += batch.len() as u64;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(
            target = "cache::store::delete_keys_by_pattern",
            pattern, deleted, "pattern delete complete"
        );
        Ok(deleted)
    }

    // ========================================================================
    // Distributed lock
    // ========================================================================

    /// Runs `task` under a store-wide lock acquired with `SET NX EX`.
    ///
    /// Contention returns [`LockOutcome::Skipped`]. The lock is released
    /// best effort after the task; the TTL covers a crashed holder.
    pub async fn execute_with_lock<F, Fut, T>(
        &self,
        name: &str,
        lock_ttl_seconds: u64,
        task: F,
    ) -> Result<LockOutcome<T>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = keys::lock_key(name);
        let token = Uuid::new_v4().to_string();
        let mut conn = self.conn();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(lock_ttl_seconds)
            .query_async(&mut conn)
            .await?;

        if acquired.is_none() {
            info!(
                target = "cache::store::execute_with_lock",
                lock = %key,
                "lock held elsewhere, skipped"
            );
            return Ok(LockOutcome::Skipped);
        }

        let value = task().await;

        // Compare-and-delete: a holder that outlived its TTL must not
        // release the lock a newer holder has since acquired.
        let release = redis::Script::new(
            r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
            "#,
        );
        match release
            .key(&key)
            .arg(&token)
            .invoke_async::<i64>(&mut conn)
            .await
        {
            Ok(0) => warn!(
                target = "cache::store::execute_with_lock",
                lock = %key,
                "lock expired before release, another holder may have run concurrently"
            ),
            Ok(_) => {}
            Err(err) => warn!(
                target = "cache::store::execute_with_lock",
                lock = %key,
                error = %err,
                "lock release failed, TTL will reclaim it"
            ),
        }

        Ok(LockOutcome::Completed(value))
    }

    // ========================================================================
    // Reverse-index sets
    // ========================================================================

    pub async fn add_to_set(
        &self,
        key: &str,
        member: &str,
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.sadd(key, member)
            .ignore()
            .expire(key, ttl_seconds as i64)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    pub async fn remove_from_set(
        &self,
        key: &str,
        member: &str,
        ttl_seconds: u64,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.srem(key, member)
            .ignore()
            .expire(key, ttl_seconds as i64)
            .ignore();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    /// Rebuilds one reverse-index set per user: `DEL`, `SADD`, `EXPIRE` in
    /// one pipeline each. A failing user is logged and the rest continue.
    pub async fn rebuild_user_index_sets(
        &self,
        prefix: &str,
        entries: &[(Uuid, Vec<String>)],
        ttl_seconds: u64,
    ) -> Result<BatchOutcome, CacheError> {
        let mut outcome = BatchOutcome::default();
        let mut conn = self.conn();

        for (user_id, members) in entries {
            let key = keys::index_key(prefix, *user_id);
            let mut pipe = redis::pipe();
            pipe.del(&key).ignore();
            if !members.is_empty() {
                pipe.sadd(&key, members)
                    .ignore()
                    .expire(&key, ttl_seconds as i64)
                    .ignore();
            }
            match pipe.query_async::<()>(&mut conn).await {
                Ok(()) => outcome.written += 1,
                Err(err) => {
                    warn!(
                        target = "cache::store::rebuild_user_index_sets",
                        key,
                        error = %err,
                        "index rebuild failed for user, continuing"
                    );
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn hash_exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn();
        Ok(conn.exists(key).await?)
    }

    pub async fn read_hash(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.conn();
        Ok(conn.hgetall(key).await?)
    }

    /// HMGET: selected fields in request order, `None` for absent fields.
    pub async fn read_hash_fields(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<String>>, CacheError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    /// Pipelined HGETALL over many keys; absent keys yield empty maps.
    pub async fn read_hashes(
        &self,
        hash_keys: &[String],
    ) -> Result<Vec<HashMap<String, String>>, CacheError> {
        if hash_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        for key in hash_keys {
            pipe.hgetall(key);
        }
        Ok(pipe.query_async(&mut conn).await?)
    }

    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            found.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(found)
    }

    pub async fn read_blob(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    pub async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn();
        Ok(conn.smembers(key).await?)
    }

    pub async fn pop_list_head(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn();
        Ok(conn.lpop(key, None).await?)
    }

    pub async fn delete_key(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn();
        let () = conn.del(key).await?;
        Ok(())
    }
}

/// Extracts a non-empty string id from a JSON field value.
fn value_to_id(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_to_id_accepts_strings_and_numbers() {
        assert_eq!(value_to_id(Some(&json!("abc"))), Some("abc".to_string()));
        assert_eq!(value_to_id(Some(&json!(42))), Some("42".to_string()));
        assert_eq!(value_to_id(Some(&json!(""))), None);
        assert_eq!(value_to_id(Some(&json!(null))), None);
        assert_eq!(value_to_id(None), None);
    }

    #[test]
    fn lock_outcome_accessors() {
        let done: LockOutcome<u32> = LockOutcome::Completed(7);
        assert_eq!(done.completed(), Some(7));

        let skipped: LockOutcome<u32> = LockOutcome::Skipped;
        assert!(skipped.was_skipped());
        assert_eq!(skipped.completed(), None);
    }
}
