//! Per-instance tool-result cache.
//!
//! Keys are `SHA-256(tool_name || canonical(params))` truncated to 16
//! bytes. Parameters are canonicalized with stable key ordering before
//! hashing so that two JSON objects with the same content but different key
//! order hit the same entry.
//!
//! TTL semantics follow the skill's [`ToolCachePolicy`](crate::autoqa::skill::ToolCachePolicy):
//! `enabled = false` bypasses the cache entirely; `ttl_seconds > 0` expires
//! entries by age; `ttl_seconds = 0` means session-only — entries never age
//! out and are dropped with the owning instance (each instance owns its own
//! cache).

use crate::autoqa::skill::ToolCachePolicy;
use crate::autoqa::tool::ToolResult;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// Recursively re-serialize a JSON value with object keys sorted, so the
/// textual form is stable regardless of insertion order.
pub fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .iter()
                .map(|k| format!("{}:{}", serde_json::Value::String((*k).clone()), canonicalize(&map[*k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Hex form of the first 16 bytes of `SHA-256(tool || canonical(params))`.
pub fn cache_key(tool: &str, params: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update(canonicalize(params).as_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

struct CacheEntry {
    value: ToolResult,
    stored_at: DateTime<Utc>,
}

/// Thread-safe tool-result cache owned by a single agent instance.
#[derive(Default)]
pub struct ToolResultCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ToolResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a prior result for `(tool, params)` under `policy`.
    ///
    /// Misses when the policy is disabled, no entry exists, or a positive
    /// ttl has elapsed. Expired entries are evicted on the way out.
    pub fn get(
        &self,
        tool: &str,
        params: &serde_json::Value,
        policy: &ToolCachePolicy,
    ) -> Option<ToolResult> {
        if !policy.enabled {
            return None;
        }
        let key = cache_key(tool, params);
        let mut entries = self.entries.lock().ok()?;
        let hit = match entries.get(&key) {
            Some(entry) => {
                if policy.ttl_seconds == 0 {
                    true
                } else {
                    let age = Utc::now().signed_duration_since(entry.stored_at);
                    age.num_seconds() >= 0 && (age.num_seconds() as u64) <= policy.ttl_seconds
                }
            }
            None => return None,
        };
        if hit {
            entries.get(&key).map(|e| e.value.clone())
        } else {
            entries.remove(&key);
            None
        }
    }

    /// Store a result under `(tool, params)` when the policy allows it.
    pub fn put(
        &self,
        tool: &str,
        params: &serde_json::Value,
        value: ToolResult,
        policy: &ToolCachePolicy,
    ) {
        if !policy.enabled {
            return;
        }
        let key = cache_key(tool, params);
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key,
                CacheEntry {
                    value,
                    stored_at: Utc::now(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
