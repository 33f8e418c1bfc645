// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::engine::EngineResult;
use crate::error::VigilError;

/// Ceiling on the total size of matched events held in memory across all
/// dedup groups before the largest group is spilled early (§4.G).
pub const MAX_BYTES_IN_MEMORY: usize = 100_000_000;

/// Identifies one dedup group of matched events awaiting a flush (§3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub rule_id: String,
    pub log_type: String,
    pub dedup: String,
}

impl BufferKey {
    pub fn from_result(result: &EngineResult) -> Self {
        Self {
            rule_id: result.rule_id.clone(),
            log_type: result.log_type.clone(),
            dedup: result.dedup.clone(),
        }
    }
}

/// Metadata carried alongside a dedup group's buffered events, captured
/// from the first [`EngineResult`] that opened the group (§4.G "first match
/// wins" semantics for alert title/severity/version).
pub struct GroupMeta {
    pub rule_version: String,
    pub dedup_period_mins: u32,
    pub title: Option<String>,
    pub severity: Option<String>,
    pub output_ids: Vec<String>,
}

struct Group {
    events: Vec<Value>,
    bytes: usize,
    meta: GroupMeta,
}

/// Receives a flushed dedup group: merges it into an alert and writes the
/// matched events to the sink. Implemented by the Dispatcher's wiring so
/// the buffer itself stays free of AlertMerger/Sink concretions (§4.G,
/// §4.F) — the same trait-object seam the gateway-style orchestration in
/// this codebase uses elsewhere.
#[async_trait]
pub trait GroupFlusher: Send + Sync {
    async fn flush_group(
        &self,
        key: &BufferKey,
        meta: &GroupMeta,
        events: &[Value],
    ) -> Result<(), VigilError>;
}

/// Buffers matched events per dedup group in memory until a batch is
/// explicitly flushed, spilling the single largest group early if the
/// in-memory total would otherwise exceed [`MAX_BYTES_IN_MEMORY`] (§4.G).
pub struct MatchedEventsBuffer {
    groups: Mutex<HashMap<BufferKey, Group>>,
    total_bytes: AtomicUsize,
    flusher: Arc<dyn GroupFlusher>,
}

impl MatchedEventsBuffer {
    pub fn new(flusher: Arc<dyn GroupFlusher>) -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            total_bytes: AtomicUsize::new(0),
            flusher,
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Adds one matched [`EngineResult`] to its dedup group (§4.G). Byte
    /// accounting is a coarse per-result estimate: the shallow JSON size of
    /// the event, matching the original's "byte accounting is approximate
    /// by design" note (§9 Open Questions).
    pub async fn add_event(&self, result: EngineResult) -> Result<(), VigilError> {
        let key = BufferKey::from_result(&result);
        let event_bytes = serde_json::to_vec(&result.event)
            .map(|b| b.len())
            .unwrap_or(0);

        {
            let mut groups = self.groups.lock().await;
            let group = groups.entry(key).or_insert_with(|| Group {
                events: Vec::new(),
                bytes: 0,
                meta: GroupMeta {
                    rule_version: result.rule_version.clone(),
                    dedup_period_mins: result.dedup_period_mins,
                    title: result.title.clone(),
                    severity: result.severity.clone(),
                    output_ids: result.output_ids.clone(),
                },
            });
            group.events.push(result.event);
            group.bytes += event_bytes;
        }
        self.total_bytes.fetch_add(event_bytes, Ordering::Relaxed);

        if self.total_bytes() > MAX_BYTES_IN_MEMORY {
            self.spill_largest().await?;
        }

        Ok(())
    }

    async fn spill_largest(&self) -> Result<(), VigilError> {
        let (key, group) = {
            let mut groups = self.groups.lock().await;
            let Some(largest_key) = groups
                .iter()
                .max_by_key(|(_, g)| g.bytes)
                .map(|(k, _)| k.clone())
            else {
                return Ok(());
            };
            let group = groups.remove(&largest_key).expect("key came from iteration");
            (largest_key, group)
        };

        self.total_bytes.fetch_sub(group.bytes, Ordering::Relaxed);
        self.flush_one(&key, group).await
    }

    /// Flushes every remaining group. Called at the end of a batch (§4.H).
    pub async fn flush_all(&self) -> Result<(), VigilError> {
        let drained: Vec<(BufferKey, Group)> = {
            let mut groups = self.groups.lock().await;
            groups.drain().collect()
        };

        for (key, group) in drained {
            self.total_bytes.fetch_sub(group.bytes, Ordering::Relaxed);
            self.flush_one(&key, group).await?;
        }

        Ok(())
    }

    async fn flush_one(&self, key: &BufferKey, group: Group) -> Result<(), VigilError> {
        self.flusher
            .flush_group(key, &group.meta, &group.events)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct RecordingFlusher {
        calls: StdAtomicUsize,
    }

    #[async_trait]
    impl GroupFlusher for RecordingFlusher {
        async fn flush_group(
            &self,
            _key: &BufferKey,
            _meta: &GroupMeta,
            _events: &[Value],
        ) -> Result<(), VigilError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn result(rule_id: &str, event: Value) -> EngineResult {
        EngineResult {
            rule_id: rule_id.to_string(),
            rule_version: "1".to_string(),
            rule_tags: vec![],
            rule_reports: HashMap::new(),
            log_type: "LOG".to_string(),
            dedup: "d".to_string(),
            dedup_period_mins: 60,
            event,
            title: None,
            alert_context: None,
            severity: None,
            output_ids: vec![],
            error_message: None,
        }
    }

    #[tokio::test]
    async fn flush_all_drains_every_group() {
        let flusher = Arc::new(RecordingFlusher {
            calls: StdAtomicUsize::new(0),
        });
        let buffer = MatchedEventsBuffer::new(flusher.clone());
        buffer
            .add_event(result("a", serde_json::json!({"x": 1})))
            .await
            .unwrap();
        buffer
            .add_event(result("b", serde_json::json!({"x": 2})))
            .await
            .unwrap();

        buffer.flush_all().await.unwrap();
        assert_eq!(flusher.calls.load(Ordering::Relaxed), 2);
        assert_eq!(buffer.total_bytes(), 0);
    }

    #[tokio::test]
    async fn same_key_coalesces_into_one_group() {
        let flusher = Arc::new(RecordingFlusher {
            calls: StdAtomicUsize::new(0),
        });
        let buffer = MatchedEventsBuffer::new(flusher.clone());
        buffer
            .add_event(result("a", serde_json::json!({"x": 1})))
            .await
            .unwrap();
        buffer
            .add_event(result("a", serde_json::json!({"x": 2})))
            .await
            .unwrap();

        buffer.flush_all().await.unwrap();
        assert_eq!(flusher.calls.load(Ordering::Relaxed), 1);
    }
}
