// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use async_trait::async_trait;
use dashmap::DashMap;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::VigilError;

/// How long an alert stays open to new matches before the next match
/// renews it instead of merging (§4.F). A match observing an
/// `alertCreationTime` older than `now - ALERT_MERGE_PERIOD_SECONDS` starts
/// a fresh alert under the same partition key rather than joining the
/// existing one.
pub const ALERT_MERGE_PERIOD_SECONDS: i64 = 3600;

/// The single item a partition key (`md5(rule_id + ":" + dedup)`) owns in
/// the key-value store (§4.F). `alert_count` is a monotonic counter bumped
/// once per renewal; the alert id exposed to callers is derived from it
/// (`md5(rule_id + ":" + alert_count + ":" + dedup)`) so a renewal always
/// gets a fresh identity while a merge keeps the current one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertItem {
    pub partition_key: String,
    pub rule_id: String,
    pub rule_version: String,
    pub dedup: String,
    pub log_types: Vec<String>,
    pub title: Option<String>,
    pub severity: Option<String>,
    pub alert_count: u64,
    pub event_count: u64,
    pub creation_time: i64,
    pub update_time: i64,
}

/// `(alert_id, creation_time, update_time)` returned after every merger
/// update (§3). `update_time >= creation_time` always holds (§8).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertInfo {
    pub alert_id: String,
    pub creation_time: i64,
    pub update_time: i64,
}

/// A request to conditionally create-or-renew the alert item for a
/// partition key (§4.F, first attempt).
pub struct CreateOrRenewRequest<'a> {
    pub partition_key: &'a str,
    pub rule_id: &'a str,
    pub rule_version: &'a str,
    pub dedup: &'a str,
    pub log_type: &'a str,
    pub title: Option<String>,
    pub severity: Option<String>,
    pub time: i64,
    pub num_matches: u64,
}

/// A request to merge into the existing alert item for a partition key
/// (§4.F, second attempt, taken only when the first attempt's condition
/// fails).
pub struct MergeRequest<'a> {
    pub partition_key: &'a str,
    pub log_type: &'a str,
    pub time: i64,
    pub num_matches: u64,
}

/// `alertCount`/`alertCreationTime` as read back after a merge, needed to
/// compute the alert id: a merge never changes `creation_time` (§4.F "merge
/// into existing").
pub struct AlertCounter {
    pub alert_count: u64,
    pub creation_time: i64,
}

/// The key-value store (outbound, §6) backing the alert merger. One item
/// per partition key; two conditional operations mirror the original's two
/// DynamoDB calls (`_update_alerts_conditionally`, `_update_alert` in
/// `original_source/.../alert_merger.py`).
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Conditional create-or-renew (§4.F, first attempt). Condition:
    /// `alertCreationTime < time - ALERT_MERGE_PERIOD_SECONDS` OR the item
    /// does not exist. On success, `alertCount` is atomically incremented
    /// (or set to 1 for a brand-new item) and every other attribute is
    /// overwritten with the values in `request`. Returns `Some(alert_count)`
    /// on success, `None` when the condition failed (the item exists and is
    /// still within its merge window — the caller falls through to `merge`).
    async fn create_or_renew(
        &self,
        request: CreateOrRenewRequest<'_>,
    ) -> Result<Option<u64>, VigilError>;

    /// Merge into an existing, still-open alert item (§4.F, second
    /// attempt): adds `num_matches` to `eventCount`, adds `log_type` to the
    /// `logTypes` set, and sets `alertUpdateTime = time`. Returns the
    /// current `alertCount`/`creation_time` so the caller can compute the
    /// alert id. Errors with [`VigilError::ConditionalCheckFailed`] if the
    /// item vanished between the failed create and this call — the caller
    /// does not retry further (§9 Design Notes: at most two attempts).
    async fn merge(&self, request: MergeRequest<'_>) -> Result<AlertCounter, VigilError>;
}

/// Merges matched rule outcomes into deduplicated alerts (§4.F).
pub struct AlertMerger<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> AlertMerger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The stable partition key for a rule/dedup pair: `md5(rule_id + ":" +
    /// dedup)` (§4.F). `spec.md`'s Open Questions call for adopting md5
    /// uniformly in place of the original's plain string concatenation
    /// (SPEC_FULL.md §7).
    pub fn partition_key(rule_id: &str, dedup: &str) -> String {
        md5_hex(&format!("{rule_id}:{dedup}"))
    }

    fn alert_id(rule_id: &str, alert_count: u64, dedup: &str) -> String {
        md5_hex(&format!("{rule_id}:{alert_count}:{dedup}"))
    }

    /// `update_get_alert_info` (§4.F): conditional create-or-renew, falling
    /// through to a merge-into-existing update exactly once on conflict.
    /// Implementations MUST NOT loop beyond this two-step sequence (§9
    /// Design Notes): a third attempt would break the at-most-one-winner
    /// guarantee the CAS is there to provide.
    pub async fn update_get_alert_info(
        &self,
        rule_id: &str,
        rule_version: &str,
        dedup: &str,
        log_type: &str,
        title: Option<String>,
        severity: Option<String>,
        time: i64,
        num_matches: u64,
    ) -> Result<AlertInfo, VigilError> {
        let partition_key = Self::partition_key(rule_id, dedup);

        let created = self
            .store
            .create_or_renew(CreateOrRenewRequest {
                partition_key: &partition_key,
                rule_id,
                rule_version,
                dedup,
                log_type,
                title,
                severity,
                time,
                num_matches,
            })
            .await?;

        if let Some(alert_count) = created {
            return Ok(AlertInfo {
                alert_id: Self::alert_id(rule_id, alert_count, dedup),
                creation_time: time,
                update_time: time,
            });
        }

        let counter = self
            .store
            .merge(MergeRequest {
                partition_key: &partition_key,
                log_type,
                time,
                num_matches,
            })
            .await?;

        Ok(AlertInfo {
            alert_id: Self::alert_id(rule_id, counter.alert_count, dedup),
            creation_time: counter.creation_time,
            update_time: time,
        })
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    // `Md5::finalize()` returns a `GenericArray<u8, U16>`, which has no
    // `LowerHex` impl of its own; hex-encode the bytes by hand.
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// HTTP-backed key-value store, mirroring the teacher's `HttpBackend`
/// (`crates/common/src/state/backends/http.rs`): conditional writes are
/// expressed as plain POSTs, with a non-2xx/409 response mapped to
/// [`VigilError::ConditionalCheckFailed`].
pub struct HttpKeyValueStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpKeyValueStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl KeyValueStore for HttpKeyValueStore {
    async fn create_or_renew(
        &self,
        request: CreateOrRenewRequest<'_>,
    ) -> Result<Option<u64>, VigilError> {
        #[derive(Serialize)]
        struct Body<'a> {
            partition_key: &'a str,
            rule_id: &'a str,
            rule_version: &'a str,
            dedup: &'a str,
            log_type: &'a str,
            title: Option<String>,
            severity: Option<String>,
            time: i64,
            num_matches: u64,
            merge_period_seconds: i64,
        }
        #[derive(Deserialize)]
        struct Response {
            alert_count: u64,
        }

        let response = self
            .client
            .post(format!("{}/alerts:createOrRenew", self.base_url))
            .json(&Body {
                partition_key: request.partition_key,
                rule_id: request.rule_id,
                rule_version: request.rule_version,
                dedup: request.dedup,
                log_type: request.log_type,
                title: request.title,
                severity: request.severity,
                time: request.time,
                num_matches: request.num_matches,
                merge_period_seconds: ALERT_MERGE_PERIOD_SECONDS,
            })
            .send()
            .await
            .map_err(|e| VigilError::SinkFailure(e.into()))?;

        match response.status().as_u16() {
            200 | 201 => {
                let body: Response = response
                    .json()
                    .await
                    .map_err(|e| VigilError::SinkFailure(e.into()))?;
                Ok(Some(body.alert_count))
            }
            409 => Ok(None),
            _ => Err(VigilError::SinkFailure(anyhow::anyhow!(
                "unexpected status {} from key-value store",
                response.status()
            ))),
        }
    }

    async fn merge(&self, request: MergeRequest<'_>) -> Result<AlertCounter, VigilError> {
        #[derive(Serialize)]
        struct Body<'a> {
            partition_key: &'a str,
            log_type: &'a str,
            time: i64,
            num_matches: u64,
        }
        #[derive(Deserialize)]
        struct Response {
            alert_count: u64,
            creation_time: i64,
        }

        let response = self
            .client
            .post(format!("{}/alerts:merge", self.base_url))
            .json(&Body {
                partition_key: request.partition_key,
                log_type: request.log_type,
                time: request.time,
                num_matches: request.num_matches,
            })
            .send()
            .await
            .map_err(|e| VigilError::SinkFailure(e.into()))?;

        if response.status() == 404 {
            return Err(VigilError::ConditionalCheckFailed);
        }

        let body: Response = response
            .error_for_status()
            .map_err(|e| VigilError::SinkFailure(e.into()))?
            .json()
            .await
            .map_err(|e| VigilError::SinkFailure(e.into()))?;

        Ok(AlertCounter {
            alert_count: body.alert_count,
            creation_time: body.creation_time,
        })
    }
}

/// In-memory key-value store for tests and the direct-test dispatch mode,
/// mirroring the teacher's `LocalBackend`. A single `DashMap` entry per
/// partition key holds the one `AlertItem` the real store would.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    items: DashMap<String, AlertItem>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition_key: &str) -> Option<AlertItem> {
        self.items.get(partition_key).map(|e| e.value().clone())
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn create_or_renew(
        &self,
        request: CreateOrRenewRequest<'_>,
    ) -> Result<Option<u64>, VigilError> {
        let stale_before = request.time - ALERT_MERGE_PERIOD_SECONDS;

        match self.items.entry(request.partition_key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get().creation_time < stale_before {
                    let alert_count = slot.get().alert_count + 1;
                    slot.insert(AlertItem {
                        partition_key: request.partition_key.to_string(),
                        rule_id: request.rule_id.to_string(),
                        rule_version: request.rule_version.to_string(),
                        dedup: request.dedup.to_string(),
                        log_types: vec![request.log_type.to_string()],
                        title: request.title,
                        severity: request.severity,
                        alert_count,
                        event_count: request.num_matches,
                        creation_time: request.time,
                        update_time: request.time,
                    });
                    Ok(Some(alert_count))
                } else {
                    Ok(None)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let alert_count = 1;
                slot.insert(AlertItem {
                    partition_key: request.partition_key.to_string(),
                    rule_id: request.rule_id.to_string(),
                    rule_version: request.rule_version.to_string(),
                    dedup: request.dedup.to_string(),
                    log_types: vec![request.log_type.to_string()],
                    title: request.title,
                    severity: request.severity,
                    alert_count,
                    event_count: request.num_matches,
                    creation_time: request.time,
                    update_time: request.time,
                });
                Ok(Some(alert_count))
            }
        }
    }

    async fn merge(&self, request: MergeRequest<'_>) -> Result<AlertCounter, VigilError> {
        let mut item = self
            .items
            .get_mut(request.partition_key)
            .ok_or(VigilError::ConditionalCheckFailed)?;
        item.event_count += request.num_matches;
        if !item.log_types.iter().any(|lt| lt == request.log_type) {
            item.log_types.push(request.log_type.to_string());
        }
        item.update_time = request.time;
        Ok(AlertCounter {
            alert_count: item.alert_count,
            creation_time: item.creation_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hex_is_32_lowercase_hex_chars() {
        // A 16-byte MD5 digest hex-encodes to exactly 32 lowercase hex
        // characters; guards against a regression to a non-hex (e.g. Debug
        // `[u8; 16]`-style) encoding of the raw `GenericArray`.
        let key = AlertMerger::<InMemoryKeyValueStore>::partition_key("rule.a", "dedup-key");
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn md5_hex_is_deterministic_and_input_sensitive() {
        let a = AlertMerger::<InMemoryKeyValueStore>::partition_key("rule.a", "dedup-key");
        let a_again = AlertMerger::<InMemoryKeyValueStore>::partition_key("rule.a", "dedup-key");
        let b = AlertMerger::<InMemoryKeyValueStore>::partition_key("rule.a", "other-key");
        assert_eq!(a, a_again);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn first_match_creates_alert_with_count_one() {
        let merger = AlertMerger::new(InMemoryKeyValueStore::new());
        let info = merger
            .update_get_alert_info("rule.a", "1", "dedup-key", "LOG_TYPE", None, None, 1_000, 1)
            .await
            .unwrap();
        assert_eq!(info.creation_time, 1_000);
        assert_eq!(info.update_time, 1_000);
    }

    #[tokio::test]
    async fn second_match_in_window_merges_and_keeps_alert_id() {
        let merger = AlertMerger::new(InMemoryKeyValueStore::new());
        let first = merger
            .update_get_alert_info("rule.a", "1", "dedup-key", "LOG_TYPE", None, None, 1_000, 1)
            .await
            .unwrap();
        let second = merger
            .update_get_alert_info("rule.a", "1", "dedup-key", "LOG_TYPE", None, None, 1_500, 1)
            .await
            .unwrap();
        assert_eq!(first.alert_id, second.alert_id);
        assert_eq!(second.creation_time, 1_000);
        assert_eq!(second.update_time, 1_500);
    }

    #[tokio::test]
    async fn match_crossing_an_hour_boundary_still_merges() {
        // Regression guard: the merge window slides from the alert's own
        // creation time, it is not a fixed clock-aligned bucket. Two matches
        // 100 seconds apart that straddle a wall-clock hour boundary must
        // still merge into the same alert.
        let merger = AlertMerger::new(InMemoryKeyValueStore::new());
        let first = merger
            .update_get_alert_info("rule.a", "1", "dedup-key", "LOG_TYPE", None, None, 3_550, 1)
            .await
            .unwrap();
        let second = merger
            .update_get_alert_info("rule.a", "1", "dedup-key", "LOG_TYPE", None, None, 3_650, 1)
            .await
            .unwrap();
        assert_eq!(first.alert_id, second.alert_id);
    }

    #[tokio::test]
    async fn match_after_window_renews_with_a_new_alert_id() {
        let merger = AlertMerger::new(InMemoryKeyValueStore::new());
        let first = merger
            .update_get_alert_info("rule.a", "1", "dedup-key", "LOG_TYPE", None, None, 0, 1)
            .await
            .unwrap();
        let second = merger
            .update_get_alert_info(
                "rule.a",
                "1",
                "dedup-key",
                "LOG_TYPE",
                None,
                None,
                ALERT_MERGE_PERIOD_SECONDS + 1,
                1,
            )
            .await
            .unwrap();
        assert_ne!(first.alert_id, second.alert_id);
        assert_eq!(second.creation_time, ALERT_MERGE_PERIOD_SECONDS + 1);
    }

    #[tokio::test]
    async fn merge_adds_num_matches_not_a_flat_increment() {
        let store = InMemoryKeyValueStore::new();
        let merger = AlertMerger::new(store);
        merger
            .update_get_alert_info("rule.a", "1", "dedup-key", "LOG_TYPE", None, None, 1_000, 3)
            .await
            .unwrap();
        merger
            .update_get_alert_info("rule.a", "1", "dedup-key", "LOG_TYPE", None, None, 1_500, 2)
            .await
            .unwrap();
        let partition_key = AlertMerger::<InMemoryKeyValueStore>::partition_key("rule.a", "dedup-key");
        let stored = merger.store.get(&partition_key).unwrap();
        assert_eq!(stored.event_count, 5);
    }

    #[tokio::test]
    async fn renewal_bumps_alert_count_in_the_stored_item() {
        let store = InMemoryKeyValueStore::new();
        let merger = AlertMerger::new(store);
        merger
            .update_get_alert_info("rule.a", "1", "dedup-key", "LOG_TYPE", None, None, 0, 1)
            .await
            .unwrap();
        merger
            .update_get_alert_info(
                "rule.a",
                "1",
                "dedup-key",
                "LOG_TYPE",
                None,
                None,
                ALERT_MERGE_PERIOD_SECONDS + 1,
                1,
            )
            .await
            .unwrap();
        let partition_key = AlertMerger::<InMemoryKeyValueStore>::partition_key("rule.a", "dedup-key");
        let stored = merger.store.get(&partition_key).unwrap();
        assert_eq!(stored.alert_count, 2);
    }
}
