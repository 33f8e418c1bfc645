// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

//! End-to-end coverage of both Dispatcher envelopes (§4.H), exercised
//! through the public API the way `src/bin/vigil.rs` itself calls it
//! rather than poking at module internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use vigil_common::buffer::{BufferKey, GroupFlusher, GroupMeta, MatchedEventsBuffer};
use vigil_common::catalog::LocalCatalogClient;
use vigil_common::dispatcher::{
    infer_log_type, run_direct_test, run_pipeline, DirectTestEvent, DirectTestRequest,
    PipelineNotification, PipelineRequest,
};
use vigil_common::engine::Engine;
use vigil_common::error::VigilError;
use vigil_common::registry::Registry;
use vigil_common::rule::RuleSpec;
use vigil_common::source::InMemoryEventSource;
use vigil_runtime::{Config as RuntimeConfig, Engine as RuntimeEngine};

fn test_runtime() -> RuntimeEngine {
    RuntimeEngine::builder(&RuntimeConfig::default())
        .expect("engine builder")
        .build()
}

fn rule_spec(id: &str, log_type: &str) -> RuleSpec {
    RuleSpec {
        id: id.to_string(),
        version_id: "1".to_string(),
        log_types: vec![log_type.to_string()],
        dedup_period_minutes: 60,
        severity: Some("LOW".to_string()),
        output_ids: vec![],
        tags: vec![],
        reports: HashMap::new(),
        // Not a valid component binary: exercises the compile-failure /
        // per-item-isolation path without needing a real Wasm toolchain.
        body: vec![0, 1, 2, 3],
    }
}

/// A rule that fails to compile produces a `genericError` result for every
/// event it would have run against, rather than aborting the whole
/// direct-test request (§4.H).
#[tokio::test]
async fn direct_test_isolates_a_compile_failure_per_rule() {
    let runtime = test_runtime();
    let request = DirectTestRequest {
        rules: vec![rule_spec("rule.one", "AWS.CLOUDTRAIL")],
        events: vec![
            DirectTestEvent {
                id: "evt-1".to_string(),
                data: json!({"eventName": "ConsoleLogin"}),
            },
            DirectTestEvent {
                id: "evt-2".to_string(),
                data: json!({"eventName": "CreateUser"}),
            },
        ],
    };

    let results = run_direct_test(&runtime, request).await;

    assert_eq!(results.len(), 2);
    for (result, expected_id) in results.iter().zip(["evt-1", "evt-2"]) {
        assert_eq!(result.id, expected_id);
        assert_eq!(result.rule_id, "rule.one");
        assert!(result.errored);
        assert!(result.generic_error.is_some());
        assert!(result.rule_output.is_none());
    }
}

/// Every `(event, rule)` pair gets its own result, preserving the request's
/// rule order within each event (§4.H).
#[tokio::test]
async fn direct_test_produces_one_result_per_event_rule_pair() {
    let runtime = test_runtime();
    let request = DirectTestRequest {
        rules: vec![
            rule_spec("rule.a", "AWS.CLOUDTRAIL"),
            rule_spec("rule.b", "AWS.CLOUDTRAIL"),
        ],
        events: vec![DirectTestEvent {
            id: "evt-1".to_string(),
            data: json!({}),
        }],
    };

    let results = run_direct_test(&runtime, request).await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].rule_id, "rule.a");
    assert_eq!(results[1].rule_id, "rule.b");
}

struct RecordingFlusher {
    calls: AtomicUsize,
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

/// With no rules registered for the inferred log type, the pipeline
/// envelope reads every notification but produces no matched-event groups,
/// and `flush_all` still runs to completion (§4.H).
#[tokio::test]
async fn pipeline_with_no_matching_rules_flushes_nothing() {
    let runtime = test_runtime();
    let catalog = Arc::new(LocalCatalogClient::new());
    let registry = Arc::new(Registry::new(runtime, catalog));
    let engine = Engine::new(registry);

    let source = InMemoryEventSource::new();
    source.put(
        "bucket",
        "rules/aws_cloudtrail/2026/file.json",
        b"{\"eventName\":\"ConsoleLogin\"}\n{\"eventName\":\"CreateUser\"}\n".to_vec(),
    );

    let flusher = Arc::new(RecordingFlusher {
        calls: AtomicUsize::new(0),
    });
    let buffer = MatchedEventsBuffer::new(flusher.clone());

    let request = PipelineRequest {
        notifications: vec![PipelineNotification {
            bucket: "bucket".to_string(),
            key: "rules/aws_cloudtrail/2026/file.json".to_string(),
        }],
    };

    run_pipeline(&engine, &source, &buffer, request)
        .await
        .expect("pipeline run");

    assert_eq!(flusher.calls.load(Ordering::Relaxed), 0);
}

/// A notification whose object can't be read, and one whose key can't be
/// parsed into a log type, are both skipped rather than aborting the rest
/// of the batch (§9 per-item isolation); a well-formed notification among
/// them still gets processed.
#[tokio::test]
async fn pipeline_skips_unreadable_and_unparseable_notifications() {
    let runtime = test_runtime();
    let catalog = Arc::new(LocalCatalogClient::new());
    let registry = Arc::new(Registry::new(runtime, catalog));
    let engine = Engine::new(registry);

    let source = InMemoryEventSource::new();
    source.put(
        "bucket",
        "rules/aws_cloudtrail/2026/file.json",
        b"{}\n".to_vec(),
    );

    let flusher = Arc::new(RecordingFlusher {
        calls: AtomicUsize::new(0),
    });
    let buffer = MatchedEventsBuffer::new(flusher.clone());

    let request = PipelineRequest {
        notifications: vec![
            PipelineNotification {
                bucket: "bucket".to_string(),
                key: "no-slash-file.json".to_string(),
            },
            PipelineNotification {
                bucket: "bucket".to_string(),
                key: "rules/aws_cloudtrail/2026/missing.json".to_string(),
            },
            PipelineNotification {
                bucket: "bucket".to_string(),
                key: "rules/aws_cloudtrail/2026/file.json".to_string(),
            },
        ],
    };

    let outcome = run_pipeline(&engine, &source, &buffer, request).await;

    assert!(outcome.is_ok());
    assert_eq!(flusher.calls.load(Ordering::Relaxed), 0);
}

#[test]
fn infer_log_type_is_exposed_for_the_pipeline_envelope() {
    assert_eq!(
        infer_log_type("rules/aws_cloudtrail/2026/file.json"),
        Some("2026".to_string())
    );
}
