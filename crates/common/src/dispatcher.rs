// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

//! The entry point (§4.H): parses one of two envelope shapes and routes to
//! either an in-process rule test or the full Engine → Buffer → Sink path.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use vigil_runtime::Engine as RuntimeEngine;

use crate::buffer::MatchedEventsBuffer;
use crate::engine::Engine;
use crate::error::VigilError;
use crate::rule::{Rule, RuleSpec};
use crate::source::EventSource;

/// `{rules: [...], events: [{id, data}]}` (§4.H). Compiled and run entirely
/// in-process; never touches the merger, buffer, or sink.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectTestRequest {
    pub rules: Vec<RuleSpec>,
    pub events: Vec<DirectTestEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectTestEvent {
    pub id: String,
    pub data: Value,
}

/// One `(event, rule)` pair's outcome (§4.H). Exactly one of
/// `generic_error` or the per-entry-point fields is meaningful, mirroring
/// [`crate::rule::DirectTestOutcome`] one-to-one.
#[derive(Debug, Clone, Serialize)]
pub struct DirectTestResult {
    pub id: String,
    #[serde(rename = "ruleId")]
    pub rule_id: String,
    #[serde(rename = "ruleOutput")]
    pub rule_output: Option<bool>,
    #[serde(rename = "dedupOutput")]
    pub dedup_output: Option<String>,
    #[serde(rename = "dedupError")]
    pub dedup_error: Option<String>,
    #[serde(rename = "titleOutput")]
    pub title_output: Option<String>,
    #[serde(rename = "titleError")]
    pub title_error: Option<String>,
    #[serde(rename = "alertContextOutput")]
    pub alert_context_output: Option<Value>,
    #[serde(rename = "alertContextError")]
    pub alert_context_error: Option<String>,
    #[serde(rename = "ruleError")]
    pub rule_error: Option<String>,
    pub errored: bool,
    #[serde(rename = "genericError")]
    pub generic_error: Option<String>,
}

impl DirectTestResult {
    fn compile_failure(event_id: String, rule_id: String, reason: String) -> Self {
        Self {
            id: event_id,
            rule_id,
            rule_output: None,
            dedup_output: None,
            dedup_error: None,
            title_output: None,
            title_error: None,
            alert_context_output: None,
            alert_context_error: None,
            rule_error: None,
            errored: true,
            generic_error: Some(reason),
        }
    }
}

/// `{notifications: [{bucket, key}]}` (§4.H). Each notification identifies
/// one newly-arrived event file to stream-read and analyze.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineRequest {
    pub notifications: Vec<PipelineNotification>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineNotification {
    pub bucket: String,
    pub key: String,
}

/// Runs rules against events entirely in-process, independent of the
/// registry/catalog, for the direct-test envelope (§4.H). A rule that
/// fails to compile produces a `genericError` result for every event
/// rather than aborting the whole request — the same per-item isolation
/// the pipeline path uses.
pub async fn run_direct_test(
    runtime: &RuntimeEngine,
    request: DirectTestRequest,
) -> Vec<DirectTestResult> {
    use crate::event::EventView;

    let mut compiled: Vec<Result<Rule, (String, String)>> = Vec::with_capacity(request.rules.len());
    for spec in request.rules {
        let rule_id = spec.id.clone();
        match Rule::compile(runtime, spec).await {
            Ok(rule) => compiled.push(Ok(rule)),
            Err(e) => compiled.push(Err((rule_id, e.to_string()))),
        }
    }

    let mut results = Vec::with_capacity(request.events.len() * compiled.len());
    for event in &request.events {
        let view = EventView::new(event.data.clone(), None);
        for entry in &compiled {
            match entry {
                Ok(rule) => {
                    let outcome = rule.run_direct_test(&view).await;
                    results.push(DirectTestResult {
                        id: event.id.clone(),
                        rule_id: rule.id.clone(),
                        rule_output: outcome.rule_output,
                        dedup_output: outcome.dedup_output,
                        dedup_error: outcome.dedup_error,
                        title_output: outcome.title_output,
                        title_error: outcome.title_error,
                        alert_context_output: outcome.alert_context_output,
                        alert_context_error: outcome.alert_context_error,
                        rule_error: outcome.rule_error,
                        errored: outcome.errored(),
                        generic_error: outcome.generic_error,
                    });
                }
                Err((rule_id, reason)) => {
                    results.push(DirectTestResult::compile_failure(
                        event.id.clone(),
                        rule_id.clone(),
                        reason.clone(),
                    ));
                }
            }
        }
    }

    results
}

/// Infers the log type from an object key's path layout (SPEC_FULL.md §9):
/// the path segment immediately preceding the file name, URL-decoded and
/// uppercased. Returns `None` for a key with fewer than two path segments.
pub fn infer_log_type(key: &str) -> Option<String> {
    let mut segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    segments.pop()?;
    let log_type_segment = segments.pop()?;
    Some(percent_decode(log_type_segment).to_uppercase())
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Runs the pipeline envelope (§4.H): for each notification, stream-reads
/// newline-delimited JSON events, infers the log type, and feeds every
/// event through the Engine, accumulating all `EngineResult`s into
/// `buffer`. Per-notification failures (unreadable object, malformed key,
/// a malformed JSON line) are logged and skipped rather than aborting the
/// remaining notifications (§9 per-item isolation) — the caller is
/// responsible for calling [`MatchedEventsBuffer::flush_all`] once every
/// notification in the batch has been fed through.
pub async fn run_pipeline<S: EventSource>(
    engine: &Engine,
    source: &S,
    buffer: &MatchedEventsBuffer,
    request: PipelineRequest,
) -> Result<(), VigilError> {
    for notification in request.notifications {
        let Some(log_type) = infer_log_type(&notification.key) else {
            tracing::warn!(
                bucket = %notification.bucket,
                key = %notification.key,
                "could not infer log type from object key, skipping notification"
            );
            continue;
        };

        let bytes = match source.read(&notification.bucket, &notification.key).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    bucket = %notification.bucket,
                    key = %notification.key,
                    error = %e,
                    "failed to read event file, skipping notification"
                );
                continue;
            }
        };

        for line in bytes.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let event: Value = match serde_json::from_slice(line) {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(
                        bucket = %notification.bucket,
                        key = %notification.key,
                        error = %e,
                        "skipping malformed event line"
                    );
                    continue;
                }
            };

            let results = engine.analyze(&log_type, &event).await;
            for result in results {
                buffer.add_event(result).await?;
            }
        }
    }

    buffer.flush_all().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_log_type_takes_the_segment_before_the_file_name() {
        assert_eq!(
            infer_log_type("rules/aws_cloudtrail/year=2026/hour=03/file.json.gz"),
            Some("HOUR=03".to_string())
        );
        assert_eq!(
            infer_log_type("AWS.CloudTrail/2026-01-02T03-04-05.json"),
            Some("AWS.CLOUDTRAIL".to_string())
        );
    }

    #[test]
    fn infer_log_type_url_decodes_the_segment() {
        assert_eq!(
            infer_log_type("AWS%2ECloudTrail/file.json"),
            Some("AWS.CLOUDTRAIL".to_string())
        );
    }

    #[test]
    fn infer_log_type_none_for_a_bare_file_name() {
        assert_eq!(infer_log_type("file.json"), None);
    }
}
