// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use vigil_runtime::{CompiledComponent, ComponentError, Engine, RuleBody};

use crate::error::VigilError;
use crate::event::EventView;

const MAX_DEDUP_LEN: usize = 1000;
const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Title strings share the same 1000-char truncation rule as dedup strings
/// (§4.C).
pub const MAX_TITLE_LEN: usize = MAX_DEDUP_LEN;

/// The wire shape a Rule arrives in from the catalog (§4.C, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct RuleSpec {
    pub id: String,
    #[serde(rename = "versionId")]
    pub version_id: String,
    #[serde(rename = "logTypes")]
    pub log_types: Vec<String>,
    #[serde(rename = "dedupPeriodMinutes", default = "default_dedup_period_minutes")]
    pub dedup_period_minutes: u32,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(rename = "outputIds", default)]
    pub output_ids: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub reports: HashMap<String, Vec<String>>,
    /// Component bytes; always present — a Rule without a `rule` entry
    /// point is meaningless.
    pub body: Vec<u8>,
}

fn default_dedup_period_minutes() -> u32 {
    60
}

/// The result of running a matched Rule's optional entry points (§4.C).
#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub matched: bool,
    pub dedup: String,
    pub title: Option<String>,
    pub alert_context: Option<Value>,
}

impl RuleOutcome {
    fn no_match() -> Self {
        Self {
            matched: false,
            dedup: String::new(),
            title: None,
            alert_context: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    /// A compressed stand-in for the original's Python traceback (§4.C.3).
    /// There is no source file/line once a rule body is a compiled
    /// component, so the component's trap/guest-error message and the
    /// entry point name take their place (SPEC_FULL.md §4).
    #[error("{reason}: component {rule_id}@{rule_version}, in rule {entry_point}")]
    Execution {
        reason: String,
        rule_id: String,
        rule_version: String,
        entry_point: &'static str,
    },
    #[error("alert-context for rule `{rule_id}` did not return a JSON object")]
    InvalidAlertContext { rule_id: String },
}

impl RuleError {
    /// Stands in for `type(exception).__name__` (§4.E, §7): every
    /// `EngineResult` with an error uses this as its dedup string so
    /// downstream tooling can still group by failure kind. There is no
    /// guest exception hierarchy once rule bodies are compiled components,
    /// so the variant name is the closest Rust analogue.
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleError::Execution { .. } => "RuleExecutionError",
            RuleError::InvalidAlertContext { .. } => "InvalidAlertContext",
        }
    }
}

/// A compiled, ready-to-run Rule (§4.C).
pub struct Rule {
    pub id: String,
    pub version: String,
    pub log_types: Vec<String>,
    pub dedup_period_minutes: u32,
    pub severity: Option<String>,
    pub output_ids: Vec<String>,
    pub tags: Vec<String>,
    pub reports: HashMap<String, Vec<String>>,
    component: Box<dyn RuleBody>,
}

impl Rule {
    /// Compiles a [`RuleSpec`]'s body and validates that it exports the
    /// mandatory `rule` entry point (§4.C: "the presence of `rule` is
    /// mandatory"). `dedup`/`title`/`alert-context` are optional and are
    /// probed lazily, per invocation, instead — mirroring
    /// `hasattr(module, 'dedup')` in the original.
    pub async fn compile(engine: &Engine, spec: RuleSpec) -> Result<Self, VigilError> {
        let component = CompiledComponent::compile(engine, &spec.body)
            .map_err(|e| VigilError::CompileError(e.into()))?;

        let has_rule_entry_point = component.has_export("rule").await.map_err(|e| {
            VigilError::CompileError(anyhow::anyhow!(
                "rule `{}` could not be probed for its `rule` entry point: {e}",
                spec.id
            ))
        })?;
        if !has_rule_entry_point {
            return Err(VigilError::CompileError(anyhow::anyhow!(
                "rule `{}` does not export the mandatory `rule` entry point",
                spec.id
            )));
        }

        Ok(Self {
            id: spec.id,
            version: spec.version_id,
            log_types: spec.log_types,
            dedup_period_minutes: spec.dedup_period_minutes,
            severity: spec.severity,
            output_ids: spec.output_ids,
            tags: spec.tags,
            reports: spec.reports,
            component: Box::new(component),
        })
    }

    /// Builds a [`Rule`] directly around a host-side [`RuleBody`] fixture,
    /// bypassing component compilation entirely. Test-only: production
    /// Rules always go through [`Self::compile`].
    #[cfg(test)]
    pub fn for_test(id: impl Into<String>, component: Box<dyn RuleBody>) -> Self {
        Self {
            id: id.into(),
            version: "test".to_string(),
            log_types: Vec::new(),
            dedup_period_minutes: default_dedup_period_minutes(),
            severity: None,
            output_ids: Vec::new(),
            tags: Vec::new(),
            reports: HashMap::new(),
            component,
        }
    }

    /// Builds a [`Rule`] directly around a host-side [`RuleBody`] fixture
    /// with an explicit `dedup_period_minutes`, for scenarios keyed on that
    /// field. Test-only.
    #[cfg(test)]
    pub fn for_test_with_dedup_period(
        id: impl Into<String>,
        dedup_period_minutes: u32,
        component: Box<dyn RuleBody>,
    ) -> Self {
        let mut rule = Self::for_test(id, component);
        rule.dedup_period_minutes = dedup_period_minutes;
        rule
    }

    /// Runs the `rule` entry point and, if matched, the optional
    /// `dedup`/`title`/`alert-context` entry points (§4.C, batch mode):
    /// failures in the optional entry points are silently defaulted rather
    /// than propagated, per §4.C.2. Direct-test mode uses
    /// [`Rule::run_direct_test`] instead, which never defaults.
    pub async fn run(&self, event: &EventView) -> Result<RuleOutcome, RuleError> {
        let payload = event.to_payload().await.map_err(|e| RuleError::Execution {
            reason: e.to_string(),
            rule_id: self.id.clone(),
            rule_version: self.version.clone(),
            entry_point: "rule",
        })?;

        let matched = self
            .component
            .call_bool("rule", &payload)
            .await
            .map_err(|e| self.wrap(e, "rule"))?;

        if !matched {
            return Ok(RuleOutcome::no_match());
        }

        let dedup = match self.component.call_string("dedup", &payload).await {
            Ok(Some(d)) if !d.is_empty() => truncate_string(d, MAX_DEDUP_LEN),
            Ok(_) => default_dedup_string(&self.id),
            Err(_) => default_dedup_string(&self.id),
        };

        let title = match self.component.call_string("title", &payload).await {
            Ok(t) => t.map(|t| truncate_string(t, MAX_TITLE_LEN)),
            Err(_) => None,
        };

        let alert_context = match self
            .component
            .call_string("alert-context", &payload)
            .await
        {
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(v) if v.is_object() => Some(v),
                _ => None,
            },
            Ok(None) | Err(_) => None,
        };

        Ok(RuleOutcome {
            matched: true,
            dedup,
            title,
            alert_context,
        })
    }

    /// Runs every entry point independently for the direct-test dispatcher
    /// (§4.H): unlike [`Rule::run`], a failure in `dedup`/`title`/
    /// `alert-context` is reported back to the caller as a test failure
    /// instead of being defaulted.
    pub async fn run_direct_test(&self, event: &EventView) -> DirectTestOutcome {
        let mut outcome = DirectTestOutcome::default();

        let payload = match event.to_payload().await {
            Ok(p) => p,
            Err(e) => {
                outcome.generic_error = Some(e.to_string());
                return outcome;
            }
        };

        match self.component.call_bool("rule", &payload).await {
            Ok(matched) => outcome.rule_output = Some(matched),
            Err(e) => {
                outcome.rule_error = Some(e.to_string());
                return outcome;
            }
        }

        if outcome.rule_output != Some(true) {
            return outcome;
        }

        match self.component.call_string("dedup", &payload).await {
            Ok(Some(d)) if !d.is_empty() => {
                outcome.dedup_output = Some(truncate_string(d, MAX_DEDUP_LEN))
            }
            Ok(_) => outcome.dedup_output = Some(default_dedup_string(&self.id)),
            Err(e) => outcome.dedup_error = Some(e.to_string()),
        }

        match self.component.call_string("title", &payload).await {
            Ok(Some(t)) => outcome.title_output = Some(truncate_string(t, MAX_TITLE_LEN)),
            Ok(None) => {}
            Err(e) => outcome.title_error = Some(e.to_string()),
        }

        match self.component.call_string("alert-context", &payload).await {
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(v) if v.is_object() => outcome.alert_context_output = Some(v),
                _ => {
                    outcome.alert_context_error = Some(format!(
                        "alert-context for rule `{}` did not return a JSON object",
                        self.id
                    ))
                }
            },
            Ok(None) => {}
            Err(e) => outcome.alert_context_error = Some(e.to_string()),
        }

        outcome
    }

    fn wrap(&self, e: ComponentError, entry_point: &'static str) -> RuleError {
        RuleError::Execution {
            reason: e.to_string(),
            rule_id: self.id.clone(),
            rule_version: self.version.clone(),
            entry_point,
        }
    }
}

/// Per-entry-point outcome for direct-test mode (§4.H): every entry point's
/// success or failure is reported independently rather than being folded
/// into a single defaulted value.
#[derive(Debug, Clone, Default)]
pub struct DirectTestOutcome {
    pub rule_output: Option<bool>,
    pub rule_error: Option<String>,
    pub dedup_output: Option<String>,
    pub dedup_error: Option<String>,
    pub title_output: Option<String>,
    pub title_error: Option<String>,
    pub alert_context_output: Option<Value>,
    pub alert_context_error: Option<String>,
    pub generic_error: Option<String>,
}

impl DirectTestOutcome {
    pub fn errored(&self) -> bool {
        self.rule_error.is_some()
            || self.dedup_error.is_some()
            || self.title_error.is_some()
            || self.alert_context_error.is_some()
            || self.generic_error.is_some()
    }
}

/// The default dedup string when a rule exposes no `dedup` entry point.
/// `spec.md` mandates `defaultDedupString:{rule_id}` rather than the
/// original's bare `"default"` literal (SPEC_FULL.md §4) — the stricter,
/// newer behavior is what's implemented.
pub fn default_dedup_string(rule_id: &str) -> String {
    format!("defaultDedupString:{rule_id}")
}

/// Truncates `s` to `max_len` characters, appending [`TRUNCATION_SUFFIX`]
/// when truncation occurred. Used for both dedup strings and titles, which
/// share the same 1000-char limit (§4.C).
fn truncate_string(s: String, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s;
    }
    let keep = max_len.saturating_sub(TRUNCATION_SUFFIX.len());
    let truncated: String = s.chars().take(keep).collect();
    format!("{truncated}{TRUNCATION_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use vigil_runtime::testing::ScriptedRuleBody;

    use super::*;

    fn always_matches(_: &Value) -> Result<bool, String> {
        Ok(true)
    }

    fn dedup_always_fails(_: &Value) -> Result<String, String> {
        Err("dedup lookup failed".to_string())
    }

    /// §8 scenario 3: in direct-test mode a failing `dedup` entry point is
    /// reported back as a test failure, never silently defaulted the way
    /// [`Rule::run`] (batch mode) would.
    #[tokio::test]
    async fn direct_test_reports_dedup_failure_instead_of_defaulting() {
        let component = ScriptedRuleBody::new()
            .with_rule(always_matches)
            .with_dedup(dedup_always_fails);
        let rule = Rule::for_test("rules.broken_dedup", Box::new(component));
        let view = EventView::new(json!({"ip": "1.2.3.4"}), None);

        let outcome = rule.run_direct_test(&view).await;

        assert_eq!(outcome.rule_output, Some(true));
        assert!(outcome.dedup_output.is_none());
        assert!(outcome.dedup_error.is_some());
        assert!(outcome.errored());
    }

    #[test]
    fn dedup_under_limit_is_untouched() {
        let s = "a".repeat(100);
        assert_eq!(truncate_string(s.clone(), MAX_DEDUP_LEN), s);
    }

    #[test]
    fn dedup_over_limit_is_truncated_with_suffix() {
        let s = "a".repeat(2000);
        let truncated = truncate_string(s, MAX_DEDUP_LEN);
        assert_eq!(truncated.chars().count(), MAX_DEDUP_LEN);
        assert!(truncated.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn dedup_exactly_at_limit_is_untouched() {
        let s = "a".repeat(MAX_DEDUP_LEN);
        assert_eq!(truncate_string(s.clone(), MAX_DEDUP_LEN), s);
    }

    #[test]
    fn dedup_one_over_limit_truncates_to_limit_minus_suffix() {
        let s = "a".repeat(MAX_DEDUP_LEN + 1);
        let truncated = truncate_string(s, MAX_DEDUP_LEN);
        assert_eq!(truncated.chars().count(), MAX_DEDUP_LEN);
        assert!(truncated.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn default_dedup_string_includes_rule_id() {
        assert_eq!(default_dedup_string("my.rule"), "defaultDedupString:my.rule");
    }
}
