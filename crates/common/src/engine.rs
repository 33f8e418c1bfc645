// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::event::EventView;
use crate::registry::Registry;
use crate::rule::{Rule, RuleError};

/// One day, in minutes: the dedup period assigned to error results (§4.E,
/// §7), so a recurring rule failure still groups into a single alert rather
/// than paging once per event.
pub const ERROR_DEDUP_PERIOD_MINS: u32 = 1440;

/// The outcome of running a single rule against a single event (§3, §4.E).
/// Exactly one of `error_message` or (`matched` ∧ a populated `dedup`) holds
/// — never both, never neither (§8 universal invariant).
#[derive(Debug, Clone)]
pub struct EngineResult {
    pub rule_id: String,
    pub rule_version: String,
    pub rule_tags: Vec<String>,
    pub rule_reports: HashMap<String, Vec<String>>,
    pub log_type: String,
    pub dedup: String,
    pub dedup_period_mins: u32,
    pub event: Value,
    pub title: Option<String>,
    pub alert_context: Option<Value>,
    pub severity: Option<String>,
    pub output_ids: Vec<String>,
    pub error_message: Option<String>,
}

impl EngineResult {
    pub fn matched(&self) -> bool {
        self.error_message.is_none()
    }
}

/// Runs every rule registered for an event's log type against that event
/// and collects the per-rule results (§4.E). Rule registration order is
/// preserved in the output; a non-matching rule (`rule` returned `false`)
/// contributes nothing.
pub struct Engine {
    registry: Arc<Registry>,
}

impl Engine {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub async fn analyze(&self, log_type: &str, event: &Value) -> Vec<EngineResult> {
        if let Err(e) = self.registry.refresh_if_stale().await {
            tracing::warn!(error = %e, "registry refresh failed, continuing with previous index");
        }

        let rules = self.registry.rules_for(log_type);
        let data_model = self.registry.data_model_for(log_type);
        let view = EventView::new(event.clone(), data_model);

        let mut results = Vec::with_capacity(rules.len());
        for rule in rules {
            if let Some(result) = Self::run_one(&rule, &view, event, log_type).await {
                results.push(result);
            }
        }
        results
    }

    async fn run_one(
        rule: &Rule,
        view: &EventView,
        raw_event: &Value,
        log_type: &str,
    ) -> Option<EngineResult> {
        match rule.run(view).await {
            Ok(outcome) if outcome.matched => Some(EngineResult {
                rule_id: rule.id.clone(),
                rule_version: rule.version.clone(),
                rule_tags: rule.tags.clone(),
                rule_reports: rule.reports.clone(),
                log_type: log_type.to_string(),
                dedup: outcome.dedup,
                dedup_period_mins: rule.dedup_period_minutes,
                event: raw_event.clone(),
                title: outcome.title,
                alert_context: outcome.alert_context,
                severity: rule.severity.clone(),
                output_ids: rule.output_ids.clone(),
                error_message: None,
            }),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!(rule_id = %rule.id, error = %e, "rule execution failed");
                Some(Self::error_result(rule, raw_event, log_type, &e))
            }
        }
    }

    fn error_result(rule: &Rule, raw_event: &Value, log_type: &str, e: &RuleError) -> EngineResult {
        EngineResult {
            rule_id: rule.id.clone(),
            rule_version: rule.version.clone(),
            rule_tags: rule.tags.clone(),
            rule_reports: rule.reports.clone(),
            log_type: log_type.to_string(),
            dedup: e.type_name().to_string(),
            dedup_period_mins: ERROR_DEDUP_PERIOD_MINS,
            event: raw_event.clone(),
            title: Some(e.to_string()),
            alert_context: None,
            severity: rule.severity.clone(),
            output_ids: rule.output_ids.clone(),
            error_message: Some(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use vigil_runtime::testing::ScriptedRuleBody;

    use super::*;
    use crate::data_model::CompiledDataModel;

    #[test]
    fn matched_requires_no_error_message() {
        let result = EngineResult {
            rule_id: "r".into(),
            rule_version: "1".into(),
            rule_tags: vec![],
            rule_reports: HashMap::new(),
            log_type: "LOG".into(),
            dedup: "d".into(),
            dedup_period_mins: 60,
            event: Value::Null,
            title: None,
            alert_context: None,
            severity: None,
            output_ids: vec![],
            error_message: None,
        };
        assert!(result.matched());
    }

    fn always_matches(_: &Value) -> Result<bool, String> {
        Ok(true)
    }

    fn always_traps(_: &Value) -> Result<bool, String> {
        Err("boom".to_string())
    }

    fn destination_is_evil(value: &Value) -> Result<bool, String> {
        Ok(value["udm"]["destination"].as_str() == Some("10.0.0.666"))
    }

    /// §8 scenario 1: a rule that matches and exports no `dedup` falls back
    /// to the default dedup string, keyed to its own `dedup_period_minutes`.
    #[tokio::test]
    async fn matching_rule_with_no_dedup_export_uses_default_dedup_string() {
        let component = ScriptedRuleBody::new().with_rule(always_matches);
        let rule = Rule::for_test("rules.default_dedup", Box::new(component));
        let view = EventView::new(json!({"ip": "1.2.3.4"}), None);
        let raw_event = json!({"ip": "1.2.3.4"});

        let result = Engine::run_one(&rule, &view, &raw_event, "AWS.CloudTrail")
            .await
            .expect("matching rule must produce a result");

        assert!(result.matched());
        assert_eq!(result.dedup, default_dedup_string("rules.default_dedup"));
        assert_eq!(result.dedup_period_mins, 60);
    }

    /// §8 scenario 2: a rule whose `rule` entry point traps is reported as
    /// an error result with the fixed one-day error dedup period (1440
    /// minutes), regardless of the rule's own `dedup_period_minutes`.
    #[tokio::test]
    async fn trapping_rule_produces_error_result_with_fixed_error_dedup_period() {
        let component = ScriptedRuleBody::new().with_rule(always_traps);
        let rule = Rule::for_test_with_dedup_period(
            "rules.flaky",
            5,
            Box::new(component),
        );
        let view = EventView::new(json!({"ip": "1.2.3.4"}), None);
        let raw_event = json!({"ip": "1.2.3.4"});

        let result = Engine::run_one(&rule, &view, &raw_event, "AWS.CloudTrail")
            .await
            .expect("a trapping rule still produces an error result");

        assert!(!result.matched());
        assert_eq!(result.dedup_period_mins, ERROR_DEDUP_PERIOD_MINS);
        assert_eq!(result.dedup, "RuleExecutionError");
        assert!(result.error_message.is_some());
    }

    /// §8 scenario 4: a rule that reads a UDM field mapped by path only
    /// matches once the data model resolves that path against the raw
    /// event.
    #[tokio::test]
    async fn rule_reading_udm_path_field_matches_via_data_model() {
        let mut mappings = HashMap::new();
        mappings.insert(
            "destination".to_string(),
            (Some("$.dst_ip".to_string()), None),
        );
        let data_model = CompiledDataModel::for_test("dm.network", mappings, None);

        let component = ScriptedRuleBody::new().with_rule(destination_is_evil);
        let rule = Rule::for_test("rules.evil_destination", Box::new(component));

        let raw_event = json!({"dst_ip": "10.0.0.666"});
        let view = EventView::new(raw_event.clone(), Some(Arc::new(data_model)));

        let result = Engine::run_one(&rule, &view, &raw_event, "NETWORK.FLOW")
            .await
            .expect("rule keyed on the resolved udm field must match");

        assert!(result.matched());
    }
}
