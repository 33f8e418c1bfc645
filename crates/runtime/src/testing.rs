// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

//! A host-side [`RuleBody`] fixture for exercising Rule/DataModel dispatch
//! (§4.B, §4.C) without compiling an actual Wasm component. Scripted by
//! plain `fn` pointers evaluating the same `{"event": .., "udm": ..}`
//! payload a real component receives, so `vigil-common`'s test suite can
//! verify the match → dedup → `EngineResult` path (and UDM method
//! resolution) end to end. Not used by `src/bin/vigil.rs`.

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;

use crate::component::{ComponentError, RuleBody};

/// A scripted stand-in for a compiled Rule or DataModel component. Every
/// field is `None` unless the corresponding entry point is "exported";
/// `has_export` and the dispatch methods both honor that the same way
/// [`crate::CompiledComponent`] honors an export's real absence.
#[derive(Default, Clone, Copy)]
pub struct ScriptedRuleBody {
    pub rule: Option<fn(&Value) -> Result<bool, String>>,
    pub dedup: Option<fn(&Value) -> Result<String, String>>,
    pub title: Option<fn(&Value) -> Result<String, String>>,
    pub alert_context: Option<fn(&Value) -> Result<Value, String>>,
    pub call_method: Option<fn(&str, &Value) -> Result<Option<Value>, String>>,
}

impl ScriptedRuleBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, f: fn(&Value) -> Result<bool, String>) -> Self {
        self.rule = Some(f);
        self
    }

    pub fn with_dedup(mut self, f: fn(&Value) -> Result<String, String>) -> Self {
        self.dedup = Some(f);
        self
    }

    pub fn with_title(mut self, f: fn(&Value) -> Result<String, String>) -> Self {
        self.title = Some(f);
        self
    }

    pub fn with_alert_context(mut self, f: fn(&Value) -> Result<Value, String>) -> Self {
        self.alert_context = Some(f);
        self
    }

    pub fn with_call_method(mut self, f: fn(&str, &Value) -> Result<Option<Value>, String>) -> Self {
        self.call_method = Some(f);
        self
    }
}

fn parse_payload(entry_point: &'static str, json: &str) -> Result<Value, ComponentError> {
    serde_json::from_str(json).map_err(|e| ComponentError::Trap {
        entry_point,
        source: anyhow!("scripted payload is not valid JSON: {e}"),
    })
}

#[async_trait]
impl RuleBody for ScriptedRuleBody {
    async fn has_export(&self, name: &'static str) -> Result<bool, ComponentError> {
        Ok(match name {
            "rule" => self.rule.is_some(),
            "dedup" => self.dedup.is_some(),
            "title" => self.title.is_some(),
            "alert-context" => self.alert_context.is_some(),
            "call-method" => self.call_method.is_some(),
            _ => false,
        })
    }

    async fn call_bool(
        &self,
        entry_point: &'static str,
        event_view_json: &str,
    ) -> Result<bool, ComponentError> {
        let Some(f) = self.rule else {
            return Err(ComponentError::MissingEntryPoint(entry_point));
        };
        let value = parse_payload(entry_point, event_view_json)?;
        f(&value).map_err(|message| ComponentError::Trap {
            entry_point,
            source: anyhow!(message),
        })
    }

    async fn call_string(
        &self,
        entry_point: &'static str,
        event_view_json: &str,
    ) -> Result<Option<String>, ComponentError> {
        let value = parse_payload(entry_point, event_view_json)?;
        match entry_point {
            "dedup" => match self.dedup {
                None => Ok(None),
                Some(f) => f(&value)
                    .map(Some)
                    .map_err(|message| ComponentError::GuestError {
                        entry_point,
                        message,
                    }),
            },
            "title" => match self.title {
                None => Ok(None),
                Some(f) => f(&value)
                    .map(Some)
                    .map_err(|message| ComponentError::GuestError {
                        entry_point,
                        message,
                    }),
            },
            "alert-context" => match self.alert_context {
                None => Ok(None),
                Some(f) => f(&value)
                    .map(|v| Some(v.to_string()))
                    .map_err(|message| ComponentError::GuestError {
                        entry_point,
                        message,
                    }),
            },
            _ => Ok(None),
        }
    }

    async fn call_method(
        &self,
        method_name: &str,
        event_json: &str,
    ) -> Result<Option<String>, ComponentError> {
        const ENTRY_POINT: &str = "call-method";
        let Some(f) = self.call_method else {
            return Ok(None);
        };
        let value = parse_payload(ENTRY_POINT, event_json)?;
        f(method_name, &value)
            .map(|opt| opt.map(|v| v.to_string()))
            .map_err(|message| ComponentError::GuestError {
                entry_point: ENTRY_POINT,
                message,
            })
    }
}
