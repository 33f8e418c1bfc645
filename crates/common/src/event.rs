// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::Value;

use crate::data_model::CompiledDataModel;
use crate::error::VigilError;

/// Read-only view over an event map, with both raw-field and unified
/// data-model (UDM) accessors (§4.A).
///
/// `EventView` owns its data: construction takes the event by value and
/// never exposes a mutable reference to it, which is how "attempted writes
/// raise a structural failure" (§3) is realized in a systems language —
/// there is simply no API surface to write through.
#[derive(Clone, Debug)]
pub struct EventView {
    data: Value,
    data_model: Option<Arc<CompiledDataModel>>,
}

impl EventView {
    /// Wraps an event map. `data` must be a JSON object; callers (the
    /// Dispatcher and pipeline event readers) are expected to have already
    /// validated this when parsing the inbound envelope.
    pub fn new(data: Value, data_model: Option<Arc<CompiledDataModel>>) -> Self {
        Self { data, data_model }
    }

    /// Raw field access.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.as_object().and_then(|m| m.get(key))
    }

    pub fn len(&self) -> usize {
        self.data.as_object().map(|m| m.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.as_object().into_iter().flatten()
    }

    pub fn raw(&self) -> &Value {
        &self.data
    }

    /// Resolves a canonical field name through the bound DataModel (§4.A).
    ///
    /// - No DataModel bound, or the name isn't mapped: `Ok(None)`.
    /// - Mapped to a path expression: evaluated against the event; zero
    ///   matches is `Ok(None)`, more than one is [`VigilError`] equivalent
    ///   `MultipleMatches`, surfaced to the caller as a `RuleError` by the
    ///   Engine.
    /// - Mapped to a method: the DataModel's compiled component is invoked
    ///   with the method name and this event's JSON.
    pub async fn udm(&self, canonical_name: &str) -> Result<Option<Value>, MultipleMatches> {
        let Some(data_model) = &self.data_model else {
            return Ok(None);
        };
        data_model.resolve(canonical_name, &self.data).await
    }

    /// Builds the combined `{"event": .., "udm": ..}` payload passed as the
    /// single string argument to every Rule component entry point
    /// (SPEC_FULL.md §1). Resolution is eager: every mapping the bound
    /// DataModel declares is resolved once, up front, since a compiled
    /// Wasm component cannot call back into the host to resolve fields
    /// on demand the way in-process rule code could.
    pub async fn to_payload(&self) -> Result<String, MultipleMatches> {
        let mut udm = serde_json::Map::new();
        if let Some(data_model) = &self.data_model {
            for name in data_model.field_names() {
                if let Some(value) = data_model.resolve(name, &self.data).await? {
                    udm.insert(name.to_string(), value);
                }
            }
        }

        let payload = serde_json::json!({
            "event": self.data,
            "udm": Value::Object(udm),
        });
        Ok(payload.to_string())
    }
}

/// A UDM path expression matched more than one field (§4.A, §7).
#[derive(Debug, Clone, thiserror::Error)]
#[error("path expression for `{canonical_name}` matched multiple fields")]
pub struct MultipleMatches {
    pub canonical_name: String,
}

impl From<MultipleMatches> for VigilError {
    fn from(e: MultipleMatches) -> Self {
        VigilError::InvalidMapping {
            data_model_id: String::new(),
            reason: e.to_string(),
        }
    }
}

impl PartialEq for EventView {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for EventView {}

impl Hash for EventView {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // `serde_json::Value`'s `Object` variant is a `BTreeMap` in this
        // crate's default configuration (no `preserve_order` feature), so
        // serialization is key-order-stable and safe to hash.
        self.data.to_string().hash(state);
    }
}
