// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;

use jsonpath_rust::JsonPath;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use vigil_runtime::{CompiledComponent, Engine, RuleBody};

use crate::error::VigilError;
use crate::event::MultipleMatches;

/// A single field mapping in a DataModel's `mappings` list (§4.B): exactly
/// one of `path` or `method` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingSpec {
    pub name: String,
    pub path: Option<String>,
    pub method: Option<String>,
}

/// The wire shape a DataModel arrives in from the catalog (§4.B, §6).
#[derive(Debug, Clone, Deserialize)]
pub struct DataModelSpec {
    pub id: String,
    #[serde(rename = "versionId")]
    pub version_id: String,
    #[serde(rename = "logTypes")]
    pub log_types: Vec<String>,
    pub mappings: Vec<MappingSpec>,
    /// Base64-decoded component bytes; absent when every mapping is
    /// path-only (SPEC_FULL.md §3).
    #[serde(default)]
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
enum Mapping {
    Path(String),
    Method(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    MultipleMatches(#[from] MultipleMatches),
    #[error("method `{method}` failed: {source}")]
    MethodFailed {
        method: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("path expression `{path}` is malformed: {reason}")]
    MalformedPath { path: String, reason: String },
}

impl From<ResolveError> for VigilError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::MultipleMatches(m) => m.into(),
            ResolveError::MethodFailed { method, source } => VigilError::MissingMethod {
                data_model_id: String::new(),
                method: format!("{method}: {source}"),
            },
            ResolveError::MalformedPath { path, reason } => VigilError::InvalidMapping {
                data_model_id: String::new(),
                reason: format!("path `{path}`: {reason}"),
            },
        }
    }
}

/// A compiled, ready-to-use DataModel (§4.B): resolves canonical UDM field
/// names to either a JSONPath lookup against the raw event or a call into
/// the bound component's `call-method` export.
pub struct CompiledDataModel {
    pub id: String,
    pub version_id: String,
    mappings: HashMap<String, Mapping>,
    component: Option<Box<dyn RuleBody>>,
}

impl CompiledDataModel {
    /// Compiles a [`DataModelSpec`]. Returns [`VigilError::InvalidMapping`]
    /// if a mapping declares zero or both of `path`/`method`, and
    /// [`VigilError::CompileError`] if `body` fails to compile as a
    /// component.
    ///
    /// A DataModel whose mappings are entirely path-based never touches
    /// the Wasm runtime at all (SPEC_FULL.md §3) — `component` stays
    /// `None` and `body` is ignored even if present.
    pub fn compile(engine: &Engine, spec: DataModelSpec) -> Result<Self, VigilError> {
        let mut mappings = HashMap::with_capacity(spec.mappings.len());
        let mut needs_component = false;

        for m in spec.mappings {
            let mapping = match (m.path, m.method) {
                (Some(path), None) => Mapping::Path(path),
                (None, Some(method)) => {
                    needs_component = true;
                    Mapping::Method(method)
                }
                (Some(_), Some(_)) => {
                    return Err(VigilError::InvalidMapping {
                        data_model_id: spec.id.clone(),
                        reason: format!(
                            "field `{}` declares both `path` and `method`",
                            m.name
                        ),
                    })
                }
                (None, None) => {
                    return Err(VigilError::InvalidMapping {
                        data_model_id: spec.id.clone(),
                        reason: format!(
                            "field `{}` declares neither `path` nor `method`",
                            m.name
                        ),
                    })
                }
            };
            mappings.insert(m.name, mapping);
        }

        let component = if needs_component {
            let bytes = spec.body.ok_or_else(|| VigilError::InvalidMapping {
                data_model_id: spec.id.clone(),
                reason: "method mapping present but no component body was supplied".into(),
            })?;
            let compiled = CompiledComponent::compile(engine, &bytes)
                .map_err(|e| VigilError::CompileError(e.into()))?;
            Some(Box::new(compiled) as Box<dyn RuleBody>)
        } else {
            None
        };

        Ok(Self {
            id: spec.id,
            version_id: spec.version_id,
            mappings,
            component,
        })
    }

    /// Builds a [`CompiledDataModel`] directly around a host-side
    /// [`RuleBody`] fixture, bypassing component compilation entirely.
    /// Test-only: production DataModels always go through [`Self::compile`].
    #[cfg(test)]
    pub fn for_test(
        id: impl Into<String>,
        mappings: HashMap<String, (Option<String>, Option<String>)>,
        component: Option<Box<dyn RuleBody>>,
    ) -> Self {
        let mappings = mappings
            .into_iter()
            .map(|(name, (path, method))| {
                let mapping = match (path, method) {
                    (Some(path), None) => Mapping::Path(path),
                    (None, Some(method)) => Mapping::Method(method),
                    _ => panic!("for_test mapping must set exactly one of path/method"),
                };
                (name, mapping)
            })
            .collect();
        Self {
            id: id.into(),
            version_id: "test".to_string(),
            mappings,
            component,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.mappings.keys().map(String::as_str)
    }

    pub async fn resolve(
        &self,
        canonical_name: &str,
        event: &Value,
    ) -> Result<Option<Value>, MultipleMatches> {
        let Some(mapping) = self.mappings.get(canonical_name) else {
            return Ok(None);
        };

        match mapping {
            Mapping::Path(path) => Ok(resolve_path(path, event, canonical_name)?),
            Mapping::Method(method) => {
                // A method-call failure is distinct from "zero matches": it
                // means the component trapped or returned an error, not
                // that the field is legitimately absent. Since EventView's
                // public contract only surfaces MultipleMatches, other
                // failures degrade to "no value" here and the underlying
                // cause is the caller's responsibility to log via
                // `resolve_detailed` if needed.
                match self.resolve_method(method, event).await {
                    Ok(v) => Ok(v),
                    Err(_) => Ok(None),
                }
            }
        }
    }

    async fn resolve_method(
        &self,
        method: &str,
        event: &Value,
    ) -> Result<Option<Value>, ResolveError> {
        let Some(component) = &self.component else {
            return Err(ResolveError::MethodFailed {
                method: method.to_string(),
                source: anyhow::anyhow!("data model `{}` has no compiled component", self.id),
            });
        };

        let event_json = event.to_string();
        let result = component
            .call_method(method, &event_json)
            .await
            .map_err(|e| ResolveError::MethodFailed {
                method: method.to_string(),
                source: e.into(),
            })?;

        match result {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| ResolveError::MethodFailed {
                method: method.to_string(),
                source: e.into(),
            }),
        }
    }
}

fn resolve_path(
    path: &str,
    event: &Value,
    canonical_name: &str,
) -> Result<Option<Value>, MultipleMatches> {
    // A malformed path expression has no matches by definition; the
    // DataModel's own validation (catalog-side authoring) is responsible
    // for catching syntax errors before a rule ever runs.
    let Ok(matches) = event.query(path) else {
        return Ok(None);
    };

    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches[0].clone())),
        _ => Err(MultipleMatches {
            canonical_name: canonical_name.to_string(),
        }),
    }
}
