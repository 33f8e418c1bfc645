// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use vigil_runtime::Engine as RuntimeEngine;

use crate::catalog::CatalogClient;
use crate::data_model::CompiledDataModel;
use crate::rule::Rule;

/// The rule id whose exports other rules may depend on at authoring time
/// (SPEC_FULL.md §1). Compiled first on every refresh so it is always
/// resident before any rule that imports it.
pub const SHARED_GLOBALS_RULE_ID: &str = "aws_globals";

/// How long a refreshed index stays current before the next `analyze` call
/// triggers another refresh (§3, §4.D, §4.E step 1).
pub const RULES_CACHE_DURATION: Duration = Duration::from_secs(300);

struct Index {
    rules_by_log_type: HashMap<String, Vec<Arc<Rule>>>,
    data_model_by_log_type: HashMap<String, Arc<CompiledDataModel>>,
}

impl Index {
    fn empty() -> Self {
        Self {
            rules_by_log_type: HashMap::new(),
            data_model_by_log_type: HashMap::new(),
        }
    }
}

/// Holds the compiled Rule/DataModel index and refreshes it from the
/// catalog (§4.D). A failed refresh never discards the previous index: the
/// registry keeps serving the last good compilation.
pub struct Registry {
    runtime: RuntimeEngine,
    catalog: Arc<dyn CatalogClient>,
    index: RwLock<Arc<Index>>,
    last_refresh_error: RwLock<Option<String>>,
    /// `None` until the first refresh completes, which makes the very first
    /// `refresh_if_stale` call always refresh — the Rust analogue of "on
    /// construction" in §4.D's refresh trigger.
    last_refresh: RwLock<Option<Instant>>,
}

impl Registry {
    pub fn new(runtime: RuntimeEngine, catalog: Arc<dyn CatalogClient>) -> Self {
        Self {
            runtime,
            catalog,
            index: RwLock::new(Arc::new(Index::empty())),
            last_refresh_error: RwLock::new(None),
            last_refresh: RwLock::new(None),
        }
    }

    /// Refreshes the index if [`RULES_CACHE_DURATION`] has elapsed since the
    /// last refresh, or if no refresh has ever completed (§4.D, §4.E step
    /// 1). A refresh that itself fails still counts as "attempted" for
    /// cadence purposes — `refresh` already leaves the previous index
    /// intact and logs the transport error, so retrying on every single
    /// `analyze` call would just hammer a known-unavailable catalog.
    pub async fn refresh_if_stale(&self) -> anyhow::Result<()> {
        let is_stale = {
            let last = *self.last_refresh.read().expect("registry refresh lock poisoned");
            match last {
                None => true,
                Some(at) => at.elapsed() >= RULES_CACHE_DURATION,
            }
        };

        if !is_stale {
            return Ok(());
        }

        self.refresh().await?;
        *self.last_refresh.write().expect("registry refresh lock poisoned") = Some(Instant::now());
        Ok(())
    }

    pub fn rules_for(&self, log_type: &str) -> Vec<Arc<Rule>> {
        self.index
            .read()
            .expect("registry index lock poisoned")
            .rules_by_log_type
            .get(log_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn data_model_for(&self, log_type: &str) -> Option<Arc<CompiledDataModel>> {
        self.index
            .read()
            .expect("registry index lock poisoned")
            .data_model_by_log_type
            .get(log_type)
            .cloned()
    }

    pub fn last_refresh_error(&self) -> Option<String> {
        self.last_refresh_error
            .read()
            .expect("registry error lock poisoned")
            .clone()
    }

    /// Refreshes the index from the catalog. Rules and data models that
    /// fail to compile are skipped (logged, not fatal) per §4.D — a single
    /// bad catalog entry never prevents the rest of the index from
    /// loading. At most one data model is kept per log type; a later one
    /// wins and the earlier one is logged as overridden.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let (rule_specs, data_model_specs) =
            match tokio::try_join!(self.catalog.list_rules(), self.catalog.list_data_models()) {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "registry refresh failed, keeping previous index");
                    *self.last_refresh_error.write().expect("lock poisoned") = Some(e.to_string());
                    return Ok(());
                }
            };

        let mut rule_specs = rule_specs;
        rule_specs.sort_by_key(|r| if r.id == SHARED_GLOBALS_RULE_ID { 0 } else { 1 });

        let mut new_index = Index::empty();

        for spec in data_model_specs {
            let log_types = spec.log_types.clone();
            let id = spec.id.clone();
            match CompiledDataModel::compile(&self.runtime, spec) {
                Ok(compiled) => {
                    let compiled = Arc::new(compiled);
                    for log_type in log_types {
                        if new_index
                            .data_model_by_log_type
                            .insert(log_type.clone(), compiled.clone())
                            .is_some()
                        {
                            tracing::warn!(
                                log_type = %log_type,
                                data_model_id = %id,
                                "multiple data models declared for log type, last one wins"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(data_model_id = %id, error = %e, "skipping data model that failed to compile");
                }
            }
        }

        for spec in rule_specs {
            let id = spec.id.clone();
            let log_types = spec.log_types.clone();
            match Rule::compile(&self.runtime, spec).await {
                Ok(rule) => {
                    let rule = Arc::new(rule);
                    for log_type in log_types {
                        new_index
                            .rules_by_log_type
                            .entry(log_type)
                            .or_default()
                            .push(rule.clone());
                    }
                }
                Err(e) => {
                    tracing::error!(rule_id = %id, error = %e, "skipping rule that failed to compile");
                }
            }
        }

        *self.index.write().expect("lock poisoned") = Arc::new(new_index);
        *self.last_refresh_error.write().expect("lock poisoned") = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::data_model::DataModelSpec;
    use crate::error::VigilError;
    use crate::rule::RuleSpec;

    struct CountingCatalog {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CatalogClient for CountingCatalog {
        async fn list_rules(&self) -> Result<Vec<RuleSpec>, VigilError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![])
        }

        async fn list_data_models(&self) -> Result<Vec<DataModelSpec>, VigilError> {
            Ok(vec![])
        }
    }

    fn test_runtime() -> RuntimeEngine {
        RuntimeEngine::builder(&vigil_runtime::Config::default())
            .expect("engine builder")
            .build()
    }

    #[tokio::test]
    async fn first_call_always_refreshes() {
        let catalog = Arc::new(CountingCatalog {
            calls: AtomicUsize::new(0),
        });
        let registry = Registry::new(test_runtime(), catalog.clone());
        registry.refresh_if_stale().await.unwrap();
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_call_within_ttl_does_not_refresh_again() {
        let catalog = Arc::new(CountingCatalog {
            calls: AtomicUsize::new(0),
        });
        let registry = Registry::new(test_runtime(), catalog.clone());
        registry.refresh_if_stale().await.unwrap();
        registry.refresh_if_stale().await.unwrap();
        assert_eq!(catalog.calls.load(Ordering::SeqCst), 1);
    }
}
