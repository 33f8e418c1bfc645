// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use wasmtime::component::{Component, Instance, TypedFunc};
use wasmtime::Store;

use crate::engine::{Engine, DEFAULT_EPOCH_TICK_INTERVAL};
use crate::state::State;

/// Wall-clock budget granted to a single entry-point invocation before the
/// epoch deadline trips and the call is aborted. See SPEC_FULL.md §1: every
/// rule invocation is bounded so one hostile or buggy component cannot
/// stall a batch.
pub const DEFAULT_INVOCATION_BUDGET: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("failed to compile component: {0}")]
    Compile(#[source] anyhow::Error),
    #[error("failed to instantiate component: {0}")]
    Instantiate(#[source] anyhow::Error),
    #[error("entry point `{0}` is not exported")]
    MissingEntryPoint(&'static str),
    #[error("entry point `{entry_point}` trapped: {source}")]
    Trap {
        entry_point: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("entry point `{entry_point}` returned an error: {message}")]
    GuestError {
        entry_point: &'static str,
        message: String,
    },
}

/// The dynamic-dispatch surface a compiled Rule or DataModel body exposes to
/// its host (§4.C, §4.B): probe for an optional entry point, invoke the
/// mandatory boolean-returning one, invoke an optional string-returning
/// one, or invoke a DataModel's generic method dispatch. [`CompiledComponent`]
/// is the only production implementation (a real Wasmtime component); the
/// [`crate::testing::ScriptedRuleBody`] fixture implements it with plain
/// Rust closures so callers in `vigil-common`'s test suite can exercise the
/// match → dedup → `EngineResult` path without compiling an actual Wasm
/// component binary.
#[async_trait]
pub trait RuleBody: Send + Sync {
    /// Returns whether the compiled body exports the named entry point.
    /// Used to realize "rule MAY expose dedup/title/alert_context".
    async fn has_export(&self, name: &'static str) -> Result<bool, ComponentError>;

    /// Calls the mandatory `rule` entry point; callers must already know it
    /// is exported (Rule construction validates this per §4.C).
    async fn call_bool(
        &self,
        entry_point: &'static str,
        event_view_json: &str,
    ) -> Result<bool, ComponentError>;

    /// Calls an optional string-returning entry point
    /// (`dedup`/`title`/`alert-context`). Returns `Ok(None)` when the
    /// export is absent.
    async fn call_string(
        &self,
        entry_point: &'static str,
        event_view_json: &str,
    ) -> Result<Option<String>, ComponentError>;

    /// Calls a DataModel's `call-method(name, event_json)` dispatch export,
    /// used to resolve method-mapped UDM fields (§4.B). `None` is returned
    /// both when the method name is unknown to the guest and when the
    /// guest explicitly answers with no value.
    async fn call_method(
        &self,
        method_name: &str,
        event_json: &str,
    ) -> Result<Option<String>, ComponentError>;
}

/// A Rule or DataModel compiled into a Wasmtime component.
///
/// Every exported entry point takes a single string argument: the
/// JSON-serialized `EventView` (`{"event": .., "udm": ..}`) and returns
/// either `result<bool, string>` (the `rule` entry point) or
/// `result<string, string>` (`dedup`, `title`, `alert-context`,
/// `call-method`). Entry points that the body doesn't export are simply
/// absent — callers probe for them with [`CompiledComponent::has_export`].
pub struct CompiledComponent {
    engine: Engine,
    component: Component,
}

impl CompiledComponent {
    /// Compile component bytes. Does not instantiate — instantiation (and
    /// its cost) happens per invocation since components are not `Sync`
    /// across concurrent async calls without a pool.
    pub fn compile(engine: &Engine, bytes: &[u8]) -> Result<Self, ComponentError> {
        let component =
            Component::from_binary(&engine.inner, bytes).map_err(ComponentError::Compile)?;
        Ok(Self {
            engine: engine.clone(),
            component,
        })
    }

    async fn instantiate(&self) -> Result<(Store<State>, Instance), ComponentError> {
        let mut store = Store::new(&self.engine.inner, State::new());
        let ticks = (DEFAULT_INVOCATION_BUDGET.as_micros() / DEFAULT_EPOCH_TICK_INTERVAL.as_micros())
            as u64;
        store.set_epoch_deadline(ticks.max(1));

        let instance = self
            .engine
            .linker
            .instantiate_async(&mut store, &self.component)
            .await
            .map_err(ComponentError::Instantiate)?;

        Ok((store, instance))
    }
}

#[async_trait]
impl RuleBody for CompiledComponent {
    /// Returns whether the compiled component exports the named entry
    /// point. Used to realize "rule MAY expose dedup/title/alert_context".
    async fn has_export(&self, name: &'static str) -> Result<bool, ComponentError> {
        let (mut store, instance) = self.instantiate().await?;
        Ok(instance.get_func(&mut store, name).is_some())
    }

    /// Calls the mandatory `rule` entry point; callers must already know it
    /// is exported (Rule construction validates this per §4.C).
    async fn call_bool(
        &self,
        entry_point: &'static str,
        event_view_json: &str,
    ) -> Result<bool, ComponentError> {
        let (mut store, instance) = self.instantiate().await?;
        let func = instance
            .get_func(&mut store, entry_point)
            .ok_or(ComponentError::MissingEntryPoint(entry_point))?;
        let typed: TypedFunc<(String,), (Result<bool, String>,)> = func
            .typed(&store)
            .map_err(|e| ComponentError::Trap {
                entry_point,
                source: e,
            })?;

        let (result,) = typed
            .call_async(&mut store, (event_view_json.to_string(),))
            .await
            .map_err(|e| ComponentError::Trap {
                entry_point,
                source: e,
            })?;
        typed
            .post_return_async(&mut store)
            .await
            .map_err(|e| ComponentError::Trap {
                entry_point,
                source: e,
            })?;

        result.map_err(|message| ComponentError::GuestError {
            entry_point,
            message,
        })
    }

    /// Calls an optional string-returning entry point
    /// (`dedup`/`title`/`alert-context`). Returns `Ok(None)` when the
    /// export is absent.
    async fn call_string(
        &self,
        entry_point: &'static str,
        event_view_json: &str,
    ) -> Result<Option<String>, ComponentError> {
        let (mut store, instance) = self.instantiate().await?;
        let Some(func) = instance.get_func(&mut store, entry_point) else {
            return Ok(None);
        };
        let typed: TypedFunc<(String,), (Result<String, String>,)> = func
            .typed(&store)
            .map_err(|e| ComponentError::Trap {
                entry_point,
                source: e,
            })?;

        let (result,) = typed
            .call_async(&mut store, (event_view_json.to_string(),))
            .await
            .map_err(|e| ComponentError::Trap {
                entry_point,
                source: e,
            })?;
        typed
            .post_return_async(&mut store)
            .await
            .map_err(|e| ComponentError::Trap {
                entry_point,
                source: e,
            })?;

        result
            .map(Some)
            .map_err(|message| ComponentError::GuestError {
                entry_point,
                message,
            })
    }

    /// Calls a DataModel's `call-method(name, event_json)` dispatch export,
    /// used to resolve method-mapped UDM fields (§4.B). `None` is returned
    /// both when the method name is unknown to the guest and when the
    /// guest explicitly answers with no value.
    async fn call_method(
        &self,
        method_name: &str,
        event_json: &str,
    ) -> Result<Option<String>, ComponentError> {
        const ENTRY_POINT: &str = "call-method";
        let (mut store, instance) = self.instantiate().await?;
        let func = instance
            .get_func(&mut store, ENTRY_POINT)
            .ok_or(ComponentError::MissingEntryPoint(ENTRY_POINT))?;
        let typed: TypedFunc<(String, String), (Result<Option<String>, String>,)> = func
            .typed(&store)
            .map_err(|e| ComponentError::Trap {
                entry_point: ENTRY_POINT,
                source: e,
            })?;

        let (result,) = typed
            .call_async(&mut store, (method_name.to_string(), event_json.to_string()))
            .await
            .map_err(|e| ComponentError::Trap {
                entry_point: ENTRY_POINT,
                source: e,
            })?;
        typed
            .post_return_async(&mut store)
            .await
            .map_err(|e| ComponentError::Trap {
                entry_point: ENTRY_POINT,
                source: e,
            })?;

        result.map_err(|message| ComponentError::GuestError {
            entry_point: ENTRY_POINT,
            message,
        })
    }
}
