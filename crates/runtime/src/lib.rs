// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

//! Wasmtime component-model host embedding used to compile and invoke
//! Rule and DataModel bodies. Rule/DataModel `body` bytes are component
//! binaries; this crate owns instantiation, entry-point dispatch and the
//! epoch-based interruption budget. See SPEC_FULL.md §1.

mod component;
mod engine;
mod state;
pub mod testing;

pub use component::{CompiledComponent, ComponentError, RuleBody, DEFAULT_INVOCATION_BUDGET};
pub use engine::{Config, Engine, DEFAULT_EPOCH_TICK_INTERVAL};
pub use state::State;
