// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use wasmtime::component::ResourceTable;
use wasmtime_wasi::{WasiCtx, WasiView};

/// Per-invocation store state for a Rule or DataModel component instance.
///
/// Deliberately minimal: rule bodies receive the event view as a plain
/// string argument and never need filesystem, clock or network access, so
/// the bound [`WasiCtx`] grants nothing beyond what `wasmtime-wasi` requires
/// to link.
pub struct State {
    table: ResourceTable,
    ctx: WasiCtx,
}

impl State {
    pub fn new() -> Self {
        Self {
            table: ResourceTable::new(),
            ctx: WasiCtx::builder().build(),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl WasiView for State {
    fn table(&mut self) -> &mut ResourceTable {
        &mut self.table
    }

    fn ctx(&mut self) -> &mut WasiCtx {
        &mut self.ctx
    }
}
