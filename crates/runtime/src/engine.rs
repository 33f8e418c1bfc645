// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use anyhow::Result;
use crossbeam_channel::Sender;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use wasmtime::component::Linker;
use wasmtime::{InstanceAllocationStrategy, PoolingAllocationConfig};

use crate::state::State;

/// The default [`EngineBuilder::epoch_tick_interval`].
pub const DEFAULT_EPOCH_TICK_INTERVAL: Duration = Duration::from_millis(10);

const MB: u64 = 1 << 20;
const GB: u64 = 1 << 30;
const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Global configuration for `EngineBuilder`.
pub struct Config {
    inner: wasmtime::Config,
}

impl Config {
    /// Enable the Wasmtime compilation cache. If `path` is given it will override
    /// the system default path.
    pub fn enable_cache(&mut self, config_path: &Option<PathBuf>) -> Result<()> {
        match config_path {
            Some(p) => self.inner.cache_config_load(p)?,
            None => self.inner.cache_config_load_default()?,
        };

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut inner = wasmtime::Config::new();
        inner.async_support(true);
        inner.epoch_interruption(true);
        inner.wasm_component_model(true);

        // Rule bodies arrive from the catalog and are compiled on every
        // registry refresh; keep optimization cheap rather than chasing
        // peak throughput on a module that is about to be replaced anyway.
        inner.cranelift_opt_level(wasmtime::OptLevel::Speed);

        // The pooling allocator drastically reduces syscall/kernel overhead
        // when instantiating one component per rule invocation.
        let mut pooling_config = PoolingAllocationConfig::default();

        pooling_config
            .total_component_instances(1_000)
            .max_component_instance_size(MB as usize)
            .max_core_instances_per_component(32)
            .max_tables_per_component(10)
            .table_elements(10_000)
            .max_memories_per_component(4)
            .total_memories(1_000)
            .total_tables(2_000)
            .memory_pages(GB / WASM_PAGE_SIZE)
            .linear_memory_keep_resident((2 * MB) as usize)
            .table_keep_resident((MB / 2) as usize);

        inner.allocation_strategy(InstanceAllocationStrategy::Pooling(pooling_config));

        Self { inner }
    }
}

pub struct EngineBuilder {
    engine: wasmtime::Engine,
    linker: Linker<State>,
    epoch_tick_interval: Duration,
}

impl EngineBuilder {
    fn new(config: &Config) -> Result<Self> {
        let engine = wasmtime::Engine::new(&config.inner)?;
        let mut linker: Linker<State> = Linker::new(&engine);

        // Rules only ever see event data passed explicitly as arguments.
        // WASI is linked because the component model's tooling expects it
        // to resolve, but `State`'s `WasiCtx` grants no preopened
        // directories, sockets or clock access, so a rule component cannot
        // reach the filesystem, network or wall clock through it.
        wasmtime_wasi::add_to_linker_async(&mut linker)?;

        Ok(Self {
            engine,
            linker,
            epoch_tick_interval: DEFAULT_EPOCH_TICK_INTERVAL,
        })
    }

    fn spawn_epoch_ticker(&self) -> Sender<()> {
        let engine = self.engine.clone();
        let interval = self.epoch_tick_interval;
        let (send, recv) = crossbeam_channel::bounded(0);
        std::thread::spawn(move || loop {
            match recv.recv_timeout(interval) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => (),
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                res => panic!("unexpected epoch_ticker_signal: {res:?}"),
            }
            engine.increment_epoch();
        });
        send
    }

    /// Builds an [`Engine`] from this builder.
    pub fn build(self) -> Engine {
        Engine {
            _epoch_ticker_signal: self.spawn_epoch_ticker(),
            inner: self.engine,
            linker: Arc::new(self.linker),
        }
    }
}

/// A global context for the compilation and instantiation of Rule and
/// DataModel components.
#[derive(Clone)]
pub struct Engine {
    pub inner: wasmtime::Engine,
    pub linker: Arc<Linker<State>>,
    // Matching receiver closes on drop.
    _epoch_ticker_signal: Sender<()>,
}

impl AsRef<wasmtime::Engine> for Engine {
    fn as_ref(&self) -> &wasmtime::Engine {
        &self.inner
    }
}

impl Engine {
    /// Creates a new [`EngineBuilder`] with the given [`Config`].
    pub fn builder(config: &Config) -> Result<EngineBuilder> {
        EngineBuilder::new(config)
    }
}
