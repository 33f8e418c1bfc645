// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

#![forbid(unsafe_code)]

use std::io::Read;
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::Level;
use vigil_common::buffer::MatchedEventsBuffer;
use vigil_common::catalog::HttpCatalogClient;
use vigil_common::configuration::Config as VigilConfig;
use vigil_common::dispatcher::{self, DirectTestRequest, PipelineRequest};
use vigil_common::engine::Engine as RulesEngine;
use vigil_common::merger::{AlertMerger, HttpKeyValueStore};
use vigil_common::registry::Registry;
use vigil_common::sink::{HttpNotificationBus, HttpObjectStore, MatchedEventsSink};
use vigil_common::source::HttpEventSource;
use vigil_runtime::{Config as RuntimeConfig, Engine as RuntimeEngine};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!("{err}");
        std::process::exit(1);
    }
}

/// Reads one envelope from stdin, dispatches it, and writes the JSON result
/// to stdout (§4.H). Shape is detected by the presence of a `rules` field:
/// its presence means a direct-test envelope, its absence a pipeline batch.
async fn run() -> Result<()> {
    let config = VigilConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_env_filter(config.env_filter())
        .with_max_level(Level::INFO)
        .init();

    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let envelope: Value = serde_json::from_str(&input)?;

    let runtime = RuntimeEngine::builder(&RuntimeConfig::default())?.build();

    let output = if envelope.get("rules").is_some() {
        let request: DirectTestRequest = serde_json::from_value(envelope)?;
        let results = dispatcher::run_direct_test(&runtime, request).await;
        serde_json::to_string(&results)?
    } else {
        let request: PipelineRequest = serde_json::from_value(envelope)?;
        run_pipeline_batch(&config, runtime, request).await?;
        serde_json::json!({"status": "ok"}).to_string()
    };

    println!("{output}");
    Ok(())
}

async fn run_pipeline_batch(
    config: &VigilConfig,
    runtime: RuntimeEngine,
    request: PipelineRequest,
) -> Result<()> {
    let catalog = Arc::new(HttpCatalogClient::new(config.catalog_base_url.clone()));
    let registry = Arc::new(Registry::new(runtime, catalog));
    registry.refresh_if_stale().await?;

    let engine = RulesEngine::new(registry.clone());

    let kv_store = HttpKeyValueStore::new(config.kv_store_base_url.clone());
    let merger = AlertMerger::new(kv_store);
    let object_store = HttpObjectStore::new(
        config.object_store_base_url.clone(),
        config.s3_bucket.clone(),
    );
    let notifications = HttpNotificationBus::new(config.notifications_url.clone());
    let sink = MatchedEventsSink::new(merger, object_store, notifications, config.s3_bucket.clone());
    let buffer = MatchedEventsBuffer::new(Arc::new(sink));

    let event_source = HttpEventSource::new(config.event_source_base_url.clone());

    dispatcher::run_pipeline(&engine, &event_source, &buffer, request).await?;
    Ok(())
}
