// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

//! Read side of the object store: streaming newline-delimited JSON events
//! out of the upstream ingestion pipeline's output files (§4.H, pipeline
//! envelope). Distinct from [`crate::sink::ObjectStore`], which only ever
//! writes matched-event batches — the upstream files are produced by a
//! collaborator this core does not own (§1 Non-goals).

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::VigilError;

/// Reads newline-delimited JSON event files out of object storage.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Returns the raw bytes of `bucket`/`key`, one JSON object per line.
    async fn read(&self, bucket: &str, key: &str) -> Result<Vec<u8>, VigilError>;
}

/// HTTP-backed event source, mirroring the teacher's `HttpBackend`.
pub struct HttpEventSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEventSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn read(&self, bucket: &str, key: &str) -> Result<Vec<u8>, VigilError> {
        let response = self
            .client
            .get(format!("{}/{}/{}", self.base_url, bucket, key))
            .send()
            .await
            .map_err(|e| VigilError::SinkFailure(e.into()))?
            .error_for_status()
            .map_err(|e| VigilError::SinkFailure(e.into()))?;

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| VigilError::SinkFailure(e.into()))
    }
}

/// In-memory event source for tests and the pipeline envelope's local
/// fixtures, mirroring the teacher's `LocalBackend`.
#[derive(Default)]
pub struct InMemoryEventSource {
    objects: DashMap<(String, String), Vec<u8>>,
}

impl InMemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: impl Into<String>, key: impl Into<String>, body: Vec<u8>) {
        self.objects.insert((bucket.into(), key.into()), body);
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn read(&self, bucket: &str, key: &str) -> Result<Vec<u8>, VigilError> {
        self.objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|v| v.clone())
            .ok_or_else(|| {
                VigilError::SinkFailure(anyhow::anyhow!("no such object {bucket}/{key}"))
            })
    }
}
