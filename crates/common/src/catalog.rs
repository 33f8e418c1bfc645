// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::data_model::DataModelSpec;
use crate::error::VigilError;
use crate::rule::RuleSpec;

/// The catalog (outbound, §6): the source of truth for Rule and DataModel
/// definitions. Pagination is the catalog's concern, not the registry's —
/// implementations are expected to page internally and return a complete
/// list.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn list_rules(&self) -> Result<Vec<RuleSpec>, VigilError>;
    async fn list_data_models(&self) -> Result<Vec<DataModelSpec>, VigilError>;
}

/// A page of rules or data models as the catalog's HTTP API returns them.
#[derive(Debug, Deserialize)]
struct Page<T> {
    items: Vec<T>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// HTTP-backed catalog client, mirroring the teacher's HTTP state backend
/// (`crates/common/src/state/backends/http.rs`): a thin `reqwest` wrapper
/// that pages until `nextPageToken` is absent.
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn get_all<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
    ) -> Result<Vec<T>, VigilError> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = format!("{}{}", self.base_url, path);
            if let Some(token) = &page_token {
                url = format!("{url}?pageToken={token}");
            }

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| VigilError::CatalogUnavailable(e.into()))?
                .error_for_status()
                .map_err(|e| VigilError::CatalogUnavailable(e.into()))?;

            let mut page: Page<T> = response
                .json()
                .await
                .map_err(|e| VigilError::CatalogUnavailable(e.into()))?;

            items.append(&mut page.items);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(items)
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn list_rules(&self) -> Result<Vec<RuleSpec>, VigilError> {
        self.get_all("/rules").await
    }

    async fn list_data_models(&self) -> Result<Vec<DataModelSpec>, VigilError> {
        self.get_all("/data-models").await
    }
}

/// An in-memory catalog client for tests and the direct-test dispatch mode,
/// mirroring the teacher's `LocalBackend`
/// (`crates/common/src/state/backends/local.rs`).
#[derive(Default)]
pub struct LocalCatalogClient {
    rules: DashMap<String, RuleSpec>,
    data_models: DashMap<String, DataModelSpec>,
}

impl LocalCatalogClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_rule(&self, spec: RuleSpec) {
        self.rules.insert(spec.id.clone(), spec);
    }

    pub fn put_data_model(&self, spec: DataModelSpec) {
        self.data_models.insert(spec.id.clone(), spec);
    }
}

#[async_trait]
impl CatalogClient for LocalCatalogClient {
    async fn list_rules(&self) -> Result<Vec<RuleSpec>, VigilError> {
        Ok(self.rules.iter().map(|e| e.value().clone()).collect())
    }

    async fn list_data_models(&self) -> Result<Vec<DataModelSpec>, VigilError> {
        Ok(self.data_models.iter().map(|e| e.value().clone()).collect())
    }
}
