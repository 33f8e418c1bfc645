// Copyright (c) 2023 LogCraft, SAS.
// SPDX-License-Identifier: MPL-2.0

use thiserror::Error;

/// Error kinds per §7. Rule-level errors (`RuleError`, `TypeMismatch`,
/// `MultipleMatches`) never reach this type directly — they are captured as
/// an [`crate::engine::EngineResult`] instead so a single bad rule can
/// never abort a batch. This enum covers the component-level errors that
/// *do* need to propagate to the caller.
#[derive(Debug, Error)]
pub enum VigilError {
    #[error("rule or data model failed to compile: {0}")]
    CompileError(#[source] anyhow::Error),

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(#[source] anyhow::Error),

    #[error("conditional check failed")]
    ConditionalCheckFailed,

    #[error("sink failure: {0}")]
    SinkFailure(#[source] anyhow::Error),

    #[error("required environment variable `{0}` is missing")]
    EnvMissing(&'static str),

    #[error("invalid data model mapping for `{data_model_id}`: {reason}")]
    InvalidMapping {
        data_model_id: String,
        reason: String,
    },

    #[error("data model `{data_model_id}` is missing method `{method}`")]
    MissingMethod {
        data_model_id: String,
        method: String,
    },
}
