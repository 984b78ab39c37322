// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Engine error types.
//!
//! Errors are typed by kind so HTTP collaborators can map them to status
//! codes without inspecting messages.

use thiserror::Error;

use crate::models::ModelError;

/// Errors that can occur while leasing, activating or running an engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    NotFound(String),

    #[error("Engine {0} is not ready yet")]
    NotReady(String),

    #[error("Engine ID {id} is for task '{actual}' not '{requested}'")]
    WrongTask {
        id: String,
        actual: String,
        requested: String,
    },

    #[error("{0}")]
    Activation(String),

    #[error("Sampler {0} is not available for this engine")]
    UnknownSampler(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Capability mismatch: {0}")]
    Capability(String),

    #[error("Pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Device transfer failed: {0}")]
    Transfer(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Background task failed: {0}")]
    Async(String),
}

impl EngineError {
    /// Status code an HTTP layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) | Self::UnknownSampler(_) => 404,
            Self::NotReady(_) => 503,
            Self::WrongTask { .. } | Self::InvalidRequest(_) => 400,
            Self::Model(ModelError::ReferenceNotFound(_)) => 404,
            _ => 500,
        }
    }

    /// True when the device ran out of memory during the call.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::Pipeline(PipelineError::OutOfMemory(_)))
    }
}

/// Failure reported by a pipeline implementation.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("out of device memory: {0}")]
    OutOfMemory(String),

    #[error("{0}")]
    Failed(String),
}
