// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Error types for weight resolution, loading, mixing and references.

use std::path::PathBuf;

use thiserror::Error;

use super::tensor::TensorError;

/// Errors that can occur while producing a model or model set.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing path, missing field or missing file. The resolver treats this
    /// as a reason to try the next weight source.
    #[error("{0}")]
    MissingWeights(String),

    #[error("Model {0} referenced does not exist")]
    ReferenceNotFound(String),

    #[error("Model {model_id} has no sub-model {submodule}")]
    SubmoduleNotFound { model_id: String, submodule: String },

    #[error("Cyclic model reference: {}", .0.join(" -> "))]
    CyclicReference(Vec<String>),

    #[error("Failed to load {name}. Failed attempts:{}", format_failures(.failures))]
    ResolutionExhausted { name: String, failures: Vec<String> },

    #[error(
        "Can only mix models with the same shapes. If you're trying to mix an inpaint unet \
         with another unet, the inpaint unet must come first. Shapes were {shapes:?}"
    )]
    ShapeMismatch { shapes: Vec<Vec<usize>> },

    #[error("Mix inputs do not match: {0}")]
    KeysetMismatch(String),

    #[error("Unknown component class: {0}")]
    UnknownClass(String),

    #[error("Capability mismatch: {0}")]
    Capability(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Invalid manifest {path}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_failures(failures: &[String]) -> String {
    failures.iter().map(|f| format!("\n  - {f}")).collect()
}

impl ModelError {
    /// True when the failure means "these weights are not here", as opposed to
    /// "these weights are broken".
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::MissingWeights(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Failure of a single weight source candidate.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The source has nothing for this descriptor; try the next one.
    #[error("{0}")]
    Unavailable(String),

    /// The source broke in a way that should not be retried.
    #[error(transparent)]
    Failed(#[from] ModelError),
}
