// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Multi-source weight resolution.
//!
//! A descriptor's weights may live in a local folder, the hub cache, the URL
//! cache, or only remotely. The resolver orders those candidates, tries each
//! one through a caller-supplied loader and reports every failure if none
//! works.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::descriptor::{ConfigDescriptor, Fp16Policy};
use super::error::{ModelError, SourceError};
use super::patterns::matches_any;
use super::sources::{self, HubClient, UrlFetcher};
use crate::telemetry;

/// One place weights may be found, in resolution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightCandidate {
    /// The hub (cache only when `local_only`).
    Hub { local_only: bool },
    /// The explicit URL list (cache only when `local_only`).
    Url { local_only: bool },
    /// A folder under the weight root.
    Local { fp16: bool },
    /// Evict the hub cache, then download again.
    HubForced,
}

impl WeightCandidate {
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            WeightCandidate::Hub { local_only: false }
                | WeightCandidate::Url { local_only: false }
                | WeightCandidate::HubForced
        )
    }
}

impl fmt::Display for WeightCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightCandidate::Hub { local_only: true } => write!(f, "hub cache"),
            WeightCandidate::Hub { local_only: false } => write!(f, "hub download"),
            WeightCandidate::Url { local_only: true } => write!(f, "url cache"),
            WeightCandidate::Url { local_only: false } => write!(f, "url download"),
            WeightCandidate::Local { fp16: true } => write!(f, "local fp16 folder"),
            WeightCandidate::Local { fp16: false } => write!(f, "local folder"),
            WeightCandidate::HubForced => write!(f, "hub refetch after cache eviction"),
        }
    }
}

/// Resolution settings shared by every descriptor.
#[derive(Debug, Clone, Default)]
pub struct ResolverSettings {
    pub weight_root: PathBuf,
    pub cache_dir: PathBuf,
    /// fnmatch patterns of models that are always fetched fresh.
    pub refresh_models: Vec<String>,
    pub refresh_on_error: bool,
    /// Whether the engine mode runs in fp16.
    pub fp16: bool,
    pub auth_token: Option<String>,
}

pub struct WeightResolver {
    settings: ResolverSettings,
    hub: Arc<dyn HubClient>,
    fetcher: Arc<dyn UrlFetcher>,
}

impl WeightResolver {
    pub fn new(
        settings: ResolverSettings,
        hub: Arc<dyn HubClient>,
        fetcher: Arc<dyn UrlFetcher>,
    ) -> Self {
        Self {
            settings,
            hub,
            fetcher,
        }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    fn matches_refresh(&self, desc: &ConfigDescriptor) -> bool {
        match desc.model_text() {
            Some(model) if !model.is_empty() => matches_any(model, &self.settings.refresh_models),
            _ => false,
        }
    }

    /// Candidate sources for `desc`, in the order they are tried.
    pub fn candidates(&self, desc: &ConfigDescriptor) -> Vec<WeightCandidate> {
        let policy = desc.fp16().unwrap_or_default();
        let fp16 = self.settings.fp16;
        let refresh = self.matches_refresh(desc);
        let mut out = Vec::with_capacity(9);

        if refresh {
            out.push(WeightCandidate::Hub { local_only: false });
            out.push(WeightCandidate::Url { local_only: false });
        }
        if fp16 && policy != Fp16Policy::Never {
            out.push(WeightCandidate::Local { fp16: true });
        }
        if !(fp16 && policy == Fp16Policy::Only) {
            out.push(WeightCandidate::Local { fp16: false });
        }
        out.push(WeightCandidate::Hub { local_only: true });
        out.push(WeightCandidate::Url { local_only: true });
        if !refresh {
            out.push(WeightCandidate::Hub { local_only: false });
            out.push(WeightCandidate::Url { local_only: false });
        }
        if self.settings.refresh_on_error {
            out.push(WeightCandidate::HubForced);
        }

        out
    }

    /// Produce a weight path from one candidate.
    pub fn locate(
        &self,
        candidate: WeightCandidate,
        desc: &ConfigDescriptor,
    ) -> Result<PathBuf, SourceError> {
        let token = self.settings.auth_token.as_deref();
        match candidate {
            WeightCandidate::Hub { local_only } => {
                sources::hub_path(self.hub.as_ref(), desc, self.settings.fp16, token, local_only)
            }
            WeightCandidate::Url { local_only } => sources::url_path(
                self.fetcher.as_ref(),
                &self.settings.cache_dir,
                desc,
                local_only,
            ),
            WeightCandidate::Local { fp16 } => {
                sources::local_path(&self.settings.weight_root, desc, fp16)
            }
            WeightCandidate::HubForced => {
                sources::hub_forced_path(self.hub.as_ref(), desc, self.settings.fp16, token)
            }
        }
    }

    /// Try each candidate until one yields a path that `load` accepts.
    ///
    /// Returns the loaded value and the path it came from.
    pub fn resolve<T, F>(&self, desc: &ConfigDescriptor, mut load: F) -> Result<(T, PathBuf), ModelError>
    where
        F: FnMut(&Path) -> Result<T, ModelError>,
    {
        let mut failures: Vec<String> = Vec::new();
        let mut record = |message: String| {
            if !failures.contains(&message) {
                failures.push(message);
            }
        };

        for candidate in self.candidates(desc) {
            let path = match self.locate(candidate, desc) {
                Ok(path) => path,
                Err(SourceError::Unavailable(reason)) => {
                    tracing::debug!(%candidate, %reason, "Weight source unavailable");
                    record(reason);
                    continue;
                }
                Err(SourceError::Failed(e)) if e.is_recoverable() => {
                    record(e.to_string());
                    continue;
                }
                Err(SourceError::Failed(e)) => return Err(e),
            };

            match load(&path) {
                Ok(value) => {
                    tracing::info!(
                        name = %desc.human_id(),
                        %candidate,
                        path = %path.display(),
                        "Resolved weights"
                    );
                    return Ok((value, path));
                }
                Err(e) if e.is_recoverable() => record(e.to_string()),
                Err(e) => record(format!(
                    "Error when trying to load weights from {}. {e}",
                    path.display()
                )),
            }
        }

        telemetry::record_resolution_failure();
        Err(ModelError::ResolutionExhausted {
            name: desc.human_id(),
            failures,
        })
    }
}
