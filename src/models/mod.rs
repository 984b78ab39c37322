// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Model management: descriptors, weight resolution, loading, mixing and
//! reference resolution.

pub mod descriptor;
pub mod factory;
pub mod loader;
pub mod mixer;
pub mod model_set;
pub mod patterns;
pub mod persist;
pub mod resolver;
pub mod sources;
pub mod tensor;

mod error;
mod registry;

pub use descriptor::{
    load_descriptor_file, parse_descriptors, ConfigDescriptor, Fp16Policy, Identity,
    ModelReference,
};
pub use error::{ModelError, SourceError};
pub use factory::{
    CheckpointDecoder, CheckpointKind, CheckpointRequest, ClassRef, ComponentFactory,
    ComponentFamily, ComponentRegistry, LoadMethod, LoadOptions,
};
pub use loader::{ModelLoader, SafetyPolicy};
pub use mixer::{MixMethod, MixSpec};
pub use model_set::{
    Component, FrozenModelSet, LoadedModel, Model, ModelSet, Placement, SharedModel,
};
pub use persist::{ModelWriter, SafetensorsFactory, SafetensorsWriter};
pub use registry::{LoadContext, ModelRegistry};
pub use resolver::{ResolverSettings, WeightCandidate, WeightResolver};
pub use sources::{
    HubClient, HubError, OfflineFetcher, OfflineHub, RepoInfo, SnapshotRequest, UrlFetcher,
};
pub use tensor::{DType, StateDict, Tensor, TensorError};
