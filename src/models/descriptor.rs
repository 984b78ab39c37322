// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Typed view over one engine or model configuration record.
//!
//! Records are flat key/value maps with case-insensitive keys. A record with
//! an `id` is an *engine* (runnable); a record with a `model_id` is a *model*
//! (referenceable only). Unknown keys pass through untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde_json::{Map, Value};

use super::error::ModelError;

/// Reference prefix marking a `model` value as pointing at another record.
pub const REFERENCE_PREFIX: char = '@';
/// `model` value that produces an empty model set.
pub const EMPTY_MODEL: &str = "@empty";

/// How fp16 weights are handled for one descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fp16Policy {
    /// Prefer fp16 weights when the engine runs in fp16 mode.
    #[default]
    Auto,
    /// Only fp16 weights are acceptable in fp16 mode.
    Only,
    /// Use a local fp16 copy if present, never download one.
    Local,
    /// Never look for fp16-specific weights.
    Never,
    /// Never convert weights to fp16 at load.
    Prevent,
}

impl Fp16Policy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "only" => Some(Self::Only),
            "local" => Some(Self::Local),
            "never" => Some(Self::Never),
            "prevent" => Some(Self::Prevent),
            _ => None,
        }
    }
}

/// Identity of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Engine(String),
    Model(String),
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Engine(id) => write!(f, "engine {id}"),
            Identity::Model(id) => write!(f, "model {id}"),
        }
    }
}

/// Parsed `@model_id[/submodule]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReference {
    pub model_id: String,
    pub submodule: Option<String>,
}

impl ModelReference {
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let body = raw.strip_prefix(REFERENCE_PREFIX).ok_or_else(|| {
            ModelError::Config(format!("'{raw}' is not a model reference"))
        })?;

        let mut parts = body.split('/');
        let model_id = parts.next().unwrap_or_default().to_string();
        let rest: Vec<&str> = parts.collect();

        if model_id.is_empty() {
            return Err(ModelError::Config(format!("Empty model reference '{raw}'")));
        }
        if rest.len() > 1 {
            return Err(ModelError::Config(format!(
                "Can't have multiple sub-model references ({body})"
            )));
        }

        Ok(Self {
            model_id,
            submodule: rest.first().map(|s| s.to_string()),
        })
    }
}

/// Immutable, case-insensitive view over a configuration record.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDescriptor {
    data: BTreeMap<String, Value>,
}

impl ConfigDescriptor {
    /// Build a descriptor without validating identity. Used for nested
    /// override and mix entries, which carry no identity of their own.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            data: map
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        }
    }

    /// Build and validate a top-level engine or model record.
    pub fn from_value(value: Value) -> Result<Self, ModelError> {
        let Value::Object(map) = value else {
            return Err(ModelError::Config(
                "configuration entries must be key/value records".into(),
            ));
        };
        let descriptor = Self::from_map(map);
        descriptor.identity()?;
        descriptor.fp16()?;
        Ok(descriptor)
    }

    /// Nested descriptor for a `model` string (`{ "model": value }`).
    pub fn for_model(model: &str) -> Self {
        let mut map = Map::new();
        map.insert("model".into(), Value::String(model.to_string()));
        Self::from_map(map)
    }

    /// Nested descriptor from either a bare model string or a record.
    pub fn nested(value: &Value) -> Result<Self, ModelError> {
        match value {
            Value::String(s) => Ok(Self::for_model(s)),
            Value::Object(map) => Ok(Self::from_map(map.clone())),
            other => Err(ModelError::Config(format!(
                "expected a model string or record, got {other}"
            ))),
        }
    }

    /// Copy of this descriptor with one key replaced.
    pub fn with(&self, key: &str, value: Value) -> Self {
        let mut data = self.data.clone();
        data.insert(key.to_lowercase(), value);
        Self { data }
    }

    pub fn identity(&self) -> Result<Identity, ModelError> {
        match (self.id(), self.model_id()) {
            (Some(id), None) => Ok(Identity::Engine(id.to_string())),
            (None, Some(id)) => Ok(Identity::Model(id.to_string())),
            (Some(_), Some(_)) => Err(ModelError::Config(
                "entry has both id and model_id; exactly one is allowed".into(),
            )),
            (None, None) => Err(ModelError::Config(
                "entry needs exactly one of id or model_id".into(),
            )),
        }
    }

    /// "engine x" / "model y" for diagnostics; nested entries fall back to
    /// their model value.
    pub fn human_id(&self) -> String {
        match self.identity() {
            Ok(identity) => identity.to_string(),
            Err(_) => format!("model {}", self.model_text().unwrap_or("<unnamed>")),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.str_field("id")
    }

    pub fn model_id(&self) -> Option<&str> {
        self.str_field("model_id")
    }

    pub fn is_engine(&self) -> bool {
        self.data.contains_key("id")
    }

    pub fn is_model(&self) -> bool {
        self.data.contains_key("model_id")
    }

    pub fn enabled(&self) -> bool {
        self.bool_field("enabled").unwrap_or(true)
    }

    pub fn visible(&self) -> bool {
        self.enabled() && self.bool_field("visible").unwrap_or(true)
    }

    pub fn is_default(&self) -> bool {
        self.bool_field("default").unwrap_or(false)
    }

    /// `pipeline` unless specified; always lower-case.
    pub fn kind(&self) -> String {
        self.str_field("type")
            .map(str::to_lowercase)
            .unwrap_or_else(|| "pipeline".to_string())
    }

    pub fn is_pipeline(&self) -> bool {
        self.kind() == "pipeline"
    }

    /// Checkpoint config name for `ckpt/<format>` types.
    pub fn checkpoint_format(&self) -> Option<String> {
        self.kind().strip_prefix("ckpt/").map(str::to_string)
    }

    /// Task of a pipeline descriptor (`generate` by default).
    pub fn task(&self) -> Option<String> {
        if !self.is_pipeline() {
            return None;
        }
        Some(
            self.str_field("task")
                .map(str::to_lowercase)
                .unwrap_or_else(|| "generate".to_string()),
        )
    }

    /// Implementation class name, defaulted for pipelines.
    pub fn class_name(&self) -> Option<String> {
        if let Some(class) = self.str_field("class") {
            return Some(class.to_string());
        }
        match self.task().as_deref() {
            Some("depth") => Some("MidasDepthPipeline".to_string()),
            Some(_) => Some("UnifiedPipeline".to_string()),
            None => None,
        }
    }

    pub fn fp16(&self) -> Result<Fp16Policy, ModelError> {
        match self.str_field("fp16") {
            None => Ok(Fp16Policy::Auto),
            Some(raw) => Fp16Policy::parse(raw)
                .ok_or_else(|| ModelError::Config(format!("Invalid fp16 value {raw}"))),
        }
    }

    /// The raw `model` value (string, or list for mixes).
    pub fn model(&self) -> Option<&Value> {
        self.data.get("model")
    }

    /// The `model` value when it is a plain string.
    pub fn model_text(&self) -> Option<&str> {
        self.str_field("model")
    }

    pub fn model_is_empty(&self) -> bool {
        self.model_text() == Some(EMPTY_MODEL)
    }

    pub fn model_is_reference(&self) -> bool {
        self.model_text()
            .map(|m| m.starts_with(REFERENCE_PREFIX))
            .unwrap_or(false)
    }

    pub fn reference(&self) -> Result<Option<ModelReference>, ModelError> {
        match self.model_text() {
            Some(m) if m != EMPTY_MODEL && m.starts_with(REFERENCE_PREFIX) => {
                ModelReference::parse(m).map(Some)
            }
            _ => Ok(None),
        }
    }

    pub fn local_model(&self) -> Option<&str> {
        self.str_field("local_model")
    }

    pub fn local_model_fp16(&self) -> Option<String> {
        match self.str_field("local_model_fp16") {
            Some(path) if !path.is_empty() => Some(path.to_string()),
            _ => self
                .local_model()
                .filter(|p| !p.is_empty())
                .map(|p| format!("{p}-fp16")),
        }
    }

    pub fn subfolder(&self) -> Option<&str> {
        self.str_field("subfolder").filter(|s| !s.is_empty())
    }

    pub fn safe_only(&self) -> bool {
        self.bool_field("safe_only").unwrap_or(false)
    }

    pub fn use_auth_token(&self) -> bool {
        self.bool_field("use_auth_token").unwrap_or(false)
    }

    pub fn urls(&self) -> Option<&Value> {
        self.data.get("urls")
    }

    pub fn whitelist(&self) -> Vec<String> {
        self.string_list("whitelist")
    }

    pub fn blacklist(&self) -> Vec<String> {
        self.string_list("blacklist")
    }

    pub fn allow_patterns(&self) -> Vec<String> {
        self.string_list("allow_patterns")
    }

    pub fn ignore_patterns(&self) -> Vec<String> {
        self.string_list("ignore_patterns")
    }

    /// Component-name → override entries, in key order.
    pub fn overrides(&self) -> Vec<(String, Value)> {
        match self.data.get("overrides") {
            Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            _ => Vec::new(),
        }
    }

    pub fn mix(&self) -> Option<&Map<String, Value>> {
        self.data.get("mix").and_then(Value::as_object)
    }

    pub fn options(&self) -> Option<&Value> {
        self.data.get("options").filter(|v| !v.is_null())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(&key.to_lowercase())
    }

    /// Opaque access to any key, including ones this type knows nothing about.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(&key.to_lowercase())
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    fn bool_field(&self, key: &str) -> Option<bool> {
        self.data.get(key).and_then(Value::as_bool)
    }

    fn string_list(&self, key: &str) -> Vec<String> {
        match self.data.get(key) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Parse a list of records into descriptors.
pub fn parse_descriptors(values: Vec<Value>) -> Result<Vec<ConfigDescriptor>, ModelError> {
    values.into_iter().map(ConfigDescriptor::from_value).collect()
}

/// Load descriptors from a `.toml` (`[[engines]]`) or `.json` file.
///
/// JSON files may hold either a bare array of records or an object with an
/// `engines` array.
pub fn load_descriptor_file(path: &Path) -> Result<Vec<ConfigDescriptor>, ModelError> {
    let content = std::fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);

    let root: Value = if is_toml {
        toml::from_str(&content).map_err(|e| ModelError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    } else {
        serde_json::from_str(&content).map_err(|e| ModelError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };

    let records = match root {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("engines") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(ModelError::Manifest {
                    path: path.to_path_buf(),
                    reason: "expected an `engines` list".into(),
                })
            }
        },
        _ => {
            return Err(ModelError::Manifest {
                path: path.to_path_buf(),
                reason: "expected a list of engine records".into(),
            })
        }
    };

    parse_descriptors(records)
}
