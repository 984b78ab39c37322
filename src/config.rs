// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Runtime configuration loading from environment variables.
//!
//! All configuration values are loaded from `GYRE_*` environment variables
//! with sensible defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GYRE_WEIGHT_ROOT` | `./weights` | Root for relative `local_model` paths |
//! | `GYRE_CACHE_DIR` | `$XDG_CACHE_HOME/gyre` | Download cache for URL weights |
//! | `GYRE_REFRESH_MODELS` | (none) | Comma-separated patterns always fetched fresh |
//! | `GYRE_REFRESH_ON_ERROR` | false | Evict and re-download when every source fails |
//! | `GYRE_VRAM_OPTIMISATION` | 2 | VRAM optimisation level, 0 to 5 |
//! | `GYRE_DEVICES` | `cpu` | Comma-separated `cuda:N`, `mps` or `cpu` |
//! | `GYRE_NSFW_BEHAVIOUR` | `block` | Safety checker policy: block, flag or ignore |
//! | `GYRE_BATCH_AUTODETECT` | false | Detect max batch sizes at startup |
//! | `GYRE_BATCH_POINTS` | (none) | JSON `[[pixels, max], ...]` breakpoints |
//! | `GYRE_BATCH_MAX` | 1 | Max batch when no breakpoints are known |
//! | `GYRE_BATCH_SAFETY_MARGIN` | 0.2 | Memory held back during autodetection |
//! | `HF_API_TOKEN` | (none) | HuggingFace credential token |

use std::path::PathBuf;

use serde::Serialize;

use crate::engine::{BatchMode, ComputeDevice, EngineMode, EngineSettings};
use crate::models::{ResolverSettings, SafetyPolicy};

const DEFAULT_VRAM_LEVEL: u8 = 2;
const MAX_SAFETY_MARGIN: f64 = 0.9;

/// Effective runtime configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub weight_root: String,
    pub cache_dir: String,
    pub refresh_models: Vec<String>,
    pub refresh_on_error: bool,
    pub vram_level: u8,
    pub devices: Vec<String>,
    pub fp16: bool,
    pub nsfw_behaviour: String,
    pub batch_autodetect: bool,
    pub batch_points: Vec<(u64, u32)>,
    pub batch_max: u32,
    pub batch_safety_margin: f64,
    pub auth_token_set: bool,
}

/// All runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub weight_root: PathBuf,
    pub cache_dir: PathBuf,
    pub refresh_models: Vec<String>,
    pub refresh_on_error: bool,
    pub vram_level: u8,
    pub devices: Vec<ComputeDevice>,
    pub safety: SafetyPolicy,
    pub batch: BatchMode,
    pub auth_token: Option<String>,
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse an `f64` env var, returning `default` on missing or invalid.
fn parse_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a boolean env var. Accepts 1/0, true/false, yes/no, on/off.
fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Split a comma-separated env var, dropping empty items.
fn parse_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|val| {
            val.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn default_cache_dir() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CACHE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join("gyre");
    }
    match std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        Some(home) => PathBuf::from(home).join(".cache").join("gyre"),
        None => PathBuf::from(".cache").join("gyre"),
    }
}

/// Load device list. Unparseable entries are skipped; an empty result
/// falls back to a single CPU device.
fn load_devices() -> Vec<ComputeDevice> {
    let mut devices: Vec<ComputeDevice> = parse_list("GYRE_DEVICES")
        .iter()
        .filter_map(|raw| match raw.parse() {
            Ok(device) => Some(device),
            Err(e) => {
                tracing::warn!(device = %raw, error = %e, "Ignoring device");
                None
            }
        })
        .collect();
    devices.dedup();
    if devices.is_empty() {
        devices.push(ComputeDevice::cpu());
    }
    devices
}

/// Load batch configuration from environment.
fn load_batch_mode() -> BatchMode {
    let points = match std::env::var("GYRE_BATCH_POINTS") {
        Ok(raw) if !raw.trim().is_empty() => BatchMode::parse_points(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Ignoring invalid GYRE_BATCH_POINTS");
            Vec::new()
        }),
        _ => Vec::new(),
    };
    let simplemax = parse_u32("GYRE_BATCH_MAX", 1).max(1);
    let safety_margin = parse_f64("GYRE_BATCH_SAFETY_MARGIN", 0.2).clamp(0.0, MAX_SAFETY_MARGIN);

    BatchMode {
        autodetect: parse_bool("GYRE_BATCH_AUTODETECT", false),
        simplemax: Some(simplemax),
        safety_margin,
        ..BatchMode::default()
    }
    .with_points(points)
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    let weight_root = std::env::var_os("GYRE_WEIGHT_ROOT")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./weights"));
    let cache_dir = std::env::var_os("GYRE_CACHE_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_cache_dir);

    let vram_level = parse_u32("GYRE_VRAM_OPTIMISATION", DEFAULT_VRAM_LEVEL as u32).min(5) as u8;
    let safety = std::env::var("GYRE_NSFW_BEHAVIOUR")
        .ok()
        .and_then(|raw| SafetyPolicy::parse(raw.trim()))
        .unwrap_or_default();
    let auth_token = std::env::var("HF_API_TOKEN").ok().filter(|t| !t.is_empty());

    EnvConfig {
        weight_root,
        cache_dir,
        refresh_models: parse_list("GYRE_REFRESH_MODELS"),
        refresh_on_error: parse_bool("GYRE_REFRESH_ON_ERROR", false),
        vram_level,
        devices: load_devices(),
        safety,
        batch: load_batch_mode(),
        auth_token,
    }
}

impl EnvConfig {
    /// Mode of the primary device.
    pub fn engine_mode(&self) -> EngineMode {
        let kind = self.devices.first().map(|d| d.kind).unwrap_or_default();
        EngineMode::new(self.vram_level, kind)
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            weight_root: self.weight_root.clone(),
            cache_dir: self.cache_dir.clone(),
            refresh_models: self.refresh_models.clone(),
            refresh_on_error: self.refresh_on_error,
            fp16: self.engine_mode().fp16(),
            auth_token: self.auth_token.clone(),
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            devices: self.devices.clone(),
            vram_level: self.vram_level,
            batch: self.batch.clone(),
        }
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            weight_root: self.weight_root.display().to_string(),
            cache_dir: self.cache_dir.display().to_string(),
            refresh_models: self.refresh_models.clone(),
            refresh_on_error: self.refresh_on_error,
            vram_level: self.vram_level,
            devices: self.devices.iter().map(ToString::to_string).collect(),
            fp16: self.engine_mode().fp16(),
            nsfw_behaviour: format!("{:?}", self.safety).to_lowercase(),
            batch_autodetect: self.batch.autodetect,
            batch_points: self.batch.points.clone(),
            batch_max: self.batch.simplemax.unwrap_or(1),
            batch_safety_margin: self.batch.safety_margin,
            auth_token_set: self.auth_token.is_some(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::DeviceKind;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "GYRE_WEIGHT_ROOT",
        "GYRE_CACHE_DIR",
        "GYRE_REFRESH_MODELS",
        "GYRE_REFRESH_ON_ERROR",
        "GYRE_VRAM_OPTIMISATION",
        "GYRE_DEVICES",
        "GYRE_NSFW_BEHAVIOUR",
        "GYRE_BATCH_AUTODETECT",
        "GYRE_BATCH_POINTS",
        "GYRE_BATCH_MAX",
        "GYRE_BATCH_SAFETY_MARGIN",
        "HF_API_TOKEN",
    ];

    pub(crate) fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.weight_root, PathBuf::from("./weights"));
        assert!(cfg.cache_dir.ends_with("gyre"));
        assert!(cfg.refresh_models.is_empty());
        assert!(!cfg.refresh_on_error);
        assert_eq!(cfg.vram_level, 2);
        assert_eq!(cfg.devices, vec![ComputeDevice::cpu()]);
        assert_eq!(cfg.safety, SafetyPolicy::Block);
        assert!(!cfg.batch.autodetect);
        assert!(cfg.batch.points.is_empty());
        assert_eq!(cfg.batch.simplemax, Some(1));
        assert!(cfg.auth_token.is_none());
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GYRE_WEIGHT_ROOT", "/srv/weights");
        std::env::set_var("GYRE_REFRESH_MODELS", "org/*, other/model");
        std::env::set_var("GYRE_REFRESH_ON_ERROR", "yes");
        std::env::set_var("GYRE_DEVICES", "cuda:0,cuda:1");
        std::env::set_var("GYRE_NSFW_BEHAVIOUR", "flag");
        std::env::set_var("GYRE_BATCH_POINTS", "[[1048576,4],[262144,16]]");
        std::env::set_var("HF_API_TOKEN", "hf_secret");
        let cfg = load();
        assert_eq!(cfg.weight_root, PathBuf::from("/srv/weights"));
        assert_eq!(cfg.refresh_models, vec!["org/*", "other/model"]);
        assert!(cfg.refresh_on_error);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[1], ComputeDevice::cuda(1));
        assert_eq!(cfg.safety, SafetyPolicy::Flag);
        assert_eq!(cfg.batch.points[0], (262_144, 16));
        assert_eq!(cfg.auth_token.as_deref(), Some("hf_secret"));
        assert!(cfg.resolver_settings().fp16);
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GYRE_VRAM_OPTIMISATION", "lots");
        std::env::set_var("GYRE_DEVICES", "tpu:0");
        std::env::set_var("GYRE_NSFW_BEHAVIOUR", "scream");
        std::env::set_var("GYRE_BATCH_POINTS", "not json");
        std::env::set_var("GYRE_BATCH_AUTODETECT", "maybe");
        let cfg = load();
        assert_eq!(cfg.vram_level, 2);
        assert_eq!(cfg.devices, vec![ComputeDevice::cpu()]);
        assert_eq!(cfg.safety, SafetyPolicy::Block);
        assert!(cfg.batch.points.is_empty());
        assert!(!cfg.batch.autodetect);
        clear_env_vars();
    }

    #[test]
    fn test_values_are_clamped() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GYRE_VRAM_OPTIMISATION", "42");
        std::env::set_var("GYRE_BATCH_SAFETY_MARGIN", "3.5");
        std::env::set_var("GYRE_BATCH_MAX", "0");
        let cfg = load();
        assert_eq!(cfg.vram_level, 5);
        assert!(cfg.batch.safety_margin <= MAX_SAFETY_MARGIN);
        assert_eq!(cfg.batch.simplemax, Some(1));
        clear_env_vars();
    }

    #[test]
    fn test_cpu_mode_never_uses_fp16() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GYRE_VRAM_OPTIMISATION", "5");
        let cfg = load();
        assert_eq!(cfg.engine_mode().device(), DeviceKind::Cpu);
        assert!(!cfg.resolver_settings().fp16);
        clear_env_vars();
    }

    #[test]
    fn test_effective_config_hides_token() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("HF_API_TOKEN", "hf_secret");
        let eff = load().effective_config();
        assert!(eff.auth_token_set);
        let json = serde_json::to_string(&eff).unwrap();
        assert!(!json.contains("hf_secret"));
        assert_eq!(eff.nsfw_behaviour, "block");
        clear_env_vars();
    }
}
