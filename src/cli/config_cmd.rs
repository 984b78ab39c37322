// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Config CLI subcommands: show, defaults, validate.
//!
//! These commands read configuration directly from environment variables.

use crate::config::{self, EffectiveConfig};

/// Print effective config as key-value pairs to stdout.
pub fn run_show(json: bool) -> i32 {
    let cfg = config::load().effective_config();
    if json {
        match serde_json::to_string_pretty(&cfg) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    } else {
        print_config(&cfg);
    }
    0
}

/// Print default config values (no env overrides) to stdout.
pub fn run_defaults() {
    println!("GYRE_WEIGHT_ROOT=./weights");
    println!("GYRE_CACHE_DIR=$XDG_CACHE_HOME/gyre");
    println!("GYRE_REFRESH_MODELS=");
    println!("GYRE_REFRESH_ON_ERROR=false");
    println!("GYRE_VRAM_OPTIMISATION=2");
    println!("GYRE_DEVICES=cpu");
    println!("GYRE_NSFW_BEHAVIOUR=block");
    println!("GYRE_BATCH_AUTODETECT=false");
    println!("GYRE_BATCH_POINTS=");
    println!("GYRE_BATCH_MAX=1");
    println!("GYRE_BATCH_SAFETY_MARGIN=0.2");
}

/// Validate configuration for obvious misconfigurations.
///
/// Returns 0 if valid, 1 if any warnings are found.
pub fn run_validate() -> i32 {
    let env = config::load();
    let mut warnings = 0;

    if !env.weight_root.is_dir() {
        eprintln!(
            "WARNING: GYRE_WEIGHT_ROOT ({}) is not a directory",
            env.weight_root.display()
        );
        warnings += 1;
    }

    if env.batch.autodetect && !env.batch.points.is_empty() {
        eprintln!("WARNING: GYRE_BATCH_POINTS is ignored when GYRE_BATCH_AUTODETECT is set");
        warnings += 1;
    }

    let mode = env.engine_mode();
    let vram_set = std::env::var_os("GYRE_VRAM_OPTIMISATION").is_some();
    if vram_set && mode.vram_level() > 0 && !mode.attention_slice() {
        eprintln!("WARNING: GYRE_VRAM_OPTIMISATION only applies to CUDA devices");
        warnings += 1;
    }

    if warnings == 0 {
        println!("Configuration is valid.");
        0
    } else {
        1
    }
}

fn print_config(cfg: &EffectiveConfig) {
    println!("GYRE_WEIGHT_ROOT={}", cfg.weight_root);
    println!("GYRE_CACHE_DIR={}", cfg.cache_dir);
    println!("GYRE_REFRESH_MODELS={}", cfg.refresh_models.join(","));
    println!("GYRE_REFRESH_ON_ERROR={}", cfg.refresh_on_error);
    println!("GYRE_VRAM_OPTIMISATION={}", cfg.vram_level);
    println!("GYRE_DEVICES={}", cfg.devices.join(","));
    println!("GYRE_NSFW_BEHAVIOUR={}", cfg.nsfw_behaviour);
    println!("GYRE_BATCH_AUTODETECT={}", cfg.batch_autodetect);
    println!(
        "GYRE_BATCH_POINTS={}",
        serde_json::to_string(&cfg.batch_points).unwrap_or_default()
    );
    println!("GYRE_BATCH_MAX={}", cfg.batch_max);
    println!("GYRE_BATCH_SAFETY_MARGIN={}", cfg.batch_safety_margin);
    println!("fp16={}", cfg.fp16);
    println!("HF_API_TOKEN={}", if cfg.auth_token_set { "(set)" } else { "(unset)" });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{clear_env_vars, ENV_LOCK};

    #[test]
    fn test_validate_passes_with_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let root = tempfile::tempdir().unwrap();
        std::env::set_var("GYRE_WEIGHT_ROOT", root.path());
        assert_eq!(run_validate(), 0);
        clear_env_vars();
    }

    #[test]
    fn test_validate_warns_on_missing_weight_root() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GYRE_WEIGHT_ROOT", "/nonexistent/gyre/weights");
        assert_eq!(run_validate(), 1);
        clear_env_vars();
    }

    #[test]
    fn test_validate_warns_on_vram_level_without_cuda() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let root = tempfile::tempdir().unwrap();
        std::env::set_var("GYRE_WEIGHT_ROOT", root.path());
        std::env::set_var("GYRE_VRAM_OPTIMISATION", "3");
        assert_eq!(run_validate(), 1);
        std::env::set_var("GYRE_DEVICES", "cuda:0");
        assert_eq!(run_validate(), 0);
        clear_env_vars();
    }

    #[test]
    fn test_show_json_succeeds() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        assert_eq!(run_show(true), 0);
        assert_eq!(run_show(false), 0);
    }
}
