// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Descriptor file subcommands: check, plan, save.
//!
//! All work offline from the descriptor file and the environment. Nothing
//! is downloaded; `save` only reads weights already on disk.

use std::path::Path;
use std::sync::Arc;

use crate::config;
use crate::models::persist::safetensors_components;
use crate::models::{
    load_descriptor_file, ConfigDescriptor, ModelLoader, ModelRegistry, OfflineFetcher,
    OfflineHub, SafetensorsWriter, WeightResolver,
};

/// Run `check <file>`: parse every descriptor and validate references.
///
/// Returns exit code: 0 when valid, 2 on a configuration error.
pub fn run_check(path: &Path) -> i32 {
    let descriptors = match load_descriptor_file(path) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };

    print_descriptors(&descriptors);

    match ModelRegistry::validate_references(&descriptors) {
        Ok(()) => {
            println!("Configuration is valid.");
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            2
        }
    }
}

/// Run `plan <file>`: print the order weight sources would be tried in for
/// every enabled entry that loads weights.
pub fn run_plan(path: &Path) -> i32 {
    let descriptors = match load_descriptor_file(path) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };

    let env = config::load();
    let resolver = WeightResolver::new(
        env.resolver_settings(),
        Arc::new(OfflineHub),
        Arc::new(OfflineFetcher),
    );

    for desc in descriptors.iter().filter(|d| d.enabled()) {
        println!("{}", desc.human_id());
        if desc.model_is_empty() {
            println!("  (empty model set)");
        } else if desc.model_is_reference() {
            println!("  reference {}", desc.model_text().unwrap_or_default());
        } else if desc.kind() == "mix" {
            println!("  mix of {} inputs", desc.model().and_then(|m| m.as_array()).map_or(0, Vec::len));
        } else {
            for (i, candidate) in resolver.candidates(desc).iter().enumerate() {
                println!("  {}. {}", i + 1, candidate);
            }
        }
        for (name, _) in desc.overrides() {
            println!("  override {}", name);
        }
    }
    0
}

/// Run `save <file> <pattern>...`: write the weights behind matching engines
/// (or models, with `models`) to their local model folders as safetensors.
///
/// Returns exit code: 0 on success, 1 when saving fails, 2 on a
/// configuration error.
pub fn run_save(path: &Path, patterns: &[String], models: bool) -> i32 {
    let descriptors = match load_descriptor_file(path) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };
    if let Err(e) = ModelRegistry::validate_references(&descriptors) {
        eprintln!("Error: {}", e);
        return 2;
    }

    let env = config::load();
    let settings = env.resolver_settings();
    let fp16 = settings.fp16;
    let resolver = WeightResolver::new(settings, Arc::new(OfflineHub), Arc::new(OfflineFetcher));
    let loader = ModelLoader::new(Arc::new(safetensors_components()), env.safety, fp16);
    let registry = ModelRegistry::new(Arc::new(descriptors), resolver, loader);

    let result = if models {
        registry.save_models(patterns, &SafetensorsWriter)
    } else {
        registry.save_engines(patterns, &SafetensorsWriter)
    };
    match result {
        Ok(saved) if saved.is_empty() => {
            println!("Nothing matched {}", patterns.join(", "));
            0
        }
        Ok(saved) => {
            for out in saved {
                println!("Saved {}", out.display());
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

/// Print a table of descriptors to stdout.
pub fn print_descriptors(descriptors: &[ConfigDescriptor]) {
    if descriptors.is_empty() {
        println!("No engines or models defined.");
        return;
    }

    println!(
        "{:<32} {:<16} {:<10} {:<8}",
        "IDENTITY", "TYPE", "TASK", "ENABLED"
    );
    println!("{}", "-".repeat(69));

    for d in descriptors {
        println!(
            "{:<32} {:<16} {:<10} {:<8}",
            truncate(&d.human_id(), 31),
            truncate(&d.kind(), 15),
            d.task().unwrap_or_else(|| "-".to_string()),
            if d.enabled() { "yes" } else { "no" },
        );
    }

    let engines = descriptors.iter().filter(|d| d.is_engine()).count();
    println!("{}", "-".repeat(69));
    println!("{} engine(s), {} model(s)", engines, descriptors.len() - engines);
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
