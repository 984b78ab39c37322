// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! CLI module for offline Gyre engine commands.
//!
//! ## Usage
//!
//! ```bash
//! gyre-engine-cli check engines.toml   # Parse and validate references
//! gyre-engine-cli plan engines.toml    # Show weight source order per entry
//! gyre-engine-cli save engines.toml 'sd-*'  # Write engine weights as safetensors
//! gyre-engine-cli batchmax 655360      # Advised max batch for a pixel count
//! gyre-engine-cli config show          # Show effective configuration
//! ```

pub mod config_cmd;
pub mod models_cmd;

pub use models_cmd::{run_check, run_plan, run_save};

use crate::config;

/// Run `batchmax <pixels>` against the configured breakpoints.
///
/// Returns exit code: 0 on success, 2 on an invalid pixel count.
pub fn run_batchmax(pixels: &str) -> i32 {
    let pixels = match parse_pixels(pixels) {
        Some(p) => p,
        None => {
            eprintln!("Error: expected a pixel count or WIDTHxHEIGHT, got '{}'", pixels);
            return 2;
        }
    };
    let batch = config::load().batch;
    println!("{}", batch.batchmax(pixels));
    0
}

/// Accept `655360` or `1280x512`.
fn parse_pixels(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    match raw.split_once(['x', 'X']) {
        Some((w, h)) => {
            let w: u64 = w.trim().parse().ok()?;
            let h: u64 = h.trim().parse().ok()?;
            w.checked_mul(h)
        }
        None => raw.parse().ok(),
    }
}
