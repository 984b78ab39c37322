// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Batch-size advice.
//!
//! Maximum batch sizes are described by `(pixel count, max batch)`
//! breakpoints, interpolated linearly between neighbours. Breakpoints can be
//! configured or discovered empirically by [`BatchMode::run_autodetect`].

use serde::{Deserialize, Serialize};

/// Height used for every autodetect trial.
pub const AUTODETECT_HEIGHT: u32 = 512;
/// First width tried.
pub const AUTODETECT_MIN_WIDTH: u32 = 512;
pub const AUTODETECT_RESMAX: u32 = 2048;
pub const AUTODETECT_RESSTEP: u32 = 256;
/// Upper bound for the first search. 512x512 at this batch fails regardless
/// of available memory.
pub const AUTODETECT_START: u32 = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMode {
    pub autodetect: bool,
    pub points: Vec<(u64, u32)>,
    pub simplemax: Option<u32>,
    pub safety_margin: f64,
}

impl Default for BatchMode {
    fn default() -> Self {
        Self {
            autodetect: false,
            points: Vec::new(),
            simplemax: Some(1),
            safety_margin: 0.2,
        }
    }
}

impl BatchMode {
    pub fn with_points(mut self, mut points: Vec<(u64, u32)>) -> Self {
        points.sort_by_key(|(pixels, _)| *pixels);
        self.points = points;
        self
    }

    /// Parse breakpoints from their JSON form, e.g. `[[262144,16],[1048576,4]]`.
    pub fn parse_points(raw: &str) -> Result<Vec<(u64, u32)>, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Largest advisable batch for an image of `pixels` pixels.
    pub fn batchmax(&self, pixels: u64) -> u32 {
        let Some(&(first_pixels, first_max)) = self.points.first() else {
            return self.simplemax.unwrap_or(1);
        };

        if pixels <= first_pixels {
            return first_max;
        }

        for pair in self.points.windows(2) {
            let (p0, b0) = pair[0];
            let (p1, b1) = pair[1];
            if pixels >= p0 && pixels <= p1 {
                if p1 == p0 {
                    return b0;
                }
                let i = (pixels - p0) as f64 / (p1 - p0) as f64;
                let max = b0 as f64 + i * (b1 as f64 - b0 as f64);
                return max.floor().max(0.0) as u32;
            }
        }

        1
    }

    /// Discover breakpoints by trial generations.
    ///
    /// `try_batch(width, height, batch)` returns true when a generation of that
    /// size succeeds. For each width from 512 up to (not including) `resmax`
    /// the largest working batch is found by binary search, seeded with the
    /// previous width's result. Probing stops at the first width whose max is 1.
    pub fn run_autodetect<F>(&mut self, mut try_batch: F, resmax: u32, resstep: u32) -> &[(u64, u32)]
    where
        F: FnMut(u32, u32, u32) -> bool,
    {
        let mut points = Vec::new();
        let mut l = AUTODETECT_START;
        let step = resstep.max(1) as usize;

        for width in (AUTODETECT_MIN_WIDTH..resmax).step_by(step) {
            tracing::info!(width, height = AUTODETECT_HEIGHT, "Determining max batch");
            let mut r = l;
            l = 1;

            while l + 1 < r {
                let b = (l + r) / 2;
                tracing::debug!(width, batch = b, "Trying batch size");
                if try_batch(width, AUTODETECT_HEIGHT, b) {
                    l = b;
                } else {
                    r = b;
                }
            }

            tracing::info!(width, max = l, "Max batch found");
            points.push((width as u64 * AUTODETECT_HEIGHT as u64, l));

            if l == 1 {
                tracing::info!(width, height = AUTODETECT_HEIGHT, "Max resolution reached");
                break;
            }
        }

        tracing::info!(
            points = %serde_json::to_string(&points).unwrap_or_default(),
            "Batch breakpoints detected; set GYRE_BATCH_POINTS to reuse them"
        );
        self.points = points;
        &self.points
    }
}
