// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Compute devices, device slots and the pools that share them.
//!
//! The [`DevicePool`] is the only blocking primitive in the engine: callers
//! wait in arrival order for a free slot, and the returned [`DeviceLease`]
//! hands the slot back when dropped, including during unwinding.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use super::wrapper::PipelineWrapper;
use crate::telemetry;

/// Compute backend of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceKind {
    /// NVIDIA CUDA
    Cuda,
    /// Apple Metal Performance Shaders
    Mps,
    #[default]
    Cpu,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Cuda => write!(f, "cuda"),
            DeviceKind::Mps => write!(f, "mps"),
            DeviceKind::Cpu => write!(f, "cpu"),
        }
    }
}

/// One addressable compute device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ComputeDevice {
    pub kind: DeviceKind,
    pub index: usize,
}

impl ComputeDevice {
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn cuda(index: usize) -> Self {
        Self {
            kind: DeviceKind::Cuda,
            index,
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cuda => write!(f, "cuda:{}", self.index),
            kind => write!(f, "{kind}"),
        }
    }
}

impl FromStr for ComputeDevice {
    type Err = String;

    /// Parse `cuda`, `cuda:N`, `mps` or `cpu`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let (kind, index) = match s.split_once(':') {
            Some((kind, index)) => (
                kind.to_string(),
                index
                    .parse::<usize>()
                    .map_err(|_| format!("invalid device index in '{s}'"))?,
            ),
            None => (s.clone(), 0),
        };

        let kind = match kind.as_str() {
            "cuda" => DeviceKind::Cuda,
            "mps" => DeviceKind::Mps,
            "cpu" => DeviceKind::Cpu,
            other => return Err(format!("unknown device kind '{other}'")),
        };
        Ok(Self { kind, index })
    }
}

/// A device plus the pipeline currently resident on it.
#[derive(Debug)]
pub struct DeviceSlot {
    device: ComputeDevice,
    resident: Option<PipelineWrapper>,
}

impl DeviceSlot {
    pub fn new(device: ComputeDevice) -> Self {
        Self {
            device,
            resident: None,
        }
    }

    pub fn device(&self) -> &ComputeDevice {
        &self.device
    }

    pub fn resident(&self) -> Option<&PipelineWrapper> {
        self.resident.as_ref()
    }

    pub fn resident_mut(&mut self) -> Option<&mut PipelineWrapper> {
        self.resident.as_mut()
    }

    pub fn take_resident(&mut self) -> Option<PipelineWrapper> {
        self.resident.take()
    }

    pub fn set_resident(&mut self, wrapper: PipelineWrapper) {
        self.resident = Some(wrapper);
    }
}

struct PoolState {
    free: VecDeque<DeviceSlot>,
    next_ticket: u64,
    serving: u64,
}

/// Fixed set of device slots handed out in arrival order.
pub struct DevicePool {
    state: Mutex<PoolState>,
    available: Condvar,
    size: usize,
}

impl DevicePool {
    /// An empty device list gets a single cpu slot.
    pub fn new(mut devices: Vec<ComputeDevice>) -> Self {
        if devices.is_empty() {
            tracing::warn!("No compute devices given, using cpu");
            devices.push(ComputeDevice::cpu());
        }
        let size = devices.len();
        Self {
            state: Mutex::new(PoolState {
                free: devices.into_iter().map(DeviceSlot::new).collect(),
                next_ticket: 0,
                serving: 0,
            }),
            available: Condvar::new(),
            size,
        }
    }

    /// Block until a slot is free. Callers are served first come, first
    /// served.
    pub fn acquire(&self) -> DeviceLease<'_> {
        let started = Instant::now();
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        let slot = loop {
            if state.serving == ticket {
                if let Some(slot) = state.free.pop_front() {
                    state.serving += 1;
                    break slot;
                }
            }
            self.available.wait(&mut state);
        };
        drop(state);
        // The next ticket holder may find another free slot.
        self.available.notify_all();

        let waited = started.elapsed();
        telemetry::record_device_wait(waited);
        tracing::debug!(device = %slot.device, waited_ms = waited.as_millis() as u64, "Device slot leased");

        DeviceLease {
            pool: self,
            slot: Some(slot),
        }
    }

    fn release(&self, slot: DeviceSlot) {
        self.state.lock().free.push_back(slot);
        self.available.notify_all();
    }

    /// Total number of slots.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots not currently leased.
    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }
}

/// Exclusive use of one device slot. Returns the slot to its pool on drop.
pub struct DeviceLease<'a> {
    pool: &'a DevicePool,
    slot: Option<DeviceSlot>,
}

impl Deref for DeviceLease<'_> {
    type Target = DeviceSlot;

    fn deref(&self) -> &DeviceSlot {
        // Only `Drop` takes the slot.
        match &self.slot {
            Some(slot) => slot,
            None => unreachable!("device lease used after release"),
        }
    }
}

impl DerefMut for DeviceLease<'_> {
    fn deref_mut(&mut self) -> &mut DeviceSlot {
        match &mut self.slot {
            Some(slot) => slot,
            None => unreachable!("device lease used after release"),
        }
    }
}

impl Drop for DeviceLease<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            tracing::debug!(device = %slot.device, "Device slot released");
            self.pool.release(slot);
        }
    }
}

/// Deactivated pipelines waiting for reuse, per engine id.
#[derive(Default)]
pub struct PipelinePools {
    pools: DashMap<String, Mutex<VecDeque<PipelineWrapper>>>,
}

impl PipelinePools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, wrapper: PipelineWrapper) {
        self.pools
            .entry(wrapper.id().to_string())
            .or_default()
            .lock()
            .push_back(wrapper);
    }

    /// Take a pooled pipeline for `id` without waiting.
    pub fn try_take(&self, id: &str) -> Option<PipelineWrapper> {
        self.pools.get(id)?.lock().pop_front()
    }

    pub fn len(&self, id: &str) -> usize {
        self.pools.get(id).map(|p| p.lock().len()).unwrap_or(0)
    }

    /// Drop every pooled pipeline for `id`, returning how many there were.
    pub fn clear(&self, id: &str) -> usize {
        self.pools
            .remove(id)
            .map(|(_, pool)| pool.into_inner().len())
            .unwrap_or(0)
    }
}
