// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Engine execution mode: device kind plus VRAM optimisation level.
//!
//! Levels are cumulative and only take effect on CUDA devices:
//!
//! | Level | Effect |
//! |---|---|
//! | 1 | attention and VAE slicing |
//! | 2 | fp16 weights |
//! | 3 | defer the denoiser until first use |
//! | 4 | defer everything except the resident CLIP model |
//! | 5 | defer everything |

use super::device::DeviceKind;

/// Highest meaningful optimisation level.
pub const MAX_VRAM_LEVEL: u8 = 5;

/// Class of the main denoising network.
pub const DENOISER_CLASS: &str = "UNet2DConditionModel";
/// Class kept on-device when everything else is deferred.
pub const RESIDENT_CLASS: &str = "CLIPModel";

/// Which modules an activation defers until first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayPolicy {
    None,
    Denoiser,
    AllExceptResident,
    All,
}

impl DelayPolicy {
    /// Should a module of `class_name` be deferred?
    pub fn defers(&self, class_name: &str) -> bool {
        match self {
            DelayPolicy::None => false,
            DelayPolicy::Denoiser => class_name == DENOISER_CLASS,
            DelayPolicy::AllExceptResident => class_name != RESIDENT_CLASS,
            DelayPolicy::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineMode {
    vram_level: u8,
    device: DeviceKind,
}

impl Default for EngineMode {
    fn default() -> Self {
        Self::new(0, DeviceKind::Cpu)
    }
}

impl EngineMode {
    pub fn new(vram_level: u8, device: DeviceKind) -> Self {
        Self {
            vram_level: vram_level.min(MAX_VRAM_LEVEL),
            device,
        }
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn vram_level(&self) -> u8 {
        self.vram_level
    }

    fn cuda_level_above(&self, level: u8) -> bool {
        self.device == DeviceKind::Cuda && self.vram_level > level
    }

    pub fn attention_slice(&self) -> bool {
        self.cuda_level_above(0)
    }

    pub fn fp16(&self) -> bool {
        self.cuda_level_above(1)
    }

    pub fn unet_exclusion(&self) -> bool {
        self.cuda_level_above(2)
    }

    pub fn allexceptclip_exclusion(&self) -> bool {
        self.cuda_level_above(3)
    }

    pub fn all_exclusion(&self) -> bool {
        self.cuda_level_above(4)
    }

    pub fn delay_policy(&self) -> DelayPolicy {
        if self.all_exclusion() {
            DelayPolicy::All
        } else if self.allexceptclip_exclusion() {
            DelayPolicy::AllExceptResident
        } else if self.unet_exclusion() {
            DelayPolicy::Denoiser
        } else {
            DelayPolicy::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_only_apply_on_cuda() {
        let cpu = EngineMode::new(5, DeviceKind::Cpu);
        assert!(!cpu.attention_slice());
        assert!(!cpu.fp16());
        assert_eq!(cpu.delay_policy(), DelayPolicy::None);
    }

    #[test]
    fn test_cuda_levels_are_cumulative() {
        let two = EngineMode::new(2, DeviceKind::Cuda);
        assert!(two.attention_slice() && two.fp16());
        assert_eq!(two.delay_policy(), DelayPolicy::None);

        assert_eq!(EngineMode::new(3, DeviceKind::Cuda).delay_policy(), DelayPolicy::Denoiser);
        assert_eq!(
            EngineMode::new(4, DeviceKind::Cuda).delay_policy(),
            DelayPolicy::AllExceptResident
        );
        assert_eq!(EngineMode::new(9, DeviceKind::Cuda).delay_policy(), DelayPolicy::All);
    }

    #[test]
    fn test_delay_policy_classes() {
        assert!(DelayPolicy::Denoiser.defers(DENOISER_CLASS));
        assert!(!DelayPolicy::Denoiser.defers("AutoencoderKL"));
        assert!(DelayPolicy::AllExceptResident.defers("AutoencoderKL"));
        assert!(!DelayPolicy::AllExceptResident.defers(RESIDENT_CLASS));
        assert!(DelayPolicy::All.defers(RESIDENT_CLASS));
    }
}
