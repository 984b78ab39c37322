// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Dense parameter tensors carried by loaded model components.
//!
//! Storage is always `f32`; the dtype tag records whether the values were
//! rounded through half precision at load time.

use std::collections::BTreeMap;
use std::fmt;

use half::f16;

/// Ordered parameter name → tensor mapping of one component.
pub type StateDict = BTreeMap<String, Tensor>;

/// Element precision of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DType {
    #[default]
    F32,
    F16,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "float32"),
            DType::F16 => write!(f, "float16"),
        }
    }
}

/// Errors raised by tensor construction and slicing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TensorError {
    #[error("shape {shape:?} needs {expected} elements, got {actual}")]
    ElementCount {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("operation needs rank >= 2, got shape {0:?}")]
    RankTooLow(Vec<usize>),

    #[error("cannot narrow dim 1 of {shape:?} to {len}")]
    NarrowOutOfRange { shape: Vec<usize>, len: usize },

    #[error("shapes differ: {0:?} vs {1:?}")]
    ShapeMismatch(Vec<usize>, Vec<usize>),
}

/// A dense row-major tensor.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
    dtype: DType,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, TensorError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TensorError::ElementCount {
                shape,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            shape,
            data,
            dtype: DType::F32,
        })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, 0.0)
    }

    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![value; len],
            dtype: DType::F32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size in bytes at the tagged precision.
    pub fn size_bytes(&self) -> usize {
        match self.dtype {
            DType::F32 => self.data.len() * 4,
            DType::F16 => self.data.len() * 2,
        }
    }

    /// Round every value through half precision and retag as F16.
    pub fn to_f16(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .map(|v| f16::from_f32(*v).to_f32())
                .collect(),
            dtype: DType::F16,
        }
    }

    /// Element-wise combination of same-shaped tensors.
    ///
    /// The result keeps the dtype of `self`.
    pub fn zip_map<F>(&self, others: &[&Tensor], f: F) -> Result<Self, TensorError>
    where
        F: Fn(f32, &[f32]) -> f32,
    {
        for other in others {
            if other.shape != self.shape {
                return Err(TensorError::ShapeMismatch(
                    self.shape.clone(),
                    other.shape.clone(),
                ));
            }
        }

        let mut scratch = vec![0.0f32; others.len()];
        let data = self
            .data
            .iter()
            .enumerate()
            .map(|(i, a)| {
                for (slot, other) in scratch.iter_mut().zip(others) {
                    *slot = other.data[i];
                }
                f(*a, &scratch)
            })
            .collect();

        Ok(Self {
            shape: self.shape.clone(),
            data,
            dtype: self.dtype,
        })
    }

    /// Copy of the leading `len` entries along dim 1.
    pub fn narrow_dim1(&self, len: usize) -> Result<Self, TensorError> {
        let (outer, dim1, inner) = self.split_dim1()?;
        if len > dim1 {
            return Err(TensorError::NarrowOutOfRange {
                shape: self.shape.clone(),
                len,
            });
        }

        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let start = o * dim1 * inner;
            data.extend_from_slice(&self.data[start..start + len * inner]);
        }

        let mut shape = self.shape.clone();
        shape[1] = len;
        Ok(Self {
            shape,
            data,
            dtype: self.dtype,
        })
    }

    /// Copy of `self` with the leading entries of dim 1 replaced by `part`.
    ///
    /// `part` must match `self` in every dimension except dim 1, where it may
    /// be shorter.
    pub fn splice_dim1(&self, part: &Tensor) -> Result<Self, TensorError> {
        let (outer, dim1, inner) = self.split_dim1()?;
        let mismatch = || TensorError::ShapeMismatch(self.shape.clone(), part.shape.clone());

        if part.shape.len() != self.shape.len()
            || part.shape[0] != self.shape[0]
            || part.shape[2..] != self.shape[2..]
            || part.shape[1] > dim1
        {
            return Err(mismatch());
        }

        let len = part.shape[1];
        let mut data = self.data.clone();
        for o in 0..outer {
            let dst = o * dim1 * inner;
            let src = o * len * inner;
            data[dst..dst + len * inner].copy_from_slice(&part.data[src..src + len * inner]);
        }

        Ok(Self {
            shape: self.shape.clone(),
            data,
            dtype: self.dtype,
        })
    }

    fn split_dim1(&self) -> Result<(usize, usize, usize), TensorError> {
        if self.shape.len() < 2 {
            return Err(TensorError::RankTooLow(self.shape.clone()));
        }
        let inner: usize = self.shape[2..].iter().product();
        Ok((self.shape[0], self.shape[1], inner))
    }
}
