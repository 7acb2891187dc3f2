//! Embedding normalization.
//!
//! Every extracted vector is rescaled independently by `1 / scale`, where
//! `scale` depends on the configured [`Norm`]. A non-positive scale (all-zero
//! input) maps the vector to zeros.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound of the max-absolute normalization, kept just below `i16::MAX`.
pub const INT16_RANGE: f64 = 32760.0;

/// Normalization applied to every output vector of a run.
///
/// Serialized as the integer codes used on the command line: `-1` none,
/// `0` max-absolute, `2` Euclidean, any other positive `p` a p-norm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Norm {
    None,
    MaxAbsInt16,
    #[default]
    Euclidean,
    PNorm(u32),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid embedding normalization {0} (expected -1, 0, or a positive p-norm)")]
pub struct InvalidNorm(pub i32);

impl TryFrom<i32> for Norm {
    type Error = InvalidNorm;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            -1 => Ok(Self::None),
            0 => Ok(Self::MaxAbsInt16),
            2 => Ok(Self::Euclidean),
            p if p > 0 => Ok(Self::PNorm(p.unsigned_abs())),
            other => Err(InvalidNorm(other)),
        }
    }
}

impl From<Norm> for i32 {
    fn from(norm: Norm) -> Self {
        match norm {
            Norm::None => -1,
            Norm::MaxAbsInt16 => 0,
            Norm::Euclidean => 2,
            Norm::PNorm(p) => i32::try_from(p).unwrap_or(i32::MAX),
        }
    }
}

/// Computes the divisor for `v` under `norm`.
pub fn scale(v: &[f32], norm: Norm) -> f64 {
    match norm {
        Norm::None => 1.0,
        Norm::MaxAbsInt16 => {
            let max = v.iter().fold(0.0f64, |m, x| m.max(f64::from(x.abs())));
            max / INT16_RANGE
        }
        Norm::Euclidean => v
            .iter()
            .map(|&x| f64::from(x) * f64::from(x))
            .sum::<f64>()
            .sqrt(),
        Norm::PNorm(p) => {
            let p = f64::from(p);
            v.iter()
                .map(|&x| f64::from(x.abs()).powf(p))
                .sum::<f64>()
                .powf(1.0 / p)
        }
    }
}

/// Writes the normalized `inp` into `out`. Both slices must have the same
/// length; extra elements of the longer slice are left alone.
pub fn normalize_into(inp: &[f32], out: &mut [f32], norm: Norm) {
    let s = scale(inp, norm);
    let factor = if s > 0.0 { (1.0 / s) as f32 } else { 0.0 };

    for (o, &x) in out.iter_mut().zip(inp) {
        *o = x * factor;
    }
}

/// Returns a normalized copy of `raw`.
pub fn normalize(raw: &[f32], norm: Norm) -> Vec<f32> {
    let mut out = vec![0.0f32; raw.len()];
    normalize_into(raw, &mut out, norm);
    out
}
