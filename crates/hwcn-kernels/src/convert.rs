//! Conversions between general precision (`f32`) and the packed `f16`
//! compute format.
//!
//! Activations keep their H x W x C x N order and are converted element-wise.
//! Filters are re-laid-out from the framework's `[O][C/G][K][K]` order into
//! the packed `[O][K][K][C_pad]` order the device program reads, with the
//! `weight_pad` trailing lanes of every row zero-filled.
//!
//! Downcasts do not check for overflow: values beyond the `f16` range become
//! infinities, which is what the accelerator's own conversion does. Upcasts
//! are exact, but precision dropped by an earlier downcast is not recovered.

use crate::params::KernelParams;
use half::f16;
use half::slice::HalfFloatSliceExt;
use hwcn_common::{KernelError, Result};

fn check_len(what: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(KernelError::InvalidArguments {
            reason: format!("{what}: expected {expected} elements, got {got}"),
        }
        .into());
    }
    Ok(())
}

// ── Activations ─────────────────────────────────────────────────────────────

/// Element-wise downcast.
pub fn to_compact_half(general: &[f32]) -> Vec<f16> {
    let mut out = vec![f16::ZERO; general.len()];
    out.convert_from_f32_slice(general);
    out
}

/// Element-wise downcast into an existing buffer of the same length.
pub fn to_compact_half_into(general: &[f32], out: &mut [f16]) -> Result<()> {
    check_len("half activation buffer", general.len(), out.len())?;
    out.convert_from_f32_slice(general);
    Ok(())
}

/// Element-wise upcast.
pub fn to_general(half: &[f16]) -> Vec<f32> {
    half.to_f32_vec()
}

/// Element-wise upcast into an existing buffer of the same length.
pub fn to_general_into(half: &[f16], out: &mut [f32]) -> Result<()> {
    check_len("general activation buffer", half.len(), out.len())?;
    half.convert_to_f32_slice(out);
    Ok(())
}

// ── Filters ─────────────────────────────────────────────────────────────────

/// Reverse both spatial axes of every `k x k` filter. An involution.
pub fn flip_spatial(weights: &[f32], k: usize) -> Vec<f32> {
    let mut out = weights.to_vec();
    let area = k * k;
    if area > 0 {
        // Flipping rows and columns of a row-major square is a full reversal.
        for filter in out.chunks_mut(area) {
            filter.reverse();
        }
    }
    out
}

/// Downcast and pack `[O][C/G][K][K]` filters for `params`.
pub fn to_compact_half_weights(weights: &[f32], params: &KernelParams) -> Result<Vec<f16>> {
    let mut out = vec![f16::ZERO; params.packed_weight_len()];
    to_compact_half_weights_into(weights, params, &mut out)?;
    Ok(out)
}

/// [`to_compact_half_weights`] into an existing buffer.
pub fn to_compact_half_weights_into(
    weights: &[f32],
    params: &KernelParams,
    out: &mut [f16],
) -> Result<()> {
    let (oc_total, ic, k) = (params.out_total(), params.in_channels, params.ksize);
    check_len("general weights", oc_total * ic * k * k, weights.len())?;
    check_len("packed half weights", params.packed_weight_len(), out.len())?;

    out.fill(f16::ZERO);
    for oc in 0..oc_total {
        for c in 0..ic {
            for ky in 0..k {
                for kx in 0..k {
                    let src = ((oc * ic + c) * k + ky) * k + kx;
                    out[params.packed_weight_offset(oc, ky, kx, c)] = f16::from_f32(weights[src]);
                }
            }
        }
    }
    Ok(())
}

/// Rotate filters by 180 degrees, transpose the channel roles, downcast and
/// pack for the backward-data parameter set.
///
/// `weights` is `[O][C][K][K]`; with backward-data params that is
/// `[in_channels][out_channels][K][K]`. The packed result is indexed by the
/// backward-data output channel (the forward input channel).
pub fn rotate_weights_half(weights: &[f32], params: &KernelParams) -> Result<Vec<f16>> {
    let mut out = vec![f16::ZERO; params.packed_weight_len()];
    rotate_weights_half_into(weights, params, &mut out)?;
    Ok(out)
}

/// [`rotate_weights_half`] into an existing buffer.
pub fn rotate_weights_half_into(
    weights: &[f32],
    params: &KernelParams,
    out: &mut [f16],
) -> Result<()> {
    let (filters, channels, k) = (params.in_channels, params.out_total(), params.ksize);
    check_len("general weights", filters * channels * k * k, weights.len())?;
    check_len("rotated half weights", params.packed_weight_len(), out.len())?;

    let flipped = flip_spatial(weights, k);
    out.fill(f16::ZERO);
    for o in 0..filters {
        for c in 0..channels {
            for ky in 0..k {
                for kx in 0..k {
                    let src = ((o * channels + c) * k + ky) * k + kx;
                    out[params.packed_weight_offset(c, ky, kx, o)] = f16::from_f32(flipped[src]);
                }
            }
        }
    }
    Ok(())
}

fn unpack_weights(
    half: &[f16],
    shape: &[usize],
    params: &KernelParams,
    mut store: impl FnMut(usize, f32),
) -> Result<()> {
    let (oc_total, ic, k) = (params.out_total(), params.in_channels, params.ksize);
    if shape != [oc_total, ic, k, k] {
        return Err(KernelError::InvalidArguments {
            reason: format!("weight shape {shape:?} does not match [{oc_total}, {ic}, {k}, {k}]"),
        }
        .into());
    }
    check_len("packed half weights", params.packed_weight_len(), half.len())?;

    for oc in 0..oc_total {
        for c in 0..ic {
            for ky in 0..k {
                for kx in 0..k {
                    let dst = ((oc * ic + c) * k + ky) * k + kx;
                    store(dst, half[params.packed_weight_offset(oc, ky, kx, c)].to_f32());
                }
            }
        }
    }
    Ok(())
}

/// Unpack and upcast packed filters back to `[O][C/G][K][K]`.
pub fn to_general_weights(half: &[f16], shape: &[usize], params: &KernelParams) -> Result<Vec<f32>> {
    let mut out = vec![0.0f32; shape.iter().product()];
    unpack_weights(half, shape, params, |i, v| out[i] = v)?;
    Ok(out)
}

/// Unpack and upcast packed filters, adding them into `grad`.
pub fn accumulate_general_weights(
    half: &[f16],
    shape: &[usize],
    params: &KernelParams,
    grad: &mut [f32],
) -> Result<()> {
    check_len("weight gradient", shape.iter().product(), grad.len())?;
    unpack_weights(half, shape, params, |i, v| grad[i] += v)
}
