//! Host emulation of the device program.
//!
//! [`ReferenceDispatcher`] walks the same `num_cu x num_pe` lane grid the
//! device program uses and performs every arithmetic step in `f32`, storing
//! results as `f16`. It is the dispatcher used by tests and by hosts without
//! an OpenCL runtime.

use crate::dispatch::{KernelDispatcher, LaunchRequest};
use crate::params::{ConvPass, KernelParams, TagMode};
use half::f16;
use hwcn_common::{KernelError, Result};
use log::debug;

/// Source coordinate read by output coordinate `o` at kernel tap `k`.
///
/// With input dilation `dil`, only every `dil`-th position of the virtual
/// dilated input holds a real element; all others read as zero.
#[inline]
fn source_index(o: usize, k: usize, stride: usize, pad: isize, dil: usize, extent: usize) -> Option<usize> {
    let i = (o * stride + k) as isize - pad;
    if i < 0 {
        return None;
    }
    let i = i as usize;
    if i % dil != 0 {
        return None;
    }
    let i = i / dil;
    (i < extent).then_some(i)
}

/// Contiguous share `[begin, end)` of `total` items owned by compute unit `cu`.
#[inline]
fn cu_share(cu: usize, per_cu: usize, total: usize) -> std::ops::Range<usize> {
    let begin = (cu * per_cu).min(total);
    begin..(begin + per_cu).min(total)
}

fn check_coverage(params: &KernelParams, total: usize, what: &str) -> Result<()> {
    if params.num_cu * params.work_per_cu < total {
        return Err(KernelError::InvalidArguments {
            reason: format!(
                "{} compute units x {} {what} do not cover {total} {what}",
                params.num_cu, params.work_per_cu
            ),
        }
        .into());
    }
    Ok(())
}

/// Host dispatcher with launch bookkeeping.
#[derive(Debug, Default, Clone)]
pub struct ReferenceDispatcher {
    launches: Vec<ConvPass>,
}

impl ReferenceDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Passes launched so far, in order.
    pub fn launches(&self) -> &[ConvPass] {
        &self.launches
    }

    pub fn clear_launches(&mut self) {
        self.launches.clear();
    }

    /// Pre-activation value of output `(oy, ox, oc, n)` in group `g`.
    #[allow(clippy::too_many_arguments)]
    fn correlate_point(
        p: &KernelParams,
        request: &LaunchRequest<'_>,
        oy: usize,
        ox: usize,
        g: usize,
        oc: usize,
        n: usize,
    ) -> f32 {
        let n_img = p.num_images;
        let mut acc = if p.apply_bias { request.bias[oc].to_f32() } else { 0.0 };
        for ky in 0..p.ksize {
            let Some(iy) = source_index(oy, ky, p.stride, p.pad, p.dilation, p.in_y) else {
                continue;
            };
            for kx in 0..p.ksize {
                let Some(ix) = source_index(ox, kx, p.stride, p.pad, p.dilation, p.in_x) else {
                    continue;
                };
                let base = ((iy * p.in_x + ix) * p.in_total() + g * p.in_channels) * n_img + n;
                for c in 0..p.in_channels {
                    let idx = base + c * n_img;
                    if p.tag_mode == TagMode::MaskInput && request.tags[idx] == 0 {
                        continue;
                    }
                    let w = request.filter[p.packed_weight_offset(oc, ky, kx, c)];
                    acc += request.input[idx].to_f32() * w.to_f32();
                }
            }
        }
        acc
    }

    fn correlate(p: &KernelParams, mut request: LaunchRequest<'_>) -> Result<()> {
        check_coverage(p, p.out_y, "rows")?;
        let n_img = p.num_images;

        for cu in 0..p.num_cu {
            for oy in cu_share(cu, p.work_per_cu, p.out_y) {
                for ox in 0..p.out_x {
                    for g in 0..p.groups {
                        for burst in (0..p.out_channels_padded).step_by(p.burst_oc) {
                            for pe in 0..p.num_pe {
                                // Trailing lanes of the last burst idle.
                                for o in (burst + pe..burst + p.burst_oc)
                                    .step_by(p.num_pe)
                                    .take_while(|&o| o < p.out_channels)
                                {
                                    let oc = g * p.out_channels + o;
                                    for n in 0..n_img {
                                        let mut acc = Self::correlate_point(p, &request, oy, ox, g, oc, n);
                                        let out_idx = ((oy * p.out_x + ox) * p.out_total() + oc) * n_img + n;
                                        if p.tag_mode == TagMode::Record {
                                            let open = acc > 0.0;
                                            request.tags[out_idx] = i32::from(open);
                                            if !open {
                                                acc = 0.0;
                                            }
                                        }
                                        request.output[out_idx] = f16::from_f32(acc);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn backward_bias(params: &KernelParams, mut request: LaunchRequest<'_>) -> Result<()> {
        let lanes = params.out_channels;
        check_coverage(params, lanes, "lanes")?;
        let p = params;
        let spatial = p.in_y * p.in_x;

        for cu in 0..p.num_cu {
            let share = cu_share(cu, p.work_per_cu, lanes);
            for pe in 0..p.num_pe {
                for lane in (share.start + pe..share.end).step_by(p.num_pe) {
                    // Per-image partial sums, then batch order.
                    let mut total = 0.0f32;
                    for n in 0..p.num_images {
                        let mut partial = 0.0f32;
                        for s in 0..spatial {
                            let idx = (s * p.in_channels + lane) * p.num_images + n;
                            if p.tag_mode == TagMode::MaskInput && request.tags[idx] == 0 {
                                continue;
                            }
                            partial += request.input[idx].to_f32();
                        }
                        total += partial;
                    }
                    request.output[lane] = f16::from_f32(total);
                }
            }
        }
        Ok(())
    }

    fn backward_weights(params: &KernelParams, mut request: LaunchRequest<'_>) -> Result<()> {
        let p = params;
        let (k, ic) = (p.ksize, p.in_channels);
        let elements = p.out_total() * k * k * ic;
        check_coverage(params, elements, "weight elements")?;
        let n_img = p.num_images;
        let (in_total, out_total) = (p.in_total(), p.out_total());

        for cu in 0..p.num_cu {
            let share = cu_share(cu, p.work_per_cu, elements);
            for pe in 0..p.num_pe {
                for e in (share.start + pe..share.end).step_by(p.num_pe) {
                    let c = e % ic;
                    let kx = (e / ic) % k;
                    let ky = (e / (ic * k)) % k;
                    let oc = e / (ic * k * k);
                    let g = oc / p.out_channels;

                    let mut acc = 0.0f32;
                    for n in 0..n_img {
                        for oy in 0..p.out_y {
                            let Some(iy) = source_index(oy, ky, p.stride, p.pad, p.dilation, p.in_y)
                            else {
                                continue;
                            };
                            for ox in 0..p.out_x {
                                let Some(ix) =
                                    source_index(ox, kx, p.stride, p.pad, p.dilation, p.in_x)
                                else {
                                    continue;
                                };
                                let x_idx = ((iy * p.in_x + ix) * in_total + g * ic + c) * n_img + n;
                                let dy_idx = ((oy * p.out_x + ox) * out_total + oc) * n_img + n;
                                let masked = match p.tag_mode {
                                    TagMode::MaskInput => request.tags[x_idx] == 0,
                                    TagMode::MaskFilter => request.tags[dy_idx] == 0,
                                    TagMode::Ignore | TagMode::Record => false,
                                };
                                if masked {
                                    continue;
                                }
                                acc += request.input[x_idx].to_f32() * request.filter[dy_idx].to_f32();
                            }
                        }
                    }
                    request.output[p.packed_weight_offset(oc, ky, kx, c)] = f16::from_f32(acc);
                    if c == 0 {
                        for pad_lane in ic..p.in_channels_padded {
                            request.output[p.packed_weight_offset(oc, ky, kx, pad_lane)] = f16::ZERO;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

impl KernelDispatcher for ReferenceDispatcher {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn launch(&mut self, request: LaunchRequest<'_>) -> Result<()> {
        let params = request.validate()?;
        debug!("reference launch {params}");
        self.launches.push(params.pass);
        match params.pass {
            ConvPass::Forward | ConvPass::BackwardData => Self::correlate(&params, request),
            ConvPass::BackwardBias => Self::backward_bias(&params, request),
            ConvPass::BackwardWeights => Self::backward_weights(&params, request),
        }
    }
}
