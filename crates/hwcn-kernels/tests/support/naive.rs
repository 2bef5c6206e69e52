//! Direct f32 convolution used as the oracle for layer tests.
//!
//! Weights are `[O][C/G][K][K]` and activations H x W x C x N, matching the
//! layer's framework-side layouts.

#![allow(dead_code)]

use hwcn_kernels::HwcnShape;

#[derive(Debug, Clone, Copy)]
pub struct ConvDims {
    pub k: usize,
    pub stride: usize,
    pub pad: usize,
    pub groups: usize,
}

impl ConvDims {
    pub fn new(k: usize, stride: usize, pad: usize) -> Self {
        Self { k, stride, pad, groups: 1 }
    }

    pub fn with_groups(self, groups: usize) -> Self {
        Self { groups, ..self }
    }

    pub fn output_shape(&self, input: HwcnShape, out_channels: usize) -> HwcnShape {
        let extent = |i: usize| (i + 2 * self.pad - self.k) / self.stride + 1;
        HwcnShape::new(extent(input.height), extent(input.width), out_channels, input.num)
    }

    /// Input coordinate under output `o` at tap `t`, if inside the input.
    fn source(&self, o: usize, t: usize, extent: usize) -> Option<usize> {
        let i = (o * self.stride + t) as isize - self.pad as isize;
        (i >= 0 && (i as usize) < extent).then_some(i as usize)
    }

    fn weight_index(&self, oc: usize, c: usize, ky: usize, kx: usize, cg: usize) -> usize {
        ((oc * cg + c) * self.k + ky) * self.k + kx
    }

    /// Visit every `(x offset, y offset, weight index)` triple of the correlation.
    fn for_each_tap(&self, xs: HwcnShape, ys: HwcnShape, mut visit: impl FnMut(usize, usize, usize)) {
        let cg = xs.channels / self.groups;
        let og = ys.channels / self.groups;
        for oy in 0..ys.height {
            for ox in 0..ys.width {
                for oc in 0..ys.channels {
                    let g = oc / og;
                    for n in 0..ys.num {
                        for ky in 0..self.k {
                            let Some(iy) = self.source(oy, ky, xs.height) else { continue };
                            for kx in 0..self.k {
                                let Some(ix) = self.source(ox, kx, xs.width) else { continue };
                                for c in 0..cg {
                                    visit(
                                        xs.offset(iy, ix, g * cg + c, n),
                                        ys.offset(oy, ox, oc, n),
                                        self.weight_index(oc, c, ky, kx, cg),
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// `y = conv(x, w) + bias`, no activation.
    pub fn forward(
        &self,
        x: &[f32],
        xs: HwcnShape,
        w: &[f32],
        bias: Option<&[f32]>,
        out_channels: usize,
    ) -> (Vec<f32>, HwcnShape) {
        let ys = self.output_shape(xs, out_channels);
        let mut y = vec![0.0f32; ys.count()];
        if let Some(b) = bias {
            for (i, v) in y.iter_mut().enumerate() {
                *v = b[(i / ys.num) % ys.channels];
            }
        }
        self.for_each_tap(xs, ys, |xi, yi, wi| y[yi] += x[xi] * w[wi]);
        (y, ys)
    }

    /// Gradient with respect to the input.
    pub fn backward_data(&self, dy: &[f32], ys: HwcnShape, w: &[f32], xs: HwcnShape) -> Vec<f32> {
        let mut dx = vec![0.0f32; xs.count()];
        self.for_each_tap(xs, ys, |xi, yi, wi| dx[xi] += dy[yi] * w[wi]);
        dx
    }

    /// Gradient with respect to the weights.
    pub fn backward_weights(&self, x: &[f32], xs: HwcnShape, dy: &[f32], ys: HwcnShape) -> Vec<f32> {
        let cg = xs.channels / self.groups;
        let mut dw = vec![0.0f32; ys.channels * cg * self.k * self.k];
        self.for_each_tap(xs, ys, |xi, yi, wi| dw[wi] += dy[yi] * x[xi]);
        dw
    }
}

/// Per-channel sum over space and batch.
pub fn channel_sums(values: &[f32], shape: HwcnShape) -> Vec<f32> {
    let mut sums = vec![0.0f32; shape.channels];
    for (i, v) in values.iter().enumerate() {
        sums[(i / shape.num) % shape.channels] += v;
    }
    sums
}

pub fn relu(values: &[f32]) -> Vec<f32> {
    values.iter().map(|&v| v.max(0.0)).collect()
}

/// `grad` with entries zeroed where `pre` did not pass the ReLU.
pub fn gate(grad: &[f32], pre: &[f32]) -> Vec<f32> {
    grad.iter().zip(pre).map(|(&g, &p)| if p > 0.0 { g } else { 0.0 }).collect()
}

/// Deterministic values on a `step` grid, exactly representable in f16.
pub fn pattern(len: usize, seed: usize, step: f32) -> Vec<f32> {
    (0..len).map(|i| ((i * 7 + seed * 13) % 17) as f32 * step - 8.0 * step).collect()
}

pub fn assert_close(actual: &[f32], expected: &[f32], what: &str) {
    assert_eq!(actual.len(), expected.len(), "{what}: length");
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let tol = 1e-2 * e.abs().max(1.0);
        assert!((a - e).abs() <= tol, "{what}[{i}]: got {a}, expected {e}");
    }
}
