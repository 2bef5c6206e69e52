//! Output-shape computation and group partitioning.
//!
//! Everything downstream of this module works on the *conv-equivalent*
//! geometry: `input` is the tensor the convolution slides over and `output`
//! is what it produces. For a deconvolution layer the layer's top plays the
//! conv-input role and the layer's bottom the conv-output role.

use hwcn_common::{ConfigError, ConvConfig, ConvMode, HwcnShape};

/// Output extent of one spatial axis for a strided, padded convolution.
fn conv_extent(
    axis: &'static str,
    input: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
) -> Result<usize, ConfigError> {
    let padded = input + 2 * pad;
    if padded < kernel {
        return Err(ConfigError::KernelExceedsInput { axis, input, kernel, pad });
    }
    if stride == 0 {
        return Err(ConfigError::ZeroValue("stride"));
    }
    Ok((padded - kernel) / stride + 1)
}

fn deconv_extent(
    axis: &'static str,
    input: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
) -> Result<usize, ConfigError> {
    let full = stride * input.saturating_sub(1) + kernel;
    if input == 0 || full <= 2 * pad {
        return Err(ConfigError::InvalidDeconvShape { axis, input, kernel, stride, pad });
    }
    Ok(full - 2 * pad)
}

/// `out = floor((in + 2*pad - K) / stride) + 1` on both axes.
///
/// Fails when the kernel is larger than the padded input.
pub fn compute_output_shape(
    in_h: usize,
    in_w: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
) -> Result<(usize, usize), ConfigError> {
    Ok((
        conv_extent("height", in_h, kernel, stride, pad)?,
        conv_extent("width", in_w, kernel, stride, pad)?,
    ))
}

/// `out = stride * (in - 1) + K - 2*pad` on both axes.
pub fn compute_deconv_output_shape(
    in_h: usize,
    in_w: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
) -> Result<(usize, usize), ConfigError> {
    Ok((
        deconv_extent("height", in_h, kernel, stride, pad)?,
        deconv_extent("width", in_w, kernel, stride, pad)?,
    ))
}

/// Channel partition across filter groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSplit {
    pub groups: usize,
    pub in_per_group: usize,
    pub out_per_group: usize,
}

/// Split `in_channels` and `out_channels` evenly across `groups`.
pub fn split_groups(
    in_channels: usize,
    out_channels: usize,
    groups: usize,
) -> Result<GroupSplit, ConfigError> {
    if groups == 0 {
        return Err(ConfigError::ZeroValue("group"));
    }
    if in_channels % groups != 0 {
        return Err(ConfigError::GroupMismatch { which: "input", channels: in_channels, groups });
    }
    if out_channels % groups != 0 {
        return Err(ConfigError::GroupMismatch { which: "output", channels: out_channels, groups });
    }
    Ok(GroupSplit {
        groups,
        in_per_group: in_channels / groups,
        out_per_group: out_channels / groups,
    })
}

/// Resolved shapes of one convolution invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub mode: ConvMode,
    /// Conv input (what the filter slides over).
    pub input: HwcnShape,
    /// Conv output.
    pub output: HwcnShape,
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
    pub split: GroupSplit,
}

impl ConvGeometry {
    /// Resolve the conv-equivalent geometry of a layer fed with `bottom`.
    pub fn resolve(config: &ConvConfig, bottom: HwcnShape) -> Result<Self, ConfigError> {
        if bottom.channels == 0 {
            return Err(ConfigError::ZeroValue("input channels"));
        }
        if bottom.num == 0 {
            return Err(ConfigError::ZeroValue("batch size"));
        }
        let (kernel, stride, pad) = (config.kernel_size(), config.stride_size(), config.pad_size());

        match config.mode {
            ConvMode::Convolution => {
                let split = split_groups(bottom.channels, config.num_output, config.group)?;
                let (oh, ow) = compute_output_shape(bottom.height, bottom.width, kernel, stride, pad)?;
                Ok(Self {
                    mode: config.mode,
                    input: bottom,
                    output: HwcnShape::new(oh, ow, config.num_output, bottom.num),
                    kernel,
                    stride,
                    pad,
                    split,
                })
            }
            ConvMode::Deconvolution => {
                let split = split_groups(config.num_output, bottom.channels, config.group)?;
                let (th, tw) =
                    compute_deconv_output_shape(bottom.height, bottom.width, kernel, stride, pad)?;
                Ok(Self {
                    mode: config.mode,
                    input: HwcnShape::new(th, tw, config.num_output, bottom.num),
                    output: bottom,
                    kernel,
                    stride,
                    pad,
                    split,
                })
            }
        }
    }

    /// Shape of the layer's bottom blob.
    pub fn bottom(&self) -> HwcnShape {
        match self.mode {
            ConvMode::Convolution => self.input,
            ConvMode::Deconvolution => self.output,
        }
    }

    /// Shape of the layer's top blob.
    pub fn top(&self) -> HwcnShape {
        match self.mode {
            ConvMode::Convolution => self.output,
            ConvMode::Deconvolution => self.input,
        }
    }

    /// Framework weight blob shape `[O, C/G, K, K]` in conv-equivalent terms.
    pub fn weight_shape(&self) -> [usize; 4] {
        [self.output.channels, self.split.in_per_group, self.kernel, self.kernel]
    }

    /// Channels of the layer output, which is what the bias is added to.
    pub fn bias_len(&self) -> usize {
        self.top().channels
    }
}

/// Backward passes that need weights or data gradients cannot be computed
/// group-partitioned.
pub fn check_backward_groups(
    split: &GroupSplit,
    needs_data: bool,
    needs_weights: bool,
) -> Result<(), ConfigError> {
    if split.groups > 1 && (needs_data || needs_weights) {
        return Err(ConfigError::GroupBackwardUnsupported { groups: split.groups });
    }
    Ok(())
}
