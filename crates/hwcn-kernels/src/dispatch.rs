//! Kernel dispatch seam.
//!
//! A [`KernelDispatcher`] runs one pass of the device program against bound
//! half-precision buffers. Launches are synchronous: when `launch` returns,
//! `output` and `tags` hold the results.

use crate::params::{ConvPass, KernelParams, TagMode};
use half::f16;
use hwcn_common::{KernelError, Result};

/// Buffers and parameters for one launch, bound by position.
///
/// `filter` holds packed weights for the correlate passes and the
/// conv-output gradient for backward-weights. `bias` is only read when the
/// parameters ask for it; callers without a bias pass a placeholder.
#[derive(Debug)]
pub struct LaunchRequest<'a> {
    pub input: &'a [f16],
    pub filter: &'a [f16],
    pub bias: &'a [f16],
    pub output: &'a mut [f16],
    pub tags: &'a mut [i32],
    pub params: &'a [i32],
    pub groups: usize,
}

fn too_short(what: &str, needed: usize, got: usize) -> KernelError {
    KernelError::InvalidArguments { reason: format!("{what} buffer holds {got} elements, pass needs {needed}") }
}

impl LaunchRequest<'_> {
    /// Decode the parameter words and check every buffer against them.
    pub fn validate(&self) -> Result<KernelParams> {
        let params = KernelParams::from_words(self.params)?;
        if params.groups != self.groups {
            return Err(KernelError::InvalidArguments {
                reason: format!(
                    "group count {} does not match parameter words ({})",
                    self.groups, params.groups
                ),
            }
            .into());
        }
        if params.num_pe == 0 || params.burst_oc == 0 || params.burst_oc % params.num_pe != 0 {
            return Err(KernelError::InvalidArguments {
                reason: format!(
                    "burst_oc {} is not a positive multiple of num_pe {}",
                    params.burst_oc, params.num_pe
                ),
            }
            .into());
        }

        let checks = [
            ("input", params.input_len(), self.input.len()),
            ("filter", params.filter_buffer_len(), self.filter.len()),
            ("output", params.output_buffer_len(), self.output.len()),
            ("tag", params.tag_buffer_len(), self.tags.len()),
        ];
        for (what, needed, got) in checks {
            if got < needed {
                return Err(too_short(what, needed, got).into());
            }
        }
        if params.apply_bias && self.bias.len() < params.out_total() {
            return Err(too_short("bias", params.out_total(), self.bias.len()).into());
        }
        if params.tag_mode == TagMode::MaskFilter && params.pass != ConvPass::BackwardWeights {
            return Err(KernelError::InvalidArguments {
                reason: format!("filter masking is not defined for the {} pass", params.pass),
            }
            .into());
        }
        Ok(params)
    }
}

/// Something that can run the device program.
pub trait KernelDispatcher: Send {
    fn name(&self) -> &'static str;
    fn is_available(&self) -> bool;
    /// Run one pass and block until it completes.
    fn launch(&mut self, request: LaunchRequest<'_>) -> Result<()>;
}

impl<D: KernelDispatcher + ?Sized> KernelDispatcher for Box<D> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn launch(&mut self, request: LaunchRequest<'_>) -> Result<()> {
        (**self).launch(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> KernelParams {
        KernelParams {
            pass: ConvPass::Forward,
            groups: 1,
            num_images: 1,
            in_y: 2,
            in_x: 2,
            in_channels: 1,
            in_channels_padded: 2,
            out_y: 2,
            out_x: 2,
            out_channels: 1,
            out_channels_padded: 2,
            ksize: 1,
            stride: 1,
            pad: 0,
            dilation: 1,
            num_cu: 1,
            num_pe: 2,
            burst_oc: 2,
            work_per_cu: 2,
            reduce_extent: 1,
            weight_pad: 1,
            tag_mode: TagMode::Record,
            apply_bias: true,
        }
    }

    #[test]
    fn well_sized_request_decodes() {
        let words = params().to_words().unwrap();
        let (input, filter, bias) = (vec![f16::ZERO; 4], vec![f16::ZERO; 2], vec![f16::ZERO; 1]);
        let (mut output, mut tags) = (vec![f16::ZERO; 4], vec![0; 4]);
        let request = LaunchRequest {
            input: &input,
            filter: &filter,
            bias: &bias,
            output: &mut output,
            tags: &mut tags,
            params: &words,
            groups: 1,
        };
        assert_eq!(request.validate().unwrap(), params());
    }

    #[test]
    fn short_tag_buffer_is_rejected() {
        let words = params().to_words().unwrap();
        let (input, filter, bias) = (vec![f16::ZERO; 4], vec![f16::ZERO; 2], vec![f16::ZERO; 1]);
        let (mut output, mut tags) = (vec![f16::ZERO; 4], vec![0; 3]);
        let request = LaunchRequest {
            input: &input,
            filter: &filter,
            bias: &bias,
            output: &mut output,
            tags: &mut tags,
            params: &words,
            groups: 1,
        };
        let err = request.validate().unwrap_err().to_string();
        assert!(err.contains("tag buffer"), "{err}");
    }

    #[test]
    fn missing_bias_is_rejected_only_when_applied() {
        let words = params().to_words().unwrap();
        let no_bias = params().with_bias(false).to_words().unwrap();
        let (input, filter) = (vec![f16::ZERO; 4], vec![f16::ZERO; 2]);
        let (mut output, mut tags) = (vec![f16::ZERO; 4], vec![0; 4]);
        let mut request = LaunchRequest {
            input: &input,
            filter: &filter,
            bias: &[],
            output: &mut output,
            tags: &mut tags,
            params: &words,
            groups: 1,
        };
        assert!(request.validate().is_err());
        request.params = &no_bias;
        assert!(request.validate().is_ok());
    }
}
