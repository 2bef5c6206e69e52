//! Kernel parameter planning.
//!
//! Derives the four launch parameter sets of a convolution from its resolved
//! geometry and the accelerator topology. All four sets are produced together
//! by [`KernelPlanner::plan`]; a layer replaces its whole [`ConvPlan`] on every
//! reshape and never mixes sets from different shapes.

use crate::params::{ConvPass, KernelParams, TagMode};
use crate::shape::ConvGeometry;
use hwcn_common::{AcceleratorTopology, ConvMode, HwcnShape, Result, ceil_div, round_down, round_up};
use log::{debug, warn};

/// Parameter sets for every pass of one geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvPlan {
    pub forward: KernelParams,
    pub backward_data: KernelParams,
    pub backward_bias: KernelParams,
    pub backward_weights: KernelParams,
}

impl ConvPlan {
    /// Parameter set driving the layer's forward pass.
    ///
    /// A deconvolution layer's forward pass is the conv-equivalent's
    /// backward-data pass.
    pub fn layer_forward(&self, mode: ConvMode) -> &KernelParams {
        match mode {
            ConvMode::Convolution => &self.forward,
            ConvMode::Deconvolution => &self.backward_data,
        }
    }

    /// Parameter set driving the layer's backward-data pass.
    pub fn layer_backward_data(&self, mode: ConvMode) -> &KernelParams {
        match mode {
            ConvMode::Convolution => &self.backward_data,
            ConvMode::Deconvolution => &self.forward,
        }
    }
}

/// Sizes kernel launches for one accelerator topology.
#[derive(Debug, Clone)]
pub struct KernelPlanner {
    topology: AcceleratorTopology,
}

impl KernelPlanner {
    pub fn new(topology: AcceleratorTopology) -> Result<Self> {
        topology.validate()?;
        Ok(Self { topology })
    }

    pub fn topology(&self) -> &AcceleratorTopology {
        &self.topology
    }

    /// Output channels per burst: a multiple of the PE count, capped by the
    /// burst limit and by the (PE-rounded) channel count.
    pub fn burst_oc(&self, out_channels: usize) -> usize {
        let pe = self.topology.processing_elements;
        let limit = round_down(self.topology.burst_oc_limit, pe).max(pe);
        round_up(out_channels, pe).min(limit).max(pe)
    }

    fn padded_channels(&self, channels: usize) -> usize {
        round_up(channels, self.topology.channel_modulus)
    }

    /// Derive all four parameter sets.
    pub fn plan(&self, geometry: &ConvGeometry) -> Result<ConvPlan> {
        let split = geometry.split;
        let (k, stride, pad) = (geometry.kernel, geometry.stride, geometry.pad);

        let forward = self.correlate(
            ConvPass::Forward,
            geometry.input,
            split.in_per_group,
            geometry.output,
            split.out_per_group,
            split.groups,
            k,
            stride,
            pad as isize,
            1,
        );

        // Full correlation of the stride-dilated output gradient with the
        // rotated, channel-transposed filters.
        let backward_data = self.correlate(
            ConvPass::BackwardData,
            geometry.output,
            geometry.output.channels,
            geometry.input,
            geometry.input.channels,
            1,
            k,
            1,
            k as isize - 1 - pad as isize,
            stride,
        );

        let backward_bias = self.bias(geometry.top());
        let backward_weights = self.weights(geometry, &forward);

        let plan = ConvPlan { forward, backward_data, backward_bias, backward_weights };
        debug!("planned {}", plan.forward);
        debug!("planned {}", plan.backward_data);
        debug!("planned {}", plan.backward_bias);
        debug!("planned {}", plan.backward_weights);

        for params in [&plan.forward, &plan.backward_data, &plan.backward_bias, &plan.backward_weights]
        {
            params.to_words()?;
        }
        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn correlate(
        &self,
        pass: ConvPass,
        input: HwcnShape,
        in_channels: usize,
        output: HwcnShape,
        out_channels: usize,
        groups: usize,
        ksize: usize,
        stride: usize,
        pad: isize,
        dilation: usize,
    ) -> KernelParams {
        let in_channels_padded = self.padded_channels(in_channels);
        let burst_oc = self.burst_oc(out_channels);
        if out_channels < self.topology.processing_elements {
            warn!(
                "{pass:?}: {out_channels} output channels leave {} of {} processing elements idle",
                self.topology.processing_elements - out_channels,
                self.topology.processing_elements
            );
        }
        KernelParams {
            pass,
            groups,
            num_images: input.num,
            in_y: input.height,
            in_x: input.width,
            in_channels,
            in_channels_padded,
            out_y: output.height,
            out_x: output.width,
            out_channels,
            out_channels_padded: round_up(out_channels, burst_oc),
            ksize,
            stride,
            pad,
            dilation,
            num_cu: self.topology.compute_units,
            num_pe: self.topology.processing_elements,
            burst_oc,
            work_per_cu: ceil_div(output.height, self.topology.compute_units),
            reduce_extent: ksize * ksize * in_channels,
            weight_pad: in_channels_padded - in_channels,
            tag_mode: TagMode::Ignore,
            apply_bias: false,
        }
    }

    /// One reduction lane per channel of `top`; spatial and batch extents
    /// are reduced.
    fn bias(&self, top: HwcnShape) -> KernelParams {
        let lanes = top.channels;
        let burst_oc = self.burst_oc(lanes);
        KernelParams {
            pass: ConvPass::BackwardBias,
            groups: 1,
            num_images: top.num,
            in_y: top.height,
            in_x: top.width,
            in_channels: lanes,
            in_channels_padded: lanes,
            out_y: 1,
            out_x: 1,
            out_channels: lanes,
            out_channels_padded: round_up(lanes, burst_oc),
            ksize: 1,
            stride: 1,
            pad: 0,
            dilation: 1,
            num_cu: self.topology.compute_units,
            num_pe: self.topology.processing_elements,
            burst_oc,
            work_per_cu: ceil_div(lanes, self.topology.compute_units),
            reduce_extent: top.spatial() * top.num,
            weight_pad: 0,
            tag_mode: TagMode::Ignore,
            apply_bias: false,
        }
    }

    /// Work over every `(O, K, K, C)` weight element, each summed over batch
    /// and output positions. Packed layout matches the forward set.
    fn weights(&self, geometry: &ConvGeometry, forward: &KernelParams) -> KernelParams {
        let elements = geometry.output.channels
            * geometry.kernel
            * geometry.kernel
            * geometry.split.in_per_group;
        KernelParams {
            pass: ConvPass::BackwardWeights,
            work_per_cu: ceil_div(elements, self.topology.compute_units),
            reduce_extent: geometry.output.num * geometry.output.spatial(),
            ..forward.clone()
        }
    }
}
