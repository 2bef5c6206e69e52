//! Convolution + ReLU layer over HWCN blobs.
//!
//! [`ConvLayer`] owns the weight and bias blobs, their half-precision
//! copies, the ReLU tag buffer and the transient half buffers for one
//! geometry. It converts framework data to the compute format, drives the
//! dispatcher through the passes of the current [`ConvPlan`], and converts
//! results back.
//!
//! In deconvolution mode the roles of the conv-equivalent passes swap: the
//! layer's forward pass is a backward-data correlation with rotated filters
//! and its backward-data pass is a plain forward correlation.

use crate::convert::{
    accumulate_general_weights, rotate_weights_half_into, to_compact_half_into,
    to_compact_half_weights_into, to_general_into,
};
use crate::dispatch::{KernelDispatcher, LaunchRequest};
use crate::params::TagMode;
use crate::planner::{ConvPlan, KernelPlanner};
use crate::shape::{ConvGeometry, check_backward_groups};
use half::f16;
use hwcn_common::{
    AcceleratorTopology, Blob, ConfigError, ConvConfig, ConvMode, HwcnError, HwcnShape, Result,
};
use log::{debug, info};

/// Which gradients a backward call computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagateDown {
    pub data: bool,
    pub weights: bool,
    pub bias: bool,
}

impl PropagateDown {
    pub fn all() -> Self {
        Self { data: true, weights: true, bias: true }
    }

    /// Parameter gradients only; the bottom diff is left untouched.
    pub fn params_only() -> Self {
        Self { data: false, weights: true, bias: true }
    }

    pub fn bias_only() -> Self {
        Self { data: false, weights: false, bias: true }
    }
}

impl Default for PropagateDown {
    fn default() -> Self {
        Self::all()
    }
}

/// Per-geometry half buffers. Rebuilt on every reshape.
#[derive(Debug)]
struct HalfBuffers {
    bottom: Vec<f16>,
    top: Vec<f16>,
    top_diff: Vec<f16>,
    bottom_diff: Vec<f16>,
    weights: Vec<f16>,
    weights_rotated: Vec<f16>,
    weight_grad: Vec<f16>,
    bias_grad: Vec<f16>,
}

impl HalfBuffers {
    fn for_plan(geometry: &ConvGeometry, plan: &ConvPlan) -> Self {
        let (bottom, top) = (geometry.bottom().count(), geometry.top().count());
        Self {
            bottom: vec![f16::ZERO; bottom],
            top: vec![f16::ZERO; top],
            top_diff: vec![f16::ZERO; top],
            bottom_diff: vec![f16::ZERO; bottom],
            weights: vec![f16::ZERO; plan.forward.packed_weight_len()],
            weights_rotated: vec![f16::ZERO; plan.backward_data.packed_weight_len()],
            weight_grad: vec![f16::ZERO; plan.backward_weights.packed_weight_len()],
            bias_grad: vec![f16::ZERO; plan.backward_bias.out_total()],
        }
    }
}

/// Fused convolution (or deconvolution) + ReLU layer.
#[derive(Debug)]
pub struct ConvLayer<D: KernelDispatcher> {
    config: ConvConfig,
    planner: KernelPlanner,
    dispatcher: D,
    geometry: ConvGeometry,
    plan: ConvPlan,
    weights: Blob<f32>,
    bias: Option<Blob<f32>>,
    bias_half: Vec<f16>,
    /// Stands in for an absent bias or filter operand.
    placeholder: Vec<f16>,
    relu_tags: Vec<i32>,
    buffers: HalfBuffers,
    /// Bottom shape of the last completed forward pass.
    forward_shape: Option<HwcnShape>,
}

impl<D: KernelDispatcher> ConvLayer<D> {
    /// Validate `config` and `topology`, allocate zeroed parameter blobs and
    /// plan for an input of shape `bottom_shape` (`[H, W, C, N]`).
    pub fn setup(
        config: ConvConfig,
        topology: AcceleratorTopology,
        dispatcher: D,
        bottom_shape: &[usize],
    ) -> Result<Self> {
        config.validate()?;
        let planner = KernelPlanner::new(topology)?;
        let bottom = HwcnShape::from_dims(bottom_shape)?;
        let geometry = ConvGeometry::resolve(&config, bottom)?;
        let plan = planner.plan(&geometry)?;

        let weights = Blob::new(&geometry.weight_shape());
        let bias = config.bias_term.then(|| Blob::new(&[geometry.bias_len()]));
        let bias_half = vec![f16::ZERO; if config.bias_term { geometry.bias_len() } else { 1 }];

        info!(
            "{} layer on {}: {} -> {}, weights {:?}, bias {}",
            match config.mode {
                ConvMode::Convolution => "convolution",
                ConvMode::Deconvolution => "deconvolution",
            },
            dispatcher.name(),
            geometry.bottom(),
            geometry.top(),
            geometry.weight_shape(),
            config.bias_term,
        );

        Ok(Self {
            buffers: HalfBuffers::for_plan(&geometry, &plan),
            relu_tags: vec![0; geometry.top().count()],
            config,
            planner,
            dispatcher,
            geometry,
            plan,
            weights,
            bias,
            bias_half,
            placeholder: vec![f16::ZERO; 1],
            forward_shape: None,
        })
    }

    /// Re-plan for a new input shape and return the top shape.
    ///
    /// The channel count must not change. Weight and bias blobs are kept;
    /// forward state is dropped, so `backward` needs a fresh `forward`.
    pub fn reshape(&mut self, bottom_shape: &[usize]) -> Result<Vec<usize>> {
        let bottom = HwcnShape::from_dims(bottom_shape)?;
        let expected = self.geometry.bottom().channels;
        if bottom.channels != expected {
            return Err(ConfigError::ChannelMismatch { expected, got: bottom.channels }.into());
        }
        let geometry = ConvGeometry::resolve(&self.config, bottom)?;
        let plan = self.planner.plan(&geometry)?;
        debug!("reshape {} -> {}", geometry.bottom(), geometry.top());

        self.buffers = HalfBuffers::for_plan(&geometry, &plan);
        self.relu_tags = vec![0; geometry.top().count()];
        self.geometry = geometry;
        self.plan = plan;
        self.forward_shape = None;
        Ok(self.geometry.top().dims())
    }

    fn record_mode(&self) -> TagMode {
        if self.config.fused_relu { TagMode::Record } else { TagMode::Ignore }
    }

    fn mask_mode(&self, gated: TagMode) -> TagMode {
        if self.config.fused_relu { gated } else { TagMode::Ignore }
    }

    /// Compute `top = relu(conv(bottom) + bias)`, recording ReLU gates.
    ///
    /// A failed launch leaves no forward state behind: `backward` is refused
    /// until the next successful forward.
    pub fn forward(&mut self, bottom: &Blob<f32>, top: &mut Blob<f32>) -> Result<()> {
        let shape = bottom.hwcn_shape()?;
        if shape != self.geometry.bottom() {
            self.reshape(bottom.shape())?;
        }
        self.forward_shape = None;
        let mode = self.config.mode;
        let params = self
            .plan
            .layer_forward(mode)
            .with_tag_mode(self.record_mode())
            .with_bias(self.bias.is_some());
        let words = params.to_words()?;

        if let Some(bias) = &self.bias {
            to_compact_half_into(bias.data(), &mut self.bias_half)?;
        }
        to_compact_half_into(bottom.data(), &mut self.buffers.bottom)?;
        let filter = match mode {
            ConvMode::Convolution => {
                to_compact_half_weights_into(self.weights.data(), &params, &mut self.buffers.weights)?;
                &self.buffers.weights
            }
            ConvMode::Deconvolution => {
                rotate_weights_half_into(self.weights.data(), &params, &mut self.buffers.weights_rotated)?;
                &self.buffers.weights_rotated
            }
        };

        self.dispatcher.launch(LaunchRequest {
            input: &self.buffers.bottom,
            filter,
            bias: &self.bias_half,
            output: &mut self.buffers.top,
            tags: &mut self.relu_tags,
            params: &words,
            groups: params.groups,
        })?;

        top.reshape(&self.geometry.top().dims());
        to_general_into(&self.buffers.top, top.data_mut())?;
        self.forward_shape = Some(self.geometry.bottom());
        Ok(())
    }

    /// Propagate `top.diff` back through the ReLU gates of the last forward.
    ///
    /// The bias and weight gradients accumulate into the existing diffs; call
    /// [`zero_param_diffs`](Self::zero_param_diffs) to reset them. The bottom
    /// diff is overwritten. Every requested pass is launched before any diff
    /// is written, so a failed launch leaves all three diffs unchanged.
    pub fn backward(
        &mut self,
        top: &Blob<f32>,
        propagate: PropagateDown,
        bottom: &mut Blob<f32>,
    ) -> Result<()> {
        if self.forward_shape != Some(self.geometry.bottom()) {
            return Err(HwcnError::Validation(
                "backward requires a forward pass at the current input shape".into(),
            ));
        }
        if top.hwcn_shape()? != self.geometry.top() || bottom.hwcn_shape()? != self.geometry.bottom() {
            return Err(HwcnError::Validation(format!(
                "backward blobs {:?}/{:?} do not match the planned {} -> {}",
                bottom.shape(),
                top.shape(),
                self.geometry.bottom(),
                self.geometry.top()
            )));
        }
        check_backward_groups(&self.geometry.split, propagate.data, propagate.weights)?;

        to_compact_half_into(top.diff(), &mut self.buffers.top_diff)?;

        let bias = propagate.bias && self.bias.is_some();
        if bias {
            self.launch_backward_bias()?;
        }
        if propagate.weights {
            self.launch_backward_weights(bottom)?;
        }
        if propagate.data {
            self.launch_backward_data()?;
        }

        if let Some(blob) = self.bias.as_mut().filter(|_| bias) {
            for (diff, grad) in blob.diff_mut().iter_mut().zip(&self.buffers.bias_grad) {
                *diff += grad.to_f32();
            }
        }
        if propagate.weights {
            let shape = self.weights.shape().to_vec();
            accumulate_general_weights(
                &self.buffers.weight_grad,
                &shape,
                &self.plan.backward_weights,
                self.weights.diff_mut(),
            )?;
        }
        if propagate.data {
            to_general_into(&self.buffers.bottom_diff, bottom.diff_mut())?;
        }
        Ok(())
    }

    fn launch_backward_bias(&mut self) -> Result<()> {
        let params = self.plan.backward_bias.with_tag_mode(self.mask_mode(TagMode::MaskInput));
        let words = params.to_words()?;
        self.dispatcher.launch(LaunchRequest {
            input: &self.buffers.top_diff,
            filter: &self.placeholder,
            bias: &self.placeholder,
            output: &mut self.buffers.bias_grad,
            tags: &mut self.relu_tags,
            params: &words,
            groups: params.groups,
        })
    }

    fn launch_backward_weights(&mut self, bottom: &Blob<f32>) -> Result<()> {
        to_compact_half_into(bottom.data(), &mut self.buffers.bottom)?;
        // The correlation input is the conv input: the layer bottom for a
        // convolution, the layer top for a deconvolution.
        let (input, filter, tag_mode) = match self.config.mode {
            ConvMode::Convolution => {
                (&self.buffers.bottom, &self.buffers.top_diff, self.mask_mode(TagMode::MaskFilter))
            }
            ConvMode::Deconvolution => {
                (&self.buffers.top_diff, &self.buffers.bottom, self.mask_mode(TagMode::MaskInput))
            }
        };
        let params = self.plan.backward_weights.with_tag_mode(tag_mode);
        let words = params.to_words()?;
        self.dispatcher.launch(LaunchRequest {
            input,
            filter,
            bias: &self.placeholder,
            output: &mut self.buffers.weight_grad,
            tags: &mut self.relu_tags,
            params: &words,
            groups: params.groups,
        })
    }

    fn launch_backward_data(&mut self) -> Result<()> {
        let mode = self.config.mode;
        let params =
            self.plan.layer_backward_data(mode).with_tag_mode(self.mask_mode(TagMode::MaskInput));
        let words = params.to_words()?;
        let filter = match mode {
            ConvMode::Convolution => {
                rotate_weights_half_into(self.weights.data(), &params, &mut self.buffers.weights_rotated)?;
                &self.buffers.weights_rotated
            }
            ConvMode::Deconvolution => {
                to_compact_half_weights_into(self.weights.data(), &params, &mut self.buffers.weights)?;
                &self.buffers.weights
            }
        };
        self.dispatcher.launch(LaunchRequest {
            input: &self.buffers.top_diff,
            filter,
            bias: &self.placeholder,
            output: &mut self.buffers.bottom_diff,
            tags: &mut self.relu_tags,
            params: &words,
            groups: params.groups,
        })
    }

    /// Reset the weight and bias gradients to zero.
    pub fn zero_param_diffs(&mut self) {
        self.weights.zero_diff();
        if let Some(bias) = &mut self.bias {
            bias.zero_diff();
        }
    }

    /// Weight blob `[O, C/G, K, K]` (`[C, O, K, K]` for deconvolution).
    pub fn weights(&self) -> &Blob<f32> {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut Blob<f32> {
        &mut self.weights
    }

    pub fn bias(&self) -> Option<&Blob<f32>> {
        self.bias.as_ref()
    }

    pub fn bias_mut(&mut self) -> Option<&mut Blob<f32>> {
        self.bias.as_mut()
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn topology(&self) -> &AcceleratorTopology {
        self.planner.topology()
    }

    pub fn geometry(&self) -> &ConvGeometry {
        &self.geometry
    }

    pub fn plan(&self) -> &ConvPlan {
        &self.plan
    }

    /// Top shape for the current geometry.
    pub fn top_shape(&self) -> Vec<usize> {
        self.geometry.top().dims()
    }

    /// Gates recorded by the last forward pass, one per top element.
    pub fn relu_tags(&self) -> &[i32] {
        &self.relu_tags
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }
}
