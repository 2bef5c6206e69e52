//! Half-precision HWCN convolution + ReLU operator
//!
//! The crate plans kernel launches for an accelerator topology, converts
//! framework tensors to the packed `f16` compute format and drives a
//! [`KernelDispatcher`] through the forward and backward passes of a
//! [`ConvLayer`]. The [`ReferenceDispatcher`] runs the device program on the
//! host; the `opencl` feature adds `OpenClDispatcher`.

pub mod convert;
pub mod dispatch;
pub mod kernels;
pub mod layer;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod params;
pub mod planner;
pub mod reference;
pub mod shape;

pub use dispatch::{KernelDispatcher, LaunchRequest};
pub use layer::{ConvLayer, PropagateDown};
#[cfg(feature = "opencl")]
pub use opencl::OpenClDispatcher;
pub use params::{ConvPass, KernelParams, PARAM_WORDS, TagMode};
pub use planner::{ConvPlan, KernelPlanner};
pub use reference::ReferenceDispatcher;
pub use shape::{
    ConvGeometry, GroupSplit, check_backward_groups, compute_deconv_output_shape,
    compute_output_shape, split_groups,
};

pub use hwcn_common::{
    AcceleratorTopology, Blob, ConfigError, ConvConfig, ConvEngine, ConvMode, HwcnError, HwcnShape,
    KernelError, Result,
};
