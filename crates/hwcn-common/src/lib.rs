//! Common types for the HWCN half-precision convolution operator
//!
//! This crate provides the configuration, accelerator topology, error
//! taxonomy and tensor container shared by the kernel crate.

pub mod config;
pub mod error;
pub mod math;
pub mod tensor;
pub mod topology;

pub use config::{ConvConfig, ConvEngine, ConvMode};
pub use error::{ConfigError, HwcnError, KernelError, Result};
pub use math::{ceil_div, round_down, round_up};
pub use tensor::{Blob, HwcnShape};
pub use topology::AcceleratorTopology;
