//! Compare-and-Focus multi-scale crowd counting with Candle.
//!
//! A four-scale pyramid backbone (patch-embedding stem, local + windowed
//! global token mixing per stage) feeds a cross-scale fusion module that
//! softmax-weights the scales at every location, and a regression head emits
//! a non-negative density map whose spatial integral is the head count.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

pub mod checkpoint;
pub mod cmd_eval;
pub mod cmd_predict;
pub mod config;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod ot;
pub mod preprocess;

use candle_core::Device;
use clap::ValueEnum;

pub use crate::config::CfNetConfig;
pub use crate::error::{CfNetError, Result};
pub use crate::model::CfNet;

/// Select the compute device
pub fn device(cpu: bool) -> candle_core::Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Model variants
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum Which {
    Tiny,
    Small,
    Base,
}

impl Which {
    pub fn config(&self) -> CfNetConfig {
        match self {
            Which::Tiny => CfNetConfig::tiny(),
            Which::Small => CfNetConfig::small(),
            Which::Base => CfNetConfig::base(),
        }
    }

    pub fn default_weights(&self) -> &'static str {
        match self {
            Which::Tiny => "cfnet-tiny.safetensors",
            Which::Small => "cfnet-small.safetensors",
            Which::Base => "cfnet-base.safetensors",
        }
    }
}
