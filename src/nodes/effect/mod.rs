//! Audio effect nodes (processors with audio inputs and outputs)

mod biquad;
mod channel_merger;
mod channel_splitter;
mod compressor;
mod convolver;
mod delay;
mod gain;
mod script_processor;
mod stereo_panner;

pub use biquad::*;
pub use channel_merger::{ChannelMergerDescription, ChannelMergerRenderNode};
pub use channel_splitter::{ChannelSplitterDescription, ChannelSplitterRenderNode};
pub use compressor::*;
pub use convolver::{normalization_scale, ConvolverDescription, ConvolverRenderNode};
pub use delay::{DelayDescription, DelayRenderNode, DELAY_TIME_PARAM, MAX_DELAY_TIME_LIMIT};
pub use gain::{GainDescription, GainRenderNode, GAIN_PARAM};
pub use script_processor::{ScriptProcessorDescription, ScriptProcessorRenderNode};
pub use stereo_panner::{pan_frame, StereoPannerDescription, StereoPannerRenderNode, PAN_PARAM};
