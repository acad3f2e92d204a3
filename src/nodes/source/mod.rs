//! Audio source nodes (generators with no audio inputs)

mod buffer_source;
mod constant_source;
mod media_element;
mod oscillator;
mod resampler;
mod schedule;

pub use buffer_source::{
    AudioBufferSourceDescription, AudioBufferSourceRenderNode, DETUNE_PARAM, PLAYBACK_RATE_PARAM,
};
pub use constant_source::{ConstantSourceDescription, ConstantSourceRenderNode, OFFSET_PARAM};
pub use media_element::{MediaElementAudioSourceDescription, MediaElementAudioSourceRenderNode};
pub use oscillator::{
    waveform_sample, OscillatorDescription, OscillatorRenderNode, OscillatorType, OSCILLATOR_DETUNE_PARAM,
    OSCILLATOR_FREQUENCY_PARAM,
};
pub use resampler::{interpolate_linear, SincKernel, SINC_PHASES, SINC_TAPS};
