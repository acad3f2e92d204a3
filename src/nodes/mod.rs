//! Built-in render nodes.
//!
//! Nodes are organized into three categories:
//!
//! ## Sources ([`source`])
//!
//! Generate audio with no audio inputs:
//! - [`AudioBufferSourceRenderNode`] - Scheduled, optionally looping buffer playback
//! - [`MediaElementAudioSourceRenderNode`] - Audio pulled from an external provider
//! - [`OscillatorRenderNode`] - Sine, square, sawtooth and triangle waves
//! - [`ConstantSourceRenderNode`] - A constant, automatable value
//!
//! ## Effects ([`effect`])
//!
//! Process audio (inputs → outputs):
//! - [`GainRenderNode`] - Volume control
//! - [`BiquadFilterRenderNode`] - Second-order filters
//! - [`ConvolverRenderNode`] - Impulse response convolution
//! - [`DelayRenderNode`] - Fractional delay line, the only node allowed inside a cycle
//! - [`DynamicsCompressorRenderNode`] - Look-ahead compressor
//! - [`StereoPannerRenderNode`] - Equal-power panning
//! - [`ScriptProcessorRenderNode`] - User DSP on fixed-size blocks
//! - [`ChannelSplitterRenderNode`] - One output per input channel
//! - [`ChannelMergerRenderNode`] - One output channel per input
//!
//! ## Sinks ([`sink`])
//!
//! - [`DestinationRenderNode`] - The graph output
//! - [`AnalyserRenderNode`] - Pass-through with spectrum snapshots
//!
//! Every node type keeps its control-side descriptor next to its render node.

pub mod effect;
pub mod sink;
pub mod source;
mod silent;

pub use effect::{
    BiquadFilterRenderNode, ChannelMergerRenderNode, ChannelSplitterRenderNode, ConvolverRenderNode, DelayRenderNode,
    DynamicsCompressorRenderNode, GainRenderNode, ScriptProcessorRenderNode, StereoPannerRenderNode,
};
pub use silent::SilentNode;
pub use sink::{AnalyserRenderNode, DestinationRenderNode};
pub use source::{
    AudioBufferSourceRenderNode, ConstantSourceRenderNode, MediaElementAudioSourceRenderNode, OscillatorRenderNode,
};

use tracing::warn;

use crate::bus::AudioBus;
use crate::description::GraphNodeDescription;
use crate::metering::MeterHandle;
use crate::node::{NodeId, ParamInput, RenderContext, RenderEvent, RenderNode};
use crate::resources::{ResourceId, ResourceSnapshot};

/// Closed set of render nodes the graph can hold.
#[enum_delegate::implement(RenderNode, pub trait RenderNode {
    fn process(&mut self, ctx: &RenderContext, inputs: &[AudioBus], params: &[ParamInput], output: &mut AudioBus);
    fn process_outputs(&mut self, ctx: &RenderContext, inputs: &[AudioBus], params: &[ParamInput], outputs: &mut [AudioBus]);
    fn apply_description(&mut self, ctx: &RenderContext, description: &GraphNodeDescription);
    fn schedule_start(&mut self, frame: u64);
    fn schedule_stop(&mut self, frame: u64);
    fn take_event(&mut self) -> Option<RenderEvent>;
    fn meter(&self) -> Option<MeterHandle>;
})]
pub enum RenderNodeKind {
    Destination(DestinationRenderNode),
    Gain(GainRenderNode),
    BiquadFilter(BiquadFilterRenderNode),
    Convolver(ConvolverRenderNode),
    Delay(DelayRenderNode),
    DynamicsCompressor(DynamicsCompressorRenderNode),
    StereoPanner(StereoPannerRenderNode),
    AudioBufferSource(AudioBufferSourceRenderNode),
    ScriptProcessor(ScriptProcessorRenderNode),
    MediaElementAudioSource(MediaElementAudioSourceRenderNode),
    Analyser(AnalyserRenderNode),
    Oscillator(OscillatorRenderNode),
    ConstantSource(ConstantSourceRenderNode),
    ChannelSplitter(ChannelSplitterRenderNode),
    ChannelMerger(ChannelMergerRenderNode),
    Silent(SilentNode),
}

impl RenderNodeKind {
    pub fn as_delay_mut(&mut self) -> Option<&mut DelayRenderNode> {
        match self {
            RenderNodeKind::Delay(delay) => Some(delay),
            _ => None,
        }
    }

    pub fn is_silent_fallback(&self) -> bool {
        matches!(self, RenderNodeKind::Silent(_))
    }
}

fn missing(id: NodeId, resource: ResourceId, what: &str) -> RenderNodeKind {
    warn!(node = id.raw(), resource = resource.0, "unresolved {} handle, node renders silence", what);
    RenderNodeKind::Silent(SilentNode)
}

/// Build the render node for `description`.
///
/// A descriptor that references a resource the snapshot cannot resolve yields a
/// [`SilentNode`] rather than an error, so one bad handle never takes the graph down.
pub fn create_render_node(
    id: NodeId,
    description: &GraphNodeDescription,
    ctx: &RenderContext,
    resources: &ResourceSnapshot,
) -> RenderNodeKind {
    match description {
        GraphNodeDescription::Destination(_) => RenderNodeKind::Destination(DestinationRenderNode),
        GraphNodeDescription::Gain(d) => RenderNodeKind::Gain(GainRenderNode::new(d)),
        GraphNodeDescription::BiquadFilter(d) => RenderNodeKind::BiquadFilter(BiquadFilterRenderNode::new(d)),
        GraphNodeDescription::Convolver(d) => {
            if !d.buffer_id.is_none() && resources.resolve_audio_buffer(d.buffer_id).is_none() {
                return missing(id, d.buffer_id, "convolver buffer");
            }
            RenderNodeKind::Convolver(ConvolverRenderNode::new(ctx, d, resources))
        }
        GraphNodeDescription::Delay(d) => RenderNodeKind::Delay(DelayRenderNode::new(ctx, d)),
        GraphNodeDescription::DynamicsCompressor(d) => {
            RenderNodeKind::DynamicsCompressor(DynamicsCompressorRenderNode::new(ctx, d))
        }
        GraphNodeDescription::StereoPanner(d) => RenderNodeKind::StereoPanner(StereoPannerRenderNode::new(d)),
        GraphNodeDescription::AudioBufferSource(d) => {
            if !d.buffer_id.is_none() && resources.resolve_audio_buffer(d.buffer_id).is_none() {
                return missing(id, d.buffer_id, "audio buffer");
            }
            RenderNodeKind::AudioBufferSource(AudioBufferSourceRenderNode::new(id, d, resources))
        }
        GraphNodeDescription::ScriptProcessor(d) => {
            if resources.resolve_script_processor(d.processor_id).is_none() {
                return missing(id, d.processor_id, "script processor");
            }
            RenderNodeKind::ScriptProcessor(ScriptProcessorRenderNode::new(id, d, resources))
        }
        GraphNodeDescription::MediaElementAudioSource(d) => {
            if resources.resolve_media_element_audio_source(d.provider_id).is_none() {
                return missing(id, d.provider_id, "media element");
            }
            RenderNodeKind::MediaElementAudioSource(MediaElementAudioSourceRenderNode::new(d, resources))
        }
        GraphNodeDescription::Analyser(d) => RenderNodeKind::Analyser(AnalyserRenderNode::new(ctx, d)),
        GraphNodeDescription::Oscillator(d) => RenderNodeKind::Oscillator(OscillatorRenderNode::new(id, d)),
        GraphNodeDescription::ConstantSource(d) => {
            RenderNodeKind::ConstantSource(ConstantSourceRenderNode::new(id, d))
        }
        GraphNodeDescription::ChannelSplitter(_) => RenderNodeKind::ChannelSplitter(ChannelSplitterRenderNode),
        GraphNodeDescription::ChannelMerger(_) => RenderNodeKind::ChannelMerger(ChannelMergerRenderNode),
    }
}
