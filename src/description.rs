//! Control-thread node descriptors.
//!
//! A descriptor is a plain value: the intrinsic value of every automatable parameter, the
//! channel configuration and any resource handles. It never holds a pointer, so it can be
//! compared, cloned and sent through the [wire codec](crate::wire) freely.
//!
//! Each node type keeps its descriptor next to its render node in [`nodes`](crate::nodes);
//! this module holds the closed set that ties them together.

use crate::bus::{ChannelCountMode, ChannelInterpretation, MAX_CHANNELS};
use crate::error::WireError;
use crate::nodes::effect::{
    BiquadFilterDescription, ChannelMergerDescription, ChannelSplitterDescription, ConvolverDescription,
    DelayDescription, DynamicsCompressorDescription, GainDescription, ScriptProcessorDescription,
    StereoPannerDescription,
};
use crate::nodes::sink::{AnalyserDescription, DestinationDescription};
use crate::nodes::source::{
    AudioBufferSourceDescription, ConstantSourceDescription, MediaElementAudioSourceDescription,
    OscillatorDescription,
};
use crate::wire::{WirePayload, WireReader, WireWriter};

/// How invasive applying a new description is.
///
/// Ordered by severity; when several fields change, the most severe kind wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GraphUpdateKind {
    /// Nothing changed.
    None,
    /// Scalar fields change in place.
    Parameter,
    /// Processing order, routing or channel mixing must be recomputed.
    Topology,
    /// At least one render node must be discarded and recreated.
    RebuildRequired,
}

impl GraphUpdateKind {
    /// `kind` if `changed`, otherwise `None`.
    #[inline]
    pub fn when(changed: bool, kind: GraphUpdateKind) -> GraphUpdateKind {
        if changed {
            kind
        } else {
            GraphUpdateKind::None
        }
    }
}

/// Wire tag of each node type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    Destination,
    Gain,
    BiquadFilter,
    Convolver,
    Delay,
    DynamicsCompressor,
    StereoPanner,
    AudioBufferSource,
    ScriptProcessor,
    MediaElementAudioSource,
    Analyser,
    Oscillator,
    ConstantSource,
    ChannelSplitter,
    ChannelMerger,
}

impl NodeType {
    pub fn to_wire(self) -> u8 {
        match self {
            NodeType::Destination => 0,
            NodeType::Gain => 1,
            NodeType::BiquadFilter => 2,
            NodeType::Convolver => 3,
            NodeType::Delay => 4,
            NodeType::DynamicsCompressor => 5,
            NodeType::StereoPanner => 6,
            NodeType::AudioBufferSource => 7,
            NodeType::ScriptProcessor => 8,
            NodeType::MediaElementAudioSource => 9,
            NodeType::Analyser => 10,
            NodeType::Oscillator => 11,
            NodeType::ConstantSource => 12,
            NodeType::ChannelSplitter => 13,
            NodeType::ChannelMerger => 14,
        }
    }

    pub fn from_wire(tag: u8) -> Result<Self, WireError> {
        Ok(match tag {
            0 => NodeType::Destination,
            1 => NodeType::Gain,
            2 => NodeType::BiquadFilter,
            3 => NodeType::Convolver,
            4 => NodeType::Delay,
            5 => NodeType::DynamicsCompressor,
            6 => NodeType::StereoPanner,
            7 => NodeType::AudioBufferSource,
            8 => NodeType::ScriptProcessor,
            9 => NodeType::MediaElementAudioSource,
            10 => NodeType::Analyser,
            11 => NodeType::Oscillator,
            12 => NodeType::ConstantSource,
            13 => NodeType::ChannelSplitter,
            14 => NodeType::ChannelMerger,
            other => return Err(WireError::UnknownNodeType(other)),
        })
    }
}

/// Channel count, count mode and interpretation of a node's inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelConfig {
    pub channel_count: u32,
    pub mode: ChannelCountMode,
    pub interpretation: ChannelInterpretation,
}

impl ChannelConfig {
    pub const fn new(channel_count: u32, mode: ChannelCountMode, interpretation: ChannelInterpretation) -> Self {
        Self {
            channel_count,
            mode,
            interpretation,
        }
    }

    /// Channel count clamped to what a bus can carry.
    #[inline]
    pub fn clamped_count(&self) -> usize {
        (self.channel_count as usize).clamp(1, MAX_CHANNELS)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::new(2, ChannelCountMode::Max, ChannelInterpretation::Speakers)
    }
}

impl WirePayload for ChannelConfig {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        writer.append_u32(self.channel_count);
        writer.append_u8(self.mode.to_wire());
        writer.append_u8(self.interpretation.to_wire());
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let channel_count = reader.read_u32()?;
        if channel_count == 0 || channel_count as usize > MAX_CHANNELS {
            return Err(WireError::OutOfRange("channel_count"));
        }
        let mode = reader.read_u8()?;
        let mode = ChannelCountMode::from_wire(mode).ok_or(WireError::InvalidEnum {
            field: "channel_count_mode",
            value: mode,
        })?;
        let interpretation = reader.read_u8()?;
        let interpretation = ChannelInterpretation::from_wire(interpretation).ok_or(WireError::InvalidEnum {
            field: "channel_interpretation",
            value: interpretation,
        })?;
        Ok(Self {
            channel_count,
            mode,
            interpretation,
        })
    }
}

/// Behaviour shared by every per-type descriptor.
pub trait NodeDescription: WirePayload + Clone + PartialEq + Into<GraphNodeDescription> {
    const NODE_TYPE: NodeType;

    /// Classify the change from `self` to `next`.
    fn classify_update(&self, next: &Self) -> GraphUpdateKind;

    /// Input mixing configuration; `None` for nodes without inputs.
    fn channel_config(&self) -> Option<&ChannelConfig>;

    fn input_count(&self) -> usize {
        1
    }

    fn output_count(&self) -> usize {
        1
    }

    fn param_count(&self) -> usize {
        0
    }
}

/// Any node descriptor.
#[derive(Clone, Debug, PartialEq)]
pub enum GraphNodeDescription {
    Destination(DestinationDescription),
    Gain(GainDescription),
    BiquadFilter(BiquadFilterDescription),
    Convolver(ConvolverDescription),
    Delay(DelayDescription),
    DynamicsCompressor(DynamicsCompressorDescription),
    StereoPanner(StereoPannerDescription),
    AudioBufferSource(AudioBufferSourceDescription),
    ScriptProcessor(ScriptProcessorDescription),
    MediaElementAudioSource(MediaElementAudioSourceDescription),
    Analyser(AnalyserDescription),
    Oscillator(OscillatorDescription),
    ConstantSource(ConstantSourceDescription),
    ChannelSplitter(ChannelSplitterDescription),
    ChannelMerger(ChannelMergerDescription),
}

macro_rules! with_description {
    ($value:expr, $d:ident => $body:expr) => {
        match $value {
            GraphNodeDescription::Destination($d) => $body,
            GraphNodeDescription::Gain($d) => $body,
            GraphNodeDescription::BiquadFilter($d) => $body,
            GraphNodeDescription::Convolver($d) => $body,
            GraphNodeDescription::Delay($d) => $body,
            GraphNodeDescription::DynamicsCompressor($d) => $body,
            GraphNodeDescription::StereoPanner($d) => $body,
            GraphNodeDescription::AudioBufferSource($d) => $body,
            GraphNodeDescription::ScriptProcessor($d) => $body,
            GraphNodeDescription::MediaElementAudioSource($d) => $body,
            GraphNodeDescription::Analyser($d) => $body,
            GraphNodeDescription::Oscillator($d) => $body,
            GraphNodeDescription::ConstantSource($d) => $body,
            GraphNodeDescription::ChannelSplitter($d) => $body,
            GraphNodeDescription::ChannelMerger($d) => $body,
        }
    };
}

macro_rules! impl_from_description {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for GraphNodeDescription {
                fn from(description: $ty) -> Self {
                    GraphNodeDescription::$variant(description)
                }
            }
        )*
    };
}

impl_from_description!(
    Destination(DestinationDescription),
    Gain(GainDescription),
    BiquadFilter(BiquadFilterDescription),
    Convolver(ConvolverDescription),
    Delay(DelayDescription),
    DynamicsCompressor(DynamicsCompressorDescription),
    StereoPanner(StereoPannerDescription),
    AudioBufferSource(AudioBufferSourceDescription),
    ScriptProcessor(ScriptProcessorDescription),
    MediaElementAudioSource(MediaElementAudioSourceDescription),
    Analyser(AnalyserDescription),
    Oscillator(OscillatorDescription),
    ConstantSource(ConstantSourceDescription),
    ChannelSplitter(ChannelSplitterDescription),
    ChannelMerger(ChannelMergerDescription),
);

fn node_type_of<D: NodeDescription>(_: &D) -> NodeType {
    D::NODE_TYPE
}

impl GraphNodeDescription {
    pub fn node_type(&self) -> NodeType {
        with_description!(self, d => node_type_of(d))
    }

    pub fn channel_config(&self) -> Option<&ChannelConfig> {
        with_description!(self, d => d.channel_config())
    }

    pub fn input_count(&self) -> usize {
        with_description!(self, d => d.input_count())
    }

    pub fn output_count(&self) -> usize {
        with_description!(self, d => d.output_count())
    }

    pub fn param_count(&self) -> usize {
        with_description!(self, d => d.param_count())
    }

    /// Classify the change from `self` to `next`. A change of node type always requires a
    /// rebuild.
    pub fn classify_update(&self, next: &GraphNodeDescription) -> GraphUpdateKind {
        use GraphNodeDescription::*;
        match (self, next) {
            (Destination(a), Destination(b)) => a.classify_update(b),
            (Gain(a), Gain(b)) => a.classify_update(b),
            (BiquadFilter(a), BiquadFilter(b)) => a.classify_update(b),
            (Convolver(a), Convolver(b)) => a.classify_update(b),
            (Delay(a), Delay(b)) => a.classify_update(b),
            (DynamicsCompressor(a), DynamicsCompressor(b)) => a.classify_update(b),
            (StereoPanner(a), StereoPanner(b)) => a.classify_update(b),
            (AudioBufferSource(a), AudioBufferSource(b)) => a.classify_update(b),
            (ScriptProcessor(a), ScriptProcessor(b)) => a.classify_update(b),
            (MediaElementAudioSource(a), MediaElementAudioSource(b)) => a.classify_update(b),
            (Analyser(a), Analyser(b)) => a.classify_update(b),
            (Oscillator(a), Oscillator(b)) => a.classify_update(b),
            (ConstantSource(a), ConstantSource(b)) => a.classify_update(b),
            (ChannelSplitter(a), ChannelSplitter(b)) => a.classify_update(b),
            (ChannelMerger(a), ChannelMerger(b)) => a.classify_update(b),
            _ => GraphUpdateKind::RebuildRequired,
        }
    }

    pub fn encode_wire_payload(&self, writer: &mut WireWriter) {
        with_description!(self, d => d.encode_wire_payload(writer))
    }

    /// Decode the payload of a node whose type tag was already read.
    pub fn decode_wire_payload(node_type: NodeType, reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(match node_type {
            NodeType::Destination => DestinationDescription::decode_wire_payload(reader)?.into(),
            NodeType::Gain => GainDescription::decode_wire_payload(reader)?.into(),
            NodeType::BiquadFilter => BiquadFilterDescription::decode_wire_payload(reader)?.into(),
            NodeType::Convolver => ConvolverDescription::decode_wire_payload(reader)?.into(),
            NodeType::Delay => DelayDescription::decode_wire_payload(reader)?.into(),
            NodeType::DynamicsCompressor => DynamicsCompressorDescription::decode_wire_payload(reader)?.into(),
            NodeType::StereoPanner => StereoPannerDescription::decode_wire_payload(reader)?.into(),
            NodeType::AudioBufferSource => AudioBufferSourceDescription::decode_wire_payload(reader)?.into(),
            NodeType::ScriptProcessor => ScriptProcessorDescription::decode_wire_payload(reader)?.into(),
            NodeType::MediaElementAudioSource => {
                MediaElementAudioSourceDescription::decode_wire_payload(reader)?.into()
            }
            NodeType::Analyser => AnalyserDescription::decode_wire_payload(reader)?.into(),
            NodeType::Oscillator => OscillatorDescription::decode_wire_payload(reader)?.into(),
            NodeType::ConstantSource => ConstantSourceDescription::decode_wire_payload(reader)?.into(),
            NodeType::ChannelSplitter => ChannelSplitterDescription::decode_wire_payload(reader)?.into(),
            NodeType::ChannelMerger => ChannelMergerDescription::decode_wire_payload(reader)?.into(),
        })
    }
}
