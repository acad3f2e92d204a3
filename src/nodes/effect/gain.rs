//! Gain (volume) control

use crate::bus::AudioBus;
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{ParamInput, ParamRange, RenderContext, RenderNode};
use crate::wire::{WirePayload, WireReader, WireWriter};

/// Parameter index of `gain`.
pub const GAIN_PARAM: u8 = 0;

/// Descriptor of a gain node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GainDescription {
    pub channels: ChannelConfig,
    /// Linear gain multiplier (1.0 = unity, 0.0 = silence)
    pub gain: f32,
}

impl GainDescription {
    pub fn new(gain: f32) -> Self {
        Self {
            gain,
            ..Self::default()
        }
    }
}

impl Default for GainDescription {
    fn default() -> Self {
        Self {
            channels: ChannelConfig::default(),
            gain: 1.0,
        }
    }
}

impl WirePayload for GainDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        self.channels.encode_wire_payload(writer);
        writer.append_f32(self.gain);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channels: ChannelConfig::decode_wire_payload(reader)?,
            gain: reader.read_finite_f32("gain")?,
        })
    }
}

impl NodeDescription for GainDescription {
    const NODE_TYPE: NodeType = NodeType::Gain;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        GraphUpdateKind::when(self.channels != next.channels, GraphUpdateKind::Topology)
            .max(GraphUpdateKind::when(self.gain != next.gain, GraphUpdateKind::Parameter))
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        Some(&self.channels)
    }

    fn param_count(&self) -> usize {
        1
    }
}

/// Multiplies every input channel by an a-rate gain.
pub struct GainRenderNode {
    gain: f32,
}

impl GainRenderNode {
    pub fn new(description: &GainDescription) -> Self {
        Self {
            gain: description.gain,
        }
    }

    #[inline]
    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl RenderNode for GainRenderNode {
    fn process(&mut self, _ctx: &RenderContext, inputs: &[AudioBus], params: &[ParamInput], output: &mut AudioBus) {
        let Some(input) = inputs.first() else {
            output.reset(1);
            return;
        };
        output.copy_from(input);

        match params.first() {
            Some(param) if param.is_connected() => {
                for channel in output.channels_mut() {
                    for (frame, sample) in channel.iter_mut().enumerate() {
                        *sample *= param.value_at(self.gain, frame, ParamRange::UNBOUNDED);
                    }
                }
            }
            _ => output.scale(self.gain),
        }
    }

    fn apply_description(&mut self, _ctx: &RenderContext, description: &GraphNodeDescription) {
        if let GraphNodeDescription::Gain(d) = description {
            self.gain = d.gain;
        }
    }
}
