//! Channel merger: one mono input per output channel

use crate::bus::{AudioBus, ChannelCountMode, ChannelInterpretation, MAX_CHANNELS};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{ParamInput, RenderContext, RenderNode};
use crate::wire::{WirePayload, WireReader, WireWriter};

/// Descriptor of a channel merger node.
///
/// Every input is downmixed to mono before it becomes one output channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelMergerDescription {
    number_of_inputs: u32,
    channels: ChannelConfig,
}

impl ChannelMergerDescription {
    /// `number_of_inputs` is clamped to `1..=MAX_CHANNELS`.
    pub fn new(number_of_inputs: u32) -> Self {
        Self {
            number_of_inputs: number_of_inputs.clamp(1, MAX_CHANNELS as u32),
            channels: ChannelConfig::new(1, ChannelCountMode::Explicit, ChannelInterpretation::Speakers),
        }
    }

    #[inline]
    pub fn number_of_inputs(&self) -> u32 {
        self.number_of_inputs
    }
}

impl Default for ChannelMergerDescription {
    fn default() -> Self {
        Self::new(6)
    }
}

impl WirePayload for ChannelMergerDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        writer.append_u32(self.number_of_inputs);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let inputs = reader.read_u32()?;
        if inputs == 0 || inputs as usize > MAX_CHANNELS {
            return Err(WireError::OutOfRange("number_of_inputs"));
        }
        Ok(Self::new(inputs))
    }
}

impl NodeDescription for ChannelMergerDescription {
    const NODE_TYPE: NodeType = NodeType::ChannelMerger;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        GraphUpdateKind::when(self != next, GraphUpdateKind::RebuildRequired)
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        Some(&self.channels)
    }

    fn input_count(&self) -> usize {
        self.number_of_inputs as usize
    }
}

/// Writes input `i` to output channel `i`. Unconnected inputs are silent channels.
pub struct ChannelMergerRenderNode;

impl RenderNode for ChannelMergerRenderNode {
    fn process(&mut self, _ctx: &RenderContext, inputs: &[AudioBus], _params: &[ParamInput], output: &mut AudioBus) {
        output.reset(inputs.len().clamp(1, MAX_CHANNELS));
        for (index, input) in inputs.iter().take(MAX_CHANNELS).enumerate() {
            if input.channel_count() > 0 {
                output.channel_mut(index).copy_from_slice(input.channel(0));
            }
        }
    }

    fn apply_description(&mut self, _ctx: &RenderContext, _description: &GraphNodeDescription) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: RenderContext = RenderContext {
        sample_rate: 48_000.0,
        quantum_size: 4,
        current_frame: 0,
    };

    #[test]
    fn inputs_become_channels() {
        let mut left = AudioBus::new(1, 4);
        left.channel_mut(0).fill(0.5);
        let silent = AudioBus::new(1, 4);
        let mut right = AudioBus::new(1, 4);
        right.channel_mut(0).fill(-1.0);
        let mut output = AudioBus::with_capacity(1, 4, MAX_CHANNELS);

        ChannelMergerRenderNode.process(&CTX, &[left, silent, right], &[], &mut output);
        assert_eq!(output.channel_count(), 3);
        assert_eq!(output.channel(0), [0.5; 4]);
        assert_eq!(output.channel(1), [0.0; 4]);
        assert_eq!(output.channel(2), [-1.0; 4]);
    }

    #[test]
    fn input_count_follows_the_description() {
        let merger = ChannelMergerDescription::new(3);
        assert_eq!(merger.input_count(), 3);
        assert_eq!(merger.channel_config().map(ChannelConfig::clamped_count), Some(1));
        assert_eq!(ChannelMergerDescription::new(0).number_of_inputs(), 1);
    }
}
