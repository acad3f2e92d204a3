//! Channel splitter: one mono output per input channel

use crate::bus::{AudioBus, ChannelCountMode, ChannelInterpretation, MAX_CHANNELS};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{ParamInput, RenderContext, RenderNode};
use crate::wire::{WirePayload, WireReader, WireWriter};

/// Descriptor of a channel splitter node.
///
/// The input is always mixed to exactly `number_of_outputs` discrete channels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelSplitterDescription {
    channels: ChannelConfig,
}

impl ChannelSplitterDescription {
    /// `number_of_outputs` is clamped to `1..=MAX_CHANNELS`.
    pub fn new(number_of_outputs: u32) -> Self {
        Self {
            channels: ChannelConfig::new(
                number_of_outputs.clamp(1, MAX_CHANNELS as u32),
                ChannelCountMode::Explicit,
                ChannelInterpretation::Discrete,
            ),
        }
    }

    #[inline]
    pub fn number_of_outputs(&self) -> u32 {
        self.channels.channel_count
    }
}

impl Default for ChannelSplitterDescription {
    fn default() -> Self {
        Self::new(6)
    }
}

impl WirePayload for ChannelSplitterDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        writer.append_u32(self.number_of_outputs());
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let outputs = reader.read_u32()?;
        if outputs == 0 || outputs as usize > MAX_CHANNELS {
            return Err(WireError::OutOfRange("number_of_outputs"));
        }
        Ok(Self::new(outputs))
    }
}

impl NodeDescription for ChannelSplitterDescription {
    const NODE_TYPE: NodeType = NodeType::ChannelSplitter;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        GraphUpdateKind::when(self != next, GraphUpdateKind::RebuildRequired)
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        Some(&self.channels)
    }

    fn output_count(&self) -> usize {
        self.number_of_outputs() as usize
    }
}

/// Copies input channel `i` to output `i`.
pub struct ChannelSplitterRenderNode;

impl RenderNode for ChannelSplitterRenderNode {
    fn process(&mut self, ctx: &RenderContext, inputs: &[AudioBus], params: &[ParamInput], output: &mut AudioBus) {
        self.process_outputs(ctx, inputs, params, std::slice::from_mut(output));
    }

    fn process_outputs(&mut self, _ctx: &RenderContext, inputs: &[AudioBus], _params: &[ParamInput], outputs: &mut [AudioBus]) {
        let input = inputs.first();
        for (index, output) in outputs.iter_mut().enumerate() {
            output.reset(1);
            if let Some(input) = input.filter(|bus| index < bus.channel_count()) {
                output.channel_mut(0).copy_from_slice(input.channel(index));
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
    fn each_output_carries_one_channel() {
        let mut input = AudioBus::new(2, 4);
        input.channel_mut(0).fill(0.25);
        input.channel_mut(1).fill(-0.5);
        let mut outputs: Vec<AudioBus> = (0..3).map(|_| AudioBus::with_capacity(2, 4, 2)).collect();

        ChannelSplitterRenderNode.process_outputs(&CTX, &[input], &[], &mut outputs);
        assert!(outputs.iter().all(|bus| bus.channel_count() == 1));
        assert_eq!(outputs[0].channel(0), [0.25; 4]);
        assert_eq!(outputs[1].channel(0), [-0.5; 4]);
        assert!(outputs[2].is_silent());
    }

    #[test]
    fn output_count_follows_the_description() {
        assert_eq!(ChannelSplitterDescription::new(4).output_count(), 4);
        assert_eq!(ChannelSplitterDescription::new(0).number_of_outputs(), 1);
        assert_eq!(ChannelSplitterDescription::new(99).number_of_outputs(), MAX_CHANNELS as u32);
        assert_eq!(
            ChannelSplitterDescription::new(2).classify_update(&ChannelSplitterDescription::new(3)),
            GraphUpdateKind::RebuildRequired
        );
    }
}
