//! The graph's final node

use crate::bus::{AudioBus, ChannelCountMode, ChannelInterpretation};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{ParamInput, RenderContext, RenderNode};
use crate::wire::{WirePayload, WireReader, WireWriter};

/// Descriptor of the destination node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DestinationDescription {
    pub channels: ChannelConfig,
}

impl DestinationDescription {
    pub fn new(channel_count: u32) -> Self {
        Self {
            channels: ChannelConfig::new(channel_count, ChannelCountMode::Explicit, ChannelInterpretation::Speakers),
        }
    }
}

impl Default for DestinationDescription {
    fn default() -> Self {
        Self::new(2)
    }
}

impl WirePayload for DestinationDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        self.channels.encode_wire_payload(writer);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channels: ChannelConfig::decode_wire_payload(reader)?,
        })
    }
}

impl NodeDescription for DestinationDescription {
    const NODE_TYPE: NodeType = NodeType::Destination;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        GraphUpdateKind::when(self.channels != next.channels, GraphUpdateKind::Topology)
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        Some(&self.channels)
    }
}

/// Copies its mixed input to its output, which the graph hands to the device or the offline
/// buffer.
pub struct DestinationRenderNode;

impl RenderNode for DestinationRenderNode {
    fn process(&mut self, _ctx: &RenderContext, inputs: &[AudioBus], _params: &[ParamInput], output: &mut AudioBus) {
        match inputs.first() {
            Some(input) => output.copy_from(input),
            None => output.reset(1),
        }
    }

    fn apply_description(&mut self, _ctx: &RenderContext, _description: &GraphNodeDescription) {}
}
