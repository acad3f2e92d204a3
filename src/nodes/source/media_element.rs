//! Audio pulled from an external media element provider

use std::sync::Arc;

use crate::bus::{AudioBus, MAX_CHANNELS};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{ParamInput, RenderContext, RenderNode};
use crate::resources::{MediaElementSource, ResourceId, ResourceSnapshot};
use crate::wire::{WirePayload, WireReader, WireWriter};

/// Descriptor of a media element source node
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct MediaElementAudioSourceDescription {
    pub provider_id: ResourceId,
}

impl MediaElementAudioSourceDescription {
    pub fn new(provider_id: ResourceId) -> Self {
        Self { provider_id }
    }
}

impl WirePayload for MediaElementAudioSourceDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        writer.append_u64(self.provider_id.0);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            provider_id: ResourceId(reader.read_u64()?),
        })
    }
}

impl NodeDescription for MediaElementAudioSourceDescription {
    const NODE_TYPE: NodeType = NodeType::MediaElementAudioSource;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        GraphUpdateKind::when(self.provider_id != next.provider_id, GraphUpdateKind::RebuildRequired)
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        None
    }

    fn input_count(&self) -> usize {
        0
    }
}

/// Pulls one quantum per render from its provider. Short reads are padded with silence.
pub struct MediaElementAudioSourceRenderNode {
    provider: Option<Arc<dyn MediaElementSource>>,
}

impl MediaElementAudioSourceRenderNode {
    pub fn new(description: &MediaElementAudioSourceDescription, resources: &ResourceSnapshot) -> Self {
        Self {
            provider: resources.resolve_media_element_audio_source(description.provider_id),
        }
    }
}

impl RenderNode for MediaElementAudioSourceRenderNode {
    fn process(&mut self, _ctx: &RenderContext, _inputs: &[AudioBus], _params: &[ParamInput], output: &mut AudioBus) {
        let Some(provider) = self.provider.as_ref() else {
            output.reset(1);
            return;
        };
        output.reset(provider.channel_count().clamp(1, MAX_CHANNELS));
        let frames = output.frame_count();
        let pulled = provider.pull(output, frames).min(frames);
        if pulled < frames {
            for channel in output.channels_mut() {
                channel[pulled..].fill(0.0);
            }
        }
    }

    fn apply_description(&mut self, _ctx: &RenderContext, _description: &GraphNodeDescription) {}
}
