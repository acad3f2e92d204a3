//! Block-based user DSP

use std::sync::TryLockError;

use tracing::warn;

use crate::bus::{AudioBus, ChannelCountMode, ChannelInterpretation, MAX_CHANNELS};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{NodeId, ParamInput, RenderContext, RenderEvent, RenderNode};
use crate::resources::{ResourceId, ResourceSnapshot, SharedScriptProcessor};
use crate::wire::{WirePayload, WireReader, WireWriter};

/// Descriptor of a script processor node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScriptProcessorDescription {
    pub channels: ChannelConfig,
    /// Frames per callback; a power of two in `256..=16384`
    pub buffer_size: u32,
    pub input_channels: u32,
    pub output_channels: u32,
    pub processor_id: ResourceId,
}

impl ScriptProcessorDescription {
    pub fn new(processor_id: ResourceId, buffer_size: u32, input_channels: u32, output_channels: u32) -> Self {
        Self {
            channels: ChannelConfig::new(
                input_channels.max(1),
                ChannelCountMode::Explicit,
                ChannelInterpretation::Speakers,
            ),
            buffer_size,
            input_channels,
            output_channels,
            processor_id,
        }
    }
}

impl Default for ScriptProcessorDescription {
    fn default() -> Self {
        Self::new(ResourceId::NONE, 1024, 2, 2)
    }
}

impl WirePayload for ScriptProcessorDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        self.channels.encode_wire_payload(writer);
        writer.append_u32(self.buffer_size);
        writer.append_u32(self.input_channels);
        writer.append_u32(self.output_channels);
        writer.append_u64(self.processor_id.0);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let channels = ChannelConfig::decode_wire_payload(reader)?;
        let buffer_size = reader.read_u32()?;
        if !buffer_size.is_power_of_two() || !(256..=16384).contains(&buffer_size) {
            return Err(WireError::OutOfRange("buffer_size"));
        }
        let input_channels = reader.read_u32()?;
        if input_channels as usize > MAX_CHANNELS {
            return Err(WireError::OutOfRange("input_channels"));
        }
        let output_channels = reader.read_u32()?;
        if output_channels == 0 || output_channels as usize > MAX_CHANNELS {
            return Err(WireError::OutOfRange("output_channels"));
        }
        Ok(Self {
            channels,
            buffer_size,
            input_channels,
            output_channels,
            processor_id: ResourceId(reader.read_u64()?),
        })
    }
}

impl NodeDescription for ScriptProcessorDescription {
    const NODE_TYPE: NodeType = NodeType::ScriptProcessor;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        let rebuild = self.buffer_size != next.buffer_size
            || self.input_channels != next.input_channels
            || self.output_channels != next.output_channels
            || self.processor_id != next.processor_id;
        GraphUpdateKind::when(rebuild, GraphUpdateKind::RebuildRequired)
            .max(GraphUpdateKind::when(self.channels != next.channels, GraphUpdateKind::Topology))
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        Some(&self.channels)
    }
}

/// Buffers input until a full block is available, then hands it to the user callback.
///
/// Output lags input by one block. A callback whose lock is held when the block is due is
/// skipped for that block and counted as an underrun. A callback that fails or panics disables
/// the node for good; it then outputs silence and reports the failure once.
pub struct ScriptProcessorRenderNode {
    id: NodeId,
    processor: Option<SharedScriptProcessor>,
    input_block: AudioBus,
    output_block: AudioBus,
    position: usize,
    disabled: bool,
    underruns: u64,
    event: Option<RenderEvent>,
}

impl ScriptProcessorRenderNode {
    pub fn new(id: NodeId, description: &ScriptProcessorDescription, resources: &ResourceSnapshot) -> Self {
        let block = (description.buffer_size as usize).max(1);
        Self {
            id,
            processor: resources.resolve_script_processor(description.processor_id),
            input_block: AudioBus::new((description.input_channels as usize).min(MAX_CHANNELS), block),
            output_block: AudioBus::new((description.output_channels as usize).clamp(1, MAX_CHANNELS), block),
            position: 0,
            disabled: false,
            underruns: 0,
            event: None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Blocks skipped because the callback was busy.
    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    fn fail(&mut self, message: String) {
        warn!(node = self.id.raw(), %message, "script processor disabled");
        self.disabled = true;
        self.output_block.zero();
        self.event = Some(RenderEvent::ScriptProcessorFailed {
            node: self.id,
            message,
        });
    }

    fn run_callback(&mut self) {
        self.output_block.zero();
        let Some(processor) = self.processor.as_ref() else {
            return;
        };
        let result = match processor.try_lock() {
            Ok(mut callback) => callback
                .process(&self.input_block, &mut self.output_block)
                .map_err(|err| err.to_string()),
            Err(TryLockError::WouldBlock) => {
                self.underruns += 1;
                return;
            }
            Err(TryLockError::Poisoned(_)) => Err("processor panicked earlier".to_owned()),
        };
        if let Err(message) = result {
            self.fail(message);
        }
    }
}

impl RenderNode for ScriptProcessorRenderNode {
    fn process(&mut self, _ctx: &RenderContext, inputs: &[AudioBus], _params: &[ParamInput], output: &mut AudioBus) {
        output.reset(self.output_block.channel_count());
        if self.disabled {
            return;
        }

        let block = self.input_block.frame_count();
        let mut done = 0;
        while done < output.frame_count() {
            let frames = (output.frame_count() - done).min(block - self.position);
            let range = self.position..self.position + frames;

            for ch in 0..self.input_block.channel_count() {
                let dst = &mut self.input_block.channel_mut(ch)[range.clone()];
                match inputs.first().filter(|bus| ch < bus.channel_count()) {
                    Some(bus) => dst.copy_from_slice(&bus.channel(ch)[done..done + frames]),
                    None => dst.fill(0.0),
                }
            }
            for ch in 0..self.output_block.channel_count() {
                output.channel_mut(ch)[done..done + frames].copy_from_slice(&self.output_block.channel(ch)[range.clone()]);
            }

            done += frames;
            self.position += frames;
            if self.position == block {
                self.position = 0;
                self.run_callback();
                if self.disabled {
                    return;
                }
            }
        }
    }

    fn apply_description(&mut self, _ctx: &RenderContext, _description: &GraphNodeDescription) {}

    fn take_event(&mut self) -> Option<RenderEvent> {
        self.event.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScriptProcessorError;
    use crate::resources::GraphResourceRegistry;

    const CTX: RenderContext = RenderContext {
        sample_rate: 48_000.0,
        quantum_size: 128,
        current_frame: 0,
    };

    fn run(node: &mut ScriptProcessorRenderNode, input: &AudioBus, output: &mut AudioBus) {
        node.process(&CTX, std::slice::from_ref(input), &[], output);
    }

    #[test]
    fn busy_callback_skips_one_block() {
        let mut registry = GraphResourceRegistry::new();
        let id = registry.register_script_processor(|input: &AudioBus, output: &mut AudioBus| -> Result<(), ScriptProcessorError> {
            output.copy_from(input);
            Ok(())
        });
        let snapshot = registry.snapshot();
        let shared = snapshot.resolve_script_processor(id).unwrap();
        let description = ScriptProcessorDescription::new(id, 256, 1, 1);
        let mut node = ScriptProcessorRenderNode::new(NodeId(1), &description, &snapshot);

        let mut input = AudioBus::new(1, 128);
        input.channel_mut(0).fill(1.0);
        let mut output = AudioBus::new(1, 128);

        // the first block is due while the control side holds the callback
        let guard = shared.lock().unwrap();
        run(&mut node, &input, &mut output);
        run(&mut node, &input, &mut output);
        drop(guard);
        assert_eq!(node.underruns(), 1);
        assert!(!node.is_disabled());
        assert!(node.take_event().is_none());

        run(&mut node, &input, &mut output);
        assert!(output.is_silent());
        run(&mut node, &input, &mut output);
        assert_eq!(node.underruns(), 1);

        // the second block ran, so the next output block carries it
        run(&mut node, &input, &mut output);
        assert!(output.channel(0).iter().all(|&s| s == 1.0));
    }

    #[test]
    fn failing_callback_disables_the_node() {
        let mut registry = GraphResourceRegistry::new();
        let id = registry.register_script_processor(|_: &AudioBus, _: &mut AudioBus| -> Result<(), ScriptProcessorError> {
            Err(ScriptProcessorError("boom".to_owned()))
        });
        let description = ScriptProcessorDescription::new(id, 256, 1, 1);
        let mut node = ScriptProcessorRenderNode::new(NodeId(2), &description, &registry.snapshot());

        let input = AudioBus::new(1, 128);
        let mut output = AudioBus::new(1, 128);
        run(&mut node, &input, &mut output);
        run(&mut node, &input, &mut output);
        assert!(node.is_disabled());
        assert!(matches!(
            node.take_event(),
            Some(RenderEvent::ScriptProcessorFailed { message, .. }) if message.ends_with("boom")
        ));
        assert_eq!(node.underruns(), 0);
    }
}
