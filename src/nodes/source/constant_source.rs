//! Constant signal generator

use crate::bus::AudioBus;
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{param, NodeId, ParamInput, ParamRange, RenderContext, RenderEvent, RenderNode};
use crate::wire::{WirePayload, WireReader, WireWriter};

use super::schedule::{SourceSchedule, Tick};

/// Parameter index of `offset`.
pub const OFFSET_PARAM: u8 = 0;

/// Descriptor of a constant source node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConstantSourceDescription {
    pub offset: f32,
    pub start_frame: Option<u64>,
    pub stop_frame: Option<u64>,
}

impl ConstantSourceDescription {
    pub fn new(offset: f32) -> Self {
        Self {
            offset,
            ..Self::default()
        }
    }

    pub fn with_start_frame(mut self, frame: u64) -> Self {
        self.start_frame = Some(frame);
        self
    }

    pub fn with_stop_frame(mut self, frame: u64) -> Self {
        self.stop_frame = Some(frame);
        self
    }
}

impl Default for ConstantSourceDescription {
    fn default() -> Self {
        Self {
            offset: 1.0,
            start_frame: None,
            stop_frame: None,
        }
    }
}

impl WirePayload for ConstantSourceDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        writer.append_f32(self.offset);
        writer.append_optional_u64(self.start_frame);
        writer.append_optional_u64(self.stop_frame);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            offset: reader.read_finite_f32("offset")?,
            start_frame: reader.read_optional_u64("start_frame")?,
            stop_frame: reader.read_optional_u64("stop_frame")?,
        })
    }
}

impl NodeDescription for ConstantSourceDescription {
    const NODE_TYPE: NodeType = NodeType::ConstantSource;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        GraphUpdateKind::when(self != next, GraphUpdateKind::Parameter)
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        None
    }

    fn input_count(&self) -> usize {
        0
    }

    fn param_count(&self) -> usize {
        1
    }
}

/// Emits `offset` (plus any modulation) on one channel while playing.
pub struct ConstantSourceRenderNode {
    id: NodeId,
    offset: f32,
    schedule: SourceSchedule,
    event: Option<RenderEvent>,
}

impl ConstantSourceRenderNode {
    pub fn new(id: NodeId, description: &ConstantSourceDescription) -> Self {
        Self {
            id,
            offset: description.offset,
            schedule: SourceSchedule::new(description.start_frame, description.stop_frame),
            event: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.schedule.is_finished()
    }
}

impl RenderNode for ConstantSourceRenderNode {
    fn process(&mut self, ctx: &RenderContext, _inputs: &[AudioBus], params: &[ParamInput], output: &mut AudioBus) {
        output.reset(1);
        let offset = param(params, OFFSET_PARAM as usize);
        let samples = output.channel_mut(0);
        for (frame, sample) in samples.iter_mut().enumerate() {
            match self.schedule.tick(ctx.current_frame + frame as u64) {
                Tick::Silent => {}
                Tick::Audible => {
                    *sample = match offset {
                        Some(p) => p.value_at(self.offset, frame, ParamRange::UNBOUNDED),
                        None => self.offset,
                    };
                }
                Tick::Ended => {
                    self.event = Some(RenderEvent::SourceEnded(self.id));
                    break;
                }
            }
        }
    }

    fn apply_description(&mut self, _ctx: &RenderContext, description: &GraphNodeDescription) {
        if let GraphNodeDescription::ConstantSource(d) = description {
            self.offset = d.offset;
            self.schedule.update(d.start_frame, d.stop_frame);
        }
    }

    fn schedule_start(&mut self, frame: u64) {
        self.schedule.schedule_start(frame);
    }

    fn schedule_stop(&mut self, frame: u64) {
        self.schedule.schedule_stop(frame);
    }

    fn take_event(&mut self) -> Option<RenderEvent> {
        self.event.take()
    }
}
