//! Scheduled playback of a decoded audio buffer

use std::sync::Arc;

use crate::bus::{AudioBus, MAX_CHANNELS};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{k_rate_value, NodeId, ParamInput, ParamRange, RenderContext, RenderEvent, RenderNode};
use crate::resources::{AudioBufferData, ResourceId, ResourceSnapshot};
use crate::wire::{WirePayload, WireReader, WireWriter};

use super::resampler::{interpolate_linear, SincKernel};

/// Parameter index of `playbackRate`.
pub const PLAYBACK_RATE_PARAM: u8 = 0;
/// Parameter index of `detune`, in cents.
pub const DETUNE_PARAM: u8 = 1;

/// Descriptor of an audio buffer source node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AudioBufferSourceDescription {
    pub buffer_id: ResourceId,
    pub playback_rate: f32,
    /// Cents
    pub detune: f32,
    pub looping: bool,
    /// Seconds into the buffer
    pub loop_start: f64,
    /// Seconds into the buffer; `0` (or anything not after `loop_start`) means the buffer end
    pub loop_end: f64,
    /// Seconds into the buffer where playback begins
    pub offset: f64,
    /// Context frame at which playback begins
    pub start_frame: Option<u64>,
    /// Context frame at which playback ends
    pub stop_frame: Option<u64>,
}

impl AudioBufferSourceDescription {
    pub fn new(buffer_id: ResourceId) -> Self {
        Self {
            buffer_id,
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

    pub fn with_loop(mut self, loop_start: f64, loop_end: f64) -> Self {
        self.looping = true;
        self.loop_start = loop_start;
        self.loop_end = loop_end;
        self
    }
}

impl Default for AudioBufferSourceDescription {
    fn default() -> Self {
        Self {
            buffer_id: ResourceId::NONE,
            playback_rate: 1.0,
            detune: 0.0,
            looping: false,
            loop_start: 0.0,
            loop_end: 0.0,
            offset: 0.0,
            start_frame: None,
            stop_frame: None,
        }
    }
}

impl WirePayload for AudioBufferSourceDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        writer.append_u64(self.buffer_id.0);
        writer.append_f32(self.playback_rate);
        writer.append_f32(self.detune);
        writer.append_bool(self.looping);
        writer.append_f64(self.loop_start);
        writer.append_f64(self.loop_end);
        writer.append_f64(self.offset);
        writer.append_optional_u64(self.start_frame);
        writer.append_optional_u64(self.stop_frame);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let description = Self {
            buffer_id: ResourceId(reader.read_u64()?),
            playback_rate: reader.read_finite_f32("playback_rate")?,
            detune: reader.read_finite_f32("detune")?,
            looping: reader.read_bool("looping")?,
            loop_start: reader.read_finite_f64("loop_start")?,
            loop_end: reader.read_finite_f64("loop_end")?,
            offset: reader.read_finite_f64("offset")?,
            start_frame: reader.read_optional_u64("start_frame")?,
            stop_frame: reader.read_optional_u64("stop_frame")?,
        };
        if description.loop_start < 0.0 {
            return Err(WireError::OutOfRange("loop_start"));
        }
        if description.loop_end < 0.0 {
            return Err(WireError::OutOfRange("loop_end"));
        }
        if description.offset < 0.0 {
            return Err(WireError::OutOfRange("offset"));
        }
        Ok(description)
    }
}

impl NodeDescription for AudioBufferSourceDescription {
    const NODE_TYPE: NodeType = NodeType::AudioBufferSource;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        let buffer_changed = self.buffer_id != next.buffer_id;
        let parameters_changed = Self { buffer_id: next.buffer_id, ..*self } != *next;
        GraphUpdateKind::when(buffer_changed, GraphUpdateKind::RebuildRequired)
            .max(GraphUpdateKind::when(parameters_changed, GraphUpdateKind::Parameter))
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        None
    }

    fn input_count(&self) -> usize {
        0
    }

    fn param_count(&self) -> usize {
        2
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlaybackState {
    Scheduled,
    Playing,
    Finished,
}

/// Plays a buffer once or in a loop between a start and an optional stop frame.
///
/// The playhead is a fractional buffer frame. Integer positions copy samples exactly, a unit
/// increment interpolates linearly and any other rate goes through the sinc kernel.
pub struct AudioBufferSourceRenderNode {
    id: NodeId,
    buffer: Option<Arc<AudioBufferData>>,
    description: AudioBufferSourceDescription,
    state: PlaybackState,
    playhead: f64,
    kernel: SincKernel,
    event: Option<RenderEvent>,
}

impl AudioBufferSourceRenderNode {
    pub fn new(id: NodeId, description: &AudioBufferSourceDescription, resources: &ResourceSnapshot) -> Self {
        Self {
            id,
            buffer: resources.resolve_audio_buffer(description.buffer_id),
            description: *description,
            state: PlaybackState::Scheduled,
            playhead: 0.0,
            kernel: SincKernel::new(),
            event: None,
        }
    }

    pub fn playhead(&self) -> f64 {
        self.playhead
    }

    pub fn is_finished(&self) -> bool {
        self.state == PlaybackState::Finished
    }

    fn finish(&mut self) {
        if self.state != PlaybackState::Finished {
            self.state = PlaybackState::Finished;
            self.event = Some(RenderEvent::SourceEnded(self.id));
        }
    }

    /// Loop bounds in buffer frames.
    fn loop_bounds(&self, buffer: &AudioBufferData) -> (f64, f64) {
        let rate = buffer.sample_rate() as f64;
        let length = buffer.length() as f64;
        let start = (self.description.loop_start * rate).clamp(0.0, length);
        let end = self.description.loop_end * rate;
        if end <= 0.0 || end <= start || end > length {
            (start.min(length), length)
        } else {
            (start, end)
        }
    }
}

impl RenderNode for AudioBufferSourceRenderNode {
    fn process(&mut self, ctx: &RenderContext, _inputs: &[AudioBus], params: &[ParamInput], output: &mut AudioBus) {
        let Some(buffer) = self.buffer.clone() else {
            output.reset(1);
            return;
        };
        let channels = buffer.channel_count().clamp(1, MAX_CHANNELS);
        output.reset(channels);
        if self.state == PlaybackState::Finished || buffer.length() == 0 {
            return;
        }

        let rate = k_rate_value(params, PLAYBACK_RATE_PARAM as usize, self.description.playback_rate, ParamRange::UNBOUNDED);
        let detune = k_rate_value(params, DETUNE_PARAM as usize, self.description.detune, ParamRange::UNBOUNDED);
        let increment = (buffer.sample_rate() as f64 / ctx.sample_rate as f64)
            * rate as f64
            * 2f64.powf(detune as f64 / 1200.0);
        let linear = (increment - 1.0).abs() < 1e-9;
        if !linear {
            self.kernel.prepare(SincKernel::cutoff_for(increment));
        }

        let length = buffer.length() as f64;
        let (loop_start, loop_end) = self.loop_bounds(&buffer);
        let loop_span = loop_end - loop_start;

        for frame in 0..output.frame_count() {
            let now = ctx.current_frame + frame as u64;

            if matches!(self.description.stop_frame, Some(stop) if now >= stop) {
                self.finish();
                break;
            }
            if self.state == PlaybackState::Scheduled {
                match self.description.start_frame {
                    Some(start) if now >= start => {
                        self.state = PlaybackState::Playing;
                        self.playhead = (self.description.offset * buffer.sample_rate() as f64).min(length);
                    }
                    _ => continue,
                }
            }

            if self.description.looping && loop_span > 0.0 {
                if self.playhead >= loop_end {
                    self.playhead = loop_start + (self.playhead - loop_end) % loop_span;
                } else if self.playhead < loop_start && increment < 0.0 {
                    self.playhead = loop_end - (loop_start - self.playhead) % loop_span;
                }
            } else if self.playhead >= length || self.playhead < 0.0 {
                self.finish();
                break;
            }

            let position = self.playhead;
            let exact = position.fract() == 0.0;
            for ch in 0..channels {
                let samples = buffer.channel(ch);
                output.channel_mut(ch)[frame] = if exact {
                    samples[position as usize]
                } else if linear {
                    interpolate_linear(samples, position)
                } else {
                    self.kernel.interpolate(samples, position)
                };
            }
            self.playhead += increment;
        }
    }

    fn apply_description(&mut self, _ctx: &RenderContext, description: &GraphNodeDescription) {
        if let GraphNodeDescription::AudioBufferSource(d) = description {
            // frames scheduled directly on the render node survive descriptions that omit them
            let start_frame = d.start_frame.or(self.description.start_frame);
            let stop_frame = d.stop_frame.or(self.description.stop_frame);
            self.description = AudioBufferSourceDescription {
                start_frame,
                stop_frame,
                ..*d
            };
        }
    }

    fn schedule_start(&mut self, frame: u64) {
        if self.state == PlaybackState::Scheduled {
            self.description.start_frame = Some(frame);
        }
    }

    fn schedule_stop(&mut self, frame: u64) {
        self.description.stop_frame = Some(frame);
    }

    fn take_event(&mut self) -> Option<RenderEvent> {
        self.event.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::GraphResourceRegistry;

    fn ctx(sample_rate: f32, current_frame: u64) -> RenderContext {
        RenderContext {
            sample_rate,
            quantum_size: 128,
            current_frame,
        }
    }

    fn source(buffer: AudioBufferData, description: impl FnOnce(ResourceId) -> AudioBufferSourceDescription) -> AudioBufferSourceRenderNode {
        let mut registry = GraphResourceRegistry::new();
        let id = registry.register_audio_buffer(buffer);
        AudioBufferSourceRenderNode::new(NodeId(1), &description(id), &registry.snapshot())
    }

    fn ramp(sample_rate: f32, length: usize) -> AudioBufferData {
        AudioBufferData::new(sample_rate, vec![(0..length).map(|i| i as f32).collect()])
    }

    #[test]
    fn whole_buffer_loop_wraps_to_the_start() {
        let mut node = source(ramp(48_000.0, 100), |id| {
            AudioBufferSourceDescription::new(id).with_start_frame(0).with_loop(0.0, 0.0)
        });
        let mut output = AudioBus::new(1, 128);
        for quantum in 0..2u64 {
            node.process(&ctx(48_000.0, quantum * 128), &[], &[], &mut output);
            for (i, &s) in output.channel(0).iter().enumerate() {
                assert_eq!(s, ((quantum as usize * 128 + i) % 100) as f32);
            }
        }
        assert!(!node.is_finished());
    }

    #[test]
    fn loop_region_repeats_after_the_first_pass() {
        // 1/16 s and 1/8 s are frames 64 and 128 at 1024 Hz
        let mut node = source(ramp(1024.0, 200), |id| {
            AudioBufferSourceDescription::new(id).with_start_frame(0).with_loop(0.0625, 0.125)
        });
        let mut output = AudioBus::new(1, 128);
        node.process(&ctx(1024.0, 0), &[], &[], &mut output);
        assert_eq!(output.channel(0)[127], 127.0);

        node.process(&ctx(1024.0, 128), &[], &[], &mut output);
        for (i, &s) in output.channel(0).iter().enumerate() {
            assert_eq!(s, (64 + i % 64) as f32);
        }
    }

    #[test]
    fn non_unit_rates_resample_through_the_sinc_kernel() {
        for rate in [0.5f32, 1.5] {
            let mut node = source(AudioBufferData::new(48_000.0, vec![vec![0.5; 1_000]]), |id| AudioBufferSourceDescription {
                playback_rate: rate,
                ..AudioBufferSourceDescription::new(id).with_start_frame(0)
            });
            let mut output = AudioBus::new(1, 128);
            node.process(&ctx(48_000.0, 0), &[], &[], &mut output);

            assert!((node.playhead() - 128.0 * rate as f64).abs() < 1e-9);
            for &s in &output.channel(0)[40..] {
                assert!((s - 0.5).abs() < 1e-3, "rate {rate}: {s}");
            }
        }
    }

    #[test]
    fn playback_ends_at_the_buffer_end() {
        let mut node = source(ramp(48_000.0, 100), |id| AudioBufferSourceDescription::new(id).with_start_frame(0));
        let mut output = AudioBus::new(1, 128);
        node.process(&ctx(48_000.0, 0), &[], &[], &mut output);
        assert_eq!(output.channel(0)[99], 99.0);
        assert!(output.channel(0)[100..].iter().all(|&s| s == 0.0));
        assert!(node.is_finished());
        assert_eq!(node.take_event(), Some(RenderEvent::SourceEnded(NodeId(1))));
    }
}
