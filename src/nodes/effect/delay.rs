//! Fractional delay line

use crate::bus::{AudioBus, MAX_CHANNELS};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{param, ParamInput, ParamRange, RenderContext, RenderNode};
use crate::wire::{WirePayload, WireReader, WireWriter};

/// Parameter index of `delayTime`.
pub const DELAY_TIME_PARAM: u8 = 0;

/// Upper bound (exclusive) for `max_delay_time`, in seconds.
pub const MAX_DELAY_TIME_LIMIT: f32 = 180.0;

/// Descriptor of a delay node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DelayDescription {
    pub channels: ChannelConfig,
    /// Seconds
    pub delay_time: f32,
    /// Seconds; fixes the size of the delay line
    pub max_delay_time: f32,
}

impl DelayDescription {
    pub fn new(delay_time: f32, max_delay_time: f32) -> Self {
        Self {
            delay_time,
            max_delay_time,
            ..Self::default()
        }
    }
}

impl Default for DelayDescription {
    fn default() -> Self {
        Self {
            channels: ChannelConfig::default(),
            delay_time: 0.0,
            max_delay_time: 1.0,
        }
    }
}

impl WirePayload for DelayDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        self.channels.encode_wire_payload(writer);
        writer.append_f32(self.delay_time);
        writer.append_f32(self.max_delay_time);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let channels = ChannelConfig::decode_wire_payload(reader)?;
        let delay_time = reader.read_finite_f32("delay_time")?;
        let max_delay_time = reader.read_finite_f32("max_delay_time")?;
        if !(max_delay_time > 0.0 && max_delay_time < MAX_DELAY_TIME_LIMIT) {
            return Err(WireError::OutOfRange("max_delay_time"));
        }
        if delay_time < 0.0 {
            return Err(WireError::OutOfRange("delay_time"));
        }
        Ok(Self {
            channels,
            delay_time,
            max_delay_time,
        })
    }
}

impl NodeDescription for DelayDescription {
    const NODE_TYPE: NodeType = NodeType::Delay;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        GraphUpdateKind::when(self.max_delay_time != next.max_delay_time, GraphUpdateKind::RebuildRequired)
            .max(GraphUpdateKind::when(self.channels != next.channels, GraphUpdateKind::Topology))
            .max(GraphUpdateKind::when(self.delay_time != next.delay_time, GraphUpdateKind::Parameter))
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        Some(&self.channels)
    }

    fn param_count(&self) -> usize {
        1
    }
}

/// Multichannel delay line with linear interpolation.
///
/// Inside a cycle the graph drives the node in two halves: [`read_step`](Self::read_step) at
/// the start of the quantum, before anything upstream has run, and
/// [`write_step`](Self::write_step) once its input is ready. The delay is then clamped to at
/// least one quantum so every read hits already-written history.
pub struct DelayRenderNode {
    delay_time: f32,
    max_delay_time: f32,
    /// `MAX_CHANNELS` lines, each `line_len` frames
    lines: Vec<Vec<f32>>,
    line_len: usize,
    active_channels: usize,
    frames_written: u64,
    /// Per-frame delay of the current quantum, in frames
    delays: Vec<f64>,
}

impl DelayRenderNode {
    pub fn new(ctx: &RenderContext, description: &DelayDescription) -> Self {
        let max_frames = (description.max_delay_time as f64 * ctx.sample_rate as f64).ceil() as usize;
        let line_len = max_frames.saturating_add(ctx.quantum_size).saturating_add(1);
        Self {
            delay_time: description.delay_time,
            max_delay_time: description.max_delay_time,
            // one zeroed allocation per line, so lines never written stay uncommitted
            lines: (0..MAX_CHANNELS).map(|_| vec![0.0; line_len]).collect(),
            line_len,
            active_channels: 1,
            frames_written: 0,
            delays: vec![0.0; ctx.quantum_size],
        }
    }

    pub fn delay_time(&self) -> f32 {
        self.delay_time
    }

    fn compute_delays(&mut self, ctx: &RenderContext, params: &[ParamInput], min_frames: f64) {
        let range = ParamRange::new(0.0, self.max_delay_time);
        let sample_rate = ctx.sample_rate as f64;
        let max_frames = (self.line_len - ctx.quantum_size - 1) as f64;
        match param(params, DELAY_TIME_PARAM as usize) {
            Some(p) if p.is_connected() => {
                for (frame, d) in self.delays.iter_mut().enumerate() {
                    let seconds = p.value_at(self.delay_time, frame, range) as f64;
                    *d = (seconds * sample_rate).clamp(min_frames, max_frames.max(min_frames));
                }
            }
            _ => {
                let frames = range.clamp(self.delay_time) as f64 * sample_rate;
                self.delays.fill(frames.clamp(min_frames, max_frames.max(min_frames)));
            }
        }
    }

    fn read_into(&self, output: &mut AudioBus) {
        let len = self.line_len as f64;
        output.set_channel_count(self.active_channels);
        let base = self.frames_written as f64;
        for ch in 0..self.active_channels {
            let line = &self.lines[ch];
            for (frame, (sample, &d)) in output.channel_mut(ch).iter_mut().zip(&self.delays).enumerate() {
                let position = (base + frame as f64 - d).rem_euclid(len);
                let index0 = position.floor() as usize % self.line_len;
                let index1 = (index0 + 1) % self.line_len;
                let frac = (position - position.floor()) as f32;
                *sample = line[index0] + (line[index1] - line[index0]) * frac;
            }
        }
    }

    fn write_from(&mut self, input: Option<&AudioBus>) {
        let channels = input.map_or(1, AudioBus::channel_count).min(self.lines.len());
        if channels < self.active_channels {
            for line in &mut self.lines[channels..self.active_channels] {
                line.fill(0.0);
            }
        }
        self.active_channels = channels;

        let start = (self.frames_written % self.line_len as u64) as usize;
        let frames = self.delays.len();
        for ch in 0..channels {
            let line = &mut self.lines[ch];
            for frame in 0..frames {
                line[(start + frame) % self.line_len] = input.map_or(0.0, |bus| bus.channel(ch)[frame]);
            }
        }
    }

    /// First half of a split quantum: emit output from history only.
    pub fn read_step(&mut self, ctx: &RenderContext, params: &[ParamInput], output: &mut AudioBus) {
        self.compute_delays(ctx, params, ctx.quantum_size as f64);
        self.read_into(output);
    }

    /// Second half of a split quantum: record this quantum's input.
    pub fn write_step(&mut self, input: Option<&AudioBus>) {
        self.write_from(input);
        self.frames_written += self.delays.len() as u64;
    }
}

impl RenderNode for DelayRenderNode {
    fn process(&mut self, ctx: &RenderContext, inputs: &[AudioBus], params: &[ParamInput], output: &mut AudioBus) {
        self.compute_delays(ctx, params, 0.0);
        self.write_from(inputs.first());
        self.read_into(output);
        self.frames_written += self.delays.len() as u64;
    }

    fn apply_description(&mut self, _ctx: &RenderContext, description: &GraphNodeDescription) {
        if let GraphNodeDescription::Delay(d) = description {
            self.delay_time = d.delay_time;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: RenderContext = RenderContext {
        // 48 * 1024, so power-of-two delay times land on whole frames
        sample_rate: 49_152.0,
        quantum_size: 128,
        current_frame: 0,
    };

    fn constant(values: &[f32]) -> AudioBus {
        let mut bus = AudioBus::new(values.len(), CTX.quantum_size);
        for (ch, &v) in values.iter().enumerate() {
            bus.channel_mut(ch).fill(v);
        }
        bus
    }

    #[test]
    fn widening_input_uses_preallocated_lines() {
        // 48 frames
        let mut delay = DelayRenderNode::new(&CTX, &DelayDescription::new(1.0 / 1024.0, 1.0));
        assert_eq!(delay.lines.len(), MAX_CHANNELS);
        let mut output = AudioBus::with_capacity(1, CTX.quantum_size, MAX_CHANNELS);

        delay.process(&CTX, &[constant(&[1.0])], &[], &mut output);
        assert_eq!(output.channel_count(), 1);
        assert!(output.channel(0)[..48].iter().all(|&s| s == 0.0));
        assert!(output.channel(0)[48..].iter().all(|&s| s == 1.0));

        delay.process(&CTX, &[constant(&[1.0, 0.5])], &[], &mut output);
        assert_eq!(output.channel_count(), 2);
        assert!(output.channel(0).iter().all(|&s| s == 1.0));
        assert!(output.channel(1)[..48].iter().all(|&s| s == 0.0));
        assert!(output.channel(1)[48..].iter().all(|&s| s == 0.5));
        assert_eq!(delay.lines.len(), MAX_CHANNELS);
    }
}
