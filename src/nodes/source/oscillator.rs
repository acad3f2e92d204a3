//! Periodic waveform generator

use core::f64::consts::TAU;

use crate::bus::AudioBus;
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{param, NodeId, ParamInput, ParamRange, RenderContext, RenderEvent, RenderNode};
use crate::wire::{WirePayload, WireReader, WireWriter};

use super::schedule::{SourceSchedule, Tick};

pub const OSCILLATOR_FREQUENCY_PARAM: u8 = 0;
pub const OSCILLATOR_DETUNE_PARAM: u8 = 1;

/// 1200 * log2(f32::MAX)
const DETUNE_RANGE: ParamRange = ParamRange::new(-153_600.0, 153_600.0);

/// Oscillator waveform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum OscillatorType {
    #[default]
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

impl OscillatorType {
    fn to_wire(self) -> u8 {
        match self {
            OscillatorType::Sine => 0,
            OscillatorType::Square => 1,
            OscillatorType::Sawtooth => 2,
            OscillatorType::Triangle => 3,
        }
    }

    fn from_wire(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => OscillatorType::Sine,
            1 => OscillatorType::Square,
            2 => OscillatorType::Sawtooth,
            3 => OscillatorType::Triangle,
            value => {
                return Err(WireError::InvalidEnum {
                    field: "oscillator_type",
                    value,
                })
            }
        })
    }
}

/// Descriptor of an oscillator node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OscillatorDescription {
    pub oscillator_type: OscillatorType,
    /// Hz
    pub frequency: f32,
    /// Cents
    pub detune: f32,
    pub start_frame: Option<u64>,
    pub stop_frame: Option<u64>,
}

impl OscillatorDescription {
    pub fn new(oscillator_type: OscillatorType, frequency: f32) -> Self {
        Self {
            oscillator_type,
            frequency,
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

impl Default for OscillatorDescription {
    fn default() -> Self {
        Self {
            oscillator_type: OscillatorType::Sine,
            frequency: 440.0,
            detune: 0.0,
            start_frame: None,
            stop_frame: None,
        }
    }
}

impl WirePayload for OscillatorDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        writer.append_u8(self.oscillator_type.to_wire());
        writer.append_f32(self.frequency);
        writer.append_f32(self.detune);
        writer.append_optional_u64(self.start_frame);
        writer.append_optional_u64(self.stop_frame);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            oscillator_type: OscillatorType::from_wire(reader.read_u8()?)?,
            frequency: reader.read_finite_f32("frequency")?,
            detune: reader.read_finite_f32("detune")?,
            start_frame: reader.read_optional_u64("start_frame")?,
            stop_frame: reader.read_optional_u64("stop_frame")?,
        })
    }
}

impl NodeDescription for OscillatorDescription {
    const NODE_TYPE: NodeType = NodeType::Oscillator;

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
        2
    }
}

/// Second-order polynomial correction around a unit step at phase 0.
#[inline]
fn poly_blep(phase: f64, dt: f64) -> f64 {
    if phase < dt {
        let x = phase / dt;
        2.0 * x - x * x - 1.0
    } else if phase > 1.0 - dt {
        let x = (phase - 1.0) / dt;
        x * x + 2.0 * x + 1.0
    } else {
        0.0
    }
}

/// One sample of `shape` at `phase` in `[0, 1)`. `dt` is the phase step per frame.
///
/// Every shape starts at zero and rises, like a sine. The square and sawtooth are band-limited
/// with PolyBLEP.
pub fn waveform_sample(shape: OscillatorType, phase: f64, dt: f64) -> f32 {
    let dt = dt.abs().min(0.5);
    let half = (phase + 0.5).fract();
    let value = match shape {
        OscillatorType::Sine => (phase * TAU).sin(),
        OscillatorType::Square => {
            let naive = if phase < 0.5 { 1.0 } else { -1.0 };
            if dt > 0.0 {
                naive + poly_blep(phase, dt) - poly_blep(half, dt)
            } else {
                naive
            }
        }
        OscillatorType::Sawtooth => {
            let naive = 2.0 * half - 1.0;
            if dt > 0.0 {
                naive - poly_blep(half, dt)
            } else {
                naive
            }
        }
        OscillatorType::Triangle => {
            if phase < 0.25 {
                4.0 * phase
            } else if phase < 0.75 {
                2.0 - 4.0 * phase
            } else {
                4.0 * phase - 4.0
            }
        }
    };
    value as f32
}

/// Phase-accumulating oscillator with a-rate frequency and detune.
///
/// The computed frequency is `frequency * 2^(detune / 1200)`, limited to the Nyquist frequency
/// in either direction.
pub struct OscillatorRenderNode {
    id: NodeId,
    description: OscillatorDescription,
    schedule: SourceSchedule,
    phase: f64,
    event: Option<RenderEvent>,
}

impl OscillatorRenderNode {
    pub fn new(id: NodeId, description: &OscillatorDescription) -> Self {
        Self {
            id,
            description: *description,
            schedule: SourceSchedule::new(description.start_frame, description.stop_frame),
            phase: 0.0,
            event: None,
        }
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }
}

impl RenderNode for OscillatorRenderNode {
    fn process(&mut self, ctx: &RenderContext, _inputs: &[AudioBus], params: &[ParamInput], output: &mut AudioBus) {
        output.reset(1);
        let nyquist = ctx.nyquist();
        let frequency_range = ParamRange::new(-nyquist, nyquist);
        let frequency_param = param(params, OSCILLATOR_FREQUENCY_PARAM as usize);
        let detune_param = param(params, OSCILLATOR_DETUNE_PARAM as usize);
        let sample_rate = ctx.sample_rate as f64;

        let samples = output.channel_mut(0);
        for (frame, sample) in samples.iter_mut().enumerate() {
            match self.schedule.tick(ctx.current_frame + frame as u64) {
                Tick::Silent => continue,
                Tick::Ended => {
                    self.event = Some(RenderEvent::SourceEnded(self.id));
                    break;
                }
                Tick::Audible => {}
            }

            let frequency = match frequency_param {
                Some(p) => p.value_at(self.description.frequency, frame, ParamRange::UNBOUNDED),
                None => self.description.frequency,
            };
            let detune = match detune_param {
                Some(p) => p.value_at(self.description.detune, frame, DETUNE_RANGE),
                None => DETUNE_RANGE.clamp(self.description.detune),
            };
            let computed = frequency_range.clamp(frequency * (detune / 1200.0).exp2());
            let dt = computed as f64 / sample_rate;

            *sample = waveform_sample(self.description.oscillator_type, self.phase, dt);
            self.phase = (self.phase + dt).rem_euclid(1.0);
        }
    }

    fn apply_description(&mut self, _ctx: &RenderContext, description: &GraphNodeDescription) {
        if let GraphNodeDescription::Oscillator(d) = description {
            self.schedule.update(d.start_frame, d.stop_frame);
            self.description = *d;
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

#[cfg(test)]
mod tests {
    use super::*;

    const CTX: RenderContext = RenderContext {
        sample_rate: 48_000.0,
        quantum_size: 128,
        current_frame: 0,
    };

    fn render(description: OscillatorDescription) -> Vec<f32> {
        let mut node = OscillatorRenderNode::new(NodeId(1), &description.with_start_frame(0));
        let mut output = AudioBus::new(1, 128);
        node.process(&CTX, &[], &[], &mut output);
        output.channel(0).to_vec()
    }

    fn assert_cycle(samples: &[f32], expected: [f32; 4]) {
        for (i, &s) in samples.iter().enumerate() {
            assert!((s - expected[i % 4]).abs() < 1e-5, "frame {i}: {s}");
        }
    }

    #[test]
    fn quarter_rate_sine_and_triangle_hit_the_peaks() {
        assert_cycle(&render(OscillatorDescription::new(OscillatorType::Sine, 12_000.0)), [0.0, 1.0, 0.0, -1.0]);
        assert_cycle(&render(OscillatorDescription::new(OscillatorType::Triangle, 12_000.0)), [0.0, 1.0, 0.0, -1.0]);
    }

    #[test]
    fn detune_doubles_the_frequency() {
        let detuned = OscillatorDescription {
            detune: 1200.0,
            ..OscillatorDescription::new(OscillatorType::Sine, 6_000.0)
        };
        assert_cycle(&render(detuned), [0.0, 1.0, 0.0, -1.0]);
    }

    #[test]
    fn frequency_is_limited_to_nyquist() {
        let mut node = OscillatorRenderNode::new(
            NodeId(1),
            &OscillatorDescription::new(OscillatorType::Sine, 1.0e9).with_start_frame(0),
        );
        let mut output = AudioBus::new(1, 128);
        node.process(&CTX, &[], &[], &mut output);
        // half a cycle per frame
        assert!((node.phase() - 0.0).abs() < 1e-9);
        assert!(output.channel(0).iter().all(|s| s.abs() < 1e-5));
    }

    #[test]
    fn low_square_is_bipolar_and_balanced() {
        // 128 frames per cycle
        let samples = render(OscillatorDescription::new(OscillatorType::Square, 375.0));
        assert!(samples[2..62].iter().all(|&s| s == 1.0));
        assert!(samples[66..126].iter().all(|&s| s == -1.0));
        let mean: f32 = samples.iter().sum::<f32>() / samples.len() as f32;
        assert!(mean.abs() < 1e-3);
    }

    #[test]
    fn sawtooth_rises_through_zero() {
        let samples = render(OscillatorDescription::new(OscillatorType::Sawtooth, 375.0));
        assert!(samples[0].abs() < 1e-6);
        assert!(samples[1..60].windows(2).all(|w| w[1] > w[0]));
        assert!(samples[70] < 0.0);
    }

    #[test]
    fn stop_ends_the_oscillator() {
        let description = OscillatorDescription::new(OscillatorType::Sine, 440.0)
            .with_start_frame(0)
            .with_stop_frame(100);
        let mut node = OscillatorRenderNode::new(NodeId(5), &description);
        let mut output = AudioBus::new(1, 128);
        node.process(&CTX, &[], &[], &mut output);
        assert!(output.channel(0)[100..].iter().all(|&s| s == 0.0));
        assert_eq!(node.take_event(), Some(RenderEvent::SourceEnded(NodeId(5))));
    }
}
