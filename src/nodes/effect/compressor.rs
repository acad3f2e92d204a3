//! Dynamics compressor with fixed look-ahead

use std::sync::Arc;

use crate::bus::{AudioBus, ChannelCountMode, ChannelInterpretation, MAX_CHANNELS};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::metering::{MeterHandle, ReductionMeter};
use crate::node::{param, ParamInput, ParamRange, RenderContext, RenderNode};
use crate::wire::{WirePayload, WireReader, WireWriter};

pub const THRESHOLD_PARAM: u8 = 0;
pub const KNEE_PARAM: u8 = 1;
pub const RATIO_PARAM: u8 = 2;
pub const ATTACK_PARAM: u8 = 3;
pub const RELEASE_PARAM: u8 = 4;

/// Look-ahead delay applied to the signal path.
pub const LOOKAHEAD_SECONDS: f32 = 0.006;

const THRESHOLD_RANGE: ParamRange = ParamRange::new(-100.0, 0.0);
const KNEE_RANGE: ParamRange = ParamRange::new(0.0, 40.0);
const RATIO_RANGE: ParamRange = ParamRange::new(1.0, 20.0);
const TIME_RANGE: ParamRange = ParamRange::new(0.0, 1.0);

/// Descriptor of a dynamics compressor node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DynamicsCompressorDescription {
    pub channels: ChannelConfig,
    /// dB above which compression starts
    pub threshold: f32,
    /// dB range above the threshold over which the curve bends
    pub knee: f32,
    /// Input dB change per 1 dB of output change
    pub ratio: f32,
    /// Seconds to reduce gain by 10 dB
    pub attack: f32,
    /// Seconds to recover gain by 10 dB
    pub release: f32,
}

impl Default for DynamicsCompressorDescription {
    fn default() -> Self {
        Self {
            channels: ChannelConfig::new(2, ChannelCountMode::ClampedMax, ChannelInterpretation::Speakers),
            threshold: -24.0,
            knee: 30.0,
            ratio: 12.0,
            attack: 0.003,
            release: 0.25,
        }
    }
}

impl WirePayload for DynamicsCompressorDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        self.channels.encode_wire_payload(writer);
        writer.append_f32(self.threshold);
        writer.append_f32(self.knee);
        writer.append_f32(self.ratio);
        writer.append_f32(self.attack);
        writer.append_f32(self.release);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channels: ChannelConfig::decode_wire_payload(reader)?,
            threshold: reader.read_finite_f32("threshold")?,
            knee: reader.read_finite_f32("knee")?,
            ratio: reader.read_finite_f32("ratio")?,
            attack: reader.read_finite_f32("attack")?,
            release: reader.read_finite_f32("release")?,
        })
    }
}

impl NodeDescription for DynamicsCompressorDescription {
    const NODE_TYPE: NodeType = NodeType::DynamicsCompressor;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        let parameters_changed = self.threshold != next.threshold
            || self.knee != next.knee
            || self.ratio != next.ratio
            || self.attack != next.attack
            || self.release != next.release;
        GraphUpdateKind::when(self.channels != next.channels, GraphUpdateKind::Topology)
            .max(GraphUpdateKind::when(parameters_changed, GraphUpdateKind::Parameter))
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        Some(&self.channels)
    }

    fn param_count(&self) -> usize {
        5
    }
}

/// `20 * log10(x)`, with silence and garbage mapped to -1000 dB.
pub fn linear_to_db(linear: f32) -> f32 {
    if linear == 0.0 || !linear.is_finite() {
        return -1000.0;
    }
    20.0 * linear.log10()
}

pub fn db_to_linear(db: f32) -> f32 {
    if !db.is_finite() {
        return 0.0;
    }
    10f32.powf(db / 20.0)
}

/// Static compression curve: identity below the threshold, a quadratic knee in dB above it and
/// slope `1/ratio` past the knee.
pub fn compression_curve(linear_input: f32, threshold_db: f32, knee_db: f32, ratio: f32) -> f32 {
    if linear_input <= 0.0 {
        return 0.0;
    }
    let knee_db = knee_db.max(0.0);
    let ratio = ratio.max(1.0);
    let x_db = linear_to_db(linear_input);

    if x_db < threshold_db {
        return linear_input;
    }
    if knee_db <= 0.0 || x_db > threshold_db + knee_db {
        return db_to_linear(threshold_db + (x_db - threshold_db) / ratio);
    }
    let offset = x_db - threshold_db + knee_db * 0.5;
    db_to_linear(x_db + (1.0 / ratio - 1.0) * offset * offset / (2.0 * knee_db))
}

/// `(1 / curve(1.0))^0.6`
pub fn makeup_gain(threshold_db: f32, knee_db: f32, ratio: f32) -> f32 {
    let full_range_gain = compression_curve(1.0, threshold_db, knee_db, ratio);
    if full_range_gain <= 0.0 {
        return 1.0;
    }
    (1.0 / full_range_gain).powf(0.6)
}

/// Look-ahead compressor with a detector/envelope pair, publishing its gain reduction.
pub struct DynamicsCompressorRenderNode {
    description: DynamicsCompressorDescription,
    /// One ring per possible channel, each `ring_size` long
    ring: Vec<f32>,
    ring_size: usize,
    write_index: usize,
    delay_frames: f64,
    detector_average: f32,
    compressor_gain: f32,
    meter: Arc<ReductionMeter>,
}

impl DynamicsCompressorRenderNode {
    pub fn new(ctx: &RenderContext, description: &DynamicsCompressorDescription) -> Self {
        let delay_frames = LOOKAHEAD_SECONDS as f64 * ctx.sample_rate as f64;
        let ring_size = (delay_frames.ceil() as usize).saturating_add(2);
        Self {
            description: *description,
            ring: vec![0.0; ring_size.saturating_mul(MAX_CHANNELS)],
            ring_size,
            write_index: 0,
            delay_frames,
            detector_average: 0.0,
            compressor_gain: 1.0,
            meter: ReductionMeter::new(),
        }
    }

    fn k_rate(params: &[ParamInput], index: u8, intrinsic: f32, range: ParamRange) -> f32 {
        let value = match param(params, index as usize) {
            Some(p) if p.is_connected() => intrinsic + p.signal()[0],
            _ => intrinsic,
        };
        if value.is_finite() {
            range.clamp(value)
        } else {
            range.clamp(intrinsic)
        }
    }
}

impl RenderNode for DynamicsCompressorRenderNode {
    fn process(&mut self, ctx: &RenderContext, inputs: &[AudioBus], params: &[ParamInput], output: &mut AudioBus) {
        let input = inputs.first();
        let channels = input.map_or(1, AudioBus::channel_count).min(MAX_CHANNELS);
        output.set_channel_count(channels);

        let d = &self.description;
        let threshold = Self::k_rate(params, THRESHOLD_PARAM, d.threshold, THRESHOLD_RANGE);
        let knee = Self::k_rate(params, KNEE_PARAM, d.knee, KNEE_RANGE);
        let ratio = Self::k_rate(params, RATIO_PARAM, d.ratio, RATIO_RANGE);
        let attack = Self::k_rate(params, ATTACK_PARAM, d.attack, TIME_RANGE);
        let release = Self::k_rate(params, RELEASE_PARAM, d.release, TIME_RANGE);

        let makeup = makeup_gain(threshold, knee, ratio);
        let attack_coeff = 1.0 - (-1.0 / (attack * ctx.sample_rate).max(1.0) as f64).exp() as f32;
        let release_coeff = 1.0 - (-1.0 / (release * ctx.sample_rate).max(1.0) as f64).exp() as f32;

        let mut detector_average = self.detector_average;
        let mut compressor_gain = self.compressor_gain;
        let mut metering_db = 0.0;
        let ring_size = self.ring_size;

        for frame in 0..output.frame_count() {
            let peak = input.map_or(0.0, |bus| {
                bus.channels().fold(0.0f32, |peak, channel| peak.max(channel[frame].abs()))
            });

            let attenuation = if peak >= 0.0001 {
                compression_curve(peak, threshold, knee, ratio) / peak
            } else {
                1.0
            };
            let releasing = attenuation > compressor_gain;

            let detector_rate = attenuation.clamp(0.0, 1.0);
            detector_average += (attenuation - detector_average) * detector_rate;
            detector_average = detector_average.min(1.0);

            let envelope_ratio = detector_average / compressor_gain.max(0.000_001);
            let envelope_rate = if envelope_ratio <= 1.0 {
                envelope_ratio.max(0.0).powf(attack_coeff)
            } else {
                1.0 + release_coeff / envelope_ratio
            };

            if releasing {
                compressor_gain = (compressor_gain * envelope_rate).min(1.0);
            } else {
                compressor_gain += (detector_average - compressor_gain) * envelope_rate;
            }

            let reduction_gain = compressor_gain * makeup;
            metering_db = linear_to_db(reduction_gain);

            let mut read_position = self.write_index as f64 - self.delay_frames;
            if read_position < 0.0 {
                read_position += ring_size as f64;
            }
            let index0 = (read_position.floor() as usize) % ring_size;
            let index1 = (index0 + 1) % ring_size;
            let frac = (read_position - read_position.floor()) as f32;

            for ch in 0..channels {
                let ring = &mut self.ring[ch * ring_size..(ch + 1) * ring_size];
                ring[self.write_index] = input.map_or(0.0, |bus| bus.channel(ch)[frame]);
                let s0 = ring[index0];
                let s1 = ring[index1];
                output.channel_mut(ch)[frame] = (s0 + (s1 - s0) * frac) * reduction_gain;
            }

            self.write_index = (self.write_index + 1) % ring_size;
        }

        self.detector_average = detector_average;
        self.compressor_gain = compressor_gain;
        self.meter.publish(metering_db);
    }

    fn apply_description(&mut self, _ctx: &RenderContext, description: &GraphNodeDescription) {
        if let GraphNodeDescription::DynamicsCompressor(d) = description {
            self.description = *d;
        }
    }

    fn meter(&self) -> Option<MeterHandle> {
        Some(MeterHandle::Compressor(self.meter.clone()))
    }
}
