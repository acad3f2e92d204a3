//! Second-order IIR filter

use core::f64::consts::PI;

use crate::bus::{AudioBus, MAX_CHANNELS};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{k_rate_value, ParamInput, ParamRange, RenderContext, RenderNode};
use crate::wire::{WirePayload, WireReader, WireWriter};

pub const BIQUAD_FREQUENCY_PARAM: u8 = 0;
pub const BIQUAD_DETUNE_PARAM: u8 = 1;
pub const BIQUAD_Q_PARAM: u8 = 2;
pub const BIQUAD_GAIN_PARAM: u8 = 3;

const FREQUENCY_RANGE: ParamRange = ParamRange::new(0.0, f32::MAX);
/// 1200 * log2(f32::MAX)
const DETUNE_RANGE: ParamRange = ParamRange::new(-153_600.0, 153_600.0);
/// 40 * log10(f32::MAX)
const GAIN_RANGE: ParamRange = ParamRange::new(f32::MIN, 1541.0);
/// Lowpass/highpass resonance is in dB and bounded so `10^(Q/20)` stays finite.
const RESONANCE_DB_LIMIT: f64 = 770.636_78;

/// Filter response shape
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum BiquadFilterType {
    #[default]
    Lowpass,
    Highpass,
    Bandpass,
    Lowshelf,
    Highshelf,
    Peaking,
    Notch,
    Allpass,
}

impl BiquadFilterType {
    fn to_wire(self) -> u8 {
        match self {
            BiquadFilterType::Lowpass => 0,
            BiquadFilterType::Highpass => 1,
            BiquadFilterType::Bandpass => 2,
            BiquadFilterType::Lowshelf => 3,
            BiquadFilterType::Highshelf => 4,
            BiquadFilterType::Peaking => 5,
            BiquadFilterType::Notch => 6,
            BiquadFilterType::Allpass => 7,
        }
    }

    fn from_wire(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => BiquadFilterType::Lowpass,
            1 => BiquadFilterType::Highpass,
            2 => BiquadFilterType::Bandpass,
            3 => BiquadFilterType::Lowshelf,
            4 => BiquadFilterType::Highshelf,
            5 => BiquadFilterType::Peaking,
            6 => BiquadFilterType::Notch,
            7 => BiquadFilterType::Allpass,
            value => {
                return Err(WireError::InvalidEnum {
                    field: "biquad_filter_type",
                    value,
                })
            }
        })
    }
}

/// Descriptor of a biquad filter node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BiquadFilterDescription {
    pub channels: ChannelConfig,
    pub filter_type: BiquadFilterType,
    /// Cutoff/centre frequency in Hz
    pub frequency: f32,
    /// Frequency offset in cents
    pub detune: f32,
    pub q: f32,
    /// Shelf/peak gain in dB
    pub gain: f32,
}

impl Default for BiquadFilterDescription {
    fn default() -> Self {
        Self {
            channels: ChannelConfig::default(),
            filter_type: BiquadFilterType::Lowpass,
            frequency: 350.0,
            detune: 0.0,
            q: 1.0,
            gain: 0.0,
        }
    }
}

impl BiquadFilterDescription {
    pub fn new(filter_type: BiquadFilterType, frequency: f32) -> Self {
        Self {
            filter_type,
            frequency,
            ..Self::default()
        }
    }

    /// Coefficients for the intrinsic parameter values at `sample_rate`.
    pub fn coefficients(&self, sample_rate: f32) -> BiquadCoefficients {
        BiquadCoefficients::compute(
            self.filter_type,
            sample_rate as f64,
            computed_frequency(self.frequency, self.detune, sample_rate * 0.5) as f64,
            self.q as f64,
            self.gain as f64,
        )
    }

    /// Evaluate the filter's response at each of `frequencies` (Hz).
    ///
    /// Frequencies outside `[0, nyquist]` yield NaN for both magnitude and phase.
    pub fn frequency_response(&self, sample_rate: f32, frequencies: &[f32], magnitude: &mut [f32], phase: &mut [f32]) {
        let coefficients = self.coefficients(sample_rate);
        let nyquist = sample_rate * 0.5;
        for ((&frequency, mag), ph) in frequencies.iter().zip(magnitude.iter_mut()).zip(phase.iter_mut()) {
            if !(0.0..=nyquist).contains(&frequency) {
                *mag = f32::NAN;
                *ph = f32::NAN;
                continue;
            }
            let (m, p) = coefficients.response_at(PI * (frequency / nyquist) as f64);
            *mag = m as f32;
            *ph = p as f32;
        }
    }
}

impl WirePayload for BiquadFilterDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        self.channels.encode_wire_payload(writer);
        writer.append_u8(self.filter_type.to_wire());
        writer.append_f32(self.frequency);
        writer.append_f32(self.detune);
        writer.append_f32(self.q);
        writer.append_f32(self.gain);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            channels: ChannelConfig::decode_wire_payload(reader)?,
            filter_type: BiquadFilterType::from_wire(reader.read_u8()?)?,
            frequency: reader.read_finite_f32("frequency")?,
            detune: reader.read_finite_f32("detune")?,
            q: reader.read_finite_f32("q")?,
            gain: reader.read_finite_f32("gain")?,
        })
    }
}

impl NodeDescription for BiquadFilterDescription {
    const NODE_TYPE: NodeType = NodeType::BiquadFilter;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        let parameters_changed = self.filter_type != next.filter_type
            || self.frequency != next.frequency
            || self.detune != next.detune
            || self.q != next.q
            || self.gain != next.gain;
        GraphUpdateKind::when(self.channels != next.channels, GraphUpdateKind::Topology)
            .max(GraphUpdateKind::when(parameters_changed, GraphUpdateKind::Parameter))
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        Some(&self.channels)
    }

    fn param_count(&self) -> usize {
        4
    }
}

/// `frequency * 2^(detune / 1200)`, clamped to `[0, nyquist]`. NaN becomes 0.
pub fn computed_frequency(frequency: f32, detune: f32, nyquist: f32) -> f32 {
    let computed = frequency * (detune / 1200.0).exp2();
    if computed.is_nan() {
        0.0
    } else {
        computed.clamp(0.0, nyquist)
    }
}

/// Normalized direct-form coefficients (`a0 == 1`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BiquadCoefficients {
    pub b0: f64,
    pub b1: f64,
    pub b2: f64,
    pub a1: f64,
    pub a2: f64,
}

impl BiquadCoefficients {
    pub const PASS_THROUGH: Self = Self::gain(1.0);
    pub const ZERO: Self = Self::gain(0.0);

    const fn gain(b0: f64) -> Self {
        Self {
            b0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }

    fn normalized(b0: f64, b1: f64, b2: f64, a0: f64, a1: f64, a2: f64) -> Self {
        let inv = 1.0 / a0;
        let c = Self {
            b0: b0 * inv,
            b1: b1 * inv,
            b2: b2 * inv,
            a1: a1 * inv,
            a2: a2 * inv,
        };
        if [c.b0, c.b1, c.b2, c.a1, c.a2].iter().all(|v| v.is_finite()) {
            c
        } else {
            Self::PASS_THROUGH
        }
    }

    /// Cookbook coefficients with the boundary behaviour at 0 Hz and Nyquist.
    ///
    /// `frequency` must already be clamped to `[0, nyquist]`.
    pub fn compute(filter_type: BiquadFilterType, sample_rate: f64, frequency: f64, q: f64, gain_db: f64) -> Self {
        let normalized = if sample_rate > 0.0 {
            frequency / (sample_rate * 0.5)
        } else {
            0.0
        };
        let a = 10f64.powf(gain_db / 40.0);
        let w0 = PI * normalized;
        let (sin, cos) = w0.sin_cos();

        match filter_type {
            BiquadFilterType::Lowpass => {
                if normalized >= 1.0 {
                    return Self::PASS_THROUGH;
                }
                if normalized <= 0.0 {
                    return Self::ZERO;
                }
                let resonance = 10f64.powf(q.clamp(-RESONANCE_DB_LIMIT, RESONANCE_DB_LIMIT) / 20.0);
                let alpha = sin / (2.0 * resonance);
                let b1 = 1.0 - cos;
                Self::normalized(b1 * 0.5, b1, b1 * 0.5, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
            }
            BiquadFilterType::Highpass => {
                if normalized >= 1.0 {
                    return Self::ZERO;
                }
                if normalized <= 0.0 {
                    return Self::PASS_THROUGH;
                }
                let resonance = 10f64.powf(q.clamp(-RESONANCE_DB_LIMIT, RESONANCE_DB_LIMIT) / 20.0);
                let alpha = sin / (2.0 * resonance);
                let b1 = 1.0 + cos;
                Self::normalized(b1 * 0.5, -b1, b1 * 0.5, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
            }
            BiquadFilterType::Bandpass => {
                if normalized <= 0.0 || normalized >= 1.0 {
                    return Self::ZERO;
                }
                if q <= 0.0 {
                    return Self::PASS_THROUGH;
                }
                let alpha = sin / (2.0 * q.max(0.0001));
                Self::normalized(alpha, 0.0, -alpha, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
            }
            BiquadFilterType::Notch => {
                if normalized <= 0.0 || normalized >= 1.0 {
                    return Self::PASS_THROUGH;
                }
                if q <= 0.0 {
                    return Self::ZERO;
                }
                let alpha = sin / (2.0 * q.max(0.0001));
                Self::normalized(1.0, -2.0 * cos, 1.0, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
            }
            BiquadFilterType::Allpass => {
                if normalized <= 0.0 || normalized >= 1.0 {
                    return Self::PASS_THROUGH;
                }
                if q <= 0.0 {
                    return Self::gain(-1.0);
                }
                let alpha = sin / (2.0 * q.max(0.0001));
                Self::normalized(1.0 - alpha, -2.0 * cos, 1.0 + alpha, 1.0 + alpha, -2.0 * cos, 1.0 - alpha)
            }
            BiquadFilterType::Peaking => {
                if normalized <= 0.0 || normalized >= 1.0 {
                    return Self::PASS_THROUGH;
                }
                if q <= 0.0 {
                    return Self::gain(a * a);
                }
                let alpha = sin / (2.0 * q.max(0.0001));
                Self::normalized(
                    1.0 + alpha * a,
                    -2.0 * cos,
                    1.0 - alpha * a,
                    1.0 + alpha / a,
                    -2.0 * cos,
                    1.0 - alpha / a,
                )
            }
            BiquadFilterType::Lowshelf => {
                if normalized >= 1.0 {
                    return Self::gain(a * a);
                }
                if normalized <= 0.0 {
                    return Self::PASS_THROUGH;
                }
                let (alpha, sqrt_a) = shelf_alpha(sin, a);
                let k = 2.0 * sqrt_a * alpha;
                Self::normalized(
                    a * ((a + 1.0) - (a - 1.0) * cos + k),
                    2.0 * a * ((a - 1.0) - (a + 1.0) * cos),
                    a * ((a + 1.0) - (a - 1.0) * cos - k),
                    (a + 1.0) + (a - 1.0) * cos + k,
                    -2.0 * ((a - 1.0) + (a + 1.0) * cos),
                    (a + 1.0) + (a - 1.0) * cos - k,
                )
            }
            BiquadFilterType::Highshelf => {
                if normalized >= 1.0 {
                    return Self::PASS_THROUGH;
                }
                if normalized <= 0.0 {
                    return Self::gain(a * a);
                }
                let (alpha, sqrt_a) = shelf_alpha(sin, a);
                let k = 2.0 * sqrt_a * alpha;
                Self::normalized(
                    a * ((a + 1.0) + (a - 1.0) * cos + k),
                    -2.0 * a * ((a - 1.0) + (a + 1.0) * cos),
                    a * ((a + 1.0) + (a - 1.0) * cos - k),
                    (a + 1.0) - (a - 1.0) * cos + k,
                    2.0 * ((a - 1.0) - (a + 1.0) * cos),
                    (a + 1.0) - (a - 1.0) * cos - k,
                )
            }
        }
    }

    /// Magnitude and phase at normalized angular frequency `w` (radians per sample).
    pub fn response_at(&self, w: f64) -> (f64, f64) {
        let (s1, c1) = w.sin_cos();
        let (s2, c2) = (2.0 * w).sin_cos();
        let num_re = self.b0 + self.b1 * c1 + self.b2 * c2;
        let num_im = -(self.b1 * s1 + self.b2 * s2);
        let den_re = 1.0 + self.a1 * c1 + self.a2 * c2;
        let den_im = -(self.a1 * s1 + self.a2 * s2);
        let magnitude = num_re.hypot(num_im) / den_re.hypot(den_im);
        let phase = num_im.atan2(num_re) - den_im.atan2(den_re);
        (magnitude, phase)
    }
}

/// Shelf slope fixed at S = 1.
fn shelf_alpha(sin: f64, a: f64) -> (f64, f64) {
    let slope = 1.0;
    let alpha = sin / 2.0 * ((a + 1.0 / a) * (1.0 / slope - 1.0) + 2.0).sqrt();
    (alpha, a.sqrt())
}

#[derive(Clone, Copy, Default)]
struct ChannelState {
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
}

/// Direct-form I biquad with k-rate parameters and per-channel f64 state.
pub struct BiquadFilterRenderNode {
    description: BiquadFilterDescription,
    coefficients: BiquadCoefficients,
    /// (frequency, detune, q, gain) the coefficients were computed from
    computed_from: Option<[f32; 4]>,
    state: [ChannelState; MAX_CHANNELS],
    active_channels: usize,
}

impl BiquadFilterRenderNode {
    pub fn new(description: &BiquadFilterDescription) -> Self {
        Self {
            description: *description,
            coefficients: BiquadCoefficients::PASS_THROUGH,
            computed_from: None,
            state: [ChannelState::default(); MAX_CHANNELS],
            active_channels: 0,
        }
    }

    pub fn coefficients(&self) -> BiquadCoefficients {
        self.coefficients
    }

    fn update_coefficients(&mut self, ctx: &RenderContext, params: &[ParamInput]) {
        let d = &self.description;
        let values = [
            k_rate_value(params, BIQUAD_FREQUENCY_PARAM as usize, d.frequency, FREQUENCY_RANGE),
            k_rate_value(params, BIQUAD_DETUNE_PARAM as usize, d.detune, DETUNE_RANGE),
            k_rate_value(params, BIQUAD_Q_PARAM as usize, d.q, ParamRange::UNBOUNDED),
            k_rate_value(params, BIQUAD_GAIN_PARAM as usize, d.gain, GAIN_RANGE),
        ];
        if self.computed_from == Some(values) {
            return;
        }
        let frequency = computed_frequency(values[0], values[1], ctx.nyquist());
        self.coefficients = BiquadCoefficients::compute(
            d.filter_type,
            ctx.sample_rate as f64,
            frequency as f64,
            values[2] as f64,
            values[3] as f64,
        );
        self.computed_from = Some(values);
    }
}

impl RenderNode for BiquadFilterRenderNode {
    fn process(&mut self, ctx: &RenderContext, inputs: &[AudioBus], params: &[ParamInput], output: &mut AudioBus) {
        let Some(input) = inputs.first() else {
            output.reset(1);
            return;
        };
        self.update_coefficients(ctx, params);

        let channels = input.channel_count();
        if channels > self.active_channels {
            for state in &mut self.state[self.active_channels..channels] {
                *state = ChannelState::default();
            }
        }
        self.active_channels = channels;

        output.set_channel_count(channels);
        let c = self.coefficients;
        for ch in 0..channels {
            let state = &mut self.state[ch];
            let out = output.channel_mut(ch);
            for (o, &x) in out.iter_mut().zip(input.channel(ch)) {
                let x = x as f64;
                let y = c.b0 * x + c.b1 * state.x1 + c.b2 * state.x2 - c.a1 * state.y1 - c.a2 * state.y2;
                state.x2 = state.x1;
                state.x1 = x;
                state.y2 = state.y1;
                state.y1 = y;
                *o = y as f32;
            }
        }
    }

    fn apply_description(&mut self, _ctx: &RenderContext, description: &GraphNodeDescription) {
        if let GraphNodeDescription::BiquadFilter(d) = description {
            if d.filter_type != self.description.filter_type {
                self.computed_from = None;
            }
            self.description = *d;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowpass_response_passes_dc_and_blocks_nyquist() {
        let filter = BiquadFilterDescription::new(BiquadFilterType::Lowpass, 1_000.0);
        let frequencies = [0.0, 24_000.0, -1.0, 30_000.0];
        let mut magnitude = [0.0f32; 4];
        let mut phase = [0.0f32; 4];
        filter.frequency_response(48_000.0, &frequencies, &mut magnitude, &mut phase);

        assert!((magnitude[0] - 1.0).abs() < 1e-4);
        assert!(phase[0].abs() < 1e-4);
        assert!(magnitude[1] < 1e-4);
        assert!(magnitude[2].is_nan() && phase[2].is_nan());
        assert!(magnitude[3].is_nan() && phase[3].is_nan());
    }

    const CTX: RenderContext = RenderContext {
        sample_rate: 48_000.0,
        quantum_size: 128,
        current_frame: 0,
    };

    fn step_input() -> AudioBus {
        let mut input = AudioBus::new(1, 128);
        input.channel_mut(0).fill(1.0);
        input
    }

    #[test]
    fn huge_detune_clamps_to_nyquist() {
        let description = BiquadFilterDescription {
            detune: 1.0e6,
            ..BiquadFilterDescription::new(BiquadFilterType::Lowpass, 1_000.0)
        };
        let mut node = BiquadFilterRenderNode::new(&description);
        let mut output = AudioBus::new(1, 128);
        node.process(&CTX, &[step_input()], &[], &mut output);

        let at_nyquist = BiquadFilterDescription::new(BiquadFilterType::Lowpass, 24_000.0).coefficients(48_000.0);
        assert_eq!(node.coefficients(), at_nyquist);
        assert!(output.channel(0).iter().all(|s| s.is_finite()));
        assert_eq!(computed_frequency(1_000.0, 153_600.0, 24_000.0), 24_000.0);
        assert_eq!(computed_frequency(f32::NAN, 0.0, 24_000.0), 0.0);
    }

    #[test]
    fn parameter_update_keeps_filter_state() {
        let description = BiquadFilterDescription::new(BiquadFilterType::Lowpass, 1_000.0);
        let mut updated = BiquadFilterRenderNode::new(&description);
        let mut untouched = BiquadFilterRenderNode::new(&description);
        let mut a = AudioBus::new(1, 128);
        let mut b = AudioBus::new(1, 128);
        updated.process(&CTX, &[step_input()], &[], &mut a);
        untouched.process(&CTX, &[step_input()], &[], &mut b);

        // lowpass ignores gain, so the coefficients are recomputed to the same values
        let next = BiquadFilterDescription { gain: 12.0, ..description };
        assert_eq!(description.classify_update(&next), GraphUpdateKind::Parameter);
        updated.apply_description(&CTX, &GraphNodeDescription::BiquadFilter(next));

        updated.process(&CTX, &[step_input()], &[], &mut a);
        untouched.process(&CTX, &[step_input()], &[], &mut b);
        assert_eq!(a.channel(0), b.channel(0));
        assert!(a.channel(0)[0] > 0.5);
    }
}
