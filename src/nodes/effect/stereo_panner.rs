//! Equal-power stereo panner

use core::f32::consts::FRAC_PI_2;

use crate::bus::{AudioBus, ChannelCountMode, ChannelInterpretation};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{param, ParamInput, ParamRange, RenderContext, RenderNode};
use crate::wire::{WirePayload, WireReader, WireWriter};

/// Parameter index of `pan`.
pub const PAN_PARAM: u8 = 0;

const PAN_RANGE: ParamRange = ParamRange::new(-1.0, 1.0);

/// Descriptor of a stereo panner node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StereoPannerDescription {
    pub channels: ChannelConfig,
    /// -1 hard left, 0 centre, 1 hard right
    pub pan: f32,
}

impl StereoPannerDescription {
    pub fn new(pan: f32) -> Self {
        Self {
            pan,
            ..Self::default()
        }
    }
}

impl Default for StereoPannerDescription {
    fn default() -> Self {
        Self {
            channels: ChannelConfig::new(2, ChannelCountMode::ClampedMax, ChannelInterpretation::Speakers),
            pan: 0.0,
        }
    }
}

impl WirePayload for StereoPannerDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        self.channels.encode_wire_payload(writer);
        writer.append_f32(self.pan);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let channels = ChannelConfig::decode_wire_payload(reader)?;
        if channels.channel_count > 2 {
            return Err(WireError::OutOfRange("stereo panner channel_count"));
        }
        if channels.mode == ChannelCountMode::Max {
            return Err(WireError::OutOfRange("stereo panner channel_count_mode"));
        }
        Ok(Self {
            channels,
            pan: reader.read_finite_f32("pan")?,
        })
    }
}

impl NodeDescription for StereoPannerDescription {
    const NODE_TYPE: NodeType = NodeType::StereoPanner;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        GraphUpdateKind::when(self.channels != next.channels, GraphUpdateKind::Topology)
            .max(GraphUpdateKind::when(self.pan != next.pan, GraphUpdateKind::Parameter))
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        Some(&self.channels)
    }

    fn param_count(&self) -> usize {
        1
    }
}

/// Pan one frame. Returns `(left, right)`.
#[inline]
pub fn pan_frame(pan: f32, left: f32, right: Option<f32>) -> (f32, f32) {
    match right {
        None => {
            let x = (pan + 1.0) * 0.5 * FRAC_PI_2;
            (left * x.cos(), left * x.sin())
        }
        Some(right) if pan <= 0.0 => {
            let x = (pan + 1.0) * FRAC_PI_2;
            (left + right * x.cos(), right * x.sin())
        }
        Some(right) => {
            let x = pan * FRAC_PI_2;
            (left * x.cos(), right + left * x.sin())
        }
    }
}

/// Always produces two channels from a mono or stereo input.
pub struct StereoPannerRenderNode {
    pan: f32,
}

impl StereoPannerRenderNode {
    pub fn new(description: &StereoPannerDescription) -> Self {
        Self { pan: description.pan }
    }
}

impl RenderNode for StereoPannerRenderNode {
    fn process(&mut self, _ctx: &RenderContext, inputs: &[AudioBus], params: &[ParamInput], output: &mut AudioBus) {
        output.reset(2);
        let Some(input) = inputs.first() else {
            return;
        };
        let pan_param = param(params, PAN_PARAM as usize);

        for frame in 0..output.frame_count() {
            let pan = match pan_param {
                Some(p) => p.value_at(self.pan, frame, PAN_RANGE),
                None => PAN_RANGE.clamp(self.pan),
            };
            let left = input.channel(0)[frame];
            let right = (input.channel_count() > 1).then(|| input.channel(1)[frame]);
            let (l, r) = pan_frame(pan, left, right);
            output.channel_mut(0)[frame] = l;
            output.channel_mut(1)[frame] = r;
        }
    }

    fn apply_description(&mut self, _ctx: &RenderContext, description: &GraphNodeDescription) {
        if let GraphNodeDescription::StereoPanner(d) = description {
            self.pan = d.pan;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::f32::consts::FRAC_1_SQRT_2;

    fn assert_pair(actual: (f32, f32), expected: (f32, f32)) {
        assert!(
            (actual.0 - expected.0).abs() < 1e-6 && (actual.1 - expected.1).abs() < 1e-6,
            "{actual:?} != {expected:?}"
        );
    }

    #[test]
    fn mono_input_is_spread_with_equal_power() {
        assert_pair(pan_frame(-1.0, 1.0, None), (1.0, 0.0));
        assert_pair(pan_frame(0.0, 1.0, None), (FRAC_1_SQRT_2, FRAC_1_SQRT_2));
        assert_pair(pan_frame(1.0, 1.0, None), (0.0, 1.0));
    }

    #[test]
    fn stereo_input_folds_toward_one_side() {
        assert_pair(pan_frame(0.0, 0.25, Some(0.5)), (0.25, 0.5));
        assert_pair(pan_frame(-1.0, 0.25, Some(0.5)), (0.75, 0.0));
        assert_pair(pan_frame(1.0, 0.25, Some(0.5)), (0.0, 0.75));
        assert_pair(pan_frame(-0.5, 0.25, Some(0.5)), (0.25 + 0.5 * FRAC_1_SQRT_2, 0.5 * FRAC_1_SQRT_2));
    }

    #[test]
    fn mono_input_renders_two_channels() {
        const CTX: RenderContext = RenderContext {
            sample_rate: 48_000.0,
            quantum_size: 8,
            current_frame: 0,
        };
        let mut node = StereoPannerRenderNode::new(&StereoPannerDescription::new(5.0));
        let mut input = AudioBus::new(1, 8);
        input.channel_mut(0).fill(0.5);
        let mut output = AudioBus::with_capacity(1, 8, 2);

        node.process(&CTX, &[input], &[], &mut output);
        assert_eq!(output.channel_count(), 2);
        // pan is clamped to hard right
        assert!(output.channel(0).iter().all(|s| s.abs() < 1e-6));
        assert!(output.channel(1).iter().all(|s| (s - 0.5).abs() < 1e-6));
    }
}
