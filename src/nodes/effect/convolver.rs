//! Partitioned FFT convolution against an impulse response buffer

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::bus::{AudioBus, ChannelCountMode, ChannelInterpretation};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::node::{ParamInput, RenderContext, RenderNode};
use crate::resources::{AudioBufferData, ResourceId, ResourceSnapshot};
use crate::wire::{WirePayload, WireReader, WireWriter};

/// Descriptor of a convolver node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConvolverDescription {
    pub channels: ChannelConfig,
    /// Impulse response; [`ResourceId::NONE`] makes the node silent
    pub buffer_id: ResourceId,
    /// Scale the impulse response to unit energy
    pub normalize: bool,
}

impl ConvolverDescription {
    pub fn new(buffer_id: ResourceId) -> Self {
        Self {
            buffer_id,
            ..Self::default()
        }
    }
}

impl Default for ConvolverDescription {
    fn default() -> Self {
        Self {
            channels: ChannelConfig::new(2, ChannelCountMode::ClampedMax, ChannelInterpretation::Speakers),
            buffer_id: ResourceId::NONE,
            normalize: true,
        }
    }
}

impl WirePayload for ConvolverDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        self.channels.encode_wire_payload(writer);
        writer.append_u64(self.buffer_id.0);
        writer.append_bool(self.normalize);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let channels = ChannelConfig::decode_wire_payload(reader)?;
        if channels.channel_count > 2 {
            return Err(WireError::OutOfRange("convolver channel_count"));
        }
        if channels.mode == ChannelCountMode::Max {
            return Err(WireError::OutOfRange("convolver channel_count_mode"));
        }
        Ok(Self {
            channels,
            buffer_id: ResourceId(reader.read_u64()?),
            normalize: reader.read_bool("normalize")?,
        })
    }
}

impl NodeDescription for ConvolverDescription {
    const NODE_TYPE: NodeType = NodeType::Convolver;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        GraphUpdateKind::when(self.buffer_id != next.buffer_id, GraphUpdateKind::RebuildRequired)
            .max(GraphUpdateKind::when(self.channels != next.channels, GraphUpdateKind::Topology))
            .max(GraphUpdateKind::when(self.normalize != next.normalize, GraphUpdateKind::Parameter))
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        Some(&self.channels)
    }
}

/// `1 / sqrt(energy)` of the whole response, or `1` for a silent one.
pub fn normalization_scale(buffer: &AudioBufferData) -> f32 {
    let energy: f64 = (0..buffer.channel_count())
        .flat_map(|ch| buffer.channel(ch).iter())
        .map(|&s| s as f64 * s as f64)
        .sum();
    if energy > 0.0 && energy.is_finite() {
        (1.0 / energy.sqrt()) as f32
    } else {
        1.0
    }
}

/// Frequency-domain impulse response of one channel, one spectrum per partition.
struct ResponseChannel {
    partitions: Vec<Vec<Complex<f32>>>,
}

/// Ring of input spectra for one channel, one per partition.
struct InputChannel {
    spectra: Vec<Vec<Complex<f32>>>,
}

/// Uniformly partitioned overlap-add convolver.
///
/// The partition length equals the render quantum and each FFT is twice that, so the node adds
/// no latency beyond the response itself. The second half of every inverse transform is carried
/// into the next quantum as a tail. Everything is planned and allocated up front.
pub struct ConvolverRenderNode {
    normalize: bool,
    scale: f32,
    block: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    response: Vec<ResponseChannel>,
    history: [InputChannel; 2],
    tails: [Vec<f32>; 2],
    /// Ring position of the newest spectrum in `history`
    head: usize,
    work: Vec<Complex<f32>>,
    accumulator: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl ConvolverRenderNode {
    pub fn new(ctx: &RenderContext, description: &ConvolverDescription, resources: &ResourceSnapshot) -> Self {
        let block = ctx.quantum_size;
        let fft_size = block * 2;
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);
        let scratch_len = forward
            .get_inplace_scratch_len()
            .max(inverse.get_inplace_scratch_len());

        let buffer = resources.resolve_audio_buffer(description.buffer_id);
        let mut scale = 1.0;
        let mut response = Vec::new();
        let mut work = vec![Complex::new(0.0, 0.0); fft_size];
        let mut scratch = vec![Complex::new(0.0, 0.0); scratch_len];

        if let Some(buffer) = buffer.as_deref().filter(|b| b.length() > 0 && b.channel_count() > 0) {
            scale = normalization_scale(buffer);
            for ch in 0..buffer.channel_count().min(2) {
                let partitions = buffer
                    .channel(ch)
                    .chunks(block)
                    .map(|chunk| {
                        work.fill(Complex::new(0.0, 0.0));
                        for (w, &s) in work.iter_mut().zip(chunk) {
                            w.re = s;
                        }
                        forward.process_with_scratch(&mut work, &mut scratch);
                        work.clone()
                    })
                    .collect();
                response.push(ResponseChannel { partitions });
            }
        }

        let partition_count = response.first().map_or(0, |r| r.partitions.len());
        let input_channel = || InputChannel {
            spectra: vec![vec![Complex::new(0.0, 0.0); fft_size]; partition_count],
        };

        Self {
            normalize: description.normalize,
            scale,
            block,
            forward,
            inverse,
            response,
            history: [input_channel(), input_channel()],
            tails: [vec![0.0; block], vec![0.0; block]],
            head: 0,
            work,
            accumulator: vec![Complex::new(0.0, 0.0); fft_size],
            scratch,
        }
    }

    pub fn has_response(&self) -> bool {
        !self.response.is_empty()
    }

    /// Push the spectrum of the zero-padded `current` block for input channel `ch`.
    fn push_input(&mut self, ch: usize, current: &[f32]) {
        let spectrum = &mut self.history[ch].spectra[self.head];
        spectrum.fill(Complex::new(0.0, 0.0));
        for (s, &x) in spectrum.iter_mut().zip(current) {
            s.re = x;
        }
        self.forward.process_with_scratch(spectrum, &mut self.scratch);
    }

    /// Convolve the stored history of `input_ch` with response channel `response_ch` into
    /// output channel `out_ch`.
    fn convolve_into(&mut self, input_ch: usize, response_ch: usize, out_ch: usize, out: &mut [f32]) {
        let partition_count = self.response[response_ch].partitions.len();
        self.accumulator.fill(Complex::new(0.0, 0.0));
        for p in 0..partition_count {
            let slot = (self.head + partition_count - p) % partition_count;
            let input = &self.history[input_ch].spectra[slot];
            let partition = &self.response[response_ch].partitions[p];
            for ((acc, &x), &h) in self.accumulator.iter_mut().zip(input).zip(partition) {
                *acc += x * h;
            }
        }

        self.work.copy_from_slice(&self.accumulator);
        self.inverse.process_with_scratch(&mut self.work, &mut self.scratch);

        let gain = if self.normalize { self.scale } else { 1.0 } / self.work.len() as f32;
        let (head, tail) = self.work.split_at(self.block);
        let carried = &mut self.tails[out_ch];
        for ((o, c), w) in out.iter_mut().zip(carried.iter_mut()).zip(head) {
            *o = w.re * gain + *c;
        }
        for (c, w) in carried.iter_mut().zip(tail) {
            *c = w.re * gain;
        }
    }
}

impl RenderNode for ConvolverRenderNode {
    fn process(&mut self, _ctx: &RenderContext, inputs: &[AudioBus], _params: &[ParamInput], output: &mut AudioBus) {
        if !self.has_response() {
            output.reset(1);
            return;
        }
        let Some(input) = inputs.first() else {
            output.reset(1);
            return;
        };

        let input_channels = input.channel_count().min(2);
        let response_channels = self.response.len();
        let output_channels = if input_channels == 1 && response_channels == 1 { 1 } else { 2 };
        output.set_channel_count(output_channels);

        for ch in 0..input_channels {
            self.push_input(ch, input.channel(ch));
        }

        for out_ch in 0..output_channels {
            let input_ch = out_ch.min(input_channels - 1);
            let response_ch = out_ch.min(response_channels - 1);
            self.convolve_into(input_ch, response_ch, out_ch, output.channel_mut(out_ch));
        }

        let partition_count = self.response[0].partitions.len();
        self.head = (self.head + 1) % partition_count;
    }

    fn apply_description(&mut self, _ctx: &RenderContext, description: &GraphNodeDescription) {
        if let GraphNodeDescription::Convolver(d) = description {
            self.normalize = d.normalize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::GraphResourceRegistry;

    const CTX: RenderContext = RenderContext {
        sample_rate: 48_000.0,
        quantum_size: 128,
        current_frame: 0,
    };

    fn convolver(impulse: Vec<f32>, normalize: bool) -> ConvolverRenderNode {
        let mut registry = GraphResourceRegistry::new();
        let buffer_id = registry.register_audio_buffer(AudioBufferData::new(48_000.0, vec![impulse]));
        let description = ConvolverDescription {
            normalize,
            ..ConvolverDescription::new(buffer_id)
        };
        ConvolverRenderNode::new(&CTX, &description, &registry.snapshot())
    }

    fn ramp(offset: usize) -> AudioBus {
        let mut bus = AudioBus::new(1, 128);
        for (i, s) in bus.channel_mut(0).iter_mut().enumerate() {
            *s = ((offset + i) as f32 * 0.05).sin();
        }
        bus
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < 1e-4, "frame {i}: {a} != {e}");
        }
    }

    #[test]
    fn unit_impulse_is_identity() {
        let mut node = convolver(vec![1.0], false);
        let mut output = AudioBus::with_capacity(1, 128, 2);
        for quantum in 0..3 {
            let input = ramp(quantum * 128);
            node.process(&CTX, &[input.clone()], &[], &mut output);
            assert_eq!(output.channel_count(), 1);
            assert_close(output.channel(0), input.channel(0));
        }
    }

    #[test]
    fn response_longer_than_a_quantum_carries_into_the_next() {
        let mut impulse = vec![0.0; 200];
        impulse[150] = 1.0;
        let mut node = convolver(impulse, false);

        let mut click = AudioBus::new(1, 128);
        click.channel_mut(0)[100] = 1.0;
        let mut output = AudioBus::with_capacity(1, 128, 2);

        node.process(&CTX, &[click], &[], &mut output);
        assert_close(output.channel(0), &[0.0; 128]);

        node.process(&CTX, &[AudioBus::new(1, 128)], &[], &mut output);
        let mut expected = [0.0; 128];
        expected[122] = 1.0;
        assert_close(output.channel(0), &expected);

        node.process(&CTX, &[AudioBus::new(1, 128)], &[], &mut output);
        assert_close(output.channel(0), &[0.0; 128]);
    }

    #[test]
    fn normalize_toggles_without_a_rebuild() {
        let description = ConvolverDescription::new(ResourceId(1));
        let plain = ConvolverDescription {
            normalize: false,
            ..description
        };
        assert_eq!(description.classify_update(&plain), GraphUpdateKind::Parameter);
        assert_eq!(
            description.classify_update(&ConvolverDescription::new(ResourceId(2))),
            GraphUpdateKind::RebuildRequired
        );

        let mut node = convolver(vec![2.0], true);
        let mut output = AudioBus::with_capacity(1, 128, 2);
        let input = ramp(0);
        node.process(&CTX, &[input.clone()], &[], &mut output);
        assert_close(output.channel(0), input.channel(0));

        node.apply_description(&CTX, &GraphNodeDescription::Convolver(plain));
        let input = ramp(128);
        node.process(&CTX, &[input.clone()], &[], &mut output);
        let doubled: Vec<f32> = input.channel(0).iter().map(|s| s * 2.0).collect();
        assert_close(output.channel(0), &doubled);
    }

    #[test]
    fn missing_buffer_is_silent() {
        let registry = GraphResourceRegistry::new();
        let mut node = ConvolverRenderNode::new(&CTX, &ConvolverDescription::new(ResourceId(9)), &registry.snapshot());
        let mut output = AudioBus::with_capacity(1, 128, 2);
        node.process(&CTX, &[ramp(0)], &[], &mut output);
        assert!(!node.has_response());
        assert!(output.is_silent());
    }
}
