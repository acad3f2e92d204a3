//! Pass-through node that publishes time and frequency domain snapshots

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::bus::{AudioBus, ChannelInterpretation};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
use crate::error::WireError;
use crate::metering::{AnalyserTap, MeterHandle};
use crate::node::{ParamInput, RenderContext, RenderNode};
use crate::wire::{WirePayload, WireReader, WireWriter};

pub const MIN_FFT_SIZE: usize = 32;
pub const MAX_FFT_SIZE: usize = 32768;

/// Descriptor of an analyser node
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AnalyserDescription {
    pub channels: ChannelConfig,
    /// Power of two in `32..=32768`
    pub fft_size: u32,
    /// Weight of the previous spectrum, in `[0, 1]`
    pub smoothing_time_constant: f32,
    pub min_decibels: f32,
    pub max_decibels: f32,
}

impl AnalyserDescription {
    pub fn new(fft_size: u32) -> Self {
        Self {
            fft_size,
            ..Self::default()
        }
    }

    #[inline]
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size as usize / 2
    }
}

impl Default for AnalyserDescription {
    fn default() -> Self {
        Self {
            channels: ChannelConfig::default(),
            fft_size: 2048,
            smoothing_time_constant: 0.8,
            min_decibels: -100.0,
            max_decibels: -30.0,
        }
    }
}

impl WirePayload for AnalyserDescription {
    fn encode_wire_payload(&self, writer: &mut WireWriter) {
        self.channels.encode_wire_payload(writer);
        writer.append_u32(self.fft_size);
        writer.append_f32(self.smoothing_time_constant);
        writer.append_f32(self.min_decibels);
        writer.append_f32(self.max_decibels);
    }

    fn decode_wire_payload(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let channels = ChannelConfig::decode_wire_payload(reader)?;
        let fft_size = reader.read_u32()?;
        if !fft_size.is_power_of_two() || !(MIN_FFT_SIZE as u32..=MAX_FFT_SIZE as u32).contains(&fft_size) {
            return Err(WireError::OutOfRange("fft_size"));
        }
        let smoothing_time_constant = reader.read_finite_f32("smoothing_time_constant")?;
        if !(0.0..=1.0).contains(&smoothing_time_constant) {
            return Err(WireError::OutOfRange("smoothing_time_constant"));
        }
        let min_decibels = reader.read_finite_f32("min_decibels")?;
        let max_decibels = reader.read_finite_f32("max_decibels")?;
        if min_decibels >= max_decibels {
            return Err(WireError::OutOfRange("min_decibels"));
        }
        Ok(Self {
            channels,
            fft_size,
            smoothing_time_constant,
            min_decibels,
            max_decibels,
        })
    }
}

impl NodeDescription for AnalyserDescription {
    const NODE_TYPE: NodeType = NodeType::Analyser;

    fn classify_update(&self, next: &Self) -> GraphUpdateKind {
        let parameters_changed = self.smoothing_time_constant != next.smoothing_time_constant
            || self.min_decibels != next.min_decibels
            || self.max_decibels != next.max_decibels;
        GraphUpdateKind::when(self.fft_size != next.fft_size, GraphUpdateKind::RebuildRequired)
            .max(GraphUpdateKind::when(self.channels != next.channels, GraphUpdateKind::Topology))
            .max(GraphUpdateKind::when(parameters_changed, GraphUpdateKind::Parameter))
    }

    fn channel_config(&self) -> Option<&ChannelConfig> {
        Some(&self.channels)
    }
}

/// Blackman window coefficient for sample `n` of `size`.
#[inline]
pub fn blackman(n: usize, size: usize) -> f32 {
    let x = n as f32 / size as f32;
    0.42 - 0.5 * (2.0 * core::f32::consts::PI * x).cos() + 0.08 * (4.0 * core::f32::consts::PI * x).cos()
}

/// Passes its input through unchanged while keeping a mono history of the last `fft_size`
/// frames and a smoothed magnitude spectrum, published once per quantum.
pub struct AnalyserRenderNode {
    smoothing: f32,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    history: Vec<f32>,
    /// Index of the oldest frame in `history`
    write_index: usize,
    mono: AudioBus,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    tap: Arc<AnalyserTap>,
}

impl AnalyserRenderNode {
    pub fn new(ctx: &RenderContext, description: &AnalyserDescription) -> Self {
        let size = description.fft_size as usize;
        let fft = FftPlanner::new().plan_fft_forward(size);
        let scratch_len = fft.get_inplace_scratch_len();
        Self {
            smoothing: description.smoothing_time_constant,
            fft,
            window: (0..size).map(|n| blackman(n, size)).collect(),
            history: vec![0.0; size],
            write_index: 0,
            mono: AudioBus::new(1, ctx.quantum_size),
            spectrum: vec![Complex::new(0.0, 0.0); size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            smoothed: vec![0.0; size / 2],
            tap: AnalyserTap::new(size),
        }
    }

    fn push_history(&mut self) {
        let size = self.history.len();
        for &sample in self.mono.channel(0) {
            self.history[self.write_index] = sample;
            self.write_index = (self.write_index + 1) % size;
        }
    }

    fn analyse(&mut self) {
        let size = self.history.len();
        let (newest, oldest) = self.history.split_at(self.write_index);
        for ((bin, &sample), &w) in self.spectrum.iter_mut().zip(oldest.iter().chain(newest)).zip(&self.window) {
            *bin = Complex::new(sample * w, 0.0);
        }
        self.fft.process_with_scratch(&mut self.spectrum, &mut self.scratch);

        let tau = self.smoothing;
        let scale = 1.0 / size as f32;
        for (smoothed, bin) in self.smoothed.iter_mut().zip(&self.spectrum) {
            let magnitude = bin.norm() * scale;
            let next = tau * *smoothed + (1.0 - tau) * magnitude;
            *smoothed = if next.is_finite() { next } else { 0.0 };
        }
    }
}

impl RenderNode for AnalyserRenderNode {
    fn process(&mut self, ctx: &RenderContext, inputs: &[AudioBus], _params: &[ParamInput], output: &mut AudioBus) {
        self.mono.reset(1);
        match inputs.first() {
            Some(input) => {
                output.copy_from(input);
                self.mono.sum_from(input, ChannelInterpretation::Speakers);
            }
            None => output.reset(1),
        }

        self.push_history();
        self.analyse();

        let frame_end = ctx.current_frame + output.frame_count() as u64;
        let (history, write_index, smoothed) = (&self.history, self.write_index, &self.smoothed);
        self.tap.publish(frame_end, |time_domain, frequency_db| {
            let (newest, oldest) = history.split_at(write_index);
            for (t, &s) in time_domain.iter_mut().zip(oldest.iter().chain(newest)) {
                *t = s;
            }
            for (db, &magnitude) in frequency_db.iter_mut().zip(smoothed) {
                *db = if magnitude > 0.0 { 20.0 * magnitude.log10() } else { -1000.0 };
            }
        });
    }

    fn apply_description(&mut self, _ctx: &RenderContext, description: &GraphNodeDescription) {
        if let GraphNodeDescription::Analyser(d) = description {
            self.smoothing = d.smoothing_time_constant;
        }
    }

    fn meter(&self) -> Option<MeterHandle> {
        Some(MeterHandle::Analyser(self.tap.clone()))
    }
}
