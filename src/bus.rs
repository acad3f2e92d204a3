//! Fixed-capacity multichannel sample buffers and channel mixing.
//!
//! An [`AudioBus`] is the unit of signal passed between render nodes. Its sample store is
//! allocated once at construction with room for `channel_capacity` channels, so changing the
//! active channel count during rendering never reallocates.

use itertools::izip;

use crate::error::BusError;

/// Maximum number of channels any input, output or parameter bus can carry.
pub const MAX_CHANNELS: usize = 32;

const SQRT_HALF: f32 = core::f32::consts::FRAC_1_SQRT_2;

/// How the channel count of a node input is derived from its connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelCountMode {
    /// Largest channel count among the connected outputs.
    Max,
    /// Like `Max`, but never above the configured channel count.
    ClampedMax,
    /// Always the configured channel count.
    Explicit,
}

impl ChannelCountMode {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            ChannelCountMode::Max => 0,
            ChannelCountMode::ClampedMax => 1,
            ChannelCountMode::Explicit => 2,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChannelCountMode::Max),
            1 => Some(ChannelCountMode::ClampedMax),
            2 => Some(ChannelCountMode::Explicit),
            _ => None,
        }
    }

    /// Channel count an input mixes to, given the widest connected output.
    ///
    /// An input with nothing connected (`max_input == 0`) still yields one silent channel in
    /// the `Max`/`ClampedMax` modes.
    pub fn computed_channel_count(self, max_input: usize, configured: usize) -> usize {
        let configured = configured.clamp(1, MAX_CHANNELS);
        let max_input = max_input.clamp(1, MAX_CHANNELS);
        match self {
            ChannelCountMode::Max => max_input,
            ChannelCountMode::ClampedMax => max_input.min(configured),
            ChannelCountMode::Explicit => configured,
        }
    }
}

/// How channels are matched up when mixing buses of different widths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelInterpretation {
    /// Speaker layouts (mono, stereo, quad, 5.1) are up/down-mixed with the standard gains.
    Speakers,
    /// Channels are matched by index; extra channels are dropped or left silent.
    Discrete,
}

impl ChannelInterpretation {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            ChannelInterpretation::Speakers => 0,
            ChannelInterpretation::Discrete => 1,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(ChannelInterpretation::Speakers),
            1 => Some(ChannelInterpretation::Discrete),
            _ => None,
        }
    }
}

/// A planar multichannel sample buffer with fixed capacity.
///
/// ```
/// use klangnetz::AudioBus;
///
/// let mut bus = AudioBus::with_capacity(1, 128, 2);
/// bus.channel_mut(0).fill(0.25);
/// bus.set_channel_count(2);
/// assert_eq!(bus.channel(1).len(), 128);
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBus {
    channel_capacity: usize,
    channel_count: usize,
    frame_count: usize,
    samples: Vec<f32>,
}

impl AudioBus {
    /// Create a bus whose capacity equals its initial channel count.
    pub fn new(channel_count: usize, frame_count: usize) -> Self {
        Self::with_capacity(channel_count, frame_count, channel_count)
    }

    /// Create a bus that can later grow up to `channel_capacity` channels without allocating.
    pub fn with_capacity(channel_count: usize, frame_count: usize, channel_capacity: usize) -> Self {
        assert!(frame_count > 0, "an audio bus needs at least one frame");
        assert!(
            channel_count <= channel_capacity,
            "channel count {} exceeds capacity {}",
            channel_count,
            channel_capacity
        );
        Self {
            channel_capacity,
            channel_count,
            frame_count,
            samples: vec![0.0; channel_capacity * frame_count],
        }
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    #[inline]
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Samples of channel `index`. Panics if `index` is not an active channel.
    #[inline]
    pub fn channel(&self, index: usize) -> &[f32] {
        assert!(index < self.channel_count, "channel {} out of {}", index, self.channel_count);
        let start = index * self.frame_count;
        &self.samples[start..start + self.frame_count]
    }

    /// Mutable samples of channel `index`. Panics if `index` is not an active channel.
    #[inline]
    pub fn channel_mut(&mut self, index: usize) -> &mut [f32] {
        assert!(index < self.channel_count, "channel {} out of {}", index, self.channel_count);
        let start = index * self.frame_count;
        &mut self.samples[start..start + self.frame_count]
    }

    /// Iterate the active channels.
    pub fn channels(&self) -> impl Iterator<Item = &[f32]> {
        self.samples[..self.channel_count * self.frame_count].chunks_exact(self.frame_count)
    }

    /// Iterate the active channels mutably.
    pub fn channels_mut(&mut self) -> impl Iterator<Item = &mut [f32]> {
        let active = self.channel_count * self.frame_count;
        self.samples[..active].chunks_exact_mut(self.frame_count)
    }

    /// Change the number of active channels.
    ///
    /// Asking for more channels than the bus was built for is a programming error and panics.
    /// Channels that become active keep whatever they last held; call [`zero`](Self::zero) if
    /// that matters.
    pub fn set_channel_count(&mut self, channel_count: usize) {
        if let Err(err) = self.try_set_channel_count(channel_count) {
            panic!("{}", err);
        }
    }

    /// Checked variant of [`set_channel_count`](Self::set_channel_count).
    pub fn try_set_channel_count(&mut self, channel_count: usize) -> Result<(), BusError> {
        if channel_count > self.channel_capacity {
            return Err(BusError::ChannelCountExceedsCapacity {
                requested: channel_count,
                capacity: self.channel_capacity,
            });
        }
        self.channel_count = channel_count;
        Ok(())
    }

    /// Clear the active channels. Unused capacity is left alone.
    pub fn zero(&mut self) {
        let active = self.channel_count * self.frame_count;
        self.samples[..active].fill(0.0);
    }

    /// Set the channel count and clear it in one go.
    pub fn reset(&mut self, channel_count: usize) {
        self.set_channel_count(channel_count);
        self.zero();
    }

    pub fn is_silent(&self) -> bool {
        self.channels().all(|channel| channel.iter().all(|&s| s == 0.0))
    }

    /// Multiply every active sample by `gain`.
    pub fn scale(&mut self, gain: f32) {
        for channel in self.channels_mut() {
            channel.iter_mut().for_each(|s| *s *= gain);
        }
    }

    /// Make this bus an exact copy of `source` (channel count and samples).
    pub fn copy_from(&mut self, source: &AudioBus) {
        assert_eq!(self.frame_count, source.frame_count, "frame count mismatch");
        self.set_channel_count(source.channel_count);
        let active = source.channel_count * source.frame_count;
        self.samples[..active].copy_from_slice(&source.samples[..active]);
    }

    /// Mix `source` into this bus, keeping this bus's channel count.
    ///
    /// With [`ChannelInterpretation::Speakers`] the mono/stereo/quad/5.1 layouts are up- or
    /// down-mixed with the standard speaker gains. Any other combination, and every combination
    /// under [`ChannelInterpretation::Discrete`], matches channels by index.
    pub fn sum_from(&mut self, source: &AudioBus, interpretation: ChannelInterpretation) {
        assert_eq!(self.frame_count, source.frame_count, "frame count mismatch");
        let inputs = source.channel_count;
        let outputs = self.channel_count;

        if inputs == outputs || interpretation == ChannelInterpretation::Discrete {
            self.sum_discrete(source);
            return;
        }

        match (inputs, outputs) {
            // up-mix
            (1, 2) | (1, 4) => {
                self.accumulate(0, &[(source.channel(0), 1.0)]);
                self.accumulate(1, &[(source.channel(0), 1.0)]);
            }
            (1, 6) => self.accumulate(2, &[(source.channel(0), 1.0)]),
            (2, 4) | (2, 6) => {
                self.accumulate(0, &[(source.channel(0), 1.0)]);
                self.accumulate(1, &[(source.channel(1), 1.0)]);
            }
            (4, 6) => {
                for (from, to) in [(0, 0), (1, 1), (2, 4), (3, 5)] {
                    self.accumulate(to, &[(source.channel(from), 1.0)]);
                }
            }
            // down-mix
            (2, 1) => self.accumulate(0, &[(source.channel(0), 0.5), (source.channel(1), 0.5)]),
            (4, 1) => self.accumulate(
                0,
                &[
                    (source.channel(0), 0.25),
                    (source.channel(1), 0.25),
                    (source.channel(2), 0.25),
                    (source.channel(3), 0.25),
                ],
            ),
            (6, 1) => self.accumulate(
                0,
                &[
                    (source.channel(0), SQRT_HALF),
                    (source.channel(1), SQRT_HALF),
                    (source.channel(2), 1.0),
                    (source.channel(4), 0.5),
                    (source.channel(5), 0.5),
                ],
            ),
            (4, 2) => {
                self.accumulate(0, &[(source.channel(0), 0.5), (source.channel(2), 0.5)]);
                self.accumulate(1, &[(source.channel(1), 0.5), (source.channel(3), 0.5)]);
            }
            (6, 2) => {
                self.accumulate(
                    0,
                    &[
                        (source.channel(0), 1.0),
                        (source.channel(2), SQRT_HALF),
                        (source.channel(4), SQRT_HALF),
                    ],
                );
                self.accumulate(
                    1,
                    &[
                        (source.channel(1), 1.0),
                        (source.channel(2), SQRT_HALF),
                        (source.channel(5), SQRT_HALF),
                    ],
                );
            }
            (6, 4) => {
                self.accumulate(0, &[(source.channel(0), 1.0), (source.channel(2), SQRT_HALF)]);
                self.accumulate(1, &[(source.channel(1), 1.0), (source.channel(2), SQRT_HALF)]);
                self.accumulate(2, &[(source.channel(4), 1.0)]);
                self.accumulate(3, &[(source.channel(5), 1.0)]);
            }
            _ => self.sum_discrete(source),
        }
    }

    fn sum_discrete(&mut self, source: &AudioBus) {
        let shared = self.channel_count.min(source.channel_count);
        for index in 0..shared {
            self.accumulate(index, &[(source.channel(index), 1.0)]);
        }
    }

    fn accumulate(&mut self, index: usize, terms: &[(&[f32], f32)]) {
        let out = self.channel_mut(index);
        for &(input, weight) in terms {
            for (o, &i) in izip!(out.iter_mut(), input.iter()) {
                *o += i * weight;
            }
        }
    }

    /// Interleave the first `frames` frames into `out`, writing `channels` samples per frame.
    ///
    /// Missing channels repeat the last active channel, the same way a mono source feeds a
    /// stereo device.
    pub fn interleave_into(&self, out: &mut [f32], channels: usize) {
        if channels == 0 || self.channel_count == 0 {
            out.fill(0.0);
            return;
        }
        let last = self.channel_count - 1;
        for (frame, chunk) in out.chunks_exact_mut(channels).take(self.frame_count).enumerate() {
            for (ch, sample) in chunk.iter_mut().enumerate() {
                *sample = self.channel(ch.min(last))[frame];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(channels: &[f32], frames: usize) -> AudioBus {
        let mut bus = AudioBus::new(channels.len(), frames);
        for (index, &value) in channels.iter().enumerate() {
            bus.channel_mut(index).fill(value);
        }
        bus
    }

    #[test]
    fn channel_count_stays_within_capacity() {
        let mut bus = AudioBus::with_capacity(1, 16, 4);
        bus.set_channel_count(4);
        assert_eq!(bus.channel_count(), 4);
        assert_eq!(
            bus.try_set_channel_count(5),
            Err(BusError::ChannelCountExceedsCapacity {
                requested: 5,
                capacity: 4
            })
        );
        assert_eq!(bus.channel_count(), 4);
    }

    #[test]
    #[should_panic]
    fn growing_past_capacity_panics() {
        AudioBus::new(2, 16).set_channel_count(3);
    }

    #[test]
    fn mono_up_mixes_to_both_sides() {
        let mut stereo = AudioBus::new(2, 8);
        stereo.sum_from(&filled(&[0.5], 8), ChannelInterpretation::Speakers);
        assert!(stereo.channels().all(|c| c.iter().all(|&s| s == 0.5)));
    }

    #[test]
    fn stereo_down_mixes_to_the_average() {
        let mut mono = AudioBus::new(1, 8);
        mono.sum_from(&filled(&[1.0, 0.5], 8), ChannelInterpretation::Speakers);
        assert!(mono.channel(0).iter().all(|&s| s == 0.75));
    }

    #[test]
    fn five_one_keeps_the_centre_in_mono() {
        let mut mono = AudioBus::new(1, 4);
        mono.sum_from(&filled(&[0.0, 0.0, 1.0, 0.0, 0.0, 0.0], 4), ChannelInterpretation::Speakers);
        assert!(mono.channel(0).iter().all(|&s| s == 1.0));
    }

    #[test]
    fn discrete_matches_by_index() {
        let mut stereo = AudioBus::new(2, 4);
        stereo.sum_from(&filled(&[0.25], 4), ChannelInterpretation::Discrete);
        assert!(stereo.channel(0).iter().all(|&s| s == 0.25));
        assert!(stereo.channel(1).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn computed_channel_count_per_mode() {
        assert_eq!(ChannelCountMode::Max.computed_channel_count(6, 2), 6);
        assert_eq!(ChannelCountMode::ClampedMax.computed_channel_count(6, 2), 2);
        assert_eq!(ChannelCountMode::Explicit.computed_channel_count(1, 4), 4);
        assert_eq!(ChannelCountMode::Max.computed_channel_count(0, 2), 1);
        assert_eq!(ChannelCountMode::Max.computed_channel_count(64, 2), MAX_CHANNELS);
    }

    proptest::proptest! {
        #[test]
        fn channel_count_never_exceeds_capacity(capacity in 1usize..=MAX_CHANNELS, requested in 0usize..64) {
            let mut bus = AudioBus::with_capacity(1, 8, capacity);
            let accepted = bus.try_set_channel_count(requested).is_ok();
            proptest::prop_assert_eq!(accepted, requested <= capacity);
            proptest::prop_assert!(bus.channel_count() <= bus.channel_capacity());
        }
    }

    #[test]
    fn interleave_repeats_the_last_channel() {
        let bus = filled(&[0.1, 0.2], 3);
        let mut out = [0.0f32; 9];
        bus.interleave_into(&mut out, 3);
        assert_eq!(out, [0.1, 0.2, 0.2, 0.1, 0.2, 0.2, 0.1, 0.2, 0.2]);
    }
}
