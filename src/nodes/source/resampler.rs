//! Windowed-sinc interpolation for playback at arbitrary rates

use core::f64::consts::PI;

/// Kernel length in input samples.
pub const SINC_TAPS: usize = 32;
/// Fractional positions the kernel is tabulated at.
pub const SINC_PHASES: usize = 256;

/// Tabulated Blackman-windowed sinc kernel.
///
/// Row `p` holds the taps for a fractional offset of `p / SINC_PHASES`; each row sums to one so
/// DC passes at unity gain. The table is rebuilt in place whenever the cutoff moves, which only
/// happens when the playback increment crosses or moves above `1.0`.
pub struct SincKernel {
    cutoff: f64,
    table: Vec<f32>,
}

impl SincKernel {
    pub fn new() -> Self {
        let mut kernel = Self {
            cutoff: f64::NAN,
            table: vec![0.0; (SINC_PHASES + 1) * SINC_TAPS],
        };
        kernel.prepare(1.0);
        kernel
    }

    /// Cutoff (relative to the input Nyquist) for reading `increment` input samples per output
    /// sample.
    pub fn cutoff_for(increment: f64) -> f64 {
        let step = increment.abs();
        if step > 1.0 {
            1.0 / step
        } else {
            1.0
        }
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// Re-tabulate for `cutoff` if it changed.
    pub fn prepare(&mut self, cutoff: f64) {
        if (cutoff - self.cutoff).abs() < 1e-9 {
            return;
        }
        self.cutoff = cutoff;
        let half = (SINC_TAPS / 2) as f64;

        for (phase, row) in self.table.chunks_exact_mut(SINC_TAPS).enumerate() {
            let frac = phase as f64 / SINC_PHASES as f64;
            let mut sum = 0.0;
            for (tap, coefficient) in row.iter_mut().enumerate() {
                let t = tap as f64 - (half - 1.0) - frac;
                let n = (t + half) / SINC_TAPS as f64;
                let window = 0.42 - 0.5 * (2.0 * PI * n).cos() + 0.08 * (4.0 * PI * n).cos();
                let x = cutoff * t;
                let sinc = if x.abs() < 1e-12 { 1.0 } else { (PI * x).sin() / (PI * x) };
                let value = cutoff * sinc * window.max(0.0);
                *coefficient = value as f32;
                sum += value;
            }
            if sum.abs() > 1e-12 {
                row.iter_mut().for_each(|c| *c = (*c as f64 / sum) as f32);
            }
        }
    }

    /// Interpolate `samples` at fractional `position`. Samples outside the slice read as zero.
    pub fn interpolate(&self, samples: &[f32], position: f64) -> f32 {
        let base = position.floor();
        let phase = ((position - base) * SINC_PHASES as f64).round() as usize;
        let row = &self.table[phase * SINC_TAPS..(phase + 1) * SINC_TAPS];
        let first = base as i64 - (SINC_TAPS as i64 / 2 - 1);

        row.iter()
            .enumerate()
            .map(|(tap, &c)| {
                let index = first + tap as i64;
                if index >= 0 && (index as usize) < samples.len() {
                    samples[index as usize] * c
                } else {
                    0.0
                }
            })
            .sum()
    }
}

impl Default for SincKernel {
    fn default() -> Self {
        Self::new()
    }
}

/// Two-point linear interpolation; past-the-end reads as zero.
#[inline]
pub fn interpolate_linear(samples: &[f32], position: f64) -> f32 {
    let base = position.floor();
    let frac = (position - base) as f32;
    let index = base as i64;
    let at = |i: i64| {
        if i >= 0 && (i as usize) < samples.len() {
            samples[i as usize]
        } else {
            0.0
        }
    };
    let s0 = at(index);
    s0 + (at(index + 1) - s0) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_sum_to_unity() {
        let mut kernel = SincKernel::new();
        for cutoff in [1.0, 0.5, 0.25] {
            kernel.prepare(cutoff);
            for row in kernel.table.chunks_exact(SINC_TAPS) {
                let sum: f32 = row.iter().sum();
                assert!((sum - 1.0).abs() < 1e-4, "row sums to {}", sum);
            }
        }
    }

    #[test]
    fn dc_passes_unchanged() {
        let kernel = SincKernel::new();
        let samples = vec![0.5; 256];
        for position in [40.0, 40.25, 100.5, 127.9] {
            assert!((kernel.interpolate(&samples, position) - 0.5).abs() < 1e-3);
        }
    }

    #[test]
    fn linear_midpoint() {
        assert_eq!(interpolate_linear(&[0.0, 1.0], 0.5), 0.5);
        assert_eq!(interpolate_linear(&[1.0], 0.5), 0.5);
    }
}
