//! Lock-free readback of render-thread measurements.
//!
//! Analyser snapshots are double-buffered: the render thread fills the back slot and then flips
//! an atomic index; readers load the index first and copy the front slot. Both sides only ever
//! `try_lock` a slot, so neither can be made to wait. A reader may see a snapshot one
//! generation old.
//!
//! Compressor gain reduction is a single `f32` published through an atomic.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use hashbrown::HashMap;

use crate::node::NodeId;

struct SnapshotSlot {
    time_domain: Vec<f32>,
    frequency_db: Vec<f32>,
}

/// Double-buffered analyser output shared between one analyser node and its readers.
pub struct AnalyserTap {
    fft_size: usize,
    slots: [Mutex<SnapshotSlot>; 2],
    front: AtomicUsize,
    generation: AtomicU64,
    published_frame: AtomicU64,
}

impl AnalyserTap {
    pub(crate) fn new(fft_size: usize) -> Arc<Self> {
        let slot = || {
            Mutex::new(SnapshotSlot {
                time_domain: vec![0.0; fft_size],
                frequency_db: vec![f32::NEG_INFINITY; fft_size / 2],
            })
        };
        Arc::new(Self {
            fft_size,
            slots: [slot(), slot()],
            front: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            published_frame: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of snapshots published so far. `0` means no data yet.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Context frame at the end of the quantum the front snapshot was taken from.
    #[inline]
    pub fn published_frame(&self) -> u64 {
        self.published_frame.load(Ordering::Acquire)
    }

    /// Fill the back slot and make it the front one. Skips the publication if a reader is still
    /// holding the back slot.
    pub(crate) fn publish<F>(&self, frame: u64, fill: F)
    where
        F: FnOnce(&mut [f32], &mut [f32]),
    {
        let back = 1 - self.front.load(Ordering::Acquire);
        let Ok(mut slot) = self.slots[back].try_lock() else {
            return;
        };
        let SnapshotSlot {
            time_domain,
            frequency_db,
        } = &mut *slot;
        fill(time_domain, frequency_db);
        drop(slot);
        self.published_frame.store(frame, Ordering::Release);
        self.front.store(back, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Copy the latest snapshot. Returns `false` when nothing has been published yet, when
    /// `fft_size` does not match, or when the writer is mid-flip.
    pub fn try_copy(&self, fft_size: usize, out_time_domain: &mut [f32], out_frequency_db: &mut [f32]) -> bool {
        if fft_size != self.fft_size || self.generation() == 0 {
            return false;
        }
        let front = self.front.load(Ordering::Acquire);
        let Ok(slot) = self.slots[front].try_lock() else {
            return false;
        };
        let n = out_time_domain.len().min(slot.time_domain.len());
        out_time_domain[..n].copy_from_slice(&slot.time_domain[..n]);
        let n = out_frequency_db.len().min(slot.frequency_db.len());
        out_frequency_db[..n].copy_from_slice(&slot.frequency_db[..n]);
        true
    }
}

/// Latest gain of a compressor (reduction times makeup), in dB.
#[derive(Default)]
pub struct ReductionMeter {
    bits: AtomicU32,
    published: AtomicBool,
}

impl ReductionMeter {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn publish(&self, reduction_db: f32) {
        self.bits.store(reduction_db.to_bits(), Ordering::Relaxed);
        self.published.store(true, Ordering::Release);
    }

    pub fn read(&self) -> Option<f32> {
        if self.published.load(Ordering::Acquire) {
            Some(f32::from_bits(self.bits.load(Ordering::Relaxed)))
        } else {
            None
        }
    }
}

/// A metering endpoint owned by one render node.
#[derive(Clone)]
pub enum MeterHandle {
    Analyser(Arc<AnalyserTap>),
    Compressor(Arc<ReductionMeter>),
}

/// Per-graph directory of meters, republished by the render thread after every rebuild.
pub struct MeteringRegistry {
    meters: ArcSwap<HashMap<NodeId, MeterHandle>>,
}

impl Default for MeteringRegistry {
    fn default() -> Self {
        Self {
            meters: ArcSwap::from_pointee(HashMap::new()),
        }
    }
}

impl MeteringRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn publish(&self, meters: HashMap<NodeId, MeterHandle>) {
        self.meters.store(Arc::new(meters));
    }

    pub fn try_copy_analyser_snapshot(
        &self,
        node: NodeId,
        fft_size: usize,
        out_time_domain: &mut [f32],
        out_frequency_db: &mut [f32],
    ) -> bool {
        match self.meters.load().get(&node) {
            Some(MeterHandle::Analyser(tap)) => tap.try_copy(fft_size, out_time_domain, out_frequency_db),
            _ => false,
        }
    }

    pub fn try_copy_dynamics_compressor_reduction(&self, node: NodeId) -> Option<f32> {
        match self.meters.load().get(&node) {
            Some(MeterHandle::Compressor(meter)) => meter.read(),
            _ => None,
        }
    }

    /// Frame of the latest analyser snapshot for `node`, if one exists.
    pub fn analyser_published_frame(&self, node: NodeId) -> Option<u64> {
        match self.meters.load().get(&node) {
            Some(MeterHandle::Analyser(tap)) if tap.generation() > 0 => Some(tap.published_frame()),
            _ => None,
        }
    }
}

/// Convert dB magnitudes to the byte scale spanned by `[min_db, max_db]`.
pub fn frequency_db_to_bytes(frequency_db: &[f32], min_db: f32, max_db: f32, out: &mut [u8]) {
    let range = (max_db - min_db).max(f32::EPSILON);
    for (o, &db) in out.iter_mut().zip(frequency_db) {
        let scaled = 255.0 * (db - min_db) / range;
        *o = if scaled.is_nan() { 0 } else { scaled.clamp(0.0, 255.0) as u8 };
    }
}

/// Convert time-domain samples in `[-1, 1]` to bytes centred on 128.
pub fn time_domain_to_bytes(time_domain: &[f32], out: &mut [u8]) {
    for (o, &s) in out.iter_mut().zip(time_domain) {
        *o = (128.0 * (1.0 + s)).clamp(0.0, 255.0) as u8;
    }
}
