//! Shared output stream and the mixer that feeds it.
//!
//! Every realtime client renders into its own `rtrb` ring. The device callback pulls from all
//! of them through [`OutputMixer::mix_into`], which only reads an immutable producer snapshot
//! published with `ArcSwap`; registration and muting happen on the control thread under a lock
//! the callback never takes.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use hashbrown::HashMap;
use rtrb::Consumer;
use tracing::{debug, info, warn};

use crate::bus::MAX_CHANNELS;
use crate::error::EngineError;

/// Negotiated stream format.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceFormat {
    pub sample_rate: f32,
    pub channels: usize,
}

/// Something that can open an output stream fed by an [`OutputMixer`].
pub trait OutputDevice: Send + Sync {
    /// Format the stream will run at once started.
    fn format(&self) -> DeviceFormat;

    /// Open and start the stream. Called at most once per mixer.
    fn start(&self, mixer: Arc<OutputMixer>) -> Result<(), EngineError>;
}

/// Device that never opens a stream. Whoever owns it drives
/// [`OutputMixer::mix_into`] by hand, which is how the tests run without audio hardware.
#[derive(Clone, Copy, Debug)]
pub struct NullOutput {
    format: DeviceFormat,
}

impl NullOutput {
    pub fn new(sample_rate: f32, channels: usize) -> Self {
        Self {
            format: DeviceFormat {
                sample_rate,
                channels: channels.clamp(1, MAX_CHANNELS),
            },
        }
    }
}

impl OutputDevice for NullOutput {
    fn format(&self) -> DeviceFormat {
        self.format
    }

    fn start(&self, _mixer: Arc<OutputMixer>) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Per-producer counters, readable from any thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Frames pulled out of the producer's ring
    pub frames_read: u64,
    /// Callbacks in which the ring held less than a full request
    pub underruns: u64,
}

struct ProducerSlot {
    id: u64,
    /// Only the mixer locks this, and only with `try_lock`
    consumer: Mutex<Consumer<f32>>,
    samples_per_frame: usize,
    muted: AtomicBool,
    frames_read: AtomicU64,
    underruns: AtomicU64,
}

enum DeviceState {
    Idle,
    Running(DeviceFormat),
    Failed(String),
}

/// Mixes every registered producer into the device buffer.
pub struct OutputMixer {
    producers: Mutex<HashMap<u64, Arc<ProducerSlot>>>,
    snapshot: ArcSwap<Vec<Arc<ProducerSlot>>>,
    state: Mutex<DeviceState>,
    channels: AtomicUsize,
    device_played_frames: AtomicU64,
}

impl Default for OutputMixer {
    fn default() -> Self {
        Self {
            producers: Mutex::new(HashMap::new()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
            state: Mutex::new(DeviceState::Idle),
            channels: AtomicUsize::new(2),
            device_played_frames: AtomicU64::new(0),
        }
    }
}

impl OutputMixer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open the device on first use. A failure is remembered and reported again on every later
    /// call without retrying.
    pub fn ensure_started(self: &Arc<Self>, device: &dyn OutputDevice) -> Result<DeviceFormat, EngineError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            DeviceState::Running(format) => return Ok(*format),
            DeviceState::Failed(message) => return Err(EngineError::DeviceUnavailable(message.clone())),
            DeviceState::Idle => {}
        }

        let format = device.format();
        // the callback may fire before start returns
        self.channels.store(format.channels.clamp(1, MAX_CHANNELS), Ordering::Release);
        match device.start(self.clone()) {
            Ok(()) => {
                info!(sample_rate = format.sample_rate, channels = format.channels, "output device started");
                *state = DeviceState::Running(format);
                Ok(format)
            }
            Err(err) => {
                warn!(%err, "output device failed to start");
                let message = match err {
                    EngineError::DeviceUnavailable(message) => message,
                    other => other.to_string(),
                };
                *state = DeviceState::Failed(message.clone());
                Err(EngineError::DeviceUnavailable(message))
            }
        }
    }

    /// Format of the running device, if it started.
    pub fn format(&self) -> Option<DeviceFormat> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            DeviceState::Running(format) => Some(*format),
            _ => None,
        }
    }

    /// Add a producer ring. `bytes_per_frame` must describe whole `f32` samples.
    pub fn register_producer(&self, id: u64, consumer: Consumer<f32>, bytes_per_frame: usize) -> Result<(), EngineError> {
        let samples_per_frame = bytes_per_frame / core::mem::size_of::<f32>();
        if bytes_per_frame == 0
            || bytes_per_frame % core::mem::size_of::<f32>() != 0
            || samples_per_frame > MAX_CHANNELS
        {
            return Err(EngineError::BytesPerFrame(bytes_per_frame));
        }

        let slot = Arc::new(ProducerSlot {
            id,
            consumer: Mutex::new(consumer),
            samples_per_frame,
            muted: AtomicBool::new(false),
            frames_read: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
        });
        let mut producers = self.producers.lock().unwrap_or_else(PoisonError::into_inner);
        producers.insert(id, slot);
        self.publish(&producers);
        debug!(id, samples_per_frame, "producer registered");
        Ok(())
    }

    /// Remove a producer. A mix already in flight may still read it once.
    pub fn unregister_producer(&self, id: u64) -> bool {
        let mut producers = self.producers.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = producers.remove(&id).is_some();
        if removed {
            self.publish(&producers);
            debug!(id, "producer unregistered");
        }
        removed
    }

    /// Muted producers keep being drained but contribute nothing to the mix.
    pub fn set_producer_muted(&self, id: u64, muted: bool) -> bool {
        let producers = self.producers.lock().unwrap_or_else(PoisonError::into_inner);
        match producers.get(&id) {
            Some(slot) => {
                slot.muted.store(muted, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn producer_stats(&self, id: u64) -> Option<ProducerStats> {
        self.snapshot.load().iter().find(|slot| slot.id == id).map(|slot| ProducerStats {
            frames_read: slot.frames_read.load(Ordering::Relaxed),
            underruns: slot.underruns.load(Ordering::Relaxed),
        })
    }

    pub fn producer_count(&self) -> usize {
        self.snapshot.load().len()
    }

    /// Frames handed to the device so far.
    pub fn device_played_frames(&self) -> u64 {
        self.device_played_frames.load(Ordering::Relaxed)
    }

    /// Channel count the mixer interleaves for.
    pub fn channels(&self) -> usize {
        self.channels.load(Ordering::Acquire)
    }

    fn publish(&self, producers: &HashMap<u64, Arc<ProducerSlot>>) {
        let mut slots: Vec<Arc<ProducerSlot>> = producers.values().cloned().collect();
        slots.sort_by_key(|slot| slot.id);
        self.snapshot.store(Arc::new(slots));
    }

    /// Fill an interleaved device buffer with the clamped sum of every producer.
    pub fn mix_into(&self, out: &mut [f32]) {
        out.fill(0.0);
        let channels = self.channels().max(1);
        let frames = out.len() / channels;
        let snapshot = self.snapshot.load();
        let mut frame_buf = [0.0f32; MAX_CHANNELS];

        for slot in snapshot.iter() {
            let Ok(mut consumer) = slot.consumer.try_lock() else {
                continue;
            };
            let spf = slot.samples_per_frame;
            let available = consumer.slots() / spf;
            let read = available.min(frames);
            if read < frames {
                slot.underruns.fetch_add(1, Ordering::Relaxed);
            }
            let muted = slot.muted.load(Ordering::Relaxed);

            for frame in out.chunks_exact_mut(channels).take(read) {
                for sample in frame_buf[..spf].iter_mut() {
                    *sample = consumer.pop().unwrap_or(0.0);
                }
                if muted {
                    continue;
                }
                for (ch, o) in frame.iter_mut().enumerate() {
                    *o += frame_buf[ch.min(spf - 1)];
                }
            }
            slot.frames_read.fetch_add(read as u64, Ordering::Relaxed);
        }

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        self.device_played_frames.fetch_add(frames as u64, Ordering::Relaxed);
    }
}
