//! Heavyweight resources referenced from descriptors by opaque handle.
//!
//! Descriptors never own PCM data or provider objects; they carry a [`ResourceId`]. The control
//! thread owns a [`GraphResourceRegistry`] and hands the render thread an immutable
//! [`ResourceSnapshot`] alongside every graph update. Handles are only meaningful for the
//! lifetime of the snapshot that accompanied them.

use std::fmt;
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use rtrb::{Consumer, Producer, RingBuffer};

use crate::bus::AudioBus;
use crate::error::ScriptProcessorError;

/// Opaque 64-bit handle to a registered resource. `0` means "no resource".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct ResourceId(pub u64);

impl ResourceId {
    pub const NONE: ResourceId = ResourceId(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Decoded PCM, planar, at its own sample rate.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioBufferData {
    sample_rate: f32,
    length: usize,
    channels: Vec<Vec<f32>>,
}

impl AudioBufferData {
    /// Build from planar channels. Shorter channels are padded with silence.
    pub fn new(sample_rate: f32, mut channels: Vec<Vec<f32>>) -> Self {
        let length = channels.iter().map(Vec::len).max().unwrap_or(0);
        for channel in channels.iter_mut() {
            channel.resize(length, 0.0);
        }
        Self {
            sample_rate,
            length,
            channels,
        }
    }

    /// Build from interleaved samples.
    pub fn from_interleaved(sample_rate: f32, channel_count: usize, samples: &[f32]) -> Self {
        let channel_count = channel_count.max(1);
        let channels = (0..channel_count)
            .map(|ch| samples.iter().skip(ch).step_by(channel_count).copied().collect())
            .collect();
        Self::new(sample_rate, channels)
    }

    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate > 0.0 {
            self.length as f64 / self.sample_rate as f64
        } else {
            0.0
        }
    }
}

/// An external provider of already-decoded media element audio.
///
/// `pull` runs on the render thread and must never block.
pub trait MediaElementSource: Send + Sync {
    fn channel_count(&self) -> usize;

    /// Write up to `frames` frames into the first channels of `output` and return how many
    /// frames were written.
    fn pull(&self, output: &mut AudioBus, frames: usize) -> usize;
}

/// User DSP invoked by a script processor node once per full buffer.
pub trait ScriptProcessorCallback: Send {
    fn process(&mut self, input: &AudioBus, output: &mut AudioBus) -> Result<(), ScriptProcessorError>;
}

impl<F> ScriptProcessorCallback for F
where
    F: FnMut(&AudioBus, &mut AudioBus) -> Result<(), ScriptProcessorError> + Send,
{
    fn process(&mut self, input: &AudioBus, output: &mut AudioBus) -> Result<(), ScriptProcessorError> {
        self(input, output)
    }
}

/// A script processor callback shared between the registry and the render thread.
///
/// The render thread only ever calls `try_lock`.
pub type SharedScriptProcessor = Arc<Mutex<dyn ScriptProcessorCallback>>;

/// Control-thread owner of every resource a graph can reference.
#[derive(Default)]
pub struct GraphResourceRegistry {
    next_id: u64,
    buffers: HashMap<ResourceId, Arc<AudioBufferData>>,
    media_sources: HashMap<ResourceId, Arc<dyn MediaElementSource>>,
    script_processors: HashMap<ResourceId, SharedScriptProcessor>,
}

impl GraphResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&mut self) -> ResourceId {
        self.next_id += 1;
        ResourceId(self.next_id)
    }

    pub fn register_audio_buffer(&mut self, buffer: AudioBufferData) -> ResourceId {
        let id = self.allocate_id();
        self.buffers.insert(id, Arc::new(buffer));
        id
    }

    pub fn register_media_element_source(&mut self, source: Arc<dyn MediaElementSource>) -> ResourceId {
        let id = self.allocate_id();
        self.media_sources.insert(id, source);
        id
    }

    pub fn register_script_processor<C>(&mut self, callback: C) -> ResourceId
    where
        C: ScriptProcessorCallback + 'static,
    {
        let id = self.allocate_id();
        let shared: SharedScriptProcessor = Arc::new(Mutex::new(callback));
        self.script_processors.insert(id, shared);
        id
    }

    /// Forget a resource. Snapshots already handed out keep it alive until they are dropped.
    pub fn release(&mut self, id: ResourceId) -> bool {
        self.buffers.remove(&id).is_some()
            || self.media_sources.remove(&id).is_some()
            || self.script_processors.remove(&id).is_some()
    }

    /// Freeze the current set of resources for the render thread.
    pub fn snapshot(&self) -> Arc<ResourceSnapshot> {
        Arc::new(ResourceSnapshot {
            buffers: self.buffers.clone(),
            media_sources: self.media_sources.clone(),
            script_processors: self.script_processors.clone(),
        })
    }
}

impl fmt::Debug for GraphResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphResourceRegistry")
            .field("buffers", &self.buffers.len())
            .field("media_sources", &self.media_sources.len())
            .field("script_processors", &self.script_processors.len())
            .finish()
    }
}

/// Immutable resolver handed to the render thread with a graph update.
#[derive(Default, Clone)]
pub struct ResourceSnapshot {
    buffers: HashMap<ResourceId, Arc<AudioBufferData>>,
    media_sources: HashMap<ResourceId, Arc<dyn MediaElementSource>>,
    script_processors: HashMap<ResourceId, SharedScriptProcessor>,
}

impl ResourceSnapshot {
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn resolve_audio_buffer(&self, id: ResourceId) -> Option<Arc<AudioBufferData>> {
        self.buffers.get(&id).cloned()
    }

    pub fn resolve_media_element_audio_source(&self, id: ResourceId) -> Option<Arc<dyn MediaElementSource>> {
        self.media_sources.get(&id).cloned()
    }

    pub fn resolve_script_processor(&self, id: ResourceId) -> Option<SharedScriptProcessor> {
        self.script_processors.get(&id).cloned()
    }
}

impl fmt::Debug for ResourceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceSnapshot")
            .field("buffers", &self.buffers.len())
            .field("media_sources", &self.media_sources.len())
            .field("script_processors", &self.script_processors.len())
            .finish()
    }
}

/// Create a ring-backed media element source.
///
/// The [`MediaElementFeed`] end stays with whoever decodes the media; the
/// [`MediaElementRing`] end is registered with the resource registry.
pub fn media_element_ring(channels: usize, capacity_frames: usize) -> (MediaElementFeed, Arc<MediaElementRing>) {
    let channels = channels.max(1);
    let (producer, consumer) = RingBuffer::<f32>::new(capacity_frames.max(1) * channels);
    (
        MediaElementFeed { producer, channels },
        Arc::new(MediaElementRing {
            consumer: Mutex::new(consumer),
            channels,
        }),
    )
}

/// Writer half of [`media_element_ring`].
pub struct MediaElementFeed {
    producer: Producer<f32>,
    channels: usize,
}

impl MediaElementFeed {
    /// Push whole interleaved frames. Returns the number of frames accepted.
    pub fn push_interleaved(&mut self, samples: &[f32]) -> usize {
        let frames = (samples.len() / self.channels).min(self.producer.slots() / self.channels);
        for &sample in &samples[..frames * self.channels] {
            // space was checked above
            let _ = self.producer.push(sample);
        }
        frames
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

/// Reader half of [`media_element_ring`].
pub struct MediaElementRing {
    consumer: Mutex<Consumer<f32>>,
    channels: usize,
}

impl MediaElementSource for MediaElementRing {
    fn channel_count(&self) -> usize {
        self.channels
    }

    fn pull(&self, output: &mut AudioBus, frames: usize) -> usize {
        // only the render thread pulls, so this never contends
        let Ok(mut consumer) = self.consumer.try_lock() else {
            return 0;
        };
        let channels = self.channels.min(output.channel_count());
        let frames = frames
            .min(output.frame_count())
            .min(consumer.slots() / self.channels);
        for frame in 0..frames {
            for ch in 0..self.channels {
                let sample = consumer.pop().unwrap_or(0.0);
                if ch < channels {
                    output.channel_mut(ch)[frame] = sample;
                }
            }
        }
        frames
    }
}
