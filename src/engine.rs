//! Realtime clients sharing one output device.
//!
//! An [`EngineController`] owns the device and its [`OutputMixer`]. Each [`RealtimeClient`]
//! edits a [`GraphDescription`] on the control thread, commits it as an encoded update, and has
//! a render thread of its own that keeps the client's output ring topped up.
//!
//! ```no_run
//! use klangnetz::{EngineController, GainDescription, NullOutput};
//! use std::sync::Arc;
//!
//! let controller = EngineController::new(Arc::new(NullOutput::new(48_000.0, 2)));
//! let mut client = controller.create_client().unwrap();
//! let gain = client.add_node(GainDescription::new(0.5));
//! client.connect(gain, client.destination()).unwrap();
//! client.commit().unwrap();
//! ```

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use delegate::delegate;
use hashbrown::HashMap;
use rtrb::{Consumer, Producer, RingBuffer};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::description::GraphNodeDescription;
use crate::error::{EngineError, GraphError};
use crate::graph::GraphDescription;
use crate::metering::MeteringRegistry;
use crate::node::{NodeId, RenderEvent};
use crate::output::{DeviceFormat, OutputDevice, OutputMixer};
use crate::queue::ControlMessageQueue;
use crate::render_graph::{RenderConfig, RenderGraph};
use crate::resources::{GraphResourceRegistry, ResourceSnapshot};

pub type ClientId = u64;

/// An encoded graph update plus the resources it refers to.
#[derive(Clone)]
pub struct GraphUpdate {
    pub bytes: Vec<u8>,
    /// `None` keeps the resources from the previous update
    pub resources: Option<Arc<ResourceSnapshot>>,
}

impl GraphUpdate {
    pub fn new(description: &GraphDescription) -> Self {
        Self {
            bytes: description.encode(),
            resources: None,
        }
    }

    pub fn with_resources(mut self, resources: Arc<ResourceSnapshot>) -> Self {
        self.resources = Some(resources);
        self
    }
}

/// Messages from a client to its render thread.
pub enum ClientMessage {
    Update(GraphUpdate),
    StartSource { node: NodeId, frame: u64 },
    StopSource { node: NodeId, frame: u64 },
}

/// State shared between a client, its render thread, and the controller.
struct ClientShared {
    running: AtomicBool,
    current_frame: AtomicU64,
    queued_frames: AtomicUsize,
    metering: Arc<MeteringRegistry>,
}

/// Owner of the output device and registry of live clients.
pub struct EngineController {
    config: EngineConfig,
    device: Arc<dyn OutputDevice>,
    mixer: Arc<OutputMixer>,
    clients: Mutex<HashMap<ClientId, Weak<ClientShared>>>,
    messages: ControlMessageQueue,
    next_client: AtomicU64,
}

impl EngineController {
    pub fn new(device: Arc<dyn OutputDevice>) -> Self {
        Self::with_config(device, EngineConfig::default())
    }

    pub fn with_config(device: Arc<dyn OutputDevice>, config: EngineConfig) -> Self {
        Self {
            config,
            device,
            mixer: OutputMixer::new(),
            clients: Mutex::new(HashMap::new()),
            messages: ControlMessageQueue::new(),
            next_client: AtomicU64::new(1),
        }
    }

    #[inline]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn mixer(&self) -> &Arc<OutputMixer> {
        &self.mixer
    }

    /// Open the device if it is not running yet.
    pub fn ensure_started(&self) -> Result<DeviceFormat, EngineError> {
        self.mixer.ensure_started(self.device.as_ref())
    }

    /// Report the device format to `callback` on the next [`process_messages`](Self::process_messages).
    ///
    /// Starts the device if needed. A device that failed to open reports the same failure to
    /// every callback without being retried.
    pub fn when_ready<F>(&self, callback: F)
    where
        F: FnOnce(Result<DeviceFormat, EngineError>) + Send + 'static,
    {
        let result = self.ensure_started();
        self.messages.enqueue(move || callback(result));
    }

    pub fn messages(&self) -> &ControlMessageQueue {
        &self.messages
    }

    /// Run pending control callbacks and forget clients that have been dropped.
    pub fn process_messages(&self) -> usize {
        self.prune_clients();
        self.messages.process_messages()
    }

    fn prune_clients(&self) {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.retain(|&id, client| {
            let alive = client.strong_count() > 0;
            if !alive {
                self.mixer.unregister_producer(id);
            }
            alive
        });
    }

    fn client(&self, id: ClientId) -> Option<Arc<ClientShared>> {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .and_then(Weak::upgrade)
    }

    pub fn client_count(&self) -> usize {
        self.prune_clients();
        self.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Create a client rendering at the device's format. Opens the device on first use.
    pub fn create_client(&self) -> Result<RealtimeClient, EngineError> {
        let format = self.ensure_started()?;
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let channels = format.channels;
        let quantum = self.config.quantum_size;

        let ring_samples = self.config.output_ring_samples(format.sample_rate, channels);
        let (ring, ring_consumer) = RingBuffer::<f32>::new(ring_samples);
        self.mixer
            .register_producer(id, ring_consumer, channels * core::mem::size_of::<f32>())?;

        let (sender, messages) = RingBuffer::new(self.config.update_queue_capacity);
        let (event_producer, events) = RingBuffer::new(self.config.event_queue_capacity);

        let metering = MeteringRegistry::new();
        let description = GraphDescription::new(format.sample_rate, channels as u32);
        let mut graph = RenderGraph::new(RenderConfig::new(format.sample_rate, quantum), metering.clone());
        graph.apply_update(description.clone(), None);

        let shared = Arc::new(ClientShared {
            running: AtomicBool::new(true),
            current_frame: AtomicU64::new(0),
            queued_frames: AtomicUsize::new(0),
            metering,
        });

        let ring_frames = ring_samples / channels;
        let target_frames = self
            .config
            .target_latency_frames(format.sample_rate)
            .min(ring_frames.saturating_sub(quantum).max(quantum));
        let worker = RenderWorker {
            graph,
            messages,
            events: event_producer,
            ring,
            ring_frames,
            channels,
            target_frames,
            shared: shared.clone(),
        };
        let thread = std::thread::Builder::new()
            .name(format!("klangnetz-render-{id}"))
            .spawn(move || worker.run());
        let thread = match thread {
            Ok(thread) => thread,
            Err(err) => {
                self.mixer.unregister_producer(id);
                return Err(err.into());
            }
        };

        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::downgrade(&shared));
        info!(client = id, sample_rate = format.sample_rate, channels, "client registered");

        Ok(RealtimeClient {
            id,
            format,
            description,
            resources: GraphResourceRegistry::new(),
            resources_dirty: false,
            sender,
            events,
            shared,
            mixer: self.mixer.clone(),
            thread: Some(thread),
        })
    }

    /// Mute or unmute a client's contribution to the mix. Its ring keeps draining either way.
    pub fn set_client_muted(&self, client: ClientId, muted: bool) -> bool {
        self.client(client).is_some() && self.mixer.set_producer_muted(client, muted)
    }

    pub fn device_played_frames(&self) -> u64 {
        self.mixer.device_played_frames()
    }

    pub fn try_copy_analyser_snapshot(
        &self,
        client: ClientId,
        node: NodeId,
        fft_size: usize,
        out_time_domain: &mut [f32],
        out_frequency_db: &mut [f32],
    ) -> bool {
        self.client(client).is_some_and(|shared| {
            shared
                .metering
                .try_copy_analyser_snapshot(node, fft_size, out_time_domain, out_frequency_db)
        })
    }

    pub fn try_copy_dynamics_compressor_reduction(&self, client: ClientId, node: NodeId) -> Option<f32> {
        self.client(client)?
            .metering
            .try_copy_dynamics_compressor_reduction(node)
    }
}

struct RenderWorker {
    graph: RenderGraph,
    messages: Consumer<ClientMessage>,
    events: Producer<RenderEvent>,
    ring: Producer<f32>,
    ring_frames: usize,
    channels: usize,
    target_frames: usize,
    shared: Arc<ClientShared>,
}

impl RenderWorker {
    fn run(mut self) {
        let quantum = self.graph.config().quantum_size;
        let mut interleaved = vec![0.0f32; quantum * self.channels];

        while self.shared.running.load(Ordering::Acquire) {
            let free_frames = self.ring.slots() / self.channels;
            let queued = self.ring_frames - free_frames;
            self.shared.queued_frames.store(queued, Ordering::Relaxed);
            if queued >= self.target_frames || free_frames < quantum {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }

            self.apply_messages();
            let output = self.graph.render_quantum();
            output.interleave_into(&mut interleaved, self.channels);
            for &sample in &interleaved {
                let _ = self.ring.push(sample);
            }
            for event in self.graph.drain_events() {
                // a full event queue drops the newest events
                let _ = self.events.push(event);
            }
            self.shared
                .current_frame
                .store(self.graph.current_frame(), Ordering::Release);
        }
        debug!("render thread stopped");
    }

    /// Apply scheduling messages and at most one graph update.
    fn apply_messages(&mut self) {
        let mut updated = false;
        while let Ok(message) = self.messages.peek() {
            if updated && matches!(message, ClientMessage::Update(_)) {
                break;
            }
            let Ok(message) = self.messages.pop() else {
                break;
            };
            match message {
                ClientMessage::Update(update) => {
                    updated = true;
                    // malformed updates are logged and dropped inside the graph
                    let _ = self.graph.apply_encoded_update(&update.bytes, update.resources);
                }
                ClientMessage::StartSource { node, frame } => {
                    self.graph.schedule_source_start(node, frame);
                }
                ClientMessage::StopSource { node, frame } => {
                    self.graph.schedule_source_stop(node, frame);
                }
            }
        }
    }
}

/// One graph rendering into the shared output.
///
/// Dropping the client stops its render thread and removes it from the mix.
pub struct RealtimeClient {
    id: ClientId,
    format: DeviceFormat,
    description: GraphDescription,
    resources: GraphResourceRegistry,
    resources_dirty: bool,
    sender: Producer<ClientMessage>,
    events: Consumer<RenderEvent>,
    shared: Arc<ClientShared>,
    mixer: Arc<OutputMixer>,
    thread: Option<JoinHandle<()>>,
}

impl RealtimeClient {
    delegate! {
        to self.description {
            pub fn destination(&self) -> NodeId;
            pub fn node_count(&self) -> usize;
            pub fn node(&self, id: NodeId) -> Option<&GraphNodeDescription>;
            pub fn node_mut(&mut self, id: NodeId) -> Option<&mut GraphNodeDescription>;
            pub fn add_node(&mut self, description: impl Into<GraphNodeDescription>) -> NodeId;
            pub fn set_node(&mut self, id: NodeId, description: impl Into<GraphNodeDescription>) -> Result<(), GraphError>;
            pub fn remove_node(&mut self, id: NodeId) -> Result<GraphNodeDescription, GraphError>;
            pub fn connect(&mut self, source: NodeId, destination: NodeId) -> Result<(), GraphError>;
            pub fn connect_ports(&mut self, source: NodeId, output: u8, destination: NodeId, input: u8) -> Result<(), GraphError>;
            pub fn connect_param(&mut self, source: NodeId, destination: NodeId, param: u8) -> Result<(), GraphError>;
            pub fn disconnect(&mut self, source: NodeId, destination: NodeId) -> bool;
            pub fn disconnect_all(&mut self, source: NodeId);
        }
    }

    #[inline]
    pub fn id(&self) -> ClientId {
        self.id
    }

    #[inline]
    pub fn format(&self) -> DeviceFormat {
        self.format
    }

    pub fn description(&self) -> &GraphDescription {
        &self.description
    }

    /// Resources for the next commit. Any access marks them for resending.
    pub fn resources_mut(&mut self) -> &mut GraphResourceRegistry {
        self.resources_dirty = true;
        &mut self.resources
    }

    /// Send a raw message to the render thread. Gives the message back if the queue is full.
    pub fn send(&mut self, msg: ClientMessage) -> Result<(), ClientMessage> {
        self.sender.push(msg).map_err(|rtrb::PushError::Full(m)| m)
    }

    /// Encode the current description and queue it for the render thread.
    pub fn commit(&mut self) -> Result<(), EngineError> {
        let mut update = GraphUpdate::new(&self.description);
        if self.resources_dirty {
            update = update.with_resources(self.resources.snapshot());
        }
        self.send(ClientMessage::Update(update))
            .map_err(|_| EngineError::UpdateQueueFull)?;
        self.resources_dirty = false;
        Ok(())
    }

    pub fn start_source(&mut self, node: NodeId, frame: u64) -> Result<(), EngineError> {
        self.send(ClientMessage::StartSource { node, frame })
            .map_err(|_| EngineError::UpdateQueueFull)
    }

    pub fn stop_source(&mut self, node: NodeId, frame: u64) -> Result<(), EngineError> {
        self.send(ClientMessage::StopSource { node, frame })
            .map_err(|_| EngineError::UpdateQueueFull)
    }

    /// Events raised by the render thread since the last call.
    pub fn drain_events(&mut self) -> impl Iterator<Item = RenderEvent> + '_ {
        std::iter::from_fn(|| self.events.pop().ok())
    }

    /// Frame at the start of the next quantum the render thread will produce.
    pub fn current_frame(&self) -> u64 {
        self.shared.current_frame.load(Ordering::Acquire)
    }

    /// Frames rendered but not yet pulled by the device.
    pub fn queued_frames(&self) -> usize {
        self.shared.queued_frames.load(Ordering::Relaxed)
    }

    /// Estimated output latency in seconds.
    pub fn output_latency(&self) -> f64 {
        self.queued_frames() as f64 / self.format.sample_rate as f64
    }

    pub fn metering(&self) -> &Arc<MeteringRegistry> {
        &self.shared.metering
    }

    pub fn try_copy_analyser_snapshot(
        &self,
        node: NodeId,
        fft_size: usize,
        out_time_domain: &mut [f32],
        out_frequency_db: &mut [f32],
    ) -> bool {
        self.shared
            .metering
            .try_copy_analyser_snapshot(node, fft_size, out_time_domain, out_frequency_db)
    }

    pub fn try_copy_dynamics_compressor_reduction(&self, node: NodeId) -> Option<f32> {
        self.shared.metering.try_copy_dynamics_compressor_reduction(node)
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.mixer.unregister_producer(self.id);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!(client = self.id, "client dropped");
    }
}
