//! Run-to-completion rendering with exact suspend points.
//!
//! The renderer owns a thread that renders quanta as fast as it can into a preallocated buffer.
//! Before each quantum it checks whether a suspension was requested at that frame; if so it
//! parks on a `Condvar` until [`OfflineRenderer::resume`] is called, optionally with a
//! replacement graph.
//!
//! ```
//! use klangnetz::{GraphDescription, OfflineEvent, OfflineRenderer};
//!
//! let description = GraphDescription::new(48_000.0, 2);
//! let mut renderer = OfflineRenderer::new(description, 1024);
//! renderer.suspend_at(300).unwrap(); // rounds up to 384
//! renderer.start().unwrap();
//! assert!(matches!(renderer.wait(), Ok(OfflineEvent::Suspended(384))));
//! renderer.resume(None).unwrap();
//! assert!(matches!(renderer.wait(), Ok(OfflineEvent::Completed(_))));
//! ```

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use tracing::debug;

use crate::engine::GraphUpdate;
use crate::error::EngineError;
use crate::graph::GraphDescription;
use crate::metering::MeteringRegistry;
use crate::node::{NodeId, RenderEvent};
use crate::render_graph::{RenderConfig, RenderGraph};
use crate::resources::{AudioBufferData, ResourceSnapshot};

/// What [`OfflineRenderer::wait`] observed.
#[derive(Debug)]
pub enum OfflineEvent {
    /// Rendering is paused with this many frames rendered.
    Suspended(u64),
    /// Rendering finished; the whole output.
    Completed(AudioBufferData),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Suspended(u64),
    Completed,
}

enum Schedule {
    Start(NodeId, u64),
    Stop(NodeId, u64),
}

struct OfflineState {
    phase: Phase,
    suspend_points: BTreeSet<u64>,
    /// First frame the render thread has not yet checked for suspension
    next_checked_frame: u64,
    pending_update: Option<(GraphDescription, Option<Arc<ResourceSnapshot>>)>,
    pending_schedules: Vec<Schedule>,
    events: Vec<RenderEvent>,
    result: Option<AudioBufferData>,
    current_frame: u64,
    cancelled: bool,
}

struct OfflineShared {
    state: Mutex<OfflineState>,
    changed: Condvar,
}

impl OfflineShared {
    fn lock(&self) -> MutexGuard<'_, OfflineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Renders a graph to a buffer of fixed length.
pub struct OfflineRenderer {
    quantum_size: usize,
    length: usize,
    graph: Option<RenderGraph>,
    metering: Arc<MeteringRegistry>,
    shared: Arc<OfflineShared>,
    thread: Option<JoinHandle<()>>,
}

impl OfflineRenderer {
    /// Renderer for `length` frames of `description`, at its sample rate.
    pub fn new(description: GraphDescription, length: usize) -> Self {
        Self::with_config(description, None, length, RenderConfig::default().quantum_size)
    }

    pub fn with_config(
        description: GraphDescription,
        resources: Option<Arc<ResourceSnapshot>>,
        length: usize,
        quantum_size: usize,
    ) -> Self {
        let metering = MeteringRegistry::new();
        let config = RenderConfig::new(description.sample_rate(), quantum_size);
        let mut graph = RenderGraph::new(config, metering.clone());
        graph.apply_update(description, resources);

        Self {
            quantum_size: config.quantum_size,
            length,
            graph: Some(graph),
            metering,
            shared: Arc::new(OfflineShared {
                state: Mutex::new(OfflineState {
                    phase: Phase::Idle,
                    suspend_points: BTreeSet::new(),
                    next_checked_frame: 0,
                    pending_update: None,
                    pending_schedules: Vec::new(),
                    events: Vec::new(),
                    result: None,
                    current_frame: 0,
                    cancelled: false,
                }),
                changed: Condvar::new(),
            }),
            thread: None,
        }
    }

    #[inline]
    pub fn length(&self) -> usize {
        self.length
    }

    /// Frames rendered so far.
    pub fn current_frame(&self) -> u64 {
        self.shared.lock().current_frame
    }

    /// Request a pause at `frame`, rounded up to the next quantum boundary. Returns the frame
    /// the renderer will actually stop at.
    pub fn suspend_at(&self, frame: u64) -> Result<u64, EngineError> {
        let quantum = self.quantum_size as u64;
        let boundary = frame.div_ceil(quantum) * quantum;
        let mut state = self.shared.lock();
        if state.phase == Phase::Completed {
            return Err(EngineError::RendererFinished);
        }
        if boundary < state.next_checked_frame || boundary >= self.length as u64 {
            return Err(EngineError::InvalidSuspendFrame(frame));
        }
        state.suspend_points.insert(boundary);
        Ok(boundary)
    }

    pub fn schedule_source_start(&self, node: NodeId, frame: u64) {
        self.shared.lock().pending_schedules.push(Schedule::Start(node, frame));
    }

    pub fn schedule_source_stop(&self, node: NodeId, frame: u64) {
        self.shared.lock().pending_schedules.push(Schedule::Stop(node, frame));
    }

    /// Spawn the render thread.
    pub fn start(&mut self) -> Result<(), EngineError> {
        let Some(graph) = self.graph.take() else {
            return Err(EngineError::AlreadyStarted);
        };
        self.shared.lock().phase = Phase::Running;

        let shared = self.shared.clone();
        let length = self.length;
        let thread = std::thread::Builder::new()
            .name("klangnetz-offline".into())
            .spawn(move || render_offline(graph, length, &shared));
        match thread {
            Ok(thread) => {
                self.thread = Some(thread);
                Ok(())
            }
            Err(err) => {
                self.shared.lock().phase = Phase::Idle;
                Err(err.into())
            }
        }
    }

    /// Block until the renderer suspends or completes.
    ///
    /// The completed buffer is handed out once; later calls fail with `RendererFinished`.
    pub fn wait(&self) -> Result<OfflineEvent, EngineError> {
        let mut state = self.shared.lock();
        loop {
            match state.phase {
                Phase::Idle => return Err(EngineError::NotStarted),
                Phase::Suspended(frame) => return Ok(OfflineEvent::Suspended(frame)),
                Phase::Completed => {
                    return state
                        .result
                        .take()
                        .map(OfflineEvent::Completed)
                        .ok_or(EngineError::RendererFinished)
                }
                Phase::Running => {
                    state = self
                        .shared
                        .changed
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    /// Continue after a suspension, applying `update` first if one is given.
    ///
    /// A malformed update is rejected here and the renderer stays suspended.
    pub fn resume(&self, update: Option<GraphUpdate>) -> Result<(), EngineError> {
        let decoded = update
            .map(|update| GraphDescription::decode(&update.bytes).map(|d| (d, update.resources)))
            .transpose()?;

        let mut state = self.shared.lock();
        if !matches!(state.phase, Phase::Suspended(_)) {
            return Err(EngineError::NotSuspended);
        }
        state.pending_update = decoded;
        state.phase = Phase::Running;
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Events raised since the last call.
    pub fn drain_events(&self) -> Vec<RenderEvent> {
        std::mem::take(&mut self.shared.lock().events)
    }

    pub fn metering(&self) -> &Arc<MeteringRegistry> {
        &self.metering
    }

    pub fn try_copy_analyser_snapshot(
        &self,
        node: NodeId,
        fft_size: usize,
        out_time_domain: &mut [f32],
        out_frequency_db: &mut [f32],
    ) -> bool {
        self.metering
            .try_copy_analyser_snapshot(node, fft_size, out_time_domain, out_frequency_db)
    }

    pub fn try_copy_dynamics_compressor_reduction(&self, node: NodeId) -> Option<f32> {
        self.metering.try_copy_dynamics_compressor_reduction(node)
    }
}

impl Drop for OfflineRenderer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.cancelled = true;
            self.shared.changed.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn destination_channels(graph: &RenderGraph) -> usize {
    graph
        .description()
        .and_then(|d| d.node(d.destination()))
        .and_then(|node| node.channel_config())
        .map_or(2, |config| config.clamped_count())
}

fn render_offline(mut graph: RenderGraph, length: usize, shared: &OfflineShared) {
    let quantum = graph.config().quantum_size;
    let sample_rate = graph.config().sample_rate;
    let mut channels: Vec<Vec<f32>> = (0..destination_channels(&graph))
        .map(|_| Vec::with_capacity(length))
        .collect();
    let mut frame = 0u64;

    while (frame as usize) < length {
        {
            let mut state = shared.lock();
            state.current_frame = frame;
            state.events.extend(graph.drain_events());
            state.next_checked_frame = frame + quantum as u64;

            if state.suspend_points.remove(&frame) {
                state.phase = Phase::Suspended(frame);
                shared.changed.notify_all();
                debug!(frame, "offline render suspended");
                while matches!(state.phase, Phase::Suspended(_)) && !state.cancelled {
                    state = shared.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
            if state.cancelled {
                return;
            }
            if let Some((description, resources)) = state.pending_update.take() {
                graph.apply_update(description, resources);
            }
            for schedule in state.pending_schedules.drain(..) {
                match schedule {
                    Schedule::Start(node, at) => graph.schedule_source_start(node, at),
                    Schedule::Stop(node, at) => graph.schedule_source_stop(node, at),
                };
            }
        }

        let output = graph.render_quantum();
        let take = quantum.min(length - frame as usize);
        let last = output.channel_count().saturating_sub(1);
        for (index, channel) in channels.iter_mut().enumerate() {
            if output.channel_count() == 0 {
                channel.extend(std::iter::repeat(0.0).take(take));
            } else {
                channel.extend_from_slice(&output.channel(index.min(last))[..take]);
            }
        }
        frame += quantum as u64;
    }

    let mut state = shared.lock();
    state.current_frame = frame.min(length as u64);
    state.events.extend(graph.drain_events());
    state.result = Some(AudioBufferData::new(sample_rate, channels));
    state.phase = Phase::Completed;
    shared.changed.notify_all();
    debug!(frames = length, "offline render completed");
}
