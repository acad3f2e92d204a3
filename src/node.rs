//! Core render-node trait and the context types passed to it.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::bus::AudioBus;
use crate::description::GraphNodeDescription;
use crate::metering::MeterHandle;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for a graph node.
///
/// Ids are handed out monotonically and never reused, so the same logical node keeps its id
/// (and its render state) across topology rebuilds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Rebuild an id from its raw value. `0` is reserved.
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(NodeId(raw))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Information available while rendering one quantum.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderContext {
    /// Context sample rate in Hz
    pub sample_rate: f32,
    /// Frames per quantum
    pub quantum_size: usize,
    /// Context frame at the start of this quantum
    pub current_frame: u64,
}

impl RenderContext {
    #[inline]
    pub fn nyquist(&self) -> f32 {
        self.sample_rate * 0.5
    }
}

/// Something the render thread wants the control thread to know about.
///
/// Events are collected after each quantum and delivered asynchronously; nothing is ever
/// thrown across the thread boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum RenderEvent {
    /// A scheduled source reached its buffer end or its stop frame.
    SourceEnded(NodeId),
    /// User DSP failed; the node now outputs silence for the rest of the session.
    ScriptProcessorFailed { node: NodeId, message: String },
}

/// Valid range of an automatable parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParamRange {
    pub min: f32,
    pub max: f32,
}

impl ParamRange {
    pub const UNBOUNDED: ParamRange = ParamRange {
        min: f32::MIN,
        max: f32::MAX,
    };

    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    #[inline]
    pub fn clamp(&self, value: f32) -> f32 {
        if value.is_nan() {
            return self.min.max(0.0).min(self.max);
        }
        value.clamp(self.min, self.max)
    }
}

/// Audio-rate signal mixed into one parameter.
///
/// The computed value of a parameter is its intrinsic value plus this signal, clamped to the
/// parameter's range. Unconnected parameters skip the per-sample work entirely.
#[derive(Clone, Debug)]
pub struct ParamInput {
    pub(crate) bus: AudioBus,
    pub(crate) connected: bool,
}

impl ParamInput {
    pub fn new(quantum_size: usize) -> Self {
        Self {
            bus: AudioBus::new(1, quantum_size),
            connected: false,
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Raw modulation signal for this quantum (zeros when unconnected).
    #[inline]
    pub fn signal(&self) -> &[f32] {
        self.bus.channel(0)
    }

    /// A-rate value at `frame`.
    #[inline]
    pub fn value_at(&self, intrinsic: f32, frame: usize, range: ParamRange) -> f32 {
        if self.connected {
            range.clamp(intrinsic + self.bus.channel(0)[frame])
        } else {
            range.clamp(intrinsic)
        }
    }

    /// K-rate value: the first frame of the quantum.
    #[inline]
    pub fn k_rate(&self, intrinsic: f32, range: ParamRange) -> f32 {
        self.value_at(intrinsic, 0, range)
    }

    /// Fill `out` with the a-rate values for this quantum.
    pub fn fill_values(&self, intrinsic: f32, range: ParamRange, out: &mut [f32]) {
        if self.connected {
            for (o, &m) in out.iter_mut().zip(self.bus.channel(0)) {
                *o = range.clamp(intrinsic + m);
            }
        } else {
            out.fill(range.clamp(intrinsic));
        }
    }
}

/// Look up parameter `index`, tolerating graphs that pass fewer param buses than expected.
#[inline]
pub(crate) fn param(params: &[ParamInput], index: usize) -> Option<&ParamInput> {
    params.get(index)
}

/// Intrinsic value with optional modulation, k-rate.
#[inline]
pub(crate) fn k_rate_value(params: &[ParamInput], index: usize, intrinsic: f32, range: ParamRange) -> f32 {
    match param(params, index) {
        Some(p) => p.k_rate(intrinsic, range),
        None => range.clamp(intrinsic),
    }
}

/// The contract every render-thread node fulfils.
///
/// Render nodes are created on the render thread at a rebuild boundary, mutated only there, and
/// dropped at a later rebuild boundary. `process` must not allocate.
pub trait RenderNode {
    /// Render one quantum.
    ///
    /// `inputs` holds one already-mixed bus per node input, `params` one mono bus per
    /// automatable parameter. The node sets the channel count of `output` and fills it.
    fn process(&mut self, ctx: &RenderContext, inputs: &[AudioBus], params: &[ParamInput], output: &mut AudioBus);

    /// Render one quantum into every output port, one bus per port.
    ///
    /// Only nodes with more than one output override this.
    fn process_outputs(&mut self, ctx: &RenderContext, inputs: &[AudioBus], params: &[ParamInput], outputs: &mut [AudioBus]) {
        if let Some(output) = outputs.first_mut() {
            self.process(ctx, inputs, params, output);
        }
    }

    /// Apply a `Parameter`-class change in place.
    fn apply_description(&mut self, ctx: &RenderContext, description: &GraphNodeDescription);

    /// Start a source at an absolute context frame. Non-sources ignore this.
    fn schedule_start(&mut self, _frame: u64) {}

    /// Stop a source at an absolute context frame. Non-sources ignore this.
    fn schedule_stop(&mut self, _frame: u64) {}

    /// Pop the event raised during the last `process`, if any.
    fn take_event(&mut self) -> Option<RenderEvent> {
        None
    }

    /// Metering handle published to the control thread, if this node has one.
    fn meter(&self) -> Option<MeterHandle> {
        None
    }
}
