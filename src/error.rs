//! Error types.
//!
//! Nothing here crosses from the render thread to the control thread synchronously.
//! Render-side failures travel as [`RenderEvent`](crate::RenderEvent)s instead.

use thiserror::Error;

use crate::node::NodeId;

/// Errors from [`AudioBus`](crate::AudioBus) channel bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("channel count {requested} exceeds bus capacity {capacity}")]
    ChannelCountExceedsCapacity { requested: usize, capacity: usize },
}

/// Malformed graph update data. The update is dropped in full.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated data: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("count {count} cannot fit in {remaining} remaining bytes")]
    CountOutOfRange { count: u32, remaining: usize },

    #[error("unknown node type tag {0}")]
    UnknownNodeType(u8),

    #[error("invalid value {value} for {field}")]
    InvalidEnum { field: &'static str, value: u8 },

    #[error("non-finite value for {0}")]
    NonFinite(&'static str),

    #[error("value out of range for {0}")]
    OutOfRange(&'static str),

    #[error("node payload declared {declared} bytes but decoder consumed {consumed}")]
    PayloadLength { declared: usize, consumed: usize },

    #[error("{0} trailing bytes after envelope")]
    TrailingBytes(usize),

    #[error("node id 0 is reserved")]
    ReservedNodeId,

    #[error("duplicate node id {0}")]
    DuplicateNode(u64),

    #[error("invalid graph: {0}")]
    Graph(#[from] GraphError),
}

/// A structurally invalid graph description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),

    #[error("node {node:?} has no output {port}")]
    InvalidOutput { node: NodeId, port: u8 },

    #[error("node {node:?} has no input {port}")]
    InvalidInput { node: NodeId, port: u8 },

    #[error("node {node:?} has no param {param}")]
    InvalidParam { node: NodeId, param: u8 },

    #[error("destination node {0:?} is missing")]
    MissingDestination(NodeId),

    #[error("the destination node cannot be removed")]
    RemoveDestination,
}

/// User DSP reported a failure. The node is disabled for the rest of the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("script processor failed: {0}")]
pub struct ScriptProcessorError(pub String);

/// Control-thread errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("output device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("graph update queue is full")]
    UpdateQueueFull,

    #[error("bytes per frame {0} is not a whole number of f32 samples")]
    BytesPerFrame(usize),

    #[error("renderer has already finished")]
    RendererFinished,

    #[error("renderer is not suspended")]
    NotSuspended,

    #[error("renderer has not been started")]
    NotStarted,

    #[error("renderer was already started")]
    AlreadyStarted,

    #[error("cannot suspend at frame {0}")]
    InvalidSuspendFrame(u64),

    #[error("failed to spawn render thread: {0}")]
    Spawn(#[from] std::io::Error),
}
