//! klangnetz - a real-time Web Audio style render graph
//!
//! Design principles:
//! - The control thread edits a [`GraphDescription`] and ships it as an encoded value message
//! - The render thread owns every render node and never blocks on a lock
//! - Node state survives topology rebuilds as long as its id does
//! - Cycles are only legal through a delay; anything else is muted
//! - Metering flows back through atomics and double buffers
//! - Several clients share one output device through a lock-free mixer

pub mod bus;
pub mod config;
pub mod description;
pub mod device;
pub mod engine;
pub mod error;
pub mod graph;
pub mod logging;
pub mod metering;
pub mod node;
pub mod nodes;
pub mod offline;
pub mod output;
pub mod queue;
pub mod render_graph;
pub mod resources;
pub mod topology;
pub mod wire;

pub use bus::{AudioBus, ChannelCountMode, ChannelInterpretation, MAX_CHANNELS};
pub use config::EngineConfig;
pub use description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind, NodeDescription, NodeType};
pub use device::CpalDevice;
pub use engine::{ClientId, ClientMessage, EngineController, GraphUpdate, RealtimeClient};
pub use error::{BusError, EngineError, GraphError, ScriptProcessorError, WireError};
pub use graph::{Connection, GraphDescription, ParamConnection, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE};
pub use metering::{frequency_db_to_bytes, time_domain_to_bytes, MeteringRegistry};
pub use node::{NodeId, RenderContext, RenderEvent, RenderNode};
pub use nodes::effect::{
    BiquadFilterDescription, ChannelMergerDescription, ChannelSplitterDescription, ConvolverDescription,
    DelayDescription, DynamicsCompressorDescription, GainDescription, ScriptProcessorDescription,
    StereoPannerDescription,
};
pub use nodes::sink::{AnalyserDescription, DestinationDescription};
pub use nodes::source::{
    AudioBufferSourceDescription, ConstantSourceDescription, MediaElementAudioSourceDescription,
    OscillatorDescription, OscillatorType,
};
pub use offline::{OfflineEvent, OfflineRenderer};
pub use output::{DeviceFormat, NullOutput, OutputDevice, OutputMixer, ProducerStats};
pub use queue::ControlMessageQueue;
pub use render_graph::{RenderConfig, RenderGraph};
pub use resources::{
    media_element_ring, AudioBufferData, GraphResourceRegistry, MediaElementSource, ResourceId, ResourceSnapshot,
    ScriptProcessorCallback,
};
