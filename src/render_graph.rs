//! Render-thread graph: owns the render nodes and runs one quantum at a time.

use std::ops::Range;
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::bus::{AudioBus, ChannelInterpretation, MAX_CHANNELS};
use crate::description::{ChannelConfig, GraphNodeDescription, GraphUpdateKind};
use crate::error::WireError;
use crate::graph::{clamp_sample_rate, GraphDescription};
use crate::metering::{MeterHandle, MeteringRegistry};
use crate::node::{NodeId, ParamInput, RenderContext, RenderEvent, RenderNode};
use crate::nodes::{create_render_node, RenderNodeKind};
use crate::resources::ResourceSnapshot;
use crate::topology::{compile, CompiledTopology, Step};

/// Render-side context shared by every node of a graph.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderConfig {
    pub sample_rate: f32,
    pub quantum_size: usize,
}

impl RenderConfig {
    /// The sample rate is clamped like [`GraphDescription::new`] does.
    pub fn new(sample_rate: f32, quantum_size: usize) -> Self {
        Self {
            sample_rate: clamp_sample_rate(sample_rate),
            quantum_size: quantum_size.max(1),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self::new(48_000.0, 128)
    }
}

struct NodeSlot {
    id: NodeId,
    description: GraphNodeDescription,
    node: RenderNodeKind,
    channels: Option<ChannelConfig>,
    /// One mixed bus per input port
    inputs: Vec<AudioBus>,
    params: Vec<ParamInput>,
    /// This node's buses in the graph-wide output list, one per output port
    outputs: Range<usize>,
    /// `(source output bus, input port)`
    input_edges: Vec<(usize, usize)>,
    /// `(source output bus, param index)`
    param_edges: Vec<(usize, usize)>,
}

impl NodeSlot {
    /// Mix every connected output into this node's input buses.
    fn mix_inputs(&mut self, outputs: &[AudioBus]) {
        let Some(config) = self.channels else {
            return;
        };
        for (port, bus) in self.inputs.iter_mut().enumerate() {
            let widest = self
                .input_edges
                .iter()
                .filter(|&&(_, p)| p == port)
                .map(|&(source, _)| outputs[source].channel_count())
                .max()
                .unwrap_or(0);
            let count = config.mode.computed_channel_count(widest, config.clamped_count());
            bus.reset(count);
            for &(source, _) in self.input_edges.iter().filter(|&&(_, p)| p == port) {
                bus.sum_from(&outputs[source], config.interpretation);
            }
        }
    }

    /// Downmix every connected output into the matching mono parameter bus.
    fn mix_params(&mut self, outputs: &[AudioBus]) {
        for (index, param) in self.params.iter_mut().enumerate() {
            if !param.connected {
                continue;
            }
            param.bus.reset(1);
            for &(source, _) in self.param_edges.iter().filter(|&&(_, p)| p == index) {
                param.bus.sum_from(&outputs[source], ChannelInterpretation::Speakers);
            }
        }
    }
}

/// The render thread's view of one graph.
///
/// Updates arrive as whole [`GraphDescription`]s (or their encoded envelopes) and are applied
/// between quanta. Render nodes whose ids survive an update keep their state; everything else
/// is created or dropped at that boundary.
pub struct RenderGraph {
    config: RenderConfig,
    description: Option<GraphDescription>,
    resources: Arc<ResourceSnapshot>,
    topology: CompiledTopology,
    slots: Vec<NodeSlot>,
    /// Every output port of every node, grouped by slot
    outputs: Vec<AudioBus>,
    silence: AudioBus,
    /// Output bus of the destination node
    destination: Option<usize>,
    current_frame: u64,
    events: Vec<RenderEvent>,
    metering: Arc<MeteringRegistry>,
}

impl RenderGraph {
    pub fn new(config: RenderConfig, metering: Arc<MeteringRegistry>) -> Self {
        Self {
            config,
            description: None,
            resources: ResourceSnapshot::empty(),
            topology: CompiledTopology::default(),
            slots: Vec::new(),
            outputs: Vec::new(),
            silence: AudioBus::new(1, config.quantum_size),
            destination: None,
            current_frame: 0,
            events: Vec::with_capacity(64),
            metering,
        }
    }

    #[inline]
    pub fn config(&self) -> RenderConfig {
        self.config
    }

    /// Context frame at the start of the next quantum.
    #[inline]
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub fn description(&self) -> Option<&GraphDescription> {
        self.description.as_ref()
    }

    pub fn metering(&self) -> &Arc<MeteringRegistry> {
        &self.metering
    }

    /// Node ids in processing order.
    pub fn order(&self) -> Vec<NodeId> {
        self.topology.order().collect()
    }

    /// Whether `node` sits in a cycle without a delay and is rendering silence.
    pub fn is_muted(&self, node: NodeId) -> bool {
        self.topology.is_muted(node)
    }

    fn context(&self) -> RenderContext {
        RenderContext {
            sample_rate: self.config.sample_rate,
            quantum_size: self.config.quantum_size,
            current_frame: self.current_frame,
        }
    }

    /// Decode an envelope and apply it. Malformed data leaves the running graph untouched.
    pub fn apply_encoded_update(
        &mut self,
        bytes: &[u8],
        resources: Option<Arc<ResourceSnapshot>>,
    ) -> Result<GraphUpdateKind, WireError> {
        match GraphDescription::decode(bytes) {
            Ok(description) => Ok(self.apply_update(description, resources)),
            Err(err) => {
                warn!(%err, len = bytes.len(), "dropping malformed graph update");
                Err(err)
            }
        }
    }

    /// Apply a new description and return how invasive it was.
    pub fn apply_update(
        &mut self,
        description: GraphDescription,
        resources: Option<Arc<ResourceSnapshot>>,
    ) -> GraphUpdateKind {
        let resources_changed = resources.is_some();
        if let Some(resources) = resources {
            self.resources = resources;
        }

        let kind = match &self.description {
            Some(current) => current.classify_update(&description),
            None => GraphUpdateKind::RebuildRequired,
        };

        match kind {
            GraphUpdateKind::None => {}
            GraphUpdateKind::Parameter => {
                let ctx = self.context();
                for slot in &mut self.slots {
                    if let Some(next) = description.node(slot.id) {
                        if *next != slot.description {
                            slot.node.apply_description(&ctx, next);
                            slot.description = next.clone();
                        }
                    }
                }
                self.description = Some(description);
            }
            GraphUpdateKind::Topology | GraphUpdateKind::RebuildRequired => self.rebuild(description),
        }
        if resources_changed && kind < GraphUpdateKind::Topology {
            self.retry_fallbacks();
        }
        kind
    }

    /// Recreate fallback nodes whose resources the current snapshot can now resolve.
    fn retry_fallbacks(&mut self) {
        let ctx = self.context();
        let mut revived = 0usize;
        for slot in self.slots.iter_mut().filter(|slot| slot.node.is_silent_fallback()) {
            let node = create_render_node(slot.id, &slot.description, &ctx, &self.resources);
            if !node.is_silent_fallback() {
                slot.node = node;
                revived += 1;
            }
        }
        if revived > 0 {
            debug!(revived, "fallback nodes resolved");
            self.publish_meters();
        }
    }

    fn publish_meters(&self) {
        let meters: HashMap<NodeId, MeterHandle> = self
            .slots
            .iter()
            .filter_map(|slot| slot.node.meter().map(|meter| (slot.id, meter)))
            .collect();
        self.metering.publish(meters);
    }

    fn rebuild(&mut self, description: GraphDescription) {
        let sample_rate_changed = self.config.sample_rate != description.sample_rate();
        self.config.sample_rate = description.sample_rate();
        let ctx = self.context();
        let quantum = self.config.quantum_size;

        let mut previous: HashMap<NodeId, NodeSlot> = self.slots.drain(..).map(|slot| (slot.id, slot)).collect();
        let topology = compile(&description);
        let mut created = 0usize;
        let mut output_buses = 0usize;

        let mut slots: Vec<NodeSlot> = topology
            .nodes
            .iter()
            .filter_map(|&id| description.node(id).map(|d| (id, d)))
            .map(|(id, next)| {
                let reused = previous
                    .remove(&id)
                    .filter(|old| !sample_rate_changed && !old.node.is_silent_fallback())
                    .and_then(|old| match old.description.classify_update(next) {
                        GraphUpdateKind::RebuildRequired => None,
                        GraphUpdateKind::None => Some(old.node),
                        _ => {
                            let mut node = old.node;
                            node.apply_description(&ctx, next);
                            Some(node)
                        }
                    });
                let node = reused.unwrap_or_else(|| {
                    created += 1;
                    create_render_node(id, next, &ctx, &self.resources)
                });

                let channels = next.channel_config().copied();
                let input_buses = if channels.is_some() { next.input_count() } else { 0 };
                let outputs = output_buses..output_buses + next.output_count().max(1);
                output_buses = outputs.end;
                NodeSlot {
                    id,
                    description: next.clone(),
                    node,
                    channels,
                    inputs: (0..input_buses)
                        .map(|_| AudioBus::with_capacity(1, quantum, MAX_CHANNELS))
                        .collect(),
                    params: (0..next.param_count()).map(|_| ParamInput::new(quantum)).collect(),
                    outputs,
                    input_edges: Vec::new(),
                    param_edges: Vec::new(),
                }
            })
            .collect();

        for connection in description.connections() {
            if let (Some(source), Some(destination)) = (
                topology.index_of(connection.source),
                topology.index_of(connection.destination),
            ) {
                let bus = output_bus(&slots[source], connection.output);
                slots[destination].input_edges.push((bus, connection.input as usize));
            }
        }
        for connection in description.param_connections() {
            if let (Some(source), Some(destination)) = (
                topology.index_of(connection.source),
                topology.index_of(connection.destination),
            ) {
                let bus = output_bus(&slots[source], connection.output);
                let slot = &mut slots[destination];
                slot.param_edges.push((bus, connection.param as usize));
                if let Some(param) = slot.params.get_mut(connection.param as usize) {
                    param.connected = true;
                }
            }
        }

        debug!(
            nodes = slots.len(),
            created,
            dropped = previous.len(),
            muted = topology.muted.iter().filter(|&&m| m).count(),
            split_delays = topology.split.iter().filter(|&&s| s).count(),
            "render graph rebuilt"
        );

        self.outputs = (0..output_buses)
            .map(|_| AudioBus::with_capacity(1, quantum, MAX_CHANNELS))
            .collect();
        self.destination = topology
            .index_of(description.destination())
            .map(|index| slots[index].outputs.start);
        // each node raises at most one event per quantum
        self.events.reserve(slots.len());
        self.slots = slots;
        self.topology = topology;
        self.description = Some(description);
        self.publish_meters();
        // nodes that did not survive are dropped here, between quanta
        drop(previous);
    }

    /// Render one quantum and return the destination's output.
    pub fn render_quantum(&mut self) -> &AudioBus {
        let ctx = self.context();
        let slots = &mut self.slots;
        let outputs = &mut self.outputs;

        for step in &self.topology.steps {
            match *step {
                Step::Process(i) => {
                    let slot = &mut slots[i];
                    slot.mix_inputs(outputs);
                    slot.mix_params(outputs);
                    let ports = slot.outputs.clone();
                    slot.node.process_outputs(&ctx, &slot.inputs, &slot.params, &mut outputs[ports]);
                }
                Step::ReadDelay(i) => {
                    let slot = &mut slots[i];
                    slot.mix_params(outputs);
                    if let Some(delay) = slot.node.as_delay_mut() {
                        delay.read_step(&ctx, &slot.params, &mut outputs[slot.outputs.start]);
                    }
                }
                Step::WriteDelay(i) => {
                    let slot = &mut slots[i];
                    slot.mix_inputs(outputs);
                    if let Some(delay) = slot.node.as_delay_mut() {
                        delay.write_step(slot.inputs.first());
                    }
                }
            }
        }

        for slot in slots.iter_mut() {
            if let Some(event) = slot.node.take_event() {
                // undrained events never grow the list on this thread
                if self.events.len() < self.events.capacity() {
                    self.events.push(event);
                }
            }
        }

        self.current_frame += self.config.quantum_size as u64;
        match self.destination {
            Some(i) => &self.outputs[i],
            None => &self.silence,
        }
    }

    /// Schedule a source to start at `frame`. Returns `false` if no such node exists.
    pub fn schedule_source_start(&mut self, node: NodeId, frame: u64) -> bool {
        self.slot_mut(node).map(|slot| slot.node.schedule_start(frame)).is_some()
    }

    /// Schedule a source to stop at `frame`. Returns `false` if no such node exists.
    pub fn schedule_source_stop(&mut self, node: NodeId, frame: u64) -> bool {
        self.slot_mut(node).map(|slot| slot.node.schedule_stop(frame)).is_some()
    }

    fn slot_mut(&mut self, node: NodeId) -> Option<&mut NodeSlot> {
        let index = self.topology.index_of(node)?;
        self.slots.get_mut(index)
    }

    /// Output bus of `node` at `port`, as rendered by the last quantum.
    pub fn node_output(&self, node: NodeId, port: usize) -> Option<&AudioBus> {
        let slot = self.slots.get(self.topology.index_of(node)?)?;
        let bus = slot.outputs.start + port;
        if bus < slot.outputs.end {
            self.outputs.get(bus)
        } else {
            None
        }
    }

    /// Take the events raised since the last drain.
    pub fn drain_events(&mut self) -> impl Iterator<Item = RenderEvent> + '_ {
        self.events.drain(..)
    }
}

/// Bus index of `port` on `slot`. Ports past the last output read the last one.
fn output_bus(slot: &NodeSlot, port: u8) -> usize {
    (slot.outputs.start + port as usize).min(slot.outputs.end - 1)
}
