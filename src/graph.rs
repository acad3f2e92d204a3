//! Whole-graph description and its update envelope.
//!
//! A [`GraphDescription`] is what the control thread edits: the node descriptors, audio
//! connections and parameter connections of one graph. It is shipped to the render thread as a
//! single little-endian envelope:
//!
//! ```text
//! f32 sample_rate
//! u64 destination_id
//! u32 node_count
//!   { u8 node_type, u64 node_id, u32 payload_len, payload } * node_count
//! u32 connection_count
//!   { u64 src_id, u8 src_output, u64 dst_id, u8 dst_input } * connection_count
//! u32 param_connection_count
//!   { u64 src_id, u8 src_output, u64 dst_id, u8 dst_param } * param_connection_count
//! ```

use std::collections::{BTreeMap, BTreeSet};

use crate::description::{GraphNodeDescription, GraphUpdateKind, NodeType};
use crate::error::{GraphError, WireError};
use crate::node::NodeId;
use crate::nodes::sink::DestinationDescription;
use crate::wire::{WireReader, WireWriter};

/// Smallest possible node entry: type, id and payload length.
const NODE_ENTRY_MIN_SIZE: usize = 1 + 8 + 4;
/// Size of one connection entry (audio or parameter).
const CONNECTION_ENTRY_SIZE: usize = 8 + 1 + 8 + 1;

/// Lowest sample rate a graph can run at, in Hz.
pub const MIN_SAMPLE_RATE: f32 = 3_000.0;
/// Highest sample rate a graph can run at, in Hz.
pub const MAX_SAMPLE_RATE: f32 = 768_000.0;

/// Clamp `sample_rate` into the supported range. NaN maps to the lowest rate.
pub fn clamp_sample_rate(sample_rate: f32) -> f32 {
    if sample_rate.is_nan() {
        MIN_SAMPLE_RATE
    } else {
        sample_rate.clamp(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE)
    }
}

/// Audio connection from a node output to a node input.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Connection {
    pub source: NodeId,
    pub output: u8,
    pub destination: NodeId,
    pub input: u8,
}

/// Audio-rate modulation from a node output onto a parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParamConnection {
    pub source: NodeId,
    pub output: u8,
    pub destination: NodeId,
    pub param: u8,
}

/// Everything the render thread needs to know about one graph, as plain values.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphDescription {
    sample_rate: f32,
    destination: NodeId,
    nodes: BTreeMap<NodeId, GraphNodeDescription>,
    connections: BTreeSet<Connection>,
    param_connections: BTreeSet<ParamConnection>,
}

impl GraphDescription {
    /// An empty graph containing only its destination.
    ///
    /// `sample_rate` is clamped to [`MIN_SAMPLE_RATE`]..=[`MAX_SAMPLE_RATE`].
    pub fn new(sample_rate: f32, destination_channels: u32) -> Self {
        let destination = NodeId::next();
        let mut nodes = BTreeMap::new();
        nodes.insert(destination, DestinationDescription::new(destination_channels).into());
        Self {
            sample_rate: clamp_sample_rate(sample_rate),
            destination,
            nodes,
            connections: BTreeSet::new(),
            param_connections: BTreeSet::new(),
        }
    }

    #[inline]
    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    #[inline]
    pub fn destination(&self) -> NodeId {
        self.destination
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &GraphNodeDescription)> {
        self.nodes.iter().map(|(&id, d)| (id, d))
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter()
    }

    pub fn param_connections(&self) -> impl Iterator<Item = &ParamConnection> {
        self.param_connections.iter()
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNodeDescription> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut GraphNodeDescription> {
        self.nodes.get_mut(&id)
    }

    /// Add a node under a fresh id.
    pub fn add_node(&mut self, description: impl Into<GraphNodeDescription>) -> NodeId {
        let id = NodeId::next();
        self.nodes.insert(id, description.into());
        id
    }

    /// Insert or replace the node stored under `id`.
    pub fn insert_node(&mut self, id: NodeId, description: impl Into<GraphNodeDescription>) -> Option<GraphNodeDescription> {
        self.nodes.insert(id, description.into())
    }

    /// Replace the descriptor of an existing node.
    pub fn set_node(&mut self, id: NodeId, description: impl Into<GraphNodeDescription>) -> Result<(), GraphError> {
        let slot = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        *slot = description.into();
        Ok(())
    }

    /// Remove a node and every connection touching it.
    pub fn remove_node(&mut self, id: NodeId) -> Result<GraphNodeDescription, GraphError> {
        if id == self.destination {
            return Err(GraphError::RemoveDestination);
        }
        let removed = self.nodes.remove(&id).ok_or(GraphError::UnknownNode(id))?;
        self.disconnect_all(id);
        self.connections.retain(|c| c.destination != id);
        self.param_connections.retain(|c| c.destination != id);
        Ok(removed)
    }

    /// Connect output 0 of `source` to input 0 of `destination`.
    pub fn connect(&mut self, source: NodeId, destination: NodeId) -> Result<(), GraphError> {
        self.connect_ports(source, 0, destination, 0)
    }

    pub fn connect_ports(&mut self, source: NodeId, output: u8, destination: NodeId, input: u8) -> Result<(), GraphError> {
        let connection = Connection {
            source,
            output,
            destination,
            input,
        };
        self.check_connection(&connection)?;
        self.connections.insert(connection);
        Ok(())
    }

    /// Modulate parameter `param` of `destination` with output 0 of `source`.
    pub fn connect_param(&mut self, source: NodeId, destination: NodeId, param: u8) -> Result<(), GraphError> {
        self.connect_param_port(source, 0, destination, param)
    }

    pub fn connect_param_port(&mut self, source: NodeId, output: u8, destination: NodeId, param: u8) -> Result<(), GraphError> {
        let connection = ParamConnection {
            source,
            output,
            destination,
            param,
        };
        self.check_param_connection(&connection)?;
        self.param_connections.insert(connection);
        Ok(())
    }

    /// Remove every audio and parameter connection from `source` to `destination`.
    pub fn disconnect(&mut self, source: NodeId, destination: NodeId) -> bool {
        let before = self.connections.len() + self.param_connections.len();
        self.connections
            .retain(|c| !(c.source == source && c.destination == destination));
        self.param_connections
            .retain(|c| !(c.source == source && c.destination == destination));
        before != self.connections.len() + self.param_connections.len()
    }

    /// Remove every outgoing connection of `source`.
    pub fn disconnect_all(&mut self, source: NodeId) {
        self.connections.retain(|c| c.source != source);
        self.param_connections.retain(|c| c.source != source);
    }

    fn output_count(&self, id: NodeId) -> Result<usize, GraphError> {
        self.nodes
            .get(&id)
            .map(GraphNodeDescription::output_count)
            .ok_or(GraphError::UnknownNode(id))
    }

    fn check_connection(&self, connection: &Connection) -> Result<(), GraphError> {
        if connection.output as usize >= self.output_count(connection.source)? {
            return Err(GraphError::InvalidOutput {
                node: connection.source,
                port: connection.output,
            });
        }
        let destination = self
            .nodes
            .get(&connection.destination)
            .ok_or(GraphError::UnknownNode(connection.destination))?;
        if connection.input as usize >= destination.input_count() {
            return Err(GraphError::InvalidInput {
                node: connection.destination,
                port: connection.input,
            });
        }
        Ok(())
    }

    fn check_param_connection(&self, connection: &ParamConnection) -> Result<(), GraphError> {
        if connection.output as usize >= self.output_count(connection.source)? {
            return Err(GraphError::InvalidOutput {
                node: connection.source,
                port: connection.output,
            });
        }
        let destination = self
            .nodes
            .get(&connection.destination)
            .ok_or(GraphError::UnknownNode(connection.destination))?;
        if connection.param as usize >= destination.param_count() {
            return Err(GraphError::InvalidParam {
                node: connection.destination,
                param: connection.param,
            });
        }
        Ok(())
    }

    /// Check that the destination exists and every connection refers to real ports.
    pub fn validate(&self) -> Result<(), GraphError> {
        match self.nodes.get(&self.destination) {
            Some(node) if node.node_type() == NodeType::Destination => {}
            _ => return Err(GraphError::MissingDestination(self.destination)),
        }
        for connection in &self.connections {
            self.check_connection(connection)?;
        }
        for connection in &self.param_connections {
            self.check_param_connection(connection)?;
        }
        Ok(())
    }

    /// Classify the change from `self` to `next`.
    ///
    /// A new sample rate, destination or node set requires a rebuild, changed routing at least
    /// a topology pass; otherwise the most severe per-node change wins.
    pub fn classify_update(&self, next: &GraphDescription) -> GraphUpdateKind {
        if self.sample_rate != next.sample_rate
            || self.destination != next.destination
            || !self.nodes.keys().eq(next.nodes.keys())
        {
            return GraphUpdateKind::RebuildRequired;
        }

        let routing_changed =
            self.connections != next.connections || self.param_connections != next.param_connections;

        self.nodes
            .iter()
            .zip(next.nodes.values())
            .map(|((_, current), next)| current.classify_update(next))
            .fold(
                GraphUpdateKind::when(routing_changed, GraphUpdateKind::Topology),
                GraphUpdateKind::max,
            )
    }

    /// Serialize into an update envelope.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = WireWriter::with_capacity(64 + self.nodes.len() * 48 + self.connections.len() * 18);
        writer.append_f32(self.sample_rate);
        writer.append_u64(self.destination.raw());

        writer.append_u32(self.nodes.len() as u32);
        for (id, node) in &self.nodes {
            writer.append_u8(node.node_type().to_wire());
            writer.append_u64(id.raw());
            let length_offset = writer.len();
            writer.append_u32(0);
            node.encode_wire_payload(&mut writer);
            let payload_len = writer.len() - length_offset - 4;
            writer.patch_u32(length_offset, payload_len as u32);
        }

        writer.append_u32(self.connections.len() as u32);
        for c in &self.connections {
            writer.append_u64(c.source.raw());
            writer.append_u8(c.output);
            writer.append_u64(c.destination.raw());
            writer.append_u8(c.input);
        }

        writer.append_u32(self.param_connections.len() as u32);
        for c in &self.param_connections {
            writer.append_u64(c.source.raw());
            writer.append_u8(c.output);
            writer.append_u64(c.destination.raw());
            writer.append_u8(c.param);
        }

        writer.into_bytes()
    }

    /// Parse and validate an update envelope. Any defect rejects the whole envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut reader = WireReader::new(bytes);

        let sample_rate = reader.read_finite_f32("sample_rate")?;
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
            return Err(WireError::OutOfRange("sample_rate"));
        }
        let destination = read_node_id(&mut reader)?;

        let node_count = reader.read_count(NODE_ENTRY_MIN_SIZE)?;
        let mut nodes = BTreeMap::new();
        for _ in 0..node_count {
            let node_type = NodeType::from_wire(reader.read_u8()?)?;
            let id = read_node_id(&mut reader)?;
            let declared = reader.read_u32()? as usize;
            let mut payload = reader.sub_reader(declared)?;
            let description = GraphNodeDescription::decode_wire_payload(node_type, &mut payload)?;
            if !payload.is_empty() {
                return Err(WireError::PayloadLength {
                    declared,
                    consumed: payload.position(),
                });
            }
            if nodes.insert(id, description).is_some() {
                return Err(WireError::DuplicateNode(id.raw()));
            }
        }

        let connection_count = reader.read_count(CONNECTION_ENTRY_SIZE)?;
        let mut connections = BTreeSet::new();
        for _ in 0..connection_count {
            connections.insert(Connection {
                source: read_node_id(&mut reader)?,
                output: reader.read_u8()?,
                destination: read_node_id(&mut reader)?,
                input: reader.read_u8()?,
            });
        }

        let param_connection_count = reader.read_count(CONNECTION_ENTRY_SIZE)?;
        let mut param_connections = BTreeSet::new();
        for _ in 0..param_connection_count {
            param_connections.insert(ParamConnection {
                source: read_node_id(&mut reader)?,
                output: reader.read_u8()?,
                destination: read_node_id(&mut reader)?,
                param: reader.read_u8()?,
            });
        }

        if !reader.is_empty() {
            return Err(WireError::TrailingBytes(reader.remaining()));
        }

        let graph = Self {
            sample_rate,
            destination,
            nodes,
            connections,
            param_connections,
        };
        graph.validate()?;
        Ok(graph)
    }
}

fn read_node_id(reader: &mut WireReader<'_>) -> Result<NodeId, WireError> {
    NodeId::from_raw(reader.read_u64()?).ok_or(WireError::ReservedNodeId)
}
