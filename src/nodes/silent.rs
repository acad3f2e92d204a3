use crate::bus::AudioBus;
use crate::description::GraphNodeDescription;
use crate::node::{ParamInput, RenderContext, RenderNode};

/// Stand-in for a node whose render state could not be built. Outputs one silent channel.
pub struct SilentNode;

impl RenderNode for SilentNode {
    fn process(&mut self, _ctx: &RenderContext, _inputs: &[AudioBus], _params: &[ParamInput], output: &mut AudioBus) {
        output.reset(1);
    }

    fn apply_description(&mut self, _ctx: &RenderContext, _description: &GraphNodeDescription) {}
}
