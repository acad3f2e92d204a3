//! Control-side engine configuration.

/// Settings for an [`EngineController`](crate::EngineController) and the clients it creates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineConfig {
    /// Frames per render quantum
    pub quantum_size: usize,
    /// Pending graph updates a client can hold before `send` fails
    pub update_queue_capacity: usize,
    /// Render events buffered for the control thread
    pub event_queue_capacity: usize,
    /// Length of each client's output ring
    pub output_buffer_ms: u32,
    /// How far ahead of the device a client renders
    pub target_latency_ms: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            quantum_size: 128,
            update_queue_capacity: 16,
            event_queue_capacity: 256,
            output_buffer_ms: 100,
            target_latency_ms: 20,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quantum_size(mut self, quantum_size: usize) -> Self {
        self.quantum_size = quantum_size.max(1);
        self
    }

    pub fn with_update_queue_capacity(mut self, capacity: usize) -> Self {
        self.update_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_output_buffer_ms(mut self, ms: u32) -> Self {
        self.output_buffer_ms = ms.max(1);
        self
    }

    pub fn with_target_latency_ms(mut self, ms: u32) -> Self {
        self.target_latency_ms = ms;
        self
    }

    /// Samples in a client's output ring, sized to hold `output_buffer_ms` of audio.
    pub fn output_ring_samples(&self, sample_rate: f32, channels: usize) -> usize {
        let buffer_samples = ((sample_rate * self.output_buffer_ms as f32 / 1000.0) as usize) * channels;
        buffer_samples.next_power_of_two().max(8192)
    }

    /// Frames a client keeps queued ahead of the device, never less than one quantum.
    pub fn target_latency_frames(&self, sample_rate: f32) -> usize {
        ((sample_rate * self.target_latency_ms as f32 / 1000.0) as usize).max(self.quantum_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_power_of_two_with_floor() {
        let config = EngineConfig::default();
        assert_eq!(config.output_ring_samples(48_000.0, 2), 16384);
        assert_eq!(config.output_ring_samples(8_000.0, 1), 8192);
    }

    #[test]
    fn latency_never_below_quantum() {
        let config = EngineConfig::default().with_target_latency_ms(0);
        assert_eq!(config.target_latency_frames(48_000.0), 128);
    }
}
