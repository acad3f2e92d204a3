//! Audio sink nodes (the graph's final node and observers)

mod analyser;
mod destination;

pub use analyser::{blackman, AnalyserDescription, AnalyserRenderNode, MAX_FFT_SIZE, MIN_FFT_SIZE};
pub use destination::{DestinationDescription, DestinationRenderNode};
