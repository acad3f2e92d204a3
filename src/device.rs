//! CPAL device discovery and the shared output stream.
//!
//! # Example: List and Select a Device
//!
//! ```no_run
//! use klangnetz::{CpalDevice, EngineController, OutputDevice};
//! use std::sync::Arc;
//!
//! for (i, device) in CpalDevice::list_outputs().iter().enumerate() {
//!     let format = device.format();
//!     println!("[{}] {} ({} Hz, {} ch)", i, device.name(), format.sample_rate, format.channels);
//! }
//!
//! if let Some(device) = CpalDevice::default_output() {
//!     let controller = EngineController::new(Arc::new(device));
//! }
//! ```

use std::sync::Arc;

#[cfg(feature = "cpal_sink")]
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
#[cfg(feature = "cpal_sink")]
use cpal::SampleFormat;

use crate::error::EngineError;
use crate::output::{DeviceFormat, OutputDevice, OutputMixer};

#[cfg(feature = "cpal_sink")]
struct Backend {
    device: cpal::Device,
    config: cpal::SupportedStreamConfig,
}

/// An output device found through cpal.
///
/// Hand it to an [`EngineController`](crate::EngineController); the stream only opens once a
/// client needs it.
pub struct CpalDevice {
    #[cfg(feature = "cpal_sink")]
    backend: Backend,
    name: String,
    format: DeviceFormat,
}

impl CpalDevice {
    /// The host's default output, or `None` when there is no usable device.
    pub fn default_output() -> Option<Self> {
        #[cfg(feature = "cpal_sink")]
        {
            cpal::default_host().default_output_device().and_then(Self::from_cpal)
        }
        #[cfg(not(feature = "cpal_sink"))]
        {
            None
        }
    }

    /// Every output device that reports a default config. Enumeration errors yield an empty list.
    pub fn list_outputs() -> Vec<Self> {
        #[cfg(feature = "cpal_sink")]
        {
            match cpal::default_host().output_devices() {
                Ok(devices) => devices.filter_map(Self::from_cpal).collect(),
                Err(err) => {
                    tracing::warn!(%err, "could not enumerate output devices");
                    Vec::new()
                }
            }
        }
        #[cfg(not(feature = "cpal_sink"))]
        {
            Vec::new()
        }
    }

    #[cfg(feature = "cpal_sink")]
    fn from_cpal(device: cpal::Device) -> Option<Self> {
        let config = device.default_output_config().ok()?;
        let format = DeviceFormat {
            sample_rate: config.sample_rate().0 as f32,
            channels: config.channels() as usize,
        };
        Some(Self {
            name: device.name().unwrap_or_else(|_| String::from("unnamed output")),
            format,
            backend: Backend { device, config },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl OutputDevice for CpalDevice {
    fn format(&self) -> DeviceFormat {
        self.format
    }

    #[cfg(feature = "cpal_sink")]
    fn start(&self, mixer: Arc<OutputMixer>) -> Result<(), EngineError> {
        let device = self.backend.device.clone();
        let sample_format = self.backend.config.sample_format();
        let stream_config = self.backend.config.config();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), String>>();

        // the stream lives as long as this thread
        std::thread::Builder::new()
            .name("klangnetz-output".into())
            .spawn(move || {
                let started = build_stream(&device, sample_format, &stream_config, mixer)
                    .map_err(|err| err.to_string())
                    .and_then(|stream| stream.play().map(|()| stream).map_err(|err| err.to_string()));
                match started {
                    Ok(_stream) => {
                        let _ = ready_tx.send(Ok(()));
                        loop {
                            std::thread::park();
                        }
                    }
                    Err(message) => {
                        let _ = ready_tx.send(Err(message));
                    }
                }
            })?;

        ready_rx
            .recv()
            .unwrap_or_else(|_| Err(String::from("output thread exited")))
            .map_err(EngineError::DeviceUnavailable)
    }

    #[cfg(not(feature = "cpal_sink"))]
    fn start(&self, _mixer: Arc<OutputMixer>) -> Result<(), EngineError> {
        Err(EngineError::DeviceUnavailable(
            "built without the cpal_sink feature".into(),
        ))
    }
}

/// Interleaved frames mixed per pass when the device wants integer samples.
#[cfg(feature = "cpal_sink")]
const SCRATCH_FRAMES: usize = 2048;

#[cfg(feature = "cpal_sink")]
fn build_stream(
    device: &cpal::Device,
    sample_format: SampleFormat,
    stream_config: &cpal::StreamConfig,
    mixer: Arc<OutputMixer>,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    let mut scratch = vec![0.0f32; SCRATCH_FRAMES * mixer.channels().max(1)];

    match sample_format {
        SampleFormat::F32 => device.build_output_stream(
            stream_config,
            move |data: &mut [f32], _| mixer.mix_into(data),
            |err| tracing::error!(?err, "cpal stream error"),
            None,
        ),
        SampleFormat::I16 => device.build_output_stream(
            stream_config,
            move |data: &mut [i16], _| {
                mix_converted(&mixer, &mut scratch, data, |s| (s * i16::MAX as f32) as i16);
            },
            |err| tracing::error!(?err, "cpal stream error"),
            None,
        ),
        SampleFormat::U16 => device.build_output_stream(
            stream_config,
            move |data: &mut [u16], _| {
                mix_converted(&mixer, &mut scratch, data, |s| ((s + 1.0) * 0.5 * u16::MAX as f32) as u16);
            },
            |err| tracing::error!(?err, "cpal stream error"),
            None,
        ),
        _ => Err(cpal::BuildStreamError::StreamConfigNotSupported),
    }
}

/// Mix into `scratch` a slice at a time and convert into `data`.
///
/// `scratch` holds whole frames, so a device buffer of any size is covered without allocating.
#[cfg_attr(not(feature = "cpal_sink"), allow(dead_code))]
fn mix_converted<T>(mixer: &OutputMixer, scratch: &mut [f32], data: &mut [T], convert: impl Fn(f32) -> T) {
    if scratch.is_empty() {
        return;
    }
    for out in data.chunks_mut(scratch.len()) {
        let mixed = &mut scratch[..out.len()];
        mixer.mix_into(mixed);
        for (sample, &s) in out.iter_mut().zip(mixed.iter()) {
            *sample = convert(s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converted_mix_spans_buffers_longer_than_scratch() {
        let mixer = OutputMixer::new();
        let (mut producer, consumer) = rtrb::RingBuffer::<f32>::new(64);
        mixer.register_producer(1, consumer, 2 * core::mem::size_of::<f32>()).unwrap();
        let ramp: Vec<f32> = (0..22).map(|i| i as f32 / 32.0).collect();
        for &s in &ramp {
            producer.push(s).unwrap();
        }

        // four stereo frames of scratch against an eleven frame device buffer
        let mut scratch = [0.0f32; 8];
        let mut data = [0i32; 22];
        mix_converted(&mixer, &mut scratch, &mut data, |s| (s * 32.0) as i32);

        let expected: Vec<i32> = (0..22).collect();
        assert_eq!(data.to_vec(), expected);
        assert_eq!(mixer.device_played_frames(), 11);
    }

    #[test]
    fn silence_converts_to_the_unsigned_midpoint() {
        let mixer = OutputMixer::new();
        let mut scratch = [0.0f32; 4];
        let mut data = [0u16; 10];
        mix_converted(&mixer, &mut scratch, &mut data, |s| ((s + 1.0) * 0.5 * u16::MAX as f32) as u16);
        assert!(data.iter().all(|&s| s == u16::MAX / 2));
    }
}
