use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use klangnetz::{
    AudioBufferData, AudioBufferSourceDescription, DeviceFormat, EngineController, EngineError, GainDescription,
    NullOutput, OutputDevice, OutputMixer, ProducerStats, RenderEvent,
};
use rtrb::RingBuffer;

fn started_mixer(channels: usize) -> Arc<OutputMixer> {
    let mixer = OutputMixer::new();
    mixer.ensure_started(&NullOutput::new(48_000.0, channels)).unwrap();
    mixer
}

#[test]
fn two_producers_sum() {
    let mixer = started_mixer(1);
    let (mut a, a_out) = RingBuffer::<f32>::new(256);
    let (mut b, b_out) = RingBuffer::<f32>::new(256);
    mixer.register_producer(1, a_out, 4).unwrap();
    mixer.register_producer(2, b_out, 4).unwrap();

    for _ in 0..64 {
        a.push(0.2).unwrap();
        b.push(0.3).unwrap();
    }
    let mut out = [0.0f32; 64];
    mixer.mix_into(&mut out);

    assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    assert_eq!(mixer.device_played_frames(), 64);
}

#[test]
fn mix_is_clamped() {
    let mixer = started_mixer(1);
    let (mut a, a_out) = RingBuffer::<f32>::new(64);
    let (mut b, b_out) = RingBuffer::<f32>::new(64);
    mixer.register_producer(1, a_out, 4).unwrap();
    mixer.register_producer(2, b_out, 4).unwrap();
    for _ in 0..16 {
        a.push(0.8).unwrap();
        b.push(-0.7).unwrap();
    }
    a.push(0.8).unwrap();
    b.push(0.7).unwrap();

    let mut out = [0.0f32; 17];
    mixer.mix_into(&mut out);
    assert!((out[0] - 0.1).abs() < 1e-6);
    assert_eq!(out[16], 1.0);
}

#[test]
fn muted_producer_is_still_drained() {
    let mixer = started_mixer(1);
    let (mut a, a_out) = RingBuffer::<f32>::new(64);
    let (mut b, b_out) = RingBuffer::<f32>::new(64);
    mixer.register_producer(1, a_out, 4).unwrap();
    mixer.register_producer(2, b_out, 4).unwrap();
    assert!(mixer.set_producer_muted(2, true));
    assert!(!mixer.set_producer_muted(3, true));

    for _ in 0..32 {
        a.push(0.2).unwrap();
        b.push(0.3).unwrap();
    }
    let mut out = [0.0f32; 32];
    mixer.mix_into(&mut out);

    assert!(out.iter().all(|&s| (s - 0.2).abs() < 1e-6));
    assert_eq!(b.slots(), 64);
}

#[test]
fn underruns_are_counted() {
    let mixer = started_mixer(2);
    let (mut a, a_out) = RingBuffer::<f32>::new(256);
    mixer.register_producer(1, a_out, 8).unwrap();
    for _ in 0..32 {
        a.push(0.5).unwrap();
        a.push(-0.5).unwrap();
    }

    let mut out = [0.0f32; 128];
    mixer.mix_into(&mut out);
    assert_eq!(
        mixer.producer_stats(1),
        Some(ProducerStats {
            frames_read: 32,
            underruns: 1
        })
    );
    assert_eq!(&out[..2], &[0.5, -0.5]);
    assert!(out[64..].iter().all(|&s| s == 0.0));
}

#[test]
fn mono_producer_feeds_every_device_channel() {
    let mixer = started_mixer(2);
    let (mut a, a_out) = RingBuffer::<f32>::new(64);
    mixer.register_producer(1, a_out, 4).unwrap();
    for _ in 0..8 {
        a.push(0.25).unwrap();
    }
    let mut out = [0.0f32; 16];
    mixer.mix_into(&mut out);
    assert!(out.iter().all(|&s| s == 0.25));
}

#[test]
fn bytes_per_frame_must_be_whole_samples() {
    let mixer = started_mixer(2);
    for bad in [0usize, 6, 4 * 33] {
        let (_, consumer) = RingBuffer::<f32>::new(8);
        assert!(matches!(
            mixer.register_producer(1, consumer, bad),
            Err(EngineError::BytesPerFrame(b)) if b == bad
        ));
    }
    assert_eq!(mixer.producer_count(), 0);
}

#[test]
fn unregistered_producer_stops_mixing() {
    let mixer = started_mixer(1);
    let (mut a, a_out) = RingBuffer::<f32>::new(64);
    mixer.register_producer(1, a_out, 4).unwrap();
    for _ in 0..16 {
        a.push(0.5).unwrap();
    }
    assert!(mixer.unregister_producer(1));
    assert!(!mixer.unregister_producer(1));

    let mut out = [0.0f32; 16];
    mixer.mix_into(&mut out);
    assert!(out.iter().all(|&s| s == 0.0));
    assert_eq!(mixer.producer_stats(1), None);
}

struct BrokenDevice {
    attempts: AtomicUsize,
}

impl OutputDevice for BrokenDevice {
    fn format(&self) -> DeviceFormat {
        DeviceFormat {
            sample_rate: 48_000.0,
            channels: 2,
        }
    }

    fn start(&self, _mixer: Arc<OutputMixer>) -> Result<(), EngineError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(EngineError::DeviceUnavailable("unplugged".into()))
    }
}

#[test]
fn device_failure_is_remembered() {
    let device = Arc::new(BrokenDevice {
        attempts: AtomicUsize::new(0),
    });
    let controller = EngineController::new(device.clone());

    let (tx, rx) = mpsc::channel();
    for _ in 0..2 {
        let tx = tx.clone();
        controller.when_ready(move |result| {
            tx.send(result.map_err(|err| err.to_string())).unwrap();
        });
    }
    assert!(matches!(
        controller.create_client(),
        Err(EngineError::DeviceUnavailable(message)) if message == "unplugged"
    ));
    assert_eq!(controller.process_messages(), 2);

    let results: Vec<_> = rx.try_iter().collect();
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| r.as_ref().err().map(String::as_str) == Some("output device unavailable: unplugged")));
    assert_eq!(device.attempts.load(Ordering::Relaxed), 1);
}

#[test]
fn when_ready_reports_format() {
    let controller = EngineController::new(Arc::new(NullOutput::new(44_100.0, 2)));
    let (tx, rx) = mpsc::channel();
    controller.when_ready(move |result| tx.send(result.ok()).unwrap());
    assert!(rx.try_recv().is_err());

    controller.process_messages();
    assert_eq!(
        rx.try_recv().unwrap(),
        Some(DeviceFormat {
            sample_rate: 44_100.0,
            channels: 2
        })
    );
}

/// Pull from the mixer like a device would until `done` holds or two seconds pass.
fn pull_until(mixer: &OutputMixer, mut done: impl FnMut(&[f32]) -> bool) -> bool {
    let mut out = vec![0.0f32; 256];
    for _ in 0..400 {
        mixer.mix_into(&mut out);
        if done(&out) {
            return true;
        }
        sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn client_renders_committed_graph() {
    let controller = EngineController::new(Arc::new(NullOutput::new(48_000.0, 2)));
    let mut client = controller.create_client().unwrap();
    assert_eq!(controller.client_count(), 1);

    let ones = client
        .resources_mut()
        .register_audio_buffer(AudioBufferData::new(48_000.0, vec![vec![1.0; 48_000]]));
    let source = client.add_node(AudioBufferSourceDescription::new(ones).with_start_frame(0));
    let gain = client.add_node(GainDescription::new(0.5));
    client.connect(source, gain).unwrap();
    client.connect(gain, client.destination()).unwrap();
    client.commit().unwrap();

    assert!(pull_until(controller.mixer(), |out| out.iter().any(|&s| (s - 0.5).abs() < 1e-6)));
    assert!(client.current_frame() > 0);
    assert!(controller.device_played_frames() > 0);
}

#[test]
fn client_reports_source_end() {
    let controller = EngineController::new(Arc::new(NullOutput::new(48_000.0, 1)));
    let mut client = controller.create_client().unwrap();

    let short = client
        .resources_mut()
        .register_audio_buffer(AudioBufferData::new(48_000.0, vec![vec![0.1; 64]]));
    let source = client.add_node(AudioBufferSourceDescription::new(short));
    client.connect(source, client.destination()).unwrap();
    client.commit().unwrap();
    client.start_source(source, 0).unwrap();

    let mut events = Vec::new();
    pull_until(controller.mixer(), |_| {
        events.extend(client.drain_events());
        !events.is_empty()
    });
    assert_eq!(events, vec![RenderEvent::SourceEnded(source)]);
}

#[test]
fn dropped_client_leaves_the_mix() {
    let controller = EngineController::new(Arc::new(NullOutput::new(48_000.0, 2)));
    let first = controller.create_client().unwrap();
    let second = controller.create_client().unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(controller.mixer().producer_count(), 2);

    drop(first);
    controller.process_messages();
    assert_eq!(controller.client_count(), 1);
    assert_eq!(controller.mixer().producer_count(), 1);
    assert!(controller.set_client_muted(second.id(), true));
}
