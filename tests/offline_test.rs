use klangnetz::{
    AnalyserDescription, AudioBufferData, AudioBufferSourceDescription, DynamicsCompressorDescription, EngineError,
    GainDescription, GraphDescription, GraphNodeDescription, GraphResourceRegistry, GraphUpdate, NodeId,
    OfflineEvent, OfflineRenderer, ResourceSnapshot,
};
use std::sync::Arc;

const SR: f32 = 48_000.0;

/// Constant 1.0 source through a gain into a mono destination.
fn constant_through_gain(gain: f32) -> (GraphDescription, Arc<ResourceSnapshot>, NodeId) {
    let mut resources = GraphResourceRegistry::new();
    let ones = resources.register_audio_buffer(AudioBufferData::new(SR, vec![vec![1.0; 4096]]));
    let mut desc = GraphDescription::new(SR, 1);
    let source = desc.add_node(AudioBufferSourceDescription::new(ones).with_start_frame(0));
    let gain_id = desc.add_node(GainDescription::new(gain));
    desc.connect(source, gain_id).unwrap();
    desc.connect(gain_id, desc.destination()).unwrap();
    (desc, resources.snapshot(), gain_id)
}

fn completed(event: Result<OfflineEvent, EngineError>) -> AudioBufferData {
    match event {
        Ok(OfflineEvent::Completed(buffer)) => buffer,
        other => panic!("expected completion, got {other:?}"),
    }
}

#[test]
fn renders_to_completion() {
    let (desc, resources, _) = constant_through_gain(0.5);
    let mut renderer = OfflineRenderer::with_config(desc, Some(resources), 1000, 128);
    renderer.start().unwrap();

    let buffer = completed(renderer.wait());
    assert_eq!(buffer.length(), 1000);
    assert_eq!(buffer.channel_count(), 1);
    assert!(buffer.channel(0).iter().all(|&s| (s - 0.5).abs() < 1e-6));
    assert_eq!(renderer.current_frame(), 1000);
    assert!(matches!(renderer.wait(), Err(EngineError::RendererFinished)));
}

#[test]
fn suspend_then_resume_with_same_graph() {
    let (desc, resources, _) = constant_through_gain(0.5);
    let update = GraphUpdate::new(&desc);
    let mut renderer = OfflineRenderer::with_config(desc, Some(resources), 1024, 128);

    assert_eq!(renderer.suspend_at(256).unwrap(), 256);
    renderer.start().unwrap();
    assert!(matches!(renderer.wait(), Ok(OfflineEvent::Suspended(256))));
    assert_eq!(renderer.current_frame(), 256);

    renderer.resume(Some(update)).unwrap();
    let buffer = completed(renderer.wait());
    assert_eq!(buffer.length(), 1024);
    assert!(buffer.channel(0).iter().all(|&s| (s - 0.5).abs() < 1e-6));
}

#[test]
fn update_applies_exactly_at_the_suspend_frame() {
    let (mut desc, resources, gain) = constant_through_gain(0.5);
    let mut renderer = OfflineRenderer::with_config(desc.clone(), Some(resources), 768, 128);

    let at = renderer.suspend_at(300).unwrap();
    assert_eq!(at, 384);
    renderer.start().unwrap();
    assert!(matches!(renderer.wait(), Ok(OfflineEvent::Suspended(384))));

    if let Some(GraphNodeDescription::Gain(g)) = desc.node_mut(gain) {
        g.gain = 0.25;
    }
    renderer.resume(Some(GraphUpdate::new(&desc))).unwrap();
    let buffer = completed(renderer.wait());
    let samples = buffer.channel(0);
    assert!(samples[..384].iter().all(|&s| (s - 0.5).abs() < 1e-6));
    assert!(samples[384..].iter().all(|&s| (s - 0.25).abs() < 1e-6));
}

#[test]
fn lifecycle_errors() {
    let (desc, resources, _) = constant_through_gain(1.0);
    let mut renderer = OfflineRenderer::with_config(desc, Some(resources), 512, 128);

    assert!(matches!(renderer.wait(), Err(EngineError::NotStarted)));
    assert!(matches!(renderer.resume(None), Err(EngineError::NotSuspended)));
    assert!(matches!(renderer.suspend_at(512), Err(EngineError::InvalidSuspendFrame(512))));

    renderer.suspend_at(128).unwrap();
    renderer.start().unwrap();
    assert!(matches!(renderer.start(), Err(EngineError::AlreadyStarted)));
    assert!(matches!(renderer.wait(), Ok(OfflineEvent::Suspended(128))));
    assert!(matches!(renderer.suspend_at(0), Err(EngineError::InvalidSuspendFrame(0))));
    assert!(matches!(renderer.resume(Some(GraphUpdate { bytes: vec![1, 2, 3], resources: None })), Err(EngineError::Wire(_))));

    // still suspended after a rejected update
    assert!(matches!(renderer.wait(), Ok(OfflineEvent::Suspended(128))));
    renderer.resume(None).unwrap();
    completed(renderer.wait());
    assert!(matches!(renderer.suspend_at(256), Err(EngineError::RendererFinished)));
}

#[test]
fn analyser_snapshot_is_current_at_suspension() {
    let (mut desc, resources, gain) = constant_through_gain(0.5);
    let analyser = desc.add_node(AnalyserDescription::new(256));
    desc.connect(gain, analyser).unwrap();

    let mut renderer = OfflineRenderer::with_config(desc, Some(resources), 2048, 128);
    let mut time = vec![0.0f32; 256];
    let mut freq = vec![0.0f32; 128];
    assert!(!renderer.try_copy_analyser_snapshot(analyser, 256, &mut time, &mut freq));

    renderer.suspend_at(512).unwrap();
    renderer.start().unwrap();
    assert!(matches!(renderer.wait(), Ok(OfflineEvent::Suspended(512))));

    assert!(renderer.try_copy_analyser_snapshot(analyser, 256, &mut time, &mut freq));
    assert!(time.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    assert_eq!(renderer.metering().analyser_published_frame(analyser), Some(512));
    // a DC input puts the most energy in bin 0
    let peak = freq
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(bin, _)| bin);
    assert_eq!(peak, Some(0));
    assert!(!renderer.try_copy_analyser_snapshot(gain, 256, &mut time, &mut freq));

    renderer.resume(None).unwrap();
    completed(renderer.wait());
}

#[test]
fn compressor_publishes_gain() {
    let (mut desc, resources, gain) = constant_through_gain(1.0);
    let compressor = desc.add_node(DynamicsCompressorDescription::default());
    desc.disconnect(gain, desc.destination());
    desc.connect(gain, compressor).unwrap();
    desc.connect(compressor, desc.destination()).unwrap();

    let mut renderer = OfflineRenderer::with_config(desc, Some(resources), 48_000, 128);
    assert_eq!(renderer.try_copy_dynamics_compressor_reduction(compressor), None);

    renderer.start().unwrap();
    let buffer = completed(renderer.wait());
    let reduction = renderer.try_copy_dynamics_compressor_reduction(compressor).unwrap();
    assert!(reduction.is_finite());
    assert!(buffer.channel(0).iter().all(|s| s.is_finite()));
    assert_eq!(renderer.try_copy_dynamics_compressor_reduction(gain), None);
}
