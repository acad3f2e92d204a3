use criterion::{black_box, criterion_group, criterion_main, Criterion};
use klangnetz::nodes::effect::BiquadFilterType;
use klangnetz::{
    AudioBufferData, AudioBufferSourceDescription, BiquadFilterDescription, DelayDescription, GainDescription,
    GraphDescription, GraphResourceRegistry, MeteringRegistry, RenderConfig, RenderGraph,
};

const SR: f32 = 48_000.0;

fn looping_noise(resources: &mut GraphResourceRegistry) -> AudioBufferSourceDescription {
    let mut seed = 0x2545_f491_u32;
    let noise: Vec<f32> = (0..SR as usize)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed as f32 / u32::MAX as f32 * 2.0 - 1.0
        })
        .collect();
    let id = resources.register_audio_buffer(AudioBufferData::new(SR, vec![noise.clone(), noise]));
    AudioBufferSourceDescription::new(id).with_start_frame(0).with_loop(0.0, 1.0)
}

fn graph_of(desc: GraphDescription, resources: &GraphResourceRegistry) -> RenderGraph {
    let mut graph = RenderGraph::new(RenderConfig::new(SR, 128), MeteringRegistry::new());
    graph.apply_update(desc, Some(resources.snapshot()));
    graph
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("RenderGraph::render_quantum() gain -> biquad", |b| {
        let mut resources = GraphResourceRegistry::new();
        let mut desc = GraphDescription::new(SR, 2);
        let source = desc.add_node(looping_noise(&mut resources));
        let gain = desc.add_node(GainDescription::new(0.5));
        let filter = desc.add_node(BiquadFilterDescription::new(BiquadFilterType::Lowpass, 2_000.0));
        desc.connect(source, gain).unwrap();
        desc.connect(gain, filter).unwrap();
        desc.connect(filter, desc.destination()).unwrap();
        let mut graph = graph_of(desc, &resources);

        b.iter(|| black_box(graph.render_quantum().channel(0)[0]))
    });

    c.bench_function("RenderGraph::render_quantum() feedback delay", |b| {
        let mut resources = GraphResourceRegistry::new();
        let mut desc = GraphDescription::new(SR, 2);
        let source = desc.add_node(looping_noise(&mut resources));
        let delay = desc.add_node(DelayDescription::new(0.25, 1.0));
        let feedback = desc.add_node(GainDescription::new(0.4));
        desc.connect(source, delay).unwrap();
        desc.connect(delay, feedback).unwrap();
        desc.connect(feedback, delay).unwrap();
        desc.connect(delay, desc.destination()).unwrap();
        let mut graph = graph_of(desc, &resources);

        b.iter(|| black_box(graph.render_quantum().channel(0)[0]))
    });

    c.bench_function("GraphDescription::encode() + decode()", |b| {
        let mut desc = GraphDescription::new(SR, 2);
        let mut previous = desc.destination();
        for i in 0..64 {
            let id = desc.add_node(GainDescription::new(i as f32 / 64.0));
            desc.connect(id, previous).unwrap();
            previous = id;
        }

        b.iter(|| GraphDescription::decode(black_box(&desc.encode())).unwrap())
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
