use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use powermeter::{
    AgentConfig, DetectorConfig, Exposition, FileStore, MeterState, PulseDetector, ReplaySource,
    ReportJob, SignalSource, StateStore,
};
use std::time::Duration;
use tokio::time::Instant;

/// Benchmark hysteresis detection over synthetic blink trains
fn bench_detector(c: &mut Criterion) {
    let config = DetectorConfig::default();
    let mut group = c.benchmark_group("detector");

    for blinks in [10usize, 100, 1000] {
        let mut source = ReplaySource::blinks(blinks, 20, 20);
        let samples: Vec<u16> = (0..blinks * 40)
            .map(|_| source.read_signal().unwrap_or_default())
            .collect();

        group.throughput(Throughput::Elements(samples.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(blinks), &samples, |b, samples| {
            b.iter(|| {
                let mut detector = PulseDetector::new(&config);
                let start = Instant::now();
                for (tick, reading) in samples.iter().enumerate() {
                    let at = start + Duration::from_millis(tick as u64 * 5);
                    black_box(detector.sample(*reading, at));
                }
                detector.sequence()
            })
        });
    }

    group.finish();
}

/// Benchmark exposition payload encoding
fn bench_exposition(c: &mut Criterion) {
    let config = AgentConfig::default();
    let exposition = Exposition::from_config(&config.push).expect("Should parse default context");
    let job = ReportJob::new(25, config.energy.wh_per_pulse(), config.push.url());

    c.bench_function("exposition_render", |b| {
        b.iter(|| exposition.render(black_box(&job)).expect("Should encode payload"))
    });
}

/// Benchmark a durable state checkpoint
fn bench_file_store_save(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().expect("Should create temp dir");
    let mut store = FileStore::open(dir.path()).expect("Should open store");
    let mut state = MeterState::default();

    c.bench_function("file_store_save", |b| {
        b.iter(|| {
            state.record_pulse();
            store.save(black_box(&state)).expect("Should save state")
        })
    });
}

criterion_group!(benches, bench_detector, bench_exposition, bench_file_store_save);
criterion_main!(benches);
