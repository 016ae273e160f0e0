//! Benchmarks for identifier derivation and exposure matching
//!
//! Compares per-call HKDF derivation with a cached deriver, and measures a
//! matching pass as the number of diagnosis keys grows.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use proxi_core::{
    ContactStore, DiagnosisKey, EngineConfig, ExposureMatcher, InMemoryStorage, ManualClock,
    RollingProximityIdentifier, SignalSample, TracingKey,
};
use proxi_crypto::{derive_rpi, RpiDeriver};

fn key(seed: u8) -> TracingKey {
    TracingKey::from_bytes([seed; 16])
}

fn bench_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("derivation");
    let tek = key(7);

    group.bench_function("derive_rpi_per_call", |b| {
        b.iter(|| {
            for interval in 0..144u32 {
                black_box(derive_rpi(&tek, black_box(interval)));
            }
        })
    });

    group.bench_function("rpi_deriver_cached", |b| {
        b.iter(|| {
            let deriver = RpiDeriver::new(&tek);
            for interval in 0..144u32 {
                black_box(deriver.derive(black_box(interval)));
            }
        })
    });

    group.finish();
}

/// A store holding `count` unrelated contacts plus one real encounter with `key(1)`
fn populated_store(config: &EngineConfig, count: u32) -> (ContactStore, DateTime<Utc>) {
    let start = config.protocol.epoch_start(19_000) + Duration::hours(9);
    let clock = Arc::new(ManualClock::new(start + Duration::hours(12)));
    let store = ContactStore::new(
        config.protocol.clone(),
        config.signal.clone(),
        Arc::new(InMemoryStorage::new()),
        clock,
    )
    .unwrap();

    for n in 0..count {
        let mut bytes = [0xAB; 16];
        bytes[..4].copy_from_slice(&n.to_le_bytes());
        let at = start + Duration::seconds(i64::from(n % 40_000));
        store
            .record(RollingProximityIdentifier::from_bytes(bytes), at, SignalSample::new(-80))
            .unwrap();
    }

    let deriver = RpiDeriver::new(&key(1));
    let interval = config.protocol.interval_at(start);
    for minute in 0..40 {
        let at = start + Duration::minutes(minute);
        let rpi = deriver.derive(interval + (minute / 10) as u32);
        store.record(rpi, at, SignalSample::new(-65)).unwrap();
    }
    (store, start)
}

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");
    let config = EngineConfig::new();
    let (store, start) = populated_store(&config, 5_000);
    let snapshot = store.snapshot();
    let matcher = ExposureMatcher::new(config.protocol.clone(), config.matching.clone());
    let rolling_start = config.protocol.epoch_start_interval(config.protocol.epoch_at(start));

    for key_count in [1u8, 14, 100] {
        let keys: Vec<DiagnosisKey> = (1..=key_count)
            .map(|seed| DiagnosisKey {
                key: key(seed),
                rolling_start_interval: rolling_start,
                rolling_period: config.protocol.intervals_per_epoch,
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("keys", key_count), &keys, |b, keys| {
            b.iter(|| black_box(matcher.evaluate_keys(keys, &snapshot)))
        });
    }

    group.finish();
}

fn bench_record(c: &mut Criterion) {
    let config = EngineConfig::new();
    let (store, start) = populated_store(&config, 1_000);
    let rpi = RollingProximityIdentifier::from_bytes([0x11; 16]);

    c.bench_function("record_coalesced_sighting", |b| {
        b.iter(|| black_box(store.record(rpi, start, SignalSample::new(-60)).unwrap()))
    });
}

criterion_group!(benches, bench_derivation, bench_evaluate, bench_record);

criterion_main!(benches);
