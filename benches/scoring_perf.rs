//! Performance benchmarks for pulse scoring, recording and ranking.
//!
//! Run with: `cargo bench --bench scoring_perf`

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use tempfile::TempDir;

use pulse::config::MaintenanceConfig;
use pulse::scoring;
use pulse::{
    EngagementEvent, Entity, EntityKey, EntityKind, EntityStore, MaintenanceJob, MemoryStore,
    RankingService, Recorder, ScoreField, ScoringParams, Scope, SortOrder, SqliteStore, VoteType,
};

const CORPUS_SIZES: [usize; 3] = [100, 1_000, 5_000];

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// `count` posts with a spread of votes and views, scored at creation time.
fn seed(store: &Arc<dyn EntityStore>, count: usize) -> Result<Recorder> {
    let recorder = Recorder::new(Arc::clone(store), ScoringParams::default());
    for i in 0..count {
        let key = EntityKey::post(format!("p{i}"));
        let created = t0() + Duration::minutes(i64::try_from(i % 600)?);
        store.create(&Entity::new(key.clone(), created))?;
        for v in 0..(i % 7) {
            let user = format!("u{v}");
            recorder.record_at(&key, EngagementEvent::View, Some(&user), created)?;
            let vote = if v % 3 == 0 { VoteType::Down } else { VoteType::Up };
            recorder.record_at(&key, EngagementEvent::Vote(vote), Some(&user), created)?;
        }
    }
    Ok(recorder)
}

fn memory_corpus(count: usize) -> Result<(Arc<dyn EntityStore>, Recorder)> {
    let store: Arc<dyn EntityStore> = Arc::new(MemoryStore::new());
    let recorder = seed(&store, count)?;
    Ok((store, recorder))
}

fn bench_recompute(c: &mut Criterion) {
    let (store, _recorder) = match memory_corpus(1) {
        Ok(corpus) => corpus,
        Err(err) => {
            eprintln!("bench_recompute setup failed: {err}");
            return;
        }
    };
    let entity = match store.fetch_required(&EntityKey::post("p0")) {
        Ok(entity) => entity,
        Err(err) => {
            eprintln!("bench_recompute fetch failed: {err}");
            return;
        }
    };
    let params = ScoringParams::default();
    let now = t0() + Duration::hours(5);

    let mut group = c.benchmark_group("recompute");
    group.throughput(Throughput::Elements(1));
    group.bench_function("post", |b| {
        b.iter(|| {
            black_box(scoring::recompute(
                black_box(entity.analytics()),
                EntityKind::Post,
                now,
                &params,
            ))
        });
    });
    group.finish();
}

fn bench_record_event(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_event");
    group.throughput(Throughput::Elements(1));

    if let Ok((_store, recorder)) = memory_corpus(1) {
        let key = EntityKey::post("p0");
        let mut n = 0u64;
        group.bench_function("memory_view", |b| {
            b.iter(|| {
                n += 1;
                let user = format!("bench-{n}");
                if let Err(err) = recorder.record_at(&key, EngagementEvent::View, Some(&user), t0()) {
                    eprintln!("bench_record_event failed: {err}");
                }
            });
        });
    }

    let dir = match TempDir::new() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("bench_record_event tempdir failed: {err}");
            group.finish();
            return;
        }
    };
    let sqlite = SqliteStore::open(dir.path().join("bench.db")).map(|s| Arc::new(s) as Arc<dyn EntityStore>);
    if let Ok(store) = sqlite {
        if let Ok(recorder) = seed(&store, 1) {
            let key = EntityKey::post("p0");
            group.bench_function("sqlite_click", |b| {
                b.iter(|| {
                    if let Err(err) = recorder.record_at(&key, EngagementEvent::Click, None, t0()) {
                        eprintln!("bench_record_event failed: {err}");
                    }
                });
            });
        }
    }
    group.finish();
}

fn bench_top_by_score(c: &mut Criterion) {
    let mut group = c.benchmark_group("top_by_score");
    for size in CORPUS_SIZES {
        let Ok((store, _recorder)) = memory_corpus(size) else {
            eprintln!("bench_top_by_score setup failed for {size}");
            continue;
        };
        let ranking = RankingService::new(store, Duration::hours(1));
        group.bench_with_input(BenchmarkId::new("hot_top_20", size), &size, |b, _| {
            b.iter(|| {
                black_box(ranking.top_by_score(
                    EntityKind::Post,
                    &Scope::default(),
                    ScoreField::Hot,
                    SortOrder::Descending,
                    20,
                ))
            });
        });
    }
    group.finish();
}

fn bench_maintenance_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("maintenance_run");
    group.sample_size(20);
    for size in CORPUS_SIZES {
        let Ok((store, recorder)) = memory_corpus(size) else {
            eprintln!("bench_maintenance_run setup failed for {size}");
            continue;
        };
        let config = MaintenanceConfig {
            activity_lookback_secs: 48 * 3600,
            batch_cap: size,
            ..MaintenanceConfig::default()
        };
        let job = MaintenanceJob::new(store, recorder.refresher().clone(), config);
        let mut now = t0() + Duration::hours(2);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("refresh_all", size), &size, |b, _| {
            b.iter(|| {
                // Each run must see every score as stale again.
                now += Duration::hours(2);
                black_box(job.run_once(now))
            });
        });
    }
    group.finish();
}

criterion_group!(
    name = scoring_benches;
    config = Criterion::default().significance_level(0.05);
    targets =
        bench_recompute,
        bench_record_event
);

criterion_group!(
    name = ranking_benches;
    config = Criterion::default().significance_level(0.05);
    targets =
        bench_top_by_score,
        bench_maintenance_run
);

criterion_main!(scoring_benches, ranking_benches);
