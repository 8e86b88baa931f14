//! Overlay dispatch benchmarks.

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use memfault_core::{
    AllocatorHandle, BenignDepthTracker, FaultScheduler, MallocSlot, OverlayConfig,
    OverlayInstaller, SystemTable,
};

fn system_slot() -> Arc<MallocSlot> {
    Arc::new(MallocSlot::with_table(AllocatorHandle::new(SystemTable::new())))
}

fn malloc_free(slot: &MallocSlot, size: usize) {
    if let Some(block) = slot.malloc(size) {
        // SAFETY: block was just allocated from this slot.
        unsafe { slot.free(Some(block)) };
    }
}

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 256, 4096];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        let direct = system_slot();
        group.bench_with_input(BenchmarkId::new("direct", size), &size, |b, &sz| {
            b.iter(|| malloc_free(&direct, criterion::black_box(sz)));
        });

        let slot = system_slot();
        let installer = OverlayInstaller::new(slot.clone(), OverlayConfig::default());
        installer.install().unwrap();
        group.bench_with_input(BenchmarkId::new("overlay_disarmed", size), &size, |b, &sz| {
            b.iter(|| malloc_free(&slot, criterion::black_box(sz)));
        });

        installer.site_log().start();
        group.bench_with_input(BenchmarkId::new("overlay_site_log", size), &size, |b, &sz| {
            b.iter(|| malloc_free(&slot, criterion::black_box(sz)));
        });
        installer.site_log().stop();
        installer.uninstall().unwrap();
    }
    group.finish();
}

fn bench_scheduler_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("scheduler_decide");
    let benign = BenignDepthTracker::new();

    group.bench_function("disarmed", |b| {
        let scheduler = FaultScheduler::new();
        b.iter(|| criterion::black_box(scheduler.decide(&benign)));
    });

    group.bench_function("armed_countdown", |b| {
        let scheduler = FaultScheduler::new();
        scheduler.reconfigure(i64::MAX, 1);
        b.iter(|| criterion::black_box(scheduler.decide(&benign)));
    });

    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle, bench_scheduler_decide);
criterion_main!(benches);
