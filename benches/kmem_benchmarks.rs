//! Slab-allocator benchmarks: warm per-CPU round trips, cold slab growth,
//! and the large/bufctl regime's extra hash-index overhead.

extern crate alloc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use nos_kmem_cache::{AllocFlags, BaseArena, CacheFlags, KmemCache, NullClock};

static ARENA: BaseArena = BaseArena::new();

fn small_warm_round_trip(c: &mut Criterion) {
    let magazine = KmemCache::bootstrap_magazine_cache(&ARENA, 1, alloc::boxed::Box::new(NullClock));
    let cache = KmemCache::create(
        "bench_small",
        64,
        8,
        CacheFlags::empty(),
        &ARENA,
        None,
        None,
        core::ptr::null_mut(),
        1,
        alloc::boxed::Box::new(NullClock),
        &magazine,
    );

    c.bench_function("small_warm_round_trip", |b| {
        b.iter(|| {
            let obj = cache.alloc(0, AllocFlags::WAIT).unwrap();
            cache.free(0, black_box(obj));
        })
    });

    KmemCache::destroy(cache);
    KmemCache::destroy(magazine);
}

fn large_warm_round_trip(c: &mut Criterion) {
    let magazine = KmemCache::bootstrap_magazine_cache(&ARENA, 1, alloc::boxed::Box::new(NullClock));
    let cache = KmemCache::create(
        "bench_large",
        2048,
        8,
        CacheFlags::empty(),
        &ARENA,
        None,
        None,
        core::ptr::null_mut(),
        1,
        alloc::boxed::Box::new(NullClock),
        &magazine,
    );

    c.bench_function("large_warm_round_trip", |b| {
        b.iter(|| {
            let obj = cache.alloc(0, AllocFlags::WAIT).unwrap();
            cache.free(0, black_box(obj));
        })
    });

    KmemCache::destroy(cache);
    KmemCache::destroy(magazine);
}

fn cold_slab_growth(c: &mut Criterion) {
    let magazine = KmemCache::bootstrap_magazine_cache(&ARENA, 1, alloc::boxed::Box::new(NullClock));

    c.bench_function("cold_slab_growth", |b| {
        b.iter(|| {
            let cache = KmemCache::create(
                "bench_cold",
                64,
                8,
                CacheFlags::empty(),
                &ARENA,
                None,
                None,
                core::ptr::null_mut(),
                1,
                alloc::boxed::Box::new(NullClock),
                &magazine,
            );
            let obj = cache.alloc(0, AllocFlags::WAIT).unwrap();
            black_box(obj);
            KmemCache::destroy(cache);
        })
    });

    KmemCache::destroy(magazine);
}

criterion_group!(benches, small_warm_round_trip, large_warm_round_trip, cold_slab_growth);
criterion_main!(benches);
