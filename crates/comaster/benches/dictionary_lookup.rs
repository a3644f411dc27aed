// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Register lookup benchmark
//!
//! Every received reply and broadcast frame resolves `(index, subindex)`
//! through the sorted dictionary, then touches the value cache. Compares:
//! - sorted-vector binary search against a `BTreeMap`
//! - cache store + take round trip for a scalar register

#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]

use comaster::{
    AccessType, DeviceInfo, Dictionary, Kind, RegisterDescriptor, RegisterId, ValueCache,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Dictionary with `count` u16 registers spread over manufacturer indices.
fn dictionary(count: usize) -> Dictionary {
    let entries = (0..count)
        .map(|i| {
            RegisterDescriptor::new(
                (0x2000 + (i / 8) as u16, (i % 8) as u8),
                Kind::UInt16,
                AccessType::ReadWrite,
                true,
                format!("reg_{}", i),
            )
        })
        .collect();
    Dictionary::from_descriptors(DeviceInfo::default(), entries)
}

fn probes(dict: &Dictionary, count: usize) -> Vec<RegisterId> {
    let ids: Vec<RegisterId> = dict.iter().map(|(_, d)| d.id).collect();
    let mut rng = fastrand::Rng::with_seed(7);
    (0..count).map(|_| ids[rng.usize(..ids.len())]).collect()
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("dictionary_lookup");
    for size in [64usize, 512, 4096] {
        let dict = dictionary(size);
        let probes = probes(&dict, 256);
        let tree: BTreeMap<RegisterId, usize> = dict
            .iter()
            .map(|(key, d)| (d.id, key.position()))
            .collect();

        group.bench_with_input(BenchmarkId::new("sorted_vec", size), &probes, |b, probes| {
            b.iter(|| {
                for id in probes {
                    black_box(dict.try_find(black_box(*id)));
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("btree_map", size), &probes, |b, probes| {
            b.iter(|| {
                for id in probes {
                    black_box(tree.get(black_box(id)));
                }
            });
        });
    }
    group.finish();
}

fn bench_cache_round_trip(c: &mut Criterion) {
    let dict = Arc::new(dictionary(512));
    let cache = ValueCache::new(Arc::clone(&dict)).expect("cache");
    let key = dict.find(0x2010, 3).expect("key");
    let now = Instant::now();

    c.bench_function("cache_store_take_u16", |b| {
        b.iter(|| {
            cache
                .store_bytes(key, black_box(&[0x34, 0x12]), now)
                .expect("store");
            black_box(cache.take(key).expect("take"));
        });
    });
}

criterion_group!(benches, bench_lookup, bench_cache_round_trip);
criterion_main!(benches);
