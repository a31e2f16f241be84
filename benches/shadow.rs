// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::hint::black_box;

pub use criterion::Criterion;
use dma_map_verify::{
    DmaPermissions, HostAddress, Iova, MappingRecord, PatternGenerator, PatternSpec,
    ShadowTable, Strategy, SIZE_2M, SIZE_4K,
};

const SOURCE: HostAddress = HostAddress(0x7f00_0000_0000);
const EXTENT: u64 = 256 * SIZE_2M;

fn filled(chunk: u64) -> ShadowTable {
    let mut table = ShadowTable::new();
    let spec = PatternSpec::new(Strategy::Forward, chunk, EXTENT).unwrap();
    for c in PatternGenerator::new(spec, SOURCE) {
        table
            .insert(MappingRecord::new(
                c.iova,
                c.length,
                c.source_address,
                DmaPermissions::READ | DmaPermissions::WRITE,
            ))
            .unwrap();
    }
    table
}

pub fn benchmark_for_shadow(c: &mut Criterion) {
    c.bench_function("ShadowTable::insert_2M", |b| b.iter(|| filled(black_box(SIZE_2M))));

    let table = filled(SIZE_2M);
    c.bench_function("ShadowTable::intersection", |b| {
        b.iter(|| table.intersection(black_box(Iova(SIZE_2M / 2)), black_box(EXTENT)))
    });

    // Exact carves of one base page out of every mapping.
    c.bench_function("ShadowTable::release_exact", |b| {
        b.iter(|| {
            let mut t = table.clone();
            for i in 0..256 {
                t.release(Iova(i * SIZE_2M), SIZE_4K, SIZE_4K).unwrap();
            }
            t
        })
    });

    // Whole superpages reported for base page requests.
    c.bench_function("ShadowTable::release_credited", |b| {
        b.iter(|| {
            let mut t = table.clone();
            for i in 0..256 {
                t.release(Iova(i * SIZE_2M), SIZE_4K, SIZE_2M).unwrap();
            }
            t
        })
    });
}

pub fn benchmark_for_pattern(c: &mut Criterion) {
    let spec = PatternSpec::new(Strategy::Forward, SIZE_4K, EXTENT).unwrap();
    c.bench_function("PatternGenerator::forward_4K", |b| {
        b.iter(|| PatternGenerator::new(black_box(spec), SOURCE).count())
    });

    let spec = spec.with_strategy(Strategy::CheckerboardOdd).unwrap();
    c.bench_function("PatternGenerator::checkerboard_rev_4K", |b| {
        b.iter(|| PatternGenerator::new(black_box(spec), SOURCE).rev().count())
    });
}
