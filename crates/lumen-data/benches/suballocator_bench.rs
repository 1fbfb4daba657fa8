// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use criterion::{criterion_group, criterion_main, Criterion};
use lumen_core::gpu::HeapId;
use lumen_core::resource::HeapClass;
use lumen_data::MemorySuballocator;
use std::hint::black_box;

fn bench_suballocator(c: &mut Criterion) {
    let mut group = c.benchmark_group("MemorySuballocator");

    group.bench_function("allocate/free 256 mixed sizes", |b| {
        let mut heap = MemorySuballocator::new(HeapId(1), HeapClass::Default, 256 << 20);
        let sizes: Vec<u64> = (0..256u64).map(|i| 256 + (i * 7919) % 65_536).collect();
        b.iter(|| {
            let live: Vec<_> = sizes
                .iter()
                .filter_map(|&size| heap.allocate(size, 256).ok())
                .collect();
            for allocation in live.iter().step_by(2).chain(live.iter().skip(1).step_by(2)) {
                black_box(heap.deallocate(allocation)).ok();
            }
        });
    });

    group.bench_function("best fit over a fragmented heap", |b| {
        let mut heap = MemorySuballocator::new(HeapId(2), HeapClass::Default, 64 << 20);
        let live: Vec<_> = (0..4096u64)
            .filter_map(|i| heap.allocate(1024 + (i % 13) * 256, 256).ok())
            .collect();
        // Punch holes in every other range.
        for allocation in live.iter().step_by(2) {
            heap.deallocate(allocation).ok();
        }
        b.iter(|| {
            if let Ok(allocation) = heap.allocate(black_box(1536), 256) {
                heap.deallocate(&allocation).ok();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_suballocator);
criterion_main!(benches);
