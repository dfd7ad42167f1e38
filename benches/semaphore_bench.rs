// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Weighted semaphore throughput benchmarks: uncontended fast-path acquire/release
//! versus slow-path acquire under a queue of waiters.

use concurry::{CancellationToken, Fairness, SemaphoreConfig, WeightedSemaphore};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::thread;

fn bench_uncontended_acquire_release(c: &mut Criterion) {
    let sem = WeightedSemaphore::new(SemaphoreConfig::new("bench", 64));
    c.bench_function("semaphore_uncontended_acquire_release", |b| {
        b.iter(|| {
            sem.try_acquire(black_box(1)).unwrap();
            sem.release(1);
        })
    });
}

fn bench_contended_acquire(c: &mut Criterion) {
    let sem = Arc::new(WeightedSemaphore::new(SemaphoreConfig::new("bench", 4).with_fairness(Fairness::Fifo)));
    c.bench_function("semaphore_contended_acquire", |b| {
        b.iter(|| {
            let sem = sem.clone();
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let sem = sem.clone();
                    thread::spawn(move || {
                        let token = CancellationToken::new();
                        sem.acquire(&token, 1).unwrap();
                        sem.release(1);
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        })
    });
}

criterion_group!(benches, bench_uncontended_acquire_release, bench_contended_acquire);
criterion_main!(benches);
