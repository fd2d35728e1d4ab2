use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use std::sync::Arc;

use rookdb::BufferPoolManager;

// Create temporary db for benchmarking
fn create_bench_buffer_pool(pool_size: usize) -> Arc<BufferPoolManager> {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    let path = temp_file.path().to_str().unwrap().to_string();
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, 2, path).unwrap());

    // Keep the temp file alive
    std::mem::forget(temp_file);

    buffer_pool
}

fn buffer_pool_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("BufferPool");

    for size in [16, 64, 256].iter() {
        group.bench_with_input(
            BenchmarkId::new("sequential_access", size),
            size,
            |b, &size| {
                let buffer_pool = create_bench_buffer_pool(size);

                let mut page_ids = Vec::new();
                for i in 0..size {
                    let (page_id, mut guard) = buffer_pool.new_page().unwrap();
                    {
                        let mut page = guard.page().write();
                        page.data[0] = i as u8;
                    }
                    guard.mark_dirty();
                    page_ids.push(page_id);
                }

                b.iter(|| {
                    for &page_id in &page_ids {
                        let guard = buffer_pool.fetch_page_read(page_id).unwrap();
                        criterion::black_box(guard.data[0]);
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("random_access_with_eviction", size),
            size,
            |b, &size| {
                // Twice as many pages as frames forces steady eviction.
                let buffer_pool = create_bench_buffer_pool(size);
                let mut page_ids = Vec::new();
                for _ in 0..size * 2 {
                    let (page_id, guard) = buffer_pool.new_page().unwrap();
                    drop(guard);
                    page_ids.push(page_id);
                }

                let mut rng = StdRng::seed_from_u64(42);
                b.iter(|| {
                    let page_id = *page_ids.choose(&mut rng).unwrap();
                    let guard = buffer_pool.fetch_page_read(page_id).unwrap();
                    criterion::black_box(guard.page_id);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, buffer_pool_benchmark);
criterion_main!(benches);
