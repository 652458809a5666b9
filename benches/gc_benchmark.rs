//! Heap micro-benchmarks.
//!
//! Run with: cargo bench --bench gc_benchmark

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use loam::{AllocFlags, Heap, HeapSettings};

fn bench_alloc_free(c: &mut Criterion) {
    let mut heap = Heap::new(
        HeapSettings {
            heap_size: 4 << 20,
            ..HeapSettings::default()
        },
        None,
    );

    c.bench_function("alloc_free_16", |b| {
        b.iter(|| {
            let p = heap
                .alloc(black_box(16), AllocFlags::empty(), false)
                .expect("alloc");
            heap.free(p.as_ptr());
        })
    });

    c.bench_function("alloc_free_256", |b| {
        b.iter(|| {
            let p = heap
                .alloc(black_box(256), AllocFlags::empty(), false)
                .expect("alloc");
            heap.free(p.as_ptr());
        })
    });
}

fn bench_collect(c: &mut Criterion) {
    let mut heap = Heap::new(
        HeapSettings {
            heap_size: 4 << 20,
            ..HeapSettings::default()
        },
        None,
    );

    // a rooted linked list of 1000 nodes plus plenty of floating garbage
    let mut head = std::ptr::null_mut::<u8>();
    for _ in 0..1000 {
        let node = heap.alloc(32, AllocFlags::empty(), false).expect("alloc");
        // SAFETY: node is a live 32-byte allocation
        unsafe { node.as_ptr().cast::<usize>().write(head as usize) };
        head = node.as_ptr();
    }
    for _ in 0..1000 {
        heap.alloc(48, AllocFlags::empty(), false).expect("alloc");
    }

    c.bench_function("collect_1000_live", |b| {
        b.iter(|| {
            heap.collect_start();
            heap.collect_ptr(black_box(head));
            heap.collect_end()
        })
    });
}

criterion_group!(benches, bench_alloc_free, bench_collect);
criterion_main!(benches);
