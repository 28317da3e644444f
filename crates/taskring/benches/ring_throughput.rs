use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::thread;
use taskring::{Entry, MpmcQueue, SpmcRing};

const MESSAGES: u64 = 1_000_000;

fn bench_spmc(c: &mut Criterion) {
    let mut group = c.benchmark_group("spmc");
    group.throughput(Throughput::Elements(MESSAGES));

    group.bench_function("one_producer_two_consumers", |b| {
        b.iter(|| {
            let ring = Arc::new(SpmcRing::with_capacity(4096));

            let mut consumers = Vec::new();
            for _ in 0..2 {
                let ring = Arc::clone(&ring);
                consumers.push(thread::spawn(move || {
                    let mut taken = 0u64;
                    loop {
                        match ring.pop() {
                            Some(entry) => {
                                if entry.slot_index() == u32::MAX - 1 {
                                    break;
                                }
                                black_box(entry);
                                taken += 1;
                            }
                            None => std::hint::spin_loop(),
                        }
                    }
                    taken
                }));
            }

            for i in 0..MESSAGES {
                let entry = Entry::new(0, (i % 1_000_000) as u32);
                while ring.push(entry).is_err() {
                    std::hint::spin_loop();
                }
            }
            for _ in 0..2 {
                while ring.push(Entry::new(0, u32::MAX - 1)).is_err() {
                    std::hint::spin_loop();
                }
            }

            let total: u64 = consumers.into_iter().map(|h| h.join().unwrap()).sum();
            assert_eq!(total, MESSAGES);
        });
    });

    group.finish();
}

fn bench_mpmc(c: &mut Criterion) {
    let mut group = c.benchmark_group("mpmc");
    group.throughput(Throughput::Elements(MESSAGES));

    group.bench_function("four_producers_one_consumer", |b| {
        b.iter(|| {
            let queue = Arc::new(MpmcQueue::with_capacity(4096));
            let per_producer = MESSAGES / 4;

            let producers: Vec<_> = (0..4)
                .map(|p| {
                    let queue = Arc::clone(&queue);
                    thread::spawn(move || {
                        for i in 0..per_producer {
                            let mut value = (p << 32) | i;
                            loop {
                                match queue.push(value) {
                                    Ok(()) => break,
                                    Err(v) => {
                                        value = v;
                                        std::hint::spin_loop();
                                    }
                                }
                            }
                        }
                    })
                })
                .collect();

            let mut taken = 0u64;
            while taken < per_producer * 4 {
                match queue.pop() {
                    Some(value) => {
                        black_box(value);
                        taken += 1;
                    }
                    None => std::hint::spin_loop(),
                }
            }

            for p in producers {
                p.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(benches, bench_spmc, bench_mpmc);
criterion_main!(benches);
