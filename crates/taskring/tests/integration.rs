//! Cross-structure integration: arena-backed entries flowing through the
//! shared ring the way the dispatch loop drives them.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use taskring::{Entry, SlotArena, SpmcRing};

#[test]
fn arena_entries_survive_the_ring() {
    const TASKS: u64 = 10_000;
    const CONSUMERS: usize = 4;

    let arena = Arc::new(SlotArena::with_capacity(256));
    let ring = Arc::new(SpmcRing::with_capacity(256));

    let mut consumers = Vec::new();
    for _ in 0..CONSUMERS {
        let arena = Arc::clone(&arena);
        let ring = Arc::clone(&ring);
        consumers.push(thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                match ring.pop() {
                    Some(entry) => {
                        let view = arena.view(entry.slot_index());
                        if view.task_id == u64::MAX {
                            arena.release(entry.slot_index());
                            break;
                        }
                        seen.push(view.task_id);
                        arena.release(entry.slot_index());
                    }
                    None => thread::yield_now(),
                }
            }
            seen
        }));
    }

    // Single producer: allocate a slot, publish its index.
    let mut task_id = 0u64;
    while task_id < TASKS {
        if let Some(index) = arena.allocate(task_id, (task_id % 7) as i16, 0) {
            loop {
                match ring.push(Entry::new((task_id % 7) as i16, index)) {
                    Ok(()) => break,
                    Err(_) => thread::yield_now(),
                }
            }
            task_id += 1;
        } else {
            thread::yield_now();
        }
    }
    // One sentinel per consumer.
    for _ in 0..CONSUMERS {
        loop {
            if let Some(index) = arena.allocate(u64::MAX, 0, 0) {
                loop {
                    match ring.push(Entry::new(0, index)) {
                        Ok(()) => break,
                        Err(_) => thread::yield_now(),
                    }
                }
                break;
            }
            thread::yield_now();
        }
    }

    let mut all = HashSet::new();
    for consumer in consumers {
        for id in consumer.join().unwrap() {
            assert!(all.insert(id), "task {id} delivered twice");
        }
    }
    assert_eq!(all.len() as u64, TASKS, "tasks lost in transit");
    assert_eq!(arena.allocated(), 0, "slots leaked");
}
