//! Multi-threaded tests for vellum-concurrency
//!
//! These exercise the primitives with real threads:
//!
//! 1. **Schema CAS** - racing writers converge on one definition
//! 2. **Queue hand-off** - many producers, one consumer, nothing lost
//! 3. **Throttle** - producers parked on the semaphore are released by signals

use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use vellum_concurrency::{BlockingQueue, FieldType, Latch, Schema, SchemaStore, Semaphore};
use vellum_core::Endpoints;

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

// ============================================================================
// Schema CAS
// ============================================================================

#[test]
fn test_racing_schema_writers_converge() {
    const THREADS: usize = 8;
    let store = Arc::new(SchemaStore::new());
    let endpoints: Endpoints = "race0;race1".parse().unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));
    let publishes = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let store = Arc::clone(&store);
            let endpoints = endpoints.clone();
            let barrier = Arc::clone(&barrier);
            let publishes = Arc::clone(&publishes);
            thread::spawn(move || {
                let obj = object(json!({ format!("f{}", t): t, "shared": "text" }));
                let id = json!(format!("doc-{}", t));
                barrier.wait();
                loop {
                    let base = store.get(&endpoints);
                    let mut schema = Schema::new(Arc::clone(&base));
                    schema.index(&obj, Some(&id)).unwrap();
                    match schema.take_modified() {
                        Some(modified) if !modified.same_definition(&base) => {
                            if store.set(&endpoints, &base, modified) {
                                publishes.fetch_add(1, Ordering::SeqCst);
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let current = store.get(&endpoints);
    assert_eq!(current.id_type, Some(FieldType::Keyword));
    for t in 0..THREADS {
        assert_eq!(
            current.fields[&format!("f{}", t)].field_type,
            FieldType::Integer
        );
    }
    assert!(current.fields.contains_key("shared"));
    assert_eq!(current.version, publishes.load(Ordering::SeqCst));

    let mut slots: Vec<u32> = current.fields.values().map(|f| f.slot).collect();
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), current.fields.len());
}

#[test]
fn test_stale_publishes_are_counted() {
    let store = SchemaStore::new();
    let endpoints: Endpoints = "stale".parse().unwrap();
    let base = store.get(&endpoints);

    let mut first = Schema::new(Arc::clone(&base));
    first.index(&object(json!({"a": 1})), Some(&json!("x"))).unwrap();
    let mut second = Schema::new(Arc::clone(&base));
    second.index(&object(json!({"b": 1})), Some(&json!("y"))).unwrap();

    assert!(store.set(&endpoints, &base, first.take_modified().unwrap()));
    assert!(!store.set(&endpoints, &base, second.take_modified().unwrap()));
    assert_eq!(store.stale_publishes(), 1);
    assert!(!store.drop_schema(&endpoints, &base));

    let current = store.get(&endpoints);
    assert!(store.drop_schema(&endpoints, &current));
    assert!(store.get(&endpoints).fields.is_empty());
}

// ============================================================================
// Queue hand-off
// ============================================================================

#[test]
fn test_many_producers_one_consumer() {
    const PRODUCERS: usize = 4;
    const ITEMS: usize = 500;
    let queue = Arc::new(BlockingQueue::new(8));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..ITEMS {
                    assert!(queue.enqueue((p, i)));
                }
            })
        })
        .collect();

    let mut last = vec![None; PRODUCERS];
    let mut received = 0;
    while received < PRODUCERS * ITEMS {
        if let Some((p, i)) = queue.wait_dequeue_timed(Duration::from_millis(100)) {
            assert!(last[p].map_or(true, |prev| prev < i), "per-producer FIFO");
            last[p] = Some(i);
            received += 1;
        }
    }
    for producer in producers {
        producer.join().unwrap();
    }
    assert!(queue.is_empty());
}

#[test]
fn test_close_releases_blocked_producer() {
    let queue = Arc::new(BlockingQueue::new(1));
    assert!(queue.enqueue(0));

    let blocked = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.enqueue(1))
    };
    thread::sleep(Duration::from_millis(20));
    queue.close();

    assert!(!blocked.join().unwrap());
    assert_eq!(queue.wait_dequeue(), 0);
    assert!(!queue.force_enqueue(2));
}

// ============================================================================
// Throttle
// ============================================================================

#[test]
fn test_signals_release_parked_producers() {
    const PRODUCERS: usize = 6;
    let throttle = Arc::new(Semaphore::new(0));
    let passed = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(Latch::new());

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let throttle = Arc::clone(&throttle);
            let passed = Arc::clone(&passed);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                throttle.wait();
                if passed.fetch_add(1, Ordering::SeqCst) + 1 == PRODUCERS {
                    done.set();
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    assert_eq!(passed.load(Ordering::SeqCst), 0);

    throttle.signal(2);
    throttle.signal(4);
    assert!(done.wait_timeout(Duration::from_secs(5)));
    for producer in producers {
        producer.join().unwrap();
    }
    assert_eq!(throttle.available(), 0);
}
