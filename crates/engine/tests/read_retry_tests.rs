//! Document reads under concurrent modification

mod common;

use common::*;
use serde_json::json;
use std::sync::atomic::Ordering;
use std::thread;

#[test]
fn test_injected_failures_are_retried() {
    let engine = test_engine();
    let store = FlakyStore::open(&engine, "flaky-read");
    let handler = store.handler(&engine);
    let written = handler
        .index(Some(&json!("d")), None, &json!({"a": 1}), false)
        .unwrap();

    store.read_failures.store(2, Ordering::SeqCst);
    let obj = handler.get_document_by_docid(written.did).get_obj().unwrap();
    assert_eq!(obj["a"], json!(1));
    assert_eq!(store.reopens.load(Ordering::SeqCst), 2);
    assert_eq!(engine.metrics().read_retries, 2);
}

#[test]
fn test_persistent_failures_surface_after_budget() {
    let engine = test_engine();
    let store = FlakyStore::open(&engine, "flaky-budget");
    let handler = store.handler(&engine);
    let written = handler
        .index(Some(&json!("d")), None, &json!({"a": 1}), false)
        .unwrap();

    store.read_failures.store(100, Ordering::SeqCst);
    let document = handler.get_document_by_docid(written.did);
    let err = document.get_data(2).unwrap_err();
    assert!(err.is_concurrent_modification());
    assert_eq!(store.reopens.load(Ordering::SeqCst), 2);

    store.read_failures.store(0, Ordering::SeqCst);
    assert!(!document.get_data(0).unwrap().is_empty());
}

#[test]
fn test_stale_read_only_view_reopens() {
    let engine = test_engine();
    let writer = writable(&engine, "stale-view");
    let written = writer
        .index(Some(&json!("d")), None, &json!({"n": 1}), true)
        .unwrap();

    let reader = read_only(&engine, "stale-view");
    writer
        .update(Some(&json!("d")), None, &json!({"n": 2}), true)
        .unwrap();
    writer
        .update(Some(&json!("d")), None, &json!({"n": 3}), true)
        .unwrap();

    let document = reader.get_document_by_docid(written.did);
    assert_eq!(document.get_field("n").unwrap(), json!(3));
    assert_eq!(engine.metrics().read_retries, 1);
}

#[test]
fn test_readers_alongside_committing_writer() {
    let engine = test_engine();
    let writer = writable(&engine, "busy");
    let written = writer
        .index(Some(&json!("d")), None, &json!({"n": 0}), true)
        .unwrap();

    let reader = read_only(&engine, "busy");
    let writer_thread = {
        let writer = writer.clone();
        thread::spawn(move || {
            for n in 1..=50 {
                writer
                    .update(Some(&json!("d")), None, &json!({"n": n}), true)
                    .unwrap();
            }
        })
    };

    let document = reader.get_document_by_docid(written.did);
    let mut last = 0;
    for _ in 0..200 {
        if let Ok(value) = document.get_field("n") {
            let n = value.as_u64().unwrap();
            assert!(n >= last);
            last = n;
        }
    }
    writer_thread.join().unwrap();
}
