//! End-to-end flow through the public facade: configure, write, bulk load,
//! dump, restore into a fresh engine.

use serde_json::{json, Value};
use tempfile::TempDir;
use vellum::{
    DocIndexer, Engine, Endpoints, Method, OpenFlags, VellumConfig, VersionToken, CONFIG_FILE_NAME,
};

fn endpoints(s: &str) -> Endpoints {
    s.parse().unwrap()
}

#[test]
fn test_configured_engine_full_cycle() {
    let dir = TempDir::new().unwrap();
    VellumConfig {
        preparer_threads: Some(2),
        bulk_batch_size: 16,
        ..VellumConfig::default()
    }
    .write_to_file(&dir.path().join(CONFIG_FILE_NAME))
    .unwrap();

    let engine = Engine::open(dir.path()).unwrap();
    assert_eq!(engine.config().bulk_batch_size, 16);

    let db = engine
        .handler(&endpoints("e0;e1;e2"), OpenFlags::WRITABLE, Method::Put)
        .unwrap();
    db.index(Some(&json!("first")), None, &json!({"kind": "single"}), true)
        .unwrap();

    let mut indexer = DocIndexer::new(db.clone()).unwrap();
    indexer.prepare(Value::Array(
        (0..100).map(|i| json!({"_id": format!("bulk{}", i), "kind": "bulk"})).collect(),
    ));
    assert!(indexer.wait(None));
    db.commit(true).unwrap();

    let updated = db
        .update(Some(&json!("first")), Some(VersionToken(1)), &json!({"seen": true}), true)
        .unwrap();
    assert_eq!(updated.obj["_version"], json!(2));

    let mut schema = Vec::new();
    let mut documents = Vec::new();
    db.dump_schema(&mut schema).unwrap();
    db.dump_documents(&mut documents).unwrap();

    let restored_engine = Engine::with_defaults();
    let copy = restored_engine
        .handler(&endpoints("copy"), OpenFlags::WRITABLE, Method::Put)
        .unwrap();
    copy.restore(schema.as_slice()).unwrap();
    let report = copy.restore(documents.as_slice()).unwrap();
    assert!(report.digest.is_valid());
    assert_eq!(report.restored, 101);

    let first = copy.get_document("first").unwrap().get_obj().unwrap();
    assert_eq!(first, json!({"_id": "first", "kind": "single", "seen": true}));
    assert_eq!(copy.get_database_info().unwrap()["_doc_count"], json!(101));
}
