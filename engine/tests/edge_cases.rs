//! Edge case tests for ferry-engine
//!
//! These tests cover boundary conditions and unusual inputs on the local
//! write path, the merge rule, and store persistence. No remote is involved.

use ferry_engine::{
    merge_disposition, Disposition, DropReason, Error, FieldDef, FieldType, LocalStore,
    MemoryStore, ModelRegistry, ModelSchema, MutationType, Record, RemoteRecord,
    RemoteSyncEngine, StoreSnapshot, SyncMetadata,
};
use serde_json::json;

fn create_test_registry() -> ModelRegistry {
    ModelRegistry::new(1).with_model(ModelSchema::new(
        "items",
        vec![
            FieldDef::required("id", FieldType::String),
            FieldDef::required("name", FieldType::String),
            FieldDef::optional("count", FieldType::Int),
            FieldDef::optional("data", FieldType::Json),
        ],
    ))
}

fn offline_engine() -> RemoteSyncEngine {
    RemoteSyncEngine::builder(create_test_registry())
        .build()
        .unwrap()
}

fn item(id: &str, payload: serde_json::Value) -> Record {
    let mut payload = payload;
    payload["id"] = json!(id);
    Record::new(id, "items", payload)
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[tokio::test]
async fn empty_string_fields() {
    let engine = offline_engine();

    engine.save(item("item1", json!({"name": ""}))).unwrap();

    let record = engine.query_by_id("items", "item1").unwrap().unwrap();
    assert_eq!(record.payload["name"], "");
}

#[tokio::test]
async fn unicode_strings() {
    let engine = offline_engine();

    let unicode_names = vec![
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Ω≈ç√∫",
        "Hello\nWorld\tTab",
        "Null\0Test",
    ];

    for (i, name) in unicode_names.iter().enumerate() {
        let id = format!("item_{}", i);
        let result = engine.save(item(&id, json!({"name": name})));
        assert!(result.is_ok(), "Failed for: {}", name);

        let record = engine.query_by_id("items", &id).unwrap().unwrap();
        assert_eq!(record.payload["name"], *name);
    }
}

#[tokio::test]
async fn very_long_strings() {
    let engine = offline_engine();
    let long_name = "x".repeat(1024 * 1024);

    let event = engine
        .save(item("item1", json!({"name": long_name.clone()})))
        .unwrap();

    assert_eq!(event.payload["name"].as_str().map(str::len), Some(long_name.len()));
}

#[tokio::test]
async fn ids_with_special_characters() {
    let engine = offline_engine();
    let ids = ["with space", "slash/inside", "colon:id", "émoji-🚀", "dots.and-dashes"];

    for id in ids {
        engine.save(item(id, json!({"name": id}))).unwrap();
    }

    let stored: Vec<_> = engine
        .query("items")
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(stored.len(), ids.len());
    for id in ids {
        assert!(stored.iter().any(|s| s == id), "missing {id}");
    }
}

// ============================================================================
// Numeric and JSON Edge Cases
// ============================================================================

#[tokio::test]
async fn integer_boundaries() {
    let engine = offline_engine();

    for (i, value) in [json!(i64::MIN), json!(i64::MAX), json!(u64::MAX), json!(0)]
        .into_iter()
        .enumerate()
    {
        let id = format!("int_{i}");
        engine
            .save(item(&id, json!({"name": "n", "count": value.clone()})))
            .unwrap();
        let record = engine.query_by_id("items", &id).unwrap().unwrap();
        assert_eq!(record.payload["count"], value);
    }

    let err = engine
        .save(item("float", json!({"name": "n", "count": 1.5})))
        .unwrap_err();
    assert!(matches!(err, Error::TypeMismatch { .. }));
}

#[tokio::test]
async fn deeply_nested_json() {
    let engine = offline_engine();

    let mut nested = json!("leaf");
    for _ in 0..64 {
        nested = json!({"child": nested});
    }

    engine
        .save(item("deep", json!({"name": "deep", "data": nested.clone()})))
        .unwrap();

    let record = engine.query_by_id("items", "deep").unwrap().unwrap();
    assert_eq!(record.payload["data"], nested);
}

#[tokio::test]
async fn json_with_all_types() {
    let engine = offline_engine();
    let data = json!({
        "null": null,
        "bool": true,
        "int": -42,
        "float": 3.25,
        "string": "s",
        "array": [1, "two", null, {"three": 3}],
        "object": {"nested": {"deeper": []}}
    });

    engine
        .save(item("all", json!({"name": "all", "data": data.clone()})))
        .unwrap();

    let record = engine.query_by_id("items", "all").unwrap().unwrap();
    assert_eq!(record.payload["data"], data);
}

// ============================================================================
// Validation Edge Cases
// ============================================================================

#[tokio::test]
async fn payload_id_must_match_record_id() {
    let engine = offline_engine();
    let record = Record::new("item1", "items", json!({"id": "other", "name": "x"}));

    assert!(matches!(engine.save(record), Err(Error::InvalidPayload(_))));
    assert!(engine.pending_mutations().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_model_is_rejected() {
    let engine = offline_engine();
    let record = Record::new("x", "ghosts", json!({"id": "x"}));

    assert!(matches!(
        engine.submit(record, MutationType::Create),
        Err(Error::ModelNotFound(_))
    ));
}

#[tokio::test]
async fn create_after_delete_is_allowed() {
    let engine = offline_engine();

    engine.save(item("item1", json!({"name": "first"}))).unwrap();
    engine.delete("items", "item1").unwrap();
    let event = engine
        .submit(item("item1", json!({"name": "second"})), MutationType::Create)
        .unwrap();

    assert_eq!(event.mutation_type, MutationType::Create);
    let kinds: Vec<_> = engine
        .pending_mutations()
        .unwrap()
        .into_iter()
        .map(|e| e.mutation_type)
        .collect();
    assert_eq!(
        kinds,
        vec![MutationType::Create, MutationType::Delete, MutationType::Create]
    );
}

#[test]
fn custom_primary_key() {
    let registry = ModelRegistry::new(1).with_model(
        ModelSchema::new(
            "Comment",
            vec![
                FieldDef::required("commentId", FieldType::String),
                FieldDef::optional("body", FieldType::String),
            ],
        )
        .with_primary_key("commentId"),
    );

    let record = registry
        .record_from_payload("Comment", json!({"commentId": "c-1", "body": "hi"}))
        .unwrap();
    assert_eq!(record.id, "c-1");
    assert!(registry.validate(&record).is_ok());

    assert!(matches!(
        registry.record_from_payload("Comment", json!({"body": "no id"})),
        Err(Error::MissingRequiredField(_))
    ));
}

#[test]
fn registry_with_many_models() {
    let mut registry = ModelRegistry::new(1);
    for i in 0..100 {
        registry.register(ModelSchema::new(
            format!("model_{i:03}"),
            vec![FieldDef::required("id", FieldType::String)],
        ));
    }

    assert_eq!(registry.len(), 100);
    let names: Vec<_> = registry.model_names().cloned().collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
}

// ============================================================================
// Merge Rule Edge Cases
// ============================================================================

fn metadata(version: u64, at: u64, deleted: bool) -> SyncMetadata {
    RemoteRecord {
        deleted,
        ..RemoteRecord::new(item("r", json!({"name": "n"})), version, at)
    }
    .metadata()
}

#[test]
fn same_version_newer_timestamp_wins() {
    let incoming = RemoteRecord::new(item("r", json!({"name": "n"})), 3, 500);
    assert_eq!(
        merge_disposition(&incoming, Some(&metadata(3, 400, false))),
        Disposition::Updated
    );
    assert_eq!(
        merge_disposition(&incoming, Some(&metadata(3, 500, false))),
        Disposition::Dropped(DropReason::Stale)
    );
}

#[test]
fn higher_version_wins_over_later_timestamp() {
    let incoming = RemoteRecord::new(item("r", json!({"name": "n"})), 2, 100);
    assert_eq!(
        merge_disposition(&incoming, Some(&metadata(1, 9_000, false))),
        Disposition::Updated
    );
}

#[test]
fn live_copy_after_tombstone_recreates() {
    let incoming = RemoteRecord::new(item("r", json!({"name": "n"})), 5, 100);
    assert_eq!(
        merge_disposition(&incoming, Some(&metadata(4, 90, true))),
        Disposition::Created
    );
}

#[test]
fn unseen_tombstone_is_recorded() {
    let tombstone = RemoteRecord::tombstone(item("r", json!({"name": "n"})), 2, 100);
    assert_eq!(merge_disposition(&tombstone, None), Disposition::Deleted);
}

// ============================================================================
// Persistence Edge Cases
// ============================================================================

#[test]
fn snapshot_empty_store() {
    let snapshot = StoreSnapshot::new(1);
    let json = snapshot.to_json().unwrap();
    let restored = StoreSnapshot::from_json(&json).unwrap();

    assert_eq!(restored, snapshot);
    assert_eq!(restored.record_count(), 0);
    assert!(restored.validate(&create_test_registry()).is_ok());
}

#[test]
fn file_store_survives_reopen_with_tombstones() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let registry = create_test_registry();

    {
        let store = MemoryStore::open(&path, &registry).unwrap();
        let live = RemoteRecord::new(item("live", json!({"name": "l"})), 2, 20);
        let gone = RemoteRecord::tombstone(item("gone", json!({"name": "g"})), 3, 30);
        (&store as &dyn LocalStore)
            .transact(|tx| {
                for remote in [&live, &gone] {
                    ferry_engine::reconcile_remote(tx, &registry, remote);
                }
                tx.set_checkpoint("items", 30);
                Ok(())
            })
            .unwrap();
    }

    let store = MemoryStore::open(&path, &registry).unwrap();
    assert!(store.query_by_id("items", "live").unwrap().is_some());
    assert!(store.query_by_id("items", "gone").unwrap().is_none());
    assert!(store.sync_metadata("items", "gone").unwrap().unwrap().deleted);
    assert_eq!(store.checkpoint("items").unwrap(), Some(30));
}

#[test]
fn store_rejects_snapshot_from_other_schema_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    std::fs::write(&path, StoreSnapshot::new(7).to_json().unwrap()).unwrap();

    let result = MemoryStore::open(&path, &create_test_registry());

    assert!(matches!(
        result,
        Err(Error::SchemaVersionMismatch { expected: 1, actual: 7 })
    ));
}

#[test]
fn corrupt_snapshot_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    std::fs::write(&path, "{not json").unwrap();

    assert!(MemoryStore::open(&path, &create_test_registry()).is_err());
}

#[tokio::test]
async fn many_pending_mutations() {
    let engine = offline_engine();

    for i in 0..1000 {
        engine
            .save(item(&format!("item_{i}"), json!({"name": "n"})))
            .unwrap();
    }

    let pending = engine.pending_mutations().unwrap();
    assert_eq!(pending.len(), 1000);
    assert!(pending.windows(2).all(|w| w[0].sequence < w[1].sequence));
}
