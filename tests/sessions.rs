//! Session semantics: staging rules, rollback, single-flight save, autosave.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use manifold::prelude::*;
use manifold_testing::{id, open_container, schema, user, user_entity, JsonCodec};

fn v1() -> SchemaVersion {
    SchemaVersion::new(1, 0, 0)
}

fn user_schema() -> Schema {
    schema(v1(), vec![user_entity()])
}

#[tokio::test]
async fn test_save_with_no_changes_is_noop() {
    let container = open_container(user_schema()).await.unwrap();
    let session = container.session();
    assert!(!session.has_changes());
    session.save().await.unwrap();
}

#[tokio::test]
async fn test_rollback_discards_pending() {
    let container = open_container(user_schema()).await.unwrap();
    let session = container.session();
    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    assert!(session.has_changes());
    session.rollback();
    assert!(!session.has_changes());
    session.save().await.unwrap();
    assert!(container.fetch("User", &id("u1")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_insert_then_delete_of_unsaved_item_cancels() {
    let container = open_container(user_schema()).await.unwrap();
    let session = container.session();
    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    session.delete("User", &id("u1")).await.unwrap();
    assert!(!session.has_changes(), "net no-op for a never-persisted item");
}

#[tokio::test]
async fn test_insert_then_delete_of_persisted_item_deletes() {
    let container = open_container(user_schema()).await.unwrap();
    let session = container.session();
    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    session.save().await.unwrap();

    let session = container.session();
    session
        .insert("User", &id("u1"), user("b@x", "Alice"))
        .await
        .unwrap();
    session.delete("User", &id("u1")).await.unwrap();
    assert!(session.has_changes(), "delete of a persisted item is retained");
    session.save().await.unwrap();
    assert!(container.fetch("User", &id("u1")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_then_insert_replaces_delete() {
    let container = open_container(user_schema()).await.unwrap();
    let session = container.session();
    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    session.save().await.unwrap();

    let session = container.session();
    session.delete("User", &id("u1")).await.unwrap();
    session
        .insert("User", &id("u1"), user("b@x", "Alice"))
        .await
        .unwrap();
    session.save().await.unwrap();
    let fetched = container.fetch("User", &id("u1")).await.unwrap().unwrap();
    assert_eq!(fetched.get("email"), Some(&FieldValue::String("b@x".into())));
}

#[tokio::test]
async fn test_delete_of_absent_id_is_noop() {
    let container = open_container(user_schema()).await.unwrap();
    let session = container.session();
    session.delete("User", &id("ghost")).await.unwrap();
    session.save().await.unwrap();
}

#[tokio::test]
async fn test_pending_writes_invisible_to_fetch() {
    let container = open_container(user_schema()).await.unwrap();
    let session = container.session();
    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    assert!(session.fetch("User", &id("u1")).await.unwrap().is_none());
    session.save().await.unwrap();
    assert!(session.fetch("User", &id("u1")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_unknown_entity_rejected() {
    let container = open_container(user_schema()).await.unwrap();
    let session = container.session();
    let err = session
        .insert("Ghost", &id("g1"), user("a@x", "A"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Schema(manifold::SchemaError::UnknownEntity(_))
    ));
}

#[tokio::test]
async fn test_failed_save_keeps_pending_for_retry() {
    // A uniqueness violation aborts the save; correcting the staged record
    // and retrying must succeed.
    let container = open_container(schema(
        v1(),
        vec![user_entity().index(IndexDescriptor::scalar("user_email", ["email"]).unique())],
    ))
    .await
    .unwrap();

    let session = container.session();
    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    session.save().await.unwrap();

    let session = container.session();
    session
        .insert("User", &id("u2"), user("a@x", "Bob"))
        .await
        .unwrap();
    assert!(session.save().await.is_err());
    assert!(session.has_changes());

    session
        .insert("User", &id("u2"), user("b@x", "Bob"))
        .await
        .unwrap();
    session.save().await.unwrap();
    assert!(!session.has_changes());
    assert!(container.fetch("User", &id("u2")).await.unwrap().is_some());
}

/// Codec wrapper that blocks the first decode until released, pinning a save
/// inside its transaction so a concurrent save can be observed failing.
struct StallingCodec {
    inner: JsonCodec,
    gate: Arc<Barrier>,
    armed: AtomicBool,
}

impl Codec for StallingCodec {
    fn encode(
        &self,
        entity: &str,
        record: &RecordValue,
    ) -> Result<Vec<u8>, manifold::CodecError> {
        self.inner.encode(entity, record)
    }

    fn decode(&self, entity: &str, bytes: &[u8]) -> Result<RecordValue, manifold::CodecError> {
        if self.armed.swap(false, Ordering::AcqRel) {
            self.gate.wait();
        }
        self.inner.decode(entity, bytes)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_saves_are_single_flight() {
    let gate = Arc::new(Barrier::new(2));
    let codec = Arc::new(StallingCodec {
        inner: JsonCodec::new(),
        gate: gate.clone(),
        armed: AtomicBool::new(false),
    });
    let config = RuntimeConfig::new(user_schema()).with_name("test");
    let container = Container::open(MemKv::new(), config, codec.clone())
        .await
        .unwrap();

    let session = container.session();
    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    session.save().await.unwrap();

    // Stage an overwrite; its save decodes the old value, which stalls.
    session
        .insert("User", &id("u1"), user("b@x", "Alice"))
        .await
        .unwrap();
    codec.armed.store(true, Ordering::Release);

    let stalled = {
        let session = session.clone();
        tokio::task::spawn_blocking(move || {
            tokio::runtime::Handle::current().block_on(session.save())
        })
    };

    // Wait until the first save is provably inside the critical section.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = session.save().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Session(manifold::SessionError::ConcurrentSaveNotAllowed)
    ));

    gate.wait();
    stalled.await.unwrap().unwrap();
    assert!(!session.has_changes());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_autosave_drains_pending_changes() {
    let container = open_container(user_schema()).await.unwrap();
    let session = container.session();
    session.set_autosave(true);

    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    session
        .insert("User", &id("u2"), user("b@x", "Bob"))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !session.has_changes()
            && container.fetch("User", &id("u1")).await.unwrap().is_some()
            && container.fetch("User", &id("u2")).await.unwrap().is_some()
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "autosave did not drain in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
