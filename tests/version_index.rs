//! Version index semantics: commit-ordered entries, "changed since"
//! queries, and update/delete bookkeeping through the per-item stamp.

use manifold::prelude::*;
use manifold_testing::{id, open_container, order, order_entity, schema};

fn v1() -> SchemaVersion {
    SchemaVersion::new(1, 0, 0)
}

fn version_schema() -> Schema {
    schema(
        v1(),
        vec![order_entity().index(IndexDescriptor::new(
            "orders_changed",
            IndexKind::Version,
            ["customer_id"],
        ))],
    )
}

#[tokio::test]
async fn test_entries_are_commit_ordered() {
    let container = open_container(version_schema()).await.unwrap();

    for oid in ["o1", "o2", "o3"] {
        let session = container.session();
        session
            .insert("Order", &id(oid), order("c1", 1.0, 1))
            .await
            .unwrap();
        session.save().await.unwrap();
    }

    let group = Tuple::new().with("c1");
    let entries = container
        .changed_since("orders_changed", &group, None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 3);
    let ids: Vec<_> = entries
        .iter()
        .map(|e| e.id.elements()[0].clone())
        .collect();
    assert_eq!(
        ids,
        vec![
            manifold::Element::String("o1".into()),
            manifold::Element::String("o2".into()),
            manifold::Element::String("o3".into()),
        ]
    );
    assert!(entries[0].stamp < entries[1].stamp);
    assert!(entries[1].stamp < entries[2].stamp);
}

#[tokio::test]
async fn test_changed_since_filters_older_stamps() {
    let container = open_container(version_schema()).await.unwrap();
    let group = Tuple::new().with("c1");

    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c1", 1.0, 1))
        .await
        .unwrap();
    session.save().await.unwrap();

    let first = container
        .changed_since("orders_changed", &group, None)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    let cutoff = first[0].stamp;

    let session = container.session();
    session
        .insert("Order", &id("o2"), order("c1", 2.0, 2))
        .await
        .unwrap();
    session.save().await.unwrap();

    let newer = container
        .changed_since("orders_changed", &group, Some(cutoff))
        .await
        .unwrap();
    assert_eq!(newer.len(), 1);
    assert_eq!(
        newer[0].id.elements()[0],
        manifold::Element::String("o2".into())
    );
}

#[tokio::test]
async fn test_update_supersedes_prior_entry() {
    let container = open_container(version_schema()).await.unwrap();
    let group = Tuple::new().with("c1");

    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c1", 1.0, 1))
        .await
        .unwrap();
    session.save().await.unwrap();
    let before = container
        .changed_since("orders_changed", &group, None)
        .await
        .unwrap();

    // Same-group update: the old entry is cleared, a newer stamp appears.
    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c1", 2.0, 2))
        .await
        .unwrap();
    session.save().await.unwrap();

    let after = container
        .changed_since("orders_changed", &group, None)
        .await
        .unwrap();
    assert_eq!(after.len(), 1, "one entry per live item");
    assert!(after[0].stamp > before[0].stamp);
}

#[tokio::test]
async fn test_group_change_moves_entry() {
    let container = open_container(version_schema()).await.unwrap();

    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c1", 1.0, 1))
        .await
        .unwrap();
    session.save().await.unwrap();

    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c2", 1.0, 1))
        .await
        .unwrap();
    session.save().await.unwrap();

    assert!(container
        .changed_since("orders_changed", &Tuple::new().with("c1"), None)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        container
            .changed_since("orders_changed", &Tuple::new().with("c2"), None)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_delete_removes_entry() {
    let container = open_container(version_schema()).await.unwrap();
    let group = Tuple::new().with("c1");

    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c1", 1.0, 1))
        .await
        .unwrap();
    session.save().await.unwrap();

    let session = container.session();
    session.delete("Order", &id("o1")).await.unwrap();
    session.save().await.unwrap();

    assert!(container
        .changed_since("orders_changed", &group, None)
        .await
        .unwrap()
        .is_empty());

    // Re-insert starts a fresh history with a newer stamp.
    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c1", 3.0, 3))
        .await
        .unwrap();
    session.save().await.unwrap();
    assert_eq!(
        container
            .changed_since("orders_changed", &group, None)
            .await
            .unwrap()
            .len(),
        1
    );
}
