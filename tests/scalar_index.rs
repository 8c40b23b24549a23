//! Scalar index maintenance end to end: unique enforcement, update deltas,
//! deletes, and entity scoping.

use manifold::prelude::*;
use manifold_testing::{
    id, open_container, order, order_entity, schema, setup_tracing, user, user_entity,
};

fn v1() -> SchemaVersion {
    SchemaVersion::new(1, 0, 0)
}

async fn email_values(container: &std::sync::Arc<Container<MemKv>>) -> Vec<(String, String)> {
    container
        .scan_index("user_email", &Tuple::new(), None)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| {
            let value = match &entry.values.elements()[0] {
                manifold::Element::String(s) => s.clone(),
                other => panic!("unexpected value element {other:?}"),
            };
            let id = match &entry.id.elements()[0] {
                manifold::Element::String(s) => s.clone(),
                other => panic!("unexpected id element {other:?}"),
            };
            (value, id)
        })
        .collect()
}

#[tokio::test]
async fn test_unique_scalar_insert_update_delete() {
    setup_tracing();
    let schema = schema(
        v1(),
        vec![user_entity().index(IndexDescriptor::scalar("user_email", ["email"]).unique())],
    );
    let container = open_container(schema).await.unwrap();
    let session = container.session();

    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    session.save().await.unwrap();
    assert_eq!(
        email_values(&container).await,
        vec![("a@x".to_string(), "u1".to_string())]
    );

    // A second id with the same email must fail and leave everything as-is.
    let session = container.session();
    session
        .insert("User", &id("u2"), user("a@x", "Mallory"))
        .await
        .unwrap();
    let err = session.save().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Index(manifold::IndexError::UniquenessViolation { .. })
    ));
    assert_eq!(
        email_values(&container).await,
        vec![("a@x".to_string(), "u1".to_string())]
    );
    assert!(container.fetch("User", &id("u2")).await.unwrap().is_none());
    // The failed save keeps the pending change staged for correction.
    assert!(session.has_changes());

    // Update moves the entry.
    let session = container.session();
    session
        .insert("User", &id("u1"), user("b@x", "Alice"))
        .await
        .unwrap();
    session.save().await.unwrap();
    assert_eq!(
        email_values(&container).await,
        vec![("b@x".to_string(), "u1".to_string())]
    );

    // Delete clears the entry.
    let session = container.session();
    session.delete("User", &id("u1")).await.unwrap();
    session.save().await.unwrap();
    assert!(email_values(&container).await.is_empty());
}

#[tokio::test]
async fn test_overwriting_same_value_is_stable() {
    let schema = schema(
        v1(),
        vec![user_entity().index(IndexDescriptor::scalar("user_email", ["email"]))],
    );
    let container = open_container(schema).await.unwrap();

    for _ in 0..2 {
        let session = container.session();
        session
            .insert("User", &id("u1"), user("a@x", "Alice"))
            .await
            .unwrap();
        session.save().await.unwrap();
    }
    assert_eq!(email_values(&container).await.len(), 1);

    // Unique self-overwrite is not a violation.
    let schema2 = |name: &str| {
        manifold_testing::schema(
            v1(),
            vec![user_entity().index(IndexDescriptor::scalar(name, ["email"]).unique())],
        )
    };
    let container = open_container(schema2("user_email")).await.unwrap();
    let session = container.session();
    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    session.save().await.unwrap();
    let session = container.session();
    session
        .insert("User", &id("u1"), user("a@x", "Alice Cooper"))
        .await
        .unwrap();
    session.save().await.unwrap();
}

#[tokio::test]
async fn test_prefix_scan_returns_matching_ids_only() {
    let schema = schema(
        v1(),
        vec![order_entity().index(IndexDescriptor::scalar(
            "orders_by_customer",
            ["customer_id"],
        ))],
    );
    let container = open_container(schema).await.unwrap();
    let session = container.session();
    for (oid, customer) in [("o1", "c1"), ("o2", "c1"), ("o3", "c2")] {
        session
            .insert("Order", &id(oid), order(customer, 1.0, 1))
            .await
            .unwrap();
    }
    session.save().await.unwrap();

    let entries = container
        .scan_index("orders_by_customer", &Tuple::new().with("c1"), None)
        .await
        .unwrap();
    let ids: Vec<_> = entries
        .iter()
        .map(|e| e.id.elements()[0].clone())
        .collect();
    assert_eq!(
        ids,
        vec![
            manifold::Element::String("o1".into()),
            manifold::Element::String("o2".into())
        ]
    );
}

#[tokio::test]
async fn test_index_scoped_to_entity() {
    // Writing a User never touches the Order-scoped index.
    let schema = schema(
        v1(),
        vec![
            user_entity(),
            order_entity().index(IndexDescriptor::scalar("order_price", ["amount"])),
        ],
    );
    let container = open_container(schema).await.unwrap();
    let session = container.session();
    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    session
        .insert("Order", &id("o1"), order("c1", 9.5, 1))
        .await
        .unwrap();
    session.save().await.unwrap();

    let entries = container
        .scan_index("order_price", &Tuple::new(), None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].id.elements()[0],
        manifold::Element::String("o1".into())
    );
}

#[tokio::test]
async fn test_array_field_fans_out_entries() {
    let schema = schema(
        v1(),
        vec![order_entity().index(IndexDescriptor::scalar("orders_by_tag", ["tags"]))],
    );
    let container = open_container(schema).await.unwrap();
    let session = container.session();
    let record = RecordValue::new()
        .with("customer_id", "c1")
        .with("amount", 1.0)
        .with("quantity", 1i64)
        .with(
            "tags",
            vec![FieldValue::from("red"), FieldValue::from("blue")],
        );
    session.insert("Order", &id("o1"), record).await.unwrap();
    session.save().await.unwrap();

    let entries = container
        .scan_index("orders_by_tag", &Tuple::new(), None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 2);

    // Dropping one tag clears exactly that entry.
    let session = container.session();
    let record = RecordValue::new()
        .with("customer_id", "c1")
        .with("amount", 1.0)
        .with("quantity", 1i64)
        .with("tags", vec![FieldValue::from("blue")]);
    session.insert("Order", &id("o1"), record).await.unwrap();
    session.save().await.unwrap();

    let entries = container
        .scan_index("orders_by_tag", &Tuple::new(), None)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].values.elements()[0],
        manifold::Element::String("blue".into())
    );
}

#[tokio::test]
async fn test_scan_requires_readable_state() {
    let schema = schema(
        v1(),
        vec![user_entity().index(IndexDescriptor::scalar("user_email", ["email"]))],
    );
    let db = MemKv::new();
    let container = manifold_testing::open_container_on(db.clone(), schema.clone())
        .await
        .unwrap();

    // Knock the index back to write-only; reads must refuse it.
    let session = container.session();
    session
        .insert("User", &id("u1"), user("a@x", "Alice"))
        .await
        .unwrap();
    session.save().await.unwrap();

    let err = {
        // A brand-new index on a non-fresh store starts disabled until a
        // migration enables it, which is exactly the state readers must
        // refuse to consult.
        let schema2 = manifold_testing::schema(
            v1(),
            vec![
                user_entity().index(IndexDescriptor::scalar("user_email", ["email"])),
                order_entity().index(IndexDescriptor::scalar("order_price", ["amount"])),
            ],
        );
        let container2 = manifold_testing::open_container_on(db, schema2).await.unwrap();
        // order_price is new on a non-fresh store: disabled until migrated.
        container2
            .scan_index("order_price", &Tuple::new(), None)
            .await
            .unwrap_err()
    };
    assert!(matches!(
        err,
        RuntimeError::Index(manifold::IndexError::NotReadable { .. })
    ));
}
