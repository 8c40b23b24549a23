//! Aggregation index semantics: count, sum, min/max.

use manifold::prelude::*;
use manifold::NumericOperand;
use manifold_testing::{id, open_container, order, order_entity, schema, setup_tracing};

fn v1() -> SchemaVersion {
    SchemaVersion::new(1, 0, 0)
}

fn count_schema() -> Schema {
    schema(
        v1(),
        vec![order_entity().index(IndexDescriptor::new(
            "orders_by_customer",
            IndexKind::Count,
            ["customer_id"],
        ))],
    )
}

#[tokio::test]
async fn test_count_tracks_live_items_per_group() {
    setup_tracing();
    let container = open_container(count_schema()).await.unwrap();
    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c1", 1.0, 1))
        .await
        .unwrap();
    session
        .insert("Order", &id("o2"), order("c1", 2.0, 1))
        .await
        .unwrap();
    session
        .insert("Order", &id("o3"), order("c2", 3.0, 1))
        .await
        .unwrap();
    session.save().await.unwrap();

    let c1 = Tuple::new().with("c1");
    let c2 = Tuple::new().with("c2");
    assert_eq!(container.count_value("orders_by_customer", &c1).await.unwrap(), 2);
    assert_eq!(container.count_value("orders_by_customer", &c2).await.unwrap(), 1);

    let session = container.session();
    session.delete("Order", &id("o2")).await.unwrap();
    session.save().await.unwrap();
    assert_eq!(container.count_value("orders_by_customer", &c1).await.unwrap(), 1);
}

#[tokio::test]
async fn test_count_same_group_overwrite_is_stable() {
    let container = open_container(count_schema()).await.unwrap();
    for amount in [1.0, 2.0, 3.0] {
        let session = container.session();
        session
            .insert("Order", &id("o1"), order("c1", amount, 1))
            .await
            .unwrap();
        session.save().await.unwrap();
    }
    let c1 = Tuple::new().with("c1");
    assert_eq!(container.count_value("orders_by_customer", &c1).await.unwrap(), 1);
}

#[tokio::test]
async fn test_count_group_change_moves_contribution() {
    let container = open_container(count_schema()).await.unwrap();
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

    assert_eq!(
        container
            .count_value("orders_by_customer", &Tuple::new().with("c1"))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        container
            .count_value("orders_by_customer", &Tuple::new().with("c2"))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_sum_with_group_change() {
    let container = open_container(schema(
        v1(),
        vec![order_entity().index(IndexDescriptor::new(
            "sum_amount_by_customer",
            IndexKind::Sum,
            ["customer_id", "amount"],
        ))],
    ))
    .await
    .unwrap();

    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c1", 10.0, 1))
        .await
        .unwrap();
    session.save().await.unwrap();

    let c1 = Tuple::new().with("c1");
    let c2 = Tuple::new().with("c2");
    assert_eq!(
        container.sum_value("sum_amount_by_customer", &c1).await.unwrap(),
        10.0
    );

    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c2", 15.0, 1))
        .await
        .unwrap();
    session.save().await.unwrap();

    assert_eq!(
        container.sum_value("sum_amount_by_customer", &c1).await.unwrap(),
        0.0
    );
    assert_eq!(
        container.sum_value("sum_amount_by_customer", &c2).await.unwrap(),
        15.0
    );
}

#[tokio::test]
async fn test_sum_accumulates_and_releases() {
    let container = open_container(schema(
        v1(),
        vec![order_entity().index(IndexDescriptor::new(
            "sum_amount_by_customer",
            IndexKind::Sum,
            ["customer_id", "amount"],
        ))],
    ))
    .await
    .unwrap();

    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c1", 10.5, 1))
        .await
        .unwrap();
    session
        .insert("Order", &id("o2"), order("c1", 4.5, 1))
        .await
        .unwrap();
    session.save().await.unwrap();

    let c1 = Tuple::new().with("c1");
    assert_eq!(
        container.sum_value("sum_amount_by_customer", &c1).await.unwrap(),
        15.0
    );

    let session = container.session();
    session.delete("Order", &id("o1")).await.unwrap();
    session.save().await.unwrap();
    assert_eq!(
        container.sum_value("sum_amount_by_customer", &c1).await.unwrap(),
        4.5
    );
}

#[tokio::test]
async fn test_min_max_follow_inserts() {
    let container = open_container(schema(
        v1(),
        vec![
            order_entity()
                .index(IndexDescriptor::new(
                    "min_quantity_by_customer",
                    IndexKind::Min,
                    ["customer_id", "quantity"],
                ))
                .index(IndexDescriptor::new(
                    "max_quantity_by_customer",
                    IndexKind::Max,
                    ["customer_id", "quantity"],
                )),
        ],
    ))
    .await
    .unwrap();

    let session = container.session();
    for (oid, quantity) in [("o1", 5i64), ("o2", 2), ("o3", 9)] {
        session
            .insert("Order", &id(oid), order("c1", 1.0, quantity))
            .await
            .unwrap();
    }
    session.save().await.unwrap();

    let c1 = Tuple::new().with("c1");
    assert_eq!(
        container
            .extremum_value("min_quantity_by_customer", &c1)
            .await
            .unwrap(),
        Some(NumericOperand::Int(2))
    );
    assert_eq!(
        container
            .extremum_value("max_quantity_by_customer", &c1)
            .await
            .unwrap(),
        Some(NumericOperand::Int(9))
    );
}

#[tokio::test]
async fn test_min_survives_delete_until_rebuild() {
    // Deleting the minimum cannot shrink the cell atomically; the stale
    // value persists until a rebuild rescans the live items.
    let container = open_container(schema(
        v1(),
        vec![order_entity().index(IndexDescriptor::new(
            "min_quantity_by_customer",
            IndexKind::Min,
            ["customer_id", "quantity"],
        ))],
    ))
    .await
    .unwrap();

    let session = container.session();
    session
        .insert("Order", &id("o1"), order("c1", 1.0, 2))
        .await
        .unwrap();
    session
        .insert("Order", &id("o2"), order("c1", 1.0, 7))
        .await
        .unwrap();
    session.save().await.unwrap();

    let c1 = Tuple::new().with("c1");
    assert_eq!(
        container
            .extremum_value("min_quantity_by_customer", &c1)
            .await
            .unwrap(),
        Some(NumericOperand::Int(2))
    );

    let session = container.session();
    session.delete("Order", &id("o1")).await.unwrap();
    session.save().await.unwrap();
    assert_eq!(
        container
            .extremum_value("min_quantity_by_customer", &c1)
            .await
            .unwrap(),
        Some(NumericOperand::Int(2)),
        "stale minimum is the documented contract"
    );
}
