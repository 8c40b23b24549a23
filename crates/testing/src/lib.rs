//! Shared fixtures for manifold test suites: a toy schema, the JSON test
//! codec, and container builders over the in-memory backend.

mod codec;

pub use codec::JsonCodec;

use std::sync::Arc;

use manifold_core::{
    Container, Entity, FieldType, FieldValue, RecordValue, RuntimeConfig, RuntimeError, Schema,
    SchemaVersion, Tuple,
};
use manifold_memkv::MemKv;

/// `User { email, name }` without indexes; tests attach what they need.
pub fn user_entity() -> Entity {
    Entity::new("User")
        .field("email", FieldType::String)
        .field("name", FieldType::String)
}

/// `Order { customer_id, amount, quantity, tags }` without indexes.
pub fn order_entity() -> Entity {
    Entity::new("Order")
        .field("customer_id", FieldType::String)
        .field("amount", FieldType::Float)
        .field("quantity", FieldType::Int)
        .field(
            "tags",
            FieldType::Array {
                element: Box::new(FieldType::String),
            },
        )
}

pub fn schema(version: SchemaVersion, entities: Vec<Entity>) -> Schema {
    Schema::new(version, entities).expect("fixture schema is valid")
}

/// Opens a container over a fresh in-memory store.
pub async fn open_container(schema: Schema) -> Result<Arc<Container<MemKv>>, RuntimeError> {
    open_container_on(MemKv::new(), schema).await
}

/// Opens a container on an existing store, e.g. to simulate a process
/// restart or a deployment running a newer schema.
pub async fn open_container_on(
    db: MemKv,
    schema: Schema,
) -> Result<Arc<Container<MemKv>>, RuntimeError> {
    let config = RuntimeConfig::new(schema).with_name("test");
    Container::open(db, config, Arc::new(JsonCodec::new())).await
}

pub fn user(email: &str, name: &str) -> RecordValue {
    RecordValue::new().with("email", email).with("name", name)
}

pub fn order(customer_id: &str, amount: f64, quantity: i64) -> RecordValue {
    RecordValue::new()
        .with("customer_id", customer_id)
        .with("amount", amount)
        .with("quantity", quantity)
        .with("tags", Vec::<FieldValue>::new())
}

pub fn id(value: &str) -> Tuple {
    Tuple::new().with(value)
}

/// Installs a compact tracing subscriber honoring `RUST_LOG`; repeated calls
/// are no-ops.
pub fn setup_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .compact()
        .try_init();
}
