use std::sync::Arc;
use std::time::Duration;

use docflat::store::memory::MemoryStore;
use docflat::value::{Map, Value};
use rstest::fixture;

pub fn fields(pairs: &[(&str, Value)]) -> Map {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn item_id(i: usize) -> String {
    format!("item-{i:04}")
}

// `count` documents in `items`, ranked in the reverse order of their IDs
pub fn numbered_store(count: usize) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for i in 0..count {
        store.insert(
            "items",
            &item_id(i),
            fields(&[("rank", Value::from((count - i) as i64))]),
        );
    }
    store
}

// Three users plus a deleted one
#[fixture]
pub fn users_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    for (id, name) in [("1", "Ada"), ("2", "Grace"), ("3", "Edsger")] {
        store.insert("users", id, fields(&[("name", Value::from(name))]));
    }
    store.insert("users", "4", fields(&[("name", Value::from("Alan"))]));
    store.delete("users", "4");
    store
}

// User 42 has two orders, user 7 has none; products have no nested collections
#[fixture]
pub fn orders_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert("users", "42", fields(&[("name", Value::from("Ada"))]));
    store.insert("users", "7", fields(&[("name", Value::from("Grace"))]));
    store.insert("users/42/orders", "o1", fields(&[("total", Value::from(10i64))]));
    store.insert("users/42/orders", "o2", fields(&[("total", Value::from(25i64))]));
    store.insert("products", "p1", fields(&[("price", Value::from(9.5))]));
    store
}

// Many users with overlapping nested collections, slow enough for tasks to overlap
#[fixture]
pub fn busy_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new().with_latency(Duration::from_millis(1)));
    for i in 0..30 {
        let user = format!("u{i:02}");
        store.insert("users", &user, Map::new());
        for order in ["a", "b"] {
            store.insert(&format!("users/{user}/orders"), order, Map::new());
        }
        if i % 3 == 0 {
            store.insert(&format!("users/{user}/addresses"), "home", Map::new());
        }
    }
    store
}

pub const TEST_DUMP: &str = r#"{
    "users": {
        "42": {
            "name": "Ada",
            "__created_at": "2023-05-01T00:00:00Z",
            "__collections": {
                "orders": {
                    "o1": {"total": 10},
                    "o2": null
                }
            }
        },
        "7": {"name": "Grace"},
        "8": null
    },
    "products": {
        "p1": {"price": 9.5}
    }
}"#;
