use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, TimeZone, Utc};
use futures::TryStreamExt;
use linedb::{CascadeAction, Engine, EngineConfig, Entity, Error, Field, Key, Query, Schema, TrackingState};
use serde_json::Value;
use tempfile::tempdir;

#[derive(Debug, Clone, Default, PartialEq)]
struct Address {
    street: String,
    city: String,
}

impl Entity for Address {
    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<Address>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("Address", Address::default)
                .field(Field::scalar("street", |a: &Address| &a.street, |a: &mut Address, v| a.street = v))
                .field(Field::scalar("city", |a: &Address| &a.city, |a: &mut Address, v| a.city = v))
                .build()
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Customer {
    name: String,
    tier: i64,
    address: Option<Address>,
    orders: Vec<Order>,
    card: Option<Card>,
}

impl Customer {
    fn new(name: &str, tier: i64) -> Self {
        Self {
            name: name.to_string(),
            tier,
            ..Default::default()
        }
    }
}

impl Entity for Customer {
    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<Customer>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("Customer", Customer::default)
                .field(Field::scalar("name", |c: &Customer| &c.name, |c: &mut Customer, v| c.name = v))
                .field(Field::scalar("tier", |c: &Customer| &c.tier, |c: &mut Customer, v| c.tier = v))
                .field(Field::complex::<Address, _, _>(
                    "address",
                    |c: &Customer| c.address.as_ref(),
                    |c: &mut Customer, v| c.address = Some(v),
                ))
                .field(Field::virtual_list::<Order, _, _>(
                    "orders",
                    "customer_id",
                    |c: &Customer| &c.orders,
                    |c: &mut Customer, v| c.orders = v,
                ))
                .field(Field::virtual_one::<Card, _, _>(
                    "card",
                    "owner",
                    |c: &Customer| &c.card,
                    |c: &mut Customer, v| c.card = v,
                ))
                .build()
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Order {
    item: String,
    quantity: i64,
    placed_at: DateTime<Utc>,
    customer_id: Option<Key>,
}

impl Default for Order {
    fn default() -> Self {
        Self {
            item: String::new(),
            quantity: 0,
            placed_at: Utc.timestamp_opt(0, 0).unwrap(),
            customer_id: None,
        }
    }
}

impl Order {
    fn new(item: &str, quantity: i64, day: u32) -> Self {
        Self {
            item: item.to_string(),
            quantity,
            placed_at: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap(),
            customer_id: None,
        }
    }
}

impl Entity for Order {
    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<Order>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("Order", Order::default)
                .field(Field::scalar("item", |o: &Order| &o.item, |o: &mut Order, v| o.item = v))
                .field(Field::scalar("quantity", |o: &Order| &o.quantity, |o: &mut Order, v| o.quantity = v))
                .field(Field::scalar("placed_at", |o: &Order| &o.placed_at, |o: &mut Order, v| o.placed_at = v).datetime())
                .field(Field::reference("customer_id", |o: &Order| &o.customer_id, |o: &mut Order, v| o.customer_id = v))
                .build()
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Card {
    number: String,
    owner: Option<Key>,
}

impl Entity for Card {
    fn schema() -> &'static Schema<Self> {
        static SCHEMA: OnceLock<Schema<Card>> = OnceLock::new();
        SCHEMA.get_or_init(|| {
            Schema::builder("Card", Card::default)
                .field(Field::scalar("number", |c: &Card| &c.number, |c: &mut Card, v| c.number = v))
                .field(Field::reference("owner", |c: &Card| &c.owner, |c: &mut Card, v| c.owner = v))
                .build()
        })
    }
}

async fn open_shop(dir: &Path) -> Engine {
    let engine = Engine::open(EngineConfig::new(dir)).await.unwrap();
    engine.register::<Customer>().unwrap();
    engine.register::<Order>().unwrap();
    engine.register::<Card>().unwrap();
    engine
}

fn scratch_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter(|entry| entry.as_ref().unwrap().file_name().to_string_lossy().starts_with("__"))
        .count()
}

#[tokio::test]
async fn test_virtual_fields_are_stored_in_their_own_collection() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();
    let orders = engine.collection::<Order>().unwrap();

    let mut ada = Customer::new("Ada", 1);
    ada.orders = vec![Order::new("tea", 2, 1), Order::new("cake", 1, 2)];
    let handle = customers.add(ada);
    assert_eq!(customers.commit().await.unwrap(), 1);

    let customer_line = std::fs::read_to_string(customers.path()).unwrap();
    assert!(!customer_line.contains("orders"));
    assert!(customer_line.starts_with(&format!("{{\"__id\":\"{}\"", handle.key())));

    let stored: Vec<_> = orders.iterate().try_collect().await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|o| o.read().customer_id.as_ref() == Some(handle.key())));

    let loaded = customers.get(handle.key()).await.unwrap().unwrap();
    assert!(loaded.read().orders.is_empty());
    customers.load_virtual(&loaded, &["orders"]).await.unwrap();
    let items: Vec<String> = loaded.read().orders.iter().map(|o| o.item.clone()).collect();
    assert_eq!(items, vec!["tea", "cake"]);
    assert!(!customers.is_modified(&loaded).unwrap());
    assert_eq!(scratch_files(dir.path()), 0);
}

#[tokio::test]
async fn test_saving_again_replaces_related_records_in_order() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();
    let orders = engine.collection::<Order>().unwrap();

    let mut ada = Customer::new("Ada", 1);
    ada.orders = vec![Order::new("tea", 2, 1)];
    let key = customers.add(ada).key().clone();
    customers.commit().await.unwrap();
    let first_order_key = orders.iterate().try_next().await.unwrap().unwrap().key().clone();

    let loaded = customers.get(&key).await.unwrap().unwrap();
    customers.load_virtual(&loaded, &["orders"]).await.unwrap();
    {
        let mut customer = loaded.write();
        customer.orders[0].quantity = 5;
        customer.orders.push(Order::new("scone", 3, 4));
    }
    assert!(customers.is_modified(&loaded).unwrap());
    customers.commit().await.unwrap();

    let stored: Vec<_> = orders.iterate().try_collect().await.unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].key(), &first_order_key);
    assert_eq!(stored[0].read().quantity, 5);
    assert_eq!(stored[1].read().item, "scone");
}

#[tokio::test]
async fn test_values_pushed_to_an_unloaded_field_are_added() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();
    let orders = engine.collection::<Order>().unwrap();

    let mut ada = Customer::new("Ada", 1);
    ada.orders = vec![Order::new("tea", 2, 1), Order::new("cake", 1, 2)];
    let key = customers.add(ada).key().clone();
    customers.commit().await.unwrap();

    let loaded = customers.get(&key).await.unwrap().unwrap();
    loaded.write().orders.push(Order::new("scone", 3, 4));
    customers.commit().await.unwrap();

    let stored: Vec<_> = orders.iterate().try_collect().await.unwrap();
    let items: Vec<String> = stored.iter().map(|o| o.read().item.clone()).collect();
    assert_eq!(items, vec!["tea", "cake", "scone"]);
    assert_eq!(stored[0].read().quantity, 2);
    assert!(stored.iter().all(|o| o.read().customer_id.as_ref() == Some(&key)));
}

#[tokio::test]
async fn test_referenced_by_streams_related_records() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();

    let mut ada = Customer::new("Ada", 1);
    ada.orders = vec![Order::new("tea", 2, 1), Order::new("cake", 1, 2)];
    let ada = customers.add(ada);
    let mut bob = Customer::new("Bob", 2);
    bob.orders = vec![Order::new("coffee", 1, 3)];
    customers.add(bob);
    customers.commit().await.unwrap();

    let related: Vec<_> = customers
        .referenced_by::<Order>(&ada, "orders")
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(related.len(), 2);

    assert!(matches!(
        customers.referenced_by::<Card>(&ada, "orders"),
        Err(Error::MissingReferenceField { .. })
    ));
}

#[tokio::test]
async fn test_single_virtual_field() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();
    let cards = engine.collection::<Card>().unwrap();

    let mut ada = Customer::new("Ada", 1);
    ada.card = Some(Card {
        number: "4111".to_string(),
        owner: None,
    });
    let key = customers.add(ada).key().clone();
    let plain = customers.add(Customer::new("Bob", 1)).key().clone();
    customers.commit().await.unwrap();
    assert_eq!(cards.count().await.unwrap(), 1);

    let loaded = customers.get(&key).await.unwrap().unwrap();
    customers.load_virtual(&loaded, &["card"]).await.unwrap();
    assert_eq!(loaded.read().card.as_ref().map(|c| c.number.as_str()), Some("4111"));

    let without = customers.get(&plain).await.unwrap().unwrap();
    customers.load_virtual(&without, &["card"]).await.unwrap();
    assert!(without.read().card.is_none());

    // a single field replaces the card it owns even when it was never loaded
    let unloaded = customers.get(&key).await.unwrap().unwrap();
    unloaded.write().card = Some(Card {
        number: "5500".to_string(),
        owner: None,
    });
    customers.commit().await.unwrap();
    let stored: Vec<_> = cards.iterate().try_collect().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].read().number, "5500");
    assert_eq!(stored[0].read().owner.as_ref(), Some(&key));
}

#[tokio::test]
async fn test_delete_entity_cascade() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    engine.configure_cascade::<Customer>("orders", CascadeAction::DeleteEntity).unwrap();
    let customers = engine.collection::<Customer>().unwrap();
    let orders = engine.collection::<Order>().unwrap();

    let mut ada = Customer::new("Ada", 1);
    ada.orders = vec![Order::new("tea", 2, 1), Order::new("cake", 1, 2)];
    let ada = customers.add(ada);
    let mut bob = Customer::new("Bob", 2);
    bob.orders = vec![Order::new("coffee", 1, 3)];
    customers.add(bob);
    customers.commit().await.unwrap();
    assert_eq!(orders.count().await.unwrap(), 3);

    let loaded = customers.get(ada.key()).await.unwrap().unwrap();
    customers.delete(&loaded).unwrap();
    customers.commit().await.unwrap();

    let left: Vec<_> = orders.iterate().try_collect().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].read().item, "coffee");
}

#[tokio::test]
async fn test_delete_reference_cascade_from_config() {
    let dir = tempdir().unwrap();
    let config = EngineConfig::from_json(&format!(
        r#"{{"data_dir": {}, "cascades": {{"Customer": {{"orders": "delete_reference"}}}}}}"#,
        Value::String(dir.path().to_string_lossy().into_owned())
    ))
    .unwrap();
    let engine = Engine::open(config).await.unwrap();
    let customers = engine.register::<Customer>().unwrap();
    let orders = engine.register::<Order>().unwrap();
    engine.register::<Card>().unwrap();

    let mut ada = Customer::new("Ada", 1);
    ada.orders = vec![Order::new("tea", 2, 1)];
    customers.add(ada);
    customers.commit().await.unwrap();

    let deleted = customers.find_and_delete(&Query::eq("name", "Ada"), true).await.unwrap();
    assert_eq!(deleted, 1);

    let left: Vec<_> = orders.iterate().try_collect().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].read().customer_id, None);
}

#[tokio::test]
async fn test_ignore_is_the_default_cascade() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();
    let orders = engine.collection::<Order>().unwrap();

    let mut ada = Customer::new("Ada", 1);
    ada.orders = vec![Order::new("tea", 2, 1)];
    let key = customers.add(ada).key().clone();
    customers.commit().await.unwrap();

    let loaded = customers.get(&key).await.unwrap().unwrap();
    customers.delete(&loaded).unwrap();
    customers.commit().await.unwrap();

    let left = orders.iterate().try_next().await.unwrap().unwrap();
    assert_eq!(left.read().customer_id.as_ref(), Some(&key));
}

#[tokio::test]
async fn test_scans_see_a_snapshot() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();
    customers.add_range(vec![
        Customer::new("A", 1),
        Customer::new("B", 1),
        Customer::new("C", 1),
    ]);
    customers.commit().await.unwrap();

    let mut seen = 0;
    let mut scan = customers.iterate();
    while let Some(customer) = scan.try_next().await.unwrap() {
        if seen == 0 {
            let writer = engine.collection::<Customer>().unwrap();
            writer.add(Customer::new("late", 1));
            writer.commit().await.unwrap();
        }
        assert_ne!(customer.read().name, "late");
        seen += 1;
    }
    drop(scan);

    assert_eq!(seen, 3);
    assert_eq!(customers.count().await.unwrap(), 4);
    assert_eq!(scratch_files(dir.path()), 0);
}

#[tokio::test]
async fn test_queries_on_nested_and_datetime_fields() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();
    let orders = engine.collection::<Order>().unwrap();

    let mut ada = Customer::new("Ada", 1);
    ada.address = Some(Address {
        street: "1 Main".to_string(),
        city: "Lisbon".to_string(),
    });
    ada.orders = vec![Order::new("tea", 2, 1), Order::new("cake", 1, 20)];
    customers.add(ada);
    customers.add(Customer::new("Bob", 3));
    customers.commit().await.unwrap();

    let in_lisbon: Vec<_> = customers.find(&Query::eq("address.city", "Lisbon")).try_collect().await.unwrap();
    assert_eq!(in_lisbon.len(), 1);
    assert_eq!(in_lisbon[0].read().address.as_ref().unwrap().street, "1 Main");

    // Bob has no address, so he matches neither side
    let elsewhere = customers.queryable().filter(Query::ne("address.city", "Lisbon")).count().await.unwrap();
    assert_eq!(elsewhere, 0);

    let late = orders.get_first(&Query::gt("placed_at", "2024-03-10")).await.unwrap().unwrap();
    assert_eq!(late.read().item, "cake");

    let starts_with_b = customers.queryable().filter(Query::pattern("name", "^B").unwrap()).to_list().await.unwrap();
    assert_eq!(starts_with_b.len(), 1);

    let tiers = customers.queryable().filter(Query::member_of("tier", [1, 2])).count().await.unwrap();
    assert_eq!(tiers, 1);

    assert!(matches!(Query::pattern("name", "("), Err(Error::Pattern(_))));

    let through_virtual = customers.get_first(&Query::eq("orders.item", "tea")).await;
    assert!(matches!(through_virtual, Err(Error::NotQueryable { ref field, .. }) if field == "orders"));
}

#[tokio::test]
async fn test_queryable_include_loads_virtual_fields() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();

    let mut ada = Customer::new("Ada", 1);
    ada.orders = vec![Order::new("tea", 2, 1), Order::new("cake", 1, 2)];
    customers.add(ada);
    customers.add(Customer::new("Bob", 2));
    customers.commit().await.unwrap();

    let with_orders = customers
        .queryable()
        .filter(Query::eq("name", "Ada"))
        .include("orders")
        .first()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(with_orders.read().orders.len(), 2);
    assert_eq!(customers.state(&with_orders).unwrap(), TrackingState::Update);
    assert!(!customers.is_modified(&with_orders).unwrap());
}

#[tokio::test]
async fn test_find_and_update_does_not_store_virtual_fields() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();
    let orders = engine.collection::<Order>().unwrap();
    customers.add(Customer::new("Ada", 1));
    customers.commit().await.unwrap();

    let changed = customers
        .find_and_update(
            &Query::eq("name", "Ada"),
            |customer| {
                customer.tier = 9;
                customer.orders.push(Order::new("ignored", 1, 1));
            },
            false,
        )
        .await
        .unwrap();
    assert_eq!(changed, 1);
    assert_eq!(orders.count().await.unwrap(), 0);

    let text = std::fs::read_to_string(customers.path()).unwrap();
    assert!(text.contains("\"tier\":9"));
    assert!(!text.contains("ignored"));
}

#[tokio::test]
async fn test_pending_state_transitions() {
    let dir = tempdir().unwrap();
    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();

    let handle = customers.add(Customer::new("Ada", 1));
    customers.set_state(&handle, TrackingState::Delete).unwrap();
    // deleting a record that was never written is a no-op on disk
    customers.commit().await.unwrap();
    assert_eq!(customers.count().await.unwrap(), 0);
    assert!(!customers.is_tracked(&handle));

    let handles = customers.add_range(vec![Customer::new("A", 1), Customer::new("B", 1)]);
    assert!(customers.untrack(&handles[1]));
    customers.commit().await.unwrap();
    assert_eq!(customers.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_records_survive_reopening() {
    let dir = tempdir().unwrap();
    let key = {
        let engine = open_shop(dir.path()).await;
        let customers = engine.collection::<Customer>().unwrap();
        let key = customers.add(Customer::new("Ada", 1)).key().clone();
        customers.commit().await.unwrap();
        key
    };

    let engine = open_shop(dir.path()).await;
    let customers = engine.collection::<Customer>().unwrap();
    let loaded = customers.get(&key).await.unwrap().unwrap();
    assert_eq!(loaded.read().name, "Ada");
}

#[tokio::test]
async fn test_purge_removes_the_data_dir() {
    let dir = tempdir().unwrap();
    let data_dir = dir.path().join("shop");
    let engine = open_shop(&data_dir).await;
    let customers = engine.collection::<Customer>().unwrap();
    let mut ada = Customer::new("Ada", 1);
    ada.orders = vec![Order::new("tea", 2, 1)];
    customers.add(ada);
    customers.commit().await.unwrap();

    engine.purge().await.unwrap();
    assert!(!data_dir.exists());
    assert!(matches!(engine.collection::<Order>(), Err(Error::CollectionNotRegistered(_))));
}
