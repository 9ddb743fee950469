//! Deterministic demo dataset: customers, products, orders and order items.
//!
//! Seeding is idempotent per table: a table that already has rows is left
//! alone unless `reset` clears everything first.

use crate::{Database, DatabaseError};
use chrono::{Duration, NaiveDate};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde_json::{Value, json};
use tracing::info;

const SEED: u64 = 42;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS customers (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        city TEXT,
        signup_date TEXT
    )",
    "CREATE TABLE IF NOT EXISTS products (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        category TEXT,
        price REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS orders (
        id INTEGER PRIMARY KEY,
        customer_id INTEGER NOT NULL REFERENCES customers(id),
        order_date TEXT NOT NULL,
        total REAL NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS order_items (
        id INTEGER PRIMARY KEY,
        order_id INTEGER NOT NULL REFERENCES orders(id),
        product_id INTEGER NOT NULL REFERENCES products(id),
        quantity INTEGER NOT NULL,
        unit_price REAL NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_orders_customer ON orders(customer_id)",
    "CREATE INDEX IF NOT EXISTS idx_items_order ON order_items(order_id)",
    "CREATE INDEX IF NOT EXISTS idx_items_product ON order_items(product_id)",
];

/// Child tables first, so foreign keys never dangle.
const RESET: &[&str] = &[
    "DELETE FROM order_items",
    "DELETE FROM orders",
    "DELETE FROM products",
    "DELETE FROM customers",
];

const FIRST_NAMES: &[&str] = &[
    "Alice", "Bob", "Carol", "Dave", "Eve", "Frank", "Grace", "Heidi", "Ivan", "Judy", "Mallory",
    "Niaj", "Olivia", "Peggy", "Rupert", "Sybil", "Trent", "Uma", "Victor", "Wendy", "Xavier",
    "Yasmin", "Zane",
];
const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Williams", "Brown", "Jones", "Miller", "Davis", "Garcia", "Rodriguez",
    "Wilson", "Martinez", "Anderson", "Taylor", "Thomas", "Hernandez", "Moore", "Martin",
    "Jackson", "Thompson", "White",
];
const CITIES: &[&str] = &[
    "New York", "San Francisco", "Los Angeles", "Seattle", "Chicago", "Boston", "Austin",
    "Denver", "Miami", "Atlanta",
];
const ADJECTIVES: &[&str] = &[
    "Smart", "Ultra", "Pro", "Nano", "Eco", "Rapid", "Prime", "Lite", "Max", "Quantum", "Hyper",
    "Fusion", "Terra", "Aero", "Aqua",
];
const NOUNS: &[&str] = &[
    "Widget", "Gizmo", "Device", "Hub", "Sensor", "Cable", "Charger", "Adapter", "Module", "Panel",
    "Kit", "Bundle", "Service", "Subscription", "License",
];

/// Category and its price range.
const CATEGORIES: &[(&str, f64, f64)] = &[
    ("Gadgets", 20.0, 120.0),
    ("Accessories", 5.0, 40.0),
    ("Services", 50.0, 200.0),
    ("Software", 30.0, 150.0),
    ("Hardware", 80.0, 400.0),
    ("Apparel", 10.0, 90.0),
];

/// How much demo data to create.
#[derive(Debug, Clone, Copy)]
pub struct SeedOptions {
    pub reset: bool,
    pub customers: usize,
    pub products: usize,
    pub orders: usize,
}

impl Default for SeedOptions {
    fn default() -> Self {
        Self {
            reset: false,
            customers: 50,
            products: 40,
            orders: 300,
        }
    }
}

/// Rows inserted per table by one seeding run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub customers: usize,
    pub products: usize,
    pub orders: usize,
    pub order_items: usize,
}

/// Create the demo schema and fill any empty table.
pub async fn seed(db: &Database, options: &SeedOptions) -> Result<SeedReport, DatabaseError> {
    let schema: Vec<(&str, Value)> = SCHEMA.iter().map(|s| (*s, Value::Null)).collect();
    db.execute_many(&schema).await?;

    if options.reset {
        let reset: Vec<(&str, Value)> = RESET.iter().map(|s| (*s, Value::Null)).collect();
        db.execute_many(&reset).await?;
        info!("Cleared existing demo data");
    }

    let mut rng = StdRng::seed_from_u64(SEED);
    let mut report = SeedReport::default();

    if count(db, "customers").await? == 0 {
        let start = date(2023, 1, 1)?;
        let end = date(2025, 1, 1)?;
        let mut rows = Vec::with_capacity(options.customers);
        for id in 1..=options.customers {
            let name = format!("{} {}", pick(&mut rng, FIRST_NAMES), pick(&mut rng, LAST_NAMES));
            let city = pick(&mut rng, CITIES);
            let signup = random_date(&mut rng, start, end);
            rows.push((
                "INSERT INTO customers (id, name, city, signup_date) VALUES (?, ?, ?, ?)",
                json!([id, name, city, signup]),
            ));
        }
        db.execute_many(&rows).await?;
        report.customers = rows.len();
    }

    if count(db, "products").await? == 0 {
        let mut rows = Vec::with_capacity(options.products);
        for id in 1..=options.products {
            let name = format!("{} {}", pick(&mut rng, ADJECTIVES), pick(&mut rng, NOUNS));
            let &(category, low, high) = CATEGORIES.choose(&mut rng).unwrap_or(&CATEGORIES[0]);
            let price = round2(rng.random_range(low..=high));
            rows.push((
                "INSERT INTO products (id, name, category, price) VALUES (?, ?, ?, ?)",
                json!([id, name, category, price]),
            ));
        }
        db.execute_many(&rows).await?;
        report.products = rows.len();
    }

    if count(db, "orders").await? == 0 {
        let customer_ids: Vec<i64> = db
            .query("SELECT id FROM customers ORDER BY id", &Value::Null, usize::MAX)
            .await?
            .rows
            .iter()
            .filter_map(|r| r.first().and_then(Value::as_i64))
            .collect();
        let products: Vec<(i64, f64)> = db
            .query("SELECT id, price FROM products ORDER BY id", &Value::Null, usize::MAX)
            .await?
            .rows
            .iter()
            .filter_map(|r| Some((r.first()?.as_i64()?, r.get(1)?.as_f64()?)))
            .collect();

        if customer_ids.is_empty() || products.is_empty() {
            return Ok(report);
        }

        let start = date(2024, 1, 1)?;
        let end = date(2025, 6, 30)?;
        let mut rows = Vec::new();
        let mut item_id = 1;
        for order_id in 1..=options.orders {
            let customer = customer_ids.choose(&mut rng).copied().unwrap_or(customer_ids[0]);
            let order_date = random_date(&mut rng, start, end);
            rows.push((
                "INSERT INTO orders (id, customer_id, order_date, total) VALUES (?, ?, ?, 0)",
                json!([order_id, customer, order_date]),
            ));

            let mut total = 0.0;
            for _ in 0..rng.random_range(1..=5) {
                let (product_id, base_price) = products.choose(&mut rng).copied().unwrap_or(products[0]);
                let quantity: i64 = rng.random_range(1..=3);
                // occasional discount or markup of up to 10%
                let unit_price = round2(base_price * rng.random_range(0.9..=1.1));
                total += quantity as f64 * unit_price;
                rows.push((
                    "INSERT INTO order_items (id, order_id, product_id, quantity, unit_price) VALUES (?, ?, ?, ?, ?)",
                    json!([item_id, order_id, product_id, quantity, unit_price]),
                ));
                item_id += 1;
                report.order_items += 1;
            }
            rows.push((
                "UPDATE orders SET total = ? WHERE id = ?",
                json!([round2(total), order_id]),
            ));
        }
        db.execute_many(&rows).await?;
        report.orders = options.orders;
    }

    info!(
        customers = report.customers,
        products = report.products,
        orders = report.orders,
        order_items = report.order_items,
        "Seed complete"
    );
    Ok(report)
}

async fn count(db: &Database, table: &str) -> Result<i64, DatabaseError> {
    let result = db
        .query(&format!("SELECT COUNT(*) FROM {table}"), &Value::Null, 1)
        .await?;
    Ok(result
        .rows
        .first()
        .and_then(|r| r.first())
        .and_then(Value::as_i64)
        .unwrap_or(0))
}

fn pick(rng: &mut StdRng, pool: &[&'static str]) -> &'static str {
    pool.choose(rng).copied().unwrap_or_default()
}

fn date(y: i32, m: u32, d: u32) -> Result<NaiveDate, DatabaseError> {
    NaiveDate::from_ymd_opt(y, m, d)
        .ok_or_else(|| DatabaseError::Query(format!("invalid seed date {y}-{m}-{d}")))
}

fn random_date(rng: &mut StdRng, start: NaiveDate, end: NaiveDate) -> String {
    let span = (end - start).num_days();
    (start + Duration::days(rng.random_range(0..=span))).to_string()
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
