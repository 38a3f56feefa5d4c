//! # Seed Data Generator
//!
//! Creates a development floor plan: numbered free tables for one branch.
//!
//! ## Usage
//! ```bash
//! # 20 tables for the default dev tenant
//! cargo run -p comanda-db --bin seed
//!
//! # Custom amount, branch and database
//! cargo run -p comanda-db --bin seed -- --count 40 --branch terrace --db ./data/comanda.db
//! ```
//!
//! Capacities cycle through 2, 4, 4, 6 so the plan looks like a real room.
//! Existing table numbers are skipped, so re-running is harmless.

use std::env;

use comanda_db::{Database, DbConfig, DbError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEV_RESTAURANT_ID: &str = "00000000-0000-0000-0000-000000000001";
const DEV_BRANCH_ID: &str = "main";
const CAPACITIES: [i64; 4] = [2, 4, 4, 6];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = env::args().collect();

    let mut count: i64 = 20;
    let mut db_path = String::from("./comanda_dev.db");
    let mut restaurant_id = String::from(DEV_RESTAURANT_ID);
    let mut branch_id = String::from(DEV_BRANCH_ID);

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match (args[i].as_str(), value) {
            ("--count" | "-c", Some(v)) => {
                count = v.parse().unwrap_or(20);
                i += 1;
            }
            ("--db" | "-d", Some(v)) => {
                db_path = v;
                i += 1;
            }
            ("--restaurant" | "-r", Some(v)) => {
                restaurant_id = v;
                i += 1;
            }
            ("--branch" | "-b", Some(v)) => {
                branch_id = v;
                i += 1;
            }
            ("--help" | "-h", _) => {
                println!("Comanda floor plan seeder");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>          Number of tables (default: 20)");
                println!("  -d, --db <PATH>          Database file (default: ./comanda_dev.db)");
                println!("  -r, --restaurant <ID>    Restaurant id (default: dev tenant)");
                println!("  -b, --branch <ID>        Branch id (default: main)");
                println!("  -h, --help               Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    info!(db = %db_path, restaurant = %restaurant_id, branch = %branch_id, count, "Seeding tables");

    let db = Database::new(DbConfig::new(&db_path)).await?;

    let mut created = 0;
    for number in 1..=count {
        let capacity = CAPACITIES[(number as usize - 1) % CAPACITIES.len()];
        match db
            .tables()
            .create(&restaurant_id, &branch_id, number, capacity)
            .await
        {
            Ok(table) => {
                created += 1;
                info!(number, id = %table.id, capacity, "Table created");
            }
            Err(DbError::UniqueViolation { .. }) => {
                warn!(number, "Table number already exists, skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut conn = db.pool().acquire().await?;
    let stats = db
        .tables()
        .statistics(&mut conn, &restaurant_id, &branch_id)
        .await?;
    info!(created, total = stats.total, free = stats.free, "Seed complete");

    Ok(())
}
