//! # Seed Data Generator
//!
//! Populates a local store with demo inventory records so a sync round has
//! something to publish.
//!
//! ## Usage
//! ```bash
//! # Generate 200 parts (default) plus trucks and jobs
//! cargo run -p wiredpart-db --bin seed
//!
//! # Generate custom amount into a specific database
//! cargo run -p wiredpart-db --bin seed -- --count 1000 --db ./data/wiredpart.db
//! ```
//!
//! ## Generated Records
//! - `parts`: `P-0001` ... with name, category, quantity and unit cost
//! - `trucks`: a handful of service trucks
//! - `jobs`: open jobs, one per truck
//!
//! Every record is stamped with this store's own device id.

use chrono::Utc;
use serde_json::json;
use std::env;
use wiredpart_core::Fields;
use wiredpart_db::{Database, DbConfig};

/// Part families for realistic demo data
const PART_FAMILIES: &[(&str, &[&str])] = &[
    (
        "wire",
        &[
            "12/2 NM-B Romex 250ft",
            "14/2 NM-B Romex 250ft",
            "10/3 NM-B Romex 100ft",
            "THHN 12 AWG Black 500ft",
            "THHN 12 AWG White 500ft",
        ],
    ),
    (
        "boxes",
        &[
            "Single Gang Old Work Box",
            "Double Gang New Work Box",
            "4in Square Box 2-1/8 Deep",
            "Weatherproof Box 1-Gang",
        ],
    ),
    (
        "devices",
        &[
            "15A Duplex Receptacle",
            "20A GFCI Receptacle",
            "Single Pole Switch",
            "3-Way Switch",
            "Dimmer 600W",
        ],
    ),
    (
        "breakers",
        &[
            "15A Single Pole Breaker",
            "20A Single Pole Breaker",
            "30A Double Pole Breaker",
            "20A AFCI Breaker",
        ],
    ),
    (
        "fittings",
        &[
            "1/2in EMT Connector",
            "1/2in EMT Coupling",
            "Wire Nut Yellow (100)",
            "Wire Nut Red (100)",
        ],
    ),
];

const TRUCKS: &[&str] = &["Truck 1", "Truck 2", "Truck 3", "Van 1"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 200;
    let mut db_path = String::from("./wiredpart_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--count" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(200);
                    i += 1;
                }
            }
            "-d" | "--db" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "-h" | "--help" => {
                println!("WiredPart Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of parts to generate (default: 200)");
                println!("  -d, --db <PATH>    Database file path (default: ./wiredpart_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 WiredPart Seed Data Generator");
    println!("================================");
    println!("Database: {}", db_path);
    println!("Parts:    {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let device_id = db.sync_state().device_id().await?;

    println!("✓ Connected to database");
    println!("✓ Migrations applied");
    println!("✓ Device id: {}", device_id);

    let existing = db.records().count_live("parts").await?;
    if existing > 0 {
        println!("⚠ Database already has {} parts", existing);
        println!("  Skipping seed to avoid duplicates.");
        return Ok(());
    }

    println!();
    println!("Generating records...");
    let start = std::time::Instant::now();
    let records = db.records();

    let mut generated = 0;
    'outer: for (family_idx, (family, names)) in PART_FAMILIES.iter().enumerate() {
        for round in 0.. {
            for (name_idx, name) in names.iter().enumerate() {
                if generated >= count {
                    break 'outer;
                }
                if round > 0 && generated >= (family_idx + 1) * count / PART_FAMILIES.len() {
                    continue 'outer;
                }

                generated += 1;
                let record_id = format!("P-{:04}", generated);
                let fields = part_fields(family, name, round, name_idx);
                if let Err(e) = records
                    .upsert_local("parts", &record_id, fields, &device_id, Utc::now())
                    .await
                {
                    eprintln!("Failed to insert {}: {}", record_id, e);
                }
            }
        }
    }

    for (idx, truck) in TRUCKS.iter().enumerate() {
        let truck_id = format!("T-{}", idx + 1);
        let mut fields = Fields::new();
        fields.insert("name".into(), json!(truck));
        fields.insert("active".into(), json!(true));
        records
            .upsert_local("trucks", &truck_id, fields, &device_id, Utc::now())
            .await?;

        let mut job = Fields::new();
        job.insert("job_number".into(), json!(format!("J-{:03}", idx + 1)));
        job.insert("status".into(), json!("open"));
        job.insert("truck_id".into(), json!(truck_id));
        records
            .upsert_local("jobs", &format!("J-{}", idx + 1), job, &device_id, Utc::now())
            .await?;
    }

    let elapsed = start.elapsed();
    println!();
    println!(
        "✓ Generated {} parts, {} trucks, {} jobs in {:?}",
        generated,
        TRUCKS.len(),
        TRUCKS.len(),
        elapsed
    );

    Ok(())
}

/// Builds a deterministic part payload.
fn part_fields(family: &str, name: &str, round: usize, name_idx: usize) -> Fields {
    let mut fields = Fields::new();
    let display = if round == 0 {
        name.to_string()
    } else {
        format!("{} (lot {})", name, round + 1)
    };
    fields.insert("name".into(), json!(display));
    fields.insert("category".into(), json!(family));
    fields.insert("quantity".into(), json!((round * 7 + name_idx * 3) % 50));
    fields.insert("unit_cost_cents".into(), json!(99 + (name_idx as i64) * 125));
    fields
}
