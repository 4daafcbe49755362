//! Offline chain audit: verify the ledger's hash chain and print the most
//! recent entries. Exits non-zero on any integrity failure.

use anyhow::Result;
use gridpulse::ledger::{LedgerFilter, LedgerStore, QueryOrder};
use serde_json::json;

fn main() -> Result<()> {
    let path = std::env::var("LEDGER_DB").unwrap_or_else(|_| "ledger.db".to_string());
    let limit: u64 = std::env::var("AUDIT_RECENT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);

    let store = LedgerStore::open(&path)?;
    store.init()?;

    let report = store.verify_chain()?;
    println!("{}", serde_json::to_string(&report)?);

    let recent = store.query(&LedgerFilter {
        limit,
        order: QueryOrder::Desc,
        ..Default::default()
    })?;
    for entry in recent {
        println!(
            "{}",
            json!({
                "block_index": entry.block_index,
                "event_type": entry.event_type,
                "severity": entry.severity.as_str(),
                "subject_id": entry.subject_id,
                "target_id": entry.target_id,
                "ts": entry.timestamp.to_rfc3339(),
                "block_hash": entry.block_hash,
            })
        );
    }

    if !report.valid {
        std::process::exit(1);
    }
    Ok(())
}
