//! Chain integrity under concurrent publishers: gapless indices, valid
//! linkage, and the ledger's independence from other failing subscribers.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;

use gridpulse::bus::{EventBus, EventHandler};
use gridpulse::events::{EventKind, PlatformEvent};
use gridpulse::ledger::{LedgerFilter, LedgerStore, LedgerWriter, QueryOrder, GENESIS_HASH};

struct Failing;

#[async_trait]
impl EventHandler for Failing {
    async fn handle(&self, _event: PlatformEvent) -> anyhow::Result<()> {
        Err(anyhow!("flaky subscriber"))
    }
}

fn energy_event(n: u64) -> PlatformEvent {
    PlatformEvent::new(
        "meter",
        EventKind::EnergyConsumed {
            gpu_id: format!("gpu-{}", n),
            provider_id: format!("prov-{}", n % 3),
            kwh: 0.5 + n as f64,
        },
    )
}

#[tokio::test]
async fn concurrent_appends_yield_gapless_total_order() {
    let bus = EventBus::new();
    let writer = Arc::new(LedgerWriter::new(LedgerStore::open_in_memory().unwrap()).unwrap());
    bus.subscribe_all("ledger", writer.clone()).await;

    let publishers = 10u64;
    let per_publisher = 5u64;
    let mut tasks = Vec::new();
    for p in 0..publishers {
        let bus = bus.clone();
        tasks.push(tokio::spawn(async move {
            for n in 0..per_publisher {
                bus.publish(energy_event(p * per_publisher + n)).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let total = publishers * per_publisher;
    assert_eq!(writer.len().await.unwrap(), total);

    let entries = writer
        .query(&LedgerFilter {
            limit: 1000,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(entries.len(), total as usize);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.block_index, i as u64, "index gap or duplicate at {}", i);
        assert_eq!(entry.sequence, entry.block_index);
        if i == 0 {
            assert_eq!(entry.prev_hash, GENESIS_HASH);
        } else {
            assert_eq!(entry.prev_hash, entries[i - 1].block_hash);
        }
    }

    let report = writer.verify_chain().await.unwrap();
    assert!(report.valid);
    assert_eq!(report.entries_checked, total);
}

#[tokio::test]
async fn ledger_records_everything_despite_failing_neighbors() {
    let bus = EventBus::new();
    let writer = Arc::new(LedgerWriter::new(LedgerStore::open_in_memory().unwrap()).unwrap());
    bus.subscribe_all("ledger", writer.clone()).await;
    bus.subscribe_all("flaky", Arc::new(Failing)).await;

    for n in 0..20 {
        bus.publish(energy_event(n)).await;
    }

    assert_eq!(writer.len().await.unwrap(), 20);
    assert!(writer.verify_chain().await.unwrap().valid);
    let stats = bus.stats();
    assert_eq!(stats.events_delivered, 20);
    assert_eq!(stats.events_dropped, 20);
}

#[tokio::test]
async fn recent_first_query_pairs_with_chain_order() {
    let writer = LedgerWriter::new(LedgerStore::open_in_memory().unwrap()).unwrap();
    for n in 0..6 {
        writer.append(&energy_event(n)).await.unwrap();
    }
    let recent = writer
        .query(&LedgerFilter {
            limit: 3,
            order: QueryOrder::Desc,
            ..Default::default()
        })
        .await
        .unwrap();
    let indices: Vec<u64> = recent.iter().map(|e| e.block_index).collect();
    assert_eq!(indices, vec![5, 4, 3]);
}
