//! `state`: read-only view of a sled state store

use colored::Colorize;
use processor::{AggregationStateStore, SledConfig, SledStateStore};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub async fn execute(path: PathBuf) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("no state store at {}", path.display());
    }
    let store = SledStateStore::open(SledConfig::new(&path)).await?;

    println!("{}", "Offset cursors".bold());
    let offsets: BTreeMap<_, _> = store.load_offsets().await?.into_iter().collect();
    if offsets.is_empty() {
        println!("  (none)");
    }
    for (partition, cursor) in &offsets {
        let max_event_time = cursor
            .max_event_time
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  partition {:>3}  offset {:>10}  max event time {}",
            partition, cursor.offset, max_event_time
        );
    }

    println!("{}", "Open windows".bold());
    let open = store.open_windows().await?;
    if open.is_empty() {
        println!("  (none)");
    }
    for window in &open {
        let partitions: Vec<String> = window.partitions.iter().map(u32::to_string).collect();
        println!(
            "  {}  count {}  partitions [{}]",
            window.key,
            window.count,
            partitions.join(",")
        );
    }

    println!("{}", "Pending emissions".bold());
    let pending = store.pending_emissions().await?;
    if pending.is_empty() {
        println!("  (none)");
    }
    for row in &pending {
        println!(
            "  {} {}  count {}",
            row.window_start.to_rfc3339().yellow(),
            row.dimension_key,
            row.count
        );
    }

    match store.verify().await {
        Ok(report) => println!(
            "{} {}",
            "Verified:".green().bold(),
            serde_json::to_string(&report)?
        ),
        Err(e) => println!("{} {}", "Verification failed:".red().bold(), e),
    }
    Ok(())
}
