//! `dlq`: list dead-letter records

use collector::{DLQConfig, FileDeadLetterQueue};
use colored::Colorize;
use llm_telemetry_types::DeadLetterRecord;
use std::path::PathBuf;

pub async fn execute(path: PathBuf, limit: Option<usize>) -> anyhow::Result<()> {
    let queue = FileDeadLetterQueue::new(DLQConfig {
        file_path: path,
        ..DLQConfig::default()
    })?;
    let records = queue.read_all().await?;
    let shown = limit.unwrap_or(records.len()).min(records.len());

    println!(
        "{} {} record(s) in {}",
        "Dead letters:".bold(),
        records.len(),
        queue.directory().display()
    );
    for record in &records[records.len() - shown..] {
        print_record(record)?;
    }
    Ok(())
}

fn print_record(record: &DeadLetterRecord) -> anyhow::Result<()> {
    println!(
        "{}  {}  {}",
        record.received_at.to_rfc3339().dimmed(),
        record.reason.to_string().yellow(),
        record.id
    );
    println!("    {}", serde_json::to_string(&record.original_payload)?);
    Ok(())
}
