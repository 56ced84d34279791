//! `check-config`: validate and print the effective configuration

use colored::Colorize;
use llm_telemetry_config::PipelineConfig;

pub fn execute(config: &PipelineConfig) -> anyhow::Result<()> {
    config.validate()?;
    println!("{}", serde_json::to_string_pretty(config)?);
    eprintln!("{}", "Configuration is valid".green());
    Ok(())
}
