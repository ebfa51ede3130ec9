//! Output formatting for CLI commands

use anyhow::Context;
use clap::ValueEnum;
use serde::Serialize;

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    #[value(alias = "yml")]
    Yaml,
    Json,
}

/// Render data in the requested format
pub fn render<T: Serialize>(data: &T, format: OutputFormat) -> anyhow::Result<String> {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(data).context("Failed to serialize to JSON")
        }
        OutputFormat::Yaml => serde_yaml::to_string(data).context("Failed to serialize to YAML"),
    }
}

/// Print data to stdout in the requested format
pub fn print_output<T: Serialize>(data: &T, format: OutputFormat) -> anyhow::Result<()> {
    let rendered = render(data, format)?;
    println!("{}", rendered.trim_end());
    Ok(())
}
