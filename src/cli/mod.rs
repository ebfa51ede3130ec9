//! Command line interface for the xDS translator
//!
//! `translate` turns an IR document into a snapshot summary of the generated
//! xDS resources; `filters` lists the HTTP filter families and their position
//! in the filter chain.

pub mod output;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use crate::config::{load_settings, TranslatorSettings};
use crate::ir::Xds;
use crate::observability::{init_logging, LogFormat};
use crate::xds::filters::http::{filter_priority, FilterRegistry, FilterType};
use crate::xds::{Translation, Translator};

pub use output::OutputFormat;

#[derive(Parser)]
#[command(name = "xds-translator")]
#[command(about = "Translate gateway IR into Envoy xDS resources")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Translate an IR file and print the resulting resource snapshot
    Translate {
        /// IR document (YAML)
        #[arg(long, value_name = "FILE")]
        ir: PathBuf,

        /// Translator settings file (YAML)
        #[arg(long, value_name = "FILE")]
        settings: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Yaml)]
        output: OutputFormat,
    },

    /// List the HTTP filter families with their ordering priority
    Filters {
        /// Translator settings file (YAML)
        #[arg(long, value_name = "FILE")]
        settings: Option<PathBuf>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Yaml)]
        output: OutputFormat,
    },
}

/// Row printed by the `filters` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilterInfo {
    pub name: String,
    pub priority: u32,
    pub registered: bool,
}

/// Run CLI commands
pub fn run_cli() -> anyhow::Result<()> {
    execute(Cli::parse())
}

pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let format = if cli.json_logs { LogFormat::Json } else { LogFormat::Text };
    init_logging(default_level, format);

    match cli.command {
        Commands::Translate { ir, settings, output } => {
            handle_translate(&ir, settings.as_deref(), output)
        }
        Commands::Filters { settings, output } => {
            let settings = resolve_settings(settings.as_deref())?;
            output::print_output(&filter_table(&settings), output)
        }
    }
}

fn resolve_settings(path: Option<&Path>) -> anyhow::Result<TranslatorSettings> {
    load_settings(path).with_context(|| match path {
        Some(path) => format!("Failed to load settings from {}", path.display()),
        None => "Failed to load settings from the environment".to_string(),
    })
}

/// Read an IR document from disk.
pub fn read_ir(path: &Path) -> anyhow::Result<Xds> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read IR file {}", path.display()))?;
    Xds::from_yaml(&content).with_context(|| format!("Failed to parse IR file {}", path.display()))
}

/// Translate the IR at `ir_path` with the given settings file.
pub fn translate_file(ir_path: &Path, settings_path: Option<&Path>) -> anyhow::Result<Translation> {
    let settings = resolve_settings(settings_path)?;
    let ir = read_ir(ir_path)?;
    Translator::new(settings).translate(&ir).context("Translation aborted")
}

fn handle_translate(
    ir_path: &Path,
    settings_path: Option<&Path>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let translation = translate_file(ir_path, settings_path)?;
    output::print_output(&translation.table.snapshot(), format)?;

    if translation.has_errors() {
        for error in translation.errors.iter() {
            eprintln!("error: {error}");
        }
        anyhow::bail!("translation reported {} error(s)", translation.errors.len());
    }

    info!(ir = %ir_path.display(), "Translation completed without errors");
    Ok(())
}

/// Every filter family in chain order. The router is always present.
pub fn filter_table(settings: &TranslatorSettings) -> Vec<FilterInfo> {
    let registry = FilterRegistry::new(settings);
    let mut rows: Vec<FilterInfo> = FilterType::ALL
        .into_iter()
        .map(|filter_type| FilterInfo {
            name: filter_type.filter_name().to_string(),
            priority: filter_priority(filter_type.filter_name()),
            registered: filter_type == FilterType::Router
                || registry.filters().any(|plugin| plugin.filter_type() == filter_type),
        })
        .collect();
    rows.sort_by_key(|row| row.priority);
    rows
}
