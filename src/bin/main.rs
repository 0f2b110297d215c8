//! metricsview CLI - Compile metrics view queries to SQL
//!
//! Usage:
//!   metricsview compile --view <view.json> --query <query.json> [--dialect <dialect>] [--format <format>]
//!   metricsview fields --query <query.json>
//!
//! Examples:
//!   metricsview compile --view sales.json --query top_countries.json
//!   metricsview compile --view sales.json --query top_countries.json --dialect druid --format json

use clap::{Parser, Subcommand, ValueEnum};
use metricsview::ast::Ast;
use metricsview::config::Settings;
use metricsview::executor::apply_static_passes;
use metricsview::model::{MetricsViewSpec, Query, ResolvedSecurity};
use metricsview::sql::Dialect;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "metricsview")]
#[command(about = "metricsview - Compile metrics view queries into dialect-correct SQL")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a query against a metrics view to SQL
    Compile {
        /// Path to the metrics view JSON
        #[arg(long)]
        view: PathBuf,

        /// Path to the query JSON
        #[arg(long)]
        query: PathBuf,

        /// SQL dialect to generate
        #[arg(short, long, default_value = "duckdb")]
        dialect: DialectArg,

        /// Output format
        #[arg(short, long, default_value = "sql")]
        format: OutputFormat,

        /// Settings file (defaults to the standard search path)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List the metrics view fields a query references
    Fields {
        /// Path to the query JSON
        #[arg(long)]
        query: PathBuf,
    },
}

#[derive(Clone, ValueEnum)]
enum DialectArg {
    Duckdb,
    Druid,
    Clickhouse,
    Pinot,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Duckdb => Dialect::DuckDb,
            DialectArg::Druid => Dialect::Druid,
            DialectArg::Clickhouse => Dialect::ClickHouse,
            DialectArg::Pinot => Dialect::Pinot,
        }
    }
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// SQL followed by its args as a comment
    Sql,
    /// A JSON object with `sql` and `args`
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            view,
            query,
            dialect,
            format,
            config,
        } => cmd_compile(view, query, dialect, format, config),
        Commands::Fields { query } => cmd_fields(query),
    }
}

fn cmd_compile(
    view: PathBuf,
    query: PathBuf,
    dialect: DialectArg,
    format: OutputFormat,
    config: Option<PathBuf>,
) -> ExitCode {
    let Some(mv) = read_json::<MetricsViewSpec>(&view) else {
        return ExitCode::FAILURE;
    };
    let Some(qry) = read_json::<Query>(&query) else {
        return ExitCode::FAILURE;
    };

    let settings = match config {
        Some(path) => Settings::from_file(&path),
        None => Settings::load(),
    };
    let settings = match settings {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading settings: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = qry.validate() {
        eprintln!("Invalid query: {}", e);
        return ExitCode::FAILURE;
    }

    let security = ResolvedSecurity::open();
    let compiled = Ast::with_time_spine_max_bins(
        &mv,
        &security,
        &qry,
        dialect.into(),
        settings.executor.time_spine_max_bins,
    )
    .and_then(|mut ast| {
        apply_static_passes(&mut ast, &settings.executor)?;
        ast.sql()
    });

    match compiled {
        Ok((sql, args)) => {
            match format {
                OutputFormat::Sql => {
                    println!("{}", sql);
                    if !args.is_empty() {
                        let args = serde_json::to_string(&args).unwrap_or_default();
                        println!("-- args: {}", args);
                    }
                }
                OutputFormat::Json => {
                    let out = serde_json::json!({ "sql": sql, "args": args });
                    println!("{:#}", out);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Compilation error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn cmd_fields(query: PathBuf) -> ExitCode {
    let Some(qry) = read_json::<Query>(&query) else {
        return ExitCode::FAILURE;
    };

    for field in qry.analyze_fields() {
        println!("{}", field);
    }
    ExitCode::SUCCESS
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error reading file '{}': {}", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str(&source) {
        Ok(v) => Some(v),
        Err(e) => {
            eprintln!("Error parsing '{}': {}", path.display(), e);
            None
        }
    }
}
