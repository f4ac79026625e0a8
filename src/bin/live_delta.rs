/// live-delta CLI - watch live query diffs against a scripted in-memory store
///
/// Usage:
///   live-delta watch --fixture <file.json>   - Replay a fixture and print diffs
///   live-delta delta <query> [--params JSON] - Print the delta statement
///   live-delta tables <query>                - Print the tables a query reads
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use live_delta::view::{Filter, View};
use live_delta::{
    DeltaQuery, JsonValue, MemoryStore, ObserverConfig, Params, QueryRegistry, RegisterOptions,
    Row, RowsDiff, SqlTableExtractor, TableChange, TableObserver,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "live-delta")]
#[command(author, version, about = "Live query diffs over a scripted store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a fixture through a live query and print every diff
    ///
    /// The fixture declares tables, the query with the view that evaluates
    /// it, and a script of mutations applied one by one.
    ///
    /// Examples:
    ///   live-delta watch --fixture demos/fixture.json
    ///   live-delta watch --fixture demos/fixture.json --debounce-ms 10
    Watch {
        /// Path to the fixture file
        #[arg(short, long)]
        fixture: PathBuf,

        /// Key field (overrides the fixture and LIVE_DELTA_KEY_FIELD)
        #[arg(short, long)]
        key_field: Option<String>,

        /// Debounce window in milliseconds (overrides LIVE_DELTA_DEBOUNCE_MS)
        #[arg(short, long)]
        debounce_ms: Option<u64>,

        /// How long to wait for a diff after each mutation, beyond the debounce
        #[arg(long, default_value_t = 250)]
        settle_ms: u64,
    },

    /// Print the delta statement for a query
    ///
    /// Examples:
    ///   live-delta delta 'SELECT * FROM t WHERE id < $1' --params '[3]' --key-field id
    Delta {
        /// The query text
        query: String,

        /// Parameters as JSON (array or object)
        #[arg(short, long)]
        params: Option<String>,

        /// Key field
        #[arg(short, long, default_value = live_delta::DEFAULT_KEY_FIELD)]
        key_field: String,
    },

    /// Print the tables a query reads
    Tables {
        /// The query text
        query: String,
    },
}

#[derive(Debug, Deserialize)]
struct Fixture {
    tables: BTreeMap<String, TableFixture>,
    query: String,
    #[serde(default)]
    params: JsonValue,
    view: View,
    #[serde(default)]
    trigger: Option<Filter>,
    #[serde(default)]
    key_field: Option<String>,
    #[serde(default)]
    mutations: Vec<Mutation>,
}

#[derive(Debug, Deserialize)]
struct TableFixture {
    key: String,
    #[serde(default)]
    rows: Vec<Row>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum Mutation {
    Insert { table: String, row: Row },
    Update { table: String, row: Row },
    Delete { table: String, key: JsonValue },
}

impl Mutation {
    fn apply(&self, store: &MemoryStore) -> live_delta::LiveResult<()> {
        match self {
            Mutation::Insert { table, row } => store.insert(table, row.clone()),
            Mutation::Update { table, row } => store.update(table, row.clone()).map(|_| ()),
            Mutation::Delete { table, key } => store.delete(table, key).map(|_| ()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Mutation::Insert { table, row } => format!("insert into {} {}", table, row.to_json()),
            Mutation::Update { table, row } => format!("update {} {}", table, row.to_json()),
            Mutation::Delete { table, key } => format!("delete from {} key {}", table, key),
        }
    }
}

/// Load a fixture file
fn load_fixture(path: &std::path::Path) -> Result<Fixture> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read fixture {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid fixture {}", path.display()))
}

/// Print one diff
fn print_diff(diff: &RowsDiff) {
    for row in &diff.added {
        println!("  {} {}", "+".green().bold(), row.to_json().to_string().green());
    }
    for changed in &diff.changed {
        println!(
            "  {} {} {} {}",
            "~".yellow().bold(),
            changed.old.to_json().to_string().bright_black(),
            "->".yellow(),
            changed.new.to_json().to_string().yellow()
        );
    }
    for key in &diff.removed {
        println!("  {} key {}", "-".red().bold(), key.to_string().red());
    }
    if let Some(order) = &diff.order {
        let keys: Vec<String> = order.iter().map(|k| k.to_string()).collect();
        println!("  {} order [{}]", "#".cyan().bold(), keys.join(", ").cyan());
    }
}

async fn watch(
    fixture_path: PathBuf,
    key_field: Option<String>,
    debounce_ms: Option<u64>,
    settle_ms: u64,
) -> Result<()> {
    let fixture = load_fixture(&fixture_path)?;

    let mut config = ObserverConfig::from_env().context("Invalid environment configuration")?;
    if let Some(ms) = debounce_ms {
        config = config.debounce(Duration::from_millis(ms));
    }
    let key_field = key_field.or(fixture.key_field.clone());

    let observer = TableObserver::new();
    let store = MemoryStore::with_observer(observer.clone());
    for (name, table) in &fixture.tables {
        store.create_table(name.as_str(), table.key.as_str());
        for row in &table.rows {
            store
                .insert(name, row.clone())
                .with_context(|| format!("Failed to load table {}", name))?;
        }
    }
    store.define_view(&fixture.query, fixture.view.clone());

    let shared = Arc::new(store.clone());
    let registry = QueryRegistry::new(shared.clone(), shared, Arc::new(observer), config.clone())
        .context("Failed to create registry")?;

    let mut options = RegisterOptions::new();
    if let Some(key_field) = key_field {
        options = options.key_field(key_field);
    }

    let trigger = fixture.trigger.clone();
    let (diff_tx, mut diff_rx) = mpsc::unbounded_channel::<RowsDiff>();
    let params = Params::from(fixture.params.clone());

    let mut handle = registry
        .register_with(
            &fixture.query,
            params.clone(),
            options,
            move |change: &TableChange| match (&trigger, change.row()) {
                (Some(filter), Some(row)) => filter.matches(row, &Params::None),
                (Some(_), None) => false,
                (None, _) => true,
            },
            move |diff: &RowsDiff| {
                diff_tx.send(diff.clone())?;
                Ok(())
            },
        )
        .await
        .context("Failed to register live query")?;

    println!("{} {}", "Watching".bold(), fixture.query.trim().cyan());
    println!("  Query key: {}", handle.query_key().to_string().bright_black());
    let rows = handle.current_rows();
    println!("{} ({})", "Initial rows".bold(), rows.len());
    for row in &rows {
        println!("  {}", row.to_json());
    }

    let wait = config.debounce + Duration::from_millis(settle_ms);
    for (index, mutation) in fixture.mutations.iter().enumerate() {
        println!();
        println!("{} {}", format!("[{}]", index + 1).bold(), mutation.describe());
        if let Err(e) = mutation.apply(&store) {
            println!("  {} {}", "Error".red().bold(), e);
            continue;
        }

        match tokio::time::timeout(wait, diff_rx.recv()).await {
            Ok(Some(diff)) => print_diff(&diff),
            Ok(None) => break,
            Err(_) => println!("  {}", "no change".bright_black()),
        }
        while let Some(error) = handle.try_next_error() {
            println!("  {} {}", "Error".red().bold(), error);
        }
    }

    println!();
    let rows = handle.current_rows();
    println!("{} ({})", "Final rows".bold(), rows.len());
    for row in &rows {
        println!("  {}", row.to_json());
    }

    handle.stop().await?;
    registry.shutdown().await?;
    Ok(())
}

fn delta(query: &str, params: Option<&str>, key_field: &str) -> Result<()> {
    let params = match params {
        Some(text) => {
            let value: JsonValue = serde_json::from_str(text)
                .with_context(|| format!("Invalid JSON parameters: {}", text))?;
            Params::from(value)
        }
        None => Params::None,
    };
    let delta = DeltaQuery::build(query, &params, key_field)?;
    println!("{}", delta.sql());
    println!();
    println!("{} {}", "Hash placeholder:".bold(), delta.placeholder());
    Ok(())
}

fn tables(query: &str) -> Result<()> {
    let tables = SqlTableExtractor::new().extract(query)?;
    if tables.is_empty() {
        println!("{}", "No tables referenced".yellow());
    }
    for table in tables {
        println!("{}", table);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Watch {
            fixture,
            key_field,
            debounce_ms,
            settle_ms,
        } => watch(fixture, key_field, debounce_ms, settle_ms).await,
        Commands::Delta {
            query,
            params,
            key_field,
        } => delta(&query, params.as_deref(), &key_field),
        Commands::Tables { query } => tables(&query),
    }
}
