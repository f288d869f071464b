//! `xedocs`: command-line front-end for a correction store.
//!
//! Results go to stdout as JSON; logs go to stderr.

use std::collections::HashMap;
use std::env;
use std::io::{self, Read};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::debug;

use xedocs::record::parse_time;
use xedocs::{
    CorrectionRecord, CorrectionStore, GroupKey, Label, Labels, Query, RecordKey, SchemaRegistry,
    Span, StaticRunRegistry, StoreConfig,
};

const DEFAULT_DB_PATH: &str = "./xedocs.redb";

#[derive(Parser)]
#[command(
    name = "xedocs",
    about = "Query and edit time-varying detector corrections",
    version
)]
struct Cli {
    /// Evaluate the cutoff as if it were this instant (RFC 3339).
    #[arg(long, global = true, value_parser = parse_instant)]
    now: Option<DateTime<Utc>>,

    /// JSON file mapping run ids to `{"left": .., "right": ..}` spans.
    #[arg(long, global = true)]
    runs: Option<String>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up values of a correction.
    Find {
        #[command(flatten)]
        selector: Selector,

        /// Evaluate at this instant (RFC 3339).
        #[arg(long, value_parser = parse_instant, conflicts_with_all = ["from", "run"])]
        at: Option<DateTime<Utc>>,

        /// Start of a range query (RFC 3339, inclusive).
        #[arg(long, value_parser = parse_instant, requires = "to", conflicts_with = "run")]
        from: Option<DateTime<Utc>>,

        /// End of a range query (RFC 3339, exclusive).
        #[arg(long, value_parser = parse_instant, requires = "from")]
        to: Option<DateTime<Utc>>,

        /// Evaluate at a run id.
        #[arg(long)]
        run: Option<String>,

        /// Resolve one value per value of this label.
        #[arg(long)]
        per_label: Option<String>,
    },

    /// Insert or update a record from a flat JSON document (stdin if omitted).
    Insert {
        document: Option<String>,
    },

    /// Delete the record at a key.
    Delete {
        #[command(flatten)]
        selector: Selector,

        /// Sample instant or interval left edge (RFC 3339).
        #[arg(long, value_parser = parse_instant)]
        at: DateTime<Utc>,
    },

    /// Time ranges over which a correction is defined.
    Intervals {
        #[command(flatten)]
        selector: Selector,
    },

    /// Pin the ONLINE value reported just past the cutoff.
    Freeze {
        correction: String,

        /// Label as `name=value`; repeatable.
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, Label)>,
    },

    /// List the known corrections.
    Schemas,
}

#[derive(Args)]
struct Selector {
    correction: String,

    #[arg(long)]
    version: Option<String>,

    /// Label as `name=value`; repeatable. Integer values are stored as integers.
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(String, Label)>,
}

fn parse_instant(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_time(raw).map_err(|e| e.to_string())
}

fn parse_label(raw: &str) -> std::result::Result<(String, Label), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{raw}`"))?;
    let label = match value.parse::<i64>() {
        Ok(n) => Label::Integer(n),
        Err(_) => Label::from(value),
    };
    Ok((name.to_string(), label))
}

fn collect_labels(labels: Vec<(String, Label)>) -> Labels {
    labels.into_iter().collect()
}

struct AppState {
    store: CorrectionStore,
}

impl AppState {
    fn open(cli: &Cli) -> Result<Self> {
        let db_path = env::var("XEDOCS_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
        let config = config_from_env()?;
        debug!(db_path = %db_path, ?config, "opening correction store");

        let mut store = CorrectionStore::open(&db_path, SchemaRegistry::builtin(), config)?;
        if let Some(now) = cli.now {
            store = store.frozen_at(now);
        }
        if let Some(path) = &cli.runs {
            store = store.with_run_registry(load_runs(path)?);
        }
        Ok(Self { store })
    }
}

fn config_from_env() -> Result<StoreConfig> {
    let mut config = StoreConfig::default();
    if let Ok(raw) = env::var("XEDOCS_CUTOFF_OFFSET_SECS") {
        config.cutoff_offset_secs = raw
            .parse()
            .context("XEDOCS_CUTOFF_OFFSET_SECS must be an integer")?;
    }
    if let Ok(raw) = env::var("XEDOCS_FREEZE_BUFFER_MS") {
        config.freeze_buffer_ms = raw
            .parse()
            .context("XEDOCS_FREEZE_BUFFER_MS must be an integer")?;
    }
    Ok(config)
}

fn load_runs(path: &str) -> Result<StaticRunRegistry> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    let spans: HashMap<String, Span> =
        serde_json::from_str(&raw).with_context(|| format!("invalid run file {path}"))?;
    let mut runs = StaticRunRegistry::new();
    for (run_id, span) in spans {
        runs.insert(run_id, span.left, span.right)?;
    }
    Ok(runs)
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let state = AppState::open(&cli).context("failed to open correction store")?;
    run(&state.store, cli.command)
}

fn run(store: &CorrectionStore, command: Commands) -> Result<()> {
    match command {
        Commands::Find {
            selector,
            at,
            from,
            to,
            run,
            per_label,
        } => {
            let mut query = Query::new(selector.correction);
            query.version = selector.version;
            query.labels = collect_labels(selector.labels);
            query = match (at, from, to, run) {
                (Some(t), ..) => query.at(t),
                (None, Some(left), Some(right), _) => query.range(left, right),
                (None, _, _, Some(run_id)) => query.run(run_id),
                _ => query,
            };

            match per_label {
                Some(label) => {
                    let results: Vec<JsonValue> = store
                        .find_per_label(&query, &label)?
                        .into_iter()
                        .map(|(value, record)| {
                            json!({ "label": value, "record": record.to_document() })
                        })
                        .collect();
                    print_json(&results)
                }
                None => print_json(&store.find(&query)?),
            }
        }
        Commands::Insert { document } => {
            let raw = match document {
                Some(raw) => raw,
                None => {
                    let mut buf = String::new();
                    io::stdin()
                        .read_to_string(&mut buf)
                        .context("failed to read document from stdin")?;
                    buf
                }
            };
            let doc: Map<String, JsonValue> =
                serde_json::from_str(&raw).context("document must be a JSON object")?;
            let record = CorrectionRecord::from_document(doc)?;
            let outcome = store.insert(record)?;
            print_json(&json!({ "outcome": outcome }))
        }
        Commands::Delete { selector, at } => {
            let Some(version) = selector.version else {
                bail!("--version is required to delete a record");
            };
            let mut labels = collect_labels(selector.labels);
            store
                .schemas()
                .get(&selector.correction)?
                .apply_defaults(&mut labels);
            let key = RecordKey {
                group: GroupKey {
                    correction_name: selector.correction,
                    version,
                    labels,
                },
                at,
            };
            let outcome = store.delete(&key)?;
            print_json(&json!({ "outcome": outcome }))
        }
        Commands::Intervals { selector } => {
            let labels = collect_labels(selector.labels);
            let spans = store.validity_intervals(
                &selector.correction,
                selector.version.as_deref(),
                &labels,
            )?;
            print_json(&spans)
        }
        Commands::Freeze { correction, labels } => {
            let pinned = store.freeze(&correction, &collect_labels(labels))?;
            print_json(&pinned)
        }
        Commands::Schemas => {
            let schemas: Vec<_> = store
                .schemas()
                .names()
                .map(|name| store.schemas().get(name))
                .collect::<xedocs::Result<_>>()?;
            print_json(&schemas)
        }
    }
}
