use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use strata::{AggregateFunction, Event, EventQuery, EventStore, Namespace, StoreConfig};

#[derive(Parser)]
#[command(name = "strata-admin")]
#[command(about = "Administer a strata event store")]
struct Cli {
    /// JSON config file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Store root directory (overrides the config file)
    #[arg(long)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a namespace
    Create { namespace: String },
    /// Remove a namespace and all of its data
    Drop { namespace: String },
    /// List namespaces
    List,
    /// Import events from a JSON-lines file (or stdin with "-")
    Import {
        namespace: String,
        input: PathBuf,

        /// Events per atomic batch
        #[arg(long, default_value_t = 1000)]
        batch: usize,
    },
    /// Print matching events as JSON lines
    Query {
        namespace: String,
        #[arg(long)]
        start: i64,
        #[arg(long)]
        end: i64,

        /// Metadata predicate, KEY=EXPR (repeatable)
        #[arg(long = "meta", value_parser = parse_pair)]
        metadata: Vec<(String, String)>,

        /// Dimension predicate, KEY=EXPR (repeatable)
        #[arg(long = "dim", value_parser = parse_pair)]
        dimensions: Vec<(String, String)>,

        #[arg(long)]
        payloads: bool,
        #[arg(long)]
        descending: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print bucketed aggregates of one dimension
    Aggregate {
        namespace: String,
        dimension: String,
        #[arg(long)]
        start: i64,
        #[arg(long)]
        end: i64,
        #[arg(long, default_value_t = 60_000)]
        interval_ms: i64,
        /// AVG, MIN, MAX, SUM or COUNT
        #[arg(long, default_value = "AVG")]
        function: String,
    },
    /// Drop chunks that hold only events at or before CUTOFF minus one window
    Expire { namespace: String, cutoff_ms: i64 },
    /// List chunk tables of a namespace
    Chunks { namespace: String },
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=EXPR, got '{raw}'"))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => StoreConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    if let Some(root) = cli.root {
        config.root = root;
    }
    let store = EventStore::initialize(config).context("initializing store")?;

    match cli.command {
        Commands::Create { namespace } => {
            store.create(&Namespace::new(namespace)?)?;
        }
        Commands::Drop { namespace } => {
            store.drop_namespace(&Namespace::new(namespace)?)?;
        }
        Commands::List => {
            for ns in store.namespaces()? {
                println!("{}", ns);
            }
        }
        Commands::Import {
            namespace,
            input,
            batch,
        } => {
            let ns = Namespace::new(namespace)?;
            let reader: Box<dyn BufRead> = if input.as_os_str() == "-" {
                Box::new(BufReader::new(io::stdin()))
            } else {
                let file = File::open(&input)
                    .with_context(|| format!("opening {}", input.display()))?;
                Box::new(BufReader::new(file))
            };
            let batch = batch.max(1);
            let mut pending = Vec::with_capacity(batch);
            let mut total = 0;
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let event: Event = serde_json::from_str(&line)
                    .with_context(|| format!("line {}", line_no + 1))?;
                pending.push(event);
                if pending.len() == batch {
                    total += store.store(&ns, &pending)?;
                    pending.clear();
                }
            }
            total += store.store(&ns, &pending)?;
            println!("imported {} events into {}", total, ns);
        }
        Commands::Query {
            namespace,
            start,
            end,
            metadata,
            dimensions,
            payloads,
            descending,
            limit,
        } => {
            let ns = Namespace::new(namespace)?;
            let mut query = EventQuery::new(start, end)
                .with_metadata_query(metadata.into_iter().collect::<BTreeMap<_, _>>())
                .with_dimensions_query(dimensions.into_iter().collect::<BTreeMap<_, _>>())
                .include_payloads(payloads)
                .ascending(!descending);
            if let Some(limit) = limit {
                query = query.limit(limit);
            }
            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            for event in store.get(&ns, &query)? {
                serde_json::to_writer(&mut out, &event)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }
        Commands::Aggregate {
            namespace,
            dimension,
            start,
            end,
            interval_ms,
            function,
        } => {
            let ns = Namespace::new(namespace)?;
            let function: AggregateFunction = function.parse()?;
            let buckets = store.aggregate(
                &ns,
                &dimension,
                &EventQuery::new(start, end),
                interval_ms,
                function,
            )?;
            for (bucket, value) in buckets {
                println!("{}\t{}", bucket, value);
            }
        }
        Commands::Expire {
            namespace,
            cutoff_ms,
        } => {
            let dropped = store.expire(&Namespace::new(namespace)?, cutoff_ms)?;
            for table in &dropped {
                println!("dropped {}", table);
            }
            println!("{} chunks expired", dropped.len());
        }
        Commands::Chunks { namespace } => {
            for chunk in store.chunks(&Namespace::new(namespace)?)? {
                println!("{}", chunk);
            }
        }
    }
    Ok(())
}
