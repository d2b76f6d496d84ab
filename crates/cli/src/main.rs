use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use hotrank_api::{HotRankApi, InProcApi, TopResponse};
use hotrank_cache::MemCache;
use hotrank_core::{ActionEvent, ActionKind, Period, SystemClock};
use hotrank_persist::{ItemStore, NewItem, SqliteStore};
use hotrank_store::{spawn_ingest, Applied, Engine, EngineConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "hotrankctl", version, about = "hotrank CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// SQLite database of items and categories
    #[arg(long = "db", env = "HOTRANK_DB_PATH", global = true)]
    db: Option<PathBuf>,

    /// Cache dump restored at startup and written on flush
    #[arg(long = "dump", env = "HOTRANK_DUMP_PATH", global = true)]
    dump: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the engine: read action events as JSON lines from stdin until EOF or Ctrl-C
    Serve {
        /// Ignore stdin and only run the schedule until Ctrl-C
        #[arg(long = "no-stdin", action = ArgAction::SetTrue)]
        no_stdin: bool,
        /// Print the 1h ranking whenever it is republished
        #[arg(long = "print-top", action = ArgAction::SetTrue)]
        print_top: bool,
    },
    /// Insert random items and categories into the database
    Seed {
        #[arg(long = "items", default_value_t = 100)]
        items: usize,
        #[arg(long = "categories", default_value_t = 5)]
        categories: usize,
        /// RNG seed for reproducible data
        #[arg(long = "seed", default_value_t = 42)]
        seed: u64,
    },
    /// Apply action events from a JSON-lines file, then refresh and flush
    Ingest {
        file: PathBuf,
    },
    /// Show the ranking of a period (1h, 24h, 7d), rebuilt from the cache. Read-only: a cold
    /// hour window is shown as is, not topped up with synthetic views
    Top {
        #[arg(long = "period", default_value = "1h")]
        period: String,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Show one item through the cache
    Item {
        id: i64,
    },
    /// Show a category and the items seen under it
    Category {
        id: i64,
    },
    /// Check whether an actor holds a support, oppose or favorite on an item
    Acted {
        actor: i64,
        kind: String,
        item: i64,
    },
    /// Refresh every period now and flush the cache
    Refresh,
    /// Write the cache dump
    Flush,
    /// Engine counters and snapshot sizes
    Stats,
}

fn init_tracing() {
    let env = std::env::var("HOTRANK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HOTRANK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid HOTRANK_METRICS_ADDR; expected host:port");
        }
    }
}

fn home_file(name: &str) -> PathBuf {
    let mut p = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
    p.push(".hotrank");
    let _ = std::fs::create_dir_all(&p);
    p.push(name);
    p
}

fn open_store(cli: &Cli) -> Result<Arc<SqliteStore>> {
    let store = match &cli.db {
        Some(p) => SqliteStore::open(&p.to_string_lossy())?,
        None => SqliteStore::open_default()?,
    };
    Ok(Arc::new(store))
}

fn open_engine(cli: &Cli) -> Result<Arc<Engine>> {
    let store = open_store(cli)?;
    let dump = cli.dump.clone().unwrap_or_else(|| home_file("cache.json"));
    let cache = Arc::new(MemCache::open(&dump)?);
    info!(dump = %dump.display(), keys = cache.len(), "cache opened");
    Ok(Arc::new(Engine::new(cache, store, Arc::new(SystemClock), EngineConfig::from_env())))
}

fn print_top(output: Output, top: &TopResponse) -> Result<()> {
    match output {
        Output::Human => {
            println!("RANK  ITEM      SCORE      VIEWS  SUP  OPP  COM  FAV  TITLE");
            for r in &top.items {
                let c = &r.counters;
                println!(
                    "{:<5} {:<9} {:<10.4} {:<6} {:<4} {:<4} {:<4} {:<4} {}",
                    r.rank, r.item_id, r.score, c.views, c.supports, c.opposes, c.comments, c.favorites, r.title
                );
            }
            if top.items.is_empty() {
                println!("(no ranked items for {})", top.period);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(top)?),
    }
    Ok(())
}

fn parse_event(line: &str) -> Option<ActionEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<ActionEvent>(line) {
        Ok(ev) => Some(ev),
        Err(e) => {
            metrics::counter!("cli_events_malformed_total", 1u64);
            warn!(error = %e, line, "skipping malformed event");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { no_stdin, print_top: show } => {
            let engine = open_engine(&cli)?;
            let api = InProcApi::new(engine.clone());
            if let Err(e) = engine.start().await {
                error!(error = %e, "startup refresh incomplete");
            }
            engine.spawn_schedule();
            let (tx, ingest) = spawn_ingest(engine.clone(), engine.config().ingest_queue);

            let printer = if *show {
                let mut epochs = api.watch_epoch();
                let engine = engine.clone();
                let output = cli.output;
                Some(tokio::spawn(async move {
                    while epochs.changed().await.is_ok() {
                        let top = InProcApi::new(engine.clone()).top(Period::Hour, None).await;
                        match top {
                            Ok(top) => {
                                if let Err(e) = print_top(output, &top) {
                                    warn!(error = %e, "failed to print ranking");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to read ranking"),
                        }
                    }
                }))
            } else {
                None
            };

            if *no_stdin {
                let _ = signal::ctrl_c().await;
                info!("Ctrl-C received; shutting down");
            } else {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                loop {
                    tokio::select! {
                        line = lines.next_line() => {
                            match line {
                                Ok(Some(l)) => {
                                    if let Some(ev) = parse_event(&l) {
                                        if tx.send(ev).await.is_err() {
                                            warn!("ingest loop gone; stopping input");
                                            break;
                                        }
                                    }
                                }
                                Ok(None) => {
                                    info!("stdin closed; shutting down");
                                    break;
                                }
                                Err(e) => {
                                    error!(error = %e, "stdin read failed");
                                    break;
                                }
                            }
                        }
                        _ = signal::ctrl_c() => {
                            info!("Ctrl-C received; shutting down");
                            break;
                        }
                    }
                }
            }

            drop(tx);
            let accepted = ingest.await.unwrap_or(0);
            let drained = engine.shutdown(engine.config().drain_timeout).await;
            if let Some(p) = printer {
                p.abort();
            }
            if let Err(e) = api.flush().await {
                error!(error = %e, "final flush failed");
            }
            info!(accepted, drained, "serve stopped");
        }
        Commands::Seed { items, categories, seed } => {
            let store = open_store(&cli)?;
            let mut rng = StdRng::seed_from_u64(*seed);
            let mut cats = Vec::with_capacity(*categories);
            for i in 0..*categories {
                cats.push(store.insert_category(&format!("category-{}", i + 1))?);
            }
            let now = hotrank_persist::now_ms();
            let mut first = None;
            let mut last = None;
            for i in 0..*items {
                let category_id = if cats.is_empty() { None } else { Some(cats[rng.gen_range(0..cats.len())]) };
                // Spread creation over the last week.
                let age_ms = rng.gen_range(0..7 * 24 * 3_600_000i64);
                let id = store.insert_item(&NewItem {
                    title: format!("Story #{}", i + 1),
                    content: format!("Body of story {}", i + 1),
                    category_id,
                    created_at_ms: now - age_ms,
                })?;
                first.get_or_insert(id);
                last = Some(id);
            }
            match cli.output {
                Output::Human => println!("seeded {} items ({:?}..={:?}) in {} categories", items, first, last, cats.len()),
                Output::Json => println!(
                    "{}",
                    serde_json::json!({ "items": items, "firstId": first, "lastId": last, "categories": cats })
                ),
            }
        }
        Commands::Ingest { file } => {
            let engine = open_engine(&cli)?;
            let f = tokio::fs::File::open(file).await.with_context(|| format!("opening {}", file.display()))?;
            let mut lines = BufReader::new(f).lines();
            let (mut applied, mut dropped, mut failed) = (0u64, 0u64, 0u64);
            while let Some(line) = lines.next_line().await? {
                let Some(ev) = parse_event(&line) else { continue };
                match engine.process(ev).await {
                    Ok(Applied::Scored { .. }) => applied += 1,
                    Ok(Applied::Dropped) => dropped += 1,
                    Err(e) => {
                        failed += 1;
                        warn!(item = ev.item_id, error = %e, "event failed");
                    }
                }
            }
            let api = InProcApi::new(engine.clone());
            if let Err(e) = api.force_refresh().await {
                warn!(error = %e, "refresh after ingest failed");
            }
            engine.shutdown(engine.config().drain_timeout).await;
            api.flush().await?;
            match cli.output {
                Output::Human => println!("applied {}, dropped {}, failed {}", applied, dropped, failed),
                Output::Json => println!("{}", serde_json::json!({ "applied": applied, "dropped": dropped, "failed": failed })),
            }
        }
        Commands::Top { period, limit } => {
            let period = Period::from_str(period).map_err(|e| anyhow::anyhow!(e))?;
            let engine = open_engine(&cli)?;
            // A fresh process has no published snapshot; rebuild them from the cache.
            if let Err(e) = engine.rebuild().await {
                warn!(error = %e, "some rankings could not be rebuilt");
            }
            let api = InProcApi::new(engine.clone());
            let top = api.top(period, *limit).await?;
            print_top(cli.output, &top)?;
            engine.shutdown(engine.config().drain_timeout).await;
        }
        Commands::Item { id } => {
            let engine = open_engine(&cli)?;
            let item = InProcApi::new(engine.clone()).item(*id).await?;
            match cli.output {
                Output::Human => {
                    let c = &item.counters;
                    println!("#{} {}", item.id, item.title);
                    println!("  category: {}", item.category_id.map(|c| c.to_string()).unwrap_or_else(|| "-".into()));
                    println!(
                        "  views {}, supports {}, opposes {}, comments {}, favorites {}",
                        c.views, c.supports, c.opposes, c.comments, c.favorites
                    );
                    println!("  version {}", item.version);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&item)?),
            }
            engine.shutdown(Duration::from_secs(2)).await;
        }
        Commands::Category { id } => {
            let engine = open_engine(&cli)?;
            let api = InProcApi::new(engine.clone());
            let category = api.category(*id).await?;
            let items = api.category_items(*id).await?;
            match cli.output {
                Output::Human => {
                    println!("#{} {}", category.id, category.name);
                    println!("  items: {:?}", items);
                }
                Output::Json => println!("{}", serde_json::json!({ "category": category, "items": items })),
            }
            engine.shutdown(Duration::from_secs(2)).await;
        }
        Commands::Acted { actor, kind, item } => {
            let kind = ActionKind::from_str(kind)?;
            let engine = open_engine(&cli)?;
            let acted = InProcApi::new(engine).has_acted(*actor, kind, *item).await?;
            match cli.output {
                Output::Human => println!("{}", if acted { "yes" } else { "no" }),
                Output::Json => println!("{}", serde_json::json!({ "acted": acted })),
            }
        }
        Commands::Refresh => {
            let engine = open_engine(&cli)?;
            let api = InProcApi::new(engine.clone());
            let outcomes = api.force_refresh().await?;
            engine.shutdown(engine.config().drain_timeout).await;
            api.flush().await?;
            match cli.output {
                Output::Human => {
                    for (p, o) in &outcomes {
                        println!("{:<4} {:?}", p, o);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&outcomes)?),
            }
        }
        Commands::Flush => {
            let engine = open_engine(&cli)?;
            InProcApi::new(engine).flush().await?;
            if cli.output == Output::Human {
                println!("flushed");
            }
        }
        Commands::Stats => {
            let engine = open_engine(&cli)?;
            let stats = InProcApi::new(engine).stats().await?;
            match cli.output {
                Output::Human => {
                    println!("ready: {}  draining: {}  epoch: {}", stats.ready, stats.draining, stats.epoch);
                    println!("last event: {}", stats.last_event_ms.map(|t| t.to_string()).unwrap_or_else(|| "never".into()));
                    for (p, n) in &stats.snapshot_sizes {
                        println!("{:<4} {} ranked", p, n);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
            }
        }
    }
    Ok(())
}
