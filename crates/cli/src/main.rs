//! tetherctl: drive a Tether pipeline from the command line.

#![forbid(unsafe_code)]

use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::json;
use tether_api::{spawn_consumers, ChannelPublisher, Pipeline, Stats, TetherError};
use tether_core::{EntityDescriptor, EntityEvent, RelationUpdate, RelationUpdateEvent, SyncMetadata, SyncType, TetherConfig};
use tether_relations::DeadLetter;
use tether_schema::SchemaFile;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Tether relation cache CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the managed relation rules derived from a schema file
    Rules {
        #[arg(long)]
        schema: String,
    },
    /// Feed a JSON-lines event file through the pipeline
    Replay {
        #[arg(long)]
        schema: String,
        /// One event per line: {"entity": {...}} or {"relation": {...}}
        #[arg(long)]
        events: String,
        /// Print the cached entries of this resource type (domain/package/name) afterwards
        #[arg(long)]
        dump: Option<String>,
        /// Filter the dump, e.g. `field:name=alice`
        #[arg(long)]
        query: Option<String>,
    },
    /// Run a synthetic FULL sync of the first cached type through the consumer loops
    Demo {
        #[arg(long)]
        schema: String,
        #[arg(long, default_value_t = 100)]
        size: u64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReplayEvent {
    Entity(EntityEvent),
    Relation(RelationUpdateEvent),
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Rules { schema } => {
            let schema = SchemaFile::load(&schema)?;
            let registry = tether_schema::RelationRuleRegistry::from_source(&schema)?;
            let rules = registry.all_rules();
            match cli.output {
                Output::Human => {
                    println!("TRIGGER\tRELATION\tTARGET\tINVERSE\tPRUNE");
                    for (d, r) in rules {
                        println!("{}\t{}\t{}\t{}\t{}", d, r.target_relation, r.target, r.inverse_relation, r.should_prune_links());
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = rules.into_iter().map(|(d, r)| json!({ "trigger": d, "rule": r })).collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Replay { schema, events, dump, query } => {
            let config = TetherConfig::from_env();
            let schema = SchemaFile::load(&schema)?;
            let (publisher, outbound) = ChannelPublisher::<RelationUpdate>::new(config.queue_cap);
            let pipeline = Pipeline::from_schema(config, &schema, Arc::new(publisher))?;
            let drain = tokio::spawn(drain_published(outbound));

            let file = std::fs::File::open(&events).with_context(|| format!("opening {}", events))?;
            let (mut ok, mut failed) = (0usize, 0usize);
            for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let event: ReplayEvent = match serde_json::from_str(&line) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(line = n + 1, error = %e, "replay: unparsable event");
                        failed += 1;
                        continue;
                    }
                };
                let res: Result<(), TetherError> = match event {
                    ReplayEvent::Entity(e) => pipeline.process_entity_event(e).map(|_| ()),
                    ReplayEvent::Relation(e) => pipeline.process_relation_update_event(e).map(|_| ()),
                };
                match res {
                    Ok(()) => ok += 1,
                    Err(e) => {
                        warn!(line = n + 1, error = %e, "replay: event not applied");
                        failed += 1;
                    }
                }
            }
            info!(ok, failed, "replay finished");

            match dump {
                Some(d) => {
                    let d = EntityDescriptor::from_str(&d)?;
                    let entries = pipeline.search(&d, query.as_deref().unwrap_or(""), usize::MAX, 0, 0)?;
                    match cli.output {
                        Output::Human => {
                            for r in &entries {
                                println!("{}", serde_json::to_string(&r.to_value())?);
                            }
                        }
                        Output::Json => {
                            let rows: Vec<_> = entries.iter().map(|r| r.to_value()).collect();
                            println!("{}", serde_json::to_string_pretty(&rows)?);
                        }
                    }
                }
                None => print_stats(&pipeline.stats(), cli.output)?,
            }
            drop(pipeline);
            let _ = drain.await;
        }
        Commands::Demo { schema, size } => {
            let config = TetherConfig::from_env();
            let cap = config.queue_cap;
            let schema = SchemaFile::load(&schema)?;
            let (publisher, outbound) = ChannelPublisher::<RelationUpdate>::new(cap);
            let (dead, dead_rx) = ChannelPublisher::<DeadLetter>::new(cap);
            let pipeline = Arc::new(Pipeline::from_schema(config, &schema, Arc::new(publisher))?);
            let d = pipeline.descriptors().into_iter().next().context("schema caches no resource type")?;
            let field = schema.id_fields(&d).into_iter().next().unwrap_or_else(|| "systemId".to_string());

            let cancel = CancellationToken::new();
            let drains = [tokio::spawn(drain_published(outbound)), tokio::spawn(drain_dead_letters(dead_rx))];
            let worker = pipeline.spawn_retry_worker(Arc::new(dead), cancel.clone());
            let consumers = spawn_consumers(Arc::clone(&pipeline), cap, cancel.clone());

            let correlation_id = uuid::Uuid::new_v4().to_string();
            info!(resource = %d, size, correlation_id = %correlation_id, "demo: starting full sync");
            let feed = {
                let tx = consumers.entities.clone();
                let (d, field, correlation_id) = (d.clone(), field.clone(), correlation_id.clone());
                async move {
                    for i in 0..size {
                        let id = format!("demo-{}", i);
                        let mut body = serde_json::Map::new();
                        body.insert(field.clone(), json!({ "value": id }));
                        body.insert("name".into(), json!(format!("demo {}", i)));
                        let event = EntityEvent {
                            resource_type: d.clone(),
                            id: id.clone(),
                            resource: Some(serde_json::Value::Object(body)),
                            timestamp: tether_core::now_millis(),
                            sync: Some(SyncMetadata { sync_type: SyncType::Full, correlation_id: correlation_id.clone(), total_size: size }),
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                }
            };
            tokio::select! {
                _ = feed => {}
                _ = signal::ctrl_c() => { warn!("demo: interrupted"); }
            }

            consumers.shutdown().await;
            cancel.cancel();
            let _ = worker.await;
            print_stats(&pipeline.stats(), cli.output)?;
            drop(pipeline);
            for t in drains {
                let _ = t.await;
            }
        }
    }

    Ok(())
}

async fn drain_published(mut rx: mpsc::Receiver<RelationUpdate>) {
    while let Some(u) = rx.recv().await {
        info!(resource = %u.target, ids = ?u.target_ids, relation = %u.binding.relation, op = u.operation.as_str(), "published relation update");
    }
}

async fn drain_dead_letters(mut rx: mpsc::Receiver<DeadLetter>) {
    while let Some(l) = rx.recv().await {
        warn!(resource = %l.update.target, attempts = l.attempts, error = %l.error, "dead letter");
    }
}

fn print_stats(stats: &Stats, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("RESOURCE\tENTRIES\tLAST_UPDATED");
            for s in &stats.stores {
                println!("{}\t{}\t{}", s.resource, s.entries, s.last_updated);
            }
            println!("rules: {}  buffered_links: {}  retry_pending: {}  locks: {}", stats.rules, stats.buffered_links, stats.retry_pending, stats.lock_entries);
            for s in &stats.sessions {
                println!("session {} {} {}/{}", s.key, s.phase.as_str(), s.processed, s.total_size);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(stats)?),
    }
    Ok(())
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}
