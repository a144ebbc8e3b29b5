use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use perimeter_config::{ConfigLoader, init_tracing};
use perimeter_core::{
    model::{GroupId, GroupKey, OrgId},
    store::{
        GateKind, GroupInvalidation, GroupStateStore, InvalidationBus,
        RateGate, RedisStateStore, WorkQueue,
    },
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "perimeterctl",
    about = "Inspect and repair Perimeter scan state in the shared store"
)]
struct Cli {
    /// Redis URL; defaults to the loaded configuration.
    #[arg(long, global = true, env = "REDIS_URL")]
    redis_url: Option<String>,
    /// Key prefix; defaults to the loaded configuration.
    #[arg(long, global = true)]
    prefix: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show a group's status, when it last changed, and its queue depth
    Status {
        org: i32,
        group: i32,
    },
    /// Force a group's status to Stopped (manual repair)
    Stop {
        org: i32,
        group: i32,
    },
    /// Show how many addresses are queued for a group
    Queue {
        org: i32,
        group: i32,
    },
    /// Drop a group's queued work and seen set
    Clear {
        org: i32,
        group: i32,
    },
    /// Publish a configuration cache invalidation for a group
    Invalidate {
        org: i32,
        group: i32,
    },
    /// Probe a rate gate; prints whether this call acquired it
    Gate {
        /// ns_zone, brute_etld, bigdata_domain, web_host or port_host
        kind: GateKind,
        org: i32,
        group: i32,
        subject: String,
        #[arg(long, default_value_t = 60)]
        ttl_secs: u64,
    },
}

fn group_key(org: i32, group: i32) -> GroupKey {
    GroupKey::new(OrgId(org), GroupId(group))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("warn,perimeterctl=info,scan::store=info");
    let cli = Cli::parse();

    let load = ConfigLoader::new()
        .load()
        .context("failed to load configuration")?;
    for warning in &load.warnings.items {
        warn!(hint = ?warning.hint, "{}", warning.message);
    }
    let url = cli.redis_url.unwrap_or(load.config.redis.url);
    let prefix = cli.prefix.unwrap_or(load.config.redis.prefix);
    let store = RedisStateStore::connect(&url, &prefix)
        .await
        .context("failed to connect to the shared state store")?;

    match cli.command {
        Command::Status { org, group } => {
            let key = group_key(org, group);
            let status = store.group_status(key).await?;
            let queued = store.queue_len(key).await?;
            match status {
                Some(record) if record.is_started() => println!(
                    "{key} {} since {} by run {}, last heartbeat {} ({queued} queued)",
                    record.status,
                    record.modified_at.to_rfc3339(),
                    record
                        .run_id
                        .map(|run| run.to_string())
                        .unwrap_or_else(|| "unknown".into()),
                    record.heartbeat_at.to_rfc3339()
                ),
                Some(record) => println!(
                    "{key} {} since {} ({queued} queued)",
                    record.status,
                    record.modified_at.to_rfc3339()
                ),
                None => println!("{key} never started ({queued} queued)"),
            }
        }
        Command::Stop { org, group } => {
            let key = group_key(org, group);
            store.stop(key).await?;
            info!(%key, "status forced to stopped");
            println!("{key} stopped");
        }
        Command::Queue { org, group } => {
            let key = group_key(org, group);
            println!("{}", store.queue_len(key).await?);
        }
        Command::Clear { org, group } => {
            let key = group_key(org, group);
            store.clear_frontier(key).await?;
            info!(%key, "frontier cleared");
            println!("{key} frontier cleared");
        }
        Command::Invalidate { org, group } => {
            let key = group_key(org, group);
            let modified_time = store
                .get_group(key)
                .await?
                .map(|stored| stored.modified_time)
                .unwrap_or_else(Utc::now);
            store
                .publish_invalidation(GroupInvalidation::new(key, modified_time))
                .await?;
            println!("{key} invalidation published ({modified_time})");
        }
        Command::Gate {
            kind,
            org,
            group,
            subject,
            ttl_secs,
        } => {
            let key = group_key(org, group);
            let acquired = store
                .try_acquire_gate(
                    kind,
                    key,
                    Duration::from_secs(ttl_secs),
                    &subject,
                )
                .await?;
            println!(
                "{kind} {key} {subject}: {}",
                if acquired { "acquired" } else { "held" }
            );
        }
    }
    Ok(())
}
