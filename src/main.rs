//! Entry point for the `branch` binary.
//!
//! Parses CLI arguments and dispatches into either **run** mode (one branch
//! per process, driven from stdin) or **cluster** mode (every branch of the
//! config in this process, with periodic snapshots checked against the money
//! supply).  All protocol work is delegated to the library; `main.rs` owns
//! only process setup (logging, argument parsing) and the snapshot trigger.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use branch_snapshot::{
    global_total, Branch, NetworkConfig, PeerId, SnapshotId, SnapshotLookup, SnapshotRecord,
};

/// Money-transferring branches with global snapshots.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run a single branch; read commands from stdin.
    Run {
        /// Network description (TOML).
        #[arg(short, long)]
        config: PathBuf,
        /// Id of the branch to run.
        #[arg(short, long)]
        id: PeerId,
    },
    /// Run every configured branch in this process and take snapshots.
    Cluster {
        /// Network description (TOML).
        #[arg(short, long)]
        config: PathBuf,
        /// Number of snapshots to take before exiting.
        #[arg(short, long, default_value_t = 5)]
        snapshots: u64,
        /// Pause between snapshots, in milliseconds.
        #[arg(long, default_value_t = 2000)]
        interval_ms: u64,
        /// Give up on a snapshot after this many milliseconds.
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Run { config, id } => run(config, id).await,
        Mode::Cluster {
            config,
            snapshots,
            interval_ms,
            timeout_ms,
        } => {
            cluster(
                config,
                snapshots,
                Duration::from_millis(interval_ms),
                Duration::from_millis(timeout_ms),
            )
            .await
        }
    }
}

async fn run(path: PathBuf, id: PeerId) -> Result<()> {
    let network = NetworkConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let branch = Branch::start(network.branch(id)?).await?;

    println!("commands: snapshot <id> | send <to> <amount> | balance | result <id> | quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e:#}");
                continue;
            }
        };
        match command {
            Command::Snapshot(sid) => {
                if branch.start_snapshot(sid).await {
                    println!("snapshot {sid} started");
                } else {
                    println!("snapshot {sid} rejected");
                }
            }
            Command::Send { to, amount } => {
                let sent = branch.transfer(to, amount).await?;
                println!("{}", if sent { "sent" } else { "refused" });
            }
            Command::Balance => {
                let b = branch.balances().await?;
                println!(
                    "available={} reserved={} total={}",
                    b.available,
                    b.reserved,
                    b.total()
                );
            }
            Command::Show(sid) => match branch.snapshot_result(sid).await? {
                SnapshotLookup::NotFound => println!("not found"),
                SnapshotLookup::StillRecording => println!("still recording"),
                SnapshotLookup::Completed(r) => print_record(id, &r),
            },
            Command::Quit => break,
        }
    }

    branch.stop().await;
    Ok(())
}

/// One line of `run` mode input.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Snapshot(SnapshotId),
    Send { to: PeerId, amount: u64 },
    Balance,
    Show(SnapshotId),
    Quit,
}

impl Command {
    /// `Ok(None)` for a blank line.
    fn parse(line: &str) -> Result<Option<Self>> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let command = match words.as_slice() {
            [] => return Ok(None),
            ["snapshot", sid] => Command::Snapshot(sid.parse().context("snapshot id")?),
            ["send", to, amount] => Command::Send {
                to: to.parse().context("branch id")?,
                amount: amount.parse().context("amount")?,
            },
            ["balance"] => Command::Balance,
            ["result", sid] => Command::Show(sid.parse().context("snapshot id")?),
            ["quit"] | ["exit"] => Command::Quit,
            _ => bail!("unknown command: {line}"),
        };
        Ok(Some(command))
    }
}

async fn cluster(path: PathBuf, snapshots: u64, pause: Duration, limit: Duration) -> Result<()> {
    let network = NetworkConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let supply = network.total_supply();

    let mut branches = Vec::new();
    for id in network.peers.ids() {
        branches.push(Branch::start(network.branch(id)?).await?);
    }
    log::info!("{} branches running, money supply {supply}", branches.len());

    let mut failures = 0;
    for n in 0..snapshots {
        tokio::time::sleep(pause).await;
        let sid = n + 1;
        let initiator = &branches[(n as usize) % branches.len()];
        if !initiator.start_snapshot(sid).await {
            log::warn!("snapshot {sid} rejected by branch {}", initiator.id());
            continue;
        }

        let records = tokio::time::timeout(limit, collect(&branches, sid))
            .await
            .with_context(|| format!("snapshot {sid} did not complete"))??;
        for r in &records {
            print_record(r.0, &r.1);
        }
        let total = global_total(records.iter().map(|(_, r)| r));
        if total == supply {
            log::info!("snapshot {sid}: global total {total} matches supply");
        } else {
            log::error!("snapshot {sid}: global total {total} != supply {supply}");
            failures += 1;
        }
    }

    for branch in branches {
        branch.stop().await;
    }
    if failures > 0 {
        bail!("{failures} snapshot(s) were inconsistent");
    }
    Ok(())
}

/// Wait until every branch completed snapshot `sid`, then take the records.
async fn collect(branches: &[Branch], sid: SnapshotId) -> Result<Vec<(PeerId, SnapshotRecord)>> {
    let mut records = Vec::with_capacity(branches.len());
    for branch in branches {
        loop {
            match branch.take_snapshot_result(sid).await? {
                SnapshotLookup::Completed(r) => {
                    records.push((branch.id(), r));
                    break;
                }
                SnapshotLookup::StillRecording | SnapshotLookup::NotFound => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    Ok(records)
}

fn print_record(id: PeerId, r: &SnapshotRecord) {
    println!(
        "branch {id} snapshot {}: balance={} in_flight={} channels={:?}",
        r.id,
        r.recorded_balance,
        r.in_flight(),
        r.channel_state
    );
}
