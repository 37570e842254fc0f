//! wsfleet CLI - drive the workspace engine against the simulated control plane

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use workspace_fleet::models::Coordinates;
use workspace_fleet::{
    AssignmentRequest, AuditLedger, CallerLocation, Engine, EngineConfig, OperatingSystem, SqliteStore, SystemClock,
    Workers,
};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "wsfleet")]
#[command(about = "Provisioning and lifecycle engine for pooled remote desktop workspaces")]
#[command(version)]
struct Cli {
    /// SQLite database holding workspaces, pools and the audit ledger
    #[arg(long, global = true, default_value = "wsfleet.db")]
    db: PathBuf,

    /// Engine configuration (JSON); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background workers until Ctrl-C
    Run,
    /// Run one pool replenishment and lifecycle sweep
    Sweep,
    /// Assign a workspace to a user
    Assign {
        #[arg(long)]
        template: String,
        #[arg(long, default_value = "windows")]
        os: OperatingSystem,
        #[arg(long)]
        user: String,
        /// Caller address, used for region selection
        #[arg(long)]
        ip: Option<IpAddr>,
        /// Caller latitude; takes precedence over --ip
        #[arg(long, requires = "lon", allow_hyphen_values = true)]
        lat: Option<f64>,
        #[arg(long, requires = "lat", allow_hyphen_values = true)]
        lon: Option<f64>,
    },
    /// Pool operations
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },
    /// Audit ledger operations
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum PoolAction {
    /// Show ready/warming counts and the current band of every pool
    Status,
}

#[derive(Subcommand)]
enum AuditAction {
    /// Recompute the hash chain over a range
    Verify {
        #[arg(long, default_value = "1")]
        from: u64,
        /// Defaults to the last entry
        #[arg(long)]
        to: Option<u64>,
    },
    /// Show the most recent entries
    List {
        #[arg(long, default_value = "20")]
        limit: u64,
    },
    /// Transitions with an intent record but no outcome
    Incomplete,
}

#[tokio::main]
async fn main() -> CliResult {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Run => cmd_run(config, &cli.db).await?,
        Commands::Sweep => cmd_sweep(config, &cli.db)?,
        Commands::Assign {
            template,
            os,
            user,
            ip,
            lat,
            lon,
        } => {
            let caller = match (lat, lon, ip) {
                (Some(lat), Some(lon), _) => CallerLocation::Coordinates(Coordinates::new(lat, lon)),
                (_, _, Some(ip)) => CallerLocation::Address(ip),
                _ => CallerLocation::Unknown,
            };
            let request = AssignmentRequest::new(template, os, user).caller(caller);
            cmd_assign(config, &cli.db, &request)?;
        }
        Commands::Pool { action } => match action {
            PoolAction::Status => cmd_pool_status(config, &cli.db)?,
        },
        Commands::Audit { action } => handle_audit(&cli.db, action)?,
    }

    Ok(())
}

async fn cmd_run(config: EngineConfig, db: &Path) -> CliResult {
    let engine = Arc::new(Engine::with_sqlite(config, db)?);
    let recovery = engine.recover()?;
    if !recovery.interrupted.is_empty() || !recovery.released.is_empty() {
        println!(
            "Recovered {} interrupted transitions, released {} workspaces",
            recovery.interrupted.len(),
            recovery.released.len()
        );
    }

    let workers = Workers::spawn(engine);
    println!("Workers running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    workers.shutdown().await;
    Ok(())
}

fn cmd_sweep(config: EngineConfig, db: &Path) -> CliResult {
    let engine = Engine::with_sqlite(config, db)?;
    let outcome = engine.sweep()?;

    for report in &outcome.pools {
        let key = report.key.as_ref().map(|k| k.to_string()).unwrap_or_default();
        println!(
            "pool {:<24} target {:>3}  requested {:>3}  promoted {:>3}  failed {:>3}  trimmed {:>3}  dropped {:>3}",
            key, report.target, report.requested, report.promoted, report.failed, report.trimmed, report.dropped
        );
    }
    let lc = &outcome.lifecycle;
    println!(
        "lifecycle: examined {}  stopped {}  stale {}  terminated {}  promoted {}  busy {}  failures {}",
        lc.examined,
        lc.stopped.len(),
        lc.marked_stale.len(),
        lc.terminated.len(),
        lc.promoted.len(),
        lc.skipped_busy,
        lc.failures.len()
    );
    for failure in &lc.failures {
        println!("  {} [{}]: {}", failure.instance_id, failure.error_kind, failure.error);
    }
    Ok(())
}

fn cmd_assign(config: EngineConfig, db: &Path, request: &AssignmentRequest) -> CliResult {
    let engine = Engine::with_sqlite(config, db)?;
    let assignment = engine.assign(request)?;
    let ws = &assignment.workspace;
    println!("Assigned {} to {}", ws.id, request.user);
    println!("  Path:     {}", assignment.path);
    println!("  Region:   {}", ws.region);
    println!("  Remote:   {}", ws.remote_id.as_deref().unwrap_or("-"));
    println!("  Duration: {:.1}s", assignment.duration.as_secs_f64());
    Ok(())
}

fn cmd_pool_status(config: EngineConfig, db: &Path) -> CliResult {
    let engine = Engine::with_sqlite(config, db)?;
    let pools = engine.pools().status();
    if pools.is_empty() {
        println!("No pools configured.");
        return Ok(());
    }

    println!(
        "{:<28} {:>6} {:>8} {:>5} {:>5} {:>8} {:>8}",
        "POOL", "READY", "WARMING", "MIN", "MAX", "CEILING", "DEMAND"
    );
    println!("{}", "-".repeat(74));
    for status in pools {
        println!(
            "{:<28} {:>6} {:>8} {:>5} {:>5} {:>8} {:>8}",
            status.key.to_string(),
            status.ready,
            status.warming,
            status.min,
            status.max,
            status.ceiling,
            status.recent_demand
        );
    }
    Ok(())
}

fn handle_audit(db: &Path, action: AuditAction) -> CliResult {
    let store = SqliteStore::open(db)?;
    let ledger = AuditLedger::new(Arc::new(store), Arc::new(SystemClock));

    match action {
        AuditAction::Verify { from, to } => {
            let to = match to {
                Some(to) => to,
                None => ledger.len()?,
            };
            let report = ledger.verify(from..=to)?;
            if report.valid {
                println!("Chain intact: {} entries verified ({}..={})", report.verified, report.from, report.to);
            } else {
                println!(
                    "INTEGRITY VIOLATION at entry {}",
                    report.first_tampered.map(|s| s.to_string()).unwrap_or_else(|| "?".into())
                );
                if let Some(reason) = &report.reason {
                    println!("  Reason:    {}", reason);
                }
                println!("  Verified:  {}", report.verified);
                println!("  Untrusted: {} entries", report.untrusted.len());
                std::process::exit(2);
            }
        }
        AuditAction::List { limit } => {
            let len = ledger.len()?;
            if len == 0 {
                println!("Ledger is empty.");
                return Ok(());
            }
            let from = len.saturating_sub(limit).max(1);
            println!(
                "{:>6} {:<20} {:<22} {:<24} {:<10} {:<40}",
                "SEQ", "TIME", "ACTOR", "ACTION", "RESULT", "SUBJECT"
            );
            for entry in ledger.entries(from..=len)? {
                println!(
                    "{:>6} {:<20} {:<22} {:<24} {:<10} {:<40}",
                    entry.seq,
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.actor,
                    entry.action,
                    entry.result.as_str(),
                    entry.subject_id
                );
            }
        }
        AuditAction::Incomplete => {
            let open = ledger.incomplete_transitions()?;
            if open.is_empty() {
                println!("No interrupted transitions.");
            }
            for entry in open {
                println!(
                    "{:>6} {} {} {} (correlation {})",
                    entry.seq, entry.timestamp, entry.action, entry.subject_id, entry.correlation_id
                );
            }
        }
    }
    Ok(())
}
