//! leaseq CLI: operator interface to one queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use leaseq::backend::{MemoryTransport, PostgresTransport, RedisTransport};
use leaseq::config::secrets::{ExposeSecret, redacted_url};
use leaseq::config::{Config, TransportKind};
use leaseq::engine::{Maintenance, Producer};
use leaseq::model::{MessageId, NewMessage, RemoveStatus};
use leaseq::telemetry::{TelemetryConfig, init_telemetry};
use leaseq::transport::Transport;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "leaseq", about = "Lease-based message queue operator tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create tables or load scripts for the queue
    Install,
    /// Enqueue one message
    Send {
        /// Message body (sent as UTF-8 bytes)
        body: String,
        /// Route the message is tagged with
        #[arg(long)]
        route: Option<String>,
        /// Delay before the message becomes visible
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Expire the message this many milliseconds from now
        #[arg(long)]
        expire_ms: Option<u64>,
        /// Scheduled job name, for at-most-once scheduling
        #[arg(long, requires = "job_time")]
        job: Option<String>,
        /// Scheduled time of the job run (RFC 3339)
        #[arg(long, requires = "job")]
        job_time: Option<DateTime<Utc>>,
        /// Priority (higher is dequeued first)
        #[arg(long)]
        priority: Option<i16>,
    },
    /// Show message counts, or the state of one message
    Status {
        /// Message id
        #[arg(long)]
        id: Option<String>,
    },
    /// Delete a message from every index
    Remove {
        /// Message id
        id: String,
    },
    /// Run the enabled maintenance sweeps
    Maintain {
        /// Sweep once and exit instead of running until Ctrl-C
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;
    let options = config.queue_options()?;

    match config.transport {
        TransportKind::Postgres => {
            let url = config
                .database_url
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
            tracing::info!(url = %redacted_url(url), queue = %config.queue, "connecting to postgres");
            let transport =
                PostgresTransport::connect(url.expose_secret(), &config.queue, options).await?;
            execute(Arc::new(transport), cli.command).await
        }
        TransportKind::Redis => {
            let url = config
                .redis_url
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("REDIS_URL is not set"))?;
            tracing::info!(url = %redacted_url(url), queue = %config.queue, "connecting to redis");
            let transport =
                RedisTransport::connect(url.expose_secret(), &config.queue, options).await?;
            execute(Arc::new(transport), cli.command).await
        }
        TransportKind::Memory => {
            let transport = MemoryTransport::new(&config.queue, options)?;
            execute(Arc::new(transport), cli.command).await
        }
    }
}

async fn execute<T: Transport>(transport: Arc<T>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Install => {
            transport.install().await?;
            println!(
                "Installed queue {} on {}",
                transport.names().queue(),
                transport.kind()
            );
            Ok(())
        }
        Command::Send {
            body,
            route,
            delay_ms,
            expire_ms,
            job,
            job_time,
            priority,
        } => {
            let mut message = NewMessage::new(body.into_bytes());
            if let Some(route) = route {
                message = message.route(route);
            }
            if let Some(ms) = delay_ms {
                message = message.delay(Duration::from_millis(ms));
            }
            if let Some(ms) = expire_ms {
                let ms = i64::try_from(ms)?;
                message = message.expire_at(Utc::now() + chrono::TimeDelta::milliseconds(ms));
            }
            if let (Some(name), Some(at)) = (job, job_time) {
                message = message.job(name, at);
            }
            if let Some(priority) = priority {
                message = message.priority(priority);
            }
            let sent = Producer::new(transport).send(message).await?;
            println!("Sent: {} (correlation {})", sent.id, sent.correlation_id);
            Ok(())
        }
        Command::Status { id: Some(id) } => {
            let id: MessageId = id.parse()?;
            match transport.state_of(&id).await? {
                Some(state) => println!("{id}: {state}"),
                None => println!("{id}: not found"),
            }
            Ok(())
        }
        Command::Status { id: None } => {
            let counts = transport.counts().await?;
            println!("{:<10}  {:>10}", "STATE", "COUNT");
            println!("{}", "-".repeat(22));
            println!("{:<10}  {:>10}", "pending", counts.pending);
            println!("{:<10}  {:>10}", "delayed", counts.delayed);
            println!("{:<10}  {:>10}", "working", counts.working);
            println!("{:<10}  {:>10}", "error", counts.error);
            Ok(())
        }
        Command::Remove { id } => {
            let id: MessageId = id.parse()?;
            match transport.remove(&id).await? {
                RemoveStatus::Removed => println!("Removed {id}"),
                RemoveStatus::NotFound => println!("No message {id}"),
            }
            Ok(())
        }
        Command::Maintain { once } => {
            let maintenance = Maintenance::new(transport);
            if once {
                for (kind, affected) in maintenance.sweep_all().await? {
                    println!("{kind:<12} {affected}");
                }
                return Ok(());
            }

            let cancel = CancellationToken::new();
            let signal = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                signal.cancel();
            });
            tracing::info!(sweeps = ?maintenance.kinds(), "maintenance running until Ctrl-C");
            maintenance.run(cancel).await?;
            Ok(())
        }
    }
}
