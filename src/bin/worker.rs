//! Standalone worker runner: one worker kind per process, for deployments
//! that scale the allocator, promotion, outbox, closer and notifier loops
//! independently of the API.

use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use courtbook::allocator::run_registration_worker;
use courtbook::allocator::WorkerScope;
use courtbook::closer::init_closer_worker;
use courtbook::configuration::get_configuration;
use courtbook::notifier::init_notifier_worker;
use courtbook::outbox::init_outbox_worker;
use courtbook::promotion::run_promotion_worker;
use courtbook::telemetry::get_subscriber;
use courtbook::telemetry::init_subscriber;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "worker", about = "courtbook background workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume per-session registration streams and run the allocator
    Allocator {
        /// Process a single session's stream
        #[arg(long, conflicts_with = "all")]
        session_id: Option<Uuid>,
        /// Process every scheduled session
        #[arg(long)]
        all: bool,
        /// Consumer name within the group; defaults to the pid
        #[arg(long)]
        consumer: Option<String>,
    },
    /// Consume per-session promotion streams and run promotion passes
    Promotion {
        #[arg(long, conflicts_with = "all")]
        session_id: Option<Uuid>,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        consumer: Option<String>,
    },
    /// Publish outbox events to the realtime bus
    Outbox,
    /// Close sessions whose start time passed by the grace period
    Closer,
    /// Tail the realtime bus and record deliveries
    Notifier,
}

fn scope(
    session_id: Option<Uuid>,
    all: bool,
) -> Result<WorkerScope, anyhow::Error> {
    match (session_id, all) {
        (Some(id), false) => Ok(WorkerScope::Session(id)),
        (None, true) => Ok(WorkerScope::All),
        _ => bail!("provide exactly one of --session-id or --all"),
    }
}

fn consumer_name(consumer: Option<String>) -> String {
    consumer.unwrap_or_else(|| format!("c-{}", std::process::id()))
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("courtbook-worker", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cli = Cli::parse();
    let cfg = get_configuration()?;

    match cli.command {
        Command::Allocator {
            session_id,
            all,
            consumer,
        } => {
            run_registration_worker(cfg, scope(session_id, all)?, consumer_name(consumer)).await
        }
        Command::Promotion {
            session_id,
            all,
            consumer,
        } => run_promotion_worker(cfg, scope(session_id, all)?, consumer_name(consumer)).await,
        Command::Outbox => init_outbox_worker(cfg).await,
        Command::Closer => init_closer_worker(cfg).await,
        Command::Notifier => init_notifier_worker(cfg).await,
    }
}
