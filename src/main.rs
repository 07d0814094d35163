use std::fmt::Debug;
use std::fmt::Display;

use courtbook::allocator::init_registration_worker;
use courtbook::closer::init_closer_worker;
use courtbook::configuration::get_configuration;
use courtbook::outbox::init_outbox_worker;
use courtbook::promotion::init_promotion_worker;
use courtbook::startup::Application;
use courtbook::telemetry::get_subscriber;
use courtbook::telemetry::init_subscriber;
use tokio::task::JoinError;

fn report_exit(
    name: &str,
    outcome: Result<Result<(), impl Debug + Display>, JoinError>,
) {
    match outcome {
        Ok(Ok(())) => {
            tracing::info!("{name} exited gracefully")
        }
        Ok(Err(e)) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} failed"
            )
        }
        Err(e) => {
            tracing::error!(
                error.cause_chain = ?e,
                error.message = %e,
                "{name} task panicked or was cancelled"
            )
        }
    }
}

/// API plus all background workers in one process. For separate processes
/// (one worker per deployment unit) use the `worker` binary instead.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let subscriber = get_subscriber("courtbook", "info", std::io::stdout);
    init_subscriber(subscriber);

    let cfg = get_configuration()?;

    let server = Application::build(cfg.clone()).await?.run_until_stopped();
    let server_task = tokio::spawn(server);
    let registration_task = tokio::spawn(init_registration_worker(cfg.clone()));
    let promotion_task = tokio::spawn(init_promotion_worker(cfg.clone()));
    let outbox_task = tokio::spawn(init_outbox_worker(cfg.clone()));
    let closer_task = tokio::spawn(init_closer_worker(cfg));

    // return when the first branch completes, cancelling the rest
    tokio::select! {
        o = server_task => report_exit("API", o),
        o = registration_task => report_exit("registration worker", o),
        o = promotion_task => report_exit("promotion worker", o),
        o = outbox_task => report_exit("outbox dispatcher", o),
        o = closer_task => report_exit("session closer", o),
    }

    Ok(())
}
