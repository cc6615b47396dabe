use anyhow::{Context, Result};
use rabbit_bridge::config::{self, BridgeConfig};
use rabbit_bridge::payload::FakePayloadGenerator;
use rabbit_bridge::rabbitmq;
use rabbit_bridge::{CorrelationRegistry, Requester, Responder};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: rabbit-bridge [responder | requester <id>... | init-config [path]]";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("responder") => {
            run_responder(config::load_config()?).await?;
            Ok(ExitCode::SUCCESS)
        }
        Some("requester") => run_requester(config::load_config()?, &args[2..]).await,
        Some("init-config") => {
            let path = args
                .get(2)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(config::CONFIG_FILE_NAME));
            config::create_default_config_file(&path)?;
            println!("Configuration file created at: {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        _ => {
            println!("{}", USAGE);
            Ok(ExitCode::from(2))
        }
    }
}

async fn run_responder(config: BridgeConfig) -> Result<()> {
    let queue = Arc::new(rabbitmq::work_queue(&config.amqp));
    let broadcast = Arc::new(rabbitmq::broadcast(&config.amqp));
    let responder = Arc::new(Responder::new(
        config.responder_options(),
        broadcast.clone(),
        Arc::new(FakePayloadGenerator),
    ));

    info!("Responder starting...");
    tokio::select! {
        result = responder.run(queue.clone()) => result.context("Responder could not consume requests")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down."),
    }

    queue.close().await.context("Failed to close work queue")?;
    broadcast.close().await.context("Failed to close broadcast")?;
    Ok(())
}

/// Front door: issues one inquiry per ID concurrently and prints each result as JSON.
async fn run_requester(config: BridgeConfig, ids: &[String]) -> Result<ExitCode> {
    let ids: Vec<String> = if ids.is_empty() {
        vec![uuid::Uuid::new_v4().to_string()]
    } else {
        ids.to_vec()
    };

    let queue = Arc::new(rabbitmq::work_queue(&config.amqp));
    let broadcast = Arc::new(rabbitmq::broadcast(&config.amqp));
    let requester = Arc::new(
        Requester::start(
            config.requester_options(),
            Arc::new(CorrelationRegistry::new()),
            queue.clone(),
            broadcast.clone(),
            Arc::new(FakePayloadGenerator),
        )
        .await
        .context("Failed to start requester")?,
    );

    let calls: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let requester = requester.clone();
            tokio::spawn(async move {
                let outcome = requester.inquire(&id).await;
                (id, outcome)
            })
        })
        .collect();

    let mut failures = 0;
    for call in calls {
        let (id, outcome) = call.await.context("Inquiry task panicked")?;
        match outcome {
            Ok(response) => println!("{}", serde_json::to_string(&response)?),
            Err(e) => {
                error!(id = %id, error = %e, "Inquiry failed");
                failures += 1;
            }
        }
    }

    drop(requester);
    queue.close().await.context("Failed to close work queue")?;
    broadcast.close().await.context("Failed to close broadcast")?;

    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
