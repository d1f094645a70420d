//! sandbox-runner
//!
//! `worker` serves execution requests for one language from the message
//! queue. `invoke` submits a source file through the same queues and prints
//! the result, which is handy for smoke-testing a deployment.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sandbox_runner::client::RpcClient;
use sandbox_runner::config::Config;
use sandbox_runner::identity;
use sandbox_runner::language::Language;
use sandbox_runner::mq::{AmqpBroker, Broker};
use sandbox_runner::runtime::Runtime;
use sandbox_runner::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "sandbox-runner")]
#[command(about = "Queue-driven sandboxed execution of Go and JavaScript snippets")]
struct Args {
    /// Log level (trace, debug, info, warn, error); defaults by MODE
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Consume execution requests and publish results
    Worker {
        #[arg(long, value_enum)]
        language: Language,
    },
    /// Submit a source file (or stdin) and print the result
    Invoke {
        #[arg(long, value_enum)]
        language: Language,

        /// Source file; reads stdin when omitted
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let dotenv = dotenvy::dotenv();

    let language = match args.command {
        Command::Worker { language } | Command::Invoke { language, .. } => language,
    };
    let config = Config::from_env(language).context("Failed to load configuration")?;

    // Logs go to stderr so `invoke` output stays clean
    let level = args
        .log_level
        .as_deref()
        .unwrap_or_else(|| config.mode.default_log_level());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dotenv {
        warn!(error = %e, "Could not load .env file");
    }

    match args.command {
        Command::Worker { .. } => run_worker(config).await,
        Command::Invoke { file, .. } => invoke(config, file).await,
    }
}

async fn run_worker(config: Config) -> Result<()> {
    config.validate()?;
    info!(
        language = %config.language,
        recv_queue = %config.mq.recv_queue,
        resp_queue = %config.mq.resp_queue,
        dir = %config.runtime.dir.display(),
        "Loaded configuration"
    );

    let env = identity::from_config(&config.runtime)?;
    let runtime = Runtime::new(
        config.runtime.dir.clone(),
        env,
        config.language,
        config.runtime.exec_timeout,
    );

    let broker = Arc::new(
        AmqpBroker::connect(&config.mq.url())
            .await
            .with_context(|| format!("Dialling {}", config.mq.addr))?,
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down application");
        }
        signal.cancel();
    });

    let worker = Worker::new(
        Arc::new(runtime),
        Arc::clone(&broker) as Arc<dyn Broker>,
        config.mq.recv_queue.clone(),
        config.mq.resp_queue.clone(),
    );
    worker.run(shutdown).await?;

    broker.close().await
}

async fn invoke(config: Config, file: Option<PathBuf>) -> Result<()> {
    let code = match file {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .context("Failed to read stdin")?;
            code
        }
    };

    let broker = Arc::new(
        AmqpBroker::connect(&config.mq.url())
            .await
            .with_context(|| format!("Dialling {}", config.mq.addr))?,
    );
    let client = RpcClient::from_config(Arc::clone(&broker) as Arc<dyn Broker>, &config);

    let result = client.run(&code).await;
    broker.close().await?;
    let result = result?;

    let mut stdout = std::io::stdout();
    stdout.write_all(&result.stdout)?;
    stdout.flush()?;
    std::io::stderr().write_all(&result.stderr)?;
    info!(exit_code = result.exit_code, took = ?result.duration, "Execution finished");

    std::process::exit(result.exit_code);
}
