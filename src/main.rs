use std::{process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use steamwatch::{
    bus::{rabbitmq::RabbitMqBus, BusError, MessageBus},
    cmd::admin::{self, AdminError, ProxyAction, TaskAction},
    config::AppConfig,
    fetcher::HttpFetcher,
    http_client::{HttpClientError, HttpClientPool},
    notifier::{LogNotifier, NotificationError, Notifier, WebhookNotifier},
    persistence::{PersistenceError, Store},
    proxies::ProxyManager,
    supervisor::{Supervisor, SupervisorError},
    worker::{CheckWorker, WorkerConfig, WorkerError},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "steamwatch", version, about = "Steam Market monitoring backend")]
struct Cli {
    /// Path to the configuration file (defaults to config.yaml).
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the monitoring scheduler and result processor.
    Run,
    /// Runs a parsing worker process.
    Worker,
    /// Task administration.
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Proxy administration.
    Proxy {
        #[command(subcommand)]
        action: ProxyAction,
    },
    /// Prints a status snapshot.
    Status,
}

#[derive(Debug, Error)]
enum RunError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
    #[error("worker error: {0}")]
    Worker(#[from] WorkerError),
    #[error("notifier error: {0}")]
    Notifier(#[from] NotificationError),
    #[error("http client error: {0}")]
    HttpClient(#[from] HttpClientError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(error) => {
            let code = if error.use_stderr() { 1 } else { 0 };
            let _ = error.print();
            return ExitCode::from(code);
        }
    };

    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            return ExitCode::from(2);
        }
    };

    match dispatch(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

async fn dispatch(command: Commands, config: AppConfig) -> Result<(), u8> {
    match command {
        Commands::Run => run_supervisor(config).await.map_err(runtime_failure),
        Commands::Worker => run_worker(config).await.map_err(runtime_failure),
        Commands::Task { action } => {
            let store = open_store(&config).await.map_err(runtime_failure)?;
            admin::execute_task(&store, &config, action)
                .await
                .map_err(admin_failure)
        }
        Commands::Proxy { action } => {
            let store = open_store(&config).await.map_err(runtime_failure)?;
            admin::execute_proxy(&store, action).await.map_err(admin_failure)
        }
        Commands::Status => {
            let store = open_store(&config).await.map_err(runtime_failure)?;
            admin::status(&store).await.map_err(admin_failure)
        }
    }
}

fn runtime_failure(error: impl std::fmt::Display) -> u8 {
    eprintln!("error: {error}");
    2
}

fn admin_failure(error: AdminError) -> u8 {
    eprintln!("error: {error}");
    error.exit_code()
}

async fn open_store(config: &AppConfig) -> Result<Store, RunError> {
    let store = Store::connect(&config.database_url, config.statement_timeout_secs).await?;
    store.run_migrations().await?;
    Ok(store)
}

async fn run_supervisor(config: AppConfig) -> Result<(), RunError> {
    let store = open_store(&config).await?;
    let bus: Arc<dyn MessageBus> = Arc::new(RabbitMqBus::connect(&config.amqp_url).await?);

    let notifier: Arc<dyn Notifier> = match &config.webhook {
        Some(settings) => {
            let pool = HttpClientPool::new();
            let client = pool.get_or_create(&config.http_retry).await?;
            Arc::new(WebhookNotifier::new(settings, client)?)
        }
        None => {
            tracing::warn!("no webhook configured, match notifications will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let supervisor = Supervisor::builder()
        .config(config)
        .store(store)
        .bus(bus)
        .notifier(notifier)
        .build()?;

    tracing::info!("supervisor initialized, starting monitoring");
    supervisor.run().await?;
    Ok(())
}

async fn run_worker(config: AppConfig) -> Result<(), RunError> {
    let store = open_store(&config).await?;
    let bus: Arc<dyn MessageBus> = Arc::new(RabbitMqBus::connect(&config.amqp_url).await?);
    let proxies = Arc::new(ProxyManager::new(store.clone(), config.proxy_cool_off_secs));
    let fetcher = Arc::new(HttpFetcher::new(config.fetch_timeout_secs));
    let worker = CheckWorker::new(bus, proxies, fetcher, WorkerConfig::from_app_config(&config));

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("SIGINT received, stopping worker");
            signal_token.cancel();
        }
    });

    worker.run(cancel).await?;
    store.close().await;
    Ok(())
}
