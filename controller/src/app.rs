//! Core application

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api::ApiServer;
use crate::core::cli::{self, CliConfig, Commands, SystemCommands};
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::core::storage::AppStorage;
use crate::data::SqliteService;
use crate::domain::asynccall::{Executor, LeaseReaper};
use crate::domain::deployments::Reconciler;
use crate::domain::encryption::{PassthroughCodec, PayloadCodec};
use crate::domain::pubsub::{Progressor, Publisher};
use crate::domain::routing::{HttpVerbInvoker, RouteTable};

pub struct ControllerApp {
    pub shutdown: ShutdownService,
    pub config: AppConfig,
    pub storage: AppStorage,
    pub database: Arc<SqliteService>,
    pub publisher: Arc<Publisher>,
    pub reconciler: Arc<Reconciler>,
    pub routes: Arc<RouteTable>,
    progressor: Arc<Progressor>,
    executor: Arc<Executor>,
    reaper: Arc<LeaseReaper>,
}

impl ControllerApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Controller starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        match command {
            Some(Commands::System {
                command: system_cmd,
            }) => {
                return Self::handle_system_command(system_cmd);
            }
            Some(Commands::Start) | None => {}
        }

        let app = Self::init(&cli_config).await?;
        Self::start_server(app).await
    }

    async fn init(cli: &CliConfig) -> Result<Self> {
        let config = AppConfig::load(cli)?;
        let storage = AppStorage::init().await?;
        let database = Arc::new(SqliteService::init(&storage).await?);
        let pool = database.pool().clone();

        let codec: Arc<dyn PayloadCodec> = Arc::new(PassthroughCodec);
        let routes = RouteTable::new(pool.clone());
        let publisher = Arc::new(Publisher::new(pool.clone(), codec.clone()));
        let reconciler = Arc::new(Reconciler::new(pool.clone()));

        let progressor = Progressor::new(pool.clone(), config.progressor_config());
        let executor = Executor::new(
            pool.clone(),
            Arc::new(HttpVerbInvoker::new()),
            codec,
            routes.clone(),
            config.executor_config(),
        );
        let reaper = LeaseReaper::new(pool, config.executor.reap_interval);

        let shutdown = ShutdownService::new(database.clone());

        Ok(Self {
            shutdown,
            config,
            storage,
            database,
            publisher,
            reconciler,
            routes,
            progressor,
            executor,
            reaper,
        })
    }

    fn handle_system_command(cmd: SystemCommands) -> Result<()> {
        match cmd {
            SystemCommands::Prune { yes } => Self::prune_data(yes),
        }
    }

    fn prune_data(skip_confirm: bool) -> Result<()> {
        let data_dir = AppStorage::resolve_data_dir();

        if !data_dir.exists() {
            println!(
                "Nothing to prune. Data directory does not exist: {}",
                data_dir.display()
            );
            return Ok(());
        }

        let data_dir = data_dir.canonicalize().unwrap_or(data_dir);

        println!("This will permanently delete the local data directory:");
        println!("  {}", data_dir.display());
        println!();
        println!(
            "Make sure no controller is running against it. \
             Deleting data under a live controller will cause data corruption."
        );

        if !skip_confirm {
            print!("\nContinue? [y/N] ");
            std::io::Write::flush(&mut std::io::stdout())?;

            let mut input = String::new();
            std::io::stdin().read_line(&mut input)?;

            if !matches!(input.trim().to_lowercase().as_str(), "y" | "yes") {
                println!("Aborted.");
                return Ok(());
            }
        }

        std::fs::remove_dir_all(&data_dir)
            .with_context(|| format!("Failed to delete data directory: {}", data_dir.display()))?;
        println!("Pruned: {}", data_dir.display());
        Ok(())
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn start_server(app: Self) -> Result<()> {
        // Install signal handlers FIRST (before any blocking calls)
        app.shutdown.install_signal_handlers();

        app.start_background_tasks().await;

        tracing::info!(
            host = app.config.server.host,
            port = app.config.server.port,
            data_dir = %app.storage.data_dir().display(),
            "Controller ready"
        );

        let server = ApiServer::new(app);
        let app = server.start().await?;
        app.shutdown.shutdown().await;

        Ok(())
    }

    pub async fn start_background_tasks(&self) {
        self.shutdown
            .register(
                self.database
                    .start_checkpoint_task(self.shutdown.subscribe()),
            )
            .await;

        self.shutdown
            .register(self.progressor.start(self.shutdown.subscribe()))
            .await;

        self.shutdown
            .register(self.executor.start(self.shutdown.subscribe()))
            .await;

        self.shutdown
            .register(self.reaper.start(self.shutdown.subscribe()))
            .await;

        tracing::debug!("Background tasks started");
    }
}
