use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use rmcp::ServiceExt;
use tokio::sync::watch;
use vessel_core::{
    ConfigSource, Container, ContainerError, ContainerParts, FileConfigSource, LogLevel,
    MemoryConfigSource, RpcClient, Settings, ShutdownAction, ShutdownRequest,
};
use vessel_runtime::WasmLibraryLoader;

mod logging;
mod manager_client;
mod transport;

use logging::EnvFilterReload;
use manager_client::HttpManagerClient;
use transport::ContainerTools;

#[derive(Parser, Debug)]
#[command(name = "vessel", about = "vessel component container: hosts components on behalf of a Manager")]
struct Cli {
    /// Settings file (TOML); flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Manager address
    #[arg(long)]
    manager: Option<String>,

    /// Container name, as registered with the Manager
    #[arg(long)]
    name: Option<String>,

    /// Configuration-database prefix of container entries
    #[arg(long)]
    config_root: Option<String>,

    /// Worker threads serving RPC requests
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    threads: Option<u32>,

    /// Skip the persisted container configuration
    #[arg(long)]
    dynamic: bool,

    /// Root of the file-backed configuration database
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Precompiled component cache
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Directory relative library paths are resolved against
    #[arg(long)]
    library_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn apply(&self, settings: &mut Settings) {
        if let Some(address) = &self.manager {
            settings.manager.address = address.clone();
        }
        if let Some(name) = &self.name {
            settings.container.name = name.clone();
        }
        if let Some(root) = &self.config_root {
            settings.container.config_root = root.clone();
        }
        if let Some(threads) = self.threads {
            settings.container.server_threads = threads as usize;
        }
        if self.dynamic {
            settings.container.dynamic = true;
        }
        if let Some(dir) = &self.config_dir {
            settings.storage.config_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.cache_dir {
            settings.storage.cache_dir = Some(dir.clone());
        }
    }
}

fn load_settings(cli: &Cli) -> Result<Settings, ContainerError> {
    let mut settings = match &cli.config {
        Some(path) => Settings::from_file(path)?,
        None => Settings::default(),
    };
    cli.apply(&mut settings);
    // A bare level in VESSEL_LOG also becomes the container's default level.
    if let Some(level) = std::env::var(logging::LOG_ENV)
        .ok()
        .and_then(|value| value.parse::<LogLevel>().ok())
    {
        settings.logging.default_level = level;
    }
    settings.validate()?;
    Ok(settings)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("vessel: {e}");
            eprintln!("Run `vessel --help` for usage.");
            return ExitCode::from(1);
        }
    };

    let log_reload = logging::init(settings.logging.default_level, cli.log_json);

    match serve(&cli, settings, log_reload).await {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            tracing::error!(error = %e, "vessel stopped with an error");
            ExitCode::from(1)
        }
    }
}

/// Host containers until one asks to exit; returns the process exit status.
async fn serve(cli: &Cli, mut settings: Settings, log_reload: Arc<EnvFilterReload>) -> Result<u8> {
    let loader = Arc::new(WasmLibraryLoader::new(
        settings.storage.cache_dir.clone(),
        cli.library_dir.clone(),
    )?);

    let (slot, current) = watch::channel(None::<RpcClient>);
    let (closed_tx, mut closed) = watch::channel(false);
    let tools = ContainerTools::new(current);
    tokio::spawn(async move {
        match tools.serve(rmcp::transport::io::stdio()).await {
            Ok(server) => {
                tracing::info!("vessel serving MCP on stdio");
                if let Err(e) = server.waiting().await {
                    tracing::warn!(error = %e, "MCP transport ended with an error");
                }
            }
            Err(e) => tracing::warn!(error = %e, "MCP transport failed to start"),
        }
        closed_tx.send_replace(true);
    });

    loop {
        tracing::info!(
            name = %settings.container.name,
            manager = %settings.manager.address,
            "Starting container"
        );

        let config: Arc<dyn ConfigSource> = match &settings.storage.config_dir {
            Some(dir) => Arc::new(FileConfigSource::new(dir.clone())),
            None => Arc::new(MemoryConfigSource::new()),
        };
        let container = Container::new(
            ContainerParts::new(Arc::new(HttpManagerClient::new(&settings.manager.address)))
                .with_loader(loader.clone())
                .with_config(config)
                .with_log_reload(log_reload.clone()),
        );
        container.init(settings.clone())?;
        let handle = container.connect().await?;
        tracing::info!(%handle, "Connected to Manager");
        slot.send_replace(Some(container.rpc_client()));

        let run = container.run();
        tokio::pin!(run);
        let request = tokio::select! {
            result = &mut run => result?,
            _ = closed.wait_for(|closed| *closed) => {
                tracing::info!("MCP peer went away, disconnecting");
                container.disconnect()?;
                run.await?
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                container.shutdown(ShutdownRequest::EXIT << 8)?;
                run.await?
            }
        };
        slot.send_replace(None);

        match request.action {
            ShutdownAction::Reload => {
                tracing::info!("Reloading container");
                if let Some(path) = &cli.config {
                    settings = Settings::from_file(path)?;
                    cli.apply(&mut settings);
                    settings.validate()?;
                }
            }
            ShutdownAction::Reboot => {
                tracing::warn!(
                    status = request.exit_status,
                    "Host reboot requested; leaving it to the process supervisor"
                );
                return Ok(request.exit_status);
            }
            ShutdownAction::Exit => {
                tracing::info!(status = request.exit_status, "Exiting");
                return Ok(request.exit_status);
            }
        }
    }
}
