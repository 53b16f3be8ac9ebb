use anyhow::{Context, Result, bail};
use clap::Parser;
use dialoguer::{Confirm, Password};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use roomkeeper::config::RoomkeeperConfig;
use roomkeeper::engine::dispatcher::{Dispatcher, DispatcherOptions};
use roomkeeper::gateway::{Credentials, Gateway, MatrixGateway};
use roomkeeper::report;
use roomkeeper::strategy::ProfileStrategy;

/// Keeps per-room display names, avatars and space membership in shape.
#[derive(Parser, Debug)]
#[command(name = "roomkeeper", version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "roomkeeper.toml")]
    config: String,

    /// Apply the initial plan without asking.
    #[arg(long)]
    yes: bool,

    /// Skip the startup pass over every room.
    #[arg(long)]
    no_initial_pass: bool,

    /// Exit after the startup pass instead of listening for events.
    #[arg(long)]
    no_listen: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = RoomkeeperConfig::load(&cli.config)?;
    config.validate().map_err(anyhow::Error::msg).context("invalid configuration")?;
    let strategy = ProfileStrategy::from_config(&config)
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    let password = match std::env::var("ROOMKEEPER_PASSWORD") {
        Ok(password) => password,
        Err(_) => Password::new()
            .with_prompt(format!("Password for {}", config.account.user_id))
            .interact()
            .context("failed to read password")?,
    };

    let mut gateway = MatrixGateway::new(&config.account.homeserver);
    let session = gateway
        .login(&Credentials {
            user_id: config.account.user_id.clone(),
            password,
            device_id: config.account.device_id.clone(),
        })
        .await
        .context("login failed")?;
    info!(user_id = %session.user_id, device_id = %session.device_id, "logged in");

    let options = DispatcherOptions::from_config(&config);
    let mut dispatcher = Dispatcher::new(gateway, strategy, &session.user_id, options);

    let result = run(&mut dispatcher, &cli, &config).await;
    dispatcher.shutdown().await;
    result
}

async fn run(
    dispatcher: &mut Dispatcher<MatrixGateway, ProfileStrategy>,
    cli: &Cli,
    config: &RoomkeeperConfig,
) -> Result<()> {
    dispatcher.bootstrap().await.context("startup sync failed")?;

    if config.run.initial_pass && !cli.no_initial_pass {
        let plan = dispatcher.plan_all().await?;
        if plan.is_empty() {
            info!("nothing to change");
        } else {
            print!("{}", report::render_renames(&plan.renames));
            print!("{}", report::render_space_changes(&plan.spaces));

            let apply = cli.yes
                || Confirm::new()
                    .with_prompt("Apply these changes?")
                    .default(false)
                    .interact()
                    .context("failed to read confirmation")?;
            if apply {
                let summary = dispatcher.execute(&plan).await?;
                info!(applied = summary.applied, failed = summary.failed, "initial pass done");
            } else {
                warn!("initial plan discarded");
            }
        }
    }

    if !config.run.listen || cli.no_listen {
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
        }
        on_signal.cancel();
    });

    if let Err(e) = dispatcher.listen(cancel).await {
        bail!("event loop stopped: {e}");
    }
    Ok(())
}
