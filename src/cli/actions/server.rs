use crate::{
    api::{self, AppState},
    cli::telemetry,
    config::Config,
};
use anyhow::{Context, Result};
use std::{path::PathBuf, sync::Arc};
use tracing::{debug, info};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub config: PathBuf,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the configuration is invalid, a collaborator cannot be
/// initialized or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    debug!("Server args: {:?}", args);

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration {}", args.config.display()))?;

    info!(
        rules = config.access_control.rules.len(),
        default_policy = %config.access_control.default_policy,
        max_retries = config.regulation.max_retries,
        "Configuration loaded"
    );

    let state = Arc::new(AppState::from_config(&config).await?);

    let result = api::serve(args.port, state).await;
    telemetry::shutdown_tracer();
    result
}
