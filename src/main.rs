//! Binary entry point. Flag parsing and torrc loading are external
//! collaborators' job (§1 Non-goals); this binary only reads a handful of
//! environment variables for the options most worth overriding at startup
//! and otherwise runs on [`toronoe::TorConfig::default`].

use std::process::ExitCode;
use toronoe::{Orchestrator, TorConfig, TorError};
use tracing_subscriber::EnvFilter;

fn config_from_env() -> Result<TorConfig, TorError> {
    let mut config = TorConfig::default();

    if let Ok(port) = std::env::var("TORONOE_SOCKS_PORT") {
        config.socks_port = port
            .parse()
            .map_err(|_| TorError::ConfigInvalid(format!("TORONOE_SOCKS_PORT {port:?} is not a u16")))?;
    }
    if let Ok(dir) = std::env::var("TORONOE_DATA_DIR") {
        config.data_directory = dir.into();
    }
    if let Ok(level) = std::env::var("TORONOE_LOG_LEVEL") {
        config.log_level = level.parse()?;
    }
    if let Ok(mirrors) = std::env::var("TORONOE_DIRECTORY_MIRRORS") {
        config.directory_mirrors = mirrors.split(',').map(|s| s.trim().to_string()).collect();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match config_from_env() {
        Ok(c) => c,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(1);
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let orchestrator = match Orchestrator::bootstrap(config).await {
        Ok(o) => o,
        Err(err) => {
            tracing::error!(%err, "fatal error during startup");
            return ExitCode::from(2);
        }
    };

    let listener = tokio::spawn(Orchestrator::run_socks_listener(orchestrator));

    tokio::select! {
        result = listener => {
            if let Ok(Err(err)) = result {
                tracing::error!(%err, "SOCKS5 listener exited with an error");
                return ExitCode::from(2);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    ExitCode::SUCCESS
}
