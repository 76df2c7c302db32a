//! Bootstrap a client, print its consensus/guard stats, and run the SOCKS5
//! listener until interrupted.
//!
//! ```text
//! cargo run --example basic_usage
//! curl -x socks5h://127.0.0.1:9250 https://check.torproject.org
//! ```

use toronoe::{Orchestrator, TorConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut config = TorConfig::default();
    config.socks_port = 9250;
    config.data_directory = std::env::temp_dir().join("toronoe-demo");

    let orchestrator = Orchestrator::bootstrap(config).await?;
    let stats = orchestrator.stats().await;
    println!(
        "bootstrapped: {} idle circuits, {} usable guards, consensus loaded = {}",
        stats.circuits_idle, stats.guards_usable, stats.has_consensus
    );

    println!("SOCKS5 listening on 127.0.0.1:9250, ctrl-c to stop");
    tokio::select! {
        result = orchestrator.run_socks_listener() => result?,
        _ = tokio::signal::ctrl_c() => println!("shutting down"),
    }

    Ok(())
}
