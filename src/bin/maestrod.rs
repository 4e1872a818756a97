//! maestrod, the orchestration runtime daemon.
//!
//! Reads its configuration from the environment (`LLM_PROXY_URL`,
//! `INTERNAL_API_KEY`, `LOG_LEVEL`, `MULTI_AGENT_MODE`, `MAESTRO_BIND`,
//! `MAESTRO_DB`, `LLM_MODEL`), opens the database, spawns the maintenance
//! sweepers, and serves until terminated.

use maestro::config::RuntimeConfig;
use maestro::server;

#[tokio::main]
async fn main() {
    let config = RuntimeConfig::from_env();

    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .init();

    log::info!(
        "starting maestrod (bind={}, db={}, multi_agent={})",
        config.bind_addr,
        config.db_path.display(),
        config.multi_agent_mode
    );

    if let Err(err) = server::run(config).await {
        log::error!("maestrod exited with error: {}", err);
        std::process::exit(1);
    }
}
