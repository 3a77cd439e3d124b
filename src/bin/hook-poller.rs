//! Runs one poll of a single shard: read due events, process them, exit.
//!
//! Configuration comes from `HOOKS_DATABASE_URL`, `HOOKS_GROUP_ID` and
//! `HOOKS_LOG`. Schedule it externally, one process per shard.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use hook_engine::{
    DispatchEngine, EngineConfig, PluginResolver, PostgresStorage, ProcessEnv, ReqwestHttpClient,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = EngineConfig::from_env(&ProcessEnv);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Some(database_url) = config.database_url.clone() else {
        tracing::error!("HOOKS_DATABASE_URL is not set");
        return ExitCode::FAILURE;
    };

    let storage = match PostgresStorage::connect(&database_url).await {
        Ok(storage) => Arc::new(storage),
        Err(err) => {
            tracing::error!(error = %err, "cannot open storage");
            return ExitCode::FAILURE;
        }
    };

    let resolver = Arc::new(PluginResolver::with_builtins(Arc::new(ReqwestHttpClient::new())));
    let group_id = config.group_id;

    let engine = match DispatchEngine::new(config, storage.clone(), storage, resolver).await {
        Ok(engine) => engine,
        Err(err) => {
            tracing::error!(error = %err, "engine failed to start");
            return ExitCode::FAILURE;
        }
    };

    let due = engine.get_due(Utc::now(), group_id).await;
    let found = due.len();
    let report = engine.process(due).await;

    tracing::info!(
        correlation = %engine.correlation_id(),
        group_id,
        found,
        processed = report.processed,
        failed = report.failed,
        "poll finished"
    );

    if report.failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
