//! Hive 命令行入口
//!
//! 初始化日志与配置，组装运行时（MockGenerator + KeywordSimilarity + echo worker），
//! 以命令行参数作为请求运行一个新 thread，并把终态以 JSON 输出。

use std::sync::Arc;

use anyhow::Context;
use hive::config::load_config;
use hive::core::{
    CleanupOutcome, RuntimeBuilder, SchedulerCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, WorkerPoolCleanup,
};
use hive::tools::EchoWorker;
use hive::WorkflowRequest;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init().context("Failed to initialise tracing")?;

    let mut config = load_config(None).context("Failed to load config")?;
    if config.storage.checkpoint_path.is_none() {
        if let Ok(path) = std::env::var("SQLITE_PATH") {
            config.storage.checkpoint_path = Some(path.into());
        }
    }

    let request = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let request = if request.trim().is_empty() {
        "Hello".to_string()
    } else {
        request
    };

    let runtime = RuntimeBuilder::new(config)
        .with_worker(EchoWorker)
        .build()
        .context("Failed to build runtime")?;
    runtime.scheduler.start();

    let manager = Arc::new(ShutdownManager::new());
    manager.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&manager));
    coordinator.register(SchedulerCleanup::new(Arc::clone(&runtime.scheduler)));
    coordinator.register(WorkerPoolCleanup::new(runtime.worker_pool.clone()));

    let thread_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(thread_id = %thread_id, "running request");
    let outcome = runtime
        .engine
        .run_with_cancel(&thread_id, WorkflowRequest::new(request), &manager.token())
        .await;

    manager.shutdown(ShutdownReason::Completed);
    for (name, outcome) in coordinator.run_cleanup().await {
        if outcome != CleanupOutcome::Done {
            tracing::warn!(cleanup = name, ?outcome, "cleanup did not finish cleanly");
        }
    }

    let state = outcome.context("Workflow failed")?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
