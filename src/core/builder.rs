//! 运行时构建器：按 AppConfig 组装记忆、分发器、引擎、checkpoint 存储与整理调度器
//!
//! 所有组件都在这里显式构造并注入，调度器需调用方显式 start / shutdown。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::{HiveError, TaskScheduler};
use crate::llm::{
    GenerationProvider, KeywordSimilarity, MockGenerator, RetryPolicy, SimilarityProvider,
};
use crate::memory::{
    MemoryScope, MemoryStore, Namespace, ReflectionScheduler, SalienceCurator, SalienceScorer,
};
use crate::react::{Critic, GenerativeClassifier, Planner, RouteClassifier, WorkflowEvent};
use crate::tools::{TaskDispatcher, Worker, WorkerRegistry};
use crate::workflow::{
    CheckpointStore, InMemoryCheckpointStore, SqliteCheckpointStore, WorkflowEngine,
};

/// 组装完成的运行时
pub struct Runtime {
    pub engine: Arc<WorkflowEngine>,
    pub memory: Arc<MemoryStore>,
    pub scheduler: Arc<ReflectionScheduler>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub registry: Arc<WorkerRegistry>,
    /// 分发器共享的 worker 并发池
    pub worker_pool: TaskScheduler,
}

impl Runtime {
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

pub struct RuntimeBuilder {
    config: AppConfig,
    generator: Option<Arc<dyn GenerationProvider>>,
    similarity: Option<Arc<dyn SimilarityProvider>>,
    classifier: Option<Arc<dyn RouteClassifier>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    workers: Vec<Arc<dyn Worker>>,
    event_tx: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            generator: None,
            similarity: None,
            classifier: None,
            checkpoints: None,
            workers: Vec::new(),
            event_tx: None,
        }
    }

    /// 未设置时使用 MockGenerator
    pub fn with_generator(mut self, generator: Arc<dyn GenerationProvider>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// 未设置时使用 KeywordSimilarity
    pub fn with_similarity(mut self, similarity: Arc<dyn SimilarityProvider>) -> Self {
        self.similarity = Some(similarity);
        self
    }

    /// 未设置时使用基于生成提供方的 GenerativeClassifier
    pub fn with_classifier(mut self, classifier: Arc<dyn RouteClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// 未设置时按 storage.checkpoint_path 选择 SQLite 或进程内存储
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    pub fn with_worker(mut self, worker: impl Worker + 'static) -> Self {
        self.workers.push(Arc::new(worker));
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn build(self) -> Result<Runtime, HiveError> {
        let config = self.config;

        let mut registry = WorkerRegistry::new();
        for worker in self.workers {
            registry
                .register_arc(worker)
                .map_err(|e| HiveError::Config(e.to_string()))?;
        }
        let registry = Arc::new(registry);

        let checkpoints: Arc<dyn CheckpointStore> =
            match (self.checkpoints, &config.storage.checkpoint_path) {
                (Some(store), _) => store,
                (None, Some(path)) => {
                    tracing::info!(path = %path.display(), "using sqlite checkpoint store");
                    Arc::new(SqliteCheckpointStore::open(path)?)
                }
                (None, None) => Arc::new(InMemoryCheckpointStore::new()),
            };

        let generator = self
            .generator
            .unwrap_or_else(|| Arc::new(MockGenerator));
        let similarity = self
            .similarity
            .unwrap_or_else(|| Arc::new(KeywordSimilarity::new()));
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(GenerativeClassifier::new(Arc::clone(&generator))));

        let memory = Arc::new(
            MemoryStore::new(similarity, SalienceScorer::new(config.scoring))
                .with_oversample(config.memory.search_oversample),
        );

        let worker_pool = TaskScheduler::new(config.dispatch.max_concurrent_workers);
        let dispatcher = Arc::new(
            TaskDispatcher::new(Arc::clone(&registry), config.dispatch.timeout_ms)
                .with_scheduler(worker_pool.clone()),
        );

        let mut engine = WorkflowEngine::new(
            Planner::new(generator, registry.to_catalogue_json()),
            Critic::new(classifier),
            dispatcher,
            Arc::clone(&memory),
            Arc::clone(&checkpoints),
        )
        .with_max_steps(config.engine.max_steps)
        .with_retry_policy(RetryPolicy::new(
            config.engine.max_retries,
            config.engine.backoff_base_ms,
        ))
        .with_memory_context_k(config.engine.memory_context_k);
        if let Some(tx) = self.event_tx {
            engine = engine.with_events(tx);
        }

        let curator = SalienceCurator::new(Arc::clone(&memory), config.curation.threshold);
        let scheduler = Arc::new(ReflectionScheduler::new(Arc::new(curator)));
        let interval = Duration::from_secs(config.curation.interval_secs.max(1));
        scheduler.add_group("semantic", vec![Namespace::semantic()], interval);
        if let (Some(agent), Some(user), Some(task)) = (
            &config.curation.agent_id,
            &config.curation.user_id,
            &config.curation.task_id,
        ) {
            let scope = MemoryScope::new(agent.clone(), user.clone(), task.clone());
            let [_, episodes, instructions, procedures] = scope.namespaces();
            scheduler.add_group(
                format!("{agent}/{user}/{task}"),
                vec![episodes, instructions, procedures],
                interval,
            );
        }

        Ok(Runtime {
            engine: Arc::new(engine),
            memory,
            scheduler,
            checkpoints,
            registry,
            worker_pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoWorker;
    use crate::workflow::{WorkflowRequest, WorkflowStatus};

    #[tokio::test]
    async fn test_default_runtime_runs_mock_flow() {
        let runtime = RuntimeBuilder::new(AppConfig::default())
            .with_worker(EchoWorker)
            .build()
            .unwrap();
        let state = runtime
            .engine
            .run("b1", WorkflowRequest::new("ping"))
            .await
            .unwrap();
        assert_eq!(state.status, WorkflowStatus::Done);
        assert_eq!(state.tool_results["echo"].output().unwrap()["text"], "Echo from Mock: ping");
        runtime.shutdown().await;
    }

    #[test]
    fn test_scope_group_registered() {
        let mut config = AppConfig::default();
        config.curation.agent_id = Some("sup".to_string());
        config.curation.user_id = Some("u".to_string());
        config.curation.task_id = Some("t".to_string());
        let runtime = RuntimeBuilder::new(config).build().unwrap();
        let groups = runtime.scheduler.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].namespaces.len(), 3);
    }

    #[test]
    fn test_duplicate_worker_is_config_error() {
        let err = RuntimeBuilder::new(AppConfig::default())
            .with_worker(EchoWorker)
            .with_worker(EchoWorker)
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, HiveError::Config(_)));
    }
}
