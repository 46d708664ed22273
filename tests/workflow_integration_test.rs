//! 工作流集成测试

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hive::config::AppConfig;
use hive::core::{HiveError, RuntimeBuilder};
use hive::llm::{ProviderError, ScriptedGenerator};
use hive::memory::{MemoryKind, MemoryScope};
use hive::react::{OutcomeClassifier, WorkflowEvent};
use hive::tools::Worker;
use hive::workflow::{CheckpointStore, FailureReason, InMemoryCheckpointStore, WorkflowStatus};
use hive::WorkflowRequest;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// 记录调用次数与收到的输入
#[derive(Default)]
struct CallLog {
    calls: AtomicUsize,
    inputs: Mutex<Vec<Value>>,
}

#[derive(Clone, Default)]
struct ResearchWorker {
    log: Arc<CallLog>,
    delay_ms: u64,
}

#[async_trait]
impl Worker for ResearchWorker {
    fn name(&self) -> &str {
        "research"
    }

    fn description(&self) -> &str {
        "Look up facts. Input: {\"query\": \"...\"}"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn invoke(&self, input: Value) -> Result<Value, String> {
        self.log.calls.fetch_add(1, Ordering::SeqCst);
        self.log.inputs.lock().unwrap().push(input.clone());
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        Ok(json!({ "findings": format!("notes on {}", input["query"].as_str().unwrap_or("")) }))
    }
}

/// 第一次失败，之后成功
#[derive(Clone, Default)]
struct FlakyWorker {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for FlakyWorker {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Fails once"
    }

    async fn invoke(&self, _input: Value) -> Result<Value, String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Err("boom".to_string())
        } else {
            Ok(json!("fine"))
        }
    }
}

fn research_call(query: &str) -> Value {
    json!({
        "plan": "research the topic",
        "calls": [{ "worker": "research", "input": { "query": query } }],
        "complete": false
    })
}

#[tokio::test]
async fn test_research_request_completes_and_resume_is_idempotent() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_json(research_call("rust async runtimes"))
            .then_json(json!({ "is_complete": true, "memory_summary": "compared tokio and smol" })),
    );
    let worker = ResearchWorker::default();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let runtime = RuntimeBuilder::new(AppConfig::default())
        .with_generator(generator.clone())
        .with_worker(worker.clone())
        .with_events(tx)
        .build()
        .unwrap();

    let state = runtime
        .engine
        .run("thread-1", WorkflowRequest::new("Survey rust async runtimes"))
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Done);
    assert!(state.task_complete);
    assert_eq!(state.step_count, 1);
    assert_eq!(state.summary.as_deref(), Some("compared tokio and smol"));
    assert_eq!(worker.log.calls.load(Ordering::SeqCst), 1);
    // worker 只收到 input，看不到 supervisor 状态
    assert_eq!(
        worker.log.inputs.lock().unwrap()[0],
        json!({ "query": "rust async runtimes" })
    );

    let scope = MemoryScope::default();
    let episodes = runtime.memory.list(&scope.episodes()).await;
    assert_eq!(episodes.len(), 1);
    assert_eq!(episodes[0].kind(), MemoryKind::Episodic);
    assert_eq!(runtime.memory.list(&scope.procedures()).await.len(), 1);

    let resumed = runtime.engine.resume("thread-1").await.unwrap();
    assert_eq!(resumed, state);
    assert_eq!(worker.log.calls.load(Ordering::SeqCst), 1);
    assert_eq!(generator.calls(), 2);

    let mut saw_completed = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, WorkflowEvent::Completed { .. }) {
            saw_completed = true;
        }
    }
    assert!(saw_completed);
}

#[tokio::test]
async fn test_worker_failure_is_fed_back_to_planner() {
    let delegate_flaky = json!({ "calls": [{ "worker": "flaky", "input": {} }] });
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_json(delegate_flaky.clone())
            .then_json(delegate_flaky),
    );
    let flaky = FlakyWorker::default();
    let runtime = RuntimeBuilder::new(AppConfig::default())
        .with_generator(generator.clone())
        .with_classifier(Arc::new(OutcomeClassifier))
        .with_worker(flaky.clone())
        .build()
        .unwrap();

    let state = runtime
        .engine
        .run("thread-2", WorkflowRequest::new("do the flaky thing"))
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Done);
    assert_eq!(state.step_count, 2);
    assert_eq!(state.actions.len(), 2);
    assert!(!state.actions[0].result.is_ok());
    assert!(state.actions[1].result.is_ok());
    let second_prompt = &generator.prompts()[1];
    assert!(second_prompt.contains("worker 'flaky' failed: boom"));
}

#[tokio::test]
async fn test_max_steps_exceeded() {
    let mut generator = ScriptedGenerator::new();
    for _ in 0..3 {
        generator = generator.then_json(research_call("again"));
    }
    let mut config = AppConfig::default();
    config.engine.max_steps = 3;
    let runtime = RuntimeBuilder::new(config)
        .with_generator(Arc::new(generator))
        .with_classifier(Arc::new(AlwaysContinue))
        .with_worker(ResearchWorker::default())
        .build()
        .unwrap();

    let state = runtime
        .engine
        .run("thread-3", WorkflowRequest::new("never satisfied"))
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Error);
    assert_eq!(state.step_count, 3);
    let diagnostic = state.diagnostic.unwrap();
    assert_eq!(diagnostic.reason, FailureReason::MaxStepsExceeded);
    assert_eq!(diagnostic.reason.as_str(), "max_steps_exceeded");
}

struct AlwaysContinue;

#[async_trait]
impl hive::react::RouteClassifier for AlwaysContinue {
    async fn classify(
        &self,
        _state: &hive::WorkflowState,
    ) -> Result<hive::react::RouteDecision, ProviderError> {
        Ok(hive::react::RouteDecision::proceed(Some("keep going".to_string())))
    }
}

#[tokio::test]
async fn test_transient_errors_are_retried_then_surface_as_error() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_err(ProviderError::RateLimited { retry_after_ms: Some(5) })
            .then_json(research_call("q"))
            .then_err(ProviderError::Timeout)
            .then_err(ProviderError::Timeout)
            .then_err(ProviderError::Timeout)
            .then_err(ProviderError::Timeout),
    );
    let mut config = AppConfig::default();
    config.engine.max_retries = 3;
    config.engine.backoff_base_ms = 1;
    let runtime = RuntimeBuilder::new(config)
        .with_generator(generator.clone())
        .with_worker(ResearchWorker::default())
        .build()
        .unwrap();

    let state = runtime
        .engine
        .run("thread-4", WorkflowRequest::new("x"))
        .await
        .unwrap();

    assert_eq!(state.status, WorkflowStatus::Error);
    let diagnostic = state.diagnostic.unwrap();
    assert_eq!(diagnostic.reason, FailureReason::ProviderRetriesExhausted);
    assert_eq!(diagnostic.stage, "reviewing");
    assert_eq!(diagnostic.attempts, 4);
    assert_eq!(generator.calls(), 6);
    // 最后一次提交的状态保留了已完成的动作
    assert_eq!(state.actions.len(), 1);
}

#[tokio::test]
async fn test_concurrent_resumers_single_owner() {
    let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
    let slow = ResearchWorker {
        delay_ms: 200,
        ..Default::default()
    };

    let owner = RuntimeBuilder::new(AppConfig::default())
        .with_generator(Arc::new(
            ScriptedGenerator::new()
                .then_json(research_call("shared"))
                .then_json(json!({ "is_complete": true })),
        ))
        .with_worker(slow.clone())
        .with_checkpoint_store(Arc::clone(&checkpoints))
        .build()
        .unwrap();
    let intruder = RuntimeBuilder::new(AppConfig::default())
        .with_generator(Arc::new(ScriptedGenerator::new()))
        .with_worker(slow.clone())
        .with_checkpoint_store(Arc::clone(&checkpoints))
        .build()
        .unwrap();

    let owner_engine = Arc::clone(&owner.engine);
    let first = tokio::spawn(async move {
        owner_engine
            .run("thread-5", WorkflowRequest::new("shared work"))
            .await
    });

    // 等到 owner 已提交 ACTING
    let mut acting = false;
    for _ in 0..200 {
        if let Some(entry) = checkpoints.get("thread-5").await.unwrap() {
            if entry.state().unwrap().status == WorkflowStatus::Acting {
                acting = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(acting);

    let second = intruder.engine.resume("thread-5").await;
    let first = first.await.unwrap();

    let outcomes = [first.is_ok(), second.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let loser = if first.is_err() { first.err() } else { second.err() };
    assert!(matches!(loser, Some(HiveError::StateConflict { .. })));
}

fn cancel_after(ms: u64) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        trigger.cancel();
    });
    cancel
}

#[tokio::test]
async fn test_cancel_waits_for_in_flight_worker_call() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_json(research_call("slow topic"))
            .then_json(json!({ "is_complete": true })),
    );
    let worker = ResearchWorker {
        delay_ms: 200,
        ..Default::default()
    };
    let runtime = RuntimeBuilder::new(AppConfig::default())
        .with_generator(generator.clone())
        .with_worker(worker.clone())
        .build()
        .unwrap();

    let cancel = cancel_after(50);
    let err = runtime
        .engine
        .run_with_cancel("thread-6", WorkflowRequest::new("slow"), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, HiveError::Cancelled));
    // 进行中的调用跑完并落盘，取消只在下一次状态转换前生效
    assert_eq!(worker.log.calls.load(Ordering::SeqCst), 1);
    let state = runtime
        .checkpoints
        .get("thread-6")
        .await
        .unwrap()
        .unwrap()
        .state()
        .unwrap();
    assert_eq!(state.status, WorkflowStatus::Reviewing);
    assert!(state.tool_results["research"].is_ok());
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn test_cancel_interrupts_retry_backoff() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .then_err(ProviderError::RateLimited {
                retry_after_ms: Some(10_000),
            })
            .then_json(research_call("never reached")),
    );
    let worker = ResearchWorker::default();
    let runtime = RuntimeBuilder::new(AppConfig::default())
        .with_generator(generator.clone())
        .with_worker(worker.clone())
        .build()
        .unwrap();

    let cancel = cancel_after(50);
    let started = Instant::now();
    let err = runtime
        .engine
        .run_with_cancel("thread-7", WorkflowRequest::new("rate limited"), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, HiveError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2), "{:?}", started.elapsed());
    // 退避被打断后不再调用生成器
    assert_eq!(generator.calls(), 1);
    assert_eq!(worker.log.calls.load(Ordering::SeqCst), 0);
    let entry = runtime.checkpoints.get("thread-7").await.unwrap().unwrap();
    assert_eq!(entry.state().unwrap().status, WorkflowStatus::Planning);
}
