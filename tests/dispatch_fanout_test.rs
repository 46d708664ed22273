//! 分发器并发扇出测试：独立调用并发执行，挂起的调用只让自己超时

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hive::core::TaskScheduler;
use hive::tools::{DispatchError, TaskDispatcher, Worker, WorkerCall, WorkerRegistry};
use serde_json::{json, Value};

/// 按 input.ms 睡眠后返回，并记录同时在跑的最大数量
#[derive(Clone, Default)]
struct SleepyWorker {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for SleepyWorker {
    fn name(&self) -> &str {
        "sleepy"
    }

    fn description(&self) -> &str {
        "Sleeps for input.ms milliseconds"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "ms": { "type": "integer", "minimum": 0 } },
            "required": ["ms"]
        })
    }

    async fn invoke(&self, input: Value) -> Result<Value, String> {
        let ms = input["ms"].as_u64().unwrap_or(0);
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "slept": ms }))
    }
}

fn dispatcher(worker: SleepyWorker, capacity: usize) -> TaskDispatcher {
    let mut registry = WorkerRegistry::new();
    registry.register(worker).unwrap();
    TaskDispatcher::new(Arc::new(registry), 5_000).with_scheduler(TaskScheduler::new(capacity))
}

#[tokio::test]
async fn test_fanout_runs_concurrently_and_hung_call_times_out_alone() {
    let worker = SleepyWorker::default();
    let dispatcher = dispatcher(worker.clone(), 8);
    let calls = vec![
        WorkerCall::new("sleepy", json!({ "ms": 100 })),
        WorkerCall::new("sleepy", json!({ "ms": 200 })),
        WorkerCall::new("sleepy", json!({ "ms": 10_000 })).with_timeout_ms(300),
    ];

    let started = Instant::now();
    let outcomes = dispatcher.dispatch_all(&calls).await;
    let elapsed = started.elapsed();

    // 串行需要 100 + 200 + 300ms
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(550), "{elapsed:?}");
    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes[0].as_ref().unwrap()["slept"], 100);
    assert_eq!(outcomes[1].as_ref().unwrap()["slept"], 200);
    assert_eq!(
        outcomes[2].as_ref().unwrap_err(),
        &DispatchError::Timeout {
            worker: "sleepy".to_string(),
            timeout_ms: 300
        }
    );
    assert_eq!(worker.peak.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_fanout_wider_than_cap_still_finishes_in_max_timeout() {
    let worker = SleepyWorker::default();
    let dispatcher = dispatcher(worker.clone(), 2);
    let mut calls: Vec<_> = (0..3)
        .map(|_| WorkerCall::new("sleepy", json!({ "ms": 10_000 })).with_timeout_ms(300))
        .collect();
    calls.push(WorkerCall::new("sleepy", json!({ "ms": 10 })));

    let started = Instant::now();
    let outcomes = dispatcher.dispatch_all(&calls).await;
    let elapsed = started.elapsed();

    // 排队执行会变成 600ms 以上
    assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "{elapsed:?}");
    assert_eq!(outcomes.len(), 4);
    for outcome in &outcomes[..3] {
        assert_eq!(outcome.as_ref().unwrap_err().kind(), "timeout");
    }
    assert_eq!(outcomes[3].as_ref().unwrap()["slept"], 10);
    assert_eq!(worker.peak.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_cap_limits_concurrent_fanouts() {
    let worker = SleepyWorker::default();
    let dispatcher = dispatcher(worker.clone(), 2);
    let batch: Vec<_> = (0..2)
        .map(|_| WorkerCall::new("sleepy", json!({ "ms": 80 })))
        .collect();

    let started = Instant::now();
    let (first, second) = tokio::join!(
        dispatcher.dispatch_all(&batch),
        dispatcher.dispatch_all(&batch)
    );
    let elapsed = started.elapsed();

    assert!(first.iter().chain(second.iter()).all(|o| o.is_ok()));
    // 第二批等第一批归还许可
    assert_eq!(worker.peak.load(Ordering::SeqCst), 2);
    assert!(elapsed >= Duration::from_millis(160), "{elapsed:?}");
}

#[tokio::test]
async fn test_invalid_call_does_not_block_siblings() {
    let worker = SleepyWorker::default();
    let dispatcher = dispatcher(worker.clone(), 8);
    let calls = vec![
        WorkerCall::new("sleepy", json!({ "ms": "soon" })),
        WorkerCall::new("sleepy", json!({ "ms": 10 })),
        WorkerCall::new("missing", json!({})),
    ];

    let outcomes = dispatcher.dispatch_all(&calls).await;

    assert_eq!(outcomes[0].as_ref().unwrap_err().kind(), "validation");
    assert!(outcomes[1].is_ok());
    match outcomes[2].as_ref().unwrap_err() {
        DispatchError::UnknownWorker { available, .. } => {
            assert_eq!(available, &vec!["sleepy".to_string()])
        }
        other => panic!("unexpected {other:?}"),
    }
    // 校验失败的调用不会进入 worker
    assert_eq!(worker.peak.load(Ordering::SeqCst), 1);
}
