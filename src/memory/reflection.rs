//! 记忆整理（reflection）：定期合并重复语义记忆、清除低显著性记录
//!
//! - 每个命名空间有一把运行锁：同一命名空间最多一个整理在进行，重叠的触发直接跳过（不排队）
//! - 整理在 MemoryStore 的命名空间事务内执行：全部提交或全部回滚
//! - 调度器显式构造、显式 start / shutdown，计时器运行在独立的 tokio 任务上

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::{HiveError, RecoveryAction, RecoveryEngine};
use crate::memory::{MemoryKind, MemoryPayload, MemoryStore, Namespace};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CurationError {
    #[error("merge failed: {0}")]
    Merge(String),

    #[error("purge failed: {0}")]
    Purge(String),

    #[error("curation aborted: {0}")]
    Aborted(String),

    #[error("curation task panicked: {0}")]
    Panicked(String),
}

/// 单次整理的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurationReport {
    pub namespace: Namespace,
    pub merged: usize,
    pub purged: usize,
    pub remaining: usize,
}

/// 一次整理过程（默认实现 SalienceCurator；测试可替换）
#[async_trait]
pub trait CurationPass: Send + Sync {
    async fn curate(&self, namespace: &Namespace) -> Result<CurationReport, CurationError>;
}

/// 默认整理：合并规范化后 topic+fact 相同的语义记忆，清除相似度为 0 时评分低于阈值的记录
pub struct SalienceCurator {
    store: Arc<MemoryStore>,
    threshold: f64,
}

impl SalienceCurator {
    pub fn new(store: Arc<MemoryStore>, threshold: f64) -> Self {
        Self { store, threshold }
    }
}

/// 大小写与空白不敏感的语义去重键
fn normalized_semantic_key(payload: &MemoryPayload) -> Option<String> {
    match payload {
        MemoryPayload::Semantic { topic, fact, .. } => {
            let norm = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
            Some(format!("{}\u{1f}{}", norm(topic), norm(fact)))
        }
        _ => None,
    }
}

#[async_trait]
impl CurationPass for SalienceCurator {
    async fn curate(&self, namespace: &Namespace) -> Result<CurationReport, CurationError> {
        let scorer = *self.store.scorer();
        let threshold = self.threshold;
        let now = Utc::now();

        self.store
            .transaction(namespace, move |txn| {
                let mut groups: BTreeMap<String, Vec<(chrono::DateTime<Utc>, String)>> =
                    BTreeMap::new();
                for record in txn.records().filter(|r| r.kind() == MemoryKind::Semantic) {
                    if let Some(key) = normalized_semantic_key(&record.payload) {
                        groups
                            .entry(key)
                            .or_default()
                            .push((record.created_at, record.id.clone()));
                    }
                }

                let mut merged = 0;
                for (_, mut ids) in groups.into_iter().filter(|(_, ids)| ids.len() > 1) {
                    ids.sort();
                    let survivor_id = ids[0].1.clone();
                    for (_, dup_id) in ids.into_iter().skip(1) {
                        let dup = txn.remove(&dup_id).ok_or_else(|| {
                            CurationError::Merge(format!("record {dup_id} vanished"))
                        })?;
                        let survivor = txn.get_mut(&survivor_id).ok_or_else(|| {
                            CurationError::Merge(format!("survivor {survivor_id} vanished"))
                        })?;
                        survivor.absorb(&dup);
                        merged += 1;
                    }
                }

                let doomed: Vec<String> = txn
                    .records()
                    .filter(|r| scorer.score_at(r, 0.0, now) < threshold)
                    .map(|r| r.id.clone())
                    .collect();
                for id in &doomed {
                    txn.remove(id)
                        .ok_or_else(|| CurationError::Purge(format!("record {id} vanished")))?;
                }

                Ok(CurationReport {
                    namespace: txn.namespace().clone(),
                    merged,
                    purged: doomed.len(),
                    remaining: txn.len(),
                })
            })
            .await
    }
}

/// 一组按同一间隔整理的命名空间
#[derive(Debug, Clone)]
pub struct CurationGroup {
    pub name: String,
    pub namespaces: Vec<Namespace>,
    pub interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    Completed(CurationReport),
    /// 同一命名空间已有整理在运行
    Skipped,
    Failed(CurationError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub started: u64,
    pub skipped: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    skipped: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// 运行锁守卫：析构时释放命名空间
struct RunGuard {
    active: Arc<Mutex<HashSet<Namespace>>>,
    namespace: Namespace,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.namespace);
    }
}

/// 计时器任务与手动触发共享的部分（不持有任务句柄，避免引用环）
struct SchedulerCore {
    pass: Arc<dyn CurationPass>,
    active: Arc<Mutex<HashSet<Namespace>>>,
    counters: Counters,
    inflight: Mutex<Vec<JoinHandle<FireOutcome>>>,
    recovery: RecoveryEngine,
}

impl SchedulerCore {
    fn try_acquire(&self, namespace: &Namespace) -> Option<RunGuard> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(namespace.clone()) {
            return None;
        }
        Some(RunGuard {
            active: Arc::clone(&self.active),
            namespace: namespace.clone(),
        })
    }

    /// 取得运行锁则在新任务中整理（守卫随任务移动），否则返回 None 表示跳过
    fn spawn_pass(self: &Arc<Self>, namespace: &Namespace) -> Option<JoinHandle<FireOutcome>> {
        let Some(guard) = self.try_acquire(namespace) else {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(namespace = %namespace, "curation already running, fire skipped");
            return None;
        };
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        let pass = Arc::clone(&self.pass);
        let core = Arc::clone(self);
        let namespace = namespace.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            tracing::info!(namespace = %namespace, "curation started");
            let result = pass.curate(&namespace).await;
            core.finish(&namespace, result)
        }))
    }

    /// 整理失败交给 RecoveryEngine 决定传播方式；整理是后台任务，不会中断任何工作流
    fn failure_action(&self, err: &CurationError) -> RecoveryAction {
        self.recovery.handle(&HiveError::Curation(err.clone()), 1)
    }

    fn finish(
        &self,
        namespace: &Namespace,
        result: Result<CurationReport, CurationError>,
    ) -> FireOutcome {
        match result {
            Ok(report) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    namespace = %namespace,
                    merged = report.merged,
                    purged = report.purged,
                    remaining = report.remaining,
                    "curation committed"
                );
                FireOutcome::Completed(report)
            }
            Err(e) => {
                self.record_failure(namespace, &e);
                FireOutcome::Failed(e)
            }
        }
    }

    fn record_failure(&self, namespace: &Namespace, err: &CurationError) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        match self.failure_action(err) {
            RecoveryAction::LogAndContinue => {
                tracing::error!(namespace = %namespace, "curation rolled back: {}", err)
            }
            action => tracing::error!(
                namespace = %namespace,
                ?action,
                "curation rolled back with unexpected recovery action: {}",
                err
            ),
        }
    }

    fn track(&self, handle: JoinHandle<FireOutcome>) {
        let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        inflight.retain(|h| !h.is_finished());
        inflight.push(handle);
    }
}

/// 整理调度器
pub struct ReflectionScheduler {
    core: Arc<SchedulerCore>,
    groups: Mutex<Vec<CurationGroup>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
}

impl ReflectionScheduler {
    pub fn new(pass: Arc<dyn CurationPass>) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                pass,
                active: Arc::new(Mutex::new(HashSet::new())),
                counters: Counters::default(),
                inflight: Mutex::new(Vec::new()),
                recovery: RecoveryEngine::default(),
            }),
            groups: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// 注册命名空间组；需在 start() 之前调用
    pub fn add_group(
        &self,
        name: impl Into<String>,
        namespaces: Vec<Namespace>,
        interval: Duration,
    ) {
        self.groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(CurationGroup {
                name: name.into(),
                namespaces,
                interval,
            });
    }

    pub fn groups(&self) -> Vec<CurationGroup> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 为每个组启动一个计时器任务；首次触发在一个间隔之后
    pub fn start(&self) {
        let groups = self.groups();
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for group in groups {
            let core = Arc::clone(&self.core);
            let token = self.shutdown_token.clone();
            let interval = group.interval.max(Duration::from_millis(1));
            tracing::info!(
                group = %group.name,
                interval_secs = interval.as_secs(),
                "curation timer started"
            );
            timers.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            for namespace in &group.namespaces {
                                if let Some(handle) = core.spawn_pass(namespace) {
                                    core.track(handle);
                                }
                            }
                        }
                    }
                }
                tracing::debug!(group = %group.name, "curation timer stopped");
            }));
        }
    }

    /// 立即对一个命名空间整理一次；已在运行则返回 Skipped
    pub async fn fire(&self, namespace: &Namespace) -> FireOutcome {
        if self.shutdown_token.is_cancelled() {
            return FireOutcome::Skipped;
        }
        match self.core.spawn_pass(namespace) {
            None => FireOutcome::Skipped,
            Some(handle) => match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let err = CurationError::Panicked(e.to_string());
                    self.core.record_failure(namespace, &err);
                    FireOutcome::Failed(err)
                }
            },
        }
    }

    pub fn is_running(&self, namespace: &Namespace) -> bool {
        self.core
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(namespace)
    }

    pub fn stats(&self) -> SchedulerStats {
        let c = &self.core.counters;
        SchedulerStats {
            started: c.started.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }

    /// 停止计时器，并等待已经开始的整理结束
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let timers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.timers.lock().unwrap_or_else(|e| e.into_inner()));
        for timer in timers {
            let _ = timer.await;
        }
        let inflight: Vec<JoinHandle<FireOutcome>> =
            std::mem::take(&mut *self.core.inflight.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in inflight {
            if let Err(e) = handle.await {
                tracing::warn!("curation task ended abnormally during shutdown: {}", e);
            }
        }
        tracing::info!("reflection scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::KeywordSimilarity;
    use crate::memory::{MemoryFlag, MemoryRecord, SalienceScorer};
    use chrono::Duration as ChronoDuration;

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new(
            Arc::new(KeywordSimilarity::new()),
            SalienceScorer::default(),
        ))
    }

    #[tokio::test]
    async fn test_curator_merges_normalized_duplicates() {
        let store = store();
        let ns = Namespace::semantic();
        let older = MemoryRecord::semantic(ns.clone(), "Rust", "Ownership  prevents races", "")
            .with_timestamp(Utc::now() - ChronoDuration::hours(2));
        let older_id = older.id.clone();
        store.write(older).await.unwrap();
        store
            .write(
                MemoryRecord::semantic(ns.clone(), "rust", "ownership prevents races", "")
                    .with_mentions(2),
            )
            .await
            .unwrap();

        let curator = SalienceCurator::new(Arc::clone(&store), 0.0);
        let report = curator.curate(&ns).await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.remaining, 1);
        let survivor = store.get(&ns, &older_id).await.unwrap();
        assert_eq!(survivor.mention_count, 3);
    }

    #[tokio::test]
    async fn test_curator_purges_below_threshold_but_keeps_locked() {
        let store = store();
        let ns = Namespace::semantic();
        let month_ago = Utc::now() - ChronoDuration::days(30);
        store
            .write(
                MemoryRecord::semantic(ns.clone(), "old", "forgotten", "")
                    .with_timestamp(month_ago),
            )
            .await
            .unwrap();
        let pinned = MemoryRecord::semantic(ns.clone(), "old", "pinned", "")
            .with_timestamp(month_ago)
            .with_flag(MemoryFlag::new("u", "keep", 0.0).locked());
        let pinned_id = pinned.id.clone();
        store.write(pinned).await.unwrap();
        store
            .write(MemoryRecord::semantic(ns.clone(), "new", "fresh", ""))
            .await
            .unwrap();

        let curator = SalienceCurator::new(Arc::clone(&store), 0.5);
        let report = curator.curate(&ns).await.unwrap();
        assert_eq!(report.purged, 1);
        assert_eq!(report.remaining, 2);
        assert!(store.get(&ns, &pinned_id).await.is_some());
    }

    struct FailingPass;

    #[async_trait]
    impl CurationPass for FailingPass {
        async fn curate(&self, _namespace: &Namespace) -> Result<CurationReport, CurationError> {
            Err(CurationError::Aborted("injected".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failed_pass_releases_lock() {
        let scheduler = ReflectionScheduler::new(Arc::new(FailingPass));
        let ns = Namespace::semantic();
        assert!(matches!(scheduler.fire(&ns).await, FireOutcome::Failed(_)));
        assert!(!scheduler.is_running(&ns));
        assert!(matches!(scheduler.fire(&ns).await, FireOutcome::Failed(_)));
        assert_eq!(scheduler.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_failure_is_logged_and_scheduler_keeps_running() {
        let scheduler = ReflectionScheduler::new(Arc::new(FailingPass));
        let err = CurationError::Aborted("injected".to_string());
        assert_eq!(scheduler.core.failure_action(&err), RecoveryAction::LogAndContinue);

        let ns = Namespace::semantic();
        assert_eq!(scheduler.fire(&ns).await, FireOutcome::Failed(err));
        // 失败只记日志，调度器仍接受下一次触发
        assert!(matches!(scheduler.fire(&ns).await, FireOutcome::Failed(_)));
        assert_eq!(scheduler.stats().failed, 2);
        assert_eq!(scheduler.stats().skipped, 0);
    }

    #[tokio::test]
    async fn test_fire_after_shutdown_is_skipped() {
        let scheduler = ReflectionScheduler::new(Arc::new(FailingPass));
        scheduler.shutdown().await;
        assert_eq!(scheduler.fire(&Namespace::semantic()).await, FireOutcome::Skipped);
    }
}
