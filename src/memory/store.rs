//! 长期记忆存储：按命名空间分片、按去重键合并、检索后按显著性重排
//!
//! 每个命名空间一个分片，分片由异步 Mutex 保护：同一去重键的并发写入在锁内完成
//! 「比较并递增」，不会丢失更新；整理事务持有同一把锁，因而不会与写入交错。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tokio::sync::Mutex;

use crate::llm::{ProviderError, SearchFilter, SimilarityProvider};
use crate::memory::{CurationError, MemoryRecord, Namespace, SalienceScorer};

#[derive(Default)]
struct Shard {
    records: HashMap<String, MemoryRecord>,
    /// dedupe_key -> record id
    by_key: HashMap<String, String>,
}

/// 写入结果：新插入或合并进已有记录（均返回写入后的快照）
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Inserted(MemoryRecord),
    Merged(MemoryRecord),
}

impl WriteOutcome {
    pub fn record(&self) -> &MemoryRecord {
        match self {
            WriteOutcome::Inserted(r) | WriteOutcome::Merged(r) => r,
        }
    }

    pub fn is_merged(&self) -> bool {
        matches!(self, WriteOutcome::Merged(_))
    }
}

/// 检索结果：记录 + 原始相似度 + 重排后的显著性
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredRecord {
    pub record: MemoryRecord,
    pub similarity: f64,
    pub salience: f64,
}

/// 命名空间事务视图：在副本上修改，闭包返回 Ok 才整体提交
pub struct NamespaceTxn {
    namespace: Namespace,
    records: HashMap<String, MemoryRecord>,
    removed: Vec<String>,
}

impl NamespaceTxn {
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn records(&self) -> impl Iterator<Item = &MemoryRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut MemoryRecord> {
        self.records.get_mut(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<MemoryRecord> {
        let removed = self.records.remove(id);
        if removed.is_some() {
            self.removed.push(id.to_string());
        }
        removed
    }
}

pub struct MemoryStore {
    shards: RwLock<HashMap<Namespace, Arc<Mutex<Shard>>>>,
    provider: Arc<dyn SimilarityProvider>,
    scorer: SalienceScorer,
    /// 向提供方请求 k * oversample 个候选后再重排
    oversample: usize,
}

impl MemoryStore {
    pub fn new(provider: Arc<dyn SimilarityProvider>, scorer: SalienceScorer) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            provider,
            scorer,
            oversample: 3,
        }
    }

    pub fn with_oversample(mut self, oversample: usize) -> Self {
        self.oversample = oversample.max(1);
        self
    }

    pub fn scorer(&self) -> &SalienceScorer {
        &self.scorer
    }

    fn shard(&self, namespace: &Namespace) -> Arc<Mutex<Shard>> {
        if let Some(shard) = self
            .shards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(namespace)
        {
            return Arc::clone(shard);
        }
        let mut shards = self.shards.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(shards.entry(namespace.clone()).or_default())
    }

    fn existing_shard(&self, namespace: &Namespace) -> Option<Arc<Mutex<Shard>>> {
        self.shards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(namespace)
            .map(Arc::clone)
    }

    /// 写入：去重键命中则合并（计数 +1、刷新 last_verified、合并 flag），否则插入并建索引
    pub async fn write(&self, record: MemoryRecord) -> Result<WriteOutcome, ProviderError> {
        let shard = self.shard(&record.namespace);
        let mut guard = shard.lock().await;
        let key = record.dedupe_key();

        if let Some(id) = guard.by_key.get(&key).cloned() {
            if let Some(existing) = guard.records.get_mut(&id) {
                existing.record_mention(Utc::now(), &record.flags);
                tracing::debug!(
                    namespace = %record.namespace,
                    id = %id,
                    mention_count = existing.mention_count,
                    "memory merged"
                );
                return Ok(WriteOutcome::Merged(existing.clone()));
            }
        }

        // 先建索引：提供方失败时不留下无法检索的记录
        self.provider
            .upsert(
                &record.namespace,
                &record.id,
                record.kind(),
                &record.payload.content_text(),
            )
            .await?;
        guard.by_key.insert(key, record.id.clone());
        guard.records.insert(record.id.clone(), record.clone());
        tracing::debug!(
            namespace = %record.namespace,
            id = %record.id,
            kind = record.kind().as_str(),
            "memory inserted"
        );
        Ok(WriteOutcome::Inserted(record))
    }

    pub async fn search(
        &self,
        namespace: &Namespace,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredRecord>, ProviderError> {
        self.search_filtered(namespace, query, &SearchFilter::default(), k)
            .await
    }

    /// 原始 top-K 检索委托给提供方，再按显著性降序重排；索引中已失效的 id 被跳过
    pub async fn search_filtered(
        &self,
        namespace: &Namespace,
        query: &str,
        filter: &SearchFilter,
        k: usize,
    ) -> Result<Vec<ScoredRecord>, ProviderError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let hits = self
            .provider
            .search(namespace, query, filter, k.saturating_mul(self.oversample))
            .await?;
        let Some(shard) = self.existing_shard(namespace) else {
            return Ok(Vec::new());
        };
        let guard = shard.lock().await;
        let now = Utc::now();
        let mut ranked: Vec<ScoredRecord> = hits
            .into_iter()
            .filter_map(|(id, similarity)| {
                guard.records.get(&id).map(|record| ScoredRecord {
                    salience: self.scorer.score_at(record, similarity, now),
                    record: record.clone(),
                    similarity,
                })
            })
            .collect();
        drop(guard);
        ranked.sort_by(|a, b| {
            b.salience
                .total_cmp(&a.salience)
                .then_with(|| b.similarity.total_cmp(&a.similarity))
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        ranked.truncate(k);
        Ok(ranked)
    }

    pub async fn get(&self, namespace: &Namespace, id: &str) -> Option<MemoryRecord> {
        let shard = self.existing_shard(namespace)?;
        let guard = shard.lock().await;
        guard.records.get(id).cloned()
    }

    /// 命名空间内全部记录，按 created_at、id 排序
    pub async fn list(&self, namespace: &Namespace) -> Vec<MemoryRecord> {
        let Some(shard) = self.existing_shard(namespace) else {
            return Vec::new();
        };
        let guard = shard.lock().await;
        let mut records: Vec<MemoryRecord> = guard.records.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub async fn len(&self, namespace: &Namespace) -> usize {
        match self.existing_shard(namespace) {
            Some(shard) => shard.lock().await.records.len(),
            None => 0,
        }
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        let mut namespaces: Vec<Namespace> = self
            .shards
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        namespaces.sort();
        namespaces
    }

    /// 命名空间事务：闭包在副本上操作，返回 Ok 时整体替换分片，返回 Err 时不留下任何修改。
    /// 提交后再同步相似度索引；索引删除失败只记日志（检索会跳过失效 id）。
    pub async fn transaction<T, F>(&self, namespace: &Namespace, f: F) -> Result<T, CurationError>
    where
        F: FnOnce(&mut NamespaceTxn) -> Result<T, CurationError>,
    {
        let shard = self.shard(namespace);
        let mut guard = shard.lock().await;
        let mut txn = NamespaceTxn {
            namespace: namespace.clone(),
            records: guard.records.clone(),
            removed: Vec::new(),
        };

        let out = f(&mut txn)?;

        let mut by_key = HashMap::with_capacity(txn.records.len());
        for record in txn.records.values() {
            if let Some(other) = by_key.insert(record.dedupe_key(), record.id.clone()) {
                return Err(CurationError::Aborted(format!(
                    "dedupe key collision between {} and {}",
                    other, record.id
                )));
            }
        }
        guard.records = txn.records;
        guard.by_key = by_key;
        drop(guard);

        for id in &txn.removed {
            if let Err(e) = self.provider.remove(namespace, id).await {
                tracing::warn!(
                    namespace = %namespace,
                    id = %id,
                    "failed to drop index entry: {}",
                    e
                );
            }
        }
        Ok(out)
    }
}
