//! 相似度检索提供方：MemoryStore 把原始 top-K 检索委托给它，再用 SalienceScorer 重排
//!
//! 向量化实现对本 crate 是黑盒；KeywordSimilarity 是进程内参考实现（词集合 Jaccard 重叠），
//! 供二进制与测试使用，后续可接真实向量库。

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::llm::ProviderError;
use crate::memory::{MemoryKind, Namespace};

/// 检索过滤条件
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub kind: Option<MemoryKind>,
}

impl SearchFilter {
    pub fn kind(kind: MemoryKind) -> Self {
        Self { kind: Some(kind) }
    }

    fn accepts(&self, kind: MemoryKind) -> bool {
        self.kind.map_or(true, |k| k == kind)
    }
}

/// 相似度提供方 trait：按命名空间维护索引，返回 (record_id, similarity)
#[async_trait]
pub trait SimilarityProvider: Send + Sync {
    async fn upsert(
        &self,
        namespace: &Namespace,
        id: &str,
        kind: MemoryKind,
        text: &str,
    ) -> Result<(), ProviderError>;

    async fn remove(&self, namespace: &Namespace, id: &str) -> Result<(), ProviderError>;

    /// 结果按相似度降序，最多 limit 条；不跨命名空间
    async fn search(
        &self,
        namespace: &Namespace,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, ProviderError>;
}

struct IndexedText {
    kind: MemoryKind,
    tokens: HashSet<String>,
}

/// 进程内关键词相似度（无真实向量）
#[derive(Default)]
pub struct KeywordSimilarity {
    index: RwLock<HashMap<Namespace, HashMap<String, IndexedText>>>,
}

/// 将文本切分为小写词集合
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let inter = a.intersection(b).count();
    if inter == 0 {
        return 0.0;
    }
    let union = a.union(b).count();
    inter as f64 / union as f64
}

impl KeywordSimilarity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn indexed_count(&self, namespace: &Namespace) -> usize {
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        index.get(namespace).map_or(0, |m| m.len())
    }
}

#[async_trait]
impl SimilarityProvider for KeywordSimilarity {
    async fn upsert(
        &self,
        namespace: &Namespace,
        id: &str,
        kind: MemoryKind,
        text: &str,
    ) -> Result<(), ProviderError> {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        index.entry(namespace.clone()).or_default().insert(
            id.to_string(),
            IndexedText {
                kind,
                tokens: tokenize_lower(text),
            },
        );
        Ok(())
    }

    async fn remove(&self, namespace: &Namespace, id: &str) -> Result<(), ProviderError> {
        let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entries) = index.get_mut(namespace) {
            entries.remove(id);
        }
        Ok(())
    }

    async fn search(
        &self,
        namespace: &Namespace,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, ProviderError> {
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let index = self.index.read().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = index.get(namespace) else {
            return Ok(Vec::new());
        };
        let mut scored: Vec<(String, f64)> = entries
            .iter()
            .filter(|(_, doc)| filter.accepts(doc.kind))
            .map(|(id, doc)| (id.clone(), jaccard(&query_tokens, &doc.tokens)))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(limit);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_search_ranks_by_overlap() {
        let provider = KeywordSimilarity::new();
        let ns = Namespace::semantic();
        provider
            .upsert(&ns, "a", MemoryKind::Semantic, "rust async runtime tokio")
            .await
            .unwrap();
        provider
            .upsert(&ns, "b", MemoryKind::Semantic, "python web framework")
            .await
            .unwrap();
        let hits = provider
            .search(&ns, "tokio runtime", &SearchFilter::default(), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a");
        assert!(hits[0].1 > 0.0 && hits[0].1 <= 1.0);
    }

    #[tokio::test]
    async fn test_search_stays_inside_namespace() {
        let provider = KeywordSimilarity::new();
        let other = Namespace::new(["other"]);
        provider
            .upsert(&other, "x", MemoryKind::Semantic, "shared words here")
            .await
            .unwrap();
        let hits = provider
            .search(&Namespace::semantic(), "shared words", &SearchFilter::default(), 5)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_kind_filter_and_remove() {
        let provider = KeywordSimilarity::new();
        let ns = Namespace::semantic();
        provider
            .upsert(&ns, "s", MemoryKind::Semantic, "deploy checklist")
            .await
            .unwrap();
        provider
            .upsert(&ns, "p", MemoryKind::Procedural, "deploy checklist steps")
            .await
            .unwrap();
        let hits = provider
            .search(&ns, "deploy", &SearchFilter::kind(MemoryKind::Procedural), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "p");

        provider.remove(&ns, "p").await.unwrap();
        assert_eq!(provider.indexed_count(&ns), 1);
    }
}
