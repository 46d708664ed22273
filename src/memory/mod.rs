//! 长期记忆：记录模型、显著性评分、分片存储、后台整理

pub mod record;
pub mod reflection;
pub mod salience;
pub mod store;

pub use record::{MemoryFlag, MemoryKind, MemoryPayload, MemoryRecord, MemoryScope, Namespace};
pub use reflection::{
    CurationError, CurationGroup, CurationPass, CurationReport, FireOutcome, ReflectionScheduler,
    SalienceCurator, SchedulerStats,
};
pub use salience::{SalienceScorer, ScoringWeights};
pub use store::{MemoryStore, NamespaceTxn, ScoredRecord, WriteOutcome};
