//! 提供方层：生成与相似度检索的抽象、退避策略、Mock 实现

pub mod embedding;
pub mod mock;
pub mod retry;
pub mod traits;

pub use embedding::{KeywordSimilarity, SearchFilter, SimilarityProvider};
pub use mock::{MockGenerator, ScriptedGenerator};
pub use retry::RetryPolicy;
pub use traits::{extract_json_block, Generation, GenerationProvider, ProviderError};
