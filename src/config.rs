//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ENGINE__MAX_STEPS=20`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::memory::ScoringWeights;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    /// 显著性评分常量
    pub scoring: ScoringWeights,
    pub dispatch: DispatchSection,
    pub curation: CurationSection,
    pub storage: StorageSection,
    pub memory: MemorySection,
}

/// [engine] 段：步数上限与提供方重试
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// 规划时每个命名空间检索的记忆条数
    #[serde(default = "default_memory_context_k")]
    pub memory_context_k: usize,
}

fn default_max_steps() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    200
}

fn default_memory_context_k() -> usize {
    3
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            memory_context_k: default_memory_context_k(),
        }
    }
}

/// [dispatch] 段：单次 worker 调用超时与并发上限
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrent_workers() -> usize {
    8
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_concurrent_workers: default_max_concurrent_workers(),
        }
    }
}

/// [curation] 段：整理间隔、清除阈值；设置了 agent/user/task 时额外注册该作用域的命名空间组
#[derive(Debug, Clone, Deserialize)]
pub struct CurationSection {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub task_id: Option<String>,
}

fn default_interval_secs() -> u64 {
    86_400
}

fn default_threshold() -> f64 {
    0.5
}

impl Default for CurationSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            threshold: default_threshold(),
            agent_id: None,
            user_id: None,
            task_id: None,
        }
    }
}

/// [storage] 段：checkpoint 的 SQLite 文件；未设置时使用进程内存储
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSection {
    pub checkpoint_path: Option<PathBuf>,
}

/// [memory] 段
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    /// 向相似度提供方请求 k * search_oversample 个候选再重排
    #[serde(default = "default_search_oversample")]
    pub search_oversample: usize,
}

fn default_search_oversample() -> usize {
    3
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            search_oversample: default_search_oversample(),
        }
    }
}

/// 加载配置：依次尝试 config/default.toml、../config/default.toml、default.toml，
/// 再叠加 config_path（若存在），最后叠加环境变量 HIVE__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置；调用方决定是否据此重建组件
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let c = AppConfig::default();
        assert_eq!(c.engine.max_steps, 10);
        assert_eq!(c.engine.max_retries, 3);
        assert_eq!(c.dispatch.timeout_ms, 30_000);
        assert_eq!(c.curation.interval_secs, 86_400);
        assert_eq!(c.scoring.locked_bonus, 5.0);
        assert!(c.storage.checkpoint_path.is_none());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[engine]\nmax_steps = 4\n\n[scoring]\nalpha = 2.0\n\n[curation]\nthreshold = 1.5"
        )
        .unwrap();
        let c = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(c.engine.max_steps, 4);
        assert_eq!(c.engine.backoff_base_ms, 200);
        assert_eq!(c.scoring.alpha, 2.0);
        assert_eq!(c.scoring.tau_hours, 72.0);
        assert_eq!(c.curation.threshold, 1.5);
        assert_eq!(c.memory.search_oversample, 3);
    }
}
