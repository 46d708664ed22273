//! 可观测性：tracing 订阅器初始化
//!
//! 默认级别 info，可通过 RUST_LOG 覆盖；worker 审计日志以 JSON 字符串写在 `audit` 字段中。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("invalid log directive: {0}")]
    Directive(#[from] tracing_subscriber::filter::ParseError),

    #[error("subscriber already installed: {0}")]
    Install(#[from] tracing_subscriber::util::TryInitError),
}

pub fn init() -> Result<(), ObservabilityError> {
    let filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()?;
    Ok(())
}
