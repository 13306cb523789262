use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化 tracing，日志写到 stderr，stdout 留给对话内容。
///
/// 默认级别：`--verbose` 时为 `info,aio_chat=debug`，否则 `warn`。
/// 设置了 `RUST_LOG` 时以它为准。
pub fn init(verbose: bool) {
    let default = if verbose { "info,aio_chat=debug" } else { "warn" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact();

    // 重复初始化（例如测试里）时静默忽略
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .try_init();

    tracing::debug!("Tracing initialized");
}
