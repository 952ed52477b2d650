//! 配置常量模块
//!
//! 所有可配置的运行时相关常量都在这里定义，便于后期修改

/// 运行时名称
pub const RUNTIME_NAME: &str = "greenrt";

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 默认的工作线程数量上限（超出即视为致命错误）
pub const DEFAULT_MAX_MACHINES: usize = 10_000;

/// 默认的阻塞型任务线程池大小
pub const DEFAULT_THREADPOOL_SIZE: usize = 4;
