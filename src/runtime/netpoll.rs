//! 网络轮询器契约与时间源
//!
//! 轮询器本体（epoll、定时器轮）在调度器之外实现，这里只定义
//! 调度器消费的接口：一次轮询返回新近就绪的 G 列表。

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use super::greenlet::Greenlet;

/// 网络轮询器
///
/// `block_ns` 非负：0 表示不阻塞，正值是允许阻塞的上限。
/// 返回值可以为空。
pub trait NetPoller: Send + Sync {
    fn poll(&self, block_ns: i64) -> Vec<Arc<Greenlet>>;
}

/// 进程起点
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// 单调毫秒时钟，仅用于 last_poll 时间戳
///
/// 返回值恒不为 0：0 被保留用来表示"一次轮询正在进行中"。
pub fn monotonic_millis() -> u32 {
    let epoch = EPOCH.get_or_init(Instant::now);
    let ms = epoch.elapsed().as_millis() as u32;
    ms.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_millis_nonzero() {
        assert_ne!(monotonic_millis(), 0);
        let a = monotonic_millis();
        let b = monotonic_millis();
        assert!(b >= a);
    }
}
