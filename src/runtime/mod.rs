//! 绿色线程调度运行时
//!
//! 实现 M:N 的协作式调度系统
//!
//! 核心组件：
//! - G (Greenlet): 绿色线程，调度的基本单位
//! - P (Processor): 逻辑处理器，持有本地运行队列和 run-next 槽
//! - M (Machine): 操作系统线程，在 g0 循环里执行 G
//!
//! 此外还有一个阻塞型任务线程池，用来承接不适合在调度线程上
//! 执行的操作（典型的是域名解析）。

pub mod greenlet;
pub mod queue;
pub mod processor;
pub mod machine;
pub mod scheduler;
pub mod threadpool;
pub mod netpoll;
pub mod tls;

pub use greenlet::{Greenlet, GreenletHandle, GreenletStatus};
pub use machine::Machine;
pub use netpoll::{monotonic_millis, NetPoller};
pub use processor::{Processor, ProcessorStatus};
pub use queue::LocalQueue;
pub use scheduler::{
    drop_g, enter_syscall_block, exit_syscall, get_scheduler, glet_exit, init, park, park_unlock,
    ready, yield_now, Scheduler, SchedulerConfig, SchedulerStats, UnlockFunc, SCHEDULER,
};
pub use threadpool::{
    submit_getaddrinfo_glet_work, submit_glet_work, GetAddrInfoWork, GletWork, ThreadPool,
};

/// 绿色线程 ID 类型
pub type GletId = u64;

/// 获取当前 CPU 核心数
pub fn num_processors() -> usize {
    num_cpus::get()
}
