//! greenrt - M:N 绿色线程调度运行时
//!
//! 把大量协作式的轻量任务（greenlet）复用到少量 OS 线程上。
//! 调度模型是经典的 G/M/P 三元组：每个 P 带本地运行队列和
//! run-next 槽，外加一个全局队列，P 之间通过工作窃取平衡负载。
//! 阻塞型操作（如域名解析）由独立的线程池承接。
//!
//! G 本体（栈、上下文切换）是外部协作者：使用方通过
//! `Scheduler::set_executor` 安装切换原语，通过 `NetPoller`
//! 接入网络轮询。

pub mod config;
pub mod runtime;

pub use runtime::{
    drop_g, enter_syscall_block, exit_syscall, get_scheduler, glet_exit, init, monotonic_millis,
    num_processors, park, park_unlock, ready, submit_getaddrinfo_glet_work, submit_glet_work,
    yield_now, GetAddrInfoWork, GletId, GletWork, Greenlet, GreenletHandle, GreenletStatus,
    LocalQueue, Machine, NetPoller, Processor, ProcessorStatus, Scheduler, SchedulerConfig,
    SchedulerStats, ThreadPool, UnlockFunc,
};
