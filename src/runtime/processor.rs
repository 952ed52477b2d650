//! 逻辑处理器 (Processor)
//!
//! P - 逻辑处理器，持有绿色线程的本地运行队列和 run-next 槽。
//! 绑定到一个 M（工作线程）后才参与调度。

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use super::greenlet::Greenlet;
use super::queue::LocalQueue;

/// 处理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorStatus {
    /// 空闲
    Idle = 0,
    /// 运行中
    Running = 1,
    /// 拥有者 M 正在执行系统调用
    Syscall = 2,
    /// 已退役
    Dead = 3,
}

impl From<u8> for ProcessorStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ProcessorStatus::Idle,
            1 => ProcessorStatus::Running,
            2 => ProcessorStatus::Syscall,
            3 => ProcessorStatus::Dead,
            _ => ProcessorStatus::Dead,
        }
    }
}

/// 未绑定任何 M 时 machine_id 的取值
const NO_MACHINE: u64 = u64::MAX;

/// 逻辑处理器
pub struct Processor {
    /// 处理器 ID
    pub id: usize,
    /// 处理器状态
    status: AtomicU8,
    /// 本地运行队列（环 + run-next 槽）
    pub local_queue: LocalQueue,
    /// 绑定的 Machine ID，仅在 Running 或 Syscall 状态下有效
    machine_id: AtomicU64,
    /// 调度计数，每次本地派发加一，用于 61 tick 公平性检查
    sched_tick: AtomicU32,
}

impl Processor {
    /// 创建新的处理器
    pub fn new(id: usize) -> Self {
        Self {
            id,
            status: AtomicU8::new(ProcessorStatus::Idle as u8),
            local_queue: LocalQueue::new(),
            machine_id: AtomicU64::new(NO_MACHINE),
            sched_tick: AtomicU32::new(0),
        }
    }

    /// 获取状态
    #[inline]
    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus::from(self.status.load(Ordering::Acquire))
    }

    /// 设置状态
    #[inline]
    pub fn set_status(&self, status: ProcessorStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// 尝试将状态从 expected 改为 new
    #[inline]
    pub fn cas_status(&self, expected: ProcessorStatus, new: ProcessorStatus) -> bool {
        self.status
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// 检查是否空闲
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.status() == ProcessorStatus::Idle
    }

    /// 检查是否已退役
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.status() == ProcessorStatus::Dead
    }

    /// 入队一个可运行的 G
    ///
    /// `next == true` 时进 run-next 槽。除引导阶段外只允许拥有者
    /// M 调用。返回 `Some(batch)` 表示本地已满，调用方必须把
    /// batch 转移到全局队列。
    pub fn runq_put(&self, gp: Arc<Greenlet>, next: bool) -> Option<Vec<Arc<Greenlet>>> {
        self.local_queue.push(gp, next)
    }

    /// 出队一个 G 供立即执行，仅拥有者 M 调用
    ///
    /// 返回值里的 bool 是 inherit_time：run-next 命中时为 true。
    pub fn runq_get(&self) -> Option<(Arc<Greenlet>, bool)> {
        self.local_queue.pop()
    }

    /// 从 victim 偷走最多一半，返回一个立即执行的 G
    pub fn runq_steal(&self, victim: &Processor, steal_nextg: bool) -> Option<Arc<Greenlet>> {
        self.local_queue.steal_from(&victim.local_queue, steal_nextg)
    }

    /// 本地队列是否为空（允许有竞争，只作提示）
    #[inline]
    pub fn runq_empty(&self) -> bool {
        self.local_queue.is_empty()
    }

    /// 本地队列长度
    #[inline]
    pub fn runq_len(&self) -> usize {
        self.local_queue.len()
    }

    /// 排空本地队列（退役时使用），返回全部内容
    pub fn drain_runq(&self) -> Vec<Arc<Greenlet>> {
        self.local_queue.drain()
    }

    /// 退役路径：把环和 run-next 里的全部内容搬进全局队列
    pub fn move_runq_to_global(&self, sched: &super::scheduler::Scheduler) {
        let drained = self.drain_runq();
        if !drained.is_empty() {
            sched.global_runq_batch(drained);
        }
    }

    /// 绑定到 Machine
    pub fn bind_machine(&self, machine_id: u64) {
        self.machine_id.store(machine_id, Ordering::Release);
    }

    /// 解绑 Machine
    pub fn unbind_machine(&self) {
        self.machine_id.store(NO_MACHINE, Ordering::Release);
    }

    /// 获取绑定的 Machine ID
    #[inline]
    pub fn machine_id(&self) -> Option<u64> {
        let id = self.machine_id.load(Ordering::Acquire);
        if id == NO_MACHINE {
            None
        } else {
            Some(id)
        }
    }

    /// 获取调度计数
    #[inline]
    pub fn sched_tick(&self) -> u32 {
        self.sched_tick.load(Ordering::Relaxed)
    }

    /// 设置调度计数
    pub fn set_sched_tick(&self, tick: u32) {
        self.sched_tick.store(tick, Ordering::Relaxed);
    }

    /// 增加调度计数
    #[inline]
    pub fn inc_sched_tick(&self) {
        self.sched_tick.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("runq_len", &self.runq_len())
            .field("machine_id", &self.machine_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_glet(id: u64) -> Arc<Greenlet> {
        Arc::new(Greenlet::new(id))
    }

    #[test]
    fn test_processor_new() {
        let p = Processor::new(0);
        assert_eq!(p.id, 0);
        assert_eq!(p.status(), ProcessorStatus::Idle);
        assert!(p.machine_id().is_none());
        assert!(p.runq_empty());
    }

    #[test]
    fn test_status_cas() {
        let p = Processor::new(0);
        assert!(p.cas_status(ProcessorStatus::Idle, ProcessorStatus::Running));
        assert!(!p.cas_status(ProcessorStatus::Idle, ProcessorStatus::Syscall));
        assert!(p.cas_status(ProcessorStatus::Running, ProcessorStatus::Syscall));
        assert_eq!(p.status(), ProcessorStatus::Syscall);
    }

    #[test]
    fn test_runq_round_trip() {
        let p = Processor::new(0);
        p.runq_put(make_glet(1), false);
        p.runq_put(make_glet(2), true);

        let (g, inherit) = p.runq_get().unwrap();
        assert_eq!(g.id, 2);
        assert!(inherit);
        let (g, inherit) = p.runq_get().unwrap();
        assert_eq!(g.id, 1);
        assert!(!inherit);
    }

    #[test]
    fn test_bind_unbind() {
        let p = Processor::new(1);
        p.bind_machine(3);
        assert_eq!(p.machine_id(), Some(3));
        p.unbind_machine();
        assert!(p.machine_id().is_none());
    }

    #[test]
    fn test_sched_tick() {
        let p = Processor::new(0);
        assert_eq!(p.sched_tick(), 0);
        p.inc_sched_tick();
        p.inc_sched_tick();
        assert_eq!(p.sched_tick(), 2);
        p.set_sched_tick(61);
        assert_eq!(p.sched_tick(), 61);
    }

    #[test]
    fn test_drain() {
        let p = Processor::new(0);
        p.runq_put(make_glet(1), false);
        p.runq_put(make_glet(2), true);
        let drained = p.drain_runq();
        assert_eq!(drained.len(), 2);
        assert!(p.runq_empty());
    }

    #[test]
    fn test_move_runq_to_global() {
        use crate::runtime::scheduler::{Scheduler, SchedulerConfig};

        let sched = Scheduler::with_config(SchedulerConfig {
            num_processors: 1,
            max_machines: 4,
            threadpool_size: 1,
        });
        let p = Processor::new(9);
        p.runq_put(make_glet(1), false);
        p.runq_put(make_glet(2), true);

        p.move_runq_to_global(&sched);
        assert!(p.runq_empty());
        assert_eq!(sched.global_len(), 2);
    }
}
