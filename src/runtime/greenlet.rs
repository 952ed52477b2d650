//! 绿色线程 (Greenlet) 结构
//!
//! G - 绿色线程，是调度的基本单位。调度器把 G 当作不透明句柄：
//! 栈和上下文切换由外部执行器负责，这里只保留状态、调度链接
//! 和最近一次错误槽。

use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::GletId;

/// 绿色线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GreenletStatus {
    /// 可运行，等待被调度
    Runnable = 0,
    /// 正在运行
    Running = 1,
    /// 正在执行系统调用（M 已和 P 分离）
    Syscall = 2,
    /// 等待中（阻塞在锁、轮询器或线程池上）
    Waiting = 3,
    /// 已死亡（执行完成或发生错误）
    Dead = 4,
}

impl From<u8> for GreenletStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => GreenletStatus::Runnable,
            1 => GreenletStatus::Running,
            2 => GreenletStatus::Syscall,
            3 => GreenletStatus::Waiting,
            4 => GreenletStatus::Dead,
            _ => GreenletStatus::Dead,
        }
    }
}

/// 绿色线程
///
/// 任意时刻一个 G 只能属于下列容器之一：某个 P 的本地队列、
/// 全局队列、某个 M（正在运行或阻塞在系统调用里）、调度器之外
/// 的等待队列。队列槽位以 `Arc::into_raw` 的整数形式持有 G，
/// 因此可以用 CAS 原子地转移所有权。
pub struct Greenlet {
    /// 唯一 ID
    pub id: GletId,
    /// 状态（原子操作）
    status: AtomicU8,
    /// 最近一次错误码（0 表示没有错误），由协作代码和
    /// 线程池写入，调度器本身从不设置
    last_error: AtomicI32,
    /// 停车原因（仅用于诊断）
    wait_reason: Mutex<&'static str>,
    /// 调度计数
    schedule_count: AtomicU64,
}

impl Greenlet {
    /// 创建新的绿色线程，初始状态为可运行
    pub fn new(id: GletId) -> Self {
        Self {
            id,
            status: AtomicU8::new(GreenletStatus::Runnable as u8),
            last_error: AtomicI32::new(0),
            wait_reason: Mutex::new(""),
            schedule_count: AtomicU64::new(0),
        }
    }

    /// 获取状态
    #[inline]
    pub fn status(&self) -> GreenletStatus {
        GreenletStatus::from(self.status.load(Ordering::Acquire))
    }

    /// 设置状态
    #[inline]
    pub fn set_status(&self, status: GreenletStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// 尝试将状态从 expected 改为 new
    #[inline]
    pub fn cas_status(&self, expected: GreenletStatus, new: GreenletStatus) -> bool {
        self.status
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// 检查是否可运行
    #[inline]
    pub fn is_runnable(&self) -> bool {
        self.status() == GreenletStatus::Runnable
    }

    /// 检查是否正在运行
    #[inline]
    pub fn is_running(&self) -> bool {
        self.status() == GreenletStatus::Running
    }

    /// 检查是否等待中
    #[inline]
    pub fn is_waiting(&self) -> bool {
        self.status() == GreenletStatus::Waiting
    }

    /// 检查是否已死亡
    #[inline]
    pub fn is_dead(&self) -> bool {
        self.status() == GreenletStatus::Dead
    }

    /// 标记为死亡
    pub fn mark_dead(&self) {
        self.set_status(GreenletStatus::Dead);
    }

    /// 记录最近一次错误码
    #[inline]
    pub fn save_last_error(&self, err: i32) {
        self.last_error.store(err, Ordering::Release);
    }

    /// 读取最近一次错误码，0 表示没有错误
    #[inline]
    pub fn last_error(&self) -> i32 {
        self.last_error.load(Ordering::Acquire)
    }

    /// 设置停车原因
    pub fn set_wait_reason(&self, reason: &'static str) {
        *self.wait_reason.lock() = reason;
    }

    /// 读取停车原因
    pub fn wait_reason(&self) -> &'static str {
        *self.wait_reason.lock()
    }

    /// 增加调度计数
    #[inline]
    pub fn inc_schedule_count(&self) {
        self.schedule_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取调度计数
    #[inline]
    pub fn schedule_count(&self) -> u64 {
        self.schedule_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Greenlet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Greenlet")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("last_error", &self.last_error())
            .finish()
    }
}

/// 绿色线程句柄（用于外部引用）
#[derive(Clone)]
pub struct GreenletHandle {
    inner: Arc<Greenlet>,
}

impl GreenletHandle {
    /// 创建新的句柄
    pub fn new(g: Arc<Greenlet>) -> Self {
        Self { inner: g }
    }

    /// 获取 ID
    pub fn id(&self) -> GletId {
        self.inner.id
    }

    /// 获取状态
    pub fn status(&self) -> GreenletStatus {
        self.inner.status()
    }

    /// 检查是否完成
    pub fn is_done(&self) -> bool {
        self.inner.is_dead()
    }

    /// 获取内部引用
    pub fn inner(&self) -> &Arc<Greenlet> {
        &self.inner
    }
}

impl std::fmt::Debug for GreenletHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GreenletHandle")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_conversion() {
        assert_eq!(GreenletStatus::from(0), GreenletStatus::Runnable);
        assert_eq!(GreenletStatus::from(2), GreenletStatus::Syscall);
        assert_eq!(GreenletStatus::from(200), GreenletStatus::Dead);
    }

    #[test]
    fn test_greenlet_new() {
        let g = Greenlet::new(7);
        assert_eq!(g.id, 7);
        assert!(g.is_runnable());
        assert_eq!(g.last_error(), 0);
    }

    #[test]
    fn test_cas_status() {
        let g = Greenlet::new(1);
        assert!(g.cas_status(GreenletStatus::Runnable, GreenletStatus::Running));
        assert!(!g.cas_status(GreenletStatus::Runnable, GreenletStatus::Dead));
        assert!(g.is_running());
    }

    #[test]
    fn test_last_error() {
        let g = Greenlet::new(1);
        g.save_last_error(-2);
        assert_eq!(g.last_error(), -2);
    }

    #[test]
    fn test_handle() {
        let g = Arc::new(Greenlet::new(3));
        let h = GreenletHandle::new(Arc::clone(&g));
        assert_eq!(h.id(), 3);
        assert!(!h.is_done());
        g.mark_dead();
        assert!(h.is_done());
    }
}
