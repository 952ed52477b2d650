//! 工作线程 (Machine)
//!
//! M - 操作系统线程。每个 M 在自己的调度栈（g0）上跑一个无限
//! 循环：找到一个可运行的 G，切换过去执行，G 让出后回到 g0
//! 继续。没有工作时 M 释放 P 并停车，由 start_m 指派新的 P 唤醒。

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::ptr;

use log::trace;
use parking_lot::{Condvar, Mutex};

use super::greenlet::{Greenlet, GreenletStatus};
use super::processor::Processor;
use super::scheduler::{Scheduler, UnlockFunc};
use super::tls;

/// G 在挂起点上登记的意图，g0 在切换回来后按它处理。
/// 记在 M 上而不是读 G 的状态：G 一旦对唤醒者可见，状态就可能
/// 被并发改写。
pub(crate) enum PendingAction {
    /// 主动让出，回本地环尾部
    Yield,
    /// 停车，解锁函数在切换完成后执行
    Park(Option<UnlockFunc>),
}

/// 工作线程
pub struct Machine {
    /// 线程 ID，同时是调度器 machines 表的下标
    pub id: u64,
    /// OS 线程句柄
    thread: Mutex<Option<JoinHandle<()>>>,
    /// 当前绑定的处理器
    processor: Mutex<Option<Arc<Processor>>>,
    /// start_m 在唤醒前指派的处理器
    next_p: Mutex<Option<Arc<Processor>>>,
    /// 系统调用期间记住的旧处理器，用于快速回收
    old_p: Mutex<Option<Arc<Processor>>>,
    /// 当前正在执行的 G
    current_g: Mutex<Option<Arc<Greenlet>>>,
    /// 当前 G 在挂起点上登记的意图
    pending: Mutex<Option<PendingAction>>,
    /// 是否处于自旋状态（正在找工作）
    spinning: AtomicBool,
    /// 是否正在停车
    parking: AtomicBool,
    /// 是否应该停止
    should_stop: AtomicBool,
    /// 停车/唤醒同步，单槽二元信号量
    park_mutex: Mutex<bool>,
    park_cond: Condvar,
    /// 关联的调度器
    scheduler: AtomicPtr<Scheduler>,
    /// 窃取目标选择用的 xorshift 状态
    steal_rand: AtomicU32,
}

impl Machine {
    /// 创建新的工作线程（未启动）
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            thread: Mutex::new(None),
            processor: Mutex::new(None),
            next_p: Mutex::new(None),
            old_p: Mutex::new(None),
            current_g: Mutex::new(None),
            pending: Mutex::new(None),
            spinning: AtomicBool::new(false),
            parking: AtomicBool::new(false),
            should_stop: AtomicBool::new(false),
            park_mutex: Mutex::new(false),
            park_cond: Condvar::new(),
            scheduler: AtomicPtr::new(ptr::null_mut()),
            steal_rand: AtomicU32::new((id as u32).wrapping_mul(0x9E37_79B9) | 1),
        })
    }

    /// 设置调度器
    pub fn set_scheduler(&self, scheduler: *mut Scheduler) {
        self.scheduler.store(scheduler, Ordering::Release);
    }

    /// 获取调度器
    pub fn scheduler(&self) -> Option<&Scheduler> {
        let ptr = self.scheduler.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            unsafe { Some(&*ptr) }
        }
    }

    /// 获取当前绑定的处理器
    pub fn processor(&self) -> Option<Arc<Processor>> {
        self.processor.lock().clone()
    }

    /// 绑定处理器槽，仅 acquire_p 调用
    pub(crate) fn set_processor(&self, p: Arc<Processor>) {
        *self.processor.lock() = Some(p);
    }

    /// 取下处理器槽，仅 release_p 和系统调用入口调用
    pub(crate) fn take_processor(&self) -> Option<Arc<Processor>> {
        self.processor.lock().take()
    }

    /// 指派唤醒后要绑定的处理器
    pub(crate) fn set_next_p(&self, p: Arc<Processor>) {
        *self.next_p.lock() = Some(p);
    }

    pub(crate) fn take_next_p(&self) -> Option<Arc<Processor>> {
        self.next_p.lock().take()
    }

    /// 记住系统调用前的处理器
    pub(crate) fn set_old_p(&self, p: Arc<Processor>) {
        *self.old_p.lock() = Some(p);
    }

    pub(crate) fn take_old_p(&self) -> Option<Arc<Processor>> {
        self.old_p.lock().take()
    }

    /// 获取当前正在执行的 G
    pub fn current_g(&self) -> Option<Arc<Greenlet>> {
        self.current_g.lock().clone()
    }

    pub(crate) fn set_current_g(&self, g: Arc<Greenlet>) {
        *self.current_g.lock() = Some(g);
    }

    pub(crate) fn take_current_g(&self) -> Option<Arc<Greenlet>> {
        self.current_g.lock().take()
    }

    /// 登记挂起意图，由 yield_now 和 park 调用
    pub(crate) fn set_pending(&self, action: PendingAction) {
        *self.pending.lock() = Some(action);
    }

    pub(crate) fn take_pending(&self) -> Option<PendingAction> {
        self.pending.lock().take()
    }

    /// 是否处于自旋状态
    #[inline]
    pub fn is_spinning(&self) -> bool {
        self.spinning.load(Ordering::Acquire)
    }

    pub(crate) fn set_spinning(&self, spinning: bool) {
        self.spinning.store(spinning, Ordering::Release);
    }

    /// 窃取目标选择的伪随机数，xorshift32，以 M id 播种
    pub(crate) fn next_rand(&self) -> u32 {
        let mut x = self.steal_rand.load(Ordering::Relaxed);
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.steal_rand.store(x, Ordering::Relaxed);
        x
    }

    /// 启动工作线程
    pub fn start(self: &Arc<Self>) {
        let machine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("machine-{}", self.id))
            .spawn(move || {
                machine.run_loop();
            })
            .expect("scheduler: failed to spawn machine thread");

        *self.thread.lock() = Some(handle);
    }

    /// g0 循环
    fn run_loop(self: &Arc<Self>) {
        tls::set_m(Some(Arc::clone(self)));
        trace!("machine {} started", self.id);

        // 创建时指派的处理器在这里绑定
        if let Some(p) = self.take_next_p() {
            if let Some(sched) = self.scheduler() {
                sched.acquire_p(self, &p);
            }
        }

        loop {
            let sched = match self.scheduler() {
                Some(s) => s,
                None => break,
            };
            if self.should_stop() || !sched.is_running() {
                break;
            }
            // 系统调用慢路径会让 M 失去 P，停车等待新的指派
            if self.processor().is_none() {
                sched.stop_m(self);
                continue;
            }
            if !sched.one_round_sched(self, None) {
                break;
            }
        }

        if let Some(sched) = self.scheduler() {
            sched.detach_on_exit(self);
        }
        tls::set_m(None);
        trace!("machine {} exited", self.id);
    }

    /// 派发一个 G：状态转为 Running，推进 sched_tick，切换过去，
    /// 返回后按让出语义处理
    pub(crate) fn dispatch(self: &Arc<Self>, sched: &Scheduler, gp: Arc<Greenlet>, inherit_time: bool) {
        let p = self
            .processor()
            .expect("scheduler: dispatch on a machine without a processor");

        gp.set_status(GreenletStatus::Running);
        gp.inc_schedule_count();
        p.inc_sched_tick();
        trace!(
            "machine {} dispatch g{} (inherit_time={})",
            self.id,
            gp.id,
            inherit_time
        );

        self.set_current_g(Arc::clone(&gp));
        tls::set_g(Some(Arc::clone(&gp)));

        // 上下文切换：执行器把 G 跑到下一个挂起点
        sched.execute_greenlet(&gp);

        tls::set_g(None);

        // 系统调用慢路径和 drop_g 会把当前 G 清掉，那时无事可做
        let pending = self.take_pending();
        let gp = match self.take_current_g() {
            Some(g) => g,
            None => return,
        };

        match pending {
            Some(PendingAction::Yield) => {
                // 主动让出：回本地环尾部
                let p = self
                    .processor()
                    .expect("scheduler: yield on a machine without a processor");
                if let Some(batch) = p.runq_put(gp, false) {
                    sched.global_runq_batch(batch);
                }
            }
            Some(PendingAction::Park(unlockf)) => {
                // 停车：切换完成后才执行解锁函数。返回 false 说明
                // 竞争失败，停车从未对唤醒者可见，立即重新就绪。
                if let Some(unlockf) = unlockf {
                    if !unlockf() {
                        gp.set_status(GreenletStatus::Runnable);
                        let p = self
                            .processor()
                            .expect("scheduler: park on a machine without a processor");
                        if let Some(batch) = p.runq_put(gp, true) {
                            sched.global_runq_batch(batch);
                        }
                    }
                }
            }
            None => {
                // 没有声明挂起点，运行结束
                gp.mark_dead();
                sched.retire_greenlet(&gp);
            }
        }
    }

    /// 停车等待，容忍虚假唤醒
    pub fn park(&self) {
        self.parking.store(true, Ordering::Release);

        let mut signaled = self.park_mutex.lock();
        while !*signaled && !self.should_stop.load(Ordering::Relaxed) {
            self.park_cond.wait(&mut signaled);
        }
        *signaled = false;
        drop(signaled);

        self.parking.store(false, Ordering::Release);
    }

    /// 唤醒线程
    pub fn unpark(&self) {
        let mut signaled = self.park_mutex.lock();
        *signaled = true;
        self.park_cond.notify_one();
    }

    /// 检查是否正在停车
    #[inline]
    pub fn is_parking(&self) -> bool {
        self.parking.load(Ordering::Acquire)
    }

    /// 是否应当停止
    #[inline]
    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::Relaxed)
    }

    /// 请求停止工作线程
    pub fn stop(&self) {
        self.should_stop.store(true, Ordering::Release);
        self.unpark();
    }

    /// 等待线程结束
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("spinning", &self.is_spinning())
            .field("parking", &self.is_parking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_new() {
        let m = Machine::new(0);
        assert_eq!(m.id, 0);
        assert!(!m.is_spinning());
        assert!(m.processor().is_none());
        assert!(m.current_g().is_none());
    }

    #[test]
    fn test_park_unpark() {
        let m = Machine::new(1);
        m.unpark();
        // 信号已经置位，停车立即返回
        m.park();
        assert!(!m.is_parking());
    }

    #[test]
    fn test_next_rand_varies() {
        let m = Machine::new(2);
        let a = m.next_rand();
        let b = m.next_rand();
        assert_ne!(a, b);
    }

    #[test]
    fn test_stop_flag() {
        let m = Machine::new(3);
        assert!(!m.should_stop());
        m.stop();
        assert!(m.should_stop());
    }
}
