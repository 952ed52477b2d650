//! 全局调度器
//!
//! M:N 调度模型的核心：全局运行队列、空闲 P/M 列表、自旋计数、
//! FindRunnable、P 交接和系统调用边界。一把粗粒度的调度器锁保护
//! 全局队列和两个空闲列表；`nr_spinning`、`nr_idlep`、`last_poll`
//! 等计数器都是无锁原子量。
//!
//! 不变式：只要存在可运行的 G 且有空闲的 P，就必须有一个 M 在
//! 自旋找工作，或者已经发出了一次唤醒。自旋计数就是为此服务的。

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use log::{debug, trace};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::config::{DEFAULT_MAX_MACHINES, DEFAULT_THREADPOOL_SIZE};

use super::greenlet::{Greenlet, GreenletStatus};
use super::machine::{Machine, PendingAction};
use super::netpoll::{monotonic_millis, NetPoller};
use super::processor::{Processor, ProcessorStatus};
use super::queue::RUNQ_CAPACITY;
use super::threadpool::ThreadPool;
use super::tls;
use super::GletId;

/// 每隔多少次本地派发强制查询一次全局队列，防止本地工作饿死全局
const SCHED_TICK_GLOBAL_INTERVAL: u32 = 61;

/// 窃取的轮数，最后一轮允许偷 run-next
const STEAL_ATTEMPTS: usize = 4;

/// 阻塞轮询的时间上限（纳秒）
const POLL_BLOCK_NS: i64 = 10_000_000;

/// 全局调度器单例
pub static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();

/// 获取全局调度器
pub fn get_scheduler() -> &'static Scheduler {
    SCHEDULER.get_or_init(Scheduler::new)
}

/// 按给定配置初始化全局调度器并启动。重复调用只生效一次。
pub fn init(config: SchedulerConfig) -> &'static Scheduler {
    let sched = SCHEDULER.get_or_init(|| Scheduler::with_config(config));
    sched.start();
    sched
}

/// Park 登记的解锁函数：在切换回 g0 之后执行。
/// 返回 false 表示停车竞争失败，G 会被立即重新就绪。
pub type UnlockFunc = Box<dyn FnOnce() -> bool + Send>;

/// 调度器配置
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// 逻辑处理器数量（默认为 CPU 核心数）
    pub num_processors: usize,
    /// 工作线程数量的硬上限，超出即为致命错误
    pub max_machines: usize,
    /// 阻塞型任务线程池大小
    pub threadpool_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_processors: num_cpus::get(),
            max_machines: DEFAULT_MAX_MACHINES,
            threadpool_size: DEFAULT_THREADPOOL_SIZE,
        }
    }
}

impl SchedulerConfig {
    fn validate(&self) {
        if self.num_processors < 1 {
            panic!("scheduler: num_processors must be at least 1");
        }
        if self.max_machines < self.num_processors {
            panic!("scheduler: max_machines must be at least num_processors");
        }
        if self.threadpool_size < 1 {
            panic!("scheduler: threadpool_size must be at least 1");
        }
    }
}

/// 调度器锁保护的部分
struct SchedInner {
    /// 全局运行队列，FIFO
    runq: VecDeque<Arc<Greenlet>>,
    /// 空闲处理器列表（存 id）
    idle_p: Vec<usize>,
    /// 空闲工作线程列表（存 id）
    idle_m: Vec<u64>,
}

/// 全局调度器
pub struct Scheduler {
    /// 配置
    config: SchedulerConfig,
    /// 调度器锁
    lock: Mutex<SchedInner>,
    /// 全局队列长度镜像，无锁读取
    runq_size: AtomicU32,
    /// 空闲处理器数量镜像
    nr_idlep: AtomicU32,
    /// 自旋中的 M 数量
    nr_spinning: AtomicU32,
    /// 上一次网络轮询的时间戳（毫秒），0 表示一次轮询正在进行
    last_poll: AtomicU32,
    /// 活跃处理器数量（resize_procs 之后小于 allp 长度）
    nprocs: AtomicUsize,
    /// 所有处理器，退役的仍占位以保持 id 稳定
    allp: RwLock<Vec<Arc<Processor>>>,
    /// 所有工作线程，id 即下标
    machines: RwLock<Vec<Arc<Machine>>>,
    /// 活跃 G 注册表
    registry: DashMap<GletId, Arc<Greenlet>>,
    /// 活跃 G 数量
    glet_count: AtomicU64,
    /// G ID 计数器
    next_glet_id: AtomicU64,
    /// 是否正在运行
    running: AtomicBool,
    /// G 执行器：把 G 跑到下一个挂起点的上下文切换原语
    executor: RwLock<Option<Box<dyn Fn(&Greenlet) + Send + Sync>>>,
    /// 网络轮询器
    poller: RwLock<Option<Box<dyn NetPoller>>>,
    /// 阻塞型任务线程池
    threadpool: Mutex<Option<Arc<ThreadPool>>>,
}

impl Scheduler {
    /// 用默认配置创建调度器
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// 用指定配置创建调度器。P 在这里创建并全部置为空闲；
    /// M 由 start 和 start_m 按需创建。
    pub fn with_config(config: SchedulerConfig) -> Self {
        config.validate();
        let num_p = config.num_processors;

        let processors: Vec<_> = (0..num_p).map(|id| Arc::new(Processor::new(id))).collect();
        let idle_p: Vec<usize> = (0..num_p).collect();

        Self {
            config,
            lock: Mutex::new(SchedInner {
                runq: VecDeque::new(),
                idle_p,
                idle_m: Vec::new(),
            }),
            runq_size: AtomicU32::new(0),
            nr_idlep: AtomicU32::new(num_p as u32),
            nr_spinning: AtomicU32::new(0),
            last_poll: AtomicU32::new(0),
            nprocs: AtomicUsize::new(num_p),
            allp: RwLock::new(processors),
            machines: RwLock::new(Vec::new()),
            registry: DashMap::new(),
            glet_count: AtomicU64::new(0),
            next_glet_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            executor: RwLock::new(None),
            poller: RwLock::new(None),
            threadpool: Mutex::new(None),
        }
    }

    /// 启动调度器：建线程池并拉起一个引导 M。
    /// 执行器必须在这之前装好。
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return; // 已经在运行
        }
        debug!("scheduler: starting with {} processors", self.nprocs());

        if self.poller.read().is_some() {
            self.last_poll.store(monotonic_millis(), Ordering::SeqCst);
        }

        let pool = ThreadPool::new(self.config.threadpool_size);
        pool.set_scheduler(self as *const Scheduler as *mut Scheduler);
        *self.threadpool.lock() = Some(pool);

        // 引导 M
        self.start_m(None, false);
    }

    /// 关闭调度器：静默语义，停掉所有 M 和线程池。
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("scheduler: shutting down");

        let machines: Vec<_> = self.machines.read().clone();
        for m in &machines {
            m.stop();
        }
        for m in &machines {
            m.join();
        }
        // 关闭窗口里迟到创建的 M
        let late: Vec<_> = self.machines.read().clone();
        for m in late.iter().skip(machines.len()) {
            m.stop();
            m.join();
        }

        if let Some(pool) = self.threadpool.lock().take() {
            pool.shutdown();
        }
    }

    /// 检查是否正在运行
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 生成新的 G ID
    #[inline]
    pub fn next_glet_id(&self) -> GletId {
        self.next_glet_id.fetch_add(1, Ordering::Relaxed)
    }

    /// 活跃 G 数量
    #[inline]
    pub fn glet_count(&self) -> u64 {
        self.glet_count.load(Ordering::Relaxed)
    }

    /// 活跃处理器数量
    #[inline]
    pub fn nprocs(&self) -> usize {
        self.nprocs.load(Ordering::Relaxed)
    }

    /// 获取处理器
    pub fn processor(&self, idx: usize) -> Option<Arc<Processor>> {
        self.allp.read().get(idx).cloned()
    }

    /// 设置 G 执行器：调用它等价于从 g0 切换到 G，直到 G 到达
    /// 下一个挂起点才返回
    pub fn set_executor<F>(&self, executor: F)
    where
        F: Fn(&Greenlet) + Send + Sync + 'static,
    {
        *self.executor.write() = Some(Box::new(executor));
    }

    /// 执行 G（由 M 的 g0 循环调用）
    pub(crate) fn execute_greenlet(&self, gp: &Greenlet) {
        if let Some(executor) = self.executor.read().as_ref() {
            executor(gp);
        }
    }

    /// 安装网络轮询器，必须在 start 之前调用
    pub fn set_net_poller<P: NetPoller + 'static>(&self, poller: P) {
        *self.poller.write() = Some(Box::new(poller));
    }

    #[inline]
    fn poller_installed(&self) -> bool {
        self.last_poll.load(Ordering::SeqCst) != 0 || self.poller.read().is_some()
    }

    fn net_poll(&self, block_ns: i64) -> Vec<Arc<Greenlet>> {
        match self.poller.read().as_ref() {
            Some(p) => p.poll(block_ns),
            None => Vec::new(),
        }
    }

    /// 获取线程池
    pub(crate) fn threadpool(&self) -> Option<Arc<ThreadPool>> {
        self.threadpool.lock().clone()
    }

    // ---- 全局运行队列 ----

    /// 全局队列长度（无锁镜像）
    #[inline]
    pub fn global_len(&self) -> usize {
        self.runq_size.load(Ordering::SeqCst) as usize
    }

    fn global_put_locked(&self, inner: &mut SchedInner, gp: Arc<Greenlet>) {
        inner.runq.push_back(gp);
        self.runq_size.fetch_add(1, Ordering::SeqCst);
    }

    fn global_put_head_locked(&self, inner: &mut SchedInner, gp: Arc<Greenlet>) {
        inner.runq.push_front(gp);
        self.runq_size.fetch_add(1, Ordering::SeqCst);
    }

    /// 放入全局队列尾部
    pub fn global_runq_put(&self, gp: Arc<Greenlet>) {
        let mut inner = self.lock.lock();
        self.global_put_locked(&mut inner, gp);
    }

    /// 放入全局队列头部，刚被抢占下来的 G 用它尽快再跑
    pub fn global_runq_put_head(&self, gp: Arc<Greenlet>) {
        let mut inner = self.lock.lock();
        self.global_put_head_locked(&mut inner, gp);
    }

    /// 批量拼接到全局队列尾部
    pub fn global_runq_batch(&self, batch: Vec<Arc<Greenlet>>) {
        let mut inner = self.lock.lock();
        for gp in batch {
            self.global_put_locked(&mut inner, gp);
        }
    }

    /// 从全局队列搬一批到 P 的本地环，返回其中一个供立即执行。
    /// 搬运量是 `min(size/nprocs + 1, max, size, 本地容量的一半)`，
    /// max 为 0 表示不限制。
    pub fn global_runq_get(&self, p: &Processor, max: usize) -> Option<Arc<Greenlet>> {
        let mut inner = self.lock.lock();
        self.global_get_locked(&mut inner, p, max)
    }

    fn global_get_locked(
        &self,
        inner: &mut SchedInner,
        p: &Processor,
        max: usize,
    ) -> Option<Arc<Greenlet>> {
        let size = inner.runq.len();
        if size == 0 {
            return None;
        }
        let mut n = size / self.nprocs().max(1) + 1;
        if n > size {
            n = size;
        }
        if max > 0 && n > max {
            n = max;
        }
        if n > RUNQ_CAPACITY / 2 {
            n = RUNQ_CAPACITY / 2;
        }

        let gp = inner.runq.pop_front().unwrap();
        self.runq_size.fetch_sub(1, Ordering::SeqCst);
        for _ in 1..n {
            let g = inner.runq.pop_front().unwrap();
            self.runq_size.fetch_sub(1, Ordering::SeqCst);
            if let Some(batch) = p.runq_put(g, false) {
                // 本地环装不下，放回去
                for b in batch {
                    self.global_put_locked(inner, b);
                }
                break;
            }
        }
        Some(gp)
    }

    /// 把一串新就绪的 G 注入全局队列，并按空闲 P 的数量逐个唤醒
    pub fn inject_glist(&self, list: Vec<Arc<Greenlet>>) {
        if list.is_empty() {
            return;
        }
        let mut n = list.len();
        {
            let mut inner = self.lock.lock();
            for g in list {
                g.set_status(GreenletStatus::Runnable);
                self.global_put_locked(&mut inner, g);
            }
        }
        while n > 0 && self.nr_idlep.load(Ordering::SeqCst) > 0 && self.is_running() {
            self.start_m(None, false);
            n -= 1;
        }
    }

    // ---- 空闲列表 ----

    fn pidle_put_locked(&self, inner: &mut SchedInner, pid: usize) {
        inner.idle_p.push(pid);
        self.nr_idlep.fetch_add(1, Ordering::SeqCst);
    }

    fn pidle_get_locked(&self, inner: &mut SchedInner) -> Option<usize> {
        let pid = inner.idle_p.pop()?;
        self.nr_idlep.fetch_sub(1, Ordering::SeqCst);
        Some(pid)
    }

    /// 摘走一个空闲处理器（测试和引导路径使用）
    pub(crate) fn take_idle_p(&self) -> Option<Arc<Processor>> {
        let allp = self.allp.read();
        let mut inner = self.lock.lock();
        let pid = self.pidle_get_locked(&mut inner)?;
        Some(Arc::clone(&allp[pid]))
    }

    // ---- 提交与就绪 ----

    /// 提交一个新的可运行 G
    ///
    /// 在绑定了 P 的调度线程上按就绪语义插入本地 run-next，
    /// 否则进全局队列。两种情形都会在必要时唤醒一个 P。
    pub fn submit(&self, gp: Arc<Greenlet>) {
        gp.set_status(GreenletStatus::Runnable);
        self.registry.insert(gp.id, Arc::clone(&gp));
        self.glet_count.fetch_add(1, Ordering::Relaxed);

        let bound = tls::get_m().and_then(|m| {
            let same = m
                .scheduler()
                .map(|s| std::ptr::eq(s, self))
                .unwrap_or(false);
            if same {
                m.processor()
            } else {
                None
            }
        });
        match bound {
            Some(p) => {
                if let Some(batch) = p.runq_put(gp, true) {
                    self.global_runq_batch(batch);
                }
            }
            None => {
                let mut inner = self.lock.lock();
                self.global_put_locked(&mut inner, gp);
            }
        }
        self.wake_p_if_necessary();
    }

    /// 无绑定 P 的线程（线程池 worker、轮询线程）用它唤醒一个
    /// 等待中的 G：进全局队列并唤醒一个 P
    pub fn make_ready(&self, gp: Arc<Greenlet>) {
        if !gp.cas_status(GreenletStatus::Waiting, GreenletStatus::Runnable) {
            panic!(
                "scheduler: make_ready on greenlet {} in state {:?}",
                gp.id,
                gp.status()
            );
        }
        {
            let mut inner = self.lock.lock();
            self.global_put_locked(&mut inner, gp);
        }
        self.wake_p_if_necessary();
    }

    /// G 运行结束，从注册表里退役
    pub(crate) fn retire_greenlet(&self, gp: &Greenlet) {
        if self.registry.remove(&gp.id).is_some() {
            self.glet_count.fetch_sub(1, Ordering::Relaxed);
        }
        trace!("greenlet {} retired", gp.id);
    }

    // ---- 唤醒与自旋 ----

    /// 有空闲 P 且没有任何 M 在自旋时，唤醒一个 M 去找工作。
    /// 从 0 抬起自旋计数的 CAS 保证只有一个生产者会真正唤醒。
    pub fn wake_p_if_necessary(&self) {
        if !self.is_running() {
            return;
        }
        if self.nr_idlep.load(Ordering::SeqCst) == 0 {
            return;
        }
        if self.nr_spinning.load(Ordering::SeqCst) != 0 {
            return;
        }
        if self
            .nr_spinning
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.start_m(None, true);
    }

    /// M 找到工作后退出自旋状态。如果它是最后一个自旋者，
    /// 由它再唤醒一个 M，保证新释放的工作总有人看见。
    pub(crate) fn reset_spinning(&self, m: &Machine) {
        m.set_spinning(false);
        let old = self.nr_spinning.fetch_sub(1, Ordering::SeqCst);
        if old == 1 {
            self.wake_p_if_necessary();
        }
    }

    /// 自旋中的 M 数量
    #[inline]
    pub fn nr_spinning(&self) -> u32 {
        self.nr_spinning.load(Ordering::SeqCst)
    }

    /// 空闲 P 数量
    #[inline]
    pub fn nr_idlep(&self) -> u32 {
        self.nr_idlep.load(Ordering::SeqCst)
    }

    // ---- M 的启动与停车 ----

    /// 找一个 M 并把 p 交给它。没有空闲 M 时新建，超过
    /// max_machines 即为致命错误。
    ///
    /// spinning 为 true 时调用方必须已经把 nr_spinning 加一，
    /// 这样别的生产者不会竞相再唤醒一个 M。
    pub(crate) fn start_m(&self, p: Option<Arc<Processor>>, spinning: bool) {
        let p = match p {
            Some(p) => p,
            None => {
                let allp = self.allp.read();
                let pid = {
                    let mut inner = self.lock.lock();
                    self.pidle_get_locked(&mut inner)
                };
                match pid {
                    Some(pid) => Arc::clone(&allp[pid]),
                    None => {
                        // 没有空闲 P，撤销自旋预订
                        if spinning {
                            self.nr_spinning.fetch_sub(1, Ordering::SeqCst);
                        }
                        return;
                    }
                }
            }
        };

        let mid = {
            let mut inner = self.lock.lock();
            inner.idle_m.pop()
        };
        if let Some(mid) = mid {
            let m = Arc::clone(&self.machines.read()[mid as usize]);
            m.set_spinning(spinning);
            m.set_next_p(p);
            m.unpark();
            return;
        }

        // 没有空闲 M，新建一个
        let mut machines = self.machines.write();
        if machines.len() >= self.config.max_machines {
            panic!(
                "scheduler: machine count {} exceeds max_machines {}",
                machines.len(),
                self.config.max_machines
            );
        }
        let m = Machine::new(machines.len() as u64);
        m.set_scheduler(self as *const Scheduler as *mut Scheduler);
        m.set_spinning(spinning);
        m.set_next_p(p);
        machines.push(Arc::clone(&m));
        drop(machines);
        debug!("scheduler: created machine {}", m.id);
        m.start();
    }

    /// M 没有工作也没有 P 时停车，直到 start_m 指派新的 P
    pub(crate) fn stop_m(&self, m: &Arc<Machine>) {
        if m.processor().is_some() {
            panic!("scheduler: stop_m on machine {} with a bound processor", m.id);
        }
        if m.is_spinning() {
            m.set_spinning(false);
            self.nr_spinning.fetch_sub(1, Ordering::SeqCst);
        }
        {
            let mut inner = self.lock.lock();
            inner.idle_m.push(m.id);
        }
        m.park();
        if let Some(p) = m.take_next_p() {
            self.acquire_p(m, &p);
        }
    }

    /// M 退出 g0 循环时归还手里的 P
    pub(crate) fn detach_on_exit(&self, m: &Arc<Machine>) {
        if m.processor().is_some() {
            let p = self.release_p(m);
            let mut inner = self.lock.lock();
            self.pidle_put_locked(&mut inner, p.id);
        }
    }

    // ---- M↔P 协议 ----

    /// 把 p 绑定到 m。p 必须是空闲状态，违反即为致命错误。
    pub(crate) fn acquire_p(&self, m: &Arc<Machine>, p: &Arc<Processor>) {
        if m.processor().is_some() {
            panic!(
                "scheduler: acquire_p on machine {} that already holds a processor",
                m.id
            );
        }
        if !p.cas_status(ProcessorStatus::Idle, ProcessorStatus::Running) {
            panic!(
                "scheduler: acquire_p on processor {} in state {:?}",
                p.id,
                p.status()
            );
        }
        p.bind_machine(m.id);
        m.set_processor(Arc::clone(p));
    }

    /// acquire_p 的逆操作，返回解绑的 P
    pub(crate) fn release_p(&self, m: &Arc<Machine>) -> Arc<Processor> {
        let p = m
            .take_processor()
            .expect("scheduler: release_p on an unbound machine");
        if !p.cas_status(ProcessorStatus::Running, ProcessorStatus::Idle) {
            panic!(
                "scheduler: release_p on processor {} in state {:?}",
                p.id,
                p.status()
            );
        }
        p.unbind_machine();
        p
    }

    /// 当前 M 要在系统调用里阻塞，而 p 可能还有活：决定是否
    /// 把 p 交给别的 M。不交接时 p 停留在 Syscall 状态，等原来
    /// 的 M 快速夺回。
    pub(crate) fn handoff_p(&self, p: Arc<Processor>) {
        // p 还有活或全局队列非空，必须交出去
        if !p.runq_empty() || self.global_len() > 0 {
            if p.cas_status(ProcessorStatus::Syscall, ProcessorStatus::Idle) {
                p.unbind_machine();
                trace!("handoff processor {}", p.id);
                self.start_m(Some(p), false);
            }
            return;
        }
        // 没有任何搜索者也没有空闲 P：交出去自旋，避免唤醒竞争
        if self.nr_spinning.load(Ordering::SeqCst) + self.nr_idlep.load(Ordering::SeqCst) == 0
            && self
                .nr_spinning
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            if p.cas_status(ProcessorStatus::Syscall, ProcessorStatus::Idle) {
                p.unbind_machine();
                self.start_m(Some(p), true);
            } else {
                self.nr_spinning.fetch_sub(1, Ordering::SeqCst);
            }
            return;
        }
        // 网络轮询到期且只剩这一个 P 还没闲下来
        if self.poller_installed()
            && self.last_poll.load(Ordering::SeqCst) != 0
            && self.nr_idlep.load(Ordering::SeqCst) as usize + 1 >= self.nprocs()
        {
            if p.cas_status(ProcessorStatus::Syscall, ProcessorStatus::Idle) {
                p.unbind_machine();
                self.start_m(Some(p), false);
            }
        }
        // 其余情形：留在 Syscall 状态等待快速回收
    }

    // ---- 系统调用边界 ----

    /// G 即将进入会阻塞的系统调用：P 和 M 解耦，P 转入 Syscall
    /// 状态，M 记住它以便快速夺回，调度器视情况交接。
    pub(crate) fn enter_syscall_block_on(&self, m: &Arc<Machine>, gp: &Arc<Greenlet>) {
        if gp.status() != GreenletStatus::Running {
            panic!(
                "scheduler: enter_syscall_block on greenlet {} in state {:?}",
                gp.id,
                gp.status()
            );
        }
        let p = m
            .take_processor()
            .expect("scheduler: enter_syscall_block on an unbound machine");
        gp.set_status(GreenletStatus::Syscall);
        if !p.cas_status(ProcessorStatus::Running, ProcessorStatus::Syscall) {
            panic!(
                "scheduler: processor {} not running at syscall entry",
                p.id
            );
        }
        // back-pointer 在 Syscall 状态期间继续有效
        m.set_old_p(Arc::clone(&p));
        self.handoff_p(p);
    }

    /// 系统调用返回。true 表示已经重新拿到 P，调用方可以继续
    /// 执行；false 表示 G 已进入全局队列，调用方必须立即挂起。
    pub(crate) fn exit_syscall_on(&self, m: &Arc<Machine>, gp: &Arc<Greenlet>) -> bool {
        if gp.status() != GreenletStatus::Syscall {
            panic!(
                "scheduler: exit_syscall on greenlet {} in state {:?}",
                gp.id,
                gp.status()
            );
        }
        // 快速路径：老 P 还停在 Syscall 状态，直接夺回
        if let Some(oldp) = m.take_old_p() {
            if oldp.cas_status(ProcessorStatus::Syscall, ProcessorStatus::Running) {
                oldp.bind_machine(m.id);
                m.set_processor(Arc::clone(&oldp));
                gp.set_status(GreenletStatus::Running);
                return true;
            }
        }
        self.exit_syscall0(m, gp)
    }

    /// 慢路径：找任意空闲 P 接着跑，都没有就进全局队列，
    /// 让 M 自己去停车。取空闲 P 和入全局队列在同一个临界区里，
    /// 否则 G 可能正好在别的 M 归还 P 之后入队而无人唤醒。
    fn exit_syscall0(&self, m: &Arc<Machine>, gp: &Arc<Greenlet>) -> bool {
        let allp = self.allp.read();
        let mut inner = self.lock.lock();
        // ExitSyscallPIdle
        if let Some(pid) = self.pidle_get_locked(&mut inner) {
            let p = Arc::clone(&allp[pid]);
            drop(inner);
            drop(allp);
            self.acquire_p(m, &p);
            gp.set_status(GreenletStatus::Running);
            return true;
        }
        gp.set_status(GreenletStatus::Runnable);
        m.take_current_g();
        self.global_put_locked(&mut inner, Arc::clone(gp));
        false
    }

    // ---- FindRunnable ----

    /// 找工作的非阻塞部分：本地、全局、非阻塞轮询、窃取。
    /// 找不到返回 None；调用方可能已经进入自旋状态。
    pub(crate) fn find_runnable_once(
        &self,
        m: &Arc<Machine>,
        p: &Arc<Processor>,
    ) -> Option<(Arc<Greenlet>, bool)> {
        // 1. 每 61 次派发强制从全局队列拿一个，防止饿死
        if p.sched_tick() % SCHED_TICK_GLOBAL_INTERVAL == 0 && self.global_len() > 0 {
            let mut inner = self.lock.lock();
            if let Some(g) = self.global_get_locked(&mut inner, p, 1) {
                return Some((g, false));
            }
        }

        // 2. 本地：run-next 优先，然后环头
        if let Some(found) = p.runq_get() {
            return Some(found);
        }

        // 3. 全局队列搬一批
        if self.global_len() > 0 {
            let mut inner = self.lock.lock();
            if let Some(g) = self.global_get_locked(&mut inner, p, 0) {
                return Some((g, false));
            }
        }

        // 4. 非阻塞网络轮询
        if self.poller_installed()
            && self.last_poll.load(Ordering::SeqCst) != 0
            && self.nr_spinning.load(Ordering::SeqCst) == 0
            && self.nr_idlep.load(Ordering::SeqCst) == 0
        {
            let mut list = self.net_poll(0);
            if !list.is_empty() {
                let g = list.remove(0);
                g.set_status(GreenletStatus::Runnable);
                self.inject_glist(list);
                return Some((g, false));
            }
        }

        // 5. 窃取：进入自旋状态，随机序扫其他 P，最后一轮偷 run-next
        if !m.is_spinning() {
            m.set_spinning(true);
            self.nr_spinning.fetch_add(1, Ordering::SeqCst);
        }
        let allp = self.allp.read();
        for attempt in 0..STEAL_ATTEMPTS {
            let steal_next = attempt == STEAL_ATTEMPTS - 1;
            let offset = m.next_rand() as usize % allp.len();
            for i in 0..allp.len() {
                let victim = &allp[(offset + i) % allp.len()];
                if victim.id == p.id || victim.is_dead() {
                    continue;
                }
                if let Some(g) = p.runq_steal(victim, steal_next) {
                    return Some((g, false));
                }
            }
        }

        None
    }

    /// 找一个可运行的 G，找不到就释放 P 并停车，直到被唤醒。
    /// 只在调度器关闭时返回 None。
    pub(crate) fn find_runnable(&self, m: &Arc<Machine>) -> Option<(Arc<Greenlet>, bool)> {
        loop {
            if !self.is_running() || m.should_stop() {
                return None;
            }
            let p = match m.processor() {
                Some(p) => p,
                None => {
                    self.stop_m(m);
                    continue;
                }
            };

            if let Some(found) = self.find_runnable_once(m, &p) {
                if m.is_spinning() {
                    self.reset_spinning(m);
                }
                return Some(found);
            }

            // 6+8 前半：最后的全局复查和归还 P 必须在同一个临界区，
            // 否则生产者可能在间隙里入队而谁也不唤醒
            {
                let mut inner = self.lock.lock();
                if !inner.runq.is_empty() {
                    if let Some(g) = self.global_get_locked(&mut inner, &p, 0) {
                        drop(inner);
                        if m.is_spinning() {
                            self.reset_spinning(m);
                        }
                        return Some((g, false));
                    }
                }
                let idle = self.release_p(m);
                self.pidle_put_locked(&mut inner, idle.id);
            }

            // 自旋复位，然后把所有运行队列再看一遍
            if m.is_spinning() {
                m.set_spinning(false);
                self.nr_spinning.fetch_sub(1, Ordering::SeqCst);
                let busy = self.global_len() > 0 || {
                    let allp = self.allp.read();
                    allp.iter().any(|p2| !p2.is_dead() && !p2.runq_empty())
                };
                if busy {
                    if let Some(p2) = self.take_idle_p() {
                        self.acquire_p(m, &p2);
                        m.set_spinning(true);
                        self.nr_spinning.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                }
            }

            // 7. 阻塞网络轮询：只允许最后一个搜索者做
            if self.poller_installed() && self.nr_spinning.load(Ordering::SeqCst) == 0 {
                let stamp = self.last_poll.swap(0, Ordering::SeqCst);
                if stamp != 0 {
                    let mut list = self.net_poll(POLL_BLOCK_NS);
                    self.last_poll.store(monotonic_millis(), Ordering::SeqCst);
                    if !list.is_empty() {
                        if let Some(p2) = self.take_idle_p() {
                            self.acquire_p(m, &p2);
                            let g = list.remove(0);
                            g.set_status(GreenletStatus::Runnable);
                            self.inject_glist(list);
                            return Some((g, false));
                        }
                        self.inject_glist(list);
                    }
                }
            }

            // 8. 停车
            self.stop_m(m);
        }
    }

    /// 一轮调度：当前 G（如果有）按让出语义重新入队，然后找
    /// 下一个 G 派发。返回 false 表示调度器已关闭。
    pub fn one_round_sched(&self, m: &Arc<Machine>, curg: Option<Arc<Greenlet>>) -> bool {
        if let Some(g) = curg {
            g.set_status(GreenletStatus::Runnable);
            match m.processor() {
                Some(p) => {
                    if let Some(batch) = p.runq_put(g, false) {
                        self.global_runq_batch(batch);
                    }
                }
                None => self.global_runq_put(g),
            }
        }
        match self.find_runnable(m) {
            Some((g, inherit_time)) => {
                m.dispatch(self, g, inherit_time);
                true
            }
            None => false,
        }
    }

    // ---- P 的伸缩 ----

    /// 调整活跃处理器数量。缩容时多余的 P 必须已经静止
    /// （空闲或停在系统调用里），它们的本地队列被排干进全局
    /// 队列，然后标记为退役。
    pub fn resize_procs(&self, nprocs: usize) {
        if nprocs < 1 {
            panic!("scheduler: resize_procs to zero processors");
        }
        let mut allp = self.allp.write();

        if nprocs >= allp.len() {
            // 扩容：新建 P 并置为空闲
            let mut inner = self.lock.lock();
            for id in allp.len()..nprocs {
                let p = Arc::new(Processor::new(id));
                allp.push(p);
                self.pidle_put_locked(&mut inner, id);
            }
            drop(inner);
            self.nprocs.store(nprocs, Ordering::SeqCst);
            drop(allp);
            self.wake_p_if_necessary();
            return;
        }

        debug!("scheduler: resizing processors {} -> {}", allp.len(), nprocs);
        for p in allp[nprocs..].iter() {
            if p.is_dead() {
                continue;
            }
            if !(p.cas_status(ProcessorStatus::Idle, ProcessorStatus::Dead)
                || p.cas_status(ProcessorStatus::Syscall, ProcessorStatus::Dead))
            {
                panic!(
                    "scheduler: resize_procs while processor {} is running",
                    p.id
                );
            }
            p.unbind_machine();
            {
                let mut inner = self.lock.lock();
                inner.idle_p.retain(|&i| i != p.id);
                self.nr_idlep
                    .store(inner.idle_p.len() as u32, Ordering::SeqCst);
            }
            p.move_runq_to_global(self);
        }
        self.nprocs.store(nprocs, Ordering::SeqCst);
        drop(allp);
        self.wake_p_if_necessary();
    }

    /// 调度统计信息
    pub fn stats(&self) -> SchedulerStats {
        let local_queue_lens: Vec<usize> = {
            let allp = self.allp.read();
            allp.iter()
                .map(|p| p.runq_len() + if p.local_queue.has_next() { 1 } else { 0 })
                .collect()
        };
        let (idle_processors, idle_machines) = {
            let inner = self.lock.lock();
            (inner.idle_p.len(), inner.idle_m.len())
        };
        SchedulerStats {
            glet_count: self.glet_count(),
            global_queue_len: self.global_len(),
            local_queue_lens,
            nr_idlep: self.nr_idlep(),
            idle_processors,
            nr_spinning: self.nr_spinning(),
            machine_count: self.machines.read().len(),
            idle_machines,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// 调度统计信息
#[derive(Debug)]
pub struct SchedulerStats {
    pub glet_count: u64,
    pub global_queue_len: usize,
    pub local_queue_lens: Vec<usize>,
    pub nr_idlep: u32,
    pub idle_processors: usize,
    pub nr_spinning: u32,
    pub machine_count: usize,
    pub idle_machines: usize,
}

// ---- 协作代码的自由函数入口 ----
//
// 这些函数都要求在调度线程上、且大多要求有当前 G 的上下文里
// 调用；违反即为致命的使用错误。

fn current_machine() -> Arc<Machine> {
    tls::get_m().expect("scheduler: not on a scheduler thread")
}

/// 当前 G 主动让出：回到本地环尾部，控制权交还 g0
pub fn yield_now() {
    let m = current_machine();
    let gp = tls::get_g().expect("scheduler: yield_now without a current greenlet");
    if gp.status() != GreenletStatus::Running {
        panic!(
            "scheduler: yield_now on greenlet {} in state {:?}",
            gp.id,
            gp.status()
        );
    }
    gp.set_status(GreenletStatus::Runnable);
    m.set_pending(PendingAction::Yield);
}

/// 当前 G 声明要阻塞。unlockf 在切换回 g0 之后执行（典型用法
/// 是栈切换完成后再放开互斥量）；返回 false 表示竞争失败，
/// G 会被立即重新就绪。
pub fn park(unlockf: Option<UnlockFunc>, reason: &'static str) {
    let m = current_machine();
    let gp = tls::get_g().expect("scheduler: park without a current greenlet");
    if gp.status() != GreenletStatus::Running {
        panic!("scheduler: double park of greenlet {}", gp.id);
    }
    gp.set_wait_reason(reason);
    gp.set_status(GreenletStatus::Waiting);
    m.set_pending(PendingAction::Park(unlockf));
}

/// park 的便捷形式：guard 必须来自 lock。guard 被遗忘，锁在
/// 切换回 g0 之后才真正放开，别的 M 不会看到中间状态。
pub fn park_unlock<T: Send + 'static>(
    lock: &Arc<Mutex<T>>,
    guard: MutexGuard<'_, T>,
    reason: &'static str,
) {
    mem::forget(guard);
    let lock = Arc::clone(lock);
    park(
        Some(Box::new(move || {
            unsafe { lock.force_unlock() };
            true
        })),
        reason,
    );
}

/// 唤醒一个等待中的 G：插入当前 P 的 run-next，并在必要时唤醒
/// 别的 P。必须在绑定了 P 的调度线程上调用。
pub fn ready(gp: Arc<Greenlet>) {
    let m = current_machine();
    let sched = m
        .scheduler()
        .expect("scheduler: ready on a machine without a scheduler");
    let p = m
        .processor()
        .expect("scheduler: ready requires a bound processor");
    if !gp.cas_status(GreenletStatus::Waiting, GreenletStatus::Runnable) {
        panic!(
            "scheduler: ready on greenlet {} in state {:?}",
            gp.id,
            gp.status()
        );
    }
    if let Some(batch) = p.runq_put(gp, true) {
        sched.global_runq_batch(batch);
    }
    sched.wake_p_if_necessary();
}

/// 把当前 G 从 M 上摘下来，不重新入队（终止路径使用）
pub fn drop_g() {
    let m = current_machine();
    m.take_current_g();
    tls::set_g(None);
}

/// 当前 G 运行结束：标记死亡、脱离 M、从注册表退役
pub fn glet_exit() {
    let m = current_machine();
    let gp = m
        .take_current_g()
        .expect("scheduler: glet_exit without a current greenlet");
    gp.mark_dead();
    tls::set_g(None);
    if let Some(sched) = m.scheduler() {
        sched.retire_greenlet(&gp);
    }
}

/// 当前 G 即将进入会阻塞的系统调用
pub fn enter_syscall_block() {
    let m = current_machine();
    let gp = tls::get_g().expect("scheduler: enter_syscall_block without a current greenlet");
    let sched = m
        .scheduler()
        .expect("scheduler: machine without a scheduler");
    sched.enter_syscall_block_on(&m, &gp);
}

/// 系统调用返回。true 表示可以继续执行；false 表示 G 已经被
/// 放进全局队列，调用方必须立即挂起（从执行器返回）。
pub fn exit_syscall() -> bool {
    let m = current_machine();
    let gp = tls::get_g().expect("scheduler: exit_syscall without a current greenlet");
    let sched = m
        .scheduler()
        .expect("scheduler: machine without a scheduler");
    sched.exit_syscall_on(&m, &gp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestCounter;
    use std::time::Duration;

    fn test_sched(nprocs: usize) -> &'static Scheduler {
        Box::leak(Box::new(Scheduler::with_config(SchedulerConfig {
            num_processors: nprocs,
            max_machines: 64,
            threadpool_size: 1,
        })))
    }

    fn make_glet(id: u64) -> Arc<Greenlet> {
        Arc::new(Greenlet::new(id))
    }

    fn bind_machine(sched: &'static Scheduler) -> (Arc<Machine>, Arc<Processor>) {
        let m = Machine::new(0);
        m.set_scheduler(sched as *const Scheduler as *mut Scheduler);
        let p = sched.take_idle_p().expect("no idle processor");
        sched.acquire_p(&m, &p);
        (m, p)
    }

    fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_global_runq_round_trip() {
        let sched = test_sched(1);
        let (_m, p) = bind_machine(sched);

        sched.global_runq_put(make_glet(42));
        assert_eq!(sched.global_len(), 1);
        let g = sched.global_runq_get(&p, 1).unwrap();
        assert_eq!(g.id, 42);
        assert_eq!(sched.global_len(), 0);
    }

    #[test]
    fn test_global_runq_put_head() {
        let sched = test_sched(1);
        let (_m, p) = bind_machine(sched);

        sched.global_runq_put(make_glet(1));
        sched.global_runq_put_head(make_glet(2));
        let g = sched.global_runq_get(&p, 1).unwrap();
        assert_eq!(g.id, 2);
    }

    #[test]
    fn test_global_runq_get_batch_formula() {
        let sched = test_sched(2);
        let (_m, p) = bind_machine(sched);

        for i in 0..8u64 {
            sched.global_runq_put(make_glet(i));
        }
        // n = min(8/2 + 1, 8) = 5：一个直接返回，四个进本地环
        let g = sched.global_runq_get(&p, 0).unwrap();
        assert_eq!(g.id, 0);
        assert_eq!(p.runq_len(), 4);
        assert_eq!(sched.global_len(), 3);
    }

    #[test]
    fn test_61_tick_fairness() {
        let sched = test_sched(1);
        let (m, p) = bind_machine(sched);

        // 本地 61 个，全局 1 个
        for i in 0..61u64 {
            p.runq_put(make_glet(1000 + i), false);
        }
        sched.global_runq_put(make_glet(9));
        p.set_sched_tick(1);

        // 第 1 到 60 次派发都来自本地
        for _ in 1..=60 {
            let (g, _) = sched.find_runnable_once(&m, &p).unwrap();
            assert!(g.id >= 1000, "dispatch {} came from the global queue", g.id);
            p.inc_sched_tick();
        }
        // 第 61 次派发强制走全局队列
        let (g, _) = sched.find_runnable_once(&m, &p).unwrap();
        assert_eq!(g.id, 9);
    }

    #[test]
    fn test_find_runnable_prefers_run_next() {
        let sched = test_sched(1);
        let (m, p) = bind_machine(sched);
        p.set_sched_tick(1);

        p.runq_put(make_glet(1), false);
        p.runq_put(make_glet(2), true);

        let (g, inherit) = sched.find_runnable_once(&m, &p).unwrap();
        assert_eq!(g.id, 2);
        assert!(inherit);
        let (g, inherit) = sched.find_runnable_once(&m, &p).unwrap();
        assert_eq!(g.id, 1);
        assert!(!inherit);
    }

    #[test]
    fn test_find_runnable_steals() {
        let sched = test_sched(2);
        let (m, p) = bind_machine(sched);
        p.set_sched_tick(1);

        // 另一个 P 当窃取目标
        let victim = sched.take_idle_p().unwrap();
        for i in 0..4u64 {
            victim.runq_put(make_glet(i), false);
        }

        let (g, _) = sched.find_runnable_once(&m, &p).unwrap();
        assert!(g.id < 4);
        assert!(m.is_spinning());
        assert_eq!(sched.nr_spinning(), 1);

        sched.reset_spinning(&m);
        assert!(!m.is_spinning());
        assert_eq!(sched.nr_spinning(), 0);
    }

    #[test]
    fn test_syscall_fast_path() {
        let sched = test_sched(2);
        let (m, p) = bind_machine(sched);

        let g = make_glet(1);
        g.set_status(GreenletStatus::Running);
        m.set_current_g(Arc::clone(&g));

        sched.enter_syscall_block_on(&m, &g);
        // 没活可交接，P 停在 Syscall 状态等待快速回收
        assert_eq!(p.status(), ProcessorStatus::Syscall);
        assert!(m.processor().is_none());
        assert_eq!(g.status(), GreenletStatus::Syscall);

        assert!(sched.exit_syscall_on(&m, &g));
        assert_eq!(p.status(), ProcessorStatus::Running);
        assert_eq!(m.processor().unwrap().id, p.id);
        assert_eq!(g.status(), GreenletStatus::Running);
    }

    #[test]
    fn test_syscall_slow_path_queues_globally() {
        let sched = test_sched(2);
        let (m, p) = bind_machine(sched);

        let g = make_glet(1);
        g.set_status(GreenletStatus::Running);
        m.set_current_g(Arc::clone(&g));

        // 另一个 P 空闲，交接不会发生，P 停在 Syscall 状态
        sched.enter_syscall_block_on(&m, &g);
        assert_eq!(p.status(), ProcessorStatus::Syscall);

        // 模拟 P 在系统调用期间被别人拿走
        assert!(p.cas_status(ProcessorStatus::Syscall, ProcessorStatus::Idle));
        p.unbind_machine();
        // 剩下的空闲 P 也被拿走，慢路径只能走全局队列
        let _other = sched.take_idle_p().unwrap();

        assert!(!sched.exit_syscall_on(&m, &g));
        assert_eq!(g.status(), GreenletStatus::Runnable);
        assert_eq!(sched.global_len(), 1);
        assert!(m.processor().is_none());
        assert!(m.current_g().is_none());
    }

    #[test]
    fn test_syscall_handoff_with_pending_work() {
        let sched = test_sched(1);
        let (m, p) = bind_machine(sched);

        let g = make_glet(1);
        g.set_status(GreenletStatus::Running);
        m.set_current_g(Arc::clone(&g));
        // P 的本地队列里还有活，交接必须发生
        p.runq_put(make_glet(2), false);

        sched.enter_syscall_block_on(&m, &g);
        assert_eq!(sched.stats().machine_count, 1);

        // 接手的 M 发现调度器没启动会立刻退出并归还 P
        let handoff_m = sched.machines.read()[0].clone();
        handoff_m.join();
        assert!(p.is_idle());

        // 归还的 P 被别人抢先拿走，快速回收失败，慢路径把 G
        // 送进全局队列
        let _stolen = sched.take_idle_p().unwrap();
        assert!(!sched.exit_syscall_on(&m, &g));
        assert_eq!(g.status(), GreenletStatus::Runnable);
        assert_eq!(sched.global_len(), 1);
    }

    #[test]
    fn test_submit_from_external_thread() {
        let sched = test_sched(1);
        let g = make_glet(7);
        sched.submit(Arc::clone(&g));

        assert_eq!(sched.global_len(), 1);
        assert_eq!(sched.glet_count(), 1);
        assert!(g.is_runnable());
    }

    #[test]
    fn test_make_ready() {
        let sched = test_sched(1);
        let g = make_glet(3);
        g.set_status(GreenletStatus::Waiting);

        sched.make_ready(Arc::clone(&g));
        assert!(g.is_runnable());
        assert_eq!(sched.global_len(), 1);
    }

    #[test]
    fn test_resize_procs_drains_to_global() {
        let sched = test_sched(4);

        let p2 = sched.processor(2).unwrap();
        let p3 = sched.processor(3).unwrap();
        p2.runq_put(make_glet(100), false);
        p2.runq_put(make_glet(101), true);
        p3.runq_put(make_glet(102), false);

        sched.resize_procs(2);

        assert!(p2.is_dead());
        assert!(p3.is_dead());
        assert_eq!(sched.nprocs(), 2);
        assert_eq!(sched.global_len(), 3);
        let stats = sched.stats();
        assert_eq!(stats.idle_processors, 2);
        assert_eq!(stats.nr_idlep, 2);

        // 幸存的 P 随后从全局队列把它们捡起来
        let (m, p) = bind_machine(sched);
        p.set_sched_tick(1);
        let (g, _) = sched.find_runnable_once(&m, &p).unwrap();
        assert!(g.id >= 100);
    }

    #[test]
    fn test_resize_procs_grow() {
        let sched = test_sched(2);
        sched.resize_procs(4);
        assert_eq!(sched.nprocs(), 4);
        assert_eq!(sched.stats().idle_processors, 4);
        assert!(sched.processor(3).unwrap().is_idle());
    }

    // ---- 端到端 ----

    struct StepCounter {
        steps: DashMap<GletId, u64>,
    }

    impl StepCounter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                steps: DashMap::new(),
            })
        }

        fn bump(&self, id: GletId) -> u64 {
            let mut e = self.steps.entry(id).or_insert(0);
            *e += 1;
            *e
        }
    }

    #[test]
    fn test_end_to_end_yield_and_complete() {
        let sched = test_sched(2);
        let counter = StepCounter::new();
        let c = Arc::clone(&counter);
        sched.set_executor(move |g| {
            if c.bump(g.id) < 3 {
                yield_now();
            }
            // 第三次进来不声明挂起点，按运行结束处理
        });
        sched.start();

        for _ in 0..20 {
            sched.submit(make_glet(sched.next_glet_id()));
        }

        assert!(
            wait_until(|| sched.glet_count() == 0, Duration::from_secs(10)),
            "greenlets did not finish: {:?}",
            sched.stats()
        );
        for e in counter.steps.iter() {
            assert_eq!(*e.value(), 3);
        }
        sched.shutdown();
    }

    #[test]
    fn test_end_to_end_park_and_make_ready() {
        let sched = test_sched(2);
        let counter = StepCounter::new();
        let c = Arc::clone(&counter);
        sched.set_executor(move |g| {
            if c.bump(g.id) == 1 {
                park(None, "test-wait");
            }
        });
        sched.start();

        let g = make_glet(sched.next_glet_id());
        sched.submit(Arc::clone(&g));

        assert!(wait_until(|| g.is_waiting(), Duration::from_secs(5)));
        assert_eq!(g.wait_reason(), "test-wait");
        sched.make_ready(Arc::clone(&g));
        assert!(wait_until(|| sched.glet_count() == 0, Duration::from_secs(5)));
        sched.shutdown();
    }

    #[test]
    fn test_end_to_end_park_unlock_releases_lock() {
        let sched = test_sched(1);
        let lock: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let l = Arc::clone(&lock);
        let counter = StepCounter::new();
        let c = Arc::clone(&counter);
        sched.set_executor(move |g| {
            if c.bump(g.id) == 1 {
                let guard = l.lock();
                park_unlock(&l, guard, "unlock-test");
            }
        });
        sched.start();

        let g = make_glet(sched.next_glet_id());
        sched.submit(Arc::clone(&g));

        assert!(wait_until(|| g.is_waiting(), Duration::from_secs(5)));
        // 切换完成后锁必须已经放开
        assert!(wait_until(
            || lock.try_lock().is_some(),
            Duration::from_secs(5)
        ));
        sched.make_ready(Arc::clone(&g));
        assert!(wait_until(|| sched.glet_count() == 0, Duration::from_secs(5)));
        sched.shutdown();
    }

    struct OncePoller {
        pending: Mutex<Vec<Arc<Greenlet>>>,
    }

    impl NetPoller for OncePoller {
        fn poll(&self, _block_ns: i64) -> Vec<Arc<Greenlet>> {
            let mut pending = self.pending.lock();
            if !pending.is_empty() && pending.iter().all(|g| g.is_waiting()) {
                return pending.drain(..).collect();
            }
            Vec::new()
        }
    }

    #[test]
    fn test_end_to_end_netpoll_injection() {
        let sched = test_sched(2);
        let counter = StepCounter::new();
        let c = Arc::clone(&counter);
        sched.set_executor(move |g| {
            if c.bump(g.id) == 1 {
                park(None, "netpoll-wait");
            }
        });

        let g7 = make_glet(sched.next_glet_id());
        let g8 = make_glet(sched.next_glet_id());
        sched.set_net_poller(OncePoller {
            pending: Mutex::new(vec![Arc::clone(&g7), Arc::clone(&g8)]),
        });
        sched.start();

        sched.submit(Arc::clone(&g7));
        sched.submit(Arc::clone(&g8));

        assert!(
            wait_until(|| sched.glet_count() == 0, Duration::from_secs(10)),
            "netpoll greenlets did not finish: {:?}",
            sched.stats()
        );
        sched.shutdown();
    }

    #[test]
    fn test_end_to_end_syscall_round_trip() {
        let sched = test_sched(2);
        let counter = StepCounter::new();
        let c = Arc::clone(&counter);
        let done = Arc::new(TestCounter::new(0));
        let d = Arc::clone(&done);
        sched.set_executor(move |g| {
            if c.bump(g.id) == 1 {
                enter_syscall_block();
                if !exit_syscall() {
                    // G 已经进了全局队列，立即挂起
                    return;
                }
            }
            d.fetch_add(1, Ordering::Relaxed);
        });
        sched.start();

        let n = 8;
        for _ in 0..n {
            sched.submit(make_glet(sched.next_glet_id()));
        }

        assert!(
            wait_until(|| sched.glet_count() == 0, Duration::from_secs(10)),
            "syscall greenlets did not finish: {:?}",
            sched.stats()
        );
        assert_eq!(done.load(Ordering::Relaxed), n);
        sched.shutdown();
    }

    #[test]
    fn test_invariants_after_quiesce() {
        let sched = test_sched(2);
        let counter = StepCounter::new();
        let c = Arc::clone(&counter);
        sched.set_executor(move |g| {
            if c.bump(g.id) < 2 {
                yield_now();
            }
        });
        sched.start();

        for _ in 0..10 {
            sched.submit(make_glet(sched.next_glet_id()));
        }
        assert!(wait_until(|| sched.glet_count() == 0, Duration::from_secs(10)));

        // 静止之后：没有遗留的 G，自旋计数归零，空闲计数一致
        assert!(wait_until(
            || {
                let s = sched.stats();
                s.nr_spinning == 0
                    && s.global_queue_len == 0
                    && s.local_queue_lens.iter().all(|&l| l == 0)
                    && s.nr_idlep as usize == s.idle_processors
            },
            Duration::from_secs(5)
        ));
        sched.shutdown();
    }
}
