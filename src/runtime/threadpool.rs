//! 阻塞型任务线程池
//!
//! 一组固定的 OS 线程，执行不适合在调度线程上跑的操作。典型的
//! 是域名解析：它不可取消，会把一个调度线程无限期堵死。提交任务
//! 的 G 先停车，worker 执行完毕后通过 make_ready 把它唤醒，错误
//! 通过 G 的 last-error 槽带回。

use std::net::{SocketAddr, ToSocketAddrs};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{debug, warn};
use parking_lot::Mutex;

use super::greenlet::Greenlet;
use super::scheduler::{park, Scheduler};
use super::tls;

/// 任务队列容量
const WORK_QUEUE_CAPACITY: usize = 1024;

/// 线程池已关闭时写入提交者 last-error 槽的错误码
pub const ERR_POOL_CLOSED: i32 = -1;

/// 域名解析失败的错误码
pub const ERR_HOST_NOT_FOUND: i32 = -2;

/// 可以下发给线程池的阻塞任务
pub trait GletWork: Send {
    /// 在 worker 线程上执行，允许阻塞
    fn run(&mut self);

    /// 执行过程中记录的错误码，0 表示没有错误。
    /// worker 在唤醒提交者之前把它拷进 G 的 last-error 槽。
    fn last_error(&self) -> i32 {
        0
    }
}

/// 排队的任务连同停车等待它的 G
pub(crate) struct WorkItem {
    pub(crate) work: Box<dyn GletWork>,
    pub(crate) gp: Arc<Greenlet>,
}

/// 阻塞型任务线程池
pub struct ThreadPool {
    sender: Mutex<Option<Sender<WorkItem>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    scheduler: AtomicPtr<Scheduler>,
}

impl ThreadPool {
    /// 创建线程池并启动全部 worker
    pub fn new(size: usize) -> Arc<Self> {
        let (sender, receiver) = bounded::<WorkItem>(WORK_QUEUE_CAPACITY);
        let receiver = Arc::new(Mutex::new(receiver));

        let pool = Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(Vec::new()),
            scheduler: AtomicPtr::new(ptr::null_mut()),
        });

        let mut workers = pool.workers.lock();
        for id in 0..size {
            let receiver = Arc::clone(&receiver);
            let pool_ref = Arc::clone(&pool);
            let handle = thread::Builder::new()
                .name(format!("glet-worker-{}", id))
                .spawn(move || {
                    pool_ref.worker_loop(id, receiver);
                })
                .expect("scheduler: failed to spawn threadpool worker");
            workers.push(handle);
        }
        drop(workers);

        pool
    }

    /// 关联调度器，resume 时通过它唤醒 G
    pub(crate) fn set_scheduler(&self, scheduler: *mut Scheduler) {
        self.scheduler.store(scheduler, Ordering::Release);
    }

    fn scheduler(&self) -> Option<&Scheduler> {
        let ptr = self.scheduler.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            unsafe { Some(&*ptr) }
        }
    }

    fn worker_loop(&self, id: usize, receiver: Arc<Mutex<Receiver<WorkItem>>>) {
        debug!("glet worker {} started", id);
        loop {
            let item = {
                let receiver = receiver.lock();
                receiver.recv()
            };
            match item {
                Ok(mut item) => {
                    item.work.run();
                    self.resume(item);
                }
                Err(_) => break,
            }
        }
        debug!("glet worker {} exited", id);
    }

    /// 完成回调：把任务的错误码写进 G 的 last-error 槽，然后
    /// 经全局队列唤醒它。worker 没有绑定 P，只能走 make_ready。
    fn resume(&self, item: WorkItem) {
        let err = item.work.last_error();
        if err != 0 {
            item.gp.save_last_error(err);
        }
        if let Some(sched) = self.scheduler() {
            sched.make_ready(item.gp);
        }
    }

    /// 失败路径：任务排不进队列时也必须唤醒提交者，
    /// 让它通过 last-error 观察到失败。
    fn finalize(&self, item: WorkItem) {
        warn!("glet work for greenlet {} dropped, pool is closed", item.gp.id);
        item.gp.save_last_error(ERR_POOL_CLOSED);
        if let Some(sched) = self.scheduler() {
            sched.make_ready(item.gp);
        }
    }

    /// 排队一个任务
    pub(crate) fn add_work(&self, item: WorkItem) {
        let sender = self.sender.lock().clone();
        match sender {
            Some(s) => {
                if let Err(e) = s.send(item) {
                    self.finalize(e.into_inner());
                }
            }
            None => self.finalize(item),
        }
    }

    /// 关闭：丢掉发送端，worker 排干剩余任务后退出
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for h in handles {
            let _ = h.join();
        }
    }
}

/// 把阻塞任务下发到线程池，当前 G 停车直到任务完成。
/// 任务在 G 完成停车之后才入队，resume 不会跑在停车前面。
pub fn submit_glet_work(work: Box<dyn GletWork>) {
    let m = tls::get_m().expect("scheduler: offload outside a scheduler thread");
    let gp = tls::get_g().expect("scheduler: offload without a current greenlet");
    let sched = m
        .scheduler()
        .expect("scheduler: machine without a scheduler");
    let pool = sched
        .threadpool()
        .expect("scheduler: threadpool not started");

    park(
        Some(Box::new(move || {
            pool.add_work(WorkItem { work, gp });
            true
        })),
        "glet-work",
    );
}

/// 域名解析专用入口。解析不可取消，必须离开调度线程执行。
pub fn submit_getaddrinfo_glet_work(work: Box<dyn GletWork>) {
    submit_glet_work(work);
}

/// 域名解析任务
///
/// 结果通过共享句柄带回；解析失败通过 last-error 槽报告。
pub struct GetAddrInfoWork {
    host: String,
    port: u16,
    result: Arc<Mutex<Vec<SocketAddr>>>,
    last_error: i32,
}

impl GetAddrInfoWork {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            result: Arc::new(Mutex::new(Vec::new())),
            last_error: 0,
        }
    }

    /// 解析结果的共享句柄，提交前先拿住
    pub fn result_handle(&self) -> Arc<Mutex<Vec<SocketAddr>>> {
        Arc::clone(&self.result)
    }
}

impl GletWork for GetAddrInfoWork {
    fn run(&mut self) {
        match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => {
                *self.result.lock() = addrs.collect();
            }
            Err(_) => {
                self.last_error = ERR_HOST_NOT_FOUND;
            }
        }
    }

    fn last_error(&self) -> i32 {
        self.last_error
    }
}
