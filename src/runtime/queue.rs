//! 本地运行队列
//!
//! P 的本地可运行集合：256 槽的无锁环形缓冲区加一个 run-next 槽。
//! 生产端只有拥有者 M（写 tail，release 发布）；消费端是拥有者和
//! 窃取者（对 head 做 CAS）。槽位保存 `Arc::into_raw` 得到的整数，
//! 所有权随 CAS 在队列之间转移。

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use super::greenlet::Greenlet;

/// 本地队列容量（必须是 2 的幂）
pub const RUNQ_CAPACITY: usize = 256;

const MASK: usize = RUNQ_CAPACITY - 1;

#[inline]
fn encode(g: Arc<Greenlet>) -> usize {
    Arc::into_raw(g) as usize
}

#[inline]
unsafe fn decode(v: usize) -> Arc<Greenlet> {
    Arc::from_raw(v as *const Greenlet)
}

/// 本地运行队列
///
/// head 和 tail 是 32 位回绕计数器，槽下标取 `counter mod 256`。
/// 空当且仅当 head == tail。run-next 槽是一个单槽信箱：生产者
/// 覆盖写，消费者用 CAS 认领，拥有者和窃取者之间的竞争也由
/// CAS 裁决。
pub struct LocalQueue {
    /// 消费端计数器（拥有者出队和窃取者都对它 CAS）
    head: CachePadded<AtomicU32>,
    /// 生产端计数器（仅拥有者写，release 发布）
    tail: CachePadded<AtomicU32>,
    /// run-next 槽（0 表示空）
    next: CachePadded<AtomicUsize>,
    /// 环形缓冲区
    buffer: Box<[AtomicUsize; RUNQ_CAPACITY]>,
}

impl LocalQueue {
    /// 创建新的本地队列
    pub fn new() -> Self {
        let buffer: Box<[AtomicUsize; RUNQ_CAPACITY]> = {
            let mut vec = Vec::with_capacity(RUNQ_CAPACITY);
            for _ in 0..RUNQ_CAPACITY {
                vec.push(AtomicUsize::new(0));
            }
            vec.into_boxed_slice().try_into().unwrap()
        };

        Self {
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
            next: CachePadded::new(AtomicUsize::new(0)),
            buffer,
        }
    }

    /// 获取环内元素个数（不含 run-next，允许近似）
    #[inline]
    pub fn len(&self) -> usize {
        let h = self.head.load(Ordering::Acquire);
        let t = self.tail.load(Ordering::Acquire);
        t.wrapping_sub(h) as usize
    }

    /// run-next 槽是否有值
    #[inline]
    pub fn has_next(&self) -> bool {
        self.next.load(Ordering::Acquire) != 0
    }

    /// 环和 run-next 是否都为空（允许有竞争，只作提示使用）
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0 && !self.has_next()
    }

    /// 入队（仅拥有者调用）
    ///
    /// `next == true` 时 gp 占据 run-next 槽，被挤出的旧值转入环。
    /// 环满时把一半的元素连同 gp 一起搬去全局队列：返回
    /// `Some(batch)` 表示溢出，调用方必须把 batch 放进全局队列。
    pub fn push(&self, gp: Arc<Greenlet>, next: bool) -> Option<Vec<Arc<Greenlet>>> {
        let mut gp = gp;
        if next {
            let old = self.next.swap(encode(gp), Ordering::AcqRel);
            if old == 0 {
                return None;
            }
            // 被挤出的旧 run-next 走普通入环路径
            gp = unsafe { decode(old) };
        }
        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Relaxed);
            if t.wrapping_sub(h) < RUNQ_CAPACITY as u32 {
                self.buffer[t as usize & MASK].store(encode(gp), Ordering::Relaxed);
                // release 发布，使窃取者能看到槽位内容
                self.tail.store(t.wrapping_add(1), Ordering::Release);
                return None;
            }
            match self.push_slow(gp, h, t) {
                Ok(batch) => return Some(batch),
                Err(back) => gp = back,
            }
        }
    }

    /// 环满时的慢路径：搬走一半加上新来的 gp
    ///
    /// head 的 CAS 失败说明和窃取者撞上了，交还 gp 由上层重试。
    fn push_slow(
        &self,
        gp: Arc<Greenlet>,
        h: u32,
        t: u32,
    ) -> Result<Vec<Arc<Greenlet>>, Arc<Greenlet>> {
        let n = t.wrapping_sub(h) / 2;
        if n as usize != RUNQ_CAPACITY / 2 {
            // 和满判断不一致，重试
            return Err(gp);
        }
        let mut raw = Vec::with_capacity(n as usize + 1);
        for i in 0..n {
            raw.push(self.buffer[h.wrapping_add(i) as usize & MASK].load(Ordering::Relaxed));
        }
        if self
            .head
            .compare_exchange(h, h.wrapping_add(n), Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return Err(gp);
        }
        let mut batch: Vec<Arc<Greenlet>> = raw.into_iter().map(|v| unsafe { decode(v) }).collect();
        batch.push(gp);
        Ok(batch)
    }

    /// 出队（仅拥有者调用）
    ///
    /// run-next 优先，并带上 `inherit_time == true`：继承当前时间片，
    /// 防止链式 next 插入饿死环里的其他 G。
    pub fn pop(&self) -> Option<(Arc<Greenlet>, bool)> {
        loop {
            let v = self.next.load(Ordering::Acquire);
            if v == 0 {
                break;
            }
            if self
                .next
                .compare_exchange(v, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some((unsafe { decode(v) }, true));
            }
        }
        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Relaxed);
            if h == t {
                return None;
            }
            let v = self.buffer[h as usize & MASK].load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange(h, h.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some((unsafe { decode(v) }, false));
            }
        }
    }

    /// 从 victim 抓取最多一半（向上取整）到本队列，返回一个
    /// 立即执行的 G（最后抓到的那个）。本队列必须属于调用者。
    ///
    /// `steal_nextg` 为 true 且 victim 环为空时，短暂退避后再偷
    /// 它的 run-next 槽。
    pub fn steal_from(&self, victim: &LocalQueue, steal_nextg: bool) -> Option<Arc<Greenlet>> {
        let t = self.tail.load(Ordering::Relaxed);
        let n = victim.grab_into(self, t, steal_nextg);
        if n == 0 {
            return None;
        }
        let n = n - 1;
        let v = self.buffer[t.wrapping_add(n) as usize & MASK].load(Ordering::Relaxed);
        let gp = unsafe { decode(v) };
        if n == 0 {
            return Some(gp);
        }
        let h = self.head.load(Ordering::Acquire);
        debug_assert!(t.wrapping_sub(h) + n < RUNQ_CAPACITY as u32);
        self.tail.store(t.wrapping_add(n), Ordering::Release);
        Some(gp)
    }

    /// 把最多一半的元素原样复制进 dst 的缓冲区（dst_tail 起），
    /// 然后 CAS 推进本队列的 head。CAS 失败则整体重抓。
    fn grab_into(&self, dst: &LocalQueue, dst_tail: u32, steal_nextg: bool) -> u32 {
        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Acquire);
            let mut n = t.wrapping_sub(h);
            n -= n / 2;
            if n == 0 {
                if steal_nextg {
                    let v = self.next.load(Ordering::Acquire);
                    if v != 0 {
                        // 退避一下，给拥有者认领 run-next 的机会
                        std::thread::yield_now();
                        if self
                            .next
                            .compare_exchange(v, 0, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                        {
                            continue;
                        }
                        dst.buffer[dst_tail as usize & MASK].store(v, Ordering::Relaxed);
                        return 1;
                    }
                }
                return 0;
            }
            if n > (RUNQ_CAPACITY / 2) as u32 {
                // head 和 tail 读取不一致，重试
                continue;
            }
            for i in 0..n {
                let v = self.buffer[h.wrapping_add(i) as usize & MASK].load(Ordering::Relaxed);
                dst.buffer[dst_tail.wrapping_add(i) as usize & MASK].store(v, Ordering::Relaxed);
            }
            if self
                .head
                .compare_exchange(h, h.wrapping_add(n), Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return n;
            }
        }
    }

    /// 排空环和 run-next（退役 P 时使用）
    pub fn drain(&self) -> Vec<Arc<Greenlet>> {
        let mut out = Vec::new();
        while let Some((g, _)) = self.pop() {
            out.push(g);
        }
        out
    }
}

impl Default for LocalQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        // 清理残留的 G，Arc 引用在这里归还
        while let Some(_) = self.pop() {}
    }
}
