//! 线程本地存储
//!
//! 每个 OS 线程有一个当前 G 槽和当前 M 槽，在每次派发时交换。

use std::cell::RefCell;
use std::sync::Arc;

use super::greenlet::Greenlet;
use super::machine::Machine;

thread_local! {
    static CURRENT_G: RefCell<Option<Arc<Greenlet>>> = RefCell::new(None);
    static CURRENT_M: RefCell<Option<Arc<Machine>>> = RefCell::new(None);
}

/// 获取当前线程正在运行的 G，None 表示在 g0 上
pub fn get_g() -> Option<Arc<Greenlet>> {
    CURRENT_G.with(|g| g.borrow().clone())
}

/// 设置当前线程的 G 槽
pub fn set_g(gp: Option<Arc<Greenlet>>) {
    CURRENT_G.with(|g| *g.borrow_mut() = gp);
}

/// 获取当前线程的 M
pub fn get_m() -> Option<Arc<Machine>> {
    CURRENT_M.with(|m| m.borrow().clone())
}

/// 设置当前线程的 M 槽，调度线程启动时调用
pub fn set_m(machine: Option<Arc<Machine>>) {
    CURRENT_M.with(|m| *m.borrow_mut() = machine);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_g_slot() {
        assert!(get_g().is_none());
        let g = Arc::new(Greenlet::new(1));
        set_g(Some(Arc::clone(&g)));
        assert_eq!(get_g().unwrap().id, 1);
        set_g(None);
        assert!(get_g().is_none());
    }
}
