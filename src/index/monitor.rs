use parking_lot::{Condvar, Mutex};

/// 读写监视器：`status > 0` 为活跃读者数，`-1` 为写者持有，`0` 为空闲。
///
/// 与 `RwLock` 不同，它允许“恰好一个读者时就地升级为写者”（查询路径上的顺带 compaction），
/// 并且 enter/exit 可以不成对地出现在不同调用里（查询会话跨越多次查询持有读权限）。
/// 不保证公平：读者不会因为有写者排队而等待。
#[derive(Debug, Default)]
pub struct ReadWriteMonitor {
    status: Mutex<i32>,
    cond: Condvar,
}

impl ReadWriteMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter_read(&self) {
        let mut status = self.status.lock();
        while *status < 0 {
            self.cond.wait(&mut status);
        }
        *status += 1;
    }

    /// # Panics
    /// 没有对应的 `enter_read` 时 panic。
    pub fn exit_read(&self) {
        let mut status = self.status.lock();
        assert!(
            *status > 0,
            "exit_read without matching enter_read (status={})",
            *status
        );
        *status -= 1;
        if *status == 0 {
            self.cond.notify_all();
        }
    }

    pub fn enter_write(&self) {
        let mut status = self.status.lock();
        while *status != 0 {
            self.cond.wait(&mut status);
        }
        *status = -1;
    }

    pub fn exit_write(&self) {
        let mut status = self.status.lock();
        assert!(
            *status == -1,
            "exit_write without matching enter_write (status={})",
            *status
        );
        *status = 0;
        self.cond.notify_all();
    }

    /// 调用方是唯一读者时原子地升级为写者；否则什么都不做并返回 false。
    pub fn try_exit_read_enter_write(&self) -> bool {
        let mut status = self.status.lock();
        if *status == 1 {
            *status = -1;
            true
        } else {
            false
        }
    }

    /// 写者降级为读者；等待中的其他读者随之放行。
    pub fn exit_write_enter_read(&self) {
        let mut status = self.status.lock();
        *status = 1;
        self.cond.notify_all();
    }

    pub fn status(&self) -> i32 {
        *self.status.lock()
    }

    pub fn shared(&self) -> SharedAccess<'_> {
        self.enter_read();
        SharedAccess { monitor: self }
    }

    pub fn exclusive(&self) -> ExclusiveAccess<'_> {
        self.enter_write();
        ExclusiveAccess { monitor: self }
    }
}

/// 读权限守卫，drop 时 `exit_read`。
pub struct SharedAccess<'a> {
    monitor: &'a ReadWriteMonitor,
}

impl<'a> SharedAccess<'a> {
    /// 尝试升级；失败时原样交还读权限。
    pub fn try_upgrade(self) -> std::result::Result<ExclusiveAccess<'a>, SharedAccess<'a>> {
        if self.monitor.try_exit_read_enter_write() {
            let monitor = self.monitor;
            std::mem::forget(self);
            Ok(ExclusiveAccess { monitor })
        } else {
            Err(self)
        }
    }
}

impl Drop for SharedAccess<'_> {
    fn drop(&mut self) {
        self.monitor.exit_read();
    }
}

/// 写权限守卫，drop 时 `exit_write`。
pub struct ExclusiveAccess<'a> {
    monitor: &'a ReadWriteMonitor,
}

impl<'a> ExclusiveAccess<'a> {
    pub fn downgrade(self) -> SharedAccess<'a> {
        let monitor = self.monitor;
        std::mem::forget(self);
        monitor.exit_write_enter_read();
        SharedAccess { monitor }
    }
}

impl Drop for ExclusiveAccess<'_> {
    fn drop(&mut self) {
        self.monitor.exit_write();
    }
}
