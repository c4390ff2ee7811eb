//! 任务栈管理
//!
//! 为每个任务保留独立的调用栈：只提交栈顶 3 页，其余部分由缺页故障
//! （或显式的 `prepare`）按需提交；低端是保护页和故障保留区。
//! 释放的栈进入有上限的栈池复用。

mod backend;
#[cfg(unix)]
mod fault;
mod region;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

pub use backend::{default_backend, StackBackend};
#[cfg(unix)]
pub use backend::UnixBackend;
#[cfg(not(unix))]
pub use backend::HeapBackend;
pub use region::StackRegion;

use crate::config::{
    COMMIT_FLOOR_PAGES, DEFAULT_FAULT_STACK_SIZE, DEFAULT_STACK_POOL_SIZE, DEFAULT_STACK_SIZE,
    DEFAULT_UNWIND_HEADROOM, STACK_FILL_BYTE,
};
use crate::error::TaskError;

/// 栈池上限哨兵：永不入池
pub const NEVER_POOL: usize = usize::MAX;

/// 栈分配器配置
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// 默认任务栈大小
    pub default_stack_size: usize,
    /// 保留的故障处理栈大小
    pub reserved_fault_stack_size: usize,
    /// 为异常展开预留的空间
    pub unwind_headroom: usize,
    /// 入池时是否用填充字节冲刷栈内存
    pub flush_on_reuse: bool,
    /// 栈池最多缓存的区域数（0 = 不限，`NEVER_POOL` = 永不入池）
    pub max_buffer_size: usize,
    /// 是否按需提交（为 false 时一次性提交整个可用区）
    pub lazy_commit: bool,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            default_stack_size: DEFAULT_STACK_SIZE,
            reserved_fault_stack_size: DEFAULT_FAULT_STACK_SIZE,
            unwind_headroom: DEFAULT_UNWIND_HEADROOM,
            flush_on_reuse: false,
            max_buffer_size: DEFAULT_STACK_POOL_SIZE,
            lazy_commit: true,
        }
    }
}

/// 栈分配统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackStats {
    /// 当前借出的栈数量
    pub outstanding: usize,
    /// 栈池中的栈数量
    pub pooled: usize,
    /// 新分配的总次数
    pub fresh: u64,
    /// 从栈池复用的总次数
    pub reused: u64,
}

/// 栈分配器
pub struct StackAllocator {
    backend: Box<dyn StackBackend>,
    default_stack_size: AtomicUsize,
    fault_stack_size: AtomicUsize,
    unwind_headroom: usize,
    flush_on_reuse: AtomicBool,
    max_buffer_size: AtomicUsize,
    /// 按需提交是否可用（需要故障处理器）
    lazy_commit: bool,
    pool: Mutex<Vec<StackRegion>>,
    outstanding: AtomicUsize,
    fresh: AtomicU64,
    reused: AtomicU64,
}

impl StackAllocator {
    /// 使用平台默认后端创建
    pub fn new(config: &StackConfig) -> Self {
        Self::with_backend(config, default_backend())
    }

    /// 使用指定后端创建
    pub fn with_backend(config: &StackConfig, backend: Box<dyn StackBackend>) -> Self {
        let lazy_commit = config.lazy_commit && backend.supports_protection() && install_fault_handler();
        Self {
            backend,
            default_stack_size: AtomicUsize::new(config.default_stack_size),
            fault_stack_size: AtomicUsize::new(config.reserved_fault_stack_size),
            unwind_headroom: config.unwind_headroom,
            flush_on_reuse: AtomicBool::new(config.flush_on_reuse),
            max_buffer_size: AtomicUsize::new(config.max_buffer_size),
            lazy_commit,
            pool: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            fresh: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// 页大小
    #[inline]
    pub fn page_size(&self) -> usize {
        self.backend.page_size()
    }

    /// 是否启用了按需提交
    #[inline]
    pub fn is_lazy(&self) -> bool {
        self.lazy_commit
    }

    /// 默认任务栈大小
    pub fn default_stack_size(&self) -> usize {
        self.default_stack_size.load(Ordering::Relaxed)
    }

    pub fn set_default_stack_size(&self, size: usize) {
        self.default_stack_size.store(size, Ordering::Relaxed);
    }

    /// 保留的故障处理栈大小
    pub fn reserved_fault_stack_size(&self) -> usize {
        self.fault_stack_size.load(Ordering::Relaxed)
    }

    pub fn set_reserved_fault_stack_size(&self, size: usize) {
        self.fault_stack_size.store(size, Ordering::Relaxed);
    }

    /// 入池时是否冲刷
    pub fn flush_on_reuse(&self) -> bool {
        self.flush_on_reuse.load(Ordering::Relaxed)
    }

    pub fn set_flush_on_reuse(&self, flush: bool) {
        self.flush_on_reuse.store(flush, Ordering::Relaxed);
    }

    /// 栈池上限
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size.load(Ordering::Relaxed)
    }

    /// 设置栈池上限，超出的部分立即释放
    pub fn set_max_buffer_size(&self, max: usize) {
        self.max_buffer_size.store(max, Ordering::Relaxed);
        let evicted: Vec<StackRegion> = {
            let mut pool = self.pool.lock();
            match max {
                NEVER_POOL => pool.drain(..).collect(),
                0 => Vec::new(),
                max if pool.len() > max => pool.drain(max..).collect(),
                _ => Vec::new(),
            }
        };
        for region in evicted {
            self.release(region);
        }
    }

    fn round_up(&self, bytes: usize) -> usize {
        let page = self.page_size();
        bytes.div_ceil(page) * page
    }

    /// 分配一个栈区域
    ///
    /// 可用区为 `requested_size` 向上取整到页再加上展开预留；低端是 1 页硬保护页
    /// 和故障保留区。按需提交时只提交栈顶 3 页。
    pub fn allocate(&self, requested_size: usize) -> Result<StackRegion, TaskError> {
        let page = self.page_size();
        let usable = self.round_up(requested_size.max(page * COMMIT_FLOOR_PAGES))
            + self.round_up(self.unwind_headroom);
        let guard = page + self.round_up(self.reserved_fault_stack_size());
        let total = usable
            .checked_add(guard)
            .ok_or_else(|| TaskError::Allocation(format!("stack of {} bytes", requested_size)))?;

        if let Some(region) = self.take_pooled(total, guard) {
            self.reused.fetch_add(1, Ordering::Relaxed);
            self.outstanding.fetch_add(1, Ordering::Relaxed);
            return Ok(region);
        }

        let base = unsafe { self.backend.reserve(total)? };
        let top = base + total;
        let commit_len = if self.lazy_commit { page * COMMIT_FLOOR_PAGES } else { usable };
        if let Err(e) = unsafe { self.backend.commit(top - commit_len, commit_len) } {
            unsafe { self.backend.release(base, total) };
            return Err(e);
        }

        self.fresh.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(base = format_args!("{:#x}", base), size = total, "stack reserved");
        Ok(StackRegion::new(base, total, guard, page, top - commit_len))
    }

    fn take_pooled(&self, size: usize, guard: usize) -> Option<StackRegion> {
        let mut pool = self.pool.lock();
        let idx = pool
            .iter()
            .rposition(|r| r.size() == size && r.guard_size() == guard)?;
        Some(pool.swap_remove(idx))
    }

    /// 归还栈区域：入池或立即释放
    pub fn deallocate(&self, region: StackRegion) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        if region.is_overflowed() {
            self.rearm(&region);
        }

        let max = self.max_buffer_size();
        if max != NEVER_POOL {
            let mut pool = self.pool.lock();
            if max == 0 || pool.len() < max {
                if self.flush_on_reuse() {
                    let floor = region.committed_floor();
                    unsafe {
                        std::ptr::write_bytes(floor as *mut u8, STACK_FILL_BYTE, region.top() - floor);
                    }
                }
                pool.push(region);
                return;
            }
        }
        self.release(region);
    }

    fn release(&self, region: StackRegion) {
        tracing::trace!(base = format_args!("{:#x}", region.base()), "stack released");
        unsafe { self.backend.release(region.base(), region.size()) };
    }

    /// 重新布置故障保留区的保护
    ///
    /// 失败意味着之后的溢出无法被检测，只能终止进程。
    pub(crate) fn rearm(&self, region: &StackRegion) {
        let start = region.inner().hard_guard_end();
        let len = region.usable_bottom() - start;
        if let Err(e) = unsafe { self.backend.protect_guard(start, len) } {
            tracing::error!(error = %e, "failed to re-arm stack guard");
            std::process::abort();
        }
        region.set_floor(region.committed_floor().max(region.usable_bottom()));
        region.clear_overflow();
    }

    /// 预先提交当前栈指针以下 `bytes` 字节
    pub fn prepare(&self, region: &StackRegion, sp: usize, bytes: usize) -> Result<(), TaskError> {
        let page = self.page_size();
        let target = (sp.saturating_sub(bytes) & !(page - 1)).max(region.usable_bottom());
        let floor = region.committed_floor();
        if target < floor {
            unsafe { self.backend.commit(target, floor - target)? };
            region.set_floor(target);
        }
        Ok(())
    }

    /// 取消提交当前栈指针以下超出 `threshold` 字节的页，返回是否释放了内存
    pub fn shrink(&self, region: &StackRegion, sp: usize, threshold: usize) -> bool {
        if !self.lazy_commit || region.is_overflowed() {
            return false;
        }
        let page = self.page_size();
        let keep_from = sp.saturating_sub(threshold) & !(page - 1);
        let floor = region.committed_floor();
        let limit = region.top() - page * COMMIT_FLOOR_PAGES;
        if keep_from <= floor || keep_from > limit {
            return false;
        }
        match unsafe { self.backend.decommit(floor, keep_from - floor) } {
            Ok(()) => {
                region.set_floor(keep_from);
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "stack shrink failed");
                false
            }
        }
    }

    /// 清空栈池
    pub fn clear_pool(&self) -> usize {
        let drained: Vec<StackRegion> = self.pool.lock().drain(..).collect();
        let count = drained.len();
        for region in drained {
            self.release(region);
        }
        count
    }

    /// 统计信息
    pub fn stats(&self) -> StackStats {
        StackStats {
            outstanding: self.outstanding.load(Ordering::Relaxed),
            pooled: self.pool.lock().len(),
            fresh: self.fresh.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}

impl Drop for StackAllocator {
    fn drop(&mut self) {
        self.clear_pool();
    }
}

impl std::fmt::Debug for StackAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackAllocator")
            .field("lazy_commit", &self.lazy_commit)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(unix)]
fn install_fault_handler() -> bool {
    fault::install()
}

#[cfg(not(unix))]
fn install_fault_handler() -> bool {
    false
}

/// 在即将切入任务栈的线程上准备故障处理环境，返回之前发布的栈
#[cfg(unix)]
pub(crate) fn enter_region(region: &StackRegion) -> ActiveRegion {
    fault::ensure_alt_stack();
    ActiveRegion(fault::set_active(Some(region)))
}

#[cfg(not(unix))]
pub(crate) fn enter_region(_region: &StackRegion) -> ActiveRegion {
    ActiveRegion(())
}

/// 离开任务栈时恢复之前发布的栈
#[cfg(unix)]
pub(crate) struct ActiveRegion(*const region::RegionInner);

#[cfg(not(unix))]
pub(crate) struct ActiveRegion(());

impl Drop for ActiveRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        fault::restore_active(self.0);
    }
}

/// 近似的当前栈指针
#[inline(never)]
pub(crate) fn approximate_sp() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}
