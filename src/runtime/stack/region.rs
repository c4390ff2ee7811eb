//! 栈区域
//!
//! 布局（低地址 → 高地址）：
//! `[硬保护页][故障保留区][未提交增长区][已提交区 ... 栈顶]`
//!
//! 栈从高地址向低地址增长。已提交区的下边界 `floor` 之下的未提交页
//! 不可访问，本身就是随增长下移的保护区。

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// 区域内部状态（地址固定，故障处理器通过裸指针读取）
#[derive(Debug)]
pub(crate) struct RegionInner {
    /// 区域起始地址（最低地址）
    pub(crate) base: usize,
    /// 区域总大小
    pub(crate) size: usize,
    /// 受保护的低端字节数（硬保护页 + 故障保留区）
    pub(crate) guard_size: usize,
    /// 页大小
    pub(crate) page: usize,
    /// 已提交区的下边界
    pub(crate) floor: AtomicUsize,
    /// 故障保留区是否已被打开
    pub(crate) overflowed: AtomicBool,
}

impl RegionInner {
    /// 栈顶（最高地址，不包含）
    #[inline]
    pub(crate) fn top(&self) -> usize {
        self.base + self.size
    }

    /// 硬保护页的结束地址
    #[inline]
    pub(crate) fn hard_guard_end(&self) -> usize {
        self.base + self.page
    }

    /// 可用区的起始地址（故障保留区之上）
    #[inline]
    pub(crate) fn usable_bottom(&self) -> usize {
        self.base + self.guard_size
    }
}

/// 任务调用栈所在的内存区域
///
/// 使用期间由唯一的任务独占，否则归栈池所有。
#[derive(Debug)]
pub struct StackRegion {
    inner: Box<RegionInner>,
}

impl StackRegion {
    pub(crate) fn new(base: usize, size: usize, guard_size: usize, page: usize, floor: usize) -> Self {
        Self {
            inner: Box::new(RegionInner {
                base,
                size,
                guard_size,
                page,
                floor: AtomicUsize::new(floor),
                overflowed: AtomicBool::new(false),
            }),
        }
    }

    /// 起始地址
    #[inline]
    pub fn base(&self) -> usize {
        self.inner.base
    }

    /// 总大小（页的整数倍）
    #[inline]
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// 受保护的低端字节数
    #[inline]
    pub fn guard_size(&self) -> usize {
        self.inner.guard_size
    }

    /// 栈顶地址
    #[inline]
    pub fn top(&self) -> usize {
        self.inner.top()
    }

    /// 可用于调用栈的最低地址
    #[inline]
    pub fn usable_bottom(&self) -> usize {
        self.inner.usable_bottom()
    }

    /// 已提交区的下边界
    #[inline]
    pub fn committed_floor(&self) -> usize {
        self.inner.floor.load(Ordering::Acquire)
    }

    /// 已提交的字节数
    #[inline]
    pub fn committed_bytes(&self) -> usize {
        self.top() - self.committed_floor()
    }

    /// 是否发生过栈溢出（故障保留区仍处于打开状态）
    #[inline]
    pub fn is_overflowed(&self) -> bool {
        self.inner.overflowed.load(Ordering::Acquire)
    }

    /// 地址是否落在区域内
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.top()
    }

    pub(crate) fn inner(&self) -> &RegionInner {
        &self.inner
    }

    pub(crate) fn set_floor(&self, floor: usize) {
        self.inner.floor.store(floor, Ordering::Release);
    }

    pub(crate) fn clear_overflow(&self) {
        self.inner.overflowed.store(false, Ordering::Release);
    }
}

// 区域只是一段地址的描述，所有权通过任务/栈池转移
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_layout() {
        let page = 4096;
        let region = StackRegion::new(0x10000, 16 * page, 3 * page, page, 0x10000 + 13 * page);
        assert_eq!(region.top(), 0x10000 + 16 * page);
        assert_eq!(region.usable_bottom(), 0x10000 + 3 * page);
        assert_eq!(region.inner().hard_guard_end(), 0x10000 + page);
        assert_eq!(region.committed_bytes(), 3 * page);
        assert!(region.contains(0x10000));
        assert!(!region.contains(region.top()));
        assert!(!region.is_overflowed());
    }
}
