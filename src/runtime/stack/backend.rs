//! 平台内存后端
//!
//! 栈分配器只通过 `StackBackend` 操作内存：保留地址空间、提交、取消提交、
//! 设置保护页、释放。每个目标平台一个实现。

use crate::error::TaskError;

/// 栈内存后端
pub trait StackBackend: Send + Sync {
    /// 平台页大小
    fn page_size(&self) -> usize;

    /// 是否支持访问保护（保护页与按需提交依赖它）
    fn supports_protection(&self) -> bool;

    /// 保留 `size` 字节的不可访问地址空间，返回起始地址
    ///
    /// # Safety
    /// `size` 必须是页大小的整数倍。
    unsafe fn reserve(&self, size: usize) -> Result<usize, TaskError>;

    /// 提交（变为可读写）
    ///
    /// # Safety
    /// 范围必须位于 `reserve` 返回的区域内并按页对齐。
    unsafe fn commit(&self, addr: usize, len: usize) -> Result<(), TaskError>;

    /// 取消提交：归还物理页并恢复为不可访问
    ///
    /// # Safety
    /// 范围内不能有正在使用的栈帧。
    unsafe fn decommit(&self, addr: usize, len: usize) -> Result<(), TaskError>;

    /// 把范围设置为保护页
    ///
    /// # Safety
    /// 范围内不能有正在使用的栈帧。
    unsafe fn protect_guard(&self, addr: usize, len: usize) -> Result<(), TaskError>;

    /// 释放整个区域
    ///
    /// # Safety
    /// 区域不能再被任何任务使用。
    unsafe fn release(&self, addr: usize, size: usize);
}

fn os_error(op: &str) -> TaskError {
    TaskError::Allocation(format!("{}: {}", op, std::io::Error::last_os_error()))
}

/// 基于 mmap/mprotect 的 Unix 后端
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct UnixBackend;

#[cfg(unix)]
impl UnixBackend {
    /// 查询系统页大小
    pub fn system_page_size() -> usize {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static PAGE: AtomicUsize = AtomicUsize::new(0);

        let cached = PAGE.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let size = if size > 0 { size as usize } else { 4096 };
        PAGE.store(size, Ordering::Relaxed);
        size
    }
}

#[cfg(unix)]
impl StackBackend for UnixBackend {
    fn page_size(&self) -> usize {
        Self::system_page_size()
    }

    fn supports_protection(&self) -> bool {
        true
    }

    unsafe fn reserve(&self, size: usize) -> Result<usize, TaskError> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON;

        let ptr = libc::mmap(std::ptr::null_mut(), size, libc::PROT_NONE, flags, -1, 0);
        if ptr == libc::MAP_FAILED {
            return Err(os_error("mmap"));
        }
        Ok(ptr as usize)
    }

    unsafe fn commit(&self, addr: usize, len: usize) -> Result<(), TaskError> {
        if len == 0 {
            return Ok(());
        }
        if libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_WRITE) != 0 {
            return Err(os_error("mprotect"));
        }
        Ok(())
    }

    unsafe fn decommit(&self, addr: usize, len: usize) -> Result<(), TaskError> {
        if len == 0 {
            return Ok(());
        }
        libc::madvise(addr as *mut libc::c_void, len, libc::MADV_DONTNEED);
        self.protect_guard(addr, len)
    }

    unsafe fn protect_guard(&self, addr: usize, len: usize) -> Result<(), TaskError> {
        if len == 0 {
            return Ok(());
        }
        if libc::mprotect(addr as *mut libc::c_void, len, libc::PROT_NONE) != 0 {
            return Err(os_error("mprotect"));
        }
        Ok(())
    }

    unsafe fn release(&self, addr: usize, size: usize) {
        libc::munmap(addr as *mut libc::c_void, size);
    }
}

/// 无保护能力平台上的堆后端：一次性提交，没有保护页
#[cfg(not(unix))]
#[derive(Debug, Default)]
pub struct HeapBackend;

#[cfg(not(unix))]
impl HeapBackend {
    const PAGE: usize = 4096;

    fn layout(size: usize) -> Result<std::alloc::Layout, TaskError> {
        std::alloc::Layout::from_size_align(size, Self::PAGE)
            .map_err(|e| TaskError::Allocation(e.to_string()))
    }
}

#[cfg(not(unix))]
impl StackBackend for HeapBackend {
    fn page_size(&self) -> usize {
        Self::PAGE
    }

    fn supports_protection(&self) -> bool {
        false
    }

    unsafe fn reserve(&self, size: usize) -> Result<usize, TaskError> {
        let ptr = std::alloc::alloc(Self::layout(size)?);
        if ptr.is_null() {
            return Err(TaskError::Allocation(format!("heap stack of {} bytes", size)));
        }
        Ok(ptr as usize)
    }

    unsafe fn commit(&self, _addr: usize, _len: usize) -> Result<(), TaskError> {
        Ok(())
    }

    unsafe fn decommit(&self, _addr: usize, _len: usize) -> Result<(), TaskError> {
        Ok(())
    }

    unsafe fn protect_guard(&self, _addr: usize, _len: usize) -> Result<(), TaskError> {
        Ok(())
    }

    unsafe fn release(&self, addr: usize, size: usize) {
        if let Ok(layout) = Self::layout(size) {
            std::alloc::dealloc(addr as *mut u8, layout);
        }
    }
}

/// 当前平台的默认后端
pub fn default_backend() -> Box<dyn StackBackend> {
    #[cfg(unix)]
    {
        Box::new(UnixBackend)
    }
    #[cfg(not(unix))]
    {
        Box::new(HeapBackend)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_commit_release() {
        let backend = UnixBackend;
        let page = backend.page_size();
        assert!(page.is_power_of_two());

        unsafe {
            let base = backend.reserve(4 * page).unwrap();
            backend.commit(base + 2 * page, 2 * page).unwrap();
            let ptr = (base + 3 * page) as *mut u8;
            ptr.write(7);
            assert_eq!(ptr.read(), 7);
            backend.decommit(base + 2 * page, page).unwrap();
            backend.release(base, 4 * page);
        }
    }
}
