//! 栈故障处理（Unix）
//!
//! 把访问未提交页产生的 SIGSEGV/SIGBUS 翻译为：
//! - 增长区故障：提交到故障页为止，恢复执行；
//! - 故障保留区故障：打开保留区作为应急空间并标记溢出，恢复执行，
//!   由下一个挂起点向任务抛出 `StackOverflow`；
//! - 硬保护页故障：放弃任务剩余的栈帧，把故障上下文重定向到栈顶的着陆例程，
//!   由它以 `StackOverflow` 结束任务。被放弃的栈帧持有的值不会被析构。
//!   不支持改写信号上下文的平台上终止进程。
//!
//! 处理器运行在备用信号栈上，只做 mprotect、原子写和寄存器改写。

use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Once, OnceLock};

use super::region::{RegionInner, StackRegion};
use crate::config::ALT_SIGNAL_STACK_SIZE;
use crate::runtime::task::overflow_landing;

/// 着陆例程在栈顶之下留出的空隙
const LANDING_GAP: usize = 256;

static INSTALL: Once = Once::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);
static PREV_SEGV: OnceLock<libc::sigaction> = OnceLock::new();
static PREV_BUS: OnceLock<libc::sigaction> = OnceLock::new();

thread_local! {
    /// 当前线程上正在运行的任务栈
    static ACTIVE_REGION: Cell<*const RegionInner> = const { Cell::new(ptr::null()) };
    /// 本线程自己分配的备用信号栈
    static ALT_STACK: RefCell<Option<AltStack>> = const { RefCell::new(None) };
    static ALT_READY: Cell<bool> = const { Cell::new(false) };
}

/// 故障地址的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FaultKind {
    /// 不属于当前任务栈
    Foreign,
    /// 增长区
    Growth,
    /// 故障保留区
    Reserve,
    /// 硬保护页
    HardGuard,
}

pub(crate) fn classify(region: &RegionInner, addr: usize) -> FaultKind {
    if addr < region.base || addr >= region.top() {
        FaultKind::Foreign
    } else if addr < region.hard_guard_end() {
        FaultKind::HardGuard
    } else if addr < region.usable_bottom() {
        FaultKind::Reserve
    } else if addr < region.floor.load(Ordering::Acquire) {
        FaultKind::Growth
    } else {
        FaultKind::Foreign
    }
}

/// 安装故障处理器（进程内只安装一次），返回是否可用
pub(crate) fn install() -> bool {
    INSTALL.call_once(|| unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handle_fault as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut action.sa_mask);

        let mut prev: libc::sigaction = mem::zeroed();
        if libc::sigaction(libc::SIGSEGV, &action, &mut prev) != 0 {
            return;
        }
        let _ = PREV_SEGV.set(prev);

        let mut prev_bus: libc::sigaction = mem::zeroed();
        if libc::sigaction(libc::SIGBUS, &action, &mut prev_bus) == 0 {
            let _ = PREV_BUS.set(prev_bus);
        }
        INSTALLED.store(true, Ordering::Release);
    });
    INSTALLED.load(Ordering::Acquire)
}

/// 发布当前线程正在运行的任务栈，返回之前的值
pub(crate) fn set_active(region: Option<&StackRegion>) -> *const RegionInner {
    let ptr = region.map_or(ptr::null(), |r| r.inner() as *const RegionInner);
    ACTIVE_REGION.with(|cell| cell.replace(ptr))
}

/// 恢复之前发布的任务栈
pub(crate) fn restore_active(prev: *const RegionInner) {
    ACTIVE_REGION.with(|cell| cell.set(prev));
}

/// 确保当前线程有备用信号栈
pub(crate) fn ensure_alt_stack() {
    if ALT_READY.with(Cell::get) {
        return;
    }
    ALT_READY.with(|ready| ready.set(true));

    unsafe {
        let mut current: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut current) == 0 && current.ss_flags & libc::SS_DISABLE == 0 {
            // 线程已经有备用栈（例如标准库安装的）
            return;
        }
        if let Some(alt) = AltStack::new() {
            ALT_STACK.with(|slot| *slot.borrow_mut() = Some(alt));
        }
    }
}

/// 本线程分配的备用信号栈，线程退出时释放
struct AltStack {
    base: *mut libc::c_void,
    size: usize,
}

impl AltStack {
    unsafe fn new() -> Option<Self> {
        let size = ALT_SIGNAL_STACK_SIZE.max(libc::SIGSTKSZ as usize);
        let base = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if base == libc::MAP_FAILED {
            return None;
        }
        let stack = libc::stack_t {
            ss_sp: base,
            ss_flags: 0,
            ss_size: size,
        };
        if libc::sigaltstack(&stack, ptr::null_mut()) != 0 {
            libc::munmap(base, size);
            return None;
        }
        Some(Self { base, size })
    }
}

impl Drop for AltStack {
    fn drop(&mut self) {
        unsafe {
            let disable = libc::stack_t {
                ss_sp: ptr::null_mut(),
                ss_flags: libc::SS_DISABLE,
                ss_size: 0,
            };
            libc::sigaltstack(&disable, ptr::null_mut());
            libc::munmap(self.base, self.size);
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    (*info).si_addr() as usize
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    (*info).si_addr as usize
}

unsafe fn fatal(msg: &[u8]) -> ! {
    libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
    libc::abort();
}

/// 提交故障页到当前下边界之间的所有页（多提交一页余量）
unsafe fn grow(region: &RegionInner, addr: usize) -> bool {
    let floor = region.floor.load(Ordering::Acquire);
    let page_floor = addr & !(region.page - 1);
    let new_floor = page_floor.saturating_sub(region.page).max(region.usable_bottom());
    let len = floor - new_floor;
    if libc::mprotect(new_floor as *mut libc::c_void, len, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        return false;
    }
    region.floor.store(new_floor, Ordering::Release);
    true
}

/// 打开故障保留区作为应急栈空间
unsafe fn open_reserve(region: &RegionInner) -> bool {
    let start = region.hard_guard_end();
    let floor = region.floor.load(Ordering::Acquire);
    if libc::mprotect(start as *mut libc::c_void, floor - start, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        return false;
    }
    region.floor.store(start, Ordering::Release);
    region.overflowed.store(true, Ordering::Release);
    true
}

unsafe extern "C" fn handle_fault(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let addr = fault_address(info);
    let region = ACTIVE_REGION.try_with(Cell::get).unwrap_or(ptr::null());

    if !region.is_null() {
        let region = &*region;
        match classify(region, addr) {
            FaultKind::Growth => {
                if grow(region, addr) {
                    return;
                }
                fatal(b"fibra: failed to commit task stack pages, aborting\n");
            }
            FaultKind::Reserve => {
                if open_reserve(region) {
                    return;
                }
                fatal(b"fibra: failed to open the fault reserve of a task stack, aborting\n");
            }
            FaultKind::HardGuard => {
                region.overflowed.store(true, Ordering::Release);
                if redirect(ctx, overflow_landing as usize, region.top() - LANDING_GAP) {
                    return;
                }
                fatal(b"fibra: task stack overflowed past its fault reserve, aborting\n");
            }
            FaultKind::Foreign => {}
        }
    }

    chain(sig, info, ctx);
}

/// 改写信号上下文：返回后从 `sp` 处开始执行 `pc`，原来的栈帧被放弃
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn redirect(ctx: *mut libc::c_void, pc: usize, sp: usize) -> bool {
    let uc = &mut *(ctx as *mut libc::ucontext_t);
    // 模拟 call 之后的对齐：入口处 rsp % 16 == 8
    let sp = (sp & !15) - 8;
    uc.uc_mcontext.gregs[libc::REG_RSP as usize] = sp as libc::greg_t;
    uc.uc_mcontext.gregs[libc::REG_RBP as usize] = 0;
    uc.uc_mcontext.gregs[libc::REG_RIP as usize] = pc as libc::greg_t;
    true
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn redirect(ctx: *mut libc::c_void, pc: usize, sp: usize) -> bool {
    let uc = &mut *(ctx as *mut libc::ucontext_t);
    uc.uc_mcontext.sp = (sp & !15) as u64;
    uc.uc_mcontext.pc = pc as u64;
    uc.uc_mcontext.regs[29] = 0;
    uc.uc_mcontext.regs[30] = 0;
    true
}

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
unsafe fn redirect(_ctx: *mut libc::c_void, _pc: usize, _sp: usize) -> bool {
    false
}

/// 把不属于任务栈的故障交给之前的处理器
unsafe fn chain(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let prev = if sig == libc::SIGBUS { PREV_BUS.get() } else { PREV_SEGV.get() };

    match prev {
        Some(prev) if prev.sa_sigaction != libc::SIG_DFL && prev.sa_sigaction != libc::SIG_IGN => {
            if prev.sa_flags & libc::SA_SIGINFO != 0 {
                let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                    mem::transmute(prev.sa_sigaction);
                handler(sig, info, ctx);
            } else {
                let handler: extern "C" fn(libc::c_int) = mem::transmute(prev.sa_sigaction);
                handler(sig);
            }
        }
        _ => {
            // 恢复默认处理，返回后重新执行的指令会以默认方式终止进程
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(sig, &action, ptr::null_mut());
        }
    }
}
