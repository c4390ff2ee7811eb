//! 纤程上下文切换
//!
//! 只保存被调用者保存寄存器和浮点控制字，切换时把当前栈指针写入 `save`，
//! 再从 `load` 指向的栈上恢复。新栈的引导帧由 `init_stack` 写入，
//! 第一次切入时经由跳板调用 `entry(arg)`。

use std::cell::Cell;
use std::ptr;

use super::task::Task;

/// 任务切出的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwitchReason {
    /// 尚未切出
    None,
    /// 主动让出，立即重新排队
    Yield,
    /// 挂起在等待队列或定时器上
    Park,
    /// 任务体已结束
    Finished,
}

/// 工作线程切入任务前准备的运行槽，位于工作线程自己的栈上
pub(crate) struct RunSlot {
    /// 工作线程被保存的栈指针
    pub(crate) worker_sp: usize,
    /// 任务切出时写入的原因
    pub(crate) reason: SwitchReason,
    /// 正在运行的任务，由工作线程持有其引用
    pub(crate) task: *const Task,
}

impl RunSlot {
    pub(crate) fn new(task: *const Task) -> Self {
        Self {
            worker_sp: 0,
            reason: SwitchReason::None,
            task,
        }
    }
}

thread_local! {
    static CURRENT_SLOT: Cell<*mut RunSlot> = const { Cell::new(ptr::null_mut()) };
}

/// 当前线程上的运行槽
///
/// 任务可能在另一个线程上恢复，因此每次切换前都要重新读取，不能跨切换缓存。
#[inline(never)]
fn current_slot() -> *mut RunSlot {
    std::hint::black_box(CURRENT_SLOT.with(Cell::get))
}

/// 当前线程是否正在执行任务栈上的代码
#[inline(never)]
pub(crate) fn on_task_stack() -> bool {
    !current_slot().is_null()
}

/// 当前线程上正在运行的任务
#[inline(never)]
pub(crate) fn current_task_ptr() -> *const Task {
    let slot = current_slot();
    if slot.is_null() {
        ptr::null()
    } else {
        unsafe { (*slot).task }
    }
}

/// 从工作线程切入任务，直到任务切出，返回切出原因
///
/// # Safety
/// `task_sp` 必须是 `init_stack` 的返回值或任务上次切出时保存的栈指针，
/// 且该栈此刻没有在其他线程上运行。
pub(crate) unsafe fn resume(task_sp: usize, slot: &mut RunSlot) -> SwitchReason {
    let slot: *mut RunSlot = slot;
    (*slot).reason = SwitchReason::None;
    let prev = CURRENT_SLOT.with(|cell| cell.replace(slot));
    switch_context(ptr::addr_of_mut!((*slot).worker_sp), task_sp);
    CURRENT_SLOT.with(|cell| cell.set(prev));
    (*slot).reason
}

/// 从任务切回工作线程，任务被再次恢复时返回
///
/// # Safety
/// 必须在任务栈上调用；`save` 是任务保存栈指针的位置。
pub(crate) unsafe fn suspend(save: *mut usize, reason: SwitchReason) {
    let slot = current_slot();
    debug_assert!(!slot.is_null(), "suspend outside of a task");
    (*slot).reason = reason;
    let worker_sp = (*slot).worker_sp;
    switch_context(save, worker_sp);
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use std::arch::naked_asm;

    /// 引导帧大小：控制字 + 6 个寄存器 + 返回地址
    pub(super) const FRAME_WORDS: usize = 8;

    /// MXCSR 默认值 0x1F80，x87 控制字默认值 0x037F
    const DEFAULT_CONTROL_WORDS: usize = 0x1F80 | (0x037F << 32);

    pub(super) unsafe fn write_frame(sp: *mut usize, entry: usize, arg: usize) {
        let frame = [
            DEFAULT_CONTROL_WORDS,
            0,     // r15
            0,     // r14
            entry, // r13
            arg,   // r12
            0,     // rbx
            0,     // rbp
            trampoline as usize,
        ];
        sp.copy_from_nonoverlapping(frame.as_ptr(), FRAME_WORDS);
    }

    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch_context(save: *mut usize, load: usize) {
        naked_asm!(
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "sub rsp, 8",
            "stmxcsr dword ptr [rsp]",
            "fnstcw word ptr [rsp + 4]",
            "mov [rdi], rsp",
            "mov rsp, rsi",
            "ldmxcsr dword ptr [rsp]",
            "fldcw word ptr [rsp + 4]",
            "add rsp, 8",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
        );
    }

    #[unsafe(naked)]
    unsafe extern "C" fn trampoline() {
        naked_asm!(
            "mov rdi, r12",
            "and rsp, -16",
            "call r13",
            "ud2",
        );
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use std::arch::naked_asm;

    /// 引导帧大小：x19-x30 与 d8-d15
    pub(super) const FRAME_WORDS: usize = 20;

    pub(super) unsafe fn write_frame(sp: *mut usize, entry: usize, arg: usize) {
        let mut frame = [0usize; FRAME_WORDS];
        frame[0] = arg; // x19
        frame[1] = entry; // x20
        frame[11] = trampoline as usize; // x30
        sp.copy_from_nonoverlapping(frame.as_ptr(), FRAME_WORDS);
    }

    #[unsafe(naked)]
    pub(super) unsafe extern "C" fn switch_context(save: *mut usize, load: usize) {
        naked_asm!(
            "sub sp, sp, #160",
            "stp x19, x20, [sp, #0]",
            "stp x21, x22, [sp, #16]",
            "stp x23, x24, [sp, #32]",
            "stp x25, x26, [sp, #48]",
            "stp x27, x28, [sp, #64]",
            "stp x29, x30, [sp, #80]",
            "stp d8, d9, [sp, #96]",
            "stp d10, d11, [sp, #112]",
            "stp d12, d13, [sp, #128]",
            "stp d14, d15, [sp, #144]",
            "mov x9, sp",
            "str x9, [x0]",
            "mov sp, x1",
            "ldp x19, x20, [sp, #0]",
            "ldp x21, x22, [sp, #16]",
            "ldp x23, x24, [sp, #32]",
            "ldp x25, x26, [sp, #48]",
            "ldp x27, x28, [sp, #64]",
            "ldp x29, x30, [sp, #80]",
            "ldp d8, d9, [sp, #96]",
            "ldp d10, d11, [sp, #112]",
            "ldp d12, d13, [sp, #128]",
            "ldp d14, d15, [sp, #144]",
            "add sp, sp, #160",
            "ret",
        );
    }

    #[unsafe(naked)]
    unsafe extern "C" fn trampoline() {
        naked_asm!(
            "mov x0, x19",
            "blr x20",
            "brk #1",
        );
    }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fibra only supports x86_64 and aarch64 task stacks");

use arch::switch_context;

/// 在新栈顶写入引导帧，返回首次切入用的栈指针
///
/// # Safety
/// `top` 必须按 16 字节对齐，其下至少一页已提交且未被使用。
pub(crate) unsafe fn init_stack(top: usize, entry: extern "C" fn(usize) -> !, arg: usize) -> usize {
    let sp = top - arch::FRAME_WORDS * std::mem::size_of::<usize>();
    let sp = sp & !15;
    arch::write_frame(sp as *mut usize, entry as usize, arg);
    sp
}
