//! 配置常量模块
//!
//! 运行时相关的常量都在这里定义，便于后期修改

/// 运行时名称
pub const RUNTIME_NAME: &str = "fibra";

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 新栈初始提交的页数（启动一次纤程切换所需的最小空间）
pub const COMMIT_FLOOR_PAGES: usize = 3;

/// 栈回收时用于冲刷内存的填充字节
pub const STACK_FILL_BYTE: u8 = 0xCD;

/// 默认任务栈大小：256KB（按需提交）
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// 默认保留的故障处理栈大小：32KB
pub const DEFAULT_FAULT_STACK_SIZE: usize = 32 * 1024;

/// 为异常展开预留的栈空间：16KB
pub const DEFAULT_UNWIND_HEADROOM: usize = 16 * 1024;

/// 栈池默认最多缓存的栈数量
pub const DEFAULT_STACK_POOL_SIZE: usize = 64;

/// 信号处理备用栈大小
pub const ALT_SIGNAL_STACK_SIZE: usize = 64 * 1024;

/// 工作线程名前缀
pub const WORKER_THREAD_PREFIX: &str = "fibra-worker";

/// 绑定执行器线程名前缀
pub const BOUND_THREAD_PREFIX: &str = "fibra-bound";

/// 定时器线程名
pub const TIMER_THREAD_NAME: &str = "fibra-timer";
