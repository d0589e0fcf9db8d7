//! 核心层：错误分类与恢复、熔断、工具并发许可、交互闸门、关闭协调、按 key 的锁

pub mod circuit_breaker;
pub mod error;
pub mod interaction;
pub mod locks;
pub mod recovery;
pub mod shutdown;
pub mod task_scheduler;

pub use circuit_breaker::{BreakerDecision, BreakerState, CircuitBreakerRegistry};
pub use error::{EngineError, ErrorKind, RecoveryStrategy};
pub use interaction::{InteractionAction, InteractionGate, InteractionStats};
pub use locks::KeyedLocks;
pub use recovery::{
    ErrorPattern, ErrorRecoveryEngine, RecoveryAction, RecoveryContext, RecoveryOutcome,
    RecoveryStats,
};
pub use shutdown::{
    ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason, StateFlushCleanup,
    ToolRegistryCleanup,
};
pub use task_scheduler::TaskScheduler;
