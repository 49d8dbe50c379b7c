//! 错误定义
//!
//! 任务提交过程中可能产生的可恢复错误；
//! 编程错误（向已关闭的 Channel 发送等）直接 panic，不在此列

use thiserror::Error;

/// 任务提交错误
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FabricError {
    /// Worker 正在停止或已停止，不再接受任务
    #[error("worker is stopping and cannot accept tasks")]
    WorkerStopped,
    /// Fabric 已关闭
    #[error("fabric has been shut down")]
    FabricShutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            FabricError::WorkerStopped.to_string(),
            "worker is stopping and cannot accept tasks"
        );
        assert_eq!(
            FabricError::FabricShutdown.to_string(),
            "fabric has been shut down"
        );
    }
}
