//! Fabric 任务
//!
//! Worker 任务队列中的单个任务：类型擦除的无参闭包加任务标记

use std::fmt;

/// 类型擦除的任务闭包
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// 任务标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskFlags {
    /// 默认任务
    #[default]
    None,
    /// 计算任务，派发时偏向备用 Worker
    Compute,
}

/// Fabric 任务
///
/// 同一时刻只属于一个队列槽位，派发时移动到 Worker，执行后销毁
pub struct FabricTask {
    job: Job,
    flags: TaskFlags,
}

impl FabricTask {
    /// 创建默认任务
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            job: Box::new(f),
            flags: TaskFlags::None,
        }
    }

    /// 创建计算任务
    pub fn compute<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            job: Box::new(f),
            flags: TaskFlags::Compute,
        }
    }

    /// 获取任务标记
    #[inline]
    pub fn flags(&self) -> TaskFlags {
        self.flags
    }

    /// 执行任务
    pub(crate) fn run(self) {
        (self.job)()
    }
}

impl fmt::Debug for FabricTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabricTask")
            .field("flags", &self.flags)
            .finish()
    }
}
