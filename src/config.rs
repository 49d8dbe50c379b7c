//! Fabric 配置
//!
//! 创建 Fabric 时的可配置项与内部调优常量

use std::fmt;
use std::sync::Arc;

/// sysmon 采样周期（毫秒）
pub(crate) const SYSMON_INTERVAL_MS: u64 = 1;

/// block_on 轮询周期（毫秒）
pub(crate) const BLOCK_POLL_INTERVAL_MS: u64 = 1;

/// Worker 累计生成数量的上限系数（上限 = workers_count * 系数）
///
/// 备用 Worker 耗尽后 sysmon 还可以生成新 Worker，该系数约束总量
pub(crate) const MAX_WORKERS_FACTOR: usize = 4;

/// 执行钩子
pub type Hook = Arc<dyn Fn() + Send + Sync + 'static>;

/// Fabric 构造设置
#[derive(Clone)]
pub struct FabricSettings {
    /// Fabric 实例名称
    pub name: String,
    /// 存活 Worker 数量（0 表示使用 CPU 核心数）
    pub workers_count: usize,
    /// 备用 Worker 数量（默认：CPU 核心数的一半）
    pub put_aside_worker_count: usize,
    /// 已声明阻塞的 Worker 被 sysmon 判定为阻塞的等待毫秒数（默认 10）
    pub coop_blocking_threshold_in_ms: u64,
    /// 未声明阻塞的 Worker 被 sysmon 判定为阻塞的等待毫秒数（默认 1000）
    pub external_blocking_threshold_in_ms: u64,
    /// 触发驱逐的阻塞 Worker 比例阈值，范围 [0, 1]（默认 0.5）
    pub blocking_workers_threshold: f32,
    /// 每个任务执行结束后在 Worker 线程上调用的钩子
    pub after_each_job: Option<Hook>,
    /// 每个 Worker 线程启动时调用的钩子
    pub on_worker_start: Option<Hook>,
}

impl Default for FabricSettings {
    fn default() -> Self {
        let cores = num_cpus::get();
        Self {
            name: "fabric".to_string(),
            workers_count: cores,
            put_aside_worker_count: (cores / 2).max(1),
            coop_blocking_threshold_in_ms: 10,
            external_blocking_threshold_in_ms: 1000,
            blocking_workers_threshold: 0.5,
            after_each_job: None,
            on_worker_start: None,
        }
    }
}

impl fmt::Debug for FabricSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 钩子无法打印，只显示是否设置
        f.debug_struct("FabricSettings")
            .field("name", &self.name)
            .field("workers_count", &self.workers_count)
            .field("put_aside_worker_count", &self.put_aside_worker_count)
            .field(
                "coop_blocking_threshold_in_ms",
                &self.coop_blocking_threshold_in_ms,
            )
            .field(
                "external_blocking_threshold_in_ms",
                &self.external_blocking_threshold_in_ms,
            )
            .field(
                "blocking_workers_threshold",
                &self.blocking_workers_threshold,
            )
            .field("after_each_job", &self.after_each_job.is_some())
            .field("on_worker_start", &self.on_worker_start.is_some())
            .finish()
    }
}
