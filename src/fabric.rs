//! Fabric 实现
//!
//! 多 Worker 的任务执行引擎：维护 Worker 池、派发任务、
//! 管理 sysmon 监控线程和整体生命周期

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};

use crate::config::{FabricSettings, MAX_WORKERS_FACTOR};
use crate::error::FabricError;
use crate::sysmon;
use crate::task::{FabricTask, TaskFlags};
use crate::worker::{worker_local, Worker};

/// Worker 池
#[derive(Default)]
pub(crate) struct Pool {
    /// 存活 Worker，普通任务的派发目标
    pub(crate) live: Vec<Arc<Worker>>,
    /// 备用 Worker：计算任务的优先去处，也是驱逐后的补充来源
    pub(crate) put_aside: Vec<Arc<Worker>>,
    /// 累计创建的 Worker 数量（用于命名和生成上限）
    pub(crate) spawned_total: usize,
}

/// Fabric 内部状态
pub(crate) struct FabricInner {
    /// 构造时的设置快照
    pub(crate) settings: FabricSettings,
    /// Worker 池
    pub(crate) pool: RwLock<Pool>,
    /// sysmon 线程句柄
    sysmon: Mutex<Option<JoinHandle<()>>>,
    /// 关闭标记
    pub(crate) shutdown: AtomicBool,
    /// 轮转游标（最少负载选择的平局裁决）
    rr_cursor: AtomicUsize,
    /// 当前被判定为阻塞的 Worker 数量
    pub(crate) blocking_count: AtomicUsize,
}

impl FabricInner {
    /// 创建一个新的 Worker 线程
    pub(crate) fn spawn_worker(inner: &Arc<FabricInner>, pool: &mut Pool) -> Arc<Worker> {
        let id = pool.spawned_total;
        pool.spawned_total += 1;
        let name = format!("{}-worker-{}", inner.settings.name, id);
        Worker::spawn_with(
            &name,
            Arc::downgrade(inner),
            inner.settings.after_each_job.clone(),
            inner.settings.on_worker_start.clone(),
        )
    }

    /// 检查是否已达到 Worker 生成上限
    pub(crate) fn at_spawn_cap(&self, pool: &Pool) -> bool {
        pool.spawned_total >= self.settings.workers_count * MAX_WORKERS_FACTOR
    }

    /// 选择任务的派发目标
    ///
    /// 普通任务：存活集中负载最少者，轮转游标裁决平局。
    /// 计算任务：优先备用集（软偏好，避免长计算扫描饿死普通任务），
    /// 备用集为空时回落到存活集
    pub(crate) fn pick_worker(&self, flags: TaskFlags) -> Result<Arc<Worker>, FabricError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(FabricError::FabricShutdown);
        }
        let pool = self.pool.read();
        if flags == TaskFlags::Compute {
            if let Some(worker) = self.least_loaded(&pool.put_aside) {
                return Ok(worker);
            }
        }
        self.least_loaded(&pool.live)
            .ok_or(FabricError::FabricShutdown)
    }

    /// 在给定集合中挑选负载最少的 Worker
    fn least_loaded(&self, workers: &[Arc<Worker>]) -> Option<Arc<Worker>> {
        if workers.is_empty() {
            return None;
        }
        let offset = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
        let mut best: Option<(usize, usize)> = None;
        for i in 0..workers.len() {
            let idx = (offset + i) % workers.len();
            let len = workers[idx].pending();
            match best {
                Some((min, _)) if min <= len => {}
                _ => best = Some((len, idx)),
            }
        }
        best.map(|(_, idx)| Arc::clone(&workers[idx]))
    }

    /// 关闭：等待执行中的任务完成，丢弃未执行的任务
    pub(crate) fn shutdown_impl(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return; // 已经关闭
        }
        log::trace!("fabric '{}' shutting down", self.settings.name);

        // sysmon 在一个采样周期内退出；最后一个句柄可能在
        // sysmon 线程自己手里释放，此时跳过等待
        if let Some(handle) = self.sysmon.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }

        let (live, put_aside) = {
            let mut pool = self.pool.write();
            (
                std::mem::take(&mut pool.live),
                std::mem::take(&mut pool.put_aside),
            )
        };
        for worker in live.iter().chain(put_aside.iter()) {
            worker.shutdown();
        }
    }
}

impl Drop for FabricInner {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

/// Fabric
///
/// 一组 Worker 加一个 sysmon 监控线程。句柄可克隆，
/// 最后一个句柄释放时自动关闭（等价于显式 [`Fabric::shutdown`]）
pub struct Fabric {
    inner: Arc<FabricInner>,
}

impl Clone for Fabric {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Fabric {
    /// 使用默认设置创建 Fabric
    pub fn new() -> Self {
        Self::with_settings(FabricSettings::default())
    }

    /// 使用指定设置创建 Fabric
    pub fn with_settings(mut settings: FabricSettings) -> Self {
        if settings.workers_count == 0 {
            settings.workers_count = num_cpus::get();
        }

        let inner = Arc::new(FabricInner {
            settings,
            pool: RwLock::new(Pool::default()),
            sysmon: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            rr_cursor: AtomicUsize::new(0),
            blocking_count: AtomicUsize::new(0),
        });

        {
            let mut pool = inner.pool.write();
            for _ in 0..inner.settings.workers_count {
                let worker = FabricInner::spawn_worker(&inner, &mut pool);
                pool.live.push(worker);
            }
            for _ in 0..inner.settings.put_aside_worker_count {
                let worker = FabricInner::spawn_worker(&inner, &mut pool);
                pool.put_aside.push(worker);
            }
        }

        *inner.sysmon.lock() = Some(sysmon::spawn(
            Arc::downgrade(&inner),
            &inner.settings.name,
        ));

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<FabricInner>) -> Self {
        Self { inner }
    }

    #[inline]
    pub(crate) fn inner(&self) -> &Arc<FabricInner> {
        &self.inner
    }

    /// Fabric 名称
    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    /// 存活 Worker 数量
    pub fn workers(&self) -> usize {
        self.inner.pool.read().live.len()
    }

    /// 备用 Worker 数量
    pub fn put_aside_workers(&self) -> usize {
        self.inner.pool.read().put_aside.len()
    }

    /// 提交单个任务
    pub fn task_do(&self, task: FabricTask) -> Result<(), FabricError> {
        let target = self.inner.pick_worker(task.flags())?;
        target.task_do(task)
    }

    /// 批量提交任务
    ///
    /// 逐个选择派发目标以保持负载均衡
    pub fn task_batch_do(&self, tasks: Vec<FabricTask>) -> Result<(), FabricError> {
        for task in tasks {
            self.task_do(task)?;
        }
        Ok(())
    }

    /// 提交闭包任务
    pub fn go<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.task_do(FabricTask::new(f)).is_err() {
            panic!("cannot submit into a shut down fabric");
        }
    }

    /// 关闭 Fabric
    ///
    /// 幂等。等待 sysmon 和执行中的任务结束，丢弃未执行的任务。
    /// 在本 Fabric 的 Worker 线程上调用时不等待该线程自身退出
    pub fn shutdown(&self) {
        self.inner.shutdown_impl();
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fabric")
            .field("name", &self.name())
            .field("workers", &self.workers())
            .field("put_aside_workers", &self.put_aside_workers())
            .field("shutdown", &self.inner.shutdown.load(Ordering::Acquire))
            .finish()
    }
}

/// 返回当前线程所属的 Fabric，非 Fabric Worker 线程返回 None
pub fn fabric_local() -> Option<Fabric> {
    worker_local()?.fabric().map(Fabric::from_inner)
}

/// 把闭包调度到当前线程的本地执行环境
///
/// 优先使用本地 Fabric，其次是本地 Worker；
/// 两者都不存在时 panic
pub fn go<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    if let Some(fabric) = fabric_local() {
        fabric.go(f);
    } else if let Some(worker) = worker_local() {
        worker.go(f);
    } else {
        panic!("cannot find a local fabric or worker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timeout;
    use crate::worker::worker_block_on_with_timeout;
    use std::sync::atomic::AtomicUsize;

    fn small_fabric(name: &str) -> Fabric {
        Fabric::with_settings(FabricSettings {
            name: name.to_string(),
            workers_count: 2,
            put_aside_worker_count: 1,
            ..FabricSettings::default()
        })
    }

    #[test]
    fn test_fabric_runs_tasks() {
        let fabric = small_fabric("run-test");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            fabric.go(move || {
                counter.fetch_add(1, Ordering::AcqRel);
            });
        }

        worker_block_on_with_timeout(Timeout::Millis(5000), || {
            counter.load(Ordering::Acquire) == 100
        });
        assert_eq!(counter.load(Ordering::Acquire), 100);
        fabric.shutdown();
    }

    #[test]
    fn test_fabric_shutdown_rejects_tasks() {
        let fabric = small_fabric("shutdown-test");
        fabric.shutdown();
        fabric.shutdown(); // 幂等
        assert_eq!(
            fabric.task_do(FabricTask::new(|| {})),
            Err(FabricError::FabricShutdown)
        );
    }

    #[test]
    fn test_fabric_local_inside_task() {
        let fabric = small_fabric("local-test");
        assert!(fabric_local().is_none());

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&seen);
        fabric.go(move || {
            *slot.lock() = fabric_local().map(|f| f.name().to_string());
        });

        worker_block_on_with_timeout(Timeout::Millis(2000), || seen.lock().is_some());
        assert_eq!(seen.lock().as_deref(), Some("local-test"));
        fabric.shutdown();
    }

    #[test]
    fn test_go_routes_to_local_fabric() {
        let fabric = small_fabric("go-test");
        let counter = Arc::new(AtomicUsize::new(0));

        let outer = Arc::clone(&counter);
        fabric.go(move || {
            // 任务内部通过线程本地 Fabric 再派发一个任务
            let inner = Arc::clone(&outer);
            go(move || {
                inner.fetch_add(1, Ordering::AcqRel);
            });
        });

        worker_block_on_with_timeout(Timeout::Millis(2000), || {
            counter.load(Ordering::Acquire) == 1
        });
        assert_eq!(counter.load(Ordering::Acquire), 1);
        fabric.shutdown();
    }

    #[test]
    #[should_panic(expected = "cannot find a local fabric or worker")]
    fn test_go_without_context_panics() {
        go(|| {});
    }

    #[test]
    fn test_compute_task_prefers_put_aside() {
        let fabric = Fabric::with_settings(FabricSettings {
            name: "prefer-test".to_string(),
            workers_count: 1,
            put_aside_worker_count: 1,
            ..FabricSettings::default()
        });

        let seen = Arc::new(parking_lot::Mutex::new(None));
        let slot = Arc::clone(&seen);
        fabric
            .task_do(FabricTask::compute(move || {
                *slot.lock() = worker_local().map(|w| w.name().to_string());
            }))
            .unwrap();

        worker_block_on_with_timeout(Timeout::Millis(2000), || seen.lock().is_some());
        // 计算任务落在备用 Worker 上（编号在存活 Worker 之后）
        assert_eq!(seen.lock().as_deref(), Some("prefer-test-worker-1"));
        fabric.shutdown();
    }

    #[test]
    fn test_fabric_drop_shuts_down() {
        let fabric = small_fabric("drop-test");
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        fabric.go(move || {
            c.fetch_add(1, Ordering::AcqRel);
        });
        worker_block_on_with_timeout(Timeout::Millis(2000), || {
            counter.load(Ordering::Acquire) == 1
        });
        // 最后一个句柄释放时自动关闭，不应悬挂
        drop(fabric);
    }
}
