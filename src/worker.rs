//! Worker 实现
//!
//! 一个 Worker 是一条操作系统线程加一个私有任务队列。
//! 队列由自身的互斥锁保护：任何线程都可以入队，
//! 只有 Worker 线程自己出队执行

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::config::{Hook, BLOCK_POLL_INTERVAL_MS};
use crate::error::FabricError;
use crate::fabric::FabricInner;
use crate::task::FabricTask;
use crate::time::{now_ms, Timeout};

/// Worker 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// 正在运行
    Running = 0,
    /// 协作阻塞（任务已通过 block_ahead 声明）
    BlockedCoop = 1,
    /// 外部阻塞（未声明，由 sysmon 判定）
    BlockedExternal = 2,
    /// 正在停止
    Stopping = 3,
    /// 已停止
    Stopped = 4,
}

impl From<u8> for WorkerState {
    fn from(v: u8) -> Self {
        match v {
            0 => WorkerState::Running,
            1 => WorkerState::BlockedCoop,
            2 => WorkerState::BlockedExternal,
            3 => WorkerState::Stopping,
            _ => WorkerState::Stopped,
        }
    }
}

thread_local! {
    /// 当前线程所属的 Worker
    static LOCAL_WORKER: RefCell<Option<Arc<Worker>>> = const { RefCell::new(None) };
}

/// Worker
///
/// 由 Fabric 创建并独占持有，也可以通过 [`Worker::spawn`] 独立使用。
/// 生命周期：创建即启动线程，[`Worker::shutdown`] 发出停止信号、
/// 丢弃未执行的任务并等待线程退出
pub struct Worker {
    /// Worker 名称
    name: String,
    /// OS 线程句柄
    thread: Mutex<Option<JoinHandle<()>>>,
    /// 私有任务队列
    queue: Mutex<VecDeque<FabricTask>>,
    /// 有任务可执行
    job_cv: Condvar,
    /// 队列已取空
    drain_cv: Condvar,
    /// Worker 状态
    state: AtomicU8,
    /// 当前任务的开始时间戳（毫秒，0 表示空闲）
    job_start_ms: CachePadded<AtomicU64>,
    /// block_ahead 的嵌套深度（大于 0 表示已声明阻塞）
    block_depth: AtomicU32,
    /// 被 sysmon 判定为阻塞
    flagged: AtomicBool,
    /// 已被 sysmon 从存活集中移出
    evicted: AtomicBool,
    /// 所属 Fabric 的回指（弱引用，只用于查询）
    fabric: Weak<FabricInner>,
    /// 每个任务执行结束后调用的钩子
    after_each_job: Option<Hook>,
    /// 线程启动时调用的钩子
    on_start: Option<Hook>,
}

impl Worker {
    /// 创建独立 Worker 并启动其线程
    pub fn spawn(name: &str) -> Arc<Self> {
        Self::spawn_with(name, Weak::new(), None, None)
    }

    /// 创建带钩子和 Fabric 回指的 Worker
    pub(crate) fn spawn_with(
        name: &str,
        fabric: Weak<FabricInner>,
        after_each_job: Option<Hook>,
        on_start: Option<Hook>,
    ) -> Arc<Self> {
        let worker = Arc::new(Self {
            name: name.to_string(),
            thread: Mutex::new(None),
            queue: Mutex::new(VecDeque::new()),
            job_cv: Condvar::new(),
            drain_cv: Condvar::new(),
            state: AtomicU8::new(WorkerState::Running as u8),
            job_start_ms: CachePadded::new(AtomicU64::new(0)),
            block_depth: AtomicU32::new(0),
            flagged: AtomicBool::new(false),
            evicted: AtomicBool::new(false),
            fabric,
            after_each_job,
            on_start,
        });

        let cloned = Arc::clone(&worker);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                LOCAL_WORKER.with(|w| *w.borrow_mut() = Some(Arc::clone(&cloned)));
                log::trace!("worker '{}' starting", cloned.name);
                if let Some(hook) = &cloned.on_start {
                    hook();
                }
                cloned.run_loop();
                LOCAL_WORKER.with(|w| *w.borrow_mut() = None);
                log::trace!("worker '{}' exiting", cloned.name);
            })
            .expect("failed to spawn worker thread");
        *worker.thread.lock() = Some(handle);
        worker
    }

    /// 获取 Worker 名称
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 获取 Worker 状态
    #[inline]
    pub fn state(&self) -> WorkerState {
        WorkerState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// 当前任务的开始时间戳（毫秒，0 表示空闲）
    #[inline]
    pub(crate) fn job_start_ms(&self) -> u64 {
        self.job_start_ms.load(Ordering::Acquire)
    }

    /// 检查是否已声明阻塞
    #[inline]
    pub(crate) fn announced_blocking(&self) -> bool {
        self.block_depth.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub(crate) fn flagged(&self) -> bool {
        self.flagged.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_flagged(&self) {
        self.flagged.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn clear_flagged(&self) {
        self.flagged.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// 标记为已驱逐并唤醒线程
    ///
    /// 被驱逐时恰好空闲的 Worker 靠这次唤醒观测到标记并退出
    pub(crate) fn set_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
        self.job_cv.notify_all();
    }

    /// 所属 Fabric（如果由 Fabric 创建且 Fabric 仍存活）
    pub(crate) fn fabric(&self) -> Option<Arc<FabricInner>> {
        self.fabric.upgrade()
    }

    /// 队列中等待执行的任务数量
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// 提交单个任务
    ///
    /// 仅在 Worker 正在停止或已停止时失败
    pub fn task_do(&self, task: FabricTask) -> Result<(), FabricError> {
        let mut queue = self.queue.lock();
        match self.state() {
            WorkerState::Stopping | WorkerState::Stopped => {
                return Err(FabricError::WorkerStopped)
            }
            _ => {}
        }
        queue.push_back(task);
        drop(queue);
        self.job_cv.notify_one();
        Ok(())
    }

    /// 批量提交任务
    pub fn task_batch_do(&self, tasks: Vec<FabricTask>) -> Result<(), FabricError> {
        if tasks.is_empty() {
            return Ok(());
        }
        let mut queue = self.queue.lock();
        match self.state() {
            WorkerState::Stopping | WorkerState::Stopped => {
                return Err(FabricError::WorkerStopped)
            }
            _ => {}
        }
        queue.extend(tasks);
        drop(queue);
        self.job_cv.notify_one();
        Ok(())
    }

    /// 提交闭包任务
    pub fn go<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.task_do(FabricTask::new(f)).is_err() {
            panic!("cannot submit into a stopped worker");
        }
    }

    /// 阻塞直到队列被取空
    ///
    /// 队列取空不等于最后一个任务已执行完毕
    pub fn drain(&self) {
        let mut queue = self.queue.lock();
        while !queue.is_empty() {
            self.drain_cv.wait(&mut queue);
        }
    }

    /// 供 sysmon 使用的特权操作：把未执行的任务全部转移出去
    ///
    /// 普通提交路径不使用该接口
    pub(crate) fn drain_pending_for_sysmon(&self) -> Vec<FabricTask> {
        let mut queue = self.queue.lock();
        queue.drain(..).collect()
    }

    /// 主执行循环
    fn run_loop(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(task) = queue.pop_front() {
                        break Some(task);
                    }
                    // 队列已空
                    self.drain_cv.notify_all();
                    if self.state() == WorkerState::Stopping || self.is_evicted() {
                        break None;
                    }
                    self.job_cv.wait(&mut queue);
                }
            };

            let Some(task) = task else { break };

            self.job_start_ms.store(now_ms(), Ordering::Release);
            let result = panic::catch_unwind(AssertUnwindSafe(|| task.run()));
            if let Err(payload) = result {
                // 任务 panic 只终止任务本身，Worker 继续存活
                log::error!(
                    "worker '{}' task panicked: {}",
                    self.name,
                    panic_message(&payload)
                );
            }
            if let Some(hook) = &self.after_each_job {
                hook();
            }
            self.job_start_ms.store(0, Ordering::Release);
            // 任务 panic 可能跳过 block_clear，这里恢复声明状态
            self.block_depth.store(0, Ordering::Release);
            if self.state() == WorkerState::BlockedCoop {
                self.set_state(WorkerState::Running);
            }

            if self.is_evicted() {
                // 已被 sysmon 从存活集中移出，归还线程
                log::debug!("worker '{}' evicted, thread retiring", self.name);
                break;
            }
        }
        self.set_state(WorkerState::Stopped);
    }

    /// 停止 Worker：丢弃未执行的任务并等待线程退出
    ///
    /// 执行中的任务会先完成。在 Worker 自己的线程上调用时
    /// 只发出停止信号，不等待线程退出
    pub fn shutdown(&self) {
        {
            let mut queue = self.queue.lock();
            if self.state() != WorkerState::Stopped {
                self.set_state(WorkerState::Stopping);
            }
            // 未执行的任务直接丢弃
            queue.clear();
        }
        self.job_cv.notify_all();
        self.drain_cv.notify_all();
        self.join();
    }

    /// 等待 Worker 线程结束
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return; // 在 Worker 自己的线程上，留给线程自行退出
            }
            let _ = handle.join();
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

/// 提取 panic 负载中的描述信息
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

/// 返回当前线程所属的 Worker，非 Worker 线程返回 None
pub fn worker_local() -> Option<Arc<Worker>> {
    LOCAL_WORKER.with(|w| w.borrow().clone())
}

/// 声明当前任务即将执行可能阻塞线程的操作
///
/// 例如 sleep、磁盘 IO、网络 IO、锁等待等。sysmon 据此对该
/// Worker 使用较短的协作阻塞阈值，以便尽快转移其排队任务。
/// 必须与 [`worker_block_clear`] 成对调用；非 Worker 线程上是空操作
pub fn worker_block_ahead() {
    if let Some(worker) = worker_local() {
        if worker.block_depth.fetch_add(1, Ordering::AcqRel) == 0 {
            worker.set_state(WorkerState::BlockedCoop);
        }
    }
}

/// 声明阻塞操作已结束
pub fn worker_block_clear() {
    if let Some(worker) = worker_local() {
        if worker.block_depth.load(Ordering::Acquire) == 0 {
            debug_assert!(false, "worker_block_clear without matching worker_block_ahead");
            return;
        }
        if worker.block_depth.fetch_sub(1, Ordering::AcqRel) == 1
            && worker.state() == WorkerState::BlockedCoop
        {
            worker.set_state(WorkerState::Running);
        }
    }
}

/// 阻塞当前线程直到谓词为真
///
/// 以约 1 毫秒的周期轮询谓词，期间处于已声明阻塞状态
pub fn worker_block_on<F>(mut pred: F)
where
    F: FnMut() -> bool,
{
    worker_block_ahead();
    while !pred() {
        thread::sleep(Duration::from_millis(BLOCK_POLL_INTERVAL_MS));
    }
    worker_block_clear();
}

/// 带超时的阻塞等待
///
/// NoWait 只检查一次谓词；Infinite 永远等待；Millis 为有限等待。
/// 超时属于正常返回，谓词此刻的真值就是结果信号
pub fn worker_block_on_with_timeout<F>(timeout: Timeout, mut pred: F)
where
    F: FnMut() -> bool,
{
    worker_block_ahead();
    let start = now_ms();
    while !pred() {
        match timeout {
            Timeout::NoWait => break,
            Timeout::Infinite => {}
            Timeout::Millis(ms) => {
                if now_ms().saturating_sub(start) >= ms {
                    break;
                }
            }
        }
        thread::sleep(Duration::from_millis(BLOCK_POLL_INTERVAL_MS));
    }
    worker_block_clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_worker_executes_tasks() {
        let worker = Worker::spawn("test-worker");
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            worker
                .task_do(FabricTask::new(move || {
                    counter.fetch_add(1, Ordering::AcqRel);
                }))
                .unwrap();
        }

        worker_block_on_with_timeout(Timeout::Millis(2000), || {
            counter.load(Ordering::Acquire) == 10
        });
        assert_eq!(counter.load(Ordering::Acquire), 10);
        worker.shutdown();
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn test_worker_batch_submit() {
        let worker = Worker::spawn("test-batch");
        let counter = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<FabricTask> = (0..20)
            .map(|_| {
                let counter = Arc::clone(&counter);
                FabricTask::new(move || {
                    counter.fetch_add(1, Ordering::AcqRel);
                })
            })
            .collect();
        worker.task_batch_do(tasks).unwrap();

        worker_block_on_with_timeout(Timeout::Millis(2000), || {
            counter.load(Ordering::Acquire) == 20
        });
        assert_eq!(counter.load(Ordering::Acquire), 20);
        worker.shutdown();
    }

    #[test]
    fn test_worker_submit_after_shutdown() {
        let worker = Worker::spawn("test-stopped");
        worker.shutdown();
        assert_eq!(
            worker.task_do(FabricTask::new(|| {})),
            Err(FabricError::WorkerStopped)
        );
    }

    #[test]
    fn test_worker_survives_task_panic() {
        let worker = Worker::spawn("test-panic");
        let counter = Arc::new(AtomicUsize::new(0));

        worker
            .task_do(FabricTask::new(|| panic!("task failure")))
            .unwrap();
        let after = Arc::clone(&counter);
        worker
            .task_do(FabricTask::new(move || {
                after.fetch_add(1, Ordering::AcqRel);
            }))
            .unwrap();

        // panic 之后的任务仍然被执行
        worker_block_on_with_timeout(Timeout::Millis(2000), || {
            counter.load(Ordering::Acquire) == 1
        });
        assert_eq!(counter.load(Ordering::Acquire), 1);
        worker.shutdown();
    }

    #[test]
    fn test_worker_local() {
        assert!(worker_local().is_none());

        let worker = Worker::spawn("test-local");
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        worker.go(move || {
            *slot.lock() = worker_local().map(|w| w.name().to_string());
        });

        worker_block_on_with_timeout(Timeout::Millis(2000), || seen.lock().is_some());
        assert_eq!(seen.lock().as_deref(), Some("test-local"));
        worker.shutdown();
    }

    #[test]
    fn test_worker_drain() {
        let worker = Worker::spawn("test-drain");
        for _ in 0..5 {
            worker
                .task_do(FabricTask::new(|| {
                    thread::sleep(Duration::from_millis(2));
                }))
                .unwrap();
        }
        worker.drain();
        assert_eq!(worker.pending(), 0);
        worker.shutdown();
    }

    #[test]
    fn test_block_on_timeout_semantics() {
        // NoWait：谓词为假也立即返回
        let start = now_ms();
        worker_block_on_with_timeout(Timeout::NoWait, || false);
        assert!(now_ms() - start < 50);

        // 有限等待：到期后返回
        let start = now_ms();
        worker_block_on_with_timeout(Timeout::Millis(50), || false);
        assert!(now_ms() - start >= 50);

        // 谓词为真立即返回
        let start = now_ms();
        worker_block_on_with_timeout(Timeout::Infinite, || true);
        assert!(now_ms() - start < 50);
    }

    #[test]
    fn test_worker_block_ahead_state() {
        let worker = Worker::spawn("test-announce");
        let release = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&release);
        worker.go(move || {
            worker_block_ahead();
            while !gate.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(1));
            }
            worker_block_clear();
        });

        worker_block_on_with_timeout(Timeout::Millis(2000), || {
            worker.state() == WorkerState::BlockedCoop
        });
        assert_eq!(worker.state(), WorkerState::BlockedCoop);
        assert!(worker.announced_blocking());

        release.store(true, Ordering::Release);
        worker_block_on_with_timeout(Timeout::Millis(2000), || {
            worker.state() == WorkerState::Running
        });
        assert_eq!(worker.state(), WorkerState::Running);
        assert!(!worker.announced_blocking());
        worker.shutdown();
    }
}
