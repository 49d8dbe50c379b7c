//! Sysmon 监控线程
//!
//! 周期性观测各 Worker 的执行状态：按阈值判定阻塞，
//! 在阻塞比例过高时驱逐阻塞 Worker、转移其排队任务
//! 并用备用 Worker 补齐存活集

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::SYSMON_INTERVAL_MS;
use crate::fabric::FabricInner;
use crate::time::now_ms;
use crate::worker::{Worker, WorkerState};

/// 启动 sysmon 线程
pub(crate) fn spawn(fabric: Weak<FabricInner>, name: &str) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("{}-sysmon", name))
        .spawn(move || run(fabric))
        .expect("failed to spawn sysmon thread")
}

/// sysmon 主循环
///
/// 只持有 Fabric 的弱引用；Fabric 关闭或被释放后
/// 在一个采样周期内退出
fn run(fabric: Weak<FabricInner>) {
    loop {
        thread::sleep(Duration::from_millis(SYSMON_INTERVAL_MS));
        let Some(inner) = fabric.upgrade() else { break };
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        sample(&inner);
    }
}

/// 单次采样
fn sample(inner: &Arc<FabricInner>) {
    let live = inner.pool.read().live.clone();
    let live_count = live.len();
    if live_count == 0 {
        return;
    }

    let now = now_ms();
    for worker in &live {
        observe(inner, worker, now);
    }

    // 阻塞比例达到阈值时执行驱逐
    let blocking = inner.blocking_count.load(Ordering::Acquire);
    let threshold = inner.settings.blocking_workers_threshold;
    if blocking > 0 && (blocking as f32) >= (live_count as f32) * threshold {
        evict_pass(inner);
    }
}

/// 观测单个 Worker 并更新其阻塞判定
fn observe(inner: &FabricInner, worker: &Arc<Worker>, now: u64) {
    let job_start = worker.job_start_ms();

    if worker.flagged() {
        // 已判定阻塞的 Worker 在驱逐前完成了任务，恢复其身份
        if job_start == 0 {
            worker.clear_flagged();
            if worker.state() == WorkerState::BlockedExternal {
                worker.set_state(WorkerState::Running);
            }
            inner.blocking_count.fetch_sub(1, Ordering::AcqRel);
            log::debug!("worker '{}' recovered before eviction", worker.name());
        }
        return;
    }

    if job_start == 0 {
        return; // 空闲
    }
    match worker.state() {
        WorkerState::Running | WorkerState::BlockedCoop => {}
        _ => return,
    }

    let announced = worker.announced_blocking();
    let threshold = if announced {
        inner.settings.coop_blocking_threshold_in_ms
    } else {
        inner.settings.external_blocking_threshold_in_ms
    };

    let elapsed = now.saturating_sub(job_start);
    if elapsed >= threshold {
        worker.set_flagged();
        if !announced {
            worker.set_state(WorkerState::BlockedExternal);
        }
        inner.blocking_count.fetch_add(1, Ordering::AcqRel);
        log::debug!(
            "worker '{}' declared blocked after {}ms (announced: {})",
            worker.name(),
            elapsed,
            announced
        );
    }
}

/// 驱逐阶段
///
/// 1. 把被判定阻塞的 Worker 从存活集移出并抽干其排队任务；
/// 2. 晋升备用 Worker 补齐存活集，备用耗尽后在上限内生成新 Worker；
/// 3. 把抽出的任务轮转分发给存活 Worker。
/// 被驱逐的 Worker 继续执行手头的任务，完成后自行退出
fn evict_pass(inner: &Arc<FabricInner>) {
    let mut pool = inner.pool.write();

    let mut evicted = Vec::new();
    pool.live.retain(|worker| {
        if worker.flagged() {
            evicted.push(Arc::clone(worker));
            false
        } else {
            true
        }
    });
    if evicted.is_empty() {
        return;
    }

    let mut orphaned = Vec::new();
    for worker in &evicted {
        orphaned.extend(worker.drain_pending_for_sysmon());
        worker.set_evicted();
        inner.blocking_count.fetch_sub(1, Ordering::AcqRel);
    }

    let target = inner.settings.workers_count;
    while pool.live.len() < target {
        if let Some(worker) = pool.put_aside.pop() {
            pool.live.push(worker);
        } else if !inner.at_spawn_cap(&pool) {
            // 备用耗尽，生成新 Worker
            let worker = FabricInner::spawn_worker(inner, &mut pool);
            pool.live.push(worker);
        } else {
            log::warn!(
                "fabric '{}' reached its worker spawn cap",
                inner.settings.name
            );
            break;
        }
    }

    if !pool.live.is_empty() {
        let n = pool.live.len();
        for (i, task) in orphaned.drain(..).enumerate() {
            // 存活集中的 Worker 不处于停止状态，提交不会失败
            let _ = pool.live[i % n].task_do(task);
        }
    }

    log::debug!(
        "fabric '{}' evicted {} blocked worker(s), live count {}",
        inner.settings.name,
        evicted.len(),
        pool.live.len()
    );
}
