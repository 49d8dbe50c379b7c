//! Fabric 任务执行引擎
//!
//! 一个用户态并发运行时：每个 Worker 是一条 OS 线程加一个私有任务
//! 队列；Fabric 管理 Worker 池并派发任务；内置的 sysmon 监控线程
//! 检测阻塞的 Worker，转移其排队任务并用备用 Worker 补齐存活集。
//! 任务之间通过类型化的有界 Channel 或背压式的字节流 Channel 通信，
//! 计算派发接口把三维索引空间切分成工作组任务交给引擎执行。
//!
//! 核心组件：
//! - [`Worker`]：一条 OS 线程加一个私有任务队列
//! - [`Fabric`]：Worker 池加 sysmon，对外提供任务提交和计算派发
//! - [`Chan`]：任务间通信的有界消息队列
//! - [`ChanStream`]：同步背压的字节管道
//!
//! ```
//! use fabric::{Fabric, Chan};
//!
//! let fabric = Fabric::new();
//! let chan = Chan::new(2);
//!
//! let tx = chan.clone();
//! fabric.go(move || {
//!     for i in 0..4 {
//!         tx.send(i);
//!     }
//!     tx.close();
//! });
//!
//! let received: Vec<i32> = chan.iter().collect();
//! assert_eq!(received, vec![0, 1, 2, 3]);
//! fabric.shutdown();
//! ```

pub mod channel;
pub mod compute;
pub mod config;
pub mod error;
pub mod fabric;
pub mod stream;
mod sysmon;
pub mod task;
pub mod time;
pub mod worker;

pub use channel::{Chan, ChanIter};
pub use compute::{
    compute, compute_sized, compute_tiled, with_scratch, ComputeArgs, ComputeDims,
};
pub use config::{FabricSettings, Hook};
pub use error::FabricError;
pub use fabric::{fabric_local, go, Fabric};
pub use stream::{lazy_stream, ChanStream, CursorOp, Stream, STREAM_CURSOR_ERROR};
pub use task::{FabricTask, Job, TaskFlags};
pub use time::Timeout;
pub use worker::{
    worker_block_ahead, worker_block_clear, worker_block_on, worker_block_on_with_timeout,
    worker_local, Worker, WorkerState,
};

/// 获取当前 CPU 核心数
pub fn num_workers() -> usize {
    num_cpus::get()
}
