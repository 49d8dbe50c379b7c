//! 时间工具
//!
//! 提供可存入原子变量的毫秒时间戳和超时类型

use std::sync::OnceLock;
use std::time::Instant;

/// 进程级时间起点
static EPOCH: OnceLock<Instant> = OnceLock::new();

/// 自进程时间起点以来的毫秒数
///
/// 返回值从 1 开始，0 保留给"空闲"哨兵
pub fn now_ms() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as u64 + 1
}

/// 等待操作的超时设置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// 不等待，只检查一次
    NoWait,
    /// 永远等待
    Infinite,
    /// 有限等待（毫秒）
    Millis(u64),
}
