//! 字节流 Channel
//!
//! 以字节块为消息的同步背压管道，实现通用流接口。
//! 适合在任务之间以流水线方式传递大块数据
//! （例如压缩、加密）而无需在内存中缓存完整产物

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use parking_lot::{Condvar, Mutex};

use crate::fabric::Fabric;

/// 流游标操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOp {
    /// 获取当前位置
    Get,
    /// 相对移动
    Move,
    /// 绝对定位
    Set,
}

/// 游标操作失败时的返回值
pub const STREAM_CURSOR_ERROR: i64 = -1;

/// 通用字节流接口
///
/// read/write 返回实际处理的字节数
pub trait Stream: Send {
    /// 读取字节到 out，返回实际读取的字节数
    fn read(&mut self, out: &mut [u8]) -> usize;
    /// 写入 data，返回实际写入的字节数
    fn write(&mut self, data: &[u8]) -> usize;
    /// 流的总大小，未知时返回 0
    fn size(&self) -> i64;
    /// 游标操作，不支持时返回 STREAM_CURSOR_ERROR
    fn cursor_op(&mut self, op: CursorOp, offset: i64) -> i64;
}

/// 暂存的写入负载
struct Payload {
    data: Vec<u8>,
    pos: usize,
}

impl Payload {
    #[inline]
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// 受锁保护的管道状态
struct PipeState {
    /// 当前暂存块（同一时刻最多一个未消费负载）
    payload: Option<Payload>,
    /// 负载序号，写入方用它区分自己的负载是否已被取走
    seq: u64,
}

/// 字节流 Channel 内部状态
struct RawChanStream {
    state: Mutex<PipeState>,
    /// 可读条件变量
    read_cv: Condvar,
    /// 可写条件变量
    write_cv: Condvar,
    /// 是否已关闭
    closed: AtomicBool,
}

/// 字节流 Channel
///
/// 写入方交出一个字节块并阻塞，直到读取方消费完全部字节
/// 或流被关闭；所有权在多个线程间共享，克隆句柄即增加引用计数
pub struct ChanStream {
    inner: Arc<RawChanStream>,
}

impl Clone for ChanStream {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ChanStream {
    /// 创建新的字节流 Channel
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RawChanStream {
                state: Mutex::new(PipeState {
                    payload: None,
                    seq: 0,
                }),
                read_cv: Condvar::new(),
                write_cv: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// 检查是否已关闭
    #[inline]
    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 关闭流
    ///
    /// 重复关闭是空操作；后续写入返回 0，
    /// 读取方取完剩余字节后得到 0
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        // 与等待者的锁互斥，保证唤醒不会丢失
        drop(self.inner.state.lock());
        self.inner.read_cv.notify_all();
        self.inner.write_cv.notify_all();
    }

    /// 写入一个字节块（阻塞）
    ///
    /// 交出 data 并等待读取方消费；返回实际被消费的字节数，
    /// 流已关闭时返回 0
    pub fn write_block(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let mut state = self.inner.state.lock();

        // 等待上一个负载被取完
        while state.payload.is_some() {
            if self.closed() {
                return 0;
            }
            self.inner.write_cv.wait(&mut state);
        }
        if self.closed() {
            return 0;
        }

        state.seq += 1;
        let my_seq = state.seq;
        state.payload = Some(Payload {
            data: data.to_vec(),
            pos: 0,
        });
        self.inner.read_cv.notify_one();

        // 等待负载被消费完或流被关闭
        loop {
            match &state.payload {
                Some(p) if state.seq == my_seq => {
                    if self.closed() {
                        return p.pos;
                    }
                }
                // 负载槽已空或被后来的写入方复用，说明本次负载已消费完毕
                _ => return data.len(),
            }
            self.inner.write_cv.wait(&mut state);
        }
    }

    /// 读取字节（阻塞）
    ///
    /// 返回实际读取的字节数，流关闭且无剩余数据时返回 0
    pub fn read_block(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut state = self.inner.state.lock();
        loop {
            if let Some(payload) = state.payload.as_mut() {
                let n = payload.remaining().min(out.len());
                out[..n].copy_from_slice(&payload.data[payload.pos..payload.pos + n]);
                payload.pos += n;
                if payload.remaining() == 0 {
                    state.payload = None;
                    drop(state);
                    self.inner.write_cv.notify_all();
                }
                return n;
            }
            if self.closed() {
                return 0;
            }
            self.inner.read_cv.wait(&mut state);
        }
    }
}

impl Default for ChanStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for ChanStream {
    fn read(&mut self, out: &mut [u8]) -> usize {
        self.read_block(out)
    }

    fn write(&mut self, data: &[u8]) -> usize {
        self.write_block(data)
    }

    /// 流大小无法预知，返回 0
    fn size(&self) -> i64 {
        0
    }

    /// 字节流 Channel 不支持游标操作
    fn cursor_op(&mut self, _op: CursorOp, _offset: i64) -> i64 {
        panic!("chan stream does not support cursor operations");
    }
}

impl fmt::Debug for ChanStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ChanStream")
            .field(
                "pending",
                &state.payload.as_ref().map(|p| p.remaining()).unwrap_or(0),
            )
            .field("closed", &self.closed())
            .finish()
    }
}

/// 把主动流转换为惰性流
///
/// 将 `transform(input, pipe)` 提交到 fabric 执行并立即返回管道读取端，
/// transform 返回后管道自动关闭。调用方按需读取，
/// 生产方的推进速度受读取进度的背压限制
pub fn lazy_stream<S, F>(fabric: &Fabric, transform: F, input: S) -> ChanStream
where
    S: Stream + 'static,
    F: FnOnce(S, &ChanStream) + Send + 'static,
{
    let pipe = ChanStream::new();
    let out = pipe.clone();
    fabric.go(move || {
        transform(input, &pipe);
        pipe.close();
    });
    out
}
