//! 类型化 Channel 实现
//!
//! 用于 fabric 任务之间通信的有界消息队列，
//! 支持阻塞和非阻塞两种收发方式

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use parking_lot::{Condvar, Mutex};

/// Channel 内部状态
struct RawChan<T> {
    /// 环形缓冲区
    ring: Mutex<VecDeque<T>>,
    /// 可读条件变量
    read_cv: Condvar,
    /// 可写条件变量
    write_cv: Condvar,
    /// 容量上限（0 表示已关闭）
    limit: AtomicUsize,
}

/// 类型化 Channel
///
/// 在多个线程间共享所有权：克隆句柄即增加引用计数，
/// 最后一个句柄释放时销毁（恰好一次）。关闭与销毁相互独立，
/// 关闭后已缓冲的消息仍可接收
pub struct Chan<T> {
    inner: Arc<RawChan<T>>,
}

impl<T> Clone for Chan<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Chan<T> {
    /// 创建新的 Channel
    ///
    /// limit 必须大于等于 1，0 容量的语义未定义
    pub fn new(limit: usize) -> Self {
        assert!(limit >= 1, "channel limit must be at least 1");
        Self {
            inner: Arc::new(RawChan {
                ring: Mutex::new(VecDeque::with_capacity(limit)),
                read_cv: Condvar::new(),
                write_cv: Condvar::new(),
                limit: AtomicUsize::new(limit),
            }),
        }
    }

    /// 检查是否已关闭
    #[inline]
    pub fn closed(&self) -> bool {
        self.inner.limit.load(Ordering::Acquire) == 0
    }

    /// 关闭 Channel
    ///
    /// 重复关闭是空操作；关闭后发送会失败，已缓冲的消息仍可接收
    pub fn close(&self) {
        {
            // 在环形缓冲区锁内写入，保证等待者观测顺序一致
            let _ring = self.inner.ring.lock();
            self.inner.limit.store(0, Ordering::Release);
        }
        self.inner.read_cv.notify_all();
        self.inner.write_cv.notify_all();
    }

    /// 当前缓冲的消息数量
    pub fn len(&self) -> usize {
        self.inner.ring.lock().len()
    }

    /// 检查缓冲区是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 发送一个值（阻塞）
    ///
    /// 缓冲区满时阻塞等待空间；向已关闭的 Channel 发送会 panic
    pub fn send(&self, value: T) {
        let mut ring = self.inner.ring.lock();
        loop {
            let limit = self.inner.limit.load(Ordering::Acquire);
            if limit == 0 {
                panic!("cannot send into a closed channel");
            }
            if ring.len() < limit {
                break;
            }
            self.inner.write_cv.wait(&mut ring);
        }
        ring.push_back(value);
        drop(ring);
        self.inner.read_cv.notify_one();
    }

    /// 尝试发送（非阻塞）
    ///
    /// 返回 true 表示成功；缓冲区满或已关闭时返回 false
    pub fn send_try(&self, value: T) -> bool {
        let mut ring = self.inner.ring.lock();
        let limit = self.inner.limit.load(Ordering::Acquire);
        if limit == 0 || ring.len() >= limit {
            return false;
        }
        ring.push_back(value);
        drop(ring);
        self.inner.read_cv.notify_one();
        true
    }

    /// 接收一个值（阻塞）
    ///
    /// 返回 None 表示 Channel 已关闭且已被取空
    pub fn recv(&self) -> Option<T> {
        let mut ring = self.inner.ring.lock();
        loop {
            if let Some(value) = ring.pop_front() {
                drop(ring);
                self.inner.write_cv.notify_one();
                return Some(value);
            }
            if self.closed() {
                return None;
            }
            self.inner.read_cv.wait(&mut ring);
        }
    }

    /// 尝试接收（非阻塞）
    pub fn recv_try(&self) -> Option<T> {
        let mut ring = self.inner.ring.lock();
        let value = ring.pop_front()?;
        drop(ring);
        self.inner.write_cv.notify_one();
        Some(value)
    }

    /// 检查当前是否可以发送
    pub fn can_send(&self) -> bool {
        let ring = self.inner.ring.lock();
        let limit = self.inner.limit.load(Ordering::Acquire);
        limit != 0 && ring.len() < limit
    }

    /// 检查当前是否可以接收
    pub fn can_recv(&self) -> bool {
        let ring = self.inner.ring.lock();
        !ring.is_empty() && !self.closed()
    }

    /// 获取迭代器
    ///
    /// 持续接收直到 Channel 关闭并取空
    pub fn iter(&self) -> ChanIter<T> {
        ChanIter { chan: self.clone() }
    }
}

impl<T> Default for Chan<T> {
    fn default() -> Self {
        Self::new(1)
    }
}

impl<T> fmt::Debug for Chan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chan")
            .field("len", &self.len())
            .field("closed", &self.closed())
            .finish()
    }
}

/// Channel 迭代器
///
/// 反复调用 recv，Channel 关闭并取空后结束
pub struct ChanIter<T> {
    chan: Chan<T>,
}

impl<T> Iterator for ChanIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.chan.recv()
    }
}

impl<'a, T> IntoIterator for &'a Chan<T> {
    type Item = T;
    type IntoIter = ChanIter<T>;

    fn into_iter(self) -> ChanIter<T> {
        self.iter()
    }
}

impl<T> IntoIterator for Chan<T> {
    type Item = T;
    type IntoIter = ChanIter<T>;

    fn into_iter(self) -> ChanIter<T> {
        ChanIter { chan: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_chan_backpressure() {
        let chan = Chan::new(2);
        let tx = chan.clone();

        let producer = thread::spawn(move || {
            for i in 1..=4 {
                // 缓冲区容量为 2，后两次发送需要等待消费
                assert!(tx.len() <= 2);
                tx.send(i);
            }
            tx.close();
        });

        let mut received = Vec::new();
        for value in &chan {
            received.push(value);
        }
        producer.join().unwrap();

        assert_eq!(received, vec![1, 2, 3, 4]);
        assert_eq!(chan.recv(), None);
    }

    #[test]
    fn test_chan_close_while_blocked() {
        let chan = Chan::new(1);
        chan.send(1);
        assert_eq!(chan.recv(), Some(1));

        let closer = chan.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            closer.close();
        });

        // 此时缓冲区为空，recv 会阻塞直到另一个线程关闭 Channel
        assert_eq!(chan.recv(), None);
        handle.join().unwrap();
    }

    #[test]
    fn test_chan_try_variants() {
        let chan = Chan::new(1);
        assert!(chan.send_try(10));
        assert!(!chan.send_try(11)); // 缓冲区满
        assert_eq!(chan.recv_try(), Some(10));
        assert_eq!(chan.recv_try(), None); // 缓冲区空

        chan.close();
        assert!(!chan.send_try(12)); // 已关闭
    }

    #[test]
    fn test_chan_fifo_single_producer() {
        let chan = Chan::new(8);
        let tx = chan.clone();
        let producer = thread::spawn(move || {
            for i in 0..100 {
                tx.send(i);
            }
            tx.close();
        });

        let received: Vec<i32> = chan.iter().collect();
        producer.join().unwrap();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_chan_exactly_once_multi_producer() {
        let chan = Chan::new(4);
        let mut producers = Vec::new();
        for p in 0..4 {
            let tx = chan.clone();
            producers.push(thread::spawn(move || {
                for i in 0..100 {
                    tx.send(p * 100 + i);
                }
            }));
        }

        let consumer = {
            let rx = chan.clone();
            thread::spawn(move || rx.iter().collect::<Vec<i32>>())
        };

        for handle in producers {
            handle.join().unwrap();
        }
        chan.close();

        let mut received = consumer.join().unwrap();
        received.sort_unstable();
        assert_eq!(received, (0..400).collect::<Vec<_>>());
    }

    #[test]
    fn test_chan_can_send_recv() {
        let chan = Chan::new(1);
        assert!(chan.can_send());
        assert!(!chan.can_recv());

        chan.send(1);
        assert!(!chan.can_send());
        assert!(chan.can_recv());
    }

    #[test]
    fn test_chan_close_idempotent() {
        let chan: Chan<i32> = Chan::new(1);
        chan.close();
        chan.close();
        assert!(chan.closed());
    }

    #[test]
    fn test_chan_recv_drains_after_close() {
        let chan = Chan::new(4);
        chan.send(1);
        chan.send(2);
        chan.close();

        assert_eq!(chan.recv(), Some(1));
        assert_eq!(chan.recv(), Some(2));
        assert_eq!(chan.recv(), None);
        assert_eq!(chan.recv(), None);
    }

    #[test]
    fn test_chan_destroys_buffered_values_once() {
        use std::sync::atomic::AtomicUsize;

        struct Probe(Arc<AtomicUsize>);
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::AcqRel);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let chan = Chan::new(4);
        chan.send(Probe(Arc::clone(&drops)));
        chan.send(Probe(Arc::clone(&drops)));

        let extra = chan.clone();
        drop(chan);
        // 仍有句柄存活，缓冲的值不会被销毁
        assert_eq!(drops.load(Ordering::Acquire), 0);
        drop(extra);
        // 所有句柄释放后恰好销毁一次
        assert_eq!(drops.load(Ordering::Acquire), 2);
    }

    #[test]
    #[should_panic(expected = "cannot send into a closed channel")]
    fn test_chan_send_after_close_panics() {
        let chan = Chan::new(1);
        chan.close();
        chan.send(1);
    }

    #[test]
    #[should_panic(expected = "channel limit must be at least 1")]
    fn test_chan_zero_limit_panics() {
        let _chan: Chan<i32> = Chan::new(0);
    }
}
