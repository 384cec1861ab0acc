//! 进度报告与取消
//!
//! 调用方提供 `ProgressSink`；编解码器通过 `Progress` 上报 0..=100 的单调进度，
//! 并在每个检查点轮询取消请求。

use crate::error::{CodecError, CodecResult};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// 进度接收方
///
/// 可能在工作线程上被调用，实现需要线程安全。
pub trait ProgressSink: Send + Sync {
    /// 新的进度值（0..=100）
    fn set_value(&self, percent: u8);

    /// 是否请求取消
    fn is_abort_requested(&self) -> bool;
}

/// 基于原子量的进度接收方，可跨线程请求取消
#[derive(Debug, Default)]
pub struct TaskProgress {
    value: AtomicU8,
    abort: AtomicBool,
}

impl TaskProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u8 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

impl ProgressSink for TaskProgress {
    fn set_value(&self, percent: u8) {
        self.value.store(percent, Ordering::Relaxed);
    }

    fn is_abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// 单次操作的进度上报器
pub(crate) struct Progress<'a> {
    sink: Option<&'a dyn ProgressSink>,
    value: u8,
}

impl<'a> Progress<'a> {
    pub(crate) fn start(sink: Option<&'a dyn ProgressSink>) -> Self {
        Self { sink, value: 0 }
    }

    /// 上报进度；只在值增大时通知，超过 100 截断
    pub(crate) fn set(&mut self, percent: u8) {
        let percent = percent.min(100);
        if percent > self.value {
            self.value = percent;
            if let Some(sink) = self.sink {
                sink.set_value(percent);
            }
        }
    }

    /// 取消检查点
    pub(crate) fn check(&self) -> CodecResult<()> {
        match self.sink {
            Some(sink) if sink.is_abort_requested() => Err(CodecError::Cancelled),
            _ => Ok(()),
        }
    }

    /// 完成 `done`/`total` 后上报进度并检查取消
    pub(crate) fn step(&mut self, done: usize, total: usize) -> CodecResult<()> {
        if total > 0 {
            self.set((done.min(total) * 100 / total) as u8);
        }
        self.check()
    }

    pub(crate) fn finish(&mut self) {
        self.set(100);
    }

    #[cfg(test)]
    pub(crate) fn value(&self) -> u8 {
        self.value
    }
}
