//! Shared block-backend trait and error kind.
//!
//! Kept in its own crate so `kernel`, `tosdb`, and `tosos-linker` can all
//! depend on the same `BlockBackend` contract without `tosdb` pulling in
//! the whole kernel crate (mirrors how `mod_mgmt` depends on a small
//! `memory_structs`-style crate rather than the kernel directly).
#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    IoFailed,
    OutOfBounds,
    DeviceNotReady,
    Timeout,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::IoFailed => write!(f, "block backend I/O failed"),
            BlockError::OutOfBounds => write!(f, "position out of backend capacity"),
            BlockError::DeviceNotReady => write!(f, "backend not ready"),
            BlockError::Timeout => write!(f, "backend operation timed out"),
        }
    }
}

/// Byte-addressable persistent store with futures-style async read/write/flush
/// (external interfaces, block backend).
pub trait BlockBackend: Send + Sync {
    fn read(&self, pos: u64, size: usize) -> BlockFuture<Vec<u8>>;
    fn write(&self, pos: u64, data: Vec<u8>) -> BlockFuture<()>;
    fn flush(&self) -> BlockFuture<()>;
    fn capacity(&self) -> u64;
}

struct Completion<T> {
    result: Mutex<Option<Result<T, BlockError>>>,
    waker: Mutex<Option<core::task::Waker>>,
}

/// A one-shot future resolved by a backend once its I/O completes.
///
/// Backends that run I/O inline (the in-memory backend) resolve the
/// completion before returning the future, so the first `poll` is always
/// `Ready`. Backends driven by interrupts or worker threads resolve it
/// later and wake the registered waker (same registration pattern as
/// `SerialInputStream`/`ScancodeStream`).
pub struct BlockFuture<T> {
    inner: Arc<Completion<T>>,
}

impl<T> BlockFuture<T> {
    pub fn new_pending() -> (Self, BlockCompleter<T>) {
        let inner = Arc::new(Completion {
            result: Mutex::new(None),
            waker: Mutex::new(None),
        });
        (BlockFuture { inner: inner.clone() }, BlockCompleter { inner })
    }

    pub fn ready(value: Result<T, BlockError>) -> Self {
        let inner = Arc::new(Completion {
            result: Mutex::new(Some(value)),
            waker: Mutex::new(None),
        });
        BlockFuture { inner }
    }
}

/// Handle a backend uses to resolve a `BlockFuture` it previously handed out.
pub struct BlockCompleter<T> {
    inner: Arc<Completion<T>>,
}

impl<T> BlockCompleter<T> {
    pub fn complete(self, value: Result<T, BlockError>) {
        *self.inner.result.lock() = Some(value);
        if let Some(waker) = self.inner.waker.lock().take() {
            waker.wake();
        }
    }
}

impl<T> Future for BlockFuture<T> {
    type Output = Result<T, BlockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.inner.result.lock().take() {
            return Poll::Ready(result);
        }
        *self.inner.waker.lock() = Some(cx.waker().clone());
        // Re-check: the completer may have raced us between the take() above
        // and registering the waker.
        if let Some(result) = self.inner.result.lock().take() {
            return Poll::Ready(result);
        }
        Poll::Pending
    }
}

/// Boxed, object-safe alias used where a concrete backend type can't be named.
pub type DynBlockBackend = Box<dyn BlockBackend>;
