//! In-memory [`Connection`] for tests.
//!
//! Records every payload written, and can be switched into failing or
//! hanging mode to exercise the write-failure and deadline paths.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use knot_core::{ConnectionId, TransportError};
use parking_lot::Mutex;

use crate::connection::Connection;

/// Connection that records payloads instead of writing to a socket.
#[derive(Debug, Default)]
pub struct RecordingConnection {
    id: ConnectionId,
    sent: Mutex<Vec<Bytes>>,
    fail_writes: AtomicBool,
    hanging: AtomicBool,
    close_notified: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl RecordingConnection {
    /// New connection with a fresh id.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Payloads written so far, in write order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Number of payloads written so far.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Make every subsequent write fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent operation block forever.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    /// Whether a close notification was sent.
    pub fn close_notified(&self) -> bool {
        self.close_notified.load(Ordering::SeqCst)
    }

    /// Whether `close` completed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// How many times `close` was invoked.
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` payloads were written or `timeout` elapses.
    pub async fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.sent_count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent_count() >= count
    }

    async fn stall_if_hanging(&self) {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.stall_if_hanging().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::io("broken pipe"));
        }
        self.sent.lock().push(payload);
        Ok(())
    }

    async fn send_close(&self) -> Result<(), TransportError> {
        self.stall_if_hanging().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.close_notified.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let _ = self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.stall_if_hanging().await;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
