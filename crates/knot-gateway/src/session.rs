//! One connected peer: identity, bounded outbound queue and delivery loop.
//!
//! Writes to the peer happen only inside [`Session::run`] (and once in the
//! close path), never under a registry or group lock. Enqueueing is
//! fail-fast by default: a full queue rejects the payload instead of
//! blocking the caller, so a stalled peer cannot push backpressure into the
//! broadcaster or any other producer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use knot_core::{ConnectionId, SendError, TeamId, TransportError, UserId};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::SessionConfig;
use crate::connection::Connection;
use crate::group::Group;

/// A queued outbound payload and the group it was sent on behalf of.
///
/// The group is held weakly so queued messages never keep a deleted group
/// alive.
#[derive(Debug)]
pub struct Message {
    group: Weak<Group>,
    payload: Bytes,
}

impl Message {
    /// Payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// Why a delivery loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// The session was cancelled (removed, superseded or shut down).
    Cancelled,
    /// A write failed; the session removed itself from its group.
    WriteFailed(TransportError),
    /// A write exceeded the write deadline; the session removed itself.
    WriteTimedOut,
    /// Another caller already owns this session's delivery loop.
    AlreadyRunning,
}

/// One active peer connection plus its identity and outbound queue.
pub struct Session {
    team_id: TeamId,
    user_id: UserId,
    connection: Arc<dyn Connection>,
    tx: mpsc::Sender<Message>,
    /// Taken by the first call to [`Session::run`].
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    cancel: CancellationToken,
    /// Set by the first `close` call; guards the close I/O.
    closing: AtomicBool,
    /// Cancelled once the close I/O has finished.
    closed: CancellationToken,
    dropped_messages: AtomicU64,
    write_timeout: Duration,
    created_at: Instant,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("team_id", &self.team_id)
            .field("user_id", &self.user_id)
            .field("connection_id", self.connection.id())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session around an accepted connection.
    pub fn new(
        team_id: TeamId,
        user_id: UserId,
        connection: Arc<dyn Connection>,
        config: &SessionConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Self {
            team_id,
            user_id,
            connection,
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            closing: AtomicBool::new(false),
            closed: CancellationToken::new(),
            dropped_messages: AtomicU64::new(0),
            write_timeout: config.write_timeout,
            created_at: Instant::now(),
        })
    }

    /// Team this session belongs to.
    pub fn team_id(&self) -> &TeamId {
        &self.team_id
    }

    /// User this session belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Identifier of the owned connection.
    pub fn connection_id(&self) -> &ConnectionId {
        self.connection.id()
    }

    /// Remote peer address, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection.remote_addr()
    }

    /// Enqueue a payload without waiting.
    ///
    /// Returns [`SendError::QueueFull`] when the bounded queue is full and
    /// [`SendError::Closed`] once the session is cancelled or closed. A
    /// rejected payload is not enqueued and is counted as dropped.
    pub fn send(&self, group: &Arc<Group>, payload: Bytes) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        let message = Message {
            group: Arc::downgrade(group),
            payload,
        };
        match self.tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.record_drop();
                Err(SendError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(SendError::Closed),
        }
    }

    /// Enqueue a payload, waiting at most `wait` for queue capacity.
    pub async fn send_timeout(
        &self,
        group: &Arc<Group>,
        payload: Bytes,
        wait: Duration,
    ) -> Result<(), SendError> {
        if self.cancel.is_cancelled() {
            return Err(SendError::Closed);
        }
        let message = Message {
            group: Arc::downgrade(group),
            payload,
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(SendError::Closed),
            result = self.tx.send_timeout(message, wait) => match result {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => {
                    self.record_drop();
                    Err(SendError::QueueFull)
                }
                Err(SendTimeoutError::Closed(_)) => Err(SendError::Closed),
            },
        }
    }

    /// Run the delivery loop until cancellation or the first write failure.
    ///
    /// Messages are written in FIFO order, each bounded by the write
    /// timeout. On failure the session asks the message's group to remove
    /// it and returns; there is no retry. Cancellation ends the loop at once,
    /// mid-write included, without draining the queue.
    #[instrument(skip_all, fields(team_id = %self.team_id, user_id = %self.user_id, conn_id = %self.connection.id()))]
    pub async fn run(self: Arc<Self>) -> SessionExit {
        let Some(mut rx) = self.rx.lock().take() else {
            return SessionExit::AlreadyRunning;
        };
        debug!("delivery loop started");

        loop {
            let message = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return SessionExit::Cancelled,
                next = rx.recv() => match next {
                    Some(message) => message,
                    None => return SessionExit::Cancelled,
                },
            };

            let Message { group, payload } = message;
            let write = tokio::time::timeout(self.write_timeout, self.connection.send(payload));
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return SessionExit::Cancelled,
                outcome = write => outcome,
            };

            let exit = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => SessionExit::WriteFailed(err),
                Err(_) => SessionExit::WriteTimedOut,
            };
            warn!(?exit, "write failed, removing session");
            counter!(crate::metrics::SESSION_WRITE_FAILURES_TOTAL).increment(1);
            self.depart(&group).await;
            return exit;
        }
    }

    /// Request removal from `group`, or just close if the group is gone.
    async fn depart(self: &Arc<Self>, group: &Weak<Group>) {
        if let Some(group) = group.upgrade() {
            let _ = group.remove(self).await;
        } else {
            self.close().await;
        }
    }

    /// Stop the delivery loop without touching the connection.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Close the session: cancel the loop, send a close notification and
    /// close the connection. Each step is best-effort and bounded by the
    /// write timeout. Only the first call performs the I/O.
    pub async fn close(&self) {
        self.cancel.cancel();
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        match tokio::time::timeout(self.write_timeout, self.connection.send_close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(conn_id = %self.connection.id(), error = %err, "close notification failed"),
            Err(_) => debug!(conn_id = %self.connection.id(), "close notification timed out"),
        }
        match tokio::time::timeout(self.write_timeout, self.connection.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(conn_id = %self.connection.id(), error = %err, "connection close failed"),
            Err(_) => debug!(conn_id = %self.connection.id(), "connection close timed out"),
        }

        self.closed.cancel();
        debug!(
            team_id = %self.team_id,
            user_id = %self.user_id,
            conn_id = %self.connection.id(),
            "session closed"
        );
    }

    /// Whether [`Session::close`] has completed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Whether the delivery loop has been told to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolve once [`Session::close`] has completed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Messages currently waiting in the outbound queue.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Payloads rejected because the queue was full.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Time since the session was created.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn record_drop(&self) {
        let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        counter!(crate::metrics::SESSION_MESSAGES_DROPPED_TOTAL).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingConnection;
    use assert_matches::assert_matches;

    const WAIT: Duration = Duration::from_secs(2);

    fn make_session(conn: &Arc<RecordingConnection>) -> Arc<Session> {
        Session::new(
            "t1".into(),
            "u1".into(),
            conn.clone(),
            &SessionConfig {
                queue_capacity: 4,
                write_timeout: Duration::from_millis(200),
            },
        )
    }

    fn group() -> Arc<Group> {
        Arc::new(Group::new("t1".into()))
    }

    #[test]
    fn identity_accessors() {
        let conn = RecordingConnection::new();
        let session = make_session(&conn);
        assert_eq!(session.team_id().as_str(), "t1");
        assert_eq!(session.user_id().as_str(), "u1");
        assert_eq!(session.connection_id(), conn.id());
        assert!(!session.is_closed());
        assert!(!session.is_cancelled());
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let conn = RecordingConnection::new();
        let session = make_session(&conn);
        let g = group();
        let loop_handle = tokio::spawn(session.clone().run());

        for payload in ["A", "B", "C"] {
            session.send(&g, Bytes::from(payload)).unwrap();
        }

        assert!(conn.wait_for_sent(3, WAIT).await);
        assert_eq!(conn.sent(), vec![Bytes::from("A"), Bytes::from("B"), Bytes::from("C")]);

        session.close().await;
        assert_eq!(loop_handle.await.unwrap(), SessionExit::Cancelled);
    }

    #[test]
    fn full_queue_fails_fast() {
        let conn = RecordingConnection::new();
        let session = make_session(&conn);
        let g = group();

        for i in 0..4 {
            session.send(&g, Bytes::from(format!("m{i}"))).unwrap();
        }
        assert_eq!(session.queued(), 4);
        assert_eq!(session.send(&g, Bytes::from("m4")), Err(SendError::QueueFull));
        assert_eq!(session.send(&g, Bytes::from("m5")), Err(SendError::QueueFull));
        assert_eq!(session.dropped_messages(), 2);
        assert_eq!(session.queued(), 4);
    }

    #[tokio::test]
    async fn rejected_payloads_are_not_delivered() {
        let conn = RecordingConnection::new();
        let session = make_session(&conn);
        let g = group();

        for i in 0..6 {
            let _ = session.send(&g, Bytes::from(format!("m{i}")));
        }
        let _loop = tokio::spawn(session.clone().run());

        assert!(conn.wait_for_sent(4, WAIT).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let sent = conn.sent();
        assert_eq!(
            sent,
            vec![
                Bytes::from("m0"),
                Bytes::from("m1"),
                Bytes::from("m2"),
                Bytes::from("m3")
            ]
        );
        session.close().await;
    }

    #[tokio::test]
    async fn send_timeout_waits_for_capacity() {
        let conn = RecordingConnection::new();
        let session = make_session(&conn);
        let g = group();
        for i in 0..4 {
            session.send(&g, Bytes::from(format!("m{i}"))).unwrap();
        }

        let result = session
            .send_timeout(&g, Bytes::from("late"), Duration::from_millis(30))
            .await;
        assert_eq!(result, Err(SendError::QueueFull));
        assert_eq!(session.dropped_messages(), 1);

        let _loop = tokio::spawn(session.clone().run());
        let result = session
            .send_timeout(&g, Bytes::from("m4"), Duration::from_secs(1))
            .await;
        assert_eq!(result, Ok(()));
        assert!(conn.wait_for_sent(5, WAIT).await);
        session.close().await;
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let conn = RecordingConnection::new();
        let session = make_session(&conn);
        let g = group();
        session.close().await;

        assert_eq!(session.send(&g, Bytes::from("x")), Err(SendError::Closed));
        let result = session
            .send_timeout(&g, Bytes::from("x"), Duration::from_millis(10))
            .await;
        assert_eq!(result, Err(SendError::Closed));
    }

    #[tokio::test]
    async fn cancel_stops_loop_without_draining() {
        let conn = RecordingConnection::new();
        conn.set_hanging(true);
        let session = make_session(&conn);
        let g = group();
        for i in 0..3 {
            session.send(&g, Bytes::from(format!("m{i}"))).unwrap();
        }

        let handle = tokio::spawn(session.clone().run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.cancel();

        let exit = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(exit, SessionExit::Cancelled);
        assert!(conn.sent().is_empty());
    }

    #[tokio::test]
    async fn write_failure_removes_from_group() {
        let conn = RecordingConnection::new();
        conn.fail_writes(true);
        let session = make_session(&conn);
        let g = group();
        assert!(g.add(session.clone()).await.is_none());

        session.send(&g, Bytes::from("boom")).unwrap();
        let exit = tokio::time::timeout(WAIT, session.clone().run()).await.unwrap();

        assert_matches!(exit, SessionExit::WriteFailed(TransportError::Io(_)));
        assert_eq!(g.count(), 0);
        assert!(session.is_closed());
        assert!(conn.is_closed());
        assert!(conn.close_notified());
    }

    #[tokio::test]
    async fn write_deadline_removes_from_group() {
        let conn = RecordingConnection::new();
        conn.set_hanging(true);
        let session = make_session(&conn);
        let g = group();
        let _ = g.add(session.clone()).await;

        session.send(&g, Bytes::from("stuck")).unwrap();
        let exit = tokio::time::timeout(WAIT, session.clone().run()).await.unwrap();

        assert_eq!(exit, SessionExit::WriteTimedOut);
        assert_eq!(g.count(), 0);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn write_failure_with_dropped_group_still_closes() {
        let conn = RecordingConnection::new();
        conn.fail_writes(true);
        let session = make_session(&conn);
        {
            let g = group();
            session.send(&g, Bytes::from("orphan")).unwrap();
        }
        let exit = session.clone().run().await;
        assert_matches!(exit, SessionExit::WriteFailed(_));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn run_twice_reports_already_running() {
        let conn = RecordingConnection::new();
        let session = make_session(&conn);
        let _first = tokio::spawn(session.clone().run());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.clone().run().await, SessionExit::AlreadyRunning);
        session.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let conn = RecordingConnection::new();
        let session = make_session(&conn);
        tokio::join!(session.close(), session.close(), session.close());
        session.close().await;
        assert!(session.is_closed());
        assert_eq!(conn.close_calls(), 1);
    }

    #[tokio::test]
    async fn close_is_bounded_on_hanging_connection() {
        let conn = RecordingConnection::new();
        conn.set_hanging(true);
        let session = make_session(&conn);
        let started = Instant::now();
        session.close().await;
        assert!(session.is_closed());
        // send_close and close each bounded by the 200ms write timeout
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
