//! The [`Target`] facade: one connection to an implementation under test.
//!
//! A target owns a [`Connector`], the [`RxBuffer`] its traffic lands in, and
//! the [`ReceiverLoop`] feeding that buffer. Scenario code sends through the
//! target and asserts on what came back with `find*` and `wait*`.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tdriver_core::connector::Connector;
use tdriver_core::error::{Error, Result};
use tdriver_core::logger::{NoteLevel, TrafficLogger};
use tdriver_core::state::{ConnectionState, SharedState};
use tdriver_rx::{MatchResult, ReceiverLoop, RxBuffer};

use crate::builder::TargetConfig;

/// A connection to one implementation under test.
///
/// Build one with [`TargetBuilder`](crate::TargetBuilder). All methods take
/// `&self`, so a started target can be shared between tasks in an `Arc`.
///
/// A target is single-use: once it is `Closed` or `Failed` it stays that
/// way, and reconnecting needs a new target.
pub struct Target {
    config: TargetConfig,
    connector: Arc<dyn Connector>,
    buffer: Arc<RxBuffer>,
    state: SharedState,
    receiver: Mutex<Option<ReceiverLoop>>,
    // Serializes sends. The connector close in `stop()` bypasses it.
    send_lock: Mutex<()>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.config.name)
            .field("peer", &self.connector.peer())
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl Target {
    pub(crate) fn new(
        config: TargetConfig,
        connector: Arc<dyn Connector>,
        logger: Arc<dyn TrafficLogger>,
    ) -> Self {
        let buffer = RxBuffer::new(config.name.clone(), logger).with_split_lines(config.split_lines);
        Self {
            config,
            connector,
            buffer: Arc::new(buffer),
            state: SharedState::new(),
            receiver: Mutex::new(None),
            send_lock: Mutex::new(()),
        }
    }

    /// Target name used in the traffic log.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The configuration this target was built with.
    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// Human-readable description of the peer (address or port name).
    pub fn peer(&self) -> String {
        self.connector.peer()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Open the connector and start the receiver task.
    ///
    /// On failure the target moves to [`Failed`](ConnectionState::Failed)
    /// and the connector error is returned. Calling `start` on a target that
    /// is not idle returns [`Error::InvalidState`].
    pub async fn start(&self) -> Result<()> {
        self.state
            .compare_and_set(ConnectionState::Idle, ConnectionState::Connecting)
            .map_err(|state| Error::InvalidState {
                operation: "start",
                state,
            })?;

        let peer = self.connector.peer();
        info!(target_name = %self.config.name, peer = %peer, "connecting");

        if let Err(e) = self.connector.connect().await {
            warn!(target_name = %self.config.name, peer = %peer, error = %e, "connect failed");
            self.state.transition(ConnectionState::Failed);
            self.buffer.note(NoteLevel::Error, &format!("failed to connect: {e}"));
            self.buffer.close();
            return Err(e);
        }

        self.state.transition(ConnectionState::Connected);
        self.buffer.note(NoteLevel::Info, "start receiver");
        let receiver = ReceiverLoop::spawn(
            self.connector.clone(),
            self.buffer.clone(),
            self.state.clone(),
        );
        *self.receiver.lock().await = Some(receiver);

        info!(target_name = %self.config.name, peer = %peer, "connected");
        Ok(())
    }

    /// Stop the receiver, close the connector and wait for the receiver
    /// task to finish, at most the configured join timeout.
    ///
    /// Afterwards the state is `Closed`, unless it was already `Failed`.
    /// Calling `stop` again does nothing.
    pub async fn stop(&self) -> Result<()> {
        let receiver = self.receiver.lock().await.take();

        let Some(mut receiver) = receiver else {
            if !self.state.get().is_terminal() {
                self.state.transition(ConnectionState::Closed);
                self.buffer.close();
                return self.connector.close().await;
            }
            return Ok(());
        };

        debug!(target_name = %self.config.name, "stopping");
        receiver.request_stop();
        // Not under the send lock: closing must abort a send stuck on a
        // peer that stopped reading, not queue behind it.
        let closed = match tokio::time::timeout(self.config.join_timeout, self.connector.close()).await {
            Ok(closed) => closed,
            Err(_) => {
                warn!(target_name = %self.config.name, "connector close did not finish in time");
                Err(Error::Transport("connector close timed out".into()))
            }
        };
        if let Some(exit) = receiver.join(self.config.join_timeout).await {
            debug!(target_name = %self.config.name, exit = %exit, "receiver joined");
        }

        self.state.transition(ConnectionState::Closed);
        self.buffer.close();
        info!(target_name = %self.config.name, state = %self.state.get(), "stopped");
        closed
    }

    /// Start, run `scenario`, and stop, whatever the scenario does.
    ///
    /// `stop()` runs exactly once on every exit path: success, error, and
    /// panic. A panic in the scenario is resumed after the target is torn
    /// down. If `start()` fails the scenario is not run and the start error
    /// is returned.
    pub async fn scoped<F, Fut, T, E>(self, scenario: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Arc<Target>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<Error> + Send + 'static,
    {
        let target = Arc::new(self);
        if let Err(e) = target.start().await {
            let _ = target.stop().await;
            return Err(e.into());
        }

        let outcome = tokio::spawn(scenario(target.clone())).await;
        let stopped = target.stop().await;

        match outcome {
            Ok(result) => {
                let value = result?;
                stopped?;
                Ok(value)
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(Error::Transport(format!("scenario task: {e}")).into()),
        }
    }

    // -----------------------------------------------------------------------
    // Transmission
    // -----------------------------------------------------------------------

    /// Log `data` as outbound traffic and write it to the connector.
    ///
    /// Fails with [`Error::InvalidState`] before `start()`, and with
    /// [`Error::Disconnected`] once the target is closed or failed. A write
    /// error moves the target to `Failed`. A write still blocked when
    /// `stop()` runs is aborted and returns `Disconnected`.
    pub async fn send(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        let _send = self.send_lock.lock().await;

        match self.state.get() {
            state @ (ConnectionState::Idle | ConnectionState::Connecting) => {
                return Err(Error::InvalidState {
                    operation: "send",
                    state,
                });
            }
            state @ (ConnectionState::Closed | ConnectionState::Failed) => {
                return Err(Error::Disconnected(state));
            }
            ConnectionState::Connected => {}
        }

        self.buffer.record_outbound(data);
        if let Err(e) = self.connector.send(data).await {
            warn!(target_name = %self.config.name, error = %e, "send failed");
            // Disconnected means the connector was closed under us by
            // `stop()`, which records the final state itself.
            if !matches!(e, Error::Disconnected(_)) {
                self.state.transition(ConnectionState::Failed);
            }
            self.buffer.note(NoteLevel::Error, &format!("failed to send: {e}"));
            return Err(e);
        }
        debug!(target_name = %self.config.name, bytes = data.len(), "sent");
        Ok(())
    }

    /// Send `text` as UTF-8.
    pub async fn send_str(&self, text: &str) -> Result<()> {
        self.send(text.as_bytes()).await
    }

    // -----------------------------------------------------------------------
    // Receive buffer
    // -----------------------------------------------------------------------

    /// Whether `pattern` occurs in the received data.
    pub fn find(&self, pattern: impl AsRef<[u8]>) -> bool {
        self.buffer.find(pattern)
    }

    /// The first of `patterns`, in the order given, that occurs in the
    /// received data.
    pub fn find_multi<'p, P: AsRef<[u8]>>(&self, patterns: &'p [P]) -> Option<&'p P> {
        self.buffer.find_multi(patterns)
    }

    /// Whether at least `nth` received chunks contain `pattern`.
    pub fn find_nth(&self, pattern: impl AsRef<[u8]>, nth: usize) -> Result<bool> {
        check_nth(nth)?;
        Ok(self.buffer.find_nth(pattern, nth))
    }

    /// Wait up to `timeout` for `pattern` to be received.
    ///
    /// Returns `false` on timeout, or early once the connection has ended
    /// without the pattern showing up.
    pub async fn wait(&self, pattern: impl AsRef<[u8]>, timeout: Duration) -> bool {
        self.flush_if_configured();
        self.buffer.wait(pattern, timeout).await
    }

    /// Wait for any of `patterns`; returns the first in the order given.
    pub async fn wait_multi<'p, P: AsRef<[u8]>>(
        &self,
        patterns: &'p [P],
        timeout: Duration,
    ) -> Option<&'p P> {
        self.flush_if_configured();
        self.buffer.wait_multi(patterns, timeout).await
    }

    /// Wait until at least `nth` received chunks contain `pattern`.
    pub async fn wait_nth(
        &self,
        pattern: impl AsRef<[u8]>,
        nth: usize,
        timeout: Duration,
    ) -> Result<bool> {
        check_nth(nth)?;
        self.flush_if_configured();
        Ok(self.buffer.wait_nth(pattern, nth, timeout).await)
    }

    /// Wait until anything at all is received after this call starts.
    pub async fn wait_any(&self, timeout: Duration) -> bool {
        self.flush_if_configured();
        self.buffer.wait_any(timeout).await
    }

    /// Discard all received data. The last match is kept.
    pub fn flush_rx(&self) {
        self.buffer.flush();
    }

    /// Everything received since the last flush.
    pub fn contents(&self) -> Bytes {
        self.buffer.contents()
    }

    /// Received chunks since the last flush, oldest first.
    pub fn chunks(&self) -> Vec<Bytes> {
        self.buffer.chunks()
    }

    /// The most recent successful find or wait.
    pub fn last_match(&self) -> Option<MatchResult> {
        self.buffer.last_match()
    }

    /// Write a scenario message into the traffic log, tagged with this
    /// target's name.
    pub fn log(&self, message: &str) {
        self.log_at(NoteLevel::Info, message);
    }

    /// Like [`log`](Self::log), at an explicit level. `Error` entries are
    /// tagged `ER`.
    pub fn log_at(&self, level: NoteLevel, message: &str) {
        self.buffer.note(level, message);
    }

    /// Sleep for `duration`. Received data keeps accumulating meanwhile.
    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn flush_if_configured(&self) {
        if self.config.flush_before_wait {
            self.buffer.flush();
        }
    }
}

fn check_nth(nth: usize) -> Result<()> {
    if nth == 0 {
        return Err(Error::InvalidParameter("occurrence count starts at 1".into()));
    }
    Ok(())
}

impl Drop for Target {
    fn drop(&mut self) {
        // Dropping the receiver handle cancels its task.
        let Some(receiver) = self.receiver.get_mut().take() else {
            return;
        };
        drop(receiver);
        debug!(target_name = %self.config.name, "dropped while running");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let connector = self.connector.clone();
            handle.spawn(async move {
                let _ = connector.close().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TargetBuilder;
    use tdriver_test_harness::{MockConnector, MockPeer};

    fn target() -> (Target, MockPeer) {
        let (connector, peer) = MockConnector::new();
        let target = TargetBuilder::new("iut")
            .join_timeout(Duration::from_secs(1))
            .build_with_connector(Arc::new(connector))
            .unwrap();
        (target, peer)
    }

    // =======================================================================
    // Lifecycle
    // =======================================================================

    #[tokio::test]
    async fn start_and_stop() {
        let (target, peer) = target();
        assert_eq!(target.state(), ConnectionState::Idle);

        target.start().await.unwrap();
        assert_eq!(target.state(), ConnectionState::Connected);
        assert_eq!(peer.connect_calls(), 1);

        target.stop().await.unwrap();
        assert_eq!(target.state(), ConnectionState::Closed);
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn start_twice_is_invalid() {
        let (target, _peer) = target();
        target.start().await.unwrap();

        let err = target.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                operation: "start",
                state: ConnectionState::Connected
            }
        ));
        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_connect() {
        let (connector, peer) = MockConnector::refusing("connection refused");
        let target = TargetBuilder::new("iut")
            .build_with_connector(Arc::new(connector))
            .unwrap();

        let err = target.start().await.unwrap_err();
        assert!(matches!(err, Error::Connect(_)));
        assert_eq!(target.state(), ConnectionState::Failed);

        // Stop leaves Failed alone.
        target.stop().await.unwrap();
        assert_eq!(target.state(), ConnectionState::Failed);
        assert_eq!(peer.connect_calls(), 1);
        // Waits return at once instead of running into their timeout.
        assert!(!target.wait("x", Duration::from_secs(10)).await);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (target, peer) = target();
        target.start().await.unwrap();

        target.stop().await.unwrap();
        target.stop().await.unwrap();
        assert_eq!(target.state(), ConnectionState::Closed);
        assert_eq!(peer.close_calls(), 1);
    }

    #[tokio::test]
    async fn stop_before_start_closes() {
        let (target, _peer) = target();
        target.stop().await.unwrap();
        assert_eq!(target.state(), ConnectionState::Closed);
        assert!(matches!(
            target.start().await,
            Err(Error::InvalidState { state: ConnectionState::Closed, .. })
        ));
    }

    #[tokio::test]
    async fn peer_hang_up_closes_target() {
        let (target, peer) = target();
        target.start().await.unwrap();

        peer.hang_up();
        assert!(!target.wait("anything", Duration::from_secs(5)).await);
        assert_eq!(target.state(), ConnectionState::Closed);

        let err = target.send_str("hello?").await.unwrap_err();
        assert!(matches!(err, Error::Disconnected(ConnectionState::Closed)));
        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn receive_failure_fails_target() {
        let (target, peer) = target();
        target.start().await.unwrap();

        peer.fail("parity error");
        assert!(!target.wait("anything", Duration::from_secs(5)).await);
        assert_eq!(target.state(), ConnectionState::Failed);

        target.stop().await.unwrap();
        assert_eq!(target.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn drop_while_running_closes_connector() {
        let (target, peer) = target();
        target.start().await.unwrap();
        drop(target);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !peer.is_closed() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(peer.is_closed());
    }

    // =======================================================================
    // Transmission
    // =======================================================================

    #[tokio::test]
    async fn send_before_start_is_invalid() {
        let (target, peer) = target();
        let err = target.send(b"x").await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                operation: "send",
                state: ConnectionState::Idle
            }
        ));
        assert!(peer.sent().is_empty());
    }

    #[tokio::test]
    async fn send_reaches_peer() {
        let (target, peer) = target();
        target.start().await.unwrap();

        target.send(b"AT\r").await.unwrap();
        target.send_str("ATZ\r").await.unwrap();
        assert_eq!(peer.sent_text(), "AT\rATZ\r");

        target.stop().await.unwrap();
        let err = target.send_str("late").await.unwrap_err();
        assert!(matches!(err, Error::Disconnected(ConnectionState::Closed)));
    }

    #[tokio::test]
    async fn send_after_peer_gone_fails_target() {
        let (target, peer) = target();
        target.start().await.unwrap();

        // Break the send side without the receive side noticing yet.
        peer.hang_up();
        let result = target.send_str("ping").await;
        if let Err(e) = result {
            assert!(e.is_connection_lost());
        }
        assert!(matches!(
            target.state(),
            ConnectionState::Closed | ConnectionState::Failed
        ));
        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_sends_are_not_interleaved() {
        let (target, peer) = target();
        let target = Arc::new(target);
        target.start().await.unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let target = target.clone();
                tokio::spawn(async move { target.send_str(&format!("msg{i};")).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let sent = peer.sent();
        assert_eq!(sent.len(), 10);
        assert!(sent.iter().all(|s| s.starts_with(b"msg") && s.ends_with(b";")));
        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn scenario_messages_reach_traffic_log() {
        use tdriver_core::logger::WriterLogger;

        let (connector, _peer) = MockConnector::new();
        let logger = Arc::new(WriterLogger::new(Vec::new()));
        let target = TargetBuilder::new("iut")
            .logger(logger.clone())
            .build_with_connector(Arc::new(connector))
            .unwrap();

        target.log("=== Step 1 ===");
        target.log_at(NoteLevel::Error, "unexpected banner");
        drop(target);

        let text = String::from_utf8(Arc::try_unwrap(logger).unwrap().into_inner()).unwrap();
        assert_eq!(text, "--:iut:=== Step 1 ===\nER:iut:unexpected banner\n");
    }

    // =======================================================================
    // Receive buffer
    // =======================================================================

    #[tokio::test]
    async fn request_response() {
        let (target, peer) = target();
        target.start().await.unwrap();

        target.send_str("GET / HTTP/1.1\r\n\r\n").await.unwrap();
        peer.deliver("HTTP/1.1 200 OK\r\n\r\n<html>");
        peer.deliver("</html>");

        assert!(target.wait("</html>", Duration::from_secs(2)).await);
        assert!(target.find("200 OK"));
        assert_eq!(target.last_match().unwrap().found_text(), "HTTP/1.1 200 OK\r\n\r\n<html>");
        assert_eq!(target.chunks().len(), 2);

        target.flush_rx();
        assert!(!target.find("200 OK"));
        assert!(target.contents().is_empty());
        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn nth_lookups() {
        let (target, peer) = target();
        target.start().await.unwrap();

        peer.deliver("OK");
        peer.deliver("OK");
        assert!(target.wait_nth("OK", 2, Duration::from_secs(2)).await.unwrap());
        assert!(target.find_nth("OK", 1).unwrap());
        assert!(!target.find_nth("OK", 3).unwrap());
        assert!(matches!(target.find_nth("OK", 0), Err(Error::InvalidParameter(_))));
        assert!(matches!(
            target.wait_nth("OK", 0, Duration::from_millis(10)).await,
            Err(Error::InvalidParameter(_))
        ));
        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn multi_pattern_lookups() {
        let (target, peer) = target();
        target.start().await.unwrap();

        peer.deliver("NO CARRIER\r\n");
        let outcomes = ["CONNECT", "BUSY", "NO CARRIER"];
        assert_eq!(
            target.wait_multi(&outcomes, Duration::from_secs(2)).await,
            Some(&"NO CARRIER")
        );
        assert_eq!(target.find_multi(&outcomes), Some(&"NO CARRIER"));
        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn flush_before_wait_ignores_earlier_data() {
        let (connector, peer) = MockConnector::new();
        let target = TargetBuilder::new("iut")
            .flush_before_wait(true)
            .build_with_connector(Arc::new(connector))
            .unwrap();
        target.start().await.unwrap();

        peer.deliver("READY");
        assert!(target.wait("READY", Duration::from_secs(2)).await);

        // The old READY is flushed, so this wait needs a fresh one.
        assert!(!target.wait("READY", Duration::from_millis(100)).await);

        let target = Arc::new(target);
        let waiter = {
            let target = target.clone();
            tokio::spawn(async move { target.wait("READY", Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        peer.deliver("READY");
        assert!(waiter.await.unwrap());
        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn split_lines_target() {
        let (connector, peer) = MockConnector::new();
        let target = TargetBuilder::new("iut")
            .split_lines(true)
            .build_with_connector(Arc::new(connector))
            .unwrap();
        target.start().await.unwrap();

        peer.deliver("+CSQ: 20\r\nOK\r\n");
        assert!(target.wait("OK\r\n", Duration::from_secs(2)).await);
        assert_eq!(target.chunks().len(), 2);
        assert_eq!(target.last_match().unwrap().found(), b"OK\r\n");
        target.stop().await.unwrap();
    }

    #[tokio::test]
    async fn wait_any_sees_only_new_data() {
        let (target, peer) = target();
        target.start().await.unwrap();

        peer.deliver("banner");
        assert!(target.wait("banner", Duration::from_secs(2)).await);
        assert!(!target.wait_any(Duration::from_millis(100)).await);

        let target = Arc::new(target);
        let waiter = {
            let target = target.clone();
            tokio::spawn(async move { target.wait_any(Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        peer.deliver("event");
        assert!(waiter.await.unwrap());
        target.stop().await.unwrap();
    }

    // =======================================================================
    // Scoped acquisition
    // =======================================================================

    #[tokio::test]
    async fn scoped_returns_scenario_value() {
        let (target, peer) = target();
        let scenario_peer = peer.clone();

        let value = target
            .scoped(|t| async move {
                t.send_str("PING").await?;
                scenario_peer.deliver("PONG");
                Ok::<_, Error>(t.wait("PONG", Duration::from_secs(2)).await)
            })
            .await
            .unwrap();

        assert!(value);
        assert!(peer.is_closed());
        assert_eq!(peer.close_calls(), 1);
    }

    #[tokio::test]
    async fn scoped_stops_on_error() {
        let (target, peer) = target();

        let result: Result<()> = target
            .scoped(|_t| async move { Err(Error::InvalidParameter("bad scenario".into())) })
            .await;

        assert!(matches!(result, Err(Error::InvalidParameter(_))));
        assert!(peer.is_closed());
        assert_eq!(peer.close_calls(), 1);
    }

    #[tokio::test]
    async fn scoped_stops_on_panic() {
        let (target, peer) = target();

        let handle = tokio::spawn(async move {
            target
                .scoped(|_t| async move {
                    if true {
                        panic!("scenario blew up");
                    }
                    Ok::<(), Error>(())
                })
                .await
        });

        let err = handle.await.unwrap_err();
        assert!(err.is_panic());
        assert!(peer.is_closed());
        assert_eq!(peer.close_calls(), 1);
    }

    #[tokio::test]
    async fn scoped_start_failure_skips_scenario() {
        let (connector, _peer) = MockConnector::refusing("no route");
        let target = TargetBuilder::new("iut")
            .build_with_connector(Arc::new(connector))
            .unwrap();

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = ran.clone();
        let result = target
            .scoped(|_t| async move {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<(), Error>(())
            })
            .await;

        assert!(matches!(result, Err(Error::Connect(_))));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }
}
