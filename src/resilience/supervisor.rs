//! Reconnect/backoff/heartbeat supervision of long-lived connections
//!
//! The supervisor owns the connection lifecycle for socket-style adapters:
//!
//! ```text
//!   Connecting ──dial ok──▶ Connected ──read error / reconnect──▶ Backoff
//!       ▲                                                          │
//!       └────────────────────── delay elapsed ◀────────────────────┘
//! ```
//!
//! Platform specifics live behind [`Dialer`] (how to connect),
//! [`FrameConnection`] (how to read and decode one frame) and
//! [`Heartbeat`] (how to send a keepalive). Cancellation is checked at every
//! suspension point and always ends in [`ConnectionState::Disconnected`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a supervised connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

/// What the read loop learned from one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Frame was handled (or ignored) by the platform decoder
    Frame,
    /// Server supplied the keepalive interval for this connection
    HeartbeatInterval(Duration),
    /// Server asked the client to reconnect
    Reconnect,
    /// Server closed the connection
    Closed,
}

/// Establishes a new connection
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect; an [`Error::Config`] result stops the supervisor.
    async fn dial(&self) -> Result<Box<dyn FrameConnection>>;
}

/// One established connection
#[async_trait]
pub trait FrameConnection: Send {
    /// Read and decode the next frame
    async fn next_event(&mut self) -> Result<LinkEvent>;

    /// Keepalive sender for this connection, if the platform uses one
    fn heartbeat(&self) -> Option<Arc<dyn Heartbeat>> {
        None
    }
}

/// Sends one keepalive on the current connection
#[async_trait]
pub trait Heartbeat: Send + Sync {
    async fn beat(&self) -> Result<()>;
}

/// Longest reconnect delay accepted (seconds)
pub const MAX_RECONNECT_DELAY_SECS: f64 = 86_400.0;

/// Delay schedule between connection attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry (seconds)
    pub initial_delay_secs: f64,
    /// Upper bound on the delay (seconds)
    pub max_delay_secs: f64,
    /// Growth factor applied after each failed attempt (1 = fixed delay)
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_secs: 2.0,
            max_delay_secs: 60.0,
            multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Fixed delay between every attempt
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay_secs: delay.as_secs_f64(),
            max_delay_secs: delay.as_secs_f64(),
            multiplier: 1,
        }
    }

    fn initial_delay(&self) -> Duration {
        delay_from_secs(self.initial_delay_secs)
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let max = delay_from_secs(self.max_delay_secs.max(self.initial_delay_secs));
        current.saturating_mul(self.multiplier.max(1)).min(max)
    }
}

fn delay_from_secs(secs: f64) -> Duration {
    let secs = secs.max(0.0).min(MAX_RECONNECT_DELAY_SECS);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs(MAX_RECONNECT_DELAY_SECS as u64))
}

enum Ended {
    Cancelled,
    Dropped(String),
}

/// Drives a [`Dialer`] through the connection state machine.
pub struct ConnectionSupervisor {
    name: String,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
}

impl ConnectionSupervisor {
    /// Create a supervisor; `name` identifies the channel in logs
    pub fn new(name: &str, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(64);
        Self {
            name: name.to_string(),
            policy,
            state,
            transitions,
        }
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch the current state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every state change, in order
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        tracing::debug!(channel = %self.name, state = ?next, "Connection state");
        self.state.send_replace(next);
        let _ = self.transitions.send(next);
    }

    /// Run until `cancel` fires (`Ok`) or the dialer reports a fatal error.
    pub async fn run(&self, dialer: &dyn Dialer, cancel: &CancellationToken) -> Result<()> {
        let mut delay = self.policy.initial_delay();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            let dialed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                dialed = dialer.dial() => dialed,
            };

            match dialed {
                Ok(conn) => {
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(channel = %self.name, "Connected");
                    delay = self.policy.initial_delay();

                    match self.drive(conn, cancel).await {
                        Ended::Cancelled => break,
                        Ended::Dropped(reason) => {
                            tracing::warn!(channel = %self.name, "Connection dropped: {}", reason);
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(channel = %self.name, "Cannot connect: {}", e);
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(channel = %self.name, "Dial failed: {}", e);
                }
            }

            self.set_state(ConnectionState::Backoff);
            tracing::info!(
                channel = %self.name,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after delay"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.policy.next_delay(delay);
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!(channel = %self.name, "Connection supervisor stopped");
        Ok(())
    }

    /// Read loop for one connection. The heartbeat task is stopped and
    /// joined before this returns.
    async fn drive(&self, mut conn: Box<dyn FrameConnection>, cancel: &CancellationToken) -> Ended {
        let link = cancel.child_token();
        let mut heartbeat: Option<JoinHandle<()>> = None;

        let ended = loop {
            if cancel.is_cancelled() {
                break Ended::Cancelled;
            }

            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ended::Cancelled,
                _ = link.cancelled() => break Ended::Dropped("heartbeat failed".to_string()),
                event = conn.next_event() => event,
            };

            match event {
                Ok(LinkEvent::Frame) => {}
                Ok(LinkEvent::HeartbeatInterval(interval)) => {
                    if let Some(previous) = heartbeat.take() {
                        previous.abort();
                    }
                    match conn.heartbeat() {
                        Some(beat) => {
                            heartbeat = Some(spawn_heartbeat(&self.name, beat, interval, link.clone()));
                        }
                        None => {
                            tracing::debug!(channel = %self.name, "Heartbeat interval ignored: no sender");
                        }
                    }
                }
                Ok(LinkEvent::Reconnect) => break Ended::Dropped("server requested reconnect".to_string()),
                Ok(LinkEvent::Closed) => break Ended::Dropped("closed by server".to_string()),
                Err(e) => break Ended::Dropped(e.to_string()),
            }
        };

        link.cancel();
        if let Some(handle) = heartbeat {
            let _ = handle.await;
        }
        ended
    }
}

fn spawn_heartbeat(
    name: &str,
    beat: Arc<dyn Heartbeat>,
    interval: Duration,
    link: CancellationToken,
) -> JoinHandle<()> {
    let name = name.to_string();
    let interval = interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = link.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = beat.beat().await {
                tracing::warn!(channel = %name, "Heartbeat failed: {}", e);
                link.cancel();
                break;
            }
        }
    })
}

/// Map a dial error to the supervisor's classification
pub fn dial_error(e: Error) -> Error {
    match e {
        Error::Config(_) => e,
        Error::Auth(msg) => Error::Config(format!("credentials rejected: {}", msg)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    /// Connection that replays a script of events, then stays idle
    struct ScriptedConnection {
        script: VecDeque<Result<LinkEvent>>,
        beats: Arc<AtomicUsize>,
        fail_beats: bool,
    }

    #[async_trait]
    impl FrameConnection for ScriptedConnection {
        async fn next_event(&mut self) -> Result<LinkEvent> {
            match self.script.pop_front() {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        fn heartbeat(&self) -> Option<Arc<dyn Heartbeat>> {
            Some(Arc::new(CountingBeat {
                beats: self.beats.clone(),
                fail: self.fail_beats,
            }))
        }
    }

    struct CountingBeat {
        beats: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Heartbeat for CountingBeat {
        async fn beat(&self) -> Result<()> {
            self.beats.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Transport("broken pipe".to_string()));
            }
            Ok(())
        }
    }

    /// Dialer failing a fixed number of times, then handing out scripted connections
    struct ScriptedDialer {
        failures: AtomicUsize,
        dials: AtomicUsize,
        dial_times: Mutex<Vec<Instant>>,
        scripts: Mutex<VecDeque<Vec<Result<LinkEvent>>>>,
        beats: Arc<AtomicUsize>,
        fail_beats: bool,
        fatal: bool,
    }

    impl ScriptedDialer {
        fn new(failures: usize, scripts: Vec<Vec<Result<LinkEvent>>>) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                dials: AtomicUsize::new(0),
                dial_times: Mutex::new(Vec::new()),
                scripts: Mutex::new(scripts.into()),
                beats: Arc::new(AtomicUsize::new(0)),
                fail_beats: false,
                fatal: false,
            }
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self) -> Result<Box<dyn FrameConnection>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.dial_times.lock().await.push(Instant::now());
            if self.fatal {
                return Err(Error::Config("no token".to_string()));
            }
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::Transport("connection refused".to_string()));
            }
            let script = self.scripts.lock().await.pop_front().unwrap_or_default();
            Ok(Box::new(ScriptedConnection {
                script: script.into(),
                beats: self.beats.clone(),
                fail_beats: self.fail_beats,
            }))
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state);
        }
        seen
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
        while *rx.borrow_and_update() != target {
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_connects() {
        use ConnectionState::*;

        let supervisor = Arc::new(ConnectionSupervisor::new(
            "test",
            ReconnectPolicy::fixed(Duration::from_secs(3)),
        ));
        let dialer = Arc::new(ScriptedDialer::new(2, vec![]));
        let cancel = CancellationToken::new();
        let mut transitions = supervisor.transitions();
        let mut state = supervisor.watch_state();

        let task = {
            let supervisor = supervisor.clone();
            let dialer = dialer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.run(dialer.as_ref(), &cancel).await })
        };

        wait_for(&mut state, Connected).await;
        assert_eq!(
            drain(&mut transitions),
            vec![Connecting, Backoff, Connecting, Backoff, Connecting, Connected]
        );

        let times = dialer.dial_times.lock().await.clone();
        assert_eq!(times.len(), 3);
        assert!(times[1] - times[0] >= Duration::from_secs(3));
        assert!(times[2] - times[1] >= Duration::from_secs(3));

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(drain(&mut transitions), vec![Disconnected]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_exits_immediately() {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            "test",
            ReconnectPolicy::fixed(Duration::from_secs(3600)),
        ));
        let dialer = Arc::new(ScriptedDialer::new(usize::MAX, vec![]));
        let cancel = CancellationToken::new();
        let mut state = supervisor.watch_state();

        let task = {
            let supervisor = supervisor.clone();
            let dialer = dialer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.run(dialer.as_ref(), &cancel).await })
        };

        wait_for(&mut state, ConnectionState::Backoff).await;
        let before = Instant::now();
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_reconnect_signal_redials() {
        use ConnectionState::*;

        let supervisor = Arc::new(ConnectionSupervisor::new(
            "test",
            ReconnectPolicy::fixed(Duration::from_secs(1)),
        ));
        let dialer = Arc::new(ScriptedDialer::new(
            0,
            vec![vec![Ok(LinkEvent::Frame), Ok(LinkEvent::Reconnect)], vec![]],
        ));
        let cancel = CancellationToken::new();
        let mut transitions = supervisor.transitions();

        let task = {
            let supervisor = supervisor.clone();
            let dialer = dialer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.run(dialer.as_ref(), &cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(
            drain(&mut transitions),
            vec![Connecting, Connected, Backoff, Connecting, Connected, Disconnected]
        );
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ticks_until_connection_drops() {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            "test",
            ReconnectPolicy::fixed(Duration::from_secs(3600)),
        ));
        let dialer = Arc::new(ScriptedDialer::new(
            0,
            vec![vec![Ok(LinkEvent::HeartbeatInterval(Duration::from_secs(10)))]],
        ));
        let cancel = CancellationToken::new();
        let mut state = supervisor.watch_state();

        let task = {
            let supervisor = supervisor.clone();
            let dialer = dialer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.run(dialer.as_ref(), &cancel).await })
        };

        wait_for(&mut state, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(dialer.beats.load(Ordering::SeqCst), 3);

        cancel.cancel();
        task.await.unwrap().unwrap();

        // No ticks once the connection is gone
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dialer.beats.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_heartbeat_drops_connection() {
        use ConnectionState::*;

        let supervisor = Arc::new(ConnectionSupervisor::new(
            "test",
            ReconnectPolicy::fixed(Duration::from_secs(3600)),
        ));
        let mut dialer = ScriptedDialer::new(
            0,
            vec![vec![Ok(LinkEvent::HeartbeatInterval(Duration::from_secs(5)))]],
        );
        dialer.fail_beats = true;
        let dialer = Arc::new(dialer);
        let cancel = CancellationToken::new();
        let mut transitions = supervisor.transitions();
        let mut state = supervisor.watch_state();

        let task = {
            let supervisor = supervisor.clone();
            let dialer = dialer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.run(dialer.as_ref(), &cancel).await })
        };

        wait_for(&mut state, Backoff).await;
        assert_eq!(dialer.beats.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(
            drain(&mut transitions),
            vec![Connecting, Connected, Backoff, Disconnected]
        );
    }

    /// Dialer whose connections record dials and beats in one shared log
    struct LoggingDialer {
        log: Arc<std::sync::Mutex<Vec<String>>>,
        dials: AtomicUsize,
    }

    struct LoggingConnection {
        id: usize,
        reads: usize,
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    struct LoggingBeat {
        id: usize,
        log: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Heartbeat for LoggingBeat {
        async fn beat(&self) -> Result<()> {
            self.log.lock().unwrap().push(format!("beat{}", self.id));
            Ok(())
        }
    }

    #[async_trait]
    impl FrameConnection for LoggingConnection {
        async fn next_event(&mut self) -> Result<LinkEvent> {
            self.reads += 1;
            match (self.id, self.reads) {
                (_, 1) => Ok(LinkEvent::HeartbeatInterval(Duration::from_secs(10))),
                (1, _) => {
                    tokio::time::sleep(Duration::from_secs(35)).await;
                    Err(Error::Transport("read failed".to_string()))
                }
                _ => std::future::pending().await,
            }
        }

        fn heartbeat(&self) -> Option<Arc<dyn Heartbeat>> {
            Some(Arc::new(LoggingBeat {
                id: self.id,
                log: self.log.clone(),
            }))
        }
    }

    #[async_trait]
    impl Dialer for LoggingDialer {
        async fn dial(&self) -> Result<Box<dyn FrameConnection>> {
            let id = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
            self.log.lock().unwrap().push(format!("dial{}", id));
            Ok(Box::new(LoggingConnection {
                id,
                reads: 0,
                log: self.log.clone(),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_before_redial() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            "test",
            ReconnectPolicy::fixed(Duration::from_secs(1)),
        ));
        let dialer = Arc::new(LoggingDialer {
            log: log.clone(),
            dials: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let mut state = supervisor.watch_state();

        let task = {
            let supervisor = supervisor.clone();
            let dialer = dialer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { supervisor.run(dialer.as_ref(), &cancel).await })
        };

        wait_for(&mut state, ConnectionState::Connected).await;
        tokio::time::sleep(Duration::from_secs(70)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec!["dial1", "beat1", "beat1", "beat1", "dial2", "beat2", "beat2", "beat2"]
        );
        let redial = log.iter().position(|entry| entry == "dial2").unwrap();
        assert!(!log[redial..].iter().any(|entry| entry == "beat1"));
    }

    #[tokio::test]
    async fn test_fatal_dial_error_stops() {
        let supervisor = ConnectionSupervisor::new("test", ReconnectPolicy::default());
        let mut dialer = ScriptedDialer::new(0, vec![]);
        dialer.fatal = true;
        let cancel = CancellationToken::new();

        let err = supervisor.run(&dialer, &cancel).await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_dials() {
        let supervisor = ConnectionSupervisor::new("test", ReconnectPolicy::default());
        let dialer = ScriptedDialer::new(0, vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        supervisor.run(&dialer, &cancel).await.unwrap();
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_exponential_delay_capped() {
        let policy = ReconnectPolicy::default();
        let mut delay = policy.initial_delay();
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = policy.next_delay(delay);
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_out_of_range_delays_are_clamped() {
        let policy = ReconnectPolicy {
            initial_delay_secs: 1e30,
            max_delay_secs: f64::INFINITY,
            multiplier: 2,
        };
        let ceiling = Duration::from_secs(MAX_RECONNECT_DELAY_SECS as u64);
        assert_eq!(policy.initial_delay(), ceiling);
        assert_eq!(policy.next_delay(ceiling), ceiling);

        let negative = ReconnectPolicy {
            initial_delay_secs: -5.0,
            max_delay_secs: f64::NAN,
            multiplier: 2,
        };
        assert_eq!(negative.initial_delay(), Duration::ZERO);
        assert_eq!(negative.next_delay(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_dial_error_mapping() {
        assert!(dial_error(Error::Auth("401".into())).is_fatal());
        assert!(!dial_error(Error::Transport("reset".into())).is_fatal());
    }
}
