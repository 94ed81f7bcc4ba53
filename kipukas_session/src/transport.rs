// Client transport: one relay connection plus the reconnect policy.
//
// The transport is driven from the caller's event loop. `poll(now)` drains
// socket events and fires a due reconnect; nothing here sleeps or waits on
// the network. A connection attempt runs on its socket thread and reports
// back through `poll`, so a slow or unreachable relay never stalls the
// caller. While a
// session is "desired" a dropped socket schedules a reconnect with
// exponential backoff and jitter. After `max_attempts` consecutive failures
// the transport gives up and clears the desired flag. `disconnect()` clears
// it too, and a pending retry checks the flag when its deadline comes round,
// so a cancelled session never reconnects.
//
// Messages on one connection keep their order. Nothing is replayed across a
// reconnect; the layers above re-send what they need on `Opened`.

use std::mem;
use std::time::{Duration, Instant};

use kipukas_protocol::message::{ClientMessage, ServerMessage};
use kipukas_relay::client::{ClientEvent, RelayClient};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::error::TransportError;

#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
    /// Fraction of the delay added or removed at random, in `0.0..1.0`.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_attempts: 8,
            jitter: 0.25,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay);
        let jitter = self.jitter.clamp(0.0, 0.99);
        if jitter == 0.0 {
            return delay;
        }
        delay.mul_f64(rng.gen_range(1.0 - jitter..=1.0 + jitter))
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// `ws://host:port/` of the relay.
    pub relay_url: String,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8787/".to_string(),
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// A connection is up (first connect or reconnect).
    Opened,
    Message(ServerMessage),
    /// The connection went away. A reconnect follows if still desired.
    Closed,
    /// The attempt budget ran out; no more reconnects.
    GaveUp { attempts: u32 },
}

pub struct Transport {
    config: ClientConfig,
    /// The current connection, open or still connecting.
    client: Option<RelayClient>,
    open: bool,
    desired: bool,
    /// Consecutive failed attempts.
    attempts: u32,
    retry_at: Option<Instant>,
    events: Vec<TransportEvent>,
    rng: StdRng,
}

impl Transport {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: ClientConfig, rng: StdRng) -> Self {
        Self {
            config,
            client: None,
            open: false,
            desired: false,
            attempts: 0,
            retry_at: None,
            events: Vec::new(),
            rng,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.open
    }

    /// Whether a session still wants a connection.
    pub fn is_desired(&self) -> bool {
        self.desired
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// When the next reconnect is due, if one is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Mark the session desired and start connecting. The result shows up
    /// as `Opened` (or a scheduled retry) on a later `poll`.
    pub fn connect(&mut self, now: Instant) {
        self.desired = true;
        if self.client.is_some() {
            return;
        }
        self.attempts = 0;
        self.retry_at = None;
        self.attempt(now);
    }

    pub fn poll(&mut self, now: Instant) -> Vec<TransportEvent> {
        let mut closed = false;
        let mut failed = None;
        if let Some(client) = &self.client {
            for event in client.poll() {
                match event {
                    ClientEvent::Opened => {
                        info!(url = %self.config.relay_url, attempts = self.attempts, "connected to relay");
                        self.open = true;
                        self.attempts = 0;
                        self.events.push(TransportEvent::Opened);
                    }
                    ClientEvent::Message(msg) => self.events.push(TransportEvent::Message(msg)),
                    ClientEvent::Failed(reason) => failed = Some(reason),
                    ClientEvent::Closed => closed = true,
                }
            }
        }
        if let Some(reason) = failed {
            self.client = None;
            self.failed_attempt(now, &reason);
        }
        if closed {
            self.client = None;
            self.open = false;
            info!(url = %self.config.relay_url, "relay connection lost");
            self.events.push(TransportEvent::Closed);
            self.schedule_retry(now);
        }

        if let Some(at) = self.retry_at {
            if now >= at {
                self.retry_at = None;
                if self.desired {
                    self.attempt(now);
                } else {
                    debug!("reconnect cancelled: session no longer desired");
                }
            }
        }
        mem::take(&mut self.events)
    }

    pub fn send(&self, msg: &ClientMessage) -> Result<(), TransportError> {
        let client = self
            .client
            .as_ref()
            .filter(|_| self.open)
            .ok_or(TransportError::NotConnected)?;
        client
            .send(msg)
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    /// Deliberate goodbye: tell the relay, close the socket, and cancel any
    /// reconnect.
    pub fn disconnect(&mut self) {
        self.desired = false;
        self.retry_at = None;
        self.attempts = 0;
        if let Some(client) = self.client.take() {
            if self.open {
                if let Err(e) = client.send(&ClientMessage::Leave) {
                    debug!(error = %e, "leave not sent");
                }
            }
            client.close();
            self.open = false;
            info!(url = %self.config.relay_url, "disconnected from relay");
        }
    }

    /// Drop the socket without a goodbye, as a network failure would. The
    /// usual reconnect path takes over.
    pub fn force_reconnect(&mut self, now: Instant) {
        if let Some(client) = self.client.take() {
            client.close();
            if mem::take(&mut self.open) {
                self.events.push(TransportEvent::Closed);
            }
        }
        self.schedule_retry(now);
    }

    fn attempt(&mut self, now: Instant) {
        match RelayClient::open(&self.config.relay_url, self.config.connect_timeout) {
            Ok(client) => {
                debug!(url = %self.config.relay_url, attempt = self.attempts + 1, "connecting");
                self.client = Some(client);
            }
            Err(e) => self.failed_attempt(now, &e.to_string()),
        }
    }

    fn failed_attempt(&mut self, now: Instant, reason: &str) {
        self.attempts += 1;
        warn!(url = %self.config.relay_url, attempt = self.attempts, error = reason, "connect failed");
        if self.attempts >= self.config.reconnect.max_attempts {
            warn!(attempts = self.attempts, "giving up on the relay");
            self.desired = false;
            self.events.push(TransportEvent::GaveUp {
                attempts: self.attempts,
            });
        } else {
            self.schedule_retry(now);
        }
    }

    fn schedule_retry(&mut self, now: Instant) {
        if !self.desired {
            return;
        }
        let delay = self
            .config
            .reconnect
            .delay_for(self.attempts + 1, &mut self.rng);
        info!(?delay, attempt = self.attempts + 1, "reconnect scheduled");
        self.retry_at = Some(now + delay);
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts,
            jitter: 0.0,
        }
    }

    /// A URL nothing is listening on.
    fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("ws://127.0.0.1:{port}/")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            jitter: 0.0,
            ..ReconnectPolicy::default()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u64> = (1..=7)
            .map(|n| policy.delay_for(n, &mut rng).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000, 8000]);
        assert_eq!(policy.delay_for(u32::MAX, &mut rng), policy.max_delay);
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = ReconnectPolicy::default();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let d = policy.delay_for(2, &mut rng);
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn send_without_connection_fails() {
        let t = Transport::new(ClientConfig::default());
        assert_eq!(
            t.send(&ClientMessage::Leave),
            Err(TransportError::NotConnected)
        );
    }

    #[test]
    fn gives_up_after_attempt_budget() {
        let mut config = ClientConfig::new(dead_url());
        config.connect_timeout = Duration::from_millis(200);
        config.reconnect = fast_policy(3);
        let mut t = Transport::with_rng(config, StdRng::seed_from_u64(3));

        t.connect(Instant::now());
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut gave_up = None;
        while gave_up.is_none() && Instant::now() < deadline {
            for event in t.poll(Instant::now()) {
                assert_ne!(event, TransportEvent::Opened);
                if let TransportEvent::GaveUp { attempts } = event {
                    gave_up = Some(attempts);
                }
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(gave_up, Some(3));
        assert!(!t.is_desired());
        assert!(t.next_deadline().is_none());
        assert!(t.poll(Instant::now() + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn disconnect_cancels_pending_retry() {
        let mut config = ClientConfig::new(dead_url());
        config.connect_timeout = Duration::from_millis(200);
        config.reconnect = fast_policy(10);
        let mut t = Transport::new(config);

        t.connect(Instant::now());
        assert!(!t.is_connected(), "connect returns before the outcome");
        let deadline = Instant::now() + Duration::from_secs(5);
        while t.attempts() == 0 && Instant::now() < deadline {
            assert!(t.poll(Instant::now()).is_empty());
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(t.attempts(), 1);
        assert!(t.next_deadline().is_some());

        t.disconnect();
        assert!(!t.is_desired());
        assert!(t.poll(Instant::now() + Duration::from_secs(1)).is_empty());
        assert_eq!(t.attempts(), 0);
    }
}
