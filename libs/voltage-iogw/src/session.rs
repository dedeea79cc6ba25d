//! Per-device command sessions
//!
//! A device only accepts control commands after a password handshake. The
//! transport gives no request/response pairing, so every sent command leaves
//! a pending entry with a response matcher and a deadline; inbound frames are
//! offered to the device's pending entries in registration order and the
//! first match resolves the waiting caller.
//!
//! Locking: one `parking_lot::Mutex` per device, never held across an await.
//! Devices proceed in parallel; the device map is a `DashMap`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bytes::encode_upper;
use crate::channel::{Value, COUNTER_COUNT};
use crate::command::{
    Command, CommandBuilder, CorrelationKey, OutputState, QueryParam, Response, ResponseMatcher,
};
use crate::envelope::{parse_envelope, Envelope};
use crate::error::{CommandError, CommandResult};
use crate::topic::TopicTemplate;
use crate::transport::Publisher;

/// Session timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Deadline for a command's response
    pub response_timeout: Duration,
    /// Deadline for the password acknowledgement
    pub auth_timeout: Duration,
    /// Period of the background timeout sweep
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Authentication state of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    #[default]
    Unauthenticated,
    Authenticating,
    Authenticated,
}

// ============================================================================
// Session state
// ============================================================================

type ResponseSlot = oneshot::Sender<CommandResult<Vec<u8>>>;

enum Slot {
    /// Password handshake; outcome fans out to every auth waiter
    Auth,
    /// Body of the matched response
    Command(ResponseSlot),
}

struct PendingEntry {
    id: u64,
    key: CorrelationKey,
    matcher: ResponseMatcher,
    deadline: Instant,
    slot: Slot,
}

#[derive(Default)]
struct SessionState {
    auth: AuthState,
    auth_deadline: Option<Instant>,
    auth_waiters: Vec<oneshot::Sender<bool>>,
    /// Registration order
    pending: Vec<PendingEntry>,
    next_id: u64,
}

impl SessionState {
    fn register(
        &mut self,
        key: CorrelationKey,
        matcher: ResponseMatcher,
        deadline: Instant,
        slot: Slot,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.pending.push(PendingEntry {
            id,
            key,
            matcher,
            deadline,
            slot,
        });
        id
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.pending.len();
        self.pending.retain(|entry| entry.id != id);
        self.pending.len() != before
    }

    fn finish_auth(&mut self, accepted: bool) {
        self.auth = if accepted {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        };
        self.auth_deadline = None;
        for waiter in self.auth_waiters.drain(..) {
            let _ = waiter.send(accepted);
        }
    }

    /// First pending entry matching the frame, removed
    fn take_match(&mut self, envelope: &Envelope<'_>) -> Option<PendingEntry> {
        let pos = self
            .pending
            .iter()
            .position(|entry| entry.matcher.matches(envelope))?;
        Some(self.pending.remove(pos))
    }

    /// Resolve every entry whose deadline has passed as timed out
    fn sweep(&mut self, device_id: &str, now: Instant) -> usize {
        if !self.pending.iter().any(|entry| entry.deadline <= now) {
            return 0;
        }

        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|entry| entry.deadline <= now);
        self.pending = live;

        let count = expired.len();
        for entry in expired {
            warn!("Device {} {} timed out", device_id, entry.key);
            match entry.slot {
                Slot::Auth => self.finish_auth(false),
                Slot::Command(tx) => {
                    let _ = tx.send(Err(timeout_error(device_id, &entry.key)));
                },
            }
        }
        count
    }

    /// Drop everything; used on reset
    fn fail_all(&mut self, device_id: &str) {
        for entry in self.pending.drain(..) {
            if let Slot::Command(tx) = entry.slot {
                let _ = tx.send(Err(CommandError::NotAuthenticated(device_id.to_string())));
            }
        }
        self.finish_auth(false);
    }
}

fn timeout_error(device_id: &str, key: &CorrelationKey) -> CommandError {
    CommandError::Timeout(format!("{} on {}", key, device_id))
}

/// Removes a command's pending entry when its caller stops waiting
struct PendingGuard<'a> {
    state: &'a Mutex<SessionState>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().remove(self.id);
    }
}

// ============================================================================
// Session manager
// ============================================================================

/// Owner of every device session
pub struct SessionManager<P> {
    publisher: Arc<P>,
    downlink: TopicTemplate,
    config: SessionConfig,
    passwords: HashMap<String, String>,
    default_password: Option<String>,
    sessions: DashMap<String, Arc<Mutex<SessionState>>>,
}

impl<P: Publisher> SessionManager<P> {
    pub fn new(publisher: Arc<P>, downlink: TopicTemplate, config: SessionConfig) -> Self {
        Self {
            publisher,
            downlink,
            config,
            passwords: HashMap::new(),
            default_password: None,
            sessions: DashMap::new(),
        }
    }

    /// Password for devices without their own
    pub fn with_default_password(mut self, password: impl Into<String>) -> Self {
        self.default_password = Some(password.into());
        self
    }

    pub fn with_device_password(
        mut self,
        device_id: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.passwords.insert(device_id.into(), password.into());
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Command builder holding the device's configured password
    pub fn builder_for(&self, device_id: &str) -> CommandBuilder {
        let password = self
            .passwords
            .get(device_id)
            .or(self.default_password.as_ref())
            .cloned();
        CommandBuilder::new(password)
    }

    fn session(&self, device_id: &str) -> Arc<Mutex<SessionState>> {
        Arc::clone(self.sessions.entry(device_id.to_string()).or_default().value())
    }

    fn existing(&self, device_id: &str) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.get(device_id).map(|s| Arc::clone(s.value()))
    }

    pub fn auth_state(&self, device_id: &str) -> AuthState {
        self.existing(device_id)
            .map(|s| s.lock().auth)
            .unwrap_or_default()
    }

    /// In-flight entries for a device, auth handshake included
    pub fn pending_count(&self, device_id: &str) -> usize {
        self.existing(device_id)
            .map(|s| s.lock().pending.len())
            .unwrap_or(0)
    }

    pub fn device_count(&self) -> usize {
        self.sessions.len()
    }

    // ------------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------------

    /// Run the password handshake, or join the one already in flight
    ///
    /// Resolves `Ok(false)` when the device rejects the password or stays
    /// silent until the auth timeout.
    pub async fn authenticate(&self, device_id: &str) -> CommandResult<bool> {
        let session = self.session(device_id);

        let (mut rx, deadline, challenge) = {
            let mut state = session.lock();
            match state.auth {
                AuthState::Authenticated => return Ok(true),
                AuthState::Authenticating => {
                    let (tx, rx) = oneshot::channel();
                    state.auth_waiters.push(tx);
                    let deadline = state
                        .auth_deadline
                        .unwrap_or_else(|| Instant::now() + self.config.auth_timeout);
                    debug!("Device {} joining in-flight authentication", device_id);
                    (rx, deadline, None)
                },
                AuthState::Unauthenticated => {
                    let frame = self.builder_for(device_id).password_frame()?;
                    let deadline = Instant::now() + self.config.auth_timeout;
                    let (tx, rx) = oneshot::channel();
                    state.auth = AuthState::Authenticating;
                    state.auth_deadline = Some(deadline);
                    state.auth_waiters.push(tx);
                    let id = state.register(frame.key, frame.matcher, deadline, Slot::Auth);
                    (rx, deadline, Some((id, frame.payload)))
                },
            }
        };

        if let Some((id, payload)) = challenge {
            let topic = self.downlink.render(device_id);
            info!("Device {} authenticating via {}", device_id, topic);
            let published = self.publisher.publish(&topic, payload).await;
            if let Err(e) = published {
                warn!("Device {} password publish failed: {}", device_id, e);
                abort_auth(&session, id);
                return Err(CommandError::TransportRejected(e));
            }
        }

        let accepted = match timeout_at(deadline, &mut rx).await {
            Ok(outcome) => outcome.unwrap_or(false),
            Err(_) => {
                session.lock().sweep(device_id, Instant::now());
                rx.try_recv().unwrap_or(false)
            },
        };

        if accepted {
            info!("Device {} authenticated", device_id);
        } else {
            warn!("Device {} authentication failed", device_id);
        }
        Ok(accepted)
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn execute(&self, device_id: &str, command: Command) -> CommandResult<Response> {
        let session = self.session(device_id);

        let (id, key, deadline, payload, rx) = {
            let mut state = session.lock();
            if state.auth != AuthState::Authenticated {
                debug!(
                    "Device {} {:?} refused: {:?}",
                    device_id,
                    command.command_type(),
                    state.auth
                );
                return Err(CommandError::NotAuthenticated(device_id.to_string()));
            }
            let frame = self.builder_for(device_id).build(command)?;
            let deadline = Instant::now() + self.config.response_timeout;
            let (tx, rx) = oneshot::channel();
            let id = state.register(frame.key, frame.matcher, deadline, Slot::Command(tx));
            (id, frame.key, deadline, frame.payload, rx)
        };
        let _guard = PendingGuard {
            state: &session,
            id,
        };

        let topic = self.downlink.render(device_id);
        debug!("Device {} sending {} via {}", device_id, key, topic);
        self.publisher
            .publish(&topic, payload)
            .await
            .inspect_err(|e| warn!("Device {} {} publish failed: {}", device_id, key, e))?;

        let body = match timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) | Err(_) => {
                warn!("Device {} {} timed out", device_id, key);
                return Err(timeout_error(device_id, &key));
            },
        };

        key.parse_response(&body)
            .map_err(CommandError::InvalidResponse)
    }

    /// Drive a digital output; `pulse` of `None` latches it
    pub async fn set_output(
        &self,
        device_id: &str,
        output: u8,
        state: OutputState,
        pulse: Option<Duration>,
    ) -> CommandResult<bool> {
        let response = self
            .execute(
                device_id,
                Command::SetOutput {
                    output,
                    state,
                    pulse,
                },
            )
            .await?;
        expect_ack(response)
    }

    pub async fn reset_counter(&self, device_id: &str, counter: u8) -> CommandResult<bool> {
        let response = self
            .execute(device_id, Command::ResetCounter { counter })
            .await?;
        expect_ack(response)
    }

    /// Reset counters 1..=4 one after another
    ///
    /// Every counter is attempted; one failure does not stop the rest.
    pub async fn reset_all_counters(&self, device_id: &str) -> Vec<CommandResult<bool>> {
        let mut outcomes = Vec::with_capacity(COUNTER_COUNT);
        for counter in 1..=COUNTER_COUNT as u8 {
            outcomes.push(self.reset_counter(device_id, counter).await);
        }
        outcomes
    }

    pub async fn reboot(&self, device_id: &str) -> CommandResult<bool> {
        let response = self.execute(device_id, Command::Reboot).await?;
        expect_ack(response)
    }

    pub async fn query(&self, device_id: &str, param: QueryParam) -> CommandResult<Value> {
        match self.execute(device_id, Command::Query(param)).await? {
            Response::Value(value) => Ok(value),
            other => Err(CommandError::InvalidResponse(format!(
                "expected {:?} value, got {:?}",
                param, other
            ))),
        }
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Offer an inbound frame to the device's pending entries
    ///
    /// Returns `true` when the frame resolved one. Unmatched frames are left
    /// to the caller, they are usually telemetry.
    pub fn on_frame(&self, device_id: &str, bytes: &[u8]) -> bool {
        match parse_envelope(bytes) {
            Ok(envelope) => self.on_envelope(device_id, &envelope),
            Err(_) => {
                self.sweep_device(device_id);
                false
            },
        }
    }

    pub fn on_envelope(&self, device_id: &str, envelope: &Envelope<'_>) -> bool {
        let Some(session) = self.existing(device_id) else {
            return false;
        };

        let mut state = session.lock();
        state.sweep(device_id, Instant::now());

        let Some(entry) = state.take_match(envelope) else {
            return false;
        };

        debug!(
            "Device {} matched {}: {}",
            device_id,
            entry.key,
            encode_upper(envelope.body())
        );
        match entry.slot {
            Slot::Auth => {
                let accepted = matches!(
                    entry.key.parse_response(envelope.body()),
                    Ok(Response::Ack { accepted: true })
                );
                state.finish_auth(accepted);
            },
            Slot::Command(tx) => {
                let _ = tx.send(Ok(envelope.body().to_vec()));
            },
        }
        true
    }

    // ------------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------------

    /// Time out one device's expired entries
    pub fn sweep_device(&self, device_id: &str) -> usize {
        self.existing(device_id)
            .map(|s| s.lock().sweep(device_id, Instant::now()))
            .unwrap_or(0)
    }

    /// Time out every expired entry on every device
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let sessions: Vec<(String, Arc<Mutex<SessionState>>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        sessions
            .iter()
            .map(|(device_id, session)| session.lock().sweep(device_id, now))
            .sum()
    }

    /// Forget a device's session: auth drops to unauthenticated and every
    /// in-flight command fails
    pub fn reset(&self, device_id: &str) {
        if let Some((_, session)) = self.sessions.remove(device_id) {
            session.lock().fail_all(device_id);
            info!("Device {} session reset", device_id);
        }
    }

    /// Reset every session, e.g. after a transport reconnect
    pub fn reset_all(&self) {
        let devices: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for device_id in &devices {
            self.reset(device_id);
        }
        if !devices.is_empty() {
            info!("Reset {} device sessions", devices.len());
        }
    }
}

impl<P: Publisher + 'static> SessionManager<P> {
    /// Periodic timeout sweep until `token` is cancelled
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            debug!("Session sweeper started ({:?})", period);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = manager.sweep_expired();
                        if expired > 0 {
                            debug!("Sweeper expired {} pending entries", expired);
                        }
                    }
                }
            }
            debug!("Session sweeper stopped");
        })
    }
}

fn abort_auth(session: &Mutex<SessionState>, id: u64) {
    let mut state = session.lock();
    state.remove(id);
    state.finish_auth(false);
}

fn expect_ack(response: Response) -> CommandResult<bool> {
    match response {
        Response::Ack { accepted } => Ok(accepted),
        other => Err(CommandError::InvalidResponse(format!(
            "expected acknowledgement, got {:?}",
            other
        ))),
    }
}
