//! Connection lifecycle and command dispatch over a [`BleLink`].
//!
//! ```text
//! Idle -> Connecting -> ServiceDiscovery -> Subscribing -> Ready -> Disconnecting -> Idle
//!            |                |                  |
//!            +----------------+------------------+--> Failed(reason)
//! ```
//!
//! One command is in flight at a time. Each send holds the command gate while
//! it writes, waits for the correlated notification and arms the settle delay,
//! so concurrent callers queue instead of interleaving. `disconnect` does not
//! take the gate: it flips the state, which resolves any pending wait as
//! [`Error::Cancelled`].

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use super::equalizer::{EqState, Preset};
use super::info::DeviceInfo;
use super::{ConnectionState, FailureReason, SessionEvent};
use crate::bluetooth::{BleLink, GattUuids, LinkError, LinkEvent};
use crate::error::{Error, Result};
use crate::protocol::commands::{Command, FrameType, MAGIC};
use crate::protocol::packet::hex;
use crate::protocol::{decode, Notification, QxwFrame};

const RETRY_BACKOFF_START: Duration = Duration::from_millis(500);
const RETRY_BACKOFF_MAX: Duration = Duration::from_secs(8);

/// Protocol timing. Defaults match what the earbuds tolerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// How long to wait for the notification answering a command.
    pub command_timeout: Duration,
    /// Minimum gap after a command completes before the next one is written.
    pub settle_delay: Duration,
    /// Pause between stopping notifications and releasing the connection.
    pub unsubscribe_grace: Duration,
    /// Wait before reconnecting after a drop or failed attempt.
    pub drop_grace: Duration,
    /// Wait before reconnecting after an explicit `disconnect`.
    pub disconnect_grace: Duration,
    pub connect_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(300),
            unsubscribe_grace: Duration::from_millis(300),
            drop_grace: Duration::from_millis(500),
            disconnect_grace: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// The link currently attached to the session.
struct Attachment<L> {
    generation: u64,
    link: Arc<L>,
    pump: Option<JoinHandle<()>>,
}

struct Shared<L> {
    uuids: GattUuids,
    timing: Timing,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    /// Raw decoded notifications, for response correlation.
    responses: broadcast::Sender<Notification>,
    attachment: Mutex<Option<Attachment<L>>>,
    /// Earliest instant the next command may be written.
    gate: tokio::sync::Mutex<Instant>,
    eq: Mutex<EqState>,
    device_info: Mutex<Option<DeviceInfo>>,
    reconnect_after: Mutex<Option<Instant>>,
    generation: AtomicU64,
}

/// Drives one earbud session over a [`BleLink`].
///
/// Cloning yields another handle to the same session.
pub struct ConnectionController<L: BleLink> {
    shared: Arc<Shared<L>>,
}

impl<L: BleLink> Clone for ConnectionController<L> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<L: BleLink> ConnectionController<L> {
    pub fn new(uuids: GattUuids, timing: Timing) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (events, _) = broadcast::channel(64);
        let (responses, _) = broadcast::channel(16);

        Self {
            shared: Arc::new(Shared {
                uuids,
                timing,
                state,
                events,
                responses,
                attachment: Mutex::new(None),
                gate: tokio::sync::Mutex::new(Instant::now()),
                eq: Mutex::new(EqState::new()),
                device_info: Mutex::new(None),
                reconnect_after: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// The EQ the session will send with the next CustomEq frame.
    pub fn eq_state(&self) -> EqState {
        lock(&self.shared.eq).clone()
    }

    /// Most recent device info received on this connection.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        lock(&self.shared.device_info).clone()
    }

    pub fn timing(&self) -> Timing {
        self.shared.timing
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect over `link`, resolve the QXW endpoints, subscribe, and probe
    /// device info. Returns once the session is `Ready`.
    ///
    /// A probe that times out or returns a malformed payload is logged and
    /// does not fail the connection.
    pub async fn connect(&self, link: L) -> Result<()> {
        let state = self.state();
        if !state.can_connect() {
            return Err(Error::InvalidState(state));
        }
        self.wait_reconnect_grace().await;

        if self.transition(state, ConnectionState::Connecting).is_err() {
            return Err(Error::InvalidState(self.state()));
        }
        // Only the attempt that won the transition starts a new generation.
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let link = Arc::new(link);
        let (link_tx, link_rx) = mpsc::channel(64);

        // Attached before connecting so a concurrent `disconnect` can release it.
        let pump = tokio::spawn(pump(Arc::downgrade(&self.shared), link_rx, generation));
        *lock(&self.shared.attachment) = Some(Attachment {
            generation,
            link: link.clone(),
            pump: Some(pump),
        });

        let connected = match timeout(self.shared.timing.connect_timeout, link.connect(link_tx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        };
        if let Err(e) = connected {
            warn!("GATT connect failed: {}", e);
            return Err(self
                .abort_connect(
                    &link,
                    generation,
                    ConnectionState::Connecting,
                    FailureReason::GattConnect,
                    Error::GattConnect(e),
                )
                .await);
        }

        if self
            .transition(ConnectionState::Connecting, ConnectionState::ServiceDiscovery)
            .is_err()
        {
            return Err(self.cancel_connect(&link, generation).await);
        }
        if let Err(e) = link.discover(self.shared.uuids).await {
            warn!("Service discovery failed: {}", e);
            return Err(self
                .abort_connect(
                    &link,
                    generation,
                    ConnectionState::ServiceDiscovery,
                    FailureReason::ServiceNotFound,
                    Error::ServiceNotFound(e),
                )
                .await);
        }

        if self
            .transition(ConnectionState::ServiceDiscovery, ConnectionState::Subscribing)
            .is_err()
        {
            return Err(self.cancel_connect(&link, generation).await);
        }
        if let Err(e) = link.subscribe().await {
            warn!("Subscribing to notifications failed: {}", e);
            return Err(self
                .abort_connect(
                    &link,
                    generation,
                    ConnectionState::Subscribing,
                    FailureReason::Link,
                    Error::Link(e),
                )
                .await);
        }

        if self
            .transition(ConnectionState::Subscribing, ConnectionState::Ready)
            .is_err()
        {
            return Err(self.cancel_connect(&link, generation).await);
        }

        match self.request_device_info().await {
            Ok(info) => info!("Connected: {}", info),
            Err(e) if e.is_session_fatal() || matches!(e, Error::Cancelled) => return Err(e),
            Err(e) => warn!("Device info probe failed: {}", e),
        }
        Ok(())
    }

    /// Like [`connect`](Self::connect), retrying retryable failures with
    /// exponential backoff. `make_link` produces a fresh link per attempt.
    pub async fn connect_with_retry<F, Fut>(&self, mut make_link: F, attempts: u32) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<L, LinkError>>,
    {
        let mut backoff = RETRY_BACKOFF_START;
        let mut attempt = 1;
        loop {
            let result = match make_link().await {
                Ok(link) => self.connect(link).await,
                Err(e) => Err(Error::GattConnect(e)),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Connect attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, attempts, e, backoff
                    );
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop notifications, wait, release the link. Cancels any pending command.
    pub async fn disconnect(&self) -> Result<()> {
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Idle | ConnectionState::Disconnecting
        ) {
            return Ok(());
        }
        self.set_state(ConnectionState::Disconnecting);

        let attachment = lock(&self.shared.attachment).take();
        if let Some(mut attachment) = attachment {
            if matches!(state, ConnectionState::Ready) {
                match attachment.link.unsubscribe().await {
                    Ok(()) => debug!("Stopped notifications"),
                    Err(e) => warn!("Stopping notifications failed: {}", e),
                }
            }
            sleep(self.shared.timing.unsubscribe_grace).await;
            if let Err(e) = attachment.link.disconnect().await {
                warn!("Releasing link failed: {}", e);
            }
            if let Some(pump) = attachment.pump.take() {
                pump.abort();
            }
        }

        *lock(&self.shared.device_info) = None;
        self.arm_reconnect_grace(self.shared.timing.disconnect_grace);
        self.set_state(ConnectionState::Idle);
        let _ = self.shared.events.send(SessionEvent::Disconnected);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Write `frame` and wait for the notification answering it.
    ///
    /// Returns `Ok(None)` for frames with no known command, and for
    /// Notify-type frames (CustomEq) that were not acknowledged in time.
    pub async fn send_command(&self, frame: QxwFrame) -> Result<Option<Notification>> {
        let mut next_send = self.shared.gate.lock().await;
        sleep_until(*next_send).await;

        let (generation, link) = self.ready_link()?;
        let mut responses = self.shared.responses.subscribe();
        let mut state_rx = self.shared.state.subscribe();

        let bytes = frame.to_bytes();
        debug!("TX: {}", hex::encode(&bytes));
        if let Err(e) = link.write(&bytes).await {
            warn!("Write failed: {}", e);
            self.link_failed(generation).await;
            return Err(Error::Link(e));
        }

        let Some(expected) = frame.command_kind() else {
            *next_send = Instant::now() + self.shared.timing.settle_delay;
            return Ok(None);
        };

        let command_timeout = self.shared.timing.command_timeout;
        let outcome = tokio::select! {
            r = wait_response(&mut responses, expected) => r,
            _ = state_rx.wait_for(|s| !s.is_ready()) => Err(Error::Cancelled),
            _ = sleep(command_timeout) => Err(Error::Timeout(command_timeout)),
        };
        *next_send = Instant::now() + self.shared.timing.settle_delay;

        match outcome {
            Ok(n) => Ok(Some(n)),
            Err(Error::Timeout(t)) if frame.frame_type() != FrameType::Request.code() => {
                debug!("No acknowledgement for {} within {:?}", frame, t);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Send caller-supplied frame bytes. The QXW prefix is added if missing.
    pub async fn send_raw(&self, data: &[u8]) -> Result<Option<Notification>> {
        let mut bytes = Vec::with_capacity(data.len() + MAGIC.len());
        if !data.starts_with(&MAGIC) {
            bytes.extend_from_slice(&MAGIC);
        }
        bytes.extend_from_slice(data);
        let frame = QxwFrame::from_bytes(&bytes)?;
        self.send_command(frame).await
    }

    pub async fn select_preset(&self, number: u8) -> Result<()> {
        let preset = Preset::from_number(number)?;
        self.select(preset).await
    }

    pub async fn select(&self, preset: Preset) -> Result<()> {
        self.ensure_ready()?;
        info!("Selecting preset {} ({})", preset.number(), preset);
        self.send_command(QxwFrame::select_eq(preset.number()))
            .await
            .map(|_| ())
    }

    pub async fn request_device_info(&self) -> Result<DeviceInfo> {
        match self.send_command(QxwFrame::device_info_request()).await? {
            Some(Notification::DeviceInfo(payload)) => DeviceInfo::parse(&payload),
            other => Err(Error::Format(format!(
                "unexpected device info response: {:?}",
                other
            ))),
        }
    }

    /// Adopt `eq` as the session EQ and send it.
    pub async fn send_custom_eq(&self, eq: &EqState) -> Result<()> {
        self.ensure_ready()?;
        *lock(&self.shared.eq) = eq.clone();
        self.send_current_eq().await
    }

    async fn send_current_eq(&self) -> Result<()> {
        let payload = lock(&self.shared.eq).to_custom_eq_payload();
        self.send_command(QxwFrame::custom_eq(payload))
            .await
            .map(|_| ())
    }

    pub async fn set_band(&self, index: usize, gain_db: f64, q: f64) -> Result<()> {
        self.edit_eq(|eq| eq.set_band(index, gain_db, q)).await
    }

    pub async fn set_band_gain(&self, index: usize, gain_db: f64) -> Result<()> {
        self.edit_eq(|eq| eq.set_band_gain(index, gain_db)).await
    }

    pub async fn set_band_q(&self, index: usize, q: f64) -> Result<()> {
        self.edit_eq(|eq| eq.set_band_q(index, q)).await
    }

    /// Replace all 8 bands with `(gain_db, q)` pairs and send them.
    pub async fn apply_preset(&self, bands: &[(f64, f64)]) -> Result<()> {
        self.edit_eq(|eq| eq.apply_preset(bands)).await
    }

    /// Zero every band and send the flat curve.
    pub async fn reset_eq(&self) -> Result<()> {
        self.edit_eq(|eq| {
            eq.reset();
            Ok(())
        })
        .await
    }

    async fn edit_eq(&self, edit: impl FnOnce(&mut EqState) -> Result<()>) -> Result<()> {
        self.ensure_ready()?;
        edit(&mut lock(&self.shared.eq))?;
        self.send_current_eq().await
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_ready(&self) -> Result<()> {
        let state = self.state();
        if state.is_ready() {
            Ok(())
        } else {
            Err(Error::InvalidState(state))
        }
    }

    fn ready_link(&self) -> Result<(u64, Arc<L>)> {
        self.ensure_ready()?;
        lock(&self.shared.attachment)
            .as_ref()
            .map(|a| (a.generation, a.link.clone()))
            .ok_or(Error::InvalidState(self.state()))
    }

    fn set_state(&self, state: ConnectionState) {
        self.shared.state.send_replace(state);
        self.announce(state);
    }

    /// Move `from -> to`, or fail with `Cancelled` if someone else moved the state first.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<()> {
        let moved = self.shared.state.send_if_modified(|s| {
            if *s == from {
                *s = to;
                true
            } else {
                false
            }
        });
        if moved {
            self.announce(to);
            Ok(())
        } else {
            debug!("State moved to {} before {} -> {}", self.state(), from, to);
            Err(Error::Cancelled)
        }
    }

    fn announce(&self, state: ConnectionState) {
        info!("Connection state: {}", state);
        let _ = self.shared.events.send(SessionEvent::StateChanged(state));
    }

    fn arm_reconnect_grace(&self, grace: Duration) {
        *lock(&self.shared.reconnect_after) = Some(Instant::now() + grace);
    }

    async fn wait_reconnect_grace(&self) {
        let not_before = *lock(&self.shared.reconnect_after);
        if let Some(at) = not_before {
            let now = Instant::now();
            if at > now {
                info!("Waiting {:?} before reconnecting", at - now);
                sleep_until(at).await;
            }
        }
    }

    /// Take the attachment if it still belongs to `generation`.
    fn detach(&self, generation: u64) -> Option<Attachment<L>> {
        let mut slot = lock(&self.shared.attachment);
        match slot.as_ref() {
            Some(a) if a.generation == generation => slot.take(),
            _ => None,
        }
    }

    /// Drop the attachment of `generation` and stop its pump.
    fn release_attachment(&self, generation: u64) {
        if let Some(mut attachment) = self.detach(generation) {
            if let Some(pump) = attachment.pump.take() {
                pump.abort();
            }
        }
    }

    /// Release `link` after a failed connect step and report the error,
    /// unless a concurrent `disconnect` already took over.
    async fn abort_connect(
        &self,
        link: &L,
        generation: u64,
        from: ConnectionState,
        reason: FailureReason,
        err: Error,
    ) -> Error {
        if let Err(e) = link.disconnect().await {
            warn!("Releasing link after failed connect: {}", e);
        }
        self.release_attachment(generation);
        self.arm_reconnect_grace(self.shared.timing.drop_grace);
        match self.transition(from, ConnectionState::Failed(reason)) {
            Ok(()) => err,
            Err(cancelled) => cancelled,
        }
    }

    /// The state moved under a connect attempt (disconnect or link drop).
    /// The link may have finished connecting after it was released, so
    /// release it again.
    async fn cancel_connect(&self, link: &L, generation: u64) -> Error {
        if let Err(e) = link.disconnect().await {
            debug!("Releasing link of cancelled connect: {}", e);
        }
        self.release_attachment(generation);
        Error::Cancelled
    }

    async fn link_failed(&self, generation: u64) {
        if self
            .transition(
                ConnectionState::Ready,
                ConnectionState::Failed(FailureReason::Link),
            )
            .is_err()
        {
            return;
        }
        if let Some(mut attachment) = self.detach(generation) {
            if let Err(e) = attachment.link.disconnect().await {
                debug!("Releasing failed link: {}", e);
            }
            if let Some(pump) = attachment.pump.take() {
                pump.abort();
            }
        }
        *lock(&self.shared.device_info) = None;
        self.arm_reconnect_grace(self.shared.timing.drop_grace);
    }

    fn handle_notification(&self, data: &[u8]) {
        debug!("RX: {}", hex::encode(data));
        let notification = decode(data);
        let _ = self.shared.responses.send(notification.clone());

        let event = match notification {
            Notification::PresetAck => SessionEvent::PresetConfirmed,
            Notification::CustomEqAck => SessionEvent::CustomEqConfirmed,
            Notification::DeviceInfo(payload) => match DeviceInfo::parse(&payload) {
                Ok(info) => {
                    debug!("Device info: {}", info);
                    *lock(&self.shared.device_info) = Some(info.clone());
                    SessionEvent::DeviceInfoReceived(info)
                }
                Err(e) => {
                    warn!("Dropping device info notification: {}", e);
                    return;
                }
            },
            Notification::Unrecognized(code) => {
                debug!("Unrecognized notification (command {:?})", code);
                SessionEvent::Unrecognized(code)
            }
        };
        let _ = self.shared.events.send(event);
    }

    /// The peripheral went away. Not an error: back to `Idle`.
    async fn handle_link_drop(&self, generation: u64) {
        let state = self.state();
        if matches!(
            state,
            ConnectionState::Idle | ConnectionState::Disconnecting | ConnectionState::Failed(_)
        ) {
            debug!("Link drop while {}, ignoring", state);
            return;
        }
        info!("Link dropped by peripheral");
        self.set_state(ConnectionState::Disconnecting);

        // Runs on the pump task itself, so its handle is dropped rather than aborted.
        if let Some(attachment) = self.detach(generation) {
            if let Err(e) = attachment.link.disconnect().await {
                debug!("Releasing dropped link: {}", e);
            }
        }

        *lock(&self.shared.device_info) = None;
        self.arm_reconnect_grace(self.shared.timing.drop_grace);
        self.set_state(ConnectionState::Idle);
        let _ = self.shared.events.send(SessionEvent::Disconnected);
    }
}

/// Forward link events into the session until the link closes.
async fn pump<L: BleLink>(
    shared: Weak<Shared<L>>,
    mut rx: mpsc::Receiver<LinkEvent>,
    generation: u64,
) {
    while let Some(event) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let controller = ConnectionController { shared };
        match event {
            LinkEvent::Notification(data) => controller.handle_notification(&data),
            LinkEvent::Disconnected => {
                controller.handle_link_drop(generation).await;
                return;
            }
        }
    }
    debug!("Link event channel closed");
}

async fn wait_response(
    rx: &mut broadcast::Receiver<Notification>,
    expected: Command,
) -> Result<Notification> {
    loop {
        match rx.recv().await {
            Ok(n) if n.command() == Some(expected) => return Ok(n),
            Ok(other) => debug!("Ignoring {:?} while waiting for {:?}", other, expected),
            Err(RecvError::Lagged(n)) => warn!("Missed {} notifications", n),
            Err(RecvError::Closed) => return Err(Error::Cancelled),
        }
    }
}
