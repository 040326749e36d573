//! One wireless connection to one BMS.
//!
//! A [`LinkSession`] walks `Idle -> Scanning -> FoundTarget -> Connected ->
//! SubscribedReady <-> AwaitingResponse`. Any I/O failure moves it to
//! `Failed`, which is only left through [`LinkSession::close`]. Sessions are
//! never reused after a failure; the caller builds a new one on top of a
//! fresh [`Transport`].

use crate::protocol::{RawResponse, RequestFrame, MAIN_INFO_REPLY_LENGTH};
use crate::telemetry::DeviceTarget;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// GATT service carrying the BMS serial protocol.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
/// Characteristic the BMS notifies responses on.
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000fff1_0000_1000_8000_00805f9b34fb);
/// Characteristic requests are written to.
pub const WRITE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x0000fff2_0000_1000_8000_00805f9b34fb);

/// Service and characteristic identifiers a device must expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub notify: Uuid,
    pub write: Uuid,
}

impl Default for GattProfile {
    fn default() -> Self {
        Self {
            service: SERVICE_UUID,
            notify: NOTIFY_CHARACTERISTIC_UUID,
            write: WRITE_CHARACTERISTIC_UUID,
        }
    }
}

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement<P> {
    pub peripheral: P,
    /// Hardware address or platform identifier containing it.
    pub address: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Errors reported by a [`Transport`] backend.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),
    #[error("GATT endpoint {0} not found")]
    ServiceMissing(Uuid),
    #[error("Not connected")]
    NotConnected,
    #[error("Notification stream closed")]
    StreamClosed,
    #[error("{0}")]
    Backend(String),
}

/// Link layer primitives a [`LinkSession`] is built on.
///
/// One transport instance backs exactly one session.
#[allow(async_fn_in_trait)]
pub trait Transport {
    type Peripheral: Clone + fmt::Debug;

    /// Listens for advertisements for the whole `window`.
    async fn scan(
        &mut self,
        window: Duration,
    ) -> std::result::Result<Vec<Advertisement<Self::Peripheral>>, TransportError>;

    /// Connects and resolves the endpoints of `profile`.
    ///
    /// Missing endpoints are reported as [`TransportError::ServiceMissing`].
    async fn connect(
        &mut self,
        peripheral: &Self::Peripheral,
        profile: &GattProfile,
    ) -> std::result::Result<(), TransportError>;

    /// Enables notifications; every delivery arrives as one message.
    async fn subscribe(
        &mut self,
    ) -> std::result::Result<UnboundedReceiver<Vec<u8>>, TransportError>;

    async fn write(&mut self, frame: &[u8]) -> std::result::Result<(), TransportError>;

    /// Releases the link. Must succeed when nothing is connected.
    async fn disconnect(&mut self) -> std::result::Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    FoundTarget,
    Connected,
    SubscribedReady,
    AwaitingResponse,
    Failed,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No target configured, both address and name are empty")]
    NoTarget,
    #[error("Device {target} not found within {window:?}")]
    NotFound { target: String, window: Duration },
    #[error("Connect failed: {0}")]
    Connect(#[source] TransportError),
    #[error("Required GATT endpoint {0} missing, wrong device or firmware")]
    ServiceMissing(Uuid),
    #[error("Subscribe failed: {0}")]
    Subscribe(#[source] TransportError),
    #[error("No complete response within {timeout:?}, received {received} of {expected} bytes")]
    Timeout {
        timeout: Duration,
        received: usize,
        expected: usize,
    },
    #[error("Transport error: {0}")]
    Transport(#[source] TransportError),
    #[error("Operation not allowed in state {0:?}")]
    InvalidState(SessionState),
}

impl Error {
    /// Configuration faults: retrying will not help until the setup changes.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, Error::NoTarget | Error::ServiceMissing(_))
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Index of the advertisement to connect to: address match first, then name.
pub fn select_target<P>(advertisements: &[Advertisement<P>], target: &DeviceTarget) -> Option<usize> {
    advertisements
        .iter()
        .position(|ad| target.matches_address(&ad.address))
        .or_else(|| {
            advertisements.iter().position(|ad| {
                ad.name
                    .as_deref()
                    .map_or(false, |name| target.matches_name(name))
            })
        })
}

pub struct LinkSession<T: Transport> {
    transport: T,
    target: DeviceTarget,
    profile: GattProfile,
    state: SessionState,
    notifications: Option<UnboundedReceiver<Vec<u8>>>,
    link_attempted: bool,
}

impl<T: Transport> LinkSession<T> {
    pub fn new(transport: T, target: DeviceTarget, profile: GattProfile) -> Self {
        Self {
            transport,
            target,
            profile,
            state: SessionState::Idle,
            notifications: None,
            link_attempted: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> &DeviceTarget {
        &self.target
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::SubscribedReady
    }

    fn transition(&mut self, state: SessionState) {
        log::debug!("session {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn expect_state(&self, expected: SessionState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState(self.state));
        }
        Ok(())
    }

    fn fail(&mut self, err: Error) -> Error {
        log::warn!("session failed: {err}");
        self.transition(SessionState::Failed);
        err
    }

    /// Scans for `window` and returns the peripheral matching the target.
    pub async fn discover(&mut self, window: Duration) -> Result<T::Peripheral> {
        self.expect_state(SessionState::Idle)?;
        if !self.target.is_configured() {
            return Err(self.fail(Error::NoTarget));
        }
        self.transition(SessionState::Scanning);
        log::info!("Scanning {window:?} for {}", self.target);

        let advertisements = match self.transport.scan(window).await {
            Ok(advertisements) => advertisements,
            Err(err) => return Err(self.fail(Error::Transport(err))),
        };
        log::debug!("Found {} BLE devices", advertisements.len());
        for ad in &advertisements {
            log::trace!(
                "advertisement {} [{}] RSSI {:?}",
                ad.name.as_deref().unwrap_or("Unknown"),
                ad.address,
                ad.rssi
            );
        }

        match select_target(&advertisements, &self.target) {
            Some(index) => {
                let ad = &advertisements[index];
                log::info!(
                    "Selected BMS {} [{}]",
                    ad.name.as_deref().unwrap_or("Unknown"),
                    ad.address
                );
                let peripheral = ad.peripheral.clone();
                self.transition(SessionState::FoundTarget);
                Ok(peripheral)
            }
            None => {
                let target = self.target.to_string();
                Err(self.fail(Error::NotFound { target, window }))
            }
        }
    }

    /// Connects to a discovered peripheral and resolves its endpoints.
    pub async fn connect(&mut self, peripheral: &T::Peripheral) -> Result<()> {
        self.expect_state(SessionState::FoundTarget)?;
        log::info!("Connecting to {peripheral:?}");
        self.link_attempted = true;
        match self.transport.connect(peripheral, &self.profile).await {
            Ok(()) => {
                self.transition(SessionState::Connected);
                Ok(())
            }
            Err(TransportError::ServiceMissing(uuid)) => Err(self.fail(Error::ServiceMissing(uuid))),
            Err(err) => Err(self.fail(Error::Connect(err))),
        }
    }

    pub async fn subscribe(&mut self) -> Result<()> {
        self.expect_state(SessionState::Connected)?;
        match self.transport.subscribe().await {
            Ok(receiver) => {
                self.notifications = Some(receiver);
                self.transition(SessionState::SubscribedReady);
                log::info!("Notifications enabled on {}", self.profile.notify);
                Ok(())
            }
            Err(err) => Err(self.fail(Error::Subscribe(err))),
        }
    }

    /// Runs discover, connect and subscribe in sequence.
    pub async fn establish(&mut self, scan_window: Duration) -> Result<()> {
        let peripheral = self.discover(scan_window).await?;
        self.connect(&peripheral).await?;
        self.subscribe().await
    }

    /// Writes `frame` and waits until a full response has been accumulated.
    ///
    /// On timeout the partial response is discarded and the session fails.
    pub async fn request(&mut self, frame: &RequestFrame, timeout: Duration) -> Result<RawResponse> {
        self.expect_state(SessionState::SubscribedReady)?;
        let Some(mut notifications) = self.notifications.take() else {
            return Err(self.fail(Error::InvalidState(SessionState::SubscribedReady)));
        };

        // drop leftovers of an earlier exchange so they are not glued onto this response
        while let Ok(stale) = notifications.try_recv() {
            log::debug!("Discarding stale notification: {}", hex::encode(&stale));
        }

        log::trace!("TX: {}", hex::encode(&**frame));
        if let Err(err) = self.transport.write(frame).await {
            return Err(self.fail(Error::Transport(err)));
        }
        self.transition(SessionState::AwaitingResponse);

        let mut buffer = Vec::with_capacity(MAIN_INFO_REPLY_LENGTH);
        let outcome = tokio::time::timeout(
            timeout,
            accumulate(&mut notifications, &mut buffer, MAIN_INFO_REPLY_LENGTH),
        )
        .await;
        match outcome {
            Ok(Ok(())) => {
                self.notifications = Some(notifications);
                self.transition(SessionState::SubscribedReady);
                log::debug!("Response received: {} bytes", buffer.len());
                Ok(RawResponse::from(buffer))
            }
            Ok(Err(err)) => Err(self.fail(Error::Transport(err))),
            Err(_) => {
                log::debug!("Discarding partial response: {}", hex::encode(&buffer));
                Err(self.fail(Error::Timeout {
                    timeout,
                    received: buffer.len(),
                    expected: MAIN_INFO_REPLY_LENGTH,
                }))
            }
        }
    }

    /// Releases the link. Safe to call in any state and more than once.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.notifications = None;
        if self.link_attempted {
            match self.transport.disconnect().await {
                Ok(()) => log::info!("Disconnected from {}", self.target),
                Err(err) => log::debug!("Disconnect from {} failed: {err}", self.target),
            }
        }
        self.transition(SessionState::Closed);
    }
}

async fn accumulate(
    notifications: &mut UnboundedReceiver<Vec<u8>>,
    buffer: &mut Vec<u8>,
    expected: usize,
) -> std::result::Result<(), TransportError> {
    while buffer.len() < expected {
        match notifications.recv().await {
            Some(chunk) => {
                log::trace!("RX notification: {}", hex::encode(&chunk));
                buffer.extend_from_slice(&chunk);
            }
            None => return Err(TransportError::StreamClosed),
        }
    }
    Ok(())
}
