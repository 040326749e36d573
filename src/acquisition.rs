//! Poll cadence and reconnection policy.
//!
//! [`Acquisition`] is the only writer of the [`SnapshotCache`]. Every fault
//! is folded into the published [`ServiceStatus`]; the loop itself only
//! returns once shutdown has been requested.

use crate::cache::SnapshotCache;
use crate::protocol::{self, ChecksumKind, RequestFrame};
use crate::session::{self, GattProfile, LinkSession, SessionState, Transport};
use crate::telemetry::{DeviceTarget, FaultKind, LinkState, ServiceStatus};
use chrono::Utc;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct Settings {
    pub target: DeviceTarget,
    pub profile: GattProfile,
    /// Distance between cycle starts.
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub scan_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Consecutive invalid responses tolerated before reconnecting.
    pub max_protocol_faults: u32,
    pub checksum: ChecksumKind,
    pub total_capacity_ah: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target: DeviceTarget::default(),
            profile: GattProfile::default(),
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
            scan_timeout: Duration::from_secs(10),
            backoff_min: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            max_protocol_faults: 3,
            checksum: ChecksumKind::default(),
            total_capacity_ah: 230.0,
        }
    }
}

/// Exponential backoff with up to 10% jitter, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            attempt: 0,
        }
    }

    fn base_delay(&self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        self.min.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.attempt = self.attempt.saturating_add(1);
        let jitter_limit = base.as_millis() as u64 / 10;
        let jitter = if jitter_limit > 0 {
            rand::thread_rng().gen_range(0..=jitter_limit)
        } else {
            0
        };
        (base + Duration::from_millis(jitter)).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Resolves once shutdown was requested or every sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub struct Acquisition<T: Transport, F> {
    settings: Settings,
    cache: Arc<SnapshotCache>,
    new_transport: F,
    session: Option<LinkSession<T>>,
    status: ServiceStatus,
    protocol_faults: u32,
    backoff: Backoff,
    request: RequestFrame,
}

impl<T, F> Acquisition<T, F>
where
    T: Transport,
    F: FnMut() -> T,
{
    /// `new_transport` is called once per connection attempt.
    pub fn new(settings: Settings, cache: Arc<SnapshotCache>, new_transport: F) -> Self {
        let request = protocol::build_main_info_request_with(settings.checksum);
        let backoff = Backoff::new(settings.backoff_min, settings.backoff_max);
        Self {
            settings,
            cache,
            new_transport,
            session: None,
            status: ServiceStatus::new(Utc::now()),
            protocol_faults: 0,
            backoff,
            request,
        }
    }

    pub fn status(&self) -> &ServiceStatus {
        &self.status
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Polls until `shutdown` turns `true` or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let period = self.settings.poll_interval.max(MIN_POLL_INTERVAL);
        log::info!(
            "Acquisition started for {}, polling every {period:?}",
            self.settings.target
        );
        self.publish();

        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }
            let retry_in = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                retry_in = self.cycle() => retry_in,
            };
            if let Some(delay) = retry_in {
                log::info!("Retrying in {delay:?}");
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown) => break,
                    _ = time::sleep(delay) => {}
                }
                ticker.reset_immediately();
            }
        }
        self.shutdown().await;
    }

    /// One pass: (re)establish the link if needed, then poll once.
    ///
    /// Returns the delay to wait before the next attempt if the link could
    /// not be set up.
    async fn cycle(&mut self) -> Option<Duration> {
        if !self.session.as_ref().is_some_and(|session| session.is_ready()) {
            self.close_session().await;
            if let Err(err) = self.establish().await {
                let fault = if err.is_mismatch() {
                    FaultKind::Mismatch
                } else {
                    FaultKind::Transport
                };
                self.close_session().await;
                self.fail(fault, &err);
                return Some(self.backoff.next_delay());
            }
            self.backoff.reset();
        }
        self.poll().await;
        None
    }

    fn session_mut(&mut self) -> Result<&mut LinkSession<T>, session::Error> {
        self.session
            .as_mut()
            .ok_or(session::Error::InvalidState(SessionState::Closed))
    }

    async fn establish(&mut self) -> Result<(), session::Error> {
        // stored before any await so a cancelled attempt is still closed on shutdown
        self.session = Some(LinkSession::new(
            (self.new_transport)(),
            self.settings.target.clone(),
            self.settings.profile,
        ));
        self.protocol_faults = 0;

        self.set_state(LinkState::Scanning);
        let window = self.settings.scan_timeout;
        let peripheral = self.session_mut()?.discover(window).await?;

        self.set_state(LinkState::Connecting);
        self.session_mut()?.connect(&peripheral).await?;
        self.session_mut()?.subscribe().await?;

        self.set_state(LinkState::ConnectedIdle);
        Ok(())
    }

    async fn poll(&mut self) {
        self.set_state(LinkState::ConnectedAwaitingResponse);
        let request = self.request;
        let timeout = self.settings.request_timeout;
        let result = match self.session.as_mut() {
            Some(session) => session.request(&request, timeout).await,
            None => return,
        };

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.close_session().await;
                self.fail(FaultKind::Transport, &err);
                return;
            }
        };

        let captured_at = Utc::now();
        match protocol::parse_main_info_response(
            &response,
            self.settings.checksum,
            &self.settings.target,
            self.settings.total_capacity_ah,
            captured_at,
        ) {
            Ok(snapshot) => {
                log::debug!(
                    "Pack {:.3} V, {:.1} A, SOC {:.1} %",
                    snapshot.pack_voltage(),
                    snapshot.current(),
                    snapshot.soc()
                );
                self.protocol_faults = 0;
                self.cache.replace_snapshot(snapshot);
                self.status.record_success(captured_at);
                self.set_state(LinkState::ConnectedIdle);
            }
            Err(err) => {
                self.protocol_faults += 1;
                let threshold = self.settings.max_protocol_faults.max(1);
                log::warn!(
                    "Invalid response ({}/{threshold}): {err}",
                    self.protocol_faults
                );
                self.status.record_failure(FaultKind::Protocol, &err);
                if self.protocol_faults >= threshold {
                    log::warn!("Too many invalid responses, reconnecting");
                    self.close_session().await;
                    // a link that keeps garbling frames is treated as broken
                    self.status.fault = Some(FaultKind::Transport);
                    self.status.last_error = Some(format!(
                        "{} invalid responses in a row, last: {err}",
                        self.protocol_faults
                    ));
                    self.set_state(LinkState::Disconnected);
                } else {
                    self.set_state(LinkState::ConnectedIdle);
                }
            }
        }
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close().await;
        }
        self.session = None;
    }

    async fn shutdown(&mut self) {
        log::info!("Acquisition stopping");
        let timeout = self.settings.request_timeout;
        if time::timeout(timeout, self.close_session()).await.is_err() {
            log::warn!("Disconnect did not finish within {timeout:?}");
        }
        self.set_state(LinkState::Disconnected);
    }

    fn fail(&mut self, fault: FaultKind, err: &impl fmt::Display) {
        log::warn!("{fault:?} fault: {err}");
        self.status.record_failure(fault, err);
        self.set_state(LinkState::Disconnected);
    }

    fn set_state(&mut self, state: LinkState) {
        self.status.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.cache.replace_status(self.status.clone());
    }
}
