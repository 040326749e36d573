#![allow(dead_code)]

use dalyble_lib::acquisition::Settings;
use dalyble_lib::protocol::{ChecksumKind, CELL_COUNT, HEADER, MAIN_INFO_REPLY_LENGTH};
use dalyble_lib::session::{Advertisement, GattProfile, Transport, TransportError, SERVICE_UUID};
use dalyble_lib::telemetry::DeviceTarget;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const ADDRESS: &str = "41:18:12:01:18:9F";
pub const NAME: &str = "DL-41181201189F";

/// What the fake BMS does after a request was written.
#[derive(Debug, Clone)]
pub enum Reply {
    Chunks(Vec<Vec<u8>>),
    Silence,
    WriteError,
    CloseStream,
}

impl Reply {
    /// A complete frame split the way a 20 byte MTU delivers it.
    pub fn frame(frame: Vec<u8>) -> Self {
        Reply::Chunks(frame.chunks(20).map(<[u8]>::to_vec).collect())
    }
}

#[derive(Debug)]
pub struct Script {
    pub advertisements: Vec<Advertisement<u8>>,
    pub missing_service: bool,
    /// `connect` never completes.
    pub connect_hangs: bool,
    pub replies: VecDeque<Reply>,
    /// Used once `replies` is exhausted.
    pub fallback: Reply,
    pub scans: usize,
    pub connects: usize,
    pub writes: usize,
    pub disconnects: usize,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            advertisements: vec![Advertisement {
                peripheral: 1,
                address: ADDRESS.to_string(),
                name: Some(NAME.to_string()),
                rssi: Some(-70),
            }],
            missing_service: false,
            connect_hangs: false,
            replies: VecDeque::new(),
            fallback: Reply::Silence,
            scans: 0,
            connects: 0,
            writes: 0,
            disconnects: 0,
        }
    }
}

#[derive(Clone, Default)]
pub struct SharedScript(Arc<Mutex<Script>>);

impl SharedScript {
    pub fn new(script: Script) -> Self {
        Self(Arc::new(Mutex::new(script)))
    }

    pub fn with_replies(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self::new(Script {
            replies: replies.into_iter().collect(),
            ..Script::default()
        })
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Script> {
        self.0.lock()
    }

    pub fn transport_factory(&self) -> impl FnMut() -> MockTransport {
        let script = self.clone();
        move || MockTransport {
            script: script.clone(),
            sender: None,
        }
    }
}

pub struct MockTransport {
    script: SharedScript,
    sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl Transport for MockTransport {
    type Peripheral = u8;

    async fn scan(
        &mut self,
        _window: Duration,
    ) -> Result<Vec<Advertisement<u8>>, TransportError> {
        let mut script = self.script.lock();
        script.scans += 1;
        Ok(script.advertisements.clone())
    }

    async fn connect(
        &mut self,
        _peripheral: &u8,
        _profile: &GattProfile,
    ) -> Result<(), TransportError> {
        let (hangs, missing_service) = {
            let mut script = self.script.lock();
            script.connects += 1;
            (script.connect_hangs, script.missing_service)
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        if missing_service {
            return Err(TransportError::ServiceMissing(SERVICE_UUID));
        }
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.sender = Some(sender);
        Ok(receiver)
    }

    async fn write(&mut self, _frame: &[u8]) -> Result<(), TransportError> {
        let reply = {
            let mut script = self.script.lock();
            script.writes += 1;
            let fallback = script.fallback.clone();
            script.replies.pop_front().unwrap_or(fallback)
        };
        match reply {
            Reply::Chunks(chunks) => {
                if let Some(sender) = &self.sender {
                    for chunk in chunks {
                        let _ = sender.send(chunk);
                    }
                }
                Ok(())
            }
            Reply::Silence => Ok(()),
            Reply::WriteError => Err(TransportError::Backend("write failed".to_string())),
            Reply::CloseStream => {
                self.sender = None;
                Ok(())
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.script.lock().disconnects += 1;
        self.sender = None;
        Ok(())
    }
}

/// A valid main info response with every cell at `cell_mv` and the given raw SOC.
pub fn main_info_frame(cell_mv: u16, soc_raw: u16) -> Vec<u8> {
    let mut frame = vec![0u8; MAIN_INFO_REPLY_LENGTH];
    frame[..2].copy_from_slice(&HEADER);
    frame[2] = 0x7c;
    for n_cell in 0..CELL_COUNT {
        let offset = 3 + 2 * n_cell;
        frame[offset..offset + 2].copy_from_slice(&cell_mv.to_be_bytes());
    }
    frame[68] = 70;
    frame[70] = 70;
    frame[85..87].copy_from_slice(&30000u16.to_be_bytes());
    frame[87..89].copy_from_slice(&soc_raw.to_be_bytes());
    frame[106] = 12;
    frame[108] = 0b011;
    let checksum = ChecksumKind::Sum16.encode(&frame[..MAIN_INFO_REPLY_LENGTH - 2]);
    frame[MAIN_INFO_REPLY_LENGTH - 2..].copy_from_slice(&checksum);
    frame
}

/// `main_info_frame` with one payload byte flipped.
pub fn corrupted_frame() -> Vec<u8> {
    let mut frame = main_info_frame(3318, 904);
    frame[40] ^= 0x01;
    frame
}

pub fn settings() -> Settings {
    Settings {
        target: DeviceTarget::new(ADDRESS, NAME),
        poll_interval: Duration::from_secs(5),
        request_timeout: Duration::from_secs(1),
        scan_timeout: Duration::from_secs(1),
        backoff_min: Duration::from_secs(2),
        backoff_max: Duration::from_secs(60),
        ..Settings::default()
    }
}
