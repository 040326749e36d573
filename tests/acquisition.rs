mod common;

use common::{corrupted_frame, main_info_frame, settings, Reply, Script, SharedScript};
use dalyble_lib::acquisition::Acquisition;
use dalyble_lib::cache::{read_mirror, FileMirror, SnapshotCache};
use dalyble_lib::protocol::CELL_COUNT;
use dalyble_lib::telemetry::{DeviceTarget, FaultKind, LinkState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;

fn valid() -> Reply {
    Reply::frame(main_info_frame(3318, 904))
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_transport_failure() {
    let script = SharedScript::with_replies([valid(), Reply::WriteError, valid()]);
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let acquisition = Acquisition::new(settings(), cache.clone(), script.transport_factory());

    let driver = async {
        sleep(Duration::from_secs(7)).await;
        let (snapshot, status) = cache.read();
        let first = snapshot.expect("first poll succeeded");
        assert_eq!(status.state, LinkState::Disconnected);
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.fault, Some(FaultKind::Transport));
        assert_eq!(script.lock().disconnects, 1);

        sleep(Duration::from_secs(5)).await;
        let (snapshot, status) = cache.read();
        let second = snapshot.unwrap();
        assert_eq!(status.state, LinkState::ConnectedIdle);
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.total_reads, 2);
        assert_eq!(status.total_failures, 1);
        assert!(second.captured_at() >= first.captured_at());
        assert_eq!(script.lock().connects, 2);

        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);

    let script = script.lock();
    assert_eq!(script.disconnects, script.connects);
    assert_eq!(cache.status().state, LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn corrupted_response_keeps_previous_snapshot() {
    let script = SharedScript::with_replies([
        Reply::frame(main_info_frame(3300, 500)),
        Reply::frame(corrupted_frame()),
    ]);
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let acquisition = Acquisition::new(settings(), cache.clone(), script.transport_factory());

    let driver = async {
        sleep(Duration::from_secs(2)).await;
        let before = cache.snapshot().unwrap();

        sleep(Duration::from_secs(5)).await;
        let (after, status) = cache.read();
        let after = after.unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.soc(), 50.0);
        assert_eq!(status.fault, Some(FaultKind::Protocol));
        assert_eq!(status.consecutive_failures, 1);
        // soft fault, link stays up
        assert_eq!(status.state, LinkState::ConnectedIdle);
        assert_eq!(script.lock().connects, 1);
        assert_eq!(script.lock().disconnects, 0);

        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);
}

#[tokio::test(start_paused = true)]
async fn repeated_protocol_faults_force_reconnect() {
    let script = SharedScript::with_replies([
        Reply::frame(corrupted_frame()),
        Reply::frame(corrupted_frame()),
        Reply::frame(corrupted_frame()),
    ]);
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let acquisition = Acquisition::new(settings(), cache.clone(), script.transport_factory());

    let driver = async {
        sleep(Duration::from_secs(7)).await;
        assert_eq!(cache.status().state, LinkState::ConnectedIdle);
        assert_eq!(cache.status().fault, Some(FaultKind::Protocol));
        assert_eq!(script.lock().disconnects, 0);

        sleep(Duration::from_secs(5)).await;
        let (snapshot, status) = cache.read();
        assert!(snapshot.is_none());
        assert_eq!(status.state, LinkState::Disconnected);
        assert_eq!(status.consecutive_failures, 3);
        assert_eq!(status.fault, Some(FaultKind::Transport));
        assert!(status
            .last_error
            .as_deref()
            .is_some_and(|e| e.starts_with("3 invalid responses in a row")));
        assert_eq!(script.lock().connects, 1);
        assert_eq!(script.lock().disconnects, 1);

        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);
}

#[tokio::test(start_paused = true)]
async fn silent_device_times_out() {
    let script = SharedScript::with_replies([Reply::Silence]);
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let acquisition = Acquisition::new(settings(), cache.clone(), script.transport_factory());

    let driver = async {
        sleep(Duration::from_secs(3)).await;
        let (snapshot, status) = cache.read();
        assert!(snapshot.is_none());
        assert_eq!(status.state, LinkState::Disconnected);
        assert_eq!(status.fault, Some(FaultKind::Transport));
        assert!(status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("received 0 of 129 bytes")));
        assert_eq!(script.lock().disconnects, 1);

        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);
}

#[tokio::test(start_paused = true)]
async fn closed_notification_stream_is_a_transport_fault() {
    let script = SharedScript::with_replies([Reply::CloseStream, valid()]);
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let acquisition = Acquisition::new(settings(), cache.clone(), script.transport_factory());

    let driver = async {
        sleep(Duration::from_millis(500)).await;
        assert_eq!(cache.status().fault, Some(FaultKind::Transport));

        sleep(Duration::from_secs(5)).await;
        assert!(cache.snapshot().is_some());
        assert_eq!(cache.status().consecutive_failures, 0);

        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);
}

#[tokio::test(start_paused = true)]
async fn shutdown_interrupts_pending_request() {
    let script = SharedScript::with_replies([Reply::Silence]);
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let mut settings = settings();
    settings.request_timeout = Duration::from_secs(30);
    settings.poll_interval = Duration::from_secs(60);
    let acquisition = Acquisition::new(settings, cache.clone(), script.transport_factory());

    let driver = async {
        sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.status().state, LinkState::ConnectedAwaitingResponse);
        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);

    assert_eq!(script.lock().disconnects, 1);
    assert_eq!(cache.status().state, LinkState::Disconnected);
    assert!(cache.snapshot().is_none());
}

#[tokio::test(start_paused = true)]
async fn dropped_shutdown_sender_stops_the_loop() {
    let script = SharedScript::with_replies([valid()]);
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let acquisition = Acquisition::new(settings(), cache.clone(), script.transport_factory());

    let driver = async move {
        sleep(Duration::from_secs(2)).await;
        drop(tx);
    };
    tokio::join!(acquisition.run(rx), driver);
    assert_eq!(script.lock().disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn missing_target_is_reported_as_mismatch() {
    let script = SharedScript::default();
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let mut settings = settings();
    settings.target = DeviceTarget::new("", "");
    let acquisition = Acquisition::new(settings, cache.clone(), script.transport_factory());

    let driver = async {
        sleep(Duration::from_secs(1)).await;
        let status = cache.status();
        assert_eq!(status.fault, Some(FaultKind::Mismatch));
        assert_eq!(status.state, LinkState::Disconnected);
        assert_eq!(script.lock().scans, 0);
        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);
}

#[tokio::test(start_paused = true)]
async fn missing_service_is_reported_as_mismatch() {
    let script = SharedScript::new(Script {
        missing_service: true,
        ..Script::default()
    });
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let acquisition = Acquisition::new(settings(), cache.clone(), script.transport_factory());

    let driver = async {
        sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.status().fault, Some(FaultKind::Mismatch));
        // the half-open link is released
        assert_eq!(script.lock().disconnects, 1);
        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_connect_releases_link() {
    let script = SharedScript::new(Script {
        connect_hangs: true,
        ..Script::default()
    });
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let acquisition = Acquisition::new(settings(), cache.clone(), script.transport_factory());

    let driver = async {
        sleep(Duration::from_secs(1)).await;
        assert_eq!(cache.status().state, LinkState::Connecting);
        assert_eq!(script.lock().disconnects, 0);
        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);

    let script = script.lock();
    assert_eq!(script.connects, 1);
    assert_eq!(script.disconnects, 1);
    assert_eq!(cache.status().state, LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn discovery_failures_back_off() {
    let script = SharedScript::new(Script {
        advertisements: Vec::new(),
        ..Script::default()
    });
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let acquisition = Acquisition::new(settings(), cache.clone(), script.transport_factory());

    // attempts at 0s, ~2s, ~6s, ~14s
    let driver = async {
        sleep(Duration::from_secs(10)).await;
        let status = cache.status();
        assert_eq!(script.lock().scans, 3);
        assert_eq!(status.consecutive_failures, 3);
        assert_eq!(status.fault, Some(FaultKind::Transport));
        assert!(status.last_error.as_deref().is_some_and(|e| e.contains("not found")));
        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);
}

#[tokio::test(start_paused = true)]
async fn readers_see_complete_monotonic_snapshots() {
    let script = SharedScript::new(Script {
        fallback: valid(),
        ..Script::default()
    });
    let cache = Arc::new(SnapshotCache::new());
    let (tx, rx) = watch::channel(false);
    let acquisition = Acquisition::new(settings(), cache.clone(), script.transport_factory());

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let cache = cache.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut last = None;
            let mut reads = 0usize;
            while !stop.load(Ordering::Relaxed) {
                if let Some(snapshot) = cache.snapshot() {
                    assert_eq!(snapshot.cell_voltages().len(), CELL_COUNT);
                    if let Some(last) = last {
                        assert!(snapshot.captured_at() >= last);
                    }
                    last = Some(snapshot.captured_at());
                    reads += 1;
                }
                std::thread::yield_now();
            }
            reads
        })
    };

    let driver = async {
        sleep(Duration::from_secs(48)).await;
        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);
    stop.store(true, Ordering::Relaxed);
    reader.join().unwrap();

    assert_eq!(cache.status().total_reads, 10);
}

#[tokio::test(start_paused = true)]
async fn mirror_files_follow_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let script = SharedScript::with_replies([valid()]);
    let cache = Arc::new(SnapshotCache::with_mirror(FileMirror::new(dir.path())));
    let (tx, rx) = watch::channel(false);
    let acquisition = Acquisition::new(settings(), cache.clone(), script.transport_factory());

    let driver = async {
        sleep(Duration::from_secs(1)).await;
        let (snapshot, status) = read_mirror(dir.path()).unwrap();
        let snapshot = snapshot.unwrap();
        assert_eq!(snapshot.soc(), 90.4);
        assert!((snapshot.pack_voltage() - 53.088).abs() < 1e-3);
        assert_eq!(status.unwrap().state, LinkState::ConnectedIdle);
        tx.send(true).unwrap();
    };
    tokio::join!(acquisition.run(rx), driver);

    let (_, status) = read_mirror(dir.path()).unwrap();
    assert_eq!(status.unwrap().state, LinkState::Disconnected);
}
