//! End-to-end scenarios for the device lab controller
//!
//! Drives the full component stack (hub, registry, session manager,
//! supervisor, mirror pumps, framed transport) with mock adapters and a
//! stub driver binary.

use devicelab_common::{
    DeviceStatus, DriverConfig, Event, EventSink, LabClient, MirrorConfig, Platform, Request,
    SessionConfig,
};
use devicelab_server::testing::{MockAdapter, ShotScript};
use devicelab_server::{
    DeviceRegistry, DriverSupervisor, EventHub, MirrorPumps, RequestRouter, SessionManager,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;

struct Lab {
    hub: Arc<EventHub>,
    registry: Arc<DeviceRegistry>,
    sessions: Arc<SessionManager>,
    supervisor: Arc<DriverSupervisor>,
    router: Arc<RequestRouter>,
    adapter: Arc<MockAdapter>,
    addr: String,
    _dir: tempfile::TempDir,
}

/// Stub driver that prints the ready sentinel and stays alive
fn write_stub_driver(dir: &std::path::Path) -> String {
    let path = dir.join("driver-stub");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         echo '[Appium] Welcome to Appium v2.5.1'\n\
         echo '[Appium] Appium REST http interface listener started on 0.0.0.0'\n\
         sleep 120\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path.to_string_lossy().into_owned()
}

async fn start_lab(base_port: u16) -> Lab {
    let dir = tempfile::tempdir().unwrap();
    let driver_binary = write_stub_driver(dir.path());

    let adapter = MockAdapter::new(Platform::Android, &["serial-1", "serial-2"]);

    let hub = EventHub::new();
    let sink: Arc<dyn EventSink> = hub.clone();
    let supervisor = Arc::new(DriverSupervisor::new(
        DriverConfig {
            binary: driver_binary,
            base_port,
            port_range: 10,
            start_timeout_secs: 10,
            log_capacity: 500,
        },
        sink.clone(),
    ));
    let registry = Arc::new(DeviceRegistry::new(
        vec![adapter.clone()],
        supervisor.clone(),
        sink.clone(),
    ));
    let sessions = Arc::new(SessionManager::new(
        SessionConfig::default(),
        registry.clone(),
        sink.clone(),
    ));
    let pumps = Arc::new(MirrorPumps::new(MirrorConfig::default(), registry.clone()));
    let router = RequestRouter::new(
        hub.clone(),
        registry.clone(),
        sessions.clone(),
        supervisor.clone(),
        pumps,
        "localhost".to_string(),
    );

    registry.discovery_cycle().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(router.clone().serve(listener, Default::default(), 600));

    Lab {
        hub,
        registry,
        sessions,
        supervisor,
        router,
        adapter,
        addr,
        _dir: dir,
    }
}

/// Drain broadcast events until the next screen frame
async fn next_frame(client: &mut LabClient) -> devicelab_common::ScreenFrame {
    loop {
        let event = timeout(Duration::from_secs(5), client.next_event())
            .await
            .expect("frame within the cap interval")
            .expect("channel open");
        if let Event::ScreenUpdate { frame, .. } = event {
            return frame;
        }
    }
}

async fn device_id_for(lab: &Lab, serial: &str) -> String {
    lab.registry
        .list()
        .await
        .into_iter()
        .find(|d| d.serial == serial)
        .expect("device discovered")
        .id
}

#[tokio::test]
async fn scenario_reserve_auto_start_session() {
    let lab = start_lab(24723).await;
    let device_id = device_id_for(&lab, "serial-1").await;

    let client = LabClient::connect(&lab.addr).await.unwrap();
    let envelope = client
        .request_with_timeout(
            Request::AutoStart {
                device_id: device_id.clone(),
                user_id: Some("alice".to_string()),
                duration_minutes: Some(120),
                purpose: Some("wdio".to_string()),
            },
            Duration::from_secs(20),
        )
        .await
        .unwrap();
    assert!(envelope.success, "auto-start failed: {:?}", envelope.error);
    let data = envelope.data.unwrap();

    // a driver is running on a port in the configured range
    let port = data["port"].as_u64().unwrap() as u16;
    assert!((24723..24733).contains(&port));
    let url = data["url"].as_str().unwrap();
    assert_eq!(url, format!("http://localhost:{}/wd/hub", port));
    assert_eq!(data["capabilities"]["platformName"], "Android");

    // one active reservation for alice with a two-hour deadline
    let reservation = lab.sessions.active_reservation(&device_id).await.unwrap();
    assert_eq!(reservation.user_id, "alice");
    let minutes = (reservation.end_time - reservation.start_time).num_minutes();
    assert_eq!(minutes, 120);

    // one active session for alice; the device is held
    let session = lab.sessions.active_session(&device_id).await.unwrap();
    assert_eq!(session.user_id, "alice");
    let device = lab.registry.get(&device_id).await.unwrap();
    assert_eq!(device.status, DeviceStatus::InUse);
    assert_eq!(device.reserved_by.as_deref(), Some("alice"));

    let info = lab.supervisor.status(&device_id).await.unwrap();
    assert_eq!(info.port, port);
}

#[tokio::test]
async fn scenario_release_cascades() {
    let lab = start_lab(24750).await;
    let device_id = device_id_for(&lab, "serial-1").await;

    let client = LabClient::connect(&lab.addr).await.unwrap();
    client
        .request_with_timeout(
            Request::AutoStart {
                device_id: device_id.clone(),
                user_id: Some("alice".to_string()),
                duration_minutes: None,
                purpose: None,
            },
            Duration::from_secs(20),
        )
        .await
        .unwrap();
    assert!(lab.supervisor.status(&device_id).await.is_some());

    // watch for the post-release broadcast
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    lab.hub.register("watcher", tx).await;

    let envelope = client
        .request(Request::StopDriver {
            device_id: device_id.clone(),
        })
        .await
        .unwrap();
    assert!(envelope.success, "stop failed: {:?}", envelope.error);

    // driver record gone, session ended, reservation completed, device online
    assert!(lab.supervisor.status(&device_id).await.is_none());
    assert!(lab.sessions.active_session(&device_id).await.is_none());
    assert!(lab.sessions.active_reservation(&device_id).await.is_none());
    let device = lab.registry.get(&device_id).await.unwrap();
    assert_eq!(device.status, DeviceStatus::Online);
    assert!(device.reserved_by.is_none());

    // a device-updated broadcast carried the post-state
    let mut saw_online_update = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(500), rx.recv()).await {
        if let Event::DeviceUpdated { device, .. } = event {
            if device.id == device_id && device.status == DeviceStatus::Online {
                saw_online_update = true;
                break;
            }
        }
    }
    assert!(saw_online_update);

    // the freed port is available again for a new start
    let envelope = client
        .request_with_timeout(
            Request::AutoStart {
                device_id: device_id.clone(),
                user_id: Some("bob".to_string()),
                duration_minutes: None,
                purpose: None,
            },
            Duration::from_secs(20),
        )
        .await
        .unwrap();
    assert!(envelope.success);
}

#[tokio::test]
async fn scenario_mirror_backpressure_and_shedding() {
    let lab = start_lab(24770).await;
    let device_id = device_id_for(&lab, "serial-1").await;

    // captures are slow relative to the requested rate
    lab.adapter
        .set_shot_script(ShotScript::Ok(Duration::from_millis(150)));

    let mut client = LabClient::connect(&lab.addr).await.unwrap();
    let envelope = client
        .request(Request::StartMirror {
            device_id: device_id.clone(),
            fps: Some(10),
        })
        .await
        .unwrap();
    assert!(envelope.success);
    // requested 10 fps, capped to 1 on Android
    assert_eq!(envelope.data.unwrap()["fps"], 1);

    // first frame arrives from the immediate tick; the next not before ~1s
    let first_ts = next_frame(&mut client).await.timestamp;
    let second_ts = next_frame(&mut client).await.timestamp;
    let gap = (second_ts - first_ts).num_milliseconds();
    assert!(gap >= 700, "frames paced by the cap, got {}ms", gap);

    // resource exhaustion terminates the pump and surfaces an error event
    lab.adapter.set_shot_script(ShotScript::Exhausted);
    let mut saw_error = false;
    for _ in 0..5 {
        match timeout(Duration::from_secs(3), client.next_event()).await {
            Ok(Some(Event::Error { message, .. })) => {
                assert!(message.contains("screen mirror stopped"));
                saw_error = true;
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_error, "expected shed notification");

    // no further frames arrive after shedding
    let quiet = timeout(Duration::from_millis(1500), client.next_event()).await;
    match quiet {
        Err(_) => {}
        Ok(Some(Event::ScreenUpdate { .. })) => panic!("frame after shed"),
        Ok(_) => {}
    }
}

#[tokio::test]
async fn scenario_discovery_churn_over_channel() {
    let lab = start_lab(24790).await;

    let client = LabClient::connect(&lab.addr).await.unwrap();

    lab.adapter.set_serials(&["serial-1"]);
    let envelope = client.request(Request::RefreshDevices).await.unwrap();
    assert!(envelope.success);
    let devices = envelope.data.unwrap();
    let devices = devices.as_array().unwrap();
    assert_eq!(devices.len(), 2, "offline device stays in the registry");
    let offline = devices
        .iter()
        .find(|d| d["serial"] == "serial-2")
        .unwrap();
    assert_eq!(offline["status"], "offline");

    lab.adapter.set_serials(&["serial-1", "serial-2"]);
    let envelope = client.request(Request::RefreshDevices).await.unwrap();
    let devices = envelope.data.unwrap();
    let back = devices
        .as_array()
        .unwrap()
        .iter()
        .find(|d| d["serial"] == "serial-2")
        .unwrap()
        .clone();
    assert_eq!(back["status"], "online");
}

#[tokio::test]
async fn scenario_device_disappears_mid_session() {
    let lab = start_lab(24810).await;
    let device_id = device_id_for(&lab, "serial-1").await;

    lab.sessions
        .reserve(&device_id, "alice", Some(60), None)
        .await
        .unwrap();
    let session = lab.sessions.create_session(&device_id, "alice").await.unwrap();

    // the device vanishes from discovery
    lab.adapter.set_serials(&["serial-2"]);
    lab.registry.discovery_cycle().await;
    let device = lab.registry.get(&device_id).await.unwrap();
    assert_eq!(device.status, DeviceStatus::Offline);

    // the session stays active until explicitly ended
    let session_now = lab.sessions.get_session(&session.id).await.unwrap();
    assert_eq!(
        session_now.status,
        devicelab_common::SessionStatus::Active
    );

    // explicit end leaves the device offline with the hold cleared
    lab.sessions.end_session(&session.id).await.unwrap();
    let device = lab.registry.get(&device_id).await.unwrap();
    assert_eq!(device.status, DeviceStatus::Offline);
    assert!(device.reserved_by.is_none());
}

#[tokio::test]
async fn scenario_connect_receives_snapshot() {
    let lab = start_lab(24830).await;
    let _ = &lab.router;

    let mut client = LabClient::connect(&lab.addr).await.unwrap();
    let event = timeout(Duration::from_secs(3), client.next_event())
        .await
        .expect("snapshot on connect")
        .unwrap();
    match event {
        Event::DeviceList { devices, .. } => {
            assert_eq!(devices.len(), 2);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn scenario_wrong_platform_command_over_channel() {
    // iOS-only stack: shell must be rejected before the adapter is invoked
    let ios_adapter = MockAdapter::new(Platform::Ios, &["UDID-9"]);

    let hub = EventHub::new();
    let sink: Arc<dyn EventSink> = hub.clone();
    let supervisor = Arc::new(DriverSupervisor::new(DriverConfig::default(), sink.clone()));
    let registry = Arc::new(DeviceRegistry::new(
        vec![ios_adapter],
        supervisor.clone(),
        sink.clone(),
    ));
    registry.discovery_cycle().await;
    let device_id = registry.list().await[0].id.clone();

    let sessions = Arc::new(SessionManager::new(
        SessionConfig::default(),
        registry.clone(),
        sink.clone(),
    ));
    let pumps = Arc::new(MirrorPumps::new(MirrorConfig::default(), registry.clone()));
    let router = RequestRouter::new(hub, registry, sessions, supervisor, pumps, "localhost".into());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(router.serve(listener, Default::default(), 600));

    let client = LabClient::connect(&addr).await.unwrap();
    let envelope = client
        .request(Request::Command {
            device_id,
            payload: devicelab_common::CommandPayload::Shell {
                command: "ls".to_string(),
            },
        })
        .await
        .unwrap();
    assert!(!envelope.success);
    let error = envelope.error.unwrap();
    assert!(error.contains("not supported"));
    assert!(error.contains("iOS"));
}
