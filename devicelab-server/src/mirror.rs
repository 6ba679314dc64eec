//! Screen-mirror pumps
//!
//! One paced capture loop per mirrored device, shared by every subscriber
//! watching that device. The loop keeps a single capture in flight: ticks
//! that arrive while a capture is pending are dropped, never queued. FPS is
//! requested by the client but capped per platform. Resource-exhaustion
//! signals from the adapter terminate the pump to shed load.

use crate::registry::DeviceRegistry;
use base64::Engine;
use devicelab_common::{
    Device, DeviceKind, Event, LabError, MirrorConfig, Platform, Result, ScreenFrame,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

type SubscriberMap = Arc<Mutex<HashMap<String, mpsc::Sender<Event>>>>;

struct Pump {
    subscribers: SubscriberMap,
    stop_tx: Option<oneshot::Sender<()>>,
}

/// Registry of per-device mirror pumps
pub struct MirrorPumps {
    config: MirrorConfig,
    registry: Arc<DeviceRegistry>,
    pumps: Arc<Mutex<HashMap<String, Pump>>>,
}

impl MirrorPumps {
    pub fn new(config: MirrorConfig, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            config,
            registry,
            pumps: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Hard FPS ceiling for a device
    fn fps_cap(&self, device: &Device) -> u32 {
        match (device.platform, device.kind) {
            (Platform::Ios, DeviceKind::Simulator) => self.config.simulator_fps_cap,
            _ => self.config.physical_fps_cap,
        }
    }

    /// Attach a subscriber to the device's pump, creating the pump if this
    /// is the first watcher. Returns the effective FPS.
    pub async fn start_mirror(
        &self,
        subscriber_id: &str,
        device: &Device,
        requested_fps: Option<u32>,
        sender: mpsc::Sender<Event>,
    ) -> Result<u32> {
        let cap = self.fps_cap(device);
        let effective_fps = requested_fps.unwrap_or(cap).clamp(1, cap);

        let mut pumps = self.pumps.lock().await;
        if let Some(pump) = pumps.get(&device.id) {
            pump.subscribers
                .lock()
                .await
                .insert(subscriber_id.to_string(), sender);
            debug!(
                "Subscriber {} joined existing pump for {}",
                subscriber_id, device.id
            );
            return Ok(effective_fps);
        }

        let adapter = self
            .registry
            .adapter_for(device.platform)
            .ok_or_else(|| LabError::server(format!("no adapter for {}", device.platform)))?;

        let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
        subscribers
            .lock()
            .await
            .insert(subscriber_id.to_string(), sender);

        let (stop_tx, stop_rx) = oneshot::channel();
        let task_subscribers = subscribers.clone();
        let pumps_handle = self.pumps.clone();
        let device_id = device.id.clone();
        let serial = device.serial.clone();

        tokio::spawn(run_pump(
            adapter,
            device_id.clone(),
            serial,
            effective_fps,
            task_subscribers,
            stop_rx,
            pumps_handle,
        ));

        pumps.insert(
            device.id.clone(),
            Pump {
                subscribers,
                stop_tx: Some(stop_tx),
            },
        );
        info!(
            "Started mirror pump for {} at {} fps (cap {})",
            device.id, effective_fps, cap
        );
        Ok(effective_fps)
    }

    /// Detach a subscriber; the pump stops when its watcher set empties
    pub async fn stop_mirror(&self, subscriber_id: &str, device_id: &str) {
        let mut pumps = self.pumps.lock().await;
        let Some(pump) = pumps.get_mut(device_id) else {
            return;
        };
        let now_empty = {
            let mut subscribers = pump.subscribers.lock().await;
            subscribers.remove(subscriber_id);
            subscribers.is_empty()
        };
        if now_empty {
            if let Some(tx) = pump.stop_tx.take() {
                let _ = tx.send(());
            }
            pumps.remove(device_id);
            info!("Stopped mirror pump for {}", device_id);
        }
    }

    /// Detach a subscriber from every pump (disconnect path)
    pub async fn drop_subscriber(&self, subscriber_id: &str) {
        let device_ids: Vec<String> = {
            let pumps = self.pumps.lock().await;
            pumps.keys().cloned().collect()
        };
        for device_id in device_ids {
            self.stop_mirror(subscriber_id, &device_id).await;
        }
    }

    pub async fn active_pumps(&self) -> usize {
        self.pumps.lock().await.len()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_pump(
    adapter: Arc<dyn devicelab_common::DeviceAdapter>,
    device_id: String,
    serial: String,
    fps: u32,
    subscribers: SubscriberMap,
    mut stop_rx: oneshot::Receiver<()>,
    pumps: Arc<Mutex<HashMap<String, Pump>>>,
) {
    let mut ticker = interval(Duration::from_millis(1000 / fps as u64));
    // ticks that land during a capture are skipped, not queued
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let in_flight = AtomicBool::new(false);
    let mut consecutive_failures = 0u32;

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {}
        }

        // single-slot gate; a pending capture drops this tick
        if in_flight.swap(true, Ordering::SeqCst) {
            continue;
        }
        let result = adapter.screenshot(&serial).await;
        in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(png) => {
                consecutive_failures = 0;
                let payload = base64::engine::general_purpose::STANDARD.encode(&png);
                let frame = ScreenFrame::png(device_id.clone(), payload);
                let delivered = deliver(&subscribers, Event::screen_update(frame)).await;
                if delivered == 0 {
                    debug!("Pump for {} has no subscribers left", device_id);
                    break;
                }
            }
            Err(e) if e.is_exhaustion() => {
                warn!("Shedding mirror pump for {}: {}", device_id, e);
                deliver(
                    &subscribers,
                    Event::error(format!("screen mirror stopped: {}", e), None),
                )
                .await;
                break;
            }
            Err(e) => {
                consecutive_failures += 1;
                debug!(
                    "Capture failed for {} ({} consecutive): {}",
                    device_id, consecutive_failures, e
                );
                if consecutive_failures >= 3 {
                    warn!("Mirror pump for {} giving up after repeated failures", device_id);
                    deliver(
                        &subscribers,
                        Event::error(format!("screen mirror stopped: {}", e), None),
                    )
                    .await;
                    break;
                }
            }
        }
    }

    pumps.lock().await.remove(&device_id);
    debug!("Mirror pump for {} exited", device_id);
}

/// Send an event to every subscriber, pruning closed channels; returns the
/// number of live subscribers after delivery
async fn deliver(subscribers: &SubscriberMap, event: Event) -> usize {
    let mut map = subscribers.lock().await;
    let mut dead = Vec::new();
    for (id, sender) in map.iter() {
        if sender.send(event.clone()).await.is_err() {
            dead.push(id.clone());
        }
    }
    for id in dead {
        map.remove(&id);
    }
    map.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::DriverSupervisor;
    use crate::testing::{sample_device, MockAdapter, ShotScript};
    use devicelab_common::{DriverConfig, NullSink};
    use tokio::time::timeout;

    fn fixture(adapter: Arc<MockAdapter>) -> (Arc<DeviceRegistry>, MirrorPumps) {
        let supervisor = Arc::new(DriverSupervisor::new(
            DriverConfig::default(),
            Arc::new(NullSink),
        ));
        let registry = Arc::new(DeviceRegistry::new(
            vec![adapter],
            supervisor,
            Arc::new(NullSink),
        ));
        let pumps = MirrorPumps::new(
            MirrorConfig {
                physical_fps_cap: 1,
                simulator_fps_cap: 5,
            },
            registry.clone(),
        );
        (registry, pumps)
    }

    #[tokio::test]
    async fn test_fps_capped_per_platform() {
        let adapter = MockAdapter::new(Platform::Android, &[]);
        let (_registry, pumps) = fixture(adapter);

        let android = sample_device("d-1", "serial-1", Platform::Android);
        assert_eq!(pumps.fps_cap(&android), 1);

        let mut simulator = sample_device("d-2", "UDID-1", Platform::Ios);
        simulator.kind = DeviceKind::Simulator;
        assert_eq!(pumps.fps_cap(&simulator), 5);

        let physical_ios = sample_device("d-3", "UDID-2", Platform::Ios);
        assert_eq!(pumps.fps_cap(&physical_ios), 1);
    }

    #[tokio::test]
    async fn test_frames_flow_to_subscriber() {
        let adapter = MockAdapter::new(Platform::Android, &[]);
        let (_registry, pumps) = fixture(adapter);
        let device = sample_device("d-1", "serial-1", Platform::Android);

        let (tx, mut rx) = mpsc::channel(16);
        let fps = pumps.start_mirror("sub-1", &device, Some(10), tx).await.unwrap();
        assert_eq!(fps, 1, "requested 10 fps is capped to 1 on Android");

        let event = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("frame within one tick")
            .expect("channel open");
        match event {
            Event::ScreenUpdate { frame, .. } => {
                assert_eq!(frame.device_id, "d-1");
                assert_eq!(frame.mime_type, "image/png");
                assert!(!frame.data.is_empty());
            }
            other => panic!("unexpected event: {:?}", other),
        }

        pumps.stop_mirror("sub-1", "d-1").await;
        assert_eq!(pumps.active_pumps().await, 0);
    }

    #[tokio::test]
    async fn test_single_in_flight_capture() {
        let adapter = MockAdapter::new(Platform::Ios, &[]);
        // captures take longer than the tick interval
        adapter.set_shot_script(ShotScript::Ok(Duration::from_millis(400)));
        let (_registry, pumps) = fixture(adapter.clone());
        let mut device = sample_device("d-1", "UDID-1", Platform::Ios);
        device.kind = DeviceKind::Simulator; // 5 fps cap -> 200ms ticks

        let (tx, mut rx) = mpsc::channel(64);
        pumps.start_mirror("sub-1", &device, Some(5), tx).await.unwrap();

        // run for ~1.2s: at 5 fps that would be ~6 ticks, but each capture
        // blocks 400ms, so at most ~3 captures may be in flight overall
        tokio::time::sleep(Duration::from_millis(1200)).await;
        pumps.stop_mirror("sub-1", "d-1").await;

        let shots = adapter.shots_taken.load(Ordering::SeqCst);
        assert!(shots <= 4, "expected skipped ticks, got {} captures", shots);
        // frames arrive in capture order
        let mut last = None;
        while let Ok(Some(Event::ScreenUpdate { frame, .. })) =
            timeout(Duration::from_millis(50), rx.recv()).await
        {
            if let Some(prev) = last {
                assert!(frame.timestamp >= prev);
            }
            last = Some(frame.timestamp);
        }
    }

    #[tokio::test]
    async fn test_exhaustion_sheds_pump() {
        let adapter = MockAdapter::new(Platform::Android, &[]);
        adapter.set_shot_script(ShotScript::Exhausted);
        let (_registry, pumps) = fixture(adapter);
        let device = sample_device("d-1", "serial-1", Platform::Android);

        let (tx, mut rx) = mpsc::channel(16);
        pumps.start_mirror("sub-1", &device, None, tx).await.unwrap();

        let event = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("error event within one tick")
            .expect("channel open");
        match event {
            Event::Error { message, .. } => {
                assert!(message.contains("screen mirror stopped"));
            }
            other => panic!("unexpected event: {:?}", other),
        }

        // the pump unregisters itself after shedding
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pumps.active_pumps().await, 0);

        // no further frames arrive
        assert!(timeout(Duration::from_millis(300), rx.recv())
            .await
            .map(|o| o.is_none())
            .unwrap_or(true));
    }

    #[tokio::test]
    async fn test_shared_pump_and_restart() {
        let adapter = MockAdapter::new(Platform::Android, &[]);
        let (_registry, pumps) = fixture(adapter);
        let device = sample_device("d-1", "serial-1", Platform::Android);

        let (tx1, _rx1) = mpsc::channel(16);
        let (tx2, _rx2) = mpsc::channel(16);
        pumps.start_mirror("sub-1", &device, None, tx1).await.unwrap();
        pumps.start_mirror("sub-2", &device, None, tx2).await.unwrap();
        assert_eq!(pumps.active_pumps().await, 1, "one shared pump per device");

        pumps.stop_mirror("sub-1", "d-1").await;
        assert_eq!(pumps.active_pumps().await, 1, "pump lives while a watcher remains");

        pumps.stop_mirror("sub-2", "d-1").await;
        assert_eq!(pumps.active_pumps().await, 0);

        // start-mirror after stop works again
        let (tx3, _rx3) = mpsc::channel(16);
        pumps.start_mirror("sub-3", &device, None, tx3).await.unwrap();
        assert_eq!(pumps.active_pumps().await, 1);
        pumps.stop_mirror("sub-3", "d-1").await;
    }

    #[tokio::test]
    async fn test_drop_subscriber_stops_their_pumps() {
        let adapter = MockAdapter::new(Platform::Android, &[]);
        let (_registry, pumps) = fixture(adapter);
        let device = sample_device("d-1", "serial-1", Platform::Android);

        let (tx, _rx) = mpsc::channel(16);
        pumps.start_mirror("sub-1", &device, None, tx).await.unwrap();
        pumps.drop_subscriber("sub-1").await;
        assert_eq!(pumps.active_pumps().await, 0);
    }
}
