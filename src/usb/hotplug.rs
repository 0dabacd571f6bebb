//! Polling hot-plug source: diffs successive bus snapshots into events

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::monitor::HotplugEvent;
use super::{CameraBackend, UsbDevice};

/// Events turning the `previous` snapshot into `current`, detaches first
pub fn diff_snapshots(
    previous: &BTreeMap<String, UsbDevice>,
    current: &BTreeMap<String, UsbDevice>,
) -> Vec<HotplugEvent> {
    let mut events = Vec::new();
    for (name, device) in previous {
        if current.get(name) != Some(device) {
            events.push(HotplugEvent::Detached(device.clone()));
        }
    }
    for (name, device) in current {
        if previous.get(name) != Some(device) {
            events.push(HotplugEvent::Attached(device.clone()));
        }
    }
    events
}

fn snapshot(devices: Vec<UsbDevice>) -> BTreeMap<String, UsbDevice> {
    devices
        .into_iter()
        .map(|device| (device.device_name.clone(), device))
        .collect()
}

/// Poll `backend` every `interval` and send bus changes to `events`.
///
/// Devices present at startup are not reported. The task ends when the
/// receiving side goes away.
pub fn spawn_poller(
    backend: Arc<dyn CameraBackend>,
    interval: Duration,
    events: flume::Sender<HotplugEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut known = match backend.attached_devices() {
            Ok(devices) => snapshot(devices),
            Err(err) => {
                warn!("initial bus scan failed: {}", err);
                BTreeMap::new()
            }
        };
        info!(
            "hot-plug poller started with {} device(s), every {:?}",
            known.len(),
            interval
        );

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let current = match backend.attached_devices() {
                Ok(devices) => snapshot(devices),
                Err(err) => {
                    warn!("bus scan failed: {}", err);
                    continue;
                }
            };
            for event in diff_snapshots(&known, &current) {
                if events.send_async(event).await.is_err() {
                    debug!("hot-plug receiver gone; poller exiting");
                    return;
                }
            }
            known = current;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::tests::device;

    #[test]
    fn test_diff_orders_detach_before_attach() {
        let a = device("/dev/video0", Some("A"), "1-1");
        let b = device("/dev/video2", Some("B"), "1-2");
        let replaced = device("/dev/video0", Some("C"), "1-1");

        let previous = snapshot(vec![a.clone(), b.clone()]);
        let current = snapshot(vec![replaced.clone(), b]);

        assert_eq!(
            diff_snapshots(&previous, &current),
            vec![HotplugEvent::Detached(a), HotplugEvent::Attached(replaced)]
        );
        assert!(diff_snapshots(&current, &current).is_empty());
    }
}
