//! Hot-plug fan-out with the cooperative claim protocol

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::UsbDevice;
use crate::camera::name::SerialNumber;
use crate::utils::lock;

/// Shared by every subscriber notified about one attach event. Setting it is
/// a convention: later subscribers see that someone already took the device.
#[derive(Debug, Default)]
pub struct ClaimFlag(AtomicBool);

impl ClaimFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the device. Returns `false` if it was already claimed.
    pub fn claim(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub trait UsbAttachmentSubscriber: Send + Sync {
    fn on_attached(&self, device: &UsbDevice, serial: &SerialNumber, claim: &ClaimFlag);

    fn on_detached(&self, device: &UsbDevice);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Attached(UsbDevice),
    Detached(UsbDevice),
}

impl HotplugEvent {
    pub fn device(&self) -> &UsbDevice {
        match self {
            HotplugEvent::Attached(device) | HotplugEvent::Detached(device) => device,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            HotplugEvent::Attached(_) => "attached",
            HotplugEvent::Detached(_) => "detached",
        }
    }
}

#[derive(Default)]
pub struct UsbAttachmentMonitor {
    subscribers: Mutex<Vec<Arc<dyn UsbAttachmentSubscriber>>>,
}

fn same_subscriber(a: &Arc<dyn UsbAttachmentSubscriber>, b: &Arc<dyn UsbAttachmentSubscriber>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl UsbAttachmentMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber at the end of the notification order. Registering the
    /// same subscriber twice has no effect.
    pub fn register(&self, subscriber: Arc<dyn UsbAttachmentSubscriber>) {
        let mut subscribers = lock(&self.subscribers);
        if !subscribers.iter().any(|s| same_subscriber(s, &subscriber)) {
            subscribers.push(subscriber);
        }
    }

    pub fn unregister(&self, subscriber: &Arc<dyn UsbAttachmentSubscriber>) {
        lock(&self.subscribers).retain(|s| !same_subscriber(s, subscriber));
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    /// Deliver one event. Returns whether an attached device was claimed.
    pub fn dispatch(&self, event: &HotplugEvent) -> bool {
        metrics::counter!("robocam_hotplug_events_total", "kind" => event.kind()).increment(1);
        // Callbacks may (un)register, so iterate over a snapshot
        let subscribers = lock(&self.subscribers).clone();

        match event {
            HotplugEvent::Detached(device) => {
                debug!("detached: {}", device.device_name);
                for subscriber in &subscribers {
                    subscriber.on_detached(device);
                }
                false
            }
            HotplugEvent::Attached(device) => {
                let Some(serial) = device.real_or_vendor_product_serial_number() else {
                    warn!(
                        "attached {} has no resolvable identity; ignoring",
                        device.device_name
                    );
                    return false;
                };
                debug!("attached: {} as {}", device.device_name, serial);
                let claim = ClaimFlag::new();
                for subscriber in &subscribers {
                    subscriber.on_attached(device, &serial, &claim);
                }
                claim.is_claimed()
            }
        }
    }

    /// Consume events from `events` in order until every sender is gone.
    pub fn listen(self: Arc<Self>, events: flume::Receiver<HotplugEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(event) = events.recv_async().await {
                trace!("hotplug event {:?}", event);
                let monitor = Arc::clone(&self);
                // Subscribers may block on device opens
                let delivered =
                    tokio::task::spawn_blocking(move || monitor.dispatch(&event)).await;
                if delivered.is_err() {
                    warn!("a hot-plug subscriber panicked");
                }
            }
            debug!("hot-plug listener exiting");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::tests::device;

    #[derive(Default)]
    struct Recorder {
        claims: bool,
        attached: Mutex<Vec<(String, bool)>>,
        detached: Mutex<Vec<String>>,
    }

    impl UsbAttachmentSubscriber for Recorder {
        fn on_attached(&self, device: &UsbDevice, _serial: &SerialNumber, claim: &ClaimFlag) {
            let already = claim.is_claimed();
            if self.claims {
                claim.claim();
            }
            lock(&self.attached).push((device.device_name.clone(), already));
        }

        fn on_detached(&self, device: &UsbDevice) {
            lock(&self.detached).push(device.device_name.clone());
        }
    }

    #[test]
    fn test_claim_flag_is_one_shot() {
        let flag = ClaimFlag::new();
        assert!(!flag.is_claimed());
        assert!(flag.claim());
        assert!(!flag.claim());
        assert!(flag.is_claimed());
    }

    #[test]
    fn test_attach_in_registration_order_with_shared_claim() {
        let monitor = UsbAttachmentMonitor::new();
        let first = Arc::new(Recorder {
            claims: true,
            ..Default::default()
        });
        let second = Arc::new(Recorder::default());
        monitor.register(first.clone());
        monitor.register(second.clone());

        let claimed = monitor.dispatch(&HotplugEvent::Attached(device("/dev/video0", Some("A"), "1-1")));

        assert!(claimed);
        assert_eq!(*lock(&first.attached), vec![("/dev/video0".to_string(), false)]);
        assert_eq!(*lock(&second.attached), vec![("/dev/video0".to_string(), true)]);
    }

    #[test]
    fn test_register_is_idempotent() {
        let monitor = UsbAttachmentMonitor::new();
        let subscriber: Arc<dyn UsbAttachmentSubscriber> = Arc::new(Recorder::default());
        monitor.register(Arc::clone(&subscriber));
        monitor.register(Arc::clone(&subscriber));
        assert_eq!(monitor.subscriber_count(), 1);

        monitor.unregister(&subscriber);
        assert_eq!(monitor.subscriber_count(), 0);
    }

    #[test]
    fn test_unresolvable_attach_notifies_nobody_but_detach_does() {
        let monitor = UsbAttachmentMonitor::new();
        let recorder = Arc::new(Recorder::default());
        monitor.register(recorder.clone());

        let mut anonymous = device("/dev/video4", None, "1-1");
        anonymous.vendor_id = 0;
        anonymous.product_id = 0;
        assert!(!monitor.dispatch(&HotplugEvent::Attached(anonymous.clone())));
        assert!(lock(&recorder.attached).is_empty());

        monitor.dispatch(&HotplugEvent::Detached(anonymous));
        assert_eq!(*lock(&recorder.detached), vec!["/dev/video4".to_string()]);
    }

    #[test]
    fn test_detach_reaches_everyone_after_a_claimed_attach() {
        let monitor = UsbAttachmentMonitor::new();
        let claimer = Arc::new(Recorder {
            claims: true,
            ..Default::default()
        });
        let bystanders: Vec<Arc<Recorder>> = (0..3).map(|_| Arc::new(Recorder::default())).collect();
        monitor.register(claimer.clone());
        for bystander in &bystanders {
            monitor.register(bystander.clone());
        }

        let camera = device("/dev/video0", Some("A"), "1-1");
        assert!(monitor.dispatch(&HotplugEvent::Attached(camera.clone())));
        assert!(!monitor.dispatch(&HotplugEvent::Detached(camera)));

        assert_eq!(*lock(&claimer.detached), vec!["/dev/video0".to_string()]);
        for bystander in &bystanders {
            assert_eq!(*lock(&bystander.attached), vec![("/dev/video0".to_string(), true)]);
            assert_eq!(*lock(&bystander.detached), vec!["/dev/video0".to_string()]);
        }
    }
}
