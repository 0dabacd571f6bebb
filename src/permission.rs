//! Platform permission to use a camera

use std::sync::Mutex;

use tracing::{debug, info};

use crate::camera::name::{CameraName, SerialNumber};
use crate::continuation::Continuation;
use crate::deadline::Deadline;
use crate::utils::lock;

/// Receives the grant (`true`) or denial
pub type PermissionCallback = dyn Fn(bool) + Send + Sync;

/// Decides whether a camera may be opened.
///
/// Implementations answer through `continuation`, at most once, and may take
/// as long as `deadline` allows or never answer at all.
pub trait PermissionAuthority: Send + Sync {
    fn request_permission(
        &self,
        name: &CameraName,
        deadline: Deadline,
        continuation: Continuation<PermissionCallback>,
    );
}

/// Linux has no interactive camera consent: every camera is granted.
#[derive(Debug, Default, Clone, Copy)]
pub struct GrantAll;

impl PermissionAuthority for GrantAll {
    fn request_permission(
        &self,
        name: &CameraName,
        _deadline: Deadline,
        continuation: Continuation<PermissionCallback>,
    ) {
        debug!("granting {}", name);
        continuation.dispatch(|granted| granted(true));
    }
}

/// Grants webcams whose identity matches one of the configured serial
/// numbers; vendor/product wildcards in the list match any port.
#[derive(Debug, Clone)]
pub struct AllowList {
    allowed: Vec<SerialNumber>,
}

impl AllowList {
    pub fn new(allowed: Vec<SerialNumber>) -> Self {
        Self { allowed }
    }

    pub fn allows(&self, name: &CameraName) -> bool {
        match name {
            CameraName::Webcam(serial) => self
                .allowed
                .iter()
                .any(|entry| serial == entry || serial.matches(entry)),
            CameraName::Builtin(_) => true,
            CameraName::Switchable(members) => members.iter().all(|m| self.allows(m)),
            CameraName::Unknown => false,
        }
    }
}

impl PermissionAuthority for AllowList {
    fn request_permission(
        &self,
        name: &CameraName,
        _deadline: Deadline,
        continuation: Continuation<PermissionCallback>,
    ) {
        let granted = self.allows(name);
        if !granted {
            info!("{} is not in the camera allow-list", name);
        }
        continuation.dispatch(move |callback| callback(granted));
    }
}

/// Keeps requests a permission authority never answers, like a dialog
/// nobody clicks.
#[derive(Default)]
pub struct PendingPermissions {
    pending: Mutex<Vec<(CameraName, Continuation<PermissionCallback>)>>,
}

impl PendingPermissions {
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Answer every outstanding request
    pub fn answer_all(&self, granted: bool) {
        for (name, continuation) in lock(&self.pending).drain(..) {
            debug!("answering {} with {}", name, granted);
            continuation.dispatch(move |callback| callback(granted));
        }
    }
}

impl PermissionAuthority for PendingPermissions {
    fn request_permission(
        &self,
        name: &CameraName,
        _deadline: Deadline,
        continuation: Continuation<PermissionCallback>,
    ) {
        lock(&self.pending).push((name.clone(), continuation));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::{Executor, SerialExecutor};
    use std::sync::Arc;
    use std::time::Duration;

    fn ask(authority: &dyn PermissionAuthority, name: &CameraName) -> bool {
        let executor: Arc<dyn Executor> = Arc::new(SerialExecutor::new("test-permission").unwrap());
        let (tx, rx) = flume::bounded(1);
        let callback: Arc<PermissionCallback> = Arc::new(move |granted: bool| {
            let _ = tx.send(granted);
        });
        authority.request_permission(
            name,
            Deadline::from_millis(1_000),
            Continuation::new(executor, callback),
        );
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_grant_all() {
        let name = CameraName::webcam(SerialNumber::usb("X"));
        assert!(ask(&GrantAll, &name));
    }

    #[test]
    fn test_allow_list() {
        let list = AllowList::new(vec![
            SerialNumber::usb("GOOD"),
            SerialNumber::vendor_product(0x046d, 0x0825, None),
        ]);

        assert!(ask(&list, &CameraName::webcam(SerialNumber::usb("GOOD"))));
        assert!(!ask(&list, &CameraName::webcam(SerialNumber::usb("BAD"))));

        let on_port = SerialNumber::vendor_product(0x046d, 0x0825, Some("1-3".into()));
        assert!(list.allows(&CameraName::webcam(on_port)));

        let mixed = CameraName::switchable([
            CameraName::webcam(SerialNumber::usb("GOOD")),
            CameraName::webcam(SerialNumber::usb("BAD")),
        ])
        .unwrap();
        assert!(!list.allows(&mixed));
    }
}
