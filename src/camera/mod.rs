pub mod handle;
pub mod name;
pub mod refcount;
pub(crate) mod resilient;
pub(crate) mod switchable;
pub(crate) mod webcam;

pub use handle::{Camera, StateCallback};
pub use name::{CameraDirection, CameraName, SerialNumber};
pub use refcount::{InternalRef, RefCountedCamera};
