//! One logical camera over several member webcams, one of them active

use std::sync::Arc;

use tracing::trace;

use super::handle::Camera;
use super::name::CameraName;
use crate::capture::renumber::FrameNumberer;
use crate::capture::session::{CaptureCallback, CaptureSession};
use crate::capture::{CaptureRequest, CaptureSequenceId, ControlCache, ControlValue, Frame};
use crate::error::Result;

/// Forwards frames of the active member downstream under the composite's own
/// numbering and sequence identity.
struct RenumberingCallback {
    request: CaptureRequest,
    sequence_id: CaptureSequenceId,
    numberer: Arc<FrameNumberer>,
    downstream: Arc<dyn CaptureCallback>,
}

impl CaptureCallback for RenumberingCallback {
    fn on_new_frame(&self, frame: &dyn Frame) {
        let renumbered = self
            .numberer
            .renumber(self.request, self.sequence_id, frame.underlying());
        trace!(
            "member frame {} -> {}",
            frame.frame_number(),
            renumbered.frame_number()
        );
        self.downstream.on_new_frame(&renumbered);
    }

    // Member sessions come and go on switches; the downstream session is
    // closed by its own owner.
}

/// The composite capture currently streaming from one member
pub(crate) struct CompositeCapture {
    pub(crate) sequence_id: CaptureSequenceId,
    pub(crate) request: CaptureRequest,
    pub(crate) callback: Arc<dyn CaptureCallback>,
    member_session: CaptureSession,
}

impl CompositeCapture {
    /// Start streaming `member` into `callback`, renumbered by `numberer`
    pub(crate) fn start(
        member: &Camera,
        request: CaptureRequest,
        sequence_id: CaptureSequenceId,
        callback: Arc<dyn CaptureCallback>,
        numberer: Arc<FrameNumberer>,
    ) -> Result<Self> {
        let member_session = member.create_capture_session()?;
        member_session.start_capturing(
            request,
            Arc::new(RenumberingCallback {
                request,
                sequence_id,
                numberer,
                downstream: Arc::clone(&callback),
            }),
        )?;
        Ok(Self {
            sequence_id,
            request,
            callback,
            member_session,
        })
    }

    pub(crate) fn member(&self) -> &CameraName {
        self.member_session.camera_name()
    }
}

pub(crate) struct SwitchableBacking {
    capture: Option<CompositeCapture>,
    members: Vec<Camera>,
    active: usize,
    numberer: Arc<FrameNumberer>,
    /// Settings made through the composite, carried over to whichever
    /// member becomes active
    controls: ControlCache,
}

impl SwitchableBacking {
    /// `members` must be non-empty; the first one starts out active.
    pub(crate) fn new(members: Vec<Camera>) -> Self {
        Self {
            capture: None,
            members,
            active: 0,
            numberer: Arc::new(FrameNumberer::new()),
            controls: ControlCache::default(),
        }
    }

    pub(crate) fn member_names(&self) -> Vec<CameraName> {
        self.members.iter().map(|m| m.name().clone()).collect()
    }

    pub(crate) fn active_name(&self) -> CameraName {
        self.members[self.active].name().clone()
    }

    pub(crate) fn index_of(&self, name: &CameraName) -> Option<usize> {
        self.members.iter().position(|m| m.name() == name)
    }

    pub(crate) fn active_index(&self) -> usize {
        self.active
    }

    pub(crate) fn set_active_index(&mut self, index: usize) {
        self.active = index;
    }

    /// A handle on the active member usable outside the composite's lock
    pub(crate) fn active_member(&self) -> Result<Camera> {
        self.members[self.active].dup()
    }

    pub(crate) fn remember(&mut self, value: ControlValue) {
        self.controls.record(value);
    }

    /// What to apply to a member taking over
    pub(crate) fn controls_to_replay(&self) -> Vec<ControlValue> {
        self.controls.replay()
    }

    pub(crate) fn numberer(&self) -> Arc<FrameNumberer> {
        Arc::clone(&self.numberer)
    }

    /// Take the running capture, or only the one with `sequence_id`
    pub(crate) fn take_capture(
        &mut self,
        sequence_id: Option<CaptureSequenceId>,
    ) -> Option<CompositeCapture> {
        match (&self.capture, sequence_id) {
            (Some(capture), Some(id)) if capture.sequence_id != id => None,
            _ => self.capture.take(),
        }
    }

    /// Install `capture`, returning whatever it replaced
    pub(crate) fn install(&mut self, capture: CompositeCapture) -> Option<CompositeCapture> {
        self.capture.replace(capture)
    }
}
