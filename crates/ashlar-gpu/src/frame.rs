//! Host-side bookkeeping for the acquire/record/present cycle.
//!
//! [`FrameLoop`] holds no Vulkan objects. [`Swapchain`](crate::Swapchain)
//! drives it and performs the GPU work each transition stands for, which
//! keeps the ordering rules testable without a device.

use crate::error::{GpuError, Result};
use std::fmt;

/// Where the swapchain is in its frame cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwapchainState {
    /// Not created yet, or destroyed.
    Uninitialized,
    /// Idle between frames.
    Ready,
    /// Waiting on the slot fence and acquiring an image.
    Acquiring,
    /// An image is acquired and the slot's command buffer is recording.
    Recording,
    /// Submitting and presenting.
    Presenting,
    /// Rebuilding the swapchain and frame slots.
    Recreating,
}

impl fmt::Display for SwapchainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Acquiring => "acquiring",
            Self::Recording => "recording",
            Self::Presenting => "presenting",
            Self::Recreating => "recreating",
        };
        f.write_str(name)
    }
}

/// Result of [`FrameLoop::begin_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquire {
    /// Slot whose fence, command buffer and semaphores this frame uses.
    pub slot: usize,
    /// Number of the frame being started.
    pub frame: u64,
    /// Frame that last submitted from this slot. Its fence must be waited on
    /// before the slot is reused.
    pub awaited_frame: Option<u64>,
}

/// Slot ring and state machine of a swapchain.
#[derive(Debug, Clone)]
pub struct FrameLoop {
    frames_in_flight: usize,
    slot: usize,
    frame: u64,
    last_submitted: Vec<Option<u64>>,
    state: SwapchainState,
    recreated: bool,
}

impl FrameLoop {
    /// Start in [`SwapchainState::Ready`] at slot 0.
    pub fn new(frames_in_flight: usize) -> Result<Self> {
        if frames_in_flight == 0 {
            return Err(GpuError::InvalidArgument(
                "frames in flight must be at least 1".into(),
            ));
        }
        Ok(Self {
            frames_in_flight,
            slot: 0,
            frame: 0,
            last_submitted: vec![None; frames_in_flight],
            state: SwapchainState::Ready,
            recreated: false,
        })
    }

    /// Get the current state.
    pub fn state(&self) -> SwapchainState {
        self.state
    }

    /// Get the current slot index.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Number of the next (or current) frame.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Get the number of slots.
    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Whether a recreate happened since the last present began.
    pub fn recreated(&self) -> bool {
        self.recreated
    }

    /// Frame that last submitted from `slot`.
    pub fn last_submitted(&self, slot: usize) -> Option<u64> {
        self.last_submitted.get(slot).copied().flatten()
    }

    /// Ready -> Acquiring.
    pub fn begin_acquire(&mut self) -> Result<Acquire> {
        self.require(SwapchainState::Ready, "acquire")?;
        self.state = SwapchainState::Acquiring;
        Ok(Acquire {
            slot: self.slot,
            frame: self.frame,
            awaited_frame: self.last_submitted[self.slot],
        })
    }

    /// Acquiring -> Recording.
    pub fn finish_acquire(&mut self) -> Result<()> {
        self.require(SwapchainState::Acquiring, "finish acquire")?;
        self.state = SwapchainState::Recording;
        Ok(())
    }

    /// Acquiring -> Ready, after a failed acquire. The slot does not advance.
    pub fn cancel_acquire(&mut self) -> Result<()> {
        self.require(SwapchainState::Acquiring, "cancel acquire")?;
        self.state = SwapchainState::Ready;
        Ok(())
    }

    /// Recording -> Presenting. Clears the recreated flag.
    pub fn begin_present(&mut self) -> Result<()> {
        self.require(SwapchainState::Recording, "present")?;
        self.state = SwapchainState::Presenting;
        self.recreated = false;
        Ok(())
    }

    /// Record that the current frame was submitted with the slot fence.
    pub fn mark_submitted(&mut self) -> Result<()> {
        self.require(SwapchainState::Presenting, "mark submitted")?;
        self.last_submitted[self.slot] = Some(self.frame);
        Ok(())
    }

    /// Presenting -> Ready, advancing to the next slot.
    pub fn finish_present(&mut self) -> Result<()> {
        self.require(SwapchainState::Presenting, "finish present")?;
        self.slot = (self.slot + 1) % self.frames_in_flight;
        self.frame += 1;
        self.state = SwapchainState::Ready;
        Ok(())
    }

    /// End a present begun with [`Self::begin_present`], whatever its outcome.
    ///
    /// The slot advances unless a failed recreate already tore the loop
    /// down. An error in `outcome` is returned in preference to one from the
    /// transition.
    pub fn complete_present(&mut self, outcome: Result<()>) -> Result<()> {
        let advanced = match self.state {
            SwapchainState::Uninitialized => Ok(()),
            _ => self.finish_present(),
        };
        outcome.and(advanced)
    }

    /// Enter [`SwapchainState::Recreating`] from Ready, Acquiring or
    /// Presenting. Returns the state to resume afterwards.
    pub fn begin_recreate(&mut self) -> Result<SwapchainState> {
        match self.state {
            SwapchainState::Ready | SwapchainState::Acquiring | SwapchainState::Presenting => {
                let resume = self.state;
                self.state = SwapchainState::Recreating;
                Ok(resume)
            }
            state => Err(GpuError::InvalidState(format!(
                "cannot recreate while {state}"
            ))),
        }
    }

    /// Leave [`SwapchainState::Recreating`] for `resume` and raise the
    /// recreated flag. Rebuilt slots start with signaled fences, so no
    /// earlier submission needs to be awaited.
    pub fn finish_recreate(&mut self, resume: SwapchainState) -> Result<()> {
        self.require(SwapchainState::Recreating, "finish recreate")?;
        self.state = resume;
        self.recreated = true;
        self.last_submitted.fill(None);
        Ok(())
    }

    /// Any state -> Uninitialized.
    pub fn destroy(&mut self) {
        self.state = SwapchainState::Uninitialized;
        self.last_submitted.fill(None);
        self.recreated = false;
    }

    fn require(&self, expected: SwapchainState, action: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "cannot {action} while {}, expected {expected}",
                self.state
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    fn run_frame(frames: &mut FrameLoop) -> Acquire {
        let acquire = frames.begin_acquire().unwrap();
        frames.finish_acquire().unwrap();
        frames.begin_present().unwrap();
        frames.mark_submitted().unwrap();
        frames.finish_present().unwrap();
        acquire
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        assert!(matches!(
            FrameLoop::new(0),
            Err(GpuError::InvalidArgument(_))
        ));
    }

    #[test]
    fn slots_wrap_around() {
        let mut frames = FrameLoop::new(3).unwrap();
        let slots: Vec<_> = (0..7).map(|_| run_frame(&mut frames).slot).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(frames.frame(), 7);
        assert_eq!(frames.state(), SwapchainState::Ready);
    }

    #[test]
    fn slot_fence_was_signaled_by_frame_n_back() {
        for n in 1..=4 {
            let mut frames = FrameLoop::new(n).unwrap();
            let mut submitted_from = Vec::new();
            for frame in 0..12u64 {
                let acquire = frames.begin_acquire().unwrap();
                assert_eq!(acquire.slot, frames.slot());
                assert_eq!(acquire.frame, frame);
                assert_eq!(
                    acquire.awaited_frame,
                    frame.checked_sub(n as u64),
                    "n={n} frame={frame}"
                );
                if let Some(awaited) = acquire.awaited_frame {
                    assert_eq!(submitted_from[awaited as usize], acquire.slot);
                }

                frames.finish_acquire().unwrap();
                frames.begin_present().unwrap();
                frames.mark_submitted().unwrap();
                submitted_from.push(frames.slot());
                frames.finish_present().unwrap();
            }
        }
    }

    #[test]
    fn recreate_on_third_acquire_sets_flag_once() {
        let mut frames = FrameLoop::new(2).unwrap();
        run_frame(&mut frames);
        run_frame(&mut frames);

        let acquire = frames.begin_acquire().unwrap();
        assert_eq!(acquire.slot, 0);
        let resume = frames.begin_recreate().unwrap();
        assert_eq!(resume, SwapchainState::Acquiring);
        assert_eq!(frames.state(), SwapchainState::Recreating);
        frames.finish_recreate(resume).unwrap();
        frames.finish_acquire().unwrap();
        assert!(frames.recreated());

        frames.begin_present().unwrap();
        assert!(!frames.recreated());
        frames.mark_submitted().unwrap();
        frames.finish_present().unwrap();
        assert!(!frames.recreated());
        assert_eq!(frames.slot(), 1);
    }

    #[test]
    fn recreate_forgets_pending_submissions() {
        let mut frames = FrameLoop::new(2).unwrap();
        run_frame(&mut frames);
        run_frame(&mut frames);
        assert_eq!(frames.last_submitted(0), Some(0));

        let resume = frames.begin_recreate().unwrap();
        frames.finish_recreate(resume).unwrap();
        assert_eq!(frames.state(), SwapchainState::Ready);

        let acquire = frames.begin_acquire().unwrap();
        assert_eq!(acquire.awaited_frame, None);
    }

    #[test]
    fn recreate_during_present_resumes_presenting() {
        let mut frames = FrameLoop::new(2).unwrap();
        frames.begin_acquire().unwrap();
        frames.finish_acquire().unwrap();
        frames.begin_present().unwrap();
        frames.mark_submitted().unwrap();

        let resume = frames.begin_recreate().unwrap();
        frames.finish_recreate(resume).unwrap();
        assert_eq!(frames.state(), SwapchainState::Presenting);
        frames.finish_present().unwrap();
        assert!(frames.recreated());
        assert_eq!(frames.slot(), 1);
    }

    #[test]
    fn failed_submit_still_advances_slot() {
        let mut frames = FrameLoop::new(2).unwrap();
        frames.begin_acquire().unwrap();
        frames.finish_acquire().unwrap();
        frames.begin_present().unwrap();

        let failed = Err(GpuError::vulkan("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST));
        let err = frames.complete_present(failed).unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(frames.state(), SwapchainState::Ready);
        assert_eq!(frames.slot(), 1);
        assert_eq!(frames.last_submitted(0), None);

        frames.begin_acquire().unwrap();
    }

    #[test]
    fn failed_recreate_during_present_keeps_its_error() {
        let mut frames = FrameLoop::new(2).unwrap();
        frames.begin_acquire().unwrap();
        frames.finish_acquire().unwrap();
        frames.begin_present().unwrap();
        frames.mark_submitted().unwrap();
        frames.begin_recreate().unwrap();
        frames.destroy();

        let failed = Err(GpuError::SwapchainCreation("zero extent 0x0".into()));
        let err = frames.complete_present(failed).unwrap_err();
        assert!(matches!(err, GpuError::SwapchainCreation(_)), "{err}");
        assert_eq!(frames.state(), SwapchainState::Uninitialized);
    }

    #[test]
    fn successful_present_completes() {
        let mut frames = FrameLoop::new(3).unwrap();
        frames.begin_acquire().unwrap();
        frames.finish_acquire().unwrap();
        frames.begin_present().unwrap();
        frames.mark_submitted().unwrap();
        frames.complete_present(Ok(())).unwrap();
        assert_eq!(frames.state(), SwapchainState::Ready);
        assert_eq!(frames.slot(), 1);
        assert_eq!(frames.last_submitted(0), Some(0));
    }

    #[test]
    fn out_of_order_transitions_are_rejected() {
        let mut frames = FrameLoop::new(2).unwrap();
        assert!(matches!(frames.begin_present(), Err(GpuError::InvalidState(_))));
        assert!(frames.finish_acquire().is_err());
        assert!(frames.finish_present().is_err());
        assert!(frames.finish_recreate(SwapchainState::Ready).is_err());

        frames.begin_acquire().unwrap();
        assert!(frames.begin_acquire().is_err());
        frames.finish_acquire().unwrap();
        assert!(frames.begin_recreate().is_err());
        assert_eq!(frames.state(), SwapchainState::Recording);
    }

    #[test]
    fn cancelled_acquire_keeps_slot() {
        let mut frames = FrameLoop::new(2).unwrap();
        frames.begin_acquire().unwrap();
        frames.cancel_acquire().unwrap();
        assert_eq!(frames.state(), SwapchainState::Ready);
        assert_eq!(frames.slot(), 0);
    }

    #[test]
    fn destroyed_loop_refuses_work() {
        let mut frames = FrameLoop::new(1).unwrap();
        frames.destroy();
        assert_eq!(frames.state(), SwapchainState::Uninitialized);
        assert!(frames.begin_acquire().is_err());
        assert!(frames.begin_recreate().is_err());
    }

    #[test]
    fn invalid_state_message() {
        let mut frames = FrameLoop::new(1).unwrap();
        let err = frames.begin_present().unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"Invalid state: cannot present while ready, expected recording");
    }
}
