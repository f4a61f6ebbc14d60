// SPDX-License-Identifier: MPL-2.0

//! Triple-buffer hand-off between one decoder worker and one consumer.
//!
//! A single atomic word, the *step*, coordinates the two threads without a
//! mutex. The consumer advances it after each successful paint and the worker
//! advances it after each committed frame; each direction has exactly one
//! writer, so plain load-acquire / store-release suffices and no CAS is
//! needed.
//!
//! ```text
//! ┌──────────┐  advance_write   ┌──────────┐
//! │ Worker   │ ───────────────▶ │ FrameSlot│ ×3
//! │ (decode) │                  └────┬─────┘
//! └──────────┘   advance_read        │ clone Arc
//!       ▲      ◀─────────────── ┌────▼─────┐
//!       └─────────── wake ───── │ Consumer │
//!                               └──────────┘
//! ```

use std::{
    cell::UnsafeCell,
    sync::{
        atomic::{AtomicI32, AtomicI8, AtomicU64, Ordering},
        Arc,
    },
};

use image::RgbaImage;

use crate::types::FrameRequest;

const WAITING_FOR_DIMENSIONS: i32 = -3;
const WAITING_FOR_REQUEST: i32 = -2;
const WAITING_FOR_FIRST_FRAME: i32 = -1;

/// Decoded value of the step word.
///
/// The three waiting states cover start-up: no frame yet, first frame decoded
/// but no geometry from the consumer, geometry known but the first sized
/// frame still rendering. After that the word cycles through six phases:
/// phase `2k` and `2k + 1` both show slot `k`; the odd phase records that the
/// consumer has painted it, so the worker's next commit publishes slot
/// `k + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    WaitingForDimensions,
    WaitingForRequest,
    WaitingForFirstFrame,
    /// Circular phase, `0..=5`.
    Phase(i32),
}

impl Step {
    fn from_raw(raw: i32) -> Self {
        match raw {
            WAITING_FOR_DIMENSIONS => Step::WaitingForDimensions,
            WAITING_FOR_REQUEST => Step::WaitingForRequest,
            WAITING_FOR_FIRST_FRAME => Step::WaitingForFirstFrame,
            phase => Step::Phase(phase),
        }
    }

    fn to_raw(self) -> i32 {
        match self {
            Step::WaitingForDimensions => WAITING_FOR_DIMENSIONS,
            Step::WaitingForRequest => WAITING_FOR_REQUEST,
            Step::WaitingForFirstFrame => WAITING_FOR_FIRST_FRAME,
            Step::Phase(phase) => phase,
        }
    }
}

/// The atomic hand-off word of one clip.
pub(crate) struct StepWord(AtomicI32);

impl StepWord {
    pub(crate) fn new() -> Self {
        Self(AtomicI32::new(WAITING_FOR_DIMENSIONS))
    }

    pub(crate) fn load(&self) -> Step {
        Step::from_raw(self.0.load(Ordering::Acquire))
    }

    fn store(&self, step: Step) {
        self.0.store(step.to_raw(), Ordering::Release);
    }

    /// Slot the consumer may read, if any.
    pub(crate) fn show_index(&self) -> Option<usize> {
        match self.load() {
            Step::WaitingForDimensions => None,
            Step::WaitingForRequest | Step::WaitingForFirstFrame => Some(0),
            Step::Phase(phase) => Some((phase / 2) as usize % 3),
        }
    }

    /// Slot the worker may write, if any.
    pub(crate) fn write_index(&self) -> Option<usize> {
        match self.load() {
            Step::WaitingForDimensions | Step::WaitingForFirstFrame => Some(0),
            Step::WaitingForRequest => None,
            Step::Phase(phase) => Some(((phase + 2) / 2) as usize % 3),
        }
    }

    /// Slot the worker will write after the current one.
    ///
    /// With `check_not_writing` the lookup declines while a commit is
    /// imminent (odd phase), which is when the consumer must not touch it.
    pub(crate) fn write_next_index(&self, check_not_writing: bool) -> Option<usize> {
        match self.load() {
            Step::WaitingForDimensions | Step::WaitingForRequest => None,
            Step::WaitingForFirstFrame => {
                if check_not_writing {
                    None
                } else {
                    Some(1)
                }
            }
            Step::Phase(phase) => {
                if check_not_writing && phase % 2 == 1 {
                    None
                } else {
                    Some(((phase + 4) / 2) as usize % 3)
                }
            }
        }
    }

    /// Consumer-side transition, after a successful paint.
    pub(crate) fn advance_read(&self) {
        match self.load() {
            Step::WaitingForRequest => self.store(Step::WaitingForFirstFrame),
            Step::Phase(phase) if phase % 2 == 0 => self.store(Step::Phase(phase + 1)),
            _ => {}
        }
    }

    /// Worker-side transition, after a committed frame.
    pub(crate) fn advance_write(&self) {
        match self.load() {
            Step::WaitingForDimensions => self.store(Step::WaitingForRequest),
            Step::WaitingForFirstFrame => self.store(Step::Phase(0)),
            Step::Phase(phase) if phase % 2 == 1 => self.store(Step::Phase((phase + 1) % 6)),
            _ => {}
        }
    }
}

/// Frame payload of a slot. Accessed without locking; the step word
/// designates which thread owns it at any moment.
#[derive(Default)]
pub(crate) struct FrameData {
    /// Raw decoded image, possibly carrying alpha.
    pub original: Option<Arc<RgbaImage>>,
    /// Device-ready pixmap matching `request`.
    pub prepared: Option<Arc<RgbaImage>>,
    /// Geometry `prepared` was built for.
    pub request: FrameRequest,
    pub has_alpha: bool,
}

/// One of the three frame buffers of a clip.
pub(crate) struct FrameSlot {
    data: UnsafeCell<FrameData>,
    /// Monotonic time at which this frame should first be shown; zero while
    /// the slot is empty. Written by the worker only.
    pub when: AtomicU64,
    /// `0` not yet shown, `1` shown, `-1` shown but the consumer wants the
    /// clip paused.
    pub displayed: AtomicI8,
}

// The payload is handed between the worker and consumer threads by the step
// word; the owning side for any given step value is unique.
unsafe impl Sync for FrameSlot {}

impl FrameSlot {
    pub(crate) fn new() -> Self {
        Self {
            data: UnsafeCell::new(FrameData::default()),
            when: AtomicU64::new(0),
            displayed: AtomicI8::new(0),
        }
    }

    /// # Safety
    ///
    /// The caller must be the thread the step word currently designates as
    /// this slot's owner.
    pub(crate) unsafe fn data(&self) -> &FrameData {
        &*self.data.get()
    }

    /// # Safety
    ///
    /// Same ownership requirement as [`FrameSlot::data`], and no other
    /// reference into this slot may be live.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_mut(&self) -> &mut FrameData {
        &mut *self.data.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_phase(phase: i32) -> StepWord {
        let word = StepWord::new();
        word.store(Step::Phase(phase));
        word
    }

    #[test]
    fn test_initial_state_has_no_show_slot() {
        let word = StepWord::new();
        assert_eq!(word.load(), Step::WaitingForDimensions);
        assert_eq!(word.show_index(), None);
        assert_eq!(word.write_index(), Some(0));
        assert_eq!(word.write_next_index(false), None);
    }

    #[test]
    fn test_waiting_for_request_has_no_write_slot() {
        let word = StepWord::new();
        word.advance_write();
        assert_eq!(word.load(), Step::WaitingForRequest);
        assert_eq!(word.show_index(), Some(0));
        assert_eq!(word.write_index(), None);
    }

    #[test]
    fn test_phase_cursors_follow_the_table() {
        for phase in 0..6 {
            let word = at_phase(phase);
            let k = (phase / 2) as usize;
            assert_eq!(word.show_index(), Some(k % 3), "phase {phase}");
            assert_eq!(word.write_index(), Some((k + 1) % 3), "phase {phase}");
            assert_eq!(
                word.write_next_index(false),
                Some((k + 2) % 3),
                "phase {phase}"
            );
        }
    }

    #[test]
    fn test_write_next_declines_during_odd_phases() {
        for phase in 0..6 {
            let word = at_phase(phase);
            let expected = if phase % 2 == 1 {
                None
            } else {
                Some(((phase / 2) as usize + 2) % 3)
            };
            assert_eq!(word.write_next_index(true), expected, "phase {phase}");
        }
    }

    #[test]
    fn test_show_and_write_slots_are_disjoint() {
        for phase in 0..6 {
            let word = at_phase(phase);
            assert_ne!(word.show_index(), word.write_index(), "phase {phase}");
        }
    }

    #[test]
    fn test_startup_transition_sequence() {
        let word = StepWord::new();
        word.advance_write(); // first frame decoded
        assert_eq!(word.load(), Step::WaitingForRequest);
        word.advance_read(); // consumer supplied geometry
        assert_eq!(word.load(), Step::WaitingForFirstFrame);
        word.advance_write(); // first sized frame committed
        assert_eq!(word.load(), Step::Phase(0));
    }

    #[test]
    fn test_phase_transitions_alternate_and_wrap() {
        let word = at_phase(0);
        for expected in [1, 2, 3, 4, 5, 0, 1] {
            match word.load() {
                Step::Phase(phase) if phase % 2 == 0 => word.advance_read(),
                _ => word.advance_write(),
            }
            assert_eq!(word.load(), Step::Phase(expected));
        }
    }

    #[test]
    fn test_transitions_are_noops_out_of_turn() {
        // Consumer cannot advance past an odd phase twice.
        let word = at_phase(1);
        word.advance_read();
        assert_eq!(word.load(), Step::Phase(1));

        // Worker cannot advance an even phase.
        let word = at_phase(2);
        word.advance_write();
        assert_eq!(word.load(), Step::Phase(2));

        // Neither side moves the initial state the wrong way.
        let word = StepWord::new();
        word.advance_read();
        assert_eq!(word.load(), Step::WaitingForDimensions);
    }
}
