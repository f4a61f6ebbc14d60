// SPDX-License-Identifier: MPL-2.0

//! Public clip handle and the state it shares with its worker.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
    Arc, Mutex,
};

use image::RgbaImage;

use crate::{
    engine::Engine,
    prepare,
    slot::{FrameSlot, Step, StepWord},
    types::{ClipId, ClipSource, FrameRequest, Mode, Notification, State},
    worker::WorkerHandle,
};

const STATE_READING: u8 = 0;
const STATE_ERROR: u8 = 1;

/// State shared between the consumer thread and the worker thread.
pub(crate) struct ClipShared {
    pub mode: Mode,
    pub step: StepWord,
    pub frames: [FrameSlot; 3],
    pub paused: AtomicBool,
    state: AtomicU8,
    pub width: AtomicU32,
    pub height: AtomicU32,
    pub factor: u32,
    pub callback: Box<dyn Fn(Notification) + Send + Sync>,
    /// Taken by the worker when it constructs the backend.
    pub source: Mutex<Option<ClipSource>>,
}

impl ClipShared {
    pub(crate) fn state(&self) -> State {
        if self.state.load(Ordering::Acquire) == STATE_ERROR {
            State::Error
        } else {
            State::Reading
        }
    }

    /// Terminal: once set the clip never leaves `Error`.
    pub(crate) fn set_error(&self) {
        self.state.store(STATE_ERROR, Ordering::Release);
    }

    pub(crate) fn notify(&self, notification: Notification) {
        (self.callback)(notification);
    }
}

/// A single looping animated clip.
///
/// Constructing a clip assigns it to a worker thread which decodes frames
/// into the clip's triple buffer and reports progress through the callback.
/// The consumer paints with [`Clip::current`], which never blocks.
///
/// Dropping the clip stops playback.
pub struct Clip {
    id: ClipId,
    shared: Arc<ClipShared>,
    worker: Option<Arc<WorkerHandle>>,
    worker_index: usize,
}

impl Clip {
    /// Create a clip and hand it to the engine's least-loaded worker.
    ///
    /// `factor` is the integer device-pixel ratio of the target display. The
    /// callback runs on the worker thread; it should post a wake-up to the
    /// consumer's own event loop rather than paint or call back into the
    /// clip synchronously.
    pub fn new<C>(engine: &Engine, source: ClipSource, mode: Mode, factor: u32, callback: C) -> Self
    where
        C: Fn(Notification) + Send + Sync + 'static,
    {
        let id = engine.next_clip_id();
        let shared = Arc::new(ClipShared {
            mode,
            step: StepWord::new(),
            frames: [FrameSlot::new(), FrameSlot::new(), FrameSlot::new()],
            paused: AtomicBool::new(false),
            state: AtomicU8::new(STATE_READING),
            width: AtomicU32::new(0),
            height: AtomicU32::new(0),
            factor: factor.max(1),
            callback: Box::new(callback),
            source: Mutex::new(Some(source)),
        });

        match engine.assign_worker() {
            Some((worker_index, worker)) => {
                worker.register(id, shared.clone());
                Self {
                    id,
                    shared,
                    worker: Some(worker),
                    worker_index,
                }
            }
            None => {
                shared.set_error();
                Self {
                    id,
                    shared,
                    worker: None,
                    worker_index: 0,
                }
            }
        }
    }

    /// Supply the paint geometry and begin sized playback.
    ///
    /// Only meaningful while the clip is waiting for a request (after the
    /// first `Reinit`); a no-op otherwise. Dimensions are logical pixels and
    /// get multiplied by the clip's device-pixel factor.
    pub fn start(&mut self, frame_w: u32, frame_h: u32, outer_w: u32, outer_h: u32, rounded: bool) {
        if self.shared.state() == State::Error {
            return;
        }
        if self.shared.step.load() != Step::WaitingForRequest {
            return;
        }
        let request =
            FrameRequest::scaled(frame_w, frame_h, outer_w, outer_h, self.shared.factor, rounded);
        // While waiting for a request the producer has no write slot, so the
        // consumer owns all three.
        for slot in &self.shared.frames {
            unsafe { slot.data_mut() }.request = request;
        }
        self.shared.step.advance_read();
        self.wake_worker();
    }

    /// Return the pixmap to paint right now, advancing the read cursor.
    ///
    /// `now == 0` records that the consumer is alive but does not want
    /// playback to continue; any other value marks the frame displayed and
    /// resumes a paused clip. If the requested outer size differs from the
    /// stored pixmap the frame is re-prepared in place on the calling thread.
    ///
    /// Never blocks. Returns `None` until the first frame is available.
    pub fn current(
        &mut self,
        frame_w: u32,
        frame_h: u32,
        outer_w: u32,
        outer_h: u32,
        now: u64,
    ) -> Option<Arc<RgbaImage>> {
        // Slot 0 is still producer-owned while the first sized frame is
        // rendering; nothing to paint yet.
        match self.shared.step.load() {
            Step::WaitingForDimensions | Step::WaitingForFirstFrame => return None,
            _ => {}
        }
        let show = self.shared.step.show_index()?;
        let slot = &self.shared.frames[show];

        if now != 0 {
            slot.displayed.store(1, Ordering::Release);
            if self.shared.paused.load(Ordering::Acquire) {
                self.shared.paused.store(false, Ordering::Release);
                if self.shared.state() != State::Error {
                    self.wake_worker();
                }
            }
        } else {
            // Shown, but the consumer wants the clip paused.
            slot.displayed.store(-1, Ordering::Release);
        }

        let factor = self.shared.factor;
        let outer = (outer_w * factor, outer_h * factor);
        {
            let data = unsafe { slot.data() };
            if let Some(prepared) = &data.prepared {
                if prepared.dimensions() == outer {
                    let pixmap = prepared.clone();
                    self.shared.step.advance_read();
                    return Some(pixmap);
                }
            }
        }

        // Size changed: re-prepare from the raw frame on this thread and
        // propagate the new geometry towards the producer.
        let data = unsafe { slot.data_mut() };
        let original = data.original.clone()?;
        data.request.frame_w = frame_w * factor;
        data.request.frame_h = frame_h * factor;
        data.request.outer_w = outer.0;
        data.request.outer_h = outer.1;
        let request = data.request;
        let mut scratch = None;
        let prepared = Arc::new(prepare::prepare_frame(&request, &original, true, &mut scratch));
        data.prepared = Some(prepared.clone());

        if let Some(next) = self.shared.step.write_next_index(true) {
            unsafe { self.shared.frames[next].data_mut() }.request = request;
        }

        self.shared.step.advance_read();
        if self.shared.state() != State::Error {
            self.wake_worker();
        }
        Some(prepared)
    }

    /// Whether the first frame has been decoded and dimensions are known.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.width() > 0 && self.height() > 0
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.shared.width.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.shared.height.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.shared.state()
    }

    /// Index of the worker this clip was assigned to.
    #[must_use]
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// Stop playback and drop the backend on the worker.
    pub fn stop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.unregister(self.id);
        }
    }

    fn wake_worker(&self) {
        let alive = match &self.worker {
            Some(worker) => worker.update(self.id),
            None => false,
        };
        if !alive {
            self.shared.set_error();
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ClipShared> {
        &self.shared
    }
}

impl Drop for Clip {
    fn drop(&mut self) {
        self.stop();
    }
}
