// SPDX-License-Identifier: MPL-2.0

//! Decoder worker threads.
//!
//! Each worker runs a calloop event loop that cooperatively multiplexes many
//! clips: a cross-thread ping wakes it when a clip is registered, updated or
//! removed, and a single-shot timer re-armed after every pass wakes it for
//! the next frame deadline.
//!
//! The registration map is the only state shared with clip handles. It is
//! guarded by a read-write lock: the pass and callback emission hold the read
//! lock, removal takes the write lock, and the update path never upgrades —
//! it only flips an atomic dirty bit under the read lock.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        mpsc, Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    thread::JoinHandle,
    time::Duration,
};

use calloop::{
    ping::{make_ping, Ping},
    timer::{TimeoutAction, Timer},
    EventLoop, LoopHandle, LoopSignal, RegistrationToken,
};
use tracing::{debug, error, warn};

use crate::{
    backend::{ClipBackend, ProcessResult},
    clip::ClipShared,
    config::EngineConfig,
    types::{ClipId, Clock, Notification, NEVER_DELAY_MS},
};

/// One clip's entry in the shared registration map.
pub(crate) struct Registration {
    pub shared: Arc<ClipShared>,
    /// Set by clip handles to request attention on the next pass.
    pub dirty: AtomicBool,
    /// Set once the worker has built a backend for this clip, which is when
    /// load accounting moves to the worker.
    pub activated: AtomicBool,
}

type Registrations = Arc<RwLock<HashMap<ClipId, Registration>>>;

/// Cross-thread handle to one worker.
pub(crate) struct WorkerHandle {
    pub index: usize,
    /// Approximate pixel footprint of the clips in flight, for assignment.
    pub load_level: Arc<AtomicI64>,
    registrations: Registrations,
    average_clip_bytes: i64,
    ping: Ping,
    signal: LoopSignal,
    interrupt: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Start a worker thread and wait for its event loop to come up.
    pub(crate) fn spawn(
        index: usize,
        clock: Arc<Clock>,
        config: &EngineConfig,
    ) -> std::io::Result<Self> {
        let registrations: Registrations = Arc::default();
        let load_level = Arc::new(AtomicI64::new(0));
        let interrupt = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = std::thread::Builder::new()
            .name(format!("clip-worker-{index}"))
            .spawn({
                let registrations = registrations.clone();
                let load_level = load_level.clone();
                let interrupt = interrupt.clone();
                let config = config.clone();
                move || worker_main(index, registrations, load_level, interrupt, clock, config, ready_tx)
            })?;

        match ready_rx.recv() {
            Ok(Some((ping, signal))) => Ok(Self {
                index,
                load_level,
                registrations,
                average_clip_bytes: config.average_clip_bytes,
                ping,
                signal,
                interrupt,
                thread: Mutex::new(Some(thread)),
            }),
            Ok(None) | Err(_) => {
                let _ = thread.join();
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "worker event loop failed to start",
                ))
            }
        }
    }

    pub(crate) fn register(&self, id: ClipId, shared: Arc<ClipShared>) {
        self.load_level
            .fetch_add(self.average_clip_bytes, Ordering::Relaxed);
        write_lock(&self.registrations).insert(
            id,
            Registration {
                shared,
                dirty: AtomicBool::new(true),
                activated: AtomicBool::new(false),
            },
        );
        self.ping.ping();
    }

    /// Flag a clip for attention on the next pass. Returns `false` when the
    /// worker is shutting down.
    pub(crate) fn update(&self, id: ClipId) -> bool {
        if self.interrupt.load(Ordering::Acquire) {
            return false;
        }
        {
            let regs = read_lock(&self.registrations);
            if let Some(reg) = regs.get(&id) {
                reg.dirty.store(true, Ordering::Release);
            }
        }
        self.ping.ping();
        true
    }

    pub(crate) fn unregister(&self, id: ClipId) {
        let removed = write_lock(&self.registrations).remove(&id);
        if let Some(reg) = removed {
            // A backend that never came to exist cannot return the estimate.
            if !reg.activated.load(Ordering::Acquire) {
                self.load_level
                    .fetch_sub(self.average_clip_bytes, Ordering::Relaxed);
            }
        }
        self.ping.ping();
    }

    /// Interrupt the current pass, stop the event loop and join the thread.
    pub(crate) fn quit_and_join(&self) {
        self.interrupt.store(true, Ordering::Release);
        self.signal.stop();
        self.signal.wakeup();
        let handle = lock_thread(&self.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(worker = self.index, "worker thread panicked");
            }
        }
    }
}

fn read_lock(
    registrations: &Registrations,
) -> RwLockReadGuard<'_, HashMap<ClipId, Registration>> {
    registrations.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_lock(
    registrations: &Registrations,
) -> RwLockWriteGuard<'_, HashMap<ClipId, Registration>> {
    registrations
        .write()
        .unwrap_or_else(PoisonError::into_inner)
}

fn lock_thread(
    thread: &Mutex<Option<JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    thread.lock().unwrap_or_else(PoisonError::into_inner)
}

type ReadyMessage = Option<(Ping, LoopSignal)>;

fn worker_main(
    index: usize,
    registrations: Registrations,
    load_level: Arc<AtomicI64>,
    interrupt: Arc<AtomicBool>,
    clock: Arc<Clock>,
    config: EngineConfig,
    ready_tx: mpsc::Sender<ReadyMessage>,
) {
    let mut event_loop: EventLoop<'static, WorkerState> = match EventLoop::try_new() {
        Ok(event_loop) => event_loop,
        Err(err) => {
            error!(worker = index, ?err, "failed to create worker event loop");
            let _ = ready_tx.send(None);
            return;
        }
    };
    let loop_handle = event_loop.handle();

    let (ping, ping_source) = match make_ping() {
        Ok(pair) => pair,
        Err(err) => {
            error!(worker = index, ?err, "failed to create worker ping");
            let _ = ready_tx.send(None);
            return;
        }
    };
    if let Err(err) =
        loop_handle.insert_source(ping_source, |_, _, state: &mut WorkerState| state.process())
    {
        error!(worker = index, ?err, "failed to register worker ping");
        let _ = ready_tx.send(None);
        return;
    }

    let mut state = WorkerState {
        index,
        registrations,
        active: HashMap::new(),
        load_level,
        interrupt,
        clock,
        pause_grace_ms: config.pause_grace_ms,
        average_clip_bytes: config.average_clip_bytes,
        in_memory_limit: config.in_memory_limit,
        loop_handle,
        timer_token: None,
        in_pass: false,
        need_rerun: false,
    };

    let _ = ready_tx.send(Some((ping, event_loop.get_signal())));
    debug!(worker = index, "clip worker started");

    if let Err(err) = event_loop.run(None, &mut state, |_| {}) {
        error!(worker = index, ?err, "worker event loop failed");
    }

    debug!(
        worker = index,
        remaining = state.active.len(),
        "clip worker stopped"
    );
}

/// A clip the worker is actively scheduling.
struct ActiveClip {
    backend: ClipBackend,
    /// Next time this backend should be processed.
    scheduled: u64,
}

enum Handled {
    /// Result consumed; move on to the next clip.
    Done,
    /// The clip is gone; drop the backend and its load share.
    Removed,
    /// A repaint was accepted; run the decode step.
    Decode,
}

enum RunOutcome {
    Continue,
    Removed,
    Interrupted,
}

struct WorkerState {
    index: usize,
    registrations: Registrations,
    active: HashMap<ClipId, ActiveClip>,
    load_level: Arc<AtomicI64>,
    interrupt: Arc<AtomicBool>,
    clock: Arc<Clock>,
    pause_grace_ms: u64,
    average_clip_bytes: i64,
    in_memory_limit: u64,
    loop_handle: LoopHandle<'static, WorkerState>,
    timer_token: Option<RegistrationToken>,
    in_pass: bool,
    need_rerun: bool,
}

impl WorkerState {
    /// One scheduling pass: absorb registration changes, process every due
    /// backend, re-arm the timer for the earliest deadline.
    fn process(&mut self) {
        if self.in_pass {
            self.need_rerun = true;
            return;
        }
        self.in_pass = true;
        if let Some(token) = self.timer_token.take() {
            self.loop_handle.remove(token);
        }

        let mut now = self.clock.now_ms();
        self.absorb_registrations(now);

        let ids: Vec<ClipId> = self.active.keys().copied().collect();
        for id in ids {
            let scheduled = match self.active.get(&id) {
                Some(entry) => entry.scheduled,
                None => continue,
            };
            if scheduled > now {
                continue;
            }
            match self.run_clip(id, now) {
                RunOutcome::Continue => {}
                RunOutcome::Removed => continue,
                RunOutcome::Interrupted => {
                    // Leave without re-arming: shutdown is in progress.
                    self.in_pass = false;
                    return;
                }
            }
            // Decoding takes real time; keep the clock honest between clips.
            now = self.clock.now_ms();
            if let Some(entry) = self.active.get_mut(&id) {
                entry.scheduled = if entry.backend.next_frame_when > 0 {
                    entry.backend.next_frame_when
                } else {
                    now + NEVER_DELAY_MS
                };
            }
        }

        let mut min_when = now + NEVER_DELAY_MS;
        for entry in self.active.values() {
            if !entry.backend.paused && entry.scheduled < min_when {
                min_when = entry.scheduled;
            }
        }

        now = self.clock.now_ms();
        let rerun = std::mem::take(&mut self.need_rerun);
        let delay = if rerun || min_when <= now {
            Duration::from_millis(1)
        } else {
            Duration::from_millis(min_when - now)
        };
        self.arm_timer(delay);
        self.in_pass = false;
    }

    /// Walk the registration map: create backends for new clips, refresh
    /// updated ones, and drop backends whose clip has been stopped.
    fn absorb_registrations(&mut self, now: u64) {
        let registrations = self.registrations.clone();
        let regs = read_lock(&registrations);

        let load_level = self.load_level.clone();
        let average = self.average_clip_bytes;
        self.active.retain(|id, entry| {
            if regs.contains_key(id) {
                return true;
            }
            load_level.fetch_sub(footprint(&entry.backend, average), Ordering::Relaxed);
            entry.backend.stop();
            false
        });

        for (&id, reg) in regs.iter() {
            if !reg.dirty.swap(false, Ordering::AcqRel) {
                continue;
            }
            let entry = match self.active.entry(id) {
                std::collections::hash_map::Entry::Vacant(vacant) => {
                    let source = reg
                        .shared
                        .source
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    reg.activated.store(true, Ordering::Release);
                    vacant.insert(ActiveClip {
                        backend: ClipBackend::new(
                            source,
                            reg.shared.mode,
                            self.clock.clone(),
                            self.in_memory_limit,
                        ),
                        scheduled: now,
                    })
                }
                std::collections::hash_map::Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    entry.scheduled = now;
                    if entry.backend.paused && !reg.shared.paused.load(Ordering::Acquire) {
                        entry.backend.paused = false;
                    }
                    entry
                }
            };
            if let Some(index) = reg.shared.step.write_index() {
                // The producer owns the write slot, so the snapshot is safe.
                entry.backend.request = unsafe { reg.shared.frames[index].data() }.request;
            }
        }
    }

    /// Process one due backend, chaining a repaint into its decode step.
    fn run_clip(&mut self, id: ClipId, now: u64) -> RunOutcome {
        let Some(mut entry) = self.active.remove(&id) else {
            return RunOutcome::Continue;
        };
        let mut result = entry.backend.process(now);
        loop {
            match self.handle_result(id, &mut entry.backend, result, now) {
                Handled::Done => {
                    self.active.insert(id, entry);
                    return RunOutcome::Continue;
                }
                Handled::Removed => {
                    self.load_level.fetch_sub(
                        footprint(&entry.backend, self.average_clip_bytes),
                        Ordering::Relaxed,
                    );
                    debug!(worker = self.index, clip = id.0, "clip removed");
                    return RunOutcome::Removed;
                }
                Handled::Decode => {
                    if self.interrupt.load(Ordering::Acquire) {
                        self.active.insert(id, entry);
                        return RunOutcome::Interrupted;
                    }
                    result = entry.backend.finish_process(now);
                }
            }
        }
    }

    /// Map a backend result onto the clip: publish frames, decide pauses,
    /// emit notifications, unregister on error.
    ///
    /// Callback emission happens under the registration read lock, so a clip
    /// removed by `stop` can never observe a late notification.
    fn handle_result(
        &self,
        id: ClipId,
        backend: &mut ClipBackend,
        result: ProcessResult,
        now: u64,
    ) -> Handled {
        let regs = read_lock(&self.registrations);
        let Some(reg) = regs.get(&id) else {
            return Handled::Removed;
        };

        if result == ProcessResult::Error {
            reg.shared.set_error();
            reg.shared.notify(Notification::Reinit);
            drop(regs);
            // Read, drop, re-find under write: never upgrade in place.
            write_lock(&self.registrations).remove(&id);
            return Handled::Removed;
        }

        let shared = &reg.shared;
        let mut result = result;

        if result == ProcessResult::Started {
            let pixels = i64::from(backend.width) * i64::from(backend.height);
            self.load_level
                .fetch_add(pixels - self.average_clip_bytes, Ordering::Relaxed);
            backend.counted = true;
            shared.width.store(backend.width, Ordering::Release);
            shared.height.store(backend.height, Ordering::Release);
            backend.next_frame_when = now;
        }

        if !backend.paused && result == ProcessResult::Repaint {
            if let (Some(show), Some(previous)) =
                (shared.step.show_index(), shared.step.write_next_index(false))
            {
                let show_when = shared.frames[show].when.load(Ordering::Acquire);
                if show_when > 0 && shared.frames[show].displayed.load(Ordering::Acquire) <= 0 {
                    let previous_when = shared.frames[previous].when.load(Ordering::Acquire);
                    let consumer_stalled = show_when + self.pause_grace_ms < now;
                    let queued_unseen = previous_when > 0
                        && shared.frames[previous].displayed.load(Ordering::Acquire) <= 0;
                    if consumer_stalled || queued_unseen {
                        backend.paused = true;
                        shared.paused.store(true, Ordering::Release);
                        result = ProcessResult::Paused;
                        debug!(worker = self.index, clip = id.0, "clip paused, consumer idle");
                    }
                }
            }
        }

        match result {
            ProcessResult::Started | ProcessResult::CopyFrame => {
                let frame = backend.frame();
                let slot = &shared.frames[backend.write_index];
                {
                    // The step word reserves this slot for the producer.
                    let data = unsafe { slot.data_mut() };
                    data.original = frame.original.clone();
                    data.prepared = frame.prepared.clone();
                    data.has_alpha = frame.has_alpha;
                }
                slot.when.store(frame.when, Ordering::Release);
                slot.displayed.store(0, Ordering::Release);
                shared.step.advance_write();
                shared.notify(if result == ProcessResult::Started {
                    Notification::Reinit
                } else {
                    Notification::Repaint
                });
                Handled::Done
            }
            ProcessResult::Paused => {
                // Publish whatever was last committed so the consumer sees
                // fresh content on its next paint.
                shared.step.advance_write();
                shared.notify(Notification::Reinit);
                Handled::Done
            }
            ProcessResult::Repaint => {
                let Some(index) = shared.step.write_index() else {
                    warn!(worker = self.index, clip = id.0, "repaint without a write slot");
                    return Handled::Done;
                };
                backend.write_index = index;
                // Release the destination's pixels before the decode.
                let data = unsafe { shared.frames[index].data_mut() };
                data.original = None;
                data.prepared = None;
                Handled::Decode
            }
            ProcessResult::Wait | ProcessResult::Error => Handled::Done,
        }
    }

    fn arm_timer(&mut self, delay: Duration) {
        let handle = self.loop_handle.clone();
        if let Some(token) = self.timer_token.take() {
            handle.remove(token);
        }
        match handle.insert_source(
            Timer::from_duration(delay),
            |_deadline, _, state: &mut WorkerState| {
                state.timer_token = None;
                state.process();
                TimeoutAction::Drop
            },
        ) {
            Ok(token) => self.timer_token = Some(token),
            Err(err) => error!(worker = self.index, ?err, "failed to arm worker timer"),
        }
    }
}

fn footprint(backend: &ClipBackend, average: i64) -> i64 {
    if backend.counted {
        i64::from(backend.width) * i64::from(backend.height)
    } else {
        average
    }
}
