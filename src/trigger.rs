//! Decides when playback runs and on which context.
//!
//! Playback blocks for `notes × (on + off)`, far longer than a GATT callback
//! may take. With [`Dispatch::Worker`] the event context only posts the
//! snapshot into a single-slot [`Mailbox`] and returns; a dedicated thread
//! drains it. The slot holds at most one request and a newer one replaces it,
//! so writes arriving during a run coalesce into one follow-up run over the
//! latest data.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info};

use crate::buffer::NoteSequence;
use crate::config::{Dispatch, TriggerPolicy};
use crate::notify::NotificationEmitter;
use crate::playback::Play;
use crate::service::AttrHandle;

/// Stack for the playback and timer threads; the IDF pthread default is too
/// small once `log` formatting is involved.
const THREAD_STACK_SIZE: usize = 8 * 1024;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One run to perform. `announce` names the characteristic to notify before playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackRequest {
    pub sequence: NoteSequence,
    pub announce: Option<AttrHandle>,
}

// ── Mailbox ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Slot {
    pending: Option<PlaybackRequest>,
    in_flight: bool,
    closed: bool,
}

/// Single-slot, latest-wins handoff between the event context and the worker.
#[derive(Default)]
pub struct Mailbox {
    slot: Mutex<Slot>,
    changed: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `request`, replacing any request not yet taken. Returns `true`
    /// when a pending request was replaced. Ignored once closed.
    pub fn post(&self, request: PlaybackRequest) -> bool {
        let mut slot = lock(&self.slot);
        if slot.closed {
            return false;
        }
        let replaced = slot.pending.replace(request).is_some();
        self.changed.notify_all();
        replaced
    }

    /// Blocks until a request is available and marks it in flight.
    /// Returns `None` once the mailbox is closed.
    pub fn take(&self) -> Option<PlaybackRequest> {
        let mut slot = lock(&self.slot);
        loop {
            if slot.closed {
                return None;
            }
            if let Some(request) = slot.pending.take() {
                slot.in_flight = true;
                return Some(request);
            }
            slot = self
                .changed
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Marks the request returned by the last [`Mailbox::take`] as finished.
    pub fn done(&self) {
        let mut slot = lock(&self.slot);
        slot.in_flight = false;
        self.changed.notify_all();
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }

    /// Nothing queued and nothing being played.
    pub fn is_idle(&self) -> bool {
        let slot = lock(&self.slot);
        slot.pending.is_none() && !slot.in_flight
    }

    /// Blocks until idle or until `timeout` elapses. Returns whether it went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.slot);
        while slot.pending.is_some() || slot.in_flight {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            slot = self
                .changed
                .wait_timeout(slot, left)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Wakes the worker for shutdown; a pending request is dropped.
    pub fn close(&self) {
        let mut slot = lock(&self.slot);
        slot.closed = true;
        slot.pending = None;
        self.changed.notify_all();
    }
}

// ── Stage ──────────────────────────────────────────────────────────────────

/// The driver plus what happens around a run.
struct Stage {
    player: Mutex<Box<dyn Play>>,
    emitter: Option<NotificationEmitter>,
    playing: AtomicBool,
    runs: AtomicUsize,
}

impl Stage {
    fn run(&self, request: PlaybackRequest) {
        if request.sequence.is_empty() {
            return;
        }

        self.playing.store(true, Ordering::SeqCst);
        if let (Some(handle), Some(emitter)) = (request.announce, &self.emitter) {
            emitter.announce(handle);
        }

        let result = lock(&self.player).play(&request.sequence);
        self.playing.store(false, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(n) => debug!("Playback finished ({n} notes)"),
            Err(e) => error!("Playback failed: {e:#}"),
        }
    }
}

// ── Trigger ────────────────────────────────────────────────────────────────

pub struct PlaybackTrigger {
    policy: TriggerPolicy,
    stage: Arc<Stage>,
    mailbox: Option<Arc<Mailbox>>,
    worker: Option<JoinHandle<()>>,
}

impl PlaybackTrigger {
    /// Spawns the playback thread when `dispatch` is [`Dispatch::Worker`].
    pub fn new(
        policy: TriggerPolicy,
        dispatch: Dispatch,
        player: Box<dyn Play>,
        emitter: Option<NotificationEmitter>,
    ) -> anyhow::Result<Self> {
        let stage = Arc::new(Stage {
            player: Mutex::new(player),
            emitter,
            playing: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
        });

        let (mailbox, worker) = match dispatch {
            Dispatch::Inline => (None, None),
            Dispatch::Worker => {
                let mailbox = Arc::new(Mailbox::new());
                let worker = spawn_worker(stage.clone(), mailbox.clone())?;
                (Some(mailbox), Some(worker))
            }
        };

        Ok(Self {
            policy,
            stage,
            mailbox,
            worker,
        })
    }

    pub fn policy(&self) -> TriggerPolicy {
        self.policy
    }

    /// Called after an accepted write. Requests one run under [`TriggerPolicy::OnWrite`].
    pub fn on_write(&self, sequence: NoteSequence) -> bool {
        match self.policy {
            TriggerPolicy::OnWrite => self.submit(PlaybackRequest {
                sequence,
                announce: None,
            }),
            TriggerPolicy::Periodic { .. } => false,
        }
    }

    /// Called from the replay timer. Requests one run under
    /// [`TriggerPolicy::Periodic`], announced on `announce` first.
    pub fn on_tick(&self, sequence: NoteSequence, announce: Option<AttrHandle>) -> bool {
        match self.policy {
            TriggerPolicy::Periodic { .. } => self.submit(PlaybackRequest { sequence, announce }),
            TriggerPolicy::OnWrite => false,
        }
    }

    fn submit(&self, request: PlaybackRequest) -> bool {
        if request.sequence.is_empty() {
            return false;
        }
        match &self.mailbox {
            Some(mailbox) => {
                if mailbox.post(request) {
                    debug!("Coalesced pending playback into latest sequence");
                }
            }
            None => self.stage.run(request),
        }
        true
    }

    pub fn is_playing(&self) -> bool {
        self.stage.playing.load(Ordering::SeqCst)
    }

    /// A run is queued, announcing or playing.
    pub fn is_busy(&self) -> bool {
        let queued = self.mailbox.as_ref().is_some_and(|m| !m.is_idle());
        queued || self.is_playing()
    }

    /// Completed runs, successful or not.
    pub fn runs(&self) -> usize {
        self.stage.runs.load(Ordering::SeqCst)
    }

    /// Blocks until no run is queued or playing. Inline dispatch is always idle
    /// by the time the caller gets control back.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        match &self.mailbox {
            Some(mailbox) => mailbox.wait_idle(timeout),
            None => true,
        }
    }
}

impl Drop for PlaybackTrigger {
    fn drop(&mut self) {
        if let Some(mailbox) = &self.mailbox {
            mailbox.close();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Playback worker panicked");
            }
        }
    }
}

fn spawn_worker(stage: Arc<Stage>, mailbox: Arc<Mailbox>) -> anyhow::Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("playback".into())
        .stack_size(THREAD_STACK_SIZE)
        .spawn(move || {
            info!("Playback worker started");
            while let Some(request) = mailbox.take() {
                stage.run(request);
                mailbox.done();
            }
            debug!("Playback worker stopped");
        })?;
    Ok(handle)
}

// ── Ticker ─────────────────────────────────────────────────────────────────

/// Calls a closure every `period` on its own thread until dropped.
pub struct Ticker {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Ticker {
    pub fn start<F>(period: Duration, mut on_tick: F) -> anyhow::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("replay-timer".into())
            .stack_size(THREAD_STACK_SIZE)
            .spawn(move || loop {
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => on_tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        // Dropping the sender disconnects the channel and ends the loop.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Replay timer panicked");
            }
        }
    }
}
