//! The note service as seen by the BLE stack.
//!
//! [`GattTransport`] is everything the core needs from the stack: registering
//! the service and pushing notifications. Inbound events arrive as calls on
//! [`NoteService`], one at a time, from the stack's event context.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, info, warn};

use crate::authorize::{PendingWrite, WriteAuthorizer};
use crate::buffer::{NoteBuffer, NoteSequence};
use crate::config::{ServiceConfig, TriggerPolicy, CAPACITY, NOTE_CHAR_UUID, SERVICE_UUID};
use crate::error::{ServiceError, TransportError, Verdict};
use crate::notify::NotificationEmitter;
use crate::playback::Play;
use crate::trigger::{lock, PlaybackTrigger, Ticker};

// ── Transport seam ─────────────────────────────────────────────────────────

/// Attribute handle assigned by the GATT server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttrHandle(pub u16);

impl fmt::Display for AttrHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle 0x{:04x}", self.0)
    }
}

bitflags! {
    /// Characteristic properties, same bit values as the ATT declaration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Properties: u8 {
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    pub uuid: u128,
    pub properties: Properties,
    pub max_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: u128,
    pub characteristic: CharacteristicDescriptor,
}

pub trait GattTransport: Send + Sync {
    fn register_service(&self, service: &ServiceDescriptor) -> Result<(), TransportError>;

    /// Updates `handle` with `payload` and, unless `local_only`, notifies subscribers.
    fn notify(&self, handle: AttrHandle, payload: &[u8], local_only: bool)
        -> Result<(), TransportError>;
}

// ── Service ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    /// A write passed the gate and has not been applied yet.
    Receiving,
    Playing,
}

struct Inner {
    config: ServiceConfig,
    transport: Arc<dyn GattTransport>,
    note_handle: OnceLock<AttrHandle>,
    authorizer: Mutex<WriteAuthorizer>,
    buffer: Mutex<NoteBuffer>,
    trigger: PlaybackTrigger,
    receiving: AtomicBool,
    subscribed: AtomicBool,
}

/// Cheap to clone; every clone drives the same service.
#[derive(Clone)]
pub struct NoteService {
    inner: Arc<Inner>,
}

impl NoteService {
    pub fn new(
        config: ServiceConfig,
        player: Box<dyn Play>,
        transport: Arc<dyn GattTransport>,
    ) -> anyhow::Result<Self> {
        // Only the replay profile tells clients a run is about to start.
        let emitter = match config.trigger {
            TriggerPolicy::Periodic { .. } => Some(NotificationEmitter::new(transport.clone())),
            TriggerPolicy::OnWrite => None,
        };
        let trigger = PlaybackTrigger::new(config.trigger, config.dispatch, player, emitter)?;

        // The gate, the buffer and the advertised length share one bound.
        let capacity = config.capacity.min(CAPACITY);
        if capacity != config.capacity {
            warn!(
                "Note capacity {} exceeds {CAPACITY}, using {capacity}",
                config.capacity
            );
        }
        let config = ServiceConfig { capacity, ..config };
        let authorizer = WriteAuthorizer::new(capacity).with_value_gate(config.value_gate);

        Ok(Self {
            inner: Arc::new(Inner {
                buffer: Mutex::new(NoteBuffer::new(capacity)),
                authorizer: Mutex::new(authorizer),
                note_handle: OnceLock::new(),
                receiving: AtomicBool::new(false),
                subscribed: AtomicBool::new(false),
                trigger,
                transport,
                config,
            }),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            uuid: SERVICE_UUID,
            characteristic: CharacteristicDescriptor {
                uuid: NOTE_CHAR_UUID,
                properties: Properties::READ
                    | Properties::WRITE
                    | Properties::WRITE_WITHOUT_RESPONSE
                    | Properties::NOTIFY,
                max_len: self.inner.config.capacity,
            },
        }
    }

    /// Registers the service with the stack. Failure is fatal to BLE bring-up.
    pub fn start(&self) -> Result<(), ServiceError> {
        info!("Registering NoteService...");
        self.inner
            .transport
            .register_service(&self.descriptor())
            .map_err(ServiceError::Registration)?;
        info!("NoteService registered.");
        Ok(())
    }

    /// Records the value handle the stack assigned to the note characteristic.
    pub fn bind(&self, handle: AttrHandle) {
        if let Err(handle) = self.inner.note_handle.set(handle) {
            warn!("Note characteristic already bound, ignoring {handle}");
            return;
        }
        if self
            .inner
            .config
            .value_gate
            .is_some_and(|gate| gate.bound_note_field)
        {
            lock(&self.inner.authorizer).bound_field(handle);
        }
        info!("Note characteristic bound to {handle}");
    }

    pub fn note_handle(&self) -> Option<AttrHandle> {
        self.inner.note_handle.get().copied()
    }

    fn is_note(&self, handle: AttrHandle) -> bool {
        self.note_handle() == Some(handle)
    }

    /// Admission gate. Writes to other attributes are not ours to refuse.
    pub fn on_write_requested(&self, handle: AttrHandle, data: &[u8]) -> Verdict {
        if !self.is_note(handle) {
            return Verdict::Accept;
        }

        let verdict = lock(&self.inner.authorizer).authorize(&PendingWrite::new(handle, data));
        match verdict {
            Verdict::Accept => self.inner.receiving.store(true, Ordering::SeqCst),
            Verdict::Reject(r) => {
                self.inner.receiving.store(false, Ordering::SeqCst);
                warn!("Rejected note write (len={}): {r}", data.len());
            }
        }
        verdict
    }

    /// Stores an accepted write and hands it to the trigger.
    pub fn on_write_completed(&self, handle: AttrHandle, data: &[u8]) {
        if !self.is_note(handle) {
            return;
        }

        // Gate the completed bytes themselves, not the earlier request.
        self.inner.receiving.store(false, Ordering::SeqCst);
        let verdict = lock(&self.inner.authorizer).authorize(&PendingWrite::new(handle, data));
        if !verdict.is_accept() {
            warn!("Dropping unauthorized note write (len={})", data.len());
            return;
        }

        let snapshot = {
            let mut buffer = lock(&self.inner.buffer);
            buffer.apply(data);
            buffer.snapshot()
        };
        info!("Note data received (len={}): {:X}", snapshot.len(), snapshot);

        self.inner.trigger.on_write(snapshot);
    }

    /// Authorize and, if accepted, apply. For transports that report a write once.
    pub fn handle_write(&self, handle: AttrHandle, data: &[u8]) -> Verdict {
        let verdict = self.on_write_requested(handle, data);
        if verdict.is_accept() {
            self.on_write_completed(handle, data);
        }
        verdict
    }

    /// Raw stored bytes, for reads of the note characteristic.
    pub fn on_read(&self, handle: AttrHandle) -> Option<NoteSequence> {
        self.is_note(handle).then(|| self.snapshot())
    }

    pub fn on_data_sent(&self) {
        info!("Notification data was sent.");
    }

    pub fn on_subscription_changed(&self, handle: AttrHandle, enabled: bool) {
        if !self.is_note(handle) {
            return;
        }
        self.inner.subscribed.store(enabled, Ordering::SeqCst);
        info!(
            "Client {} note notifications",
            if enabled { "subscribed to" } else { "unsubscribed from" }
        );
    }

    /// Replays whatever is stored. Returns whether a run was requested.
    pub fn on_timer_fired(&self) -> bool {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return false;
        }
        debug!("Replay timer fired (len={})", snapshot.len());
        self.inner.trigger.on_tick(snapshot, self.note_handle())
    }

    /// Starts the replay timer for the periodic profile; `None` otherwise.
    /// The timer stops when the returned [`Ticker`] is dropped.
    pub fn schedule_replay(&self) -> anyhow::Result<Option<Ticker>> {
        let TriggerPolicy::Periodic { period } = self.inner.config.trigger else {
            return Ok(None);
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let ticker = Ticker::start(period, move || {
            if let Some(inner) = weak.upgrade() {
                NoteService { inner }.on_timer_fired();
            }
        })?;
        info!("Replaying stored notes every {period:?}");
        Ok(Some(ticker))
    }

    pub fn snapshot(&self) -> NoteSequence {
        lock(&self.inner.buffer).snapshot()
    }

    pub fn state(&self) -> ServiceState {
        if self.inner.trigger.is_busy() {
            ServiceState::Playing
        } else if self.inner.receiving.load(Ordering::SeqCst) {
            ServiceState::Receiving
        } else {
            ServiceState::Idle
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.subscribed.load(Ordering::SeqCst)
    }

    /// Blocks until no playback run is queued or in progress.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.inner.trigger.wait_idle(timeout)
    }
}


#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::fakes::FakeTransport;
    use super::*;
    use crate::config::{Dispatch, Profile, Timing, ValueGate, CAPACITY};
    use crate::error::Rejection;
    use crate::playback::fakes::{driver, Recorder};

    const NOTE: AttrHandle = AttrHandle(42);
    const CCCD: AttrHandle = AttrHandle(43);
    const WAIT: Duration = Duration::from_secs(5);

    struct Rig {
        service: NoteService,
        transport: Arc<FakeTransport>,
        rec: Recorder,
    }

    fn rig(config: ServiceConfig) -> Rig {
        let rec = Recorder::default();
        let transport = Arc::new(FakeTransport::default());
        let player = Box::new(driver(&rec, config.timing.clone(), false));
        let service = NoteService::new(config, player, transport.clone()).unwrap();
        service.start().unwrap();
        service.bind(NOTE);
        Rig {
            service,
            transport,
            rec,
        }
    }

    fn inline(profile: Profile) -> Rig {
        rig(ServiceConfig {
            dispatch: Dispatch::Inline,
            ..ServiceConfig::from(profile)
        })
    }

    fn assert_freqs(got: &[f32], want: &[f32]) {
        assert_eq!(got.len(), want.len(), "played {got:?}, want {want:?}");
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() < 0.01, "played {got:?}, want {want:?}");
        }
    }

    #[test]
    fn start_registers_note_characteristic() {
        let rig = inline(Profile::Replay);
        let registered = rig.transport.registered();
        assert_eq!(registered.len(), 1);
        let desc = &registered[0];
        assert_eq!(desc.uuid, SERVICE_UUID);
        assert_eq!(desc.characteristic.uuid, NOTE_CHAR_UUID);
        assert_eq!(desc.characteristic.max_len, CAPACITY);
        assert!(desc
            .characteristic
            .properties
            .contains(Properties::WRITE | Properties::WRITE_WITHOUT_RESPONSE | Properties::NOTIFY));
    }

    #[test]
    fn registration_failure_is_surfaced() {
        let transport = Arc::new(FakeTransport::default());
        transport.fail_registration();
        let rec = Recorder::default();
        let service = NoteService::new(
            ServiceConfig::default(),
            Box::new(driver(&rec, Timing::fixed(), false)),
            transport,
        )
        .unwrap();

        let err = service.start().unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Registration(TransportError::Registration(_))
        ));
    }

    #[test]
    fn every_valid_length_is_stored() {
        let rig = inline(Profile::Replay);
        for len in 1..=CAPACITY {
            let data = vec![64u8; len];
            assert!(rig.service.handle_write(NOTE, &data).is_accept());
            assert_eq!(rig.service.snapshot().len(), len);
        }
    }

    #[test]
    fn invalid_lengths_leave_buffer_untouched() {
        let rig = inline(Profile::Replay);
        rig.service.handle_write(NOTE, &[60, 72, 48]);

        for data in [vec![], vec![60u8; CAPACITY + 1], vec![60u8; 64]] {
            let verdict = rig.service.handle_write(NOTE, &data);
            assert!(matches!(
                verdict.rejection(),
                Some(Rejection::InvalidLength { .. })
            ));
            assert_eq!(rig.service.snapshot().as_slice(), &[60, 72, 48]);
        }
    }

    #[test]
    fn write_triggered_run_plays_written_notes() {
        let rig = inline(Profile::Immediate);
        assert!(rig.service.handle_write(NOTE, &[60, 72, 48]).is_accept());

        assert_eq!(rig.rec.cycles(), 3);
        assert_freqs(&rig.rec.frequencies(), &[261.63, 523.26, 130.815]);
    }

    #[test]
    fn oversized_write_after_valid_one_is_rejected() {
        let rig = inline(Profile::Replay);
        rig.service.handle_write(NOTE, &[60, 72, 48]);
        let verdict = rig.service.handle_write(NOTE, &[50u8; 21]);

        assert!(!verdict.is_accept());
        assert_eq!(rig.service.snapshot().as_slice(), &[60, 72, 48]);
    }

    #[test]
    fn last_write_wins_before_replay() {
        let rig = inline(Profile::Replay);
        rig.service.handle_write(NOTE, &[60]);
        rig.service.handle_write(NOTE, &[72]);
        assert!(rig.rec.actions().is_empty(), "replay profile waits for the timer");

        assert!(rig.service.on_timer_fired());
        assert_freqs(&rig.rec.frequencies(), &[523.26]);
    }

    #[test]
    fn snapshot_is_idempotent() {
        let rig = inline(Profile::Replay);
        rig.service.handle_write(NOTE, &[61, 63]);
        assert_eq!(rig.service.snapshot(), rig.service.snapshot());
    }

    #[test]
    fn timer_on_empty_buffer_does_nothing() {
        let rig = inline(Profile::Replay);
        rig.transport.set_subscribed(true);
        assert!(!rig.service.on_timer_fired());
        assert!(rig.rec.actions().is_empty());
        assert_eq!(rig.transport.attempts(), 0);
    }

    #[test]
    fn replay_notifies_subscribers_first() {
        let rig = inline(Profile::Replay);
        rig.transport.set_subscribed(true);
        rig.service.handle_write(NOTE, &[60]);

        rig.service.on_timer_fired();
        assert_eq!(rig.transport.notified(), vec![(NOTE, vec![0x01], false)]);
        assert_eq!(rig.rec.cycles(), 1);
    }

    #[test]
    fn replay_without_subscribers_still_plays() {
        let rig = inline(Profile::Replay);
        rig.service.handle_write(NOTE, &[60, 62]);

        rig.service.on_timer_fired();
        rig.service.on_timer_fired();
        assert_eq!(rig.transport.attempts(), 2);
        assert!(rig.transport.notified().is_empty());
        assert_eq!(rig.rec.cycles(), 4);
    }

    #[test]
    fn write_profile_never_notifies() {
        let rig = inline(Profile::Immediate);
        rig.transport.set_subscribed(true);
        rig.service.handle_write(NOTE, &[60]);
        assert_eq!(rig.transport.attempts(), 0);
        assert_eq!(rig.rec.cycles(), 1);
    }

    #[test]
    fn gated_profile_rejects_out_of_range_notes() {
        let rig = inline(Profile::Gated);
        assert!(rig.service.handle_write(NOTE, &[10, 59]).is_accept());
        let verdict = rig.service.handle_write(NOTE, &[10, 60]);
        assert_eq!(
            verdict,
            Verdict::Reject(Rejection::InvalidValue {
                index: 1,
                value: 60,
                ceiling: 60
            })
        );
        assert_eq!(rig.service.snapshot().as_slice(), &[10, 59]);
    }

    #[test]
    fn bounded_note_field_uses_lower_ceiling() {
        let rig = rig(ServiceConfig {
            dispatch: Dispatch::Inline,
            value_gate: Some(ValueGate {
                bound_note_field: true,
                ..ValueGate::default()
            }),
            ..ServiceConfig::from(Profile::Gated)
        });
        assert!(rig.service.handle_write(NOTE, &[23]).is_accept());
        assert!(!rig.service.handle_write(NOTE, &[24]).is_accept());
    }

    #[test]
    fn other_handles_are_ignored() {
        let rig = inline(Profile::Immediate);
        assert!(rig.service.handle_write(CCCD, &[]).is_accept());
        assert!(rig.service.snapshot().is_empty());
        assert!(rig.rec.actions().is_empty());
        assert_eq!(rig.service.on_read(CCCD), None);
    }

    #[test]
    fn read_returns_stored_bytes() {
        let rig = inline(Profile::Replay);
        rig.service.handle_write(NOTE, &[1, 2, 3]);
        assert_eq!(rig.service.on_read(NOTE).unwrap().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn state_follows_write_cycle() {
        let rig = inline(Profile::Replay);
        assert_eq!(rig.service.state(), ServiceState::Idle);

        assert!(rig.service.on_write_requested(NOTE, &[60]).is_accept());
        assert_eq!(rig.service.state(), ServiceState::Receiving);

        rig.service.on_write_completed(NOTE, &[60]);
        assert_eq!(rig.service.state(), ServiceState::Idle);
        assert_eq!(rig.service.snapshot().as_slice(), &[60]);
    }

    #[test]
    fn rejected_write_does_not_enter_receiving() {
        let rig = inline(Profile::Replay);
        rig.service.on_write_requested(NOTE, &[]);
        assert_eq!(rig.service.state(), ServiceState::Idle);
    }

    #[test]
    fn unrequested_completion_still_passes_gate() {
        let rig = inline(Profile::Gated);
        rig.service.on_write_completed(NOTE, &[99]);
        assert!(rig.service.snapshot().is_empty());

        rig.service.on_write_completed(NOTE, &[30]);
        assert_eq!(rig.service.snapshot().as_slice(), &[30]);
    }

    #[test]
    fn completion_is_gated_on_its_own_bytes() {
        let rig = inline(Profile::Gated);
        assert!(rig.service.on_write_requested(NOTE, &[10]).is_accept());
        assert!(!rig.service.on_write_requested(NOTE, &[99]).is_accept());
        assert_eq!(
            rig.service.state(),
            ServiceState::Idle,
            "rejection clears the receiving state"
        );

        rig.service.on_write_completed(NOTE, &[99, 200]);
        assert!(
            rig.service.snapshot().is_empty(),
            "stored {:?}",
            rig.service.snapshot()
        );
        assert!(rig.rec.actions().is_empty());
    }

    #[test]
    fn accepted_request_does_not_admit_different_bytes() {
        let rig = inline(Profile::Gated);
        assert!(rig.service.on_write_requested(NOTE, &[30]).is_accept());
        rig.service.on_write_completed(NOTE, &[61]);
        assert!(rig.service.snapshot().is_empty());
        assert_eq!(rig.service.state(), ServiceState::Idle);
    }

    #[test]
    fn oversized_capacity_is_clamped_everywhere() {
        let rig = rig(ServiceConfig {
            dispatch: Dispatch::Inline,
            capacity: CAPACITY + 12,
            ..ServiceConfig::from(Profile::Replay)
        });
        assert_eq!(rig.service.config().capacity, CAPACITY);
        assert_eq!(rig.transport.registered()[0].characteristic.max_len, CAPACITY);

        let verdict = rig.service.handle_write(NOTE, &[60; CAPACITY + 5]);
        assert_eq!(
            verdict,
            Verdict::Reject(Rejection::InvalidLength {
                len: CAPACITY + 5,
                capacity: CAPACITY
            })
        );
        assert!(rig.service.snapshot().is_empty());

        assert!(rig.service.handle_write(NOTE, &[60; CAPACITY]).is_accept());
        assert_eq!(rig.service.snapshot().len(), CAPACITY);
    }

    #[test]
    fn subscription_tracking() {
        let rig = inline(Profile::Replay);
        assert!(!rig.service.is_subscribed());
        rig.service.on_subscription_changed(NOTE, true);
        assert!(rig.service.is_subscribed());
        rig.service.on_subscription_changed(CCCD, false);
        assert!(rig.service.is_subscribed());
        rig.service.on_subscription_changed(NOTE, false);
        assert!(!rig.service.is_subscribed());
    }

    #[test]
    fn second_bind_is_ignored() {
        let rig = inline(Profile::Replay);
        rig.service.bind(AttrHandle(99));
        assert_eq!(rig.service.note_handle(), Some(NOTE));
    }

    #[test]
    fn worker_dispatch_returns_before_playback_ends() {
        let rec = Recorder::default();
        let transport = Arc::new(FakeTransport::default());
        let config = ServiceConfig::from(Profile::Immediate);
        let player = Box::new(driver(&rec, Timing::fixed(), true));
        let service = NoteService::new(config, player, transport).unwrap();
        service.bind(NOTE);

        let started = Instant::now();
        assert!(service.handle_write(NOTE, &[60, 72, 48, 60, 72, 48]).is_accept());
        // Six notes at ~25 ms each; the write path must not wait for them.
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(
            service.state(),
            ServiceState::Playing,
            "queued run reads as playing"
        );

        assert!(service.wait_idle(WAIT));
        assert_eq!(rec.cycles(), 6);
        assert_eq!(service.state(), ServiceState::Idle);
    }

    #[test]
    fn scheduled_replay_plays_stored_notes() {
        let rig = rig(ServiceConfig {
            trigger: TriggerPolicy::Periodic {
                period: Duration::from_millis(10),
            },
            ..ServiceConfig::from(Profile::Replay)
        });
        rig.service.handle_write(NOTE, &[72]);
        let ticker = rig.service.schedule_replay().unwrap().expect("periodic profile");

        let started = Instant::now();
        while rig.rec.cycles() < 2 && started.elapsed() < WAIT {
            thread::sleep(Duration::from_millis(2));
        }
        drop(ticker);
        assert!(rig.service.wait_idle(WAIT));
        assert!(rig.rec.cycles() >= 2);
        assert!(rig
            .rec
            .frequencies()
            .iter()
            .all(|f| (f - 523.26).abs() < 0.01));
    }

    #[test]
    fn write_profile_has_no_replay_timer() {
        let rig = inline(Profile::Immediate);
        assert!(rig.service.schedule_replay().unwrap().is_none());
    }
}
