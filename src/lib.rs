//! Playback core for the notebox BLE peripheral.
//!
//! A client writes up to [`config::CAPACITY`] note bytes to a single GATT
//! characteristic. Each write passes an admission gate ([`authorize`]), replaces
//! the stored sequence ([`buffer`]) and, depending on the deployment profile,
//! is played immediately or replayed on a timer ([`trigger`]) through a PWM
//! buzzer ([`playback`]).
//!
//! The BLE stack itself sits behind [`service::GattTransport`]; the firmware in
//! `notebox-node/` supplies the ESP-IDF implementation.

pub mod authorize;
pub mod buffer;
pub mod config;
pub mod error;
pub mod frequency;
pub mod notify;
pub mod playback;
pub mod service;
pub mod trigger;

pub use authorize::{PendingWrite, WriteAuthorizer};
pub use buffer::{NoteBuffer, NoteSequence};
pub use config::{Dispatch, Profile, ServiceConfig, Timing, TriggerPolicy, ValueGate, CAPACITY};
pub use error::{Rejection, ServiceError, TransportError, Verdict};
pub use frequency::{frequency, PlaybackEvent};
pub use notify::NotificationEmitter;
pub use playback::{
    DurationSource, IndicatorLine, Indicators, NoIndicators, PinIndicators, Play, PlaybackDriver,
    RngDurations, Tone,
};
pub use service::{
    AttrHandle, CharacteristicDescriptor, GattTransport, NoteService, Properties,
    ServiceDescriptor, ServiceState,
};
pub use trigger::{Mailbox, PlaybackRequest, PlaybackTrigger, Ticker};
