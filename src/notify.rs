//! "About to play" notifications. Fire and forget: a failed push is logged and dropped.

use std::sync::Arc;

use log::{info, warn};

use crate::config::ANNOUNCE_PAYLOAD;
use crate::error::TransportError;
use crate::service::{AttrHandle, GattTransport};

#[derive(Clone)]
pub struct NotificationEmitter {
    transport: Arc<dyn GattTransport>,
    payload: Vec<u8>,
}

impl NotificationEmitter {
    pub fn new(transport: Arc<dyn GattTransport>) -> Self {
        Self {
            transport,
            payload: ANNOUNCE_PAYLOAD.to_vec(),
        }
    }

    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    /// Pushes the payload to subscribers of `handle`. Returns whether it went out.
    pub fn announce(&self, handle: AttrHandle) -> bool {
        match self.transport.notify(handle, &self.payload, false) {
            Ok(()) => true,
            Err(TransportError::NoSubscribers) => {
                info!("Notify skipped: no subscribers on {handle}");
                false
            }
            Err(e) => {
                warn!("Notify write error on {handle}: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::fakes::FakeTransport;

    #[test]
    fn announce_sends_single_byte_to_clients() {
        let transport = Arc::new(FakeTransport::default());
        transport.set_subscribed(true);
        let emitter = NotificationEmitter::new(transport.clone());

        assert!(emitter.announce(AttrHandle(42)));
        assert_eq!(transport.notified(), vec![(AttrHandle(42), vec![0x01], false)]);
    }

    #[test]
    fn no_subscriber_is_swallowed() {
        let transport = Arc::new(FakeTransport::default());
        let emitter = NotificationEmitter::new(transport.clone());

        assert!(!emitter.announce(AttrHandle(42)));
        assert!(!emitter.announce(AttrHandle(42)));
        assert_eq!(transport.attempts(), 2, "each announce tries exactly once");
        assert!(transport.notified().is_empty());
    }

    #[test]
    fn custom_payload() {
        let transport = Arc::new(FakeTransport::default());
        transport.set_subscribed(true);
        let emitter = NotificationEmitter::new(transport.clone()).with_payload(&[0xAA, 0x55]);

        emitter.announce(AttrHandle(7));
        assert_eq!(transport.notified()[0].1, vec![0xAA, 0x55]);
    }
}
