use thiserror::Error;

/// Why a write was refused at the admission gate.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    #[error("invalid length {len} (expected 1..={capacity})")]
    InvalidLength { len: usize, capacity: usize },

    #[error("byte {index} = {value} is not below {ceiling}")]
    InvalidValue { index: usize, value: u8, ceiling: u8 },
}

/// Outcome of authorizing one pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(Rejection),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }

    pub fn rejection(&self) -> Option<Rejection> {
        match self {
            Verdict::Accept => None,
            Verdict::Reject(r) => Some(*r),
        }
    }
}

impl From<Result<(), Rejection>> for Verdict {
    fn from(result: Result<(), Rejection>) -> Self {
        match result {
            Ok(()) => Verdict::Accept,
            Err(r) => Verdict::Reject(r),
        }
    }
}

/// Failures reported by the GATT transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no client subscribed to notifications")]
    NoSubscribers,

    #[error("no client connected")]
    NotConnected,

    #[error("service registration failed: {0}")]
    Registration(String),

    #[error("BLE stack error: {0}")]
    Stack(String),
}

#[derive(Error, Debug)]
pub enum ServiceError {
    /// Fatal to BLE bring-up: nothing can be written without the service.
    #[error("could not register note service")]
    Registration(#[source] TransportError),
}
