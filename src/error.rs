//! Error types, and the bounded ring of per-SubDevice error reports.

pub use crate::coe::abort_code::CoeAbortCode;
use crate::{al_state::AlState, command::Command, MAX_ERROR_RECORDS};
use core::num::TryFromIntError;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};
use std::time::SystemTime;

/// Top level error type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// A low level error occurred when producing or consuming a PDU.
    Pdu(PduError),
    /// A working counter (WKC) error was encountered.
    WorkingCounter {
        /// The expected working counter value.
        expected: u16,
        /// The actual value received.
        received: u16,
    },
    /// A frame did not come back within its timeout (`NOFRAME`), or a polled
    /// register did not reach the expected value in time.
    Timeout,
    /// An EEPROM (SII) error was encountered.
    Eeprom(EepromError),
    /// A fixed size buffer was not large enough to hold a given item type.
    Capacity(Item),
    /// A mailbox error was encountered.
    Mailbox(MailboxError),
    /// Failed to send a frame over the network interface.
    SendFrame,
    /// Failed to receive a frame properly.
    ReceiveFrame,
    /// Too many SubDevices were discovered on the network.
    TooManySubDevices,
    /// An item in a list could not be found.
    NotFound {
        /// Item kind.
        item: Item,
        /// An index into a list of items.
        index: Option<usize>,
    },
    /// There is a problem with the discovered network topology.
    Topology,
    /// An error was read back from one or more SubDevices when attempting to
    /// transition to a new state.
    StateTransition,
    /// An invalid state was encountered.
    InvalidState {
        /// The desired state.
        expected: AlState,
        /// The actual state.
        actual: AlState,
        /// SubDevice configured address.
        configured_address: u16,
    },
    /// A value may be too large or otherwise could not be converted into a
    /// target type.
    IntegerTypeConversion,
    /// An error occurred encoding or decoding an item.
    Wire(ethercrab_wire::WireError),
    /// An internal error occurred. This indicates a bug in this crate.
    Internal,
}

impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Pdu(e) => write!(f, "pdu: {}", e),
            Error::WorkingCounter { expected, received } => {
                write!(f, "working counter expected {}, got {}", expected, received)
            }
            Error::Timeout => f.write_str("timeout"),
            Error::Eeprom(e) => write!(f, "eeprom: {}", e),
            Error::Capacity(item) => write!(f, "not enough capacity for {:?}", item),
            Error::Mailbox(e) => write!(f, "mailbox: {}", e),
            Error::SendFrame => f.write_str("failed to send EtherCAT frame"),
            Error::ReceiveFrame => f.write_str("failed to receive an EtherCAT frame"),
            Error::TooManySubDevices => f.write_str("too many SubDevices on network"),
            Error::NotFound { item, index } => {
                write!(f, "item kind {:?} not found (index: {:?})", item, index)
            }
            Error::Topology => f.write_str("topology"),
            Error::StateTransition => {
                f.write_str("a SubDevice failed to transition to a new state")
            }
            Error::InvalidState {
                expected,
                actual,
                configured_address,
            } => write!(
                f,
                "SubDevice {:#06x} state is invalid: {}, expected {}",
                configured_address, actual, expected
            ),
            Error::IntegerTypeConversion => f.write_str("failed to convert between integer types"),
            Error::Wire(e) => write!(f, "wire encode/decode error: {}", e),
            Error::Internal => f.write_str("internal error"),
        }
    }
}

/// The kind of item being looked for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Item {
    /// An EtherCAT SubDevice.
    SubDevice,
    /// Process Data Object.
    Pdo,
    /// Fieldbus Memory Management Unit.
    Fmmu,
    /// Sync manager.
    SyncManager,
    /// A user-defined SubDevice group.
    Group,
    /// A frame ring slot.
    Frame,
}

/// Low-level PDU error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PduError {
    /// Failed to decode raw PDU data into a given data type.
    Decode,
    /// Something went wrong when encoding/decoding the raw Ethernet II frame.
    Ethernet,
    /// PDU data is too long to fit in the given buffer.
    TooLong,
    /// A frame index was given that does not point to an in-flight frame.
    InvalidIndex(u8),
    /// The response PDU does not correspond to the request.
    Validation(PduValidationError),
    /// A frame ring slot is not in the expected lifecycle state.
    InvalidFrameState,
}

impl core::fmt::Display for PduError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PduError::Decode => f.write_str("failed to decode raw PDU data into type"),
            PduError::Ethernet => f.write_str("network"),
            PduError::TooLong => f.write_str("data is too long to fit in given buffer"),
            PduError::InvalidIndex(index) => write!(f, "invalid PDU index {}", index),
            PduError::Validation(e) => write!(f, "received PDU validation failed: {}", e),
            PduError::InvalidFrameState => f.write_str("invalid frame ring slot state"),
        }
    }
}

/// A PDU response failed to validate against the request it answers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum PduValidationError {
    /// The index of the received PDU does not match that of the sent one.
    IndexMismatch {
        /// Sent index.
        sent: u8,
        /// Received index.
        received: u8,
    },
    /// The received command does not match the one sent.
    CommandMismatch {
        /// Sent command.
        sent: Command,
        /// Received command.
        received: Command,
    },
}

impl core::fmt::Display for PduValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::IndexMismatch { sent, received } => {
                write!(f, "PDU index mismatch: sent {}, received {}", sent, received)
            }
            Self::CommandMismatch { sent, received } => {
                write!(
                    f,
                    "PDU command mismatch: sent {}, received {}",
                    sent, received
                )
            }
        }
    }
}

/// Mailbox/CoE error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// The mailbox operation was aborted.
    Aborted {
        /// Abort code.
        code: CoeAbortCode,
        /// The object index used in the operation.
        index: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// Mailbox data is too long to fit in the given type.
    TooLong {
        /// The object index used in the operation.
        index: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// A SubDevice has no mailbox but requires one for a given action.
    NoMailbox,
    /// The response to a mailbox action is invalid.
    SdoResponseInvalid {
        /// The object index used in the operation.
        index: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// The SoE response carries the error flag.
    SoeError {
        /// IDN the operation addressed.
        idn: u16,
        /// SoE error code.
        code: u16,
    },
}

impl core::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MailboxError::Aborted {
                code,
                index,
                sub_index,
            } => write!(f, "{:#06x}:{} aborted: {}", index, sub_index, code),
            MailboxError::TooLong { index, sub_index } => {
                write!(f, "{:#06x}:{} returned data is too long", index, sub_index)
            }
            MailboxError::NoMailbox => f.write_str("device has no mailbox"),
            MailboxError::SdoResponseInvalid { index, sub_index } => {
                write!(f, "{:#06x}:{} invalid response from device", index, sub_index)
            }
            MailboxError::SoeError { idn, code } => {
                write!(f, "IDN {:#06x} SoE error {:#06x}", idn, code)
            }
        }
    }
}

/// EEPROM (SII) error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EepromError {
    /// Failed to decode data from EEPROM.
    Decode,
    /// The given category does not exist in the SubDevice's EEPROM.
    NoCategory,
    /// The read spills over the end of the EEPROM cache.
    SectionOverrun,
    /// The EEPROM interface reported an error on the acknowledge bits.
    Nack,
}

impl core::fmt::Display for EepromError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EepromError::Decode => f.write_str("failed to decode data"),
            EepromError::NoCategory => f.write_str("category not found"),
            EepromError::SectionOverrun => f.write_str("read beyond end of EEPROM cache"),
            EepromError::Nack => f.write_str("EEPROM interface NACK"),
        }
    }
}

impl From<PduError> for Error {
    fn from(e: PduError) -> Self {
        Self::Pdu(e)
    }
}

impl From<EepromError> for Error {
    fn from(e: EepromError) -> Self {
        Self::Eeprom(e)
    }
}

impl From<MailboxError> for Error {
    fn from(e: MailboxError) -> Self {
        Self::Mailbox(e)
    }
}

impl From<PduValidationError> for Error {
    fn from(e: PduValidationError) -> Self {
        Self::Pdu(PduError::Validation(e))
    }
}

impl From<TryFromIntError> for Error {
    fn from(_e: TryFromIntError) -> Self {
        Self::IntegerTypeConversion
    }
}

impl From<ethercrab_wire::WireError> for Error {
    fn from(value: ethercrab_wire::WireError) -> Self {
        Self::Wire(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(_value: std::io::Error) -> Self {
        Self::ReceiveFrame
    }
}

/// What class of failure a ring entry reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A register access returned a deficient working counter.
    Packet {
        /// Error detail code.
        code: u16,
    },
    /// The mailbox returned a type-0 error response.
    Mailbox {
        /// Error detail from the response.
        detail: u16,
    },
    /// The SubDevice sent a CoE emergency message.
    Emergency {
        /// Emergency error code.
        error_code: u16,
        /// Error register contents.
        error_register: u8,
        /// Manufacturer specific data.
        data: [u8; 5],
    },
    /// An SDO transfer was aborted.
    Sdo {
        /// Abort code.
        abort_code: u32,
    },
    /// An SoE transfer reported an error.
    Soe {
        /// SoE error code.
        code: u16,
    },
}

/// One entry in the error ring.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ErrorRecord {
    /// When the error was pushed.
    pub time: SystemTime,
    /// SubDevice position the error concerns.
    pub subdevice: u16,
    /// Object index or IDN, zero when not applicable.
    pub index: u16,
    /// Object subindex, zero when not applicable.
    pub sub_index: u8,
    /// Error class and detail.
    pub kind: ErrorKind,
}

impl core::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.kind {
            ErrorKind::Packet { code } => write!(
                f,
                "SubDevice {} packet error {:#06x}",
                self.subdevice, code
            ),
            ErrorKind::Mailbox { detail } => write!(
                f,
                "SubDevice {} mailbox error {:#06x}",
                self.subdevice, detail
            ),
            ErrorKind::Emergency {
                error_code,
                error_register,
                ..
            } => write!(
                f,
                "SubDevice {} emergency {:#06x} register {:#04x}",
                self.subdevice, error_code, error_register
            ),
            ErrorKind::Sdo { abort_code } => write!(
                f,
                "SubDevice {} SDO {:#06x}:{} abort {:#010x} ({})",
                self.subdevice,
                self.index,
                self.sub_index,
                abort_code,
                CoeAbortCode::from(abort_code)
            ),
            ErrorKind::Soe { code } => write!(
                f,
                "SubDevice {} SoE IDN {:#06x} error {:#06x}",
                self.subdevice, self.index, code
            ),
        }
    }
}

/// Bounded ring of [`ErrorRecord`]s.
///
/// Pushes from any thread holding a shared reference; the oldest entry is
/// dropped when the ring is full. An atomic flag mirrors non-emptiness so the
/// cyclic path can poll for errors without taking the lock.
#[derive(Debug, Default)]
pub(crate) struct ErrorList {
    ring: Mutex<heapless::Deque<ErrorRecord, MAX_ERROR_RECORDS>>,
    present: AtomicBool,
}

impl ErrorList {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, record: ErrorRecord) {
        log::warn!("{}", record);

        let mut ring = self.ring.lock().unwrap();

        if ring.is_full() {
            let _ = ring.pop_front();
        }

        // Deque was just drained by one if full, push cannot fail
        let _ = ring.push_back(record);

        self.present.store(true, Ordering::Release);
    }

    pub(crate) fn pop(&self) -> Option<ErrorRecord> {
        let mut ring = self.ring.lock().unwrap();

        let record = ring.pop_front();

        if ring.is_empty() {
            self.present.store(false, Ordering::Release);
        }

        record
    }

    pub(crate) fn is_error(&self) -> bool {
        self.present.load(Ordering::Acquire)
    }

    pub(crate) fn packet_error(&self, subdevice: u16, index: u16, sub_index: u8, code: u16) {
        self.push(ErrorRecord {
            time: SystemTime::now(),
            subdevice,
            index,
            sub_index,
            kind: ErrorKind::Packet { code },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(subdevice: u16) -> ErrorRecord {
        ErrorRecord {
            time: SystemTime::now(),
            subdevice,
            index: 0x1c12,
            sub_index: 0,
            kind: ErrorKind::Sdo {
                abort_code: 0x0601_0002,
            },
        }
    }

    #[test]
    fn flag_mirrors_ring() {
        let list = ErrorList::new();

        assert!(!list.is_error());

        list.push(record(1));

        assert!(list.is_error());

        assert_eq!(list.pop().map(|r| r.subdevice), Some(1));
        assert!(!list.is_error());
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn overflow_drops_oldest() {
        let list = ErrorList::new();

        for i in 0..(MAX_ERROR_RECORDS as u16 + 4) {
            list.push(record(i));
        }

        assert_eq!(list.pop().map(|r| r.subdevice), Some(4));
    }

    #[test]
    fn display_sdo_abort() {
        let formatted = record(2).to_string();

        assert!(formatted.contains("abort 0x06010002"), "{}", formatted);
    }
}
