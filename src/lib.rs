//! A blocking EtherCAT MainDevice.
//!
//! This crate drives a chain of EtherCAT SubDevices over a raw Ethernet link: it
//! enumerates the network, mines each SubDevice's EEPROM (SII), programs sync
//! managers and FMMUs, walks the AL state machine up to OP and then exchanges
//! process data cyclically with `LRW`/`LRD`+`LWR` frames, optionally piggybacking
//! a distributed-clock system time read onto the first frame of each cycle.
//!
//! All network operations are blocking with explicit timeouts. The port layer
//! supports an optional redundant second interface so a cut ring still completes
//! a cycle.
//!
//! The IOmap buffer is owned by the caller and passed to the mapping and cyclic
//! calls; SubDevice records hold offsets into it, never pointers.

mod al_state;
mod al_status_code;
#[cfg(test)]
pub(crate) mod bus_sim;
mod command;
mod config;
mod dl_status;
mod eeprom;
pub mod error;
mod fmmu;
mod group;
mod mailbox;
mod maindevice;
mod pdu;
mod port;
mod processdata;
mod register;
mod subdevice;
mod sync_manager;

pub mod coe;
pub mod soe;

pub use al_state::{AlControl, AlState, AlStatus};
pub use al_status_code::AlStatusCode;
pub use coe::SubIndex;
pub use command::{Command, Reads, WrappedRead, WrappedWrite, Writes};
pub use error::{Error, ErrorKind, ErrorRecord};
pub use fmmu::Fmmu;
pub use group::Group;
pub use mailbox::{MailboxHeader, MailboxProtocols, MailboxType};
pub use maindevice::{MainDevice, Timeouts};
pub use port::Port;
pub use register::RegisterAddress;
pub use subdevice::{MailboxConfig, SetupHook, SubDevice, SubDeviceRef, Topology};
pub use sync_manager::{Control, Direction, Enable, OperationMode, Status, SyncManagerChannel, SyncManagerType};

/// 11 bit mask for EtherCAT frame and PDU length fields.
pub(crate) const LEN_MASK: u16 = 0b0000_0111_1111_1111;

/// EtherCAT ethertype, `0x88a4`.
pub(crate) const ETHERCAT_ETHERTYPE: u16 = 0x88a4;

/// Maximum number of SubDevices on the network, including record 0 which holds
/// the MainDevice aggregate.
pub const MAX_SUBDEVICES: usize = 200;

/// Maximum number of logical address groups.
pub const MAX_GROUPS: usize = 2;

/// Number of transmit/receive ring slots, which bounds the number of in-flight
/// frames.
pub const MAX_FRAMES: usize = 16;

/// Largest Ethernet frame the port will build or accept.
pub(crate) const MAX_FRAME_LEN: usize = 1518;

/// Maximum process data payload of a single logical datagram: frame length minus
/// Ethernet header (14), EtherCAT header (2), PDU header (10) and WKC (2), with
/// room left for the chained DC datagram.
pub const MAX_LRW_DATA: usize = 1484;

/// Bytes reserved in the first cyclic frame for the piggybacked DC FRMW datagram.
pub const FIRST_DC_DATAGRAM: usize = 20;

/// Segmentation table length per group.
pub const MAX_IO_SEGMENTS: usize = 64;

/// Largest mailbox the mailbox link layer will transfer.
pub const MAX_MAILBOX: usize = 1486;

/// Sync manager channels per SubDevice record.
pub const MAX_SM: usize = 8;

/// FMMU entities per SubDevice record.
pub const MAX_FMMU: usize = 4;

/// SubDevice name length limit; longer SII strings are truncated.
pub const MAX_NAME: usize = 40;

/// Size in bytes of the single-SubDevice EEPROM cache.
pub(crate) const MAX_EEPROM_BUF: usize = 0x200;

/// Cap on descriptors walked in one SII PDO section before giving up.
pub(crate) const MAX_EEPROM_PDO: usize = 0x200;

/// Error ring depth.
pub(crate) const MAX_ERROR_RECORDS: usize = 64;

/// `FPRD` datagrams batched into one frame by the bulk state reader.
pub(crate) const MAX_FPRD_MULTI: usize = 64;

/// Upper bound on parallel PDO-mapping workers.
pub(crate) const MAX_MAPPING_WORKERS: usize = 4;

/// Configured station addresses start here; SubDevice `n` gets `NODE_OFFSET + n`.
///
/// Purely cosmetic on the wire, but keeps configured addresses recognisable in
/// captures. Address wrap-around makes this safe for any SubDevice count.
pub(crate) const NODE_OFFSET: u16 = 0x1000;

/// Scratch station address used while recovering a SubDevice that lost its
/// configured address. Off limits to production configurations.
pub(crate) const TEMP_NODE: u16 = 0xffff;

/// Mailbox status poll backoff.
pub(crate) const LOCAL_DELAY: core::time::Duration = core::time::Duration::from_micros(200);

/// Default SM0 (write mailbox) flag word: mailbox mode, write direction, enabled.
pub(crate) const DEFAULT_MAILBOX_SM0: u32 = 0x0001_0026;

/// Default SM1 (read mailbox) flag word: mailbox mode, read direction, enabled.
pub(crate) const DEFAULT_MAILBOX_SM1: u32 = 0x0001_0022;

/// Mask that clears only the SM enable bit (bit 16) of a sync manager flag word.
pub(crate) const SM_ENABLE_MASK: u32 = 0xfffe_ffff;

#[cfg(not(target_endian = "little"))]
compile_error!("Only little-endian targets are supported");
