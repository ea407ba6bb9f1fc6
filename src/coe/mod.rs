//! CANopen over EtherCAT: SDO transfer headers and the services built on the
//! mailbox link layer.

pub mod abort_code;
mod services;

/// CoE header word, ETG1000.6 Table 29.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct CoeHeader {
    /// Service number in the top nibble.
    #[wire(pre_skip = 12, bits = 4)]
    pub service: CoeService,
}

/// CoE service numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum CoeService {
    /// Emergency message.
    Emergency = 0x01,
    /// SDO request.
    SdoRequest = 0x02,
    /// SDO response.
    SdoResponse = 0x03,
    /// TxPDO.
    TxPdo = 0x04,
    /// RxPDO.
    RxPdo = 0x05,
    /// TxPDO remote request.
    TxPdoRemoteRequest = 0x06,
    /// RxPDO remote request.
    RxPdoRemoteRequest = 0x07,
    /// SDO information service.
    SdoInformation = 0x08,
    /// Reserved encoding.
    #[wire(catch_all)]
    Unknown(u8),
}

/// Initial SDO request/response flags byte, ETG1000.6 5.6.2.1.1.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct InitSdoFlags {
    #[wire(bits = 1)]
    pub size_indicator: bool,
    #[wire(bits = 1)]
    pub expedited_transfer: bool,
    #[wire(bits = 2)]
    pub size: u8,
    #[wire(bits = 1)]
    pub complete_access: bool,
    #[wire(bits = 3)]
    pub command: u8,
}

impl InitSdoFlags {
    pub(crate) const DOWNLOAD_REQUEST: u8 = 0x01;
    pub(crate) const DOWNLOAD_RESPONSE: u8 = 0x03;
    pub(crate) const UPLOAD_REQUEST: u8 = 0x02;
    pub(crate) const UPLOAD_RESPONSE: u8 = 0x02;
    pub(crate) const ABORT_REQUEST: u8 = 0x04;
}

/// Initial SDO header: flags plus the addressed object.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 4)]
pub struct InitSdoHeader {
    #[wire(bytes = 1)]
    pub flags: InitSdoFlags,
    #[wire(bytes = 2)]
    pub index: u16,
    #[wire(bytes = 1)]
    pub sub_index: u8,
}

/// Header byte of a segmented SDO transfer, ETG1000.6 5.6.2.3.1.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct SegmentSdoHeader {
    #[wire(bits = 1)]
    pub is_last_segment: bool,
    /// Unused byte count of the 7 byte segment data area in the last segment.
    #[wire(bits = 3)]
    pub segment_data_size: u8,
    #[wire(bits = 1)]
    pub toggle: bool,
    #[wire(bits = 3)]
    pub command: u8,
}

impl SegmentSdoHeader {
    pub(crate) const DOWNLOAD_SEGMENT_REQUEST: u8 = 0x00;
    pub(crate) const UPLOAD_SEGMENT_REQUEST: u8 = 0x03;
}

/// Subindex access mode for SDO transfers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubIndex {
    /// Complete access: the entire object, starting at subindex 0, as one
    /// transfer.
    Complete,
    /// Individual subindex access.
    Index(u8),
}

impl SubIndex {
    pub(crate) fn complete_access(&self) -> bool {
        matches!(self, Self::Complete)
    }

    pub(crate) fn sub_index(&self) -> u8 {
        match self {
            SubIndex::Complete => 0,
            SubIndex::Index(idx) => *idx,
        }
    }
}

impl From<u8> for SubIndex {
    fn from(value: u8) -> Self {
        Self::Index(value)
    }
}

bitflags::bitflags! {
    /// CoE capability bits from the SII general category.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct CoeDetails: u8 {
        /// SDO transfers supported.
        const SDO = 0x01;
        /// SDO information service supported.
        const SDO_INFO = 0x02;
        /// PDO assignment configurable.
        const PDO_ASSIGN = 0x04;
        /// PDO mapping configurable.
        const PDO_CONFIG = 0x08;
        /// SDO upload while in OP supported.
        const UPLOAD = 0x10;
        /// SDO complete access supported.
        const COMPLETE_ACCESS = 0x20;
    }
}

/// Sync manager communication type object.
pub(crate) const SM_COMM_TYPE: u16 = 0x1c00;

/// First sync manager PDO assignment object; SM n is at `SM_ASSIGN_BASE + n`.
pub(crate) const SM_ASSIGN_BASE: u16 = 0x1c10;

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

    #[test]
    fn coe_header_round_trip() {
        let header = CoeHeader {
            service: CoeService::SdoRequest,
        };

        let packed = header.pack();

        assert_eq!(packed, [0x00, 0x20]);

        assert_eq!(CoeHeader::unpack_from_slice(&packed), Ok(header));
    }

    #[test]
    fn init_flags_expedited_download() {
        // 4 byte expedited download request: raw 0x23
        let flags = InitSdoFlags::unpack_from_slice(&[0x23]).unwrap();

        assert_eq!(
            flags,
            InitSdoFlags {
                size_indicator: true,
                expedited_transfer: true,
                size: 0,
                complete_access: false,
                command: InitSdoFlags::DOWNLOAD_REQUEST,
            }
        );
    }

    #[test]
    fn abort_command_detected() {
        // Abort request: raw 0x80
        let flags = InitSdoFlags::unpack_from_slice(&[0x80]).unwrap();

        assert_eq!(flags.command, InitSdoFlags::ABORT_REQUEST);
    }
}
