//! SDO abort codes, ETG1000.6 Table 41.

/// Reason a SubDevice aborted an SDO transfer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireRead)]
#[repr(u32)]
pub enum CoeAbortCode {
    /// Toggle bit not changed
    ToggleBit = 0x05030000,
    /// SDO protocol timeout
    SdoTimeout = 0x05040000,
    /// Client/Server command specifier not valid or unknown
    InvalidCommand = 0x05040001,
    /// Out of memory
    OutOfMemory = 0x05040005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x06010000,
    /// Attempt to read a write only object
    WriteOnlyRead = 0x06010001,
    /// Attempt to write a read only object
    ReadOnlyWrite = 0x06010002,
    /// SDO complete access not supported for this object
    NoCompleteAccess = 0x06010004,
    /// Object length exceeds mailbox size
    ObjectTooLarge = 0x06010005,
    /// Object mapped to RxPDO, SDO download blocked
    DownloadBlocked = 0x06010006,
    /// The object does not exist in the object directory
    NotFound = 0x06020000,
    /// The object cannot be mapped into the PDO
    PdoMappingFailed = 0x06040041,
    /// The mapped objects would exceed the PDO length
    PdoTooSmall = 0x06040042,
    /// General parameter incompatibility
    Incompatible = 0x06040043,
    /// Access failed due to a hardware error
    HardwareFailure = 0x06060000,
    /// Length of service parameter does not match
    DataLengthMismatch = 0x06070010,
    /// Subindex does not exist
    SubIndexNotFound = 0x06090011,
    /// Value range of parameter exceeded
    ValueOutOfRange = 0x06090030,
    /// General error
    General = 0x08000000,
    /// Data cannot be transferred or stored to the application
    TransferFailed = 0x08000020,
    /// Data cannot be transferred because of the present device state
    InvalidState = 0x08000022,
    /// Unknown abort code.
    #[wire(catch_all)]
    Unknown(u32),
}

impl core::fmt::Display for CoeAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#010x}: ", u32::from(*self))?;

        match self {
            Self::ToggleBit => f.write_str("Toggle bit not changed"),
            Self::SdoTimeout => f.write_str("SDO protocol timeout"),
            Self::InvalidCommand => f.write_str("Command specifier not valid or unknown"),
            Self::OutOfMemory => f.write_str("Out of memory"),
            Self::UnsupportedAccess => f.write_str("Unsupported access to an object"),
            Self::WriteOnlyRead => f.write_str("Attempt to read a write only object"),
            Self::ReadOnlyWrite => f.write_str("Attempt to write a read only object"),
            Self::NoCompleteAccess => f.write_str("Complete access not supported"),
            Self::ObjectTooLarge => f.write_str("Object length exceeds mailbox size"),
            Self::DownloadBlocked => f.write_str("Object mapped to RxPDO, download blocked"),
            Self::NotFound => f.write_str("The object does not exist in the object directory"),
            Self::PdoMappingFailed => f.write_str("The object cannot be mapped into the PDO"),
            Self::PdoTooSmall => f.write_str("The mapped objects would exceed the PDO length"),
            Self::Incompatible => f.write_str("General parameter incompatibility"),
            Self::HardwareFailure => f.write_str("Access failed due to a hardware error"),
            Self::DataLengthMismatch => {
                f.write_str("Length of service parameter does not match")
            }
            Self::SubIndexNotFound => f.write_str("Subindex does not exist"),
            Self::ValueOutOfRange => f.write_str("Value range of parameter exceeded"),
            Self::General => f.write_str("General error"),
            Self::TransferFailed => {
                f.write_str("Data cannot be transferred or stored to the application")
            }
            Self::InvalidState => {
                f.write_str("Data cannot be transferred because of the present device state")
            }
            Self::Unknown(_) => f.write_str("Unknown code"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_code() {
        let decoded = CoeAbortCode::from(0x1234_5678u32);

        assert_eq!(decoded, CoeAbortCode::Unknown(0x1234_5678));
        assert_eq!(decoded.to_string(), "0x12345678: Unknown code");
    }

    #[test]
    fn read_only_write() {
        assert_eq!(
            CoeAbortCode::from(0x0601_0002u32),
            CoeAbortCode::ReadOnlyWrite
        );
    }
}
