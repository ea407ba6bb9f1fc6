//! AL status codes reported by SubDevices that reject a state transition.

/// AL (Application Layer) status code, register `0x0134`.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u16)]
pub enum AlStatusCode {
    /// No error
    #[default]
    NoError = 0x0000,
    /// Unspecified error
    UnspecifiedError = 0x0001,
    /// No Memory
    NoMemory = 0x0002,
    /// Invalid requested state change
    InvalidRequestedStateChange = 0x0011,
    /// Unknown requested state
    UnknownRequestedState = 0x0012,
    /// Bootstrap not supported
    BootstrapNotSupported = 0x0013,
    /// No valid firmware
    NoValidFirmware = 0x0014,
    /// Invalid mailbox configuration
    InvalidMailboxConfiguration = 0x0015,
    /// Invalid mailbox configuration during transition to PRE-OP
    InvalidMailboxConfigurationPreop = 0x0016,
    /// Invalid sync manager configuration
    InvalidSyncManagerConfiguration = 0x0017,
    /// No valid inputs available
    NoValidInputsAvailable = 0x0018,
    /// No valid outputs
    NoValidOutputs = 0x0019,
    /// Synchronization error
    SynchronizationError = 0x001a,
    /// Sync manager watchdog
    SyncManagerWatchdog = 0x001b,
    /// Invalid Sync Manager Types
    InvalidSyncManagerTypes = 0x001c,
    /// Invalid Output Configuration
    InvalidOutputConfiguration = 0x001d,
    /// Invalid Input Configuration
    InvalidInputConfiguration = 0x001e,
    /// Invalid Watchdog Configuration
    InvalidWatchdogConfiguration = 0x001f,
    /// SubDevice needs cold start
    NeedsColdStart = 0x0020,
    /// SubDevice needs INIT
    NeedsInit = 0x0021,
    /// SubDevice needs PRE-OP
    NeedsPreop = 0x0022,
    /// SubDevice needs SAFE-OP
    NeedsSafeop = 0x0023,
    /// Invalid Input Mapping
    InvalidInputMapping = 0x0024,
    /// Invalid Output Mapping
    InvalidOutputMapping = 0x0025,
    /// Inconsistent Settings
    InconsistentSettings = 0x0026,
    /// Fatal Sync Error
    FatalSyncError = 0x002c,
    /// Invalid DC SYNC Configuration
    InvalidDcSyncConfiguration = 0x0030,
    /// DC Sync Timeout Error
    DcSyncTimeoutError = 0x0034,
    /// Mailbox CoE error
    MbxCoe = 0x0043,
    /// Mailbox SoE error
    MbxSoe = 0x0045,
    /// EEPROM no access
    EepromNoAccess = 0x0050,
    /// EEPROM Error
    EepromError = 0x0051,
    /// SubDevice restarted locally
    RestartedLocally = 0x0060,
    /// Unknown status code.
    #[wire(catch_all)]
    Unknown(u16),
}

impl core::fmt::Display for AlStatusCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let num = u16::from(*self);

        write!(f, "{:#06x}: ", num)?;

        let s = match self {
            AlStatusCode::NoError => "No error",
            AlStatusCode::UnspecifiedError => "Unspecified error",
            AlStatusCode::NoMemory => "No Memory",
            AlStatusCode::InvalidRequestedStateChange => "Invalid requested state change",
            AlStatusCode::UnknownRequestedState => "Unknown requested state",
            AlStatusCode::BootstrapNotSupported => "Bootstrap not supported",
            AlStatusCode::NoValidFirmware => "No valid firmware",
            AlStatusCode::InvalidMailboxConfiguration
            | AlStatusCode::InvalidMailboxConfigurationPreop => "Invalid mailbox configuration",
            AlStatusCode::InvalidSyncManagerConfiguration => "Invalid sync manager configuration",
            AlStatusCode::NoValidInputsAvailable => "No valid inputs available",
            AlStatusCode::NoValidOutputs => "No valid outputs",
            AlStatusCode::SynchronizationError => "Synchronization error",
            AlStatusCode::SyncManagerWatchdog => "Sync manager watchdog",
            AlStatusCode::InvalidSyncManagerTypes => "Invalid Sync Manager Types",
            AlStatusCode::InvalidOutputConfiguration => "Invalid Output Configuration",
            AlStatusCode::InvalidInputConfiguration => "Invalid Input Configuration",
            AlStatusCode::InvalidWatchdogConfiguration => "Invalid Watchdog Configuration",
            AlStatusCode::NeedsColdStart => "SubDevice needs cold start",
            AlStatusCode::NeedsInit => "SubDevice needs INIT",
            AlStatusCode::NeedsPreop => "SubDevice needs PRE-OP",
            AlStatusCode::NeedsSafeop => "SubDevice needs SAFE-OP",
            AlStatusCode::InvalidInputMapping => "Invalid Input Mapping",
            AlStatusCode::InvalidOutputMapping => "Invalid Output Mapping",
            AlStatusCode::InconsistentSettings => "Inconsistent Settings",
            AlStatusCode::FatalSyncError => "Fatal Sync Error",
            AlStatusCode::InvalidDcSyncConfiguration => "Invalid DC SYNC Configuration",
            AlStatusCode::DcSyncTimeoutError => "DC Sync Timeout Error",
            AlStatusCode::MbxCoe => "Mailbox CoE",
            AlStatusCode::MbxSoe => "Mailbox SoE",
            AlStatusCode::EepromNoAccess => "EEPROM no access",
            AlStatusCode::EepromError => "EEPROM Error",
            AlStatusCode::RestartedLocally => "SubDevice restarted locally",
            AlStatusCode::Unknown(_) => "(unknown)",
        };

        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::EtherCrabWireRead;

    #[test]
    fn decode_known_and_unknown() {
        assert_eq!(
            AlStatusCode::unpack_from_slice(&[0x11, 0x00]),
            Ok(AlStatusCode::InvalidRequestedStateChange)
        );

        assert_eq!(
            AlStatusCode::unpack_from_slice(&[0x34, 0x12]),
            Ok(AlStatusCode::Unknown(0x1234))
        );
    }

    #[test]
    fn display_includes_raw_code() {
        assert_eq!(
            AlStatusCode::SyncManagerWatchdog.to_string(),
            "0x001b: Sync manager watchdog"
        );
    }
}
