//! Sync manager channel registers.

use core::fmt;

/// A sync manager channel as laid out on-chip at `0x0800` + 8n.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 8)]
pub struct SyncManagerChannel {
    /// Physical start address in SubDevice memory.
    #[wire(bytes = 2)]
    pub physical_start_address: u16,
    /// Buffer length in bytes.
    #[wire(bytes = 2)]
    pub length_bytes: u16,
    /// Control byte.
    #[wire(bytes = 1)]
    pub control: Control,
    /// Status byte, read only.
    #[wire(bytes = 1)]
    pub status: Status,
    /// Activation word.
    #[wire(bytes = 2)]
    pub enable: Enable,
}

impl SyncManagerChannel {
    /// Combined control/status/activation flag word in the compact form the SII
    /// SM section and the default-mailbox constants use: control in bits 0..8,
    /// status in 8..16, activation in 16..32.
    pub fn flags_word(&self) -> u32 {
        use ethercrab_wire::EtherCrabWireWrite;

        let mut raw = [0u8; 4];

        self.control.pack_to_slice_unchecked(&mut raw[0..1]);
        self.status.pack_to_slice_unchecked(&mut raw[1..2]);
        self.enable.pack_to_slice_unchecked(&mut raw[2..4]);

        u32::from_le_bytes(raw)
    }

    /// Apply a compact flag word, the inverse of
    /// [`flags_word`](Self::flags_word).
    pub fn set_flags_word(&mut self, flags: u32) {
        use ethercrab_wire::EtherCrabWireRead;

        let raw = flags.to_le_bytes();

        // Infallible: buffers are always large enough
        self.control = Control::unpack_from_slice(&raw[0..1]).unwrap_or_default();
        self.status = Status::unpack_from_slice(&raw[1..2]).unwrap_or_default();
        self.enable = Enable::unpack_from_slice(&raw[2..4]).unwrap_or_default();
    }
}

impl fmt::Debug for SyncManagerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncManagerChannel")
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field("length_bytes", &self.length_bytes)
            .field("control", &self.control)
            .field("status", &self.status)
            .field("enable", &self.enable)
            .finish()
    }
}

impl fmt::Display for SyncManagerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start {:#06x}, size {} bytes, {:?} {:?}, {}",
            self.physical_start_address,
            self.length_bytes,
            self.control.operation_mode,
            self.control.direction,
            if self.enable.enable {
                "enabled"
            } else {
                "disabled"
            },
        )
    }
}

/// Sync manager control byte.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct Control {
    #[wire(bits = 2)]
    pub operation_mode: OperationMode,
    #[wire(bits = 2)]
    pub direction: Direction,
    #[wire(bits = 1)]
    pub ecat_event_enable: bool,
    #[wire(bits = 1)]
    pub dls_user_event_enable: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub watchdog_enable: bool,
}

/// Sync manager status byte.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct Status {
    #[wire(bits = 1)]
    pub has_write_event: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub has_read_event: bool,
    /// For one-buffer (mailbox) mode: the mailbox contains unfetched data.
    #[wire(bits = 1)]
    pub mailbox_full: bool,
    #[wire(bits = 2)]
    pub buffer_state: u8,
    #[wire(bits = 1)]
    pub read_buffer_open: bool,
    #[wire(bits = 1)]
    pub write_buffer_open: bool,
}

/// Sync manager activation word.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct Enable {
    /// Channel enable.
    #[wire(bits = 1)]
    pub enable: bool,
    /// Repeat request toggle, used by the mailbox link layer to ask for a
    /// resend.
    #[wire(bits = 1, post_skip = 4)]
    pub repeat: bool,
    /// DC event 0 on EtherCAT write.
    #[wire(bits = 1)]
    pub enable_dc_event_bus_write: bool,
    /// DC event 0 on local write.
    #[wire(bits = 1)]
    pub enable_dc_event_local_write: bool,
    #[wire(bits = 1)]
    pub channel_pdi_disabled: bool,
    /// Acknowledge for the repeat toggle, mirrored by the SubDevice.
    #[wire(bits = 1, post_skip = 6)]
    pub repeat_ack: bool,
}

/// Buffered (process data) or mailbox operation.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum OperationMode {
    /// Three-buffer mode, used for process data.
    #[default]
    Buffered = 0x00,
    /// One-buffer handshake mode, used for mailboxes.
    Mailbox = 0x02,
    /// Invalid encoding.
    #[wire(catch_all)]
    Other(u8),
}

/// Transfer direction from the MainDevice's point of view.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum Direction {
    /// MainDevice reads from this channel.
    #[default]
    MainDeviceRead = 0x00,
    /// MainDevice writes into this channel.
    MainDeviceWrite = 0x01,
    /// Invalid encoding.
    #[wire(catch_all)]
    Other(u8),
}

/// Role of a sync manager channel, from the SII SM section or the CoE
/// communication-type object `0x1c00`.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncManagerType {
    /// Channel is unused.
    #[default]
    Unused = 0,
    /// Write mailbox (MainDevice to SubDevice).
    MailboxWrite = 1,
    /// Read mailbox (SubDevice to MainDevice).
    MailboxRead = 2,
    /// Process data outputs.
    Outputs = 3,
    /// Process data inputs.
    Inputs = 4,
}

impl SyncManagerType {
    pub(crate) fn from_byte(raw: u8) -> Self {
        match raw {
            1 => Self::MailboxWrite,
            2 => Self::MailboxRead,
            3 => Self::Outputs,
            4 => Self::Inputs,
            _ => Self::Unused,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};
    use pretty_assertions::assert_eq;

    #[test]
    fn decode_mailbox_sm0() {
        // Taken from a LAN9252 capture: SM0 at 0x1000, 128 bytes, mailbox
        // write, enabled.
        let raw = [0x00, 0x10, 0x80, 0x00, 0x26, 0x00, 0x01, 0x00];

        let parsed = SyncManagerChannel::unpack_from_slice(&raw).unwrap();

        assert_eq!(
            parsed,
            SyncManagerChannel {
                physical_start_address: 0x1000,
                length_bytes: 0x0080,
                control: Control {
                    operation_mode: OperationMode::Mailbox,
                    direction: Direction::MainDeviceWrite,
                    ecat_event_enable: false,
                    dls_user_event_enable: true,
                    watchdog_enable: false,
                },
                status: Status::default(),
                enable: Enable {
                    enable: true,
                    ..Enable::default()
                },
            }
        );
    }

    #[test]
    fn flags_word_matches_default_constants() {
        let mut sm = SyncManagerChannel::default();

        sm.set_flags_word(crate::DEFAULT_MAILBOX_SM0);

        assert_eq!(sm.control.operation_mode, OperationMode::Mailbox);
        assert_eq!(sm.control.direction, Direction::MainDeviceWrite);
        assert!(sm.enable.enable);

        assert_eq!(sm.flags_word(), crate::DEFAULT_MAILBOX_SM0);

        sm.set_flags_word(crate::DEFAULT_MAILBOX_SM1);

        assert_eq!(sm.control.direction, Direction::MainDeviceRead);
        assert_eq!(sm.flags_word(), crate::DEFAULT_MAILBOX_SM1);
    }

    #[test]
    fn enable_mask_clears_only_enable() {
        let mut sm = SyncManagerChannel::default();

        sm.set_flags_word(crate::DEFAULT_MAILBOX_SM0);
        sm.set_flags_word(sm.flags_word() & crate::SM_ENABLE_MASK);

        assert!(!sm.enable.enable);
        assert_eq!(sm.control.operation_mode, OperationMode::Mailbox);
    }

    #[test]
    fn mailbox_full_bit() {
        let parsed = Status::unpack_from_slice(&[0x08]).unwrap();

        assert!(parsed.mailbox_full);
    }

    #[test]
    fn packed_repeat_toggle() {
        let mut buf = [0u8; 2];

        Enable {
            enable: true,
            repeat: true,
            ..Enable::default()
        }
        .pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, [0x03, 0x00]);
    }
}
