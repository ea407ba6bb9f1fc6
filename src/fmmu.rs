//! Fieldbus Memory Management Unit (FMMU) entity registers.

use core::fmt;

/// One FMMU entity as laid out on-chip at `0x0600` + 16n.
///
/// Maps a logical address window shared across the ring onto a physical window
/// in SubDevice memory. Bit granular: bit-oriented SubDevices pack against
/// their neighbours inside a single logical byte.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 16)]
pub struct Fmmu {
    /// Start address in the logical memory area.
    #[wire(bytes = 4)]
    pub logical_start_address: u32,

    /// Length of the mapped window in bytes.
    #[wire(bytes = 2)]
    pub length_bytes: u16,

    /// First mapped bit within the first logical byte.
    #[wire(bits = 3, post_skip = 5)]
    pub logical_start_bit: u8,

    /// Last mapped bit within the last logical byte.
    #[wire(bits = 3, post_skip = 5)]
    pub logical_end_bit: u8,

    /// Physical start address in SubDevice memory.
    #[wire(bytes = 2)]
    pub physical_start_address: u16,

    /// First mapped bit within the first physical byte.
    #[wire(bits = 3, post_skip = 5)]
    pub physical_start_bit: u8,

    /// SubDevice reads from the logical window (inputs).
    #[wire(bits = 1)]
    pub read_enable: bool,

    /// SubDevice writes into the logical window (outputs).
    #[wire(bits = 1, post_skip = 6)]
    pub write_enable: bool,

    /// Entity active.
    #[wire(bits = 1, post_skip = 31)]
    pub enable: bool,
}

impl fmt::Debug for Fmmu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fmmu")
            .field(
                "logical_start_address",
                &format_args!("{:#010x}", self.logical_start_address),
            )
            .field("length_bytes", &self.length_bytes)
            .field("logical_start_bit", &self.logical_start_bit)
            .field("logical_end_bit", &self.logical_end_bit)
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field("physical_start_bit", &self.physical_start_bit)
            .field("read_enable", &self.read_enable)
            .field("write_enable", &self.write_enable)
            .field("enable", &self.enable)
            .finish()
    }
}

impl fmt::Display for Fmmu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "logical {:#010x}:{}..{}, {} bytes, physical {:#06x}:{}, {}{}, {}",
            self.logical_start_address,
            self.logical_start_bit,
            self.logical_end_bit,
            self.length_bytes,
            self.physical_start_address,
            self.physical_start_bit,
            if self.read_enable { "R" } else { "" },
            if self.write_enable { "W" } else { "" },
            if self.enable { "enabled" } else { "disabled" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWriteSized};

    #[test]
    fn size() {
        assert_eq!(Fmmu::PACKED_LEN, 16);
    }

    #[test]
    fn default_is_zero() {
        assert_eq!(Fmmu::default().pack(), [0u8; 16]);
    }

    #[test]
    fn decode_bit_oriented_input() {
        let raw = [
            // Logical start address
            0x00, 0x00, 0x00, 0x00, //
            // Length
            0x01, 0x00, //
            // Logical start bit
            0x00, //
            // Logical end bit
            0x03, //
            // Physical start address
            0x00, 0x10, //
            // Physical start bit
            0x00, //
            // Read/write enable
            0x01, //
            // Enable
            0x01, //
            // Padding
            0x00, 0x00, 0x00,
        ];

        let fmmu = Fmmu::unpack_from_slice(&raw).unwrap();

        assert_eq!(
            fmmu,
            Fmmu {
                logical_start_address: 0,
                length_bytes: 1,
                logical_start_bit: 0,
                logical_end_bit: 3,
                physical_start_address: 0x1000,
                physical_start_bit: 0,
                read_enable: true,
                write_enable: false,
                enable: true,
            }
        );
    }
}
