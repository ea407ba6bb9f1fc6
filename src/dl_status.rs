//! DL status register decoding, including the port/topology view used by
//! parent inference.

/// DL status register (`0x0110`) contents.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub(crate) struct DlStatus {
    #[wire(bits = 1)]
    pub pdi_operational: bool,
    #[wire(bits = 1)]
    pub watchdog_ok: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub extended_link_detection: bool,
    /// True if port 0 has a physical link present.
    #[wire(bits = 1)]
    pub link_port0: bool,
    /// True if port 1 has a physical link present.
    #[wire(bits = 1)]
    pub link_port1: bool,
    /// True if port 2 has a physical link present.
    #[wire(bits = 1)]
    pub link_port2: bool,
    /// True if port 3 has a physical link present.
    #[wire(bits = 1)]
    pub link_port3: bool,
    /// True if port 0 forwards to itself (loopback).
    #[wire(bits = 1)]
    pub loopback_port0: bool,
    /// RX signal detected on port 0.
    #[wire(bits = 1)]
    pub signal_port0: bool,
    /// True if port 1 forwards to itself (loopback).
    #[wire(bits = 1)]
    pub loopback_port1: bool,
    /// RX signal detected on port 1.
    #[wire(bits = 1)]
    pub signal_port1: bool,
    /// True if port 2 forwards to itself (loopback).
    #[wire(bits = 1)]
    pub loopback_port2: bool,
    /// RX signal detected on port 2.
    #[wire(bits = 1)]
    pub signal_port2: bool,
    /// True if port 3 forwards to itself (loopback).
    #[wire(bits = 1)]
    pub loopback_port3: bool,
    /// RX signal detected on port 3.
    #[wire(bits = 1)]
    pub signal_port3: bool,
}

impl DlStatus {
    /// Ports with communication established: signal present and not looped
    /// back.
    ///
    /// Returns the number of active ports and their bitmap. The count doubles
    /// as the topology class: 1 = end of line, 2 = pass-through, 3 = split,
    /// 4 = cross.
    pub fn active_ports(&self) -> (u8, u8) {
        let ports = [
            !self.loopback_port0 && self.signal_port0,
            !self.loopback_port1 && self.signal_port1,
            !self.loopback_port2 && self.signal_port2,
            !self.loopback_port3 && self.signal_port3,
        ];

        let mut count = 0;
        let mut bitmap = 0;

        for (bit, active) in ports.into_iter().enumerate() {
            if active {
                count += 1;
                bitmap |= 1 << bit;
            }
        }

        (count, bitmap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::EtherCrabWireRead;

    #[test]
    fn pass_through_device() {
        // Ports 0 and 1 open with signal, 2 and 3 looped back
        let raw = (0x0200u16 | 0x0800 | 0x1000 | 0x4000).to_le_bytes();

        let status = DlStatus::unpack_from_slice(&raw).unwrap();

        assert_eq!(status.active_ports(), (2, 0b0011));
    }

    #[test]
    fn end_of_line_device() {
        // Only port 0 open
        let raw = (0x0200u16 | 0x0400 | 0x1000 | 0x4000).to_le_bytes();

        let status = DlStatus::unpack_from_slice(&raw).unwrap();

        assert_eq!(status.active_ports(), (1, 0b0001));
    }
}
