//! Application Layer (AL) state machine types.

/// AL state for a single SubDevice.
///
/// Read from register `0x0130`, requested through register `0x0120`. The
/// acknowledge and error modifiers live in [`AlControl`] and [`AlStatus`], not
/// here.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum AlState {
    /// No state recorded/read/known.
    #[default]
    None = 0x00,
    /// EtherCAT `INIT` state.
    Init = 0x01,
    /// EtherCAT `PRE-OP` state.
    PreOp = 0x02,
    /// EtherCAT `BOOT` state.
    Bootstrap = 0x03,
    /// EtherCAT `SAFE-OP` state.
    SafeOp = 0x04,
    /// EtherCAT `OP` state.
    Op = 0x08,
    /// An unknown or in-transition value.
    #[wire(catch_all)]
    Other(u8),
}

impl core::fmt::Display for AlState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AlState::None => f.write_str("None"),
            AlState::Init => f.write_str("Init"),
            AlState::PreOp => f.write_str("Pre-Operational"),
            AlState::Bootstrap => f.write_str("Bootstrap"),
            AlState::SafeOp => f.write_str("Safe-Operational"),
            AlState::Op => f.write_str("Operational"),
            AlState::Other(value) => write!(f, "Other({:#04x})", value),
        }
    }
}

impl AlState {
    /// The low nibble as transmitted on the wire.
    pub(crate) fn nibble(self) -> u8 {
        match self {
            AlState::None => 0x00,
            AlState::Init => 0x01,
            AlState::PreOp => 0x02,
            AlState::Bootstrap => 0x03,
            AlState::SafeOp => 0x04,
            AlState::Op => 0x08,
            AlState::Other(value) => value & 0x0f,
        }
    }

    /// Recover a state from a raw status word's low nibble.
    pub(crate) fn from_nibble(raw: u16) -> Self {
        match raw & 0x0f {
            0x00 => AlState::None,
            0x01 => AlState::Init,
            0x02 => AlState::PreOp,
            0x03 => AlState::Bootstrap,
            0x04 => AlState::SafeOp,
            0x08 => AlState::Op,
            other => AlState::Other(other as u8),
        }
    }
}

/// AL control register (`0x0120`) contents.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct AlControl {
    /// Requested state.
    #[wire(bits = 4)]
    pub state: AlState,
    /// Error acknowledge. Set to clear a SubDevice's error flag alongside the
    /// state request.
    #[wire(bits = 1, post_skip = 11)]
    pub acknowledge: bool,
}

impl AlControl {
    /// Request a state transition.
    pub fn new(state: AlState) -> Self {
        Self {
            state,
            acknowledge: false,
        }
    }

    /// Request a state transition, acknowledging any pending error.
    pub fn acknowledging(state: AlState) -> Self {
        Self {
            state,
            acknowledge: true,
        }
    }

    /// Reset the network: `INIT` plus error acknowledge.
    pub fn reset() -> Self {
        Self::acknowledging(AlState::Init)
    }
}

/// AL status register (`0x0130`) contents.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub struct AlStatus {
    /// Current state.
    #[wire(bits = 4)]
    pub state: AlState,
    /// Set when the SubDevice rejected a transition; details are in the AL
    /// status code register.
    #[wire(bits = 1, post_skip = 11)]
    pub error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

    #[test]
    fn control_init_ack() {
        let mut buf = [0u8; 2];

        AlControl::reset().pack_to_slice_unchecked(&mut buf);

        // INIT | ACK
        assert_eq!(buf, [0x11, 0x00]);
    }

    #[test]
    fn status_error_flag() {
        // SAFE-OP + ERROR, from a wire capture of a rejected OP request
        let parsed = AlStatus::unpack_from_slice(&[0x14, 0x00]).unwrap();

        assert_eq!(
            parsed,
            AlStatus {
                state: AlState::SafeOp,
                error: true,
            }
        );
    }

    #[test]
    fn nibble_round_trip() {
        for state in [
            AlState::Init,
            AlState::PreOp,
            AlState::Bootstrap,
            AlState::SafeOp,
            AlState::Op,
        ] {
            assert_eq!(AlState::from_nibble(u16::from(state.nibble())), state);
        }
    }
}
