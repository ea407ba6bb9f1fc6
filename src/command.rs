//! Raw EtherCAT commands, e.g. `LRW`, `BRD`, `APWR`, and their blocking
//! round-trip wrappers.

use crate::{
    error::{Error, PduError, PduValidationError},
    port::Port,
};
use core::time::Duration;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};

const NOP: u8 = 0x00;
const APRD: u8 = 0x01;
const APWR: u8 = 0x02;
const FPRD: u8 = 0x04;
const FPWR: u8 = 0x05;
const BRD: u8 = 0x07;
const BWR: u8 = 0x08;
const LRD: u8 = 0x0a;
const LWR: u8 = 0x0b;
const LRW: u8 = 0x0c;
const ARMW: u8 = 0x0d;
const FRMW: u8 = 0x0e;

/// A PDU response payload paired with its working counter.
pub type PduResponse<T> = (T, u16);

/// Read commands.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Reads {
    /// Auto increment read (APRD).
    Aprd {
        /// Auto increment counter.
        address: u16,
        /// Register to read from.
        register: u16,
    },
    /// Configured address read (FPRD).
    Fprd {
        /// Configured station address.
        address: u16,
        /// Register to read from.
        register: u16,
    },
    /// Broadcast read (BRD).
    Brd {
        /// Autoincremented by each SubDevice visited.
        address: u16,
        /// Register to read from.
        register: u16,
    },
    /// Logical read (LRD).
    Lrd {
        /// Logical address.
        address: u32,
    },
    /// Auto increment read, multiple write (ARMW).
    Armw {
        /// Auto increment counter.
        address: u16,
        /// Register to access.
        register: u16,
    },
    /// Configured address read, multiple write (FRMW).
    Frmw {
        /// Configured station address.
        address: u16,
        /// Register to access.
        register: u16,
    },
}

/// Write commands.
#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub enum Writes {
    /// Broadcast write (BWR).
    Bwr {
        /// Autoincremented by each SubDevice visited.
        address: u16,
        /// Register to write to.
        register: u16,
    },
    /// Auto increment write (APWR).
    Apwr {
        /// Auto increment counter.
        address: u16,
        /// Register to write to.
        register: u16,
    },
    /// Configured address write (FPWR).
    Fpwr {
        /// Configured station address.
        address: u16,
        /// Register to write to.
        register: u16,
    },
    /// Logical write (LWR).
    Lwr {
        /// Logical address.
        address: u32,
    },
    /// Logical read/write (LRW).
    Lrw {
        /// Logical address.
        address: u32,
    },
}

/// PDU command.
///
/// A `Command` on its own only describes addressing. To put it on the wire,
/// wrap it with [`WrappedRead`] or [`WrappedWrite`] using the constructor
/// methods like [`Command::brd`], [`Command::fpwr`], etc., then call the
/// `receive`/`send` methods with a [`Port`] and a timeout.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
pub enum Command {
    /// No operation.
    #[default]
    Nop,
    /// Read commands.
    Read(Reads),
    /// Write commands.
    Write(Writes),
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Command::Nop => write!(f, "NOP"),

            Command::Read(read) => match read {
                Reads::Aprd { address, register } => {
                    write!(f, "APRD(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Fprd { address, register } => {
                    write!(f, "FPRD(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Brd { address, register } => {
                    write!(f, "BRD(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Lrd { address } => write!(f, "LRD(addr {:#010x})", address),
                Reads::Armw { address, register } => {
                    write!(f, "ARMW(addr {:#06x}, reg {:#06x})", address, register)
                }
                Reads::Frmw { address, register } => {
                    write!(f, "FRMW(addr {:#06x}, reg {:#06x})", address, register)
                }
            },

            Command::Write(write) => match write {
                Writes::Bwr { address, register } => {
                    write!(f, "BWR(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Apwr { address, register } => {
                    write!(f, "APWR(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Fpwr { address, register } => {
                    write!(f, "FPWR(addr {:#06x}, reg {:#06x})", address, register)
                }
                Writes::Lwr { address } => write!(f, "LWR(addr {:#010x})", address),
                Writes::Lrw { address } => write!(f, "LRW(addr {:#010x})", address),
            },
        }
    }
}

impl Command {
    /// Create a broadcast read (BRD) command to the given register address.
    ///
    /// The address field is always zero when transmitted from the MainDevice.
    pub fn brd(register: impl Into<u16>) -> WrappedRead {
        WrappedRead::new(Reads::Brd {
            address: 0,
            register: register.into(),
        })
    }

    /// Create a broadcast write (BWR) command to the given register address.
    pub fn bwr(register: impl Into<u16>) -> WrappedWrite {
        WrappedWrite::new(Writes::Bwr {
            address: 0,
            register: register.into(),
        })
    }

    /// FPRD.
    pub fn fprd(address: u16, register: impl Into<u16>) -> WrappedRead {
        WrappedRead::new(Reads::Fprd {
            address,
            register: register.into(),
        })
    }

    /// FPWR.
    pub fn fpwr(address: u16, register: impl Into<u16>) -> WrappedWrite {
        WrappedWrite::new(Writes::Fpwr {
            address,
            register: register.into(),
        })
    }

    /// APRD addressed by ring position.
    ///
    /// The position is negated on the wire; each SubDevice increments the
    /// address field, so the device at the given position sees zero.
    pub fn aprd(position: u16, register: impl Into<u16>) -> WrappedRead {
        WrappedRead::new(Reads::Aprd {
            address: 0u16.wrapping_sub(position),
            register: register.into(),
        })
    }

    /// APWR addressed by ring position.
    pub fn apwr(position: u16, register: impl Into<u16>) -> WrappedWrite {
        WrappedWrite::new(Writes::Apwr {
            address: 0u16.wrapping_sub(position),
            register: register.into(),
        })
    }

    /// Auto increment read, multiple write (ARMW), addressed by ring position.
    pub fn armw(position: u16, register: impl Into<u16>) -> WrappedRead {
        WrappedRead::new(Reads::Armw {
            address: 0u16.wrapping_sub(position),
            register: register.into(),
        })
    }

    /// Configured address read, multiple write (FRMW).
    ///
    /// Used to distribute a value from one SubDevice to all others, e.g. the DC
    /// reference clock system time.
    pub fn frmw(address: u16, register: impl Into<u16>) -> WrappedRead {
        WrappedRead::new(Reads::Frmw {
            address,
            register: register.into(),
        })
    }

    /// Logical read (LRD).
    pub fn lrd(address: u32) -> WrappedRead {
        WrappedRead::new(Reads::Lrd { address })
    }

    /// Logical write (LWR).
    pub fn lwr(address: u32) -> WrappedWrite {
        WrappedWrite::new(Writes::Lwr { address })
    }

    /// Logical read/write (LRW).
    pub fn lrw(address: u32) -> WrappedWrite {
        WrappedWrite::new(Writes::Lrw { address })
    }

    /// Get just the command code for a command.
    pub(crate) const fn code(&self) -> u8 {
        match self {
            Self::Nop => NOP,

            Self::Read(read) => match read {
                Reads::Aprd { .. } => APRD,
                Reads::Fprd { .. } => FPRD,
                Reads::Brd { .. } => BRD,
                Reads::Lrd { .. } => LRD,
                Reads::Armw { .. } => ARMW,
                Reads::Frmw { .. } => FRMW,
            },

            Self::Write(write) => match write {
                Writes::Bwr { .. } => BWR,
                Writes::Apwr { .. } => APWR,
                Writes::Fpwr { .. } => FPWR,
                Writes::Lwr { .. } => LWR,
                Writes::Lrw { .. } => LRW,
            },
        }
    }

    /// Parse a command from its code and the 4 raw address bytes.
    pub(crate) fn parse_code_data(code: u8, data: [u8; 4]) -> Result<Self, Error> {
        let split = || {
            (
                u16::from_le_bytes([data[0], data[1]]),
                u16::from_le_bytes([data[2], data[3]]),
            )
        };

        match code {
            NOP => Ok(Command::Nop),

            APRD => {
                let (address, register) = split();
                Ok(Reads::Aprd { address, register }.into())
            }
            FPRD => {
                let (address, register) = split();
                Ok(Reads::Fprd { address, register }.into())
            }
            BRD => {
                let (address, register) = split();
                Ok(Reads::Brd { address, register }.into())
            }
            ARMW => {
                let (address, register) = split();
                Ok(Reads::Armw { address, register }.into())
            }
            FRMW => {
                let (address, register) = split();
                Ok(Reads::Frmw { address, register }.into())
            }
            LRD => Ok(Reads::Lrd {
                address: u32::from_le_bytes(data),
            }
            .into()),

            BWR => {
                let (address, register) = split();
                Ok(Writes::Bwr { address, register }.into())
            }
            APWR => {
                let (address, register) = split();
                Ok(Writes::Apwr { address, register }.into())
            }
            FPWR => {
                let (address, register) = split();
                Ok(Writes::Fpwr { address, register }.into())
            }
            LWR => Ok(Writes::Lwr {
                address: u32::from_le_bytes(data),
            }
            .into()),
            LRW => Ok(Writes::Lrw {
                address: u32::from_le_bytes(data),
            }
            .into()),

            other => {
                log::error!("Invalid command code {:#04x}", other);

                Err(Error::Pdu(PduError::Decode))
            }
        }
    }
}

impl EtherCrabWireWrite for Command {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        match *self {
            Command::Nop => {
                buf[0..4].fill(0);

                &buf[0..4]
            }

            Command::Read(Reads::Aprd { address, register })
            | Command::Read(Reads::Brd { address, register })
            | Command::Read(Reads::Fprd { address, register })
            | Command::Read(Reads::Armw { address, register })
            | Command::Read(Reads::Frmw { address, register })
            | Command::Write(Writes::Apwr { address, register })
            | Command::Write(Writes::Fpwr { address, register })
            | Command::Write(Writes::Bwr { address, register }) => {
                address.pack_to_slice_unchecked(&mut buf[0..2]);
                register.pack_to_slice_unchecked(&mut buf[2..4]);

                &buf[0..4]
            }
            Command::Read(Reads::Lrd { address })
            | Command::Write(Writes::Lwr { address })
            | Command::Write(Writes::Lrw { address }) => {
                address.pack_to_slice_unchecked(&mut buf[0..4])
            }
        }
    }

    fn packed_len(&self) -> usize {
        // Either 2x u16 or 1x u32
        4
    }
}

impl From<Reads> for Command {
    fn from(value: Reads) -> Self {
        Self::Read(value)
    }
}

impl From<Writes> for Command {
    fn from(value: Writes) -> Self {
        Self::Write(value)
    }
}

/// A wrapped [`Reads`] exposing blocking receive operations.
#[derive(Debug, Copy, Clone)]
pub struct WrappedRead {
    pub(crate) command: Reads,
}

impl WrappedRead {
    pub(crate) fn new(command: Reads) -> Self {
        Self { command }
    }

    /// Round-trip the command and decode the response payload into a `T`.
    pub fn receive<T>(self, port: &Port, timeout: Duration) -> Result<PduResponse<T>, Error>
    where
        T: EtherCrabWireRead + EtherCrabWireSized,
    {
        let mut buf = T::buffer();

        let wkc = port.round_trip(self.command.into(), &[], Some(buf.as_mut()), timeout)?;

        Ok((T::unpack_from_slice(buf.as_ref())?, wkc))
    }

    /// Round-trip the command, copying the response payload into `out`.
    pub fn receive_slice(
        self,
        port: &Port,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<u16, Error> {
        port.round_trip(self.command.into(), &[], Some(out), timeout)
    }

    /// Round-trip the command and return only the working counter.
    ///
    /// `len` determines the length of the read on the wire.
    pub fn receive_wkc(self, port: &Port, len: u16, timeout: Duration) -> Result<u16, Error> {
        let mut scratch = [0u8; 8];

        let out = scratch
            .get_mut(..usize::from(len))
            .ok_or(Error::Pdu(PduError::TooLong))?;

        port.round_trip(self.command.into(), &[], Some(out), timeout)
    }
}

/// A wrapped [`Writes`] exposing blocking send operations.
#[derive(Debug, Copy, Clone)]
pub struct WrappedWrite {
    pub(crate) command: Writes,
}

impl WrappedWrite {
    pub(crate) fn new(command: Writes) -> Self {
        Self { command }
    }

    /// Round-trip the command with a packable payload, ignoring the response
    /// data.
    pub fn send(
        self,
        port: &Port,
        value: impl EtherCrabWireWrite,
        timeout: Duration,
    ) -> Result<u16, Error> {
        let mut buf = [0u8; MAX_DATA_INLINE];

        let data = value
            .pack_to_slice(&mut buf)
            .map_err(|_| Error::Pdu(PduError::TooLong))?;

        port.round_trip(self.command.into(), data, None, timeout)
    }

    /// Round-trip the command with a raw payload slice.
    pub fn send_slice(self, port: &Port, data: &[u8], timeout: Duration) -> Result<u16, Error> {
        port.round_trip(self.command.into(), data, None, timeout)
    }

    /// Round-trip the command, writing `data` out and copying the returned
    /// payload back over it (`LRW` semantics).
    pub fn send_receive_slice(
        self,
        port: &Port,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<u16, Error> {
        port.round_trip_in_place(self.command.into(), data, timeout)
    }
}

/// Largest payload `WrappedWrite::send` will pack inline. Larger writes use
/// [`WrappedWrite::send_slice`].
const MAX_DATA_INLINE: usize = 64;

/// Validate that a response PDU answers the request that was sent.
pub(crate) fn validate_response(
    sent: Command,
    sent_idx: u8,
    received: Command,
    received_idx: u8,
) -> Result<(), Error> {
    if sent_idx != received_idx {
        return Err(PduValidationError::IndexMismatch {
            sent: sent_idx,
            received: received_idx,
        }
        .into());
    }

    // Read-style commands come back with the same code; the address field is
    // allowed to change (auto increment, FRMW distribution).
    if sent.code() != received.code() {
        return Err(PduValidationError::CommandMismatch { sent, received }.into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_on_the_wire() {
        assert_eq!(Command::from(Command::aprd(0, 0u16).command).code(), 0x01);
        assert_eq!(Command::from(Command::brd(0u16).command).code(), 0x07);
        assert_eq!(Command::from(Command::lrw(0).command).code(), 0x0c);
        assert_eq!(Command::from(Command::frmw(0, 0u16).command).code(), 0x0e);
        assert_eq!(Command::from(Command::armw(0, 0u16).command).code(), 0x0d);
    }

    #[test]
    fn auto_increment_address_negated() {
        let Reads::Aprd { address, .. } = Command::aprd(2, 0x0000u16).command else {
            panic!("expected APRD");
        };

        assert_eq!(address, 0xfffe);
    }

    #[test]
    fn pack_physical_addressing() {
        let mut buf = [0u8; 4];

        Command::from(Reads::Fprd {
            address: 0x1001,
            register: 0x0130,
        })
        .pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, [0x01, 0x10, 0x30, 0x01]);
    }

    #[test]
    fn pack_logical_addressing() {
        let mut buf = [0u8; 4];

        Command::from(Writes::Lrw {
            address: 0x0001_0000,
        })
        .pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, [0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn parse_round_trips() {
        for command in [
            Command::from(Reads::Brd {
                address: 0,
                register: 0x0130,
            }),
            Command::from(Reads::Lrd { address: 0x10_0000 }),
            Command::from(Writes::Fpwr {
                address: 0x1002,
                register: 0x0800,
            }),
            Command::from(Writes::Lrw { address: 0xdeadbeef }),
        ] {
            let mut raw = [0u8; 4];

            command.pack_to_slice_unchecked(&mut raw);

            assert_eq!(Command::parse_code_data(command.code(), raw), Ok(command));
        }
    }

    #[test]
    fn response_validation() {
        let sent = Command::from(Reads::Fprd {
            address: 0x1001,
            register: 0,
        });

        assert!(validate_response(sent, 4, sent, 4).is_ok());

        assert_eq!(
            validate_response(sent, 4, sent, 5),
            Err(Error::Pdu(PduError::Validation(
                PduValidationError::IndexMismatch {
                    sent: 4,
                    received: 5
                }
            )))
        );
    }
}
