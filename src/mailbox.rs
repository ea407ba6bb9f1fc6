//! Mailbox link layer: header framing, session counter, SM status polling and
//! the repeat-request recovery path.

use crate::{
    command::Command,
    error::{Error, ErrorKind, ErrorRecord, MailboxError},
    register::RegisterAddress,
    subdevice::SubDeviceRef,
    LOCAL_DELAY, MAX_MAILBOX,
};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized};
use std::time::{Instant, SystemTime};

/// A full size mailbox transfer buffer.
pub(crate) type MailboxBuffer = [u8; MAX_MAILBOX];

bitflags::bitflags! {
    /// Mailbox protocols a SubDevice can support, from SII word `0x001c`.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct MailboxProtocols: u16 {
        /// ADS over EtherCAT.
        const AOE = 0x0001;
        /// Ethernet over EtherCAT.
        const EOE = 0x0002;
        /// CANopen over EtherCAT.
        const COE = 0x0004;
        /// File access over EtherCAT.
        const FOE = 0x0008;
        /// Servo profile over EtherCAT.
        const SOE = 0x0010;
        /// Vendor specific.
        const VOE = 0x0020;
    }
}

/// Mailbox protocol discriminator, the low nibble of the type byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum MailboxType {
    /// Error response.
    Err = 0x00,
    /// ADS over EtherCAT.
    Aoe = 0x01,
    /// Ethernet over EtherCAT.
    Eoe = 0x02,
    /// CANopen over EtherCAT.
    Coe = 0x03,
    /// File access over EtherCAT.
    Foe = 0x04,
    /// Servo profile over EtherCAT.
    Soe = 0x05,
    /// Vendor specific.
    VendorSpecific = 0x0f,
    /// Reserved encoding.
    #[wire(catch_all)]
    Unknown(u8),
}

/// Mailbox header prepended to every mailbox transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 6)]
pub struct MailboxHeader {
    /// Payload length following this header.
    #[wire(bytes = 2)]
    pub length: u16,
    /// Station address of the originator.
    #[wire(bytes = 2)]
    pub address: u16,
    /// Priority, 0 (lowest) to 3.
    #[wire(pre_skip = 6, bits = 2)]
    pub priority: u8,
    /// Protocol carried in the payload.
    #[wire(bits = 4)]
    pub mailbox_type: MailboxType,
    /// Session counter, 1 to 7; wraps back to 1. Zero is reserved.
    #[wire(bits = 3, post_skip = 1)]
    pub counter: u8,
}

/// A type-0 mailbox error response payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 4)]
pub(crate) struct MailboxErrorReply {
    #[wire(bytes = 2)]
    pub kind: u16,
    /// Error detail, e.g. `0x0002` unsupported protocol.
    #[wire(bytes = 2)]
    pub detail: u16,
}

/// A CoE emergency payload following the mailbox header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 10)]
pub(crate) struct CoeEmergency {
    /// CoE header word; service in the top nibble.
    #[wire(bytes = 2)]
    pub coe_header: u16,
    #[wire(bytes = 2)]
    pub error_code: u16,
    #[wire(bytes = 1)]
    pub error_register: u8,
    #[wire(bytes = 5)]
    pub data: [u8; 5],
}

/// "Mailbox full" bit of a sync manager status byte.
const SM_STATUS_MAILBOX_FULL: u8 = 0x08;

/// Repeat-request toggle bit within the 16 bit status+activate view of SM1.
const SM_REPEAT_REQUEST: u16 = 0x0200;

impl SubDeviceRef<'_> {
    /// Wait until the SubDevice's write mailbox is empty.
    pub(crate) fn mailbox_empty(&mut self, timeout: core::time::Duration) -> Result<bool, Error> {
        let configured_address = self.subdevice.configured_address;
        let deadline = Instant::now() + timeout;

        loop {
            let (status, wkc) = Command::fprd(
                configured_address,
                RegisterAddress::sync_manager_status(0),
            )
            .receive::<u8>(self.port, self.timeouts.pdu)?;

            if wkc > 0 && status & SM_STATUS_MAILBOX_FULL == 0 {
                return Ok(true);
            }

            if Instant::now() >= deadline {
                return Ok(false);
            }

            std::thread::sleep(LOCAL_DELAY);
        }
    }

    /// Write a message into the SubDevice's write mailbox.
    ///
    /// The full mailbox area is always transferred; `message` is zero padded
    /// up to the configured mailbox length.
    pub(crate) fn mailbox_send(
        &mut self,
        message: &[u8],
        timeout: core::time::Duration,
    ) -> Result<u16, Error> {
        let mailbox = self.subdevice.mailbox;

        if !mailbox.has_mailbox() || usize::from(mailbox.write_len) > MAX_MAILBOX {
            return Err(Error::Mailbox(MailboxError::NoMailbox));
        }

        if !self.mailbox_empty(timeout)? {
            return Ok(0);
        }

        let mut buf = [0u8; MAX_MAILBOX];
        let len = usize::from(mailbox.write_len);

        let seed = message.len().min(len);
        buf[..seed].copy_from_slice(&message[..seed]);

        Command::fpwr(self.subdevice.configured_address, mailbox.write_offset).send_slice(
            self.port,
            &buf[..len],
            self.timeouts.register,
        )
    }

    /// Read a message from the SubDevice's read mailbox.
    ///
    /// Handles the repeat-request toggle when a read is lost, and converts
    /// type-0 error responses and CoE emergencies into error ring entries; both
    /// yield a working counter of 0 so callers treat them as "no data".
    pub(crate) fn mailbox_receive(
        &mut self,
        buf: &mut MailboxBuffer,
        timeout: core::time::Duration,
    ) -> Result<u16, Error> {
        let mailbox = self.subdevice.mailbox;
        let configured_address = self.subdevice.configured_address;

        let read_len = usize::from(mailbox.read_len);

        if read_len == 0 || read_len > MAX_MAILBOX {
            return Err(Error::Mailbox(MailboxError::NoMailbox));
        }

        let deadline = Instant::now() + timeout;

        // Wait for the read mailbox to fill
        let mut status = self.wait_read_mailbox_full(deadline)?;

        if status & u16::from(SM_STATUS_MAILBOX_FULL) == 0 {
            return Ok(0);
        }

        loop {
            let wkc = Command::fprd(configured_address, mailbox.read_offset).receive_slice(
                self.port,
                &mut buf[..read_len],
                self.timeouts.pdu,
            )?;

            if wkc > 0 {
                let header = MailboxHeader::unpack_from_slice(&buf[..])?;

                match header.mailbox_type {
                    MailboxType::Err => {
                        let reply = MailboxErrorReply::unpack_from_slice(
                            &buf[MailboxHeader::PACKED_LEN..],
                        )?;

                        self.errors.push(ErrorRecord {
                            time: SystemTime::now(),
                            subdevice: self.position,
                            index: 0,
                            sub_index: 0,
                            kind: ErrorKind::Mailbox {
                                detail: reply.detail,
                            },
                        });

                        // Handled here; present "no data" to the caller
                        return Ok(0);
                    }
                    MailboxType::Coe => {
                        let emergency =
                            CoeEmergency::unpack_from_slice(&buf[MailboxHeader::PACKED_LEN..])?;

                        if emergency.coe_header >> 12 == 0x01 {
                            self.errors.push(ErrorRecord {
                                time: SystemTime::now(),
                                subdevice: self.position,
                                index: 0,
                                sub_index: 0,
                                kind: ErrorKind::Emergency {
                                    error_code: emergency.error_code,
                                    error_register: emergency.error_register,
                                    data: emergency.data,
                                },
                            });

                            return Ok(0);
                        }

                        return Ok(wkc);
                    }
                    _ => return Ok(wkc),
                }
            }

            // Read mailbox lost: flip the repeat request and wait for the
            // SubDevice to acknowledge the toggle before re-reading
            status ^= SM_REPEAT_REQUEST;

            Command::fpwr(configured_address, RegisterAddress::sync_manager_status(1))
                .send(self.port, status, self.timeouts.pdu)?;

            let want_ack = ((status >> 8) as u8) & 0x02;

            loop {
                let (control, wkc2) = Command::fprd(
                    configured_address,
                    RegisterAddress::sync_manager_control(1),
                )
                .receive::<u8>(self.port, self.timeouts.pdu)?;

                if wkc2 > 0 && control & 0x02 == want_ack {
                    break;
                }

                if Instant::now() >= deadline {
                    return Ok(0);
                }
            }

            status = self.wait_read_mailbox_full(deadline)?;

            if status & u16::from(SM_STATUS_MAILBOX_FULL) == 0 || Instant::now() >= deadline {
                return Ok(0);
            }
        }
    }

    /// Poll the 16 bit SM1 status+activate view until the mailbox-full bit
    /// sets or `deadline` passes, returning the last view.
    fn wait_read_mailbox_full(&mut self, deadline: Instant) -> Result<u16, Error> {
        let configured_address = self.subdevice.configured_address;

        loop {
            let (status, wkc) = Command::fprd(
                configured_address,
                RegisterAddress::sync_manager_status(1),
            )
            .receive::<u16>(self.port, self.timeouts.pdu)?;

            if wkc > 0 && status & u16::from(SM_STATUS_MAILBOX_FULL) != 0 {
                return Ok(status);
            }

            if Instant::now() >= deadline {
                return Ok(status);
            }

            std::thread::sleep(LOCAL_DELAY);
        }
    }

    /// Next mailbox session counter for this SubDevice.
    pub(crate) fn next_mailbox_counter(&mut self) -> u8 {
        self.subdevice.mailbox.next_counter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::EtherCrabWireWriteSized;

    #[test]
    fn encode_header() {
        // From a wire capture: 10 byte CoE payload, counter 3
        let expected = [0x0a, 0x00, 0x00, 0x00, 0x00, 0x33];

        let packed = MailboxHeader {
            length: 10,
            address: 0x0000,
            priority: 0,
            mailbox_type: MailboxType::Coe,
            counter: 3,
        }
        .pack();

        assert_eq!(packed, expected);
    }

    #[test]
    fn decode_header() {
        let raw = [0x0a, 0x00, 0x00, 0x00, 0x00, 0x23];

        let expected = MailboxHeader {
            length: 10,
            address: 0x0000,
            priority: 0,
            mailbox_type: MailboxType::Coe,
            counter: 2,
        };

        assert_eq!(MailboxHeader::unpack_from_slice(&raw), Ok(expected));
    }

    #[test]
    fn decode_error_reply() {
        // Unsupported protocol
        let raw = [0x01, 0x00, 0x02, 0x00];

        let reply = MailboxErrorReply::unpack_from_slice(&raw).unwrap();

        assert_eq!(reply.kind, 0x01);
        assert_eq!(reply.detail, 0x0002);
    }

    #[test]
    fn emergency_is_detected_by_service_nibble() {
        let raw = [
            // CoE header: service 1 (emergency) in top nibble
            0x00, 0x10, //
            // Error code
            0x30, 0x81, //
            // Error register
            0x11, //
            // Data
            0x01, 0x02, 0x03, 0x04, 0x05,
        ];

        let emergency = CoeEmergency::unpack_from_slice(&raw).unwrap();

        assert_eq!(emergency.coe_header >> 12, 0x01);
        assert_eq!(emergency.error_code, 0x8130);
        assert_eq!(emergency.error_register, 0x11);
        assert_eq!(emergency.data, [1, 2, 3, 4, 5]);
    }
}
