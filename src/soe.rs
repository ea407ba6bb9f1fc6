//! Servo over EtherCAT (SoE): IDN reads/writes and drive mapping readback.

use crate::{
    error::{Error, ErrorKind, ErrorRecord, MailboxError},
    mailbox::{MailboxHeader, MailboxType},
    subdevice::SubDeviceRef,
    MAX_MAILBOX,
};
use core::time::Duration;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};
use std::time::SystemTime;

/// Maximum drives per SoE SubDevice scanned for mappings.
pub(crate) const MAX_SOE_DRIVES: u8 = 8;

/// Maximum IDNs in one MDT/AT mapping list.
const MAX_SOE_MAPPING: usize = 64;

/// IDN of the AT (inputs) configuration list, S-0-0016.
const IDN_AT_CONFIG: u16 = 16;

/// IDN of the MDT (outputs) configuration list, S-0-0024.
const IDN_MDT_CONFIG: u16 = 24;

/// SoE operations.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum SoeOpcode {
    /// No operation.
    #[default]
    Nop = 0x00,
    /// Read request.
    ReadRequest = 0x01,
    /// Read response.
    ReadResponse = 0x02,
    /// Write request.
    WriteRequest = 0x03,
    /// Write response.
    WriteResponse = 0x04,
    /// Notification.
    Notification = 0x05,
    /// SubDevice info/emergency.
    Emergency = 0x06,
    /// Reserved encoding.
    #[wire(catch_all)]
    Unknown(u8),
}

bitflags::bitflags! {
    /// Which elements of an IDN a transfer addresses.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SoeElements: u8 {
        /// Data state.
        const DATA_STATE = 0x01;
        /// Name.
        const NAME = 0x02;
        /// Attribute.
        const ATTRIBUTE = 0x04;
        /// Unit.
        const UNIT = 0x08;
        /// Minimum value.
        const MIN = 0x10;
        /// Maximum value.
        const MAX = 0x20;
        /// Operating data value.
        const VALUE = 0x40;
        /// Default value.
        const DEFAULT = 0x80;
    }
}

/// The SoE header following the mailbox header.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 4)]
pub struct SoeHeader {
    /// Operation.
    #[wire(bits = 3)]
    pub op_code: SoeOpcode,
    /// More fragments follow this one.
    #[wire(bits = 1)]
    pub incomplete: bool,
    /// The response reports an error; the error code is the last two payload
    /// bytes.
    #[wire(bits = 1)]
    pub error: bool,
    /// Drive number within the SubDevice.
    #[wire(bits = 3)]
    pub drive_no: u8,
    /// Addressed elements.
    #[wire(bytes = 1)]
    pub element_flags: u8,
    /// The addressed IDN, or the fragments-left count in all but the last
    /// fragment of a segmented transfer.
    #[wire(bytes = 2)]
    pub idn: u16,
}

/// IDN attribute word, read to learn an operation data element's length.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 4)]
pub(crate) struct SoeAttribute {
    /// Conversion factor for display.
    #[wire(bytes = 2)]
    pub eval_factor: u16,
    /// Operation data length: `8 << length` bits for scalar data.
    #[wire(bits = 2)]
    pub length: u8,
    /// Element is a list.
    #[wire(bits = 1)]
    pub is_list: bool,
    /// Element is a procedure command.
    #[wire(bits = 1)]
    pub is_command: bool,
    #[wire(bits = 3, post_skip = 1)]
    pub data_type: u8,
    #[wire(bits = 4, post_skip = 4)]
    pub decimals: u8,
}

impl SubDeviceRef<'_> {
    /// SoE read: fetch elements of one IDN, reassembling segmented responses.
    ///
    /// Returns the number of bytes written into `out`.
    pub fn soe_read(
        &mut self,
        drive_no: u8,
        elements: SoeElements,
        idn: u16,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        let mut scratch = [0u8; MAX_MAILBOX];
        let _ = self.mailbox_receive(&mut scratch, Duration::ZERO);

        let counter = self.next_mailbox_counter();

        let mut request = [0u8; MailboxHeader::PACKED_LEN + SoeHeader::PACKED_LEN];

        write_soe_message(
            &mut request,
            counter,
            SoeHeader {
                op_code: SoeOpcode::ReadRequest,
                incomplete: false,
                error: false,
                drive_no,
                element_flags: elements.bits(),
                idn,
            },
            &[],
        );

        let wkc = self.mailbox_send(&request, self.timeouts.mailbox_tx)?;

        if wkc == 0 {
            return Err(Error::Timeout);
        }

        let mut written = 0;

        loop {
            let mut response = [0u8; MAX_MAILBOX];

            let wkc = self.mailbox_receive(&mut response, timeout)?;

            if wkc == 0 {
                return Err(Error::Timeout);
            }

            let header = MailboxHeader::unpack_from_slice(&response)?;
            let soe = SoeHeader::unpack_from_slice(&response[MailboxHeader::PACKED_LEN..])?;

            let data_at = MailboxHeader::PACKED_LEN + SoeHeader::PACKED_LEN;
            let data_len =
                usize::from(header.length).saturating_sub(SoeHeader::PACKED_LEN);

            if header.mailbox_type != MailboxType::Soe
                || soe.op_code != SoeOpcode::ReadResponse
            {
                self.errors.packet_error(self.position, idn, 0, 1);

                return Err(Error::Mailbox(MailboxError::SoeError { idn, code: 0 }));
            }

            if soe.error {
                let code_at = data_at + data_len.saturating_sub(2);
                let code = u16::unpack_from_slice(&response[code_at..])?;

                self.push_soe_error(idn, code);

                return Err(Error::Mailbox(MailboxError::SoeError { idn, code }));
            }

            if written + data_len > out.len() {
                self.errors.packet_error(self.position, idn, 0, 3);

                return Err(Error::Mailbox(MailboxError::TooLong {
                    index: idn,
                    sub_index: 0,
                }));
            }

            out[written..written + data_len]
                .copy_from_slice(&response[data_at..data_at + data_len]);

            written += data_len;

            // All but the last fragment carry the fragments-left count in the
            // IDN field
            if !soe.incomplete {
                return Ok(written);
            }
        }
    }

    /// SoE write: send elements of one IDN, fragmenting over the mailbox as
    /// needed.
    pub fn soe_write(
        &mut self,
        drive_no: u8,
        elements: SoeElements,
        idn: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut scratch = [0u8; MAX_MAILBOX];
        let _ = self.mailbox_receive(&mut scratch, Duration::ZERO);

        let capacity = usize::from(self.subdevice.mailbox.write_len)
            .saturating_sub(MailboxHeader::PACKED_LEN + SoeHeader::PACKED_LEN);

        if capacity == 0 {
            return Err(Error::Mailbox(MailboxError::NoMailbox));
        }

        let mut remaining = data;

        loop {
            let chunk = remaining.len().min(capacity);
            let is_last = chunk == remaining.len();

            let fragments_left = (remaining.len() - chunk).div_ceil(capacity.max(1));

            let counter = self.next_mailbox_counter();

            let mut request = [0u8; MAX_MAILBOX];

            let len = write_soe_message(
                &mut request,
                counter,
                SoeHeader {
                    op_code: SoeOpcode::WriteRequest,
                    incomplete: !is_last,
                    error: false,
                    drive_no,
                    element_flags: elements.bits(),
                    idn: if is_last { idn } else { fragments_left as u16 },
                },
                &remaining[..chunk],
            );

            let wkc = self.mailbox_send(&request[..len], self.timeouts.mailbox_tx)?;

            if wkc == 0 {
                return Err(Error::Timeout);
            }

            remaining = &remaining[chunk..];

            if is_last {
                break;
            }
        }

        let mut response = [0u8; MAX_MAILBOX];

        let wkc = self.mailbox_receive(&mut response, timeout)?;

        if wkc == 0 {
            return Err(Error::Timeout);
        }

        let header = MailboxHeader::unpack_from_slice(&response)?;
        let soe = SoeHeader::unpack_from_slice(&response[MailboxHeader::PACKED_LEN..])?;

        if header.mailbox_type != MailboxType::Soe || soe.op_code != SoeOpcode::WriteResponse {
            self.errors.packet_error(self.position, idn, 0, 1);

            return Err(Error::Mailbox(MailboxError::SoeError { idn, code: 0 }));
        }

        if soe.error {
            let data_len = usize::from(header.length).saturating_sub(SoeHeader::PACKED_LEN);
            let code_at =
                MailboxHeader::PACKED_LEN + SoeHeader::PACKED_LEN + data_len.saturating_sub(2);

            let code = u16::unpack_from_slice(&response[code_at..])?;

            self.push_soe_error(idn, code);

            return Err(Error::Mailbox(MailboxError::SoeError { idn, code }));
        }

        Ok(())
    }

    /// Derive output/input sizes from the MDT and AT configuration lists of
    /// every drive.
    ///
    /// For each listed IDN the attribute is read to learn its bit length; the
    /// 16 bit command/status word of each active drive is implied. Returns
    /// `(output_bits, input_bits)`.
    pub(crate) fn read_idn_map(&mut self, timeout: Duration) -> Result<(u32, u32), Error> {
        let mut output_bits = 0;
        let mut input_bits = 0;

        for drive in 0..MAX_SOE_DRIVES {
            output_bits += self.drive_mapping_bits(drive, IDN_MDT_CONFIG, timeout)?;
            input_bits += self.drive_mapping_bits(drive, IDN_AT_CONFIG, timeout)?;
        }

        Ok((output_bits, input_bits))
    }

    fn drive_mapping_bits(
        &mut self,
        drive: u8,
        config_idn: u16,
        timeout: Duration,
    ) -> Result<u32, Error> {
        // IDN list value: current length in bytes, max length, then the IDNs
        let mut mapping = [0u8; 4 + MAX_SOE_MAPPING * 2];

        let Ok(read) = self.soe_read(drive, SoeElements::VALUE, config_idn, &mut mapping, timeout)
        else {
            return Ok(0);
        };

        if read < 4 {
            return Ok(0);
        }

        let current_length = usize::from(u16::from_le_bytes([mapping[0], mapping[1]]));
        let entries = current_length / 2;

        if entries == 0 || entries > MAX_SOE_MAPPING {
            return Ok(0);
        }

        // Command/status word is always mapped but not listed
        let mut bits = 16u32;

        for entry in 0..entries {
            let at = 4 + entry * 2;
            let idn = u16::from_le_bytes([mapping[at], mapping[at + 1]]);

            let Ok(attribute) = self.soe_read_value::<SoeAttribute>(
                drive,
                SoeElements::ATTRIBUTE,
                idn,
                timeout,
            ) else {
                continue;
            };

            if !attribute.is_list {
                bits += 8u32 << attribute.length;
            }
        }

        Ok(bits)
    }

    fn soe_read_value<T>(
        &mut self,
        drive: u8,
        elements: SoeElements,
        idn: u16,
        timeout: Duration,
    ) -> Result<T, Error>
    where
        T: EtherCrabWireRead + EtherCrabWireSized,
    {
        let mut buf = T::buffer();

        self.soe_read(drive, elements, idn, buf.as_mut(), timeout)?;

        Ok(T::unpack_from_slice(buf.as_ref())?)
    }

    fn push_soe_error(&mut self, idn: u16, code: u16) {
        self.errors.push(ErrorRecord {
            time: SystemTime::now(),
            subdevice: self.position,
            index: idn,
            sub_index: 0,
            kind: ErrorKind::Soe { code },
        });
    }
}

/// Assemble an SoE mailbox message.
fn write_soe_message(buf: &mut [u8], counter: u8, header: SoeHeader, data: &[u8]) -> usize {
    let mailbox_len = (SoeHeader::PACKED_LEN + data.len()) as u16;

    MailboxHeader {
        length: mailbox_len,
        address: 0x0000,
        priority: 0,
        mailbox_type: MailboxType::Soe,
        counter,
    }
    .pack_to_slice_unchecked(&mut buf[0..]);

    header.pack_to_slice_unchecked(&mut buf[MailboxHeader::PACKED_LEN..]);

    let data_at = MailboxHeader::PACKED_LEN + SoeHeader::PACKED_LEN;

    buf[data_at..data_at + data.len()].copy_from_slice(data);

    MailboxHeader::PACKED_LEN + usize::from(mailbox_len)
}
