//! SDO upload/download over the mailbox, and PDO mapping readback.

use super::{
    abort_code::CoeAbortCode, CoeHeader, CoeService, InitSdoFlags, InitSdoHeader,
    SegmentSdoHeader, SubIndex, SM_ASSIGN_BASE, SM_COMM_TYPE,
};
use crate::{
    error::{Error, ErrorKind, ErrorRecord, MailboxError},
    mailbox::{MailboxHeader, MailboxType},
    subdevice::SubDeviceRef,
    sync_manager::SyncManagerType,
    MAX_MAILBOX, MAX_SM,
};
use core::time::Duration;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};
use std::time::SystemTime;

/// Packet error detail: the response was not the expected SDO service.
const PACKET_ERROR_UNEXPECTED_FRAME: u16 = 1;
/// Packet error detail: response data did not fit the caller's buffer.
const PACKET_ERROR_DATA_CONTAINER: u16 = 3;

/// Fixed part of an SDO mailbox message: mailbox + CoE + init SDO headers.
const SDO_HEADERS_LEN: usize =
    MailboxHeader::PACKED_LEN + CoeHeader::PACKED_LEN + InitSdoHeader::PACKED_LEN;

impl SubDeviceRef<'_> {
    /// CoE SDO download: write `data` to an object in the SubDevice's object
    /// dictionary.
    ///
    /// Expedited transfers are used for up to 4 bytes, a normal single-frame
    /// transfer while the data fits the mailbox, and segmented transfers
    /// beyond that.
    pub fn sdo_write(
        &mut self,
        index: u16,
        sub_index: impl Into<SubIndex>,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), Error> {
        let access = sub_index.into();

        self.drain_mailbox();

        let counter = self.next_mailbox_counter();

        let mailbox_capacity = usize::from(self.subdevice.mailbox.write_len);

        // Headers plus the 4 byte complete-size field
        let max_first_chunk = mailbox_capacity.saturating_sub(SDO_HEADERS_LEN + 4);

        let mut request = [0u8; MAX_MAILBOX];

        if data.len() <= 4 && !access.complete_access() {
            let mut payload = [0u8; 4];
            payload[..data.len()].copy_from_slice(data);

            let len = write_init_request(
                &mut request,
                counter,
                CoeService::SdoRequest,
                InitSdoHeader {
                    flags: InitSdoFlags {
                        size_indicator: true,
                        expedited_transfer: true,
                        size: 4u8.saturating_sub(data.len() as u8),
                        complete_access: access.complete_access(),
                        command: InitSdoFlags::DOWNLOAD_REQUEST,
                    },
                    index,
                    sub_index: access.sub_index(),
                },
                &payload,
            );

            self.download_round_trip(&request[..len], index, access, timeout)?;

            return Ok(());
        }

        // Normal download, segmented when the object outgrows the mailbox
        let first_chunk = data.len().min(max_first_chunk);
        let mut remaining = &data[first_chunk..];

        let mut body = [0u8; MAX_MAILBOX];
        body[..4].copy_from_slice(&(data.len() as u32).to_le_bytes());
        body[4..4 + first_chunk].copy_from_slice(&data[..first_chunk]);

        let len = write_init_request(
            &mut request,
            counter,
            CoeService::SdoRequest,
            InitSdoHeader {
                flags: InitSdoFlags {
                    size_indicator: true,
                    expedited_transfer: false,
                    size: 0,
                    complete_access: access.complete_access(),
                    command: InitSdoFlags::DOWNLOAD_REQUEST,
                },
                index,
                sub_index: access.sub_index(),
            },
            &body[..4 + first_chunk],
        );

        self.download_round_trip(&request[..len], index, access, timeout)?;

        // Follow-up segments, 7 byte minimum data area
        let segment_capacity = mailbox_capacity
            .saturating_sub(MailboxHeader::PACKED_LEN + CoeHeader::PACKED_LEN + 1)
            .max(7);

        let mut toggle = false;

        while !remaining.is_empty() {
            let chunk = remaining.len().min(segment_capacity);
            let is_last = chunk == remaining.len();

            let seg_header = SegmentSdoHeader {
                is_last_segment: is_last,
                segment_data_size: 7u8.saturating_sub(chunk as u8),
                toggle,
                command: SegmentSdoHeader::DOWNLOAD_SEGMENT_REQUEST,
            };

            let counter = self.next_mailbox_counter();

            let len = write_segment_request(
                &mut request,
                counter,
                seg_header,
                &remaining[..chunk],
            );

            self.sdo_round_trip(&request[..len], index, access, timeout)?;

            remaining = &remaining[chunk..];
            toggle = !toggle;
        }

        Ok(())
    }

    /// CoE SDO upload: read an object from the SubDevice's object dictionary
    /// into `out`, returning the number of bytes read.
    ///
    /// Handles expedited, normal and segmented responses.
    pub fn sdo_read(
        &mut self,
        index: u16,
        sub_index: impl Into<SubIndex>,
        out: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Error> {
        let access = sub_index.into();

        self.drain_mailbox();

        let counter = self.next_mailbox_counter();

        let mut request = [0u8; MAX_MAILBOX];

        let len = write_init_request(
            &mut request,
            counter,
            CoeService::SdoRequest,
            InitSdoHeader {
                flags: InitSdoFlags {
                    size_indicator: false,
                    expedited_transfer: false,
                    size: 0,
                    complete_access: access.complete_access(),
                    command: InitSdoFlags::UPLOAD_REQUEST,
                },
                index,
                sub_index: access.sub_index(),
            },
            &[0u8; 4],
        );

        let mut response = [0u8; MAX_MAILBOX];

        let (header, sdo) =
            self.sdo_round_trip_into(&request[..len], &mut response, index, access, timeout)?;

        if sdo.flags.command != InitSdoFlags::UPLOAD_RESPONSE {
            self.errors.packet_error(
                self.position,
                index,
                access.sub_index(),
                PACKET_ERROR_UNEXPECTED_FRAME,
            );

            return Err(Error::Mailbox(MailboxError::SdoResponseInvalid {
                index,
                sub_index: access.sub_index(),
            }));
        }

        if sdo.flags.expedited_transfer {
            let len = 4 - usize::from(sdo.flags.size);

            copy_checked(self, index, access, &response[SDO_HEADERS_LEN..SDO_HEADERS_LEN + len], out)?;

            return Ok(len);
        }

        // Normal transfer: complete size then in-frame data
        let complete_size = u32::unpack_from_slice(&response[SDO_HEADERS_LEN..])? as usize;

        let in_frame = usize::from(header.length).saturating_sub(10);
        let first = in_frame.min(complete_size);

        copy_checked(
            self,
            index,
            access,
            &response[SDO_HEADERS_LEN + 4..SDO_HEADERS_LEN + 4 + first],
            out,
        )?;

        let mut written = first;

        if written >= complete_size {
            return Ok(complete_size);
        }

        // Segmented upload
        let mut toggle = false;

        while written < complete_size {
            let counter = self.next_mailbox_counter();

            let len = write_segment_request(
                &mut request,
                counter,
                SegmentSdoHeader {
                    is_last_segment: false,
                    segment_data_size: 0,
                    toggle,
                    command: SegmentSdoHeader::UPLOAD_SEGMENT_REQUEST,
                },
                &[0u8; 7],
            );

            let (header, seg) =
                self.segment_round_trip_into(&request[..len], &mut response, index, access, timeout)?;

            let seg_base = MailboxHeader::PACKED_LEN + CoeHeader::PACKED_LEN + 1;
            let mut seg_len = usize::from(header.length).saturating_sub(3);

            if usize::from(header.length) == 0x0a {
                // Short last segment: unused bytes are flagged in the header
                seg_len = seg_len.saturating_sub(usize::from(seg.segment_data_size));
            }

            let seg_len = seg_len.min(complete_size - written);

            if written + seg_len > out.len() {
                self.errors.packet_error(
                    self.position,
                    index,
                    access.sub_index(),
                    PACKET_ERROR_DATA_CONTAINER,
                );

                return Err(Error::Mailbox(MailboxError::TooLong {
                    index,
                    sub_index: access.sub_index(),
                }));
            }

            out[written..written + seg_len]
                .copy_from_slice(&response[seg_base..seg_base + seg_len]);

            written += seg_len;
            toggle = !toggle;

            if seg.is_last_segment {
                break;
            }
        }

        Ok(written)
    }

    /// Read a small fixed-size value with an SDO upload.
    pub(crate) fn sdo_read_value<T>(
        &mut self,
        index: u16,
        sub_index: impl Into<SubIndex>,
        timeout: Duration,
    ) -> Result<T, Error>
    where
        T: EtherCrabWireRead + EtherCrabWireSized,
    {
        let mut buf = T::buffer();

        self.sdo_read(index, sub_index, buf.as_mut(), timeout)?;

        Ok(T::unpack_from_slice(buf.as_ref())?)
    }

    /// Read the PDO assignment of every process data sync manager over CoE and
    /// record the mapped sizes in the SubDevice's sync manager images.
    ///
    /// Returns `(output_bits, input_bits)`.
    pub(crate) fn read_pdo_map(&mut self, timeout: Duration) -> Result<(u32, u32), Error> {
        let num_sm: u8 = self.sdo_read_value(SM_COMM_TYPE, SubIndex::Index(0), timeout)?;

        if num_sm <= 2 {
            return Ok((0, 0));
        }

        let num_sm = usize::from(num_sm).min(MAX_SM);

        let mut output_bits = 0;
        let mut input_bits = 0;

        // Some SubDevices report communication types shifted down by one,
        // starting the sequence 0 1 2 3 instead of 1 2 3 4
        let mut type_offset = 0u8;

        for sm in 2..num_sm {
            let raw_type: u8 = match self.sdo_read_value(
                SM_COMM_TYPE,
                SubIndex::Index(sm as u8 + 1),
                timeout,
            ) {
                Ok(value) => value,
                Err(_) => continue,
            };

            if sm == 2 && raw_type == 2 {
                type_offset = 1;
            }

            let sm_type = SyncManagerType::from_byte(raw_type + type_offset);

            self.map_one_sm(sm, sm_type, &mut output_bits, &mut input_bits, |this| {
                this.read_pdo_assign(SM_ASSIGN_BASE + sm as u16, timeout)
            })?;
        }

        Ok((output_bits, input_bits))
    }

    /// Complete-access variant of [`read_pdo_map`](Self::read_pdo_map): whole
    /// objects are fetched in single transfers.
    pub(crate) fn read_pdo_map_ca(&mut self, timeout: Duration) -> Result<(u32, u32), Error> {
        let mut comm_types = [0u8; 2 + MAX_SM];

        let read = self.sdo_read(SM_COMM_TYPE, SubIndex::Complete, &mut comm_types, timeout)?;

        // Subindex 0 count plus padding byte, then one type byte per SM
        let num_sm = usize::from(comm_types[0]);

        if read < 2 || num_sm <= 2 {
            return Ok((0, 0));
        }

        let num_sm = num_sm.min(MAX_SM);

        let mut output_bits = 0;
        let mut input_bits = 0;

        for sm in 2..num_sm {
            let sm_type = SyncManagerType::from_byte(comm_types[2 + sm]);

            self.map_one_sm(sm, sm_type, &mut output_bits, &mut input_bits, |this| {
                this.read_pdo_assign_ca(SM_ASSIGN_BASE + sm as u16, timeout)
            })?;
        }

        Ok((output_bits, input_bits))
    }

    fn map_one_sm(
        &mut self,
        sm: usize,
        sm_type: SyncManagerType,
        output_bits: &mut u32,
        input_bits: &mut u32,
        read_assign: impl FnOnce(&mut Self) -> Result<u32, Error>,
    ) -> Result<(), Error> {
        let bits = match sm_type {
            SyncManagerType::Outputs | SyncManagerType::Inputs => read_assign(self)?,
            _ => return Ok(()),
        };

        self.subdevice.sync_managers[sm].length_bytes = ((bits + 7) / 8) as u16;
        self.subdevice.sm_types[sm] = sm_type;

        match sm_type {
            SyncManagerType::Outputs => *output_bits += bits,
            SyncManagerType::Inputs => *input_bits += bits,
            _ => {}
        }

        Ok(())
    }

    /// Sum the mapped bit length of one PDO assignment object using individual
    /// subindex reads.
    fn read_pdo_assign(&mut self, assign: u16, timeout: Duration) -> Result<u32, Error> {
        let count: u8 = match self.sdo_read_value(assign, SubIndex::Index(0), timeout) {
            Ok(count) => count,
            Err(_) => return Ok(0),
        };

        let mut bits = 0u32;

        for i in 1..=count {
            let pdo_index: u16 = self.sdo_read_value(assign, SubIndex::Index(i), timeout)?;

            if pdo_index == 0 {
                continue;
            }

            let entries: u8 = self.sdo_read_value(pdo_index, SubIndex::Index(0), timeout)?;

            for entry in 1..=entries {
                // Entry format: bit length in the low byte, then subindex and
                // object index
                let mapping: u32 =
                    self.sdo_read_value(pdo_index, SubIndex::Index(entry), timeout)?;

                bits += mapping & 0xff;
            }
        }

        Ok(bits)
    }

    /// Sum the mapped bit length of one PDO assignment object using complete
    /// access transfers.
    fn read_pdo_assign_ca(&mut self, assign: u16, timeout: Duration) -> Result<u32, Error> {
        let mut buf = [0u8; MAX_MAILBOX];

        let read = match self.sdo_read(assign, SubIndex::Complete, &mut buf, timeout) {
            Ok(read) => read,
            Err(_) => return Ok(0),
        };

        if read < 2 {
            return Ok(0);
        }

        let count = usize::from(buf[0]);

        let mut bits = 0u32;

        for i in 0..count {
            let at = 2 + i * 2;

            if at + 2 > read {
                break;
            }

            let pdo_index = u16::from_le_bytes([buf[at], buf[at + 1]]);

            if pdo_index == 0 {
                continue;
            }

            let mut pdo = [0u8; MAX_MAILBOX];

            let pdo_read = self.sdo_read(pdo_index, SubIndex::Complete, &mut pdo, timeout)?;

            let entries = usize::from(pdo[0]);

            for entry in 0..entries {
                let at = 2 + entry * 4;

                if at + 4 > pdo_read {
                    break;
                }

                bits += u32::from(pdo[at]);
            }
        }

        Ok(bits)
    }

    /// Throw away anything sitting in the read mailbox from a previous,
    /// possibly aborted, exchange.
    fn drain_mailbox(&mut self) {
        let mut scratch = [0u8; MAX_MAILBOX];

        let _ = self.mailbox_receive(&mut scratch, Duration::ZERO);
    }

    /// Send an SDO request and check for an abort, discarding the response
    /// payload. Used for download segments whose responses carry no init
    /// header.
    fn sdo_round_trip(
        &mut self,
        request: &[u8],
        index: u16,
        access: SubIndex,
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut response = [0u8; MAX_MAILBOX];

        self.sdo_round_trip_into(request, &mut response, index, access, timeout)
            .map(|_| ())
    }

    /// Send a download request and validate the response command specifier.
    fn download_round_trip(
        &mut self,
        request: &[u8],
        index: u16,
        access: SubIndex,
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut response = [0u8; MAX_MAILBOX];

        let (_header, sdo) =
            self.sdo_round_trip_into(request, &mut response, index, access, timeout)?;

        if sdo.flags.command != InitSdoFlags::DOWNLOAD_RESPONSE {
            self.errors.packet_error(
                self.position,
                index,
                access.sub_index(),
                PACKET_ERROR_UNEXPECTED_FRAME,
            );

            return Err(Error::Mailbox(MailboxError::SdoResponseInvalid {
                index,
                sub_index: access.sub_index(),
            }));
        }

        Ok(())
    }

    fn sdo_round_trip_into(
        &mut self,
        request: &[u8],
        response: &mut [u8; MAX_MAILBOX],
        index: u16,
        access: SubIndex,
        timeout: Duration,
    ) -> Result<(MailboxHeader, InitSdoHeader), Error> {
        let header = self.mailbox_round_trip(request, response, index, access, timeout)?;

        let sdo = InitSdoHeader::unpack_from_slice(
            &response[MailboxHeader::PACKED_LEN + CoeHeader::PACKED_LEN..],
        )?;

        if sdo.flags.command == InitSdoFlags::ABORT_REQUEST {
            let abort_code = u32::unpack_from_slice(&response[SDO_HEADERS_LEN..])?;

            self.errors.push(ErrorRecord {
                time: SystemTime::now(),
                subdevice: self.position,
                index,
                sub_index: access.sub_index(),
                kind: ErrorKind::Sdo { abort_code },
            });

            return Err(Error::Mailbox(MailboxError::Aborted {
                code: CoeAbortCode::from(abort_code),
                index,
                sub_index: access.sub_index(),
            }));
        }

        Ok((header, sdo))
    }

    fn segment_round_trip_into(
        &mut self,
        request: &[u8],
        response: &mut [u8; MAX_MAILBOX],
        index: u16,
        access: SubIndex,
        timeout: Duration,
    ) -> Result<(MailboxHeader, SegmentSdoHeader), Error> {
        let header = self.mailbox_round_trip(request, response, index, access, timeout)?;

        let seg = SegmentSdoHeader::unpack_from_slice(
            &response[MailboxHeader::PACKED_LEN + CoeHeader::PACKED_LEN..],
        )?;

        Ok((header, seg))
    }

    /// One mailbox request/response pair, validated down to the CoE service.
    fn mailbox_round_trip(
        &mut self,
        request: &[u8],
        response: &mut [u8; MAX_MAILBOX],
        index: u16,
        access: SubIndex,
        timeout: Duration,
    ) -> Result<MailboxHeader, Error> {
        let wkc = self.mailbox_send(request, timeout)?;

        if wkc == 0 {
            return Err(Error::Timeout);
        }

        let wkc = self.mailbox_receive(response, timeout)?;

        if wkc == 0 {
            // Mailbox error or emergency; already recorded in the ring
            return Err(Error::Timeout);
        }

        let header = MailboxHeader::unpack_from_slice(&response[..])?;

        let coe = CoeHeader::unpack_from_slice(&response[MailboxHeader::PACKED_LEN..])?;

        if header.mailbox_type != MailboxType::Coe
            || !matches!(coe.service, CoeService::SdoResponse)
        {
            self.errors.packet_error(
                self.position,
                index,
                access.sub_index(),
                PACKET_ERROR_UNEXPECTED_FRAME,
            );

            return Err(Error::Mailbox(MailboxError::SdoResponseInvalid {
                index,
                sub_index: access.sub_index(),
            }));
        }

        Ok(header)
    }
}

/// Copy a response payload into the caller's buffer, recording a packet error
/// when it does not fit.
fn copy_checked(
    subdevice: &SubDeviceRef<'_>,
    index: u16,
    access: SubIndex,
    from: &[u8],
    out: &mut [u8],
) -> Result<(), Error> {
    if from.len() > out.len() {
        subdevice.errors.packet_error(
            subdevice.position,
            index,
            access.sub_index(),
            PACKET_ERROR_DATA_CONTAINER,
        );

        return Err(Error::Mailbox(MailboxError::TooLong {
            index,
            sub_index: access.sub_index(),
        }));
    }

    out[..from.len()].copy_from_slice(from);

    Ok(())
}

/// Assemble a mailbox message with an init SDO header and `body` following it.
fn write_init_request(
    buf: &mut [u8],
    counter: u8,
    service: CoeService,
    sdo: InitSdoHeader,
    body: &[u8],
) -> usize {
    let mailbox_len = (CoeHeader::PACKED_LEN + InitSdoHeader::PACKED_LEN + body.len()) as u16;

    MailboxHeader {
        length: mailbox_len,
        address: 0x0000,
        priority: 0,
        mailbox_type: MailboxType::Coe,
        counter,
    }
    .pack_to_slice_unchecked(&mut buf[0..]);

    CoeHeader { service }.pack_to_slice_unchecked(&mut buf[MailboxHeader::PACKED_LEN..]);

    sdo.pack_to_slice_unchecked(&mut buf[MailboxHeader::PACKED_LEN + CoeHeader::PACKED_LEN..]);

    buf[SDO_HEADERS_LEN..SDO_HEADERS_LEN + body.len()].copy_from_slice(body);

    MailboxHeader::PACKED_LEN + usize::from(mailbox_len)
}

/// Assemble a mailbox message with a segment SDO header and `body` following
/// it. Bodies shorter than the 7 byte segment area are padded.
fn write_segment_request(
    buf: &mut [u8],
    counter: u8,
    header: SegmentSdoHeader,
    body: &[u8],
) -> usize {
    let body_len = body.len().max(7);

    let mailbox_len = (CoeHeader::PACKED_LEN + 1 + body_len) as u16;

    MailboxHeader {
        length: mailbox_len,
        address: 0x0000,
        priority: 0,
        mailbox_type: MailboxType::Coe,
        counter,
    }
    .pack_to_slice_unchecked(&mut buf[0..]);

    CoeHeader {
        service: CoeService::SdoRequest,
    }
    .pack_to_slice_unchecked(&mut buf[MailboxHeader::PACKED_LEN..]);

    let seg_at = MailboxHeader::PACKED_LEN + CoeHeader::PACKED_LEN;

    header.pack_to_slice_unchecked(&mut buf[seg_at..]);

    buf[seg_at + 1..seg_at + 1 + body_len].fill(0);
    buf[seg_at + 1..seg_at + 1 + body.len()].copy_from_slice(body);

    MailboxHeader::PACKED_LEN + usize::from(mailbox_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn expedited_download_request_layout() {
        let mut buf = [0u8; 64];

        let len = write_init_request(
            &mut buf,
            3,
            CoeService::SdoRequest,
            InitSdoHeader {
                flags: InitSdoFlags {
                    size_indicator: true,
                    expedited_transfer: true,
                    size: 2,
                    complete_access: false,
                    command: InitSdoFlags::DOWNLOAD_REQUEST,
                },
                index: 0x1c12,
                sub_index: 1,
            },
            &[0x00, 0x16, 0x00, 0x00],
        );

        assert_eq!(len, 16);

        assert_eq!(
            &buf[..len],
            &[
                // Mailbox header: length 10, CoE type, counter 3
                0x0a, 0x00, 0x00, 0x00, 0x00, 0x33, //
                // CoE header: SDO request
                0x00, 0x20, //
                // Flags: expedited download, 2 bytes
                0x2b, //
                // Index
                0x12, 0x1c, //
                // Subindex
                0x01, //
                // Data
                0x00, 0x16, 0x00, 0x00,
            ]
        );
    }

    #[test]
    fn upload_segment_request_layout() {
        let mut buf = [0u8; 64];

        let len = write_segment_request(
            &mut buf,
            1,
            SegmentSdoHeader {
                is_last_segment: false,
                segment_data_size: 0,
                toggle: true,
                command: SegmentSdoHeader::UPLOAD_SEGMENT_REQUEST,
            },
            &[0u8; 7],
        );

        assert_eq!(len, 16);

        // Mailbox length covers CoE header + segment header + 7 bytes
        assert_eq!(&buf[0..2], &[0x0a, 0x00]);
        // Toggle bit 4 + command 3 in bits 5-7
        assert_eq!(buf[8], 0b0111_0000);
    }
}
