//! EtherCAT frame and PDU headers, and the datagram builder used to pack one or
//! more PDUs into a single frame.
//!
//! All offsets in this module are relative to the start of the EtherCAT portion
//! of a frame, i.e. just after the 14 byte Ethernet II header. Receive buffers
//! store frames with the Ethernet header already stripped, so response offsets
//! returned by [`add_datagram`] can be used on both sides of a round trip.

use crate::{
    command::Command,
    error::{Error, PduError},
    LEN_MASK,
};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite, WireError};

/// EtherCAT frame header length.
pub(crate) const FRAME_HEADER_LEN: usize = 2;

/// PDU header length: command, index, 4 address bytes, length word, IRQ.
pub(crate) const PDU_HEADER_LEN: usize = 10;

/// Offset of the first PDU's payload within the EtherCAT portion of a frame.
pub(crate) const FIRST_PAYLOAD: usize = FRAME_HEADER_LEN + PDU_HEADER_LEN;

/// Working counter field length.
pub(crate) const WKC_LEN: usize = 2;

/// An EtherCAT frame header: 11 bit length, 1 reserved bit, 4 bit protocol type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub payload_len: u16,
}

/// The only frame type carried: type 1, PDUs.
const PROTOCOL_PDU: u16 = 0x01;

impl FrameHeader {
    pub fn pdu(len: u16) -> Self {
        debug_assert!(
            len <= LEN_MASK,
            "Frame length may not exceed {} bytes",
            LEN_MASK
        );

        Self {
            payload_len: len & LEN_MASK,
        }
    }

    /// Parse a frame header, rejecting frames that do not carry PDUs.
    pub fn try_parse(buf: &[u8]) -> Result<Self, Error> {
        let raw = u16::unpack_from_slice(buf)?;

        if raw >> 12 != PROTOCOL_PDU {
            return Err(Error::Pdu(PduError::Decode));
        }

        Ok(Self {
            payload_len: raw & LEN_MASK,
        })
    }
}

impl EtherCrabWireSized for FrameHeader {
    const PACKED_LEN: usize = FRAME_HEADER_LEN;

    type Buffer = [u8; FRAME_HEADER_LEN];

    fn buffer() -> Self::Buffer {
        [0u8; FRAME_HEADER_LEN]
    }
}

impl EtherCrabWireRead for FrameHeader {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            payload_len: raw & LEN_MASK,
        })
    }
}

impl EtherCrabWireWrite for FrameHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = self.payload_len | (PROTOCOL_PDU << 12);

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

/// PDU length word fields after ADP and ADO: 11 bit length, circulating flag,
/// more-follows flag.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct PduFlags {
    pub length: u16,
    /// True when the frame has circulated the ring once already.
    pub circulated: bool,
    /// True when another PDU follows this one in the same frame.
    pub more_follows: bool,
}

impl PduFlags {
    pub const fn with_len(len: u16) -> Self {
        Self {
            length: len,
            circulated: false,
            more_follows: false,
        }
    }
}

impl EtherCrabWireSized for PduFlags {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

impl EtherCrabWireRead for PduFlags {
    fn unpack_from_slice(buf: &[u8]) -> Result<Self, WireError> {
        let raw = u16::unpack_from_slice(buf)?;

        Ok(Self {
            length: raw & LEN_MASK,
            circulated: (raw >> 14) & 1 == 1,
            more_follows: (raw >> 15) & 1 == 1,
        })
    }
}

impl EtherCrabWireWrite for PduFlags {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        let raw = self.length & LEN_MASK
            | u16::from(self.circulated) << 14
            | u16::from(self.more_follows) << 15;

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

/// A single PDU header: command, index, address, flags and IRQ.
#[derive(Debug, Copy, Clone, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 10)]
pub(crate) struct PduHeader {
    /// Raw command code.
    #[wire(bytes = 1)]
    pub command_code: u8,

    /// Frame index this PDU travels in.
    #[wire(bytes = 1)]
    pub index: u8,

    /// Raw address data; 2x `u16` or 1x `u32` depending on the command.
    #[wire(bytes = 4)]
    pub command_raw: [u8; 4],

    /// Length word and flags.
    #[wire(bytes = 2)]
    pub flags: PduFlags,

    /// IRQ field.
    #[wire(bytes = 2)]
    pub irq: u16,
}

impl PduHeader {
    pub fn command(&self) -> Result<Command, Error> {
        Command::parse_code_data(self.command_code, self.command_raw)
    }
}

/// Write the first datagram of a frame into `ecat`, returning the total
/// EtherCAT length (header + PDU + payload + WKC).
///
/// `data` seeds the payload and may be shorter than `data_len`; the remainder
/// is zero filled, which is how read commands put their response placeholder on
/// the wire.
pub(crate) fn setup_datagram(
    ecat: &mut [u8],
    command: Command,
    index: u8,
    data_len: usize,
    data: &[u8],
) -> Result<usize, Error> {
    let total = FIRST_PAYLOAD + data_len + WKC_LEN;

    if total > ecat.len() || data_len > usize::from(LEN_MASK) {
        return Err(Error::Pdu(PduError::TooLong));
    }

    FrameHeader::pdu((PDU_HEADER_LEN + data_len) as u16)
        .pack_to_slice_unchecked(&mut ecat[0..FRAME_HEADER_LEN]);

    write_pdu(
        &mut ecat[FRAME_HEADER_LEN..],
        command,
        index,
        false,
        data_len,
        data,
    );

    Ok(total)
}

/// Append another datagram to a frame previously started with
/// [`setup_datagram`].
///
/// Returns the new total EtherCAT length and the offset of the appended
/// datagram's payload, which is where its response data (and trailing WKC) will
/// be found in the returned frame.
pub(crate) fn add_datagram(
    ecat: &mut [u8],
    ecat_len: usize,
    command: Command,
    index: u8,
    more_follows: bool,
    data_len: usize,
    data: &[u8],
) -> Result<(usize, usize), Error> {
    let new_len = ecat_len + PDU_HEADER_LEN + data_len + WKC_LEN;

    if new_len > ecat.len() || data_len > usize::from(LEN_MASK) {
        return Err(Error::Pdu(PduError::TooLong));
    }

    // Grow the outer frame length
    let header = FrameHeader::try_parse(&ecat[0..FRAME_HEADER_LEN])?;
    FrameHeader::pdu(header.payload_len + (PDU_HEADER_LEN + data_len) as u16)
        .pack_to_slice_unchecked(&mut ecat[0..FRAME_HEADER_LEN]);

    // Flag the first PDU as "more follows". Intermediate PDUs get the flag via
    // the `more_follows` argument when they are appended.
    let first_flags_at = FRAME_HEADER_LEN + 6;
    let mut first_flags = PduFlags::unpack_from_slice(&ecat[first_flags_at..first_flags_at + 2])?;
    first_flags.more_follows = true;
    first_flags.pack_to_slice_unchecked(&mut ecat[first_flags_at..first_flags_at + 2]);

    write_pdu(
        &mut ecat[ecat_len..],
        command,
        index,
        more_follows,
        data_len,
        data,
    );

    Ok((new_len, ecat_len + PDU_HEADER_LEN))
}

fn write_pdu(
    buf: &mut [u8],
    command: Command,
    index: u8,
    more_follows: bool,
    data_len: usize,
    data: &[u8],
) {
    let mut command_raw = [0u8; 4];
    command.pack_to_slice_unchecked(&mut command_raw);

    let mut flags = PduFlags::with_len(data_len as u16);
    flags.more_follows = more_follows;

    PduHeader {
        command_code: command.code(),
        index,
        command_raw,
        flags,
        irq: 0,
    }
    .pack_to_slice_unchecked(&mut buf[0..PDU_HEADER_LEN]);

    let seed = data.len().min(data_len);

    buf[PDU_HEADER_LEN..PDU_HEADER_LEN + seed].copy_from_slice(&data[..seed]);
    buf[PDU_HEADER_LEN + seed..PDU_HEADER_LEN + data_len].fill(0);

    // WKC placeholder
    buf[PDU_HEADER_LEN + data_len..PDU_HEADER_LEN + data_len + WKC_LEN].fill(0);
}

/// One PDU of a received frame.
#[derive(Debug, Copy, Clone)]
pub(crate) struct ReceivedPdu {
    pub header: PduHeader,
    /// Offset of this PDU's payload within the EtherCAT buffer.
    pub payload: usize,
    /// Payload length in bytes.
    pub len: usize,
    /// Working counter returned for this PDU.
    pub wkc: u16,
}

/// Iterate over the PDU chain of a received EtherCAT buffer.
pub(crate) struct PduChain<'buf> {
    ecat: &'buf [u8],
    pos: usize,
    done: bool,
}

impl<'buf> PduChain<'buf> {
    pub fn new(ecat: &'buf [u8]) -> Result<Self, Error> {
        FrameHeader::try_parse(ecat)?;

        Ok(Self {
            ecat,
            pos: FRAME_HEADER_LEN,
            done: false,
        })
    }
}

impl Iterator for PduChain<'_> {
    type Item = Result<ReceivedPdu, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let header =
            match PduHeader::unpack_from_slice(self.ecat.get(self.pos..)?).map_err(Error::from) {
                Ok(header) => header,
                Err(e) => {
                    self.done = true;

                    return Some(Err(e));
                }
            };

        let payload = self.pos + PDU_HEADER_LEN;
        let len = usize::from(header.flags.length);

        let wkc_at = payload + len;
        let wkc = match self
            .ecat
            .get(wkc_at..wkc_at + WKC_LEN)
            .ok_or(Error::Pdu(PduError::Decode))
            .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
        {
            Ok(wkc) => wkc,
            Err(e) => {
                self.done = true;

                return Some(Err(e));
            }
        };

        self.pos = wkc_at + WKC_LEN;
        self.done = !header.flags.more_follows;

        Some(Ok(ReceivedPdu {
            header,
            payload,
            len,
            wkc,
        }))
    }
}

/// Parse the first PDU of a received EtherCAT buffer.
pub(crate) fn first_pdu(ecat: &[u8]) -> Result<ReceivedPdu, Error> {
    PduChain::new(ecat)?
        .next()
        .ok_or(Error::Pdu(PduError::Decode))?
}

/// Merge a redundant response into a primary one.
///
/// SubDevices touched by exactly one path leave the other path's payload bytes
/// untouched (zero, circulated), so OR-ing the payloads reconstructs the full
/// view. Working counters are summed per PDU so the combined WKC equals the sum
/// of both paths' contributions.
pub(crate) fn merge_redundant(primary: &mut [u8], secondary: &[u8]) -> Result<(), Error> {
    // Collect PDU geometry first; primary and secondary carry identical chains.
    let mut pdus = [None; crate::MAX_FRAMES];
    let mut count = 0;

    for pdu in PduChain::new(primary)? {
        let pdu = pdu?;

        if count < pdus.len() {
            pdus[count] = Some((pdu.payload, pdu.len, pdu.wkc));
            count += 1;
        }
    }

    for entry in pdus.iter().take(count) {
        let (payload, len, wkc) = entry.ok_or(Error::Internal)?;

        let sec_wkc = secondary
            .get(payload + len..payload + len + WKC_LEN)
            .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
            .ok_or(Error::Pdu(PduError::Decode))?;

        for i in payload..payload + len {
            primary[i] |= secondary.get(i).copied().unwrap_or(0);
        }

        let combined = wkc.wrapping_add(sec_wkc);

        primary[payload + len..payload + len + WKC_LEN].copy_from_slice(&combined.to_le_bytes());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Reads, Writes};
    use pretty_assertions::assert_eq;

    #[test]
    fn frame_header_round_trip() {
        let header = FrameHeader::pdu(0x28);

        let mut buf = [0u8; 2];

        header.pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, 0b0001_0000_0010_1000u16.to_le_bytes());

        assert_eq!(FrameHeader::unpack_from_slice(&buf), Ok(header));
    }

    #[test]
    fn frame_header_rejects_non_pdu() {
        // Type nibble 4 (network variables)
        let raw = 0b0100_0000_0000_1000u16.to_le_bytes();

        assert!(FrameHeader::try_parse(&raw).is_err());
    }

    #[test]
    fn pdu_flags_round_trip() {
        let flags = PduFlags {
            length: 0x110,
            circulated: false,
            more_follows: true,
        };

        let mut buf = [0u8; 2];

        flags.pack_to_slice_unchecked(&mut buf);

        assert_eq!(buf, [0x10, 0x81]);

        assert_eq!(PduFlags::unpack_from_slice(&buf), Ok(flags));
    }

    #[test]
    fn setup_then_parse_recovers_original() {
        let mut ecat = [0u8; 64];

        let command = Command::from(Reads::Fprd {
            address: 0x1001,
            register: 0x0130,
        });

        let len = setup_datagram(&mut ecat, command, 0x12, 6, &[]).unwrap();

        assert_eq!(len, 2 + 10 + 6 + 2);

        let pdu = first_pdu(&ecat[..len]).unwrap();

        assert_eq!(pdu.header.index, 0x12);
        assert_eq!(pdu.header.command().unwrap(), command);
        assert_eq!(pdu.len, 6);
        assert_eq!(pdu.payload, 12);
        assert_eq!(pdu.wkc, 0);
        assert!(!pdu.header.flags.more_follows);
    }

    #[test]
    fn add_datagram_chains() {
        let mut ecat = [0u8; 128];

        let lrw = Command::from(Writes::Lrw { address: 0 });
        let frmw = Command::from(Reads::Frmw {
            address: 0x1001,
            register: 0x0910,
        });

        let len = setup_datagram(&mut ecat, lrw, 3, 8, &[0xaa; 8]).unwrap();
        let (len, dc_offset) = add_datagram(&mut ecat, len, frmw, 3, false, 8, &[]).unwrap();

        // LRW payload (8) + headers + 2x WKC + FRMW payload (8)
        assert_eq!(len, 2 + 10 + 8 + 2 + 10 + 8 + 2);
        assert_eq!(dc_offset, 2 + 10 + 8 + 2 + 10);

        let pdus = PduChain::new(&ecat[..len])
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(pdus.len(), 2);
        assert!(pdus[0].header.flags.more_follows);
        assert!(!pdus[1].header.flags.more_follows);
        assert_eq!(pdus[1].payload, dc_offset);
        assert_eq!(pdus[1].header.command().unwrap(), frmw);

        // Outer frame header length covers both PDUs
        let header = FrameHeader::unpack_from_slice(&ecat).unwrap();
        assert_eq!(usize::from(header.payload_len), 10 + 8 + 10 + 8);
    }

    #[test]
    fn merge_sums_wkc_and_ors_payload() {
        let mut primary = [0u8; 64];
        let mut secondary = [0u8; 64];

        let lrd = Command::from(Reads::Lrd { address: 0 });

        let len = setup_datagram(&mut primary, lrd, 1, 4, &[]).unwrap();
        setup_datagram(&mut secondary, lrd, 1, 4, &[]).unwrap();

        // Fake responses: first half of the ring answered on the primary path,
        // second half on the secondary.
        primary[12..14].copy_from_slice(&[0x12, 0x34]);
        primary[16..18].copy_from_slice(&1u16.to_le_bytes());

        secondary[14..16].copy_from_slice(&[0x56, 0x78]);
        secondary[16..18].copy_from_slice(&2u16.to_le_bytes());

        merge_redundant(&mut primary[..len], &secondary[..len]).unwrap();

        assert_eq!(&primary[12..16], &[0x12, 0x34, 0x56, 0x78]);

        let pdu = first_pdu(&primary[..len]).unwrap();
        assert_eq!(pdu.wkc, 3);
    }
}
