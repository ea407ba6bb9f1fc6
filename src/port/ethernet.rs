//! Minimal Ethernet II framing for EtherCAT traffic.

use crate::{
    error::{Error, PduError},
    ETHERCAT_ETHERTYPE,
};
use core::fmt;

/// A six-octet Ethernet II address.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, Default)]
pub(crate) struct EthernetAddress(pub [u8; 6]);

/// Destination of every frame the MainDevice emits: the SubDevice multicast
/// address.
pub(crate) const BROADCAST: EthernetAddress = EthernetAddress([0xff; 6]);

/// Pseudo-MAC used as the source of frames sent on the primary port.
pub(crate) const PRIMARY_MAC: EthernetAddress = EthernetAddress([0x01; 6]);

/// Pseudo-MAC used as the source of frames sent on the redundant port. The
/// middle word differs from [`PRIMARY_MAC`] so the receive path can tell which
/// port a returned frame was originally transmitted on.
pub(crate) const SECONDARY_MAC: EthernetAddress = EthernetAddress([0x04; 6]);

impl EthernetAddress {
    /// The middle 16 bit word of the address, used to attribute redundant
    /// frames to their transmit port.
    pub fn middle_word(&self) -> u16 {
        u16::from_be_bytes([self.0[2], self.0[3]])
    }
}

impl fmt::Display for EthernetAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = self.0;

        write!(
            f,
            "{:02x}-{:02x}-{:02x}-{:02x}-{:02x}-{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// The Ethernet II header length.
pub(crate) const ETHERNET_HEADER_LEN: usize = 14;

/// A read/write view over an Ethernet II frame buffer.
#[derive(Debug)]
pub(crate) struct EthernetFrame<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> EthernetFrame<T> {
    pub fn new_checked(buffer: T) -> Result<Self, Error> {
        if buffer.as_ref().len() < ETHERNET_HEADER_LEN {
            return Err(Error::Pdu(PduError::Ethernet));
        }

        Ok(Self { buffer })
    }

    pub fn src_addr(&self) -> EthernetAddress {
        let data = self.buffer.as_ref();

        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&data[6..12]);

        EthernetAddress(bytes)
    }

    pub fn ethertype(&self) -> u16 {
        let data = self.buffer.as_ref();

        // Ethernet headers are big-endian
        u16::from_be_bytes([data[12], data[13]])
    }

    pub fn is_ethercat(&self) -> bool {
        self.ethertype() == ETHERCAT_ETHERTYPE
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_ref()[ETHERNET_HEADER_LEN..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> EthernetFrame<T> {
    pub fn set_src_addr(&mut self, value: EthernetAddress) {
        self.buffer.as_mut()[6..12].copy_from_slice(&value.0);
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer.as_mut()[ETHERNET_HEADER_LEN..]
    }
}

/// Write the fixed header every transmit buffer starts with: SubDevice
/// multicast destination, per-port source pseudo-MAC, EtherCAT ethertype.
pub(crate) fn write_header(buf: &mut [u8], source: EthernetAddress) {
    buf[0..6].copy_from_slice(&BROADCAST.0);
    buf[6..12].copy_from_slice(&source.0);
    buf[12..14].copy_from_slice(&ETHERCAT_ETHERTYPE.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let mut buf = [0u8; 14];

        write_header(&mut buf, PRIMARY_MAC);

        assert_eq!(&buf[0..6], &[0xff; 6]);
        assert_eq!(&buf[6..12], &[0x01; 6]);
        assert_eq!(&buf[12..14], &[0x88, 0xa4]);

        let frame = EthernetFrame::new_checked(&buf[..]).unwrap();

        assert!(frame.is_ethercat());
        assert_eq!(frame.src_addr(), PRIMARY_MAC);
    }

    #[test]
    fn port_attribution_by_middle_word() {
        assert_ne!(PRIMARY_MAC.middle_word(), SECONDARY_MAC.middle_word());
    }

    #[test]
    fn too_short_frame_rejected() {
        assert!(EthernetFrame::new_checked(&[0u8; 10][..]).is_err());
    }
}
