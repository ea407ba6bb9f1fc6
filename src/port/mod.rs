//! The NIC port: frame ring buffers, index allocation, send/receive
//! correlation and the redundant second path.

pub(crate) mod ethernet;
pub(crate) mod nic;
#[cfg(unix)]
pub(crate) mod raw_socket;
#[cfg(test)]
pub(crate) mod sim;

use crate::{
    command::{self, Command},
    error::{Error, PduError},
    pdu,
    register::RegisterAddress,
    MAX_FRAMES, MAX_FRAME_LEN,
};
use atomic_enum::atomic_enum;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use core::time::Duration;
use ethernet::{EthernetFrame, ETHERNET_HEADER_LEN, PRIMARY_MAC, SECONDARY_MAC};
use nic::Nic;
use std::sync::Mutex;
use std::time::Instant;

/// Frame ring slot lifecycle.
///
/// `Empty` → `Alloc` (on [`Port::get_index`]) → `Tx` (on transmit) →
/// `Received` or timed out → `Empty` (on [`Port::set_buf_state`]).
#[atomic_enum]
#[derive(PartialEq)]
pub(crate) enum BufState {
    Empty = 0,
    Alloc,
    Tx,
    Received,
}

/// One frame buffer plus its valid length.
struct FrameBuf {
    len: usize,
    buf: [u8; MAX_FRAME_LEN],
}

impl FrameBuf {
    fn new() -> Self {
        Self {
            len: 0,
            buf: [0; MAX_FRAME_LEN],
        }
    }
}

/// One ring slot: a transmit buffer and a receive buffer per path.
///
/// The atomics gate which thread may touch the buffers: only the allocator of
/// an `Alloc` slot builds its TX frame, only the receive demux fills an `Rx`
/// buffer of a `Tx` slot.
struct FrameSlot {
    state: AtomicBufState,
    tx: Mutex<FrameBuf>,
    rx: Mutex<FrameBuf>,
    /// Source MAC middle word of the frame in `rx`, identifying the transmit
    /// port it came from.
    rxsa: AtomicU16,
    /// Receive state and buffer for the redundant path.
    red_state: AtomicBufState,
    rx_red: Mutex<FrameBuf>,
    rxsa_red: AtomicU16,
}

impl FrameSlot {
    fn new() -> Self {
        Self {
            state: AtomicBufState::new(BufState::Empty),
            tx: Mutex::new(FrameBuf::new()),
            rx: Mutex::new(FrameBuf::new()),
            rxsa: AtomicU16::new(0),
            red_state: AtomicBufState::new(BufState::Empty),
            rx_red: Mutex::new(FrameBuf::new()),
            rxsa_red: AtomicU16::new(0),
        }
    }
}

/// Which receive ring a frame was captured into.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Ring {
    Primary,
    Secondary,
}

/// The NIC port.
///
/// Owns one or two raw interfaces and `MAX_FRAMES` ring slots. Three
/// mutual-exclusion scopes allow concurrent callers: index allocation,
/// transmit, and the receive demux. A frame that returns while another
/// thread's round trip holds the receive scope is routed into its ring slot so
/// the waiting thread finds it on its next poll.
pub struct Port {
    primary: Box<dyn Nic>,
    secondary: Option<Box<dyn Nic>>,
    slots: Vec<FrameSlot>,
    /// Get-index scope: serialises allocation, holds the last-used cursor.
    index_scope: Mutex<u8>,
    /// Transmit scope: serialises `send` on the underlying sockets.
    tx_scope: Mutex<()>,
    /// Receive scope: serialises the demultiplexing reader and owns the
    /// inbound scratch buffer.
    rx_scope: Mutex<Box<[u8; MAX_FRAME_LEN]>>,
    /// Set once the redundant path has missed a frame; cleared when traffic
    /// returns.
    degraded: AtomicBool,
}

impl core::fmt::Debug for Port {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Port")
            .field("redundant", &self.secondary.is_some())
            .finish()
    }
}

impl Port {
    pub(crate) fn new(primary: Box<dyn Nic>, secondary: Option<Box<dyn Nic>>) -> Self {
        let mut slots = Vec::with_capacity(MAX_FRAMES);

        for _ in 0..MAX_FRAMES {
            let slot = FrameSlot::new();

            // Every TX buffer starts with the fixed Ethernet header; only the
            // EtherCAT portion changes per frame.
            ethernet::write_header(&mut slot.tx.lock().unwrap().buf, PRIMARY_MAC);

            slots.push(slot);
        }

        Self {
            primary,
            secondary,
            slots,
            index_scope: Mutex::new(0),
            tx_scope: Mutex::new(()),
            rx_scope: Mutex::new(Box::new([0; MAX_FRAME_LEN])),
            degraded: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_redundant(&self) -> bool {
        self.secondary.is_some()
    }

    /// Claim a free ring slot, walking the cursor forward from the last used
    /// index.
    pub(crate) fn get_index(&self) -> Result<u8, Error> {
        let started = Instant::now();

        loop {
            {
                let mut cursor = self.index_scope.lock().unwrap();

                for offset in 1..=MAX_FRAMES as u8 {
                    let idx = (*cursor).wrapping_add(offset) % MAX_FRAMES as u8;

                    let slot = &self.slots[usize::from(idx)];

                    if slot
                        .state
                        .compare_exchange(
                            BufState::Empty,
                            BufState::Alloc,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        slot.red_state.store(BufState::Empty, Ordering::Release);
                        *cursor = idx;

                        return Ok(idx);
                    }
                }
            }

            // All slots in flight: contend until one frees up
            if started.elapsed() > Duration::from_secs(1) {
                return Err(Error::Timeout);
            }

            std::thread::yield_now();
        }
    }

    /// Move a slot to a new lifecycle state. Passing [`BufState::Empty`]
    /// releases the slot for reuse.
    pub(crate) fn set_buf_state(&self, idx: u8, state: BufState) {
        let slot = &self.slots[usize::from(idx)];

        slot.state.store(state, Ordering::Release);
        if state == BufState::Empty {
            slot.red_state.store(BufState::Empty, Ordering::Release);
        }
    }

    /// Begin a frame in the slot's TX buffer with a single datagram.
    pub(crate) fn setup_datagram(
        &self,
        idx: u8,
        command: Command,
        data_len: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut tx = self.slots[usize::from(idx)].tx.lock().unwrap();

        let ecat_len = pdu::setup_datagram(
            &mut tx.buf[ETHERNET_HEADER_LEN..],
            command,
            idx,
            data_len,
            data,
        )?;

        tx.len = ETHERNET_HEADER_LEN + ecat_len;

        Ok(())
    }

    /// Append a datagram to the slot's TX buffer, returning the offset of its
    /// payload within the EtherCAT portion of the returned frame.
    pub(crate) fn add_datagram(
        &self,
        idx: u8,
        command: Command,
        more_follows: bool,
        data_len: usize,
        data: &[u8],
    ) -> Result<usize, Error> {
        let mut tx = self.slots[usize::from(idx)].tx.lock().unwrap();

        let prev_ecat_len = tx.len - ETHERNET_HEADER_LEN;

        let (ecat_len, payload_offset) = pdu::add_datagram(
            &mut tx.buf[ETHERNET_HEADER_LEN..],
            prev_ecat_len,
            command,
            idx,
            more_follows,
            data_len,
            data,
        )?;

        tx.len = ETHERNET_HEADER_LEN + ecat_len;

        Ok(payload_offset)
    }

    /// Transmit the slot's frame on the primary interface only.
    pub(crate) fn tx_frame(&self, idx: u8) -> Result<(), Error> {
        let slot = &self.slots[usize::from(idx)];

        let _tx_scope = self.tx_scope.lock().unwrap();

        slot.state.store(BufState::Tx, Ordering::Release);

        let tx = slot.tx.lock().unwrap();

        self.primary
            .send(&tx.buf[..tx.len])
            .map_err(|_| Error::SendFrame)?;

        Ok(())
    }

    /// Transmit the slot's frame redundancy-aware: the full frame goes out the
    /// primary interface and, when a redundant interface is configured, a 2
    /// byte dummy BRD mirroring the same index goes out the secondary so a cut
    /// ring still returns something on both paths.
    pub(crate) fn tx_frame_red(&self, idx: u8) -> Result<(), Error> {
        let slot = &self.slots[usize::from(idx)];

        let _tx_scope = self.tx_scope.lock().unwrap();

        slot.state.store(BufState::Tx, Ordering::Release);

        {
            let tx = slot.tx.lock().unwrap();

            self.primary
                .send(&tx.buf[..tx.len])
                .map_err(|_| Error::SendFrame)?;
        }

        if let Some(secondary) = self.secondary.as_deref() {
            slot.red_state.store(BufState::Tx, Ordering::Release);

            let mut dummy = [0u8; ETHERNET_HEADER_LEN + 16];

            ethernet::write_header(&mut dummy, SECONDARY_MAC);

            let ecat_len = pdu::setup_datagram(
                &mut dummy[ETHERNET_HEADER_LEN..],
                Command::brd(0x0000u16).command.into(),
                idx,
                2,
                &[],
            )?;

            secondary
                .send(&dummy[..ETHERNET_HEADER_LEN + ecat_len])
                .map_err(|_| Error::SendFrame)?;
        }

        Ok(())
    }

    /// Pull pending frames off an interface and route them into their ring
    /// slots by the index field of their first PDU.
    fn fetch_frames(&self, ring: Ring) -> Result<(), Error> {
        let nic = match ring {
            Ring::Primary => self.primary.as_ref(),
            Ring::Secondary => match self.secondary.as_deref() {
                Some(nic) => nic,
                None => return Ok(()),
            },
        };

        let mut temp = self.rx_scope.lock().unwrap();

        loop {
            let len = nic.recv(&mut temp[..])?;

            if len == 0 {
                return Ok(());
            }

            let Ok(frame) = EthernetFrame::new_checked(&temp[..len]) else {
                continue;
            };

            if !frame.is_ethercat() {
                continue;
            }

            let ecat = frame.payload();

            // Index byte of the first PDU
            let Some(idx) = ecat.get(3).copied() else {
                continue;
            };

            let Some(slot) = self.slots.get(usize::from(idx)) else {
                log::trace!("Discarding frame with foreign index {}", idx);

                continue;
            };

            let (state, rx, rxsa) = match ring {
                Ring::Primary => (&slot.state, &slot.rx, &slot.rxsa),
                Ring::Secondary => (&slot.red_state, &slot.rx_red, &slot.rxsa_red),
            };

            if state.load(Ordering::Acquire) != BufState::Tx {
                log::trace!("Discarding frame for idle index {}", idx);

                continue;
            }

            let mut rx = rx.lock().unwrap();

            let ecat_len = ecat.len().min(MAX_FRAME_LEN - ETHERNET_HEADER_LEN);

            rx.buf[..ecat_len].copy_from_slice(&ecat[..ecat_len]);
            rx.len = ecat_len;

            rxsa.store(frame.src_addr().middle_word(), Ordering::Release);

            state.store(BufState::Received, Ordering::Release);
        }
    }

    /// Wait for the frame with the given index to return, and extract the
    /// working counter of its first PDU.
    ///
    /// In redundant mode both paths are waited on and the returned views are
    /// combined; see [`merge_paths`](Self::merge_paths). Returns
    /// [`Error::Timeout`] (`NOFRAME`) when nothing arrived in time. The slot is
    /// left allocated either way; the caller releases it.
    pub(crate) fn wait_inframe(&self, idx: u8, timeout: Duration) -> Result<u16, Error> {
        let slot = &self.slots[usize::from(idx)];
        let deadline = Instant::now() + timeout;

        loop {
            self.fetch_frames(Ring::Primary)?;

            if self.is_redundant() {
                self.fetch_frames(Ring::Secondary)?;
            }

            let primary_in = slot.state.load(Ordering::Acquire) == BufState::Received;
            let secondary_in = slot.red_state.load(Ordering::Acquire) == BufState::Received;

            if !self.is_redundant() {
                if primary_in {
                    return self.first_wkc(idx);
                }
            } else if primary_in && secondary_in {
                self.merge_paths(idx)?;

                self.degraded.store(false, Ordering::Release);

                return self.first_wkc(idx);
            } else if (primary_in || secondary_in) && Instant::now() >= deadline {
                // One healthy path only: promote whatever arrived
                if secondary_in && !primary_in {
                    self.promote_secondary(idx);
                }

                if !self.degraded.swap(true, Ordering::AcqRel) {
                    log::warn!("Redundant link degraded: one path lost");
                }

                return self.first_wkc(idx);
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }

            std::thread::yield_now();
        }
    }

    /// Combine the primary and secondary returns for one index.
    ///
    /// When both paths returned the same PDU chain, payloads are OR-ed together
    /// and working counters summed, so a SubDevice touched by exactly one path
    /// still contributes. When the secondary return is the short dummy frame,
    /// the full frame wins: if it arrived on the secondary path it is promoted
    /// into the primary view first.
    fn merge_paths(&self, idx: u8) -> Result<(), Error> {
        let slot = &self.slots[usize::from(idx)];

        // The dummy BRD carries the secondary pseudo-MAC; the real frame
        // carries the primary one. Whichever socket it arrived on, find the
        // real frame.
        if slot.rxsa.load(Ordering::Acquire) == SECONDARY_MAC.middle_word()
            && slot.rxsa_red.load(Ordering::Acquire) == PRIMARY_MAC.middle_word()
        {
            // Ring intact: the real frame traversed every SubDevice and came
            // back on the other interface
            self.promote_secondary(idx);

            return Ok(());
        }

        let mut rx = slot.rx.lock().unwrap();
        let rx_red = slot.rx_red.lock().unwrap();

        let (rx_len, red_len) = (rx.len, rx_red.len);

        if rx_len == red_len {
            let rx = &mut *rx;

            pdu::merge_redundant(&mut rx.buf[..rx_len], &rx_red.buf[..red_len])?;
        }

        Ok(())
    }

    /// Copy the secondary path's return over the primary view.
    fn promote_secondary(&self, idx: u8) {
        let slot = &self.slots[usize::from(idx)];

        let mut rx = slot.rx.lock().unwrap();
        let rx_red = slot.rx_red.lock().unwrap();

        rx.buf[..rx_red.len].copy_from_slice(&rx_red.buf[..rx_red.len]);
        rx.len = rx_red.len;

        slot.rxsa
            .store(slot.rxsa_red.load(Ordering::Acquire), Ordering::Release);
        slot.state.store(BufState::Received, Ordering::Release);
    }

    fn first_wkc(&self, idx: u8) -> Result<u16, Error> {
        self.with_rx(idx, |ecat| pdu::first_pdu(ecat).map(|pdu| pdu.wkc))?
    }

    /// Send the slot's frame and block until its response returns.
    pub(crate) fn sr_confirm(&self, idx: u8, timeout: Duration) -> Result<u16, Error> {
        self.tx_frame_red(idx)?;

        self.wait_inframe(idx, timeout)
    }

    /// Run a closure over the received EtherCAT buffer for a slot.
    pub(crate) fn with_rx<R>(
        &self,
        idx: u8,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Result<R, Error> {
        let slot = &self.slots[usize::from(idx)];

        if slot.state.load(Ordering::Acquire) != BufState::Received {
            return Err(Error::Pdu(PduError::InvalidIndex(idx)));
        }

        let rx = slot.rx.lock().unwrap();

        Ok(f(&rx.buf[..rx.len]))
    }

    /// One blocking command round trip: claim an index, build a one-datagram
    /// frame, confirm it, optionally copy the response payload out, release the
    /// slot.
    pub(crate) fn round_trip(
        &self,
        command: Command,
        data: &[u8],
        readback: Option<&mut [u8]>,
        timeout: Duration,
    ) -> Result<u16, Error> {
        let data_len = readback
            .as_ref()
            .map(|buf| buf.len())
            .unwrap_or(0)
            .max(data.len());

        let idx = self.get_index()?;

        let result = (|| {
            self.setup_datagram(idx, command, data_len, data)?;

            let wkc = self.sr_confirm(idx, timeout)?;

            if let Some(out) = readback {
                self.with_rx(idx, |ecat| {
                    let pdu = pdu::first_pdu(ecat)?;

                    command::validate_response(command, idx, pdu.header.command()?, pdu.header.index)?;

                    let n = out.len().min(pdu.len);

                    out[..n].copy_from_slice(&ecat[pdu.payload..pdu.payload + n]);

                    Ok::<(), Error>(())
                })??;
            }

            Ok(wkc)
        })();

        self.set_buf_state(idx, BufState::Empty);

        result
    }

    /// Blocking LRW with a piggybacked FRMW of the DC reference SubDevice's
    /// system time register.
    ///
    /// `data` is written out and overwritten with the response; the
    /// distributed clock time read from `dc_reference` is written into
    /// `dc_time`.
    pub fn lrwdc(
        &self,
        address: u32,
        data: &mut [u8],
        dc_reference: u16,
        dc_time: &mut i64,
        timeout: Duration,
    ) -> Result<u16, Error> {
        let command: Command = Command::lrw(address).command.into();

        let idx = self.get_index()?;

        let result = (|| {
            self.setup_datagram(idx, command, data.len(), data)?;

            let dc_offset = self.add_datagram(
                idx,
                Command::frmw(dc_reference, RegisterAddress::DcSystemTime)
                    .command
                    .into(),
                false,
                8,
                &dc_time.to_le_bytes(),
            )?;

            let wkc = self.sr_confirm(idx, timeout)?;

            self.with_rx(idx, |ecat| {
                let pdu = pdu::first_pdu(ecat)?;

                command::validate_response(command, idx, pdu.header.command()?, pdu.header.index)?;

                let n = data.len().min(pdu.len);

                data[..n].copy_from_slice(&ecat[pdu.payload..pdu.payload + n]);

                if let Some(raw) = ecat.get(dc_offset..dc_offset + 8) {
                    *dc_time = i64::from_le_bytes(raw.try_into().unwrap());
                }

                Ok::<(), Error>(())
            })??;

            Ok(wkc)
        })();

        self.set_buf_state(idx, BufState::Empty);

        result
    }

    /// Like [`round_trip`](Self::round_trip), but the payload buffer is both
    /// written out and overwritten with the response (`LRW` semantics).
    pub(crate) fn round_trip_in_place(
        &self,
        command: Command,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<u16, Error> {
        let idx = self.get_index()?;

        let result = (|| {
            self.setup_datagram(idx, command, data.len(), data)?;

            let wkc = self.sr_confirm(idx, timeout)?;

            self.with_rx(idx, |ecat| {
                let pdu = pdu::first_pdu(ecat)?;

                command::validate_response(command, idx, pdu.header.command()?, pdu.header.index)?;

                let n = data.len().min(pdu.len);

                data[..n].copy_from_slice(&ecat[pdu.payload..pdu.payload + n]);

                Ok::<(), Error>(())
            })??;

            Ok(wkc)
        })();

        self.set_buf_state(idx, BufState::Empty);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimNic;
    use super::*;
    use crate::register::RegisterAddress;

    fn single_port(nic: SimNic) -> Port {
        Port::new(Box::new(nic), None)
    }

    #[test]
    fn index_lifecycle() {
        let port = single_port(SimNic::echo(1));

        let a = port.get_index().unwrap();
        let b = port.get_index().unwrap();

        assert_ne!(a, b, "allocated slots must be distinct");

        port.set_buf_state(a, BufState::Empty);
        port.set_buf_state(b, BufState::Empty);

        // Cursor keeps walking forward
        let c = port.get_index().unwrap();
        assert_ne!(b, c);
        port.set_buf_state(c, BufState::Empty);
    }

    #[test]
    fn exhaustion_times_out() {
        let port = single_port(SimNic::echo(1));

        for _ in 0..MAX_FRAMES {
            port.get_index().unwrap();
        }

        assert_eq!(port.get_index(), Err(Error::Timeout));
    }

    #[test]
    fn round_trip_returns_wkc() {
        let port = single_port(SimNic::echo(3));

        let mut out = [0u8; 2];

        let wkc = Command::brd(RegisterAddress::Type)
            .receive_slice(&port, &mut out, Duration::from_millis(10))
            .unwrap();

        assert_eq!(wkc, 3);
    }

    #[test]
    fn response_payload_copied_back() {
        let nic = SimNic::new(|ecat: &mut [u8]| {
            // Respond to the first PDU with 0xaa bytes and WKC 1
            let pdu = pdu::first_pdu(ecat).unwrap();

            let (payload, len) = (pdu.payload, pdu.len);

            ecat[payload..payload + len].fill(0xaa);
            ecat[payload + len..payload + len + 2].copy_from_slice(&1u16.to_le_bytes());
        });

        let port = single_port(nic);

        let mut out = [0u8; 4];

        let wkc = Command::fprd(0x1001, RegisterAddress::DcSystemTime)
            .receive_slice(&port, &mut out, Duration::from_millis(10))
            .unwrap();

        assert_eq!(wkc, 1);
        assert_eq!(out, [0xaa; 4]);
    }

    #[test]
    fn no_response_is_noframe() {
        let port = single_port(SimNic::black_hole());

        let result = Command::brd(RegisterAddress::Type).receive_wkc(
            &port,
            2,
            Duration::from_millis(5),
        );

        assert_eq!(result, Err(Error::Timeout));

        // Slot must be reusable after the timeout
        assert!(port.get_index().is_ok());
    }

    #[test]
    fn lrwdc_extracts_dc_time() {
        let nic = SimNic::new(|ecat: &mut [u8]| {
            let pdus: Vec<_> = pdu::PduChain::new(ecat)
                .unwrap()
                .map(|pdu| pdu.unwrap())
                .map(|pdu| (pdu.header.command_code, pdu.payload, pdu.len))
                .collect();

            for (code, payload, len) in pdus {
                match code {
                    // LRW: echo with WKC 3
                    0x0c => {
                        ecat[payload + len..payload + len + 2]
                            .copy_from_slice(&3u16.to_le_bytes());
                    }
                    // FRMW: answer with the reference clock time
                    0x0e => {
                        ecat[payload..payload + 8]
                            .copy_from_slice(&42_000_000i64.to_le_bytes());
                        ecat[payload + len..payload + len + 2]
                            .copy_from_slice(&1u16.to_le_bytes());
                    }
                    _ => {}
                }
            }
        });

        let port = single_port(nic);

        let mut data = [0xabu8; 8];
        let mut dc_time = 0i64;

        let wkc = port
            .lrwdc(0, &mut data, 0x1001, &mut dc_time, Duration::from_millis(10))
            .unwrap();

        assert_eq!(wkc, 3);
        assert_eq!(dc_time, 42_000_000);
        // Echoed process data survives the round trip
        assert_eq!(data, [0xab; 8]);
    }

    #[test]
    fn redundant_promotes_secondary_only_path() {
        // Primary NIC swallows everything; secondary echoes the dummy with a
        // WKC of 2.
        let port = Port::new(
            Box::new(SimNic::black_hole()),
            Some(Box::new(SimNic::echo(2))),
        );

        let idx = port.get_index().unwrap();

        port.setup_datagram(
            idx,
            Command::brd(RegisterAddress::Type).command.into(),
            2,
            &[],
        )
        .unwrap();

        let wkc = port.sr_confirm(idx, Duration::from_millis(5)).unwrap();

        port.set_buf_state(idx, BufState::Empty);

        assert_eq!(wkc, 2);
    }
}
