//! A loopback [`Nic`] used to exercise the port, command primitives and
//! process data engine without hardware.

use super::nic::Nic;
use crate::pdu::{self, WKC_LEN};
use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

type Handler = Box<dyn Fn(&mut [u8]) + Send + Sync>;

/// A simulated interface: transmitted frames are passed to a handler standing
/// in for the SubDevice ring, then queued for receive.
pub(crate) struct SimNic {
    handler: Option<Handler>,
    queue: Mutex<VecDeque<Vec<u8>>>,
}

impl SimNic {
    /// The handler is run over the EtherCAT portion of every transmitted frame
    /// before it is queued for receive: bump working counters and fill in
    /// payloads there.
    pub fn new(handler: impl Fn(&mut [u8]) + Send + Sync + 'static) -> Self {
        Self {
            handler: Some(Box::new(handler)),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Every PDU in every frame comes back with its working counter
    /// incremented by `wkc`, payload untouched.
    pub fn echo(wkc: u16) -> Self {
        Self::new(move |ecat| bump_all_wkc(ecat, wkc))
    }

    /// Frames are transmitted but never return.
    pub fn black_hole() -> Self {
        Self {
            handler: None,
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

/// Add `increment` to the working counter of every PDU in the chain.
pub(crate) fn bump_all_wkc(ecat: &mut [u8], increment: u16) {
    let geometry: Vec<_> = pdu::PduChain::new(ecat)
        .unwrap()
        .map(|pdu| pdu.unwrap())
        .map(|pdu| (pdu.payload + pdu.len, pdu.wkc))
        .collect();

    for (wkc_at, wkc) in geometry {
        ecat[wkc_at..wkc_at + WKC_LEN]
            .copy_from_slice(&wkc.wrapping_add(increment).to_le_bytes());
    }
}

impl Nic for SimNic {
    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        let Some(handler) = self.handler.as_ref() else {
            return Ok(frame.len());
        };

        let mut response = frame.to_vec();

        handler(&mut response[super::ethernet::ETHERNET_HEADER_LEN..]);

        self.queue.lock().unwrap().push_back(response);

        Ok(frame.len())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(frame) = self.queue.lock().unwrap().pop_front() else {
            return Ok(0);
        };

        let len = frame.len().min(buf.len());

        buf[..len].copy_from_slice(&frame[..len]);

        Ok(len)
    }
}
