//! Cyclic process data exchange: segmented LRW (or LRD + LWR), the index
//! stack that reassembles responses, and the DC system time piggyback.

use crate::{
    command::Command,
    error::Error,
    maindevice::MainDevice,
    port::BufState,
    register::RegisterAddress,
    MAX_FRAMES, MAX_GROUPS,
};
use core::time::Duration;

/// One in-flight cyclic frame: its ring index, where its returned payload
/// lands in the IOmap, and how long it is.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct IdxStackEntry {
    pub idx: u8,
    pub dest_offset: usize,
    pub length: usize,
}

/// Bounded FIFO of in-flight cyclic frames.
///
/// Pushed by the send half of a cycle, drained in order by the receive half.
/// Empty on entry to and successful return from every receive.
#[derive(Debug, Default)]
pub(crate) struct IndexStack {
    entries: heapless::Vec<IdxStackEntry, MAX_FRAMES>,
    pulled: usize,
}

impl IndexStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: IdxStackEntry) {
        if self.entries.push(entry).is_err() {
            log::error!("Index stack overflow; dropping frame {}", entry.idx);
        }
    }

    pub fn pull(&mut self) -> Option<IdxStackEntry> {
        let entry = self.entries.get(self.pulled).copied();

        if entry.is_some() {
            self.pulled += 1;
        }

        entry
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.pulled = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// LRD command code in a received frame.
const CMD_LRD: u8 = 0x0a;
/// LWR command code in a received frame.
const CMD_LWR: u8 = 0x0b;
/// LRW command code in a received frame.
const CMD_LRW: u8 = 0x0c;

impl MainDevice {
    /// Transmit the process data of group 0. Non-blocking; pair with
    /// [`receive_processdata`](Self::receive_processdata).
    pub fn send_processdata(&mut self, iomap: &[u8]) -> Result<(), Error> {
        self.send_processdata_group(iomap, 0)
    }

    /// Transmit the process data of group 0 using the overlapping IOmap
    /// layout.
    pub fn send_overlap_processdata(&mut self, iomap: &[u8]) -> Result<(), Error> {
        self.send_overlap_processdata_group(iomap, 0)
    }

    /// Drain the responses of the last send for group 0, copying inputs into
    /// the IOmap. Returns the summed working counter.
    pub fn receive_processdata(&mut self, iomap: &mut [u8], timeout: Duration) -> Result<u16, Error> {
        self.receive_processdata_group(iomap, 0, timeout)
    }

    /// Transmit the process data of one group.
    ///
    /// Outputs are taken from the IOmap; inputs travel as placeholders and are
    /// gathered by [`receive_processdata_group`](Self::receive_processdata_group).
    /// Exchanges larger than one datagram are split per the group's
    /// segmentation table. The first frame additionally carries the DC system
    /// time FRMW when the group has a DC reference.
    pub fn send_processdata_group(&mut self, iomap: &[u8], group: u8) -> Result<(), Error> {
        self.main_send_processdata(iomap, group, false)
    }

    /// Transmit the process data of one group mapped with
    /// [`config_overlap_map_group`](Self::config_overlap_map_group).
    pub fn send_overlap_processdata_group(
        &mut self,
        iomap: &[u8],
        group: u8,
    ) -> Result<(), Error> {
        self.main_send_processdata(iomap, group, true)
    }

    fn main_send_processdata(
        &mut self,
        iomap: &[u8],
        group: u8,
        overlap: bool,
    ) -> Result<(), Error> {
        if usize::from(group) >= MAX_GROUPS {
            return Err(Error::NotFound {
                item: crate::error::Item::Group,
                index: Some(usize::from(group)),
            });
        }

        let group_record = self.groups[usize::from(group)].clone();

        // Treat a missing DC anchor as DC disabled for the cycle
        let mut first_dc = group_record.has_dc && group_record.dc_next != 0;

        let dc_reference = self
            .subdevices
            .get(usize::from(group_record.dc_next))
            .map(|subdevice| subdevice.configured_address)
            .unwrap_or(0);

        let (mut length, mut iomap_input_offset) = if overlap {
            (
                group_record.output_bytes.max(group_record.input_bytes) as usize,
                group_record.output_bytes as usize,
            )
        } else {
            (
                (group_record.output_bytes + group_record.input_bytes) as usize,
                0,
            )
        };

        let mut log_addr = group_record.logical_start_address;

        if length == 0 {
            return Ok(());
        }

        if group_record.block_lrw > 0 {
            // One or more SubDevices cannot handle LRW: inputs via LRD,
            // outputs via LWR
            if group_record.input_bytes > 0 {
                let mut segment = group_record.input_segment;
                let mut data_offset = group_record.inputs_offset;
                let mut remaining = group_record.input_bytes as usize;

                log_addr += group_record.output_bytes;

                while remaining > 0 && segment < group_record.num_segments {
                    let sublength = if segment == group_record.input_segment {
                        (group_record.io_segments[segment] - group_record.input_offset) as usize
                    } else {
                        group_record.io_segments[segment] as usize
                    }
                    .min(remaining);
                    segment += 1;

                    first_dc = self.queue_cyclic_frame(
                        Command::lrd(log_addr).command.into(),
                        iomap,
                        data_offset,
                        data_offset,
                        sublength,
                        first_dc,
                        dc_reference,
                    )?;

                    remaining -= sublength;
                    log_addr += sublength as u32;
                    data_offset += sublength;
                }
            }

            if group_record.output_bytes > 0 {
                let mut segment = 0;
                let mut data_offset = group_record.outputs_offset;
                let mut remaining = group_record.output_bytes as usize;

                let mut log_addr = group_record.logical_start_address;

                while remaining > 0 && segment < group_record.num_segments {
                    let mut sublength = group_record.io_segments[segment] as usize;
                    segment += 1;

                    sublength = sublength.min(remaining);

                    first_dc = self.queue_cyclic_frame(
                        Command::lwr(log_addr).command.into(),
                        iomap,
                        data_offset,
                        data_offset,
                        sublength,
                        first_dc,
                        dc_reference,
                    )?;

                    remaining -= sublength;
                    log_addr += sublength as u32;
                    data_offset += sublength;
                }
            }

            return Ok(());
        }

        // LRW path: one exchange covers both directions
        let mut data_offset = if group_record.output_bytes > 0 {
            group_record.outputs_offset
        } else {
            // Inputs only: no offset compensation even in overlap mode
            iomap_input_offset = 0;

            group_record.inputs_offset
        };

        let mut segment = 0;

        while length > 0 && segment < group_record.num_segments {
            let sublength = (group_record.io_segments[segment] as usize).min(length);
            segment += 1;

            first_dc = self.queue_cyclic_frame(
                Command::lrw(log_addr).command.into(),
                iomap,
                data_offset,
                data_offset + iomap_input_offset,
                sublength,
                first_dc,
                dc_reference,
            )?;

            length -= sublength;
            log_addr += sublength as u32;
            data_offset += sublength;
        }

        Ok(())
    }

    /// Build, transmit and record one cyclic frame. Returns the updated
    /// "first DC frame still pending" flag.
    #[allow(clippy::too_many_arguments)]
    fn queue_cyclic_frame(
        &mut self,
        command: Command,
        iomap: &[u8],
        source_offset: usize,
        dest_offset: usize,
        sublength: usize,
        first_dc: bool,
        dc_reference: u16,
    ) -> Result<bool, Error> {
        let idx = self.port.get_index()?;

        let data = iomap
            .get(source_offset..source_offset + sublength)
            .ok_or(Error::Internal)?;

        self.port.setup_datagram(idx, command, sublength, data)?;

        if first_dc {
            // Piggyback the DC system time distribution onto the first frame
            self.dc_payload_len = sublength;

            self.dc_time_offset = self.port.add_datagram(
                idx,
                Command::frmw(dc_reference, RegisterAddress::DcSystemTime)
                    .command
                    .into(),
                false,
                8,
                &self.dc_time.to_le_bytes(),
            )?;
        }

        self.port.tx_frame_red(idx)?;

        self.idx_stack.push(IdxStackEntry {
            idx,
            dest_offset,
            length: sublength,
        });

        Ok(false)
    }

    /// Drain the responses of the last send for one group.
    ///
    /// Frames are pulled from the index stack in transmit order; LRD/LRW
    /// payloads are copied into the IOmap at their recorded destination, LWR
    /// responses contribute a doubled working counter so both paths produce
    /// the same total. The DC-carrying frame additionally yields the system
    /// time into [`dc_time`](Self::dc_time).
    ///
    /// Returns the aggregate working counter, or [`Error::Timeout`]
    /// (`NOFRAME`) if no frame arrived at all.
    pub fn receive_processdata_group(
        &mut self,
        iomap: &mut [u8],
        group: u8,
        timeout: Duration,
    ) -> Result<u16, Error> {
        let group_record = &self.groups[usize::from(group.min(MAX_GROUPS as u8 - 1))];

        let mut first_dc = group_record.has_dc && group_record.dc_next != 0;

        let mut wkc_sum: u16 = 0;
        let mut any_valid = false;

        while let Some(entry) = self.idx_stack.pull() {
            let result = self.port.wait_inframe(entry.idx, timeout);

            if let Ok(wkc) = result {
                let copied = self.port.with_rx(entry.idx, |ecat| {
                    let command_code = ecat.get(2).copied().unwrap_or(0);

                    match command_code {
                        CMD_LRD | CMD_LRW => {
                            let payload = crate::pdu::FIRST_PAYLOAD;

                            let copy_len = entry.length.min(ecat.len().saturating_sub(payload));

                            if let Some(dest) =
                                iomap.get_mut(entry.dest_offset..entry.dest_offset + copy_len)
                            {
                                dest.copy_from_slice(&ecat[payload..payload + copy_len]);
                            }

                            let dc_time = first_dc
                                .then(|| extract_dc_time(ecat, self.dc_time_offset))
                                .flatten();

                            Some((wkc, dc_time))
                        }
                        CMD_LWR => {
                            let dc_time = first_dc
                                .then(|| extract_dc_time(ecat, self.dc_time_offset))
                                .flatten();

                            // Output WKC counts twice with LRW; emulate the
                            // same for the LWR path
                            Some((wkc.wrapping_mul(2), dc_time))
                        }
                        _ => None,
                    }
                })?;

                if let Some((frame_wkc, dc_time)) = copied {
                    wkc_sum = wkc_sum.wrapping_add(frame_wkc);
                    any_valid = true;

                    if first_dc {
                        if let Some(dc_time) = dc_time {
                            self.dc_time = dc_time;
                        }

                        first_dc = false;
                    }
                }
            }

            self.port.set_buf_state(entry.idx, BufState::Empty);
        }

        self.idx_stack.clear();

        if !any_valid {
            return Err(Error::Timeout);
        }

        Ok(wkc_sum)
    }
}

/// Pull the piggybacked DC system time out of the first cyclic frame.
fn extract_dc_time(ecat: &[u8], offset: usize) -> Option<i64> {
    ecat.get(offset..offset + 8)
        .map(|raw| i64::from_le_bytes(raw.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Group;
    use crate::pdu;
    use crate::port::sim::SimNic;
    use crate::port::Port;
    use crate::subdevice::SubDevice;
    use crate::MAX_LRW_DATA;

    fn cyclic_maindevice(nic: SimNic) -> MainDevice {
        MainDevice::with_port(Port::new(Box::new(nic), None))
    }

    /// Respond to every logical datagram: fill the payload with a marker, set
    /// a fixed WKC, and answer any chained FRMW with a DC timestamp.
    fn lrw_responder(marker: u8, wkc: u16, dc_time: i64) -> SimNic {
        SimNic::new(move |ecat: &mut [u8]| {
            let pdus: Vec<_> = pdu::PduChain::new(ecat)
                .unwrap()
                .map(|pdu| pdu.unwrap())
                .map(|pdu| (pdu.header.command_code, pdu.payload, pdu.len))
                .collect();

            for (code, payload, len) in pdus {
                match code {
                    CMD_LRD | CMD_LRW => {
                        ecat[payload..payload + len].fill(marker);
                        ecat[payload + len..payload + len + 2]
                            .copy_from_slice(&wkc.to_le_bytes());
                    }
                    CMD_LWR => {
                        ecat[payload + len..payload + len + 2]
                            .copy_from_slice(&wkc.to_le_bytes());
                    }
                    // FRMW on the DC system time register
                    0x0e => {
                        ecat[payload..payload + 8].copy_from_slice(&dc_time.to_le_bytes());
                        ecat[payload + len..payload + len + 2]
                            .copy_from_slice(&1u16.to_le_bytes());
                    }
                    _ => {}
                }
            }
        })
    }

    fn single_segment_group(output_bytes: u32, input_bytes: u32) -> Group {
        Group {
            output_bytes,
            input_bytes,
            inputs_offset: output_bytes as usize,
            io_segments: {
                let mut segments = [0u32; crate::MAX_IO_SEGMENTS];
                segments[0] = output_bytes + input_bytes;
                segments
            },
            num_segments: 1,
            outputs_wkc: 1,
            inputs_wkc: 1,
            ..Group::default()
        }
    }

    #[test]
    fn single_lrw_cycle_copies_inputs() {
        let mut maindevice = cyclic_maindevice(lrw_responder(0xaa, 3, 0));

        maindevice.groups[0] = single_segment_group(8, 8);

        let mut iomap = [0u8; 16];
        iomap[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

        maindevice.send_processdata(&iomap).unwrap();

        assert!(!maindevice.idx_stack.is_empty());

        let wkc = maindevice
            .receive_processdata(&mut iomap, Duration::from_millis(10))
            .unwrap();

        assert_eq!(wkc, 3);

        // The whole LRW window is copied back, inputs included
        assert_eq!(&iomap[8..], &[0xaa; 8]);

        assert!(maindevice.idx_stack.is_empty());
    }

    #[test]
    fn oversize_group_is_segmented() {
        let total: u32 = 1600;

        let mut maindevice = cyclic_maindevice(lrw_responder(0x55, 2, 0));

        let max_segment = (MAX_LRW_DATA - crate::FIRST_DC_DATAGRAM) as u32;

        maindevice.groups[0] = Group {
            output_bytes: total,
            input_bytes: 0,
            io_segments: {
                let mut segments = [0u32; crate::MAX_IO_SEGMENTS];
                segments[0] = max_segment;
                segments[1] = total - max_segment;
                segments
            },
            num_segments: 2,
            ..Group::default()
        };

        let mut iomap = vec![0u8; total as usize];

        maindevice.send_processdata(&iomap).unwrap();

        let wkc = maindevice
            .receive_processdata(&mut iomap, Duration::from_millis(10))
            .unwrap();

        // Two frames, each returning WKC 2
        assert_eq!(wkc, 4);

        // Both segments were written back at non-overlapping ranges
        assert!(iomap.iter().all(|byte| *byte == 0x55));
    }

    #[test]
    fn first_frame_carries_dc_time() {
        let mut maindevice = cyclic_maindevice(lrw_responder(0x00, 3, 123_456_789));

        maindevice.groups[0] = Group {
            has_dc: true,
            dc_next: 1,
            ..single_segment_group(4, 4)
        };

        maindevice.subdevices.push(SubDevice {
            configured_address: 0x1001,
            has_dc: true,
            ..SubDevice::default()
        });

        let mut iomap = [0u8; 8];

        maindevice.send_processdata(&iomap).unwrap();

        let wkc = maindevice
            .receive_processdata(&mut iomap, Duration::from_millis(10))
            .unwrap();

        assert_eq!(wkc, 3);
        assert_eq!(maindevice.dc_time(), 123_456_789);
    }

    #[test]
    fn block_lrw_splits_into_lrd_and_lwr() {
        let mut maindevice = cyclic_maindevice(lrw_responder(0xee, 1, 0));

        maindevice.groups[0] = Group {
            block_lrw: 1,
            ..single_segment_group(8, 4)
        };

        // Input area starts after the outputs within the shared segment
        maindevice.groups[0].input_offset = 8;

        let mut iomap = [0u8; 12];

        maindevice.send_processdata(&iomap).unwrap();

        let wkc = maindevice
            .receive_processdata(&mut iomap, Duration::from_millis(10))
            .unwrap();

        // LRD contributes 1, LWR contributes 1 doubled
        assert_eq!(wkc, 3);

        // Inputs landed after the outputs; outputs untouched by the LRD
        assert_eq!(&iomap[8..], &[0xee; 4]);
        assert_eq!(&iomap[..8], &[0u8; 8]);
    }

    #[test]
    fn no_response_returns_noframe() {
        let mut maindevice = cyclic_maindevice(SimNic::black_hole());

        maindevice.groups[0] = single_segment_group(2, 0);

        let mut iomap = [0u8; 2];

        maindevice.send_processdata(&iomap).unwrap();

        assert_eq!(
            maindevice.receive_processdata(&mut iomap, Duration::from_millis(5)),
            Err(Error::Timeout)
        );

        // The ring slot must be reusable for the next cycle
        assert!(maindevice.port.get_index().is_ok());
        assert!(maindevice.idx_stack.is_empty());
    }
}
