//! Groups: partitions of SubDevices sharing one logical address space.

use crate::MAX_IO_SEGMENTS;

/// A logical partition of SubDevices exchanged with a single set of logical
/// datagrams per cycle.
#[derive(Debug, Clone)]
pub struct Group {
    /// Base of this group's logical address window.
    pub logical_start_address: u32,
    /// Total mapped output bytes.
    pub output_bytes: u32,
    /// Total mapped input bytes.
    pub input_bytes: u32,
    /// Offset of the group's outputs in the caller's IOmap.
    pub outputs_offset: usize,
    /// Offset of the group's inputs in the caller's IOmap.
    pub inputs_offset: usize,
    /// Number of output FMMUs programmed; each contributes 1 to a read WKC and
    /// 2 to an LRW WKC.
    pub outputs_wkc: u16,
    /// Number of input FMMUs programmed.
    pub inputs_wkc: u16,
    /// At least one SubDevice in the group has DC enabled.
    pub has_dc: bool,
    /// SubDevice whose system time register the cyclic FRMW piggyback reads.
    /// Zero means DC is disabled for this group.
    pub dc_next: u16,
    /// Accumulated EBUS current of the group's SubDevices in mA.
    pub ebus_current: u16,
    /// Number of SubDevices in this group that cannot handle LRW.
    pub block_lrw: u8,
    /// Byte count of each datagram-sized piece of the logical window.
    pub io_segments: [u32; MAX_IO_SEGMENTS],
    /// Number of used entries in `io_segments`.
    pub num_segments: usize,
    /// Index of the first segment carrying inputs.
    pub input_segment: usize,
    /// Byte offset within `io_segments[input_segment]` where outputs end and
    /// inputs begin.
    pub input_offset: u32,
    /// Toggled by the liveness monitor when the cycle WKC is deficient.
    pub check_state: bool,
}

impl Default for Group {
    fn default() -> Self {
        Self {
            logical_start_address: 0,
            output_bytes: 0,
            input_bytes: 0,
            outputs_offset: 0,
            inputs_offset: 0,
            outputs_wkc: 0,
            inputs_wkc: 0,
            has_dc: false,
            dc_next: 0,
            ebus_current: 0,
            block_lrw: 0,
            io_segments: [0; MAX_IO_SEGMENTS],
            num_segments: 0,
            input_segment: 0,
            input_offset: 0,
            check_state: false,
        }
    }
}

impl Group {
    /// The working counter a healthy cycle returns: every output FMMU counts
    /// twice (LRW write + read), every input FMMU once.
    pub fn expected_wkc(&self) -> u16 {
        self.outputs_wkc * 2 + self.inputs_wkc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_wkc_formula() {
        let group = Group {
            outputs_wkc: 3,
            inputs_wkc: 2,
            ..Group::default()
        };

        assert_eq!(group.expected_wkc(), 8);
    }
}
