//! The per-SubDevice record and the handle used to talk to one SubDevice.

use crate::{
    al_state::AlState,
    al_status_code::AlStatusCode,
    coe::CoeDetails,
    error::{Error, ErrorList},
    fmmu::Fmmu,
    mailbox::MailboxProtocols,
    maindevice::Timeouts,
    port::Port,
    sync_manager::{SyncManagerChannel, SyncManagerType},
    MAX_FMMU, MAX_NAME, MAX_SM,
};
use core::fmt;

/// Hook invoked for a SubDevice during its PRE-OP to SAFE-OP transition.
///
/// This is where an application reprograms PDO assignments over CoE before the
/// process data image is laid out.
pub type SetupHook = Box<dyn FnMut(&mut SubDeviceRef<'_>) -> Result<(), Error> + Send>;

/// Mailbox geometry and session state for one SubDevice.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MailboxConfig {
    /// Write (MainDevice to SubDevice) mailbox physical offset.
    pub write_offset: u16,
    /// Write mailbox length; zero when the SubDevice has no mailbox.
    pub write_len: u16,
    /// Read (SubDevice to MainDevice) mailbox physical offset.
    pub read_offset: u16,
    /// Read mailbox length.
    pub read_len: u16,
    /// Protocols the SubDevice reports supporting.
    pub protocols: MailboxProtocols,
    /// Rolling session counter, `1..=7`. Zero before first use.
    pub counter: u8,
}

impl MailboxConfig {
    /// Whether this SubDevice has a mailbox at all.
    pub fn has_mailbox(&self) -> bool {
        self.write_len > 0
    }

    /// Advance the session counter: `1, 2, ... 7, 1, ...`.
    pub(crate) fn next_counter(&mut self) -> u8 {
        self.counter = if self.counter >= 7 {
            1
        } else {
            self.counter + 1
        };

        self.counter
    }
}

/// Physical topology view of one SubDevice, decoded from its DL status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    /// Number of open ports; doubles as the topology class (1 = end of line,
    /// 2 = pass-through, 3 = split, 4 = cross).
    pub link_count: u8,
    /// Bitmap of open ports.
    pub active_ports: u8,
    /// Position of the upstream SubDevice; 0 means attached directly to the
    /// MainDevice.
    pub parent: u16,
    /// Port of the parent this SubDevice hangs off.
    pub entry_port: u8,
    /// Per-port receive time deltas captured during DC measurement.
    pub port_receive_times: [u32; 4],
    /// Cumulative propagation delay from the MainDevice in nanoseconds.
    pub propagation_delay: i32,
}

/// One discovered SubDevice, plus record 0 which aggregates the whole network
/// from the MainDevice's point of view.
pub struct SubDevice {
    /// Last read AL state.
    pub state: AlState,
    /// AL error flag from the last status read.
    pub al_error: bool,
    /// AL status code from the last status read.
    pub al_status_code: AlStatusCode,
    /// Configured station address.
    pub configured_address: u16,
    /// Alias address from the SII.
    pub alias_address: u16,
    /// Vendor ID from the SII.
    pub vendor_id: u32,
    /// Product code from the SII.
    pub product_code: u32,
    /// Revision from the SII.
    pub revision: u32,
    /// PDI interface type.
    pub interface_type: u16,
    /// Output (MainDevice write) size in bits.
    pub output_bits: u32,
    /// Output size in bytes, zero for bit-oriented SubDevices.
    pub output_bytes: u32,
    /// Input (MainDevice read) size in bits.
    pub input_bits: u32,
    /// Input size in bytes, zero for bit-oriented SubDevices.
    pub input_bytes: u32,
    /// Offset of this SubDevice's output slice in the caller's IOmap.
    pub outputs_offset: usize,
    /// First output bit within the byte at `outputs_offset`.
    pub output_start_bit: u8,
    /// Offset of this SubDevice's input slice in the caller's IOmap.
    pub inputs_offset: usize,
    /// First input bit within the byte at `inputs_offset`.
    pub input_start_bit: u8,
    /// Sync manager channel images programmed into the SubDevice.
    pub sync_managers: [SyncManagerChannel; MAX_SM],
    /// Role of each sync manager channel.
    pub sm_types: [SyncManagerType; MAX_SM],
    /// FMMU entity images programmed into the SubDevice.
    pub fmmus: [Fmmu; MAX_FMMU],
    /// FMMU role bytes from the SII FMMU section.
    pub fmmu_functions: [u8; MAX_FMMU],
    /// First FMMU entity not yet used by the IOmap layout.
    pub first_unused_fmmu: u8,
    /// Mailbox geometry and session counter.
    pub mailbox: MailboxConfig,
    /// SubDevice supports distributed clocks.
    pub has_dc: bool,
    /// Next SubDevice in the DC measurement chain.
    pub dc_next: u16,
    /// Previous SubDevice in the DC measurement chain.
    pub dc_previous: u16,
    /// Port/parent topology view.
    pub topology: Topology,
    /// SubDevice supports 8 byte EEPROM reads.
    pub eeprom_8byte: bool,
    /// EEPROM is currently assigned to the PDI rather than the MainDevice.
    pub eeprom_pdi: bool,
    /// CoE capability bits from the SII general section.
    pub coe_details: CoeDetails,
    /// FoE capability byte from the SII general section.
    pub foe_details: u8,
    /// EoE capability byte from the SII general section.
    pub eoe_details: u8,
    /// SoE capability byte from the SII general section.
    pub soe_details: u8,
    /// EBUS current consumption in mA; record 0 accumulates the total.
    pub ebus_current: u16,
    /// This SubDevice cannot handle LRW; record 0 counts affected devices.
    pub block_lrw: u8,
    /// Group this SubDevice is mapped into.
    pub group: u8,
    /// Set by the liveness monitor when the SubDevice stops answering.
    pub is_lost: bool,
    /// PRE-OP to SAFE-OP configuration hook.
    pub setup_hook: Option<SetupHook>,
    /// Readable name from the SII strings section.
    pub name: heapless::String<MAX_NAME>,
}

impl Default for SubDevice {
    fn default() -> Self {
        Self {
            state: AlState::None,
            al_error: false,
            al_status_code: AlStatusCode::NoError,
            configured_address: 0,
            alias_address: 0,
            vendor_id: 0,
            product_code: 0,
            revision: 0,
            interface_type: 0,
            output_bits: 0,
            output_bytes: 0,
            input_bits: 0,
            input_bytes: 0,
            outputs_offset: 0,
            output_start_bit: 0,
            inputs_offset: 0,
            input_start_bit: 0,
            sync_managers: Default::default(),
            sm_types: Default::default(),
            fmmus: Default::default(),
            fmmu_functions: [0xff; MAX_FMMU],
            first_unused_fmmu: 0,
            mailbox: MailboxConfig::default(),
            has_dc: false,
            dc_next: 0,
            dc_previous: 0,
            topology: Topology::default(),
            eeprom_8byte: false,
            eeprom_pdi: false,
            coe_details: CoeDetails::empty(),
            foe_details: 0,
            eoe_details: 0,
            soe_details: 0,
            ebus_current: 0,
            block_lrw: 0,
            group: 0,
            is_lost: false,
            setup_hook: None,
            name: heapless::String::new(),
        }
    }
}

impl fmt::Debug for SubDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubDevice")
            .field("name", &self.name.as_str())
            .field(
                "configured_address",
                &format_args!("{:#06x}", self.configured_address),
            )
            .field("vendor_id", &format_args!("{:#010x}", self.vendor_id))
            .field("product_code", &format_args!("{:#010x}", self.product_code))
            .field("state", &self.state)
            .field("output_bits", &self.output_bits)
            .field("input_bits", &self.input_bits)
            .finish_non_exhaustive()
    }
}

impl SubDevice {
    /// Range of this SubDevice's outputs within the caller's IOmap.
    pub fn outputs_range(&self) -> core::ops::Range<usize> {
        let len = self.output_bytes.max(u32::from(self.output_bits > 0)) as usize;

        self.outputs_offset..self.outputs_offset + len
    }

    /// Range of this SubDevice's inputs within the caller's IOmap.
    pub fn inputs_range(&self) -> core::ops::Range<usize> {
        let len = self.input_bytes.max(u32::from(self.input_bits > 0)) as usize;

        self.inputs_offset..self.inputs_offset + len
    }

    /// Identity key used for SII and mapping reuse between identical devices.
    pub(crate) fn identity(&self) -> (u32, u32, u32) {
        (self.vendor_id, self.product_code, self.revision)
    }
}

/// A borrowed handle to one SubDevice plus the transport needed to talk to it.
///
/// Mailbox, CoE and SoE services are implemented on this type in their
/// respective modules.
pub struct SubDeviceRef<'a> {
    pub(crate) port: &'a Port,
    pub(crate) timeouts: &'a Timeouts,
    pub(crate) errors: &'a ErrorList,
    /// Position of the SubDevice on the ring, 1 based.
    pub(crate) position: u16,
    pub(crate) subdevice: &'a mut SubDevice,
}

impl<'a> SubDeviceRef<'a> {
    pub(crate) fn new(
        port: &'a Port,
        timeouts: &'a Timeouts,
        errors: &'a ErrorList,
        position: u16,
        subdevice: &'a mut SubDevice,
    ) -> Self {
        Self {
            port,
            timeouts,
            errors,
            position,
            subdevice,
        }
    }

    /// Ring position of this SubDevice, 1 based.
    pub fn position(&self) -> u16 {
        self.position
    }

    /// The SubDevice record.
    pub fn subdevice(&mut self) -> &mut SubDevice {
        self.subdevice
    }

    /// Configured station address.
    pub fn configured_address(&self) -> u16 {
        self.subdevice.configured_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_counter_wraps_to_one() {
        let mut mailbox = MailboxConfig::default();

        let seen: Vec<u8> = (0..9).map(|_| mailbox.next_counter()).collect();

        assert_eq!(seen, [1, 2, 3, 4, 5, 6, 7, 1, 2]);
    }

    #[test]
    fn io_ranges_cover_bit_oriented_devices() {
        let subdevice = SubDevice {
            input_bits: 2,
            input_bytes: 0,
            inputs_offset: 9,
            ..SubDevice::default()
        };

        // A device with less than a byte of inputs still occupies one byte of
        // the IOmap view
        assert_eq!(subdevice.inputs_range(), 9..10);
    }
}
