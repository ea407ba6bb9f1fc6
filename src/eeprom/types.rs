//! SII (SubDevice Information Interface) wire types and layout constants.

/// EEPROM control/status register (`0x0502`) contents.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 2)]
pub(crate) struct SiiControl {
    /// ECAT write access enabled.
    #[wire(bits = 1, post_skip = 5)]
    pub write_access: bool,
    /// Device supports 8 byte reads of the data register.
    #[wire(bits = 1)]
    pub read_size8: bool,
    /// Two byte addressing supported.
    #[wire(bits = 1)]
    pub address_16bit: bool,
    /// Read request/acknowledge.
    #[wire(bits = 1)]
    pub read: bool,
    /// Write request/acknowledge.
    #[wire(bits = 1)]
    pub write: bool,
    /// Reload request/acknowledge.
    #[wire(bits = 1)]
    pub reload: bool,
    /// Checksum error latched.
    #[wire(bits = 1)]
    pub checksum_error: bool,
    /// Device info error latched.
    #[wire(bits = 1)]
    pub device_info_error: bool,
    /// The last command was not acknowledged.
    #[wire(bits = 1)]
    pub command_error: bool,
    /// Write in error.
    #[wire(bits = 1)]
    pub write_error: bool,
    /// Interface busy.
    #[wire(bits = 1)]
    pub busy: bool,
}

impl SiiControl {
    pub fn has_error(&self) -> bool {
        self.checksum_error || self.device_info_error || self.command_error || self.write_error
    }
}

/// An EEPROM read request as written to registers `0x0502..0x0508` in one go:
/// control word, then the word address.
#[derive(Debug, Copy, Clone)]
pub(crate) struct SiiRequest {
    pub control: u16,
    pub address: u16,
}

/// Read command bit in the control word.
const SII_READ_COMMAND: u16 = 0x0100;

impl SiiRequest {
    pub fn read(address: u16) -> Self {
        Self {
            control: SII_READ_COMMAND,
            address,
        }
    }

    pub fn as_array(&self) -> [u8; 6] {
        let mut buf = [0u8; 6];

        buf[0..2].copy_from_slice(&self.control.to_le_bytes());
        buf[2..4].copy_from_slice(&self.address.to_le_bytes());

        buf
    }
}

/// Fixed SII word addresses, defined in ETG1000.6 Table 16.
#[derive(Debug, Copy, Clone)]
#[repr(u16)]
pub(crate) enum SiiCoding {
    /// PDI control word.
    PdiControl = 0x0000,
    /// Configured station alias.
    ConfiguredStationAlias = 0x0004,
    /// Vendor ID, `u32`.
    VendorId = 0x0008,
    /// Product code, `u32`.
    ProductCode = 0x000a,
    /// Revision number, `u32`.
    RevisionNumber = 0x000c,
    /// Standard receive (write) mailbox offset and size.
    StandardReceiveMailbox = 0x0018,
    /// Standard send (read) mailbox offset and size.
    StandardSendMailbox = 0x001a,
    /// Supported mailbox protocols bitmask.
    MailboxProtocol = 0x001c,
    /// First category header.
    FirstCategory = 0x0040,
}

impl From<SiiCoding> for u16 {
    fn from(value: SiiCoding) -> Self {
        value as u16
    }
}

/// SII category types, ETG1000.6 Table 19.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum CategoryType {
    Strings = 10,
    General = 30,
    Fmmu = 40,
    SyncManager = 41,
    /// Inputs: PDOs the SubDevice transmits.
    TxPdo = 50,
    /// Outputs: PDOs the SubDevice receives.
    RxPdo = 51,
}

impl From<CategoryType> for u16 {
    fn from(value: CategoryType) -> Self {
        value as u16
    }
}

/// Category marker that ends the SII.
pub(crate) const CATEGORY_END: u16 = 0xffff;

/// Byte offsets of the fields this MainDevice mines from the general category,
/// relative to the category's length word.
pub(crate) mod general {
    /// CoE details byte.
    pub const COE_DETAILS: u16 = 0x07;
    /// FoE details byte.
    pub const FOE_DETAILS: u16 = 0x08;
    /// EoE details byte.
    pub const EOE_DETAILS: u16 = 0x09;
    /// SoE channels byte.
    pub const SOE_CHANNELS: u16 = 0x0a;
    /// Flags byte; bit 1 blocks LRW use.
    pub const FLAGS: u16 = 0x0d;
    /// EBUS current, two bytes little endian.
    pub const EBUS_CURRENT: u16 = 0x0e;
}

/// Flag bit in [`general::FLAGS`]: device cannot be addressed with LRW.
pub(crate) const GENERAL_FLAG_BLOCK_LRW: u8 = 0x02;

/// One sync manager record from the SII SM category.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SiiSyncManager {
    pub physical_start: u16,
    pub length: u16,
    pub control: u8,
    pub status: u8,
    pub activate: u8,
    pub pdi_control: u8,
}

impl SiiSyncManager {
    /// Combined flag word in the same shape the on-chip channel uses.
    pub fn flags_word(&self) -> u32 {
        u32::from(self.control) | u32::from(self.activate) << 16
    }
}

/// FMMU usage bytes from the SII FMMU category. `0xff` marks an unused entity.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SiiFmmu {
    pub count: u16,
    pub usage: [u8; crate::MAX_FMMU],
}

/// Accumulated result of walking one SII PDO category.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct SiiPdo {
    /// Total mapped size in bits.
    pub total_bits: u32,
    /// Mapped bits per sync manager.
    pub sm_bits: [u16; crate::MAX_SM],
}
