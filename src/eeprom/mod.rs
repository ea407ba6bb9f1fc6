//! SII (EEPROM) access: the single-SubDevice byte cache, ownership switching,
//! and the category section parsers.

pub(crate) mod types;

use crate::{
    command::Command,
    error::{EepromError, Error},
    maindevice::MainDevice,
    register::RegisterAddress,
    LOCAL_DELAY, MAX_EEPROM_BUF, MAX_EEPROM_PDO, MAX_FMMU, MAX_NAME, MAX_SM,
};
use types::{
    CategoryType, SiiControl, SiiFmmu, SiiPdo, SiiRequest, SiiSyncManager, CATEGORY_END,
};

/// Byte granular cache over one SubDevice's EEPROM.
///
/// Enumeration reads are dominated by one SubDevice at a time, so a single
/// buffer plus a validity bitmap is kept; switching SubDevices clears the
/// bitmap but not the buffer.
#[derive(Debug)]
pub(crate) struct SiiCache {
    /// SubDevice position the cache currently holds bytes for.
    current: u16,
    buf: [u8; MAX_EEPROM_BUF],
    map: [u32; MAX_EEPROM_BUF / 32],
}

impl SiiCache {
    pub fn new() -> Self {
        Self {
            current: 0,
            buf: [0; MAX_EEPROM_BUF],
            map: [0; MAX_EEPROM_BUF / 32],
        }
    }

    /// Point the cache at a SubDevice, invalidating it if it held another.
    pub fn select(&mut self, subdevice: u16) {
        if self.current != subdevice {
            self.map = [0; MAX_EEPROM_BUF / 32];
            self.current = subdevice;
        }
    }

    /// Invalidate unconditionally, e.g. at the start of enumeration.
    pub fn clear(&mut self) {
        self.map = [0; MAX_EEPROM_BUF / 32];
        self.current = 0;
    }

    pub fn get(&self, address: u16) -> Option<u8> {
        let address = usize::from(address);

        if address >= MAX_EEPROM_BUF {
            return None;
        }

        let populated = self.map[address / 32] & (1 << (address % 32)) != 0;

        populated.then(|| self.buf[address])
    }

    /// Record bytes received from the EEPROM data register.
    pub fn insert(&mut self, byte_address: u16, data: &[u8]) {
        let start = usize::from(byte_address);

        for (i, byte) in data.iter().enumerate() {
            let address = start + i;

            if address >= MAX_EEPROM_BUF {
                break;
            }

            self.buf[address] = *byte;
            self.map[address / 32] |= 1 << (address % 32);
        }
    }
}

/// Capability bits mined from the SII general category.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct SiiGeneral {
    pub coe_details: u8,
    pub foe_details: u8,
    pub eoe_details: u8,
    pub soe_channels: u8,
    pub block_lrw: bool,
    pub ebus_current: u16,
}

impl MainDevice {
    /// Hand EEPROM control to the MainDevice for register-file access.
    pub(crate) fn eeprom_to_master(&mut self, position: u16) -> Result<(), Error> {
        let subdevice = &self.subdevices[usize::from(position)];

        if !subdevice.eeprom_pdi {
            return Ok(());
        }

        let configured_address = subdevice.configured_address;

        // Force release from the PDI, then take over
        Command::fpwr(configured_address, RegisterAddress::EepromConfig).send(
            &self.port,
            2u8,
            self.timeouts.register,
        )?;
        Command::fpwr(configured_address, RegisterAddress::EepromConfig).send(
            &self.port,
            0u8,
            self.timeouts.register,
        )?;

        self.subdevices[usize::from(position)].eeprom_pdi = false;

        Ok(())
    }

    /// Hand EEPROM control (back) to the PDI. Some SubDevices require this for
    /// the INIT to PRE-OP transition.
    pub(crate) fn eeprom_to_pdi(&mut self, position: u16) -> Result<(), Error> {
        let subdevice = &self.subdevices[usize::from(position)];

        if subdevice.eeprom_pdi {
            return Ok(());
        }

        Command::fpwr(subdevice.configured_address, RegisterAddress::EepromConfig).send(
            &self.port,
            1u8,
            self.timeouts.register,
        )?;

        self.subdevices[usize::from(position)].eeprom_pdi = true;

        Ok(())
    }

    /// Poll the EEPROM interface until it reports not-busy.
    fn eeprom_wait_not_busy(&self, configured_address: u16) -> Result<SiiControl, Error> {
        let deadline = std::time::Instant::now() + self.timeouts.eeprom;

        loop {
            let (control, wkc) = Command::fprd(configured_address, RegisterAddress::EepromControl)
                .receive::<SiiControl>(&self.port, self.timeouts.pdu)?;

            if wkc > 0 && !control.busy {
                return Ok(control);
            }

            if std::time::Instant::now() >= deadline {
                return Err(Error::Timeout);
            }

            std::thread::sleep(LOCAL_DELAY);
        }
    }

    /// One raw EEPROM read transaction against a configured address: push the
    /// word address, wait for completion, fetch 4 or 8 data bytes.
    fn read_eeprom_raw(
        &self,
        configured_address: u16,
        word_address: u16,
        eight_byte: bool,
    ) -> Result<([u8; 8], usize), Error> {
        let mut attempts = 3;

        loop {
            let status = self.eeprom_wait_not_busy(configured_address)?;

            if status.has_error() {
                // Clear latched error bits with a NOP command
                Command::fpwr(configured_address, RegisterAddress::EepromControl).send(
                    &self.port,
                    0u16,
                    self.timeouts.pdu,
                )?;
            }

            Command::fpwr(configured_address, RegisterAddress::EepromControl).send_slice(
                &self.port,
                &SiiRequest::read(word_address).as_array(),
                self.timeouts.pdu,
            )?;

            let status = self.eeprom_wait_not_busy(configured_address)?;

            if status.command_error {
                attempts -= 1;

                if attempts == 0 {
                    return Err(Error::Eeprom(EepromError::Nack));
                }

                std::thread::sleep(LOCAL_DELAY * 5);

                continue;
            }

            let mut data = [0u8; 8];
            let count = if eight_byte { 8 } else { 4 };

            Command::fprd(configured_address, RegisterAddress::EepromData).receive_slice(
                &self.port,
                &mut data[..count],
                self.timeouts.pdu,
            )?;

            return Ok((data, count));
        }
    }

    /// First half of a pipelined EEPROM read: push the read request and return
    /// without waiting for the data. Pair with
    /// [`fetch_eeprom`](Self::fetch_eeprom).
    pub(crate) fn request_eeprom(
        &mut self,
        position: u16,
        word_address: impl Into<u16>,
    ) -> Result<(), Error> {
        self.eeprom_to_master(position)?;

        let configured_address = self.subdevices[usize::from(position)].configured_address;

        self.eeprom_wait_not_busy(configured_address)?;

        Command::fpwr(configured_address, RegisterAddress::EepromControl).send_slice(
            &self.port,
            &SiiRequest::read(word_address.into()).as_array(),
            self.timeouts.pdu,
        )?;

        Ok(())
    }

    /// Second half of a pipelined EEPROM read: wait for completion and fetch
    /// the low 32 bits.
    pub(crate) fn fetch_eeprom(&mut self, position: u16) -> Result<u32, Error> {
        let configured_address = self.subdevices[usize::from(position)].configured_address;

        self.eeprom_wait_not_busy(configured_address)?;

        let (value, _wkc) = Command::fprd(configured_address, RegisterAddress::EepromData)
            .receive::<u32>(&self.port, self.timeouts.pdu)?;

        Ok(value)
    }

    /// Read one EEPROM word pair, bypassing the cache.
    pub(crate) fn read_eeprom(
        &mut self,
        position: u16,
        word_address: impl Into<u16>,
    ) -> Result<u32, Error> {
        self.eeprom_to_master(position)?;

        let configured_address = self.subdevices[usize::from(position)].configured_address;

        let (data, _count) = self.read_eeprom_raw(configured_address, word_address.into(), false)?;

        Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]))
    }

    /// Read one byte of a SubDevice's SII through the cache.
    ///
    /// Addresses beyond the cache size read as `0xff`, which terminates
    /// category walks the same way the end of the physical EEPROM does.
    pub(crate) fn sii_byte(&mut self, position: u16, address: u16) -> Result<u8, Error> {
        self.sii.select(position);

        if usize::from(address) >= MAX_EEPROM_BUF {
            return Ok(0xff);
        }

        if let Some(byte) = self.sii.get(address) {
            return Ok(byte);
        }

        self.eeprom_to_master(position)?;

        let subdevice = &self.subdevices[usize::from(position)];
        let configured_address = subdevice.configured_address;
        let eight_byte = subdevice.eeprom_8byte;

        let word_address = address >> 1;

        let (data, count) = self.read_eeprom_raw(configured_address, word_address, eight_byte)?;

        self.sii.insert(word_address << 1, &data[..count]);

        self.sii.get(address).ok_or(Error::Internal)
    }

    fn sii_word(&mut self, position: u16, address: u16) -> Result<u16, Error> {
        let lo = self.sii_byte(position, address)?;
        let hi = self.sii_byte(position, address + 1)?;

        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Walk the SII category chain looking for `category`.
    ///
    /// Returns the byte address of the category's length word, or `None` when
    /// the end marker is reached first. EEPROM ownership is restored to the
    /// PDI afterwards if the SubDevice had it.
    pub(crate) fn sii_find(
        &mut self,
        position: u16,
        category: CategoryType,
    ) -> Result<Option<u16>, Error> {
        let restore_pdi = self.subdevices[usize::from(position)].eeprom_pdi;
        let wanted = u16::from(category);

        // Category area starts at word 0x40
        let mut address = u16::from(types::SiiCoding::FirstCategory) << 1;

        let found = loop {
            let found_category = self.sii_word(position, address)?;
            address += 2;

            if found_category == wanted {
                break Some(address);
            }

            if found_category == CATEGORY_END {
                break None;
            }

            let len_words = self.sii_word(position, address)?;
            address += 2;

            address = address.saturating_add(len_words.saturating_mul(2));
        };

        if restore_pdi {
            self.eeprom_to_pdi(position)?;
        }

        Ok(found)
    }

    /// Read the general category's capability bytes.
    pub(crate) fn sii_general(&mut self, position: u16) -> Result<Option<SiiGeneral>, Error> {
        let Some(base) = self.sii_find(position, CategoryType::General)? else {
            return Ok(None);
        };

        let general = SiiGeneral {
            coe_details: self.sii_byte(position, base + types::general::COE_DETAILS)?,
            foe_details: self.sii_byte(position, base + types::general::FOE_DETAILS)?,
            eoe_details: self.sii_byte(position, base + types::general::EOE_DETAILS)?,
            soe_channels: self.sii_byte(position, base + types::general::SOE_CHANNELS)?,
            block_lrw: self.sii_byte(position, base + types::general::FLAGS)?
                & types::GENERAL_FLAG_BLOCK_LRW
                != 0,
            ebus_current: self.sii_word(position, base + types::general::EBUS_CURRENT)?,
        };

        Ok(Some(general))
    }

    /// Read one Pascal string from the strings category, 1 based, truncated to
    /// [`MAX_NAME`](crate::MAX_NAME) bytes.
    pub(crate) fn sii_string(
        &mut self,
        position: u16,
        index: u16,
    ) -> Result<heapless::String<MAX_NAME>, Error> {
        let mut out = heapless::String::new();

        let Some(base) = self.sii_find(position, CategoryType::Strings)? else {
            return Ok(out);
        };

        // Skip the length word
        let mut address = base + 2;

        let count = u16::from(self.sii_byte(position, address)?);
        address += 1;

        if index == 0 || index > count {
            return Ok(out);
        }

        for current in 1..=index {
            let len = u16::from(self.sii_byte(position, address)?);
            address += 1;

            if current < index {
                address += len;

                continue;
            }

            for i in 0..len {
                if usize::from(i) >= MAX_NAME {
                    break;
                }

                let byte = self.sii_byte(position, address + i)?;

                // SII strings are ASCII; replace anything else
                let c = if byte.is_ascii() && !byte.is_ascii_control() {
                    byte as char
                } else {
                    '?'
                };

                let _ = out.push(c);
            }
        }

        Ok(out)
    }

    /// Read all sync manager records from the SII SM category.
    pub(crate) fn sii_sync_managers(
        &mut self,
        position: u16,
    ) -> Result<heapless::Vec<SiiSyncManager, MAX_SM>, Error> {
        let mut out = heapless::Vec::new();

        let Some(base) = self.sii_find(position, CategoryType::SyncManager)? else {
            return Ok(out);
        };

        let len_words = self.sii_word(position, base)?;

        // 8 byte records
        let count = usize::from(len_words) * 2 / 8;

        for n in 0..count.min(MAX_SM) {
            let mut address = base + 2 + (n as u16) * 8;

            let mut record = SiiSyncManager {
                physical_start: self.sii_word(position, address)?,
                ..SiiSyncManager::default()
            };
            address += 2;

            record.length = self.sii_word(position, address)?;
            address += 2;

            record.control = self.sii_byte(position, address)?;
            record.status = self.sii_byte(position, address + 1)?;
            record.activate = self.sii_byte(position, address + 2)?;
            record.pdi_control = self.sii_byte(position, address + 3)?;

            let _ = out.push(record);
        }

        Ok(out)
    }

    /// Read the FMMU usage bytes from the SII FMMU category.
    pub(crate) fn sii_fmmu(&mut self, position: u16) -> Result<SiiFmmu, Error> {
        let mut out = SiiFmmu {
            count: 0,
            usage: [0xff; MAX_FMMU],
        };

        let Some(base) = self.sii_find(position, CategoryType::Fmmu)? else {
            return Ok(out);
        };

        // Length word counts words; two usage bytes per word
        out.count = self.sii_word(position, base)? * 2;

        for i in 0..usize::from(out.count).min(MAX_FMMU) {
            out.usage[i] = self.sii_byte(position, base + 2 + i as u16)?;
        }

        Ok(out)
    }

    /// Walk one SII PDO category (TxPDO = inputs, RxPDO = outputs),
    /// accumulating mapped bit sizes per sync manager.
    pub(crate) fn sii_pdo(&mut self, position: u16, inputs: bool) -> Result<SiiPdo, Error> {
        let mut out = SiiPdo::default();

        let category = if inputs {
            CategoryType::TxPdo
        } else {
            CategoryType::RxPdo
        };

        let Some(base) = self.sii_find(position, category)? else {
            return Ok(out);
        };

        let length_words = self.sii_word(position, base)?;
        let mut address = base + 2;

        let mut words_used: u32 = 1;
        let mut guard = 0;

        while words_used < u32::from(length_words) && guard < MAX_EEPROM_PDO {
            guard += 1;

            // PDO descriptor: index, entry count, sync manager, sync unit,
            // name index, flags
            address += 2;

            let entries = u16::from(self.sii_byte(position, address)?);
            address += 1;

            let sync_manager = usize::from(self.sii_byte(position, address)?);
            address += 1;

            address += 4;
            words_used += 3;

            if sync_manager < MAX_SM {
                let mut bits = 0u16;

                for _ in 0..entries {
                    // Entry: index, subindex, name index, data type, then the
                    // bit length we care about
                    address += 5;

                    bits += u16::from(self.sii_byte(position, address)?);
                    address += 3;

                    words_used += 4;
                }

                out.sm_bits[sync_manager] += bits;
                out.total_bits += u32::from(bits);

                words_used += 1;
            } else {
                // Deactivated PDO: skip its entries
                address += entries * 8;
                words_used += u32::from(entries) * 4 + 1;
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_miss_until_inserted() {
        let mut cache = SiiCache::new();

        cache.select(1);

        assert_eq!(cache.get(0x10), None);

        cache.insert(0x10, &[0xde, 0xad, 0xbe, 0xef]);

        assert_eq!(cache.get(0x10), Some(0xde));
        assert_eq!(cache.get(0x13), Some(0xef));
        assert_eq!(cache.get(0x14), None);
    }

    #[test]
    fn switching_subdevice_invalidates() {
        let mut cache = SiiCache::new();

        cache.select(1);
        cache.insert(0, &[1, 2, 3, 4]);

        cache.select(2);

        assert_eq!(cache.get(0), None);

        // Switching back does not resurrect stale data either
        cache.select(1);

        assert_eq!(cache.get(0), None);
    }

    #[test]
    fn bitmap_is_byte_granular() {
        let mut cache = SiiCache::new();

        cache.select(1);
        // 8 byte read at an odd-ish offset
        cache.insert(0x38, &[0; 8]);

        for address in 0x38..0x40 {
            assert!(cache.get(address).is_some(), "{:#06x}", address);
        }

        assert_eq!(cache.get(0x37), None);
        assert_eq!(cache.get(0x40), None);
    }

    #[test]
    fn out_of_range_insert_is_clamped() {
        let mut cache = SiiCache::new();

        cache.insert((MAX_EEPROM_BUF - 2) as u16, &[1, 2, 3, 4]);

        assert_eq!(cache.get((MAX_EEPROM_BUF - 1) as u16), Some(2));
    }
}
