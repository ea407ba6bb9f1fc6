//! A register-level SubDevice ring simulation backing the configuration and
//! service tests.
//!
//! Each simulated SubDevice owns a register file, a physical memory window for
//! its mailboxes, an EEPROM image and a tiny CoE object dictionary. The
//! simulation answers broadcast, auto increment and configured address
//! datagrams with the same working counter semantics as real hardware; logical
//! addressing is not modelled here (the process data tests drive the port with
//! purpose-built responders instead).

use crate::{
    coe::{CoeHeader, CoeService, InitSdoFlags, InitSdoHeader},
    mailbox::{MailboxHeader, MailboxType},
    pdu::PduChain,
    port::sim::SimNic,
};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Register file size per simulated SubDevice.
const REGISTER_SPACE: usize = 0x1000;

/// Physical memory (mailboxes, process data buffers) behind the registers.
const MEMORY_SPACE: usize = 0x1000;

const REG_STATION_ADDRESS: usize = 0x0010;
const REG_AL_CONTROL: usize = 0x0120;
const REG_AL_STATUS: usize = 0x0130;
const REG_EEPROM_CONTROL: usize = 0x0502;
const REG_EEPROM_DATA: usize = 0x0508;
const REG_SM1_STATUS: usize = 0x080d;
const REG_DC_SYSTEM_TIME: usize = 0x0910;

/// One simulated SubDevice.
pub(crate) struct SimSubDevice {
    registers: Vec<u8>,
    memory: Vec<u8>,
    eeprom: Vec<u8>,
    /// Object dictionary: `(index, subindex)` to value bytes. Complete-access
    /// blobs are stored under subindex `0xff`.
    pub od: BTreeMap<(u16, u8), Vec<u8>>,
    /// Objects that reject downloads with abort code `0x06010002`.
    pub read_only: std::collections::BTreeSet<(u16, u8)>,
    /// Write mailbox geometry mirrored from the EEPROM image.
    mailbox_write: (u16, u16),
    mailbox_read: (u16, u16),
}

impl SimSubDevice {
    pub fn new(eeprom: Vec<u8>) -> Self {
        Self {
            registers: vec![0; REGISTER_SPACE],
            memory: vec![0; MEMORY_SPACE],
            eeprom,
            od: BTreeMap::new(),
            read_only: std::collections::BTreeSet::new(),
            mailbox_write: (0x1000, 0x0080),
            mailbox_read: (0x1080, 0x0080),
        }
    }

    pub fn station_address(&self) -> u16 {
        u16::from_le_bytes([
            self.registers[REG_STATION_ADDRESS],
            self.registers[REG_STATION_ADDRESS + 1],
        ])
    }

    pub fn register(&self, address: usize) -> u8 {
        self.registers[address]
    }

    pub fn set_dc_time(&mut self, time: i64) {
        self.registers[REG_DC_SYSTEM_TIME..REG_DC_SYSTEM_TIME + 8]
            .copy_from_slice(&time.to_le_bytes());
    }

    fn read(&mut self, ado: u16, out: &mut [u8]) {
        let ado = usize::from(ado);

        if ado < REGISTER_SPACE {
            let end = (ado + out.len()).min(REGISTER_SPACE);

            out[..end - ado].copy_from_slice(&self.registers[ado..end]);

            return;
        }

        let offset = ado - REGISTER_SPACE;
        let end = (offset + out.len()).min(MEMORY_SPACE);

        out[..end - offset].copy_from_slice(&self.memory[offset..end]);

        // Fetching the read mailbox consumes it
        if ado == usize::from(self.mailbox_read.0) {
            self.registers[REG_SM1_STATUS] &= !0x08;
        }
    }

    fn write(&mut self, ado: u16, data: &[u8]) {
        let ado = usize::from(ado);

        if ado < REGISTER_SPACE {
            let end = (ado + data.len()).min(REGISTER_SPACE);

            self.registers[ado..end].copy_from_slice(&data[..end - ado]);

            self.register_side_effects(ado, data);

            return;
        }

        let offset = ado - REGISTER_SPACE;
        let end = (offset + data.len()).min(MEMORY_SPACE);

        self.memory[offset..end].copy_from_slice(&data[..end - offset]);

        if ado == usize::from(self.mailbox_write.0) {
            self.process_mailbox();
        }
    }

    fn register_side_effects(&mut self, ado: usize, data: &[u8]) {
        // AL control reflects straight into AL status; every transition is
        // accepted
        if ado == REG_AL_CONTROL && !data.is_empty() {
            self.registers[REG_AL_STATUS] = data[0] & 0x0f;
            self.registers[REG_AL_STATUS + 1] = 0;
            // Status code cleared
            self.registers[0x0134] = 0;
            self.registers[0x0135] = 0;
        }

        // EEPROM read command: latch the word address and serve the data
        // register immediately
        if ado == REG_EEPROM_CONTROL && data.len() >= 4 {
            let control = u16::from_le_bytes([data[0], data[1]]);
            let address = usize::from(u16::from_le_bytes([data[2], data[3]]));

            if control & 0x0100 != 0 {
                let byte_address = address * 2;

                for i in 0..4 {
                    self.registers[REG_EEPROM_DATA + i] = self
                        .eeprom
                        .get(byte_address + i)
                        .copied()
                        .unwrap_or(0xff);
                }

                // Not busy, no error
                self.registers[REG_EEPROM_CONTROL + 1] &= 0x01;
            }
        }
    }

    /// Answer a CoE SDO request sitting in the write mailbox.
    fn process_mailbox(&mut self) {
        let request = self.memory[..usize::from(self.mailbox_write.1)].to_vec();

        let Ok(header) = MailboxHeader::unpack_from_slice(&request) else {
            return;
        };

        if header.mailbox_type != MailboxType::Coe {
            return;
        }

        let Ok(coe) = CoeHeader::unpack_from_slice(&request[MailboxHeader::PACKED_LEN..]) else {
            return;
        };

        if coe.service != CoeService::SdoRequest {
            return;
        }

        let sdo_at = MailboxHeader::PACKED_LEN + CoeHeader::PACKED_LEN;

        let Ok(sdo) = InitSdoHeader::unpack_from_slice(&request[sdo_at..]) else {
            return;
        };

        let key = if sdo.flags.complete_access {
            (sdo.index, 0xff)
        } else {
            (sdo.index, sdo.sub_index)
        };

        let response = match sdo.flags.command {
            InitSdoFlags::UPLOAD_REQUEST => match self.od.get(&key) {
                Some(value) => upload_response(header.counter, sdo, value),
                None => abort_response(header.counter, sdo, 0x0602_0000),
            },
            InitSdoFlags::DOWNLOAD_REQUEST if self.read_only.contains(&key) => {
                abort_response(header.counter, sdo, 0x0601_0002)
            }
            InitSdoFlags::DOWNLOAD_REQUEST => {
                let data_at = sdo_at + InitSdoHeader::PACKED_LEN;

                let value = if sdo.flags.expedited_transfer {
                    let len = 4 - usize::from(sdo.flags.size);

                    request[data_at..data_at + len].to_vec()
                } else {
                    let len = u32::from_le_bytes(
                        request[data_at..data_at + 4].try_into().unwrap(),
                    ) as usize;

                    request[data_at + 4..data_at + 4 + len].to_vec()
                };

                self.od.insert(key, value);

                download_response(header.counter, sdo)
            }
            _ => abort_response(header.counter, sdo, 0x0504_0001),
        };

        let read_offset = usize::from(self.mailbox_read.0) - REGISTER_SPACE;

        self.memory[read_offset..read_offset + response.len()].copy_from_slice(&response);

        self.registers[REG_SM1_STATUS] |= 0x08;
    }
}

fn sdo_response_frame(counter: u8, sdo: InitSdoHeader, body: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; MailboxHeader::PACKED_LEN];

    MailboxHeader {
        length: (CoeHeader::PACKED_LEN + InitSdoHeader::PACKED_LEN + body.len()) as u16,
        address: 0,
        priority: 0,
        mailbox_type: MailboxType::Coe,
        counter,
    }
    .pack_to_slice_unchecked(&mut out[..]);

    let mut coe = [0u8; 2];
    CoeHeader {
        service: CoeService::SdoResponse,
    }
    .pack_to_slice_unchecked(&mut coe);
    out.extend_from_slice(&coe);

    let mut init = [0u8; 4];
    sdo.pack_to_slice_unchecked(&mut init);
    out.extend_from_slice(&init);

    out.extend_from_slice(body);

    out
}

fn upload_response(counter: u8, request: InitSdoHeader, value: &[u8]) -> Vec<u8> {
    if value.len() <= 4 {
        let mut body = [0u8; 4];
        body[..value.len()].copy_from_slice(value);

        sdo_response_frame(
            counter,
            InitSdoHeader {
                flags: InitSdoFlags {
                    size_indicator: true,
                    expedited_transfer: true,
                    size: 4u8 - value.len() as u8,
                    complete_access: request.flags.complete_access,
                    command: InitSdoFlags::UPLOAD_RESPONSE,
                },
                ..request
            },
            &body,
        )
    } else {
        let mut body = (value.len() as u32).to_le_bytes().to_vec();
        body.extend_from_slice(value);

        sdo_response_frame(
            counter,
            InitSdoHeader {
                flags: InitSdoFlags {
                    size_indicator: true,
                    expedited_transfer: false,
                    size: 0,
                    complete_access: request.flags.complete_access,
                    command: InitSdoFlags::UPLOAD_RESPONSE,
                },
                ..request
            },
            &body,
        )
    }
}

fn download_response(counter: u8, request: InitSdoHeader) -> Vec<u8> {
    sdo_response_frame(
        counter,
        InitSdoHeader {
            flags: InitSdoFlags {
                size_indicator: false,
                expedited_transfer: false,
                size: 0,
                complete_access: request.flags.complete_access,
                command: InitSdoFlags::DOWNLOAD_RESPONSE,
            },
            ..request
        },
        &[0u8; 4],
    )
}

fn abort_response(counter: u8, request: InitSdoHeader, code: u32) -> Vec<u8> {
    sdo_response_frame(
        counter,
        InitSdoHeader {
            flags: InitSdoFlags {
                size_indicator: false,
                expedited_transfer: false,
                size: 0,
                complete_access: false,
                command: InitSdoFlags::ABORT_REQUEST,
            },
            ..request
        },
        &code.to_le_bytes(),
    )
}

/// The shared ring simulation.
#[derive(Clone)]
pub(crate) struct BusSim {
    subdevices: Arc<Mutex<Vec<SimSubDevice>>>,
}

impl BusSim {
    pub fn new(subdevices: Vec<SimSubDevice>) -> Self {
        Self {
            subdevices: Arc::new(Mutex::new(subdevices)),
        }
    }

    /// Inspect one simulated SubDevice.
    pub fn with_subdevice<R>(&self, index: usize, f: impl FnOnce(&mut SimSubDevice) -> R) -> R {
        f(&mut self.subdevices.lock().unwrap()[index])
    }

    /// The interface the MainDevice under test talks through.
    pub fn nic(&self) -> SimNic {
        let sim = self.clone();

        SimNic::new(move |ecat: &mut [u8]| sim.process_frame(ecat))
    }

    fn process_frame(&self, ecat: &mut [u8]) {
        let pdus: Vec<_> = match PduChain::new(ecat) {
            Ok(chain) => match chain.collect::<Result<Vec<_>, _>>() {
                Ok(pdus) => pdus
                    .into_iter()
                    .map(|pdu| (pdu.header, pdu.payload, pdu.len))
                    .collect(),
                Err(_) => return,
            },
            Err(_) => return,
        };

        let mut subdevices = self.subdevices.lock().unwrap();

        for (header, payload, len) in pdus {
            let adp = u16::from_le_bytes([header.command_raw[0], header.command_raw[1]]);
            let ado = u16::from_le_bytes([header.command_raw[2], header.command_raw[3]]);

            let mut wkc = 0u16;

            match header.command_code {
                // BRD: OR all SubDevices' data together
                0x07 => {
                    let mut combined = vec![0u8; len];

                    for subdevice in subdevices.iter_mut() {
                        let mut one = vec![0u8; len];

                        subdevice.read(ado, &mut one);

                        for (c, o) in combined.iter_mut().zip(one.iter()) {
                            *c |= o;
                        }

                        wkc += 1;
                    }

                    ecat[payload..payload + len].copy_from_slice(&combined);
                }
                // BWR
                0x08 => {
                    let data = ecat[payload..payload + len].to_vec();

                    for subdevice in subdevices.iter_mut() {
                        subdevice.write(ado, &data);

                        wkc += 1;
                    }
                }
                // APRD: the SubDevice seeing ADP wrap to zero answers
                0x01 => {
                    let target = usize::from(adp.wrapping_neg());

                    if let Some(subdevice) = subdevices.get_mut(target) {
                        let mut data = vec![0u8; len];

                        subdevice.read(ado, &mut data);

                        ecat[payload..payload + len].copy_from_slice(&data);

                        wkc = 1;
                    }
                }
                // APWR
                0x02 => {
                    let target = usize::from(adp.wrapping_neg());

                    if let Some(subdevice) = subdevices.get_mut(target) {
                        let data = ecat[payload..payload + len].to_vec();

                        subdevice.write(ado, &data);

                        wkc = 1;
                    }
                }
                // FPRD
                0x04 => {
                    for subdevice in subdevices.iter_mut() {
                        if subdevice.station_address() == adp {
                            let mut data = vec![0u8; len];

                            subdevice.read(ado, &mut data);

                            ecat[payload..payload + len].copy_from_slice(&data);

                            wkc += 1;
                        }
                    }
                }
                // FPWR
                0x05 => {
                    let data = ecat[payload..payload + len].to_vec();

                    for subdevice in subdevices.iter_mut() {
                        if subdevice.station_address() == adp {
                            subdevice.write(ado, &data);

                            wkc += 1;
                        }
                    }
                }
                // FRMW: read the reference SubDevice, write everyone else
                0x0e => {
                    let mut value = vec![0u8; len];

                    for subdevice in subdevices.iter_mut() {
                        if subdevice.station_address() == adp {
                            subdevice.read(ado, &mut value);

                            wkc += 1;
                        }
                    }

                    for subdevice in subdevices.iter_mut() {
                        if subdevice.station_address() != adp {
                            subdevice.write(ado, &value);

                            wkc += 1;
                        }
                    }

                    ecat[payload..payload + len].copy_from_slice(&value);
                }
                _ => {}
            }

            ecat[payload + len..payload + len + 2].copy_from_slice(&wkc.to_le_bytes());
        }
    }
}

/// Builds SII images for simulated SubDevices.
pub(crate) struct EepromBuilder {
    image: Vec<u8>,
    categories: Vec<(u16, Vec<u8>)>,
}

impl EepromBuilder {
    pub fn new(vendor_id: u32, product_code: u32, revision: u32) -> Self {
        let mut builder = Self {
            image: vec![0; 0x80],
            categories: Vec::new(),
        };

        builder.set_long(0x0008, vendor_id);
        builder.set_long(0x000a, product_code);
        builder.set_long(0x000c, revision);

        builder
    }

    fn set_word(&mut self, word_address: usize, value: u16) {
        let at = word_address * 2;

        self.image[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn set_long(&mut self, word_address: usize, value: u32) {
        let at = word_address * 2;

        self.image[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Standard mailbox geometry and supported protocols.
    pub fn mailbox(
        mut self,
        write_offset: u16,
        write_len: u16,
        read_offset: u16,
        read_len: u16,
        protocols: u16,
    ) -> Self {
        self.set_word(0x0018, write_offset);
        self.set_word(0x0019, write_len);
        self.set_word(0x001a, read_offset);
        self.set_word(0x001b, read_len);
        self.set_word(0x001c, protocols);

        self
    }

    /// General category with capability bytes and flags.
    pub fn general(mut self, coe_details: u8, soe_channels: u8, block_lrw: bool) -> Self {
        let mut data = vec![0u8; 0x10];

        data[5] = coe_details;
        data[8] = soe_channels;

        if block_lrw {
            data[11] |= 0x02;
        }

        self.categories.push((30, data));

        self
    }

    /// Strings category holding a single name string.
    pub fn name(mut self, name: &str) -> Self {
        let mut data = vec![1u8, name.len() as u8];

        data.extend_from_slice(name.as_bytes());

        self.categories.push((10, data));

        self
    }

    /// Sync manager category; records of `(start, length, control, activate)`.
    pub fn sync_managers(mut self, records: &[(u16, u16, u8, u8)]) -> Self {
        let mut data = Vec::new();

        for (start, length, control, activate) in records {
            data.extend_from_slice(&start.to_le_bytes());
            data.extend_from_slice(&length.to_le_bytes());
            data.push(*control);
            data.push(0);
            data.push(*activate);
            data.push(0);
        }

        self.categories.push((41, data));

        self
    }

    /// FMMU usage category.
    pub fn fmmus(mut self, usage: &[u8]) -> Self {
        self.categories.push((40, usage.to_vec()));

        self
    }

    /// One PDO category (50 = TxPDO/inputs, 51 = RxPDO/outputs) holding a
    /// single PDO with `entry_bits` sized entries, assigned to `sync_manager`.
    pub fn pdo(mut self, category: u16, sync_manager: u8, entry_bits: &[u8]) -> Self {
        let mut data = Vec::new();

        // PDO descriptor: index, entry count, SM, sync unit, name, flags
        data.extend_from_slice(&0x1a00u16.to_le_bytes());
        data.push(entry_bits.len() as u8);
        data.push(sync_manager);
        data.push(0);
        data.push(0);
        data.extend_from_slice(&0u16.to_le_bytes());

        for bits in entry_bits {
            // Entry: index, subindex, name, data type, bit length, flags
            data.extend_from_slice(&0x6000u16.to_le_bytes());
            data.push(1);
            data.push(0);
            data.push(0);
            data.push(*bits);
            data.extend_from_slice(&0u16.to_le_bytes());
        }

        self.categories.push((category, data));

        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut image = self.image;

        // Category area starts at word 0x40
        image.resize(0x80, 0);

        for (category, mut data) in self.categories {
            if data.len() % 2 != 0 {
                data.push(0);
            }

            image.extend_from_slice(&category.to_le_bytes());
            image.extend_from_slice(&((data.len() / 2) as u16).to_le_bytes());
            image.extend_from_slice(&data);
        }

        image.extend_from_slice(&0xffffu16.to_le_bytes());
        image.extend_from_slice(&0xffffu16.to_le_bytes());

        image
    }
}
