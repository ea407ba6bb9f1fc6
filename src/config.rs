//! Network configuration: discovery, addressing, SII mining, mailbox/SM/FMMU
//! programming, IOmap layout and SubDevice recovery.

use crate::{
    al_state::{AlControl, AlState},
    command::Command,
    dl_status::DlStatus,
    eeprom::types::SiiCoding,
    error::{Error, ErrorList},
    mailbox::MailboxProtocols,
    maindevice::{AlStatusAll, MainDevice, Timeouts},
    port::Port,
    register::RegisterAddress,
    subdevice::{SubDevice, SubDeviceRef},
    sync_manager::SyncManagerType,
    DEFAULT_MAILBOX_SM0, DEFAULT_MAILBOX_SM1, FIRST_DC_DATAGRAM, MAX_FMMU, MAX_GROUPS,
    MAX_IO_SEGMENTS, MAX_LRW_DATA, MAX_MAPPING_WORKERS, MAX_SM, MAX_SUBDEVICES, NODE_OFFSET,
    SM_ENABLE_MASK, TEMP_NODE,
};
use core::fmt::Write as _;
use core::time::Duration;
use ethercrab_wire::EtherCrabWireWrite;

/// ESC feature flag bit: DC supported.
const SUPPORT_DC: u16 = 0x0004;

impl MainDevice {
    /// Enumerate and configure every SubDevice on the network up to PRE-OP.
    ///
    /// Returns the number of SubDevices found; zero is a successful result
    /// with empty tables.
    pub fn config_init(&mut self) -> Result<usize, Error> {
        self.init_tables();

        let count = self.detect_subdevices()?;

        if count == 0 {
            return Ok(0);
        }

        self.set_subdevices_to_default()?;

        // First pass: addressing, EEPROM geometry, vendor id request
        for position in 1..=count as u16 {
            let (interface_type, _wkc) = Command::aprd(position - 1, RegisterAddress::PdiControl)
                .receive::<u16>(&self.port, self.timeouts.register)?;

            self.subdevices[usize::from(position)].interface_type = interface_type;

            Command::apwr(position - 1, RegisterAddress::ConfiguredStationAddress).send(
                &self.port,
                NODE_OFFSET.wrapping_add(position),
                self.timeouts.register,
            )?;

            // Only the first SubDevice drops non-EtherCAT frames
            let dl_control: u16 = if position == 1 { 1 } else { 0 };

            Command::apwr(position - 1, RegisterAddress::DlControl).send(
                &self.port,
                dl_control,
                self.timeouts.register,
            )?;

            let (configured_address, _wkc) =
                Command::aprd(position - 1, RegisterAddress::ConfiguredStationAddress)
                    .receive::<u16>(&self.port, self.timeouts.register)?;

            let (alias, _wkc) =
                Command::fprd(configured_address, RegisterAddress::ConfiguredStationAlias)
                    .receive::<u16>(&self.port, self.timeouts.register)?;

            let (eeprom_status, _wkc) =
                Command::fprd(configured_address, RegisterAddress::EepromControl)
                    .receive::<crate::eeprom::types::SiiControl>(
                        &self.port,
                        self.timeouts.register,
                    )?;

            {
                let subdevice = &mut self.subdevices[usize::from(position)];

                subdevice.configured_address = configured_address;
                subdevice.alias_address = alias;
                subdevice.eeprom_8byte = eeprom_status.read_size8;
            }

            self.request_eeprom(position, SiiCoding::VendorId)?;
        }

        // Interleaved EEPROM passes pipeline the EEPROM latency across
        // SubDevices: fetch the previous request, push the next
        for position in 1..=count as u16 {
            let vendor = self.fetch_eeprom(position)?;
            self.subdevices[usize::from(position)].vendor_id = vendor;

            self.request_eeprom(position, SiiCoding::ProductCode)?;
        }

        for position in 1..=count as u16 {
            let product = self.fetch_eeprom(position)?;
            self.subdevices[usize::from(position)].product_code = product;

            self.request_eeprom(position, SiiCoding::RevisionNumber)?;
        }

        for position in 1..=count as u16 {
            let revision = self.fetch_eeprom(position)?;
            self.subdevices[usize::from(position)].revision = revision;

            self.request_eeprom(position, SiiCoding::StandardReceiveMailbox)?;
        }

        for position in 1..=count as u16 {
            let mailbox = self.fetch_eeprom(position)?;

            let subdevice = &mut self.subdevices[usize::from(position)];

            subdevice.mailbox.write_offset = mailbox as u16;
            subdevice.mailbox.write_len = (mailbox >> 16) as u16;

            if subdevice.mailbox.write_len > 0 {
                self.request_eeprom(position, SiiCoding::StandardSendMailbox)?;
            }
        }

        for position in 1..=count as u16 {
            if self.subdevices[usize::from(position)].mailbox.write_len > 0 {
                let mailbox = self.fetch_eeprom(position)?;

                let subdevice = &mut self.subdevices[usize::from(position)];

                subdevice.mailbox.read_offset = mailbox as u16;
                subdevice.mailbox.read_len = (mailbox >> 16) as u16;

                if subdevice.mailbox.read_len == 0 {
                    subdevice.mailbox.read_len = subdevice.mailbox.write_len;
                }

                self.request_eeprom(position, SiiCoding::MailboxProtocol)?;
            }

            self.configure_one_subdevice(position)?;
        }

        Ok(count)
    }

    /// Per-SubDevice tail of `config_init`: topology, parent inference, INIT
    /// check, mailbox SM programming and the PRE-OP request.
    fn configure_one_subdevice(&mut self, position: u16) -> Result<(), Error> {
        let configured_address = self.subdevices[usize::from(position)].configured_address;

        let (support, _wkc) = Command::fprd(configured_address, RegisterAddress::SupportFlags)
            .receive::<u16>(&self.port, self.timeouts.register)?;

        let (dl_status, _wkc) = Command::fprd(configured_address, RegisterAddress::DlStatus)
            .receive::<DlStatus>(&self.port, self.timeouts.register)?;

        let (port_descriptors, _wkc) =
            Command::fprd(configured_address, RegisterAddress::PortDescriptors)
                .receive::<u16>(&self.port, self.timeouts.register)?;

        {
            let subdevice = &mut self.subdevices[usize::from(position)];

            subdevice.has_dc = support & SUPPORT_DC != 0;

            let (link_count, active_ports) = dl_status.active_ports();

            subdevice.topology.link_count = link_count;
            subdevice.topology.active_ports = active_ports;
            subdevice.topology.entry_port = port_descriptors as u8;
        }

        self.subdevices[usize::from(position)].topology.parent =
            infer_parent(&self.subdevices, position);

        self.state_check(position, AlState::Init, self.timeouts.state_transition)?;

        // Default mailbox sync managers
        if self.subdevices[usize::from(position)].mailbox.has_mailbox() {
            {
                let subdevice = &mut self.subdevices[usize::from(position)];

                subdevice.sm_types[0] = SyncManagerType::MailboxWrite;
                subdevice.sm_types[1] = SyncManagerType::MailboxRead;
                subdevice.sm_types[2] = SyncManagerType::Outputs;
                subdevice.sm_types[3] = SyncManagerType::Inputs;

                subdevice.sync_managers[0].physical_start_address =
                    subdevice.mailbox.write_offset;
                subdevice.sync_managers[0].length_bytes = subdevice.mailbox.write_len;
                subdevice.sync_managers[0].set_flags_word(DEFAULT_MAILBOX_SM0);

                subdevice.sync_managers[1].physical_start_address = subdevice.mailbox.read_offset;
                subdevice.sync_managers[1].length_bytes = subdevice.mailbox.read_len;
                subdevice.sync_managers[1].set_flags_word(DEFAULT_MAILBOX_SM1);
            }

            let protocols = self.fetch_eeprom(position)?;

            self.subdevices[usize::from(position)].mailbox.protocols =
                MailboxProtocols::from_bits_truncate(protocols as u16);
        }

        // Resolve SII derived configuration, reusing an identical earlier
        // device's where possible (SII content is constant per device model)
        if !self.lookup_prev_sii(position) {
            self.parse_sii_details(position)?;
        }

        self.repair_mailbox_sms(position);

        if self.subdevices[usize::from(position)].mailbox.has_mailbox() {
            // Both mailbox SMs in one datagram; some ESCs are picky about
            // programming them separately
            let mut raw = [0u8; 16];

            let subdevice = &self.subdevices[usize::from(position)];

            subdevice.sync_managers[0].pack_to_slice_unchecked(&mut raw[0..8]);
            subdevice.sync_managers[1].pack_to_slice_unchecked(&mut raw[8..16]);

            Command::fpwr(configured_address, RegisterAddress::sync_manager(0)).send_slice(
                &self.port,
                &raw,
                self.timeouts.register,
            )?;
        }

        // Some SubDevices need the EEPROM handed to the PDI for INIT -> PRE-OP
        self.eeprom_to_pdi(position)?;

        Command::fpwr(configured_address, RegisterAddress::AlControl).send(
            &self.port,
            AlControl::acknowledging(AlState::PreOp),
            self.timeouts.register,
        )?;

        Ok(())
    }

    fn init_tables(&mut self) {
        self.subdevices.clear();
        self.subdevices.push(SubDevice::default());

        for (i, group) in self.groups.iter_mut().enumerate() {
            *group = crate::group::Group {
                logical_start_address: (i as u32) << 16,
                ..crate::group::Group::default()
            };
        }

        self.sii.clear();
    }

    /// Reset the network and count SubDevices with a broadcast read.
    fn detect_subdevices(&mut self) -> Result<usize, Error> {
        // Clear the alias enable first, then force INIT twice; old ESC
        // revisions miss the first write while still in a strange state
        Command::bwr(RegisterAddress::DlAlias).send(&self.port, 0u8, self.timeouts.register)?;

        for _ in 0..2 {
            Command::bwr(RegisterAddress::AlControl).send(
                &self.port,
                AlControl::reset(),
                self.timeouts.register,
            )?;
        }

        let wkc = Command::brd(RegisterAddress::Type).receive_wkc(
            &self.port,
            2,
            self.timeouts.discovery,
        )?;

        let count = usize::from(wkc);

        if count >= MAX_SUBDEVICES {
            log::error!(
                "Too many SubDevices on network: {} found, max is {}",
                count,
                MAX_SUBDEVICES - 1
            );

            return Err(Error::TooManySubDevices);
        }

        self.subdevices
            .resize_with(count + 1, SubDevice::default);

        log::debug!("Discovered {} SubDevices", count);

        Ok(count)
    }

    /// Broadcast-reset the registers every SubDevice must start from.
    fn set_subdevices_to_default(&mut self) -> Result<(), Error> {
        let zeros = [0u8; 64];
        let timeout = self.timeouts.register;

        // Deactivate manual port loop control
        Command::bwr(RegisterAddress::DlPort).send(&self.port, 0u8, timeout)?;
        // IRQ mask
        Command::bwr(RegisterAddress::IrqMask).send(&self.port, 0x0004u16, timeout)?;
        // CRC counters
        Command::bwr(RegisterAddress::RxErrorCounter).send_slice(&self.port, &zeros[..8], timeout)?;
        // FMMUs
        Command::bwr(RegisterAddress::Fmmu0).send_slice(&self.port, &zeros[..48], timeout)?;
        // Sync managers
        Command::bwr(RegisterAddress::Sm0).send_slice(&self.port, &zeros[..32], timeout)?;
        // DC sync activation
        Command::bwr(RegisterAddress::DcSyncActive).send(&self.port, 0u8, timeout)?;
        // DC system time and offset
        Command::bwr(RegisterAddress::DcSystemTime).send_slice(&self.port, &zeros[..4], timeout)?;
        // DC speed counter start
        Command::bwr(RegisterAddress::DcSpeedStart).send(&self.port, 0x1000u16, timeout)?;
        // DC time filter
        Command::bwr(RegisterAddress::DcTimeFilter).send(&self.port, 0x0c00u16, timeout)?;
        // Alias enable off
        Command::bwr(RegisterAddress::DlAlias).send(&self.port, 0u8, timeout)?;
        // Reset to INIT with acknowledge
        Command::bwr(RegisterAddress::AlControl).send(
            &self.port,
            AlControl::reset(),
            timeout,
        )?;
        // Force EEPROM from PDI, then claim it for the MainDevice
        Command::bwr(RegisterAddress::EepromConfig).send(&self.port, 2u8, timeout)?;
        Command::bwr(RegisterAddress::EepromConfig).send(&self.port, 0u8, timeout)?;

        Ok(())
    }

    /// Copy SII-derived configuration from an earlier SubDevice with identical
    /// identity. Safe because SII content is constant for a device model.
    fn lookup_prev_sii(&mut self, position: u16) -> bool {
        let position = usize::from(position);

        if position <= 1 {
            return false;
        }

        let identity = self.subdevices[position].identity();

        let Some(source) = self.subdevices[1..position]
            .iter()
            .position(|other| other.identity() == identity)
            .map(|i| i + 1)
        else {
            return false;
        };

        log::debug!("Copy SII config for SubDevice {} from {}", position, source);

        let (before, after) = self.subdevices.split_at_mut(position);
        let (source, target) = (&before[source], &mut after[0]);

        target.coe_details = source.coe_details;
        target.foe_details = source.foe_details;
        target.eoe_details = source.eoe_details;
        target.soe_details = source.soe_details;
        target.ebus_current = source.ebus_current;
        target.name = source.name.clone();
        target.fmmu_functions = source.fmmu_functions;

        for sm in 0..MAX_SM {
            target.sync_managers[sm].physical_start_address =
                source.sync_managers[sm].physical_start_address;
            target.sync_managers[sm].length_bytes = source.sync_managers[sm].length_bytes;
            target
                .sync_managers[sm]
                .set_flags_word(source.sync_managers[sm].flags_word());
        }

        let block_lrw = source.block_lrw > 0;

        if block_lrw {
            target.block_lrw = 1;
        }

        let ebus = target.ebus_current;

        let aggregate = &mut self.subdevices[0];

        if block_lrw {
            aggregate.block_lrw += 1;
        }

        aggregate.ebus_current += ebus;

        true
    }

    /// Mine the SII category sections of one SubDevice.
    fn parse_sii_details(&mut self, position: u16) -> Result<(), Error> {
        if let Some(general) = self.sii_general(position)? {
            let subdevice = &mut self.subdevices[usize::from(position)];

            subdevice.coe_details =
                crate::coe::CoeDetails::from_bits_truncate(general.coe_details);
            subdevice.foe_details = general.foe_details;
            subdevice.eoe_details = general.eoe_details;
            subdevice.soe_details = general.soe_channels;
            subdevice.ebus_current = general.ebus_current;

            if general.block_lrw {
                subdevice.block_lrw = 1;
                self.subdevices[0].block_lrw += 1;
            }

            let ebus = general.ebus_current;
            self.subdevices[0].ebus_current += ebus;
        }

        let name = self.sii_string(position, 1)?;

        {
            let subdevice = &mut self.subdevices[usize::from(position)];

            if name.is_empty() {
                let mut fallback = heapless::String::new();

                let _ = write!(
                    fallback,
                    "? M:{:08x} I:{:08x}",
                    subdevice.vendor_id, subdevice.product_code
                );

                subdevice.name = fallback;
            } else {
                subdevice.name = name;
            }
        }

        let sii_sms = self.sii_sync_managers(position)?;

        {
            let subdevice = &mut self.subdevices[usize::from(position)];

            for (i, sii_sm) in sii_sms.iter().enumerate() {
                subdevice.sync_managers[i].physical_start_address = sii_sm.physical_start;
                subdevice.sync_managers[i].length_bytes = sii_sm.length;
                subdevice.sync_managers[i].set_flags_word(sii_sm.flags_word());
            }
        }

        let fmmu = self.sii_fmmu(position)?;

        {
            let subdevice = &mut self.subdevices[usize::from(position)];

            for (i, usage) in fmmu.usage.iter().enumerate() {
                if *usage != 0xff {
                    subdevice.fmmu_functions[i] = *usage;
                }
            }
        }

        Ok(())
    }

    /// Fall back to known-good mailbox sync manager defaults when the SII
    /// carried none.
    fn repair_mailbox_sms(&mut self, position: u16) {
        let subdevice = &mut self.subdevices[usize::from(position)];

        if !subdevice.mailbox.has_mailbox() {
            return;
        }

        if subdevice.sync_managers[0].physical_start_address == 0 {
            log::warn!(
                "SubDevice {} has no proper mailbox configuration, trying default",
                position
            );

            subdevice.sync_managers[0].physical_start_address = 0x1000;
            subdevice.sync_managers[0].length_bytes = 0x0080;
            subdevice.sync_managers[0].set_flags_word(DEFAULT_MAILBOX_SM0);
            subdevice.sm_types[0] = SyncManagerType::MailboxWrite;
        }

        if subdevice.sync_managers[1].physical_start_address == 0 {
            log::warn!(
                "SubDevice {} has no proper mailbox out configuration, trying default",
                position
            );

            subdevice.sync_managers[1].physical_start_address = 0x1080;
            subdevice.sync_managers[1].length_bytes = 0x0080;
            subdevice.sync_managers[1].set_flags_word(DEFAULT_MAILBOX_SM1);
            subdevice.sm_types[1] = SyncManagerType::MailboxRead;
        }
    }

    /// Map all PDOs of one group into the IOmap with outputs first, inputs
    /// after (sequential layout), program FMMUs and request SAFE-OP.
    ///
    /// Returns the IOmap bytes used.
    pub fn config_map_group(&mut self, iomap: &mut [u8], group: u8) -> Result<usize, Error> {
        if self.subdevice_count() == 0 || usize::from(group) >= MAX_GROUPS {
            return Ok(0);
        }

        let logical_start = self.groups[usize::from(group)].logical_start_address;

        let mut log_addr = logical_start;
        let mut prev_log_addr = log_addr;
        let mut bit_pos = 0u8;

        let mut segments = SegmentAccumulator::default();

        self.groups[usize::from(group)].outputs_wkc = 0;
        self.groups[usize::from(group)].inputs_wkc = 0;

        self.find_mappings(group)?;

        // Output mapping, walking a bit cursor through the logical window
        for position in 1..=self.subdevice_count() as u16 {
            if !self.in_group(position, group) || self.subdevices[usize::from(position)].output_bits == 0
            {
                continue;
            }

            self.create_output_mappings(position, group, logical_start, &mut log_addr, &mut bit_pos)?;

            segments.advance(log_addr, &mut prev_log_addr);
        }

        if bit_pos > 0 {
            log_addr += 1;
            bit_pos = 0;

            segments.advance(log_addr, &mut prev_log_addr);
        }

        let output_bytes = log_addr - logical_start;

        {
            let group_record = &mut self.groups[usize::from(group)];

            group_record.outputs_offset = 0;
            group_record.output_bytes = output_bytes;
            group_record.input_segment = segments.current;
            group_record.input_offset = segments.size;
        }

        // Input mapping starts at the byte past the outputs
        for position in 1..=self.subdevice_count() as u16 {
            if self.in_group(position, group) {
                if self.subdevices[usize::from(position)].input_bits > 0 {
                    self.create_input_mappings(
                        position,
                        group,
                        logical_start,
                        &mut log_addr,
                        &mut bit_pos,
                    )?;

                    segments.advance(log_addr, &mut prev_log_addr);
                }

                self.eeprom_to_pdi(position)?;

                let configured_address = self.subdevices[usize::from(position)].configured_address;

                Command::fpwr(configured_address, RegisterAddress::AlControl).send(
                    &self.port,
                    AlControl::new(AlState::SafeOp),
                    self.timeouts.register,
                )?;

                let block_lrw = self.subdevices[usize::from(position)].block_lrw;
                let ebus = self.subdevices[usize::from(position)].ebus_current;

                let group_record = &mut self.groups[usize::from(group)];

                group_record.block_lrw += block_lrw;
                group_record.ebus_current += ebus;
            }
        }

        if bit_pos > 0 {
            log_addr += 1;

            segments.advance(log_addr, &mut prev_log_addr);
        }

        let total = log_addr - logical_start;

        {
            let group_record = &mut self.groups[usize::from(group)];

            segments.finish(group_record);

            group_record.inputs_offset = output_bytes as usize;
            group_record.input_bytes = total - output_bytes;
        }

        self.finish_group_map(group)?;

        if iomap.len() < total as usize {
            return Err(Error::Capacity(crate::error::Item::Group));
        }

        log::debug!("Group {} IOmap size {}", group, total);

        Ok(total as usize)
    }

    /// Map all PDOs of one group with outputs and inputs overlapping: each
    /// SubDevice's logical window is `max(outputs, inputs)` and the returned
    /// frame carries inputs where outputs were transmitted. Required for
    /// LRW use with some SubDevice silicon.
    pub fn config_overlap_map_group(
        &mut self,
        iomap: &mut [u8],
        group: u8,
    ) -> Result<usize, Error> {
        if self.subdevice_count() == 0 || usize::from(group) >= MAX_GROUPS {
            return Ok(0);
        }

        let logical_start = self.groups[usize::from(group)].logical_start_address;

        let mut merged_log_addr = logical_start;
        let mut prev_log_addr = merged_log_addr;
        let mut bit_pos = 0u8;

        let mut si_log_addr = logical_start;
        let mut so_log_addr = logical_start;

        let mut segments = SegmentAccumulator::default();

        self.groups[usize::from(group)].outputs_wkc = 0;
        self.groups[usize::from(group)].inputs_wkc = 0;

        self.find_mappings(group)?;

        for position in 1..=self.subdevice_count() as u16 {
            if !self.in_group(position, group) {
                continue;
            }

            si_log_addr = merged_log_addr;
            so_log_addr = merged_log_addr;

            if self.subdevices[usize::from(position)].output_bits > 0 {
                self.create_output_mappings(
                    position,
                    group,
                    logical_start,
                    &mut so_log_addr,
                    &mut bit_pos,
                )?;

                if bit_pos > 0 {
                    so_log_addr += 1;
                    bit_pos = 0;
                }
            }

            if self.subdevices[usize::from(position)].input_bits > 0 {
                self.create_input_mappings(
                    position,
                    group,
                    logical_start,
                    &mut si_log_addr,
                    &mut bit_pos,
                )?;

                if bit_pos > 0 {
                    si_log_addr += 1;
                    bit_pos = 0;
                }
            }

            merged_log_addr = si_log_addr.max(so_log_addr);

            segments.advance(merged_log_addr, &mut prev_log_addr);

            self.eeprom_to_pdi(position)?;

            let configured_address = self.subdevices[usize::from(position)].configured_address;

            Command::fpwr(configured_address, RegisterAddress::AlControl).send(
                &self.port,
                AlControl::new(AlState::SafeOp),
                self.timeouts.register,
            )?;

            let block_lrw = self.subdevices[usize::from(position)].block_lrw;
            let ebus = self.subdevices[usize::from(position)].ebus_current;

            let group_record = &mut self.groups[usize::from(group)];

            group_record.block_lrw += block_lrw;
            group_record.ebus_current += ebus;
        }

        let output_bytes = so_log_addr - logical_start;
        let input_bytes = si_log_addr - logical_start;

        {
            let group_record = &mut self.groups[usize::from(group)];

            segments.finish(group_record);

            group_record.input_segment = 0;
            group_record.input_offset = 0;
            group_record.outputs_offset = 0;
            group_record.output_bytes = output_bytes;
            group_record.inputs_offset = output_bytes as usize;
            group_record.input_bytes = input_bytes;
        }

        // Rebase input views past the transmitted output block
        for position in 1..=self.subdevice_count() as u16 {
            if self.in_group(position, group) {
                self.subdevices[usize::from(position)].inputs_offset += output_bytes as usize;
            }
        }

        self.finish_group_map(group)?;

        let total = (output_bytes + input_bytes) as usize;

        if iomap.len() < total {
            return Err(Error::Capacity(crate::error::Item::Group));
        }

        log::debug!("Group {} overlapping IOmap size {}", group, total);

        Ok(total)
    }

    /// Sequential-layout mapping of every group into one IOmap.
    pub fn config_map(&mut self, iomap: &mut [u8]) -> Result<usize, Error> {
        self.config_map_group(iomap, 0)
    }

    /// Overlapping-layout mapping of every group into one IOmap.
    pub fn config_overlap_map(&mut self, iomap: &mut [u8]) -> Result<usize, Error> {
        self.config_overlap_map_group(iomap, 0)
    }

    fn in_group(&self, position: u16, group: u8) -> bool {
        group == 0 || self.subdevices[usize::from(position)].group == group
    }

    /// Group-level bookkeeping once all FMMUs are placed: aggregate record 0,
    /// DC chain head.
    fn finish_group_map(&mut self, group: u8) -> Result<(), Error> {
        let group_record = &self.groups[usize::from(group)];
        let (output_bytes, input_bytes, inputs_offset) = (
            group_record.output_bytes,
            group_record.input_bytes,
            group_record.inputs_offset,
        );

        if group == 0 {
            let aggregate = &mut self.subdevices[0];

            aggregate.outputs_offset = 0;
            aggregate.output_bytes = output_bytes;
            aggregate.inputs_offset = inputs_offset;
            aggregate.input_bytes = input_bytes;
        }

        // First DC capable SubDevice in the group anchors the cyclic FRMW
        let dc_next = (1..=self.subdevice_count() as u16)
            .find(|position| {
                self.in_group(*position, group) && self.subdevices[usize::from(*position)].has_dc
            })
            .unwrap_or(0);

        let group_record = &mut self.groups[usize::from(group)];

        group_record.dc_next = dc_next;
        group_record.has_dc = dc_next != 0;

        Ok(())
    }

    /// Find the I/O mapping of every SubDevice in the group: run the PRE-OP to
    /// SAFE-OP hooks and the CoE/SoE mapping readback on a bounded worker
    /// pool, then resolve SII fallbacks and program sync managers serially.
    fn find_mappings(&mut self, group: u8) -> Result<(), Error> {
        let count = self.subdevices.len() - 1;

        if count == 0 {
            return Ok(());
        }

        let MainDevice {
            port,
            timeouts,
            errors,
            subdevices,
            ..
        } = &mut *self;

        let port: &Port = port;
        let timeouts: &Timeouts = timeouts;
        let errors: &ErrorList = errors;

        // CoE/SoE mapping readback is mailbox bound, so it parallelises well
        // across SubDevices; each worker owns a disjoint chunk of records
        let chunk_size = count.div_ceil(MAX_MAPPING_WORKERS);

        std::thread::scope(|scope| {
            let mut position = 1u16;

            for chunk in subdevices[1..].chunks_mut(chunk_size) {
                let first = position;
                position += chunk.len() as u16;

                scope.spawn(move || {
                    for (i, subdevice) in chunk.iter_mut().enumerate() {
                        if group != 0 && subdevice.group != group {
                            continue;
                        }

                        let position = first + i as u16;

                        let mut subdevice_ref =
                            SubDeviceRef::new(port, timeouts, errors, position, subdevice);

                        if let Err(e) = map_coe_soe(&mut subdevice_ref) {
                            log::warn!(
                                "SubDevice {} CoE/SoE mapping readback failed: {}",
                                position,
                                e
                            );
                        }
                    }
                });
            }
        });

        for position in 1..=count as u16 {
            if self.in_group(position, group) {
                self.map_sii(position)?;
                self.map_sm(position)?;
            }
        }

        Ok(())
    }

    /// SII PDO fallback for SubDevices whose mapping is still unknown, plus
    /// reuse of a previous identical SubDevice's mapping.
    fn map_sii(&mut self, position: u16) -> Result<(), Error> {
        let subdevice = &self.subdevices[usize::from(position)];

        if subdevice.output_bits > 0 || subdevice.input_bits > 0 {
            return Ok(());
        }

        if self.lookup_prev_mapping(position) {
            return Ok(());
        }

        let inputs = self.sii_pdo(position, true)?;

        {
            let subdevice = &mut self.subdevices[usize::from(position)];

            for sm in 0..MAX_SM {
                if inputs.sm_bits[sm] > 0 {
                    subdevice.sync_managers[sm].length_bytes = (inputs.sm_bits[sm] + 7) / 8;
                    subdevice.sm_types[sm] = SyncManagerType::Inputs;
                }
            }
        }

        let outputs = self.sii_pdo(position, false)?;

        let subdevice = &mut self.subdevices[usize::from(position)];

        for sm in 0..MAX_SM {
            if outputs.sm_bits[sm] > 0 {
                subdevice.sync_managers[sm].length_bytes = (outputs.sm_bits[sm] + 7) / 8;
                subdevice.sm_types[sm] = SyncManagerType::Outputs;
            }
        }

        subdevice.input_bits = inputs.total_bits;
        subdevice.output_bits = outputs.total_bits;

        log::debug!(
            "SubDevice {} SII mapping: {} output bits, {} input bits",
            position,
            outputs.total_bits,
            inputs.total_bits
        );

        Ok(())
    }

    /// Reuse the mapping of an earlier SubDevice with identical identity.
    fn lookup_prev_mapping(&mut self, position: u16) -> bool {
        let position = usize::from(position);

        if position <= 1 {
            return false;
        }

        let identity = self.subdevices[position].identity();

        let Some(source) = self.subdevices[1..position]
            .iter()
            .position(|other| other.identity() == identity)
            .map(|i| i + 1)
        else {
            return false;
        };

        log::debug!(
            "Copy mapping for SubDevice {} from {}",
            position,
            source
        );

        let (before, after) = self.subdevices.split_at_mut(position);
        let (source, target) = (&before[source], &mut after[0]);

        for sm in 0..MAX_SM {
            target.sync_managers[sm].length_bytes = source.sync_managers[sm].length_bytes;
            target.sm_types[sm] = source.sm_types[sm];
        }

        target.output_bits = source.output_bits;
        target.input_bits = source.input_bits;

        true
    }

    /// Program the resolved sync manager configuration and derive byte sizes.
    fn map_sm(&mut self, position: u16) -> Result<(), Error> {
        let configured_address = self.subdevices[usize::from(position)].configured_address;
        let timeout = self.timeouts.register;

        {
            let subdevice = &self.subdevices[usize::from(position)];

            // SubDevices without a mailbox had SM0/SM1 skipped during init
            for sm in 0..2 {
                if !subdevice.mailbox.has_mailbox()
                    && subdevice.sync_managers[sm].physical_start_address != 0
                {
                    Command::fpwr(configured_address, RegisterAddress::sync_manager(sm as u8))
                        .send(&self.port, subdevice.sync_managers[sm], timeout)?;
                }
            }
        }

        for sm in 2..MAX_SM {
            let mut channel = self.subdevices[usize::from(position)].sync_managers[sm];

            if channel.physical_start_address == 0 {
                continue;
            }

            // A zero length process data SM keeps its flags but is disabled
            if channel.length_bytes == 0 {
                channel.set_flags_word(channel.flags_word() & SM_ENABLE_MASK);

                self.subdevices[usize::from(position)].sync_managers[sm] = channel;
            }

            Command::fpwr(configured_address, RegisterAddress::sync_manager(sm as u8)).send(
                &self.port,
                channel,
                timeout,
            )?;
        }

        let subdevice = &mut self.subdevices[usize::from(position)];

        if subdevice.input_bits > 7 {
            subdevice.input_bytes = (subdevice.input_bits + 7) / 8;
        }

        if subdevice.output_bits > 7 {
            subdevice.output_bytes = (subdevice.output_bits + 7) / 8;
        }

        Ok(())
    }

    /// Place output FMMUs for one SubDevice, advancing the logical bit cursor.
    fn create_output_mappings(
        &mut self,
        position: u16,
        group: u8,
        logical_start: u32,
        log_addr: &mut u32,
        bit_pos: &mut u8,
    ) -> Result<(), Error> {
        let (fmmus, wkc_added) = layout_fmmus(
            &mut self.subdevices[usize::from(position)],
            SyncManagerType::Outputs,
            logical_start,
            log_addr,
            bit_pos,
        );

        self.groups[usize::from(group)].outputs_wkc += wkc_added;

        self.program_fmmus(position, &fmmus)
    }

    /// Place input FMMUs for one SubDevice, advancing the logical bit cursor.
    fn create_input_mappings(
        &mut self,
        position: u16,
        group: u8,
        logical_start: u32,
        log_addr: &mut u32,
        bit_pos: &mut u8,
    ) -> Result<(), Error> {
        let (fmmus, wkc_added) = layout_fmmus(
            &mut self.subdevices[usize::from(position)],
            SyncManagerType::Inputs,
            logical_start,
            log_addr,
            bit_pos,
        );

        self.groups[usize::from(group)].inputs_wkc += wkc_added;

        self.program_fmmus(position, &fmmus)
    }

    fn program_fmmus(&self, position: u16, indices: &[u8]) -> Result<(), Error> {
        let subdevice = &self.subdevices[usize::from(position)];

        for index in indices {
            Command::fpwr(
                subdevice.configured_address,
                RegisterAddress::fmmu(*index),
            )
            .send(
                &self.port,
                subdevice.fmmus[usize::from(*index)],
                self.timeouts.register,
            )?;

            log::debug!(
                "SubDevice {} FMMU{}: {}",
                position,
                index,
                subdevice.fmmus[usize::from(*index)]
            );
        }

        Ok(())
    }

    /// Search for a SubDevice that lost its configured address, verify its SII
    /// identity against the stored record and rewrite the original address.
    ///
    /// Returns `true` when the SubDevice answers at its configured address
    /// again.
    pub fn recover_subdevice(&mut self, position: u16, timeout: Duration) -> Result<bool, Error> {
        let configured_address = self.subdevices[usize::from(position)].configured_address;

        // Is something at this ring position at all, and is it unconfigured?
        let (read_address, wkc) = Command::aprd(
            position - 1,
            RegisterAddress::ConfiguredStationAddress,
        )
        .receive::<u16>(&self.port, timeout)
        .unwrap_or((0xfffe, 0));

        if read_address == configured_address {
            return Ok(true);
        }

        if wkc == 0 || read_address != 0 {
            return Ok(false);
        }

        // Clear whatever may currently answer at the probe address; no
        // response expected
        let _ = Command::fpwr(TEMP_NODE, RegisterAddress::ConfiguredStationAddress).send(
            &self.port,
            0u16,
            Duration::ZERO,
        );

        if Command::apwr(position - 1, RegisterAddress::ConfiguredStationAddress)
            .send(&self.port, TEMP_NODE, timeout)
            .map(|wkc| wkc == 0)
            .unwrap_or(true)
        {
            let _ = Command::fpwr(TEMP_NODE, RegisterAddress::ConfiguredStationAddress).send(
                &self.port,
                0u16,
                Duration::ZERO,
            );

            return Ok(false);
        }

        // Probe via the temporary address
        self.subdevices[usize::from(position)].configured_address = TEMP_NODE;
        self.eeprom_to_master(position)?;

        let (alias, _wkc) = Command::fprd(TEMP_NODE, RegisterAddress::ConfiguredStationAlias)
            .receive::<u16>(&self.port, timeout)?;

        let vendor_id = self.read_eeprom(position, SiiCoding::VendorId)?;
        let product_code = self.read_eeprom(position, SiiCoding::ProductCode)?;
        let revision = self.read_eeprom(position, SiiCoding::RevisionNumber)?;

        let subdevice = &self.subdevices[usize::from(position)];

        let matches = alias == subdevice.alias_address
            && vendor_id == subdevice.vendor_id
            && product_code == subdevice.product_code
            && revision == subdevice.revision;

        let recovered = if matches {
            Command::fpwr(TEMP_NODE, RegisterAddress::ConfiguredStationAddress)
                .send(&self.port, configured_address, timeout)
                .map(|wkc| wkc > 0)
                .unwrap_or(false)
        } else {
            log::warn!(
                "SubDevice at position {} does not match the lost device; leaving unconfigured",
                position
            );

            let _ = Command::fpwr(TEMP_NODE, RegisterAddress::ConfiguredStationAddress).send(
                &self.port,
                0u16,
                timeout,
            );

            false
        };

        self.subdevices[usize::from(position)].configured_address = configured_address;

        Ok(recovered)
    }

    /// Re-apply the stored configuration to a SubDevice that fell back to an
    /// earlier state: INIT, sync managers, PRE-OP, setup hook, SAFE-OP, FMMUs.
    ///
    /// Returns the state the SubDevice reached.
    pub fn reconfig_subdevice(
        &mut self,
        position: u16,
        timeout: Duration,
    ) -> Result<AlState, Error> {
        let configured_address = self.subdevices[usize::from(position)].configured_address;

        let wkc = Command::fpwr(configured_address, RegisterAddress::AlControl).send(
            &self.port,
            AlControl::new(AlState::Init),
            timeout,
        )?;

        if wkc == 0 {
            return Ok(AlState::None);
        }

        self.eeprom_to_pdi(position)?;

        let state = self.state_check(position, AlState::Init, self.timeouts.state_transition)?;

        if state != AlState::Init {
            return Ok(state);
        }

        for sm in 0..MAX_SM {
            let channel = self.subdevices[usize::from(position)].sync_managers[sm];

            if channel.physical_start_address != 0 {
                Command::fpwr(configured_address, RegisterAddress::sync_manager(sm as u8)).send(
                    &self.port,
                    channel,
                    timeout,
                )?;
            }
        }

        Command::fpwr(configured_address, RegisterAddress::AlControl).send(
            &self.port,
            AlControl::new(AlState::PreOp),
            timeout,
        )?;

        let state = self.state_check(position, AlState::PreOp, self.timeouts.state_transition)?;

        if state != AlState::PreOp {
            return Ok(state);
        }

        // Run the application's PRE-OP to SAFE-OP hook again
        if let Some(mut hook) = self.subdevices[usize::from(position)].setup_hook.take() {
            let mut subdevice_ref = SubDeviceRef::new(
                &self.port,
                &self.timeouts,
                &self.errors,
                position,
                &mut self.subdevices[usize::from(position)],
            );

            let result = hook(&mut subdevice_ref);

            self.subdevices[usize::from(position)].setup_hook = Some(hook);

            result?;
        }

        Command::fpwr(configured_address, RegisterAddress::AlControl).send(
            &self.port,
            AlControl::new(AlState::SafeOp),
            timeout,
        )?;

        let state = self.state_check(position, AlState::SafeOp, self.timeouts.state_transition)?;

        let fmmu_count = self.subdevices[usize::from(position)].first_unused_fmmu;

        for index in 0..fmmu_count {
            Command::fpwr(configured_address, RegisterAddress::fmmu(index)).send(
                &self.port,
                self.subdevices[usize::from(position)].fmmus[usize::from(index)],
                timeout,
            )?;
        }

        Ok(state)
    }
}

/// Running-counter parent inference: walk backwards from a SubDevice, counting
/// endpoint/split/cross devices until the branch this device hangs off is
/// found.
fn infer_parent(subdevices: &[SubDevice], position: u16) -> u16 {
    if position <= 1 {
        // Attached directly to the MainDevice
        return 0;
    }

    let mut counter: i16 = 0;
    let mut candidate = position - 1;

    loop {
        let link_count = i16::from(subdevices[usize::from(candidate)].topology.link_count);

        match link_count {
            1 => counter -= 1,
            3 => counter += 1,
            4 => counter += 2,
            _ => {}
        }

        if (counter >= 0 && link_count > 1) || candidate == 1 {
            return candidate;
        }

        candidate -= 1;
    }
}

/// Tracks the segmentation table while the logical window grows.
struct SegmentAccumulator {
    table: [u32; MAX_IO_SEGMENTS],
    current: usize,
    size: u32,
}

impl Default for SegmentAccumulator {
    fn default() -> Self {
        Self {
            table: [0u32; MAX_IO_SEGMENTS],
            current: 0,
            size: 0,
        }
    }
}

impl SegmentAccumulator {
    /// Account the logical bytes added since the last call, closing the
    /// current segment when it would no longer fit one datagram.
    fn advance(&mut self, log_addr: u32, prev_log_addr: &mut u32) {
        let diff = log_addr - *prev_log_addr;
        *prev_log_addr = log_addr;

        if self.size + diff > (MAX_LRW_DATA - FIRST_DC_DATAGRAM) as u32 {
            self.table[self.current] = self.size;

            if self.current < MAX_IO_SEGMENTS - 1 {
                self.current += 1;
                self.size = diff;
            }
        } else {
            self.size += diff;
        }
    }

    fn finish(mut self, group: &mut crate::group::Group) {
        self.table[self.current] = self.size;

        group.io_segments = self.table;
        group.num_segments = self.current + 1;
    }
}

/// CoE/SoE mapping readback for one SubDevice; runs on the mapping worker
/// pool. The fall-through policy is CoE complete access, then CoE individual
/// reads, then SoE, with the SII PDO sections as the serial fallback.
fn map_coe_soe(subdevice_ref: &mut SubDeviceRef<'_>) -> Result<(), Error> {
    let timeout = subdevice_ref.timeouts.mailbox_rx;

    subdevice_ref.await_state(AlState::PreOp, subdevice_ref.timeouts.state_transition)?;

    // The application hook gets first go so it can reprogram PDO assignments
    // before they are read back
    if let Some(mut hook) = subdevice_ref.subdevice.setup_hook.take() {
        let result = hook(subdevice_ref);

        subdevice_ref.subdevice.setup_hook = Some(hook);

        result?;
    }

    let mut output_bits = 0;
    let mut input_bits = 0;

    if subdevice_ref
        .subdevice
        .mailbox
        .protocols
        .contains(MailboxProtocols::COE)
    {
        let use_ca = subdevice_ref
            .subdevice
            .coe_details
            .contains(crate::coe::CoeDetails::COMPLETE_ACCESS);

        let result = if use_ca {
            subdevice_ref.read_pdo_map_ca(timeout)
        } else {
            Err(Error::Timeout)
        };

        let (o, i) = match result {
            Ok(sizes) => sizes,
            // Complete access unavailable or failed; retry with individual
            // reads
            Err(_) => subdevice_ref.read_pdo_map(timeout).unwrap_or((0, 0)),
        };

        output_bits = o;
        input_bits = i;

        log::debug!(
            "SubDevice {} CoE mapping: {} output bits, {} input bits",
            subdevice_ref.position(),
            output_bits,
            input_bits
        );
    }

    if output_bits == 0
        && input_bits == 0
        && subdevice_ref
            .subdevice
            .mailbox
            .protocols
            .contains(MailboxProtocols::SOE)
    {
        let (o, i) = subdevice_ref.read_idn_map(timeout)?;

        output_bits = o;
        input_bits = i;

        let subdevice = &mut subdevice_ref.subdevice;

        subdevice.sync_managers[2].length_bytes = ((o + 7) / 8) as u16;
        subdevice.sync_managers[3].length_bytes = ((i + 7) / 8) as u16;

        log::debug!(
            "SubDevice {} SoE mapping: {} output bits, {} input bits",
            subdevice_ref.position(),
            output_bits,
            input_bits
        );
    }

    subdevice_ref.subdevice.output_bits = output_bits;
    subdevice_ref.subdevice.input_bits = input_bits;

    Ok(())
}

impl SubDeviceRef<'_> {
    /// Poll this SubDevice's AL status until it reaches `request` or the
    /// timeout expires.
    fn await_state(&mut self, request: AlState, timeout: Duration) -> Result<AlState, Error> {
        let configured_address = self.subdevice.configured_address;
        let deadline = std::time::Instant::now() + timeout;

        loop {
            if let Ok((all, wkc)) = Command::fprd(configured_address, RegisterAddress::AlStatus)
                .receive::<AlStatusAll>(self.port, self.timeouts.pdu)
            {
                if wkc > 0 {
                    self.subdevice.state = all.status.state;
                    self.subdevice.al_error = all.status.error;
                    self.subdevice.al_status_code = all.code;

                    if all.status.state == request {
                        return Ok(request);
                    }
                }
            }

            if std::time::Instant::now() >= deadline {
                return Ok(self.subdevice.state);
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Place the FMMUs covering one direction of one SubDevice's process data.
///
/// Walks the sync managers of the requested type, coalescing physically
/// adjacent ones into single FMMUs. Bit-oriented SubDevices pack against their
/// neighbours inside a shared logical byte; byte-oriented SubDevices always
/// start byte aligned.
///
/// Returns the indices of the FMMUs placed (to be programmed on-chip by the
/// caller) and the number of FMMUs, which is the direction's WKC contribution.
fn layout_fmmus(
    subdevice: &mut SubDevice,
    direction: SyncManagerType,
    logical_start: u32,
    log_addr: &mut u32,
    bit_pos: &mut u8,
) -> (heapless::Vec<u8, MAX_FMMU>, u16) {
    let (total_bits, total_bytes) = match direction {
        SyncManagerType::Inputs => (subdevice.input_bits, subdevice.input_bytes),
        _ => (subdevice.output_bits, subdevice.output_bytes),
    };

    let mut placed = heapless::Vec::new();
    let mut wkc_added = 0;

    let mut fmmu_c = usize::from(subdevice.first_unused_fmmu);

    // Skip entities claimed by the opposite direction in overlap layouts
    if direction == SyncManagerType::Inputs && subdevice.output_bits > 0 {
        while fmmu_c < MAX_FMMU && subdevice.fmmus[fmmu_c].enable {
            fmmu_c += 1;
        }
    }

    let mut sm_c = 0usize;
    let mut byte_count: u32 = 0;
    let mut bit_count: u32 = 0;
    let mut fmmu_done: u32 = 0;

    while sm_c < MAX_SM - 1 && fmmu_done < (total_bits + 7) / 8 {
        if fmmu_c >= MAX_FMMU {
            log::error!("SubDevice ran out of FMMU entities");

            break;
        }

        // Find the next sync manager serving this direction
        while sm_c < MAX_SM - 1 && subdevice.sm_types[sm_c] != direction {
            sm_c += 1;
        }

        if subdevice.sm_types[sm_c] != direction {
            break;
        }

        let mut sm_length = u32::from(subdevice.sync_managers[sm_c].length_bytes);
        let mut end_addr =
            u32::from(subdevice.sync_managers[sm_c].physical_start_address) + sm_length;

        subdevice.fmmus[fmmu_c].physical_start_address =
            subdevice.sync_managers[sm_c].physical_start_address;

        byte_count += sm_length;
        bit_count += sm_length * 8;

        // Adjacent sync managers are folded into the same FMMU; a gap starts a
        // new entity
        while bit_count < u32::from(total_bits) && sm_c < MAX_SM - 1 {
            sm_c += 1;

            while sm_c < MAX_SM - 1 && subdevice.sm_types[sm_c] != direction {
                sm_c += 1;
            }

            if subdevice.sm_types[sm_c] != direction
                || u32::from(subdevice.sync_managers[sm_c].physical_start_address) > end_addr
            {
                break;
            }

            sm_length = u32::from(subdevice.sync_managers[sm_c].length_bytes);

            byte_count += sm_length;
            bit_count += sm_length * 8;
            end_addr = u32::from(subdevice.sync_managers[sm_c].physical_start_address) + sm_length;
        }

        let fmmu_size;

        if total_bytes == 0 {
            // Bit oriented SubDevice: pack against the neighbour
            subdevice.fmmus[fmmu_c].logical_start_address = *log_addr;
            subdevice.fmmus[fmmu_c].logical_start_bit = *bit_pos;

            *bit_pos += (total_bits as u8).saturating_sub(1);

            if *bit_pos > 7 {
                *log_addr += 1;
                *bit_pos -= 8;
            }

            fmmu_size = *log_addr - subdevice.fmmus[fmmu_c].logical_start_address + 1;

            subdevice.fmmus[fmmu_c].length_bytes = fmmu_size as u16;
            subdevice.fmmus[fmmu_c].logical_end_bit = *bit_pos;

            *bit_pos += 1;

            if *bit_pos > 7 {
                *log_addr += 1;
                *bit_pos -= 8;
            }
        } else {
            // Byte oriented SubDevice: always starts byte aligned
            if *bit_pos > 0 {
                *log_addr += 1;
                *bit_pos = 0;
            }

            subdevice.fmmus[fmmu_c].logical_start_address = *log_addr;
            subdevice.fmmus[fmmu_c].logical_start_bit = 0;

            fmmu_size = byte_count.min(total_bytes - fmmu_done);

            *log_addr += fmmu_size;

            subdevice.fmmus[fmmu_c].length_bytes = fmmu_size as u16;
            subdevice.fmmus[fmmu_c].logical_end_bit = 7;
        }

        fmmu_done += fmmu_size;

        if subdevice.fmmus[fmmu_c].length_bytes > 0 {
            subdevice.fmmus[fmmu_c].physical_start_bit = 0;
            subdevice.fmmus[fmmu_c].read_enable = direction == SyncManagerType::Inputs;
            subdevice.fmmus[fmmu_c].write_enable = direction == SyncManagerType::Outputs;
            subdevice.fmmus[fmmu_c].enable = true;

            let _ = placed.push(fmmu_c as u8);

            wkc_added += 1;

            // First FMMU of a direction defines the SubDevice's IOmap view
            if wkc_added == 1 {
                let offset =
                    (subdevice.fmmus[fmmu_c].logical_start_address - logical_start) as usize;
                let start_bit = subdevice.fmmus[fmmu_c].logical_start_bit;

                match direction {
                    SyncManagerType::Inputs => {
                        subdevice.inputs_offset = offset;
                        subdevice.input_start_bit = start_bit;
                    }
                    _ => {
                        subdevice.outputs_offset = offset;
                        subdevice.output_start_bit = start_bit;
                    }
                }
            }
        }

        fmmu_c += 1;
    }

    subdevice.first_unused_fmmu = fmmu_c as u8;

    (placed, wkc_added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subdevice::Topology;

    fn subdevice_with_topology(link_count: u8) -> SubDevice {
        SubDevice {
            topology: Topology {
                link_count,
                ..Topology::default()
            },
            ..SubDevice::default()
        }
    }

    #[test]
    fn parent_inference_line_topology() {
        // Three pass-through devices in a line: each hangs off its predecessor
        let subdevices = vec![
            SubDevice::default(),
            subdevice_with_topology(2),
            subdevice_with_topology(2),
            subdevice_with_topology(1),
        ];

        assert_eq!(infer_parent(&subdevices, 1), 0);
        assert_eq!(infer_parent(&subdevices, 2), 1);
        assert_eq!(infer_parent(&subdevices, 3), 2);
    }

    #[test]
    fn parent_inference_split_topology() {
        // Device 1 is a coupler with a branch: 2 and 3 hang off the branch,
        // and after the branch terminates, 4 hangs off the coupler again
        let subdevices = vec![
            SubDevice::default(),
            subdevice_with_topology(3),
            subdevice_with_topology(2),
            subdevice_with_topology(1),
            subdevice_with_topology(1),
        ];

        assert_eq!(infer_parent(&subdevices, 2), 1);
        assert_eq!(infer_parent(&subdevices, 3), 2);
        assert_eq!(infer_parent(&subdevices, 4), 1);
    }

    #[test]
    fn byte_oriented_layout_is_byte_aligned() {
        let mut subdevice = SubDevice {
            output_bits: 64,
            output_bytes: 8,
            ..SubDevice::default()
        };

        subdevice.sm_types[2] = SyncManagerType::Outputs;
        subdevice.sync_managers[2].physical_start_address = 0x1100;
        subdevice.sync_managers[2].length_bytes = 8;

        let mut log_addr = 0u32;
        // A previous bit-oriented device left the cursor mid-byte
        let mut bit_pos = 3u8;

        let (placed, wkc) = layout_fmmus(
            &mut subdevice,
            SyncManagerType::Outputs,
            0,
            &mut log_addr,
            &mut bit_pos,
        );

        assert_eq!(placed.len(), 1);
        assert_eq!(wkc, 1);

        // The byte-oriented device skipped the partial byte
        assert_eq!(subdevice.fmmus[0].logical_start_address, 1);
        assert_eq!(subdevice.fmmus[0].length_bytes, 8);
        assert_eq!(subdevice.fmmus[0].logical_start_bit, 0);
        assert_eq!(subdevice.outputs_offset, 1);
        assert_eq!(log_addr, 9);
        assert_eq!(bit_pos, 0);

        assert!(subdevice.fmmus[0].write_enable);
        assert!(!subdevice.fmmus[0].read_enable);
    }

    #[test]
    fn bit_oriented_devices_pack_together() {
        let mut log_addr = 0u32;
        let mut bit_pos = 0u8;

        // Two 2 bit input devices sharing one logical byte
        for expected_start_bit in [0u8, 2] {
            let mut subdevice = SubDevice {
                input_bits: 2,
                input_bytes: 0,
                ..SubDevice::default()
            };

            subdevice.sm_types[0] = SyncManagerType::Inputs;
            subdevice.sync_managers[0].physical_start_address = 0x1000;
            subdevice.sync_managers[0].length_bytes = 1;

            let (placed, _wkc) = layout_fmmus(
                &mut subdevice,
                SyncManagerType::Inputs,
                0,
                &mut log_addr,
                &mut bit_pos,
            );

            assert_eq!(placed.len(), 1);
            assert_eq!(subdevice.fmmus[0].logical_start_bit, expected_start_bit);
            assert_eq!(subdevice.input_start_bit, expected_start_bit);
            assert_eq!(subdevice.fmmus[0].logical_start_address, 0);
            assert!(subdevice.fmmus[0].read_enable);
        }

        // Both devices fit in the first logical byte
        assert_eq!(log_addr, 0);
        assert_eq!(bit_pos, 4);
    }

    mod simulated_network {
        use super::super::*;
        use crate::bus_sim::{BusSim, EepromBuilder, SimSubDevice};
        use crate::coe::SubIndex;
        use crate::error::{ErrorKind, MailboxError};
        use crate::port::sim::SimNic;
        use crate::NODE_OFFSET;

        /// A mailbox + CoE SubDevice modelled on a small servo drive: 8 bytes
        /// out, 8 bytes in, mapping readable through `0x1c12`/`0x1c13`.
        fn drive_subdevice() -> SimSubDevice {
            let eeprom = EepromBuilder::new(0x0000_0abc, 0x0001_0001, 0x0002_0000)
                .mailbox(0x1000, 0x0080, 0x1080, 0x0080, 0x0004)
                .general(0x21, 0, false)
                .name("SIM-DRIVE")
                .sync_managers(&[
                    (0x1000, 0x0080, 0x26, 0x01),
                    (0x1080, 0x0080, 0x22, 0x01),
                    (0x1100, 0x0000, 0x64, 0x01),
                    (0x1180, 0x0000, 0x20, 0x01),
                ])
                .fmmus(&[0x01, 0x02])
                .build();

            let mut subdevice = SimSubDevice::new(eeprom);

            // Sync manager communication types: SM2 outputs, SM3 inputs
            subdevice.od.insert((0x1c00, 0), vec![4]);
            subdevice.od.insert((0x1c00, 3), vec![3]);
            subdevice.od.insert((0x1c00, 4), vec![4]);

            // One RxPDO of 64 bits, one TxPDO of 64 bits
            subdevice.od.insert((0x1c12, 0), vec![1]);
            subdevice.od.insert((0x1c12, 1), 0x1600u16.to_le_bytes().to_vec());
            subdevice.od.insert((0x1600, 0), vec![1]);
            subdevice
                .od
                .insert((0x1600, 1), 0x7010_0140u32.to_le_bytes().to_vec());

            subdevice.od.insert((0x1c13, 0), vec![1]);
            subdevice.od.insert((0x1c13, 1), 0x1a00u16.to_le_bytes().to_vec());
            subdevice.od.insert((0x1a00, 0), vec![1]);
            subdevice
                .od
                .insert((0x1a00, 1), 0x6010_0140u32.to_le_bytes().to_vec());

            subdevice
        }

        /// A mailbox-less input SubDevice whose mapping only exists in its SII
        /// PDO section: 32 input bits through SM0.
        fn plain_input_subdevice() -> SimSubDevice {
            let eeprom = EepromBuilder::new(0x0000_0999, 0x0000_0002, 0x0001_0000)
                .name("SIM-IN4")
                .sync_managers(&[(0x1000, 0x0004, 0x00, 0x01)])
                .fmmus(&[0x01])
                .pdo(50, 0, &[16, 16])
                .build();

            SimSubDevice::new(eeprom)
        }

        fn simulated(subdevices: Vec<SimSubDevice>) -> (BusSim, MainDevice) {
            let sim = BusSim::new(subdevices);

            let nic: SimNic = sim.nic();

            let maindevice =
                MainDevice::with_port(Port::new(Box::new(nic), None));

            (sim, maindevice)
        }

        #[test]
        fn config_init_discovers_and_identifies() {
            let (sim, mut maindevice) = simulated(vec![
                drive_subdevice(),
                plain_input_subdevice(),
            ]);

            let count = maindevice.config_init().unwrap();

            assert_eq!(count, 2);

            let drive = &maindevice.subdevices()[1];

            assert_eq!(drive.configured_address, NODE_OFFSET + 1);
            assert_eq!(drive.vendor_id, 0x0000_0abc);
            assert_eq!(drive.product_code, 0x0001_0001);
            assert_eq!(drive.name.as_str(), "SIM-DRIVE");
            assert_eq!(drive.mailbox.write_offset, 0x1000);
            assert_eq!(drive.mailbox.write_len, 0x0080);
            assert_eq!(drive.mailbox.read_offset, 0x1080);
            assert!(drive.mailbox.protocols.contains(MailboxProtocols::COE));
            assert_eq!(drive.sync_managers[0].length_bytes, 0x0080);
            assert_eq!(drive.sync_managers[1].length_bytes, 0x0080);

            let input = &maindevice.subdevices()[2];

            assert_eq!(input.configured_address, NODE_OFFSET + 2);
            assert_eq!(input.name.as_str(), "SIM-IN4");
            assert!(!input.mailbox.has_mailbox());
            assert_eq!(input.topology.parent, 1);

            // Mailbox sync managers were programmed on-chip and PRE-OP was
            // requested
            sim.with_subdevice(0, |subdevice| {
                assert_eq!(subdevice.register(0x0800), 0x00);
                assert_eq!(subdevice.register(0x0801), 0x10);
                assert_eq!(subdevice.register(0x0804), 0x26);
                assert_eq!(subdevice.register(0x0130), 0x02);
            });
        }

        #[test]
        fn repeated_config_init_is_idempotent() {
            let (_sim, mut maindevice) = simulated(vec![
                drive_subdevice(),
                plain_input_subdevice(),
            ]);

            maindevice.config_init().unwrap();

            let first: Vec<_> = maindevice
                .subdevices()
                .iter()
                .map(|subdevice| {
                    (
                        subdevice.configured_address,
                        subdevice.vendor_id,
                        subdevice.product_code,
                        subdevice.revision,
                        subdevice.name.clone(),
                        subdevice.mailbox.write_offset,
                    )
                })
                .collect();

            maindevice.config_init().unwrap();

            let second: Vec<_> = maindevice
                .subdevices()
                .iter()
                .map(|subdevice| {
                    (
                        subdevice.configured_address,
                        subdevice.vendor_id,
                        subdevice.product_code,
                        subdevice.revision,
                        subdevice.name.clone(),
                        subdevice.mailbox.write_offset,
                    )
                })
                .collect();

            assert_eq!(first, second);
        }

        #[test]
        fn config_map_lays_out_iomap_and_reaches_safe_op() {
            let (sim, mut maindevice) = simulated(vec![
                drive_subdevice(),
                plain_input_subdevice(),
            ]);

            maindevice.config_init().unwrap();

            // The PRE-OP to SAFE-OP hook reprograms the drive's operating
            // mode, like an application would before mapping
            maindevice.subdevices_mut()[1].setup_hook =
                Some(Box::new(|subdevice_ref: &mut SubDeviceRef<'_>| {
                    subdevice_ref.sdo_write(
                        0x6060,
                        SubIndex::Index(0),
                        &[8],
                        Duration::from_millis(100),
                    )
                }));

            let mut iomap = [0u8; 64];

            let size = maindevice.config_map(&mut iomap).unwrap();

            // 8 output bytes + 8 + 4 input bytes
            assert_eq!(size, 20);

            let drive = &maindevice.subdevices()[1];

            assert_eq!(drive.output_bytes, 8);
            assert_eq!(drive.input_bytes, 8);
            assert_eq!(drive.outputs_offset, 0);
            assert_eq!(drive.inputs_offset, 8);

            let input = &maindevice.subdevices()[2];

            assert_eq!(input.input_bytes, 4);
            assert_eq!(input.inputs_offset, 16);

            let group = maindevice.group(0);

            assert_eq!(group.output_bytes, 8);
            assert_eq!(group.input_bytes, 12);
            assert_eq!(group.outputs_wkc, 1);
            assert_eq!(group.inputs_wkc, 2);
            assert_eq!(group.expected_wkc(), 4);
            assert_eq!(group.num_segments, 1);
            assert_eq!(group.io_segments[0], 20);

            // The hook's SDO download reached the object dictionary, and both
            // SubDevices were asked to go to SAFE-OP
            sim.with_subdevice(0, |subdevice| {
                assert_eq!(subdevice.od.get(&(0x6060, 0)), Some(&vec![8]));
                assert_eq!(subdevice.register(0x0130), 0x04);
            });
            sim.with_subdevice(1, |subdevice| {
                assert_eq!(subdevice.register(0x0130), 0x04);
            });
        }

        #[test]
        fn sdo_write_to_read_only_object_pushes_abort() {
            let (sim, mut maindevice) = simulated(vec![drive_subdevice()]);

            maindevice.config_init().unwrap();

            sim.with_subdevice(0, |subdevice| {
                subdevice.read_only.insert((0x1c12, 0));
            });

            let result = maindevice.sdo_write(1, 0x1c12, SubIndex::Index(0), &[0]);

            assert!(matches!(
                result,
                Err(Error::Mailbox(MailboxError::Aborted { .. }))
            ));

            assert!(maindevice.is_error());

            let record = maindevice.pop_error().unwrap();

            assert_eq!(record.subdevice, 1);
            assert_eq!(record.index, 0x1c12);
            assert_eq!(
                record.kind,
                ErrorKind::Sdo {
                    abort_code: 0x0601_0002
                }
            );
        }

        #[test]
        fn sdo_round_trip_through_mailbox() {
            let (_sim, mut maindevice) = simulated(vec![drive_subdevice()]);

            maindevice.config_init().unwrap();

            maindevice
                .sdo_write(1, 0x2000, SubIndex::Index(1), &0xdead_beefu32.to_le_bytes())
                .unwrap();

            let mut out = [0u8; 4];

            let read = maindevice.sdo_read(1, 0x2000, SubIndex::Index(1), &mut out).unwrap();

            assert_eq!(read, 4);
            assert_eq!(out, 0xdead_beefu32.to_le_bytes());
        }
    }

    #[test]
    fn segment_accumulator_splits_oversize_groups() {
        let mut segments = SegmentAccumulator::default();
        let mut prev = 0u32;

        // 1600 bytes of I/O in 100 byte steps forces two segments
        for step in 1..=16u32 {
            segments.advance(step * 100, &mut prev);
        }

        let mut group = crate::group::Group::default();

        segments.finish(&mut group);

        assert_eq!(group.num_segments, 2);
        assert_eq!(group.io_segments[0] + group.io_segments[1], 1600);
        assert!(group.io_segments[0] <= (MAX_LRW_DATA - FIRST_DC_DATAGRAM) as u32);
    }
}
