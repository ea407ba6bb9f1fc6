//! The MainDevice: explicit master instance owning the port, SubDevice table,
//! groups and the state driver.

use crate::{
    al_state::{AlControl, AlState, AlStatus},
    al_status_code::AlStatusCode,
    command::Command,
    eeprom::SiiCache,
    error::{Error, ErrorList, ErrorRecord},
    group::Group,
    port::Port,
    processdata::IndexStack,
    register::RegisterAddress,
    subdevice::{SubDevice, SubDeviceRef},
    MAX_FPRD_MULTI, MAX_GROUPS,
};
use core::time::Duration;
use ethercrab_wire::EtherCrabWireRead;

/// Timeouts for the various transaction classes.
///
/// All network operations take an explicit timeout derived from this
/// configuration; expiry surfaces as [`Error::Timeout`].
#[derive(Debug, Copy, Clone)]
pub struct Timeouts {
    /// Single PDU round trip.
    pub pdu: Duration,
    /// Register accesses during enumeration and recovery.
    pub register: Duration,
    /// SubDevice discovery broadcast.
    pub discovery: Duration,
    /// One EEPROM word transaction.
    pub eeprom: Duration,
    /// Placing a message into a SubDevice's write mailbox.
    pub mailbox_tx: Duration,
    /// Waiting for a SubDevice to fill its read mailbox.
    pub mailbox_rx: Duration,
    /// AL state transitions.
    pub state_transition: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            pdu: Duration::from_micros(2_000),
            register: Duration::from_micros(6_000),
            discovery: Duration::from_micros(20_000),
            eeprom: Duration::from_micros(20_000),
            mailbox_tx: Duration::from_micros(20_000),
            mailbox_rx: Duration::from_micros(700_000),
            state_transition: Duration::from_micros(2_000_000),
        }
    }
}

/// AL status plus status code as read with one 6 byte FPRD.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 6)]
pub(crate) struct AlStatusAll {
    #[wire(bytes = 2)]
    pub status: AlStatus,
    #[wire(bytes = 2)]
    pub reserved: u16,
    #[wire(bytes = 2)]
    pub code: AlStatusCode,
}

/// An EtherCAT MainDevice instance.
///
/// All tables are owned here; nothing is process global, so multiple instances
/// can drive multiple NICs in one process.
#[derive(Debug)]
pub struct MainDevice {
    pub(crate) port: Port,
    pub(crate) timeouts: Timeouts,
    /// SubDevice table. Record 0 is the MainDevice aggregate; discovered
    /// devices are records `1..=subdevice_count()`.
    pub(crate) subdevices: Vec<SubDevice>,
    pub(crate) groups: [Group; MAX_GROUPS],
    pub(crate) sii: SiiCache,
    pub(crate) errors: ErrorList,
    pub(crate) idx_stack: IndexStack,
    /// DC system time captured by the last cyclic exchange, nanoseconds.
    pub(crate) dc_time: i64,
    /// Payload length of the DC-carrying datagram of the current cycle.
    pub(crate) dc_payload_len: usize,
    /// Offset of the piggybacked DC time in the DC-carrying frame.
    pub(crate) dc_time_offset: usize,
}

impl MainDevice {
    /// Open the MainDevice on one network interface.
    #[cfg(unix)]
    pub fn new(ifname: &str) -> Result<Self, Error> {
        let primary = crate::port::raw_socket::RawSocketDesc::new(ifname)
            .map_err(|_| Error::SendFrame)?;

        Ok(Self::with_port(Port::new(Box::new(primary), None)))
    }

    /// Open the MainDevice with a redundant second interface.
    #[cfg(unix)]
    pub fn new_redundant(ifname: &str, ifname2: &str) -> Result<Self, Error> {
        let primary = crate::port::raw_socket::RawSocketDesc::new(ifname)
            .map_err(|_| Error::SendFrame)?;
        let secondary = crate::port::raw_socket::RawSocketDesc::new(ifname2)
            .map_err(|_| Error::SendFrame)?;

        Ok(Self::with_port(Port::new(
            Box::new(primary),
            Some(Box::new(secondary)),
        )))
    }

    pub(crate) fn with_port(port: Port) -> Self {
        let mut groups: [Group; MAX_GROUPS] = Default::default();

        // Default logical start address per group entry
        for (i, group) in groups.iter_mut().enumerate() {
            group.logical_start_address = (i as u32) << 16;
        }

        Self {
            port,
            timeouts: Timeouts::default(),
            subdevices: vec![SubDevice::default()],
            groups,
            sii: SiiCache::new(),
            errors: ErrorList::new(),
            idx_stack: IndexStack::new(),
            dc_time: 0,
            dc_payload_len: 0,
            dc_time_offset: 0,
        }
    }

    /// Replace the default timeouts.
    pub fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
    }

    /// The NIC port, for issuing raw command primitives alongside the higher
    /// level services.
    pub fn port(&self) -> &Port {
        &self.port
    }

    /// Close the port, dropping the underlying sockets.
    pub fn close(self) {}

    /// Number of discovered SubDevices, excluding the aggregate record 0.
    pub fn subdevice_count(&self) -> usize {
        self.subdevices.len().saturating_sub(1)
    }

    /// All SubDevice records including the aggregate record 0.
    pub fn subdevices(&self) -> &[SubDevice] {
        &self.subdevices
    }

    /// Mutable access to the SubDevice records, e.g. to register a
    /// [`SetupHook`](crate::SetupHook) before mapping.
    pub fn subdevices_mut(&mut self) -> &mut [SubDevice] {
        &mut self.subdevices
    }

    /// One group record.
    pub fn group(&self, group: u8) -> &Group {
        &self.groups[usize::from(group)]
    }

    /// The DC system time captured by the last
    /// [`receive_processdata`](Self::receive_processdata), nanoseconds.
    pub fn dc_time(&self) -> i64 {
        self.dc_time
    }

    /// A handle for mailbox/CoE/SoE traffic to one SubDevice.
    pub fn subdevice(&mut self, position: u16) -> Result<SubDeviceRef<'_>, Error> {
        let subdevice = self
            .subdevices
            .get_mut(usize::from(position))
            .ok_or(Error::NotFound {
                item: crate::error::Item::SubDevice,
                index: Some(usize::from(position)),
            })?;

        Ok(SubDeviceRef::new(
            &self.port,
            &self.timeouts,
            &self.errors,
            position,
            subdevice,
        ))
    }

    /// CoE SDO upload from one SubDevice; returns the bytes read.
    pub fn sdo_read(
        &mut self,
        position: u16,
        index: u16,
        sub_index: impl Into<crate::SubIndex>,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        let timeout = self.timeouts.mailbox_rx;

        self.subdevice(position)?.sdo_read(index, sub_index, out, timeout)
    }

    /// CoE SDO download to one SubDevice.
    pub fn sdo_write(
        &mut self,
        position: u16,
        index: u16,
        sub_index: impl Into<crate::SubIndex>,
        data: &[u8],
    ) -> Result<(), Error> {
        let timeout = self.timeouts.mailbox_rx;

        self.subdevice(position)?.sdo_write(index, sub_index, data, timeout)
    }

    /// SoE read from one SubDevice; returns the bytes read.
    pub fn soe_read(
        &mut self,
        position: u16,
        drive_no: u8,
        elements: crate::soe::SoeElements,
        idn: u16,
        out: &mut [u8],
    ) -> Result<usize, Error> {
        let timeout = self.timeouts.mailbox_rx;

        self.subdevice(position)?
            .soe_read(drive_no, elements, idn, out, timeout)
    }

    /// SoE write to one SubDevice.
    pub fn soe_write(
        &mut self,
        position: u16,
        drive_no: u8,
        elements: crate::soe::SoeElements,
        idn: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        let timeout = self.timeouts.mailbox_rx;

        self.subdevice(position)?
            .soe_write(drive_no, elements, idn, data, timeout)
    }

    /// True while the error ring holds unread records.
    pub fn is_error(&self) -> bool {
        self.errors.is_error()
    }

    /// Pop the oldest error record.
    pub fn pop_error(&self) -> Option<ErrorRecord> {
        self.errors.pop()
    }

    /// Read the AL state of every SubDevice into the table, returning the
    /// lowest state found.
    ///
    /// A single broadcast is tried first; only when SubDevices disagree, one is
    /// missing, or an error flag is set does this fall back to batched
    /// per-SubDevice reads.
    pub fn read_state(&mut self) -> Result<AlState, Error> {
        let (raw, wkc) = Command::brd(RegisterAddress::AlStatus)
            .receive::<u16>(&self.port, self.timeouts.pdu)?;

        let all_present = usize::from(wkc) >= self.subdevice_count();
        let no_error = raw & 0x10 == 0;
        let state = AlState::from_nibble(raw);
        let uniform = !matches!(state, AlState::None | AlState::Other(_));

        if no_error && uniform && all_present {
            for subdevice in self.subdevices.iter_mut() {
                subdevice.state = state;
                subdevice.al_error = false;
                subdevice.al_status_code = AlStatusCode::NoError;
            }

            return Ok(state);
        }

        // Disagreement or error: read each SubDevice's status block, many per
        // frame
        let mut lowest = AlState::Other(0x0f);
        let mut aggregate_code = AlStatusCode::NoError;

        for first in (1..self.subdevices.len()).step_by(MAX_FPRD_MULTI) {
            let last = (first + MAX_FPRD_MULTI - 1).min(self.subdevices.len() - 1);

            let addresses: Vec<u16> = self.subdevices[first..=last]
                .iter()
                .map(|subdevice| subdevice.configured_address)
                .collect();

            let statuses = self.fprd_multi_status(&addresses)?;

            for (i, status) in statuses.iter().enumerate() {
                let subdevice = &mut self.subdevices[first + i];

                subdevice.state = status.status.state;
                subdevice.al_error = status.status.error;
                subdevice.al_status_code = status.code;

                if subdevice.state.nibble() < lowest.nibble() {
                    lowest = subdevice.state;
                }

                if status.code != AlStatusCode::NoError {
                    aggregate_code = status.code;
                }
            }
        }

        self.subdevices[0].state = lowest;
        self.subdevices[0].al_status_code = aggregate_code;

        Ok(lowest)
    }

    /// Read AL status blocks for many configured addresses with one frame.
    fn fprd_multi_status(&self, addresses: &[u16]) -> Result<Vec<AlStatusAll>, Error> {
        use ethercrab_wire::EtherCrabWireSized;

        let idx = self.port.get_index()?;

        let result = (|| {
            let mut offsets = Vec::with_capacity(addresses.len());

            for (i, address) in addresses.iter().enumerate() {
                let command = Command::fprd(*address, RegisterAddress::AlStatus).command.into();

                if i == 0 {
                    self.port
                        .setup_datagram(idx, command, AlStatusAll::PACKED_LEN, &[])?;

                    offsets.push(crate::pdu::FIRST_PAYLOAD);
                } else {
                    let more = i + 1 < addresses.len();

                    offsets.push(self.port.add_datagram(
                        idx,
                        command,
                        more,
                        AlStatusAll::PACKED_LEN,
                        &[],
                    )?);
                }
            }

            self.port.sr_confirm(idx, self.timeouts.register)?;

            self.port.with_rx(idx, |ecat| {
                offsets
                    .iter()
                    .map(|offset| {
                        ecat.get(*offset..*offset + AlStatusAll::PACKED_LEN)
                            .ok_or(Error::Pdu(crate::error::PduError::Decode))
                            .and_then(|raw| {
                                AlStatusAll::unpack_from_slice(raw).map_err(Error::from)
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })?
        })();

        self.port.set_buf_state(idx, crate::port::BufState::Empty);

        result
    }

    /// Request an AL state for one SubDevice, or for all via broadcast when
    /// `position` is 0. Does not wait for the transition; poll with
    /// [`state_check`](Self::state_check).
    pub fn write_state(&mut self, position: u16, control: AlControl) -> Result<u16, Error> {
        let wkc = if position == 0 {
            Command::bwr(RegisterAddress::AlControl).send(
                &self.port,
                control,
                self.timeouts.register,
            )?
        } else {
            let subdevice = self
                .subdevices
                .get_mut(usize::from(position))
                .ok_or(Error::NotFound {
                    item: crate::error::Item::SubDevice,
                    index: Some(usize::from(position)),
                })?;

            subdevice.state = control.state;

            Command::fpwr(subdevice.configured_address, RegisterAddress::AlControl).send(
                &self.port,
                control,
                self.timeouts.register,
            )?
        };

        Ok(wkc)
    }

    /// Poll a SubDevice (or the whole network for `position` 0) until it
    /// reaches the requested state or the timeout elapses. Returns the state
    /// observed last.
    pub fn state_check(
        &mut self,
        position: u16,
        request: AlState,
        timeout: Duration,
    ) -> Result<AlState, Error> {
        if usize::from(position) > self.subdevice_count() {
            return Ok(AlState::None);
        }

        let deadline = std::time::Instant::now() + timeout;

        loop {
            let raw = if position == 0 {
                Command::brd(RegisterAddress::AlStatus)
                    .receive::<u16>(&self.port, self.timeouts.pdu)
                    .map(|(raw, _wkc)| raw)
            } else {
                let configured_address =
                    self.subdevices[usize::from(position)].configured_address;

                Command::fprd(configured_address, RegisterAddress::AlStatus)
                    .receive::<AlStatusAll>(&self.port, self.timeouts.pdu)
                    .map(|(all, _wkc)| {
                        let subdevice = &mut self.subdevices[usize::from(position)];

                        subdevice.al_status_code = all.code;
                        subdevice.al_error = all.status.error;

                        u16::from(all.status.state.nibble())
                            | if all.status.error { 0x10 } else { 0 }
                    })
            };

            match raw {
                Ok(raw) => {
                    let state = AlState::from_nibble(raw);

                    self.subdevices[usize::from(position)].state = state;

                    if state == request {
                        return Ok(state);
                    }

                    if std::time::Instant::now() >= deadline {
                        return Ok(state);
                    }
                }
                // Lost frames during a transition are expected; keep polling
                Err(Error::Timeout) => {
                    if std::time::Instant::now() >= deadline {
                        return Ok(AlState::None);
                    }
                }
                Err(e) => return Err(e),
            }

            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::sim::SimNic;

    pub(crate) fn sim_maindevice(nic: SimNic) -> MainDevice {
        MainDevice::with_port(Port::new(Box::new(nic), None))
    }

    #[test]
    fn uniform_broadcast_updates_all_records() {
        // Two SubDevices, both in OP: BRD responds with state 0x08, WKC 2
        let nic = SimNic::new(|ecat: &mut [u8]| {
            let pdu = crate::pdu::first_pdu(ecat).unwrap();

            ecat[pdu.payload..pdu.payload + 2].copy_from_slice(&0x0008u16.to_le_bytes());
            ecat[pdu.payload + pdu.len..pdu.payload + pdu.len + 2]
                .copy_from_slice(&2u16.to_le_bytes());
        });

        let mut maindevice = sim_maindevice(nic);

        maindevice.subdevices.push(SubDevice::default());
        maindevice.subdevices.push(SubDevice::default());

        assert_eq!(maindevice.read_state().unwrap(), AlState::Op);

        assert!(maindevice
            .subdevices()
            .iter()
            .all(|subdevice| subdevice.state == AlState::Op));
    }

    #[test]
    fn state_check_returns_observed_state() {
        // SubDevice stuck in SAFE-OP + ERROR
        let nic = SimNic::new(|ecat: &mut [u8]| {
            let pdu = crate::pdu::first_pdu(ecat).unwrap();

            ecat[pdu.payload..pdu.payload + 2].copy_from_slice(&0x0014u16.to_le_bytes());

            if pdu.len >= 6 {
                // AL status code: invalid output configuration
                ecat[pdu.payload + 4..pdu.payload + 6]
                    .copy_from_slice(&0x001du16.to_le_bytes());
            }

            ecat[pdu.payload + pdu.len..pdu.payload + pdu.len + 2]
                .copy_from_slice(&1u16.to_le_bytes());
        });

        let mut maindevice = sim_maindevice(nic);

        maindevice.subdevices.push(SubDevice {
            configured_address: 0x1001,
            ..SubDevice::default()
        });

        let observed = maindevice
            .state_check(1, AlState::Op, Duration::from_millis(5))
            .unwrap();

        assert_eq!(observed, AlState::SafeOp);
        assert_eq!(
            maindevice.subdevices()[1].al_status_code,
            AlStatusCode::InvalidOutputConfiguration
        );
        assert!(maindevice.subdevices()[1].al_error);
    }
}
