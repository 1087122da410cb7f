use crate::chain::DaisyChain;
use crate::config::BusConfig;
use crate::critical::InterruptGuard;
use crate::device::{Command, DeviceError};
use crate::hal::{BusPins, Counter};
use crate::link::{LinkError, LinkLayer, Stage};
use crate::phase::Phase;
use log::{debug, info, trace, warn};
use smartport_common::packet::{
    encode_init_reply_packet, offset, verify_command_checksum, PacketDump, PacketError,
    PacketHeader,
};
use smartport_common::{status, CommandCode};
use thiserror::Error;

/// What one pass of the service loop did.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ServiceEvent {
    Idle,
    /// A bus reset came and went; every unit identity has been forgotten.
    Reset,
    /// Enable phase, but the host did not go through with a transfer.
    Timeout(Stage),
    /// INIT numbered a device `unit`; `last` is what the reply told the host.
    Init { unit: u8, last: bool },
    /// INIT arrived while numbering the chain, but every device already has a unit identity.
    Unclaimed { unit: u8 },
    Dispatched { unit: u8, code: u8 },
    /// Command for a unit that is not on this chain.
    NotAddressed { unit: u8 },
    /// Frame that does not parse as a command packet, or fails its checksum.
    Rejected(PacketError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum BusError {
    #[error("receive failed: {0}")]
    Receive(LinkError),
    #[error("could not build reply: {0}")]
    Reply(#[from] PacketError),
    #[error("INIT reply not delivered: {0}")]
    InitReply(LinkError),
    #[error("unit {unit:02x}: {source}")]
    Device { unit: u8, source: DeviceError },
}

/// Owns the link and the daisy chain, and runs the bus state machine.
pub struct BusArbiter<P, C> {
    link: LinkLayer<P, C>,
    chain: DaisyChain,
    config: BusConfig,
}

impl<P: BusPins, C: Counter> BusArbiter<P, C> {
    /// Takes over the lines and puts them in their resting state.
    pub fn new(pins: P, counter: C, config: BusConfig) -> Self {
        let mut link = LinkLayer::new(pins, counter, &config);
        link.setup();
        info!("[bus]: lines configured");
        Self {
            link,
            chain: DaisyChain::new(),
            config,
        }
    }

    pub fn chain(&self) -> &DaisyChain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut DaisyChain {
        &mut self.chain
    }

    pub fn link(&mut self) -> &mut LinkLayer<P, C> {
        &mut self.link
    }

    /// Services the bus forever.
    pub fn run(&mut self) -> ! {
        self.link.release_read_data();
        loop {
            match self.service_once() {
                Ok(ServiceEvent::Idle | ServiceEvent::Timeout(_)) => {}
                Ok(event) => debug!("[bus]: {event:?}"),
                Err(e) => warn!("[bus]: {e}"),
            }
        }
    }

    /// One pass of the state machine: sample the phase and act on it.
    pub fn service_once(&mut self) -> Result<ServiceEvent, BusError> {
        self.link.release_ack();
        match Phase::read(self.link.pins()) {
            Phase::Idle => Ok(ServiceEvent::Idle),
            Phase::Reset => {
                info!("[bus]: reset");
                while Phase::read(self.link.pins()) == Phase::Reset {}
                self.chain.clear_units();
                info!("[bus]: reset cleared");
                Ok(ServiceEvent::Reset)
            }
            Phase::Enable => self.service_enable(),
        }
    }

    fn service_enable(&mut self) -> Result<ServiceEvent, BusError> {
        // frames land in the buffer of the device at the head of the chain
        let Some(head) = self.chain.entries_mut().first_mut() else {
            return Ok(ServiceEvent::Idle);
        };
        let buf = head.device.packet_buffer();
        let received = {
            let _guard = InterruptGuard::acquire();
            self.link.receive_frame(buf)
        };
        let len = match received {
            Ok(len) => len,
            Err(LinkError::Timeout(stage)) => return Ok(ServiceEvent::Timeout(stage)),
            Err(e) => return Err(BusError::Receive(e)),
        };
        trace!("[bus]: received {len} bytes\n{}", PacketDump(&buf[..len]));

        let command = match parse_command(buf, len) {
            Ok(command) => command,
            Err(e) => {
                warn!("[bus]: dropping frame: {e}");
                return Ok(ServiceEvent::Rejected(e));
            }
        };
        if self.config.verify_commands {
            if let Err(e) = verify_command_checksum(&buf[..=len]) {
                warn!("[bus]: dropping command for {:02x}: {e}", command.unit);
                return Ok(ServiceEvent::Rejected(e));
            }
        }

        if command.code == CommandCode::Init as u8 {
            self.handle_init(command.unit)
        } else {
            self.dispatch(&command)
        }
    }

    /// Gives a device the unit identity `unit` and answers the host.
    ///
    /// By default the device at the head claims every INIT, renumbering itself if it already
    /// had a unit, and answers as the last device. With [`BusConfig::number_chain`] each INIT
    /// goes to the first device without a unit, and only the last of those answers as last.
    fn handle_init(&mut self, unit: u8) -> Result<ServiceEvent, BusError> {
        let number_chain = self.config.number_chain;
        let entries = self.chain.entries_mut();
        let (i, last) = if number_chain {
            let Some(i) = entries.iter().position(|e| e.unit.is_none()) else {
                warn!("[bus]: INIT for {unit:02x}, but every device is numbered");
                return Ok(ServiceEvent::Unclaimed { unit });
            };
            (i, !entries[i + 1..].iter().any(|e| e.unit.is_none()))
        } else {
            (0, true)
        };
        let stat = if last {
            status::LAST_DEVICE
        } else {
            status::NOT_LAST_DEVICE
        };

        let entry = &mut entries[i];
        let buf = entry.device.packet_buffer();
        encode_init_reply_packet(buf, unit, stat)?;
        self.link.transmit_frame(buf).map_err(BusError::InitReply)?;
        // only claimed once the host has the answer, so a retried INIT lands here again
        entry.unit = Some(unit);
        info!("[bus]: drive {unit:02x} is {}", entry.device.name());
        Ok(ServiceEvent::Init { unit, last })
    }

    fn dispatch(&mut self, command: &Command) -> Result<ServiceEvent, BusError> {
        let unit = command.unit;
        let entries = self.chain.entries_mut();
        let Some(i) = entries.iter().position(|e| e.unit == Some(unit)) else {
            debug!("[bus]: {unit:02x} is not on this chain");
            return Ok(ServiceEvent::NotAddressed { unit });
        };
        if i > 0 {
            let (head, rest) = entries.split_at_mut(1);
            let frame = &head[0].device.packet_buffer()[..=command.len];
            let target = rest[i - 1].device.packet_buffer();
            if target.len() < frame.len() {
                return Err(BusError::Device {
                    unit,
                    source: DeviceError::Link(LinkError::Overrun),
                });
            }
            target[..frame.len()].copy_from_slice(frame);
        }
        entries[i]
            .device
            .process(&mut self.link, command)
            .map_err(|source| BusError::Device { unit, source })?;
        Ok(ServiceEvent::Dispatched {
            unit,
            code: command.code,
        })
    }
}

/// Reads the addressing out of a received command packet.
fn parse_command(buf: &[u8], len: usize) -> Result<Command, PacketError> {
    let frame = &buf[..len];
    let header = PacketHeader::read(frame)?;
    let at = header.begin + offset::COMMAND;
    let code = *frame.get(at).ok_or(PacketError::BufferTooSmall {
        needed: at + 1,
        available: len,
    })?;
    Ok(Command {
        unit: header.dest,
        code,
        begin: header.begin,
        len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{LogicalDevice, Transport};
    use crate::sim::{decode_pulses, HostStep, SimBus, SimCounter, SimPins};
    use smartport_common::packet::{
        encode_command_packet, encode_error_reply_packet, verify_checksum,
    };
    use smartport_common::{packet_type, PACKET_BUFFER_LEN};
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<(Command, Vec<u8>)>>>;

    /// Records what it is asked to do, and answers with an error reply.
    struct Recorder {
        buf: [u8; PACKET_BUFFER_LEN],
        log: Log,
        reply: bool,
    }
    impl LogicalDevice for Recorder {
        fn packet_buffer(&mut self) -> &mut [u8] {
            &mut self.buf
        }
        fn process(
            &mut self,
            link: &mut dyn Transport,
            command: &Command,
        ) -> Result<(), DeviceError> {
            self.log
                .borrow_mut()
                .push((*command, self.buf[..=command.len].to_vec()));
            if self.reply {
                encode_error_reply_packet(&mut self.buf, command.unit)?;
                link.transmit_frame(&self.buf)?;
            }
            Ok(())
        }
    }

    fn recorder(reply: bool) -> (Box<Recorder>, Log) {
        let log = Log::default();
        let device = Box::new(Recorder {
            buf: [0; PACKET_BUFFER_LEN],
            log: log.clone(),
            reply,
        });
        (device, log)
    }

    fn command_frame(unit: u8, code: u8) -> Vec<u8> {
        let mut buf = [0u8; PACKET_BUFFER_LEN];
        let payload = [code, 0x03, 0x00, 0x20, 0x05, 0x00, 0x00, 0x00, 0x00];
        let end = encode_command_packet(&mut buf, unit, &payload).expect("fits");
        buf[..end].to_vec()
    }

    fn arbiter(bus: &SimBus) -> BusArbiter<SimPins, SimCounter> {
        bus.set_phase(Phase::Enable);
        BusArbiter::new(bus.pins(), bus.counter(), SimBus::config())
    }

    fn numbering_arbiter(bus: &SimBus) -> BusArbiter<SimPins, SimCounter> {
        bus.set_phase(Phase::Enable);
        let config = BusConfig {
            number_chain: true,
            ..SimBus::config()
        };
        BusArbiter::new(bus.pins(), bus.counter(), config)
    }

    /// Decodes the `k`th reply the host received, with a terminator appended.
    fn reply(bus: &SimBus, k: usize) -> Vec<u8> {
        let mut bytes = decode_pulses(&bus.captures()[k], SimBus::CELL_TICKS);
        bytes.push(0);
        bytes
    }

    #[test]
    fn test_idle() {
        let bus = SimBus::new();
        let mut arbiter = BusArbiter::new(bus.pins(), bus.counter(), SimBus::config());
        arbiter.chain_mut().attach(recorder(false).0, 0x31);
        assert_eq!(arbiter.service_once(), Ok(ServiceEvent::Idle));
    }

    #[test]
    fn test_enable_without_request() {
        let bus = SimBus::new();
        let mut arbiter = arbiter(&bus);
        arbiter.chain_mut().attach(recorder(false).0, 0x31);
        assert_eq!(
            arbiter.service_once(),
            Ok(ServiceEvent::Timeout(Stage::Request))
        );
    }

    /// Test INIT end to end: the device takes the unit and the host gets a valid reply
    #[test]
    fn test_init() {
        let bus = SimBus::new();
        bus.script([
            HostStep::send(&command_frame(0x81, 0x85), 100),
            HostStep::receive(20),
        ]);
        let mut arbiter = arbiter(&bus);
        let (device, log) = recorder(false);
        let h = arbiter.chain_mut().attach(device, 0x31);

        assert_eq!(
            arbiter.service_once(),
            Ok(ServiceEvent::Init {
                unit: 0x81,
                last: true
            })
        );
        assert_eq!(arbiter.chain().unit(h), Some(0x81));
        assert!(log.borrow().is_empty(), "INIT is not passed to the device");
        assert!(bus.script_done());

        let reply = reply(&bus, 0);
        assert_eq!(reply.len(), 18);
        let header = verify_checksum(&reply).expect("reply checksum validates");
        assert_eq!(header.src, 0x81);
        assert_eq!(header.packet_type, packet_type::STATUS);
        assert_eq!(header.stat, status::LAST_DEVICE);
    }

    /// Test that a reset forgets the unit identity handed out by INIT
    #[test]
    fn test_reset_clears_identity() {
        let bus = SimBus::new();
        bus.script([
            HostStep::send(&command_frame(0x81, 0x85), 100),
            HostStep::receive(20),
        ]);
        let mut arbiter = arbiter(&bus);
        let h = arbiter.chain_mut().attach(recorder(false).0, 0x31);
        assert!(matches!(
            arbiter.service_once(),
            Ok(ServiceEvent::Init { unit: 0x81, .. })
        ));

        bus.set_phase(Phase::Idle);
        assert_eq!(arbiter.service_once(), Ok(ServiceEvent::Idle));
        let now = bus.now();
        bus.schedule_phase(now + 10, Phase::Reset);
        bus.schedule_phase(now + 500, Phase::Idle);
        while arbiter.service_once() == Ok(ServiceEvent::Idle) {
            assert!(bus.now() < now + 500, "reset never seen");
        }
        assert!(bus.now() >= now + 500);
        assert_eq!(arbiter.chain().unit(h), None);
        assert_eq!(arbiter.service_once(), Ok(ServiceEvent::Idle));
    }

    /// Test numbering two devices, then routing commands by unit
    #[test]
    fn test_dispatch() {
        let bus = SimBus::new();
        bus.script([
            HostStep::send(&command_frame(0x81, 0x85), 100),
            HostStep::receive(20),
            HostStep::send(&command_frame(0x82, 0x85), 200),
            HostStep::receive(20),
            HostStep::send(&command_frame(0x82, 0x81), 200),
            HostStep::receive(20),
            HostStep::send(&command_frame(0x81, 0x80), 200),
            HostStep::send(&command_frame(0x89, 0x80), 200),
        ]);
        let mut arbiter = numbering_arbiter(&bus);
        let (back, back_log) = recorder(true);
        let (front, front_log) = recorder(false);
        let back = arbiter.chain_mut().attach(back, 0x31);
        let front = arbiter.chain_mut().attach(front, 0x32);

        assert_eq!(
            arbiter.service_once(),
            Ok(ServiceEvent::Init {
                unit: 0x81,
                last: false
            })
        );
        assert_eq!(
            arbiter.service_once(),
            Ok(ServiceEvent::Init {
                unit: 0x82,
                last: true
            })
        );
        assert_eq!(arbiter.chain().unit(front), Some(0x81));
        assert_eq!(arbiter.chain().unit(back), Some(0x82));
        assert_eq!(verify_checksum(&reply(&bus, 0)).map(|h| h.stat), Ok(0x80));

        // received by the head, copied to the device at the back
        assert_eq!(
            arbiter.service_once(),
            Ok(ServiceEvent::Dispatched {
                unit: 0x82,
                code: 0x81
            })
        );
        let (command, frame) = back_log.borrow()[0].clone();
        assert_eq!(command.unit, 0x82);
        assert_eq!(command.begin, 5);
        assert_eq!(frame[5 + offset::COMMAND], 0x81);
        assert_eq!(frame.last(), Some(&0));
        assert_eq!(verify_command_checksum(&frame), Ok(()));
        let header = verify_checksum(&reply(&bus, 2)).expect("device reply validates");
        assert_eq!((header.src, header.stat), (0x82, status::ERROR_REPLY));

        assert_eq!(
            arbiter.service_once(),
            Ok(ServiceEvent::Dispatched {
                unit: 0x81,
                code: 0x80
            })
        );
        assert_eq!(front_log.borrow().len(), 1);

        assert_eq!(
            arbiter.service_once(),
            Ok(ServiceEvent::NotAddressed { unit: 0x89 })
        );
        assert!(bus.script_done());
    }

    #[test]
    fn test_corrupted_command_rejected() {
        let mut frame = command_frame(0x81, 0x81);
        // a data bit of the command group
        frame[6 + offset::BODY + 5] ^= 0x02;
        let bus = SimBus::new();
        bus.script([HostStep::send(&frame, 100)]);
        let mut arbiter = arbiter(&bus);
        let (device, log) = recorder(false);
        let h = arbiter.chain_mut().attach(device, 0x31);
        arbiter.chain_mut().entries_mut()[0].unit = Some(0x81);

        assert!(matches!(
            arbiter.service_once(),
            Ok(ServiceEvent::Rejected(PacketError::Checksum { .. }))
        ));
        assert!(log.borrow().is_empty());
        assert_eq!(arbiter.chain().unit(h), Some(0x81));
    }

    /// Test that a lost INIT reply is reported and leaves the device unnumbered
    #[test]
    fn test_init_reply_lost() {
        let bus = SimBus::new();
        bus.script([HostStep::send(&command_frame(0x81, 0x85), 100)]);
        let mut arbiter = arbiter(&bus);
        let h = arbiter.chain_mut().attach(recorder(false).0, 0x31);
        assert_eq!(
            arbiter.service_once(),
            Err(BusError::InitReply(LinkError::Timeout(Stage::Request)))
        );
        assert_eq!(arbiter.chain().unit(h), None);
    }

    /// Test that the device at the head answers every INIT as the last device, taking the newest
    /// unit each time
    #[test]
    fn test_init_renumbers() {
        let bus = SimBus::new();
        bus.script([
            HostStep::send(&command_frame(0x81, 0x85), 100),
            HostStep::receive(20),
            HostStep::send(&command_frame(0x82, 0x85), 200),
            HostStep::receive(20),
        ]);
        let mut arbiter = arbiter(&bus);
        let h = arbiter.chain_mut().attach(recorder(false).0, 0x31);

        assert_eq!(
            arbiter.service_once(),
            Ok(ServiceEvent::Init {
                unit: 0x81,
                last: true
            })
        );
        assert_eq!(
            arbiter.service_once(),
            Ok(ServiceEvent::Init {
                unit: 0x82,
                last: true
            })
        );
        assert_eq!(arbiter.chain().unit(h), Some(0x82));
        for (k, unit) in [(0, 0x81), (1, 0x82)] {
            let header = verify_checksum(&reply(&bus, k)).expect("reply validates");
            assert_eq!((header.src, header.stat), (unit, status::LAST_DEVICE));
        }
    }

    /// Test that without chain numbering only the head is numbered, however many devices follow
    #[test]
    fn test_init_claimed_by_head() {
        let bus = SimBus::new();
        bus.script([
            HostStep::send(&command_frame(0x81, 0x85), 100),
            HostStep::receive(20),
        ]);
        let mut arbiter = arbiter(&bus);
        let back = arbiter.chain_mut().attach(recorder(false).0, 0x31);
        let front = arbiter.chain_mut().attach(recorder(false).0, 0x32);

        assert_eq!(
            arbiter.service_once(),
            Ok(ServiceEvent::Init {
                unit: 0x81,
                last: true
            })
        );
        assert_eq!(arbiter.chain().unit(front), Some(0x81));
        assert_eq!(arbiter.chain().unit(back), None);
        let header = verify_checksum(&reply(&bus, 0)).expect("reply validates");
        assert_eq!(header.stat, status::LAST_DEVICE);
    }

    #[test]
    fn test_init_unclaimed() {
        let bus = SimBus::new();
        bus.script([HostStep::send(&command_frame(0x83, 0x85), 100)]);
        let mut arbiter = numbering_arbiter(&bus);
        arbiter.chain_mut().attach(recorder(false).0, 0x31);
        arbiter.chain_mut().entries_mut()[0].unit = Some(0x81);
        assert_eq!(
            arbiter.service_once(),
            Ok(ServiceEvent::Unclaimed { unit: 0x83 })
        );
    }

    #[test]
    fn test_parse_command() {
        let mut buf = [0u8; 64];
        buf[..5].copy_from_slice(&[0xff; 5]);
        let frame = command_frame(0x87, 0x82);
        buf[5..5 + frame.len() - 6].copy_from_slice(&frame[6..]);
        let len = frame.len() - 1;
        let command = parse_command(&buf, len).expect("parses");
        assert_eq!(
            command,
            Command {
                unit: 0x87,
                code: 0x82,
                begin: 5,
                len
            }
        );
        assert_eq!(parse_command(&buf, 3), Err(PacketError::MissingBegin));
        assert!(matches!(
            parse_command(&buf, 10),
            Err(PacketError::BufferTooSmall { .. })
        ));
    }
}
