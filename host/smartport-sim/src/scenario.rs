//! A bench run: a chain of RAM disks on the simulated bus, and a scripted host that resets the
//! bus, numbers the chain with INIT, then reads and writes random blocks.

use crate::ramdisk::{Block, RamDisk};
use color_eyre::eyre::{self, bail, ensure, eyre, WrapErr};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use smartport_bus::sim::{decode_pulses, HostStep, SimBus};
use smartport_bus::{BusArbiter, BusConfig, DeviceHandle, Phase, ServiceEvent};
use smartport_common::packet::{
    decode_data_packet, encode_command_packet, encode_packet, verify_checksum, Envelope,
};
use smartport_common::{packet_type, status, CommandCode, BLOCK_LEN, HOST_ID, PACKET_BUFFER_LEN};
use std::collections::HashMap;

/// How long the host holds the bus in reset, in ticks.
const RESET_TICKS: u64 = 2_000;
/// Host pause before each transfer, in ticks.
const TURNAROUND_TICKS: u64 = 200;
/// How long the host keeps REQ up after the device drops ACK at the end of a reply.
const REPLY_RELEASE_TICKS: u64 = 20;
/// Consecutive receive timeouts after which the host is taken to have stalled.
const MAX_IDLE_POLLS: usize = 16;

#[derive(Debug, Clone)]
pub struct Options {
    pub devices: usize,
    pub blocks: usize,
    pub operations: usize,
    pub seed: u64,
    pub first_unit: u8,
}

#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Report {
    pub inits: usize,
    pub reads: usize,
    pub writes: usize,
    pub ticks: u64,
}

/// A reply the host listens for, and what it should contain.
enum Expect {
    Init { unit: u8, last: bool },
    Block { unit: u8, block: usize, written: Option<Block> },
    WriteStatus { unit: u8 },
}

fn command_packet(unit: u8, code: CommandCode, block: usize) -> eyre::Result<Vec<u8>> {
    let [lo, mid, hi, _] = (block as u32).to_le_bytes();
    let payload = [code as u8, 0x03, 0x00, 0x20, lo, mid, hi, 0x00, 0x00];
    let mut buf = [0u8; 64];
    let end = encode_command_packet(&mut buf, unit, &payload)?;
    Ok(buf[..end].to_vec())
}

fn data_packet(unit: u8, block: &Block) -> eyre::Result<Vec<u8>> {
    let mut buf = vec![0u8; PACKET_BUFFER_LEN];
    buf[..BLOCK_LEN].copy_from_slice(block);
    let envelope = Envelope {
        dest: unit,
        source: HOST_ID,
        packet_type: packet_type::DATA,
        aux: 0x80,
        stat: 0x80,
    };
    let end = encode_packet(&mut buf, BLOCK_LEN, envelope)?;
    buf.truncate(end);
    Ok(buf)
}

fn random_block(rng: &mut StdRng) -> Block {
    let mut block = [0u8; BLOCK_LEN];
    rng.fill_bytes(&mut block);
    block
}

pub fn run(options: &Options) -> eyre::Result<Report> {
    ensure!(options.devices > 0, "no devices to put on the bus");
    ensure!(options.blocks > 0, "disks need at least one block");
    ensure!(
        options.first_unit & 0x80 != 0,
        "unit {:#04x} has bit 7 clear and cannot go on the bus",
        options.first_unit
    );
    let units = (0..options.devices)
        .map(|k| {
            u8::try_from(options.first_unit as usize + k)
                .map_err(|_| eyre!("unit identities run past {:#04x}", u8::MAX))
        })
        .collect::<eyre::Result<Vec<u8>>>()?;

    let mut rng = StdRng::seed_from_u64(options.seed);
    let bus = SimBus::new();
    let config = BusConfig {
        number_chain: true,
        ..SimBus::config()
    };
    let mut arbiter = BusArbiter::new(bus.pins(), bus.counter(), config);

    let mut images: HashMap<DeviceHandle, Vec<Block>> = HashMap::new();
    for k in 0..options.devices {
        let blocks: Vec<Block> = (0..options.blocks).map(|_| random_block(&mut rng)).collect();
        let disk = RamDisk::new(format!("ramdisk{k}"), blocks.clone());
        let identity = u8::try_from(k + 1)
            .map_err(|_| eyre!("more than {} devices on one chain", u8::MAX))?;
        let handle = arbiter.chain_mut().attach(Box::new(disk), identity);
        images.insert(handle, blocks);
    }

    bus.set_phase(Phase::Reset);
    bus.schedule_phase(RESET_TICKS, Phase::Enable);

    let mut steps = Vec::new();
    let mut expect = Vec::new();
    for (k, &unit) in units.iter().enumerate() {
        let delay = if k == 0 {
            RESET_TICKS + TURNAROUND_TICKS
        } else {
            TURNAROUND_TICKS
        };
        steps.push(HostStep::send(&command_packet(unit, CommandCode::Init, 0)?, delay));
        steps.push(HostStep::receive(REPLY_RELEASE_TICKS));
        expect.push(Expect::Init {
            unit,
            last: k + 1 == units.len(),
        });
    }

    let mut written: HashMap<(u8, usize), Block> = HashMap::new();
    for _ in 0..options.operations {
        let unit = units[rng.gen_range(0..units.len())];
        let block = rng.gen_range(0..options.blocks);
        if rng.gen_bool(0.25) {
            let data = random_block(&mut rng);
            let command = command_packet(unit, CommandCode::WriteBlock, block)?;
            steps.push(HostStep::send(&command, TURNAROUND_TICKS));
            steps.push(HostStep::send(&data_packet(unit, &data)?, TURNAROUND_TICKS));
            steps.push(HostStep::receive(REPLY_RELEASE_TICKS));
            expect.push(Expect::WriteStatus { unit });
            written.insert((unit, block), data);
        } else {
            let command = command_packet(unit, CommandCode::ReadBlock, block)?;
            steps.push(HostStep::send(&command, TURNAROUND_TICKS));
            steps.push(HostStep::receive(REPLY_RELEASE_TICKS));
            expect.push(Expect::Block {
                unit,
                block,
                written: written.get(&(unit, block)).copied(),
            });
        }
    }
    info!(
        "[sim]: {} devices, {} host steps, seed {}",
        options.devices,
        steps.len(),
        options.seed
    );
    bus.script(steps);

    let mut report = Report::default();
    let mut idle_polls = 0;
    while !bus.script_done() {
        let event = arbiter
            .service_once()
            .wrap_err_with(|| format!("servicing the bus at tick {}", bus.now()))?;
        match event {
            ServiceEvent::Timeout(stage) => {
                idle_polls += 1;
                if idle_polls > MAX_IDLE_POLLS {
                    bail!("host script stalled at tick {} ({stage:?})", bus.now());
                }
                continue;
            }
            ServiceEvent::Idle | ServiceEvent::Reset => {}
            ServiceEvent::Init { .. } => report.inits += 1,
            ServiceEvent::Dispatched { unit, code } => {
                debug!("[sim]: unit {unit:02x} handled {code:02x}")
            }
            ServiceEvent::NotAddressed { unit } => bail!("nothing answered to unit {unit:02x}"),
            ServiceEvent::Unclaimed { unit } => bail!("INIT for {unit:02x} went unclaimed"),
            ServiceEvent::Rejected(e) => bail!("bus dropped a host packet: {e}"),
        }
        idle_polls = 0;
    }
    report.ticks = bus.now();

    let by_unit: HashMap<u8, DeviceHandle> = arbiter
        .chain()
        .handles()
        .filter_map(|h| Some((arbiter.chain().unit(h)?, h)))
        .collect();
    let captures = bus.captures();
    ensure!(
        captures.len() == expect.len(),
        "host heard {} replies, expected {}",
        captures.len(),
        expect.len()
    );
    for (capture, expect) in captures.iter().zip(&expect) {
        let mut bytes = decode_pulses(capture, SimBus::CELL_TICKS);
        bytes.push(0);
        match expect {
            &Expect::Init { unit, last } => {
                let header = verify_checksum(&bytes).wrap_err("INIT reply")?;
                let stat = if last {
                    status::LAST_DEVICE
                } else {
                    status::NOT_LAST_DEVICE
                };
                ensure!(
                    (header.src, header.stat) == (unit, stat),
                    "INIT reply {:02x}/{:02x}, expected {unit:02x}/{stat:02x}",
                    header.src,
                    header.stat
                );
            }
            &Expect::WriteStatus { unit } => {
                let header = verify_checksum(&bytes).wrap_err("write status")?;
                ensure!(
                    header.packet_type == packet_type::WRITE_STATUS && header.stat == status::OK,
                    "unit {unit:02x} reported write status {:02x}",
                    header.stat
                );
                report.writes += 1;
            }
            Expect::Block {
                unit,
                block,
                written,
            } => {
                let decoded = decode_data_packet(&mut bytes)
                    .wrap_err_with(|| format!("unit {unit:02x} block {block}"))?;
                ensure!(decoded.header.src == *unit, "data from {:02x}", decoded.header.src);
                let expected = match written {
                    Some(data) => data,
                    None => by_unit
                        .get(unit)
                        .and_then(|h| images.get(h))
                        .and_then(|image| image.get(*block))
                        .ok_or_else(|| eyre!("no disk behind unit {unit:02x}"))?,
                };
                ensure!(
                    bytes[..BLOCK_LEN] == expected[..],
                    "unit {unit:02x} block {block}: data does not match the disk"
                );
                report.reads += 1;
            }
        }
    }

    arbiter.chain_mut().shutdown_all();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(devices: usize, operations: usize, seed: u64) -> Options {
        Options {
            devices,
            blocks: 4,
            operations,
            seed,
            first_unit: 0x81,
        }
    }

    #[test]
    fn test_single_disk() {
        let report = run(&options(1, 6, 1)).expect("bench run succeeds");
        assert_eq!(report.inits, 1);
        assert_eq!(report.reads + report.writes, 6);
    }

    #[test]
    fn test_chain_of_three() {
        let report = run(&options(3, 10, 0xdead)).expect("bench run succeeds");
        assert_eq!(report.inits, 3);
        assert_eq!(report.reads + report.writes, 10);
    }

    #[test]
    fn test_rejects_empty_chain() {
        assert!(run(&options(0, 1, 0)).is_err());
    }

    #[test]
    fn test_unit_overflow() {
        let mut options = options(3, 0, 0);
        options.first_unit = 0xfe;
        assert!(run(&options).is_err());
    }

    #[test]
    fn test_rejects_unit_without_bit_7() {
        let mut options = options(1, 1, 0);
        options.first_unit = 0x01;
        assert!(run(&options).is_err());
    }

    #[test]
    fn test_too_many_devices() {
        let mut options = options(300, 0, 0);
        options.first_unit = 0x80;
        assert!(run(&options).is_err());
    }
}
