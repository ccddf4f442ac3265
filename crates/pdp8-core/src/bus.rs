//! IO control block polling.
//!
//! The IO region holds one 32-byte slot per PDP-8 device code:
//!
//! | offset | register | contents |
//! |--------|----------|----------|
//! | +0x00 | control | request, done, interrupt enable, opcode, unit |
//! | +0x04 | data | 12-bit data buffer |
//! | +0x08 | status | [`status`] bits posted by the device |
//! | +0x0C | block | sector or block number |
//! | +0x10 | count | word count |
//! | +0x14 | mem addr | 15-bit core address for block transfers |
//!
//! The hardware raises the request bit when the processor issues an IOT for
//! the slot. Each tick the bus consumes raised requests, hands them to the
//! owning peripheral and posts the outcome. A request whose transfer cannot
//! finish in one tick stays in flight until the peripheral completes it from
//! a later `tick`; further requests on that slot wait, with their request bit
//! still raised, until then.

use std::time::Duration;

use crossbeam_channel as cb;
use log::{debug, info, trace};
use thiserror::Error;

use crate::devices::{Device, DeviceEvent, DeviceKind};
use crate::hardware::{CoreMemory, Region};

pub const SLOT_COUNT: usize = 64;
pub const SLOT_STRIDE: usize = 0x20;

pub mod reg {
    pub const CONTROL: usize = 0x00;
    pub const DATA: usize = 0x04;
    pub const STATUS: usize = 0x08;
    pub const BLOCK: usize = 0x0C;
    pub const COUNT: usize = 0x10;
    pub const MEM_ADDR: usize = 0x14;
}

pub mod control {
    pub const REQUEST: u16 = 1 << 0;
    pub const DONE: u16 = 1 << 1;
    pub const INT_ENABLE: u16 = 1 << 2;
    pub const OPCODE_SHIFT: u16 = 4;
    pub const OPCODE_MASK: u16 = 0x3 << OPCODE_SHIFT;
    pub const UNIT_SHIFT: u16 = 8;
    pub const UNIT_MASK: u16 = 0x7 << UNIT_SHIFT;
}

pub mod status {
    pub const READY: u16 = 1 << 0;
    pub const BUSY: u16 = 1 << 1;
    pub const ERROR: u16 = 1 << 2;
    pub const ADDRESS_ERROR: u16 = 1 << 3;
    pub const NOT_SELECTED: u16 = 1 << 4;
    pub const END_OF_TAPE: u16 = 1 << 5;
    pub const INTERRUPT: u16 = 1 << 6;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    Status,
    /// Motion, rate selection or activation; meaning depends on the device.
    Control,
}

impl Direction {
    fn from_control(word: u16) -> Self {
        match (word & control::OPCODE_MASK) >> control::OPCODE_SHIFT {
            0 => Direction::Read,
            1 => Direction::Write,
            2 => Direction::Status,
            _ => Direction::Control,
        }
    }

    fn opcode(self) -> u16 {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
            Direction::Status => 2,
            Direction::Control => 3,
        }
    }
}

/// One decoded request, consumed exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferRequest {
    pub device: u8,
    pub direction: Direction,
    pub data: u16,
    pub unit: u8,
    pub block: u16,
    pub count: u16,
    pub mem_addr: u16,
}

impl TransferRequest {
    pub fn new(device: u8, direction: Direction, data: u16) -> Self {
        Self {
            device,
            direction,
            data,
            unit: 0,
            block: 0,
            count: 0,
            mem_addr: 0,
        }
    }

    /// Control word the hardware would raise for this request.
    pub fn control_word(&self) -> u16 {
        control::REQUEST
            | (self.direction.opcode() << control::OPCODE_SHIFT)
            | ((u16::from(self.unit) << control::UNIT_SHIFT) & control::UNIT_MASK)
    }
}

/// Outcome posted back into a slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Completion {
    pub data: Option<u16>,
    pub status: u16,
    /// Raise the done flag (and with it the interrupt, when enabled).
    pub flag: bool,
    /// Lower the done flag. Status requests leave the flag alone unless the
    /// device acknowledges it this way.
    pub ack: bool,
}

impl Completion {
    pub fn done() -> Self {
        Self::raise(0)
    }

    /// Flag without data, e.g. an interval elapsed or a reader stopped.
    pub fn raise(status: u16) -> Self {
        Self {
            status,
            flag: true,
            ..Self::default()
        }
    }

    pub fn with_data(data: u16) -> Self {
        Self {
            data: Some(data),
            flag: true,
            ..Self::default()
        }
    }

    pub fn status_only(status: u16) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Status that also clears a flag the device raised on its own.
    pub fn acknowledge(status: u16) -> Self {
        Self {
            status,
            ack: true,
            ..Self::default()
        }
    }

    pub fn failed(status: u16) -> Self {
        Self::raise(status | self::status::ERROR)
    }
}

pub enum Submit {
    Complete(Completion),
    /// The device finishes the transfer from a later `tick`.
    Pending,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    Ready,
    Busy,
    Error,
}

impl DeviceStatus {
    fn bits(self) -> u16 {
        match self {
            DeviceStatus::Ready => status::READY,
            DeviceStatus::Busy => status::BUSY,
            DeviceStatus::Error => status::ERROR,
        }
    }
}

/// Buffers a device fills during one call. The bus drains them afterwards;
/// tests inspect them directly.
#[derive(Default)]
pub struct TickScratch {
    completions: Vec<(u8, Completion)>,
    status_updates: Vec<(u8, u16)>,
    events: Vec<DeviceEvent>,
}

impl TickScratch {
    pub fn context<'a>(&'a mut self, elapsed: Duration, core: &'a CoreMemory) -> TickContext<'a> {
        TickContext {
            elapsed,
            core,
            scratch: self,
        }
    }

    pub fn completions(&self) -> &[(u8, Completion)] {
        &self.completions
    }

    pub fn status_updates(&self) -> &[(u8, u16)] {
        &self.status_updates
    }

    pub fn events(&self) -> &[DeviceEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.completions.clear();
        self.status_updates.clear();
        self.events.clear();
    }
}

/// Per-call view a peripheral gets of the machine.
pub struct TickContext<'a> {
    pub elapsed: Duration,
    pub core: &'a CoreMemory,
    scratch: &'a mut TickScratch,
}

impl TickContext<'_> {
    /// Finishes the in-flight transfer on `code`, or posts an unsolicited
    /// completion when none is in flight.
    pub fn complete(&mut self, code: u8, completion: Completion) {
        self.scratch.completions.push((code, completion));
    }

    /// ORs status bits into a slot without touching the done flag or the
    /// in-flight transfer.
    pub fn post_status(&mut self, code: u8, bits: u16) {
        self.scratch.status_updates.push((code, bits));
    }

    pub fn emit(&mut self, event: DeviceEvent) {
        self.scratch.events.push(event);
    }
}

/// Contract every peripheral state machine implements.
pub trait Peripheral: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> DeviceKind;
    /// Device codes (IO slots) this peripheral answers.
    fn device_codes(&self) -> &[u8];
    fn status(&self) -> DeviceStatus;
    fn submit_transfer(&mut self, request: &TransferRequest, ctx: &mut TickContext<'_>) -> Submit;
    /// Advances the device by one bus cycle. Idle devices return at once.
    fn tick(&mut self, ctx: &mut TickContext<'_>);
    /// Abandons the in-flight transfer on `code`. Progress made so far stays.
    fn cancel(&mut self, _code: u8) {}
    /// Finest spacing the device needs between ticks, if any.
    fn pacing_hint(&self) -> Option<Duration> {
        None
    }
    /// Current state as a list of events, for snapshots.
    fn snapshot(&self) -> Vec<DeviceEvent>;
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BusError {
    #[error("device code {code:o} is outside the IO block")]
    CodeOutOfRange { code: u8 },
    #[error("device code {code:o} already belongs to {owner}")]
    CodeInUse { code: u8, owner: String },
    #[error("a device named {0:?} is already registered")]
    DuplicateName(String),
}

/// A device event tagged with the name of the device that raised it.
#[derive(Clone, Debug, PartialEq)]
pub struct BusEvent {
    pub device: String,
    pub event: DeviceEvent,
}

pub struct DeviceBus {
    io: Region,
    core: CoreMemory,
    devices: Vec<Device>,
    owners: [Option<usize>; SLOT_COUNT],
    in_flight: [bool; SLOT_COUNT],
    cancel_requests: Vec<u8>,
    subscribers: Vec<cb::Sender<BusEvent>>,
    ticks: u64,
}

impl DeviceBus {
    pub fn new(io: Region, core: CoreMemory) -> Self {
        Self {
            io,
            core,
            devices: Vec::new(),
            owners: [None; SLOT_COUNT],
            in_flight: [false; SLOT_COUNT],
            cancel_requests: Vec::new(),
            subscribers: Vec::new(),
            ticks: 0,
        }
    }

    pub fn register(&mut self, device: Device) -> Result<(), BusError> {
        if self.device(device.name()).is_some() {
            return Err(BusError::DuplicateName(device.name().to_string()));
        }
        for &code in device.device_codes() {
            let slot = code as usize;
            if slot >= SLOT_COUNT {
                return Err(BusError::CodeOutOfRange { code });
            }
            if let Some(owner) = self.owners[slot] {
                return Err(BusError::CodeInUse {
                    code,
                    owner: self.devices[owner].name().to_string(),
                });
            }
        }

        let index = self.devices.len();
        for &code in device.device_codes() {
            self.owners[code as usize] = Some(index);
            self.io.write16(slot_base(code) + reg::STATUS, device.status().bits());
        }
        info!(
            "Bus: registered {} ({:?}) on codes {:?}",
            device.name(),
            device.kind(),
            device
                .device_codes()
                .iter()
                .map(|c| format!("{c:02o}"))
                .collect::<Vec<_>>()
        );
        self.devices.push(device);
        Ok(())
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name() == name)
    }

    /// First device of `kind` in registration order.
    pub fn first_of(&self, kind: DeviceKind) -> Option<&Device> {
        self.devices.iter().find(|d| d.kind() == kind)
    }

    pub fn core(&self) -> &CoreMemory {
        &self.core
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn is_in_flight(&self, code: u8) -> bool {
        self.in_flight.get(code as usize).copied().unwrap_or(false)
    }

    /// Smallest pacing hint among registered devices.
    pub fn pacing_hint(&self) -> Option<Duration> {
        self.devices.iter().filter_map(|d| d.pacing_hint()).min()
    }

    /// Registers an observer. Events arrive in tick order.
    pub fn subscribe(&mut self) -> cb::Receiver<BusEvent> {
        let (tx, rx) = cb::unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Abandons the in-flight transfer on `code` at the start of the next
    /// tick.
    pub fn cancel(&mut self, code: u8) {
        self.cancel_requests.push(code);
    }

    /// Every device's current state, tagged with its name.
    pub fn snapshot_events(&self) -> Vec<BusEvent> {
        self.devices
            .iter()
            .flat_map(|d| {
                d.snapshot().into_iter().map(|event| BusEvent {
                    device: d.name().to_string(),
                    event,
                })
            })
            .collect()
    }

    /// Runs `f` against a named device between ticks. Completions and events
    /// it produces are posted exactly as if they came from a tick.
    pub fn with_device<R>(
        &mut self,
        name: &str,
        f: impl FnOnce(&mut Device, &mut TickContext<'_>) -> R,
    ) -> Option<R> {
        let index = self.devices.iter().position(|d| d.name() == name)?;
        let mut scratch = TickScratch::default();
        let result = {
            let mut ctx = scratch.context(Duration::ZERO, &self.core);
            f(&mut self.devices[index], &mut ctx)
        };
        self.drain(index, scratch);
        Some(result)
    }

    /// One bus cycle: advance every device by `elapsed`, then consume raised
    /// requests.
    pub fn tick(&mut self, elapsed: Duration) {
        self.ticks += 1;

        for code in std::mem::take(&mut self.cancel_requests) {
            let Some(owner) = self.owners.get(code as usize).copied().flatten() else {
                continue;
            };
            if self.in_flight[code as usize] {
                debug!("Bus: abandoning transfer on {code:02o}");
                self.devices[owner].cancel(code);
                self.in_flight[code as usize] = false;
            }
        }

        for index in 0..self.devices.len() {
            self.run_device(index, elapsed, |device, ctx| device.tick(ctx));
        }

        for slot in 0..SLOT_COUNT {
            let Some(owner) = self.owners[slot] else {
                continue;
            };
            let code = slot as u8;
            let base = slot_base(code);
            let word = self.io.read16(base + reg::CONTROL);
            if word & control::REQUEST == 0 {
                continue;
            }
            if self.in_flight[slot] {
                // Leave the request raised; it is picked up again once the
                // current transfer completes.
                trace!("Bus: {code:02o} busy, deferring request");
                continue;
            }

            let request = TransferRequest {
                device: code,
                direction: Direction::from_control(word),
                data: self.io.read16(base + reg::DATA) & 0o7777,
                unit: ((word & control::UNIT_MASK) >> control::UNIT_SHIFT) as u8,
                block: self.io.read16(base + reg::BLOCK),
                count: self.io.read16(base + reg::COUNT),
                mem_addr: self.io.read16(base + reg::MEM_ADDR) & 0o77777,
            };
            // A status poll must not eat a flag the processor has yet to see.
            let consumed = match request.direction {
                Direction::Status => control::REQUEST,
                _ => control::REQUEST | control::DONE,
            };
            self.io.update16(base + reg::CONTROL, |w| w & !consumed);
            trace!("Bus: {request:?}");

            self.in_flight[slot] = true;
            self.run_device(owner, Duration::ZERO, |device, ctx| {
                match device.submit_transfer(&request, ctx) {
                    Submit::Complete(completion) => ctx.complete(code, completion),
                    Submit::Pending => ctx.post_status(code, status::BUSY),
                }
            });
        }
    }

    fn run_device(
        &mut self,
        index: usize,
        elapsed: Duration,
        f: impl FnOnce(&mut Device, &mut TickContext<'_>),
    ) {
        let mut scratch = TickScratch::default();
        {
            let mut ctx = scratch.context(elapsed, &self.core);
            f(&mut self.devices[index], &mut ctx);
        }
        self.drain(index, scratch);
    }

    fn drain(&mut self, index: usize, scratch: TickScratch) {
        let TickScratch {
            completions,
            status_updates,
            events,
        } = scratch;
        // Completions rewrite STATUS; extra bits land on top of them.
        for (code, completion) in completions {
            if self.owns(index, code) {
                self.post(index, code, completion);
            }
        }
        for (code, bits) in status_updates {
            if self.owns(index, code) {
                self.io.update16(slot_base(code) + reg::STATUS, |s| s | bits);
            }
        }
        self.broadcast(index, events);
    }

    fn owns(&self, index: usize, code: u8) -> bool {
        let owned = self.owners.get(code as usize).copied().flatten() == Some(index);
        if !owned {
            debug!(
                "Bus: {} posted to {code:02o}, which it does not own",
                self.devices[index].name()
            );
        }
        owned
    }

    fn post(&mut self, index: usize, code: u8, completion: Completion) {
        let base = slot_base(code);
        if let Some(data) = completion.data {
            self.io.write16(base + reg::DATA, data & 0o7777);
        }
        let device_bits = self.devices[index].status().bits();
        let mut bits = completion.status | device_bits;
        if completion.flag {
            if self.io.read16(base + reg::CONTROL) & control::INT_ENABLE != 0 {
                bits |= status::INTERRUPT;
            }
            self.io.update16(base + reg::CONTROL, |w| w | control::DONE);
        } else if completion.ack {
            self.io.update16(base + reg::CONTROL, |w| w & !control::DONE);
        }
        self.io.write16(base + reg::STATUS, bits);
        self.in_flight[code as usize] = false;
    }

    fn broadcast(&mut self, index: usize, events: Vec<DeviceEvent>) {
        if events.is_empty() {
            return;
        }
        let name = self.devices[index].name().to_string();
        for event in events {
            let bus_event = BusEvent {
                device: name.clone(),
                event,
            };
            self.subscribers
                .retain(|tx| tx.send(bus_event.clone()).is_ok());
        }
    }
}

pub const fn slot_base(code: u8) -> usize {
    code as usize * SLOT_STRIDE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::clock::{ClockRate, ProgrammableClock};
    use crate::hardware::SharedHardwareMap;

    fn bus() -> (SharedHardwareMap, DeviceBus) {
        let map = SharedHardwareMap::in_memory();
        let bus = DeviceBus::new(map.io().clone(), map.core_memory());
        (map, bus)
    }

    #[test]
    fn rejects_overlapping_device_codes() {
        let (_map, mut bus) = bus();
        bus.register(Device::Clock(ProgrammableClock::new("clk", 0o13, ClockRate::Hz60)))
            .unwrap();
        let err = bus
            .register(Device::Clock(ProgrammableClock::new("clk2", 0o13, ClockRate::Hz60)))
            .unwrap_err();
        assert_eq!(
            err,
            BusError::CodeInUse {
                code: 0o13,
                owner: "clk".to_string()
            }
        );
        let err = bus
            .register(Device::Clock(ProgrammableClock::new("clk", 0o14, ClockRate::Hz60)))
            .unwrap_err();
        assert_eq!(err, BusError::DuplicateName("clk".to_string()));
    }

    #[test]
    fn control_word_round_trips_through_decode() {
        let mut request = TransferRequest::new(0o76, Direction::Status, 0);
        request.unit = 1;
        let word = request.control_word();
        assert_ne!(word & control::REQUEST, 0);
        assert_eq!(Direction::from_control(word), Direction::Status);
        assert_eq!((word & control::UNIT_MASK) >> control::UNIT_SHIFT, 1);
    }

    #[test]
    fn unowned_slots_are_ignored() {
        let (map, mut bus) = bus();
        let base = slot_base(0o40);
        map.io().write16(base, control::REQUEST);
        bus.tick(Duration::from_millis(1));
        assert_eq!(map.io().read16(base), control::REQUEST);
    }
}
