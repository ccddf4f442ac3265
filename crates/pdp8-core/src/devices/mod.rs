use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::{DeviceStatus, Peripheral, Submit, TickContext, TransferRequest};

/// Programmable real-time clock.
pub mod clock;

/// TC08-style controller with two TU56 transports.
pub mod dectape;

/// Fixed-head disks addressed by sector.
pub mod disk;

/// Paper tape reader/punch stations (teletype and high-speed).
pub mod paper_tape;

use clock::{ClockState, ProgrammableClock};
use dectape::{DecTape, TapeState};
use disk::{DiskState, FixedDisk};
use paper_tape::{PaperTape, PaperTapeState};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceKind {
    Teletype,
    HighSpeedTape,
    DecTape,
    Disk,
    Clock,
}

/// Incremental state change raised by a device.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceEvent {
    ReaderPos { pos: usize },
    Punch { byte: u8 },
    ActiveState { active: bool },
    PaperTape(PaperTapeState),
    TapeStates(Vec<TapeState>),
    Disk(DiskState),
    /// The set of stored images changed (a disk unit was replaced).
    StateListChanged,
    Clock(ClockState),
}

/// Every peripheral family, as one tagged union.
pub enum Device {
    PaperTape(PaperTape),
    DecTape(DecTape),
    Disk(FixedDisk),
    Clock(ProgrammableClock),
}

impl Device {
    pub fn as_paper_tape_mut(&mut self) -> Option<&mut PaperTape> {
        match self {
            Device::PaperTape(tape) => Some(tape),
            _ => None,
        }
    }

    pub fn as_dectape_mut(&mut self) -> Option<&mut DecTape> {
        match self {
            Device::DecTape(tape) => Some(tape),
            _ => None,
        }
    }

    pub fn as_disk_mut(&mut self) -> Option<&mut FixedDisk> {
        match self {
            Device::Disk(disk) => Some(disk),
            _ => None,
        }
    }

    pub fn as_paper_tape(&self) -> Option<&PaperTape> {
        match self {
            Device::PaperTape(tape) => Some(tape),
            _ => None,
        }
    }

    pub fn as_dectape(&self) -> Option<&DecTape> {
        match self {
            Device::DecTape(tape) => Some(tape),
            _ => None,
        }
    }

    pub fn as_disk(&self) -> Option<&FixedDisk> {
        match self {
            Device::Disk(disk) => Some(disk),
            _ => None,
        }
    }
}

macro_rules! each_device {
    ($self:expr, $dev:ident => $body:expr) => {
        match $self {
            Device::PaperTape($dev) => $body,
            Device::DecTape($dev) => $body,
            Device::Disk($dev) => $body,
            Device::Clock($dev) => $body,
        }
    };
}

impl Peripheral for Device {
    fn name(&self) -> &str {
        each_device!(self, d => d.name())
    }

    fn kind(&self) -> DeviceKind {
        each_device!(self, d => d.kind())
    }

    fn device_codes(&self) -> &[u8] {
        each_device!(self, d => d.device_codes())
    }

    fn status(&self) -> DeviceStatus {
        each_device!(self, d => d.status())
    }

    fn submit_transfer(&mut self, request: &TransferRequest, ctx: &mut TickContext<'_>) -> Submit {
        each_device!(self, d => d.submit_transfer(request, ctx))
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) {
        each_device!(self, d => d.tick(ctx))
    }

    fn cancel(&mut self, code: u8) {
        each_device!(self, d => d.cancel(code))
    }

    fn pacing_hint(&self) -> Option<Duration> {
        each_device!(self, d => d.pacing_hint())
    }

    fn snapshot(&self) -> Vec<DeviceEvent> {
        each_device!(self, d => d.snapshot())
    }
}
