use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::bus::{
    Completion, DeviceStatus, Direction, Peripheral, Submit, TickContext, TransferRequest, status,
};
use crate::devices::{DeviceEvent, DeviceKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockRate {
    #[serde(rename = "50hz")]
    Hz50,
    #[serde(rename = "60hz")]
    Hz60,
    #[serde(rename = "100hz")]
    Hz100,
    #[serde(rename = "1000hz")]
    Hz1000,
}

impl ClockRate {
    /// Rate selected by the low two data bits of a control request.
    pub fn from_bits(bits: u16) -> Self {
        match bits & 0x3 {
            0 => ClockRate::Hz50,
            1 => ClockRate::Hz60,
            2 => ClockRate::Hz100,
            _ => ClockRate::Hz1000,
        }
    }

    pub fn hz(self) -> u32 {
        match self {
            ClockRate::Hz50 => 50,
            ClockRate::Hz60 => 60,
            ClockRate::Hz100 => 100,
            ClockRate::Hz1000 => 1000,
        }
    }

    pub fn interval(self) -> Duration {
        Duration::from_secs(1) / self.hz()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClockState {
    pub rate: ClockRate,
    pub enabled: bool,
    pub pending: bool,
}

pub struct ProgrammableClock {
    name: String,
    code: [u8; 1],
    rate: ClockRate,
    enabled: bool,
    pending: bool,
    accumulated: Duration,
}

impl ProgrammableClock {
    pub fn new(name: impl Into<String>, code: u8, rate: ClockRate) -> Self {
        Self {
            name: name.into(),
            code: [code],
            rate,
            enabled: true,
            pending: false,
            accumulated: Duration::ZERO,
        }
    }

    pub fn state(&self) -> ClockState {
        ClockState {
            rate: self.rate,
            enabled: self.enabled,
            pending: self.pending,
        }
    }

    pub fn set_rate(&mut self, rate: ClockRate) {
        self.rate = rate;
        self.accumulated = Duration::ZERO;
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.accumulated = Duration::ZERO;
        }
    }
}

impl Peripheral for ProgrammableClock {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Clock
    }

    fn device_codes(&self) -> &[u8] {
        &self.code
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::Ready
    }

    fn submit_transfer(&mut self, request: &TransferRequest, ctx: &mut TickContext<'_>) -> Submit {
        match request.direction {
            Direction::Status => {
                let was_pending = std::mem::take(&mut self.pending);
                if was_pending {
                    ctx.emit(DeviceEvent::Clock(self.state()));
                }
                if was_pending {
                    Submit::Complete(Completion::acknowledge(status::INTERRUPT))
                } else {
                    Submit::Complete(Completion::status_only(0))
                }
            }
            Direction::Control => {
                self.set_rate(ClockRate::from_bits(request.data));
                self.set_enabled(request.data & 0x4 != 0);
                debug!(
                    "{}: {} Hz, {}",
                    self.name,
                    self.rate.hz(),
                    if self.enabled { "enabled" } else { "disabled" }
                );
                ctx.emit(DeviceEvent::Clock(self.state()));
                Submit::Complete(Completion::done())
            }
            Direction::Read | Direction::Write => Submit::Complete(Completion::failed(0)),
        }
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) {
        if !self.enabled {
            return;
        }
        self.accumulated += ctx.elapsed;
        let interval = self.rate.interval();
        if self.accumulated < interval {
            return;
        }
        // Several intervals in one long tick still raise one flag.
        while self.accumulated >= interval {
            self.accumulated -= interval;
        }
        let raised = !self.pending;
        self.pending = true;
        ctx.complete(self.code[0], Completion::raise(status::INTERRUPT));
        if raised {
            ctx.emit(DeviceEvent::Clock(self.state()));
        }
    }

    fn snapshot(&self) -> Vec<DeviceEvent> {
        vec![DeviceEvent::Clock(self.state())]
    }
}
