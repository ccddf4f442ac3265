//! Front-panel register file.
//!
//! Stride 0 holds the two override ownership bits. The LEDs follow in
//! [`LedId::ALL`] order, then the switches in [`SwitchId::ALL`] order, one
//! 16-bit value per 4-byte stride.
//!
//! Ownership is a convention, not a lock. While an override bit is clear the
//! hardware refreshes that register set on every cycle, so a software write
//! lands in the register but is replaced on the next refresh. Callers that
//! want their values to stick must take ownership with
//! [`ConsoleRegisterFile::set_override`] first.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hardware::{REGISTER_STRIDE, Region};

const OVERRIDE_OFFSET: usize = 0;
const SWITCH_OVERRIDE_BIT: u16 = 1 << 0;
const LED_OVERRIDE_BIT: u16 = 1 << 1;
const LED_BASE: usize = 1;
const SWITCH_BASE: usize = LED_BASE + LedId::ALL.len();

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LedId {
    DataField,
    InstField,
    Pc,
    MemAddr,
    MemBuf,
    Link,
    Ac,
    StepCounter,
    Mqr,
    Instruction,
    State,
    Ion,
    Pause,
    Run,
}

impl LedId {
    pub const ALL: [LedId; 14] = [
        LedId::DataField,
        LedId::InstField,
        LedId::Pc,
        LedId::MemAddr,
        LedId::MemBuf,
        LedId::Link,
        LedId::Ac,
        LedId::StepCounter,
        LedId::Mqr,
        LedId::Instruction,
        LedId::State,
        LedId::Ion,
        LedId::Pause,
        LedId::Run,
    ];

    pub const fn offset(self) -> usize {
        (LED_BASE + self as usize) * REGISTER_STRIDE
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SwitchId {
    DataField,
    InstField,
    Swr,
    Start,
    Load,
    Dep,
    Exam,
    Cont,
    Stop,
    SingStep,
    SingInst,
}

impl SwitchId {
    pub const ALL: [SwitchId; 11] = [
        SwitchId::DataField,
        SwitchId::InstField,
        SwitchId::Swr,
        SwitchId::Start,
        SwitchId::Load,
        SwitchId::Dep,
        SwitchId::Exam,
        SwitchId::Cont,
        SwitchId::Stop,
        SwitchId::SingStep,
        SwitchId::SingInst,
    ];

    pub const fn offset(self) -> usize {
        (SWITCH_BASE + self as usize) * REGISTER_STRIDE
    }
}

/// Which register set an override bit covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverrideKind {
    Switches,
    Leds,
}

impl OverrideKind {
    const fn bit(self) -> u16 {
        match self {
            OverrideKind::Switches => SWITCH_OVERRIDE_BIT,
            OverrideKind::Leds => LED_OVERRIDE_BIT,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleState {
    pub switch_override: bool,
    pub led_override: bool,
    pub leds: BTreeMap<LedId, u16>,
    pub switches: BTreeMap<SwitchId, u16>,
}

#[derive(Clone)]
pub struct ConsoleRegisterFile {
    region: Region,
}

impl ConsoleRegisterFile {
    pub fn new(region: Region) -> Self {
        Self { region }
    }

    pub fn is_switch_overridden(&self) -> bool {
        self.is_overridden(OverrideKind::Switches)
    }

    pub fn is_led_overridden(&self) -> bool {
        self.is_overridden(OverrideKind::Leds)
    }

    pub fn is_overridden(&self, kind: OverrideKind) -> bool {
        self.region.read16(OVERRIDE_OFFSET) & kind.bit() != 0
    }

    /// Claims (or releases) software ownership of a register set.
    pub fn set_override(&self, kind: OverrideKind, owned: bool) {
        self.region.update16(OVERRIDE_OFFSET, |bits| {
            if owned {
                bits | kind.bit()
            } else {
                bits & !kind.bit()
            }
        });
    }

    pub fn read_led(&self, id: LedId) -> u16 {
        self.region.read16(id.offset())
    }

    /// Writes an LED register. Without LED ownership the hardware replaces
    /// the value on its next refresh.
    pub fn write_led(&self, id: LedId, value: u16) {
        self.region.write16(id.offset(), value);
    }

    pub fn read_switch(&self, id: SwitchId) -> u16 {
        self.region.read16(id.offset())
    }

    /// Writes a switch register. Without switch ownership the hardware
    /// replaces the value on its next refresh.
    pub fn write_switch(&self, id: SwitchId, value: u16) {
        self.region.write16(id.offset(), value);
    }

    pub fn snapshot(&self) -> ConsoleState {
        ConsoleState {
            switch_override: self.is_switch_overridden(),
            led_override: self.is_led_overridden(),
            leds: LedId::ALL.iter().map(|&id| (id, self.read_led(id))).collect(),
            switches: SwitchId::ALL
                .iter()
                .map(|&id| (id, self.read_switch(id)))
                .collect(),
        }
    }
}

/// Samples the console at a fixed interval and reports the image only when it
/// differs from the last one reported.
pub struct ConsoleMonitor {
    interval: Duration,
    since_sample: Duration,
    last: Option<ConsoleState>,
}

impl ConsoleMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            since_sample: interval,
            last: None,
        }
    }

    pub fn poll(
        &mut self,
        elapsed: Duration,
        console: &ConsoleRegisterFile,
    ) -> Option<ConsoleState> {
        self.since_sample += elapsed;
        if self.since_sample < self.interval {
            return None;
        }
        self.since_sample = Duration::ZERO;

        let state = console.snapshot();
        if self.last.as_ref() == Some(&state) {
            return None;
        }
        self.last = Some(state.clone());
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::CONSOLE_REGION_LEN;

    fn console() -> ConsoleRegisterFile {
        ConsoleRegisterFile::new(Region::memory("console", CONSOLE_REGION_LEN))
    }

    #[test]
    fn layout_is_fixed() {
        assert_eq!(LedId::DataField.offset(), 4);
        assert_eq!(LedId::Run.offset(), 14 * 4);
        assert_eq!(SwitchId::DataField.offset(), 15 * 4);
        assert_eq!(SwitchId::SingInst.offset(), 25 * 4);
        assert!(SwitchId::SingInst.offset() + 2 <= CONSOLE_REGION_LEN);
    }

    #[test]
    fn override_bits_are_independent() {
        let console = console();
        console.set_override(OverrideKind::Leds, true);
        assert!(console.is_led_overridden());
        assert!(!console.is_switch_overridden());

        console.set_override(OverrideKind::Switches, true);
        console.set_override(OverrideKind::Leds, false);
        assert!(console.is_switch_overridden());
        assert!(!console.is_led_overridden());
    }

    #[test]
    fn monitor_reports_only_changes() {
        let console = console();
        let mut monitor = ConsoleMonitor::new(Duration::from_millis(10));

        assert!(monitor.poll(Duration::ZERO, &console).is_some());
        assert!(monitor.poll(Duration::from_millis(10), &console).is_none());

        console.write_led(LedId::Pc, 0o200);
        assert!(monitor.poll(Duration::from_millis(5), &console).is_none());
        let state = monitor
            .poll(Duration::from_millis(5), &console)
            .expect("changed image is reported");
        assert_eq!(state.leds[&LedId::Pc], 0o200);
    }
}
