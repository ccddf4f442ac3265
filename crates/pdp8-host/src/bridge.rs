use std::time::Duration;

use crossbeam_channel as cb;
use log::{info, warn};
use pdp8_core::boot::BootLoader;
use pdp8_core::bus::{BusEvent, DeviceBus};
use pdp8_core::console::{ConsoleMonitor, ConsoleRegisterFile};
use pdp8_core::hardware::SharedHardwareMap;
use pdp8_core::protocol::{Command, Event, apply_command};
use pdp8_core::timing::TimingGovernor;

use crate::config::{ConfigError, HostConfig};

/// Everything the device loop owns: the bus, the console view, and the
/// pacing state. Events leave through the returned vectors only.
pub struct Bridge {
    bus: DeviceBus,
    console: ConsoleRegisterFile,
    events: cb::Receiver<BusEvent>,
    monitor: ConsoleMonitor,
    governor: TimingGovernor,
}

impl Bridge {
    pub fn new(map: &SharedHardwareMap, config: &HostConfig) -> Result<Self, ConfigError> {
        let mut bus = DeviceBus::new(map.io().clone(), map.core_memory());
        for device in &config.devices {
            device.install(&mut bus)?;
        }

        if let Some(name) = &config.boot {
            let loader =
                BootLoader::by_name(name).ok_or_else(|| ConfigError::UnknownLoader(name.clone()))?;
            loader.load(bus.core());
        }

        let mut governor = TimingGovernor::new(Duration::from_micros(config.tick_us));
        if let Some(hint) = bus.pacing_hint() {
            governor.tighten(hint);
        }
        info!(
            "Bridge: {} devices, tick period {:?}",
            bus.devices().len(),
            governor.period()
        );

        let events = bus.subscribe();
        Ok(Self {
            bus,
            console: ConsoleRegisterFile::new(map.console().clone()),
            events,
            monitor: ConsoleMonitor::new(Duration::from_millis(config.console_poll_ms)),
            governor,
        })
    }

    pub fn bus(&self) -> &DeviceBus {
        &self.bus
    }

    pub fn governor(&self) -> &TimingGovernor {
        &self.governor
    }

    /// Current state of every device and the console, for a new observer.
    pub fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .bus
            .snapshot_events()
            .into_iter()
            .map(Event::from_bus)
            .collect();
        events.push(Event::Console {
            console: self.console.snapshot(),
        });
        events
    }

    /// Applies one remote command. Failures are logged and the command is
    /// dropped.
    pub fn apply(&mut self, command: Command) -> Option<Event> {
        let name = command.name();
        match apply_command(&mut self.bus, &self.console, command) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Bridge: dropped {name}: {e}");
                None
            }
        }
    }

    /// Waits for the next deadline and runs one tick.
    pub fn step(&mut self) -> Vec<Event> {
        let elapsed = self.governor.pace();
        self.tick(elapsed)
    }

    /// Runs one tick as if `elapsed` had passed since the previous one.
    pub fn tick(&mut self, elapsed: Duration) -> Vec<Event> {
        self.bus.tick(elapsed);
        let mut out: Vec<Event> = self.events.try_iter().map(Event::from_bus).collect();
        if let Some(console) = self.monitor.poll(elapsed, &self.console) {
            out.push(Event::Console { console });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use pdp8_core::bus::{Direction, TransferRequest, control, reg, slot_base};
    use pdp8_core::console::{LedId, OverrideKind};

    fn config(devices: Vec<DeviceConfig>) -> HostConfig {
        HostConfig {
            devices,
            ..HostConfig::default()
        }
    }

    #[test]
    fn default_devices_come_up_and_snapshot() {
        let map = SharedHardwareMap::in_memory();
        let bridge = Bridge::new(&map, &HostConfig::default()).unwrap();
        assert_eq!(bridge.bus().devices().len(), 5);
        // DECtape word spacing is finer than the nominal tick.
        assert!(bridge.governor().period() < Duration::from_millis(1));

        let snapshot = bridge.snapshot();
        assert!(matches!(snapshot.last(), Some(Event::Console { .. })));
        assert!(snapshot.iter().any(|e| e.tag() == "clockState"));
    }

    #[test]
    fn unknown_boot_loader_is_rejected() {
        let map = SharedHardwareMap::in_memory();
        let cfg = HostConfig {
            boot: Some("focal".to_string()),
            ..config(Vec::new())
        };
        assert!(matches!(
            Bridge::new(&map, &cfg),
            Err(ConfigError::UnknownLoader(name)) if name == "focal"
        ));
    }

    #[test]
    fn boot_loader_lands_in_core() {
        let map = SharedHardwareMap::in_memory();
        let cfg = HostConfig {
            boot: Some("rim-low-speed".to_string()),
            ..config(Vec::new())
        };
        let bridge = Bridge::new(&map, &cfg).unwrap();
        let loader = BootLoader::by_name("rim-low-speed").unwrap();
        assert_eq!(bridge.bus().core().read(loader.origin), loader.words[0]);
    }

    #[test]
    fn keypress_reaches_the_io_block() {
        let map = SharedHardwareMap::in_memory();
        let mut bridge = Bridge::new(&map, &HostConfig::default()).unwrap();
        bridge.apply(Command::parse(r#"{"type":"key-press","key":65}"#).unwrap());

        let events = bridge.tick(Duration::from_millis(200));
        let tty = slot_base(0o03);
        let io = map.io();
        assert_ne!(io.read16(tty + reg::CONTROL) & control::DONE, 0);
        assert_eq!(io.read16(tty + reg::DATA), 65);
        assert!(events.iter().any(|e| matches!(e, Event::Console { .. })));
    }

    #[test]
    fn bad_commands_are_dropped() {
        let map = SharedHardwareMap::in_memory();
        let mut bridge = Bridge::new(&map, &config(Vec::new())).unwrap();
        let reply = bridge.apply(Command::PunchClear { device: None });
        assert!(reply.is_none());
    }

    #[test]
    fn console_changes_are_reported_once() {
        let map = SharedHardwareMap::in_memory();
        let mut bridge = Bridge::new(&map, &config(Vec::new())).unwrap();
        let console = ConsoleRegisterFile::new(map.console().clone());
        assert_eq!(bridge.tick(Duration::from_millis(50)).len(), 1);
        assert!(bridge.tick(Duration::from_millis(50)).is_empty());

        console.set_override(OverrideKind::Leds, true);
        console.write_led(LedId::Ac, 0o7070);
        let events = bridge.tick(Duration::from_millis(50));
        let [Event::Console { console: state }] = events.as_slice() else {
            panic!("expected one console event, got {events:?}");
        };
        assert!(state.led_override);
    }

    #[test]
    fn device_events_are_forwarded() {
        let map = SharedHardwareMap::in_memory();
        let mut bridge = Bridge::new(&map, &HostConfig::default()).unwrap();
        let clk = slot_base(0o13);
        let request = TransferRequest::new(0o13, Direction::Control, 0b111);
        map.io().write16(clk + reg::CONTROL, request.control_word());

        let events = bridge.tick(Duration::ZERO);
        assert!(events.iter().any(|e| e.tag() == "clockState"));
    }
}
