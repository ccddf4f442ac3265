#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pdp8_core::bus::{DeviceBus, Direction, TransferRequest, control, reg, slot_base};
use pdp8_core::console::{ConsoleRegisterFile, LedId};
use pdp8_core::devices::Device;
use pdp8_core::hardware::{Region, SharedHardwareMap};

/// A bus over heap-backed regions, with helpers that play the processor side
/// of the IO control block.
pub struct Machine {
    pub map: SharedHardwareMap,
    pub bus: DeviceBus,
    pub console: ConsoleRegisterFile,
}

impl Machine {
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        let map = SharedHardwareMap::in_memory();
        let mut bus = DeviceBus::new(map.io().clone(), map.core_memory());
        for device in devices {
            bus.register(device).expect("device registers");
        }
        let console = ConsoleRegisterFile::new(map.console().clone());
        Self { map, bus, console }
    }

    pub fn io(&self) -> &Region {
        self.map.io()
    }

    /// Raises a request the way the processor does when it executes an IOT.
    pub fn raise(&self, request: TransferRequest) {
        let base = slot_base(request.device);
        let io = self.io();
        io.write16(base + reg::DATA, request.data);
        io.write16(base + reg::BLOCK, request.block);
        io.write16(base + reg::COUNT, request.count);
        io.write16(base + reg::MEM_ADDR, request.mem_addr);
        io.write16(base + reg::CONTROL, request.control_word());
    }

    pub fn raise_simple(&self, code: u8, direction: Direction, data: u16) {
        self.raise(TransferRequest::new(code, direction, data));
    }

    pub fn tick_ms(&mut self, ms: u64) {
        self.bus.tick(Duration::from_millis(ms));
    }

    pub fn control(&self, code: u8) -> u16 {
        self.io().read16(slot_base(code) + reg::CONTROL)
    }

    pub fn requested(&self, code: u8) -> bool {
        self.control(code) & control::REQUEST != 0
    }

    pub fn done(&self, code: u8) -> bool {
        self.control(code) & control::DONE != 0
    }

    /// Acknowledges the done flag, as the processor's skip-and-clear does.
    pub fn clear_done(&self, code: u8) {
        self.io().update16(slot_base(code) + reg::CONTROL, |w| w & !control::DONE);
    }

    pub fn data(&self, code: u8) -> u16 {
        self.io().read16(slot_base(code) + reg::DATA)
    }

    pub fn status(&self, code: u8) -> u16 {
        self.io().read16(slot_base(code) + reg::STATUS)
    }
}

/// Plays the autonomous hardware: refreshes every LED it does not yield to
/// software, over and over, until dropped.
pub struct StubHardwareWriter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StubHardwareWriter {
    pub fn spawn(console: ConsoleRegisterFile, led_value: u16) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                refresh_leds(&console, led_value);
                thread::sleep(Duration::from_micros(200));
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for StubHardwareWriter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One hardware refresh cycle of the LED bank.
pub fn refresh_leds(console: &ConsoleRegisterFile, value: u16) {
    if console.is_led_overridden() {
        return;
    }
    for id in LedId::ALL {
        console.write_led(id, value);
    }
}
