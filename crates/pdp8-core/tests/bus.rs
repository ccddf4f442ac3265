//! IO control block behavior as seen from the processor side.

mod support;

use std::time::Duration;

use pdp8_core::bus::{BusError, Direction, TransferRequest, control, reg, slot_base, status};
use pdp8_core::devices::clock::{ClockRate, ProgrammableClock};
use pdp8_core::devices::dectape::{DecTape, TransportProfile};
use pdp8_core::devices::paper_tape::{PaperTape, TapeProfile};
use pdp8_core::devices::{Device, DeviceEvent};
use support::Machine;

const TTI: u8 = 0o03;
const TTO: u8 = 0o04;

fn teletype() -> Device {
    Device::PaperTape(PaperTape::new("tty", TapeProfile::ASR33, TTI, TTO))
}

#[test]
fn keyboard_character_arrives_with_done_flag() {
    let mut m = Machine::new([teletype()]);
    m.bus
        .with_device("tty", |device, _| {
            device.as_paper_tape_mut().map(|tty| tty.key_press(b'K'))
        })
        .flatten()
        .expect("teletype registered");

    m.tick_ms(1);
    assert!(m.done(TTI));
    assert_eq!(m.data(TTI), u16::from(b'K'));

    // KRB: read and clear the flag.
    m.raise_simple(TTI, Direction::Read, 0);
    m.tick_ms(1);
    assert!(!m.requested(TTI));
    assert!(!m.done(TTI));
    assert!(!m.bus.is_in_flight(TTI));
}

#[test]
fn second_request_waits_for_the_in_flight_transfer() {
    let mut m = Machine::new([teletype()]);
    let events = m.bus.subscribe();

    m.raise_simple(TTO, Direction::Write, u16::from(b'H'));
    m.tick_ms(0);
    assert!(m.bus.is_in_flight(TTO));
    assert_ne!(m.status(TTO) & status::BUSY, 0);

    m.raise_simple(TTO, Direction::Write, u16::from(b'I'));
    m.tick_ms(50);
    assert!(m.requested(TTO), "request stays raised while busy");
    assert!(!m.done(TTO));

    m.tick_ms(50);
    assert!(!m.requested(TTO), "picked up once the first transfer finished");
    assert!(m.bus.is_in_flight(TTO));

    m.tick_ms(100);
    assert!(m.done(TTO));
    assert!(!m.bus.is_in_flight(TTO));

    let punched: Vec<u8> = events
        .try_iter()
        .filter_map(|e| match e.event {
            DeviceEvent::Punch { byte } => Some(byte),
            _ => None,
        })
        .collect();
    assert_eq!(punched, b"HI");
}

#[test]
fn status_poll_leaves_the_done_flag_raised() {
    let mut m = Machine::new([teletype()]);
    m.raise_simple(TTO, Direction::Write, 65);
    m.tick_ms(0);
    m.tick_ms(100);
    assert!(m.done(TTO));

    m.raise_simple(TTO, Direction::Status, 0);
    m.tick_ms(0);
    assert!(!m.requested(TTO));
    assert!(m.done(TTO), "flag is still there to be re-read");

    m.tick_ms(0);
    assert!(m.done(TTO));
}

#[test]
fn interrupt_enable_adds_the_interrupt_bit() {
    let mut m = Machine::new([teletype()]);
    m.raise_simple(TTO, Direction::Write, 65);
    m.tick_ms(0);
    m.tick_ms(100);
    assert!(m.done(TTO));
    assert_eq!(m.status(TTO) & status::INTERRUPT, 0);

    m.raise_simple(TTO, Direction::Write, 66);
    m.io().update16(slot_base(TTO) + reg::CONTROL, |w| w | control::INT_ENABLE);
    m.tick_ms(0);
    m.tick_ms(100);
    assert!(m.done(TTO));
    assert_ne!(m.status(TTO) & status::INTERRUPT, 0);
}

#[test]
fn end_of_tape_survives_the_last_character() {
    let mut m = Machine::new([Device::PaperTape(PaperTape::new(
        "ptr",
        TapeProfile::PC04,
        0o01,
        0o02,
    ))]);
    m.bus.with_device("ptr", |device, ctx| {
        if let Some(ptr) = device.as_paper_tape_mut() {
            ptr.load_tape(vec![0x55], ctx);
            ptr.set_reader_active(true, ctx);
        }
    });

    m.tick_ms(4);
    assert!(m.done(0o01));
    assert_eq!(m.data(0o01), 0x55);
    assert_ne!(m.status(0o01) & status::END_OF_TAPE, 0);
    let active = m
        .bus
        .device("ptr")
        .and_then(Device::as_paper_tape)
        .map(PaperTape::reader_active);
    assert_eq!(active, Some(false));
}

#[test]
fn stopping_the_reader_raises_reader_done() {
    let mut m = Machine::new([Device::PaperTape(PaperTape::new(
        "ptr",
        TapeProfile::PC04,
        0o01,
        0o02,
    ))]);
    m.bus.with_device("ptr", |device, ctx| {
        if let Some(ptr) = device.as_paper_tape_mut() {
            ptr.load_tape(vec![1, 2, 3], ctx);
            ptr.set_reader_active(true, ctx);
        }
    });
    m.tick_ms(0);
    assert_eq!(m.data(0o01), 1);
    m.raise_simple(0o01, Direction::Read, 0);
    m.tick_ms(0);
    assert!(!m.done(0o01));

    m.bus.with_device("ptr", |device, ctx| {
        if let Some(ptr) = device.as_paper_tape_mut() {
            ptr.set_reader_active(false, ctx);
        }
    });
    m.tick_ms(0);
    assert!(m.done(0o01));
    assert_eq!(m.data(0o01), 1, "no character behind the flag");
    let pos = m
        .bus
        .device("ptr")
        .and_then(Device::as_paper_tape)
        .map(PaperTape::reader_position);
    assert_eq!(pos, Some(1));
}

#[test]
fn cancel_takes_effect_on_the_next_tick() {
    let mut m = Machine::new([teletype()]);
    m.raise_simple(TTO, Direction::Write, u16::from(b'X'));
    m.tick_ms(0);

    m.bus.cancel(TTO);
    assert!(m.bus.is_in_flight(TTO));

    m.tick_ms(200);
    assert!(!m.bus.is_in_flight(TTO));
    assert!(!m.done(TTO), "abandoned transfer never raises its flag");
}

#[test]
fn clock_interrupts_are_unsolicited_completions() {
    let mut m = Machine::new([Device::Clock(ProgrammableClock::new(
        "clk",
        0o13,
        ClockRate::Hz50,
    ))]);
    m.tick_ms(19);
    assert!(!m.done(0o13));
    m.tick_ms(1);
    assert!(m.done(0o13));
    assert_ne!(m.status(0o13) & status::INTERRUPT, 0);

    m.raise_simple(0o13, Direction::Status, 0);
    m.tick_ms(0);
    assert_ne!(m.status(0o13) & status::INTERRUPT, 0);
    assert!(!m.done(0o13), "reading the pending interval acknowledges it");
    m.raise_simple(0o13, Direction::Status, 0);
    m.tick_ms(0);
    assert_eq!(m.status(0o13) & status::INTERRUPT, 0);
}

#[test]
fn registry_rejects_codes_outside_the_block() {
    let mut m = Machine::new(std::iter::empty());
    let err = m
        .bus
        .register(Device::Clock(ProgrammableClock::new(
            "clk",
            64,
            ClockRate::Hz60,
        )))
        .unwrap_err();
    assert_eq!(err, BusError::CodeOutOfRange { code: 64 });
}

#[test]
fn subscribers_see_events_in_tick_order_and_snapshots_cover_every_device() {
    let mut m = Machine::new([
        teletype(),
        Device::DecTape(DecTape::new("dt", [0o76, 0o77], TransportProfile::TU56)),
    ]);
    let events = m.bus.subscribe();

    let mut request = TransferRequest::new(0o76, Direction::Control, 0);
    request.unit = 1;
    m.raise(request);
    m.raise_simple(TTO, Direction::Write, u16::from(b'Z'));
    m.tick_ms(0);

    let devices: Vec<String> = events.try_iter().map(|e| e.device).collect();
    assert_eq!(devices, ["tty", "dt"]);

    let snapshot = m.bus.snapshot_events();
    assert!(snapshot.iter().any(|e| e.device == "tty"));
    assert!(snapshot.iter().any(|e| matches!(
        &e.event,
        DeviceEvent::TapeStates(states) if states[1].selected
    )));
    assert_eq!(
        m.bus.pacing_hint(),
        Some(Duration::from_secs(1) / 8325)
    );
}
