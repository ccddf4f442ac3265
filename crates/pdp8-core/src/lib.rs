//! Bridge between a hardware PDP-8 processor core and software peripherals.
//!
//! The processor runs on programmable logic and exposes three shared register
//! regions (core memory, console, IO control). This crate maps those regions,
//! polls the IO region for device requests, and drives timing-faithful
//! peripheral state machines. Frontends (the host process, the remote relay)
//! live in separate crates and drive the core through [`bus::DeviceBus`] and
//! [`protocol::apply_command`].

/// Named bootstrap programs written straight into core memory.
pub mod boot;

/// Device request polling and the peripheral registry.
pub mod bus;

/// Front-panel LEDs, switches and override ownership bits.
pub mod console;

/// Peripheral state machines (paper tape, DECtape, disk, clock).
pub mod devices;

/// Shared register regions mapped from the hardware device.
pub mod hardware;

/// 12-bit word images and their byte encoding.
pub mod image;

/// Commands and events exchanged with remote observers.
pub mod protocol;

/// Tick pacing and named device rate classes.
pub mod timing;
