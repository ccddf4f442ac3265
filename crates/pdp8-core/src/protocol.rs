//! Remote command and event contract.
//!
//! Both directions are JSON objects tagged by `"type"`, one per line on the
//! wire. Binary payloads (tapes, disk images) are base64; word images use the
//! byte layout in [`crate::image`]. Commands without a `device` name go to the
//! first registered device of a fitting kind.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::boot::BootLoader;
use crate::bus::{BusEvent, DeviceBus, Peripheral, TickContext};
use crate::console::{ConsoleRegisterFile, ConsoleState, OverrideKind, SwitchId};
use crate::devices::clock::ClockState;
use crate::devices::dectape::{DecTape, TapeError, TapeState};
use crate::devices::disk::{DiskError, DiskState, FixedDisk};
use crate::devices::paper_tape::{PaperTape, PaperTapeState};
use crate::devices::{Device, DeviceEvent, DeviceKind};
use crate::image::{words_from_bytes, words_to_bytes};

const PAPER_TAPES: &[DeviceKind] = &[DeviceKind::Teletype, DeviceKind::HighSpeedTape];

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Command {
    KeyPress {
        #[serde(default)]
        device: Option<String>,
        key: u8,
    },
    ReaderTapeSet {
        #[serde(default)]
        device: Option<String>,
        #[serde(rename = "tapeData")]
        tape_data: String,
    },
    ReaderSetActive {
        #[serde(default)]
        device: Option<String>,
        active: bool,
    },
    UploadDisk {
        #[serde(default)]
        device: Option<String>,
        unit: usize,
        data: String,
    },
    DownloadDisk {
        #[serde(default)]
        device: Option<String>,
        unit: usize,
    },
    PunchClear {
        #[serde(default)]
        device: Option<String>,
    },
    PunchLeader {
        #[serde(default)]
        device: Option<String>,
    },
    TapeLoad {
        #[serde(default)]
        device: Option<String>,
        unit: usize,
        data: String,
    },
    ConsoleSwitch {
        switch: SwitchId,
        value: u16,
    },
    ConsoleOverride {
        kind: OverrideKind,
        owned: bool,
    },
    Boot {
        loader: String,
    },
}

impl Command {
    pub fn parse(line: &str) -> Result<Command, CommandError> {
        Ok(serde_json::from_str(line)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::KeyPress { .. } => "key-press",
            Command::ReaderTapeSet { .. } => "reader-tape-set",
            Command::ReaderSetActive { .. } => "reader-set-active",
            Command::UploadDisk { .. } => "upload-disk",
            Command::DownloadDisk { .. } => "download-disk",
            Command::PunchClear { .. } => "punch-clear",
            Command::PunchLeader { .. } => "punch-leader",
            Command::TapeLoad { .. } => "tape-load",
            Command::ConsoleSwitch { .. } => "console-switch",
            Command::ConsoleOverride { .. } => "console-override",
            Command::Boot { .. } => "boot",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "console-state")]
    Console { console: ConsoleState },
    #[serde(rename = "dump-data")]
    DumpData {
        device: String,
        unit: usize,
        dump: String,
    },
    #[serde(rename = "readerPos")]
    ReaderPos { device: String, pos: usize },
    #[serde(rename = "punch")]
    Punch {
        device: String,
        #[serde(rename = "char")]
        byte: u8,
    },
    #[serde(rename = "tapeStates")]
    TapeStates {
        device: String,
        states: Vec<TapeState>,
    },
    #[serde(rename = "active-state-changed")]
    ActiveStateChanged { device: String, active: bool },
    #[serde(rename = "state-list-changed")]
    StateListChanged { device: String },
    #[serde(rename = "diskState")]
    Disk { device: String, state: DiskState },
    #[serde(rename = "clockState")]
    Clock { device: String, state: ClockState },
    #[serde(rename = "paperTapeState")]
    PaperTape {
        device: String,
        state: PaperTapeState,
    },
}

impl Event {
    pub fn from_bus(bus_event: BusEvent) -> Event {
        let BusEvent { device, event } = bus_event;
        match event {
            DeviceEvent::ReaderPos { pos } => Event::ReaderPos { device, pos },
            DeviceEvent::Punch { byte } => Event::Punch { device, byte },
            DeviceEvent::ActiveState { active } => Event::ActiveStateChanged { device, active },
            DeviceEvent::PaperTape(state) => Event::PaperTape { device, state },
            DeviceEvent::TapeStates(states) => Event::TapeStates { device, states },
            DeviceEvent::Disk(state) => Event::Disk { device, state },
            DeviceEvent::StateListChanged => Event::StateListChanged { device },
            DeviceEvent::Clock(state) => Event::Clock { device, state },
        }
    }

    /// Name of the device the event concerns; `None` for console events.
    pub fn device(&self) -> Option<&str> {
        match self {
            Event::Console { .. } => None,
            Event::DumpData { device, .. }
            | Event::ReaderPos { device, .. }
            | Event::Punch { device, .. }
            | Event::TapeStates { device, .. }
            | Event::ActiveStateChanged { device, .. }
            | Event::StateListChanged { device }
            | Event::Disk { device, .. }
            | Event::Clock { device, .. }
            | Event::PaperTape { device, .. } => Some(device.as_str()),
        }
    }

    /// The `"type"` tag this event serializes with.
    pub fn tag(&self) -> &'static str {
        match self {
            Event::Console { .. } => "console-state",
            Event::DumpData { .. } => "dump-data",
            Event::ReaderPos { .. } => "readerPos",
            Event::Punch { .. } => "punch",
            Event::TapeStates { .. } => "tapeStates",
            Event::ActiveStateChanged { .. } => "active-state-changed",
            Event::StateListChanged { .. } => "state-list-changed",
            Event::Disk { .. } => "diskState",
            Event::Clock { .. } => "clockState",
            Event::PaperTape { .. } => "paperTapeState",
        }
    }

    /// True for events that describe lasting state, as opposed to one-off
    /// occurrences (a punched character, a dump, an image swap).
    pub fn is_state(&self) -> bool {
        !matches!(
            self,
            Event::DumpData { .. } | Event::Punch { .. } | Event::StateListChanged { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("no device named {0:?}")]
    UnknownDevice(String),
    #[error("no device registered that can handle {0}")]
    NoDefault(&'static str),
    #[error("{device} cannot handle {command}")]
    WrongKind {
        device: String,
        command: &'static str,
    },
    #[error("payload is not valid base64: {0}")]
    Payload(#[from] base64::DecodeError),
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error(transparent)]
    Tape(#[from] TapeError),
    #[error("unknown boot loader {0:?}")]
    UnknownLoader(String),
}

/// Applies one command between two bus ticks. A command that produces a
/// reply (a disk dump) returns it; everything else reports through the
/// bus's event stream.
pub fn apply_command(
    bus: &mut DeviceBus,
    console: &ConsoleRegisterFile,
    command: Command,
) -> Result<Option<Event>, CommandError> {
    let name = command.name();
    debug!("Protocol: applying {name}");
    match command {
        Command::KeyPress { device, key } => {
            on_paper_tape(
                bus,
                device.as_deref(),
                &[DeviceKind::Teletype],
                name,
                |tape, _| tape.key_press(key),
            )?;
        }
        Command::ReaderTapeSet { device, tape_data } => {
            let tape_data = STANDARD.decode(tape_data)?;
            on_paper_tape(
                bus,
                device.as_deref(),
                PAPER_TAPES,
                name,
                |tape, ctx| tape.load_tape(tape_data, ctx),
            )?;
        }
        Command::ReaderSetActive { device, active } => {
            on_paper_tape(
                bus,
                device.as_deref(),
                PAPER_TAPES,
                name,
                |tape, ctx| tape.set_reader_active(active, ctx),
            )?;
        }
        Command::PunchClear { device } => {
            on_paper_tape(
                bus,
                device.as_deref(),
                PAPER_TAPES,
                name,
                |tape, ctx| {
                    tape.punch_clear();
                    ctx.emit(DeviceEvent::PaperTape(tape.state()));
                },
            )?;
        }
        Command::PunchLeader { device } => {
            on_paper_tape(
                bus,
                device.as_deref(),
                PAPER_TAPES,
                name,
                |tape, ctx| {
                    tape.punch_leader();
                    ctx.emit(DeviceEvent::PaperTape(tape.state()));
                },
            )?;
        }
        Command::UploadDisk { device, unit, data } => {
            let words = words_from_bytes(&STANDARD.decode(data)?);
            let (_, uploaded) = on_disk(bus, device.as_deref(), name, |disk, ctx| {
                disk.upload(unit, words, ctx)
            })?;
            uploaded?;
        }
        Command::DownloadDisk { device, unit } => {
            let (device, words) =
                on_disk(bus, device.as_deref(), name, |disk, _| disk.download(unit))?;
            let dump = STANDARD.encode(words_to_bytes(&words?));
            return Ok(Some(Event::DumpData { device, unit, dump }));
        }
        Command::TapeLoad { device, unit, data } => {
            let words = words_from_bytes(&STANDARD.decode(data)?);
            let (_, loaded) = on_dectape(bus, device.as_deref(), name, |tape, ctx| {
                tape.load(unit, words, ctx)
            })?;
            loaded?;
        }
        Command::ConsoleSwitch { switch, value } => {
            if !console.is_switch_overridden() {
                debug!("Protocol: switch {switch:?} written without switch ownership");
            }
            console.write_switch(switch, value & 0o7777);
        }
        Command::ConsoleOverride { kind, owned } => {
            console.set_override(kind, owned);
        }
        Command::Boot { loader } => {
            let loader =
                BootLoader::by_name(&loader).ok_or(CommandError::UnknownLoader(loader))?;
            loader.load(bus.core());
        }
    }
    Ok(None)
}

fn on_paper_tape<R>(
    bus: &mut DeviceBus,
    device: Option<&str>,
    kinds: &[DeviceKind],
    command: &'static str,
    f: impl FnOnce(&mut PaperTape, &mut TickContext<'_>) -> R,
) -> Result<(String, R), CommandError> {
    dispatch(bus, device, kinds, command, Device::as_paper_tape_mut, f)
}

fn on_disk<R>(
    bus: &mut DeviceBus,
    device: Option<&str>,
    command: &'static str,
    f: impl FnOnce(&mut FixedDisk, &mut TickContext<'_>) -> R,
) -> Result<(String, R), CommandError> {
    dispatch(bus, device, &[DeviceKind::Disk], command, Device::as_disk_mut, f)
}

fn on_dectape<R>(
    bus: &mut DeviceBus,
    device: Option<&str>,
    command: &'static str,
    f: impl FnOnce(&mut DecTape, &mut TickContext<'_>) -> R,
) -> Result<(String, R), CommandError> {
    dispatch(bus, device, &[DeviceKind::DecTape], command, Device::as_dectape_mut, f)
}

/// Runs `f` on the addressed device (or the default one) and returns the
/// device's name alongside the result.
fn dispatch<T, R>(
    bus: &mut DeviceBus,
    device: Option<&str>,
    kinds: &[DeviceKind],
    command: &'static str,
    project: fn(&mut Device) -> Option<&mut T>,
    f: impl FnOnce(&mut T, &mut TickContext<'_>) -> R,
) -> Result<(String, R), CommandError> {
    let name = resolve(bus, device, kinds, command)?;
    let result = bus
        .with_device(&name, |device, ctx| project(device).map(|target| f(target, ctx)))
        .flatten();
    match result {
        Some(result) => Ok((name, result)),
        None => Err(CommandError::WrongKind {
            device: name,
            command,
        }),
    }
}

fn resolve(
    bus: &DeviceBus,
    device: Option<&str>,
    kinds: &[DeviceKind],
    command: &'static str,
) -> Result<String, CommandError> {
    match device {
        Some(name) => {
            let found = bus
                .device(name)
                .ok_or_else(|| CommandError::UnknownDevice(name.to_string()))?;
            if kinds.contains(&found.kind()) {
                Ok(name.to_string())
            } else {
                Err(CommandError::WrongKind {
                    device: name.to_string(),
                    command,
                })
            }
        }
        None => bus
            .devices()
            .iter()
            .find(|d| kinds.contains(&d.kind()))
            .map(|d| d.name().to_string())
            .ok_or(CommandError::NoDefault(command)),
    }
}
