//! Paper tape stations.
//!
//! The ASR-33 teletype and the PC04 high-speed reader/punch share one state
//! machine; a [`TapeProfile`] supplies the rates, character width and whether
//! a keyboard feeds the reader channel. Reader and punch are independent: the
//! reader can run while the punch is off and the other way round.

use std::collections::VecDeque;
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::bus::{
    Completion, DeviceStatus, Direction, Peripheral, Submit, TickContext, TransferRequest, status,
};
use crate::devices::{DeviceEvent, DeviceKind};
use crate::timing::RateClass;

/// Null characters appended by a leader request.
pub const LEADER_LENGTH: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TapeProfile {
    pub reader_rate: RateClass,
    pub punch_rate: RateClass,
    pub width_bits: u8,
    pub keyboard: bool,
}

impl TapeProfile {
    pub const ASR33: TapeProfile = TapeProfile {
        reader_rate: RateClass::Asr33,
        punch_rate: RateClass::Asr33,
        width_bits: 8,
        keyboard: true,
    };

    pub const PC04: TapeProfile = TapeProfile {
        reader_rate: RateClass::Pc04Reader,
        punch_rate: RateClass::Pc04Punch,
        width_bits: 8,
        keyboard: false,
    };

    fn mask(&self) -> u16 {
        let bits = u32::from(self.width_bits.clamp(1, 12));
        ((1u32 << bits) - 1) as u16
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaperTapeState {
    pub reader_active: bool,
    pub reader_pos: usize,
    pub reader_len: usize,
    pub punch_active: bool,
    pub punch_len: usize,
}

#[derive(Default)]
struct Reader {
    tape: Vec<u8>,
    pos: usize,
    active: bool,
    stop_requested: bool,
    keys: VecDeque<u8>,
    since_last: Duration,
    /// A character sits in the data buffer and the processor has not taken it.
    awaiting_ack: bool,
}

#[derive(Default)]
struct Punch {
    active: bool,
    output: Vec<u8>,
    busy: Option<Duration>,
}

pub struct PaperTape {
    name: String,
    profile: TapeProfile,
    /// Reader code, then punch code.
    codes: [u8; 2],
    reader: Reader,
    punch: Punch,
}

impl PaperTape {
    pub fn new(
        name: impl Into<String>,
        profile: TapeProfile,
        reader_code: u8,
        punch_code: u8,
    ) -> Self {
        Self {
            name: name.into(),
            profile,
            codes: [reader_code, punch_code],
            reader: Reader {
                since_last: profile.reader_rate.interval(),
                ..Reader::default()
            },
            punch: Punch::default(),
        }
    }

    pub fn state(&self) -> PaperTapeState {
        PaperTapeState {
            reader_active: self.reader.active,
            reader_pos: self.reader.pos,
            reader_len: self.reader.tape.len(),
            punch_active: self.punch.active,
            punch_len: self.punch.output.len(),
        }
    }

    pub fn profile(&self) -> TapeProfile {
        self.profile
    }

    pub fn reader_code(&self) -> u8 {
        self.codes[0]
    }

    pub fn punch_code(&self) -> u8 {
        self.codes[1]
    }

    /// Replaces the tape in the reader and rewinds it.
    pub fn load_tape(&mut self, tape: Vec<u8>, ctx: &mut TickContext<'_>) {
        debug!("{}: loaded {} byte tape", self.name, tape.len());
        self.reader.tape = tape;
        self.reader.pos = 0;
        ctx.emit(DeviceEvent::ReaderPos { pos: 0 });
        ctx.emit(DeviceEvent::PaperTape(self.state()));
    }

    /// Starts the reader at once; stopping takes effect on the next tick.
    pub fn set_reader_active(&mut self, active: bool, ctx: &mut TickContext<'_>) {
        if active {
            self.reader.stop_requested = false;
            if !self.reader.active {
                self.reader.active = true;
                ctx.emit(DeviceEvent::ActiveState { active: true });
            }
        } else if self.reader.active {
            self.reader.stop_requested = true;
        }
    }

    pub fn reader_active(&self) -> bool {
        self.reader.active
    }

    pub fn reader_position(&self) -> usize {
        self.reader.pos
    }

    pub fn key_press(&mut self, key: u8) {
        if self.profile.keyboard {
            self.reader.keys.push_back(key);
        }
    }

    pub fn set_punch_active(&mut self, active: bool) {
        self.punch.active = active;
    }

    pub fn punch_active(&self) -> bool {
        self.punch.active
    }

    /// Appends a run of blank leader to the punch output.
    pub fn punch_leader(&mut self) {
        self.punch
            .output
            .extend(std::iter::repeat_n(0u8, LEADER_LENGTH));
    }

    /// Tears off the punched tape; later characters start a fresh buffer.
    pub fn punch_clear(&mut self) {
        self.punch.output.clear();
    }

    pub fn punch_output(&self) -> &[u8] {
        &self.punch.output
    }

    fn reader_status(&self) -> u16 {
        let mut bits = 0;
        if self.reader.awaiting_ack {
            bits |= status::READY;
        }
        if !self.reader.tape.is_empty() && self.reader.pos >= self.reader.tape.len() {
            bits |= status::END_OF_TAPE;
        }
        bits
    }

    fn tick_reader(&mut self, ctx: &mut TickContext<'_>) {
        let code = self.reader_code();
        let mask = self.profile.mask();
        let reader = &mut self.reader;

        if reader.stop_requested {
            reader.stop_requested = false;
            if reader.active {
                reader.active = false;
                ctx.emit(DeviceEvent::ActiveState { active: false });
                // Reader done, with no character behind it.
                ctx.complete(code, Completion::done());
            }
        }

        // The character clock only runs once the last character was taken.
        if reader.awaiting_ack {
            return;
        }
        reader.since_last = reader.since_last.saturating_add(ctx.elapsed);
        if reader.since_last < self.profile.reader_rate.interval() {
            return;
        }

        let byte = if reader.active {
            let next = reader.tape.get(reader.pos).copied();
            if next.is_some() {
                reader.pos += 1;
                ctx.emit(DeviceEvent::ReaderPos { pos: reader.pos });
            }
            next
        } else {
            reader.keys.pop_front()
        };

        if let Some(b) = byte {
            reader.awaiting_ack = true;
            reader.since_last = Duration::ZERO;
            ctx.complete(code, Completion::with_data(u16::from(b) & mask));
        }

        if reader.active && reader.pos >= reader.tape.len() {
            reader.active = false;
            ctx.emit(DeviceEvent::ActiveState { active: false });
            ctx.post_status(code, status::END_OF_TAPE);
        }
    }

    fn tick_punch(&mut self, ctx: &mut TickContext<'_>) {
        let Some(remaining) = self.punch.busy else {
            return;
        };
        if ctx.elapsed >= remaining {
            self.punch.busy = None;
            ctx.complete(self.punch_code(), Completion::done());
        } else {
            self.punch.busy = Some(remaining - ctx.elapsed);
        }
    }

    fn punch_byte(&mut self, data: u16, ctx: &mut TickContext<'_>) {
        let byte = (data & self.profile.mask()) as u8;
        if self.punch.active {
            self.punch.output.push(byte);
        }
        ctx.emit(DeviceEvent::Punch { byte });
        self.punch.busy = Some(self.profile.punch_rate.interval());
    }
}

impl Peripheral for PaperTape {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        if self.profile.keyboard {
            DeviceKind::Teletype
        } else {
            DeviceKind::HighSpeedTape
        }
    }

    fn device_codes(&self) -> &[u8] {
        &self.codes
    }

    fn status(&self) -> DeviceStatus {
        if self.punch.busy.is_some() {
            DeviceStatus::Busy
        } else {
            DeviceStatus::Ready
        }
    }

    fn submit_transfer(&mut self, request: &TransferRequest, ctx: &mut TickContext<'_>) -> Submit {
        let reader = request.device == self.reader_code();
        match (reader, request.direction) {
            (true, Direction::Read) => {
                // The character already sits in the data register. Taking it
                // frees the reader to fetch the next one.
                self.reader.awaiting_ack = false;
                Submit::Complete(Completion::status_only(self.reader_status()))
            }
            (true, Direction::Status) => {
                Submit::Complete(Completion::status_only(self.reader_status()))
            }
            (true, Direction::Control) => {
                self.set_reader_active(request.data & 1 != 0, ctx);
                Submit::Complete(Completion::status_only(self.reader_status()))
            }
            (false, Direction::Write) => {
                self.punch_byte(request.data, ctx);
                Submit::Pending
            }
            (false, Direction::Status) => Submit::Complete(Completion::status_only(0)),
            (false, Direction::Control) => {
                self.set_punch_active(request.data & 1 != 0);
                Submit::Complete(Completion::status_only(0))
            }
            (true, Direction::Write) | (false, Direction::Read) => {
                Submit::Complete(Completion::failed(0))
            }
        }
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) {
        self.tick_reader(ctx);
        self.tick_punch(ctx);
    }

    fn cancel(&mut self, code: u8) {
        if code == self.punch_code() {
            self.punch.busy = None;
        }
    }

    fn snapshot(&self) -> Vec<DeviceEvent> {
        vec![
            DeviceEvent::ActiveState {
                active: self.reader.active,
            },
            DeviceEvent::ReaderPos {
                pos: self.reader.pos,
            },
            DeviceEvent::PaperTape(self.state()),
        ]
    }
}
