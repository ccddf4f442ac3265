//! TC08-style DECtape controller driving two TU56 transports.
//!
//! Each transport carries its own position, direction and motion phase and
//! moves whenever it is in motion, selected or not. Only the selected
//! transport answers reads and writes, and only once it is up to speed.
//! Acceleration and deceleration average half the running speed; a reversal
//! decelerates to a stop and waits out the settle time before accelerating
//! the other way.

use std::time::Duration;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{
    Completion, DeviceStatus, Direction, Peripheral, Submit, TickContext, TransferRequest, status,
};
use crate::devices::{DeviceEvent, DeviceKind};
use crate::timing::RateClass;

pub const TRANSPORTS: usize = 2;

/// 1474 blocks of 129 twelve-bit words.
pub const TU56_WORDS: usize = 1474 * 129;

/// Smallest normalized movement worth publishing.
const POSITION_EPSILON: f64 = 0.001;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportProfile {
    pub word_rate: RateClass,
    pub ramp: Duration,
    pub reverse_settle: Duration,
}

impl TransportProfile {
    pub const TU56: TransportProfile = TransportProfile {
        word_rate: RateClass::Tu56Word,
        ramp: Duration::from_millis(150),
        reverse_settle: Duration::from_millis(50),
    };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Motion {
    Stopped,
    Accelerating { remaining: Duration },
    AtSpeed,
    Decelerating { remaining: Duration },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TapeState {
    pub address: u8,
    pub loaded: bool,
    pub normalized_position: f64,
    pub moving: bool,
    pub reverse: bool,
    pub selected: bool,
    pub writing: bool,
}

impl TapeState {
    fn differs_from(&self, other: &TapeState) -> bool {
        self.loaded != other.loaded
            || self.moving != other.moving
            || self.reverse != other.reverse
            || self.selected != other.selected
            || self.writing != other.writing
            || (self.normalized_position - other.normalized_position).abs() >= POSITION_EPSILON
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeError {
    #[error("transport {unit} is not selected")]
    NotSelected { unit: usize },
    #[error("no tape mounted on transport {unit}")]
    NotLoaded { unit: usize },
    #[error("transport {unit} is not up to speed")]
    NotAtSpeed { unit: usize },
    #[error("there is no transport {unit}")]
    NoSuchUnit { unit: usize },
}

impl TapeError {
    pub fn status_bits(self) -> u16 {
        match self {
            TapeError::NotSelected { .. } => status::NOT_SELECTED,
            TapeError::NotLoaded { .. } => status::NOT_SELECTED,
            TapeError::NotAtSpeed { .. } => status::BUSY,
            TapeError::NoSuchUnit { .. } => status::ADDRESS_ERROR,
        }
    }
}

struct Transport {
    image: Vec<u16>,
    position: f64,
    motion: Motion,
    reverse: bool,
    /// Direction to take once the transport has come to rest.
    pending: Option<bool>,
    settle: Duration,
    writing: bool,
    end_of_tape: bool,
}

impl Transport {
    fn empty() -> Self {
        Self {
            image: Vec::new(),
            position: 0.0,
            motion: Motion::Stopped,
            reverse: false,
            pending: None,
            settle: Duration::ZERO,
            writing: false,
            end_of_tape: false,
        }
    }

    fn loaded(&self) -> bool {
        !self.image.is_empty()
    }

    fn moving(&self) -> bool {
        self.motion != Motion::Stopped || self.pending.is_some()
    }

    fn last_word(&self) -> f64 {
        self.image.len().saturating_sub(1) as f64
    }

    fn normalized(&self) -> f64 {
        let last = self.last_word();
        if last <= 0.0 {
            0.0
        } else {
            (self.position / last).clamp(0.0, 1.0)
        }
    }

    fn word_index(&self) -> usize {
        (self.position.floor() as usize).min(self.image.len().saturating_sub(1))
    }

    fn start(&mut self, reverse: bool, profile: &TransportProfile) {
        self.writing = false;
        self.end_of_tape = false;
        match self.motion {
            Motion::Stopped if self.pending.is_some() || !self.settle.is_zero() => {
                self.pending = Some(reverse);
            }
            Motion::Stopped => {
                self.reverse = reverse;
                self.motion = Motion::Accelerating {
                    remaining: profile.ramp,
                };
            }
            Motion::Accelerating { .. } | Motion::AtSpeed if self.reverse == reverse => {}
            Motion::Accelerating { .. } | Motion::AtSpeed => {
                self.motion = Motion::Decelerating {
                    remaining: profile.ramp,
                };
                self.pending = Some(reverse);
            }
            Motion::Decelerating { .. } => {
                self.pending = Some(reverse);
            }
        }
    }

    fn stop(&mut self, profile: &TransportProfile) {
        self.writing = false;
        self.pending = None;
        self.settle = Duration::ZERO;
        if matches!(self.motion, Motion::Accelerating { .. } | Motion::AtSpeed) {
            self.motion = Motion::Decelerating {
                remaining: profile.ramp,
            };
        }
    }

    fn advance(&mut self, elapsed: Duration, profile: &TransportProfile) {
        let speed = f64::from(profile.word_rate.per_second());
        let mut left = elapsed;
        while !left.is_zero() {
            match self.motion {
                Motion::Stopped => {
                    let Some(reverse) = self.pending else {
                        break;
                    };
                    let wait = self.settle.min(left);
                    self.settle -= wait;
                    left -= wait;
                    if !self.settle.is_zero() {
                        break;
                    }
                    self.pending = None;
                    self.reverse = reverse;
                    self.motion = Motion::Accelerating {
                        remaining: profile.ramp,
                    };
                }
                Motion::Accelerating { remaining } => {
                    let step = remaining.min(left);
                    left -= step;
                    self.motion = if step == remaining {
                        Motion::AtSpeed
                    } else {
                        Motion::Accelerating {
                            remaining: remaining - step,
                        }
                    };
                    self.travel(step.as_secs_f64() * speed / 2.0);
                }
                Motion::AtSpeed => {
                    self.travel(left.as_secs_f64() * speed);
                    left = Duration::ZERO;
                }
                Motion::Decelerating { remaining } => {
                    let step = remaining.min(left);
                    left -= step;
                    self.travel(step.as_secs_f64() * speed / 2.0);
                    if let Motion::Decelerating { .. } = self.motion {
                        if step == remaining {
                            self.motion = Motion::Stopped;
                            if self.pending.is_some() {
                                self.settle = profile.reverse_settle;
                            }
                        } else {
                            self.motion = Motion::Decelerating {
                                remaining: remaining - step,
                            };
                        }
                    }
                }
            }
        }
    }

    fn travel(&mut self, words: f64) {
        let last = self.last_word();
        let next = if self.reverse {
            self.position - words
        } else {
            self.position + words
        };
        if next <= 0.0 && self.reverse {
            self.hit_end(0.0);
        } else if next >= last && !self.reverse {
            self.hit_end(last);
        } else {
            self.position = next.clamp(0.0, last);
        }
    }

    fn hit_end(&mut self, at: f64) {
        self.position = at;
        self.end_of_tape = true;
        self.motion = Motion::Stopped;
        self.pending = None;
        self.settle = Duration::ZERO;
    }
}

pub struct DecTape {
    name: String,
    codes: [u8; 2],
    profile: TransportProfile,
    transports: [Transport; TRANSPORTS],
    selected: Option<usize>,
    published: Vec<TapeState>,
}

impl DecTape {
    pub fn new(name: impl Into<String>, codes: [u8; 2], profile: TransportProfile) -> Self {
        let mut tape = Self {
            name: name.into(),
            codes,
            profile,
            transports: [Transport::empty(), Transport::empty()],
            selected: None,
            published: Vec::new(),
        };
        tape.published = tape.states();
        tape
    }

    fn transport(&self, unit: usize) -> Result<&Transport, TapeError> {
        self.transports
            .get(unit)
            .ok_or(TapeError::NoSuchUnit { unit })
    }

    fn transport_mut(&mut self, unit: usize) -> Result<&mut Transport, TapeError> {
        self.transports
            .get_mut(unit)
            .ok_or(TapeError::NoSuchUnit { unit })
    }

    /// Mounts an image on a transport and rewinds it.
    pub fn load(
        &mut self,
        unit: usize,
        image: Vec<u16>,
        ctx: &mut TickContext<'_>,
    ) -> Result<(), TapeError> {
        let transport = self.transport_mut(unit)?;
        *transport = Transport::empty();
        transport.image = image.into_iter().map(|w| w & 0o7777).collect();
        debug!(
            "{}: mounted {} words on unit {unit}",
            self.name,
            self.transports[unit].image.len()
        );
        self.publish(ctx);
        Ok(())
    }

    pub fn unload(
        &mut self,
        unit: usize,
        ctx: &mut TickContext<'_>,
    ) -> Result<Vec<u16>, TapeError> {
        let transport = self.transport_mut(unit)?;
        let image = std::mem::take(&mut transport.image);
        *transport = Transport::empty();
        self.publish(ctx);
        Ok(image)
    }

    pub fn image(&self, unit: usize) -> Option<&[u16]> {
        self.transports.get(unit).map(|t| t.image.as_slice())
    }

    pub fn select(&mut self, unit: usize) -> Result<(), TapeError> {
        self.transport(unit)?;
        if self.selected != Some(unit) {
            trace!("{}: unit {unit} selected", self.name);
        }
        self.selected = Some(unit);
        Ok(())
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn start(&mut self, unit: usize, reverse: bool) -> Result<(), TapeError> {
        let profile = self.profile;
        let transport = self.transport_mut(unit)?;
        if !transport.loaded() {
            return Err(TapeError::NotLoaded { unit });
        }
        transport.start(reverse, &profile);
        Ok(())
    }

    pub fn stop(&mut self, unit: usize) -> Result<(), TapeError> {
        let profile = self.profile;
        self.transport_mut(unit)?.stop(&profile);
        Ok(())
    }

    fn ready(&self, unit: usize) -> Result<&Transport, TapeError> {
        let transport = self.transport(unit)?;
        if self.selected != Some(unit) {
            return Err(TapeError::NotSelected { unit });
        }
        if !transport.loaded() {
            return Err(TapeError::NotLoaded { unit });
        }
        if transport.motion != Motion::AtSpeed {
            return Err(TapeError::NotAtSpeed { unit });
        }
        Ok(transport)
    }

    /// Word under the head of the selected, running transport.
    pub fn read(&self, unit: usize) -> Result<u16, TapeError> {
        let transport = self.ready(unit)?;
        Ok(transport.image[transport.word_index()])
    }

    pub fn write(&mut self, unit: usize, word: u16) -> Result<(), TapeError> {
        self.ready(unit)?;
        let transport = &mut self.transports[unit];
        let index = transport.word_index();
        transport.image[index] = word & 0o7777;
        transport.writing = true;
        Ok(())
    }

    pub fn motion(&self, unit: usize) -> Option<Motion> {
        self.transports.get(unit).map(|t| t.motion)
    }

    /// Head position in words.
    pub fn position(&self, unit: usize) -> Option<f64> {
        self.transports.get(unit).map(|t| t.position)
    }

    pub fn end_of_tape(&self, unit: usize) -> bool {
        self.transports.get(unit).is_some_and(|t| t.end_of_tape)
    }

    pub fn states(&self) -> Vec<TapeState> {
        self.transports
            .iter()
            .enumerate()
            .map(|(unit, t)| TapeState {
                address: unit as u8,
                loaded: t.loaded(),
                normalized_position: t.normalized(),
                moving: t.moving(),
                reverse: t.reverse,
                selected: self.selected == Some(unit),
                writing: t.writing,
            })
            .collect()
    }

    fn unit_status(&self, unit: usize) -> u16 {
        let Some(transport) = self.transports.get(unit) else {
            return status::ADDRESS_ERROR;
        };
        let mut bits = 0;
        if self.selected != Some(unit) {
            bits |= status::NOT_SELECTED;
        }
        if transport.end_of_tape {
            bits |= status::END_OF_TAPE;
        }
        match transport.motion {
            Motion::AtSpeed => bits |= status::READY,
            Motion::Accelerating { .. } | Motion::Decelerating { .. } => bits |= status::BUSY,
            Motion::Stopped if transport.pending.is_some() => bits |= status::BUSY,
            Motion::Stopped => {}
        }
        bits
    }

    fn publish(&mut self, ctx: &mut TickContext<'_>) {
        let states = self.states();
        let changed = self.published.len() != states.len()
            || states
                .iter()
                .zip(&self.published)
                .any(|(now, then)| now.differs_from(then));
        if changed {
            self.published = states.clone();
            ctx.emit(DeviceEvent::TapeStates(states));
        }
    }

    fn control(&mut self, unit: usize, data: u16) -> Result<(), TapeError> {
        self.select(unit)?;
        match data & 0x3 {
            0 => self.stop(unit),
            1 => self.start(unit, false),
            2 => self.start(unit, true),
            _ => Ok(()),
        }
    }
}

impl Peripheral for DecTape {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::DecTape
    }

    fn device_codes(&self) -> &[u8] {
        &self.codes
    }

    fn status(&self) -> DeviceStatus {
        match self.selected.and_then(|unit| self.motion(unit)) {
            Some(Motion::Accelerating { .. } | Motion::Decelerating { .. }) => DeviceStatus::Busy,
            _ => DeviceStatus::Ready,
        }
    }

    fn submit_transfer(&mut self, request: &TransferRequest, ctx: &mut TickContext<'_>) -> Submit {
        let unit = usize::from(request.unit);
        let outcome = match request.direction {
            Direction::Read => self.read(unit).map(Completion::with_data),
            Direction::Write => self.write(unit, request.data).map(|()| Completion::done()),
            Direction::Status => Ok(Completion::status_only(self.unit_status(unit))),
            Direction::Control => self.control(unit, request.data).map(|()| Completion::done()),
        };
        self.publish(ctx);
        match outcome {
            Ok(completion) => Submit::Complete(completion),
            Err(err) => {
                debug!("{}: {err}", self.name);
                Submit::Complete(Completion::failed(err.status_bits()))
            }
        }
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) {
        let profile = self.profile;
        for transport in &mut self.transports {
            transport.advance(ctx.elapsed, &profile);
        }
        self.publish(ctx);
    }

    fn pacing_hint(&self) -> Option<Duration> {
        Some(self.profile.word_rate.interval())
    }

    fn snapshot(&self) -> Vec<DeviceEvent> {
        vec![DeviceEvent::TapeStates(self.states())]
    }
}
