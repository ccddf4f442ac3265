use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{
    Completion, DeviceStatus, Direction, Peripheral, Submit, TickContext, TransferRequest, status,
};
use crate::devices::{DeviceEvent, DeviceKind};
use crate::hardware::CoreMemory;

/// A word count of zero moves a full 4096-word field.
const FULL_FIELD: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DiskGeometry {
    pub units: usize,
    pub sectors: usize,
    pub sector_words: usize,
}

impl DiskGeometry {
    /// DF32 with three DS32 expansion platters.
    pub const DF32: DiskGeometry = DiskGeometry {
        units: 4,
        sectors: 256,
        sector_words: 128,
    };

    pub fn unit_words(&self) -> usize {
        self.sectors * self.sector_words
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskState {
    pub unit: usize,
    pub sector_cursor: usize,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskError {
    #[error("there is no disk unit {unit}")]
    NoSuchUnit { unit: usize },
    #[error("sectors {first}..{end} run past the last sector ({sectors})")]
    OutOfRange {
        first: usize,
        end: usize,
        sectors: usize,
    },
}

pub struct FixedDisk {
    name: String,
    codes: Vec<u8>,
    geometry: DiskGeometry,
    units: Vec<Vec<u16>>,
    state: DiskState,
    /// Set by a rejected bus transfer, cleared by the next good one.
    faulted: bool,
}

impl FixedDisk {
    pub fn new(name: impl Into<String>, codes: Vec<u8>, geometry: DiskGeometry) -> Self {
        Self {
            name: name.into(),
            codes,
            geometry,
            units: vec![vec![0; geometry.unit_words()]; geometry.units],
            state: DiskState {
                unit: 0,
                sector_cursor: 0,
            },
            faulted: false,
        }
    }

    pub fn geometry(&self) -> DiskGeometry {
        self.geometry
    }

    pub fn state(&self) -> DiskState {
        self.state
    }

    fn check_unit(&self, unit: usize) -> Result<(), DiskError> {
        if unit < self.units.len() {
            Ok(())
        } else {
            Err(DiskError::NoSuchUnit { unit })
        }
    }

    /// Moves `count` words between core at `mem_addr` and the disk starting
    /// at `sector`. Nothing moves unless the whole run fits on the unit.
    pub fn transfer(
        &mut self,
        unit: usize,
        sector: usize,
        count: u16,
        direction: Direction,
        mem_addr: u16,
        core: &CoreMemory,
    ) -> Result<DiskState, DiskError> {
        self.check_unit(unit)?;
        let words = match usize::from(count & 0o7777) {
            0 => FULL_FIELD,
            n => n,
        };
        let sector_words = self.geometry.sector_words;
        let end = sector + words.div_ceil(sector_words);
        if end > self.geometry.sectors {
            return Err(DiskError::OutOfRange {
                first: sector,
                end,
                sectors: self.geometry.sectors,
            });
        }

        let start = sector * sector_words;
        let storage = &mut self.units[unit][start..start + words];
        match direction {
            Direction::Read => {
                for (i, word) in storage.iter().enumerate() {
                    core.write(mem_addr.wrapping_add(i as u16), *word);
                }
            }
            Direction::Write => {
                for (i, word) in storage.iter_mut().enumerate() {
                    *word = core.read(mem_addr.wrapping_add(i as u16));
                }
            }
            Direction::Status | Direction::Control => {}
        }

        self.state = DiskState {
            unit,
            sector_cursor: end % self.geometry.sectors,
        };
        debug!(
            "{}: {:?} unit {unit} sectors {sector}..{end} <-> {mem_addr:05o}",
            self.name, direction
        );
        Ok(self.state)
    }

    /// Replaces a whole unit. Short images are zero-filled, long ones cut.
    pub fn upload(
        &mut self,
        unit: usize,
        mut words: Vec<u16>,
        ctx: &mut TickContext<'_>,
    ) -> Result<(), DiskError> {
        self.check_unit(unit)?;
        words.resize(self.geometry.unit_words(), 0);
        for word in &mut words {
            *word &= 0o7777;
        }
        self.units[unit] = words;
        info!("{}: unit {unit} replaced", self.name);
        self.state = DiskState {
            unit,
            sector_cursor: 0,
        };
        ctx.emit(DeviceEvent::StateListChanged);
        ctx.emit(DeviceEvent::Disk(self.state));
        Ok(())
    }

    pub fn download(&self, unit: usize) -> Result<Vec<u16>, DiskError> {
        self.check_unit(unit)?;
        Ok(self.units[unit].clone())
    }
}

impl Peripheral for FixedDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Disk
    }

    fn device_codes(&self) -> &[u8] {
        &self.codes
    }

    fn status(&self) -> DeviceStatus {
        if self.faulted {
            DeviceStatus::Error
        } else {
            DeviceStatus::Ready
        }
    }

    fn submit_transfer(&mut self, request: &TransferRequest, ctx: &mut TickContext<'_>) -> Submit {
        match request.direction {
            Direction::Read | Direction::Write => {
                let outcome = self.transfer(
                    usize::from(request.unit),
                    usize::from(request.block),
                    request.count,
                    request.direction,
                    request.mem_addr,
                    ctx.core,
                );
                self.faulted = outcome.is_err();
                match outcome {
                    Ok(state) => {
                        ctx.emit(DeviceEvent::Disk(state));
                        Submit::Complete(Completion::done())
                    }
                    Err(err) => {
                        debug!("{}: {err}", self.name);
                        Submit::Complete(Completion::failed(status::ADDRESS_ERROR))
                    }
                }
            }
            Direction::Status => Submit::Complete(Completion::status_only(0)),
            Direction::Control => match self.check_unit(usize::from(request.unit)) {
                Ok(()) => {
                    self.state.unit = usize::from(request.unit);
                    ctx.emit(DeviceEvent::Disk(self.state));
                    Submit::Complete(Completion::done())
                }
                Err(_) => Submit::Complete(Completion::failed(status::ADDRESS_ERROR)),
            },
        }
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) {}

    fn snapshot(&self) -> Vec<DeviceEvent> {
        vec![DeviceEvent::Disk(self.state)]
    }
}
