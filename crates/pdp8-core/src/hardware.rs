//! Shared register regions exported by the processor hardware.
//!
//! The programmable-logic side exports three fixed windows: core memory, the
//! console register file and the IO control block. Each window holds 16-bit
//! little-endian values; the hardware writes them autonomously, so every read
//! here may observe a value that is changing underneath us. Callers re-read on
//! the next tick instead of expecting atomic snapshots.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use log::{debug, info, trace};
use memmap2::{MmapOptions, MmapRaw};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of 12-bit words addressable by a fully expanded machine (8 fields).
pub const CORE_WORDS: usize = 8 * 4096;
/// Byte stride between two registers (or two core words).
pub const REGISTER_STRIDE: usize = 4;

pub const CORE_REGION_LEN: usize = CORE_WORDS * REGISTER_STRIDE;
pub const CONSOLE_REGION_LEN: usize = 0x100;
pub const IO_REGION_LEN: usize = 0x800;

/// Value returned when reading outside a region, like an undriven bus.
pub const OPEN_BUS: u16 = 0xFFFF;

#[derive(Error, Debug)]
pub enum MapError {
    #[error("cannot open hardware device {}: {source}", path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("cannot map {region} region ({len} bytes at offset {offset:#x}): {source}")]
    Map {
        region: &'static str,
        offset: u64,
        len: usize,
        source: io::Error,
    },
    #[error("{region} region has zero length")]
    EmptyRegion { region: &'static str },
    #[error("{region} region is {actual} bytes, need at least {required}")]
    TooSmall {
        region: &'static str,
        actual: usize,
        required: usize,
    },
}

/// Backing storage for one register window.
///
/// Implementations never grow; `offset` is always even and in range when
/// called through [`Region`].
pub trait RegisterSpace: Send + Sync {
    fn len(&self) -> usize;
    fn load16(&self, offset: usize) -> u16;
    fn store16(&self, offset: usize, value: u16);
}

/// A window mapped from the hardware register device.
pub struct MappedRegion {
    map: MmapRaw,
}

impl MappedRegion {
    fn open(
        region: &'static str,
        file: &File,
        offset: u64,
        len: usize,
    ) -> Result<Self, MapError> {
        let map = MmapOptions::new()
            .offset(offset)
            .len(len)
            .map_raw(file)
            .map_err(|source| MapError::Map {
                region,
                offset,
                len,
                source,
            })?;
        Ok(Self { map })
    }
}

impl RegisterSpace for MappedRegion {
    fn len(&self) -> usize {
        self.map.len()
    }

    fn load16(&self, offset: usize) -> u16 {
        // SAFETY: `Region` checks `offset + 2 <= len` and that `offset` is
        // even; the mapping base is page aligned.
        let raw = unsafe { self.map.as_ptr().add(offset).cast::<u16>().read_volatile() };
        u16::from_le(raw)
    }

    fn store16(&self, offset: usize, value: u16) {
        // SAFETY: see `load16`.
        unsafe {
            self.map
                .as_mut_ptr()
                .add(offset)
                .cast::<u16>()
                .write_volatile(value.to_le());
        }
    }
}

/// Heap-backed window, used where no hardware is present (tests, stub
/// hardware writers).
pub struct MemoryRegion {
    words: Box<[AtomicU16]>,
}

impl MemoryRegion {
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(2)).map(|_| AtomicU16::new(0)).collect();
        Self { words }
    }
}

impl RegisterSpace for MemoryRegion {
    fn len(&self) -> usize {
        self.words.len() * 2
    }

    fn load16(&self, offset: usize) -> u16 {
        self.words[offset / 2].load(Ordering::Acquire)
    }

    fn store16(&self, offset: usize, value: u16) {
        self.words[offset / 2].store(value, Ordering::Release);
    }
}

/// Cloneable handle to one register window.
///
/// Clones share the same storage, which is how the console, the bus and any
/// stub hardware agent all see the same registers.
#[derive(Clone)]
pub struct Region {
    name: &'static str,
    space: Arc<dyn RegisterSpace>,
}

impl Region {
    pub fn new(name: &'static str, space: Arc<dyn RegisterSpace>) -> Self {
        Self { name, space }
    }

    pub fn memory(name: &'static str, len: usize) -> Self {
        Self::new(name, Arc::new(MemoryRegion::new(len)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.space.len()
    }

    pub fn is_empty(&self) -> bool {
        self.space.len() == 0
    }

    fn in_range(&self, offset: usize) -> bool {
        offset % 2 == 0 && offset.checked_add(2).is_some_and(|end| end <= self.space.len())
    }

    pub fn read16(&self, offset: usize) -> u16 {
        if !self.in_range(offset) {
            trace!("{}: read outside region at {offset:#x}", self.name);
            return OPEN_BUS;
        }
        self.space.load16(offset)
    }

    pub fn write16(&self, offset: usize, value: u16) {
        if !self.in_range(offset) {
            trace!("{}: dropped write outside region at {offset:#x}", self.name);
            return;
        }
        self.space.store16(offset, value);
    }

    /// Read-modify-write of a single register. Not atomic with respect to
    /// the hardware; a concurrent hardware write in between is lost.
    pub fn update16(&self, offset: usize, f: impl FnOnce(u16) -> u16) {
        let value = self.read16(offset);
        self.write16(offset, f(value));
    }
}

/// Core memory view: one 12-bit word per register stride.
#[derive(Clone)]
pub struct CoreMemory {
    region: Region,
}

impl CoreMemory {
    pub fn new(region: Region) -> Self {
        Self { region }
    }

    /// Reads the word at a 15-bit (field + address) location.
    pub fn read(&self, addr: u16) -> u16 {
        self.region.read16(Self::offset(addr)) & 0o7777
    }

    pub fn write(&self, addr: u16, value: u16) {
        self.region.write16(Self::offset(addr), value & 0o7777);
    }

    fn offset(addr: u16) -> usize {
        (addr as usize & (CORE_WORDS - 1)) * REGISTER_STRIDE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Device file exporting the register windows (e.g. a UIO node).
    pub path: PathBuf,
    /// Map number; the mapping offset is `map_index * page_size`.
    pub map_index: u32,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub page_size: usize,
    pub core: RegionConfig,
    pub console: RegionConfig,
    pub io: RegionConfig,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        let region = |map_index, len| RegionConfig {
            path: PathBuf::from("/dev/uio0"),
            map_index,
            len,
        };
        Self {
            page_size: 4096,
            core: region(0, CORE_REGION_LEN),
            console: region(1, CONSOLE_REGION_LEN),
            io: region(2, IO_REGION_LEN),
        }
    }
}

/// The three register windows, opened once at startup and handed to every
/// consumer by handle.
pub struct SharedHardwareMap {
    core: Region,
    console: Region,
    io: Region,
}

impl SharedHardwareMap {
    /// Maps all three windows. Any failure is fatal: emulation cannot run
    /// without the hardware.
    pub fn open(config: &HardwareConfig) -> Result<Self, MapError> {
        let core = map_region("core", &config.core, config.page_size, CORE_REGION_LEN)?;
        let console = map_region(
            "console",
            &config.console,
            config.page_size,
            CONSOLE_REGION_LEN,
        )?;
        let io = map_region("io", &config.io, config.page_size, IO_REGION_LEN)?;
        info!(
            "Hardware: mapped core ({} bytes), console ({} bytes), io ({} bytes)",
            core.len(),
            console.len(),
            io.len()
        );
        Ok(Self { core, console, io })
    }

    /// Builds a map over caller-supplied windows.
    pub fn from_regions(core: Region, console: Region, io: Region) -> Self {
        Self { core, console, io }
    }

    /// Heap-backed windows with the hardware's sizes.
    pub fn in_memory() -> Self {
        Self::from_regions(
            Region::memory("core", CORE_REGION_LEN),
            Region::memory("console", CONSOLE_REGION_LEN),
            Region::memory("io", IO_REGION_LEN),
        )
    }

    pub fn core(&self) -> &Region {
        &self.core
    }

    pub fn console(&self) -> &Region {
        &self.console
    }

    pub fn io(&self) -> &Region {
        &self.io
    }

    pub fn core_memory(&self) -> CoreMemory {
        CoreMemory::new(self.core.clone())
    }
}

fn map_region(
    name: &'static str,
    config: &RegionConfig,
    page_size: usize,
    required: usize,
) -> Result<Region, MapError> {
    if config.len == 0 {
        return Err(MapError::EmptyRegion { region: name });
    }
    if config.len < required {
        return Err(MapError::TooSmall {
            region: name,
            actual: config.len,
            required,
        });
    }

    let file = open_device(&config.path)?;
    let offset = u64::from(config.map_index) * page_size as u64;
    debug!(
        "Hardware: mapping {name} from {} at offset {offset:#x}",
        config.path.display()
    );
    let mapped = MappedRegion::open(name, &file, offset, config.len)?;
    Ok(Region::new(name, Arc::new(mapped)))
}

fn open_device(path: &Path) -> Result<File, MapError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|source| MapError::Open {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_reads_open_bus_and_drops_writes() {
        let region = Region::memory("test", 8);
        region.write16(6, 0x1234);
        assert_eq!(region.read16(6), 0x1234);

        region.write16(8, 0xAAAA);
        assert_eq!(region.read16(8), OPEN_BUS);
        assert_eq!(region.len(), 8);

        // Odd offsets straddle two registers and are treated as unmapped.
        assert_eq!(region.read16(3), OPEN_BUS);
    }

    #[test]
    fn core_memory_masks_to_twelve_bits_and_wraps_fields() {
        let map = SharedHardwareMap::in_memory();
        let core = map.core_memory();
        core.write(0o17, 0o177777);
        assert_eq!(core.read(0o17), 0o7777);

        // Addresses beyond field 7 wrap back into field 0.
        core.write(0o100_000 | 0o20, 0o1234);
        assert_eq!(core.read(0o20), 0o1234);
        assert_eq!(map.core().read16(0o20 * REGISTER_STRIDE), 0o1234);
    }

    #[test]
    fn clones_share_storage() {
        let region = Region::memory("shared", 16);
        let other = region.clone();
        other.write16(4, 0o7070);
        assert_eq!(region.read16(4), 0o7070);
    }
}
