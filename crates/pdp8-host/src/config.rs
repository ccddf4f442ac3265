use std::path::{Path, PathBuf};

use log::{info, warn};
use pdp8_core::bus::{BusError, DeviceBus};
use pdp8_core::devices::Device;
use pdp8_core::devices::clock::{ClockRate, ProgrammableClock};
use pdp8_core::devices::dectape::{DecTape, TapeError, TransportProfile};
use pdp8_core::devices::disk::{DiskError, DiskGeometry, FixedDisk};
use pdp8_core::devices::paper_tape::{PaperTape, TapeProfile};
use pdp8_core::hardware::HardwareConfig;
use pdp8_core::image::words_from_bytes;
use pdp8_relay::RelayConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Tape(#[from] TapeError),
    #[error(transparent)]
    Disk(#[from] DiskError),
    #[error("unknown boot loader {0:?}")]
    UnknownLoader(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DeviceConfig {
    Teletype {
        name: String,
        reader_code: u8,
        punch_code: u8,
        #[serde(default)]
        tape: Option<PathBuf>,
    },
    HighSpeedTape {
        name: String,
        reader_code: u8,
        punch_code: u8,
        #[serde(default)]
        tape: Option<PathBuf>,
    },
    Dectape {
        name: String,
        codes: [u8; 2],
        /// Images for transports 0 and 1, in order.
        #[serde(default)]
        images: Vec<PathBuf>,
    },
    Disk {
        name: String,
        codes: Vec<u8>,
        #[serde(default)]
        geometry: Option<DiskGeometry>,
        #[serde(default)]
        images: Vec<PathBuf>,
    },
    Clock {
        name: String,
        code: u8,
        rate: ClockRate,
    },
}

impl DeviceConfig {
    pub fn name(&self) -> &str {
        match self {
            DeviceConfig::Teletype { name, .. }
            | DeviceConfig::HighSpeedTape { name, .. }
            | DeviceConfig::Dectape { name, .. }
            | DeviceConfig::Disk { name, .. }
            | DeviceConfig::Clock { name, .. } => name,
        }
    }

    /// Builds the device, registers it and mounts any configured media.
    pub fn install(&self, bus: &mut DeviceBus) -> Result<(), ConfigError> {
        match self {
            DeviceConfig::Teletype {
                name,
                reader_code,
                punch_code,
                tape,
            }
            | DeviceConfig::HighSpeedTape {
                name,
                reader_code,
                punch_code,
                tape,
            } => {
                let profile = match self {
                    DeviceConfig::Teletype { .. } => TapeProfile::ASR33,
                    _ => TapeProfile::PC04,
                };
                bus.register(Device::PaperTape(PaperTape::new(
                    name.as_str(),
                    profile,
                    *reader_code,
                    *punch_code,
                )))?;
                if let Some(path) = tape {
                    let bytes = read_image(path)?;
                    bus.with_device(name, |device, ctx| {
                        if let Some(tape) = device.as_paper_tape_mut() {
                            tape.load_tape(bytes, ctx);
                        }
                    });
                }
            }
            DeviceConfig::Dectape {
                name,
                codes,
                images,
            } => {
                bus.register(Device::DecTape(DecTape::new(
                    name.as_str(),
                    *codes,
                    TransportProfile::TU56,
                )))?;
                for (unit, path) in images.iter().enumerate() {
                    let words = words_from_bytes(&read_image(path)?);
                    bus.with_device(name, |device, ctx| {
                        device
                            .as_dectape_mut()
                            .map_or(Ok(()), |tape| tape.load(unit, words, ctx))
                    })
                    .transpose()?;
                }
            }
            DeviceConfig::Disk {
                name,
                codes,
                geometry,
                images,
            } => {
                bus.register(Device::Disk(FixedDisk::new(
                    name.as_str(),
                    codes.clone(),
                    geometry.unwrap_or(DiskGeometry::DF32),
                )))?;
                for (unit, path) in images.iter().enumerate() {
                    let words = words_from_bytes(&read_image(path)?);
                    bus.with_device(name, |device, ctx| {
                        device
                            .as_disk_mut()
                            .map_or(Ok(()), |disk| disk.upload(unit, words, ctx))
                    })
                    .transpose()?;
                }
            }
            DeviceConfig::Clock { name, code, rate } => {
                bus.register(Device::Clock(ProgrammableClock::new(
                    name.as_str(),
                    *code,
                    *rate,
                )))?;
            }
        }
        Ok(())
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>, ConfigError> {
    let bytes = std::fs::read(path).map_err(|source| ConfigError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Config: read {} ({} bytes)", path.display(), bytes.len());
    Ok(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub hardware: HardwareConfig,
    /// Nominal bus tick period; devices may ask for a finer one.
    pub tick_us: u64,
    pub console_poll_ms: u64,
    pub relay: RelayConfig,
    pub boot: Option<String>,
    pub devices: Vec<DeviceConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            hardware: HardwareConfig::default(),
            tick_us: 1000,
            console_poll_ms: 50,
            relay: RelayConfig::default(),
            boot: None,
            devices: default_devices(),
        }
    }
}

/// A PDP-8/I with the usual complement of peripherals.
pub fn default_devices() -> Vec<DeviceConfig> {
    vec![
        DeviceConfig::HighSpeedTape {
            name: "ptr".to_string(),
            reader_code: 0o01,
            punch_code: 0o02,
            tape: None,
        },
        DeviceConfig::Teletype {
            name: "tty".to_string(),
            reader_code: 0o03,
            punch_code: 0o04,
            tape: None,
        },
        DeviceConfig::Clock {
            name: "clk".to_string(),
            code: 0o13,
            rate: ClockRate::Hz60,
        },
        DeviceConfig::Disk {
            name: "df32".to_string(),
            codes: vec![0o60, 0o61, 0o62],
            geometry: None,
            images: Vec::new(),
        },
        DeviceConfig::Dectape {
            name: "tc08".to_string(),
            codes: [0o76, 0o77],
            images: Vec::new(),
        },
    ]
}

pub fn default_config_path() -> PathBuf {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("pdp8-bridge").join("host.toml");
    }

    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("pdp8-bridge")
            .join("host.toml");
    }

    PathBuf::from("host.toml")
}

pub fn load_from_file(path: &Path) -> HostConfig {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => return HostConfig::default(),
    };

    match toml::from_str::<HostConfig>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(
                "Failed to parse host config {}: {e}; using defaults",
                path.display()
            );
            HostConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdp8_core::bus::Peripheral;
    use pdp8_core::hardware::SharedHardwareMap;
    use std::io::Write;

    #[test]
    fn missing_or_broken_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            load_from_file(&dir.path().join("absent.toml")),
            HostConfig::default()
        );

        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "tick_us = \"soon\"").unwrap();
        assert_eq!(load_from_file(&path), HostConfig::default());
    }

    #[test]
    fn parses_device_list_and_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
tick_us = 250
boot = "rim-high-speed"

[relay]
bind = "0.0.0.0:9000"

[hardware.io]
path = "/dev/uio3"
map_index = 0
len = 2048

[[devices]]
kind = "teletype"
name = "tty"
reader_code = 3
punch_code = 4

[[devices]]
kind = "clock"
name = "clk"
code = 11
rate = "100hz"
"#
        )
        .unwrap();

        let cfg = load_from_file(file.path());
        assert_eq!(cfg.tick_us, 250);
        assert_eq!(cfg.console_poll_ms, 50);
        assert_eq!(cfg.boot.as_deref(), Some("rim-high-speed"));
        assert_eq!(cfg.relay.bind.port(), 9000);
        assert_eq!(cfg.hardware.io.path, PathBuf::from("/dev/uio3"));
        assert_eq!(cfg.hardware.core, HardwareConfig::default().core);
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.devices[1].name(), "clk");
    }

    #[test]
    fn installs_devices_and_mounts_images() {
        let dir = tempfile::tempdir().unwrap();
        let tape = dir.path().join("hello.rim");
        std::fs::write(&tape, [0o200u8, 0o1, 0o2]).unwrap();
        let disk = dir.path().join("os8.df32");
        std::fs::write(&disk, [0xFF, 0x0F, 0x01, 0x00]).unwrap();

        let map = SharedHardwareMap::in_memory();
        let mut bus = DeviceBus::new(map.io().clone(), map.core_memory());
        let devices = [
            DeviceConfig::HighSpeedTape {
                name: "ptr".to_string(),
                reader_code: 0o01,
                punch_code: 0o02,
                tape: Some(tape),
            },
            DeviceConfig::Disk {
                name: "df32".to_string(),
                codes: vec![0o60],
                geometry: None,
                images: vec![disk],
            },
        ];
        for device in &devices {
            device.install(&mut bus).unwrap();
        }

        let ptr = bus.device("ptr").and_then(Device::as_paper_tape).unwrap();
        assert_eq!(ptr.state().reader_len, 3);
        let df = bus.device("df32").and_then(Device::as_disk).unwrap();
        assert_eq!(&df.download(0).unwrap()[..3], &[0o7777, 1, 0]);
        assert_eq!(df.device_codes(), &[0o60]);
    }

    #[test]
    fn missing_image_is_reported() {
        let map = SharedHardwareMap::in_memory();
        let mut bus = DeviceBus::new(map.io().clone(), map.core_memory());
        let device = DeviceConfig::Dectape {
            name: "tc08".to_string(),
            codes: [0o76, 0o77],
            images: vec![PathBuf::from("/nonexistent/system.tu56")],
        };
        assert!(matches!(
            device.install(&mut bus),
            Err(ConfigError::Image { .. })
        ));
    }
}
