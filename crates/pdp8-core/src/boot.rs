//! Bootstrap programs toggled into core memory.

use log::info;

use crate::hardware::CoreMemory;

/// A fixed program and the address its first word goes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootLoader {
    pub name: &'static str,
    pub origin: u16,
    pub words: &'static [u16],
}

/// Rotates AC and MQ forever so the console lamps chase each other.
pub const AC_MQ_BLINKER: BootLoader = BootLoader {
    name: "ac-mq-blinker",
    origin: 0o0000,
    words: &[
        0o2012, 0o5000, 0o7001, 0o7521, 0o7040, 0o7521, 0o5000, 0o0000, 0o0000, 0o0000, 0o0000,
        0o0000,
    ],
};

/// Read-in-mode loader for the teletype reader.
pub const RIM_LOW_SPEED: BootLoader = BootLoader {
    name: "rim-low-speed",
    origin: 0o7756,
    words: &[
        0o6032, 0o6031, 0o5357, 0o6036, 0o7106, 0o7006, 0o7510, 0o5357, 0o7006, 0o6031, 0o5367,
        0o6034, 0o7420, 0o3776, 0o3376, 0o5356, 0o0000,
    ],
};

/// Read-in-mode loader for the PC04 high-speed reader.
pub const RIM_HIGH_SPEED: BootLoader = BootLoader {
    name: "rim-high-speed",
    origin: 0o7756,
    words: &[
        0o6014, 0o6011, 0o5357, 0o6016, 0o7106, 0o7006, 0o7510, 0o5374, 0o7006, 0o6011, 0o5367,
        0o6016, 0o7420, 0o3776, 0o3376, 0o5357, 0o0000,
    ],
};

pub const ALL: [BootLoader; 3] = [AC_MQ_BLINKER, RIM_LOW_SPEED, RIM_HIGH_SPEED];

impl BootLoader {
    pub fn by_name(name: &str) -> Option<BootLoader> {
        ALL.iter().copied().find(|loader| loader.name == name)
    }

    /// Writes the program into consecutive words starting at the origin.
    pub fn load(&self, core: &CoreMemory) {
        for (i, &word) in self.words.iter().enumerate() {
            core.write(self.origin.wrapping_add(i as u16), word);
        }
        info!(
            "Boot: loaded {} ({} words at {:05o})",
            self.name,
            self.words.len(),
            self.origin
        );
    }
}
