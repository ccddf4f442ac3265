use std::path::PathBuf;

use pdp8_core::console::{ConsoleRegisterFile, SwitchId};
use pdp8_core::hardware::{
    CONSOLE_REGION_LEN, CORE_REGION_LEN, HardwareConfig, IO_REGION_LEN, MapError, RegionConfig,
    SharedHardwareMap,
};

const PAGE: usize = 4096;

/// Lays the three windows out back to back in one file, the way a UIO
/// device exposes consecutive maps.
fn file_config(path: PathBuf) -> HardwareConfig {
    let core_pages = (CORE_REGION_LEN / PAGE) as u32;
    HardwareConfig {
        page_size: PAGE,
        core: RegionConfig {
            path: path.clone(),
            map_index: 0,
            len: CORE_REGION_LEN,
        },
        console: RegionConfig {
            path: path.clone(),
            map_index: core_pages,
            len: CONSOLE_REGION_LEN,
        },
        io: RegionConfig {
            path,
            map_index: core_pages + 1,
            len: IO_REGION_LEN,
        },
    }
}

#[test]
fn maps_regions_from_a_device_file() {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file()
        .set_len((CORE_REGION_LEN + 2 * PAGE) as u64)
        .unwrap();
    let map = SharedHardwareMap::open(&file_config(file.path().to_path_buf())).unwrap();

    map.core_memory().write(0o200, 0o7402);
    let console = ConsoleRegisterFile::new(map.console().clone());
    console.write_switch(SwitchId::Swr, 0o1234);

    let bytes = std::fs::read(file.path()).unwrap();
    assert_eq!(&bytes[0o200 * 4..0o200 * 4 + 2], &0o7402u16.to_le_bytes());
    let swr = CORE_REGION_LEN + SwitchId::Swr.offset();
    assert_eq!(&bytes[swr..swr + 2], &0o1234u16.to_le_bytes());
}

#[test]
fn missing_device_is_fatal() {
    let config = file_config(PathBuf::from("/nonexistent/uio-pdp8"));
    let err = SharedHardwareMap::open(&config).err().unwrap();
    assert!(matches!(err, MapError::Open { .. }), "{err}");
}

#[test]
fn undersized_regions_are_rejected() {
    let file = tempfile::NamedTempFile::new().unwrap();
    file.as_file()
        .set_len((CORE_REGION_LEN + 2 * PAGE) as u64)
        .unwrap();

    let mut config = file_config(file.path().to_path_buf());
    config.console.len = 0;
    assert!(matches!(
        SharedHardwareMap::open(&config),
        Err(MapError::EmptyRegion { region: "console" })
    ));

    let mut config = file_config(file.path().to_path_buf());
    config.io.len = 16;
    assert!(matches!(
        SharedHardwareMap::open(&config),
        Err(MapError::TooSmall { region: "io", .. })
    ));
}
