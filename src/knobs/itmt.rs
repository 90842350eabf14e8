//! ITMT global sysfs toggle (spec.md §4.6 "ITMT").

use std::path::Path;

use crate::config::Setting;
use crate::error::LpmdError;
use crate::sysfs;

const ITMT_PATH: &str = "/proc/sys/kernel/sched_itmt_enabled";

pub fn apply(setting: Setting<bool>, saved_at_init: bool) -> Result<(), LpmdError> {
    match setting {
        Setting::Ignore => Ok(()),
        Setting::Value(v) => sysfs::write_u64(Path::new(ITMT_PATH), v as u64),
        Setting::Restore => sysfs::write_u64(Path::new(ITMT_PATH), saved_at_init as u64),
    }
}

pub fn read_current() -> Result<bool, LpmdError> {
    Ok(sysfs::read_u64(Path::new(ITMT_PATH))? != 0)
}
