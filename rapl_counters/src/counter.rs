use std::{fs, path::Path};

use crate::UnavailableReading;

/// Conversion from the counter unit (microjoules) to the reported unit (millijoules).
const MICRO_TO_MILLI: u64 = 1000;

/// The value of one counter, in millijoules, or the reason why it is unavailable.
pub type CounterReading = Result<u64, UnavailableReading>;

/// Reads an `energy_uj` file and converts its value from microjoules to millijoules.
///
/// Surrounding whitespace (usually a trailing newline) is ignored.
pub fn read_counter(path: &Path) -> CounterReading {
    let content = fs::read_to_string(path).map_err(|source| UnavailableReading::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let microjoules: u64 = content.trim().parse().map_err(|source| UnavailableReading::Parse {
        path: path.to_path_buf(),
        content: content.clone(),
        source,
    })?;
    Ok(microjoules / MICRO_TO_MILLI)
}

/// Sums counter values, wrapping around on overflow like the hardware counters do.
pub fn wrapping_sum(values: impl IntoIterator<Item = u64>) -> u64 {
    values.into_iter().fold(0u64, u64::wrapping_add)
}
