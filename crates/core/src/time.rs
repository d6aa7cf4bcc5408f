//! Monotonic microsecond clock

use std::sync::OnceLock;
use std::time::Instant;

/// Microseconds on the process-local monotonic clock
pub type Mics = i64;

pub const MICS_PER_SECOND: Mics = 1_000_000;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Current monotonic time in microseconds.
///
/// Starts at one second so that a zero timestamp always reads as "long ago".
pub fn mics_now() -> Mics {
    let epoch = EPOCH.get_or_init(Instant::now);
    MICS_PER_SECOND + epoch.elapsed().as_micros() as Mics
}
