use std::time::Duration;

const FAST_RETRIES: u32 = 3;
const BASE_DELAY_MS: u64 = 1000;
const MAX_DELAY_MS: u64 = 60_000;

/// Delay before restarting after the `failures`-th consecutive failure
/// (1-based, reset on every successful registration). The first three
/// retries are quick, then the delay doubles up to a one minute cap.
pub fn restart_delay(failures: u32) -> Duration {
	if failures <= FAST_RETRIES {
		return Duration::from_millis(BASE_DELAY_MS);
	}
	let exp = failures - FAST_RETRIES;
	let ms = if exp >= 16 {
		MAX_DELAY_MS
	} else {
		(BASE_DELAY_MS << exp).min(MAX_DELAY_MS)
	};
	Duration::from_millis(ms)
}
