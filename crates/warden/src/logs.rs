use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn instance_log_dir(log_dir: &Path, instance: &str) -> PathBuf {
	log_dir.join(sanitize(instance))
}

/// Name of the file currently being appended to, e.g. `debug 26-1017.log`.
pub fn active_log_name(now: SystemTime) -> String {
	let (y, m, d, _, _, _) = civil_from_secs(unix_secs(now));
	format!("debug {:02}-{:02}{:02}.log", y % 100, m, d)
}

/// Name for a file being rotated out. Falls back to including the minute when
/// the hour-level name is already taken.
pub fn rotated_log_name(dir: &Path, now: SystemTime) -> String {
	let (y, m, d, hh, mm, _) = civil_from_secs(unix_secs(now));
	let date = format!("{:02}-{:02}{:02}", y % 100, m, d);
	let candidate = format!("debug {} {:02}.log", date, hh);
	if dir.join(&candidate).exists() {
		format!("debug {} {:02}.{:02}.log", date, hh, mm)
	} else {
		candidate
	}
}

/// Extracts `(yy, mm, dd)` from any of the names produced above.
pub fn parse_log_date(filename: &str) -> Option<(u32, u32, u32)> {
	let rest = filename.strip_prefix("debug ")?;
	let date = rest
		.split(' ')
		.next()
		.unwrap_or(rest)
		.trim_end_matches(".log");
	let (yy, mmdd) = date.split_once('-')?;
	if mmdd.len() != 4 {
		return None;
	}
	let year = yy.parse().ok()?;
	let month = mmdd[..2].parse().ok()?;
	let day = mmdd[2..].parse().ok()?;
	Some((year, month, day))
}

/// Deletes per-instance log files older than `max_age_days`, then trims each
/// instance directory to its `max_files` most recently modified files.
/// Zero disables either limit.
pub fn expire_logs(log_dir: &Path, max_age_days: u32, max_files: u32) {
	let entries = match std::fs::read_dir(log_dir) {
		Ok(e) => e,
		Err(_) => return,
	};
	for entry in entries.flatten() {
		let path = entry.path();
		if path.is_dir() {
			expire_instance_logs(&path, max_age_days, max_files);
		}
	}
}

fn expire_instance_logs(dir: &Path, max_age_days: u32, max_files: u32) {
	let entries = match std::fs::read_dir(dir) {
		Ok(e) => e,
		Err(_) => return,
	};
	let mut files: Vec<(PathBuf, Option<(u32, u32, u32)>)> = entries
		.flatten()
		.map(|e| e.path())
		.filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
		.map(|p| {
			let date = p.file_name().and_then(|n| n.to_str()).and_then(parse_log_date);
			(p, date)
		})
		.collect();

	if max_age_days > 0 {
		let cutoff = unix_secs(SystemTime::now()).saturating_sub(max_age_days as u64 * 86400);
		files.retain(|(path, date)| match date {
			Some((y, m, d)) if secs_from_civil(*y, *m, *d) < cutoff => {
				let _ = std::fs::remove_file(path);
				false
			}
			_ => true,
		});
	}

	if max_files > 0 && files.len() > max_files as usize {
		files.sort_by_key(|(path, _)| path.metadata().and_then(|m| m.modified()).ok());
		let excess = files.len() - max_files as usize;
		for (path, _) in files.iter().take(excess) {
			let _ = std::fs::remove_file(path);
		}
	}
}

/// `YYYY-MM-DD HH:MM:SS` in UTC.
pub fn format_timestamp(at: SystemTime) -> String {
	let (y, m, d, hh, mm, ss) = civil_from_secs(unix_secs(at));
	format!("{:04}-{:02}-{:02} {:02}:{:02}:{:02}", y, m, d, hh, mm, ss)
}

fn unix_secs(at: SystemTime) -> u64 {
	at.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn sanitize(instance: &str) -> String {
	instance
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
		.collect()
}

/// Unix seconds to `(year, month, day, hour, minute, second)`, proleptic Gregorian.
pub fn civil_from_secs(secs: u64) -> (u32, u32, u32, u32, u32, u32) {
	let days = (secs / 86400) as i64;
	let rem = secs % 86400;
	let (hh, mm, ss) = ((rem / 3600) as u32, ((rem % 3600) / 60) as u32, (rem % 60) as u32);

	let z = days + 719_468;
	let era = z.div_euclid(146_097);
	let doe = (z - era * 146_097) as u32;
	let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
	let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
	let mp = (5 * doy + 2) / 153;
	let day = doy - (153 * mp + 2) / 5 + 1;
	let month = if mp < 10 { mp + 3 } else { mp - 9 };
	let year = yoe as i64 + era * 400 + if month <= 2 { 1 } else { 0 };

	(year as u32, month, day, hh, mm, ss)
}

fn secs_from_civil(year: u32, month: u32, day: u32) -> u64 {
	let year = i64::from(if year < 100 { 2000 + year } else { year });
	let (month, day) = (month as i64, day as i64);
	let y = if month <= 2 { year - 1 } else { year };
	let era = y.div_euclid(400);
	let yoe = y - era * 400;
	let mp = if month > 2 { month - 3 } else { month + 9 };
	let doy = (153 * mp + 2) / 5 + day - 1;
	let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
	let days = era * 146_097 + doe - 719_468;
	(days.max(0) * 86400) as u64
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::time::Duration;

	#[test]
	fn parses_every_name_shape() {
		assert_eq!(parse_log_date("debug 26-1017.log"), Some((26, 10, 17)));
		assert_eq!(parse_log_date("debug 26-1017 09.log"), Some((26, 10, 17)));
		assert_eq!(parse_log_date("debug 26-1017 09.47.log"), Some((26, 10, 17)));
		assert_eq!(parse_log_date("web 26-1017.log"), None);
		assert_eq!(parse_log_date("debug nonsense.log"), None);
	}

	#[test]
	fn civil_roundtrip() {
		let at = 1_771_027_200;
		assert_eq!(civil_from_secs(at), (2026, 2, 14, 0, 0, 0));
		assert_eq!(secs_from_civil(26, 2, 14), at);
	}

	#[test]
	fn timestamp_format() {
		let at = UNIX_EPOCH + Duration::from_secs(1_771_027_200 + 3661);
		assert_eq!(format_timestamp(at), "2026-02-14 01:01:01");
	}

	#[test]
	fn active_name_uses_short_date() {
		let at = UNIX_EPOCH + Duration::from_secs(1_771_027_200);
		assert_eq!(active_log_name(at), "debug 26-0214.log");
	}

	#[test]
	fn instance_dirs_are_filesystem_safe() {
		let dir = instance_log_dir(Path::new("/logs"), "rack/a b");
		assert_eq!(dir, Path::new("/logs").join("rack_a_b"));
	}

	#[test]
	fn expiry_removes_old_files() {
		let root = std::env::temp_dir().join(format!("warden-expire-{}", std::process::id()));
		let dir = root.join("rack-a");
		std::fs::create_dir_all(&dir).unwrap();
		std::fs::write(dir.join("debug 20-0101.log"), "old").unwrap();
		let fresh = active_log_name(SystemTime::now());
		std::fs::write(dir.join(&fresh), "new").unwrap();

		expire_logs(&root, 7, 0);

		assert!(!dir.join("debug 20-0101.log").exists());
		assert!(dir.join(&fresh).exists());
		let _ = std::fs::remove_dir_all(&root);
	}
}
