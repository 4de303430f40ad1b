use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// `major.minor.patch` version of the module API a plugin was built against.
/// Prerelease and build suffixes are accepted and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiVersion {
	pub major: u32,
	pub minor: u32,
	pub patch: u32,
}

impl ApiVersion {
	pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
		Self { major, minor, patch }
	}

	/// A module is compatible with a host API when they share a major version
	/// and the module doesn't need anything newer than the host provides.
	pub fn is_compatible_with(&self, host: &ApiVersion) -> bool {
		self.major == host.major && (self.minor, self.patch) <= (host.minor, host.patch)
	}
}

impl PartialOrd for ApiVersion {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for ApiVersion {
	fn cmp(&self, other: &Self) -> Ordering {
		(self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
	}
}

impl fmt::Display for ApiVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid api version: {0:?}")]
pub struct ParseVersionError(pub String);

impl FromStr for ApiVersion {
	type Err = ParseVersionError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let core = s
			.trim()
			.trim_start_matches('v')
			.split(['-', '+'])
			.next()
			.unwrap_or_default();
		let mut parts = core.split('.');
		let mut next = || -> Result<u32, ParseVersionError> {
			match parts.next() {
				Some(p) => p.parse().map_err(|_| ParseVersionError(s.to_string())),
				None => Ok(0),
			}
		};
		let major = next()?;
		let minor = next()?;
		let patch = next()?;
		if core.is_empty() || core.split('.').count() > 3 {
			return Err(ParseVersionError(s.to_string()));
		}
		Ok(Self::new(major, minor, patch))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parse_full_and_partial() {
		assert_eq!("1.12.3".parse(), Ok(ApiVersion::new(1, 12, 3)));
		assert_eq!("2.0".parse(), Ok(ApiVersion::new(2, 0, 0)));
		assert_eq!("v1".parse(), Ok(ApiVersion::new(1, 0, 0)));
		assert_eq!("1.4.0-beta.2".parse(), Ok(ApiVersion::new(1, 4, 0)));
	}

	#[test]
	fn parse_rejects_garbage() {
		assert!("".parse::<ApiVersion>().is_err());
		assert!("one.two".parse::<ApiVersion>().is_err());
		assert!("1.2.3.4".parse::<ApiVersion>().is_err());
	}

	#[test]
	fn compatibility_requires_same_major_and_not_newer() {
		let host = ApiVersion::new(1, 14, 0);
		assert!(ApiVersion::new(1, 0, 0).is_compatible_with(&host));
		assert!(ApiVersion::new(1, 14, 0).is_compatible_with(&host));
		assert!(!ApiVersion::new(1, 15, 0).is_compatible_with(&host));
		assert!(!ApiVersion::new(2, 0, 0).is_compatible_with(&host));
		assert!(!ApiVersion::new(0, 9, 0).is_compatible_with(&host));
	}

	#[test]
	fn ordering_is_numeric() {
		assert!(ApiVersion::new(1, 10, 0) > ApiVersion::new(1, 9, 9));
	}
}
