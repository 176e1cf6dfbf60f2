use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Version of the running host.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid version '{0}'")]
pub struct InvalidVersion(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CoreVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl CoreVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    pub fn host() -> Self {
        HOST_VERSION.parse().unwrap_or(Self::new(0, 0, 0))
    }

    /// Same major version and not older than `required`.
    pub fn satisfies(&self, required: &CoreVersion) -> bool {
        self.major == required.major && self >= required
    }
}

impl FromStr for CoreVersion {
    type Err = InvalidVersion;

    /// Accepts `1.2.3`, `>=1.2.3`, `^1.2`, `~1`, `v1.2.3`. Missing parts are zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s
            .trim()
            .trim_start_matches(">=")
            .trim_start_matches(['^', '~', 'v', '='])
            .trim();
        // pre-release and build suffixes are ignored
        let core = trimmed.split(['-', '+']).next().unwrap_or_default();
        if core.is_empty() {
            return Err(InvalidVersion(s.to_string()));
        }
        let mut parts = [0u32; 3];
        for (i, part) in core.split('.').enumerate() {
            if i >= 3 {
                return Err(InvalidVersion(s.to_string()));
            }
            parts[i] = part.parse().map_err(|_| InvalidVersion(s.to_string()))?;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl fmt::Display for CoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_requirement_forms() {
        assert_eq!(">=0.2.0".parse::<CoreVersion>().unwrap(), CoreVersion::new(0, 2, 0));
        assert_eq!("^1.4".parse::<CoreVersion>().unwrap(), CoreVersion::new(1, 4, 0));
        assert_eq!("v2".parse::<CoreVersion>().unwrap(), CoreVersion::new(2, 0, 0));
        assert_eq!("1.2.3-beta.1".parse::<CoreVersion>().unwrap(), CoreVersion::new(1, 2, 3));
        assert!("".parse::<CoreVersion>().is_err());
        assert!("one.two".parse::<CoreVersion>().is_err());
        assert!("1.2.3.4".parse::<CoreVersion>().is_err());
    }

    #[test]
    fn satisfaction_needs_same_major_and_not_older() {
        let host = CoreVersion::new(0, 2, 0);
        assert!(host.satisfies(&CoreVersion::new(0, 1, 9)));
        assert!(host.satisfies(&CoreVersion::new(0, 2, 0)));
        assert!(!host.satisfies(&CoreVersion::new(0, 3, 0)));
        assert!(!host.satisfies(&CoreVersion::new(1, 0, 0)));
        assert_eq!(CoreVersion::host().to_string(), HOST_VERSION);
    }
}
