//! `MAJOR.MINOR` version strings.
//!
//! Every version the gate deals with (binary, compatibility, history
//! anchors) is written as `MAJOR.MINOR` and compared as a semver
//! version with a zero patch component.

use semver::Version;

use crate::error::{GateError, GateResult};

/// Parse `"MAJOR.MINOR"` into a [`Version`] with patch 0.
///
/// Anything else (a patch component, pre-release tags, empty parts,
/// non-digits) is rejected with [`GateError::MajorAndMinorOnly`].
pub fn parse_major_minor(raw: &str) -> GateResult<Version> {
    let shape_err = || GateError::MajorAndMinorOnly(raw.to_string());

    let (major, minor) = raw.split_once('.').ok_or_else(shape_err)?;
    if !is_number(major) || !is_number(minor) {
        return Err(shape_err());
    }

    let major = major.parse::<u64>().map_err(|_| shape_err())?;
    let minor = minor.parse::<u64>().map_err(|_| shape_err())?;
    Ok(Version::new(major, minor, 0))
}

/// Render a version back into `"MAJOR.MINOR"` form.
pub fn format_major_minor(version: &Version) -> String {
    format!("{}.{}", version.major, version.minor)
}

fn is_number(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_major_minor() {
        assert_eq!(parse_major_minor("1.29").unwrap(), Version::new(1, 29, 0));
        assert_eq!(parse_major_minor("0.0").unwrap(), Version::new(0, 0, 0));
    }

    #[test]
    fn rejects_other_shapes() {
        for raw in ["", "1", "1.29.0", "1.", ".1", "v1.29", "1.x", "1.29-alpha", " 1.29"] {
            assert_eq!(
                parse_major_minor(raw),
                Err(GateError::MajorAndMinorOnly(raw.to_string())),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn formats_without_patch() {
        assert_eq!(format_major_minor(&Version::new(1, 28, 0)), "1.28");
    }

    #[test]
    fn compares_numerically() {
        assert!(parse_major_minor("1.9").unwrap() < parse_major_minor("1.10").unwrap());
    }
}
