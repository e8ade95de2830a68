//! Mux binary version gate (spec §6: "version ≥ 2.4, or the `master` build").

use semver::Version;

use crate::error::{Error, Result};

const MIN_VERSION: Version = Version::new(2, 4, 0);

/// Parses the trailing whitespace-separated token of a `tmux -V`-style
/// output line (e.g. `"tmux 3.3a\n"`) and checks it against the minimum.
/// A trailing non-numeric suffix (`3.3a`) is stripped before parsing, since
/// the mux server's own versioning scheme isn't strict semver.
pub fn check_version_output(output: &str) -> Result<Version> {
    let token = output
        .split_whitespace()
        .last()
        .ok_or_else(|| Error::parse("empty -V output"))?;

    if token.eq_ignore_ascii_case("master") {
        return Ok(Version::new(u64::MAX, 0, 0));
    }

    let numeric: String = token
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let version = Version::parse(&normalize(&numeric))
        .map_err(|e| Error::parse(format!("unparseable version {token:?}: {e}")))?;

    if version < MIN_VERSION {
        return Err(Error::parse(format!(
            "mux binary version {version} is below the minimum of {MIN_VERSION}"
        )));
    }

    Ok(version)
}

/// `semver::Version::parse` requires exactly `major.minor.patch`; the mux
/// server often prints just `major.minor` (e.g. `"2.4"`).
fn normalize(numeric: &str) -> String {
    match numeric.matches('.').count() {
        0 => format!("{numeric}.0.0"),
        1 => format!("{numeric}.0"),
        _ => numeric.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_current_version() {
        assert!(check_version_output("tmux 3.3a\n").is_ok());
    }

    #[test]
    fn accepts_bare_minor_version() {
        assert!(check_version_output("tmux 2.4\n").is_ok());
    }

    #[test]
    fn rejects_old_version() {
        let err = check_version_output("tmux 2.3\n").unwrap_err();
        assert!(matches!(err, Error::ParseError(_)));
    }

    #[test]
    fn accepts_master_build() {
        assert!(check_version_output("tmux master\n").is_ok());
    }
}
