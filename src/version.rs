//! PostgreSQL `server_version` string parser (spec §4.B).

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseType {
    Release,
    Alpha,
    Beta,
    ReleaseCandidate,
    Devel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: Option<u32>,
    pub build: Option<u32>,
    pub revision: Option<u32>,
    pub release_type: ReleaseType,
    pub pre_release: Option<u32>,
}

impl ServerVersion {
    /// `true` if this server is >= the given `(major, minor)` baseline.
    /// Missing `minor` is treated as `0` (as PostgreSQL's own comparisons do).
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        (self.major, self.minor.unwrap_or(0)) >= (major, minor)
    }
}

fn read_digits(bytes: &[u8], mut i: usize) -> Option<(u32, usize)> {
    let start = i;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i == start {
        return None;
    }
    std::str::from_utf8(&bytes[start..i])
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .map(|v| (v, i))
}

/// Parses a raw `server_version` string into a structured version plus the
/// "portable" echo string: the accepted numeric-and-tag prefix of the input.
pub fn parse(input: &str) -> Result<(ServerVersion, String), Error> {
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let start = i;

    let (major, mut cursor) = read_digits(bytes, i).ok_or_else(|| Error::format("server_version", i))?;
    i = cursor;

    let mut segments = [None; 3];
    for slot in segments.iter_mut() {
        if i < bytes.len() && bytes[i] == b'.' {
            if let Some((value, next)) = read_digits(bytes, i + 1) {
                *slot = Some(value);
                i = next;
                cursor = i;
                continue;
            }
        }
        break;
    }

    // A 5th segment (a '.' right after a filled revision slot) is a format error.
    if segments.iter().all(Option::is_some) && i < bytes.len() && bytes[i] == b'.' {
        return Err(Error::format("server_version", i));
    }

    let (release_type, pre_release) = if bytes[i..].starts_with(b"devel") {
        i += "devel".len();
        (ReleaseType::Devel, None)
    } else if bytes[i..].starts_with(b"alpha") {
        i += "alpha".len();
        let pre = read_digits(bytes, i).map(|(v, next)| {
            i = next;
            v
        });
        (ReleaseType::Alpha, pre)
    } else if bytes[i..].starts_with(b"beta") {
        i += "beta".len();
        let pre = read_digits(bytes, i).map(|(v, next)| {
            i = next;
            v
        });
        (ReleaseType::Beta, pre)
    } else if bytes[i..].starts_with(b"rc") {
        i += "rc".len();
        let pre = read_digits(bytes, i).map(|(v, next)| {
            i = next;
            v
        });
        (ReleaseType::ReleaseCandidate, pre)
    } else {
        // Unrecognized trailing content: truncate to a Release at this point.
        (ReleaseType::Release, None)
    };
    let _ = cursor;

    let portable = input[start..i].to_string();

    Ok((
        ServerVersion {
            major,
            minor: segments[0],
            build: segments[1],
            revision: segments[2],
            release_type,
            pre_release,
        },
        portable,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_release() {
        let (v, portable) = parse("15.4").unwrap();
        assert_eq!(v.major, 15);
        assert_eq!(v.minor, Some(4));
        assert_eq!(v.release_type, ReleaseType::Release);
        assert_eq!(v.pre_release, None);
        assert_eq!(portable, "15.4");
    }

    #[test]
    fn parses_devel_with_no_pre_release() {
        let (v, portable) = parse("17devel").unwrap();
        assert_eq!(v.major, 17);
        assert_eq!(v.release_type, ReleaseType::Devel);
        assert_eq!(v.pre_release, None);
        assert_eq!(portable, "17devel");
    }

    #[test]
    fn parses_beta_with_pre_release_digits() {
        let (v, _) = parse("14beta3").unwrap();
        assert_eq!(v.release_type, ReleaseType::Beta);
        assert_eq!(v.pre_release, Some(3));
    }

    #[test]
    fn parses_rc_without_digits() {
        let (v, _) = parse("16rc").unwrap();
        assert_eq!(v.release_type, ReleaseType::ReleaseCandidate);
        assert_eq!(v.pre_release, None);
    }

    #[test]
    fn tolerates_leading_whitespace() {
        let (v, portable) = parse("   12.3").unwrap();
        assert_eq!(v.major, 12);
        assert_eq!(portable, "12.3");
    }

    #[test]
    fn truncates_unknown_trailing_content_to_release() {
        let (v, portable) = parse("9.6.24xyz").unwrap();
        assert_eq!(v.release_type, ReleaseType::Release);
        assert_eq!(portable, "9.6.24");
    }

    #[test]
    fn portable_is_prefix_of_input() {
        let input = "   13.2 (extra garbage)";
        let (_, portable) = parse(input).unwrap();
        assert!(input.trim_start().starts_with(&portable));
    }

    #[test]
    fn rejects_malformed_leading_content() {
        assert!(parse("abc").is_err());
    }

    #[test]
    fn rejects_fifth_segment() {
        assert!(parse("1.2.3.4.5").is_err());
    }

    #[test]
    fn at_least_compares_major_minor() {
        let (v, _) = parse("15.2").unwrap();
        assert!(v.at_least(15, 0));
        assert!(v.at_least(10, 9));
        assert!(!v.at_least(15, 3));
        assert!(!v.at_least(16, 0));
    }
}
