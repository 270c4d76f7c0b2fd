//! Per-connection capability flags derived from the server version (spec
//! §4.K).

use crate::version::ServerVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub supports_range_types: bool,
    pub supports_enum_types: bool,
    pub supports_close_all: bool,
    pub supports_discard_temp: bool,
    pub supports_discard: bool,
    pub supports_advisory_locks: bool,
    pub supports_discard_sequences: bool,
    pub supports_unlisten: bool,
    pub has_integer_datetimes: bool,
}

impl DatabaseInfo {
    /// `integer_datetimes` defaults to `on` on any server new enough to
    /// report it at all (spec §4.K).
    pub fn from_version(version: &ServerVersion, integer_datetimes_param: Option<&str>) -> Self {
        Self {
            supports_range_types: version.at_least(9, 2),
            supports_enum_types: version.at_least(8, 3),
            supports_close_all: version.at_least(8, 3),
            supports_discard_temp: version.at_least(8, 3),
            supports_discard: version.at_least(8, 3),
            supports_advisory_locks: version.at_least(8, 2),
            supports_discard_sequences: version.at_least(9, 4),
            supports_unlisten: version.at_least(6, 4),
            has_integer_datetimes: integer_datetimes_param.map(|v| v != "off").unwrap_or(true),
        }
    }
}
