//! Purpose: Classify a CPL runtime's self-reported version and pick its type-tag encoding.
//! Exports: `CplVersion`, `Support`, `TypeTags`, `SUPPORTED_VERSIONS`, `VERSION_FLOOR`.
//! Role: Selected once per loaded library; carried inside the handle afterwards.
//! Invariants: Classification is advisory; only `VERSION_FLOOR` blocks a load.
//! Invariants: Parameter type checks always go through a handle's `TypeTags`.

use std::fmt;
use std::os::raw::c_int;

use serde::Serialize;

use crate::core::params::ParamType;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CplVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl CplVersion {
    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor,
            micro,
        }
    }

    /// Packed ordering code, `major * 65536 + minor * 256 + micro`.
    pub const fn code(self) -> u32 {
        self.major * 65536 + self.minor * 256 + self.micro
    }

    pub const fn from_code(code: u32) -> Self {
        Self::new((code >> 16) & 0xff, (code >> 8) & 0xff, code & 0xff)
    }
}

impl fmt::Display for CplVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl Serialize for CplVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Support {
    Unknown,
    KnownMajor,
    KnownExact,
}

/// Releases whose ABI has been checked against this runner, newest first.
pub const SUPPORTED_VERSIONS: &[CplVersion] = &[
    CplVersion::new(7, 0, 0),
    CplVersion::new(6, 6, 1),
    CplVersion::new(6, 6, 0),
    CplVersion::new(6, 5, 1),
    CplVersion::new(6, 5, 0),
    CplVersion::new(6, 4, 2),
    CplVersion::new(6, 4, 1),
    CplVersion::new(6, 4, 0),
    CplVersion::new(6, 3, 1),
    CplVersion::new(6, 3, 0),
    CplVersion::new(6, 2, 0),
    CplVersion::new(6, 1, 1),
    CplVersion::new(6, 0, 1),
    CplVersion::new(6, 0, 0),
    CplVersion::new(5, 3, 1),
    CplVersion::new(5, 2, 0),
    CplVersion::new(5, 1, 0),
    CplVersion::new(5, 0, 1),
    CplVersion::new(5, 0, 0),
];

/// Oldest release that reports usable plugin metadata.
pub const VERSION_FLOOR: CplVersion = CplVersion::new(4, 0, 0);

/// First release using the widened type-tag encoding.
pub const TYPE_TAG_BOUNDARY: CplVersion = CplVersion::new(6, 0, 0);

pub fn classify(version: CplVersion) -> Support {
    if SUPPORTED_VERSIONS.contains(&version) {
        Support::KnownExact
    } else if SUPPORTED_VERSIONS
        .iter()
        .any(|known| known.major == version.major)
    {
        Support::KnownMajor
    } else {
        Support::Unknown
    }
}

/// Numeric `cpl_type` values for the four parameter primitives.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TypeTags {
    pub bool_tag: c_int,
    pub int_tag: c_int,
    pub double_tag: c_int,
    pub string_tag: c_int,
}

impl TypeTags {
    pub const CURRENT: TypeTags = TypeTags {
        bool_tag: 1 << 7,
        int_tag: 1 << 10,
        double_tag: 1 << 17,
        string_tag: (1 << 5) | 1,
    };

    pub const LEGACY: TypeTags = TypeTags {
        bool_tag: 1 << 7,
        int_tag: 1 << 8,
        double_tag: 1 << 13,
        string_tag: (1 << 5) | 1,
    };

    pub fn for_version(version: CplVersion) -> TypeTags {
        if version >= TYPE_TAG_BOUNDARY {
            Self::CURRENT
        } else {
            Self::LEGACY
        }
    }

    pub fn param_type(&self, raw: c_int) -> Option<ParamType> {
        match raw {
            tag if tag == self.bool_tag => Some(ParamType::Bool),
            tag if tag == self.int_tag => Some(ParamType::Int),
            tag if tag == self.double_tag => Some(ParamType::Double),
            tag if tag == self.string_tag => Some(ParamType::String),
            _ => None,
        }
    }

    pub fn tag(&self, value_type: ParamType) -> c_int {
        match value_type {
            ParamType::Bool => self.bool_tag,
            ParamType::Int => self.int_tag,
            ParamType::Double => self.double_tag,
            ParamType::String => self.string_tag,
        }
    }
}
