//! Core domain value types.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use pmlbake_common::{
    CLASS_FILE_SYSTEM, CLASS_NETWORK, CLASS_PROCESS, CLASS_PROFILING, CLASS_REGISTRY,
};
use serde::Serialize;
use std::fmt;

/// Where a frame's code lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FrameType {
    Kernel,
    User,
    Managed,
}

impl FrameType {
    const KERNEL_BIT: u64 = 1 << 63;

    /// Classify by the top address bit: kernel space has it set.
    #[must_use]
    pub fn from_address(address: u64) -> Self {
        if address & Self::KERNEL_BIT != 0 {
            Self::Kernel
        } else {
            Self::User
        }
    }

    #[must_use]
    pub fn letter(self) -> char {
        match self {
            Self::Kernel => 'K',
            Self::User => 'U',
            Self::Managed => 'M',
        }
    }

    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Kernel => 0,
            Self::User => 1,
            Self::Managed => 2,
        }
    }

    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Kernel),
            1 => Some(Self::User),
            2 => Some(Self::Managed),
            _ => None,
        }
    }
}

/// Event class of a trace record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Process,
    Registry,
    FileSystem,
    Profiling,
    Network,
    Unknown(u32),
}

impl EventClass {
    #[must_use]
    pub fn from_u32(value: u32) -> Self {
        match value {
            CLASS_PROCESS => Self::Process,
            CLASS_REGISTRY => Self::Registry,
            CLASS_FILE_SYSTEM => Self::FileSystem,
            CLASS_PROFILING => Self::Profiling,
            CLASS_NETWORK => Self::Network,
            other => Self::Unknown(other),
        }
    }

    #[must_use]
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Process => CLASS_PROCESS,
            Self::Registry => CLASS_REGISTRY,
            Self::FileSystem => CLASS_FILE_SYSTEM,
            Self::Profiling => CLASS_PROFILING,
            Self::Network => CLASS_NETWORK,
            Self::Unknown(other) => other,
        }
    }
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => f.write_str("Process"),
            Self::Registry => f.write_str("Registry"),
            Self::FileSystem => f.write_str("File System"),
            Self::Profiling => f.write_str("Profiling"),
            Self::Network => f.write_str("Network"),
            Self::Unknown(other) => write!(f, "Class {other}"),
        }
    }
}

/// Windows FILETIME: 100ns ticks since 1601-01-01 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileTime(pub u64);

impl FileTime {
    /// Ticks between 1601-01-01 and 1970-01-01.
    const UNIX_EPOCH_TICKS: u64 = 116_444_736_000_000_000;
    const TICKS_PER_SECOND: u64 = 10_000_000;

    /// Convert to UTC. Times before the Unix epoch clamp to the epoch.
    #[must_use]
    pub fn to_utc(self) -> DateTime<Utc> {
        let since_epoch = self.0.saturating_sub(Self::UNIX_EPOCH_TICKS);
        let secs = i64::try_from(since_epoch / Self::TICKS_PER_SECOND).unwrap_or(i64::MAX);
        // Always < 1_000_000_000, so the cast is lossless.
        #[allow(clippy::cast_possible_truncation)]
        let nanos = ((since_epoch % Self::TICKS_PER_SECOND) * 100) as u32;
        Utc.timestamp_opt(secs, nanos).single().unwrap_or(DateTime::UNIX_EPOCH)
    }

    #[must_use]
    pub fn from_utc(time: DateTime<Utc>) -> Self {
        let nanos = time.timestamp_nanos_opt().unwrap_or(0).max(0);
        #[allow(clippy::cast_sign_loss)]
        let ticks = nanos as u64 / 100;
        Self(ticks + Self::UNIX_EPOCH_TICKS)
    }
}

impl fmt::Display for FileTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 7 fractional digits keep the full tick resolution visible.
        let utc = self.to_utc();
        let base = utc.to_rfc3339_opts(SecondsFormat::Secs, true);
        // Taken from the clamped time so pre-1970 values print as the epoch.
        let ticks = utc.timestamp_subsec_nanos() / 100;
        let (date_time, _) = base.split_at(base.len() - 1);
        write!(f, "{date_time}.{ticks:07}Z")
    }
}
