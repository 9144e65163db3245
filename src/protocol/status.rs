//! Server status representation and legacy mapping.
//!
//! The wire carries one of two status encodings, selected per connection:
//!
//! - **Extended**: a single 32-bit unified status code.
//! - **Legacy**: a 1-byte class, 1 reserved byte, and a 2-byte code; the
//!   `(class, code)` pair is translated into the same unified representation
//!   so the rest of the engine never branches on the encoding.

use std::fmt;

/// Status encoding negotiated on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusMode {
    /// 1-byte class + 2-byte code, mapped through the translation table.
    Legacy,
    /// 4-byte unified status code.
    Extended,
}

/// Legacy status classes.
pub mod class {
    /// Operating-system level errors.
    pub const DOS: u8 = 1;
    /// Server-internal errors.
    pub const SERVER: u8 = 2;
    /// Hardware errors.
    pub const HARDWARE: u8 = 3;
}

/// Unified 32-bit status code.
///
/// The top two bits carry severity; anything with the error severity set is
/// treated as a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    pub const SUCCESS: Status = Status(0x0000_0000);
    pub const UNSUCCESSFUL: Status = Status(0xC000_0001);
    pub const INVALID_HANDLE: Status = Status(0xC000_0008);
    pub const NOT_FOUND: Status = Status(0xC000_000F);
    pub const ACCESS_DENIED: Status = Status(0xC000_0022);
    pub const PATH_NOT_FOUND: Status = Status(0xC000_003A);
    pub const SHARING_VIOLATION: Status = Status(0xC000_0043);
    pub const DISK_FULL: Status = Status(0xC000_007F);
    pub const INSUFFICIENT_RESOURCES: Status = Status(0xC000_009A);
    pub const MEDIA_WRITE_PROTECTED: Status = Status(0xC000_00A2);
    pub const NETWORK_NAME_DELETED: Status = Status(0xC000_00C9);
    pub const BAD_NETWORK_NAME: Status = Status(0xC000_00CC);
    pub const TOO_MANY_OPENED_FILES: Status = Status(0xC000_011F);
    pub const IO_DEVICE_ERROR: Status = Status(0xC000_0185);
    /// The attachment target moved; re-attach and retry the submission.
    pub const TOPOLOGY_CHANGED: Status = Status(0xC000_0257);

    /// Error severity bits (top two bits both set).
    const SEVERITY_ERROR: u32 = 0xC000_0000;

    #[inline]
    pub fn is_success(self) -> bool {
        self.0 & Self::SEVERITY_ERROR != Self::SEVERITY_ERROR
    }

    #[inline]
    pub fn is_error(self) -> bool {
        !self.is_success()
    }

    /// Translate a legacy `(class, code)` pair into the unified code.
    ///
    /// Unknown pairs fall back to a deterministic packed encoding with the
    /// error severity set, so no reply is ever unreportable.
    pub fn from_legacy(class: u8, code: u16) -> Status {
        if class == 0 && code == 0 {
            return Status::SUCCESS;
        }
        for &(c, e, status) in LEGACY_TABLE {
            if c == class && e == code {
                return status;
            }
        }
        Status(Self::SEVERITY_ERROR | (u32::from(class) << 16) | u32::from(code))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status 0x{:08X}", self.0)
    }
}

/// Legacy `(class, code)` translation table.
const LEGACY_TABLE: &[(u8, u16, Status)] = &[
    (class::DOS, 2, Status::NOT_FOUND),
    (class::DOS, 3, Status::PATH_NOT_FOUND),
    (class::DOS, 4, Status::TOO_MANY_OPENED_FILES),
    (class::DOS, 5, Status::ACCESS_DENIED),
    (class::DOS, 6, Status::INVALID_HANDLE),
    (class::DOS, 8, Status::INSUFFICIENT_RESOURCES),
    (class::DOS, 32, Status::SHARING_VIOLATION),
    (class::DOS, 112, Status::DISK_FULL),
    (class::SERVER, 1, Status::UNSUCCESSFUL),
    (class::SERVER, 4, Status::ACCESS_DENIED),
    (class::SERVER, 5, Status::NETWORK_NAME_DELETED),
    (class::SERVER, 6, Status::BAD_NETWORK_NAME),
    (class::HARDWARE, 19, Status::MEDIA_WRITE_PROTECTED),
    (class::HARDWARE, 29, Status::IO_DEVICE_ERROR),
];
