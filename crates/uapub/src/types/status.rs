// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OPC UA StatusCode (Part 4 Section 7.34).
//!
//! Status codes are the error currency of the whole crate. The severity lives
//! in the top two bits (0b10 = Bad, 0b01 = Uncertain). Only the codes the
//! PubSub layer actually produces or consumes are listed here.

use std::fmt;

/// A 32-bit OPC UA status code.
///
/// `StatusCode` doubles as the crate-wide error type: fallible operations
/// return [`Result<T>`](crate::Result) where the `Err` variant is a bad
/// status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);

    pub const BAD_INTERNAL_ERROR: StatusCode = StatusCode(0x8002_0000);
    pub const BAD_OUT_OF_MEMORY: StatusCode = StatusCode(0x8003_0000);
    pub const BAD_RESOURCE_UNAVAILABLE: StatusCode = StatusCode(0x8004_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_ENCODING_ERROR: StatusCode = StatusCode(0x8006_0000);
    pub const BAD_DECODING_ERROR: StatusCode = StatusCode(0x8007_0000);
    pub const BAD_ENCODING_LIMITS_EXCEEDED: StatusCode = StatusCode(0x8008_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_SECURITY_CHECKS_FAILED: StatusCode = StatusCode(0x8013_0000);
    pub const BAD_NO_COMMUNICATION: StatusCode = StatusCode(0x8031_0000);
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8033_0000);
    pub const BAD_NODE_ID_EXISTS: StatusCode = StatusCode(0x8034_0000);
    pub const BAD_ATTRIBUTE_ID_INVALID: StatusCode = StatusCode(0x8035_0000);
    pub const BAD_INDEX_RANGE_INVALID: StatusCode = StatusCode(0x8036_0000);
    pub const BAD_NOT_SUPPORTED: StatusCode = StatusCode(0x803D_0000);
    pub const BAD_NOT_FOUND: StatusCode = StatusCode(0x803E_0000);
    pub const BAD_NOT_IMPLEMENTED: StatusCode = StatusCode(0x8040_0000);
    pub const BAD_SECURITY_MODE_REJECTED: StatusCode = StatusCode(0x8054_0000);
    pub const BAD_SECURITY_POLICY_REJECTED: StatusCode = StatusCode(0x8055_0000);
    pub const BAD_BROWSE_NAME_DUPLICATED: StatusCode = StatusCode(0x8061_0000);
    pub const BAD_TYPE_MISMATCH: StatusCode = StatusCode(0x8074_0000);
    pub const BAD_ARGUMENTS_MISSING: StatusCode = StatusCode(0x8076_0000);
    pub const BAD_CONFIGURATION_ERROR: StatusCode = StatusCode(0x8089_0000);
    pub const BAD_INVALID_ARGUMENT: StatusCode = StatusCode(0x80AB_0000);
    pub const BAD_CONNECTION_REJECTED: StatusCode = StatusCode(0x80AC_0000);
    pub const BAD_SHUTDOWN: StatusCode = StatusCode(0x80AD_0000);
    pub const BAD_CONNECTION_CLOSED: StatusCode = StatusCode(0x80AE_0000);
    pub const BAD_INVALID_STATE: StatusCode = StatusCode(0x80AF_0000);
    pub const BAD_TOO_MANY_ARGUMENTS: StatusCode = StatusCode(0x80E5_0000);
    pub const BAD_SECURITY_MODE_INSUFFICIENT: StatusCode = StatusCode(0x80E6_0000);

    /// True if the severity bits signal Good (or Uncertain).
    #[must_use]
    #[inline]
    pub fn is_good(self) -> bool {
        self.0 & 0x8000_0000 == 0
    }

    #[must_use]
    #[inline]
    pub fn is_bad(self) -> bool {
        !self.is_good()
    }

    /// Human-readable name of the code. Unknown codes yield "Unknown".
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::GOOD => "Good",
            Self::BAD_INTERNAL_ERROR => "BadInternalError",
            Self::BAD_OUT_OF_MEMORY => "BadOutOfMemory",
            Self::BAD_RESOURCE_UNAVAILABLE => "BadResourceUnavailable",
            Self::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            Self::BAD_ENCODING_ERROR => "BadEncodingError",
            Self::BAD_DECODING_ERROR => "BadDecodingError",
            Self::BAD_ENCODING_LIMITS_EXCEEDED => "BadEncodingLimitsExceeded",
            Self::BAD_TIMEOUT => "BadTimeout",
            Self::BAD_SECURITY_CHECKS_FAILED => "BadSecurityChecksFailed",
            Self::BAD_NO_COMMUNICATION => "BadNoCommunication",
            Self::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            Self::BAD_NODE_ID_EXISTS => "BadNodeIdExists",
            Self::BAD_ATTRIBUTE_ID_INVALID => "BadAttributeIdInvalid",
            Self::BAD_INDEX_RANGE_INVALID => "BadIndexRangeInvalid",
            Self::BAD_NOT_SUPPORTED => "BadNotSupported",
            Self::BAD_NOT_FOUND => "BadNotFound",
            Self::BAD_NOT_IMPLEMENTED => "BadNotImplemented",
            Self::BAD_SECURITY_MODE_REJECTED => "BadSecurityModeRejected",
            Self::BAD_SECURITY_POLICY_REJECTED => "BadSecurityPolicyRejected",
            Self::BAD_BROWSE_NAME_DUPLICATED => "BadBrowseNameDuplicated",
            Self::BAD_TYPE_MISMATCH => "BadTypeMismatch",
            Self::BAD_ARGUMENTS_MISSING => "BadArgumentsMissing",
            Self::BAD_CONFIGURATION_ERROR => "BadConfigurationError",
            Self::BAD_INVALID_ARGUMENT => "BadInvalidArgument",
            Self::BAD_CONNECTION_REJECTED => "BadConnectionRejected",
            Self::BAD_SHUTDOWN => "BadShutdown",
            Self::BAD_CONNECTION_CLOSED => "BadConnectionClosed",
            Self::BAD_INVALID_STATE => "BadInvalidState",
            Self::BAD_TOO_MANY_ARGUMENTS => "BadTooManyArguments",
            Self::BAD_SECURITY_MODE_INSUFFICIENT => "BadSecurityModeInsufficient",
            _ => "Unknown",
        }
    }

    /// Turn a status into a `Result`, treating any bad severity as `Err`.
    #[inline]
    pub fn into_result(self) -> Result<(), StatusCode> {
        if self.is_good() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08X})", self.name(), self.0)
    }
}

impl std::error::Error for StatusCode {}

impl From<std::io::Error> for StatusCode {
    fn from(_: std::io::Error) -> Self {
        StatusCode::BAD_COMMUNICATION_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity() {
        assert!(StatusCode::GOOD.is_good());
        assert!(StatusCode::BAD_TIMEOUT.is_bad());
        assert!(StatusCode::BAD_INTERNAL_ERROR.into_result().is_err());
        assert!(StatusCode::GOOD.into_result().is_ok());
    }

    #[test]
    fn test_names() {
        assert_eq!(StatusCode::BAD_BROWSE_NAME_DUPLICATED.name(), "BadBrowseNameDuplicated");
        assert_eq!(StatusCode(0xDEAD_BEEF).name(), "Unknown");
    }
}
