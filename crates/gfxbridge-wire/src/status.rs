/// The legacy interface's own status vocabulary.
///
/// Every proxy method resolves to one of these values — the embedding
/// application was written against this contract and must never see a
/// bridge-internal error type. The numeric values are part of the external
/// binary contract and cross the wire verbatim in response payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyStatus(pub i32);

impl LegacyStatus {
    /// The call succeeded.
    pub const OK: LegacyStatus = LegacyStatus(0);
    /// Arguments violated the legacy contract.
    pub const INVALID_CALL: LegacyStatus = LegacyStatus(-1);
    /// The device (here: the bridge session) is gone. The most
    /// conservative mapping for "unknown outcome" conditions.
    pub const DEVICE_LOST: LegacyStatus = LegacyStatus(-2);
    /// The requested operation or format is not supported.
    pub const NOT_AVAILABLE: LegacyStatus = LegacyStatus(-3);
    /// A resource allocation failed.
    pub const OUT_OF_MEMORY: LegacyStatus = LegacyStatus(-4);

    pub fn is_ok(self) -> bool {
        self == LegacyStatus::OK
    }

    /// Wire representation (response payload status field).
    pub fn code(self) -> i32 {
        self.0
    }

    pub fn from_code(code: i32) -> LegacyStatus {
        LegacyStatus(code)
    }

    pub fn name(self) -> &'static str {
        match self {
            LegacyStatus::OK => "OK",
            LegacyStatus::INVALID_CALL => "INVALID_CALL",
            LegacyStatus::DEVICE_LOST => "DEVICE_LOST",
            LegacyStatus::NOT_AVAILABLE => "NOT_AVAILABLE",
            LegacyStatus::OUT_OF_MEMORY => "OUT_OF_MEMORY",
            _ => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for LegacyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

/// Result alias for proxy-boundary operations that return a value or a
/// legacy status code.
pub type LegacyResult<T> = std::result::Result<T, LegacyStatus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            LegacyStatus::OK,
            LegacyStatus::INVALID_CALL,
            LegacyStatus::DEVICE_LOST,
            LegacyStatus::NOT_AVAILABLE,
            LegacyStatus::OUT_OF_MEMORY,
        ] {
            assert_eq!(LegacyStatus::from_code(status.code()), status);
        }
    }

    #[test]
    fn only_ok_is_ok() {
        assert!(LegacyStatus::OK.is_ok());
        assert!(!LegacyStatus::DEVICE_LOST.is_ok());
        assert_eq!(LegacyStatus::DEVICE_LOST.to_string(), "DEVICE_LOST (-2)");
    }
}
