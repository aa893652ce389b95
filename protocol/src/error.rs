//! Framework error-code taxonomy carried on reply packets and route packets.
//!
//! `0` is success, `1..=999` is reserved for the framework (enumerated
//! below), and `>=1000` is free for application use.

/// A wire-level error code. Unknown reserved codes and the whole
/// application range round-trip through `Application(u16)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    RequestTimeout,
    ServerNotFound,
    StageNotFound,
    ActorNotFound,
    AuthenticationFailed,
    NotAuthenticated,
    AlreadyAuthenticated,
    StageAlreadyExists,
    StageCreationFailed,
    JoinStageFailed,
    InvalidMessage,
    HandlerNotFound,
    InvalidStageType,
    SystemError,
    InvalidAccountId,
    JoinStageRejected,
    InternalError,
    /// Any code outside the framework-reserved range, or an unrecognized
    /// reserved code (forward-compat).
    Application(u16),
}

impl ErrorCode {
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Success => 0,
            Self::RequestTimeout => 1,
            Self::ServerNotFound => 2,
            Self::StageNotFound => 3,
            Self::ActorNotFound => 4,
            Self::AuthenticationFailed => 5,
            Self::NotAuthenticated => 6,
            Self::AlreadyAuthenticated => 7,
            Self::StageAlreadyExists => 8,
            Self::StageCreationFailed => 9,
            Self::JoinStageFailed => 10,
            Self::InvalidMessage => 11,
            Self::HandlerNotFound => 12,
            Self::InvalidStageType => 13,
            Self::SystemError => 14,
            Self::InvalidAccountId => 16,
            Self::JoinStageRejected => 17,
            Self::InternalError => 99,
            Self::Application(code) => code,
        }
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        self.code() == 0
    }
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        value.code()
    }
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::RequestTimeout,
            2 => Self::ServerNotFound,
            3 => Self::StageNotFound,
            4 => Self::ActorNotFound,
            5 => Self::AuthenticationFailed,
            6 => Self::NotAuthenticated,
            7 => Self::AlreadyAuthenticated,
            8 => Self::StageAlreadyExists,
            9 => Self::StageCreationFailed,
            10 => Self::JoinStageFailed,
            11 => Self::InvalidMessage,
            12 => Self::HandlerNotFound,
            13 => Self::InvalidStageType,
            14 => Self::SystemError,
            16 => Self::InvalidAccountId,
            17 => Self::JoinStageRejected,
            99 => Self::InternalError,
            other => Self::Application(other),
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}({})", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u16() {
        for code in [
            ErrorCode::Success,
            ErrorCode::RequestTimeout,
            ErrorCode::JoinStageRejected,
            ErrorCode::InternalError,
        ] {
            assert_eq!(ErrorCode::from(code.code()), code);
        }
    }

    #[test]
    fn unknown_reserved_code_becomes_application() {
        assert_eq!(ErrorCode::from(500), ErrorCode::Application(500));
        assert_eq!(ErrorCode::from(1000), ErrorCode::Application(1000));
    }

    #[test]
    fn success_is_zero() {
        assert!(ErrorCode::Success.is_success());
        assert!(!ErrorCode::InternalError.is_success());
    }
}
