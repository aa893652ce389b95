use protocol::ErrorCode;

/// Framework-wide error type. Transport/codec failures compose in via
/// `#[from]`; application-visible failures map onto [`ErrorCode`] through
/// [`NodeError::error_code`] so a caught error can be turned straight into a
/// reply packet.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("request timed out")]
    RequestTimeout,

    #[error("no reachable node for id {0}")]
    ServerNotFound(String),

    #[error("stage {0} not found")]
    StageNotFound(i64),

    #[error("actor {0} not found")]
    ActorNotFound(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("session is not authenticated")]
    NotAuthenticated,

    #[error("session is already authenticated")]
    AlreadyAuthenticated,

    #[error("stage {0} already exists")]
    StageAlreadyExists(i64),

    #[error("stage creation failed: {0}")]
    StageCreationFailed(String),

    #[error("join stage failed: {0}")]
    JoinStageFailed(String),

    #[error("invalid message")]
    InvalidMessage,

    #[error("no handler registered for msgId {0:?}")]
    HandlerNotFound(String),

    #[error("invalid stage type {0:?}")]
    InvalidStageType(String),

    #[error("system error: {0}")]
    SystemError(String),

    #[error("accountId must be non-empty after authentication")]
    InvalidAccountId,

    #[error("stage rejected the join request")]
    JoinStageRejected,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("frame exceeds the maximum body size")]
    OversizedFrame,

    #[error("send queue is full")]
    SendQueueFull,

    #[error("backpressure limit exceeded")]
    BackpressureExceeded,

    #[error("stage is closed")]
    StageClosed,

    #[error("duplicate login for the same account")]
    DuplicateLogin,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("game loop is already running for this stage")]
    GameLoopAlreadyRunning,

    #[error("fixed timestep {0}ms is out of the allowed 1..=1000ms range")]
    ArgumentOutOfRange(u64),

    #[error("session has reached its maximum number of in-flight requests")]
    TooManyPendingRequests,
}

impl NodeError {
    /// Maps this error onto the wire-level taxonomy so it can be embedded
    /// in a reply packet's `errorCode` field.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::RequestTimeout | Self::Timeout => ErrorCode::RequestTimeout,
            Self::ServerNotFound(_) => ErrorCode::ServerNotFound,
            Self::StageNotFound(_) => ErrorCode::StageNotFound,
            Self::ActorNotFound(_) => ErrorCode::ActorNotFound,
            Self::AuthenticationFailed => ErrorCode::AuthenticationFailed,
            Self::NotAuthenticated => ErrorCode::NotAuthenticated,
            Self::AlreadyAuthenticated => ErrorCode::AlreadyAuthenticated,
            Self::StageAlreadyExists(_) => ErrorCode::StageAlreadyExists,
            Self::StageCreationFailed(_) => ErrorCode::StageCreationFailed,
            Self::JoinStageFailed(_) => ErrorCode::JoinStageFailed,
            Self::InvalidMessage | Self::Codec(_) | Self::ProtocolViolation(_) => {
                ErrorCode::InvalidMessage
            }
            Self::HandlerNotFound(_) => ErrorCode::HandlerNotFound,
            Self::InvalidStageType(_) => ErrorCode::InvalidStageType,
            Self::SystemError(_) | Self::Io(_) | Self::Config(_) | Self::TooManyPendingRequests => {
                ErrorCode::SystemError
            }
            Self::InvalidAccountId => ErrorCode::InvalidAccountId,
            Self::JoinStageRejected => ErrorCode::JoinStageRejected,
            _ => ErrorCode::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
