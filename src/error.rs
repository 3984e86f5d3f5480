use thiserror::Error;

use crate::core_ipc::ChannelClosed;

/// Fatal session errors. Validation failures are not errors; they are
/// reported to the client as negative reply lines and the session continues.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("control line exceeded {0} bytes without a terminator")]
    LineTooLong(usize),

    #[error("control socket closed unexpectedly")]
    UnexpectedEof,

    #[error("idle timeout expired")]
    IdleTimeout,

    #[error("data channel closed unexpectedly")]
    DataChannelClosed,

    /// An internal defect, not a protocol error: the state machine was asked
    /// to process input in a state that accepts none.
    #[error("state machine defect: command dispatched in terminated state")]
    StateMachineDefect,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ChannelClosed> for SessionError {
    fn from(_: ChannelClosed) -> Self {
        SessionError::DataChannelClosed
    }
}
