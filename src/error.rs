// SPDX-License-Identifier: Apache-2.0

use std::backtrace::Backtrace;
use std::fmt;

use thiserror::Error;

use crate::ids::{MessageId, ResponseId};

/// A user-facing, expected failure. Its message crosses the wire verbatim
/// and is re-raised on the sender side as the same kind of error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CleanError(pub String);

impl CleanError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// What a handler returns to signal failure: either an expected,
/// user-visible [`CleanError`] or any other ("runtime") error.
#[derive(Debug)]
pub enum HandlerError {
    Clean(CleanError),
    Runtime(RuntimeHandlerError),
}

#[derive(Debug)]
pub struct RuntimeHandlerError {
    pub message: String,
    pub backtrace: String,
}

impl HandlerError {
    pub fn clean(message: impl Into<String>) -> Self {
        Self::Clean(CleanError::new(message))
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(RuntimeHandlerError {
            message: message.into(),
            backtrace: Backtrace::force_capture().to_string(),
        })
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean(e) => write!(f, "{e}"),
            Self::Runtime(e) => write!(f, "{}", e.message),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Converts any ordinary error into a runtime [`HandlerError`] via
/// `.into_handler_error()?`. Deliberately not a blanket `From` impl:
/// a [`CleanError`] must be raised explicitly (`HandlerError::clean`)
/// rather than picked up implicitly by `?`, since it signals something
/// qualitatively different from an unexpected failure.
pub trait IntoHandlerError<T> {
    fn into_handler_error(self) -> Result<T, HandlerError>;
}

impl<T, E: fmt::Display> IntoHandlerError<T> for Result<T, E> {
    fn into_handler_error(self) -> Result<T, HandlerError> {
        self.map_err(|e| HandlerError::runtime(e.to_string()))
    }
}

/// Failures detected while constructing or decoding through a
/// [`crate::protocol::MessageProtocol`].
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("message id {0} must be non-negative")]
    NegativeMessageId(i32),

    #[error("response id {0} must be non-negative")]
    NegativeResponseId(i32),

    #[error("duplicate message id {0:?}")]
    DuplicateMessageId(MessageId),

    #[error("duplicate response id {0:?}")]
    DuplicateResponseId(ResponseId),

    #[error("rust type `{type_name}` is already registered under a different id")]
    DuplicateType { type_name: &'static str },

    #[error("message type `{message}` declares response id {response:?}, which is not registered")]
    UnknownResponseType {
        message: &'static str,
        response: ResponseId,
    },

    #[error("unregistered message id {0:?}")]
    UnregisteredMessageId(MessageId),

    #[error("unregistered response id {0:?}")]
    UnregisteredResponseId(ResponseId),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),
}

/// Failures detected while registering or validating a receiver's
/// handler table.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum HandlerRegistrationError {
    #[error("rust type `{0}` is not registered as a message in this protocol")]
    UnknownMessageType(&'static str),

    #[error("rust type `{0}` is not registered as a response in this protocol")]
    UnknownResponseType(&'static str),

    #[error("message id {0:?} already has a registered handler")]
    DuplicateHandler(MessageId),

    #[error(
        "handler for message id {message:?} declares response ids {declared:?}, \
         but the protocol expects {expected:?}"
    )]
    ResponseMismatch {
        message: MessageId,
        declared: Vec<ResponseId>,
        expected: Vec<ResponseId>,
    },

    #[error("receiver is missing a handler for message id {0:?}")]
    MissingHandler(MessageId),
}

/// Raised by `handle_raw_message[_async]` when `raise_unregistered` is
/// set and the incoming message id isn't known to this protocol.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unregistered message id {0:?}")]
pub struct UnregisteredMessageIdError(pub MessageId);

/// The sender-side union of "clean" vs "runtime" remote failures,
/// reconstructed from an error envelope's `kind` field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub message: String,
    pub trace: Option<String>,
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// What `MessageSender::send`/`send_async` returns on failure.
#[derive(Error, Debug)]
pub enum SendError<E> {
    #[error(transparent)]
    Clean(#[from] CleanError),

    #[error("remote error: {0}")]
    Remote(RemoteFailure),

    #[error("local transport error: {0}")]
    Transport(E),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
