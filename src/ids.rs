// SPDX-License-Identifier: Apache-2.0

//! Small typed identifiers for registered message and response types.
//!
//! These mirror the teacher's `MethodID`/`RequestID` newtypes: thin
//! wrappers around a primitive with the conversions a caller actually
//! needs, rather than bare `i32`s threaded everywhere.

use std::fmt;

/// Identifies a registered message type within a [`crate::protocol::MessageProtocol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i32);

/// Identifies a registered response type within a [`crate::protocol::MessageProtocol`].
///
/// `ResponseId(-1)` is reserved for [`crate::message::EmptyResponse`] and
/// is always implicitly registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResponseId(pub i32);

impl ResponseId {
    /// The id reserved for the empty response, implicit in every protocol.
    pub const EMPTY: ResponseId = ResponseId(-1);
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for MessageId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<i32> for ResponseId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}
