// SPDX-License-Identifier: Apache-2.0

//! Transport collaborator interfaces.
//!
//! Shaped directly after the teacher's `simple::ClientTransport`/
//! `ServerTransport` traits: one associated `Error`, one operation. The
//! core never touches sockets; the owner type (whatever holds a
//! [`crate::sender::MessageSender`] or [`crate::receiver::MessageReceiver`]
//! as a field) implements these to move an encoded string across
//! whatever channel it likes.

use async_trait::async_trait;

/// Moves an encoded request/response string to the other end and
/// blocks for the reply, synchronously.
pub trait BlockingTransport {
    type Error: std::error::Error + Send + Sync + 'static;

    fn send_raw_message(&self, message: String) -> Result<String, Self::Error>;
}

/// The suspending counterpart of [`BlockingTransport`]. The `.await`
/// here is the only suspension point on the sender side (spec.md §5).
#[async_trait]
pub trait AsyncTransport {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn send_raw_message(&self, message: String) -> Result<String, Self::Error>;
}
