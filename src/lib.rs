// SPDX-License-Identifier: Apache-2.0

//! protomsg is a typed message-passing runtime: a registry binding small
//! integer ids to message/response types, a JSON envelope codec built on
//! top of it, and sender/receiver halves that dispatch a request to a
//! typed handler and carry a failure back across the wire as faithfully
//! as a success.
//!
//! It favors a textual, self-describing envelope over a binary one so
//! the wire form stays debuggable with nothing more than a text editor,
//! and it's deliberately agnostic about what actually moves the bytes:
//! implement [`transport::BlockingTransport`] or [`transport::AsyncTransport`]
//! for whatever channel you have, and a [`sender::MessageSender`] or
//! [`receiver::MessageReceiver`] will drive it.
//!
//! Concrete message and response types are ordinary structs; implement
//! [`Message`] or [`Response`] for them with [`impl_message!`]/
//! [`impl_response!`] rather than by hand.

pub mod error;
pub mod extensions;
pub mod ids;
pub mod message;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod shim;
pub mod transport;

pub use extensions::Extensions;
pub use ids::{MessageId, ResponseId};
pub use message::{EmptyResponse, Message, Response};
pub use protocol::{MessageProtocol, MessageProtocolBuilder};
pub use receiver::MessageReceiver;
pub use sender::MessageSender;

/// Re-exports used by [`impl_message!`]/[`impl_response!`] so a crate
/// using those macros doesn't need its own direct `serde_json` dependency.
#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
