// SPDX-License-Identifier: Apache-2.0

//! The sender core: encode a typed message, hand it to the owner's
//! transport, decode the reply, and translate a remote failure back
//! into a local error.
//!
//! `MessageSender<Obj>` plays the role the teacher's generic
//! `Transport<C: Read + Write>` plays: a small struct generic over the
//! capability its owner provides, rather than over a concrete channel
//! type. There is no descriptor protocol in Rust, so the original's
//! "Bound" helper collapses into passing `&Obj` explicitly to `send`/
//! `send_async`, exactly as `BoundMessageSender.send` threads
//! `self._obj` into `self._sender.send(self._obj, message)`.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::SendError;
use crate::message::{Message, Response};
use crate::protocol::MessageProtocol;
use crate::transport::{AsyncTransport, BlockingTransport};

type EncodeFilter<Obj> = Box<dyn Fn(&Obj, &dyn Message, &mut Map<String, Value>) + Send + Sync>;
type DecodeFilter<Obj> = Box<dyn Fn(&Obj, &Map<String, Value>, &mut dyn Response) + Send + Sync>;

pub struct MessageSender<Obj> {
    protocol: Arc<MessageProtocol>,
    encode_filter: Option<EncodeFilter<Obj>>,
    decode_filter: Option<DecodeFilter<Obj>>,
}

impl<Obj> MessageSender<Obj> {
    pub fn new(protocol: Arc<MessageProtocol>) -> Self {
        Self {
            protocol,
            encode_filter: None,
            decode_filter: None,
        }
    }

    pub fn protocol(&self) -> &Arc<MessageProtocol> {
        &self.protocol
    }

    /// Registers the encode-side filter: runs just before an outgoing
    /// message is serialized, so it may stash sidecar data (via the
    /// message's [`crate::Extensions`]) into the envelope map.
    ///
    /// Filters never abort the send; a panicking filter unwinds like
    /// any other Rust panic rather than being converted into a
    /// [`SendError`] (spec.md §9, Open Question (b)).
    pub fn with_encode_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Obj, &dyn Message, &mut Map<String, Value>) + Send + Sync + 'static,
    {
        self.encode_filter = Some(Box::new(filter));
        self
    }

    /// Registers the decode-side filter: runs just after an incoming
    /// response is deserialized, so it may copy envelope-level sidecar
    /// fields back onto the response's [`crate::Extensions`].
    pub fn with_decode_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Obj, &Map<String, Value>, &mut dyn Response) + Send + Sync + 'static,
    {
        self.decode_filter = Some(Box::new(filter));
        self
    }

    fn build_request<M: Message>(
        &self,
        obj: &Obj,
        message: &M,
    ) -> Result<String, crate::error::ProtocolError> {
        let mut dict = self.protocol.message_to_dict(message)?;
        if let Some(filter) = &self.encode_filter {
            filter(obj, message, &mut dict);
        }
        Ok(self.protocol.encode_dict(&dict))
    }

    fn finish_response(
        &self,
        obj: &Obj,
        response_text: &str,
    ) -> Result<Box<dyn Response>, ErrorOrDrift> {
        let dict = self.protocol.decode_dict(response_text).map_err(ErrorOrDrift::Protocol)?;
        if self.protocol.is_error(&dict) {
            let envelope = self.protocol.error_from_dict(&dict);
            return Err(if envelope.kind == "clean" {
                ErrorOrDrift::Clean(envelope.message)
            } else {
                ErrorOrDrift::Remote(envelope.into_remote_failure())
            });
        }
        let mut response = self.protocol.response_from_dict(&dict).map_err(ErrorOrDrift::Protocol)?;
        if let Some(filter) = &self.decode_filter {
            filter(obj, &dict, response.as_mut());
        }
        Ok(response)
    }
}

/// Internal classification of a decoded reply, before being lifted
/// into `SendError<E>` (which additionally carries the transport's own
/// error type `E`).
enum ErrorOrDrift {
    Clean(String),
    Remote(crate::error::RemoteFailure),
    Protocol(crate::error::ProtocolError),
}

impl<E> From<ErrorOrDrift> for SendError<E> {
    fn from(value: ErrorOrDrift) -> Self {
        match value {
            ErrorOrDrift::Clean(message) => SendError::Clean(crate::error::CleanError::new(message)),
            ErrorOrDrift::Remote(failure) => SendError::Remote(failure),
            ErrorOrDrift::Protocol(err) => SendError::Protocol(err),
        }
    }
}

impl<Obj: BlockingTransport> MessageSender<Obj> {
    /// Sends `message` and blocks for the reply.
    pub fn send<M: Message>(&self, obj: &Obj, message: M) -> Result<Box<dyn Response>, SendError<Obj::Error>> {
        let request_text = self.build_request(obj, &message)?;
        let response_text = obj.send_raw_message(request_text).map_err(SendError::Transport)?;
        self.finish_response(obj, &response_text).map_err(SendError::from)
    }
}

impl<Obj: AsyncTransport + Sync> MessageSender<Obj> {
    /// Sends `message`; the transport call is the only suspension point.
    pub async fn send_async<M: Message>(
        &self,
        obj: &Obj,
        message: M,
    ) -> Result<Box<dyn Response>, SendError<Obj::Error>> {
        let request_text = self.build_request(obj, &message)?;
        let response_text = obj
            .send_raw_message(request_text)
            .await
            .map_err(SendError::Transport)?;
        self.finish_response(obj, &response_text).map_err(SendError::from)
    }
}
