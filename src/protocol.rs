// SPDX-License-Identifier: Apache-2.0

//! The protocol registry: the bijection between small integer ids and
//! message/response types, plus the envelope (de)serialization that
//! sits on top of it.
//!
//! Shaped after the teacher's `proto/v0.rs` `RPCMsg` wrapping: a tag
//! plus a payload, with conversions at the boundary — reworked from
//! CBOR-tag framing to the spec's `{"t": <id>, "m": <payload>}` JSON map.

use std::any::TypeId;
use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::{ProtocolError, RemoteFailure};
use crate::ids::{MessageId, ResponseId};
use crate::message::{EmptyResponse, Message, Response};

type DecodeMessageFn = Box<dyn Fn(Value) -> Result<Box<dyn Message>, ProtocolError> + Send + Sync>;
type DecodeResponseFn = Box<dyn Fn(Value) -> Result<Box<dyn Response>, ProtocolError> + Send + Sync>;

struct MessageEntry {
    type_id: TypeId,
    type_name: &'static str,
    response_ids: Vec<ResponseId>,
    decode: DecodeMessageFn,
}

struct ResponseEntry {
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeResponseFn,
}

/// An immutable, shareable registry of message and response types.
///
/// Construct one with [`MessageProtocolBuilder`]. Once built, a
/// protocol is typically wrapped in `Arc` and handed to any number of
/// [`crate::sender::MessageSender`]/[`crate::receiver::MessageReceiver`]
/// values.
pub struct MessageProtocol {
    messages: HashMap<MessageId, MessageEntry>,
    responses: HashMap<ResponseId, ResponseEntry>,
    message_type_ids: HashMap<TypeId, MessageId>,
    response_type_ids: HashMap<TypeId, ResponseId>,
    pub trusted_sender: bool,
    pub log_remote_exceptions: bool,
}

impl MessageProtocol {
    /// Encodes a full envelope map to its wire string.
    pub fn encode_dict(&self, map: &Map<String, Value>) -> String {
        serde_json::to_string(map).expect("a Map<String, Value> always serializes")
    }

    /// Parses a wire string back into an envelope map.
    pub fn decode_dict(&self, text: &str) -> Result<Map<String, Value>, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(ProtocolError::MalformedEnvelope(
                "envelope is not a JSON object".to_string(),
            )),
        }
    }

    /// Looks up the registered id for a message type known at the call site.
    pub fn message_id_of<M: Message>(&self) -> Result<MessageId, ProtocolError> {
        self.message_type_ids
            .get(&TypeId::of::<M>())
            .copied()
            .ok_or(ProtocolError::Decode(format!(
                "rust type `{}` is not registered as a message in this protocol",
                std::any::type_name::<M>()
            )))
    }

    /// Looks up the registered id for a response type known at the call site.
    pub fn response_id_of<R: Response>(&self) -> Result<ResponseId, ProtocolError> {
        self.response_type_ids
            .get(&TypeId::of::<R>())
            .copied()
            .ok_or(ProtocolError::Decode(format!(
                "rust type `{}` is not registered as a response in this protocol",
                std::any::type_name::<R>()
            )))
    }

    /// Builds the `{"t", "m"}` map for an outgoing message.
    pub fn message_to_dict<M: Message>(&self, message: &M) -> Result<Map<String, Value>, ProtocolError> {
        let id = self.message_id_of::<M>()?;
        let payload = serde_json::to_value(message).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        let mut map = Map::new();
        map.insert("t".to_string(), Value::from(id.0));
        map.insert("m".to_string(), payload);
        Ok(map)
    }

    /// Builds the `{"t", "m"}` map for an outgoing response.
    pub fn response_to_dict<R: Response>(&self, response: &R) -> Result<Map<String, Value>, ProtocolError> {
        let id = self.response_id_of::<R>()?;
        let payload = serde_json::to_value(response).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        let mut map = Map::new();
        map.insert("t".to_string(), Value::from(id.0));
        map.insert("m".to_string(), payload);
        Ok(map)
    }

    /// Looks up the registered id for a type-erased response, for callers
    /// (the receiver's dispatch path) that only learn the concrete
    /// response type at handler-registration time, not at the call site.
    pub fn response_id_of_erased(&self, response: &dyn Response) -> Result<ResponseId, ProtocolError> {
        use std::any::Any;
        self.response_type_ids
            .get(&Any::type_id(response.as_any()))
            .copied()
            .ok_or_else(|| {
                ProtocolError::Encode("response type is not registered in this protocol".to_string())
            })
    }

    /// Builds the `{"t", "m"}` map for a type-erased outgoing response.
    pub fn response_dict_from_erased(&self, response: &dyn Response) -> Result<Map<String, Value>, ProtocolError> {
        let id = self.response_id_of_erased(response)?;
        let mut map = Map::new();
        map.insert("t".to_string(), Value::from(id.0));
        map.insert("m".to_string(), response.to_value());
        Ok(map)
    }

    /// Returns the message id carried by an incoming envelope's `"t"` field.
    pub fn message_id_in(&self, map: &Map<String, Value>) -> Result<MessageId, ProtocolError> {
        match map.get("t") {
            Some(Value::Number(n)) => n
                .as_i64()
                .map(|v| MessageId(v as i32))
                .ok_or_else(|| ProtocolError::MalformedEnvelope("\"t\" is not an integer".to_string())),
            _ => Err(ProtocolError::MalformedEnvelope(
                "envelope is missing an integer \"t\" field".to_string(),
            )),
        }
    }

    /// Decodes an incoming message envelope to a type-erased [`Message`].
    pub fn message_from_dict(&self, map: &Map<String, Value>) -> Result<Box<dyn Message>, ProtocolError> {
        let id = self.message_id_in(map)?;
        let entry = self
            .messages
            .get(&id)
            .ok_or(ProtocolError::UnregisteredMessageId(id))?;
        let payload = map.get("m").cloned().unwrap_or(Value::Null);
        (entry.decode)(payload)
    }

    /// Decodes an incoming response envelope to a type-erased [`Response`].
    pub fn response_from_dict(&self, map: &Map<String, Value>) -> Result<Box<dyn Response>, ProtocolError> {
        let id = match map.get("t") {
            Some(Value::Number(n)) => n
                .as_i64()
                .map(|v| ResponseId(v as i32))
                .ok_or_else(|| ProtocolError::MalformedEnvelope("\"t\" is not an integer".to_string()))?,
            _ => {
                return Err(ProtocolError::MalformedEnvelope(
                    "envelope is missing an integer \"t\" field".to_string(),
                ))
            }
        };
        let entry = self
            .responses
            .get(&id)
            .ok_or(ProtocolError::UnregisteredResponseId(id))?;
        let payload = map.get("m").cloned().unwrap_or(Value::Null);
        (entry.decode)(payload)
    }

    /// The response ids a registered message type may produce.
    pub fn response_set(&self, message: MessageId) -> Option<&[ResponseId]> {
        self.messages.get(&message).map(|e| e.response_ids.as_slice())
    }

    /// Whether a message id is part of this protocol.
    pub fn has_message(&self, message: MessageId) -> bool {
        self.messages.contains_key(&message)
    }

    /// All registered message ids, ascending (used by the shim generator
    /// and by `MessageReceiver::validate`).
    pub fn message_ids(&self) -> Vec<MessageId> {
        let mut ids: Vec<MessageId> = self.messages.keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn message_type_name(&self, id: MessageId) -> Option<&'static str> {
        self.messages.get(&id).map(|e| e.type_name)
    }

    /// The declared response ids for a message, alongside each one's
    /// rust type name, for the shim generator.
    pub(crate) fn response_type_name(&self, id: ResponseId) -> Option<&'static str> {
        self.responses.get(&id).map(|e| e.type_name)
    }

    /// Encodes a handler failure as an error envelope (spec.md §4.1's
    /// `error_to_dict`): `{"t": "_error", "kind", "message", ["trace"]}`.
    pub fn error_to_dict(&self, kind: &str, message: &str, trace: Option<&str>) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("t".to_string(), Value::from("_error"));
        map.insert("kind".to_string(), Value::from(kind));
        map.insert("message".to_string(), Value::from(message));
        if self.trusted_sender {
            if let Some(trace) = trace {
                map.insert("trace".to_string(), Value::from(trace));
            }
        }
        map
    }

    /// Reconstructs the sender-side failure from an error envelope.
    /// Clean errors keep their message verbatim; anything else becomes a
    /// [`RemoteFailure`].
    pub fn error_from_dict(&self, map: &Map<String, Value>) -> ErrorEnvelope {
        let kind = map.get("kind").and_then(Value::as_str).unwrap_or("runtime").to_string();
        let message = map.get("message").and_then(Value::as_str).unwrap_or_default().to_string();
        let trace = map.get("trace").and_then(Value::as_str).map(str::to_string);
        ErrorEnvelope { kind, message, trace }
    }

    /// Whether an envelope map is the reserved error envelope.
    pub fn is_error(&self, map: &Map<String, Value>) -> bool {
        matches!(map.get("t"), Some(Value::String(s)) if s == "_error")
    }
}

/// The parsed contents of an error envelope, before it's classified into
/// [`crate::error::CleanError`] vs [`RemoteFailure`].
pub struct ErrorEnvelope {
    pub kind: String,
    pub message: String,
    pub trace: Option<String>,
}

impl ErrorEnvelope {
    pub fn into_remote_failure(self) -> RemoteFailure {
        RemoteFailure {
            message: self.message,
            trace: self.trace,
        }
    }
}

/// Builds a [`MessageProtocol`], validating well-formedness (spec.md
/// §4.1, invariant in spec.md §3) at [`Self::build`].
#[derive(Default)]
pub struct MessageProtocolBuilder {
    messages: HashMap<MessageId, MessageEntry>,
    responses: HashMap<ResponseId, ResponseEntry>,
    message_type_ids: HashMap<TypeId, MessageId>,
    response_type_ids: HashMap<TypeId, ResponseId>,
    trusted_sender: bool,
    log_remote_exceptions: bool,
}

impl MessageProtocolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trusted_sender(mut self, value: bool) -> Self {
        self.trusted_sender = value;
        self
    }

    pub fn log_remote_exceptions(mut self, value: bool) -> Self {
        self.log_remote_exceptions = value;
        self
    }

    /// Registers a message type under `id`.
    pub fn message<M: Message>(mut self, id: i32) -> Result<Self, ProtocolError> {
        if id < 0 {
            return Err(ProtocolError::NegativeMessageId(id));
        }
        let message_id = MessageId(id);
        if self.messages.contains_key(&message_id) {
            return Err(ProtocolError::DuplicateMessageId(message_id));
        }
        let type_id = TypeId::of::<M>();
        if self.message_type_ids.contains_key(&type_id) {
            return Err(ProtocolError::DuplicateType {
                type_name: std::any::type_name::<M>(),
            });
        }
        let decode: DecodeMessageFn = Box::new(|payload: Value| {
            let message: M =
                serde_json::from_value(payload).map_err(|e| ProtocolError::Decode(e.to_string()))?;
            Ok(Box::new(message) as Box<dyn Message>)
        });
        self.messages.insert(
            message_id,
            MessageEntry {
                type_id,
                type_name: std::any::type_name::<M>(),
                response_ids: M::response_ids().to_vec(),
                decode,
            },
        );
        self.message_type_ids.insert(type_id, message_id);
        Ok(self)
    }

    /// Registers a response type under `id`.
    pub fn response<R: Response>(mut self, id: i32) -> Result<Self, ProtocolError> {
        if id < 0 {
            return Err(ProtocolError::NegativeResponseId(id));
        }
        self.insert_response::<R>(ResponseId(id))?;
        Ok(self)
    }

    fn insert_response<R: Response>(&mut self, response_id: ResponseId) -> Result<(), ProtocolError> {
        if self.responses.contains_key(&response_id) {
            return Err(ProtocolError::DuplicateResponseId(response_id));
        }
        let type_id = TypeId::of::<R>();
        if self.response_type_ids.contains_key(&type_id) {
            return Err(ProtocolError::DuplicateType {
                type_name: std::any::type_name::<R>(),
            });
        }
        let decode: DecodeResponseFn = Box::new(|payload: Value| {
            let response: R =
                serde_json::from_value(payload).map_err(|e| ProtocolError::Decode(e.to_string()))?;
            Ok(Box::new(response) as Box<dyn Response>)
        });
        self.responses.insert(
            response_id,
            ResponseEntry {
                type_id,
                type_name: std::any::type_name::<R>(),
                decode,
            },
        );
        self.response_type_ids.insert(type_id, response_id);
        Ok(())
    }

    /// Validates well-formedness and produces the immutable protocol.
    ///
    /// Implements spec.md §4.1's four construction steps: the empty
    /// response is reserved at [`ResponseId::EMPTY`] automatically, and
    /// every message's declared response ids must resolve to either
    /// the empty response or a registered response type.
    pub fn build(mut self) -> Result<MessageProtocol, ProtocolError> {
        if !self.response_type_ids.contains_key(&TypeId::of::<EmptyResponse>()) {
            self.insert_response::<EmptyResponse>(ResponseId::EMPTY)?;
        }

        for entry in self.messages.values() {
            for response_id in &entry.response_ids {
                if *response_id != ResponseId::EMPTY && !self.responses.contains_key(response_id) {
                    return Err(ProtocolError::UnknownResponseType {
                        message: entry.type_name,
                        response: *response_id,
                    });
                }
            }
        }

        Ok(MessageProtocol {
            messages: self.messages,
            responses: self.responses,
            message_type_ids: self.message_type_ids,
            response_type_ids: self.response_type_ids,
            trusted_sender: self.trusted_sender,
            log_remote_exceptions: self.log_remote_exceptions,
        })
    }
}
