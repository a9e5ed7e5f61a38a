// SPDX-License-Identifier: Apache-2.0

//! The receiver core: decode an incoming envelope, dispatch it to a
//! registered handler, and encode whatever the handler returns (or
//! fails with) back into wire text.
//!
//! `MessageReceiver<Obj>` is `MessageSender<Obj>`'s mirror image: it
//! owns a handler table keyed by [`MessageId`] instead of a transport,
//! and its filters run on the opposite ends of the pipe (decode on the
//! way in, encode on the way out).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{HandlerError, HandlerRegistrationError, UnregisteredMessageIdError};
use crate::ids::MessageId;
use crate::message::{Message, Response};
use crate::protocol::MessageProtocol;

type HandlerFn<Obj> =
    Box<dyn Fn(&Obj, Box<dyn Message>) -> Result<Box<dyn Response>, HandlerError> + Send + Sync>;

type AsyncHandlerFn<Obj> = Box<
    dyn for<'a> Fn(
            &'a Obj,
            Box<dyn Message>,
        ) -> Pin<Box<dyn Future<Output = Result<Box<dyn Response>, HandlerError>> + Send + 'a>>
        + Send
        + Sync,
>;

enum HandlerKind<Obj> {
    Sync(HandlerFn<Obj>),
    Async(AsyncHandlerFn<Obj>),
}

struct HandlerEntry<Obj> {
    kind: HandlerKind<Obj>,
}

enum DecodeFailure {
    Malformed(String),
    Unregistered(MessageId),
}

type EncodeFilter<Obj> = Box<dyn Fn(&Obj, &dyn Response, &mut Map<String, Value>) + Send + Sync>;
type DecodeFilter<Obj> = Box<dyn Fn(&Obj, &Map<String, Value>, &mut dyn Message) + Send + Sync>;

pub struct MessageReceiver<Obj> {
    protocol: Arc<MessageProtocol>,
    handlers: HashMap<MessageId, HandlerEntry<Obj>>,
    raise_unregistered: bool,
    encode_filter: Option<EncodeFilter<Obj>>,
    decode_filter: Option<DecodeFilter<Obj>>,
}

impl<Obj> MessageReceiver<Obj> {
    pub fn new(protocol: Arc<MessageProtocol>) -> Self {
        Self {
            protocol,
            handlers: HashMap::new(),
            raise_unregistered: false,
            encode_filter: None,
            decode_filter: None,
        }
    }

    pub fn protocol(&self) -> &Arc<MessageProtocol> {
        &self.protocol
    }

    /// When set, an incoming message id the protocol doesn't recognize
    /// is raised to the caller as an [`UnregisteredMessageIdError`]
    /// instead of being turned into a graceful error envelope sent back
    /// over the wire. Off by default: a receiver that's a protocol
    /// version behind a sender should still answer, not hang up.
    pub fn with_raise_unregistered(mut self, value: bool) -> Self {
        self.raise_unregistered = value;
        self
    }

    pub fn with_encode_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Obj, &dyn Response, &mut Map<String, Value>) + Send + Sync + 'static,
    {
        self.encode_filter = Some(Box::new(filter));
        self
    }

    pub fn with_decode_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Obj, &Map<String, Value>, &mut dyn Message) + Send + Sync + 'static,
    {
        self.decode_filter = Some(Box::new(filter));
        self
    }

    /// Registers a blocking handler for `M`, declaring that it returns `R`.
    ///
    /// Fails if `M` or `R` aren't part of the underlying protocol, if
    /// `M` already has a handler, or if `M`'s declared response set
    /// (spec.md §3) isn't exactly `{R}`. A message that may legally
    /// produce more than one response type can't be covered by a
    /// single concrete `R`; register it with
    /// [`Self::register_handler_boxed`] instead.
    pub fn register_handler<M, R, F>(&mut self, handler: F) -> Result<(), HandlerRegistrationError>
    where
        M: Message,
        R: Response,
        F: Fn(&Obj, M) -> Result<R, HandlerError> + Send + Sync + 'static,
    {
        let message_id = self.check_registration::<M, R>()?;
        let wrapped: HandlerFn<Obj> = Box::new(move |obj: &Obj, message: Box<dyn Message>| {
            let message = *message
                .into_any()
                .downcast::<M>()
                .expect("dispatch only calls a handler with its own registered message type");
            let response = handler(obj, message)?;
            Ok(Box::new(response) as Box<dyn Response>)
        });
        self.handlers.insert(
            message_id,
            HandlerEntry {
                kind: HandlerKind::Sync(wrapped),
            },
        );
        Ok(())
    }

    /// The suspending counterpart of [`Self::register_handler`].
    pub fn register_async_handler<M, R, F, Fut>(&mut self, handler: F) -> Result<(), HandlerRegistrationError>
    where
        M: Message,
        R: Response,
        F: Fn(&Obj, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let message_id = self.check_registration::<M, R>()?;
        let wrapped: AsyncHandlerFn<Obj> = Box::new(move |obj: &Obj, message: Box<dyn Message>| {
            let message = *message
                .into_any()
                .downcast::<M>()
                .expect("dispatch only calls a handler with its own registered message type");
            let fut = handler(obj, message);
            Box::pin(async move {
                let response = fut.await?;
                Ok(Box::new(response) as Box<dyn Response>)
            })
        });
        self.handlers.insert(
            message_id,
            HandlerEntry {
                kind: HandlerKind::Async(wrapped),
            },
        );
        Ok(())
    }

    /// Registers a blocking handler for a message that may legally
    /// produce more than one response type, returning whichever one
    /// applies at call time as a `Box<dyn Response>`.
    ///
    /// `declared_responses` must name exactly the same set (order
    /// doesn't matter) as `M`'s declared response ids; this is the
    /// boxed counterpart of [`Self::register_handler`]'s exact-set
    /// check for handlers that can't commit to a single concrete `R`.
    pub fn register_handler_boxed<M, F>(
        &mut self,
        declared_responses: &[crate::ids::ResponseId],
        handler: F,
    ) -> Result<(), HandlerRegistrationError>
    where
        M: Message,
        F: Fn(&Obj, M) -> Result<Box<dyn Response>, HandlerError> + Send + Sync + 'static,
    {
        let message_id = self.check_registration_boxed::<M>(declared_responses)?;
        let wrapped: HandlerFn<Obj> = Box::new(move |obj: &Obj, message: Box<dyn Message>| {
            let message = *message
                .into_any()
                .downcast::<M>()
                .expect("dispatch only calls a handler with its own registered message type");
            handler(obj, message)
        });
        self.handlers.insert(
            message_id,
            HandlerEntry {
                kind: HandlerKind::Sync(wrapped),
            },
        );
        Ok(())
    }

    /// The suspending counterpart of [`Self::register_handler_boxed`].
    pub fn register_async_handler_boxed<M, F, Fut>(
        &mut self,
        declared_responses: &[crate::ids::ResponseId],
        handler: F,
    ) -> Result<(), HandlerRegistrationError>
    where
        M: Message,
        F: Fn(&Obj, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Box<dyn Response>, HandlerError>> + Send + 'static,
    {
        let message_id = self.check_registration_boxed::<M>(declared_responses)?;
        let wrapped: AsyncHandlerFn<Obj> = Box::new(move |obj: &Obj, message: Box<dyn Message>| {
            let message = *message
                .into_any()
                .downcast::<M>()
                .expect("dispatch only calls a handler with its own registered message type");
            Box::pin(handler(obj, message))
        });
        self.handlers.insert(
            message_id,
            HandlerEntry {
                kind: HandlerKind::Async(wrapped),
            },
        );
        Ok(())
    }

    /// Checks `M`/duplicate-handler preconditions and that `R`'s id is
    /// exactly `M`'s declared response set (a one-element set).
    fn check_registration<M: Message, R: Response>(&self) -> Result<MessageId, HandlerRegistrationError> {
        let message_id = self.check_message_and_duplicate::<M>()?;
        let response_id = self
            .protocol
            .response_id_of::<R>()
            .map_err(|_| HandlerRegistrationError::UnknownResponseType(std::any::type_name::<R>()))?;
        let expected = self
            .protocol
            .response_set(message_id)
            .expect("message_id_of only returns ids the protocol actually registered")
            .to_vec();
        if expected.len() != 1 || expected[0] != response_id {
            return Err(HandlerRegistrationError::ResponseMismatch {
                message: message_id,
                declared: vec![response_id],
                expected,
            });
        }
        Ok(message_id)
    }

    /// Checks `M`/duplicate-handler preconditions and that
    /// `declared_responses`, as a set, is exactly `M`'s declared
    /// response set.
    fn check_registration_boxed<M: Message>(
        &self,
        declared_responses: &[crate::ids::ResponseId],
    ) -> Result<MessageId, HandlerRegistrationError> {
        let message_id = self.check_message_and_duplicate::<M>()?;
        let expected = self
            .protocol
            .response_set(message_id)
            .expect("message_id_of only returns ids the protocol actually registered")
            .to_vec();
        let mut declared = declared_responses.to_vec();
        declared.sort();
        let mut expected_sorted = expected.clone();
        expected_sorted.sort();
        if declared != expected_sorted {
            return Err(HandlerRegistrationError::ResponseMismatch {
                message: message_id,
                declared,
                expected,
            });
        }
        Ok(message_id)
    }

    fn check_message_and_duplicate<M: Message>(&self) -> Result<MessageId, HandlerRegistrationError> {
        let message_id = self
            .protocol
            .message_id_of::<M>()
            .map_err(|_| HandlerRegistrationError::UnknownMessageType(std::any::type_name::<M>()))?;
        if self.handlers.contains_key(&message_id) {
            return Err(HandlerRegistrationError::DuplicateHandler(message_id));
        }
        Ok(message_id)
    }

    /// Confirms every message id the protocol knows about has a
    /// registered handler. Idempotent; cheap enough to call after every
    /// registration during startup, or once before serving traffic.
    pub fn validate(&self) -> Result<(), HandlerRegistrationError> {
        for id in self.protocol.message_ids() {
            if !self.handlers.contains_key(&id) {
                return Err(HandlerRegistrationError::MissingHandler(id));
            }
        }
        Ok(())
    }

    fn decode_incoming(&self, request_text: &str) -> Result<(MessageId, Box<dyn Message>, Map<String, Value>), DecodeFailure> {
        let dict = self
            .protocol
            .decode_dict(request_text)
            .map_err(|e| DecodeFailure::Malformed(e.to_string()))?;
        let message_id = self
            .protocol
            .message_id_in(&dict)
            .map_err(|e| DecodeFailure::Malformed(e.to_string()))?;
        if !self.protocol.has_message(message_id) {
            return Err(DecodeFailure::Unregistered(message_id));
        }
        let message = self
            .protocol
            .message_from_dict(&dict)
            .map_err(|e| DecodeFailure::Malformed(e.to_string()))?;
        Ok((message_id, message, dict))
    }

    /// Shared policy for an id the protocol doesn't know (decode time)
    /// or that the protocol knows but no handler was ever registered
    /// for (dispatch time): raise to the caller if `raise_unregistered`
    /// is set, otherwise answer with a graceful error envelope so a
    /// sender running a newer protocol version doesn't just hang.
    fn unregistered(&self, message_id: MessageId) -> Result<String, UnregisteredMessageIdError> {
        if self.raise_unregistered {
            return Err(UnregisteredMessageIdError(message_id));
        }
        Ok(self.error_response(&HandlerError::runtime(format!(
            "unregistered message id {message_id:?}"
        ))))
    }

    fn finish(&self, obj: &Obj, result: Result<Box<dyn Response>, HandlerError>) -> String {
        match result {
            Ok(response) => self.success_response(obj, response.as_ref()),
            Err(err) => self.error_response(&err),
        }
    }

    fn success_response(&self, obj: &Obj, response: &dyn Response) -> String {
        let mut dict = match self.protocol.response_dict_from_erased(response) {
            Ok(dict) => dict,
            Err(err) => return self.error_response(&HandlerError::runtime(err.to_string())),
        };
        if let Some(filter) = &self.encode_filter {
            filter(obj, response, &mut dict);
        }
        self.protocol.encode_dict(&dict)
    }

    fn error_response(&self, err: &HandlerError) -> String {
        let (kind, message, trace) = match err {
            HandlerError::Clean(e) => ("clean", e.0.clone(), None),
            HandlerError::Runtime(e) => {
                if self.protocol.log_remote_exceptions {
                    log::error!("unhandled error in message handler: {}\n{}", e.message, e.backtrace);
                }
                ("runtime", e.message.clone(), Some(e.backtrace.clone()))
            }
        };
        let dict = self.protocol.error_to_dict(kind, &message, trace.as_deref());
        self.protocol.encode_dict(&dict)
    }

    /// Decodes, dispatches, and encodes a reply, blocking.
    ///
    /// A handler registered via [`Self::register_async_handler`] cannot
    /// be driven here; it turns into a runtime error envelope naming
    /// [`Self::handle_raw_message_async`] instead.
    pub fn handle_raw_message(&self, obj: &Obj, request_text: &str) -> Result<String, UnregisteredMessageIdError> {
        let (message_id, message, dict) = match self.decode_incoming(request_text) {
            Ok(parts) => parts,
            Err(DecodeFailure::Malformed(message)) => return Ok(self.error_response(&HandlerError::runtime(message))),
            Err(DecodeFailure::Unregistered(id)) => return self.unregistered(id),
        };

        let Some(entry) = self.handlers.get(&message_id) else {
            return self.unregistered(message_id);
        };

        let mut message = message;
        if let Some(filter) = &self.decode_filter {
            filter(obj, &dict, message.as_mut());
        }

        let result = match &entry.kind {
            HandlerKind::Sync(handler) => handler(obj, message),
            HandlerKind::Async(_) => Err(HandlerError::runtime(format!(
                "handler for message id {message_id:?} is async-only; call handle_raw_message_async"
            ))),
        };

        Ok(self.finish(obj, result))
    }

    /// The suspending counterpart of [`Self::handle_raw_message`]; can
    /// drive either a sync or an async handler.
    pub async fn handle_raw_message_async(
        &self,
        obj: &Obj,
        request_text: &str,
    ) -> Result<String, UnregisteredMessageIdError>
    where
        Obj: Sync,
    {
        let (message_id, message, dict) = match self.decode_incoming(request_text) {
            Ok(parts) => parts,
            Err(DecodeFailure::Malformed(message)) => return Ok(self.error_response(&HandlerError::runtime(message))),
            Err(DecodeFailure::Unregistered(id)) => return self.unregistered(id),
        };

        let Some(entry) = self.handlers.get(&message_id) else {
            return self.unregistered(message_id);
        };

        let mut message = message;
        if let Some(filter) = &self.decode_filter {
            filter(obj, &dict, message.as_mut());
        }

        let result = match &entry.kind {
            HandlerKind::Sync(handler) => handler(obj, message),
            HandlerKind::Async(handler) => handler(obj, message).await,
        };

        Ok(self.finish(obj, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ResponseId;
    use crate::protocol::MessageProtocolBuilder;
    use crate::{impl_message, impl_response};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, Default)]
    struct Ping {
        n: i64,
        #[serde(skip)]
        extensions: crate::Extensions,
    }
    impl_message!(Ping, responses = [ResponseId(0)]);

    #[derive(Debug, Serialize, Deserialize, Default)]
    struct Pong {
        n: i64,
        #[serde(skip)]
        extensions: crate::Extensions,
    }
    impl_response!(Pong);

    struct Host;

    fn build_protocol() -> Arc<MessageProtocol> {
        Arc::new(
            MessageProtocolBuilder::new()
                .message::<Ping>(0)
                .unwrap()
                .response::<Pong>(0)
                .unwrap()
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn dispatches_registered_handler() {
        let protocol = build_protocol();
        let mut receiver = MessageReceiver::<Host>::new(Arc::clone(&protocol));
        receiver
            .register_handler(|_obj: &Host, msg: Ping| Ok(Pong { n: msg.n * 2, extensions: Default::default() }))
            .unwrap();
        receiver.validate().unwrap();

        let request = protocol.encode_dict(&protocol.message_to_dict(&Ping { n: 21, extensions: Default::default() }).unwrap());
        let response_text = receiver.handle_raw_message(&Host, &request).unwrap();
        let dict = protocol.decode_dict(&response_text).unwrap();
        let response = protocol.response_from_dict(&dict).unwrap();
        let pong: &Pong = response.as_any().downcast_ref().unwrap();
        assert_eq!(pong.n, 42);
    }

    #[test]
    fn unregistered_id_is_graceful_by_default() {
        let protocol = build_protocol();
        let receiver = MessageReceiver::<Host>::new(Arc::clone(&protocol));
        let mut dict = Map::new();
        dict.insert("t".to_string(), Value::from(99));
        dict.insert("m".to_string(), Value::Null);
        let request = protocol.encode_dict(&dict);
        let response_text = receiver.handle_raw_message(&Host, &request).unwrap();
        let response_dict = protocol.decode_dict(&response_text).unwrap();
        assert!(protocol.is_error(&response_dict));
    }

    #[test]
    fn unregistered_id_raises_when_configured() {
        let protocol = build_protocol();
        let receiver = MessageReceiver::<Host>::new(Arc::clone(&protocol)).with_raise_unregistered(true);
        let mut dict = Map::new();
        dict.insert("t".to_string(), Value::from(99));
        dict.insert("m".to_string(), Value::Null);
        let request = protocol.encode_dict(&dict);
        let err = receiver.handle_raw_message(&Host, &request).unwrap_err();
        assert_eq!(err.0, MessageId(99));
    }

    #[test]
    fn validate_reports_missing_handler() {
        let protocol = build_protocol();
        let receiver = MessageReceiver::<Host>::new(protocol);
        assert!(matches!(
            receiver.validate(),
            Err(HandlerRegistrationError::MissingHandler(_))
        ));
    }

    #[test]
    fn clean_error_round_trips_message() {
        let protocol = build_protocol();
        let mut receiver = MessageReceiver::<Host>::new(Arc::clone(&protocol));
        receiver
            .register_handler(|_obj: &Host, _msg: Ping| -> Result<Pong, HandlerError> {
                Err(HandlerError::clean("ping rejected"))
            })
            .unwrap();

        let request = protocol.encode_dict(&protocol.message_to_dict(&Ping { n: 1, extensions: Default::default() }).unwrap());
        let response_text = receiver.handle_raw_message(&Host, &request).unwrap();
        let dict = protocol.decode_dict(&response_text).unwrap();
        assert!(protocol.is_error(&dict));
        assert_eq!(dict.get("kind").unwrap(), "clean");
        assert_eq!(dict.get("message").unwrap(), "ping rejected");
    }

    #[derive(Debug, Serialize, Deserialize, Default)]
    struct Query {
        n: i64,
        #[serde(skip)]
        extensions: crate::Extensions,
    }
    impl_message!(Query, responses = [ResponseId(0), ResponseId(1)]);

    #[derive(Debug, Serialize, Deserialize, Default)]
    struct Count {
        n: i64,
        #[serde(skip)]
        extensions: crate::Extensions,
    }
    impl_response!(Count);

    fn build_multi_response_protocol() -> Arc<MessageProtocol> {
        Arc::new(
            MessageProtocolBuilder::new()
                .message::<Query>(0)
                .unwrap()
                .response::<Pong>(0)
                .unwrap()
                .response::<Count>(1)
                .unwrap()
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn register_handler_rejects_a_message_with_more_than_one_declared_response() {
        let protocol = build_multi_response_protocol();
        let mut receiver = MessageReceiver::<Host>::new(protocol);
        let err = receiver
            .register_handler(|_obj: &Host, msg: Query| -> Result<Count, HandlerError> {
                Ok(Count { n: msg.n, extensions: Default::default() })
            })
            .unwrap_err();
        assert!(matches!(err, HandlerRegistrationError::ResponseMismatch { .. }));
    }

    #[test]
    fn register_handler_boxed_covers_a_message_with_more_than_one_declared_response() {
        let protocol = build_multi_response_protocol();
        let mut receiver = MessageReceiver::<Host>::new(Arc::clone(&protocol));
        receiver
            .register_handler_boxed::<Query, _>(&[ResponseId(0), ResponseId(1)], |_obj: &Host, msg: Query| {
                if msg.n < 0 {
                    Ok(Box::new(Pong { n: msg.n, extensions: Default::default() }) as Box<dyn Response>)
                } else {
                    Ok(Box::new(Count { n: msg.n, extensions: Default::default() }) as Box<dyn Response>)
                }
            })
            .unwrap();
        receiver.validate().unwrap();

        let request = protocol.encode_dict(&protocol.message_to_dict(&Query { n: 7, extensions: Default::default() }).unwrap());
        let response_text = receiver.handle_raw_message(&Host, &request).unwrap();
        let dict = protocol.decode_dict(&response_text).unwrap();
        let response = protocol.response_from_dict(&dict).unwrap();
        let count: &Count = response.as_any().downcast_ref().unwrap();
        assert_eq!(count.n, 7);
    }

    #[test]
    fn register_handler_boxed_rejects_a_response_set_that_does_not_match() {
        let protocol = build_multi_response_protocol();
        let mut receiver = MessageReceiver::<Host>::new(protocol);
        let err = receiver
            .register_handler_boxed::<Query, _>(&[ResponseId(0)], |_obj: &Host, _msg: Query| {
                Ok(Box::new(Pong { n: 0, extensions: Default::default() }) as Box<dyn Response>)
            })
            .unwrap_err();
        assert!(matches!(err, HandlerRegistrationError::ResponseMismatch { .. }));
    }
}
