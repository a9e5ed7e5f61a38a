// SPDX-License-Identifier: Apache-2.0

//! Exercises the cooperative-suspension path: a suspending sender
//! talking to a suspending receiver (spec scenario S5), and the
//! blocking-handler-from-a-suspending-receiver compatibility case
//! (spec.md §4.4's "a blocking receiver called from a suspending sender
//! is permitted").

use std::sync::Arc;

use async_trait::async_trait;
use protomsg::error::HandlerError;
use protomsg::{
    impl_message, impl_response, EmptyResponse, Extensions, Message, MessageProtocol,
    MessageProtocolBuilder, MessageReceiver, MessageSender, ResponseId,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Default)]
struct Ping {
    ival: i64,
    #[serde(skip)]
    extensions: Extensions,
}
impl_message!(Ping, responses = [ResponseId(0)]);

#[derive(Debug, Serialize, Deserialize, Default)]
struct Pong {
    bval: bool,
    #[serde(skip)]
    extensions: Extensions,
}
impl_response!(Pong);

fn protocol() -> Arc<MessageProtocol> {
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

struct Server {
    receiver: MessageReceiver<Server>,
}

impl Server {
    fn new(protocol: Arc<MessageProtocol>) -> Self {
        let mut receiver = MessageReceiver::new(protocol);
        // A sync handler, dispatched from the suspending entry point
        // `handle_raw_message_async` — the permitted "blocking receiver
        // work called from a suspending caller" combination.
        receiver
            .register_handler(|_obj: &Server, msg: Ping| -> Result<Pong, HandlerError> {
                if msg.ival == 2 {
                    return Err(HandlerError::runtime("boom"));
                }
                Ok(Pong { bval: msg.ival == 0, extensions: Default::default() })
            })
            .unwrap();
        receiver.validate().unwrap();
        Self { receiver }
    }
}

struct Client {
    server: Arc<Server>,
}

#[async_trait]
impl protomsg::transport::AsyncTransport for Client {
    type Error = protomsg::error::UnregisteredMessageIdError;

    async fn send_raw_message(&self, message: String) -> Result<String, Self::Error> {
        // The only suspension point on the sender side (spec.md §5); a
        // real transport would hop across an actual async channel here.
        self.server.receiver.handle_raw_message_async(&self.server, &message).await
    }
}

#[tokio::test]
async fn suspending_sender_and_receiver_round_trip() {
    let server = Arc::new(Server::new(protocol()));
    let client = Client { server: Arc::clone(&server) };
    let sender = MessageSender::new(protocol());

    let response = sender
        .send_async(&client, Ping { ival: 0, extensions: Default::default() })
        .await
        .unwrap();
    let pong: &Pong = response.as_any().downcast_ref().unwrap();
    assert!(pong.bval);
}

#[tokio::test]
async fn suspending_sender_surfaces_a_runtime_handler_failure_as_remote_error() {
    let server = Arc::new(Server::new(protocol()));
    let client = Client { server: Arc::clone(&server) };
    let sender = MessageSender::new(protocol());

    let err = sender
        .send_async(&client, Ping { ival: 2, extensions: Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(err, protomsg::error::SendError::Remote(_)));
}

#[tokio::test]
async fn suspending_receiver_can_dispatch_to_a_sync_registered_handler() {
    // §4.4: a blocking handler, driven through the async entry point,
    // behaves exactly as it would synchronously.
    let protocol = protocol();
    let server = Server::new(Arc::clone(&protocol));
    let request = protocol
        .encode_dict(&protocol.message_to_dict(&Ping { ival: 1, extensions: Default::default() }).unwrap());

    let response_text = server.receiver.handle_raw_message_async(&server, &request).await.unwrap();
    let dict = protocol.decode_dict(&response_text).unwrap();
    let response = protocol.response_from_dict(&dict).unwrap();
    let pong: &Pong = response.as_any().downcast_ref().unwrap();
    assert!(!pong.bval);
}

#[tokio::test]
async fn suspending_receiver_also_drives_a_registered_async_handler() {
    let protocol = protocol();
    let mut receiver = MessageReceiver::<()>::new(Arc::clone(&protocol));
    receiver
        .register_async_handler(|_obj: &(), msg: Ping| async move {
            Ok(Pong { bval: msg.ival == 7, extensions: Default::default() })
        })
        .unwrap();
    receiver.validate().unwrap();

    let request =
        protocol.encode_dict(&protocol.message_to_dict(&Ping { ival: 7, extensions: Default::default() }).unwrap());
    let response_text = receiver.handle_raw_message_async(&(), &request).await.unwrap();
    let dict = protocol.decode_dict(&response_text).unwrap();
    let response = protocol.response_from_dict(&dict).unwrap();
    let pong: &Pong = response.as_any().downcast_ref().unwrap();
    assert!(pong.bval);
}

#[test]
fn a_handler_registered_as_async_rejects_the_blocking_entry_point() {
    // §4.4: "the reverse (suspending receiver from blocking sender) is
    // forbidden." An async-registered handler driven through the
    // blocking `handle_raw_message` comes back as a runtime error
    // envelope rather than silently blocking the caller's thread.
    let _ = env_logger::builder().is_test(true).try_init();

    let protocol = protocol();
    let mut receiver = MessageReceiver::<()>::new(Arc::clone(&protocol));
    receiver
        .register_async_handler(|_obj: &(), msg: Ping| async move {
            Ok(Pong { bval: msg.ival == 0, extensions: Default::default() })
        })
        .unwrap();
    receiver.validate().unwrap();

    let request =
        protocol.encode_dict(&protocol.message_to_dict(&Ping { ival: 0, extensions: Default::default() }).unwrap());
    let response_text = receiver.handle_raw_message(&(), &request).unwrap();
    let dict = protocol.decode_dict(&response_text).unwrap();
    assert!(protocol.is_error(&dict));
    assert_eq!(dict.get("kind").unwrap(), "runtime");
}

#[test]
fn empty_response_message_still_works_over_the_blocking_path() {
    let protocol = protocol();
    let dict = protocol.response_to_dict(&EmptyResponse::new()).unwrap();
    assert_eq!(dict.get("t").unwrap(), &serde_json::Value::from(-1));
}
