// SPDX-License-Identifier: Apache-2.0

//! Generates the typed sender/receiver wrapper source a protocol's
//! message set implies — the code a service author would otherwise
//! write by hand and keep in sync every time a message is added.
//!
//! Output is deterministic: messages are always emitted in ascending
//! id order, so running a generator twice against an unchanged
//! protocol produces byte-identical source. That makes it safe to
//! commit the result and diff it in review rather than regenerate it
//! at build time.
//!
//! A message with exactly one non-empty declared response gets a
//! concretely-typed method. A message declaring no non-empty response
//! (only the implicit empty response) is typed as
//! [`crate::EmptyResponse`]. A message declaring more than one falls
//! back to the type-erased `Box<dyn Response>` shape — on the sender
//! side that's the same shape calling [`crate::sender::MessageSender`]
//! directly gives you; on the receiver side it's wired through
//! [`crate::receiver::MessageReceiver::register_handler_boxed`] instead
//! of [`crate::receiver::MessageReceiver::register_handler`], since no
//! single concrete return type can cover more than one declared
//! response.

use crate::ids::{MessageId, ResponseId};
use crate::protocol::MessageProtocol;

#[derive(Debug, Clone, Copy, Default)]
pub struct SenderFlags {
    pub enable_sync: bool,
    pub enable_async: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverFlags {
    pub enable_sync: bool,
    pub enable_async: bool,
}

/// Strips module path and generic parameters from a `std::any::type_name`
/// string, leaving just the bare type identifier.
fn simple_type_name(full: &str) -> &str {
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics.rsplit("::").next().unwrap_or(without_generics)
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::new();
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i != 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// How many non-empty response types a message declares, which
/// dictates the shape its generated method/handler slot takes.
enum ResponseArity {
    /// No non-empty response declared: the handler has nothing
    /// meaningful to return.
    Empty,
    /// Exactly one non-empty response: a concretely-typed slot.
    Single(&'static str),
    /// More than one: no single concrete type covers the declared set.
    Many,
}

fn response_arity(protocol: &MessageProtocol, id: MessageId) -> ResponseArity {
    let ids: Vec<ResponseId> = protocol
        .response_set(id)
        .unwrap_or(&[])
        .iter()
        .copied()
        .filter(|r| *r != ResponseId::EMPTY)
        .collect();
    match ids.as_slice() {
        [] => ResponseArity::Empty,
        [single] => match protocol.response_type_name(*single) {
            Some(name) => ResponseArity::Single(name),
            None => ResponseArity::Many,
        },
        _ => ResponseArity::Many,
    }
}

/// Emits a struct wrapping [`crate::sender::MessageSender`] with one
/// typed method per registered message.
pub fn generate_sender_shim(protocol: &MessageProtocol, name: &str, flags: SenderFlags) -> String {
    let mut out = String::new();
    out.push_str("// @generated by protomsg::shim. Do not edit by hand.\n\n");
    out.push_str(&format!(
        "pub struct {name}<Obj> {{\n    inner: protomsg::MessageSender<Obj>,\n}}\n\n"
    ));
    out.push_str(&format!("impl<Obj> {name}<Obj> {{\n"));
    out.push_str("    pub fn new(inner: protomsg::MessageSender<Obj>) -> Self {\n        Self { inner }\n    }\n");
    out.push_str("}\n\n");

    if flags.enable_sync {
        out.push_str(&format!(
            "impl<Obj: protomsg::transport::BlockingTransport> {name}<Obj> {{\n"
        ));
        for id in protocol.message_ids() {
            let message_ty = simple_type_name(protocol.message_type_name(id).unwrap_or("UnknownMessage"));
            let method = format!("send_{}", to_snake_case(message_ty));
            match response_arity(protocol, id) {
                ResponseArity::Single(response_full) => {
                    let response_ty = simple_type_name(response_full);
                    out.push_str(&format!(
                        "    pub fn {method}(&self, obj: &Obj, message: {message_ty}) -> Result<{response_ty}, protomsg::error::SendError<Obj::Error>> {{\n"
                    ));
                    out.push_str("        let response = self.inner.send(obj, message)?;\n");
                    out.push_str(&format!(
                        "        Ok(*response.into_any().downcast::<{response_ty}>().expect(\"protocol declared a single response type for this message\"))\n"
                    ));
                    out.push_str("    }\n\n");
                }
                ResponseArity::Empty | ResponseArity::Many => {
                    out.push_str(&format!(
                        "    pub fn {method}(&self, obj: &Obj, message: {message_ty}) -> Result<Box<dyn protomsg::Response>, protomsg::error::SendError<Obj::Error>> {{\n"
                    ));
                    out.push_str("        self.inner.send(obj, message)\n");
                    out.push_str("    }\n\n");
                }
            }
        }
        out.push_str("}\n\n");
    }

    if flags.enable_async {
        out.push_str(&format!(
            "impl<Obj: protomsg::transport::AsyncTransport + Sync> {name}<Obj> {{\n"
        ));
        for id in protocol.message_ids() {
            let message_ty = simple_type_name(protocol.message_type_name(id).unwrap_or("UnknownMessage"));
            let method = format!("send_{}_async", to_snake_case(message_ty));
            out.push_str(&format!(
                "    pub async fn {method}(&self, obj: &Obj, message: {message_ty}) -> Result<Box<dyn protomsg::Response>, protomsg::error::SendError<Obj::Error>> {{\n"
            ));
            out.push_str("        self.inner.send_async(obj, message).await\n");
            out.push_str("    }\n\n");
        }
        out.push_str("}\n\n");
    }

    out
}

/// Emits a handler trait naming one method per registered message, plus
/// a registration function wiring an `Arc<impl Trait>` into a
/// [`crate::receiver::MessageReceiver`]. The generated trait doesn't by
/// itself guarantee every message got a handler; call
/// [`crate::receiver::MessageReceiver::validate`] after registering.
pub fn generate_receiver_shim(protocol: &MessageProtocol, name: &str, flags: ReceiverFlags) -> String {
    let trait_name = format!("{name}Handlers");
    let mut out = String::new();
    out.push_str("// @generated by protomsg::shim. Do not edit by hand.\n\n");

    out.push_str(&format!("pub trait {trait_name}<Obj> {{\n"));
    for id in protocol.message_ids() {
        let message_ty = simple_type_name(protocol.message_type_name(id).unwrap_or("UnknownMessage"));
        let method = format!("handle_{}", to_snake_case(message_ty));
        let response_ty = match response_arity(protocol, id) {
            ResponseArity::Single(name) => simple_type_name(name).to_string(),
            ResponseArity::Empty => "protomsg::EmptyResponse".to_string(),
            ResponseArity::Many => "Box<dyn protomsg::Response>".to_string(),
        };
        if flags.enable_async {
            out.push_str(&format!(
                "    fn {method}(&self, obj: &Obj, message: {message_ty}) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<{response_ty}, protomsg::error::HandlerError>> + Send>>;\n"
            ));
        } else {
            out.push_str(&format!(
                "    fn {method}(&self, obj: &Obj, message: {message_ty}) -> Result<{response_ty}, protomsg::error::HandlerError>;\n"
            ));
        }
    }
    out.push_str("}\n\n");

    out.push_str(&format!(
        "pub fn register_{}_handlers<Obj, H>(receiver: &mut protomsg::MessageReceiver<Obj>, handlers: std::sync::Arc<H>) -> Result<(), protomsg::error::HandlerRegistrationError>\n",
        to_snake_case(name)
    ));
    out.push_str(&format!(
        "where\n    H: {trait_name}<Obj> + Send + Sync + 'static,\n    Obj: 'static,\n{{\n"
    ));
    if flags.enable_sync {
        for id in protocol.message_ids() {
            let message_ty = simple_type_name(protocol.message_type_name(id).unwrap_or("UnknownMessage"));
            let method = format!("handle_{}", to_snake_case(message_ty));
            out.push_str("    {\n        let handlers = std::sync::Arc::clone(&handlers);\n");
            match response_arity(protocol, id) {
                ResponseArity::Many => {
                    let declared = protocol
                        .response_set(id)
                        .unwrap_or(&[])
                        .iter()
                        .map(|r| format!("protomsg::ResponseId({})", r.0))
                        .collect::<Vec<_>>()
                        .join(", ");
                    out.push_str(&format!(
                        "        receiver.register_handler_boxed::<{message_ty}, _>(&[{declared}], move |obj: &Obj, message: {message_ty}| handlers.{method}(obj, message))?;\n"
                    ));
                }
                ResponseArity::Single(_) | ResponseArity::Empty => {
                    out.push_str(&format!(
                        "        receiver.register_handler(move |obj: &Obj, message: {message_ty}| handlers.{method}(obj, message))?;\n"
                    ));
                }
            }
            out.push_str("    }\n");
        }
    }
    out.push_str("    Ok(())\n}\n");

    out
}
