// SPDX-License-Identifier: Apache-2.0

//! Defines the protocol's message and response traits.
//!
//! Every concrete message/response type is a plain struct that derives
//! `serde::{Serialize, Deserialize}` and implements [`Message`] or
//! [`Response`] via the [`impl_message!`]/[`impl_response!`] macros,
//! the same way the teacher generates boilerplate accessors with
//! `impl_getters!` in `proto/mod.rs`.

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::extensions::Extensions;
use crate::ids::ResponseId;

/// A concrete request record. `response_ids()` declares the set of
/// response types this message may produce (possibly just
/// `[ResponseId::EMPTY]`, meaning the message has no meaningful
/// return value).
///
/// `response_ids` takes `where Self: Sized` so it is excluded from the
/// trait's vtable; everything else here is dispatchable through
/// `&dyn Message`.
pub trait Message: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn response_ids() -> &'static [ResponseId]
    where
        Self: Sized;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Consumes a type-erased message back into an `Any` a concrete
    /// handler can downcast into, e.g. via `Box<dyn Any>::downcast`.
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    /// Re-serializes a type-erased message, for callers (such as
    /// [`crate::receiver::MessageReceiver`]'s dispatch path) that only
    /// hold a `&dyn Message`, not the concrete type `serde_json::to_value`
    /// needs.
    fn to_value(&self) -> serde_json::Value;

    fn extensions(&self) -> &Extensions;
    fn extensions_mut(&mut self) -> &mut Extensions;
}

/// A concrete reply record.
pub trait Response: fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// See [`Message::into_any`].
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    /// See [`Message::to_value`].
    fn to_value(&self) -> serde_json::Value;

    fn extensions(&self) -> &Extensions;
    fn extensions_mut(&mut self) -> &mut Extensions;
}

/// Implements [`Message`] for a struct that has an `extensions: Extensions`
/// field, given its registered response types.
#[macro_export]
macro_rules! impl_message {
    ($ty:ty, responses = [$($resp:expr),* $(,)?]) => {
        impl $crate::Message for $ty {
            fn response_ids() -> &'static [$crate::ResponseId] {
                const IDS: &[$crate::ResponseId] = &[$($resp),*];
                IDS
            }

            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }

            fn into_any(self: Box<Self>) -> Box<dyn ::std::any::Any + Send> {
                self
            }

            fn to_value(&self) -> $crate::__private::serde_json::Value {
                $crate::__private::serde_json::to_value(self).expect("registered message types always serialize")
            }

            fn extensions(&self) -> &$crate::Extensions {
                &self.extensions
            }

            fn extensions_mut(&mut self) -> &mut $crate::Extensions {
                &mut self.extensions
            }
        }
    };
}

/// Implements [`Response`] for a struct that has an `extensions: Extensions` field.
#[macro_export]
macro_rules! impl_response {
    ($ty:ty) => {
        impl $crate::Response for $ty {
            fn as_any(&self) -> &dyn ::std::any::Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn ::std::any::Any {
                self
            }

            fn into_any(self: Box<Self>) -> Box<dyn ::std::any::Any + Send> {
                self
            }

            fn to_value(&self) -> $crate::__private::serde_json::Value {
                $crate::__private::serde_json::to_value(self).expect("registered response types always serialize")
            }

            fn extensions(&self) -> &$crate::Extensions {
                &self.extensions
            }

            fn extensions_mut(&mut self) -> &mut $crate::Extensions {
                &mut self.extensions
            }
        }
    };
}

/// The distinguished response used when a handler returns nothing.
/// Always implicitly part of every protocol, at [`ResponseId::EMPTY`].
#[derive(Debug, Default, Serialize, serde::Deserialize)]
pub struct EmptyResponse {
    #[serde(skip)]
    extensions: Extensions,
}

impl EmptyResponse {
    pub fn new() -> Self {
        Self::default()
    }
}

impl_response!(EmptyResponse);
