//! An abstraction layer for the language model backend.
//!
//! The relay only needs one capability from a backend: given an ordered
//! list of messages (the directive included), produce a lazy, finite and
//! non-restartable sequence of text deltas. This crate defines that
//! capability so the endpoint can be driven by a real provider in
//! production and by a scripted one in tests.
//!
//! Types in this crate don't define any behavior, instead they are the
//! constraints that the implementors should adhere to.

#![deny(missing_docs)]

mod error;
mod provider;
mod request;
mod response;

pub use error::*;
pub use provider::*;
pub use request::*;
pub use response::*;
