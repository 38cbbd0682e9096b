#![deny(unsafe_code)]

//! pipes: an HTTP message broker.
//!
//! Publishers post one-way, two-way and config messages; consumers install registrations made
//! of a filter and a router expression and attach long-lived streaming subscriptions to them.
//! Every request body and streamed response is a sequence of [`codec`] frames.
//!
//! The broker core is [`router::Router`]. It is driven by connection [`context::Context`]s,
//! whose finalization detaches them from every queue entry, two-way call and subscription.

pub mod access;
pub mod auth;
pub mod client;
pub mod context;
pub mod error;
pub mod expr;
pub mod logger;
pub mod message;
pub mod registration;
pub mod router;
pub mod server;
pub mod subscription;

pub use pipes_codec as codec;
pub use pipes_conf as conf;
pub use pipes_utils as utils;

pub use access::Access;
pub use client::{PipeClient, PipeEvent};
pub use context::Context;
pub use error::PipeError;
pub use message::{Message, MessageType};
pub use router::Router;
pub use server::ServerContext;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;
