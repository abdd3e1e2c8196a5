//! lavalink-client is a control-plane client for pools of Lavalink-style audio nodes.
//!
//! A bot registers one or more remote audio [`Node`]s with a [`Lavalink`] pool, and gets a
//! [`Link`] per guild it plays audio in. Each link is routed through one node at a time; the
//! [`LoadBalancer`] picks the least loaded node for it, and moves it to another one whenever its
//! node goes down. Node connections are re-opened in the background with a linear backoff.
//!
//! The library never talks to the chat platform itself. Joining and leaving voice channels is
//! delegated to a [`VoiceGateway`], and the bot's gateway bindings feed voice state and voice
//! server updates back through [`Lavalink::on_voice_state_update`] and
//! [`Lavalink::on_voice_server_update`].
//!
//! # Installation
//!
//! Add the following to your `Cargo.toml` file:
//!
//! ```toml
//! [dependencies]
//! lavalink-client = "0.1"
//! ```
//!
//! [`Lavalink`]: crate::client::Lavalink
//! [`Lavalink::on_voice_state_update`]: crate::client::Lavalink::on_voice_state_update
//! [`Lavalink::on_voice_server_update`]: crate::client::Lavalink::on_voice_server_update
//! [`Link`]: crate::link::Link
//! [`LoadBalancer`]: crate::load_balancer::LoadBalancer
//! [`Node`]: crate::node::Node
//! [`VoiceGateway`]: crate::client::VoiceGateway
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![forbid(unsafe_code)]
#![warn(
    unused,
    rust_2018_idioms,
    clippy::unwrap_used,
    clippy::clone_on_ref_ptr,
    clippy::non_ascii_literal,
    clippy::fallible_impl_from,
    clippy::let_underscore_must_use,
    clippy::format_push_string,
    clippy::pedantic
)]
#![allow(
    // Allowed as they are too pedantic
    clippy::cast_possible_truncation,
    clippy::module_name_repetitions,
    clippy::unreadable_literal,
    clippy::cast_possible_wrap,
    clippy::wildcard_imports,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::too_many_lines,
    clippy::doc_markdown,
    clippy::missing_panics_doc
)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

#[macro_use]
extern crate serde;

mod internal;

pub mod client;
pub mod constants;
pub mod link;
pub mod load_balancer;
pub mod model;
pub mod node;

mod error;

pub use crate::client::{Lavalink, LavalinkBuilder};
pub use crate::error::{Error, Result};

/// Special module that re-exports most public items from this crate.
///
/// Useful, because you don't have to remember the full paths of lavalink-client items.
pub mod all {
    #[doc(no_inline)]
    pub use crate::client::*;
    #[doc(no_inline)]
    pub use crate::constants::{close_codes::*, *};
    #[doc(no_inline)]
    pub use crate::link::*;
    #[doc(no_inline)]
    pub use crate::load_balancer::*;
    #[doc(no_inline)]
    pub use crate::model::*;
    #[doc(no_inline)]
    pub use crate::node::*;
    #[doc(no_inline)]
    pub use crate::{async_trait, Error, Result};
}

// Re-exports of crates used internally which are already publically exposed.
pub use async_trait::async_trait;
