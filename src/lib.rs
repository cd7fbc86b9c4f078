//! IMAP new-mail watcher
//!
//! Keeps one (optionally proxied) IMAP session open on a folder, waits
//! for the server to announce new mail via IDLE (or polls when the
//! server can't push), and fans each new message's metadata out to any
//! number of subscribers.
//!
//! Start with [`Client::connect`], take a [`Subscription`] per consumer,
//! then [`Client::start_watching`]. Failures of the running watch are
//! reported only through the returned [`Termination`]; subscribers just
//! see their stream end when the client closes.

mod client;
mod config;
mod connection;
pub mod context;
mod dispatch;
mod error;
mod folder;
mod proxy;
mod registry;
mod source;
mod update;

pub use client::Client;
pub use config::{ConnectionConfig, TlsMode, UpdateMode};
pub use connection::{ImapSession, ImapStream, MailboxState, connect};
pub use dispatch::{LoopState, StopReason, Termination};
pub use error::{Error, Result};
pub use folder::Folder;
pub use proxy::{ProxyConfig, ProxyScheme};
pub use registry::{SubscriberId, SubscriberRegistry, Subscription};
pub use source::{ImapUpdateSource, UpdateSource};
pub use update::MailUpdate;
