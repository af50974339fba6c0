//! # Gitway Node
//!
//! HTTP front end of the Gitway git proxy. Git clients (or an SSH front end
//! forwarding their sessions) talk smart HTTP to the node; the node relays
//! every byte to a repository backend over gRPC without buffering pack data in
//! memory.
//!
//! ## Operations
//!
//! - **info/refs**: ref advertisement, optionally gzip-encoded
//! - **git-upload-pack**: fetch; the request body is fully read before any
//!   response byte is sent, and pack data flows over a side-channel
//! - **git-receive-pack**: push; like fetch, the response waits for the
//!   whole request body
//! - **ssh-upload-pack / ssh-receive-pack**: full-duplex variants that relay
//!   both directions at once
//!
//! When the backend refuses work because a limit was reached, clients get the
//! operation's own busy message instead of an opaque failure.
//!
//! ## Modules
//!
//! - [`api`]: router, shared state and HTTP error mapping
//! - [`relay`]: per-operation orchestration
//! - [`operation`]: request routing
//! - [`auth`]: repository and identity resolution
//! - [`config`]: YAML configuration
//! - [`observability`]: logging, metrics, request IDs

pub mod api;
pub mod auth;
pub mod config;
pub mod observability;
pub mod operation;
pub mod relay;
