//! Switchboard, a multi-tenant messaging gateway.
//!
//! Keeps one protocol session alive per tenant and republishes each tenant's
//! inbound events to its webhook.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod protocol;
pub mod tenants;

pub mod events;
pub mod session;
pub mod webhook;

pub mod api;
