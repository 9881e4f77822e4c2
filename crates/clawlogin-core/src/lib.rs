//! Core library for the ClawCloud sign-in runner: browser automation, the
//! GitHub OAuth flow, cookie persistence, and operator messaging.

pub mod artifacts;
pub mod auth;
pub mod browser;
pub mod channel;
pub mod config;
pub mod cookies;
pub mod secrets;

#[cfg(test)]
pub(crate) mod testing;
