//! presenced - automatic away and connectivity-aware presence.
//!
//! Keeps an instant-messaging presence in line with the desktop session: goes
//! away when the session is idle, escalates to extended away after a while,
//! goes offline when the network drops, and restores the previous presence
//! afterwards. Presences are requested from Telepathy Mission Control.

pub mod backend;
pub mod config;
pub mod connectivity;
pub mod control;
pub mod coordinator;
pub mod domain;
pub mod idle;
pub mod service;
