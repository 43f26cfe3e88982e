// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The forwarding core of an OpenFlow virtual L3 router controller.
//!
//! The [`engine::controller::Controller`] is a synchronous state
//! machine: every event it handles pushes zero or more
//! [`api::DatapathCmd`] values into its outbox, which the caller
//! drains. The [`task`] module wraps it in a tokio task so that all
//! events, including address-resolution completions, are handled one
//! at a time on a single stream.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub use vrouter_api as api;

pub mod cfg;
pub mod engine;
pub mod log;
pub mod task;
