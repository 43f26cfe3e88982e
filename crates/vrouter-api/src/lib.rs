// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Types shared between the virtual router controller and the things
//! that drive it: addresses, virtual port identity, and the OpenFlow
//! match/action/command vocabulary.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod flow;
pub mod ip;
pub mod mac;
pub mod port;

pub use flow::*;
pub use ip::*;
pub use mac::*;
pub use port::*;
