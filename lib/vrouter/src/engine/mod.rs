// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! The controller engine.

pub mod controller;
pub mod dhcp;
pub mod flow_tracker;
pub mod icmp;
pub mod network;
pub mod packet;
pub mod port;
pub mod resolve;
pub mod service;
pub mod tunnel;
