// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2026 Oxide Computer Company

//! Root logger construction for binaries embedding the controller.

use crate::cfg::Config;
use slog::Drain;
use slog::Level;
use slog::LevelFilter;
use slog::Logger;
use slog::o;
use slog_async::Async;
use slog_term::FullFormat;
use slog_term::TermDecorator;

/// The configured level.
///
/// An unparsable level falls back to `Info`; [`Config`] rejects those
/// at load time anyway.
pub fn level(cfg: &Config) -> Level {
    cfg.log_level.parse::<Level>().unwrap_or(Level::Info)
}

/// Build a terminal logger filtered at the configured level.
pub fn logger(cfg: &Config) -> Logger {
    let decorator = TermDecorator::new().build();
    let drain = FullFormat::new(decorator).build().fuse();
    let drain = Async::new(drain).build().fuse();
    let drain = LevelFilter::new(drain, level(cfg)).fuse();
    Logger::root(drain, o!("name" => "vrouter"))
}
