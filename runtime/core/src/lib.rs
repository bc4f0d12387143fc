// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Core utilities for service programs of Echo DSP-based cards.

pub mod cmdline;
pub mod dispatcher;

use {clap::ValueEnum, glib::Error, tracing::Level};

/// The maximum level of events emitted to the subscriber.
#[derive(ValueEnum, Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum LogLevel {
    Info,
    #[default]
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// The stages of service: `new()` brings up the card, `listen()` configures it and starts
/// sources of event, then `run()` dispatches the events till shutdown.
pub trait RuntimeOperation<T>: Sized {
    fn new(config: T, log_level: Option<LogLevel>) -> Result<Self, Error>;
    fn listen(&mut self) -> Result<(), Error>;
    fn run(&mut self) -> Result<(), Error>;
}
