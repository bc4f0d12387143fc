// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    super::{LogLevel, RuntimeOperation},
    clap::Parser,
    echo_gals_protocols::EchoStatusError,
    glib::{Error, FileError},
};

pub trait ServiceCmd<A, T, R>: Sized
where
    A: Parser,
    R: RuntimeOperation<T>,
{
    fn params(args: &A) -> (T, Option<LogLevel>);

    fn run() {
        let code = A::try_parse()
            .map_err(|err| err.to_string())
            .map(|args| Self::params(&args))
            .and_then(|(params, log_level)| {
                R::new(params, log_level)
                    .and_then(|mut runtime| {
                        runtime.listen()?;
                        runtime.run()?;
                        Ok(libc::EXIT_SUCCESS)
                    })
                    .map_err(|err| specific_err_to_string(&err))
            })
            .unwrap_or_else(|msg| {
                eprintln!("{}", msg);
                libc::EXIT_FAILURE
            });

        std::process::exit(code)
    }
}

fn specific_err_to_string(e: &Error) -> String {
    let (domain, cause) = if let Some(error) = e.kind::<FileError>() {
        (
            "Linux file operation error",
            match error {
                FileError::Acces => "Access permission",
                FileError::Isdir => "Is directory",
                FileError::Notdir => "Not directory",
                FileError::Noent => "Not exists",
                _ => "",
            },
        )
    } else if let Some(error) = e.kind::<EchoStatusError>() {
        (
            "Echo DSP operation error",
            match error {
                EchoStatusError::DspDead => "DSP is not running",
                EchoStatusError::DspTimeout => "DSP does not respond",
                EchoStatusError::AsicNotLoaded => "ASIC is not loaded",
                EchoStatusError::ClockNotSupported => "Clock source is not supported",
                EchoStatusError::ClockNotAvailable => "Clock source is not detected",
                EchoStatusError::DigitalModeNotSupported => "Digital mode is not supported",
                EchoStatusError::Busy => "Card is busy",
                EchoStatusError::NoMem => "Memory is exhausted",
                EchoStatusError::NotInitialized => "Card is not initialized",
                EchoStatusError::InvalidParam => "Parameter is out of range",
                EchoStatusError::BadFormat => "Format is not available",
                EchoStatusError::BadCookie => "Mixer client is unknown",
                _ => "",
            },
        )
    } else {
        ("Unknown domain error", "")
    };
    format!("{}: {}, {}", domain, cause, e)
}
