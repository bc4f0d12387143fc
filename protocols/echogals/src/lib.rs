// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

#![doc = include_str!("../README.md")]

pub mod card;
pub mod comm_page;
pub mod dsp;
pub mod echo3g;
pub mod emulator;
pub mod firmware;
pub mod gina24;
pub mod gml;
pub mod layla20;
pub mod layla24;
pub mod mixer;
pub mod mona;
pub mod mtc;
pub mod non_paged;
pub mod os_support;

use {
    glib::{error::ErrorDomain, Error, Quark},
    std::marker::PhantomData,
};

/// The error to operate card and its DSP.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EchoStatusError {
    /// The DSP is not running or the board is marked as bad.
    DspDead,
    /// The DSP did not respond within the window.
    DspTimeout,
    /// The ASIC is not loaded or did not answer.
    AsicNotLoaded,
    /// The channel or pipe is out of range.
    InvalidChannel,
    /// The parameter is not acceptable.
    InvalidParam,
    /// The operation is not supported by the model.
    NotSupported,
    /// The clock source is not supported by the model.
    ClockNotSupported,
    /// The clock source is supported but the signal is not present.
    ClockNotAvailable,
    /// The digital mode is not supported by the model.
    DigitalModeNotSupported,
    /// The sampling rate or format is not acceptable in current configuration.
    BadFormat,
    /// The operation conflicts with running transport or locked state.
    Busy,
    /// Memory allocation failed.
    NoMem,
    /// The index is out of range.
    InvalidIndex,
    /// The hardware is not initialized yet, or initialization failed.
    NotInitialized,
    /// The cookie of mixer client is unknown or already in use.
    BadCookie,
    Invalid(i32),
}

impl std::fmt::Display for EchoStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            EchoStatusError::DspDead => "dsp-dead",
            EchoStatusError::DspTimeout => "dsp-timeout",
            EchoStatusError::AsicNotLoaded => "asic-not-loaded",
            EchoStatusError::InvalidChannel => "invalid-channel",
            EchoStatusError::InvalidParam => "invalid-param",
            EchoStatusError::NotSupported => "not-supported",
            EchoStatusError::ClockNotSupported => "clock-not-supported",
            EchoStatusError::ClockNotAvailable => "clock-not-available",
            EchoStatusError::DigitalModeNotSupported => "digital-mode-not-supported",
            EchoStatusError::BadFormat => "bad-format",
            EchoStatusError::Busy => "busy",
            EchoStatusError::NoMem => "no-mem",
            EchoStatusError::InvalidIndex => "invalid-index",
            EchoStatusError::NotInitialized => "not-initialized",
            EchoStatusError::BadCookie => "bad-cookie",
            EchoStatusError::Invalid(_) => "invalid",
        };

        write!(f, "EchoStatusError::{}", msg)
    }
}

impl ErrorDomain for EchoStatusError {
    fn domain() -> Quark {
        Quark::from_str("echo-gals-status-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            EchoStatusError::DspDead => 1,
            EchoStatusError::DspTimeout => 2,
            EchoStatusError::AsicNotLoaded => 3,
            EchoStatusError::InvalidChannel => 4,
            EchoStatusError::InvalidParam => 5,
            EchoStatusError::NotSupported => 6,
            EchoStatusError::ClockNotSupported => 7,
            EchoStatusError::ClockNotAvailable => 8,
            EchoStatusError::DigitalModeNotSupported => 9,
            EchoStatusError::BadFormat => 10,
            EchoStatusError::Busy => 11,
            EchoStatusError::NoMem => 12,
            EchoStatusError::InvalidIndex => 13,
            EchoStatusError::NotInitialized => 14,
            EchoStatusError::BadCookie => 15,
            EchoStatusError::Invalid(v) => v,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let enumeration = match code {
            1 => EchoStatusError::DspDead,
            2 => EchoStatusError::DspTimeout,
            3 => EchoStatusError::AsicNotLoaded,
            4 => EchoStatusError::InvalidChannel,
            5 => EchoStatusError::InvalidParam,
            6 => EchoStatusError::NotSupported,
            7 => EchoStatusError::ClockNotSupported,
            8 => EchoStatusError::ClockNotAvailable,
            9 => EchoStatusError::DigitalModeNotSupported,
            10 => EchoStatusError::BadFormat,
            11 => EchoStatusError::Busy,
            12 => EchoStatusError::NoMem,
            13 => EchoStatusError::InvalidIndex,
            14 => EchoStatusError::NotInitialized,
            15 => EchoStatusError::BadCookie,
            _ => EchoStatusError::Invalid(code),
        };
        Some(enumeration)
    }
}

pub(crate) fn status_error(kind: EchoStatusError, msg: &str) -> Error {
    Error::new(kind, msg)
}

/// The element which can be gathered in bit mask.
pub trait MaskBit: Copy + Eq + 'static {
    /// All of available elements.
    const ALL: &'static [Self];

    /// The position of bit flag for the element.
    fn bit(&self) -> u32;
}

/// Bit mask of elements.
pub struct Mask<T: MaskBit>(u32, PhantomData<T>);

impl<T: MaskBit> Mask<T> {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw, PhantomData)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, elem: T) -> bool {
        self.0 & (1 << elem.bit()) > 0
    }

    pub fn insert(&mut self, elem: T) {
        self.0 |= 1 << elem.bit();
    }

    pub fn remove(&mut self, elem: T) {
        self.0 &= !(1 << elem.bit());
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        T::ALL.iter().copied().filter(move |&elem| self.contains(elem))
    }
}

impl<T: MaskBit> From<&[T]> for Mask<T> {
    fn from(elems: &[T]) -> Self {
        let mut mask = Self::default();
        elems.iter().for_each(|&elem| mask.insert(elem));
        mask
    }
}

impl<T: MaskBit> Default for Mask<T> {
    fn default() -> Self {
        Self(0, PhantomData)
    }
}

impl<T: MaskBit> Clone for Mask<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: MaskBit> Copy for Mask<T> {}

impl<T: MaskBit> PartialEq for Mask<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T: MaskBit> Eq for Mask<T> {}

impl<T: MaskBit + std::fmt::Debug> std::fmt::Debug for Mask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Source of sampling clock at input side.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputClock {
    Internal,
    Word,
    Super,
    Spdif,
    Adat,
    Esync,
    Esync96,
    /// MIDI time code, available in models with MIDI port.
    Mtc,
}

impl Default for InputClock {
    fn default() -> Self {
        Self::Internal
    }
}

impl MaskBit for InputClock {
    const ALL: &'static [Self] = &[
        Self::Internal,
        Self::Word,
        Self::Super,
        Self::Spdif,
        Self::Adat,
        Self::Esync,
        Self::Esync96,
        Self::Mtc,
    ];

    fn bit(&self) -> u32 {
        serialize_input_clock(self)
    }
}

impl InputClock {
    /// Whether the clock requires signal from outside of the card.
    pub fn is_external(&self) -> bool {
        *self != Self::Internal
    }
}

pub(crate) fn serialize_input_clock(clock: &InputClock) -> u32 {
    match clock {
        InputClock::Internal => 0,
        InputClock::Word => 1,
        InputClock::Super => 2,
        InputClock::Spdif => 3,
        InputClock::Adat => 4,
        InputClock::Esync => 5,
        InputClock::Esync96 => 6,
        InputClock::Mtc => 7,
    }
}

pub(crate) fn deserialize_input_clock(clock: &mut InputClock, val: u32) -> Result<(), Error> {
    *clock = match val {
        0 => InputClock::Internal,
        1 => InputClock::Word,
        2 => InputClock::Super,
        3 => InputClock::Spdif,
        4 => InputClock::Adat,
        5 => InputClock::Esync,
        6 => InputClock::Esync96,
        7 => InputClock::Mtc,
        _ => {
            let msg = format!("Unexpected value for input clock: {}", val);
            Err(status_error(EchoStatusError::InvalidParam, &msg))?
        }
    };
    Ok(())
}

/// The set of input clocks.
pub type InputClockMask = Mask<InputClock>;

/// Destination of sampling clock at output side.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutputClock {
    Word,
    Super,
}

impl Default for OutputClock {
    fn default() -> Self {
        Self::Word
    }
}

impl MaskBit for OutputClock {
    const ALL: &'static [Self] = &[Self::Word, Self::Super];

    fn bit(&self) -> u32 {
        match self {
            Self::Word => 0,
            Self::Super => 1,
        }
    }
}

/// The set of output clocks.
pub type OutputClockMask = Mask<OutputClock>;

/// Mode of digital interface.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DigitalMode {
    /// S/PDIF over coaxial interface.
    SpdifRca,
    /// S/PDIF over optical interface.
    SpdifOptical,
    /// ADAT over optical interface.
    Adat,
    /// S/PDIF over internal header for CD-ROM drive.
    SpdifCdrom,
}

impl Default for DigitalMode {
    fn default() -> Self {
        Self::SpdifRca
    }
}

impl MaskBit for DigitalMode {
    const ALL: &'static [Self] = &[
        Self::SpdifRca,
        Self::SpdifOptical,
        Self::Adat,
        Self::SpdifCdrom,
    ];

    fn bit(&self) -> u32 {
        match self {
            Self::SpdifRca => 0,
            Self::SpdifOptical => 1,
            Self::Adat => 2,
            Self::SpdifCdrom => 3,
        }
    }
}

/// The set of digital modes.
pub type DigitalModeMask = Mask<DigitalMode>;

/// Type of card.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    Gina24,
    Layla20,
    Layla24,
    Mona,
    Echo3g,
}

/// Type of DSP mounted on the card.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DspDevice {
    /// Motorola DSP56301.
    Dsp56301,
    /// Motorola DSP56361, which requires resident loader.
    Dsp56361,
}

impl Default for DspDevice {
    fn default() -> Self {
        Self::Dsp56301
    }
}

/// Supported sampling rates.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SampleRateSupport {
    /// The listed rates only.
    Discrete(&'static [u32]),
    /// Any rate in the inclusive range.
    Continuous { min: u32, max: u32 },
}

impl SampleRateSupport {
    pub fn range(&self) -> (u32, u32) {
        match self {
            Self::Discrete(rates) => {
                let min = rates.iter().copied().min().unwrap_or_default();
                let max = rates.iter().copied().max().unwrap_or_default();
                (min, max)
            }
            Self::Continuous { min, max } => (*min, *max),
        }
    }

    pub fn contains(&self, rate: u32) -> bool {
        match self {
            Self::Discrete(rates) => rates.iter().any(|&r| r == rate),
            Self::Continuous { min, max } => *min <= rate && rate <= *max,
        }
    }
}

/// The sampling rates available in models with 24 bit converters.
pub(crate) const DISCRETE_RATES: &[u32] = &[
    8000, 11025, 16000, 22050, 32000, 44100, 48000, 88200, 96000,
];

/// The rate above which is double speed.
pub(crate) const SINGLE_SPEED_MAX_RATE: u32 = 50000;

/// Latency in sample frames between the host buffer and physical jack.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct LatencySpec {
    pub analog_output_1x: u32,
    pub analog_output_2x: u32,
    pub analog_input_1x: u32,
    pub analog_input_2x: u32,
    pub digital_output: u32,
    pub digital_input: u32,
}

/// Static data of model.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CardSpec {
    pub card_type: CardType,
    pub name: &'static str,
    pub analog_output_count: usize,
    pub digital_output_count: usize,
    pub analog_input_count: usize,
    pub digital_input_count: usize,
    pub midi_port_count: usize,
    pub input_clocks: &'static [InputClock],
    pub output_clocks: &'static [OutputClock],
    pub digital_modes: &'static [DigitalMode],
    pub sample_rates: SampleRateSupport,
    pub latency: LatencySpec,
    pub has_phantom_power: bool,
    pub has_digital_input_auto_mute: bool,
    pub has_spdif_non_audio: bool,
}

impl CardSpec {
    pub fn bus_output_count(&self) -> usize {
        self.analog_output_count + self.digital_output_count
    }

    pub fn bus_input_count(&self) -> usize {
        self.analog_input_count + self.digital_input_count
    }

    pub fn pipe_count(&self) -> usize {
        self.bus_output_count() + self.bus_input_count()
    }
}

/// Specification of model.
pub trait EchoCardSpecification {
    const CARD_TYPE: CardType;
    const CARD_NAME: &'static str;

    const ANALOG_OUTPUT_COUNT: usize;
    const DIGITAL_OUTPUT_COUNT: usize;
    const ANALOG_INPUT_COUNT: usize;
    const DIGITAL_INPUT_COUNT: usize;
    const MIDI_PORT_COUNT: usize = 0;

    const INPUT_CLOCKS: &'static [InputClock];
    const OUTPUT_CLOCKS: &'static [OutputClock] = &[];
    const DIGITAL_MODES: &'static [DigitalMode] = &[];

    const SAMPLE_RATES: SampleRateSupport;

    const LATENCY: LatencySpec;

    const HAS_PHANTOM_POWER: bool = false;
    const HAS_DIGITAL_INPUT_AUTO_MUTE: bool = false;
    const HAS_SPDIF_NON_AUDIO: bool = true;

    const SPEC: CardSpec = CardSpec {
        card_type: Self::CARD_TYPE,
        name: Self::CARD_NAME,
        analog_output_count: Self::ANALOG_OUTPUT_COUNT,
        digital_output_count: Self::DIGITAL_OUTPUT_COUNT,
        analog_input_count: Self::ANALOG_INPUT_COUNT,
        digital_input_count: Self::DIGITAL_INPUT_COUNT,
        midi_port_count: Self::MIDI_PORT_COUNT,
        input_clocks: Self::INPUT_CLOCKS,
        output_clocks: Self::OUTPUT_CLOCKS,
        digital_modes: Self::DIGITAL_MODES,
        sample_rates: Self::SAMPLE_RATES,
        latency: Self::LATENCY,
        has_phantom_power: Self::HAS_PHANTOM_POWER,
        has_digital_input_auto_mute: Self::HAS_DIGITAL_INPUT_AUTO_MUTE,
        has_spdif_non_audio: Self::HAS_SPDIF_NON_AUDIO,
    };
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn input_clock_serdes() {
        InputClock::ALL.iter().for_each(|clock| {
            let val = serialize_input_clock(clock);
            let mut c = InputClock::default();
            deserialize_input_clock(&mut c, val).unwrap();
            assert_eq!(*clock, c);
        });

        let mut c = InputClock::default();
        let err = deserialize_input_clock(&mut c, 8).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidParam));
    }

    #[test]
    fn mask_operation() {
        let mut mask = InputClockMask::from(&[InputClock::Internal, InputClock::Adat][..]);
        assert_eq!(mask.raw(), 0x11);
        assert!(mask.contains(InputClock::Adat));
        assert!(!mask.contains(InputClock::Spdif));

        mask.insert(InputClock::Spdif);
        mask.remove(InputClock::Internal);
        assert_eq!(
            mask.iter().collect::<Vec<_>>(),
            vec![InputClock::Spdif, InputClock::Adat]
        );
    }

    #[test]
    fn error_domain() {
        let err = status_error(EchoStatusError::AsicNotLoaded, "asic");
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::AsicNotLoaded));
        assert_eq!(<EchoStatusError as ErrorDomain>::from(99), Some(EchoStatusError::Invalid(99)));
    }

    #[test]
    fn sample_rate_support() {
        let rates = SampleRateSupport::Discrete(DISCRETE_RATES);
        assert_eq!(rates.range(), (8000, 96000));
        assert!(rates.contains(44100));
        assert!(!rates.contains(44000));

        let rates = SampleRateSupport::Continuous {
            min: 8000,
            max: 50000,
        };
        assert!(rates.contains(44000));
        assert!(!rates.contains(96000));
    }
}
