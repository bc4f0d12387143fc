// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol specific to Echo Digital Audio Gina24.
//!
//! The module includes structure, enumeration, and trait and its implementation for protocol
//! defined by Echo Digital Audio for Gina24.
//!
//! The card has one ASIC on PCI card. The digital interface is available for S/PDIF over
//! coaxial or optical interface, ADAT over optical interface, and S/PDIF from internal header
//! for CD-ROM drive. The last one is not available in the card with DSP56361.

use super::{dsp::*, firmware::*, gml::*, os_support::*, *};

/// The protocol implementation for Gina24.
#[derive(Default, Debug)]
pub struct Gina24Protocol;

impl EchoCardSpecification for Gina24Protocol {
    const CARD_TYPE: CardType = CardType::Gina24;
    const CARD_NAME: &'static str = "Gina24";

    const ANALOG_OUTPUT_COUNT: usize = 8;
    const DIGITAL_OUTPUT_COUNT: usize = 8;
    const ANALOG_INPUT_COUNT: usize = 2;
    const DIGITAL_INPUT_COUNT: usize = 8;

    const INPUT_CLOCKS: &'static [InputClock] = &[
        InputClock::Internal,
        InputClock::Spdif,
        InputClock::Adat,
        InputClock::Esync,
        InputClock::Esync96,
    ];

    const DIGITAL_MODES: &'static [DigitalMode] = &[
        DigitalMode::SpdifRca,
        DigitalMode::SpdifOptical,
        DigitalMode::Adat,
        DigitalMode::SpdifCdrom,
    ];

    const SAMPLE_RATES: SampleRateSupport = SampleRateSupport::Discrete(DISCRETE_RATES);

    const LATENCY: LatencySpec = GML_LATENCY;

    const HAS_DIGITAL_INPUT_AUTO_MUTE: bool = true;
}

const GINA24_361_DIGITAL_MODES: &[DigitalMode] = &[
    DigitalMode::SpdifRca,
    DigitalMode::SpdifOptical,
    DigitalMode::Adat,
];

impl Gina24Protocol {
    fn asic_code(device: DspDevice) -> FirmwareId {
        match device {
            DspDevice::Dsp56301 => FirmwareId::Gina24Asic301,
            DspDevice::Dsp56361 => FirmwareId::Gina24Asic361,
        }
    }
}

impl DspModelOperation for Gina24Protocol {
    fn card_spec(device: DspDevice) -> CardSpec {
        let mut spec = Self::SPEC;
        spec.digital_modes = Self::digital_modes(device);
        spec
    }

    fn dsp_code(device: DspDevice) -> FirmwareId {
        match device {
            DspDevice::Dsp56301 => FirmwareId::Gina24Dsp301,
            DspDevice::Dsp56361 => FirmwareId::Gina24Dsp361,
        }
    }

    fn digital_modes(device: DspDevice) -> &'static [DigitalMode] {
        match device {
            DspDevice::Dsp56301 => Self::DIGITAL_MODES,
            DspDevice::Dsp56361 => GINA24_361_DIGITAL_MODES,
        }
    }

    fn load_asic<O: OsSupport>(dsp: &DspCommObject<O>, st: &mut DspState) -> Result<(), Error> {
        if st.asic_loaded {
            return Ok(());
        }

        let id = Self::asic_code(dsp.dsp_device());
        dsp.load_asic_image(st, DSP_FNC_LOAD_PCI_CARD_ASIC, id)?;
        dsp.wait_asic_ready(st)?;
        st.asic_code = Some(id);

        // 48.0 kHz, internal clock, S/PDIF over coaxial interface.
        write_control_reg(dsp, st, GML_CONVERTER_ENABLE | GML_48KHZ, true)
    }

    fn set_sample_rate<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        rate: u32,
    ) -> Result<(), Error> {
        if rate >= 88200 && st.digital_mode == DigitalMode::Adat {
            let msg = format!("{} Hz is not available in ADAT mode", rate);
            Err(status_error(EchoStatusError::BadFormat, &msg))?;
        }

        let ctl = dsp.comm_page().control_register() & GML_CLOCK_CLEAR_MASK & GML_SPDIF_RATE_CLEAR_MASK;
        let clock = rate_clock_bits(rate, ctl).ok_or_else(|| {
            let msg = format!("{} Hz is not supported", rate);
            status_error(EchoStatusError::InvalidParam, &msg)
        })?;

        dsp.comm_page().set_sample_rate(rate);
        write_control_reg(dsp, st, ctl | clock, false)
    }

    fn set_input_clock<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        clock: InputClock,
    ) -> Result<(), Error> {
        let ctl = dsp.comm_page().control_register() & GML_CLOCK_CLEAR_MASK;
        let status = dsp.comm_page().status_clocks();

        let ctl = match clock {
            InputClock::Internal => {
                let rate = st.sample_rate;
                return Self::set_sample_rate(dsp, st, rate);
            }
            InputClock::Spdif => {
                if st.digital_mode == DigitalMode::Adat {
                    let msg = "S/PDIF clock is not available in ADAT mode";
                    Err(status_error(EchoStatusError::ClockNotAvailable, msg))?;
                }
                if status & GML_CLOCK_DETECT_BIT_SPDIF96 > 0 {
                    ctl | GML_SPDIF_CLOCK | GML_DOUBLE_SPEED_MODE
                } else {
                    (ctl | GML_SPDIF_CLOCK) & !GML_DOUBLE_SPEED_MODE
                }
            }
            InputClock::Adat => {
                if st.digital_mode != DigitalMode::Adat {
                    let msg = "ADAT clock is available in ADAT mode only";
                    Err(status_error(EchoStatusError::ClockNotAvailable, msg))?;
                }
                (ctl | GML_ADAT_CLOCK) & !GML_DOUBLE_SPEED_MODE
            }
            InputClock::Esync => (ctl | GML_ESYNC_CLOCK) & !GML_DOUBLE_SPEED_MODE,
            InputClock::Esync96 => ctl | GML_ESYNC_CLOCK | GML_DOUBLE_SPEED_MODE,
            _ => {
                let msg = format!("{:?} clock is not supported", clock);
                Err(status_error(EchoStatusError::ClockNotSupported, &msg))?
            }
        };

        write_control_reg(dsp, st, ctl, true)
    }

    fn set_digital_mode<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        mode: DigitalMode,
    ) -> Result<(), Error> {
        write_digital_mode(dsp, st, mode)
    }

    fn detect_input_clocks(status: u32, _: &DspState) -> InputClockMask {
        detect_input_clocks(status)
    }

    fn set_professional_spdif<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        enable: bool,
    ) -> Result<(), Error> {
        set_professional_spdif(dsp, st, enable)
    }

    fn set_spdif_out_non_audio<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        enable: bool,
    ) -> Result<(), Error> {
        set_spdif_out_non_audio(dsp, st, enable)
    }
}
