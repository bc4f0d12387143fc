// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol specific to Echo Digital Audio Mona.
//!
//! The module includes structure, enumeration, and trait and its implementation for protocol
//! defined by Echo Digital Audio for Mona.
//!
//! The ASIC on PCI card has two images; one for rates up to 48.0 kHz and another for double
//! speed. The image is switched at the change of sampling rate or external clock. The external
//! box has the other ASIC.

use {
    super::{dsp::*, firmware::*, gml::*, os_support::*, *},
    tracing::warn,
};

/// The protocol implementation for Mona.
#[derive(Default, Debug)]
pub struct MonaProtocol;

impl EchoCardSpecification for MonaProtocol {
    const CARD_TYPE: CardType = CardType::Mona;
    const CARD_NAME: &'static str = "Mona";

    const ANALOG_OUTPUT_COUNT: usize = 6;
    const DIGITAL_OUTPUT_COUNT: usize = 8;
    const ANALOG_INPUT_COUNT: usize = 4;
    const DIGITAL_INPUT_COUNT: usize = 8;

    const INPUT_CLOCKS: &'static [InputClock] = &[
        InputClock::Internal,
        InputClock::Spdif,
        InputClock::Word,
        InputClock::Adat,
    ];

    const DIGITAL_MODES: &'static [DigitalMode] = &[
        DigitalMode::SpdifRca,
        DigitalMode::SpdifOptical,
        DigitalMode::Adat,
    ];

    const SAMPLE_RATES: SampleRateSupport = SampleRateSupport::Discrete(DISCRETE_RATES);

    const LATENCY: LatencySpec = GML_LATENCY;

    const HAS_DIGITAL_INPUT_AUTO_MUTE: bool = true;
}

impl MonaProtocol {
    fn pci_card_asic(device: DspDevice, double_speed: bool) -> FirmwareId {
        match (device, double_speed) {
            (DspDevice::Dsp56301, false) => FirmwareId::MonaAsic301Rate48,
            (DspDevice::Dsp56301, true) => FirmwareId::MonaAsic301Rate96,
            (DspDevice::Dsp56361, false) => FirmwareId::MonaAsic361Rate48,
            (DspDevice::Dsp56361, true) => FirmwareId::MonaAsic361Rate96,
        }
    }

    // The returned value is true if the image is transferred.
    fn switch_pci_card_asic<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        double_speed: bool,
    ) -> Result<bool, Error> {
        let id = Self::pci_card_asic(dsp.dsp_device(), double_speed);
        dsp.switch_asic(st, DSP_FNC_LOAD_PCI_CARD_ASIC, id)
    }
}

impl DspModelOperation for MonaProtocol {
    fn card_spec(_: DspDevice) -> CardSpec {
        Self::SPEC
    }

    fn dsp_code(device: DspDevice) -> FirmwareId {
        match device {
            DspDevice::Dsp56301 => FirmwareId::MonaDsp301,
            DspDevice::Dsp56361 => FirmwareId::MonaDsp361,
        }
    }

    fn load_asic<O: OsSupport>(dsp: &DspCommObject<O>, st: &mut DspState) -> Result<(), Error> {
        if st.asic_loaded {
            return Ok(());
        }

        let id = Self::pci_card_asic(dsp.dsp_device(), false);
        dsp.load_asic_image(st, DSP_FNC_LOAD_PCI_CARD_ASIC, id)?;
        dsp.os().snooze(10000);

        dsp.load_asic_image(st, DSP_FNC_LOAD_EXTERNAL_ASIC, FirmwareId::MonaAsic2)?;
        dsp.wait_asic_ready(st)?;
        st.asic_code = Some(id);

        write_control_reg(dsp, st, GML_CONVERTER_ENABLE | GML_48KHZ, true)
    }

    fn set_sample_rate<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        rate: u32,
    ) -> Result<(), Error> {
        let double_speed = rate >= 88200;
        if double_speed && st.digital_mode == DigitalMode::Adat {
            let msg = format!("{} Hz is not available in ADAT mode", rate);
            Err(status_error(EchoStatusError::BadFormat, &msg))?;
        }

        let ctl = dsp.comm_page().control_register() & GML_CLOCK_CLEAR_MASK & GML_SPDIF_RATE_CLEAR_MASK;
        let clock = rate_clock_bits(rate, ctl).ok_or_else(|| {
            let msg = format!("{} Hz is not supported", rate);
            status_error(EchoStatusError::InvalidParam, &msg)
        })?;

        let force = Self::switch_pci_card_asic(dsp, st, double_speed)?;

        dsp.comm_page().set_sample_rate(rate);
        write_control_reg(dsp, st, ctl | clock, force)
    }

    fn set_input_clock<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        clock: InputClock,
    ) -> Result<(), Error> {
        let status = dsp.comm_page().status_clocks();

        let (bits, double_speed) = match clock {
            InputClock::Internal => {
                let rate = st.sample_rate;
                return Self::set_sample_rate(dsp, st, rate);
            }
            InputClock::Spdif => {
                if st.digital_mode == DigitalMode::Adat {
                    let msg = "S/PDIF clock is not available in ADAT mode";
                    Err(status_error(EchoStatusError::ClockNotAvailable, msg))?;
                }
                (GML_SPDIF_CLOCK, status & GML_CLOCK_DETECT_BIT_SPDIF96 > 0)
            }
            InputClock::Word => (GML_WORD_CLOCK, status & GML_CLOCK_DETECT_BIT_WORD96 > 0),
            InputClock::Adat => {
                if st.digital_mode != DigitalMode::Adat {
                    let msg = "ADAT clock is available in ADAT mode only";
                    Err(status_error(EchoStatusError::ClockNotAvailable, msg))?;
                }
                (GML_ADAT_CLOCK, false)
            }
            _ => {
                let msg = format!("{:?} clock is not supported", clock);
                Err(status_error(EchoStatusError::ClockNotSupported, &msg))?
            }
        };

        Self::switch_pci_card_asic(dsp, st, double_speed)?;

        let ctl = dsp.comm_page().control_register() & GML_CLOCK_CLEAR_MASK;
        let ctl = if double_speed {
            ctl | bits | GML_DOUBLE_SPEED_MODE
        } else {
            (ctl | bits) & !GML_DOUBLE_SPEED_MODE
        };

        write_control_reg(dsp, st, ctl, true)
    }

    fn set_digital_mode<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        mode: DigitalMode,
    ) -> Result<(), Error> {
        let (clock, rate) = digital_mode_clock(st, mode);

        // ADAT is not available with the image for double speed.
        let double_speed = if !clock.is_external() {
            Some(rate > SINGLE_SPEED_MAX_RATE)
        } else if mode == DigitalMode::Adat {
            Some(false)
        } else {
            None
        };

        let former = st.asic_code;
        let switched = match double_speed {
            Some(double_speed) => Self::switch_pci_card_asic(dsp, st, double_speed)?,
            None => false,
        };

        write_digital_mode(dsp, st, mode).map_err(|e| {
            if let (true, Some(id)) = (switched, former) {
                if let Err(err) = dsp.switch_asic(st, DSP_FNC_LOAD_PCI_CARD_ASIC, id) {
                    warn!(?id, "Fail to restore ASIC: {}", err);
                }
            }
            e
        })
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
