// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol specific to Echo Digital Audio Layla24.
//!
//! The module includes structure, enumeration, and trait and its implementation for protocol
//! defined by Echo Digital Audio for Layla24.
//!
//! The card has one ASIC on PCI card and another ASIC in the external box. The latter has two
//! images; one for S/PDIF and another for ADAT. Any rate between 8.0 and 100.0 kHz is
//! available by frequency register of the external box.

use {
    super::{dsp::*, firmware::*, gml::*, os_support::*, *},
    tracing::{debug, warn},
};

// Continuous clock driven by the frequency register.
const LAYLA24_CONTINUOUS_CLOCK: u32 = 0x000e;

const LAYLA24_MAGIC_NUMBER: u32 = 677376000;
const LAYLA24_MIN_BASE_RATE: u32 = 25000;

/// The protocol implementation for Layla24.
#[derive(Default, Debug)]
pub struct Layla24Protocol;

impl EchoCardSpecification for Layla24Protocol {
    const CARD_TYPE: CardType = CardType::Layla24;
    const CARD_NAME: &'static str = "Layla24";

    const ANALOG_OUTPUT_COUNT: usize = 8;
    const DIGITAL_OUTPUT_COUNT: usize = 8;
    const ANALOG_INPUT_COUNT: usize = 8;
    const DIGITAL_INPUT_COUNT: usize = 8;
    const MIDI_PORT_COUNT: usize = 1;

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

    const SAMPLE_RATES: SampleRateSupport = SampleRateSupport::Continuous {
        min: 8000,
        max: 100000,
    };

    const LATENCY: LatencySpec = GML_LATENCY;

    const HAS_DIGITAL_INPUT_AUTO_MUTE: bool = true;
}

/// The value of frequency register for the rate, and whether double speed mode is required.
pub(crate) fn layla24_frequency_register(rate: u32) -> (u32, bool) {
    let (base, double_speed) = if rate > SINGLE_SPEED_MAX_RATE {
        (rate / 2, true)
    } else {
        (rate, false)
    };
    let base = base.max(LAYLA24_MIN_BASE_RATE);
    (LAYLA24_MAGIC_NUMBER / base - 2, double_speed)
}

impl DspModelOperation for Layla24Protocol {
    fn card_spec(_: DspDevice) -> CardSpec {
        Self::SPEC
    }

    fn dsp_code(_: DspDevice) -> FirmwareId {
        FirmwareId::Layla24Dsp
    }

    fn load_asic<O: OsSupport>(dsp: &DspCommObject<O>, st: &mut DspState) -> Result<(), Error> {
        if st.asic_loaded {
            return Ok(());
        }

        dsp.load_asic_image(st, DSP_FNC_LOAD_PCI_CARD_ASIC, FirmwareId::Layla24Asic1)?;
        dsp.os().snooze(10000);

        // The image for S/PDIF at first.
        dsp.load_asic_image(st, DSP_FNC_LOAD_EXTERNAL_ASIC, FirmwareId::Layla24Asic2S)?;
        dsp.wait_asic_ready(st)?;
        st.asic_code = Some(FirmwareId::Layla24Asic2S);

        write_control_reg(dsp, st, GML_CONVERTER_ENABLE | GML_48KHZ, true)
    }

    fn set_sample_rate<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        rate: u32,
    ) -> Result<(), Error> {
        if rate > SINGLE_SPEED_MAX_RATE && st.digital_mode == DigitalMode::Adat {
            let msg = format!("{} Hz is not available in ADAT mode", rate);
            Err(status_error(EchoStatusError::BadFormat, &msg))?;
        }

        let mut ctl =
            dsp.comm_page().control_register() & GML_CLOCK_CLEAR_MASK & GML_SPDIF_RATE_CLEAR_MASK;

        match rate_clock_bits(rate, ctl) {
            Some(clock) => ctl |= clock,
            None => {
                let (freq, double_speed) = layla24_frequency_register(rate);
                if double_speed {
                    ctl |= GML_DOUBLE_SPEED_MODE;
                }
                ctl |= LAYLA24_CONTINUOUS_CLOCK;

                dsp.wait_for_handshake()?;
                dsp.comm_page().set_sample_rate(freq);
                dsp.clear_handshake();
                dsp.send_vector(DSP_VC_SET_LAYLA24_FREQUENCY_REG)?;
                dsp.wait_for_handshake()?;
                debug!(rate, freq, "frequency register");
            }
        }

        dsp.comm_page().set_sample_rate(rate);
        write_control_reg(dsp, st, ctl, false)
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
                // Layla24 does not run at double speed with S/PDIF clock.
                (ctl | GML_SPDIF_CLOCK) & !GML_DOUBLE_SPEED_MODE
            }
            InputClock::Word => {
                if status & GML_CLOCK_DETECT_BIT_WORD96 > 0 {
                    ctl | GML_WORD_CLOCK | GML_DOUBLE_SPEED_MODE
                } else {
                    (ctl | GML_WORD_CLOCK) & !GML_DOUBLE_SPEED_MODE
                }
            }
            InputClock::Adat => {
                if st.digital_mode != DigitalMode::Adat {
                    let msg = "ADAT clock is available in ADAT mode only";
                    Err(status_error(EchoStatusError::ClockNotAvailable, msg))?;
                }
                (ctl | GML_ADAT_CLOCK) & !GML_DOUBLE_SPEED_MODE
            }
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
        let asic = if mode == DigitalMode::Adat {
            FirmwareId::Layla24Asic2A
        } else {
            FirmwareId::Layla24Asic2S
        };
        let former = st.asic_code;
        let switched = dsp.switch_asic(st, DSP_FNC_LOAD_EXTERNAL_ASIC, asic)?;

        write_digital_mode(dsp, st, mode).map_err(|e| {
            if let (true, Some(id)) = (switched, former) {
                if let Err(err) = dsp.switch_asic(st, DSP_FNC_LOAD_EXTERNAL_ASIC, id) {
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

#[cfg(test)]
mod test {
    use {super::*, crate::emulator::*};

    #[test]
    fn frequency_register() {
        assert_eq!(layla24_frequency_register(44000), (677376000 / 44000 - 2, false));
        assert_eq!(layla24_frequency_register(90000), (677376000 / 45000 - 2, true));
        // The base rate is clamped.
        assert_eq!(layla24_frequency_register(8000), (677376000 / 25000 - 2, false));
    }

    #[test]
    fn continuous_rate() {
        let os = EmulatedCard::new(CardType::Layla24, DspDevice::Dsp56301);
        let dsp = DspCommObject::new(CardType::Layla24, &os).unwrap();
        dsp.load_firmware().unwrap();

        os.clear_logs();
        assert_eq!(dsp.set_sample_rate(Some(44000)).unwrap(), 44000);
        assert_eq!(os.frequency_commands(), vec![677376000 / 44000 - 2]);
        assert_eq!(dsp.comm_page().sample_rate(), 44000);
        assert_eq!(
            os.control_register() & !GML_CLOCK_CLEAR_MASK,
            LAYLA24_CONTINUOUS_CLOCK
        );

        os.clear_logs();
        dsp.set_sample_rate(Some(96000)).unwrap();
        assert!(os.frequency_commands().is_empty());
        assert_eq!(os.control_register() & !GML_CLOCK_CLEAR_MASK, GML_96KHZ);

        let err = dsp.set_sample_rate(Some(100001)).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidParam));
    }

    #[test]
    fn digital_mode_switches_asic() {
        let os = EmulatedCard::new(CardType::Layla24, DspDevice::Dsp56361);
        let dsp = DspCommObject::new(CardType::Layla24, &os).unwrap();
        dsp.load_firmware().unwrap();
        assert_eq!(
            os.active_asic(PCI_CARD_ASIC_SLOT),
            Some(FirmwareId::Layla24Asic1)
        );
        assert_eq!(
            os.active_asic(EXTERNAL_ASIC_SLOT),
            Some(FirmwareId::Layla24Asic2S)
        );

        dsp.set_sample_rate(Some(96000)).unwrap();
        dsp.set_digital_mode(DigitalMode::Adat).unwrap();
        assert_eq!(
            os.active_asic(EXTERNAL_ASIC_SLOT),
            Some(FirmwareId::Layla24Asic2A)
        );
        assert_eq!(dsp.sample_rate().unwrap(), 48000);
        assert_eq!(os.control_register() & GML_ADAT_MODE, GML_ADAT_MODE);

        os.set_detected_clocks(GML_CLOCK_DETECT_BIT_WORD96);
        dsp.set_input_clock(InputClock::Word).unwrap();
        let ctl = os.control_register();
        assert_eq!(
            ctl & !GML_CLOCK_CLEAR_MASK,
            GML_WORD_CLOCK | GML_DOUBLE_SPEED_MODE
        );

        // Word clock is still available in S/PDIF mode.
        dsp.set_digital_mode(DigitalMode::SpdifOptical).unwrap();
        assert_eq!(dsp.input_clock().unwrap(), InputClock::Word);
        assert_eq!(
            os.active_asic(EXTERNAL_ASIC_SLOT),
            Some(FirmwareId::Layla24Asic2S)
        );
    }

    #[test]
    fn asic_timeout_at_switch() {
        let os = EmulatedCard::new(CardType::Layla24, DspDevice::Dsp56301);
        let dsp = DspCommObject::new(CardType::Layla24, &os).unwrap();
        dsp.load_firmware().unwrap();

        os.set_asic_ready_polls(None);
        let err = dsp.set_digital_mode(DigitalMode::Adat).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::AsicNotLoaded));
        assert_eq!(dsp.digital_mode().unwrap(), DigitalMode::SpdifRca);
        assert_eq!(dsp.asic_code(), Some(FirmwareId::Layla24Asic2S));
        assert!(!dsp.is_asic_loaded());
    }
}
