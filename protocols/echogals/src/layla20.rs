// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol specific to Echo Digital Audio Layla20.
//!
//! The module includes structure, enumeration, and trait and its implementation for protocol
//! defined by Echo Digital Audio for Layla20.
//!
//! The card has 20 bit converters in the external box, and runs at single speed. The clock
//! source is selected by the fields in communication page instead of control register. Both
//! word clock and Super clock are available at output side as well.

use super::{dsp::*, firmware::*, os_support::*, *};

const LAYLA20_INPUT_CLOCK_INTERNAL: u16 = 0;
const LAYLA20_INPUT_CLOCK_SPDIF: u16 = 1;
const LAYLA20_INPUT_CLOCK_WORD: u16 = 2;
const LAYLA20_INPUT_CLOCK_SUPER: u16 = 3;

const LAYLA20_OUTPUT_CLOCK_SUPER: u16 = 0;
const LAYLA20_OUTPUT_CLOCK_WORD: u16 = 1;

pub(crate) const GLDM_CLOCK_DETECT_BIT_WORD: u32 = 0x0002;
pub(crate) const GLDM_CLOCK_DETECT_BIT_SUPER: u32 = 0x0004;
pub(crate) const GLDM_CLOCK_DETECT_BIT_SPDIF: u32 = 0x0008;

// The ASIC answers intermittently just after loaded.
const LAYLA20_ASIC_TEST_COUNT: usize = 5;
const LAYLA20_ASIC_GOOD_COUNT: usize = 3;

/// The protocol implementation for Layla20.
#[derive(Default, Debug)]
pub struct Layla20Protocol;

impl EchoCardSpecification for Layla20Protocol {
    const CARD_TYPE: CardType = CardType::Layla20;
    const CARD_NAME: &'static str = "Layla20";

    const ANALOG_OUTPUT_COUNT: usize = 10;
    const DIGITAL_OUTPUT_COUNT: usize = 2;
    const ANALOG_INPUT_COUNT: usize = 8;
    const DIGITAL_INPUT_COUNT: usize = 2;
    const MIDI_PORT_COUNT: usize = 1;

    const INPUT_CLOCKS: &'static [InputClock] = &[
        InputClock::Internal,
        InputClock::Spdif,
        InputClock::Word,
        InputClock::Super,
    ];

    const OUTPUT_CLOCKS: &'static [OutputClock] = &[OutputClock::Word, OutputClock::Super];

    const SAMPLE_RATES: SampleRateSupport = SampleRateSupport::Continuous {
        min: 8000,
        max: 50000,
    };

    const LATENCY: LatencySpec = LatencySpec {
        analog_output_1x: 1 + 32 + 12,
        analog_output_2x: 1 + 32 + 12,
        analog_input_1x: 1 + 32 + 12,
        analog_input_2x: 1 + 32 + 12,
        digital_output: 1 + 32,
        digital_input: 1 + 32,
    };
}

impl DspModelOperation for Layla20Protocol {
    fn card_spec(_: DspDevice) -> CardSpec {
        Self::SPEC
    }

    fn dsp_code(_: DspDevice) -> FirmwareId {
        FirmwareId::Layla20Dsp
    }

    fn load_asic<O: OsSupport>(dsp: &DspCommObject<O>, st: &mut DspState) -> Result<(), Error> {
        if st.asic_loaded {
            return Ok(());
        }

        dsp.load_asic_image(st, DSP_FNC_LOAD_PCI_CARD_ASIC, FirmwareId::Layla20Asic)?;
        dsp.wait_asic_ready(st)?;
        st.asic_code = Some(FirmwareId::Layla20Asic);

        Ok(())
    }

    fn check_asic_status<O: OsSupport>(dsp: &DspCommObject<O>, st: &mut DspState) -> bool {
        let good = (0..LAYLA20_ASIC_TEST_COUNT)
            .filter(|_| dsp.test_asic(st))
            .count();
        st.asic_loaded = good >= LAYLA20_ASIC_GOOD_COUNT;
        st.asic_loaded
    }

    fn set_sample_rate<O: OsSupport>(
        dsp: &DspCommObject<O>,
        _: &mut DspState,
        rate: u32,
    ) -> Result<(), Error> {
        dsp.wait_for_handshake()?;
        dsp.comm_page().set_sample_rate(rate);
        dsp.clear_handshake();
        dsp.send_vector(DSP_VC_SET_LAYLA_SAMPLE_RATE)
    }

    fn set_input_clock<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        clock: InputClock,
    ) -> Result<(), Error> {
        let val = match clock {
            InputClock::Internal => LAYLA20_INPUT_CLOCK_INTERNAL,
            InputClock::Spdif => LAYLA20_INPUT_CLOCK_SPDIF,
            InputClock::Word => LAYLA20_INPUT_CLOCK_WORD,
            InputClock::Super => LAYLA20_INPUT_CLOCK_SUPER,
            _ => {
                let msg = format!("{:?} clock is not supported", clock);
                Err(status_error(EchoStatusError::ClockNotSupported, &msg))?
            }
        };

        dsp.wait_for_handshake()?;
        dsp.comm_page().set_input_clock(val);
        dsp.clear_handshake();
        dsp.send_vector(DSP_VC_UPDATE_CLOCKS)?;

        if clock == InputClock::Internal {
            let rate = st.sample_rate;
            Self::set_sample_rate(dsp, st, rate)?;
        }

        Ok(())
    }

    fn set_output_clock<O: OsSupport>(
        dsp: &DspCommObject<O>,
        _: &mut DspState,
        clock: OutputClock,
    ) -> Result<(), Error> {
        let val = match clock {
            OutputClock::Super => LAYLA20_OUTPUT_CLOCK_SUPER,
            OutputClock::Word => LAYLA20_OUTPUT_CLOCK_WORD,
        };

        dsp.wait_for_handshake()?;
        dsp.comm_page().set_output_clock(val);
        dsp.clear_handshake();
        dsp.send_vector(DSP_VC_UPDATE_CLOCKS)
    }

    fn detect_input_clocks(status: u32, _: &DspState) -> InputClockMask {
        let mut mask = InputClockMask::default();
        if status & GLDM_CLOCK_DETECT_BIT_SPDIF > 0 {
            mask.insert(InputClock::Spdif);
        }
        // Super clock is detected as a kind of word clock.
        if status & GLDM_CLOCK_DETECT_BIT_WORD > 0 {
            if status & GLDM_CLOCK_DETECT_BIT_SUPER > 0 {
                mask.insert(InputClock::Super);
            } else {
                mask.insert(InputClock::Word);
            }
        }
        mask
    }
}
