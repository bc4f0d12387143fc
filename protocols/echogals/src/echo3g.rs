// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol specific to Echo Digital Audio 3G series.
//!
//! The module includes structure, enumeration, and trait and its implementation for protocol
//! defined by Echo Digital Audio for 3G series.
//!
//! The PCI card is common in the series. The type of external box is detected after the ASIC
//! is loaded, then the capabilities are decided by the box; Gina3G or Layla3G. The rate is
//! continuous by frequency register, which is written together with control register.
//!
//! ```text
//! 3G PCI card <-> external box
//!                   Gina3G: 6 analog outputs, 4 analog inputs with phantom power
//!                   Layla3G: 8 analog outputs, 8 analog inputs, word clock, MIDI
//! ```

use {
    super::{dsp::*, firmware::*, os_support::*, *},
    tracing::debug,
};

pub(crate) const E3G_SPDIF_PRO_MODE: u32 = 0x00000020;
pub(crate) const E3G_SPDIF_SAMPLE_RATE0: u32 = 0x00000040;
pub(crate) const E3G_SPDIF_SAMPLE_RATE1: u32 = 0x00000080;
pub(crate) const E3G_SPDIF_TWO_CHANNEL: u32 = 0x00000100;
pub(crate) const E3G_SPDIF_NOT_AUDIO: u32 = 0x00000200;
pub(crate) const E3G_SPDIF_COPY_PERMIT: u32 = 0x00000400;
pub(crate) const E3G_SPDIF_24_BIT: u32 = 0x00000800;
pub(crate) const E3G_ADAT_MODE: u32 = 0x00001000;
pub(crate) const E3G_SPDIF_OPTICAL_MODE: u32 = 0x00002000;
pub(crate) const E3G_DOUBLE_SPEED_MODE: u32 = 0x00004000;
pub(crate) const E3G_PHANTOM_POWER: u32 = 0x00008000;

pub(crate) const E3G_32KHZ: u32 = 0x0;
pub(crate) const E3G_44KHZ: u32 = 0x1;
pub(crate) const E3G_48KHZ: u32 = 0x2;
pub(crate) const E3G_88KHZ: u32 = 0x1 | E3G_DOUBLE_SPEED_MODE;
pub(crate) const E3G_96KHZ: u32 = 0x2 | E3G_DOUBLE_SPEED_MODE;
pub(crate) const E3G_SPDIF_CLOCK: u32 = 0x4;
pub(crate) const E3G_ADAT_CLOCK: u32 = 0x5;
pub(crate) const E3G_WORD_CLOCK: u32 = 0x6;
pub(crate) const E3G_CONTINUOUS_CLOCK: u32 = 0xe;

pub(crate) const E3G_CLOCK_CLEAR_MASK: u32 = 0xbfffbff0;
pub(crate) const E3G_DIGITAL_MODE_CLEAR_MASK: u32 = 0xffffcfff;
pub(crate) const E3G_SPDIF_FORMAT_CLEAR_MASK: u32 = 0xfffff01f;

pub(crate) const E3G_CLOCK_DETECT_BIT_WORD96: u32 = 0x0001;
pub(crate) const E3G_CLOCK_DETECT_BIT_WORD48: u32 = 0x0002;
pub(crate) const E3G_CLOCK_DETECT_BIT_SPDIF48: u32 = 0x0004;
pub(crate) const E3G_CLOCK_DETECT_BIT_ADAT: u32 = 0x0008;
pub(crate) const E3G_CLOCK_DETECT_BIT_SPDIF96: u32 = 0x0010;
pub(crate) const E3G_CLOCK_DETECT_BIT_WORD: u32 =
    E3G_CLOCK_DETECT_BIT_WORD96 | E3G_CLOCK_DETECT_BIT_WORD48;
pub(crate) const E3G_CLOCK_DETECT_BIT_SPDIF: u32 =
    E3G_CLOCK_DETECT_BIT_SPDIF48 | E3G_CLOCK_DETECT_BIT_SPDIF96;

pub(crate) const E3G_MAGIC_NUMBER: u32 = 677376000;
pub(crate) const E3G_FREQ_REG_DEFAULT: u32 = E3G_MAGIC_NUMBER / 48000 - 2;
pub(crate) const E3G_FREQ_REG_MAX: u32 = 0xffff;
const E3G_MIN_BASE_RATE: u32 = 32000;

pub(crate) const E3G_ASIC_NOT_LOADED: u32 = 0xffff;
pub(crate) const E3G_BOX_TYPE_MASK: u32 = 0xf0;
pub(crate) const E3G_GINA3G_BOX_TYPE: u32 = 0x00;
pub(crate) const E3G_LAYLA3G_BOX_TYPE: u32 = 0x10;

/// The type of external box connected to 3G PCI card.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Echo3gBoxType {
    Gina3g,
    Layla3g,
}

impl Echo3gBoxType {
    /// The static data of model with the box.
    pub fn spec(&self) -> CardSpec {
        match self {
            Self::Gina3g => Gina3gProtocol::SPEC,
            Self::Layla3g => Layla3gProtocol::SPEC,
        }
    }
}

pub(crate) fn serialize_box_type(box_type: &Echo3gBoxType) -> u32 {
    match box_type {
        Echo3gBoxType::Gina3g => E3G_GINA3G_BOX_TYPE,
        Echo3gBoxType::Layla3g => E3G_LAYLA3G_BOX_TYPE,
    }
}

pub(crate) fn deserialize_box_type(box_type: &mut Echo3gBoxType, val: u32) -> Result<(), Error> {
    *box_type = match val & E3G_BOX_TYPE_MASK {
        E3G_GINA3G_BOX_TYPE => Echo3gBoxType::Gina3g,
        E3G_LAYLA3G_BOX_TYPE => Echo3gBoxType::Layla3g,
        _ => {
            let msg = format!("Unexpected type of external box: 0x{:04x}", val);
            Err(status_error(EchoStatusError::AsicNotLoaded, &msg))?
        }
    };
    Ok(())
}

const E3G_LATENCY: LatencySpec = LatencySpec {
    analog_output_1x: 1 + 32 + 12,
    analog_output_2x: 1 + 32 + 5,
    analog_input_1x: 1 + 32 + 12,
    analog_input_2x: 1 + 32 + 9,
    digital_output: 1 + 32,
    digital_input: 1 + 32,
};

const E3G_DIGITAL_MODES: &[DigitalMode] = &[
    DigitalMode::SpdifRca,
    DigitalMode::SpdifOptical,
    DigitalMode::Adat,
];

const E3G_SAMPLE_RATES: SampleRateSupport = SampleRateSupport::Continuous {
    min: 32000,
    max: 100000,
};

/// The specification of 3G PCI card with Gina3G box.
#[derive(Default, Debug)]
pub struct Gina3gProtocol;

impl EchoCardSpecification for Gina3gProtocol {
    const CARD_TYPE: CardType = CardType::Echo3g;
    const CARD_NAME: &'static str = "Gina3G";

    const ANALOG_OUTPUT_COUNT: usize = 6;
    const DIGITAL_OUTPUT_COUNT: usize = 8;
    const ANALOG_INPUT_COUNT: usize = 4;
    const DIGITAL_INPUT_COUNT: usize = 8;

    const INPUT_CLOCKS: &'static [InputClock] =
        &[InputClock::Internal, InputClock::Spdif, InputClock::Adat];

    const DIGITAL_MODES: &'static [DigitalMode] = E3G_DIGITAL_MODES;

    const SAMPLE_RATES: SampleRateSupport = E3G_SAMPLE_RATES;

    const LATENCY: LatencySpec = E3G_LATENCY;

    const HAS_PHANTOM_POWER: bool = true;
}

/// The specification of 3G PCI card with Layla3G box.
#[derive(Default, Debug)]
pub struct Layla3gProtocol;

impl EchoCardSpecification for Layla3gProtocol {
    const CARD_TYPE: CardType = CardType::Echo3g;
    const CARD_NAME: &'static str = "Layla3G";

    const ANALOG_OUTPUT_COUNT: usize = 8;
    const DIGITAL_OUTPUT_COUNT: usize = 8;
    const ANALOG_INPUT_COUNT: usize = 8;
    const DIGITAL_INPUT_COUNT: usize = 8;
    const MIDI_PORT_COUNT: usize = 1;

    const INPUT_CLOCKS: &'static [InputClock] = &[
        InputClock::Internal,
        InputClock::Spdif,
        InputClock::Adat,
        InputClock::Word,
    ];

    const DIGITAL_MODES: &'static [DigitalMode] = E3G_DIGITAL_MODES;

    const SAMPLE_RATES: SampleRateSupport = E3G_SAMPLE_RATES;

    const LATENCY: LatencySpec = E3G_LATENCY;
}

/// The value of frequency register for the rate.
pub(crate) fn e3g_frequency_register(rate: u32) -> u32 {
    let base = if rate > SINGLE_SPEED_MAX_RATE {
        rate / 2
    } else {
        rate
    };
    let base = base.max(E3G_MIN_BASE_RATE);
    (E3G_MAGIC_NUMBER / base - 2).min(E3G_FREQ_REG_MAX)
}

/// Build S/PDIF channel status bits for the rate and the modes.
pub(crate) fn e3g_spdif_format_bits(
    ctl: u32,
    rate: u32,
    professional: bool,
    non_audio: bool,
) -> u32 {
    let mut ctl = ctl & E3G_SPDIF_FORMAT_CLEAR_MASK;
    ctl |= E3G_SPDIF_TWO_CHANNEL | E3G_SPDIF_24_BIT | E3G_SPDIF_COPY_PERMIT;

    match rate {
        32000 => ctl |= E3G_SPDIF_SAMPLE_RATE0 | E3G_SPDIF_SAMPLE_RATE1,
        44100 if professional => ctl |= E3G_SPDIF_SAMPLE_RATE0,
        48000 => ctl |= E3G_SPDIF_SAMPLE_RATE1,
        _ => (),
    }

    if professional {
        ctl |= E3G_SPDIF_PRO_MODE;
    }
    if non_audio {
        ctl |= E3G_SPDIF_NOT_AUDIO;
    }

    ctl
}

/// The values of control register and frequency register to run internal clock at the rate.
pub(crate) fn e3g_internal_clock_registers(ctl: u32, st: &DspState, rate: u32) -> (u32, u32) {
    let ctl = ctl & E3G_CLOCK_CLEAR_MASK;
    let clock = match rate {
        32000 => E3G_32KHZ,
        44100 => E3G_44KHZ,
        48000 => E3G_48KHZ,
        88200 => E3G_88KHZ,
        96000 => E3G_96KHZ,
        _ if rate > SINGLE_SPEED_MAX_RATE => E3G_CONTINUOUS_CLOCK | E3G_DOUBLE_SPEED_MODE,
        _ => E3G_CONTINUOUS_CLOCK,
    };
    let ctl = e3g_spdif_format_bits(
        ctl | clock,
        rate,
        st.professional_spdif,
        st.non_audio_spdif,
    );
    (ctl, e3g_frequency_register(rate))
}

/// Write both control register and frequency register. Nothing is done when neither is
/// changed unless forced. At failure, the registers in the page are restored.
pub(crate) fn e3g_write_control_reg<O: OsSupport>(
    dsp: &DspCommObject<O>,
    ctl: u32,
    frq: u32,
    force: bool,
) -> Result<(), Error> {
    let comm_page = dsp.comm_page();
    let old_ctl = comm_page.control_register();
    let old_frq = comm_page.e3g_frq_register();
    if force || ctl != old_ctl || frq != old_frq {
        dsp.wait_for_handshake()?;
        comm_page.set_control_register(ctl);
        comm_page.set_e3g_frq_register(frq);
        dsp.send_page_command(DSP_VC_WRITE_CONTROL_REG).map_err(|e| {
            comm_page.set_control_register(old_ctl);
            comm_page.set_e3g_frq_register(old_frq);
            e
        })?;
    }
    Ok(())
}

/// The protocol implementation for 3G PCI card.
#[derive(Default, Debug)]
pub struct Echo3gProtocol;

impl DspModelOperation for Echo3gProtocol {
    // Until the box is detected.
    fn card_spec(_: DspDevice) -> CardSpec {
        Gina3gProtocol::SPEC
    }

    fn dsp_code(_: DspDevice) -> FirmwareId {
        FirmwareId::Echo3gDsp
    }

    fn digital_modes(_: DspDevice) -> &'static [DigitalMode] {
        E3G_DIGITAL_MODES
    }

    fn load_asic<O: OsSupport>(dsp: &DspCommObject<O>, st: &mut DspState) -> Result<(), Error> {
        if st.asic_loaded {
            return Ok(());
        }

        dsp.load_asic_image(st, DSP_FNC_LOAD_PCI_CARD_ASIC, FirmwareId::Echo3gAsic)?;
        dsp.wait_asic_ready(st)?;
        st.asic_code = Some(FirmwareId::Echo3gAsic);

        e3g_write_control_reg(dsp, E3G_48KHZ, E3G_FREQ_REG_DEFAULT, true)
    }

    fn check_asic_status<O: OsSupport>(dsp: &DspCommObject<O>, st: &mut DspState) -> bool {
        st.asic_loaded = false;

        let status = dsp
            .wait_for_handshake()
            .and_then(|_| {
                dsp.comm_page().set_ext_box_status(E3G_ASIC_NOT_LOADED);
                dsp.clear_handshake();
                dsp.send_vector(DSP_VC_TEST_ASIC)
            })
            .and_then(|_| dsp.wait_for_handshake())
            .map(|_| dsp.comm_page().ext_box_status());

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                debug!("{}", e);
                return false;
            }
        };

        if status == E3G_ASIC_NOT_LOADED {
            return false;
        }

        let mut box_type = Echo3gBoxType::Gina3g;
        if let Err(e) = deserialize_box_type(&mut box_type, status) {
            debug!("{}", e);
            return false;
        }

        if st.box_type != Some(box_type) {
            debug!(?box_type, "external box detected");
            st.box_type = Some(box_type);
            st.spec = box_type.spec();
        }
        st.asic_loaded = true;

        true
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

        let (ctl, frq) = e3g_internal_clock_registers(dsp.comm_page().control_register(), st, rate);

        dsp.comm_page().set_sample_rate(rate);
        e3g_write_control_reg(dsp, ctl, frq, false)
    }

    fn set_input_clock<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        clock: InputClock,
    ) -> Result<(), Error> {
        let ctl = dsp.comm_page().control_register() & E3G_CLOCK_CLEAR_MASK;
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
                if status & E3G_CLOCK_DETECT_BIT_SPDIF96 > 0 {
                    ctl | E3G_SPDIF_CLOCK | E3G_DOUBLE_SPEED_MODE
                } else {
                    ctl | E3G_SPDIF_CLOCK
                }
            }
            InputClock::Adat => {
                if st.digital_mode != DigitalMode::Adat {
                    let msg = "ADAT clock is available in ADAT mode only";
                    Err(status_error(EchoStatusError::ClockNotAvailable, msg))?;
                }
                ctl | E3G_ADAT_CLOCK
            }
            InputClock::Word => {
                if status & E3G_CLOCK_DETECT_BIT_WORD96 > 0 {
                    ctl | E3G_WORD_CLOCK | E3G_DOUBLE_SPEED_MODE
                } else {
                    ctl | E3G_WORD_CLOCK
                }
            }
            _ => {
                let msg = format!("{:?} clock is not supported", clock);
                Err(status_error(EchoStatusError::ClockNotSupported, &msg))?
            }
        };

        let frq = dsp.comm_page().e3g_frq_register();
        e3g_write_control_reg(dsp, ctl, frq, true)
    }

    fn set_digital_mode<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        mode: DigitalMode,
    ) -> Result<(), Error> {
        let incompatible = match mode {
            DigitalMode::Adat => st.input_clock == InputClock::Spdif,
            _ => st.input_clock == InputClock::Adat,
        };
        let (clock, rate) = if incompatible {
            (InputClock::Internal, 48000)
        } else if mode == DigitalMode::Adat && st.sample_rate > SINGLE_SPEED_MAX_RATE {
            (st.input_clock, 48000)
        } else {
            (st.input_clock, st.sample_rate)
        };

        let ctl = dsp.comm_page().control_register();
        let frq = dsp.comm_page().e3g_frq_register();
        let (ctl, frq) =
            if clock.is_external() || (clock == st.input_clock && rate == st.sample_rate) {
                (ctl, frq)
            } else {
                e3g_internal_clock_registers(ctl, st, rate)
            };

        let ctl = ctl & E3G_DIGITAL_MODE_CLEAR_MASK;
        let ctl = match mode {
            DigitalMode::SpdifOptical => ctl | E3G_SPDIF_OPTICAL_MODE,
            DigitalMode::Adat => (ctl | E3G_ADAT_MODE) & !E3G_DOUBLE_SPEED_MODE,
            _ => ctl,
        };

        let old_rate = dsp.comm_page().sample_rate();
        dsp.comm_page().set_sample_rate(rate);
        if let Err(e) = e3g_write_control_reg(dsp, ctl, frq, true) {
            dsp.comm_page().set_sample_rate(old_rate);
            return Err(e);
        }

        st.input_clock = clock;
        st.sample_rate = rate;

        Ok(())
    }

    fn detect_input_clocks(status: u32, st: &DspState) -> InputClockMask {
        let mut mask = InputClockMask::default();
        if status & E3G_CLOCK_DETECT_BIT_WORD > 0 {
            mask.insert(InputClock::Word);
        }
        match st.digital_mode {
            DigitalMode::Adat => {
                if status & E3G_CLOCK_DETECT_BIT_ADAT > 0 {
                    mask.insert(InputClock::Adat);
                }
            }
            _ => {
                if status & E3G_CLOCK_DETECT_BIT_SPDIF > 0 {
                    mask.insert(InputClock::Spdif);
                }
            }
        }
        mask
    }

    fn set_professional_spdif<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        enable: bool,
    ) -> Result<(), Error> {
        let ctl = e3g_spdif_format_bits(
            dsp.comm_page().control_register(),
            st.sample_rate,
            enable,
            st.non_audio_spdif,
        );
        let frq = dsp.comm_page().e3g_frq_register();
        e3g_write_control_reg(dsp, ctl, frq, false)
    }

    fn set_spdif_out_non_audio<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        enable: bool,
    ) -> Result<(), Error> {
        let ctl = e3g_spdif_format_bits(
            dsp.comm_page().control_register(),
            st.sample_rate,
            st.professional_spdif,
            enable,
        );
        let frq = dsp.comm_page().e3g_frq_register();
        e3g_write_control_reg(dsp, ctl, frq, false)
    }

    fn set_phantom_power<O: OsSupport>(
        dsp: &DspCommObject<O>,
        _: &mut DspState,
        on: bool,
    ) -> Result<(), Error> {
        let ctl = dsp.comm_page().control_register();
        let ctl = if on {
            ctl | E3G_PHANTOM_POWER
        } else {
            ctl & !E3G_PHANTOM_POWER
        };
        let frq = dsp.comm_page().e3g_frq_register();
        e3g_write_control_reg(dsp, ctl, frq, true)
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::emulator::*};

    #[test]
    fn frequency_register() {
        assert_eq!(e3g_frequency_register(48000), E3G_FREQ_REG_DEFAULT);
        assert_eq!(e3g_frequency_register(96000), E3G_FREQ_REG_DEFAULT);
        assert_eq!(e3g_frequency_register(40000), E3G_MAGIC_NUMBER / 40000 - 2);
        // The base rate is clamped.
        assert_eq!(e3g_frequency_register(60000), E3G_MAGIC_NUMBER / 32000 - 2);
    }

    #[test]
    fn spdif_format() {
        let ctl = e3g_spdif_format_bits(E3G_48KHZ | E3G_PHANTOM_POWER, 32000, false, true);
        assert_eq!(ctl & E3G_PHANTOM_POWER, E3G_PHANTOM_POWER);
        assert_eq!(
            ctl & (E3G_SPDIF_SAMPLE_RATE0 | E3G_SPDIF_SAMPLE_RATE1),
            E3G_SPDIF_SAMPLE_RATE0 | E3G_SPDIF_SAMPLE_RATE1
        );
        assert_eq!(ctl & E3G_SPDIF_NOT_AUDIO, E3G_SPDIF_NOT_AUDIO);
        assert_eq!(ctl & E3G_SPDIF_PRO_MODE, 0);
    }

    #[test]
    fn box_detection() {
        let os = EmulatedCard::new(CardType::Echo3g, DspDevice::Dsp56361);
        os.set_box_type(Echo3gBoxType::Layla3g);
        let dsp = DspCommObject::new(CardType::Echo3g, &os).unwrap();
        assert_eq!(dsp.spec().unwrap().name, "Gina3G");

        dsp.load_firmware().unwrap();
        assert_eq!(dsp.box_type(), Some(Echo3gBoxType::Layla3g));
        let spec = dsp.spec().unwrap();
        assert_eq!(spec.name, "Layla3G");
        assert_eq!(spec.midi_port_count, 1);
        assert!(!spec.has_phantom_power);

        // Without the feature, nothing happens.
        os.clear_logs();
        dsp.set_phantom_power(true).unwrap();
        assert!(os.vector_log().is_empty());
        assert!(!dsp.phantom_power());
    }

    #[test]
    fn control_register() {
        let os = EmulatedCard::new(CardType::Echo3g, DspDevice::Dsp56361);
        os.set_box_type(Echo3gBoxType::Gina3g);
        let dsp = DspCommObject::new(CardType::Echo3g, &os).unwrap();
        dsp.load_firmware().unwrap();
        assert_eq!(dsp.box_type(), Some(Echo3gBoxType::Gina3g));

        dsp.set_sample_rate(Some(40000)).unwrap();
        assert_eq!(os.control_register() & !E3G_CLOCK_CLEAR_MASK, E3G_CONTINUOUS_CLOCK);
        assert_eq!(
            dsp.comm_page().e3g_frq_register(),
            E3G_MAGIC_NUMBER / 40000 - 2
        );

        dsp.set_sample_rate(Some(96000)).unwrap();
        assert_eq!(os.control_register() & !E3G_CLOCK_CLEAR_MASK, E3G_96KHZ);

        dsp.set_phantom_power(true).unwrap();
        assert!(dsp.phantom_power());
        assert_eq!(os.control_register() & E3G_PHANTOM_POWER, E3G_PHANTOM_POWER);

        // S/PDIF is not reported in ADAT mode.
        os.set_detected_clocks(E3G_CLOCK_DETECT_BIT_SPDIF48 | E3G_CLOCK_DETECT_BIT_ADAT);
        assert!(dsp.input_clock_detect().unwrap().contains(InputClock::Spdif));
        dsp.set_digital_mode(DigitalMode::Adat).unwrap();
        let detected = dsp.input_clock_detect().unwrap();
        assert!(!detected.contains(InputClock::Spdif));
        assert!(detected.contains(InputClock::Adat));
        assert_eq!(dsp.sample_rate().unwrap(), 48000);
        assert_eq!(os.control_register() & E3G_DOUBLE_SPEED_MODE, 0);
        assert_eq!(os.control_register() & E3G_PHANTOM_POWER, E3G_PHANTOM_POWER);

        let err = dsp.set_input_clock(InputClock::Word).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::ClockNotSupported));
    }

    #[test]
    fn undetected_spdif_clock() {
        let os = EmulatedCard::new(CardType::Echo3g, DspDevice::Dsp56361);
        os.set_box_type(Echo3gBoxType::Gina3g);
        let dsp = DspCommObject::new(CardType::Echo3g, &os).unwrap();
        dsp.load_firmware().unwrap();
        assert!(dsp.spec().unwrap().input_clocks.contains(&InputClock::Spdif));
        let ctl = os.control_register();

        let err = dsp.set_input_clock(InputClock::Spdif).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::ClockNotAvailable));
        assert_eq!(dsp.input_clock().unwrap(), InputClock::Internal);
        assert_eq!(os.control_register(), ctl);

        os.set_detected_clocks(E3G_CLOCK_DETECT_BIT_SPDIF48);
        dsp.set_input_clock(InputClock::Spdif).unwrap();
        assert_eq!(dsp.input_clock().unwrap(), InputClock::Spdif);
    }
}
