// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Control register shared by Gina24, Layla24, and Mona.
//!
//! The models with 24 bit converters have the control register in the communication page. The
//! register configures clock source, sampling rate, digital mode, and S/PDIF channel status.
//! DSP applies it at the command to write control register.

use super::{dsp::*, os_support::*, *};

pub(crate) const GML_CONVERTER_ENABLE: u32 = 0x00000010;
pub(crate) const GML_SPDIF_PRO_MODE: u32 = 0x00000020;
pub(crate) const GML_SPDIF_SAMPLE_RATE0: u32 = 0x00000040;
pub(crate) const GML_SPDIF_SAMPLE_RATE1: u32 = 0x00000080;
pub(crate) const GML_SPDIF_TWO_CHANNEL: u32 = 0x00000100;
pub(crate) const GML_SPDIF_NOT_AUDIO: u32 = 0x00000200;
pub(crate) const GML_SPDIF_COPY_PERMIT: u32 = 0x00000400;
pub(crate) const GML_SPDIF_24_BIT: u32 = 0x00000800;
pub(crate) const GML_ADAT_MODE: u32 = 0x00001000;
pub(crate) const GML_SPDIF_OPTICAL_MODE: u32 = 0x00002000;
pub(crate) const GML_SPDIF_CDROM_MODE: u32 = 0x00003000;
pub(crate) const GML_DOUBLE_SPEED_MODE: u32 = 0x00004000;
pub(crate) const GML_DIGITAL_IN_AUTO_MUTE: u32 = 0x00008000;

pub(crate) const GML_96KHZ: u32 = 0x0 | GML_DOUBLE_SPEED_MODE;
pub(crate) const GML_88KHZ: u32 = 0x1 | GML_DOUBLE_SPEED_MODE;
pub(crate) const GML_48KHZ: u32 = 0x2;
pub(crate) const GML_44KHZ: u32 = 0x3;
pub(crate) const GML_32KHZ: u32 = 0x4;
pub(crate) const GML_22KHZ: u32 = 0x5;
pub(crate) const GML_16KHZ: u32 = 0x6;
pub(crate) const GML_11KHZ: u32 = 0x7;
pub(crate) const GML_8KHZ: u32 = 0x8;
pub(crate) const GML_SPDIF_CLOCK: u32 = 0x9;
pub(crate) const GML_ADAT_CLOCK: u32 = 0xa;
pub(crate) const GML_WORD_CLOCK: u32 = 0xb;
pub(crate) const GML_ESYNC_CLOCK: u32 = 0xc;

pub(crate) const GML_CLOCK_CLEAR_MASK: u32 = 0xffffbff0;
pub(crate) const GML_SPDIF_RATE_CLEAR_MASK: u32 = !(GML_SPDIF_SAMPLE_RATE0 | GML_SPDIF_SAMPLE_RATE1);
pub(crate) const GML_DIGITAL_MODE_CLEAR_MASK: u32 = 0xffffcfff;
pub(crate) const GML_SPDIF_FORMAT_CLEAR_MASK: u32 = 0xfffff01f;

pub(crate) const GML_CLOCK_DETECT_BIT_WORD96: u32 = 0x0002;
pub(crate) const GML_CLOCK_DETECT_BIT_WORD48: u32 = 0x0004;
pub(crate) const GML_CLOCK_DETECT_BIT_SPDIF48: u32 = 0x0008;
pub(crate) const GML_CLOCK_DETECT_BIT_SPDIF96: u32 = 0x0010;
pub(crate) const GML_CLOCK_DETECT_BIT_WORD: u32 =
    GML_CLOCK_DETECT_BIT_WORD96 | GML_CLOCK_DETECT_BIT_WORD48;
pub(crate) const GML_CLOCK_DETECT_BIT_SPDIF: u32 =
    GML_CLOCK_DETECT_BIT_SPDIF48 | GML_CLOCK_DETECT_BIT_SPDIF96;
pub(crate) const GML_CLOCK_DETECT_BIT_ESYNC: u32 = 0x0020;
pub(crate) const GML_CLOCK_DETECT_BIT_ADAT: u32 = 0x0040;

// The frames of DSP pipeline, FIFO in ASIC, and filter in converters.
pub(crate) const GML_LATENCY: LatencySpec = LatencySpec {
    analog_output_1x: 1 + 32 + 12,
    analog_output_2x: 1 + 32 + 5,
    analog_input_1x: 1 + 32 + 12,
    analog_input_2x: 1 + 32 + 9,
    digital_output: 1 + 32,
    digital_input: 1 + 32,
};

/// Write the value to control register. Nothing is done when the value is not changed unless
/// forced.
pub(crate) fn write_control_reg<O: OsSupport>(
    dsp: &DspCommObject<O>,
    st: &DspState,
    value: u32,
    force: bool,
) -> Result<(), Error> {
    let value = if st.digital_in_auto_mute {
        value | GML_DIGITAL_IN_AUTO_MUTE
    } else {
        value & !GML_DIGITAL_IN_AUTO_MUTE
    };

    let old = dsp.comm_page().control_register();
    if force || value != old {
        dsp.wait_for_handshake()?;
        dsp.comm_page().set_control_register(value);
        dsp.send_page_command(DSP_VC_WRITE_CONTROL_REG).map_err(|e| {
            dsp.comm_page().set_control_register(old);
            e
        })?;
    }

    Ok(())
}

/// The clock bits for the rate of internal clock, including S/PDIF channel status for it.
pub(crate) fn rate_clock_bits(rate: u32, ctl: u32) -> Option<u32> {
    let bits = match rate {
        96000 => GML_96KHZ,
        88200 => GML_88KHZ,
        48000 => GML_48KHZ | GML_SPDIF_SAMPLE_RATE1,
        44100 => {
            if ctl & GML_SPDIF_PRO_MODE > 0 {
                GML_44KHZ | GML_SPDIF_SAMPLE_RATE0
            } else {
                GML_44KHZ
            }
        }
        32000 => GML_32KHZ | GML_SPDIF_SAMPLE_RATE0 | GML_SPDIF_SAMPLE_RATE1,
        22050 => GML_22KHZ,
        16000 => GML_16KHZ,
        11025 => GML_11KHZ,
        8000 => GML_8KHZ,
        _ => return None,
    };
    Some(bits)
}

/// Build S/PDIF channel status bits for the rate and the modes.
pub(crate) fn spdif_format_bits(ctl: u32, rate: u32, professional: bool, non_audio: bool) -> u32 {
    let mut ctl = ctl & GML_SPDIF_FORMAT_CLEAR_MASK;
    ctl |= GML_SPDIF_TWO_CHANNEL | GML_SPDIF_24_BIT | GML_SPDIF_COPY_PERMIT;

    if professional {
        ctl |= GML_SPDIF_PRO_MODE;
    }
    if non_audio {
        ctl |= GML_SPDIF_NOT_AUDIO;
    }

    match rate {
        32000 => ctl |= GML_SPDIF_SAMPLE_RATE0 | GML_SPDIF_SAMPLE_RATE1,
        44100 if professional => ctl |= GML_SPDIF_SAMPLE_RATE0,
        48000 => ctl |= GML_SPDIF_SAMPLE_RATE1,
        _ => (),
    }

    ctl
}

pub(crate) fn set_professional_spdif<O: OsSupport>(
    dsp: &DspCommObject<O>,
    st: &DspState,
    enable: bool,
) -> Result<(), Error> {
    let ctl = dsp.comm_page().control_register();
    let ctl = spdif_format_bits(ctl, st.sample_rate, enable, st.non_audio_spdif);
    write_control_reg(dsp, st, ctl, false)
}

pub(crate) fn set_spdif_out_non_audio<O: OsSupport>(
    dsp: &DspCommObject<O>,
    st: &DspState,
    enable: bool,
) -> Result<(), Error> {
    let ctl = dsp.comm_page().control_register();
    let ctl = spdif_format_bits(ctl, st.sample_rate, st.professional_spdif, enable);
    write_control_reg(dsp, st, ctl, false)
}

/// Whether the input clock can not be used in the digital mode.
pub(crate) fn is_incompatible_clock(clock: InputClock, mode: DigitalMode) -> bool {
    match mode {
        DigitalMode::Adat => clock == InputClock::Spdif,
        _ => clock == InputClock::Adat,
    }
}

/// The input clock and the sampling rate after switching to the digital mode. The incompatible
/// clock falls back to internal clock at 48.0 kHz, and ADAT mode is limited to single speed.
pub(crate) fn digital_mode_clock(st: &DspState, mode: DigitalMode) -> (InputClock, u32) {
    if is_incompatible_clock(st.input_clock, mode) {
        (InputClock::Internal, 48000)
    } else if mode == DigitalMode::Adat && st.sample_rate > SINGLE_SPEED_MAX_RATE {
        (st.input_clock, 48000)
    } else {
        (st.input_clock, st.sample_rate)
    }
}

/// The value of control register to run internal clock at the rate.
pub(crate) fn internal_clock_register(ctl: u32, rate: u32) -> Result<u32, Error> {
    let ctl = ctl & GML_CLOCK_CLEAR_MASK & GML_SPDIF_RATE_CLEAR_MASK;
    rate_clock_bits(rate, ctl).map(|bits| ctl | bits).ok_or_else(|| {
        let msg = format!("{} Hz is not supported", rate);
        status_error(EchoStatusError::InvalidParam, &msg)
    })
}

/// Switch the digital mode by single write of control register, with the clock and rate
/// required by the mode. At failure, nothing is changed.
pub(crate) fn write_digital_mode<O: OsSupport>(
    dsp: &DspCommObject<O>,
    st: &mut DspState,
    mode: DigitalMode,
) -> Result<(), Error> {
    let (clock, rate) = digital_mode_clock(st, mode);

    let ctl = dsp.comm_page().control_register();
    let ctl = if clock.is_external() || (clock == st.input_clock && rate == st.sample_rate) {
        ctl
    } else {
        internal_clock_register(ctl, rate)?
    };
    let ctl = digital_mode_bits(ctl, mode, dsp.dsp_device());

    let old_rate = dsp.comm_page().sample_rate();
    dsp.comm_page().set_sample_rate(rate);
    if let Err(e) = write_control_reg(dsp, st, ctl, true) {
        dsp.comm_page().set_sample_rate(old_rate);
        return Err(e);
    }

    st.input_clock = clock;
    st.sample_rate = rate;

    Ok(())
}

pub(crate) fn digital_mode_bits(ctl: u32, mode: DigitalMode, device: DspDevice) -> u32 {
    let ctl = ctl & GML_DIGITAL_MODE_CLEAR_MASK;
    match mode {
        DigitalMode::SpdifRca => ctl,
        DigitalMode::SpdifOptical => ctl | GML_SPDIF_OPTICAL_MODE,
        DigitalMode::SpdifCdrom => {
            if device == DspDevice::Dsp56301 {
                ctl | GML_SPDIF_CDROM_MODE
            } else {
                ctl
            }
        }
        DigitalMode::Adat => (ctl | GML_ADAT_MODE) & !GML_DOUBLE_SPEED_MODE,
    }
}

pub(crate) fn detect_input_clocks(status: u32) -> InputClockMask {
    let mut mask = InputClockMask::default();
    if status & GML_CLOCK_DETECT_BIT_WORD > 0 {
        mask.insert(InputClock::Word);
    }
    if status & GML_CLOCK_DETECT_BIT_SPDIF > 0 {
        mask.insert(InputClock::Spdif);
    }
    if status & GML_CLOCK_DETECT_BIT_ADAT > 0 {
        mask.insert(InputClock::Adat);
    }
    if status & GML_CLOCK_DETECT_BIT_ESYNC > 0 {
        mask.insert(InputClock::Esync);
        mask.insert(InputClock::Esync96);
    }
    mask
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spdif_format() {
        let ctl = GML_CONVERTER_ENABLE | GML_48KHZ | GML_SPDIF_NOT_AUDIO;
        let ctl = spdif_format_bits(ctl, 44100, true, false);
        assert_eq!(ctl & GML_SPDIF_NOT_AUDIO, 0);
        assert_eq!(ctl & GML_SPDIF_PRO_MODE, GML_SPDIF_PRO_MODE);
        assert_eq!(ctl & GML_SPDIF_SAMPLE_RATE0, GML_SPDIF_SAMPLE_RATE0);
        assert_eq!(ctl & GML_SPDIF_SAMPLE_RATE1, 0);
        assert_eq!(ctl & !GML_CLOCK_CLEAR_MASK, GML_48KHZ);

        let ctl = spdif_format_bits(ctl, 44100, false, true);
        assert_eq!(ctl & GML_SPDIF_PRO_MODE, 0);
        assert_eq!(ctl & GML_SPDIF_SAMPLE_RATE0, 0);
        assert_eq!(ctl & GML_SPDIF_NOT_AUDIO, GML_SPDIF_NOT_AUDIO);
    }

    #[test]
    fn rate_clock() {
        assert_eq!(rate_clock_bits(96000, 0), Some(GML_DOUBLE_SPEED_MODE));
        assert_eq!(rate_clock_bits(44100, 0), Some(GML_44KHZ));
        assert_eq!(
            rate_clock_bits(44100, GML_SPDIF_PRO_MODE),
            Some(GML_44KHZ | GML_SPDIF_SAMPLE_RATE0)
        );
        assert_eq!(rate_clock_bits(44000, 0), None);
    }

    #[test]
    fn digital_mode() {
        let ctl = GML_48KHZ | GML_DOUBLE_SPEED_MODE | GML_SPDIF_OPTICAL_MODE;
        let ctl = digital_mode_bits(ctl, DigitalMode::Adat, DspDevice::Dsp56301);
        assert_eq!(ctl, GML_48KHZ | GML_ADAT_MODE);

        let ctl = digital_mode_bits(ctl, DigitalMode::SpdifCdrom, DspDevice::Dsp56361);
        assert_eq!(ctl, GML_48KHZ);

        assert!(is_incompatible_clock(InputClock::Adat, DigitalMode::SpdifOptical));
        assert!(is_incompatible_clock(InputClock::Spdif, DigitalMode::Adat));
        assert!(!is_incompatible_clock(InputClock::Word, DigitalMode::Adat));
    }
}
