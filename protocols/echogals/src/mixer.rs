// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Mixer controls cached by host.
//!
//! The module includes structure and its implementation for the gain, mute, and pan of busses
//! and monitors. The communication page holds the gain actually applied, which is computed
//! from the cached controls.
//!
//! Pan works on a stereo pair of output busses. The bus of even number is the left channel
//! and the bus of odd number is the right channel. The pan value moves from hard left (0) to
//! hard right (`MAX_MIXER_PAN`).

use super::comm_page::*;

/// The minimum gain of output busses and monitors, in dB.
pub const OUTPUT_GAIN_MIN: i8 = GAIN_MUTED;
/// The maximum gain of output busses and monitors, in dB.
pub const OUTPUT_GAIN_MAX: i8 = 6;
/// The minimum gain of input busses, in 0.5 dB unit.
pub const INPUT_GAIN_MIN: i8 = -50;
/// The maximum gain of input busses, in 0.5 dB unit.
pub const INPUT_GAIN_MAX: i8 = 50;

/// The value of pan at hard right.
pub const MAX_MIXER_PAN: u16 = 1000;

// Fixed point arithmetic in 16.16 format.
const FIXED_BASE: u32 = 16;
const FIXED_ONE_HALF: i32 = 0x00008000;
// The coefficients of polynomial approximation for log2(x) in 0.5 <= x < 1.0.
const COEFF_A2: i32 = 0xffffa9acu32 as i32;
const COEFF_A1: i32 = 0x0000ff8a;
const COEFF_A0: i32 = 0xffff5661u32 as i32;
// 6.02 dB per doubling.
const DB_CONVERT: i32 = 0x00060546;

/// The muted gain in 1/256 dB unit.
pub const GAIN_MUTED_DB256: i32 = (GAIN_MUTED as i32) << 8;

fn fixed_mult(lhs: i32, rhs: i32) -> i32 {
    ((lhs as i64 * rhs as i64) >> FIXED_BASE) as i32
}

fn fixed_log2(num: i32) -> i32 {
    if num <= 0 {
        return GAIN_MUTED_DB256;
    }

    let mut num = num;
    let mut shifts = 0;
    while num < FIXED_ONE_HALF {
        shifts += 1;
        num <<= 1;
    }

    let mut val = fixed_mult(fixed_mult(num, num), COEFF_A2);
    val += fixed_mult(num, COEFF_A1);
    val += COEFF_A0;
    (val << 2) - (shifts << FIXED_BASE)
}

/// Convert the value of pan to attenuation in 1/256 dB unit.
pub fn pan_to_db(pan: u16) -> i32 {
    let pan = pan.min(MAX_MIXER_PAN) as i32;
    if pan >= MAX_MIXER_PAN as i32 - 1 {
        return 0;
    }
    if pan <= 1 {
        return GAIN_MUTED_DB256;
    }

    let ratio = (pan << FIXED_BASE) / MAX_MIXER_PAN as i32;
    let db = fixed_mult(fixed_log2(ratio) << 8, DB_CONVERT);
    (db + FIXED_ONE_HALF) >> FIXED_BASE
}

/// The pan which gives no attenuation to the bus.
fn neutral_pan(bus: usize) -> u16 {
    if bus % 2 > 0 {
        MAX_MIXER_PAN
    } else {
        0
    }
}

/// The attenuation in dB for the bus by the pan of its stereo pair.
pub fn pan_attenuation(bus: usize, pan: u16) -> i32 {
    let db256 = if bus % 2 > 0 {
        pan_to_db(pan)
    } else {
        pan_to_db(MAX_MIXER_PAN - pan.min(MAX_MIXER_PAN))
    };
    if db256 <= GAIN_MUTED_DB256 {
        GAIN_MUTED as i32
    } else if db256 < 0 {
        (db256 - 128) / 256
    } else {
        (db256 + 128) / 256
    }
}

/// The gain, mute, and pan of a bus or a monitor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LevelControl {
    pub gain: i8,
    pub mute: bool,
    /// Without any value, the pan is neutral for the output bus.
    pub pan: Option<u16>,
}

impl LevelControl {
    fn new(gain: i8) -> Self {
        Self {
            gain,
            mute: false,
            pan: None,
        }
    }

    pub fn pan(&self, bus: usize) -> u16 {
        self.pan.unwrap_or_else(|| neutral_pan(bus))
    }

    /// The gain applied to the output bus.
    pub fn output_gain(&self, bus: usize) -> i8 {
        if self.mute || self.gain == GAIN_MUTED {
            return GAIN_MUTED;
        }
        let gain = self.gain as i32 + pan_attenuation(bus, self.pan(bus));
        gain.clamp(OUTPUT_GAIN_MIN as i32, OUTPUT_GAIN_MAX as i32) as i8
    }

    /// The gain applied to the input bus. Pan is not available.
    pub fn input_gain(&self) -> i8 {
        if self.mute {
            GAIN_MUTED
        } else {
            self.gain
        }
    }
}

/// The cache of mixer controls, in the layout of communication page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerState {
    pub outputs: Vec<LevelControl>,
    pub inputs: Vec<LevelControl>,
    /// The index is the same as the monitor array in communication page.
    pub monitors: Vec<LevelControl>,
}

impl Default for MixerState {
    fn default() -> Self {
        Self {
            outputs: vec![LevelControl::new(0); MAX_BUSSES_OUT],
            inputs: vec![LevelControl::new(0); MAX_BUSSES_IN],
            monitors: vec![LevelControl::new(GAIN_MUTED); MONITOR_ARRAY_SIZE],
        }
    }
}

/// Check the gain of output bus or monitor.
pub fn check_output_gain(gain: i8) -> bool {
    (OUTPUT_GAIN_MIN..=OUTPUT_GAIN_MAX).contains(&gain)
}

/// Check the gain of input bus.
pub fn check_input_gain(gain: i8) -> bool {
    (INPUT_GAIN_MIN..=INPUT_GAIN_MAX).contains(&gain)
}
