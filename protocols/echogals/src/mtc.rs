// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Synchronization of sampling rate to MIDI Time Code.
//!
//! The module includes structure, enumeration, and its implementation to slave the sampling
//! rate of card to the stream of MTC quarter frames received by MIDI input port.
//!
//! The DSP inserts two words of timestamp (higher and lower 16 bits) just after the status
//! byte of quarter frame (0xf1), before its data byte. The timestamp is counted in sample
//! frames of current sampling rate, thus the span of timestamps for the fixed number of
//! quarter frames tells the ratio between the rate of card and the rate of MTC master.
//!
//! The other MIDI messages in the input buffer are kept for `EchoGalsMtc::read_midi_input()`.

use {
    super::{card::*, os_support::*, *},
    std::ops::{Deref, DerefMut},
    tracing::{debug, warn},
};

const MIDI_STATUS_MTC_QUARTER_FRAME: u16 = 0xf1;
const MIDI_STATUS_BIT: u16 = 0x80;

/// The rate of frames in MTC.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MtcFrameRate {
    Fps24,
    Fps25,
    /// 30 drop frame.
    Fps2997,
    Fps30,
}

impl Default for MtcFrameRate {
    fn default() -> Self {
        Self::Fps30
    }
}

impl MtcFrameRate {
    pub fn frames_per_second(&self) -> f64 {
        match self {
            Self::Fps24 => 24.0,
            Self::Fps25 => 25.0,
            Self::Fps2997 => 30000.0 / 1001.0,
            Self::Fps30 => 30.0,
        }
    }
}

fn deserialize_frame_rate(rate: &mut MtcFrameRate, piece: u8) {
    *rate = match (piece >> 1) & 0x03 {
        0 => MtcFrameRate::Fps24,
        1 => MtcFrameRate::Fps25,
        2 => MtcFrameRate::Fps2997,
        _ => MtcFrameRate::Fps30,
    };
}

/// Parameters to tune the synchronization.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MtcSyncParams {
    /// The number of consecutive estimates within the tolerance to lock.
    pub stable_count: usize,
    /// The tolerance between estimates, in parts per million.
    pub tolerance_ppm: u32,
    /// The stream is regarded as stopped without quarter frame for the duration.
    pub stream_timeout_usec: u64,
    /// The number of quarter frames for one estimate. Eight quarter frames are two frames.
    pub quarter_frames_per_estimate: usize,
}

impl Default for MtcSyncParams {
    fn default() -> Self {
        Self {
            stable_count: 3,
            tolerance_ppm: 200,
            stream_timeout_usec: 250000,
            quarter_frames_per_estimate: 8,
        }
    }
}

/// The state of synchronization.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MtcSyncState {
    Unsynced,
    Tracking,
    Locked,
}

impl Default for MtcSyncState {
    fn default() -> Self {
        Self::Unsynced
    }
}

/// The quarter frame with timestamp.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct QuarterFrame {
    pub timestamp: u32,
    pub data: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ParserState {
    Idle,
    TimestampHigh,
    TimestampLow(u16),
    Data(u32),
}

impl Default for ParserState {
    fn default() -> Self {
        Self::Idle
    }
}

/// The parser of words in MIDI input buffer.
#[derive(Default, Debug)]
pub struct MtcParser {
    state: ParserState,
}

impl MtcParser {
    /// Parse the words and pick up quarter frames. The words of the other messages are
    /// pushed to `others` as they are.
    pub fn parse(&mut self, words: &[u16], frames: &mut Vec<QuarterFrame>, others: &mut Vec<u16>) {
        words.iter().for_each(|&word| {
            self.state = match self.state {
                ParserState::Idle => {
                    if word & 0xff == MIDI_STATUS_MTC_QUARTER_FRAME {
                        ParserState::TimestampHigh
                    } else {
                        others.push(word);
                        ParserState::Idle
                    }
                }
                ParserState::TimestampHigh => ParserState::TimestampLow(word),
                ParserState::TimestampLow(high) => {
                    ParserState::Data(((high as u32) << 16) | word as u32)
                }
                ParserState::Data(timestamp) => {
                    if word & MIDI_STATUS_BIT > 0 {
                        // The quarter frame is interrupted by the other message.
                        if word & 0xff == MIDI_STATUS_MTC_QUARTER_FRAME {
                            ParserState::TimestampHigh
                        } else {
                            others.push(word);
                            ParserState::Idle
                        }
                    } else {
                        frames.push(QuarterFrame {
                            timestamp,
                            data: (word & 0x7f) as u8,
                        });
                        ParserState::Idle
                    }
                }
            };
        });
    }
}

/// The request to program sampling rate, yielded by the state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MtcSyncEvent {
    /// The estimated rate is stable.
    Commit(u32),
    /// The stream stopped after commit.
    Revert(u32),
}

/// The state machine of synchronization, without any I/O.
#[derive(Debug)]
pub struct MtcSync {
    params: MtcSyncParams,
    parser: MtcParser,
    frame_rate: MtcFrameRate,
    state: MtcSyncState,
    base_rate: u32,
    current_rate: u32,
    rate_range: (u32, u32),
    window_start: Option<u32>,
    window_count: usize,
    last_estimate: Option<u32>,
    stable: usize,
    last_frame_time: Option<u64>,
    committed: bool,
}

impl MtcSync {
    pub fn new(params: MtcSyncParams, base_rate: u32, rate_range: (u32, u32)) -> Self {
        Self {
            params,
            parser: Default::default(),
            frame_rate: Default::default(),
            state: Default::default(),
            base_rate,
            current_rate: base_rate,
            rate_range,
            window_start: None,
            window_count: 0,
            last_estimate: None,
            stable: 0,
            last_frame_time: None,
            committed: false,
        }
    }

    pub fn state(&self) -> MtcSyncState {
        self.state
    }

    pub fn frame_rate(&self) -> MtcFrameRate {
        self.frame_rate
    }

    pub fn base_rate(&self) -> u32 {
        self.base_rate
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Notify the rate actually programmed for the event.
    pub fn set_current_rate(&mut self, rate: u32) {
        self.current_rate = rate;
    }

    fn reset_estimation(&mut self) {
        self.window_start = None;
        self.window_count = 0;
        self.last_estimate = None;
        self.stable = 0;
    }

    fn estimate(&self, span: u32) -> u32 {
        let fps = self.frame_rate.frames_per_second();
        let frames = self.params.quarter_frames_per_estimate as f64 / 4.0;
        let rate = self.base_rate as f64 * frames * self.current_rate as f64 / (fps * span as f64);
        let (min, max) = self.rate_range;
        (rate.round() as u32).clamp(min, max)
    }

    fn is_within_tolerance(&self, lhs: u32, rhs: u32) -> bool {
        let diff = (lhs as i64 - rhs as i64).unsigned_abs();
        diff * 1000000 <= self.params.tolerance_ppm as u64 * rhs as u64
    }

    /// Feed words from MIDI input buffer. The words except for quarter frames are pushed to
    /// `others`.
    pub fn feed(&mut self, words: &[u16], now: u64, others: &mut Vec<u16>) -> Option<MtcSyncEvent> {
        let mut frames = Vec::new();
        self.parser.parse(words, &mut frames, others);

        let mut event = None;
        frames.iter().for_each(|frame| {
            if let Some(e) = self.handle_quarter_frame(frame, now) {
                event = Some(e);
            }
        });
        event
    }

    fn handle_quarter_frame(&mut self, frame: &QuarterFrame, now: u64) -> Option<MtcSyncEvent> {
        self.last_frame_time = Some(now);

        if frame.data >> 4 == 7 {
            deserialize_frame_rate(&mut self.frame_rate, frame.data & 0x0f);
        }

        if self.state == MtcSyncState::Unsynced {
            self.state = MtcSyncState::Tracking;
            debug!(timestamp = frame.timestamp, "MTC tracking");
        }

        let start = match self.window_start {
            Some(start) => start,
            None => {
                self.window_start = Some(frame.timestamp);
                self.window_count = 0;
                return None;
            }
        };

        self.window_count += 1;
        if self.window_count < self.params.quarter_frames_per_estimate {
            return None;
        }

        let span = frame.timestamp.wrapping_sub(start);
        self.window_start = Some(frame.timestamp);
        self.window_count = 0;
        if span == 0 {
            return None;
        }

        let estimate = self.estimate(span);
        debug!(span, estimate, state = ?self.state, "MTC estimate");

        match self.state {
            MtcSyncState::Locked => {
                if !self.is_within_tolerance(estimate, self.current_rate) {
                    self.state = MtcSyncState::Tracking;
                    self.last_estimate = Some(estimate);
                    self.stable = 1;
                    debug!(estimate, rate = self.current_rate, "MTC lost lock");
                }
                None
            }
            _ => {
                self.stable = match self.last_estimate {
                    Some(last) if self.is_within_tolerance(estimate, last) => self.stable + 1,
                    _ => 1,
                };
                self.last_estimate = Some(estimate);

                if self.stable >= self.params.stable_count {
                    self.state = MtcSyncState::Locked;
                    self.committed = true;
                    debug!(rate = estimate, "MTC locked");
                    Some(MtcSyncEvent::Commit(estimate))
                } else {
                    None
                }
            }
        }
    }

    /// Check whether the stream stopped.
    pub fn check_timeout(&mut self, now: u64) -> Option<MtcSyncEvent> {
        if self.state == MtcSyncState::Unsynced {
            return None;
        }

        let last = self.last_frame_time?;
        if now.saturating_sub(last) <= self.params.stream_timeout_usec {
            return None;
        }

        self.state = MtcSyncState::Unsynced;
        self.reset_estimation();
        self.parser = Default::default();
        debug!("MTC stream stopped");

        if self.committed {
            self.committed = false;
            Some(MtcSyncEvent::Revert(self.base_rate))
        } else {
            None
        }
    }
}

/// The card which can slave its sampling rate to MTC.
pub struct EchoGalsMtc<'a, O: OsSupport> {
    card: EchoGals<'a, O>,
    params: MtcSyncParams,
    sync: Option<MtcSync>,
    midi_input: Vec<u16>,
}

impl<'a, O: OsSupport> EchoGalsMtc<'a, O> {
    pub fn new(card_type: CardType, os: &'a O, params: MtcSyncParams) -> Result<Self, Error> {
        let card = EchoGals::new(card_type, os)?;
        Ok(Self {
            card,
            params,
            sync: None,
            midi_input: Vec::new(),
        })
    }

    pub fn mtc_sync_params(&self) -> &MtcSyncParams {
        &self.params
    }

    /// The capabilities, with MTC clock when the card has MIDI port.
    pub fn capabilities(&self) -> Result<EchoGalsCaps, Error> {
        let mut caps = self.card.capabilities()?;
        if caps.midi_port_count > 0 {
            caps.input_clocks.insert(InputClock::Mtc);
        }
        Ok(caps)
    }

    /// Select the source of sampling clock. For MTC, the card runs with internal clock and
    /// the rate is adjusted by `service_mtc_sync()`. MIDI input is enabled before the clock
    /// is changed, and disabled again when the clock is not changed.
    pub fn set_input_clock(&mut self, clock: InputClock) -> Result<(), Error> {
        if clock == InputClock::Mtc {
            if self.sync.is_some() {
                return Ok(());
            }

            let spec = self.card.dsp().spec()?;
            if spec.midi_port_count == 0 {
                let msg = format!("MTC clock is not supported by {}", spec.name);
                Err(status_error(EchoStatusError::ClockNotSupported, &msg))?;
            }

            self.card.dsp().set_midi_on(true)?;
            if let Err(e) = self.card.set_input_clock(InputClock::Internal) {
                if let Err(err) = self.card.dsp().set_midi_on(false) {
                    warn!("Fail to disable MIDI input: {}", err);
                }
                return Err(e);
            }

            let base_rate = self.card.audio_sample_rate()?;
            self.sync = Some(MtcSync::new(self.params, base_rate, spec.sample_rates.range()));
            debug!(base_rate, "MTC clock selected");
        } else {
            if let Some(sync) = &self.sync {
                if sync.is_committed() {
                    self.card.dsp().set_sample_rate(Some(sync.base_rate()))?;
                }
            }
            self.card.set_input_clock(clock)?;
            if self.sync.take().is_some() {
                self.card.dsp().set_midi_on(false)?;
            }
        }

        Ok(())
    }

    pub fn input_clock(&self) -> Result<InputClock, Error> {
        if self.sync.is_some() {
            Ok(InputClock::Mtc)
        } else {
            self.card.input_clock()
        }
    }

    pub fn mtc_sync_state(&self) -> MtcSyncState {
        self.sync
            .as_ref()
            .map(|sync| sync.state())
            .unwrap_or_default()
    }

    /// Process quarter frames arrived since the last call, without blocking.
    pub fn service_mtc_sync(&mut self) -> Result<MtcSyncState, Error> {
        let sync = match self.sync.as_mut() {
            Some(sync) => sync,
            None => return Ok(MtcSyncState::Unsynced),
        };

        let dsp = self.card.dsp();
        let words = dsp.read_midi_input()?;
        let now = dsp.system_time();
        let event = if words.is_empty() {
            sync.check_timeout(now)
        } else {
            sync.feed(&words, now, &mut self.midi_input)
        };

        match event {
            Some(MtcSyncEvent::Commit(rate)) | Some(MtcSyncEvent::Revert(rate)) => {
                let rate = dsp.set_sample_rate(Some(rate))?;
                sync.set_current_rate(rate);
            }
            None => (),
        }

        Ok(sync.state())
    }

    /// Read words from MIDI input buffer except for MTC quarter frames consumed for the
    /// synchronization.
    pub fn read_midi_input(&mut self) -> Result<Vec<u16>, Error> {
        if self.sync.is_some() {
            self.service_mtc_sync()?;
            Ok(self.midi_input.drain(..).collect())
        } else {
            let mut words: Vec<u16> = self.midi_input.drain(..).collect();
            words.extend(self.card.dsp().read_midi_input()?);
            Ok(words)
        }
    }
}

impl<'a, O: OsSupport> Deref for EchoGalsMtc<'a, O> {
    type Target = EchoGals<'a, O>;

    fn deref(&self) -> &Self::Target {
        &self.card
    }
}

impl<'a, O: OsSupport> DerefMut for EchoGalsMtc<'a, O> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.card
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::dsp::*, crate::emulator::*};

    // Quarter frames with the span of timestamps for each window of eight.
    fn quarter_frames(piece: &mut u8, timestamp: &mut u32, span: u32) -> Vec<u16> {
        let mut words = Vec::new();
        (1..=8).for_each(|i| {
            let ts = timestamp.wrapping_add(span * i / 8);
            *piece = (*piece + 1) % 8;
            let nibble = if *piece == 7 { 0x03 << 1 } else { 0x00 };
            words.extend_from_slice(&[
                MIDI_STATUS_MTC_QUARTER_FRAME,
                (ts >> 16) as u16,
                (ts & 0xffff) as u16,
                ((*piece as u16) << 4) | nibble,
            ]);
        });
        *timestamp = timestamp.wrapping_add(span);
        words
    }

    #[test]
    fn parser() {
        let mut parser = MtcParser::default();
        let mut frames = Vec::new();
        let mut others = Vec::new();

        parser.parse(&[0x90, 0x40, 0x7f, 0xf1, 0x0001], &mut frames, &mut others);
        assert!(frames.is_empty());
        assert_eq!(others, vec![0x90, 0x40, 0x7f]);
        parser.parse(&[0x0002, 0x21], &mut frames, &mut others);
        assert_eq!(
            frames,
            vec![QuarterFrame {
                timestamp: 0x00010002,
                data: 0x21
            }]
        );

        assert_eq!(others.len(), 3);

        // Interrupted by the other status byte.
        frames.clear();
        others.clear();
        parser.parse(&[0xf1, 0x0000, 0x0010, 0xf8, 0x21], &mut frames, &mut others);
        assert!(frames.is_empty());
        assert_eq!(others, vec![0xf8, 0x21]);
    }

    #[test]
    fn frame_rate() {
        let mut sync = MtcSync::new(Default::default(), 48000, (32000, 96000));
        assert_eq!(sync.frame_rate(), MtcFrameRate::Fps30);
        sync.feed(&[0xf1, 0x0000, 0x0000, 0x72], 0, &mut Vec::new());
        assert_eq!(sync.frame_rate(), MtcFrameRate::Fps25);
        assert_eq!(sync.state(), MtcSyncState::Tracking);
    }

    #[test]
    fn lock_to_ramp() {
        let os = EmulatedCard::new(CardType::Layla20, DspDevice::Dsp56301);
        let mut card = EchoGalsMtc::new(CardType::Layla20, &os, Default::default()).unwrap();
        card.init_hw().unwrap();
        assert!(card.capabilities().unwrap().input_clocks.contains(InputClock::Mtc));

        card.set_input_clock(InputClock::Mtc).unwrap();
        assert_eq!(card.input_clock().unwrap(), InputClock::Mtc);
        assert_eq!(card.service_mtc_sync().unwrap(), MtcSyncState::Unsynced);
        os.clear_logs();

        let mut piece = 7;
        let mut timestamp = 0x0001fff0;
        os.push_midi_input(&[
            MIDI_STATUS_MTC_QUARTER_FRAME,
            (timestamp >> 16) as u16,
            (timestamp & 0xffff) as u16,
            0x00,
        ]);
        piece = (piece + 1) % 8;
        assert_eq!(card.service_mtc_sync().unwrap(), MtcSyncState::Tracking);

        // 2940 frames are expected for two frames at 44.1 kHz and 30 fps.
        let spans = [2970, 2950, 2930, 2910, 2910];
        spans.iter().for_each(|&span| {
            os.push_midi_input(&quarter_frames(&mut piece, &mut timestamp, span));
            assert_eq!(card.service_mtc_sync().unwrap(), MtcSyncState::Tracking);
        });
        assert!(os.rate_commands().is_empty());

        os.push_midi_input(&quarter_frames(&mut piece, &mut timestamp, 2910));
        assert_eq!(card.service_mtc_sync().unwrap(), MtcSyncState::Locked);
        assert_eq!(os.rate_commands(), vec![44555]);
        assert_eq!(card.audio_sample_rate().unwrap(), 44555);

        // No new data.
        assert_eq!(card.service_mtc_sync().unwrap(), MtcSyncState::Locked);
        assert_eq!(os.rate_commands(), vec![44555]);
    }

    #[test]
    fn stream_timeout() {
        let os = EmulatedCard::new(CardType::Layla20, DspDevice::Dsp56301);
        let params = MtcSyncParams {
            stable_count: 2,
            ..Default::default()
        };
        let mut card = EchoGalsMtc::new(CardType::Layla20, &os, params).unwrap();
        card.init_hw().unwrap();
        card.set_input_clock(InputClock::Mtc).unwrap();
        os.clear_logs();

        let mut piece = 0;
        let mut timestamp = 0;
        os.push_midi_input(&[MIDI_STATUS_MTC_QUARTER_FRAME, 0x0000, 0x0000, 0x00]);
        card.service_mtc_sync().unwrap();
        (0..2).for_each(|_| {
            os.push_midi_input(&quarter_frames(&mut piece, &mut timestamp, 2940));
            card.service_mtc_sync().unwrap();
        });
        assert_eq!(card.mtc_sync_state(), MtcSyncState::Locked);
        assert_eq!(os.rate_commands(), vec![44100]);

        os.advance_time(params.stream_timeout_usec + 1);
        assert_eq!(card.service_mtc_sync().unwrap(), MtcSyncState::Unsynced);
        assert_eq!(os.rate_commands(), vec![44100, 44100]);

        card.set_input_clock(InputClock::Internal).unwrap();
        assert_eq!(card.input_clock().unwrap(), InputClock::Internal);
        assert_eq!(card.mtc_sync_state(), MtcSyncState::Unsynced);
    }

    #[test]
    fn mtc_without_midi_port() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let mut card = EchoGalsMtc::new(CardType::Gina24, &os, Default::default()).unwrap();
        card.init_hw().unwrap();
        assert!(!card.capabilities().unwrap().input_clocks.contains(InputClock::Mtc));

        let err = card.set_input_clock(InputClock::Mtc).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::ClockNotSupported));
        assert_eq!(card.input_clock().unwrap(), InputClock::Internal);
    }

    #[test]
    fn mtc_clock_kept_at_midi_failure() {
        let os = EmulatedCard::new(CardType::Layla24, DspDevice::Dsp56301);
        let mut card = EchoGalsMtc::new(CardType::Layla24, &os, Default::default()).unwrap();
        card.init_hw().unwrap();
        os.set_detected_clocks(crate::gml::GML_CLOCK_DETECT_BIT_SPDIF48);
        card.set_input_clock(InputClock::Spdif).unwrap();
        let ctl = os.control_register();

        card.set_dsp_timeouts(DspTimeouts {
            vector_busy_usec: 1000,
            ..Default::default()
        });
        os.clear_logs();
        os.set_vector_stall(true);
        let err = card.set_input_clock(InputClock::Mtc).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::DspTimeout));
        assert_eq!(card.input_clock().unwrap(), InputClock::Spdif);
        assert_eq!(card.mtc_sync_state(), MtcSyncState::Unsynced);
        assert_eq!(card.dsp().comm_page().flags() & DSP_FLAG_MIDI_INPUT, 0);
        assert_eq!(os.control_register(), ctl);
        assert!(os.vector_log().is_empty());

        os.set_vector_stall(false);
        card.set_input_clock(InputClock::Mtc).unwrap();
        assert_eq!(card.input_clock().unwrap(), InputClock::Mtc);
        assert_eq!(card.dsp().input_clock().unwrap(), InputClock::Internal);
        assert_eq!(
            card.dsp().comm_page().flags() & DSP_FLAG_MIDI_INPUT,
            DSP_FLAG_MIDI_INPUT
        );
    }

    #[test]
    fn midi_messages_through_mtc() {
        let os = EmulatedCard::new(CardType::Layla20, DspDevice::Dsp56301);
        let mut card = EchoGalsMtc::new(CardType::Layla20, &os, Default::default()).unwrap();
        card.init_hw().unwrap();

        // Without MTC clock, the words are passed as they are.
        card.dsp().set_midi_on(true).unwrap();
        os.push_midi_input(&[0xb0, 0x07, 0x40]);
        assert_eq!(card.read_midi_input().unwrap(), vec![0xb0, 0x07, 0x40]);
        card.dsp().set_midi_on(false).unwrap();

        card.set_input_clock(InputClock::Mtc).unwrap();

        let mut piece = 0;
        let mut timestamp = 0;
        let mut words = vec![MIDI_STATUS_MTC_QUARTER_FRAME, 0x0000, 0x0000, 0x00];
        words.extend_from_slice(&[0x90, 0x40, 0x7f]);
        words.extend(quarter_frames(&mut piece, &mut timestamp, 2940));
        words.extend_from_slice(&[0x80, 0x40, 0x00]);
        os.push_midi_input(&words);

        assert_eq!(card.service_mtc_sync().unwrap(), MtcSyncState::Tracking);
        assert_eq!(
            card.read_midi_input().unwrap(),
            vec![0x90, 0x40, 0x7f, 0x80, 0x40, 0x00]
        );
        assert!(card.read_midi_input().unwrap().is_empty());

        // The quarter frames are still consumed when reading.
        os.push_midi_input(&[0xfe]);
        os.push_midi_input(&quarter_frames(&mut piece, &mut timestamp, 2940));
        assert_eq!(card.read_midi_input().unwrap(), vec![0xfe]);
        assert_eq!(card.mtc_sync_state(), MtcSyncState::Tracking);
    }
}
