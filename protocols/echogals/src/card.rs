// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Card abstraction over the DSP communication object.
//!
//! The module includes structure, enumeration, and its implementation to initialize the card,
//! to report its capabilities, and to operate clocks, digital modes, transport, and mixer
//! with rules common to all of models. The change of mixer controls is queued for each mixer
//! client opened by `open_mixer()`, so that the client can notify it to the other parts of
//! system.

use {
    super::{dsp::*, non_paged::*, os_support::*, *},
    std::collections::VecDeque,
    tracing::{debug, warn},
};

/// The maximum number of changes in the queue of each client. The change is discarded when
/// the queue is full.
pub const MAX_CONTROL_CHANGES: usize = 128;

/// The identifier of mixer client.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct MixerCookie(pub u64);

#[derive(Debug)]
struct MixerClient {
    cookie: MixerCookie,
    changes: VecDeque<ControlChange>,
}

impl MixerClient {
    fn new(cookie: MixerCookie) -> Self {
        Self {
            cookie,
            changes: VecDeque::with_capacity(MAX_CONTROL_CHANGES),
        }
    }

    fn push(&mut self, change: ControlChange) {
        if self.changes.contains(&change) {
            return;
        }
        if self.changes.len() >= MAX_CONTROL_CHANGES {
            debug!(cookie = self.cookie.0, ?change, "control change queue is full");
            return;
        }
        self.changes.push_back(change);
    }
}

/// The state of hardware initialization.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HwState {
    Uninitialized,
    Ready,
    Failed,
}

impl Default for HwState {
    fn default() -> Self {
        Self::Uninitialized
    }
}

/// The flag of card.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardFlag {
    /// The sampling rate is locked to the rate given by `set_audio_locked_sample_rate()`.
    SampleRateLocked,
    /// Digital input is muted when it loses lock. Read only.
    DigitalInAutoMute,
}

impl MaskBit for CardFlag {
    const ALL: &'static [Self] = &[Self::SampleRateLocked, Self::DigitalInAutoMute];

    fn bit(&self) -> u32 {
        match self {
            Self::SampleRateLocked => 0,
            Self::DigitalInAutoMute => 14,
        }
    }
}

pub type CardFlags = Mask<CardFlag>;

const WRITABLE_CARD_FLAGS: &[CardFlag] = &[CardFlag::SampleRateLocked];

/// The change of mixer control to be notified.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ControlChange {
    InputClock,
    OutputClock,
    DigitalMode,
    Spdif,
    Flags,
    PhantomPower,
    DigitalInAutoMute,
    OutputLineLevel(usize),
    OutputMute(usize),
    InputLineLevel(usize),
    InputMute(usize),
    NominalLevel(usize),
    PipePan(usize),
    Monitor { bus_out: usize, bus_in: usize },
    MonitorMute { bus_out: usize, bus_in: usize },
    MonitorPan { bus_out: usize, bus_in: usize },
}

/// The capabilities of card. They are static data of model except for 3G, in which they
/// depend on the detected external box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoGalsCaps {
    pub card_type: CardType,
    pub name: &'static str,
    pub analog_output_count: usize,
    pub digital_output_count: usize,
    pub analog_input_count: usize,
    pub digital_input_count: usize,
    pub midi_port_count: usize,
    pub input_clocks: InputClockMask,
    pub output_clocks: OutputClockMask,
    pub digital_modes: DigitalModeMask,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
    pub has_phantom_power: bool,
    pub has_digital_input_auto_mute: bool,
}

impl EchoGalsCaps {
    fn from_spec(spec: &CardSpec, digital_modes: &[DigitalMode]) -> Self {
        let (min_sample_rate, max_sample_rate) = spec.sample_rates.range();
        Self {
            card_type: spec.card_type,
            name: spec.name,
            analog_output_count: spec.analog_output_count,
            digital_output_count: spec.digital_output_count,
            analog_input_count: spec.analog_input_count,
            digital_input_count: spec.digital_input_count,
            midi_port_count: spec.midi_port_count,
            input_clocks: InputClockMask::from(spec.input_clocks),
            output_clocks: OutputClockMask::from(spec.output_clocks),
            digital_modes: DigitalModeMask::from(digital_modes),
            min_sample_rate,
            max_sample_rate,
            has_phantom_power: spec.has_phantom_power,
            has_digital_input_auto_mute: spec.has_digital_input_auto_mute,
        }
    }

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

/// Latency in sample frames for current sampling rate.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct AudioLatency {
    pub analog_output: u32,
    pub analog_input: u32,
    pub digital_output: u32,
    pub digital_input: u32,
}

/// The data to be polled periodically.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct PolledStuff {
    pub meters: AudioMeters,
    pub clock_detect: InputClockMask,
    pub pending_changes: usize,
}

/// The card.
pub struct EchoGals<'a, O: OsSupport> {
    card_type: CardType,
    dsp: DspCommObject<'a, O>,
    hw_state: HwState,
    flags: CardFlags,
    locked_sample_rate: u32,
    clients: Vec<MixerClient>,
}

impl<'a, O: OsSupport> EchoGals<'a, O> {
    pub fn new(card_type: CardType, os: &'a O) -> Result<Self, Error> {
        let dsp = DspCommObject::new(card_type, os)?;
        Ok(Self {
            card_type,
            dsp,
            hw_state: Default::default(),
            flags: Default::default(),
            locked_sample_rate: 44100,
            clients: Default::default(),
        })
    }

    /// Instantiate the card in non-paged memory.
    pub fn new_non_paged(card_type: CardType, os: &'a O) -> Result<NonPagedBox<'a, Self, O>, Error> {
        let card = Self::new(card_type, os)?;
        NonPagedBox::new(os, card)
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    pub fn dsp(&self) -> &DspCommObject<'a, O> {
        &self.dsp
    }

    pub fn set_dsp_timeouts(&mut self, timeouts: DspTimeouts) {
        self.dsp.set_timeouts(timeouts);
    }

    pub fn hw_state(&self) -> HwState {
        self.hw_state
    }

    /// Load firmware and program initial settings. The card fails permanently once loading
    /// fails.
    pub fn init_hw(&mut self) -> Result<(), Error> {
        match self.hw_state {
            HwState::Ready => return Ok(()),
            HwState::Failed => {
                let msg = "The card failed in initialization";
                Err(status_error(EchoStatusError::DspDead, msg))?;
            }
            HwState::Uninitialized => (),
        }

        if let Err(e) = self.dsp.load_firmware() {
            warn!(card_type = ?self.card_type, "Fail to initialize hardware: {}", e);
            self.hw_state = HwState::Failed;
            return Err(e);
        }
        self.hw_state = HwState::Ready;

        let rate = self.dsp.sample_rate()?;
        self.dsp.set_input_clock(InputClock::Internal)?;
        self.dsp.set_sample_rate(Some(rate))?;
        self.record_change(ControlChange::InputClock);

        debug!(card_type = ?self.card_type, rate, "hardware initialized");

        Ok(())
    }

    fn check_ready(&self) -> Result<(), Error> {
        match self.hw_state {
            HwState::Ready => Ok(()),
            HwState::Uninitialized => {
                let msg = "The card is not initialized yet";
                Err(status_error(EchoStatusError::NotInitialized, msg))
            }
            HwState::Failed => {
                let msg = "The card failed in initialization";
                Err(status_error(EchoStatusError::DspDead, msg))
            }
        }
    }

    fn record_change(&mut self, change: ControlChange) {
        self.clients
            .iter_mut()
            .for_each(|client| client.push(change));
    }

    fn client_position(&self, cookie: MixerCookie) -> Result<usize, Error> {
        self.clients
            .iter()
            .position(|client| client.cookie == cookie)
            .ok_or_else(|| {
                let msg = format!("Mixer client {} is not opened", cookie.0);
                status_error(EchoStatusError::BadCookie, &msg)
            })
    }

    /// Open mixer client to receive changes of mixer controls. The cookie is generated when
    /// it is not given. The cookie of zero or in use is rejected.
    pub fn open_mixer(&mut self, cookie: Option<MixerCookie>) -> Result<MixerCookie, Error> {
        let cookie = match cookie {
            Some(cookie) => {
                if cookie.0 == 0 || self.clients.iter().any(|client| client.cookie == cookie) {
                    let msg = format!("Mixer client {} is not available", cookie.0);
                    Err(status_error(EchoStatusError::BadCookie, &msg))?;
                }
                cookie
            }
            None => {
                let mut val = self.dsp.system_time().max(1);
                while self.clients.iter().any(|client| client.cookie.0 == val) {
                    val = val.wrapping_add(1).max(1);
                }
                MixerCookie(val)
            }
        };

        self.clients.push(MixerClient::new(cookie));
        debug!(cookie = cookie.0, clients = self.clients.len(), "mixer opened");

        Ok(cookie)
    }

    /// Close mixer client. The queued changes are discarded.
    pub fn close_mixer(&mut self, cookie: MixerCookie) -> Result<(), Error> {
        let pos = self.client_position(cookie)?;
        self.clients.remove(pos);
        debug!(cookie = cookie.0, clients = self.clients.len(), "mixer closed");
        Ok(())
    }

    pub fn is_mixer_open(&self) -> bool {
        !self.clients.is_empty()
    }

    /// Drain the queued changes of mixer controls for the client.
    pub fn control_changes(&mut self, cookie: MixerCookie) -> Result<Vec<ControlChange>, Error> {
        let pos = self.client_position(cookie)?;
        Ok(self.clients[pos].changes.drain(..).collect())
    }

    pub fn pending_control_changes(&self, cookie: MixerCookie) -> Result<usize, Error> {
        let pos = self.client_position(cookie)?;
        Ok(self.clients[pos].changes.len())
    }

    /// The name and the number of busses for 3G are decided by the external box detected in
    /// `init_hw()`. Before it, they are for Gina3G.
    pub fn capabilities(&self) -> Result<EchoGalsCaps, Error> {
        let spec = self.dsp.spec()?;
        Ok(EchoGalsCaps::from_spec(&spec, self.dsp.digital_modes()))
    }

    pub fn query_audio_sample_rate(&self, rate: u32) -> Result<u32, Error> {
        self.dsp.query_sample_rate(rate)
    }

    pub fn query_sample_rate_range(&self) -> Result<(u32, u32), Error> {
        self.dsp.spec().map(|spec| spec.sample_rates.range())
    }

    /// Program sampling rate. The rate other than the locked one is rejected while the rate
    /// is locked.
    pub fn set_audio_sample_rate(&mut self, rate: u32) -> Result<u32, Error> {
        self.check_ready()?;
        if self.flags.contains(CardFlag::SampleRateLocked) && rate != self.locked_sample_rate {
            let msg = format!(
                "Sampling rate is locked to {} Hz, {} Hz is rejected",
                self.locked_sample_rate, rate
            );
            Err(status_error(EchoStatusError::Busy, &msg))?;
        }
        self.dsp.set_sample_rate(Some(rate))
    }

    pub fn audio_sample_rate(&self) -> Result<u32, Error> {
        self.dsp.sample_rate()
    }

    /// Keep the rate to be locked. It is applied immediately when the rate is locked.
    pub fn set_audio_locked_sample_rate(&mut self, rate: u32) -> Result<(), Error> {
        let rate = self.dsp.query_sample_rate(rate)?;
        if self.flags.contains(CardFlag::SampleRateLocked) {
            self.check_ready()?;
            self.dsp.set_sample_rate(Some(rate))?;
        }
        self.locked_sample_rate = rate;
        Ok(())
    }

    pub fn audio_locked_sample_rate(&self) -> u32 {
        self.locked_sample_rate
    }

    pub fn flags(&self) -> CardFlags {
        let mut flags = self.flags;
        if self.dsp.digital_input_auto_mute().unwrap_or(false) {
            flags.insert(CardFlag::DigitalInAutoMute);
        }
        flags
    }

    /// Set writable flags. Read only flags are ignored.
    pub fn set_flags(&mut self, flags: CardFlags) {
        WRITABLE_CARD_FLAGS
            .iter()
            .filter(|&&flag| flags.contains(flag))
            .for_each(|&flag| self.flags.insert(flag));
        self.record_change(ControlChange::Flags);
    }

    /// Clear writable flags. Read only flags are ignored.
    pub fn clear_flags(&mut self, flags: CardFlags) {
        WRITABLE_CARD_FLAGS
            .iter()
            .filter(|&&flag| flags.contains(flag))
            .for_each(|&flag| self.flags.remove(flag));
        self.record_change(ControlChange::Flags);
    }

    pub fn input_clock_detect(&self) -> Result<InputClockMask, Error> {
        self.dsp.input_clock_detect()
    }

    pub fn set_input_clock(&mut self, clock: InputClock) -> Result<(), Error> {
        self.check_ready()?;
        self.dsp.set_input_clock(clock)?;
        self.record_change(ControlChange::InputClock);
        Ok(())
    }

    pub fn input_clock(&self) -> Result<InputClock, Error> {
        self.dsp.input_clock()
    }

    pub fn set_output_clock(&mut self, clock: OutputClock) -> Result<(), Error> {
        self.check_ready()?;
        self.dsp.set_output_clock(clock)?;
        self.record_change(ControlChange::OutputClock);
        Ok(())
    }

    pub fn output_clock(&self) -> Result<OutputClock, Error> {
        self.dsp.output_clock()
    }

    pub fn digital_modes(&self) -> &'static [DigitalMode] {
        self.dsp.digital_modes()
    }

    /// Switch the mode of digital interface. The mode is not changed while any pipe is
    /// running. All of levels are sent again when entering or leaving ADAT mode.
    pub fn set_digital_mode(&mut self, mode: DigitalMode) -> Result<(), Error> {
        self.check_ready()?;

        if self.dsp.digital_modes().is_empty() {
            let msg = format!("{:?} has no digital mode", self.card_type);
            Err(status_error(EchoStatusError::DigitalModeNotSupported, &msg))?;
        }

        if self.dsp.is_transport_active() {
            let msg = "Digital mode is not changed while transport is active";
            Err(status_error(EchoStatusError::Busy, msg))?;
        }

        let old = self.dsp.digital_mode()?;
        let res = self.dsp.set_digital_mode(mode);

        // The input clock may be changed as well.
        self.record_change(ControlChange::DigitalMode);
        self.record_change(ControlChange::InputClock);
        res?;

        if old != mode && (old == DigitalMode::Adat || mode == DigitalMode::Adat) {
            self.dsp.refresh_levels()?;
        }

        if mode == DigitalMode::Adat
            && self.flags.contains(CardFlag::SampleRateLocked)
            && self.locked_sample_rate > 48000
        {
            self.locked_sample_rate = 48000;
        }

        Ok(())
    }

    pub fn digital_mode(&self) -> Result<DigitalMode, Error> {
        self.dsp.digital_mode()
    }

    pub fn set_professional_spdif(&mut self, enable: bool) -> Result<(), Error> {
        self.check_ready()?;
        self.dsp.set_professional_spdif(enable)?;
        self.record_change(ControlChange::Spdif);
        Ok(())
    }

    pub fn is_professional_spdif(&self) -> bool {
        self.dsp.is_professional_spdif()
    }

    pub fn set_spdif_out_non_audio(&mut self, enable: bool) -> Result<(), Error> {
        self.check_ready()?;
        self.dsp.set_spdif_out_non_audio(enable)?;
        self.record_change(ControlChange::Spdif);
        Ok(())
    }

    pub fn is_spdif_out_non_audio(&self) -> bool {
        self.dsp.is_spdif_out_non_audio()
    }

    pub fn set_digital_input_auto_mute(&mut self, enable: bool) -> Result<(), Error> {
        self.check_ready()?;
        self.dsp.set_digital_input_auto_mute(enable)?;
        self.record_change(ControlChange::DigitalInAutoMute);
        Ok(())
    }

    pub fn digital_input_auto_mute(&self) -> Result<bool, Error> {
        self.dsp.digital_input_auto_mute()
    }

    /// Supply phantom power. No-op for models without the feature.
    pub fn set_phantom_power(&mut self, on: bool) -> Result<(), Error> {
        self.check_ready()?;
        if !self.dsp.spec()?.has_phantom_power {
            return Ok(());
        }
        self.dsp.set_phantom_power(on)?;
        self.record_change(ControlChange::PhantomPower);
        Ok(())
    }

    pub fn phantom_power(&self) -> bool {
        self.dsp.phantom_power()
    }

    /// Start the pipes at once. The pipes already running are rejected.
    pub fn start(&mut self, mask: u32) -> Result<(), Error> {
        self.check_ready()?;

        let running = self.dsp.active_pipes() & mask;
        if running > 0 {
            let msg = format!("Pipes 0x{:08x} are already running", running);
            Err(status_error(EchoStatusError::Busy, &msg))?;
        }

        self.dsp.start_transport(mask)
    }

    pub fn stop(&mut self, mask: u32) -> Result<(), Error> {
        self.check_ready()?;
        self.dsp.stop_transport(mask)
    }

    pub fn reset(&mut self, mask: u32) -> Result<(), Error> {
        self.check_ready()?;
        self.dsp.reset_transport(mask)
    }

    pub fn active_pipes(&self) -> u32 {
        self.dsp.active_pipes()
    }

    /// The latency for current sampling rate.
    pub fn audio_latency(&self) -> Result<AudioLatency, Error> {
        let spec = self.dsp.spec()?;
        let double_speed = self.dsp.sample_rate()? > SINGLE_SPEED_MAX_RATE;
        let l = &spec.latency;
        Ok(AudioLatency {
            analog_output: if double_speed {
                l.analog_output_2x
            } else {
                l.analog_output_1x
            },
            analog_input: if double_speed {
                l.analog_input_2x
            } else {
                l.analog_input_1x
            },
            digital_output: l.digital_output,
            digital_input: l.digital_input,
        })
    }

    /// The latency of pipe. The index of pipe is counted separately for output and input.
    pub fn pipe_latency(&self, pipe: usize, is_input: bool) -> Result<u32, Error> {
        let spec = self.dsp.spec()?;
        let (analog, total) = if is_input {
            (spec.analog_input_count, spec.bus_input_count())
        } else {
            (spec.analog_output_count, spec.bus_output_count())
        };
        if pipe >= total {
            let msg = format!("Pipe {} is out of range", pipe);
            Err(status_error(EchoStatusError::InvalidChannel, &msg))?;
        }

        let latency = self.audio_latency()?;
        let frames = match (is_input, pipe >= analog) {
            (false, false) => latency.analog_output,
            (false, true) => latency.digital_output,
            (true, false) => latency.analog_input,
            (true, true) => latency.digital_input,
        };
        Ok(frames)
    }

    pub fn set_output_line_level(&mut self, bus: usize, gain: i8) -> Result<(), Error> {
        self.dsp.set_output_line_level(bus, gain, true)?;
        self.record_change(ControlChange::OutputLineLevel(bus));
        Ok(())
    }

    pub fn output_line_level(&self, bus: usize) -> Result<i8, Error> {
        self.dsp.output_line_level(bus)
    }

    pub fn set_input_line_level(&mut self, bus: usize, gain: i8) -> Result<(), Error> {
        self.dsp.set_input_line_level(bus, gain)?;
        self.record_change(ControlChange::InputLineLevel(bus));
        Ok(())
    }

    pub fn input_line_level(&self, bus: usize) -> Result<i8, Error> {
        self.dsp.input_line_level(bus)
    }

    pub fn set_output_mute(&mut self, bus: usize, mute: bool) -> Result<(), Error> {
        self.dsp.set_output_mute(bus, mute)?;
        self.record_change(ControlChange::OutputMute(bus));
        Ok(())
    }

    pub fn output_mute(&self, bus: usize) -> Result<bool, Error> {
        self.dsp.output_mute(bus)
    }

    pub fn set_input_mute(&mut self, bus: usize, mute: bool) -> Result<(), Error> {
        self.dsp.set_input_mute(bus, mute)?;
        self.record_change(ControlChange::InputMute(bus));
        Ok(())
    }

    pub fn input_mute(&self, bus: usize) -> Result<bool, Error> {
        self.dsp.input_mute(bus)
    }

    pub fn set_audio_pan(&mut self, pipe: usize, pan: u16) -> Result<(), Error> {
        self.dsp.set_audio_pan(pipe, pan)?;
        self.record_change(ControlChange::PipePan(pipe));
        Ok(())
    }

    pub fn audio_pan(&self, pipe: usize) -> Result<u16, Error> {
        self.dsp.audio_pan(pipe)
    }

    pub fn set_nominal_level(&mut self, bus: usize, consumer: bool) -> Result<(), Error> {
        self.dsp.set_nominal_level(bus, consumer)?;
        self.record_change(ControlChange::NominalLevel(bus));
        Ok(())
    }

    pub fn nominal_level(&self, bus: usize) -> Result<bool, Error> {
        self.dsp.nominal_level(bus)
    }

    pub fn set_audio_monitor(&mut self, bus_out: usize, bus_in: usize, gain: i8) -> Result<(), Error> {
        self.dsp.set_audio_monitor(bus_out, bus_in, gain, true)?;
        self.record_change(ControlChange::Monitor { bus_out, bus_in });
        Ok(())
    }

    pub fn audio_monitor(&self, bus_out: usize, bus_in: usize) -> Result<i8, Error> {
        self.dsp.audio_monitor(bus_out, bus_in)
    }

    pub fn set_audio_monitor_mute(
        &mut self,
        bus_out: usize,
        bus_in: usize,
        mute: bool,
    ) -> Result<(), Error> {
        self.dsp.set_audio_monitor_mute(bus_out, bus_in, mute)?;
        self.record_change(ControlChange::MonitorMute { bus_out, bus_in });
        Ok(())
    }

    pub fn audio_monitor_mute(&self, bus_out: usize, bus_in: usize) -> Result<bool, Error> {
        self.dsp.audio_monitor_mute(bus_out, bus_in)
    }

    pub fn set_audio_monitor_pan(
        &mut self,
        bus_out: usize,
        bus_in: usize,
        pan: u16,
    ) -> Result<(), Error> {
        self.dsp.set_audio_monitor_pan(bus_out, bus_in, pan)?;
        self.record_change(ControlChange::MonitorPan { bus_out, bus_in });
        Ok(())
    }

    pub fn audio_monitor_pan(&self, bus_out: usize, bus_in: usize) -> Result<u16, Error> {
        self.dsp.audio_monitor_pan(bus_out, bus_in)
    }

    pub fn set_meters_on(&self, on: bool) -> Result<(), Error> {
        self.dsp.set_meters_on(on)
    }

    pub fn audio_meters(&self) -> Result<AudioMeters, Error> {
        self.dsp.audio_meters()
    }

    pub fn polled_stuff(&self, cookie: MixerCookie) -> Result<PolledStuff, Error> {
        let pending_changes = self.pending_control_changes(cookie)?;
        Ok(PolledStuff {
            meters: self.dsp.audio_meters()?,
            clock_detect: self.dsp.input_clock_detect()?,
            pending_changes,
        })
    }
}

#[cfg(test)]
mod test {
    use {
        super::*, crate::echo3g::*, crate::emulator::*, crate::firmware::*, crate::mixer::*,
    };

    fn ready(os: &EmulatedCard, card_type: CardType) -> EchoGals<'_, EmulatedCard> {
        let mut card = EchoGals::new(card_type, os).unwrap();
        card.init_hw().unwrap();
        card
    }

    #[test]
    fn gina24_initialization() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let mut card = EchoGals::new(CardType::Gina24, &os).unwrap();
        assert_eq!(card.hw_state(), HwState::Uninitialized);
        let cookie = card.open_mixer(None).unwrap();

        card.init_hw().unwrap();
        assert_eq!(card.hw_state(), HwState::Ready);
        assert_eq!(card.card_type(), CardType::Gina24);
        assert_eq!(card.input_clock().unwrap(), InputClock::Internal);
        assert_eq!(card.capabilities().unwrap().name, "Gina24");
        assert_eq!(
            card.control_changes(cookie).unwrap(),
            vec![ControlChange::InputClock]
        );

        // Initialized already.
        card.init_hw().unwrap();
    }

    #[test]
    fn failed_initialization() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        os.set_dsp_boots(false);
        let mut card = EchoGals::new(CardType::Gina24, &os).unwrap();

        let err = card.init_hw().unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::DspTimeout));
        assert_eq!(card.hw_state(), HwState::Failed);

        os.set_dsp_boots(true);
        let err = card.init_hw().unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::DspDead));

        let err = card.start(0x1).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::DspDead));
    }

    #[test]
    fn mona_unsupported_digital_mode() {
        let os = EmulatedCard::new(CardType::Mona, DspDevice::Dsp56361);
        let mut card = ready(&os, CardType::Mona);

        os.clear_logs();
        let err = card.set_digital_mode(DigitalMode::SpdifCdrom).unwrap_err();
        assert_eq!(
            err.kind::<EchoStatusError>(),
            Some(EchoStatusError::DigitalModeNotSupported)
        );
        assert!(os.outvol_updates().is_empty());
        assert_eq!(card.digital_mode().unwrap(), DigitalMode::SpdifRca);
    }

    #[test]
    fn layla24_asic_timeout() {
        let os = EmulatedCard::new(CardType::Layla24, DspDevice::Dsp56301);
        let mut card = ready(&os, CardType::Layla24);
        let active = os.active_asic(EXTERNAL_ASIC_SLOT);
        assert_eq!(active, Some(FirmwareId::Layla24Asic2S));

        card.set_audio_monitor(0, 0, -6).unwrap();

        os.clear_logs();
        os.set_asic_ready_polls(None);
        let err = card.set_digital_mode(DigitalMode::Adat).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::AsicNotLoaded));
        assert_eq!(os.active_asic(EXTERNAL_ASIC_SLOT), active);
        assert_eq!(card.digital_mode().unwrap(), DigitalMode::SpdifRca);

        // The monitors are muted during the switch, then sent again.
        assert_eq!(os.outvol_updates(), vec![true, false]);
        assert_eq!(card.audio_monitor(0, 0).unwrap(), -6);
    }

    #[test]
    fn echo3g_latency() {
        let os = EmulatedCard::new(CardType::Echo3g, DspDevice::Dsp56361);
        let mut card = ready(&os, CardType::Echo3g);

        card.set_audio_sample_rate(48000).unwrap();
        assert_eq!(card.audio_latency().unwrap().analog_output, 45);
        assert_eq!(card.pipe_latency(0, false).unwrap(), 45);

        card.set_audio_sample_rate(96000).unwrap();
        assert_eq!(card.audio_latency().unwrap().analog_output, 38);
        assert_eq!(card.pipe_latency(0, false).unwrap(), 38);

        let caps = card.capabilities().unwrap();
        let digital = caps.analog_output_count;
        assert_eq!(card.pipe_latency(digital, false).unwrap(), 33);

        let err = card.pipe_latency(caps.bus_output_count(), false).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidChannel));
    }

    #[test]
    fn echo3g_capabilities_by_box() {
        let os = EmulatedCard::new(CardType::Echo3g, DspDevice::Dsp56361);
        os.set_box_type(Echo3gBoxType::Layla3g);
        let mut card = EchoGals::new(CardType::Echo3g, &os).unwrap();

        let caps = card.capabilities().unwrap();
        assert_eq!(caps.name, "Gina3G");
        assert_eq!(caps.midi_port_count, 0);

        card.init_hw().unwrap();
        let caps = card.capabilities().unwrap();
        assert_eq!(caps.name, "Layla3G");
        assert_eq!(caps.midi_port_count, 1);
        assert_eq!(caps.analog_output_count, 8);
    }

    #[test]
    fn transport_rules() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let mut card = EchoGals::new(CardType::Gina24, &os).unwrap();

        let err = card.start(0x3).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::NotInitialized));

        card.init_hw().unwrap();
        card.start(0x3).unwrap();

        let err = card.start(0x2).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::Busy));

        card.start(0x4).unwrap();
        assert_eq!(card.active_pipes(), 0x7);

        let err = card.set_digital_mode(DigitalMode::SpdifOptical).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::Busy));
        assert_eq!(card.digital_mode().unwrap(), DigitalMode::SpdifRca);

        card.stop(0x7).unwrap();
        assert_eq!(card.active_pipes(), 0);
        card.set_digital_mode(DigitalMode::SpdifOptical).unwrap();
    }

    #[test]
    fn capabilities_stay() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let mut card = ready(&os, CardType::Gina24);
        let caps = card.capabilities().unwrap();

        card.set_audio_sample_rate(96000).unwrap();
        card.set_digital_mode(DigitalMode::SpdifOptical).unwrap();
        card.set_output_line_level(0, -12).unwrap();
        card.set_phantom_power(true).unwrap();
        assert_eq!(card.capabilities().unwrap(), caps);
        assert!(!card.phantom_power());
    }

    #[test]
    fn adat_switch_resends_levels() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let mut card = ready(&os, CardType::Gina24);

        os.clear_logs();
        card.set_digital_mode(DigitalMode::Adat).unwrap();
        assert!(os.vector_log().contains(&DSP_VC_UPDATE_INGAIN));

        os.clear_logs();
        card.set_digital_mode(DigitalMode::Adat).unwrap();
        assert!(!os.vector_log().contains(&DSP_VC_UPDATE_INGAIN));
    }

    #[test]
    fn locked_sample_rate() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let mut card = ready(&os, CardType::Gina24);

        card.set_audio_locked_sample_rate(96000).unwrap();
        assert_eq!(card.audio_sample_rate().unwrap(), 44100);

        card.set_flags(CardFlags::from(&[CardFlag::SampleRateLocked][..]));
        assert!(card.flags().contains(CardFlag::SampleRateLocked));
        card.set_audio_locked_sample_rate(96000).unwrap();
        assert_eq!(card.audio_sample_rate().unwrap(), 96000);

        let err = card.set_audio_sample_rate(44100).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::Busy));

        card.set_digital_mode(DigitalMode::Adat).unwrap();
        assert_eq!(card.audio_locked_sample_rate(), 48000);
        assert_eq!(card.audio_sample_rate().unwrap(), 48000);

        // Read only flag is not cleared.
        card.clear_flags(CardFlags::from(CardFlag::ALL));
        assert!(!card.flags().contains(CardFlag::SampleRateLocked));
        card.set_audio_sample_rate(44100).unwrap();
    }

    #[test]
    fn control_change_queue() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let mut card = ready(&os, CardType::Gina24);
        let cookie = card.open_mixer(None).unwrap();

        card.set_output_line_level(1, -6).unwrap();
        card.set_output_line_level(1, -12).unwrap();
        card.set_audio_monitor(0, 1, -20).unwrap();
        card.set_professional_spdif(true).unwrap();
        assert_eq!(card.polled_stuff(cookie).unwrap().pending_changes, 3);

        assert_eq!(
            card.control_changes(cookie).unwrap(),
            vec![
                ControlChange::OutputLineLevel(1),
                ControlChange::Monitor {
                    bus_out: 0,
                    bus_in: 1
                },
                ControlChange::Spdif,
            ]
        );
        assert!(card.control_changes(cookie).unwrap().is_empty());

        (0..(MAX_CONTROL_CHANGES + 4)).for_each(|i| {
            card.record_change(ControlChange::OutputLineLevel(i));
        });
        assert_eq!(card.pending_control_changes(cookie).unwrap(), MAX_CONTROL_CHANGES);
    }

    #[test]
    fn mixer_clients() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let mut card = ready(&os, CardType::Gina24);
        assert!(!card.is_mixer_open());

        // Without any client, the change is not queued.
        card.set_output_line_level(0, -3).unwrap();

        let first = card.open_mixer(Some(MixerCookie(0x1234))).unwrap();
        assert_eq!(first, MixerCookie(0x1234));
        assert!(card.is_mixer_open());

        let err = card.open_mixer(Some(MixerCookie(0x1234))).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::BadCookie));
        let err = card.open_mixer(Some(MixerCookie(0))).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::BadCookie));

        let second = card.open_mixer(None).unwrap();
        assert_ne!(second, first);
        assert_ne!(second.0, 0);
        let third = card.open_mixer(None).unwrap();
        assert_ne!(third, second);

        card.set_input_line_level(1, -10).unwrap();
        assert_eq!(
            card.control_changes(first).unwrap(),
            vec![ControlChange::InputLineLevel(1)]
        );
        card.set_phantom_power(true).unwrap();
        card.set_professional_spdif(true).unwrap();

        // Each client has own queue.
        assert_eq!(card.control_changes(first).unwrap(), vec![ControlChange::Spdif]);
        assert_eq!(
            card.control_changes(second).unwrap(),
            vec![ControlChange::InputLineLevel(1), ControlChange::Spdif]
        );
        assert_eq!(card.pending_control_changes(third).unwrap(), 2);

        card.close_mixer(second).unwrap();
        let err = card.close_mixer(second).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::BadCookie));
        let err = card.control_changes(second).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::BadCookie));
        let err = card.polled_stuff(second).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::BadCookie));

        // The closed cookie is available again.
        assert_eq!(card.open_mixer(Some(second)).unwrap(), second);
        assert_eq!(card.pending_control_changes(second).unwrap(), 0);

        card.close_mixer(first).unwrap();
        card.close_mixer(second).unwrap();
        card.close_mixer(third).unwrap();
        assert!(!card.is_mixer_open());
    }

    #[test]
    fn mute_and_pan_changes() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let mut card = ready(&os, CardType::Gina24);
        let cookie = card.open_mixer(None).unwrap();

        card.set_output_mute(1, true).unwrap();
        assert!(card.output_mute(1).unwrap());
        card.set_input_mute(0, true).unwrap();
        assert!(card.input_mute(0).unwrap());
        card.set_audio_pan(2, 500).unwrap();
        assert_eq!(card.audio_pan(2).unwrap(), 500);
        assert_eq!(card.audio_pan(3).unwrap(), 500);
        card.set_audio_monitor_mute(0, 1, true).unwrap();
        assert!(card.audio_monitor_mute(0, 1).unwrap());
        card.set_audio_monitor_pan(0, 1, 250).unwrap();
        assert_eq!(card.audio_monitor_pan(1, 1).unwrap(), 250);

        assert_eq!(
            card.control_changes(cookie).unwrap(),
            vec![
                ControlChange::OutputMute(1),
                ControlChange::InputMute(0),
                ControlChange::PipePan(2),
                ControlChange::MonitorMute {
                    bus_out: 0,
                    bus_in: 1
                },
                ControlChange::MonitorPan {
                    bus_out: 0,
                    bus_in: 1
                },
            ]
        );

        // The rejected change is not queued.
        let err = card.set_output_line_level(0, OUTPUT_GAIN_MAX + 1).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidParam));
        let err = card.set_audio_pan(0, MAX_MIXER_PAN + 1).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidParam));
        assert_eq!(card.pending_control_changes(cookie).unwrap(), 0);
    }

    #[test]
    fn non_paged_card() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        {
            let mut card = EchoGals::new_non_paged(CardType::Gina24, &os).unwrap();
            assert_eq!(os.non_paged_block_count(), 1);
            card.init_hw().unwrap();
        }
        assert_eq!(os.non_paged_block_count(), 0);
        assert!(os.is_comatose());
        assert_eq!(os.page_block_count(), 0);

        os.set_alloc_failure(true);
        let err = EchoGals::new_non_paged(CardType::Gina24, &os).err().unwrap();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::NoMem));
    }
}
