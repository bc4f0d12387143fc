// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Protocol to communicate with DSP.
//!
//! The module includes structure, enumeration, and trait and its implementation for the
//! communication object of DSP. The object owns the communication page shared with DSP, loads
//! the DSP code and the ASIC images, and programs sampling rate, clock source, digital mode,
//! and mixer state by writing to the page and sending vector commands.
//!
//! Any sequence which writes to the page or registers is done with the lock of the object,
//! thus the muting of monitors, the transfer of ASIC image, the polling of its readiness, and
//! the restoring of monitors are not interleaved with any other control operation.

use {
    super::{
        comm_page::*, echo3g::*, firmware::*, gina24::*, layla20::*, layla24::*, mixer::*,
        mona::*, os_support::*, *,
    },
    std::sync::{Mutex, MutexGuard},
    tracing::{debug, debug_span, warn},
};

pub(crate) const CHI32_CONTROL_REG: usize = 4;
pub(crate) const CHI32_STATUS_REG: usize = 5;
pub(crate) const CHI32_VECTOR_REG: usize = 6;
pub(crate) const CHI32_DATA_REG: usize = 7;

pub(crate) const CHI32_VECTOR_BUSY: u32 = 0x00000001;
pub(crate) const CHI32_STATUS_HOST_WRITE_EMPTY: u32 = 0x00000002;
pub(crate) const CHI32_STATUS_HOST_READ_FULL: u32 = 0x00000004;
pub(crate) const CHI32_STATUS_REG_HF3: u32 = 0x00000008;
pub(crate) const CHI32_STATUS_REG_HF4: u32 = 0x00000010;
pub(crate) const CHI32_STATUS_REG_HF5: u32 = 0x00000020;

// Bits in control register to select 24 bit mode of host interface.
const CHI32_CONTROL_24BIT_FORMAT: u32 = 0x00000900;
const CHI32_CONTROL_LOADER_MASK: u32 = 0x00001b00;

pub(crate) const DSP_VC_RESET: u32 = 0x80ff;
pub(crate) const DSP_VC_START_TRANSFER: u32 = 0x0075;
pub(crate) const DSP_VC_METERS_ON: u32 = 0x0079;
pub(crate) const DSP_VC_METERS_OFF: u32 = 0x007b;
pub(crate) const DSP_VC_UPDATE_OUTVOL: u32 = 0x007d;
pub(crate) const DSP_VC_UPDATE_INGAIN: u32 = 0x007f;
pub(crate) const DSP_VC_TEST_ASIC: u32 = 0x00eb;
pub(crate) const DSP_VC_UPDATE_CLOCKS: u32 = 0x00ef;
pub(crate) const DSP_VC_SET_LAYLA_SAMPLE_RATE: u32 = 0x00f1;
pub(crate) const DSP_VC_WRITE_CONTROL_REG: u32 = 0x00f1;
pub(crate) const DSP_VC_MIDI_WRITE: u32 = 0x00f5;
pub(crate) const DSP_VC_STOP_TRANSFER: u32 = 0x00f7;
pub(crate) const DSP_VC_GO_COMATOSE: u32 = 0x00f9;
pub(crate) const DSP_VC_SET_LAYLA24_FREQUENCY_REG: u32 = 0x00fb;
pub(crate) const DSP_VC_UPDATE_FLAGS: u32 = 0x00fd;

pub(crate) const DSP_FNC_SET_COMMPAGE_ADDR: u32 = 0x02;
pub(crate) const DSP_FNC_LOAD_PCI_CARD_ASIC: u32 = 0xa0;
pub(crate) const DSP_FNC_LOAD_EXTERNAL_ASIC: u32 = 0xa1;

pub(crate) const ASIC_LOADED: u32 = 0x1;
pub(crate) const ASIC_NOT_LOADED: u32 = 0x0;

pub(crate) const DSP_FLAG_MIDI_INPUT: u32 = 0x0001;
pub(crate) const DSP_FLAG_SPDIF_NONAUDIO: u32 = 0x0002;
pub(crate) const DSP_FLAG_PROFESSIONAL_SPDIF: u32 = 0x0008;

const SERIAL_NUMBER_WORDS: usize = 5;

const MIDI_ACTIVITY_TIMEOUT_USEC: u64 = 200000;

// The interval to poll registers and the page.
const POLL_INTERVAL_USEC: u64 = 2;

/// The windows to wait for response of DSP, in microseconds unless explicitly named.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DspTimeouts {
    /// For host write register to be empty.
    pub write_usec: u64,
    /// For host read register to be full.
    pub read_usec: u64,
    /// For vector register to be idle.
    pub vector_busy_usec: u64,
    /// For the handshake in communication page.
    pub handshake_usec: u64,
    /// For HF3 after software reset.
    pub reset_usec: u64,
    /// For HF4 after transfer of DSP code.
    pub boot_usec: u64,
    /// For HF5 after transfer of resident loader.
    pub resident_loader_usec: u64,
    /// The minimum interval between attempts to load firmware while ASIC is not loaded.
    pub load_attempt_period_usec: u64,
    /// The number of polls for ASIC to be ready after transfer of its image.
    pub asic_poll_retries: u32,
    /// The interval between the polls.
    pub asic_poll_interval_usec: u64,
}

impl Default for DspTimeouts {
    fn default() -> Self {
        Self {
            write_usec: 10000000,
            read_usec: 1000000,
            vector_busy_usec: 100000,
            handshake_usec: 20000,
            reset_usec: 10000,
            boot_usec: 500000,
            resident_loader_usec: 10000,
            load_attempt_period_usec: 1000000,
            asic_poll_retries: 10,
            asic_poll_interval_usec: 1000,
        }
    }
}

/// The format of audio data in the buffer of pipe.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    /// The number of channels in a frame of the buffer.
    pub interleave: u16,
    pub bits_per_sample: u16,
    /// Whether a mono buffer is delivered to both channels.
    pub mono_to_stereo: bool,
    pub big_endian: bool,
}

const DSP_AUDIOFORM_MS_8: u16 = 0;
const DSP_AUDIOFORM_MS_16LE: u16 = 1;
const DSP_AUDIOFORM_MS_24LE: u16 = 2;
const DSP_AUDIOFORM_MS_32LE: u16 = 3;
const DSP_AUDIOFORM_SS_8: u16 = 4;
const DSP_AUDIOFORM_SS_16LE: u16 = 5;
const DSP_AUDIOFORM_SS_24LE: u16 = 6;
const DSP_AUDIOFORM_SS_32LE: u16 = 7;
const DSP_AUDIOFORM_MM_32LE: u16 = 8;
const DSP_AUDIOFORM_MM_32BE: u16 = 9;
const DSP_AUDIOFORM_SS_32BE: u16 = 10;

const DSP_AUDIOFORM_SUPER_INTERLEAVE_16LE: u16 = 0x40;
const DSP_AUDIOFORM_SUPER_INTERLEAVE_24LE: u16 = 0xc0;
const DSP_AUDIOFORM_SUPER_INTERLEAVE_32LE: u16 = 0x80;
const DSP_AUDIOFORM_SUPER_INTERLEAVE_MASK: u16 = 0xc0;

pub(crate) fn serialize_audio_format(fmt: &AudioFormat) -> Result<u16, Error> {
    let bad_format = || {
        let msg = format!("Unsupported audio format: {:?}", fmt);
        status_error(EchoStatusError::BadFormat, &msg)
    };

    if fmt.interleave == 0 || fmt.interleave >= 0x40 {
        Err(bad_format())?;
    }

    let val = if fmt.interleave > 2 {
        if fmt.big_endian {
            Err(bad_format())?;
        }
        let base = match fmt.bits_per_sample {
            16 => DSP_AUDIOFORM_SUPER_INTERLEAVE_16LE,
            24 => DSP_AUDIOFORM_SUPER_INTERLEAVE_24LE,
            32 => DSP_AUDIOFORM_SUPER_INTERLEAVE_32LE,
            _ => Err(bad_format())?,
        };
        base | fmt.interleave
    } else if fmt.big_endian {
        match (fmt.interleave, fmt.bits_per_sample) {
            (1, 32) => DSP_AUDIOFORM_MM_32BE,
            (2, 32) => DSP_AUDIOFORM_SS_32BE,
            _ => Err(bad_format())?,
        }
    } else {
        let stereo = fmt.interleave == 2;
        match fmt.bits_per_sample {
            32 if !stereo && !fmt.mono_to_stereo => DSP_AUDIOFORM_MM_32LE,
            8 if stereo => DSP_AUDIOFORM_SS_8,
            8 => DSP_AUDIOFORM_MS_8,
            16 if stereo => DSP_AUDIOFORM_SS_16LE,
            16 => DSP_AUDIOFORM_MS_16LE,
            24 if stereo => DSP_AUDIOFORM_SS_24LE,
            24 => DSP_AUDIOFORM_MS_24LE,
            32 if stereo => DSP_AUDIOFORM_SS_32LE,
            32 => DSP_AUDIOFORM_MS_32LE,
            _ => Err(bad_format())?,
        }
    };

    Ok(val)
}

pub(crate) fn deserialize_audio_format(fmt: &mut AudioFormat, val: u16) {
    *fmt = AudioFormat::default();

    match val & DSP_AUDIOFORM_SUPER_INTERLEAVE_MASK {
        DSP_AUDIOFORM_SUPER_INTERLEAVE_16LE => {
            fmt.interleave = val & !DSP_AUDIOFORM_SUPER_INTERLEAVE_MASK;
            fmt.bits_per_sample = 16;
            return;
        }
        DSP_AUDIOFORM_SUPER_INTERLEAVE_24LE => {
            fmt.interleave = val & !DSP_AUDIOFORM_SUPER_INTERLEAVE_MASK;
            fmt.bits_per_sample = 24;
            return;
        }
        DSP_AUDIOFORM_SUPER_INTERLEAVE_32LE => {
            fmt.interleave = val & !DSP_AUDIOFORM_SUPER_INTERLEAVE_MASK;
            fmt.bits_per_sample = 32;
            return;
        }
        _ => (),
    }

    let (interleave, bits_per_sample, mono_to_stereo, big_endian) = match val {
        DSP_AUDIOFORM_MS_8 => (1, 8, true, false),
        DSP_AUDIOFORM_MS_16LE => (1, 16, true, false),
        DSP_AUDIOFORM_MS_24LE => (1, 24, true, false),
        DSP_AUDIOFORM_MS_32LE => (1, 32, true, false),
        DSP_AUDIOFORM_SS_8 => (2, 8, false, false),
        DSP_AUDIOFORM_SS_24LE => (2, 24, false, false),
        DSP_AUDIOFORM_SS_32LE => (2, 32, false, false),
        DSP_AUDIOFORM_MM_32LE => (1, 32, false, false),
        DSP_AUDIOFORM_MM_32BE => (1, 32, false, true),
        DSP_AUDIOFORM_SS_32BE => (2, 32, false, true),
        _ => (2, 16, false, false),
    };
    fmt.interleave = interleave;
    fmt.bits_per_sample = bits_per_sample;
    fmt.mono_to_stereo = mono_to_stereo;
    fmt.big_endian = big_endian;
}

/// The level meters of busses, in 0.5 dB unit.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct AudioMeters {
    pub bus_out_vu: Vec<i8>,
    pub bus_out_peak: Vec<i8>,
    pub bus_in_vu: Vec<i8>,
    pub bus_in_peak: Vec<i8>,
}

/// The state cached by the object and guarded by its lock.
#[derive(Debug)]
pub(crate) struct DspState {
    pub spec: CardSpec,
    /// The DSP code running in DSP.
    pub dsp_code: Option<FirmwareId>,
    pub bad_board: bool,
    pub asic_loaded: bool,
    /// The switchable ASIC image currently active.
    pub asic_code: Option<FirmwareId>,
    pub last_load_attempt: Option<u64>,
    pub sample_rate: u32,
    pub input_clock: InputClock,
    pub output_clock: OutputClock,
    pub digital_mode: DigitalMode,
    pub professional_spdif: bool,
    pub non_audio_spdif: bool,
    pub digital_in_auto_mute: bool,
    pub phantom_power: bool,
    pub meter_on_count: u32,
    pub midi_on_count: u32,
    pub active_pipes: u32,
    pub midi_in_time: Option<u64>,
    pub midi_out_time: Option<u64>,
    pub box_type: Option<Echo3gBoxType>,
    pub mixer: MixerState,
}

impl DspState {
    pub(crate) fn new(spec: CardSpec) -> Self {
        Self {
            spec,
            dsp_code: None,
            bad_board: true,
            asic_loaded: false,
            asic_code: None,
            last_load_attempt: None,
            sample_rate: 44100,
            input_clock: Default::default(),
            output_clock: Default::default(),
            digital_mode: Default::default(),
            professional_spdif: false,
            non_audio_spdif: false,
            digital_in_auto_mute: true,
            phantom_power: false,
            meter_on_count: 0,
            midi_on_count: 0,
            active_pipes: 0,
            midi_in_time: None,
            midi_out_time: None,
            box_type: None,
            mixer: Default::default(),
        }
    }
}

/// The operations which differ between models. Any of them is called with the lock of object.
pub(crate) trait DspModelOperation {
    fn card_spec(device: DspDevice) -> CardSpec;

    fn dsp_code(device: DspDevice) -> FirmwareId;

    fn digital_modes(device: DspDevice) -> &'static [DigitalMode] {
        Self::card_spec(device).digital_modes
    }

    /// Transfer ASIC image(s) and wait for them to be ready.
    fn load_asic<O: OsSupport>(dsp: &DspCommObject<O>, st: &mut DspState) -> Result<(), Error>;

    fn check_asic_status<O: OsSupport>(dsp: &DspCommObject<O>, st: &mut DspState) -> bool {
        dsp.test_asic(st)
    }

    /// Program the rate, which is already validated for the model.
    fn set_sample_rate<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        rate: u32,
    ) -> Result<(), Error>;

    fn set_input_clock<O: OsSupport>(
        dsp: &DspCommObject<O>,
        st: &mut DspState,
        clock: InputClock,
    ) -> Result<(), Error>;

    fn set_output_clock<O: OsSupport>(
        _: &DspCommObject<O>,
        _: &mut DspState,
        clock: OutputClock,
    ) -> Result<(), Error> {
        let msg = format!("Output clock is not supported: {:?}", clock);
        Err(status_error(EchoStatusError::ClockNotSupported, &msg))
    }

    fn set_digital_mode<O: OsSupport>(
        _: &DspCommObject<O>,
        _: &mut DspState,
        mode: DigitalMode,
    ) -> Result<(), Error> {
        let msg = format!("Digital mode is not supported: {:?}", mode);
        Err(status_error(EchoStatusError::DigitalModeNotSupported, &msg))
    }

    /// Parse the bits of detected clocks reported by DSP.
    fn detect_input_clocks(status: u32, st: &DspState) -> InputClockMask;

    fn set_professional_spdif<O: OsSupport>(
        dsp: &DspCommObject<O>,
        _: &mut DspState,
        enable: bool,
    ) -> Result<(), Error> {
        dsp.update_dsp_flags(DSP_FLAG_PROFESSIONAL_SPDIF, enable)
    }

    fn set_spdif_out_non_audio<O: OsSupport>(
        dsp: &DspCommObject<O>,
        _: &mut DspState,
        enable: bool,
    ) -> Result<(), Error> {
        dsp.update_dsp_flags(DSP_FLAG_SPDIF_NONAUDIO, enable)
    }

    fn set_phantom_power<O: OsSupport>(
        _: &DspCommObject<O>,
        _: &mut DspState,
        _: bool,
    ) -> Result<(), Error> {
        Ok(())
    }
}

macro_rules! model_op {
    ($card_type:expr, $func:ident($($arg:expr),* $(,)?)) => {
        match $card_type {
            CardType::Gina24 => <Gina24Protocol as DspModelOperation>::$func($($arg),*),
            CardType::Layla20 => <Layla20Protocol as DspModelOperation>::$func($($arg),*),
            CardType::Layla24 => <Layla24Protocol as DspModelOperation>::$func($($arg),*),
            CardType::Mona => <MonaProtocol as DspModelOperation>::$func($($arg),*),
            CardType::Echo3g => <Echo3gProtocol as DspModelOperation>::$func($($arg),*),
        }
    };
}

/// The communication object of DSP.
pub struct DspCommObject<'a, O: OsSupport> {
    os: &'a O,
    card_type: CardType,
    device: DspDevice,
    timeouts: DspTimeouts,
    comm_page: CommPage<O::PageBlock>,
    state: Mutex<DspState>,
}

impl<'a, O: OsSupport> DspCommObject<'a, O> {
    /// Instantiate the object with the communication page allocated by the operating system.
    pub fn new(card_type: CardType, os: &'a O) -> Result<Self, Error> {
        let device = os.dsp_device();
        let block = os
            .alloc_phys_page_block(COMM_PAGE_PHYS_BYTES)
            .map_err(|e| {
                let msg = format!("Fail to allocate communication page: {}", e);
                status_error(EchoStatusError::NoMem, &msg)
            })?;
        let comm_page = CommPage::new(block);
        let spec = model_op!(card_type, card_spec(device));

        debug!(
            card = spec.name,
            ?device,
            phys_addr = comm_page.phys_addr(),
            "communication page allocated"
        );

        Ok(Self {
            os,
            card_type,
            device,
            timeouts: Default::default(),
            comm_page,
            state: Mutex::new(DspState::new(spec)),
        })
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    pub fn dsp_device(&self) -> DspDevice {
        self.device
    }

    pub fn timeouts(&self) -> &DspTimeouts {
        &self.timeouts
    }

    pub fn set_timeouts(&mut self, timeouts: DspTimeouts) {
        self.timeouts = timeouts;
    }

    pub fn comm_page(&self) -> &CommPage<O::PageBlock> {
        &self.comm_page
    }

    pub(crate) fn os(&self) -> &O {
        self.os
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, DspState>, Error> {
        self.state.lock().map_err(|_| {
            let msg = "The state of DSP is poisoned by former failure";
            status_error(EchoStatusError::DspDead, msg)
        })
    }

    pub fn system_time(&self) -> u64 {
        self.os.system_time()
    }

    pub(crate) fn dsp_register(&self, offset: usize) -> u32 {
        self.os.dsp_registers().read_register(offset)
    }

    pub(crate) fn set_dsp_register(&self, offset: usize, val: u32) {
        self.os.dsp_registers().write_register(offset, val)
    }

    // Poll the status register till the flag is set or the window passes.
    fn wait_for_status(&self, flag: u32, usec: u64) -> bool {
        let timeout = self.os.system_time() + usec;
        loop {
            if self.dsp_register(CHI32_STATUS_REG) & flag > 0 {
                break true;
            }
            if self.os.system_time() > timeout {
                break false;
            }
            self.os.snooze(POLL_INTERVAL_USEC);
        }
    }

    /// Write a word to the data register. The timeout marks the board as bad till DSP is
    /// loaded again.
    pub(crate) fn write_dsp(&self, st: &mut DspState, val: u32) -> Result<(), Error> {
        if self.wait_for_status(CHI32_STATUS_HOST_WRITE_EMPTY, self.timeouts.write_usec) {
            self.set_dsp_register(CHI32_DATA_REG, val);
            Ok(())
        } else {
            st.bad_board = true;
            let msg = "Timeout to wait for host write register to be empty";
            Err(status_error(EchoStatusError::DspTimeout, msg))
        }
    }

    /// Read a word from the data register. The timeout marks the board as bad till DSP is
    /// loaded again.
    pub(crate) fn read_dsp(&self, st: &mut DspState) -> Result<u32, Error> {
        if self.wait_for_status(CHI32_STATUS_HOST_READ_FULL, self.timeouts.read_usec) {
            Ok(self.dsp_register(CHI32_DATA_REG))
        } else {
            st.bad_board = true;
            let msg = "Timeout to wait for host read register to be full";
            Err(status_error(EchoStatusError::DspTimeout, msg))
        }
    }

    pub(crate) fn send_vector(&self, command: u32) -> Result<(), Error> {
        let timeout = self.os.system_time() + self.timeouts.vector_busy_usec;
        loop {
            if self.dsp_register(CHI32_VECTOR_REG) & CHI32_VECTOR_BUSY == 0 {
                self.set_dsp_register(CHI32_VECTOR_REG, command);
                break Ok(());
            }
            if self.os.system_time() > timeout {
                let msg = format!("Timeout to send vector command 0x{:04x}", command);
                break Err(status_error(EchoStatusError::DspTimeout, &msg));
            }
            self.os.snooze(POLL_INTERVAL_USEC);
        }
    }

    /// Wait for DSP to complete the last vector command which accesses the communication page.
    pub(crate) fn wait_for_handshake(&self) -> Result<(), Error> {
        let start = self.os.system_time();
        loop {
            if self.comm_page.handshake() != 0 {
                break Ok(());
            }
            self.os.snooze(POLL_INTERVAL_USEC);
            if self.os.system_time() - start >= self.timeouts.handshake_usec {
                let msg = "Timeout to wait for handshake from DSP";
                break Err(status_error(EchoStatusError::DspDead, msg));
            }
        }
    }

    pub(crate) fn clear_handshake(&self) {
        self.comm_page.set_handshake(0);
    }

    /// Send the command to let DSP read the page. When DSP does not accept the command, the
    /// handshake is restored since DSP reads nothing.
    pub(crate) fn send_page_command(&self, command: u32) -> Result<(), Error> {
        let handshake = self.comm_page.handshake();
        self.clear_handshake();
        self.send_vector(command).map_err(|e| {
            self.comm_page.set_handshake(handshake);
            e
        })
    }

    /// Update the flags in the page. They are restored when DSP does not accept the command.
    pub(crate) fn update_dsp_flags(&self, flag: u32, enable: bool) -> Result<(), Error> {
        self.wait_for_handshake()?;
        let flags = self.comm_page.flags();
        self.comm_page
            .set_flags(if enable { flags | flag } else { flags & !flag });
        self.send_page_command(DSP_VC_UPDATE_FLAGS).map_err(|e| {
            self.comm_page.set_flags(flags);
            e
        })
    }

    fn check_alive(st: &DspState) -> Result<(), Error> {
        if st.bad_board {
            let msg = "DSP is not loaded or does not respond";
            Err(status_error(EchoStatusError::DspDead, msg))
        } else {
            Ok(())
        }
    }

    /// Ask DSP whether the ASIC is loaded.
    pub(crate) fn test_asic(&self, st: &mut DspState) -> bool {
        st.asic_loaded = false;
        if let Err(e) = self.send_vector(DSP_VC_TEST_ASIC) {
            debug!("{}", e);
            return false;
        }
        match self.read_dsp(st) {
            Ok(status) => {
                if status != ASIC_LOADED && status != ASIC_NOT_LOADED {
                    debug!(status, "unexpected status of ASIC");
                }
                st.asic_loaded = status == ASIC_LOADED;
            }
            Err(e) => debug!("{}", e),
        }
        st.asic_loaded
    }

    pub(crate) fn check_asic_status(&self, st: &mut DspState) -> bool {
        model_op!(self.card_type, check_asic_status(self, st))
    }

    // The resident loader is in EPROM for DSP56301. For DSP56361 it should be installed.
    fn install_resident_loader(&self, st: &mut DspState) -> Result<(), Error> {
        if self.device != DspDevice::Dsp56361 {
            return Ok(());
        }

        let status = self.dsp_register(CHI32_STATUS_REG);
        if status & CHI32_STATUS_REG_HF5 > 0 {
            debug!(status, "resident loader already installed");
            return Ok(());
        }

        let image = self.os.request_firmware(FirmwareId::LoaderDsp)?;
        let code = DspCode::parse(&image)?;
        let block = code.blocks.first().ok_or_else(|| {
            let msg = "Resident loader includes no block";
            status_error(EchoStatusError::BadFormat, msg)
        })?;

        let ctl = self.dsp_register(CHI32_CONTROL_REG);
        self.set_dsp_register(CHI32_CONTROL_REG, ctl | CHI32_CONTROL_24BIT_FORMAT);

        self.write_dsp(st, block.words.len() as u32)?;
        self.write_dsp(st, block.address)?;
        block
            .words
            .iter()
            .try_for_each(|&word| self.write_dsp(st, word))?;

        let timeout = self.os.system_time() + self.timeouts.resident_loader_usec;
        loop {
            self.os.snooze(50);
            if self.dsp_register(CHI32_STATUS_REG) & CHI32_STATUS_REG_HF5 > 0 {
                debug!("resident loader installed");
                break Ok(());
            }
            if self.os.system_time() >= timeout {
                let msg = "Resident loader failed to set HF5";
                break Err(status_error(EchoStatusError::DspDead, msg));
            }
        }
    }

    fn read_sn(&self, st: &mut DspState) -> Result<(), Error> {
        let mut sn = [0u32; SERIAL_NUMBER_WORDS];
        sn.iter_mut().try_for_each(|word| {
            *word = self.read_dsp(st)?;
            Ok::<(), Error>(())
        })?;
        debug!(?sn, "serial number");
        Ok(())
    }

    fn load_dsp(&self, st: &mut DspState, id: FirmwareId) -> Result<(), Error> {
        if st.dsp_code == Some(id) {
            debug!(?id, "DSP code is already loaded");
            return Ok(());
        }

        let _enter = debug_span!("load-dsp", ?id).entered();

        st.bad_board = true;
        st.dsp_code = None;
        // Loading DSP code resets ASIC as well.
        st.asic_loaded = false;
        st.asic_code = None;

        let image = self.os.request_firmware(id)?;
        let code = DspCode::parse(&image)?;

        self.install_resident_loader(st)?;

        self.send_vector(DSP_VC_RESET).map_err(|e| {
            let msg = format!("Fail to reset DSP: {}", e);
            status_error(EchoStatusError::DspDead, &msg)
        })?;
        self.os.snooze(10);

        if !self.wait_for_status(CHI32_STATUS_REG_HF3, self.timeouts.reset_usec) {
            let msg = "Timeout to wait for HF3 after software reset";
            Err(status_error(EchoStatusError::DspTimeout, msg))?;
        }

        let ctl = self.dsp_register(CHI32_CONTROL_REG);
        self.set_dsp_register(CHI32_CONTROL_REG, ctl | CHI32_CONTROL_24BIT_FORMAT);

        code.blocks.iter().try_for_each(|block| {
            self.write_dsp(st, block.words.len() as u32)?;
            self.write_dsp(st, block.address)?;
            self.write_dsp(st, serialize_memory_type(&block.mem_type))?;
            block
                .words
                .iter()
                .try_for_each(|&word| self.write_dsp(st, word))
        })?;
        self.write_dsp(st, 0)?;

        self.os.snooze(10);

        if !self.wait_for_status(CHI32_STATUS_REG_HF4, self.timeouts.boot_usec) {
            let msg = "Timeout to wait for HF4 after transfer of DSP code";
            Err(status_error(EchoStatusError::DspTimeout, msg))?;
        }

        let ctl = self.dsp_register(CHI32_CONTROL_REG);
        self.set_dsp_register(CHI32_CONTROL_REG, ctl & !CHI32_CONTROL_LOADER_MASK);

        self.write_dsp(st, DSP_FNC_SET_COMMPAGE_ADDR)?;
        self.write_dsp(st, self.comm_page.phys_addr())?;

        // The serial number is not used but should be read as part of the sequence.
        self.read_sn(st)?;

        st.dsp_code = Some(id);
        st.bad_board = false;
        debug!("DSP code is loaded");

        Ok(())
    }

    /// Transfer the image of ASIC by the function of DSP. The readiness is not checked.
    pub(crate) fn load_asic_image(
        &self,
        st: &mut DspState,
        func: u32,
        id: FirmwareId,
    ) -> Result<(), Error> {
        let image = self.os.request_firmware(id)?;
        let start = self.os.system_time();

        self.write_dsp(st, func)?;
        self.write_dsp(st, image.len() as u32)?;
        image
            .iter()
            .try_for_each(|&byte| self.write_dsp(st, byte as u32))?;

        debug!(
            ?id,
            size = image.len(),
            elapsed = self.os.system_time() - start,
            "ASIC image transferred"
        );

        Ok(())
    }

    /// Poll the readiness of ASIC within the retry count.
    pub(crate) fn wait_asic_ready(&self, st: &mut DspState) -> Result<(), Error> {
        let retries = self.timeouts.asic_poll_retries;
        let ready = (0..retries).any(|_| {
            self.os.snooze(self.timeouts.asic_poll_interval_usec);
            self.check_asic_status(st)
        });
        if ready {
            Ok(())
        } else {
            let msg = format!("ASIC is not ready after {} polls", retries);
            Err(status_error(EchoStatusError::AsicNotLoaded, &msg))
        }
    }

    fn send_monitors(&self) -> Result<(), Error> {
        self.wait_for_handshake()?;
        self.send_page_command(DSP_VC_UPDATE_OUTVOL)
    }

    fn apply_monitors(&self, st: &DspState) -> Result<(), Error> {
        if st.asic_loaded {
            self.send_monitors()
        } else {
            Ok(())
        }
    }

    /// Replace the switchable ASIC with the image. The monitors are muted during the switch,
    /// and restored regardless of the result. At failure the former image is still regarded
    /// as active, and the restored monitors are sent to DSP as well. The returned value is
    /// true if the image is transferred.
    pub(crate) fn switch_asic(
        &self,
        st: &mut DspState,
        func: u32,
        id: FirmwareId,
    ) -> Result<bool, Error> {
        if st.asic_loaded && st.asic_code == Some(id) {
            return Ok(false);
        }

        let _enter = debug_span!("switch-asic", from = ?st.asic_code, to = ?id).entered();

        let monitors = self.comm_page.monitors();
        self.comm_page
            .set_monitors(&vec![GAIN_MUTED; monitors.len()]);
        let res = self
            .apply_monitors(st)
            .and_then(|_| self.load_asic_image(st, func, id))
            .and_then(|_| self.wait_asic_ready(st));

        self.comm_page.set_monitors(&monitors);

        match res {
            Ok(()) => {
                st.asic_code = Some(id);
                self.apply_monitors(st)?;
                debug!("ASIC switched");
                Ok(true)
            }
            Err(e) => {
                debug!("{}", e);
                if let Err(err) = self.send_monitors() {
                    warn!("Fail to restore monitors: {}", err);
                }
                Err(e)
            }
        }
    }

    /// Load DSP code and ASIC images if required, then restore cached settings. The attempts
    /// are gated by the period while ASIC is not loaded.
    pub fn load_firmware(&self) -> Result<(), Error> {
        let mut st = self.lock()?;
        self.load_firmware_locked(&mut st)
    }

    fn load_firmware_locked(&self, st: &mut DspState) -> Result<(), Error> {
        let now = self.os.system_time();
        if !st.asic_loaded {
            if let Some(last) = st.last_load_attempt {
                if now - last < self.timeouts.load_attempt_period_usec {
                    let msg = "Too frequent attempts to load firmware";
                    Err(status_error(EchoStatusError::AsicNotLoaded, msg))?;
                }
            }
        }
        st.last_load_attempt = Some(now);

        if st.dsp_code.is_some() {
            if self.check_asic_status(st) {
                return Ok(());
            }
            // Force to reload DSP code.
            st.dsp_code = None;
        }

        let id = model_op!(self.card_type, dsp_code(self.device));
        self.load_dsp(st, id)?;

        model_op!(self.card_type, load_asic(self, st)).map_err(|e| {
            let msg = format!("Fail to load ASIC: {}", e);
            status_error(EchoStatusError::AsicNotLoaded, &msg)
        })?;

        self.restore_dsp_settings(st)
    }

    fn restore_dsp_settings(&self, st: &mut DspState) -> Result<(), Error> {
        if !st.asic_loaded {
            return Ok(());
        }

        self.comm_page.set_handshake(0xffffffff);
        st.midi_out_time = None;

        let rate = st.sample_rate;
        model_op!(self.card_type, set_sample_rate(self, st, rate))?;

        if st.meter_on_count > 0 {
            self.send_vector(DSP_VC_METERS_ON)?;
        }

        let clock = st.input_clock;
        if let Err(e) = model_op!(self.card_type, set_input_clock(self, st, clock)) {
            warn!(?clock, "Fail to restore input clock: {}", e);
        }

        if !st.spec.output_clocks.is_empty() {
            let clock = st.output_clock;
            if let Err(e) = model_op!(self.card_type, set_output_clock(self, st, clock)) {
                warn!(?clock, "Fail to restore output clock: {}", e);
            }
        }

        self.wait_for_handshake()?;
        self.update_output_line_level(st)?;

        self.wait_for_handshake()?;
        self.update_input_line_level(st)?;

        self.wait_for_handshake()?;
        self.clear_handshake();
        self.send_vector(DSP_VC_UPDATE_FLAGS)?;

        debug!("settings restored");

        Ok(())
    }

    /// Put DSP into low power mode. The next call of `load_firmware()` loads everything.
    pub fn go_comatose(&self) -> Result<(), Error> {
        let mut st = self.lock()?;
        self.go_comatose_locked(&mut st)
    }

    fn go_comatose_locked(&self, st: &mut DspState) -> Result<(), Error> {
        if st.dsp_code.take().is_some() {
            st.asic_loaded = false;
            st.asic_code = None;
            self.comm_page.set_control_register(0);
            self.send_vector(DSP_VC_GO_COMATOSE)?;
            debug!("DSP goes comatose");
        }
        Ok(())
    }

    pub fn is_board_bad(&self) -> bool {
        self.lock().map(|st| st.bad_board).unwrap_or(true)
    }

    pub fn is_asic_loaded(&self) -> bool {
        self.lock().map(|st| st.asic_loaded).unwrap_or(false)
    }

    pub fn asic_code(&self) -> Option<FirmwareId> {
        self.lock().ok().and_then(|st| st.asic_code)
    }

    pub fn box_type(&self) -> Option<Echo3gBoxType> {
        self.lock().ok().and_then(|st| st.box_type)
    }

    /// The static data of model. For 3G, it depends on the detected external box.
    pub fn spec(&self) -> Result<CardSpec, Error> {
        self.lock().map(|st| st.spec)
    }

    fn normalize_sample_rate(st: &DspState, rate: u32) -> Result<u32, Error> {
        let (min, max) = st.spec.sample_rates.range();
        if rate < min || rate > max {
            let msg = format!("Sampling rate {} is out of range {}-{}", rate, min, max);
            Err(status_error(EchoStatusError::InvalidParam, &msg))?;
        }

        let rate = match st.spec.sample_rates {
            SampleRateSupport::Discrete(rates) => rates
                .iter()
                .copied()
                .min_by_key(|&r| (r as i64 - rate as i64).abs())
                .unwrap_or(rate),
            SampleRateSupport::Continuous { .. } => rate,
        };

        if st.digital_mode == DigitalMode::Adat && rate > SINGLE_SPEED_MAX_RATE {
            let msg = format!("Sampling rate {} is not available in ADAT mode", rate);
            Err(status_error(EchoStatusError::BadFormat, &msg))?;
        }

        Ok(rate)
    }

    /// Program sampling rate. The rate is snapped to the nearest supported one. Without any
    /// rate, the cached rate is committed again. The rate is just cached while the input clock
    /// is external.
    pub fn set_sample_rate(&self, rate: Option<u32>) -> Result<u32, Error> {
        let mut st = self.lock()?;
        self.set_sample_rate_locked(&mut st, rate)
    }

    pub(crate) fn set_sample_rate_locked(
        &self,
        st: &mut DspState,
        rate: Option<u32>,
    ) -> Result<u32, Error> {
        Self::check_alive(st)?;

        let rate = Self::normalize_sample_rate(st, rate.unwrap_or(st.sample_rate))?;

        if st.input_clock.is_external() {
            self.comm_page.set_sample_rate(rate);
        } else {
            model_op!(self.card_type, set_sample_rate(self, st, rate))?;
        }
        st.sample_rate = rate;
        debug!(rate, clock = ?st.input_clock, "sampling rate");

        Ok(rate)
    }

    /// Whether the rate is acceptable in current configuration, without any I/O.
    pub fn query_sample_rate(&self, rate: u32) -> Result<u32, Error> {
        let st = self.lock()?;
        Self::normalize_sample_rate(&st, rate)
    }

    pub fn sample_rate(&self) -> Result<u32, Error> {
        self.lock().map(|st| st.sample_rate)
    }

    /// The clocks currently detected by DSP. Internal clock is always included.
    pub fn input_clock_detect(&self) -> Result<InputClockMask, Error> {
        let st = self.lock()?;
        Ok(self.detect_input_clocks(&st))
    }

    fn detect_input_clocks(&self, st: &DspState) -> InputClockMask {
        let status = self.comm_page.status_clocks();
        let detected = model_op!(self.card_type, detect_input_clocks(status, st));
        let supported = InputClockMask::from(st.spec.input_clocks);
        let mut mask = InputClockMask::from_raw(detected.raw() & supported.raw());
        mask.insert(InputClock::Internal);
        mask
    }

    /// Select the source of sampling clock. The external source should be detected.
    pub fn set_input_clock(&self, clock: InputClock) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::check_alive(&st)?;

        if !st.spec.input_clocks.iter().any(|&c| c == clock) {
            let msg = format!("{:?} clock is not supported by {}", clock, st.spec.name);
            Err(status_error(EchoStatusError::ClockNotSupported, &msg))?;
        }

        if clock.is_external() && !self.detect_input_clocks(&st).contains(clock) {
            let msg = format!("{:?} clock is not detected", clock);
            Err(status_error(EchoStatusError::ClockNotAvailable, &msg))?;
        }

        model_op!(self.card_type, set_input_clock(self, &mut st, clock))?;
        st.input_clock = clock;
        debug!(?clock, "input clock");

        Ok(())
    }

    pub fn input_clock(&self) -> Result<InputClock, Error> {
        self.lock().map(|st| st.input_clock)
    }

    pub fn set_output_clock(&self, clock: OutputClock) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::check_alive(&st)?;

        if !st.spec.output_clocks.iter().any(|&c| c == clock) {
            let msg = format!("{:?} output clock is not supported by {}", clock, st.spec.name);
            Err(status_error(EchoStatusError::ClockNotSupported, &msg))?;
        }

        model_op!(self.card_type, set_output_clock(self, &mut st, clock))?;
        st.output_clock = clock;

        Ok(())
    }

    pub fn output_clock(&self) -> Result<OutputClock, Error> {
        self.lock().map(|st| st.output_clock)
    }

    /// The digital modes supported by the model, without any I/O.
    pub fn digital_modes(&self) -> &'static [DigitalMode] {
        model_op!(self.card_type, digital_modes(self.device))
    }

    /// Switch the mode of digital interface. The unsupported mode is rejected without any I/O.
    pub fn set_digital_mode(&self, mode: DigitalMode) -> Result<(), Error> {
        if !self.digital_modes().iter().any(|&m| m == mode) {
            let msg = format!("{:?} mode is not supported", mode);
            Err(status_error(EchoStatusError::DigitalModeNotSupported, &msg))?;
        }

        let mut st = self.lock()?;
        Self::check_alive(&st)?;

        let _enter = debug_span!("digital-mode", from = ?st.digital_mode, to = ?mode).entered();

        model_op!(self.card_type, set_digital_mode(self, &mut st, mode))?;
        st.digital_mode = mode;

        Ok(())
    }

    pub fn digital_mode(&self) -> Result<DigitalMode, Error> {
        self.lock().map(|st| st.digital_mode)
    }

    pub fn set_professional_spdif(&self, enable: bool) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::check_alive(&st)?;
        model_op!(self.card_type, set_professional_spdif(self, &mut st, enable))?;
        st.professional_spdif = enable;
        Ok(())
    }

    pub fn is_professional_spdif(&self) -> bool {
        self.lock().map(|st| st.professional_spdif).unwrap_or(false)
    }

    pub fn set_spdif_out_non_audio(&self, enable: bool) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::check_alive(&st)?;
        if !st.spec.has_spdif_non_audio {
            let msg = format!("Non-audio S/PDIF is not supported by {}", st.spec.name);
            Err(status_error(EchoStatusError::NotSupported, &msg))?;
        }
        model_op!(self.card_type, set_spdif_out_non_audio(self, &mut st, enable))?;
        st.non_audio_spdif = enable;
        Ok(())
    }

    pub fn is_spdif_out_non_audio(&self) -> bool {
        self.lock().map(|st| st.non_audio_spdif).unwrap_or(false)
    }

    /// Mute digital input when it loses lock. The flag is delivered to DSP by programming the
    /// input clock again.
    pub fn set_digital_input_auto_mute(&self, enable: bool) -> Result<(), Error> {
        let mut st = self.lock()?;
        if !st.spec.has_digital_input_auto_mute {
            let msg = format!("Digital input auto mute is not supported by {}", st.spec.name);
            Err(status_error(EchoStatusError::NotSupported, &msg))?;
        }
        Self::check_alive(&st)?;

        let old = st.digital_in_auto_mute;
        st.digital_in_auto_mute = enable;
        let clock = st.input_clock;
        model_op!(self.card_type, set_input_clock(self, &mut st, clock)).map_err(|e| {
            st.digital_in_auto_mute = old;
            e
        })
    }

    pub fn digital_input_auto_mute(&self) -> Result<bool, Error> {
        let st = self.lock()?;
        if !st.spec.has_digital_input_auto_mute {
            let msg = format!("Digital input auto mute is not supported by {}", st.spec.name);
            Err(status_error(EchoStatusError::NotSupported, &msg))?;
        }
        Ok(st.digital_in_auto_mute)
    }

    /// Supply phantom power to analog inputs. No-op for models without the feature.
    pub fn set_phantom_power(&self, on: bool) -> Result<(), Error> {
        let mut st = self.lock()?;
        if !st.spec.has_phantom_power {
            return Ok(());
        }
        Self::check_alive(&st)?;
        model_op!(self.card_type, set_phantom_power(self, &mut st, on))?;
        st.phantom_power = on;
        Ok(())
    }

    pub fn phantom_power(&self) -> bool {
        self.lock().map(|st| st.phantom_power).unwrap_or(false)
    }

    fn check_pipe_mask(st: &DspState, mask: u32) -> Result<(), Error> {
        let pipe_count = st.spec.pipe_count();
        let all = if pipe_count >= 32 {
            u32::MAX
        } else {
            (1 << pipe_count) - 1
        };
        if mask & !all > 0 {
            let msg = format!("Pipe mask 0x{:08x} is out of range for {} pipes", mask, pipe_count);
            Err(status_error(EchoStatusError::InvalidChannel, &msg))
        } else {
            Ok(())
        }
    }

    /// Start transport of the pipes at once.
    pub fn start_transport(&self, mask: u32) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::check_alive(&st)?;
        Self::check_pipe_mask(&st, mask)?;
        if mask == 0 {
            let msg = "No pipes to start";
            Err(status_error(EchoStatusError::InvalidChannel, msg))?;
        }

        self.wait_for_handshake()?;
        self.comm_page.set_cmd_start(mask);
        self.clear_handshake();
        self.send_vector(DSP_VC_START_TRANSFER)?;
        st.active_pipes |= mask;
        debug!(mask, active = st.active_pipes, "transport started");

        Ok(())
    }

    /// Pause transport of the pipes.
    pub fn stop_transport(&self, mask: u32) -> Result<(), Error> {
        self.stop_or_reset_transport(mask, false)
    }

    /// Stop transport of the pipes and rewind their position.
    pub fn reset_transport(&self, mask: u32) -> Result<(), Error> {
        self.stop_or_reset_transport(mask, true)
    }

    fn stop_or_reset_transport(&self, mask: u32, reset: bool) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::check_alive(&st)?;
        Self::check_pipe_mask(&st, mask)?;

        self.wait_for_handshake()?;
        self.comm_page.set_cmd_stop(mask);
        self.comm_page.set_cmd_reset(if reset { mask } else { 0 });
        if mask > 0 {
            self.clear_handshake();
            self.send_vector(DSP_VC_STOP_TRANSFER)?;
            st.active_pipes &= !mask;
            debug!(mask, reset, active = st.active_pipes, "transport stopped");
        }

        Ok(())
    }

    pub fn active_pipes(&self) -> u32 {
        self.lock().map(|st| st.active_pipes).unwrap_or(0)
    }

    pub fn is_transport_active(&self) -> bool {
        self.active_pipes() > 0
    }

    fn check_pipe(st: &DspState, pipe: usize) -> Result<(), Error> {
        if pipe >= st.spec.pipe_count() {
            let msg = format!("Pipe {} is out of range", pipe);
            Err(status_error(EchoStatusError::InvalidChannel, &msg))
        } else {
            Ok(())
        }
    }

    pub fn set_audio_format(&self, pipe: usize, fmt: &AudioFormat) -> Result<(), Error> {
        let st = self.lock()?;
        Self::check_pipe(&st, pipe)?;
        let val = serialize_audio_format(fmt)?;
        self.comm_page.set_audio_format(pipe, val);
        Ok(())
    }

    pub fn audio_format(&self, pipe: usize) -> Result<AudioFormat, Error> {
        let st = self.lock()?;
        Self::check_pipe(&st, pipe)?;
        let mut fmt = AudioFormat::default();
        deserialize_audio_format(&mut fmt, self.comm_page.audio_format(pipe));
        Ok(fmt)
    }

    /// Tell DSP the bus address of scatter-gather list for the pipe.
    pub fn set_audio_duck_list_phys(&self, pipe: usize, phys_addr: u32) -> Result<(), Error> {
        let st = self.lock()?;
        Self::check_pipe(&st, pipe)?;
        self.comm_page.set_duck_list(pipe, phys_addr);
        Ok(())
    }

    pub fn position(&self, pipe: usize) -> Result<u32, Error> {
        let st = self.lock()?;
        Self::check_pipe(&st, pipe)?;
        Ok(self.comm_page.position(pipe))
    }

    fn update_output_line_level(&self, st: &DspState) -> Result<(), Error> {
        if !st.asic_loaded {
            let msg = "Output levels are not updated without ASIC";
            Err(status_error(EchoStatusError::AsicNotLoaded, msg))?;
        }
        self.send_page_command(DSP_VC_UPDATE_OUTVOL)
    }

    fn update_input_line_level(&self, st: &DspState) -> Result<(), Error> {
        if !st.asic_loaded {
            let msg = "Input levels are not updated without ASIC";
            Err(status_error(EchoStatusError::AsicNotLoaded, msg))?;
        }
        self.send_page_command(DSP_VC_UPDATE_INGAIN)
    }

    /// Let DSP read every level again.
    pub fn refresh_levels(&self) -> Result<(), Error> {
        let st = self.lock()?;
        self.wait_for_handshake()?;
        self.update_output_line_level(&st)?;
        self.wait_for_handshake()?;
        self.update_input_line_level(&st)
    }

    /// Set -10 dBV (consumer) or +4 dBu (professional) nominal level to the bus. The busses
    /// of input follow the busses of output.
    pub fn set_nominal_level(&self, bus: usize, consumer: bool) -> Result<(), Error> {
        let st = self.lock()?;
        if bus >= st.spec.bus_output_count() + st.spec.bus_input_count() {
            let msg = format!("Bus {} is out of range", bus);
            Err(status_error(EchoStatusError::InvalidChannel, &msg))?;
        }

        self.wait_for_handshake()?;
        let mask = self.comm_page.nominal_level_mask();
        let mask = if consumer {
            mask | (1 << bus)
        } else {
            mask & !(1 << bus)
        };
        self.comm_page.set_nominal_level_mask(mask);
        self.update_output_line_level(&st)
    }

    pub fn nominal_level(&self, bus: usize) -> Result<bool, Error> {
        let st = self.lock()?;
        if bus >= st.spec.bus_output_count() + st.spec.bus_input_count() {
            let msg = format!("Bus {} is out of range", bus);
            Err(status_error(EchoStatusError::InvalidChannel, &msg))?;
        }
        Ok(self.comm_page.nominal_level_mask() & (1 << bus) > 0)
    }

    fn check_output_bus(st: &DspState, bus: usize) -> Result<(), Error> {
        if bus >= st.spec.bus_output_count() {
            let msg = format!("Output bus {} is out of range", bus);
            Err(status_error(EchoStatusError::InvalidChannel, &msg))
        } else {
            Ok(())
        }
    }

    fn check_input_bus(st: &DspState, bus: usize) -> Result<(), Error> {
        if bus >= st.spec.bus_input_count() {
            let msg = format!("Input bus {} is out of range", bus);
            Err(status_error(EchoStatusError::InvalidChannel, &msg))
        } else {
            Ok(())
        }
    }

    fn check_pan(pan: u16) -> Result<(), Error> {
        if pan > MAX_MIXER_PAN {
            let msg = format!("Pan {} is out of range 0-{}", pan, MAX_MIXER_PAN);
            Err(status_error(EchoStatusError::InvalidParam, &msg))
        } else {
            Ok(())
        }
    }

    // The busses of stereo pair which includes the bus.
    fn stereo_pair(bus: usize, count: usize) -> impl Iterator<Item = usize> {
        let left = bus & !1;
        (left..(left + 2)).filter(move |&b| b < count)
    }

    fn write_output_level(&self, st: &DspState, bus: usize) {
        let gain = st.mixer.outputs[bus].output_gain(bus);
        self.comm_page.set_line_out_level(bus, gain);
    }

    fn write_input_level(&self, st: &DspState, bus: usize) {
        let gain = st.mixer.inputs[bus].input_gain();
        self.comm_page.set_line_in_level(bus, gain);
    }

    fn write_monitor(&self, st: &DspState, bus_out: usize, index: usize) {
        let gain = st.mixer.monitors[index].output_gain(bus_out);
        self.comm_page.set_monitor(index, gain);
    }

    /// Set gain of output bus in dB. Without immediate flag, DSP reads it at next update.
    pub fn set_output_line_level(&self, bus: usize, gain: i8, immediate: bool) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::check_output_bus(&st, bus)?;
        if !check_output_gain(gain) {
            let msg = format!(
                "Gain {} of output bus is out of range {}-{}",
                gain, OUTPUT_GAIN_MIN, OUTPUT_GAIN_MAX
            );
            Err(status_error(EchoStatusError::InvalidParam, &msg))?;
        }

        self.wait_for_handshake()?;
        st.mixer.outputs[bus].gain = gain;
        self.write_output_level(&st, bus);
        if immediate {
            self.update_output_line_level(&st)?;
        }
        Ok(())
    }

    pub fn output_line_level(&self, bus: usize) -> Result<i8, Error> {
        let st = self.lock()?;
        Self::check_output_bus(&st, bus)?;
        Ok(st.mixer.outputs[bus].gain)
    }

    /// Mute the output bus. The gain is kept.
    pub fn set_output_mute(&self, bus: usize, mute: bool) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::check_output_bus(&st, bus)?;

        self.wait_for_handshake()?;
        st.mixer.outputs[bus].mute = mute;
        self.write_output_level(&st, bus);
        self.update_output_line_level(&st)
    }

    pub fn output_mute(&self, bus: usize) -> Result<bool, Error> {
        let st = self.lock()?;
        Self::check_output_bus(&st, bus)?;
        Ok(st.mixer.outputs[bus].mute)
    }

    /// Set pan of the output pipe between the busses of stereo pair. The pipe is routed to
    /// the output bus of the same number.
    pub fn set_audio_pan(&self, pipe: usize, pan: u16) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::check_output_bus(&st, pipe)?;
        Self::check_pan(pan)?;

        self.wait_for_handshake()?;
        let count = st.spec.bus_output_count();
        Self::stereo_pair(pipe, count).for_each(|bus| {
            st.mixer.outputs[bus].pan = Some(pan);
            self.write_output_level(&st, bus);
        });
        self.update_output_line_level(&st)
    }

    pub fn audio_pan(&self, pipe: usize) -> Result<u16, Error> {
        let st = self.lock()?;
        Self::check_output_bus(&st, pipe)?;
        Ok(st.mixer.outputs[pipe].pan(pipe))
    }

    /// Set gain of input bus in 0.5 dB unit.
    pub fn set_input_line_level(&self, bus: usize, gain: i8) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::check_input_bus(&st, bus)?;
        if !check_input_gain(gain) {
            let msg = format!(
                "Gain {} of input bus is out of range {}-{}",
                gain, INPUT_GAIN_MIN, INPUT_GAIN_MAX
            );
            Err(status_error(EchoStatusError::InvalidParam, &msg))?;
        }

        self.wait_for_handshake()?;
        st.mixer.inputs[bus].gain = gain;
        self.write_input_level(&st, bus);
        self.update_input_line_level(&st)
    }

    pub fn input_line_level(&self, bus: usize) -> Result<i8, Error> {
        let st = self.lock()?;
        Self::check_input_bus(&st, bus)?;
        Ok(st.mixer.inputs[bus].gain)
    }

    /// Mute the input bus. The gain is kept.
    pub fn set_input_mute(&self, bus: usize, mute: bool) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::check_input_bus(&st, bus)?;

        self.wait_for_handshake()?;
        st.mixer.inputs[bus].mute = mute;
        self.write_input_level(&st, bus);
        self.update_input_line_level(&st)
    }

    pub fn input_mute(&self, bus: usize) -> Result<bool, Error> {
        let st = self.lock()?;
        Self::check_input_bus(&st, bus)?;
        Ok(st.mixer.inputs[bus].mute)
    }

    fn monitor_index(st: &DspState, bus_out: usize, bus_in: usize) -> Result<usize, Error> {
        let outputs = st.spec.bus_output_count();
        let inputs = st.spec.bus_input_count();
        let index = bus_out * inputs + bus_in;
        if bus_out >= outputs || bus_in >= inputs || index >= MONITOR_ARRAY_SIZE {
            let msg = format!("Monitor from {} to {} is out of range", bus_in, bus_out);
            Err(status_error(EchoStatusError::InvalidChannel, &msg))
        } else {
            Ok(index)
        }
    }

    /// Set gain of monitor from the input bus to the output bus in dB.
    pub fn set_audio_monitor(
        &self,
        bus_out: usize,
        bus_in: usize,
        gain: i8,
        immediate: bool,
    ) -> Result<(), Error> {
        let mut st = self.lock()?;
        let index = Self::monitor_index(&st, bus_out, bus_in)?;
        if !check_output_gain(gain) {
            let msg = format!(
                "Gain {} of monitor is out of range {}-{}",
                gain, OUTPUT_GAIN_MIN, OUTPUT_GAIN_MAX
            );
            Err(status_error(EchoStatusError::InvalidParam, &msg))?;
        }

        self.wait_for_handshake()?;
        st.mixer.monitors[index].gain = gain;
        self.write_monitor(&st, bus_out, index);
        if immediate {
            self.update_output_line_level(&st)?;
        }
        Ok(())
    }

    pub fn audio_monitor(&self, bus_out: usize, bus_in: usize) -> Result<i8, Error> {
        let st = self.lock()?;
        let index = Self::monitor_index(&st, bus_out, bus_in)?;
        Ok(st.mixer.monitors[index].gain)
    }

    /// Mute the monitor from the input bus to the output bus. The gain is kept.
    pub fn set_audio_monitor_mute(
        &self,
        bus_out: usize,
        bus_in: usize,
        mute: bool,
    ) -> Result<(), Error> {
        let mut st = self.lock()?;
        let index = Self::monitor_index(&st, bus_out, bus_in)?;

        self.wait_for_handshake()?;
        st.mixer.monitors[index].mute = mute;
        self.write_monitor(&st, bus_out, index);
        self.update_output_line_level(&st)
    }

    pub fn audio_monitor_mute(&self, bus_out: usize, bus_in: usize) -> Result<bool, Error> {
        let st = self.lock()?;
        let index = Self::monitor_index(&st, bus_out, bus_in)?;
        Ok(st.mixer.monitors[index].mute)
    }

    /// Set pan of the monitor from the input bus between the output busses of stereo pair.
    pub fn set_audio_monitor_pan(&self, bus_out: usize, bus_in: usize, pan: u16) -> Result<(), Error> {
        let mut st = self.lock()?;
        Self::monitor_index(&st, bus_out, bus_in)?;
        Self::check_pan(pan)?;

        self.wait_for_handshake()?;
        let count = st.spec.bus_output_count();
        Self::stereo_pair(bus_out, count).try_for_each(|bus| {
            let index = Self::monitor_index(&st, bus, bus_in)?;
            st.mixer.monitors[index].pan = Some(pan);
            self.write_monitor(&st, bus, index);
            Ok::<(), Error>(())
        })?;
        self.update_output_line_level(&st)
    }

    pub fn audio_monitor_pan(&self, bus_out: usize, bus_in: usize) -> Result<u16, Error> {
        let st = self.lock()?;
        let index = Self::monitor_index(&st, bus_out, bus_in)?;
        Ok(st.mixer.monitors[index].pan(bus_out))
    }

    /// Turn meters on or off by reference count. DSP updates meters and detected clocks in
    /// the page while they are on.
    pub fn set_meters_on(&self, on: bool) -> Result<(), Error> {
        let mut st = self.lock()?;
        if on {
            if st.meter_on_count == 0 {
                self.send_vector(DSP_VC_METERS_ON)?;
            }
            st.meter_on_count += 1;
        } else if st.meter_on_count > 0 {
            st.meter_on_count -= 1;
            if st.meter_on_count == 0 {
                self.send_vector(DSP_VC_METERS_OFF)?;
                self.comm_page.mute_meters();
            }
        }
        Ok(())
    }

    pub fn audio_meters(&self) -> Result<AudioMeters, Error> {
        let st = self.lock()?;
        let outputs = st.spec.bus_output_count();
        let inputs = st.spec.bus_input_count();

        let mut vu = [GAIN_MUTED; MAX_PIPES];
        let mut peak = [GAIN_MUTED; MAX_PIPES];
        self.comm_page.vu_meters(&mut vu);
        self.comm_page.peak_meters(&mut peak);

        Ok(AudioMeters {
            bus_out_vu: vu[..outputs].to_vec(),
            bus_out_peak: peak[..outputs].to_vec(),
            bus_in_vu: vu[outputs..(outputs + inputs)].to_vec(),
            bus_in_peak: peak[outputs..(outputs + inputs)].to_vec(),
        })
    }

    /// Enable MIDI input by reference count.
    pub fn set_midi_on(&self, on: bool) -> Result<(), Error> {
        let mut st = self.lock()?;
        if st.spec.midi_port_count == 0 {
            let msg = format!("MIDI is not supported by {}", st.spec.name);
            Err(status_error(EchoStatusError::NotSupported, &msg))?;
        }

        if on {
            if st.midi_on_count == 0 {
                self.update_dsp_flags(DSP_FLAG_MIDI_INPUT, true)?;
            }
            st.midi_on_count += 1;
        } else if st.midi_on_count > 0 {
            if st.midi_on_count == 1 {
                self.update_dsp_flags(DSP_FLAG_MIDI_INPUT, false)?;
            }
            st.midi_on_count -= 1;
        }
        Ok(())
    }

    /// Drain words from MIDI input buffer. The first word of buffer is the number of words
    /// following it.
    pub fn read_midi_input(&self) -> Result<Vec<u16>, Error> {
        let mut st = self.lock()?;
        let count = (self.comm_page.midi_input(0) as usize).min(MIDI_IN_BUFFER_SIZE - 1);
        if count == 0 {
            return Ok(Vec::new());
        }

        let words: Vec<u16> = (1..=count)
            .map(|i| self.comm_page.midi_input(i))
            .collect();
        self.comm_page.set_midi_input(0, 0);
        st.midi_in_time = Some(self.os.system_time());

        Ok(words)
    }

    /// Write MIDI bytes as many as DSP accepts now. The number of written bytes is returned.
    pub fn write_midi(&self, data: &[u8]) -> Result<usize, Error> {
        let mut st = self.lock()?;

        if self.comm_page.handshake() == 0 {
            let msg = "The last command is not completed yet";
            Err(status_error(EchoStatusError::Busy, msg))?;
        }
        if self.dsp_register(CHI32_STATUS_REG) & CHI32_STATUS_REG_HF4 == 0 {
            let msg = "DSP is not ready for MIDI output";
            Err(status_error(EchoStatusError::Busy, msg))?;
        }

        let count = data.len().min(MIDI_OUT_BUFFER_SIZE - 1);
        self.comm_page.set_midi_output(&data[..count]);
        self.clear_handshake();
        self.comm_page.set_midi_out_free_count(0);
        self.send_vector(DSP_VC_MIDI_WRITE)?;
        st.midi_out_time = Some(self.os.system_time());

        Ok(count)
    }

    pub fn is_midi_out_active(&self) -> bool {
        let now = self.os.system_time();
        self.lock()
            .ok()
            .and_then(|st| st.midi_out_time)
            .map(|time| now - time <= MIDI_ACTIVITY_TIMEOUT_USEC)
            .unwrap_or(false)
    }

    pub fn is_midi_in_active(&self) -> bool {
        let now = self.os.system_time();
        self.lock()
            .ok()
            .and_then(|st| st.midi_in_time)
            .map(|time| now - time <= MIDI_ACTIVITY_TIMEOUT_USEC)
            .unwrap_or(false)
    }
}

impl<'a, O: OsSupport> Drop for DspCommObject<'a, O> {
    fn drop(&mut self) {
        if let Ok(mut st) = self.state.lock() {
            if let Err(e) = self.go_comatose_locked(&mut st) {
                warn!("Fail to put DSP into comatose: {}", e);
            }
        }
        self.os.free_phys_page_block(self.comm_page.block());
    }
}

#[cfg(test)]
mod test {
    use {super::*, crate::emulator::*};

    fn loaded(os: &EmulatedCard, card_type: CardType) -> DspCommObject<'_, EmulatedCard> {
        let dsp = DspCommObject::new(card_type, os).unwrap();
        dsp.load_firmware().unwrap();
        dsp
    }

    #[test]
    fn audio_format_serdes() {
        let fmt = AudioFormat {
            interleave: 2,
            bits_per_sample: 24,
            ..Default::default()
        };
        assert_eq!(serialize_audio_format(&fmt).unwrap(), DSP_AUDIOFORM_SS_24LE);

        let fmt = AudioFormat {
            interleave: 8,
            bits_per_sample: 32,
            ..Default::default()
        };
        let val = serialize_audio_format(&fmt).unwrap();
        assert_eq!(val, 0x88);
        let mut f = AudioFormat::default();
        deserialize_audio_format(&mut f, val);
        assert_eq!(f, fmt);

        let fmt = AudioFormat {
            interleave: 1,
            bits_per_sample: 16,
            big_endian: true,
            ..Default::default()
        };
        let err = serialize_audio_format(&fmt).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::BadFormat));
    }

    #[test]
    fn firmware_loading() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56361);
        let dsp = DspCommObject::new(CardType::Gina24, &os).unwrap();
        assert!(dsp.is_board_bad());

        dsp.load_firmware().unwrap();
        assert!(!dsp.is_board_bad());
        assert!(dsp.is_asic_loaded());
        assert_eq!(os.loaded_dsp_words(), os.expected_dsp_words(FirmwareId::Gina24Dsp361));
        assert_eq!(
            os.active_asic(PCI_CARD_ASIC_SLOT),
            Some(FirmwareId::Gina24Asic361)
        );
        assert_eq!(os.comm_page_phys_addr(), Some(dsp.comm_page().phys_addr()));

        // The loaded firmware is not loaded again.
        os.clear_logs();
        dsp.load_firmware().unwrap();
        assert_eq!(os.vector_log(), vec![DSP_VC_TEST_ASIC]);
    }

    #[test]
    fn firmware_loading_period() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        os.set_asic_ready_polls(None);
        let dsp = DspCommObject::new(CardType::Gina24, &os).unwrap();

        let err = dsp.load_firmware().unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::AsicNotLoaded));

        os.set_asic_ready_polls(Some(1));
        let err = dsp.load_firmware().unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::AsicNotLoaded));

        os.advance_time(dsp.timeouts().load_attempt_period_usec);
        dsp.load_firmware().unwrap();
    }

    #[test]
    fn write_timeout_marks_bad_board() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let mut dsp = loaded(&os, CardType::Gina24);
        dsp.set_timeouts(DspTimeouts {
            write_usec: 1000,
            ..Default::default()
        });

        os.set_write_stall(true);
        let mut st = dsp.lock().unwrap();
        let err = dsp.write_dsp(&mut st, 0).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::DspTimeout));
        assert!(st.bad_board);
    }

    #[test]
    fn sample_rate_snap_and_commit() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Gina24);

        assert_eq!(dsp.set_sample_rate(Some(44000)).unwrap(), 44100);
        assert_eq!(dsp.sample_rate().unwrap(), 44100);

        let first = dsp.set_sample_rate(None).unwrap();
        let ctl = os.control_register();
        let second = dsp.set_sample_rate(None).unwrap();
        assert_eq!(first, second);
        assert_eq!(ctl, os.control_register());

        let err = dsp.set_sample_rate(Some(192000)).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidParam));
        assert_eq!(dsp.sample_rate().unwrap(), 44100);
    }

    #[test]
    fn input_clock_gating() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Gina24);

        let err = dsp.set_input_clock(InputClock::Spdif).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::ClockNotAvailable));
        assert_eq!(dsp.input_clock().unwrap(), InputClock::Internal);

        let err = dsp.set_input_clock(InputClock::Word).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::ClockNotSupported));

        os.set_detected_clocks(crate::gml::GML_CLOCK_DETECT_BIT_SPDIF48);
        assert!(dsp.input_clock_detect().unwrap().contains(InputClock::Spdif));
        dsp.set_input_clock(InputClock::Spdif).unwrap();
        assert_eq!(dsp.input_clock().unwrap(), InputClock::Spdif);

        dsp.set_input_clock(InputClock::Internal).unwrap();
        assert_eq!(dsp.input_clock().unwrap(), InputClock::Internal);
    }

    #[test]
    fn switch_asic_idempotence() {
        let os = EmulatedCard::new(CardType::Layla24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Layla24);

        os.clear_logs();
        dsp.set_digital_mode(DigitalMode::Adat).unwrap();
        assert_eq!(
            os.active_asic(EXTERNAL_ASIC_SLOT),
            Some(FirmwareId::Layla24Asic2A)
        );
        let updates = os.outvol_updates();
        assert_eq!(updates.first(), Some(&true));

        os.clear_logs();
        dsp.set_digital_mode(DigitalMode::Adat).unwrap();
        assert!(os.outvol_updates().is_empty());
        assert_eq!(dsp.asic_code(), Some(FirmwareId::Layla24Asic2A));
    }

    #[test]
    fn transport() {
        let os = EmulatedCard::new(CardType::Mona, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Mona);

        dsp.start_transport(0x3).unwrap();
        assert_eq!(dsp.active_pipes(), 0x3);
        dsp.stop_transport(0x1).unwrap();
        assert_eq!(dsp.active_pipes(), 0x2);
        dsp.reset_transport(0x2).unwrap();
        assert!(!dsp.is_transport_active());

        let err = dsp.start_transport(0).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidChannel));
        let err = dsp.start_transport(1 << 31).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidChannel));
    }

    #[test]
    fn mixer_levels() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Gina24);

        dsp.set_output_line_level(3, -12, true).unwrap();
        assert_eq!(dsp.output_line_level(3).unwrap(), -12);

        dsp.set_audio_monitor(1, 2, -6, true).unwrap();
        assert_eq!(dsp.audio_monitor(1, 2).unwrap(), -6);
        assert_eq!(dsp.audio_monitor(0, 0).unwrap(), GAIN_MUTED);

        dsp.set_nominal_level(0, true).unwrap();
        assert!(dsp.nominal_level(0).unwrap());
        assert!(!dsp.nominal_level(1).unwrap());

        let err = dsp.set_input_line_level(10, 0).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidChannel));

        dsp.set_meters_on(true).unwrap();
        dsp.set_meters_on(true).unwrap();
        dsp.set_meters_on(false).unwrap();
        os.clear_logs();
        dsp.set_meters_on(false).unwrap();
        assert_eq!(os.vector_log(), vec![DSP_VC_METERS_OFF]);
        let meters = dsp.audio_meters().unwrap();
        assert_eq!(meters.bus_out_vu.len(), 16);
        assert_eq!(meters.bus_in_vu.len(), 10);
        assert!(meters.bus_in_peak.iter().all(|&m| m == GAIN_MUTED));
    }

    #[test]
    fn mixer_ranges() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Gina24);

        dsp.set_output_line_level(0, OUTPUT_GAIN_MAX, true).unwrap();
        dsp.set_output_line_level(1, GAIN_MUTED, true).unwrap();
        let err = dsp
            .set_output_line_level(0, OUTPUT_GAIN_MAX + 1, true)
            .unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidParam));
        assert_eq!(dsp.output_line_level(0).unwrap(), OUTPUT_GAIN_MAX);

        dsp.set_input_line_level(0, INPUT_GAIN_MIN).unwrap();
        let err = dsp.set_input_line_level(0, INPUT_GAIN_MIN - 1).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidParam));
        let err = dsp.set_input_line_level(0, INPUT_GAIN_MAX + 1).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidParam));
        assert_eq!(dsp.input_line_level(0).unwrap(), INPUT_GAIN_MIN);

        let err = dsp
            .set_audio_monitor(0, 0, OUTPUT_GAIN_MAX + 1, true)
            .unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidParam));
        assert_eq!(dsp.audio_monitor(0, 0).unwrap(), GAIN_MUTED);

        let err = dsp.set_audio_pan(0, MAX_MIXER_PAN + 1).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidParam));
        let err = dsp
            .set_audio_monitor_pan(0, 0, MAX_MIXER_PAN + 1)
            .unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidParam));
    }

    #[test]
    fn bus_mute() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Gina24);

        dsp.set_output_line_level(2, -10, true).unwrap();
        os.clear_logs();
        dsp.set_output_mute(2, true).unwrap();
        assert_eq!(os.vector_log(), vec![DSP_VC_UPDATE_OUTVOL]);
        assert!(dsp.output_mute(2).unwrap());
        assert_eq!(dsp.output_line_level(2).unwrap(), -10);
        assert_eq!(dsp.comm_page().line_out_level(2), GAIN_MUTED);

        dsp.set_output_mute(2, false).unwrap();
        assert!(!dsp.output_mute(2).unwrap());
        assert_eq!(dsp.comm_page().line_out_level(2), -10);

        dsp.set_input_line_level(1, 10).unwrap();
        os.clear_logs();
        dsp.set_input_mute(1, true).unwrap();
        assert_eq!(os.vector_log(), vec![DSP_VC_UPDATE_INGAIN]);
        assert!(dsp.input_mute(1).unwrap());
        assert_eq!(dsp.input_line_level(1).unwrap(), 10);
        assert_eq!(dsp.comm_page().line_in_level(1), GAIN_MUTED);

        dsp.set_input_mute(1, false).unwrap();
        assert_eq!(dsp.comm_page().line_in_level(1), 10);

        let err = dsp.set_output_mute(16, true).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidChannel));
        let err = dsp.set_input_mute(10, true).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidChannel));
    }

    #[test]
    fn pipe_pan() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Gina24);

        // Neutral at first.
        assert_eq!(dsp.audio_pan(2).unwrap(), 0);
        assert_eq!(dsp.audio_pan(3).unwrap(), MAX_MIXER_PAN);

        dsp.set_output_line_level(2, -10, true).unwrap();
        dsp.set_audio_pan(3, MAX_MIXER_PAN / 2).unwrap();
        assert_eq!(dsp.audio_pan(2).unwrap(), MAX_MIXER_PAN / 2);
        assert_eq!(dsp.audio_pan(3).unwrap(), MAX_MIXER_PAN / 2);
        assert_eq!(dsp.comm_page().line_out_level(2), -16);
        assert_eq!(dsp.comm_page().line_out_level(3), -6);
        assert_eq!(dsp.output_line_level(2).unwrap(), -10);

        // Hard left.
        dsp.set_audio_pan(2, 0).unwrap();
        assert_eq!(dsp.comm_page().line_out_level(2), -10);
        assert_eq!(dsp.comm_page().line_out_level(3), GAIN_MUTED);

        // The other pair is not affected.
        assert_eq!(dsp.comm_page().line_out_level(1), 0);
    }

    #[test]
    fn monitor_mute_and_pan() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Gina24);
        let inputs = dsp.spec().unwrap().bus_input_count();

        assert_eq!(dsp.audio_monitor_pan(0, 1).unwrap(), 0);
        assert_eq!(dsp.audio_monitor_pan(1, 1).unwrap(), MAX_MIXER_PAN);

        dsp.set_audio_monitor(0, 1, -6, false).unwrap();
        dsp.set_audio_monitor(1, 1, -6, true).unwrap();
        dsp.set_audio_monitor_pan(1, 1, MAX_MIXER_PAN / 2).unwrap();
        assert_eq!(dsp.audio_monitor_pan(0, 1).unwrap(), MAX_MIXER_PAN / 2);
        let monitors = dsp.comm_page().monitors();
        assert_eq!(monitors[1], -12);
        assert_eq!(monitors[inputs + 1], -12);
        assert_eq!(dsp.audio_monitor(1, 1).unwrap(), -6);

        os.clear_logs();
        dsp.set_audio_monitor_mute(1, 1, true).unwrap();
        assert_eq!(os.vector_log(), vec![DSP_VC_UPDATE_OUTVOL]);
        assert!(dsp.audio_monitor_mute(1, 1).unwrap());
        assert!(!dsp.audio_monitor_mute(0, 1).unwrap());
        let monitors = dsp.comm_page().monitors();
        assert_eq!(monitors[inputs + 1], GAIN_MUTED);
        assert_eq!(monitors[1], -12);

        dsp.set_audio_monitor_mute(1, 1, false).unwrap();
        assert_eq!(dsp.comm_page().monitors()[inputs + 1], -12);

        let err = dsp.set_audio_monitor_mute(16, 0, true).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::InvalidChannel));
    }

    #[test]
    fn spdif_non_audio_toggle() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Gina24);

        dsp.set_spdif_out_non_audio(true).unwrap();
        assert!(dsp.is_spdif_out_non_audio());
        assert_eq!(
            os.control_register() & crate::gml::GML_SPDIF_NOT_AUDIO,
            crate::gml::GML_SPDIF_NOT_AUDIO
        );

        dsp.set_spdif_out_non_audio(false).unwrap();
        assert!(!dsp.is_spdif_out_non_audio());
        assert_eq!(os.control_register() & crate::gml::GML_SPDIF_NOT_AUDIO, 0);
    }

    #[test]
    fn adat_rate_ceiling() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Gina24);

        assert_eq!(dsp.query_sample_rate(96000).unwrap(), 96000);

        dsp.set_digital_mode(DigitalMode::Adat).unwrap();
        let err = dsp.query_sample_rate(96000).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::BadFormat));
        let err = dsp.query_sample_rate(SINGLE_SPEED_MAX_RATE + 30000).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::BadFormat));
        let err = dsp.set_sample_rate(Some(88200)).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::BadFormat));
        assert_eq!(dsp.query_sample_rate(48000).unwrap(), 48000);
    }

    #[test]
    fn polling_with_snooze() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let mut dsp = loaded(&os, CardType::Gina24);
        dsp.set_timeouts(DspTimeouts {
            write_usec: 1000,
            vector_busy_usec: 1000,
            ..Default::default()
        });

        os.set_vector_stall(true);
        let before = os.snoozed_usec();
        let err = dsp.send_vector(DSP_VC_METERS_ON).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::DspTimeout));
        assert!(os.snoozed_usec() - before >= 500);
        os.set_vector_stall(false);

        os.set_write_stall(true);
        let before = os.snoozed_usec();
        let mut st = dsp.lock().unwrap();
        assert!(dsp.write_dsp(&mut st, 0).is_err());
        assert!(os.snoozed_usec() - before >= 500);
    }

    #[test]
    fn flags_restored_at_rejected_command() {
        let os = EmulatedCard::new(CardType::Layla24, DspDevice::Dsp56301);
        let mut dsp = loaded(&os, CardType::Layla24);
        dsp.set_timeouts(DspTimeouts {
            vector_busy_usec: 1000,
            ..Default::default()
        });

        os.set_vector_stall(true);
        let err = dsp.set_midi_on(true).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::DspTimeout));
        assert_eq!(dsp.comm_page().flags() & DSP_FLAG_MIDI_INPUT, 0);
        assert_ne!(dsp.comm_page().handshake(), 0);

        os.set_vector_stall(false);
        dsp.set_midi_on(true).unwrap();
        assert_eq!(
            dsp.comm_page().flags() & DSP_FLAG_MIDI_INPUT,
            DSP_FLAG_MIDI_INPUT
        );
    }

    #[test]
    fn monitors_sent_after_failed_switch() {
        let os = EmulatedCard::new(CardType::Layla24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Layla24);
        dsp.set_audio_monitor(0, 0, -6, true).unwrap();

        os.set_asic_ready_polls(None);
        os.clear_logs();
        let err = dsp.set_digital_mode(DigitalMode::Adat).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::AsicNotLoaded));
        assert_eq!(os.outvol_updates(), vec![true, false]);
        assert_eq!(dsp.comm_page().monitors()[0], -6);
        assert_eq!(dsp.digital_mode().unwrap(), DigitalMode::SpdifRca);
    }

    #[test]
    fn midi_io() {
        let os = EmulatedCard::new(CardType::Layla24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Layla24);

        os.push_midi_input(&[0x90]);
        assert!(dsp.read_midi_input().unwrap().is_empty());

        dsp.set_midi_on(true).unwrap();
        os.push_midi_input(&[0x90, 0x40, 0x7f]);
        assert_eq!(dsp.read_midi_input().unwrap(), vec![0x90, 0x40, 0x7f]);
        assert!(dsp.read_midi_input().unwrap().is_empty());
        assert!(dsp.is_midi_in_active());

        let data = [0xf8u8; 40];
        assert_eq!(dsp.write_midi(&data).unwrap(), MIDI_OUT_BUFFER_SIZE - 1);
        assert_eq!(os.midi_output(), vec![0xf8; MIDI_OUT_BUFFER_SIZE - 1]);
        assert!(dsp.is_midi_out_active());

        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let dsp = loaded(&os, CardType::Gina24);
        let err = dsp.set_midi_on(true).unwrap_err();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::NotSupported));
    }

    #[test]
    fn comatose_at_drop() {
        let os = EmulatedCard::new(CardType::Mona, DspDevice::Dsp56361);
        {
            let _dsp = loaded(&os, CardType::Mona);
            assert!(!os.is_comatose());
        }
        assert!(os.is_comatose());
        assert_eq!(os.page_block_count(), 0);
    }
}
