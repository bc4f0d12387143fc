// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Emulation of the card for environment without the hardware.
//!
//! The module includes the implementation of `OsSupport` which behaves like the host interface
//! of DSP and the communication page. The DSP code and ASIC images transferred by the driver are
//! captured and compared with the images, then the vector commands are applied to the state of
//! emulated hardware. The system time is virtual and advanced by each query of time and by
//! snooze, thus any polling with timeout finishes without waiting for real time.

use {
    super::{comm_page::*, dsp::*, echo3g::*, firmware::*, os_support::*, *},
    std::{
        alloc::{alloc_zeroed, dealloc, Layout},
        collections::{HashMap, VecDeque},
        path::Path,
        ptr::NonNull,
        sync::{
            atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
            Arc, Mutex, MutexGuard,
        },
    },
    tracing::debug,
};

/// The slot of ASIC in PCI card.
pub const PCI_CARD_ASIC_SLOT: usize = 0;
/// The slot of ASIC in external box.
pub const EXTERNAL_ASIC_SLOT: usize = 1;

const ASIC_SLOT_COUNT: usize = 2;

const PHYS_ADDR_BASE: u32 = 0x10000000;
const PHYS_PAGE_SIZE: u32 = 0x1000;

// The serial number returned after the address of communication page.
const SERIAL_NUMBER: [u32; 5] = [0x00ec, 0x0001, 0x0002, 0x0003, 0x0004];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// Synthetic DSP code which is unique for the identifier.
fn synthetic_dsp_code(id: FirmwareId) -> DspCode {
    let index = FirmwareId::ALL.iter().position(|&i| i == id).unwrap_or_default() as u32;
    let block_count = if id == FirmwareId::LoaderDsp { 1 } else { 2 };
    let blocks = (0..block_count)
        .map(|i| DspCodeBlock {
            mem_type: if i == 0 {
                DspMemoryType::P
            } else {
                DspMemoryType::X
            },
            address: 0x100 * (i + 1),
            words: (0..(4 + i)).map(|w| (index << 16) | (i << 8) | w).collect(),
        })
        .collect();
    DspCode { blocks }
}

// Synthetic bitstream of ASIC which is unique for the identifier.
fn synthetic_asic_image(id: FirmwareId) -> Vec<u8> {
    let mut image = format!("{:?}", id).into_bytes();
    image.extend_from_slice(&[0xff, 0x00, 0xa5, 0x5a]);
    image
}

/// The source of firmware images.
#[derive(Debug)]
pub enum FirmwareSource {
    /// The images generated in the emulator.
    Synthetic,
    /// The images in file system.
    Directory(FirmwareDirectory),
}

impl FirmwareSource {
    pub fn request(&self, id: FirmwareId) -> Result<Arc<[u8]>, Error> {
        match self {
            Self::Synthetic => {
                let image = if id.is_dsp_code() {
                    synthetic_dsp_code(id).build()
                } else {
                    synthetic_asic_image(id)
                };
                Ok(image.into())
            }
            Self::Directory(dir) => dir.request(id),
        }
    }
}

/// The block of emulated physical memory.
#[derive(Debug)]
pub struct EmulatedPageBlock {
    phys_addr: u32,
    memory: Arc<Mutex<Vec<u8>>>,
}

impl PhysPageBlock for EmulatedPageBlock {
    fn phys_addr(&self) -> u32 {
        self.phys_addr
    }

    fn size(&self) -> usize {
        lock(&self.memory).len()
    }

    fn read(&self, offset: usize, frame: &mut [u8]) {
        let memory = lock(&self.memory);
        match memory.get(offset..(offset + frame.len())) {
            Some(data) => frame.copy_from_slice(data),
            None => frame.fill(0),
        }
    }

    fn write(&self, offset: usize, frame: &[u8]) {
        let mut memory = lock(&self.memory);
        if let Some(data) = memory.get_mut(offset..(offset + frame.len())) {
            data.copy_from_slice(frame);
        }
    }
}

// The function requested by host after boot, and its parameters so far.
#[derive(Debug)]
enum HostCommand {
    Idle,
    CommPageAddr,
    AsicSize(usize),
    AsicData(usize, usize, Vec<u8>),
}

impl Default for HostCommand {
    fn default() -> Self {
        Self::Idle
    }
}

// The ASIC image waiting to be ready, and the remaining polls.
#[derive(Debug, Copy, Clone)]
struct PendingAsic {
    id: FirmwareId,
    polls: Option<u32>,
}

#[derive(Debug)]
struct EmulatedDsp {
    card_type: CardType,
    device: DspDevice,
    firmware: Arc<FirmwareSource>,

    dsp_boots: bool,
    write_stall: bool,
    vector_stall: bool,
    asic_ready_polls: Option<u32>,
    detected_clocks: u32,
    box_type: Echo3gBoxType,

    control: u32,
    loader_installed: bool,
    loader_words: Vec<u32>,
    resetting: bool,
    code_words: Vec<u32>,
    loaded_code: Vec<u32>,
    booted: bool,
    comatose: bool,
    host: HostCommand,
    read_fifo: VecDeque<u32>,

    asic_slots: [Option<FirmwareId>; ASIC_SLOT_COUNT],
    pending: [Option<PendingAsic>; ASIC_SLOT_COUNT],

    blocks: HashMap<u32, Arc<Mutex<Vec<u8>>>>,
    next_phys_addr: u32,
    comm_page_addr: Option<u32>,

    vector_log: Vec<u32>,
    outvol_updates: Vec<bool>,
    rate_commands: Vec<u32>,
    frequency_commands: Vec<u32>,
    applied_control: u32,
    midi_output: Vec<u8>,
}

// Whether the stream of DSP code is terminated; each block is the number of words, the address,
// the type of memory and the words, then zero.
fn is_code_stream_complete(words: &[u32]) -> bool {
    let mut pos = 0;
    while let Some(&count) = words.get(pos) {
        if count == 0 {
            return pos + 1 == words.len();
        }
        pos += 3 + count as usize;
    }
    false
}

impl EmulatedDsp {
    fn new(card_type: CardType, device: DspDevice, firmware: Arc<FirmwareSource>) -> Self {
        Self {
            card_type,
            device,
            firmware,
            dsp_boots: true,
            write_stall: false,
            vector_stall: false,
            asic_ready_polls: Some(0),
            detected_clocks: 0,
            box_type: Echo3gBoxType::Gina3g,
            control: 0,
            loader_installed: false,
            loader_words: Vec::new(),
            resetting: false,
            code_words: Vec::new(),
            loaded_code: Vec::new(),
            booted: false,
            comatose: false,
            host: Default::default(),
            read_fifo: Default::default(),
            asic_slots: Default::default(),
            pending: Default::default(),
            blocks: Default::default(),
            next_phys_addr: PHYS_ADDR_BASE,
            comm_page_addr: None,
            vector_log: Vec::new(),
            outvol_updates: Vec::new(),
            rate_commands: Vec::new(),
            frequency_commands: Vec::new(),
            applied_control: 0,
            midi_output: Vec::new(),
        }
    }

    fn comm_page(&self) -> Option<EmulatedPageBlock> {
        self.comm_page_addr.and_then(|phys_addr| {
            self.blocks.get(&phys_addr).map(|memory| EmulatedPageBlock {
                phys_addr,
                memory: memory.clone(),
            })
        })
    }

    fn required_slots(&self) -> &'static [usize] {
        match self.card_type {
            CardType::Layla24 | CardType::Mona => &[PCI_CARD_ASIC_SLOT, EXTERNAL_ASIC_SLOT],
            _ => &[PCI_CARD_ASIC_SLOT],
        }
    }

    fn is_asic_loaded(&self) -> bool {
        self.pending.iter().all(|p| p.is_none())
            && self
                .required_slots()
                .iter()
                .all(|&slot| self.asic_slots[slot].is_some())
    }

    fn status(&self) -> u32 {
        let mut status = 0;
        if !self.write_stall {
            status |= CHI32_STATUS_HOST_WRITE_EMPTY;
        }
        if !self.read_fifo.is_empty() {
            status |= CHI32_STATUS_HOST_READ_FULL;
        }
        if self.resetting {
            status |= CHI32_STATUS_REG_HF3;
        }
        if self.booted {
            status |= CHI32_STATUS_REG_HF4;
        }
        if self.loader_installed {
            status |= CHI32_STATUS_REG_HF5;
        }
        status
    }

    fn write_data(&mut self, val: u32) {
        if self.resetting {
            self.code_words.push(val);
            if is_code_stream_complete(&self.code_words) {
                self.loaded_code = std::mem::take(&mut self.code_words);
                self.resetting = false;
                self.booted = true;
                debug!(words = self.loaded_code.len(), "emulated DSP booted");
            }
        } else if self.booted {
            self.host_command(val);
        } else if self.device == DspDevice::Dsp56361 && !self.loader_installed {
            self.loader_words.push(val);
            if let Some(&count) = self.loader_words.first() {
                if self.loader_words.len() == 2 + count as usize {
                    self.loader_installed = true;
                }
            }
        }
    }

    fn host_command(&mut self, val: u32) {
        self.host = match std::mem::take(&mut self.host) {
            HostCommand::Idle => match val {
                DSP_FNC_SET_COMMPAGE_ADDR => HostCommand::CommPageAddr,
                DSP_FNC_LOAD_PCI_CARD_ASIC => HostCommand::AsicSize(PCI_CARD_ASIC_SLOT),
                DSP_FNC_LOAD_EXTERNAL_ASIC => HostCommand::AsicSize(EXTERNAL_ASIC_SLOT),
                _ => {
                    debug!(val, "unknown function of emulated DSP");
                    HostCommand::Idle
                }
            },
            HostCommand::CommPageAddr => {
                self.comm_page_addr = Some(val);
                self.read_fifo.extend(SERIAL_NUMBER.iter());
                if let Some(page) = self.comm_page() {
                    write_u32(&page, STATUS_CLOCKS_OFFSET, self.detected_clocks);
                }
                HostCommand::Idle
            }
            HostCommand::AsicSize(slot) => {
                HostCommand::AsicData(slot, val as usize, Vec::with_capacity(val as usize))
            }
            HostCommand::AsicData(slot, size, mut data) => {
                data.push(val as u8);
                if data.len() < size {
                    HostCommand::AsicData(slot, size, data)
                } else {
                    self.receive_asic_image(slot, &data);
                    HostCommand::Idle
                }
            }
        };
    }

    fn receive_asic_image(&mut self, slot: usize, data: &[u8]) {
        let id = FirmwareId::ALL
            .iter()
            .filter(|id| !id.is_dsp_code())
            .find(|&&id| {
                self.firmware
                    .request(id)
                    .map(|image| &image[..] == data)
                    .unwrap_or(false)
            })
            .copied();

        match id {
            Some(id) => {
                // The former image is still reported as active till the new one is ready.
                self.pending[slot] = Some(PendingAsic {
                    id,
                    polls: self.asic_ready_polls,
                });
            }
            None => debug!(slot, size = data.len(), "unknown image of ASIC"),
        }
    }

    fn poll_pending_asic(&mut self) {
        for slot in 0..ASIC_SLOT_COUNT {
            if let Some(pending) = self.pending[slot] {
                match pending.polls {
                    Some(0) => {
                        self.asic_slots[slot] = Some(pending.id);
                        self.pending[slot] = None;
                    }
                    Some(polls) => {
                        self.pending[slot] = Some(PendingAsic {
                            polls: Some(polls - 1),
                            ..pending
                        });
                    }
                    None => (),
                }
            }
        }
    }

    fn reset(&mut self) {
        self.booted = false;
        self.comatose = false;
        self.resetting = self.dsp_boots;
        self.code_words.clear();
        self.host = HostCommand::Idle;
        self.read_fifo.clear();
        self.asic_slots = Default::default();
        self.pending = Default::default();
        self.comm_page_addr = None;
    }

    fn vector(&mut self, command: u32) {
        self.vector_log.push(command);

        if command == DSP_VC_RESET {
            self.reset();
            return;
        }

        let page = match self.comm_page() {
            Some(page) => page,
            None => {
                debug!(command, "vector command without communication page");
                return;
            }
        };

        match command {
            DSP_VC_TEST_ASIC => {
                self.poll_pending_asic();
                let loaded = self.is_asic_loaded();
                if self.card_type == CardType::Echo3g {
                    if loaded {
                        let val = serialize_box_type(&self.box_type);
                        write_u32(&page, EXT_BOX_STATUS_OFFSET, val);
                    }
                } else {
                    self.read_fifo.push_back(if loaded {
                        ASIC_LOADED
                    } else {
                        ASIC_NOT_LOADED
                    });
                }
            }
            // The same vector is used to write control register for the other models.
            DSP_VC_SET_LAYLA_SAMPLE_RATE if self.card_type == CardType::Layla20 => {
                let rate = read_u32(&page, SAMPLE_RATE_OFFSET);
                self.rate_commands.push(rate);
            }
            DSP_VC_WRITE_CONTROL_REG => {
                self.applied_control = read_u32(&page, CONTROL_REGISTER_OFFSET);
            }
            DSP_VC_SET_LAYLA24_FREQUENCY_REG => {
                let freq = read_u32(&page, SAMPLE_RATE_OFFSET);
                self.frequency_commands.push(freq);
            }
            DSP_VC_UPDATE_OUTVOL => {
                let mut monitors = [0u8; MONITOR_ARRAY_SIZE];
                page.read(MONITORS_OFFSET, &mut monitors);
                let muted = monitors.iter().all(|&gain| gain as i8 == GAIN_MUTED);
                self.outvol_updates.push(muted);
            }
            DSP_VC_MIDI_WRITE => {
                let mut count = [0u8; 1];
                page.read(MIDI_OUTPUT_OFFSET, &mut count);
                let mut data = vec![0u8; count[0] as usize];
                page.read(MIDI_OUTPUT_OFFSET + 1, &mut data);
                self.midi_output.extend_from_slice(&data);
                write_u32(&page, MIDI_OUT_FREE_COUNT_OFFSET, DSP_MIDI_OUT_FIFO_SIZE);
            }
            DSP_VC_GO_COMATOSE => {
                self.comatose = true;
                self.booted = false;
                self.asic_slots = Default::default();
                self.pending = Default::default();
            }
            _ => (),
        }

        write_u32(&page, HANDSHAKE_OFFSET, 1);
    }
}

/// The register window of emulated DSP.
#[derive(Debug)]
pub struct EmulatedRegisters {
    dsp: Arc<Mutex<EmulatedDsp>>,
}

impl DspRegisters for EmulatedRegisters {
    fn read_register(&self, offset: usize) -> u32 {
        let mut dsp = lock(&self.dsp);
        match offset {
            CHI32_CONTROL_REG => dsp.control,
            CHI32_STATUS_REG => dsp.status(),
            CHI32_VECTOR_REG if dsp.vector_stall => CHI32_VECTOR_BUSY,
            CHI32_DATA_REG => dsp.read_fifo.pop_front().unwrap_or_default(),
            _ => 0,
        }
    }

    fn write_register(&self, offset: usize, val: u32) {
        let mut dsp = lock(&self.dsp);
        match offset {
            CHI32_CONTROL_REG => dsp.control = val,
            CHI32_VECTOR_REG => dsp.vector(val),
            CHI32_DATA_REG => dsp.write_data(val),
            _ => (),
        }
    }
}

/// The emulated card.
#[derive(Debug)]
pub struct EmulatedCard {
    card_type: CardType,
    registers: EmulatedRegisters,
    firmware: Arc<FirmwareSource>,
    time: AtomicU64,
    snoozed: AtomicU64,
    non_paged_count: AtomicUsize,
    alloc_failure: AtomicBool,
}

impl EmulatedCard {
    /// Instantiate the card with synthetic images of firmware.
    pub fn new(card_type: CardType, device: DspDevice) -> Self {
        Self::with_firmware(card_type, device, FirmwareSource::Synthetic)
    }

    /// Instantiate the card with images of firmware in the directory.
    pub fn with_firmware_directory(
        card_type: CardType,
        device: DspDevice,
        path: &Path,
    ) -> Result<Self, Error> {
        let dir = FirmwareDirectory::new(path)?;
        Ok(Self::with_firmware(card_type, device, FirmwareSource::Directory(dir)))
    }

    fn with_firmware(card_type: CardType, device: DspDevice, firmware: FirmwareSource) -> Self {
        let firmware = Arc::new(firmware);
        let dsp = EmulatedDsp::new(card_type, device, firmware.clone());
        Self {
            card_type,
            registers: EmulatedRegisters {
                dsp: Arc::new(Mutex::new(dsp)),
            },
            firmware,
            time: Default::default(),
            snoozed: Default::default(),
            non_paged_count: Default::default(),
            alloc_failure: Default::default(),
        }
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    fn dsp(&self) -> MutexGuard<'_, EmulatedDsp> {
        lock(&self.registers.dsp)
    }

    /// Advance the virtual system time.
    pub fn advance_time(&self, usec: u64) {
        self.time.fetch_add(usec, Ordering::SeqCst);
    }

    /// Whether DSP boots after software reset.
    pub fn set_dsp_boots(&self, boots: bool) {
        self.dsp().dsp_boots = boots;
    }

    /// Keep the host write register full.
    pub fn set_write_stall(&self, stall: bool) {
        self.dsp().write_stall = stall;
    }

    /// Keep the vector register busy so that no command is accepted.
    pub fn set_vector_stall(&self, stall: bool) {
        self.dsp().vector_stall = stall;
    }

    /// The total time spent by snooze.
    pub fn snoozed_usec(&self) -> u64 {
        self.snoozed.load(Ordering::SeqCst)
    }

    /// The number of polls until the transferred ASIC image is ready. None means never.
    pub fn set_asic_ready_polls(&self, polls: Option<u32>) {
        self.dsp().asic_ready_polls = polls;
    }

    pub fn set_alloc_failure(&self, failure: bool) {
        self.alloc_failure.store(failure, Ordering::SeqCst);
    }

    /// The external box connected to 3G PCI card.
    pub fn set_box_type(&self, box_type: Echo3gBoxType) {
        self.dsp().box_type = box_type;
    }

    /// Report the bits of detected clocks in the communication page.
    pub fn set_detected_clocks(&self, bits: u32) {
        let mut dsp = self.dsp();
        dsp.detected_clocks = bits;
        if let Some(page) = dsp.comm_page() {
            write_u32(&page, STATUS_CLOCKS_OFFSET, bits);
        }
    }

    /// Put the levels of busses into the meters of communication page.
    pub fn set_meters(&self, vu: &[i8], peak: &[i8]) {
        let dsp = self.dsp();
        if let Some(page) = dsp.comm_page() {
            let frame: Vec<u8> = vu.iter().take(MAX_PIPES).map(|&v| v as u8).collect();
            page.write(VU_METER_OFFSET, &frame);
            let frame: Vec<u8> = peak.iter().take(MAX_PIPES).map(|&v| v as u8).collect();
            page.write(PEAK_METER_OFFSET, &frame);
        }
    }

    /// Append words to MIDI input buffer. Nothing is done unless MIDI input is enabled.
    pub fn push_midi_input(&self, words: &[u16]) {
        let dsp = self.dsp();
        let page = match dsp.comm_page() {
            Some(page) => page,
            None => return,
        };
        if read_u32(&page, FLAGS_OFFSET) & DSP_FLAG_MIDI_INPUT == 0 {
            return;
        }

        let count = read_u16(&page, MIDI_INPUT_OFFSET) as usize;
        let space = MIDI_IN_BUFFER_SIZE - 1 - count.min(MIDI_IN_BUFFER_SIZE - 1);
        let words = &words[..words.len().min(space)];
        words.iter().enumerate().for_each(|(i, &word)| {
            write_u16(&page, MIDI_INPUT_OFFSET + (count + 1 + i) * 2, word);
        });
        write_u16(&page, MIDI_INPUT_OFFSET, (count + words.len()) as u16);
    }

    pub fn clear_logs(&self) {
        let mut dsp = self.dsp();
        dsp.vector_log.clear();
        dsp.outvol_updates.clear();
        dsp.rate_commands.clear();
        dsp.frequency_commands.clear();
        dsp.midi_output.clear();
    }

    /// The vector commands sent by host.
    pub fn vector_log(&self) -> Vec<u32> {
        self.dsp().vector_log.clone()
    }

    /// Whether all monitors were muted at each update of output levels.
    pub fn outvol_updates(&self) -> Vec<bool> {
        self.dsp().outvol_updates.clone()
    }

    /// The rates committed by the command for Layla20.
    pub fn rate_commands(&self) -> Vec<u32> {
        self.dsp().rate_commands.clone()
    }

    /// The values committed to the frequency register of Layla24.
    pub fn frequency_commands(&self) -> Vec<u32> {
        self.dsp().frequency_commands.clone()
    }

    /// The control register applied by the last command to write it.
    pub fn control_register(&self) -> u32 {
        self.dsp().applied_control
    }

    pub fn midi_output(&self) -> Vec<u8> {
        self.dsp().midi_output.clone()
    }

    pub fn active_asic(&self, slot: usize) -> Option<FirmwareId> {
        self.dsp().asic_slots.get(slot).copied().flatten()
    }

    pub fn comm_page_phys_addr(&self) -> Option<u32> {
        self.dsp().comm_page_addr
    }

    /// The words of DSP code received after the last software reset.
    pub fn loaded_dsp_words(&self) -> Vec<u32> {
        self.dsp().loaded_code.clone()
    }

    /// The words of DSP code expected to be transferred for the image.
    pub fn expected_dsp_words(&self, id: FirmwareId) -> Vec<u32> {
        let code = self
            .firmware
            .request(id)
            .and_then(|image| DspCode::parse(&image))
            .unwrap_or_default();
        let mut words: Vec<u32> = code
            .blocks
            .iter()
            .flat_map(|block| {
                let mut words = vec![
                    block.words.len() as u32,
                    block.address,
                    serialize_memory_type(&block.mem_type),
                ];
                words.extend_from_slice(&block.words);
                words
            })
            .collect();
        words.push(0);
        words
    }

    pub fn is_comatose(&self) -> bool {
        self.dsp().comatose
    }

    /// The number of blocks of physical memory not released yet.
    pub fn page_block_count(&self) -> usize {
        self.dsp().blocks.len()
    }

    /// The number of allocations of non-paged memory not released yet.
    pub fn non_paged_block_count(&self) -> usize {
        self.non_paged_count.load(Ordering::SeqCst)
    }
}

impl OsSupport for EmulatedCard {
    type Registers = EmulatedRegisters;
    type PageBlock = EmulatedPageBlock;

    fn dsp_registers(&self) -> &Self::Registers {
        &self.registers
    }

    fn dsp_device(&self) -> DspDevice {
        self.dsp().device
    }

    fn system_time(&self) -> u64 {
        self.time.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn snooze(&self, usec: u64) {
        self.snoozed.fetch_add(usec, Ordering::SeqCst);
        self.advance_time(usec);
    }

    fn alloc_phys_page_block(&self, size: usize) -> Result<Self::PageBlock, Error> {
        if self.alloc_failure.load(Ordering::SeqCst) {
            let msg = format!("Fail to allocate {} bytes of physical memory", size);
            Err(status_error(EchoStatusError::NoMem, &msg))?;
        }

        let mut dsp = self.dsp();
        let phys_addr = dsp.next_phys_addr;
        let pages = (size as u32 + PHYS_PAGE_SIZE - 1) / PHYS_PAGE_SIZE;
        dsp.next_phys_addr += pages.max(1) * PHYS_PAGE_SIZE;

        let memory = Arc::new(Mutex::new(vec![0; size]));
        dsp.blocks.insert(phys_addr, memory.clone());

        Ok(EmulatedPageBlock { phys_addr, memory })
    }

    fn free_phys_page_block(&self, block: &Self::PageBlock) {
        self.dsp().blocks.remove(&block.phys_addr);
    }

    fn alloc_non_paged(&self, layout: Layout) -> Result<NonNull<u8>, Error> {
        if self.alloc_failure.load(Ordering::SeqCst) || layout.size() == 0 {
            let msg = format!("Fail to allocate {} bytes of non-paged memory", layout.size());
            Err(status_error(EchoStatusError::NoMem, &msg))?;
        }

        // SAFETY: the size of layout is not zero.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            let msg = format!("Fail to allocate {} bytes of non-paged memory", layout.size());
            status_error(EchoStatusError::NoMem, &msg)
        })?;
        self.non_paged_count.fetch_add(1, Ordering::SeqCst);

        Ok(ptr)
    }

    unsafe fn free_non_paged(&self, ptr: NonNull<u8>, layout: Layout) {
        dealloc(ptr.as_ptr(), layout);
        self.non_paged_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn request_firmware(&self, id: FirmwareId) -> Result<Arc<[u8]>, Error> {
        self.firmware.request(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_stream() {
        assert!(!is_code_stream_complete(&[]));
        assert!(!is_code_stream_complete(&[2, 0x100, 0, 1]));
        assert!(!is_code_stream_complete(&[2, 0x100, 0, 1, 2]));
        assert!(is_code_stream_complete(&[2, 0x100, 0, 1, 2, 0]));
        assert!(is_code_stream_complete(&[1, 0x100, 0, 1, 1, 0x200, 1, 2, 0]));
    }

    #[test]
    fn synthetic_images() {
        let source = FirmwareSource::Synthetic;
        let a = source.request(FirmwareId::Gina24Dsp301).unwrap();
        let b = source.request(FirmwareId::Gina24Dsp361).unwrap();
        assert_ne!(a, b);
        assert_eq!(DspCode::parse(&a).unwrap().blocks.len(), 2);
        assert_eq!(
            DspCode::parse(&source.request(FirmwareId::LoaderDsp).unwrap())
                .unwrap()
                .blocks
                .len(),
            1
        );

        let a = source.request(FirmwareId::Layla24Asic2S).unwrap();
        let b = source.request(FirmwareId::Layla24Asic2A).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn virtual_time() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let t = os.system_time();
        os.snooze(100);
        assert!(os.system_time() > t + 100);
    }

    #[test]
    fn page_block_lifecycle() {
        let os = EmulatedCard::new(CardType::Gina24, DspDevice::Dsp56301);
        let a = os.alloc_phys_page_block(0x1000).unwrap();
        let b = os.alloc_phys_page_block(0x10).unwrap();
        assert_eq!(b.phys_addr() - a.phys_addr(), PHYS_PAGE_SIZE);
        assert_eq!(os.page_block_count(), 2);

        a.write(0x10, &[1, 2, 3]);
        let mut frame = [0; 3];
        a.read(0x10, &mut frame);
        assert_eq!(frame, [1, 2, 3]);

        // Out of range.
        let mut frame = [0xff; 4];
        b.read(0x0e, &mut frame);
        assert_eq!(frame, [0; 4]);

        os.free_phys_page_block(&a);
        os.free_phys_page_block(&b);
        assert_eq!(os.page_block_count(), 0);

        os.set_alloc_failure(true);
        let err = os.alloc_phys_page_block(0x1000).err().unwrap();
        assert_eq!(err.kind::<EchoStatusError>(), Some(EchoStatusError::NoMem));
    }

    #[test]
    fn reset_without_boot() {
        let os = EmulatedCard::new(CardType::Layla20, DspDevice::Dsp56301);
        os.set_dsp_boots(false);
        os.dsp_registers().write_register(CHI32_VECTOR_REG, DSP_VC_RESET);
        let status = os.dsp_registers().read_register(CHI32_STATUS_REG);
        assert_eq!(status & CHI32_STATUS_REG_HF3, 0);

        os.set_dsp_boots(true);
        os.dsp_registers().write_register(CHI32_VECTOR_REG, DSP_VC_RESET);
        let status = os.dsp_registers().read_register(CHI32_STATUS_REG);
        assert_eq!(status & CHI32_STATUS_REG_HF3, CHI32_STATUS_REG_HF3);
        assert_eq!(os.vector_log(), vec![DSP_VC_RESET, DSP_VC_RESET]);
    }
}
