// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Communication page shared by host and DSP.
//!
//! The page is placed in physically contiguous memory. The host writes parameters into it, then
//! sends a vector command to DSP so that the DSP reads them. The DSP writes meters, detected
//! clocks and MIDI input into it. All of fields are little endian.

use super::os_support::PhysPageBlock;

/// The number of pipes addressable by the page.
pub const MAX_PIPES: usize = 32;
/// The number of output busses addressable by the page.
pub const MAX_BUSSES_OUT: usize = 16;
/// The number of input busses addressable by the page.
pub const MAX_BUSSES_IN: usize = 16;
/// The number of elements in the matrix of monitor gains.
pub const MONITOR_ARRAY_SIZE: usize = 0x180;
/// The number of words in MIDI input buffer, including the leading counter.
pub const MIDI_IN_BUFFER_SIZE: usize = 256;
/// The number of bytes in MIDI output buffer, including the leading counter.
pub const MIDI_OUT_BUFFER_SIZE: usize = 32;
/// The size of FIFO for MIDI output in DSP.
pub const DSP_MIDI_OUT_FIFO_SIZE: u32 = 64;

/// The gain in DSP unit (dB) to mute.
pub const GAIN_MUTED: i8 = -128;

/// The size of allocated memory for the page.
pub const COMM_PAGE_PHYS_BYTES: usize = 0x1000;

pub(crate) const COMM_SIZE_OFFSET: usize = 0x000;
pub(crate) const FLAGS_OFFSET: usize = 0x004;
pub(crate) const SAMPLE_RATE_OFFSET: usize = 0x00c;
pub(crate) const HANDSHAKE_OFFSET: usize = 0x010;
pub(crate) const CMD_START_OFFSET: usize = 0x014;
pub(crate) const CMD_STOP_OFFSET: usize = 0x018;
pub(crate) const CMD_RESET_OFFSET: usize = 0x01c;
pub(crate) const AUDIO_FORMAT_OFFSET: usize = 0x020;
pub(crate) const DUCK_LIST_OFFSET: usize = 0x060;
pub(crate) const POSITION_OFFSET: usize = 0x160;
pub(crate) const VU_METER_OFFSET: usize = 0x1e0;
pub(crate) const PEAK_METER_OFFSET: usize = 0x200;
pub(crate) const LINE_OUT_LEVEL_OFFSET: usize = 0x220;
pub(crate) const LINE_IN_LEVEL_OFFSET: usize = 0x230;
pub(crate) const MONITORS_OFFSET: usize = 0x240;
pub(crate) const MIDI_INPUT_OFFSET: usize = 0x3c0;
pub(crate) const NOMINAL_LEVEL_OFFSET: usize = 0x5c0;
pub(crate) const INPUT_CLOCK_OFFSET: usize = 0x5c4;
pub(crate) const OUTPUT_CLOCK_OFFSET: usize = 0x5c6;
pub(crate) const STATUS_CLOCKS_OFFSET: usize = 0x5c8;
pub(crate) const EXT_BOX_STATUS_OFFSET: usize = 0x5cc;
pub(crate) const MIDI_OUT_FREE_COUNT_OFFSET: usize = 0x5d4;
pub(crate) const CONTROL_REGISTER_OFFSET: usize = 0x5d8;
pub(crate) const E3G_FRQ_REGISTER_OFFSET: usize = 0x5dc;
pub(crate) const MIDI_OUTPUT_OFFSET: usize = 0x5e0;

/// The size of fields in the page.
pub const COMM_PAGE_SIZE: usize = 0x600;

pub(crate) fn read_u16(block: &impl PhysPageBlock, offset: usize) -> u16 {
    let mut frame = [0; 2];
    block.read(offset, &mut frame);
    u16::from_le_bytes(frame)
}

pub(crate) fn write_u16(block: &impl PhysPageBlock, offset: usize, val: u16) {
    block.write(offset, &val.to_le_bytes());
}

pub(crate) fn read_u32(block: &impl PhysPageBlock, offset: usize) -> u32 {
    let mut frame = [0; 4];
    block.read(offset, &mut frame);
    u32::from_le_bytes(frame)
}

pub(crate) fn write_u32(block: &impl PhysPageBlock, offset: usize, val: u32) {
    block.write(offset, &val.to_le_bytes());
}

fn read_gains(block: &impl PhysPageBlock, offset: usize, gains: &mut [i8]) {
    let mut frame = vec![0; gains.len()];
    block.read(offset, &mut frame);
    gains
        .iter_mut()
        .zip(frame)
        .for_each(|(gain, byte)| *gain = byte as i8);
}

fn write_gains(block: &impl PhysPageBlock, offset: usize, gains: &[i8]) {
    let frame: Vec<u8> = gains.iter().map(|&gain| gain as u8).collect();
    block.write(offset, &frame);
}

/// The accessor to communication page.
#[derive(Debug)]
pub struct CommPage<P: PhysPageBlock> {
    block: P,
}

impl<P: PhysPageBlock> CommPage<P> {
    /// Initialize the page so that nothing is audible at startup.
    pub fn new(block: P) -> Self {
        block.write(0, &vec![0; block.size().min(COMM_PAGE_PHYS_BYTES)]);

        write_u32(&block, COMM_SIZE_OFFSET, COMM_PAGE_SIZE as u32);
        write_u32(&block, HANDSHAKE_OFFSET, 0xffffffff);
        write_u32(&block, MIDI_OUT_FREE_COUNT_OFFSET, DSP_MIDI_OUT_FIFO_SIZE);

        write_gains(&block, LINE_IN_LEVEL_OFFSET, &[0; MAX_BUSSES_IN]);
        write_gains(&block, MONITORS_OFFSET, &[GAIN_MUTED; MONITOR_ARRAY_SIZE]);
        write_gains(&block, VU_METER_OFFSET, &[GAIN_MUTED; MAX_PIPES]);
        write_gains(&block, PEAK_METER_OFFSET, &[GAIN_MUTED; MAX_PIPES]);

        Self { block }
    }

    pub fn block(&self) -> &P {
        &self.block
    }

    pub fn phys_addr(&self) -> u32 {
        self.block.phys_addr()
    }

    pub fn flags(&self) -> u32 {
        read_u32(&self.block, FLAGS_OFFSET)
    }

    pub fn set_flags(&self, flags: u32) {
        write_u32(&self.block, FLAGS_OFFSET, flags)
    }

    pub fn sample_rate(&self) -> u32 {
        read_u32(&self.block, SAMPLE_RATE_OFFSET)
    }

    pub fn set_sample_rate(&self, rate: u32) {
        write_u32(&self.block, SAMPLE_RATE_OFFSET, rate)
    }

    pub fn handshake(&self) -> u32 {
        read_u32(&self.block, HANDSHAKE_OFFSET)
    }

    pub fn set_handshake(&self, val: u32) {
        write_u32(&self.block, HANDSHAKE_OFFSET, val)
    }

    pub fn set_cmd_start(&self, mask: u32) {
        write_u32(&self.block, CMD_START_OFFSET, mask)
    }

    pub fn set_cmd_stop(&self, mask: u32) {
        write_u32(&self.block, CMD_STOP_OFFSET, mask)
    }

    pub fn set_cmd_reset(&self, mask: u32) {
        write_u32(&self.block, CMD_RESET_OFFSET, mask)
    }

    pub fn audio_format(&self, pipe: usize) -> u16 {
        read_u16(&self.block, AUDIO_FORMAT_OFFSET + pipe * 2)
    }

    pub fn set_audio_format(&self, pipe: usize, format: u16) {
        write_u16(&self.block, AUDIO_FORMAT_OFFSET + pipe * 2, format)
    }

    pub fn set_duck_list(&self, pipe: usize, phys_addr: u32) {
        write_u32(&self.block, DUCK_LIST_OFFSET + pipe * 8, phys_addr)
    }

    pub fn position(&self, pipe: usize) -> u32 {
        read_u32(&self.block, POSITION_OFFSET + pipe * 4)
    }

    pub fn vu_meters(&self, meters: &mut [i8]) {
        read_gains(&self.block, VU_METER_OFFSET, meters)
    }

    pub fn peak_meters(&self, meters: &mut [i8]) {
        read_gains(&self.block, PEAK_METER_OFFSET, meters)
    }

    pub fn mute_meters(&self) {
        write_gains(&self.block, VU_METER_OFFSET, &[GAIN_MUTED; MAX_PIPES]);
        write_gains(&self.block, PEAK_METER_OFFSET, &[GAIN_MUTED; MAX_PIPES]);
    }

    pub fn line_out_level(&self, bus: usize) -> i8 {
        let mut gains = [0];
        read_gains(&self.block, LINE_OUT_LEVEL_OFFSET + bus, &mut gains);
        gains[0]
    }

    pub fn set_line_out_level(&self, bus: usize, gain: i8) {
        write_gains(&self.block, LINE_OUT_LEVEL_OFFSET + bus, &[gain])
    }

    pub fn line_in_level(&self, bus: usize) -> i8 {
        let mut gains = [0];
        read_gains(&self.block, LINE_IN_LEVEL_OFFSET + bus, &mut gains);
        gains[0]
    }

    pub fn set_line_in_level(&self, bus: usize, gain: i8) {
        write_gains(&self.block, LINE_IN_LEVEL_OFFSET + bus, &[gain])
    }

    pub fn monitors(&self) -> Vec<i8> {
        let mut gains = vec![0; MONITOR_ARRAY_SIZE];
        read_gains(&self.block, MONITORS_OFFSET, &mut gains);
        gains
    }

    pub fn set_monitors(&self, gains: &[i8]) {
        let len = gains.len().min(MONITOR_ARRAY_SIZE);
        write_gains(&self.block, MONITORS_OFFSET, &gains[..len])
    }

    pub fn set_monitor(&self, index: usize, gain: i8) {
        write_gains(&self.block, MONITORS_OFFSET + index, &[gain])
    }

    pub fn midi_input(&self, index: usize) -> u16 {
        read_u16(&self.block, MIDI_INPUT_OFFSET + index * 2)
    }

    pub fn set_midi_input(&self, index: usize, val: u16) {
        write_u16(&self.block, MIDI_INPUT_OFFSET + index * 2, val)
    }

    pub fn nominal_level_mask(&self) -> u32 {
        read_u32(&self.block, NOMINAL_LEVEL_OFFSET)
    }

    pub fn set_nominal_level_mask(&self, mask: u32) {
        write_u32(&self.block, NOMINAL_LEVEL_OFFSET, mask)
    }

    pub fn input_clock(&self) -> u16 {
        read_u16(&self.block, INPUT_CLOCK_OFFSET)
    }

    pub fn set_input_clock(&self, clock: u16) {
        write_u16(&self.block, INPUT_CLOCK_OFFSET, clock)
    }

    pub fn output_clock(&self) -> u16 {
        read_u16(&self.block, OUTPUT_CLOCK_OFFSET)
    }

    pub fn set_output_clock(&self, clock: u16) {
        write_u16(&self.block, OUTPUT_CLOCK_OFFSET, clock)
    }

    pub fn status_clocks(&self) -> u32 {
        read_u32(&self.block, STATUS_CLOCKS_OFFSET)
    }

    pub fn ext_box_status(&self) -> u32 {
        read_u32(&self.block, EXT_BOX_STATUS_OFFSET)
    }

    pub fn set_ext_box_status(&self, val: u32) {
        write_u32(&self.block, EXT_BOX_STATUS_OFFSET, val)
    }

    pub fn midi_out_free_count(&self) -> u32 {
        read_u32(&self.block, MIDI_OUT_FREE_COUNT_OFFSET)
    }

    pub fn set_midi_out_free_count(&self, count: u32) {
        write_u32(&self.block, MIDI_OUT_FREE_COUNT_OFFSET, count)
    }

    pub fn control_register(&self) -> u32 {
        read_u32(&self.block, CONTROL_REGISTER_OFFSET)
    }

    pub fn set_control_register(&self, val: u32) {
        write_u32(&self.block, CONTROL_REGISTER_OFFSET, val)
    }

    pub fn e3g_frq_register(&self) -> u32 {
        read_u32(&self.block, E3G_FRQ_REGISTER_OFFSET)
    }

    pub fn set_e3g_frq_register(&self, val: u32) {
        write_u32(&self.block, E3G_FRQ_REGISTER_OFFSET, val)
    }

    /// Fill MIDI output buffer. The first byte is the number of following bytes.
    pub fn set_midi_output(&self, data: &[u8]) {
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.push(data.len() as u8);
        frame.extend_from_slice(data);
        self.block.write(MIDI_OUTPUT_OFFSET, &frame)
    }
}

#[cfg(test)]
mod test {
    use {super::*, std::sync::Mutex};

    struct TestBlock(Mutex<Vec<u8>>);

    impl PhysPageBlock for TestBlock {
        fn phys_addr(&self) -> u32 {
            0x1000
        }

        fn size(&self) -> usize {
            COMM_PAGE_PHYS_BYTES
        }

        fn read(&self, offset: usize, frame: &mut [u8]) {
            let mem = self.0.lock().unwrap();
            frame.copy_from_slice(&mem[offset..(offset + frame.len())]);
        }

        fn write(&self, offset: usize, frame: &[u8]) {
            let mut mem = self.0.lock().unwrap();
            mem[offset..(offset + frame.len())].copy_from_slice(frame);
        }
    }

    #[test]
    fn comm_page_layout() {
        assert!(MIDI_OUTPUT_OFFSET + MIDI_OUT_BUFFER_SIZE <= COMM_PAGE_SIZE);
        assert_eq!(MIDI_INPUT_OFFSET + MIDI_IN_BUFFER_SIZE * 2, NOMINAL_LEVEL_OFFSET);
        assert_eq!(MONITORS_OFFSET + MONITOR_ARRAY_SIZE, MIDI_INPUT_OFFSET);
        assert!(COMM_PAGE_SIZE <= COMM_PAGE_PHYS_BYTES);
    }

    #[test]
    fn comm_page_initial_state() {
        let page = CommPage::new(TestBlock(Mutex::new(vec![0xff; COMM_PAGE_PHYS_BYTES])));

        assert_eq!(read_u32(page.block(), COMM_SIZE_OFFSET), COMM_PAGE_SIZE as u32);
        assert_eq!(page.handshake(), 0xffffffff);
        assert_eq!(page.midi_out_free_count(), DSP_MIDI_OUT_FIFO_SIZE);
        assert!(page.monitors().iter().all(|&gain| gain == GAIN_MUTED));
        assert_eq!(page.line_in_level(3), 0);
        assert_eq!(page.flags(), 0);

        let mut meters = [0; MAX_PIPES];
        page.vu_meters(&mut meters);
        assert!(meters.iter().all(|&gain| gain == GAIN_MUTED));
    }

    #[test]
    fn comm_page_fields() {
        let page = CommPage::new(TestBlock(Mutex::new(vec![0; COMM_PAGE_PHYS_BYTES])));

        page.set_input_clock(0x0a);
        page.set_output_clock(0x01);
        assert_eq!(page.input_clock(), 0x0a);
        assert_eq!(page.output_clock(), 0x01);

        page.set_line_out_level(2, -6);
        assert_eq!(page.line_out_level(2), -6);

        page.set_monitor(17, 0);
        assert_eq!(page.monitors()[17], 0);

        page.set_midi_output(&[0xf8, 0xfa]);
        let mut frame = [0; 3];
        page.block().read(MIDI_OUTPUT_OFFSET, &mut frame);
        assert_eq!(frame, [2, 0xf8, 0xfa]);
    }
}
