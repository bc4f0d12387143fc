// SPDX-License-Identifier: LGPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

//! Services of operating system consumed by the card and its DSP.
//!
//! The module includes the traits for the register window of DSP, the physically contiguous
//! memory shared with DSP, the non-paged memory for objects accessed in interrupt context, the
//! timer, and the firmware images.

use {
    super::{firmware::FirmwareId, DspDevice},
    glib::Error,
    std::{alloc::Layout, ptr::NonNull, sync::Arc},
};

/// The register window of DSP. The offset is in 32 bit words.
pub trait DspRegisters {
    fn read_register(&self, offset: usize) -> u32;
    fn write_register(&self, offset: usize, val: u32);
}

/// The block of physically contiguous memory. The DSP accesses it by bus mastering, thus any
/// access should be done via the methods.
pub trait PhysPageBlock {
    /// The bus address of the block.
    fn phys_addr(&self) -> u32;
    /// The size of block in bytes.
    fn size(&self) -> usize;

    fn read(&self, offset: usize, frame: &mut [u8]);
    fn write(&self, offset: usize, frame: &[u8]);
}

/// Services of operating system.
pub trait OsSupport {
    type Registers: DspRegisters;
    type PageBlock: PhysPageBlock;

    /// The register window of DSP, owned by the implementation.
    fn dsp_registers(&self) -> &Self::Registers;

    /// The type of DSP mounted on the card.
    fn dsp_device(&self) -> DspDevice;

    /// The monotonic system time in microseconds.
    fn system_time(&self) -> u64;

    /// Wait for the microseconds in busy loop.
    fn snooze(&self, usec: u64);

    fn alloc_phys_page_block(&self, size: usize) -> Result<Self::PageBlock, Error>;
    fn free_phys_page_block(&self, block: &Self::PageBlock);

    /// Allocate memory never paged out.
    fn alloc_non_paged(&self, layout: Layout) -> Result<NonNull<u8>, Error>;

    /// Release memory allocated by `alloc_non_paged()`.
    ///
    /// # Safety
    ///
    /// The pointer should be allocated by `alloc_non_paged()` of the same instance with the same
    /// layout, and never be used after the call.
    unsafe fn free_non_paged(&self, ptr: NonNull<u8>, layout: Layout);

    /// Retrieve the image of firmware.
    fn request_firmware(&self, id: FirmwareId) -> Result<Arc<[u8]>, Error>;
}
