//! Bootloader ABI bridge.
//!
//! The factory DFU bootloader keeps a jump table of flash and fuse
//! routines at fixed offsets below the top of flash. This module owns
//! the address math for that table, defines the raw call boundary as the
//! [`DfuCalls`] trait, and layers validated, typed operations on top in
//! [`Bridge`]. Everything above the trait is ordinary safe Rust; the
//! register marshaling lives in the `hw` backend.

use crate::config::PAGE_SIZE;
use crate::error::Error;
use crate::rawhid::UpdateOps;

/// Fuse selectors accepted by the bootloader's fuse-read routine.
pub const FUSE_LOW: u8 = 0;
pub const FUSE_LOCK: u8 = 1;
pub const FUSE_EXTENDED: u8 = 2;
pub const FUSE_HIGH: u8 = 3;

/// Byte address of the last jump-table entry.
pub const fn last_boot_entry(flashend: u32) -> u32 {
    flashend - 3
}

/// Bootloader-resident routines, identified by their fixed offset below
/// the last jump-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Routine {
    PageEraseAndWrite,
    ReadSignature,
    ReadFuse,
    FillPageBuffer,
    ProgramPage,
    PageErase,
    WriteLockBits,
}

impl Routine {
    pub const fn offset(self) -> u32 {
        match self {
            Routine::PageEraseAndWrite => 24,
            Routine::ReadSignature => 20,
            Routine::ReadFuse => 16,
            Routine::FillPageBuffer => 12,
            Routine::ProgramPage => 8,
            Routine::PageErase => 4,
            Routine::WriteLockBits => 0,
        }
    }
}

/// Byte address of a bootloader routine for the given top of flash.
pub const fn routine_address(flashend: u32, routine: Routine) -> u32 {
    last_boot_entry(flashend) - routine.offset()
}

/// Bootloader section size in bytes, decoded from the BOOTSZ field of
/// the high fuse.
pub const fn bootloader_size_from_fuse(high_fuse: u8) -> u32 {
    512 << (3 - ((high_fuse >> 1) & 0b11)) as u32
}

/// The raw call boundary into bootloader-resident code, plus the two
/// pieces of machine state the jump sequence owns (interrupt flag, tick
/// timer). Implementations marshal arguments into the fixed registers of
/// the vendor ABI.
pub trait DfuCalls {
    fn read_fuse(&mut self, selector: u8) -> u8;
    fn read_signature(&mut self, address: u32) -> u8;
    /// Stage one little-endian word at a byte offset in the temporary
    /// page buffer.
    fn fill_page_buffer(&mut self, word: u16, offset: u16);
    /// Erase the page holding `address`, then program the staged buffer
    /// into it.
    fn erase_and_write_page(&mut self, address: u32);
    fn erase_page(&mut self, address: u32);
    fn program_page(&mut self, address: u32);
    fn write_lock_bits(&mut self, bits: u8);
    /// Silence the periodic tick interrupt ahead of a bootloader entry.
    fn stop_tick_timer(&mut self);
    /// Enter code at `word_address`. Diverges on hardware; test doubles
    /// record the address and return.
    fn jump(&mut self, word_address: u16);
    /// Run `f` with interrupts masked. Flash sequences must not be
    /// interleaved with interrupt handlers.
    fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R
    where
        Self: Sized;
}

/// Typed operations over the bootloader jump table.
///
/// Reads the high fuse once at construction to learn the bootloader's
/// footprint, and validates every flash target against it before a raw
/// call is made.
pub struct Bridge<C: DfuCalls> {
    calls: C,
    flashend: u32,
    bootloader_size: u32,
}

impl<C: DfuCalls> Bridge<C> {
    pub fn new(mut calls: C, flashend: u32) -> Self {
        let bootloader_size = bootloader_size_from_fuse(calls.read_fuse(FUSE_HIGH));
        Self {
            calls,
            flashend,
            bootloader_size,
        }
    }

    pub fn bootloader_size(&self) -> u32 {
        self.bootloader_size
    }

    /// First byte address of the bootloader section.
    pub fn bootloader_start(&self) -> u32 {
        self.flashend + 1 - self.bootloader_size
    }

    /// Word address the bootloader is entered at.
    pub fn entry_word_address(&self) -> u16 {
        ((self.flashend - self.bootloader_size) / 2 + 1) as u16
    }

    pub fn read_fuse(&mut self, selector: u8) -> u8 {
        self.calls.read_fuse(selector)
    }

    pub fn read_signature(&mut self, address: u32) -> u8 {
        self.calls.read_signature(address)
    }

    pub fn write_lock_bits(&mut self, bits: u8) {
        self.calls.write_lock_bits(bits)
    }

    /// Erase the page at `address`. Page-aligned, application section
    /// only.
    pub fn erase_page(&mut self, address: u32) -> Result<(), Error> {
        self.check_target(address)?;
        self.calls.without_interrupts(|c| c.erase_page(address));
        Ok(())
    }

    /// Program the staged page buffer at `address` without erasing.
    pub fn program_page(&mut self, address: u32) -> Result<(), Error> {
        self.check_target(address)?;
        self.calls.without_interrupts(|c| c.program_page(address));
        Ok(())
    }

    /// Stage and commit one full page: fill the temporary buffer a word
    /// at a time, then erase-and-program, all in one interrupt-free
    /// sequence.
    pub fn write_full_page(&mut self, address: u32, page: &[u8; PAGE_SIZE]) -> Result<(), Error> {
        self.check_target(address)?;
        self.calls.without_interrupts(|c| {
            for (i, pair) in page.chunks_exact(2).enumerate() {
                let word = u16::from_le_bytes([pair[0], pair[1]]);
                c.fill_page_buffer(word, (i * 2) as u16);
            }
            c.erase_and_write_page(address);
        });
        Ok(())
    }

    /// Hand control to the bootloader. On hardware this never returns.
    /// The tick timer is silenced first, so no interrupt can fire between
    /// here and the bootloader masking them itself.
    pub fn jump_to_bootloader(&mut self) {
        self.calls.stop_tick_timer();
        let entry = self.entry_word_address();
        self.calls.jump(entry);
    }

    fn check_target(&self, address: u32) -> Result<(), Error> {
        if address % PAGE_SIZE as u32 != 0 {
            return Err(Error::Misaligned);
        }
        match address.checked_add(PAGE_SIZE as u32) {
            Some(end) if end <= self.bootloader_start() => Ok(()),
            _ => Err(Error::AddressRange),
        }
    }
}

impl<C: DfuCalls> UpdateOps for Bridge<C> {
    fn write_page(&mut self, address: u32, page: &[u8; PAGE_SIZE]) -> Result<(), Error> {
        self.write_full_page(address, page)
    }

    fn enter_bootloader(&mut self) {
        self.jump_to_bootloader();
    }
}

/// Writable-window policy for host-driven page writes: page-aligned,
/// past the running firmware image, below the bootloader.
///
/// This is deliberately narrower than [`Bridge`]'s own check, which only
/// protects the bootloader; self-update of the running image stays
/// possible through the bridge, just not through the packet protocol.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashLayout {
    flashend: u32,
    bootloader_size: u32,
    firmware_end: u32,
}

impl FlashLayout {
    pub const fn new(flashend: u32, bootloader_size: u32, firmware_end: u32) -> Self {
        Self {
            flashend,
            bootloader_size,
            firmware_end,
        }
    }

    /// First byte address of the bootloader section.
    pub const fn bootloader_start(&self) -> u32 {
        self.flashend + 1 - self.bootloader_size
    }

    pub fn check_page_write(&self, address: u32) -> Result<(), Error> {
        if address % PAGE_SIZE as u32 != 0 {
            return Err(Error::Misaligned);
        }
        if address < self.firmware_end {
            return Err(Error::AddressRange);
        }
        // Addresses come straight off the wire; the page-end sum must
        // not wrap.
        match address.checked_add(PAGE_SIZE as u32) {
            Some(end) if end <= self.bootloader_start() => Ok(()),
            _ => Err(Error::AddressRange),
        }
    }
}
