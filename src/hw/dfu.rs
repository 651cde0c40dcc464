//! Thunks into the factory bootloader's jump table.
//!
//! The vendor ABI passes a 24-bit argument in r18:r17:r16 (low byte in
//! r16) and returns a byte in r16. The buffer-fill routine instead takes
//! the data word with its high byte in r16, low in r17, and the buffer
//! offset in r19:r18. Routines clobber r20 and Z, and were built by
//! avr-gcc, so r0 is saved around the call and r1 is re-zeroed after.

use core::arch::asm;

use super::write8;
use crate::boot::{routine_address, DfuCalls, Routine};

const TIMSK0: usize = 0x6E;

/// Raw calls into the resident DFU bootloader.
pub struct AvrDfu {
    flashend: u32,
}

impl AvrDfu {
    pub const fn new(flashend: u32) -> Self {
        Self { flashend }
    }

    /// Z register pair for `icall`, as a word address.
    fn target(&self, routine: Routine) -> (u8, u8) {
        let word = routine_address(self.flashend, routine) / 2;
        ((word & 0xFF) as u8, (word >> 8) as u8)
    }

    fn call(&self, routine: Routine, arg: u32) {
        let (zl, zh) = self.target(routine);
        unsafe {
            asm!(
                "push r0",
                "icall",
                "pop r0",
                "clr r1",
                inout("r16") (arg & 0xFF) as u8 => _,
                inout("r17") ((arg >> 8) & 0xFF) as u8 => _,
                inout("r18") ((arg >> 16) & 0xFF) as u8 => _,
                inout("r30") zl => _,
                inout("r31") zh => _,
                out("r20") _,
            )
        }
    }

    fn call_ret(&self, routine: Routine, arg: u32) -> u8 {
        let (zl, zh) = self.target(routine);
        let ret: u8;
        unsafe {
            asm!(
                "push r0",
                "icall",
                "pop r0",
                "clr r1",
                inout("r16") (arg & 0xFF) as u8 => ret,
                inout("r17") ((arg >> 8) & 0xFF) as u8 => _,
                inout("r18") ((arg >> 16) & 0xFF) as u8 => _,
                inout("r30") zl => _,
                inout("r31") zh => _,
                out("r20") _,
            )
        }
        ret
    }
}

impl DfuCalls for AvrDfu {
    fn read_fuse(&mut self, selector: u8) -> u8 {
        self.call_ret(Routine::ReadFuse, u32::from(selector))
    }

    fn read_signature(&mut self, address: u32) -> u8 {
        self.call_ret(Routine::ReadSignature, address)
    }

    fn fill_page_buffer(&mut self, word: u16, offset: u16) {
        let (zl, zh) = self.target(Routine::FillPageBuffer);
        unsafe {
            asm!(
                "push r0",
                "icall",
                "pop r0",
                "clr r1",
                inout("r16") (word >> 8) as u8 => _,
                inout("r17") (word & 0xFF) as u8 => _,
                inout("r18") (offset & 0xFF) as u8 => _,
                inout("r19") (offset >> 8) as u8 => _,
                inout("r30") zl => _,
                inout("r31") zh => _,
                out("r20") _,
            )
        }
    }

    fn erase_and_write_page(&mut self, address: u32) {
        self.call(Routine::PageEraseAndWrite, address);
    }

    fn erase_page(&mut self, address: u32) {
        self.call(Routine::PageErase, address);
    }

    fn program_page(&mut self, address: u32) {
        self.call(Routine::ProgramPage, address);
    }

    fn write_lock_bits(&mut self, bits: u8) {
        self.call(Routine::WriteLockBits, u32::from(bits));
    }

    fn stop_tick_timer(&mut self) {
        write8(TIMSK0, 0);
    }

    fn jump(&mut self, word_address: u16) {
        unsafe {
            asm!(
                "ijmp",
                in("r30") (word_address & 0xFF) as u8,
                in("r31") (word_address >> 8) as u8,
                options(noreturn),
            )
        }
    }

    fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        avr_device::interrupt::free(|_| f(self))
    }
}
