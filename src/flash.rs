//! Flash primitive consumed by the bootloader.
//!
//! The primitive is dumb: it erases whole pages and programs already-erased memory.
//! All operations are blocking. Disabling interrupts around a flash controller sequence
//! is the responsibility of the implementation.

use embedded_storage::nor_flash::{MultiwriteNorFlash, NorFlash, ReadNorFlash};

use crate::Page;

/// Value of an erased flash byte.
pub const ERASED: u8 = 0xFF;

/// Page oriented flash device, addressed with absolute addresses.
pub trait Flash {
    type Error: core::fmt::Debug;

    /// Size in bytes of the smallest erasable unit.
    fn page_size(&self) -> usize;

    /// Minimum program block size. Program addresses and lengths must be multiples of it.
    fn write_size(&self) -> usize;

    /// Whether programmed bytes may be programmed again, as long as bits only go from 1 to 0.
    fn supports_in_place_clear(&self) -> bool;

    /// Whether `[address, address + len)` lies within the device.
    fn contains(&self, address: u32, len: u32) -> bool;

    fn page_of(&self, address: u32) -> Page;

    fn address_of(&self, page: Page) -> u32;

    /// Erase a single page to [`ERASED`].
    fn erase(&mut self, page: Page) -> Result<(), Self::Error>;

    /// Program `bytes` at `address`, which must have been erased before.
    fn program(&mut self, address: u32, bytes: &[u8]) -> Result<(), Self::Error>;

    fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<(), Self::Error>;
}

/// [`Flash`] on top of an `embedded-storage` NOR flash driver.
///
/// `base` is the absolute address of offset 0 of the driver, typically the start of the
/// memory mapped internal flash.
pub struct NorFlashPrimitive<F> {
    flash: F,
    base: u32,
    in_place_clear: bool,
}

impl<F: NorFlash> NorFlashPrimitive<F> {
    pub fn new(flash: F, base: u32) -> Self {
        Self {
            flash,
            base,
            in_place_clear: false,
        }
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    /// Only meaningful for addresses accepted by [`Flash::contains`].
    fn offset(&self, address: u32) -> u32 {
        address.wrapping_sub(self.base)
    }
}

impl<F: MultiwriteNorFlash> NorFlashPrimitive<F> {
    /// Wrap a driver that allows rewriting programmed words, enabling in-place header updates.
    pub fn new_multiwrite(flash: F, base: u32) -> Self {
        Self {
            flash,
            base,
            in_place_clear: true,
        }
    }
}

impl<F: NorFlash> Flash for NorFlashPrimitive<F> {
    type Error = F::Error;

    fn page_size(&self) -> usize {
        F::ERASE_SIZE
    }

    fn write_size(&self) -> usize {
        F::WRITE_SIZE
    }

    fn supports_in_place_clear(&self) -> bool {
        self.in_place_clear
    }

    fn contains(&self, address: u32, len: u32) -> bool {
        address >= self.base
            && (self.offset(address) as u64 + len as u64) <= self.flash.capacity() as u64
    }

    fn page_of(&self, address: u32) -> Page {
        Page(self.offset(address) / F::ERASE_SIZE as u32)
    }

    fn address_of(&self, page: Page) -> u32 {
        self.base.wrapping_add(page.0.wrapping_mul(F::ERASE_SIZE as u32))
    }

    fn erase(&mut self, page: Page) -> Result<(), Self::Error> {
        let from = page.0 * F::ERASE_SIZE as u32;
        self.flash.erase(from, from + F::ERASE_SIZE as u32)
    }

    fn program(&mut self, address: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let offset = self.offset(address);
        self.flash.write(offset, bytes)
    }

    fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let offset = self.offset(address);
        ReadNorFlash::read(&mut self.flash, offset, bytes)
    }
}

/// Round `len` up to the next multiple of `block`.
pub(crate) const fn align_up(len: usize, block: usize) -> usize {
    len.div_ceil(block) * block
}
