#[cfg(feature = "storage_loader")]
pub mod fs;

use std::vec::Vec;

use embedded_storage::nor_flash::{
    ErrorType, MultiwriteNorFlash, NorFlash, NorFlashErrorKind, ReadNorFlash, check_erase,
    check_read, check_write,
};

use crate::{
    Page, Slot,
    boot::Boot,
    flash::{ERASED, Flash},
    header::Header,
    layout::{Layout, SlotRegion},
    store::SlotStore,
};

pub const PAGE_SIZE: usize = 256;
pub const WRITE_SIZE: usize = 4;
pub const FLASH_BASE: u32 = 0x0800_0000;
pub const FLASH_SIZE: usize = 16 * PAGE_SIZE;

pub const SLOT_A: Slot = Slot(0);
pub const SLOT_B: Slot = Slot(1);

pub const HEADER_RESERVED: u32 = 0x40;
pub const SLOT_SIZE: u32 = 6 * PAGE_SIZE as u32;

/// Bootloader in pages 0..4, slot A in pages 4..10, slot B in pages 10..16.
pub const LAYOUT: Layout<2> = Layout::new(
    [
        SlotRegion {
            base: FLASH_BASE + 4 * PAGE_SIZE as u32,
            size: SLOT_SIZE,
        },
        SlotRegion {
            base: FLASH_BASE + 10 * PAGE_SIZE as u32,
            size: SLOT_SIZE,
        },
    ],
    HEADER_RESERVED,
);

pub type MockStore = SlotStore<MockFlash, 2, PAGE_SIZE>;

pub const fn entry_point(slot: Slot) -> u32 {
    LAYOUT.slots[slot.0 as usize].base + HEADER_RESERVED
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockError {
    PowerLoss,
    NotErased,
    Misaligned,
    OutOfBounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    Erase(Page),
    Program { address: u32, len: usize },
}

/// NOR flash in RAM, recording every erase and program.
pub struct MockFlash {
    pub mem: Vec<u8>,
    pub in_place_clear: bool,
    pub ops: Vec<FlashOp>,
    /// Number of erase or program operations that succeed before the next one fails.
    pub fail_after: Option<usize>,
    /// Bytes of a failing program operation that still reach the flash.
    pub torn_bytes: usize,
}

impl MockFlash {
    pub fn new() -> Self {
        MockFlash {
            mem: std::vec![ERASED; FLASH_SIZE],
            in_place_clear: true,
            ops: Vec::new(),
            fail_after: None,
            torn_bytes: 0,
        }
    }

    pub fn without_in_place_clear() -> Self {
        MockFlash {
            in_place_clear: false,
            ..Self::new()
        }
    }

    pub fn bytes(&self, address: u32, len: usize) -> &[u8] {
        let offset = (address - FLASH_BASE) as usize;
        &self.mem[offset..offset + len]
    }

    /// Place a header in a slot as if flashed by a programmer, bypassing the operation log.
    pub fn put_header(&mut self, slot: Slot, header: &Header) {
        let offset = (LAYOUT.slots[slot.0 as usize].base - FLASH_BASE) as usize;
        let bytes = header.encode();
        self.mem[offset..offset + Header::MAX_LEN].copy_from_slice(&bytes);
    }

    pub fn header(&self, slot: Slot) -> Option<Header> {
        Header::parse(self.bytes(LAYOUT.slots[slot.0 as usize].base, Header::MAX_LEN))
    }

    pub fn erases(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, FlashOp::Erase(_)))
            .count()
    }

    fn power(&mut self) -> bool {
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                false
            }
            Some(n) => {
                self.fail_after = Some(n - 1);
                true
            }
            None => true,
        }
    }
}

impl Flash for MockFlash {
    type Error = MockError;

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn write_size(&self) -> usize {
        WRITE_SIZE
    }

    fn supports_in_place_clear(&self) -> bool {
        self.in_place_clear
    }

    fn contains(&self, address: u32, len: u32) -> bool {
        address >= FLASH_BASE && (address - FLASH_BASE) as u64 + len as u64 <= FLASH_SIZE as u64
    }

    fn page_of(&self, address: u32) -> Page {
        Page((address - FLASH_BASE) / PAGE_SIZE as u32)
    }

    fn address_of(&self, page: Page) -> u32 {
        FLASH_BASE + page.0 * PAGE_SIZE as u32
    }

    fn erase(&mut self, page: Page) -> Result<(), MockError> {
        let offset = page.0 as usize * PAGE_SIZE;
        if offset + PAGE_SIZE > FLASH_SIZE {
            return Err(MockError::OutOfBounds);
        }
        if !self.power() {
            return Err(MockError::PowerLoss);
        }

        self.mem[offset..offset + PAGE_SIZE].fill(ERASED);
        self.ops.push(FlashOp::Erase(page));
        Ok(())
    }

    fn program(&mut self, address: u32, bytes: &[u8]) -> Result<(), MockError> {
        if address % WRITE_SIZE as u32 != 0 || bytes.len() % WRITE_SIZE != 0 {
            return Err(MockError::Misaligned);
        }
        let offset = (address - FLASH_BASE) as usize;
        if offset + bytes.len() > FLASH_SIZE {
            return Err(MockError::OutOfBounds);
        }

        let target = &self.mem[offset..offset + bytes.len()];
        let programmable = target.iter().zip(bytes).all(|(old, new)| {
            if self.in_place_clear {
                old & new == *new
            } else {
                *old == ERASED
            }
        });
        if !programmable {
            return Err(MockError::NotErased);
        }

        if !self.power() {
            let torn = self.torn_bytes.min(bytes.len());
            self.mem[offset..offset + torn].copy_from_slice(&bytes[..torn]);
            return Err(MockError::PowerLoss);
        }

        self.mem[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.ops.push(FlashOp::Program {
            address,
            len: bytes.len(),
        });
        Ok(())
    }

    fn read(&mut self, address: u32, bytes: &mut [u8]) -> Result<(), MockError> {
        let offset = (address - FLASH_BASE) as usize;
        if offset + bytes.len() > FLASH_SIZE {
            return Err(MockError::OutOfBounds);
        }
        bytes.copy_from_slice(&self.mem[offset..offset + bytes.len()]);
        Ok(())
    }
}

/// Store over a mock flash with the given headers already in place.
pub fn store_with(headers: [Option<Header>; 2]) -> MockStore {
    let mut flash = MockFlash::new();
    for (slot, header) in LAYOUT.slots().zip(headers) {
        if let Some(header) = header {
            flash.put_header(slot, &header);
        }
    }
    SlotStore::new(flash, LAYOUT).unwrap()
}

/// `embedded-storage` NOR flash in RAM.
pub struct MemNorFlash {
    pub mem: [u8; FLASH_SIZE],
    pub erase_count: usize,
}

impl MemNorFlash {
    pub const fn new() -> Self {
        MemNorFlash {
            mem: [ERASED; FLASH_SIZE],
            erase_count: 0,
        }
    }
}

impl ErrorType for MemNorFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MemNorFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        let offset = offset as usize;
        bytes.copy_from_slice(&self.mem[offset..offset + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        FLASH_SIZE
    }
}

impl NorFlash for MemNorFlash {
    const WRITE_SIZE: usize = WRITE_SIZE;
    const ERASE_SIZE: usize = PAGE_SIZE;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to)?;
        self.mem[from as usize..to as usize].fill(ERASED);
        self.erase_count += 1;
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        for (cell, byte) in self.mem[offset as usize..].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}

impl MultiwriteNorFlash for MemNorFlash {}

/// Hand-off that panics with the target address, for `should_panic` tests.
pub struct PanicBoot;

impl Boot for PanicBoot {
    unsafe fn boot(addr: *const u32) -> ! {
        panic!("boot {:#010x}", addr as u32)
    }
}
