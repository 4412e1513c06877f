//! Header access for all slots, shared by the boot selector, the manager and the writer.

use crate::{
    Error, Slot,
    flash::{Flash, align_up},
    header::Header,
    layout::{Layout, SlotRegion},
    log,
};

/// Exclusive owner of the flash primitive and the slot layout.
///
/// Also owns the single page-sized RAM buffer of the bootloader. It is used when a header
/// rewrite needs a full page erase, and as the staging buffer of the
/// [`FlashWriter`](crate::writer::FlashWriter).
pub struct SlotStore<F, const N: usize, const PAGE: usize> {
    pub(crate) flash: F,
    pub(crate) layout: Layout<N>,
    pub(crate) page: [u8; PAGE],
}

impl<F: Flash, const N: usize, const PAGE: usize> SlotStore<F, N, PAGE> {
    /// Check `layout` against the flash geometry.
    ///
    /// `PAGE` must equal the erase size of the flash. Every slot must lie within the flash,
    /// start on a page boundary and span whole pages.
    pub fn new(flash: F, layout: Layout<N>) -> Result<Self, Error<F::Error>> {
        let write_size = flash.write_size();

        let geometry = flash.page_size() == PAGE
            && PAGE >= Header::MAX_LEN
            && write_size > 0
            && PAGE % write_size == 0;
        let aligned = layout.slots.iter().all(|region| {
            flash.contains(region.base, region.size)
                && flash.address_of(flash.page_of(region.base)) == region.base
                && region.size as usize % PAGE == 0
        });

        if !(geometry && aligned && layout.is_consistent()) {
            log::error!("slot layout does not match flash geometry");
            return Err(Error::InvalidConfig);
        }

        Ok(Self {
            flash,
            layout,
            page: [0; PAGE],
        })
    }

    pub fn layout(&self) -> &Layout<N> {
        &self.layout
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    pub(crate) fn region(&self, slot: Slot) -> Result<SlotRegion, Error<F::Error>> {
        self.layout.region(slot).copied().ok_or(Error::UnknownSlot)
    }

    /// Header of `slot` as stored, without checking it against the layout.
    pub fn read_header(&mut self, slot: Slot) -> Result<Option<Header>, Error<F::Error>> {
        let region = self.region(slot)?;
        let mut bytes = [0u8; Header::MAX_LEN];
        self.flash.read(region.base, &mut bytes)?;
        Ok(Header::parse(&bytes))
    }

    /// Header of `slot`, if it parses and points to the entry point of that same slot.
    ///
    /// A header with a foreign start address is treated as absent.
    pub fn valid_header(&mut self, slot: Slot) -> Result<Option<Header>, Error<F::Error>> {
        let entry = self.layout.entry_point(slot).ok_or(Error::UnknownSlot)?;
        let header = self.read_header(slot)?;
        Ok(header.filter(|header| header.start_addr() == entry))
    }

    /// Persist `header` into `slot` if it differs from what is stored.
    ///
    /// When the flash supports it and the change only clears bits, the header block is
    /// programmed in place. Otherwise the first page of the slot is erased and reprogrammed,
    /// during which the slot has no header at all.
    ///
    /// Returns whether anything was written.
    pub fn write_header(&mut self, slot: Slot, header: &Header) -> Result<bool, Error<F::Error>> {
        let region = self.region(slot)?;
        let encoded = header.encode();
        let header_len = header.encoded_len();
        let block_len = align_up(header_len, self.flash.write_size());

        let block = &mut self.page[..block_len];
        self.flash.read(region.base, block)?;

        if block[..header_len] == encoded[..header_len] {
            return Ok(false);
        }

        let clear_only = block
            .iter()
            .zip(&encoded[..header_len])
            .all(|(old, new)| old & new == *new);

        if clear_only && self.flash.supports_in_place_clear() {
            block[..header_len].copy_from_slice(&encoded[..header_len]);
            self.flash.program(region.base, block)?;
            log::debug!("slot {}: header updated in place", slot.0);
            return Ok(true);
        }

        self.flash.read(region.base, &mut self.page)?;
        self.page[..header_len].copy_from_slice(&encoded[..header_len]);
        self.flash.erase(self.flash.page_of(region.base))?;
        self.flash.program(region.base, &self.page)?;
        log::debug!("slot {}: header page rewritten", slot.0);

        Ok(true)
    }
}
