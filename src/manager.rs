//! Slot bookkeeping for the running application.

use crate::{
    Error, Slot,
    flash::Flash,
    header::{Header, ImageState},
    log,
    store::SlotStore,
    writer::FlashWriter,
};

/// View of the slots from the firmware that is currently executing.
///
/// `running_entry` is the entry point of the running image, typically the address of its
/// vector table.
pub struct SlotManager<F, const N: usize, const PAGE: usize> {
    store: SlotStore<F, N, PAGE>,
    running_entry: u32,
}

impl<F: Flash, const N: usize, const PAGE: usize> SlotManager<F, N, PAGE> {
    pub fn new(store: SlotStore<F, N, PAGE>, running_entry: u32) -> Self {
        Self {
            store,
            running_entry,
        }
    }

    pub fn store(&mut self) -> &mut SlotStore<F, N, PAGE> {
        &mut self.store
    }

    pub fn into_store(self) -> SlotStore<F, N, PAGE> {
        self.store
    }

    /// The slot whose valid header points at the running entry point.
    ///
    /// Headers whose start address belongs to another slot are ignored, as the boot selector
    /// does, so an image linked for the running slot but stored elsewhere is never mistaken
    /// for it.
    pub fn current_slot_index(&mut self) -> Result<Slot, Error<F::Error>> {
        for slot in self.store.layout.slots() {
            if let Some(header) = self.store.valid_header(slot)?
                && header.start_addr() == self.running_entry
            {
                return Ok(slot);
            }
        }

        Err(Error::NoHeader)
    }

    /// The slot an update should be written to.
    pub fn other_slot_index(&mut self) -> Result<Slot, Error<F::Error>> {
        let current = self.current_slot_index()?;
        Ok(Slot(((current.0 as usize + 1) % N) as u8))
    }

    /// Mark the running image as good, so the boot selector stops counting attempts for it.
    ///
    /// Returns whether the header had to be written.
    pub fn confirm_current_slot(&mut self) -> Result<bool, Error<F::Error>> {
        let slot = self.current_slot_index()?;
        let mut header = self.header(slot)?;

        if !header.set_image_state(ImageState::Confirmed) {
            return Ok(false);
        }

        log::info!("slot {}: confirmed", slot.0);
        self.store.write_header(slot, &header)
    }

    /// Activate the other slot for the next boots, or deactivate it.
    ///
    /// Activation also resets the boot count of the slot.
    pub fn set_other_slot_active(&mut self, active: bool) -> Result<bool, Error<F::Error>> {
        let slot = self.other_slot_index()?;
        let mut header = self.header(slot)?;

        if active {
            header.set_image_state(ImageState::Activated);
            header.set_boot_count(0);
        } else {
            header.set_image_state(ImageState::Deactivated);
        }

        log::info!("slot {}: active {}", slot.0, active);
        self.store.write_header(slot, &header)
    }

    /// Start writing a new image into the other slot.
    ///
    /// See [`FlashWriter::init`] for `skip`.
    pub fn begin_update(
        &mut self,
        skip: usize,
    ) -> Result<FlashWriter<'_, F, N, PAGE>, Error<F::Error>> {
        let current = self.current_slot_index()?;
        let target = self.other_slot_index()?;

        if target == current {
            log::error!("no slot to update into");
            return Err(Error::InvalidConfig);
        }

        FlashWriter::init(&mut self.store, target, skip)
    }

    fn header(&mut self, slot: Slot) -> Result<Header, Error<F::Error>> {
        self.store.valid_header(slot)?.ok_or(Error::NoHeader)
    }
}
