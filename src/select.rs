//! Slot selection run at every boot.
//!
//! All slots are scanned, slots without a valid header or in a non-selectable state are
//! skipped, and the slot with the highest version wins. For an activated image each selection
//! counts as a boot attempt. Once the attempts run out the image is dismissed and the scan
//! starts over without it.

use serde::{Deserialize, Serialize};

use crate::{
    Error, Slot,
    boot::{Boot, Watchdog},
    flash::Flash,
    header::{Header, ImageState, MAX_BOOT_COUNT},
    log,
    store::SlotStore,
};

/// Boot policy.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootConfig {
    /// Selections an activated image gets before it is dismissed, including the one that
    /// dismisses it. Between 2 and [`MAX_BOOT_COUNT`]; with 3 an image boots twice.
    pub max_attempts: u8,
    /// Watchdog timeout for an image booted for the first time.
    pub watchdog_base_ms: u32,
    /// Upper bound for the watchdog timeout, which doubles with every boot attempt.
    pub watchdog_max_ms: u32,
}

impl BootConfig {
    pub const fn is_valid(&self) -> bool {
        self.max_attempts >= 2 && self.max_attempts <= MAX_BOOT_COUNT
    }

    /// `watchdog_base_ms << boot_count`, clamped to `watchdog_max_ms`.
    pub const fn watchdog_timeout(&self, boot_count: u8) -> u32 {
        let base = self.watchdog_base_ms;
        let shift = boot_count as u32;

        let timeout = if base == 0 {
            0
        } else if shift > base.leading_zeros() {
            u32::MAX
        } else {
            base << shift
        };

        if timeout > self.watchdog_max_ms {
            self.watchdog_max_ms
        } else {
            timeout
        }
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            max_attempts: 3,
            watchdog_base_ms: 2_000,
            watchdog_max_ms: 32_000,
        }
    }
}

/// Outcome of a successful selection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Selection {
    pub slot: Slot,
    pub start_addr: u32,
    /// Boot attempts including the current one, 0 for base format headers and confirmed images.
    pub boot_count: u8,
}

/// Apply the boot attempt policy to the header of the slot about to be selected.
///
/// An activated image has its boot count incremented, unless that would reach
/// `max_attempts`, in which case it is dismissed and the count is left alone.
pub fn record_attempt(header: &mut Header, max_attempts: u8) {
    if header.image_state() != Some(ImageState::Activated) {
        return;
    }

    let next = header.boot_count().saturating_add(1);
    if next >= max_attempts {
        header.set_image_state(ImageState::Dismissed);
    } else {
        header.set_boot_count(next);
    }
}

pub struct BootSelector<F, const N: usize, const PAGE: usize> {
    store: SlotStore<F, N, PAGE>,
    config: BootConfig,
}

impl<F: Flash, const N: usize, const PAGE: usize> BootSelector<F, N, PAGE> {
    pub fn new(
        store: SlotStore<F, N, PAGE>,
        config: BootConfig,
    ) -> Result<Self, Error<F::Error>> {
        if !config.is_valid() {
            return Err(Error::InvalidConfig);
        }
        Ok(Self { store, config })
    }

    pub fn store(&mut self) -> &mut SlotStore<F, N, PAGE> {
        &mut self.store
    }

    pub fn into_store(self) -> SlotStore<F, N, PAGE> {
        self.store
    }

    /// Eligible slot with the highest version, the lowest index winning a tie.
    fn best_candidate(&mut self) -> Result<Option<(Slot, Header)>, Error<F::Error>> {
        let mut best: Option<(Slot, Header)> = None;

        for slot in self.store.layout.slots() {
            let Some(header) = self.store.valid_header(slot)? else {
                continue;
            };

            if let Some(state) = header.image_state() {
                if !state.is_selectable() {
                    continue;
                }
            }

            match best {
                Some((_, ref current)) if header.version() <= current.version() => {}
                _ => best = Some((slot, header)),
            }
        }

        Ok(best)
    }

    /// Pick the slot to boot, persisting the boot attempt bookkeeping of the chosen image.
    pub fn select(&mut self) -> Result<Selection, Error<F::Error>> {
        // Every pass either returns or dismisses one slot.
        for _ in 0..=N {
            let Some((slot, mut header)) = self.best_candidate()? else {
                break;
            };

            record_attempt(&mut header, self.config.max_attempts);
            self.store.write_header(slot, &header)?;

            if header.image_state() == Some(ImageState::Dismissed) {
                log::warn!("slot {}: out of boot attempts, dismissed", slot.0);
                continue;
            }

            log::info!(
                "slot {}: selected version {}, attempt {}",
                slot.0,
                header.version(),
                header.boot_count()
            );

            return Ok(Selection {
                slot,
                start_addr: header.start_addr(),
                boot_count: header.boot_count(),
            });
        }

        log::error!("no bootable slot");
        Err(Error::NoBootableSlot)
    }

    /// Select a slot, arm the watchdog and jump into the image.
    ///
    /// Failing to find a bootable image is fatal: this panics, and the panic handler of the
    /// board is expected to halt until an external watchdog or an operator intervenes. A flash
    /// error during selection panics with its own message.
    pub fn run<B: Boot, W: Watchdog>(mut self, watchdog: &mut W) -> ! {
        let selection = match self.select() {
            Ok(selection) => selection,
            Err(Error::NoBootableSlot) => panic!("no bootable image"),
            Err(Error::Flash(e)) => panic!("flash error during boot selection: {:?}", e),
            Err(_) => panic!("boot selection failed"),
        };

        watchdog.arm(self.config.watchdog_timeout(selection.boot_count));
        log::info!("booting {:#x}", selection.start_addr);

        unsafe { B::boot(selection.start_addr as *const u32) }
    }
}
