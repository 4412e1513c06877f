//! Slot registry: where every image slot lives in flash.

use serde::{Deserialize, Serialize};

use crate::{Slot, header::Header};

/// Flash region owned by a single image slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotRegion {
    /// Absolute address of the slot header.
    pub base: u32,
    /// Size in bytes, header included.
    pub size: u32,
}

impl SlotRegion {
    pub const fn end(&self) -> u32 {
        self.base + self.size
    }
}

/// Fixed set of `N` image slots.
///
/// Every slot starts with a header region of `header_reserved` bytes, followed by the image
/// itself. The entry point of a slot is the first byte after that region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Layout<const N: usize> {
    pub slots: [SlotRegion; N],
    pub header_reserved: u32,
}

impl<const N: usize> Layout<N> {
    pub const fn new(slots: [SlotRegion; N], header_reserved: u32) -> Self {
        Self {
            slots,
            header_reserved,
        }
    }

    pub const fn slot_count(&self) -> usize {
        N
    }

    /// All slots in scan order.
    pub fn slots(&self) -> impl Iterator<Item = Slot> + use<N> {
        (0..N as u8).map(Slot)
    }

    pub fn region(&self, slot: Slot) -> Option<&SlotRegion> {
        self.slots.get(slot.0 as usize)
    }

    /// Address of the header of `slot`.
    pub fn header_address(&self, slot: Slot) -> Option<u32> {
        self.region(slot).map(|region| region.base)
    }

    /// Address execution jumps to when booting `slot`.
    pub fn entry_point(&self, slot: Slot) -> Option<u32> {
        self.region(slot)
            .map(|region| region.base + self.header_reserved)
    }

    /// Slot whose entry point equals `entry`.
    pub fn slot_of_entry(&self, entry: u32) -> Option<Slot> {
        self.slots()
            .find(|slot| self.entry_point(*slot) == Some(entry))
    }

    /// Geometry checks that do not depend on the flash device.
    pub(crate) fn is_consistent(&self) -> bool {
        if N == 0 || N > u8::MAX as usize || (self.header_reserved as usize) < Header::MAX_LEN {
            return false;
        }

        let sized = self.slots.iter().all(|region| {
            region.size > self.header_reserved && region.base.checked_add(region.size).is_some()
        });
        if !sized {
            return false;
        }

        self.slots.iter().enumerate().all(|(i, a)| {
            self.slots[i + 1..]
                .iter()
                .all(|b| a.end() <= b.base || b.end() <= a.base)
        })
    }
}
