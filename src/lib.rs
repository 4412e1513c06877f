//! Dual-slot (A/B) boot selection and power-loss-safe firmware update.
//!
//! At every boot the [`select::BootSelector`] scans all image slots, applies the boot-attempt
//! policy and hands off to the newest bootable image. Running firmware uses the
//! [`manager::SlotManager`] to confirm itself and to write a new image into the other slot
//! through the [`writer::FlashWriter`], which keeps the target slot unbootable until the very
//! last write.
#![no_std]

pub mod boot;
pub mod flash;
pub mod header;
pub mod layout;
#[cfg(feature = "storage_loader")]
pub mod loader;
pub mod manager;
pub mod select;
pub mod store;
#[cfg(feature = "verify")]
pub mod verify;
pub mod writer;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

#[cfg(feature = "defmt")]
pub(crate) use defmt as log;

#[cfg(all(feature = "log", not(feature = "defmt")))]
pub(crate) use ::log;

#[cfg(not(any(feature = "log", feature = "defmt")))]
pub(crate) mod log {
    macro_rules! info {
        ( $( $x:expr ),* ) => {};
    }
    pub(crate) use info;
    macro_rules! debug {
        ( $( $x:expr ),* ) => {};
    }
    pub(crate) use debug;
    macro_rules! warner {
        ( $( $x:expr ),* ) => {};
    }
    pub(crate) use warner as warn;
    macro_rules! error {
        ( $( $x:expr ),* ) => {};
    }
    pub(crate) use error;
}

/// Errors reported by the slot store, boot selector, manager and writer.
///
/// `E` is the error type of the underlying [`flash::Flash`] primitive.
#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// The flash primitive reported an error.
    Flash(E),
    /// No slot holds a bootable image.
    NoBootableSlot,
    /// Layout, buffer or policy configuration does not fit the flash geometry.
    InvalidConfig,
    /// The slot index is not part of the layout.
    UnknownSlot,
    /// The slot holds no valid header.
    NoHeader,
    /// The image does not fit in the target slot.
    ImageTooLarge,
    /// An earlier flash error aborted this update session.
    Aborted,
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Error::Flash(e)
    }
}

/// Image slot with regards to the bootloader.
///
/// The layout describes at what location and with which size each slot resides.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Slot(pub(crate) u8);

impl Slot {
    pub const fn new(index: u8) -> Self {
        Slot(index)
    }

    pub const fn index(self) -> u8 {
        self.0
    }
}

/// Erasable page of the flash primitive.
///
/// Page numbers are global to the flash device, not relative to a slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Page(pub u32);
