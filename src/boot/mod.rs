//! Hand-off to a selected image.
#[cfg(feature = "cortex_m")]
pub mod cortex_m;

/// Bootload mechanism that at the least jumps to the start address recorded in a slot header.
///
/// Optionally could drop TrustZone privileges or mask memory access.
pub trait Boot {
    /// Start address of the image, typically pointing to the vector table.
    ///
    /// # Safety
    /// `addr` must point to a complete image for the running architecture.
    unsafe fn boot(addr: *const u32) -> !;
}

/// Watchdog armed right before the hand-off.
pub trait Watchdog {
    fn arm(&mut self, timeout_ms: u32);
}

/// For boards that arm their watchdog elsewhere, or have none.
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn arm(&mut self, _timeout_ms: u32) {}
}
