use crate::boot::Boot;

/// Simple bootload mechanism for Cortex-M without support for TrustZone.
///
/// Loads the stack pointer and reset vector from the vector table at the image start.
pub struct SimpleCortexM;

impl Boot for SimpleCortexM {
    unsafe fn boot(addr: *const u32) -> ! {
        cortex_m::interrupt::disable();
        unsafe { cortex_m::asm::bootload(addr) }
    }
}
