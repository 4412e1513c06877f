//! SHA-256 check of an image in a slot.

use sha2::{Digest, Sha256};

use crate::{
    Error, Slot,
    flash::Flash,
    header::{MAGIC, MAGIC_LEN},
    layout::SlotRegion,
    log,
    store::SlotStore,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum VerifyResult {
    /// The image is too small to hold a magic.
    TooSmall,
    Match,
    Mismatch,
}

/// Compare the SHA-256 of the first `image_size` bytes of a committed slot against `expected`.
///
/// The digest covers the image as it was built, magic included.
pub fn verify_slot_sha256<F: Flash, const N: usize, const PAGE: usize>(
    store: &mut SlotStore<F, N, PAGE>,
    slot: Slot,
    expected: &[u8; 32],
    image_size: usize,
) -> Result<VerifyResult, Error<F::Error>> {
    let region = store.region(slot)?;
    verify_image(
        &mut store.flash,
        &mut store.page,
        region,
        &MAGIC,
        expected,
        image_size,
    )
}

/// Hash `head` followed by the flash contents of `region` after it, `image_size` bytes in total.
///
/// `head` stands in for the start of the region, which may not be in flash yet.
pub(crate) fn verify_image<F: Flash>(
    flash: &mut F,
    buf: &mut [u8],
    region: SlotRegion,
    head: &[u8],
    expected: &[u8; 32],
    image_size: usize,
) -> Result<VerifyResult, Error<F::Error>> {
    if image_size < MAGIC_LEN {
        log::warn!("image of {} bytes is too small", image_size);
        return Ok(VerifyResult::TooSmall);
    }
    if image_size > region.size as usize {
        return Err(Error::ImageTooLarge);
    }

    let mut hasher = Sha256::new();

    let head_len = head.len().min(image_size);
    hasher.update(&head[..head_len]);

    let mut offset = head_len;
    while offset < image_size {
        let n = buf.len().min(image_size - offset);
        flash.read(region.base + offset as u32, &mut buf[..n])?;
        hasher.update(&buf[..n]);
        offset += n;
    }

    if hasher.finalize().as_slice() == expected {
        Ok(VerifyResult::Match)
    } else {
        log::warn!("image digest mismatch");
        Ok(VerifyResult::Mismatch)
    }
}
