//! Streaming image writer that keeps the target slot unbootable until the last write.
//!
//! The first write block of the slot, which holds the header magic, is kept back in RAM while
//! the rest of the image streams into flash page by page. [`FlashWriter::finish`] programs that
//! block as the final operation. A power loss at any earlier point leaves a slot without magic,
//! which the boot selector ignores.

use crate::{
    Error, Slot,
    flash::{ERASED, Flash, align_up},
    header::{MAGIC, MAGIC_LEN},
    layout::SlotRegion,
    log,
    store::SlotStore,
};

/// Largest block that can be withheld for the commit write.
pub const COMMIT_BLOCK_MAX: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Session {
    Open,
    /// The final chunk has been written, only the commit is left.
    Complete,
    Aborted,
}

/// Update session writing a new image into one slot.
///
/// Borrows the page buffer of the [`SlotStore`] as staging buffer. Dropping the writer
/// without calling [`FlashWriter::finish`] abandons the update; the slot stays unbootable.
pub struct FlashWriter<'a, F, const N: usize, const PAGE: usize> {
    store: &'a mut SlotStore<F, N, PAGE>,
    slot: Slot,
    region: SlotRegion,
    /// Offset within the slot of the next byte to be written.
    offset: u32,
    commit: [u8; COMMIT_BLOCK_MAX],
    commit_len: usize,
    session: Session,
}

impl<'a, F: Flash, const N: usize, const PAGE: usize> FlashWriter<'a, F, N, PAGE> {
    /// Start writing into `slot`.
    ///
    /// The first `skip` bytes of the image are not part of the stream and are supplied to
    /// [`FlashWriter::finish`] instead, typically [`MAGIC_LEN`] bytes. Erases the first page of
    /// the slot right away, so whatever image was there before is no longer bootable.
    pub fn init(
        store: &'a mut SlotStore<F, N, PAGE>,
        slot: Slot,
        skip: usize,
    ) -> Result<Self, Error<F::Error>> {
        let region = store.region(slot)?;
        let commit_len = align_up(skip.max(MAGIC_LEN), store.flash.write_size());

        if commit_len > COMMIT_BLOCK_MAX || commit_len > PAGE {
            return Err(Error::InvalidConfig);
        }

        store.flash.erase(store.flash.page_of(region.base))?;
        store.page.fill(ERASED);

        log::info!("slot {}: update started", slot.0);

        Ok(Self {
            store,
            slot,
            region,
            offset: skip as u32,
            commit: [ERASED; COMMIT_BLOCK_MAX],
            commit_len,
            session: Session::Open,
        })
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Offset within the slot of the next byte, skipped bytes included.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Append image data.
    ///
    /// Chunks may have any size; the result is the same as writing their concatenation at
    /// once. With `more_follow` false the last partial page is written out and no further data
    /// is accepted.
    ///
    /// A flash error aborts the session.
    pub fn put_bytes(
        &mut self,
        mut bytes: &[u8],
        more_follow: bool,
    ) -> Result<(), Error<F::Error>> {
        match self.session {
            Session::Open => {}
            Session::Complete if bytes.is_empty() => return Ok(()),
            Session::Complete | Session::Aborted => {
                self.session = Session::Aborted;
                return Err(Error::Aborted);
            }
        }

        if self.offset as usize + bytes.len() > self.region.size as usize {
            return Err(Error::ImageTooLarge);
        }

        while !bytes.is_empty() {
            let pos = self.offset as usize % PAGE;
            let n = (PAGE - pos).min(bytes.len());

            self.store.page[pos..pos + n].copy_from_slice(&bytes[..n]);
            self.offset += n as u32;
            bytes = &bytes[n..];

            if pos + n == PAGE {
                self.flush(PAGE)?;
            }
        }

        if !more_follow {
            let filled = self.offset as usize % PAGE;
            if filled != 0 {
                self.flush(filled)?;
            }
            self.session = Session::Complete;
        }

        Ok(())
    }

    /// Write out the staging buffer holding the last `filled` bytes before `offset`.
    fn flush(&mut self, filled: usize) -> Result<(), Error<F::Error>> {
        let page_start = self.offset - filled as u32;
        let address = self.region.base + page_start;
        let len = align_up(filled, self.store.flash.write_size());
        let flash = &mut self.store.flash;
        let page = &self.store.page;

        let result = if page_start == 0 {
            // Already erased by `init`; the commit block stays in RAM.
            self.commit[..self.commit_len].copy_from_slice(&page[..self.commit_len]);
            if len > self.commit_len {
                let commit_len = self.commit_len;
                flash.program(address + commit_len as u32, &page[commit_len..len])
            } else {
                Ok(())
            }
        } else {
            flash
                .erase(flash.page_of(address))
                .and_then(|()| flash.program(address, &page[..len]))
        };

        self.store.page.fill(ERASED);

        result.map_err(|e| {
            log::error!("slot {}: update aborted at offset {}", self.slot.0, page_start);
            self.session = Session::Aborted;
            Error::Flash(e)
        })
    }

    /// Commit the image by writing the withheld first block, with `header_bytes` in front.
    ///
    /// Writes out any data still buffered first. The commit is a single program operation
    /// within the first page of the slot and the last write of the session. If it fails, the
    /// first page is erased so the slot has no magic.
    pub fn finish(mut self, header_bytes: &[u8]) -> Result<(), Error<F::Error>> {
        if header_bytes.len() > self.commit_len {
            return Err(Error::InvalidConfig);
        }

        self.put_bytes(&[], false)?;

        self.commit[..header_bytes.len()].copy_from_slice(header_bytes);

        let address = self.region.base;
        let flash = &mut self.store.flash;
        if let Err(e) = flash.program(address, &self.commit[..self.commit_len]) {
            log::error!("slot {}: commit failed", self.slot.0);
            let _ = flash.erase(flash.page_of(address));
            return Err(Error::Flash(e));
        }

        log::info!("slot {}: update committed", self.slot.0);
        Ok(())
    }

    /// Commit an image that was streamed without its first [`MAGIC_LEN`] bytes.
    pub fn finish_with_magic(self) -> Result<(), Error<F::Error>> {
        self.finish(&MAGIC)
    }

    /// Hash the image as it will read after commit and compare it to `expected`.
    ///
    /// Ends the stream like a final [`FlashWriter::put_bytes`]. Does not commit; the caller
    /// decides what to do with a mismatch.
    #[cfg(feature = "verify")]
    pub fn verify_sha256(
        &mut self,
        expected: &[u8; 32],
        image_size: usize,
    ) -> Result<crate::verify::VerifyResult, Error<F::Error>> {
        self.put_bytes(&[], false)?;

        let mut head = self.commit;
        head[..MAGIC_LEN].copy_from_slice(&MAGIC);

        crate::verify::verify_image(
            &mut self.store.flash,
            &mut self.store.page,
            self.region,
            &head[..self.commit_len],
            expected,
            image_size,
        )
    }
}
