//! Single slot loader copying an image from a mounted filesystem into flash.
//!
//! Before overwriting the slot, its current contents are saved to a backup file and a marker
//! naming that backup is written. The marker keeps the loader from installing the same update
//! again; the freshly installed firmware removes it once it is satisfied with itself.
//!
//! Unlike the [`FlashWriter`](crate::writer::FlashWriter) this is not safe against power loss:
//! the slot is erased before the new image is complete. Recovery then needs the backup to be
//! restored with [`StorageLoader::restore`].

use embedded_io::{Error as _, ErrorKind, ErrorType, Read, ReadExactError, Seek, SeekFrom, Write};
use serde::{Deserialize, Serialize};

use crate::{
    Error, Page, Slot,
    boot::Boot,
    flash::{ERASED, Flash, align_up},
    layout::SlotRegion,
    log,
    store::SlotStore,
};

/// Upper bound for the encoded [`UpdateMarker`].
pub const MARKER_MAX_LEN: usize = 128;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpenMode {
    Read,
    /// Create the file, or truncate it if it exists.
    Write,
}

/// Filesystem the update image is stored on.
pub trait FileSystem {
    type Error: embedded_io::Error;
    type File: ErrorType<Error = Self::Error> + Read + Write + Seek;

    /// Open `path`. Opening a missing file for reading fails with [`ErrorKind::NotFound`].
    fn open(&mut self, path: &str, mode: OpenMode) -> Result<Self::File, Self::Error>;

    fn remove(&mut self, path: &str) -> Result<(), Self::Error>;
}

/// Files used by the loader.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LoaderPaths<'a> {
    /// Image to install.
    pub update: &'a str,
    /// Receives the previous contents of the slot.
    pub backup: &'a str,
    /// Present while an installed update has not been accepted.
    pub marker: &'a str,
}

impl Default for LoaderPaths<'static> {
    fn default() -> Self {
        Self {
            update: "/update.bin",
            backup: "/backup.bin",
            marker: "/update.pending",
        }
    }
}

/// Contents of the marker file, postcard encoded.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct UpdateMarker<'a> {
    pub backup_path: &'a str,
    pub backup_size: u32,
    pub image_size: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LoadError<E, S> {
    /// Flash access failed, or the slot is not part of the layout.
    Flash(Error<E>),
    FileSystem(S),
    /// The update file does not fit in the slot.
    ImageTooLarge,
    EmptyImage,
    /// A file ended before its recorded size.
    Truncated,
    /// The marker file could not be encoded or decoded.
    Marker,
}

impl<E, S> From<Error<E>> for LoadError<E, S> {
    fn from(e: Error<E>) -> Self {
        LoadError::Flash(e)
    }
}

impl<E, S> From<ReadExactError<S>> for LoadError<E, S> {
    fn from(e: ReadExactError<S>) -> Self {
        match e {
            ReadExactError::UnexpectedEof => LoadError::Truncated,
            ReadExactError::Other(e) => LoadError::FileSystem(e),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// A new image was copied into the slot.
    Installed { image_size: u32 },
    /// An earlier update has not been cleared by the firmware yet.
    Pending,
    /// There is no update file.
    NoUpdate,
}

type LoadResult<T, F, FS> = Result<T, LoadError<<F as Flash>::Error, <FS as FileSystem>::Error>>;

pub struct StorageLoader<'p, F, FS, const N: usize, const PAGE: usize> {
    store: SlotStore<F, N, PAGE>,
    fs: FS,
    slot: Slot,
    entry: u32,
    paths: LoaderPaths<'p>,
}

impl<'p, F: Flash, FS: FileSystem, const N: usize, const PAGE: usize>
    StorageLoader<'p, F, FS, N, PAGE>
{
    pub fn new(
        store: SlotStore<F, N, PAGE>,
        fs: FS,
        slot: Slot,
        paths: LoaderPaths<'p>,
    ) -> Result<Self, Error<F::Error>> {
        let entry = store.layout.entry_point(slot).ok_or(Error::UnknownSlot)?;

        Ok(Self {
            store,
            fs,
            slot,
            entry,
            paths,
        })
    }

    pub fn store(&mut self) -> &mut SlotStore<F, N, PAGE> {
        &mut self.store
    }

    pub fn fs(&mut self) -> &mut FS {
        &mut self.fs
    }

    pub fn into_parts(self) -> (SlotStore<F, N, PAGE>, FS) {
        (self.store, self.fs)
    }

    /// Install the update file, if there is one and no earlier update is pending.
    ///
    /// Oversized and empty images are rejected before the slot is touched.
    pub fn load(&mut self) -> LoadResult<Outcome, F, FS> {
        if self.open_existing(self.paths.marker)?.is_some() {
            log::info!("update pending, not loading");
            return Ok(Outcome::Pending);
        }

        let Some(mut update) = self.open_existing(self.paths.update)? else {
            return Ok(Outcome::NoUpdate);
        };

        let region = self.store.region(self.slot)?;
        let image_size = update.seek(SeekFrom::End(0)).map_err(LoadError::FileSystem)?;
        update
            .seek(SeekFrom::Start(0))
            .map_err(LoadError::FileSystem)?;

        if image_size == 0 {
            return Err(LoadError::EmptyImage);
        }
        if image_size > region.size as u64 {
            log::error!("update of {} bytes does not fit", image_size);
            return Err(LoadError::ImageTooLarge);
        }
        let image_size = image_size as u32;

        self.backup(region)?;
        self.write_marker(region.size, image_size)?;

        log::info!("installing {} bytes", image_size);
        self.erase(region, image_size)?;
        self.copy(&mut update, region, image_size)?;

        Ok(Outcome::Installed { image_size })
    }

    /// Install a pending update, then jump into the slot whatever the outcome.
    pub fn run<B: Boot>(mut self) -> ! {
        match self.load() {
            Ok(Outcome::Installed { .. }) => {
                log::info!("update installed");
            }
            Ok(_) => {}
            Err(_) => {
                log::error!("update failed");
            }
        }

        log::info!("booting {:#x}", self.entry);
        unsafe { B::boot(self.entry as *const u32) }
    }

    /// Marker left by an earlier [`StorageLoader::load`], decoded into `buf`.
    pub fn pending<'b>(
        &mut self,
        buf: &'b mut [u8],
    ) -> LoadResult<Option<UpdateMarker<'b>>, F, FS> {
        let Some(mut file) = self.open_existing(self.paths.marker)? else {
            return Ok(None);
        };

        let len = read_to_end(&mut file, buf).map_err(LoadError::FileSystem)?;
        postcard::from_bytes(&buf[..len])
            .map(Some)
            .map_err(|_| LoadError::Marker)
    }

    /// Accept the installed update by removing the marker and the update file.
    pub fn clear_pending(&mut self) -> LoadResult<(), F, FS> {
        for path in [self.paths.marker, self.paths.update] {
            match self.fs.remove(path) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(LoadError::FileSystem(e)),
                _ => {}
            }
        }
        Ok(())
    }

    /// Copy the backup named by the marker back into the slot.
    ///
    /// The marker stays in place, so the update is not installed again on the next boot.
    /// Returns the number of bytes restored.
    pub fn restore(&mut self) -> LoadResult<u32, F, FS> {
        let mut buf = [0u8; MARKER_MAX_LEN];
        let marker = self.pending(&mut buf)?.ok_or(LoadError::Marker)?;

        let region = self.store.region(self.slot)?;
        if marker.backup_size > region.size {
            return Err(LoadError::ImageTooLarge);
        }

        let mut backup = self
            .fs
            .open(marker.backup_path, OpenMode::Read)
            .map_err(LoadError::FileSystem)?;

        log::warn!("restoring {} bytes from backup", marker.backup_size);
        self.erase(region, marker.backup_size)?;
        self.copy(&mut backup, region, marker.backup_size)?;

        Ok(marker.backup_size)
    }

    /// Open `path` for reading, `None` if it does not exist.
    fn open_existing(&mut self, path: &str) -> LoadResult<Option<FS::File>, F, FS> {
        match self.fs.open(path, OpenMode::Read) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(LoadError::FileSystem(e)),
        }
    }

    fn backup(&mut self, region: SlotRegion) -> LoadResult<(), F, FS> {
        let mut backup = self
            .fs
            .open(self.paths.backup, OpenMode::Write)
            .map_err(LoadError::FileSystem)?;

        let mut offset = 0;
        while offset < region.size {
            self.store
                .flash
                .read(region.base + offset, &mut self.store.page)
                .map_err(Error::Flash)?;
            backup
                .write_all(&self.store.page)
                .map_err(LoadError::FileSystem)?;
            offset += PAGE as u32;
        }

        backup.flush().map_err(LoadError::FileSystem)
    }

    fn write_marker(&mut self, backup_size: u32, image_size: u32) -> LoadResult<(), F, FS> {
        let marker = UpdateMarker {
            backup_path: self.paths.backup,
            backup_size,
            image_size,
        };
        let mut buf = [0u8; MARKER_MAX_LEN];
        let encoded = postcard::to_slice(&marker, &mut buf).map_err(|_| LoadError::Marker)?;

        let mut file = self
            .fs
            .open(self.paths.marker, OpenMode::Write)
            .map_err(LoadError::FileSystem)?;
        file.write_all(encoded).map_err(LoadError::FileSystem)?;
        file.flush().map_err(LoadError::FileSystem)
    }

    /// Erase every page holding part of the first `len` bytes of the slot.
    fn erase(&mut self, region: SlotRegion, len: u32) -> LoadResult<(), F, FS> {
        if len == 0 {
            return Ok(());
        }

        let flash = &mut self.store.flash;
        let first = flash.page_of(region.base).0;
        let last = flash.page_of(region.base + len - 1).0;

        for page in first..=last {
            flash.erase(Page(page)).map_err(Error::Flash)?;
        }
        Ok(())
    }

    fn copy(&mut self, file: &mut FS::File, region: SlotRegion, len: u32) -> LoadResult<(), F, FS> {
        let write_size = self.store.flash.write_size();

        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(PAGE as u32) as usize;

            self.store.page.fill(ERASED);
            file.read_exact(&mut self.store.page[..n])?;
            self.store
                .flash
                .program(region.base + offset, &self.store.page[..align_up(n, write_size)])
                .map_err(Error::Flash)?;

            offset += n as u32;
        }
        Ok(())
    }
}

fn read_to_end<R: Read>(file: &mut R, buf: &mut [u8]) -> Result<usize, R::Error> {
    let mut len = 0;
    while len < buf.len() {
        match file.read(&mut buf[len..])? {
            0 => break,
            n => len += n,
        }
    }
    Ok(len)
}
