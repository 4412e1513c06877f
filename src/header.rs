//! Slot header stored at the start of every image slot.
//!
//! Byte layout, little endian:
//!
//! | Offset | Size | Field                                                   |
//! |--------|------|---------------------------------------------------------|
//! | 0      | 4    | magic `RIOT`                                            |
//! | 4      | 4    | version, bit 31 tags the extended format                |
//! | 8      | 4    | start address                                           |
//! | 12     | 4    | CRC-32 over bytes 0..12                                 |
//! | 16     | 1    | image state (extended only)                             |
//! | 17     | 1    | boot count, thermometer coded (extended only)           |
//! | 18     | 2    | reserved `0xFF` (extended only)                         |
//!
//! The checksum does not cover the extended fields. Those are rewritten in place by the
//! bootloader, and their encodings are chosen such that the usual transitions only clear bits.

use crc::{CRC_32_ISO_HDLC, Crc};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::flash::ERASED;

/// Bytes whose presence at offset 0 marks a slot as possibly valid.
pub const MAGIC: [u8; 4] = *b"RIOT";
pub const MAGIC_LEN: usize = MAGIC.len();

/// Highest boot count the thermometer coded field can hold.
pub const MAX_BOOT_COUNT: u8 = 8;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const EXTENDED_TAG: u32 = 1 << 31;
const VERSION_MASK: u32 = !EXTENDED_TAG;

const VERSION_OFFSET: usize = 4;
const START_ADDR_OFFSET: usize = 8;
const CHECKSUM_OFFSET: usize = 12;
const STATE_OFFSET: usize = 16;
const BOOT_COUNT_OFFSET: usize = 17;

/// Lifecycle of an image in an extended header.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageState {
    /// Retired by the application, never selected.
    Deactivated = 0x00,
    /// Selectable, but not yet proven to boot. Every selection counts as a boot attempt.
    Activated = 0x0F,
    /// Selectable and proven healthy by the running application.
    Confirmed = 0x07,
    /// Ran out of boot attempts, never selected.
    Dismissed = 0x0B,
}

impl ImageState {
    pub const fn is_selectable(self) -> bool {
        matches!(self, ImageState::Activated | ImageState::Confirmed)
    }
}

/// Parsed slot header.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Header {
    /// Base format without boot bookkeeping.
    V1 { version: u32, start_addr: u32 },
    /// Extended format carrying image state and boot attempts.
    V2 {
        version: u32,
        start_addr: u32,
        image_state: ImageState,
        boot_count: u8,
    },
}

impl Header {
    pub const V1_LEN: usize = 16;
    pub const V2_LEN: usize = 20;
    pub const MAX_LEN: usize = Self::V2_LEN;

    /// Base format header. Only the low 31 bits of `version` are stored.
    pub const fn v1(version: u32, start_addr: u32) -> Self {
        Header::V1 {
            version: version & VERSION_MASK,
            start_addr,
        }
    }

    /// Extended format header with a fresh boot count.
    pub const fn v2(version: u32, start_addr: u32, image_state: ImageState) -> Self {
        Header::V2 {
            version: version & VERSION_MASK,
            start_addr,
            image_state,
            boot_count: 0,
        }
    }

    /// Interpret the bytes at the start of a slot.
    ///
    /// Returns `None` if the magic is absent, the checksum does not match or the image state
    /// is unknown. None of the other fields are looked at in that case.
    pub fn parse(bytes: &[u8]) -> Option<Header> {
        if bytes.len() < Self::V1_LEN || bytes[..MAGIC_LEN] != MAGIC {
            return None;
        }

        let checksum = read_u32(bytes, CHECKSUM_OFFSET);
        if CRC32.checksum(&bytes[..CHECKSUM_OFFSET]) != checksum {
            return None;
        }

        let tagged_version = read_u32(bytes, VERSION_OFFSET);
        let version = tagged_version & VERSION_MASK;
        let start_addr = read_u32(bytes, START_ADDR_OFFSET);

        if tagged_version & EXTENDED_TAG == 0 {
            return Some(Header::V1 {
                version,
                start_addr,
            });
        }

        if bytes.len() < Self::V2_LEN {
            return None;
        }

        let image_state = ImageState::try_from(bytes[STATE_OFFSET]).ok()?;
        let boot_count = decode_boot_count(bytes[BOOT_COUNT_OFFSET]);

        Some(Header::V2 {
            version,
            start_addr,
            image_state,
            boot_count,
        })
    }

    /// Serialize into the on-flash layout.
    ///
    /// Only the first [`Header::encoded_len`] bytes are meaningful, the rest is left erased.
    pub fn encode(&self) -> [u8; Self::MAX_LEN] {
        let mut bytes = [ERASED; Self::MAX_LEN];

        let tagged_version = match self {
            Header::V1 { version, .. } => *version & VERSION_MASK,
            Header::V2 { version, .. } => (*version & VERSION_MASK) | EXTENDED_TAG,
        };

        bytes[..MAGIC_LEN].copy_from_slice(&MAGIC);
        bytes[VERSION_OFFSET..START_ADDR_OFFSET].copy_from_slice(&tagged_version.to_le_bytes());
        bytes[START_ADDR_OFFSET..CHECKSUM_OFFSET].copy_from_slice(&self.start_addr().to_le_bytes());

        let checksum = CRC32.checksum(&bytes[..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..STATE_OFFSET].copy_from_slice(&checksum.to_le_bytes());

        if let Header::V2 {
            image_state,
            boot_count,
            ..
        } = self
        {
            bytes[STATE_OFFSET] = (*image_state).into();
            bytes[BOOT_COUNT_OFFSET] = encode_boot_count(*boot_count);
        }

        bytes
    }

    pub const fn encoded_len(&self) -> usize {
        match self {
            Header::V1 { .. } => Self::V1_LEN,
            Header::V2 { .. } => Self::V2_LEN,
        }
    }

    /// Whether the image state and boot count fields are present and honored.
    pub const fn is_extended(&self) -> bool {
        matches!(self, Header::V2 { .. })
    }

    pub const fn version(&self) -> u32 {
        match self {
            Header::V1 { version, .. } | Header::V2 { version, .. } => *version,
        }
    }

    pub const fn start_addr(&self) -> u32 {
        match self {
            Header::V1 { start_addr, .. } | Header::V2 { start_addr, .. } => *start_addr,
        }
    }

    /// Image state, `None` for a base format header.
    pub const fn image_state(&self) -> Option<ImageState> {
        match self {
            Header::V1 { .. } => None,
            Header::V2 { image_state, .. } => Some(*image_state),
        }
    }

    /// Returns `false` if the header has no image state field.
    pub fn set_image_state(&mut self, state: ImageState) -> bool {
        match self {
            Header::V1 { .. } => false,
            Header::V2 { image_state, .. } => {
                *image_state = state;
                true
            }
        }
    }

    /// Boot attempts so far, 0 for a base format header.
    pub const fn boot_count(&self) -> u8 {
        match self {
            Header::V1 { .. } => 0,
            Header::V2 { boot_count, .. } => *boot_count,
        }
    }

    /// Saturates at [`MAX_BOOT_COUNT`]. Returns `false` if the header has no boot count field.
    pub fn set_boot_count(&mut self, count: u8) -> bool {
        match self {
            Header::V1 { .. } => false,
            Header::V2 { boot_count, .. } => {
                *boot_count = count.min(MAX_BOOT_COUNT);
                true
            }
        }
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Every boot attempt clears one more bit, starting from the erased value.
const fn encode_boot_count(count: u8) -> u8 {
    let count = if count > MAX_BOOT_COUNT {
        MAX_BOOT_COUNT
    } else {
        count
    };
    !((1u16 << count) - 1) as u8
}

const fn decode_boot_count(encoded: u8) -> u8 {
    encoded.count_zeros() as u8
}
