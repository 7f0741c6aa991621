//! Firmware image set.
//!
//! A flashable set holds up to three payloads, each bound to a fixed flash
//! offset. Offsets are constants of the device's partition layout and are
//! never user supplied.

use crate::error::{Error, Result};
use log::debug;
use std::path::Path;

/// The three image slots of the device's flash layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ImageKind {
    /// Second stage bootloader at `0x0`.
    Bootloader,
    /// Partition table at `0x8000`.
    PartitionTable,
    /// Application at `0x10000`.
    Application,
}

impl ImageKind {
    /// All kinds in address order.
    pub const ALL: [Self; 3] = [Self::Bootloader, Self::PartitionTable, Self::Application];

    /// Fixed flash offset.
    pub fn address(self) -> u32 {
        match self {
            Self::Bootloader => 0x0,
            Self::PartitionTable => 0x8000,
            Self::Application => 0x10000,
        }
    }

    /// Human-readable name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Bootloader => "Bootloader",
            Self::PartitionTable => "Partition Table",
            Self::Application => "Application",
        }
    }
}

/// A payload bound to its flash offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    kind: ImageKind,
    data: Vec<u8>,
}

impl FlashImage {
    /// Slot of this image.
    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    /// Flash offset.
    pub fn address(&self) -> u32 {
        self.kind.address()
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Raw payload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Up to three firmware payloads to flash together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareImages {
    bootloader: Option<Vec<u8>>,
    partition_table: Option<Vec<u8>>,
    application: Option<Vec<u8>>,
}

impl FirmwareImages {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the payload for `kind`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, kind: ImageKind, data: Vec<u8>) -> Self {
        *self.slot_mut(kind) = Some(data);
        self
    }

    /// Load the payload for `kind` from a file.
    pub fn load(mut self, kind: ImageKind, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            Error::InvalidImageSet(format!(
                "cannot read {} image {}: {e}",
                kind.name(),
                path.display()
            ))
        })?;
        debug!("Loaded {} ({} bytes) from {}", kind.name(), data.len(), path.display());
        *self.slot_mut(kind) = Some(data);
        Ok(self)
    }

    /// Payload for `kind`, if present.
    pub fn get(&self, kind: ImageKind) -> Option<&[u8]> {
        match kind {
            ImageKind::Bootloader => self.bootloader.as_deref(),
            ImageKind::PartitionTable => self.partition_table.as_deref(),
            ImageKind::Application => self.application.as_deref(),
        }
    }

    /// Number of present payloads.
    pub fn len(&self) -> usize {
        ImageKind::ALL.iter().filter(|k| self.get(**k).is_some()).count()
    }

    /// Whether no payload is present.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validated images in address order.
    pub fn flash_images(&self) -> Result<Vec<FlashImage>> {
        let images: Vec<FlashImage> = ImageKind::ALL
            .iter()
            .filter_map(|kind| {
                self.get(*kind).map(|data| FlashImage {
                    kind: *kind,
                    data: data.to_vec(),
                })
            })
            .collect();

        if images.is_empty() {
            return Err(Error::InvalidImageSet(
                "at least one firmware image is required".to_string(),
            ));
        }
        if let Some(empty) = images.iter().find(|image| image.is_empty()) {
            return Err(Error::InvalidImageSet(format!("{} image is empty", empty.name())));
        }
        Ok(images)
    }

    fn slot_mut(&mut self, kind: ImageKind) -> &mut Option<Vec<u8>> {
        match kind {
            ImageKind::Bootloader => &mut self.bootloader,
            ImageKind::PartitionTable => &mut self.partition_table,
            ImageKind::Application => &mut self.application,
        }
    }
}
