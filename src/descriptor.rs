// ============================================================================
// src/descriptor.rs – In-band update locator embedded in the active image
// ============================================================================

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::debug;

/// Byte offset of the descriptor region inside an image file.
pub const DESCRIPTOR_OFFSET: u64 = 33651;
/// Length of the descriptor region.
pub const DESCRIPTOR_LEN: usize = 512;

/// Delta-sync source locator written by the image build process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateDescriptor {
    locator: String,
}

impl UpdateDescriptor {
    /// Read the descriptor from `image`.
    ///
    /// `None` means the image does not support updates: the region is
    /// missing, not UTF-8, or only padding.
    pub fn read(image: &Path) -> Option<Self> {
        let mut region = [0u8; DESCRIPTOR_LEN];
        let read = File::open(image).and_then(|mut file| {
            file.seek(SeekFrom::Start(DESCRIPTOR_OFFSET))?;
            file.read_exact(&mut region)
        });
        if let Err(err) = read {
            debug!(image = %image.display(), "descriptor region unreadable: {err}");
            return None;
        }
        Self::decode(&region)
    }

    pub fn decode(region: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(region).ok()?;
        let locator = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
        if locator.is_empty() || locator.chars().any(char::is_control) {
            return None;
        }
        Some(Self {
            locator: locator.to_string(),
        })
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }

    /// URL handed to the delta-sync client. AppImage-style `zsync|<url>`
    /// descriptors carry a transport prefix; bare URLs are used as is.
    pub fn sync_url(&self) -> &str {
        self.locator
            .strip_prefix("zsync|")
            .unwrap_or(&self.locator)
    }
}
