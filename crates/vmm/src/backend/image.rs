//! Image-backed memory: pages populated from a loadable segment of an executable.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use crate::{AreaFlags, PAGE_SIZE, Result, VirtualAddress};

use super::{FaultContext, Resolution};

/// Read access to the bytes of a loaded executable image.
pub trait ImageSource: Send + Sync {
    fn data(&self) -> &[u8];
}

impl ImageSource for Vec<u8> {
    fn data(&self) -> &[u8] {
        self
    }
}

impl ImageSource for &'static [u8] {
    fn data(&self) -> &[u8] {
        self
    }
}

/// A loadable segment, as described by the image loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Virtual address the segment is loaded at. Need not be page aligned.
    pub virtual_base: VirtualAddress,
    /// Offset of the segment's first byte within the image.
    pub file_offset: usize,
    /// Length of the segment in bytes. Bytes past the end of the image read as zero.
    pub length: usize,
    /// Permissions requested by the segment.
    pub flags: AreaFlags,
}

#[derive(Clone)]
pub struct ImageBackend {
    image: Arc<dyn ImageSource>,
    segment: SegmentDescriptor,
}

impl ImageBackend {
    pub fn new(image: Arc<dyn ImageSource>, segment: SegmentDescriptor) -> Self {
        Self { image, segment }
    }

    pub fn segment(&self) -> &SegmentDescriptor {
        &self.segment
    }

    pub(super) fn supported_flags(&self) -> AreaFlags {
        self.segment.flags | AreaFlags::READ | AreaFlags::CACHEABLE
    }

    /// Every fault gets a private frame, so writable segments never modify the image.
    pub(super) fn page_fault(&self, ctx: &FaultContext<'_>) -> Result<Resolution> {
        let frame = ctx.commit(|frame| {
            ctx.frames.zero_frame(frame);
            if let Some((offset, bytes)) = self.page_contents(ctx.page) {
                ctx.frames.write_frame(frame, offset, bytes);
            }
        })?;
        log::trace!("image page {} backed by {frame:?}", ctx.page);
        Ok(Resolution {
            frame,
            tracked: true,
        })
    }

    /// Bytes of the image that land in `page`, with their offset inside the page.
    fn page_contents(&self, page: VirtualAddress) -> Option<(usize, &[u8])> {
        let segment_start = self.segment.virtual_base.as_usize();
        let segment_end = segment_start + self.segment.length;
        let page_start = page.as_usize();
        let page_end = page_start + PAGE_SIZE;

        let start = page_start.max(segment_start);
        let end = page_end.min(segment_end);
        if start >= end {
            return None;
        }

        let data = self.image.data();
        let file_start = self.segment.file_offset + (start - segment_start);
        let file_end = (file_start + (end - start)).min(data.len());
        if file_start >= file_end {
            return None;
        }
        Some((start - page_start, &data[file_start..file_end]))
    }
}

impl fmt::Debug for ImageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBackend")
            .field("segment", &self.segment)
            .field("image_len", &self.image.data().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::EmulatedMemory;

    fn backend(virtual_base: usize, file_offset: usize, length: usize) -> ImageBackend {
        let image: Vec<u8> = (1..=64).collect();
        ImageBackend::new(
            Arc::new(image),
            SegmentDescriptor {
                virtual_base: VirtualAddress::new(virtual_base),
                file_offset,
                length,
                flags: AreaFlags::READ | AreaFlags::EXEC,
            },
        )
    }

    fn fault(backend: &ImageBackend, memory: &EmulatedMemory, area_base: usize, page: usize) -> Vec<u8> {
        let ctx = FaultContext {
            frames: memory,
            area_base: VirtualAddress::new(area_base),
            page: VirtualAddress::new(page),
            share: None,
        };
        let resolution = backend.page_fault(&ctx).unwrap();
        memory.read_frame(resolution.frame)
    }

    #[test]
    fn copies_segment_bytes() {
        let memory = EmulatedMemory::new(4);
        let backend = backend(0x1000, 0, 32);
        let contents = fault(&backend, &memory, 0x1000, 0x1010);
        let expected: Vec<u8> = (17..=32).collect();
        assert_eq!(contents, expected);
    }

    #[test]
    fn unaligned_segment_start_is_zero_padded() {
        let memory = EmulatedMemory::new(4);
        let backend = backend(0x1004, 8, 8);
        let contents = fault(&backend, &memory, 0x1000, 0x1000);

        assert_eq!(&contents[..4], &[0; 4]);
        assert_eq!(&contents[4..12], &[9, 10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(&contents[12..], &[0; 4]);
    }

    #[test]
    fn bytes_past_the_image_read_as_zero() {
        let memory = EmulatedMemory::new(4);
        let backend = backend(0x1000, 60, 32);
        let contents = fault(&backend, &memory, 0x1000, 0x1000);

        assert_eq!(&contents[..4], &[61, 62, 63, 64]);
        assert!(contents[4..].iter().all(|byte| *byte == 0));
        assert!(fault(&backend, &memory, 0x1000, 0x1010).iter().all(|byte| *byte == 0));
    }

    #[test]
    fn flags_follow_the_segment() {
        let backend = backend(0x1000, 0, 16);
        assert!(backend.supported_flags().contains(AreaFlags::EXEC));
        assert!(!backend.supported_flags().contains(AreaFlags::WRITE));
    }
}
