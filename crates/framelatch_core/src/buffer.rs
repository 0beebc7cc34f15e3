//! # Graphics Buffers
//!
//! Buffer handles shared between the queue and its consumer, plus the
//! allocator the queue uses to fill (and refill) its slots.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{PoolError, PoolResult};

/// Row alignment, in pixels, applied by [`HeapAllocator`].
pub const STRIDE_ALIGN: u32 = 16;

/// Unique identifier of an allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pixel layouts a buffer can be allocated with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// 32-bit RGBA, 8 bits per channel.
    Rgba8888,
    /// 32-bit RGB with an ignored fourth byte.
    Rgbx8888,
    /// 32-bit BGRA, 8 bits per channel.
    Bgra8888,
    /// 24-bit packed RGB.
    Rgb888,
    /// 16-bit RGB 5-6-5.
    Rgb565,
}

impl PixelFormat {
    /// Bytes used by one pixel.
    #[inline]
    #[must_use]
    pub const fn bytes_per_pixel(self) -> u32 {
        match self {
            Self::Rgba8888 | Self::Rgbx8888 | Self::Bgra8888 => 4,
            Self::Rgb888 => 3,
            Self::Rgb565 => 2,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rgba8888 => "RGBA_8888",
            Self::Rgbx8888 => "RGBX_8888",
            Self::Bgra8888 => "BGRA_8888",
            Self::Rgb888 => "RGB_888",
            Self::Rgb565 => "RGB_565",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// How a buffer is going to be used.
    ///
    /// The consumer's bits are OR-ed into every producer request so the
    /// allocator can place the buffer where the display can reach it.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct BufferUsage: u32 {
        /// CPU reads the buffer often.
        const SW_READ_OFTEN = 1 << 0;
        /// CPU writes the buffer often.
        const SW_WRITE_OFTEN = 1 << 1;
        /// Sampled as a GPU texture.
        const HW_TEXTURE = 1 << 2;
        /// Used as a GPU render target.
        const HW_RENDER = 1 << 3;
        /// Used as a scan-out source by the framebuffer.
        const HW_FB = 1 << 4;
        /// Used by the fixed-function hardware compositor.
        const HW_COMPOSER = 1 << 5;
    }
}

impl Default for BufferUsage {
    fn default() -> Self {
        Self::empty()
    }
}

/// An allocated graphics buffer.
///
/// Pixel storage is owned by whatever backs the allocator; this type
/// carries the identity and geometry the hand-off protocol cares about.
#[derive(Debug, PartialEq, Eq)]
pub struct GraphicBuffer {
    id: BufferId,
    width: u32,
    height: u32,
    stride: u32,
    format: PixelFormat,
    usage: BufferUsage,
}

impl GraphicBuffer {
    /// Creates a buffer description with a fresh id.
    #[must_use]
    pub fn new(width: u32, height: u32, stride: u32, format: PixelFormat, usage: BufferUsage) -> Self {
        Self {
            id: BufferId::next(),
            width,
            height,
            stride,
            format,
            usage,
        }
    }

    /// Unique id of this allocation.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> BufferId {
        self.id
    }

    /// Width in pixels.
    #[inline]
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[inline]
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Row length in pixels.
    #[inline]
    #[must_use]
    pub const fn stride(&self) -> u32 {
        self.stride
    }

    /// Pixel format.
    #[inline]
    #[must_use]
    pub const fn format(&self) -> PixelFormat {
        self.format
    }

    /// Usage bits the buffer was allocated with.
    #[inline]
    #[must_use]
    pub const fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Size of the backing storage in bytes.
    #[inline]
    #[must_use]
    pub const fn byte_len(&self) -> u64 {
        self.stride as u64 * self.height as u64 * self.format.bytes_per_pixel() as u64
    }

    /// Returns true if this buffer can serve a request with these parameters.
    #[must_use]
    pub fn satisfies(&self, width: u32, height: u32, format: PixelFormat, usage: BufferUsage) -> bool {
        self.width == width
            && self.height == height
            && self.format == format
            && self.usage.contains(usage)
    }
}

/// Shared handle to a graphics buffer.
pub type BufferHandle = Arc<GraphicBuffer>;

/// Source of graphics buffers for the queue.
pub trait BufferAllocator: Send + Sync {
    /// Allocates a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AllocationFailed`] if the request can't be met.
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> PoolResult<BufferHandle>;
}

/// Allocator backed by ordinary process memory.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    allocations: AtomicU64,
}

impl HeapAllocator {
    /// Creates a new allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers handed out so far.
    #[inline]
    #[must_use]
    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: BufferUsage,
    ) -> PoolResult<BufferHandle> {
        if width == 0 || height == 0 {
            return Err(PoolError::AllocationFailed(format!(
                "invalid dimensions {width}x{height}"
            )));
        }
        let stride = width
            .checked_next_multiple_of(STRIDE_ALIGN)
            .ok_or_else(|| PoolError::AllocationFailed(format!("width {width} too large")))?;

        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(GraphicBuffer::new(width, height, stride, format, usage)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_buffer_ids() {
        let a = GraphicBuffer::new(1, 1, 1, PixelFormat::Rgba8888, BufferUsage::empty());
        let b = GraphicBuffer::new(1, 1, 1, PixelFormat::Rgba8888, BufferUsage::empty());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_heap_allocator_aligns_stride() {
        let allocator = HeapAllocator::new();
        let buffer = allocator
            .allocate(100, 50, PixelFormat::Rgb565, BufferUsage::HW_FB)
            .unwrap();

        assert_eq!(buffer.stride(), 112);
        assert_eq!(buffer.byte_len(), 112 * 50 * 2);
        assert_eq!(allocator.allocation_count(), 1);
    }

    #[test]
    fn test_heap_allocator_rejects_empty() {
        let allocator = HeapAllocator::new();
        let result = allocator.allocate(0, 10, PixelFormat::Rgba8888, BufferUsage::empty());
        assert!(matches!(result, Err(PoolError::AllocationFailed(_))));
        assert_eq!(allocator.allocation_count(), 0);
    }

    #[test]
    fn test_satisfies_requires_usage_superset() {
        let buffer = GraphicBuffer::new(
            64,
            64,
            64,
            PixelFormat::Rgba8888,
            BufferUsage::HW_FB | BufferUsage::HW_RENDER,
        );

        assert!(buffer.satisfies(64, 64, PixelFormat::Rgba8888, BufferUsage::HW_FB));
        assert!(!buffer.satisfies(64, 64, PixelFormat::Rgba8888, BufferUsage::HW_COMPOSER));
        assert!(!buffer.satisfies(32, 64, PixelFormat::Rgba8888, BufferUsage::HW_FB));
    }

    #[test]
    fn test_usage_parses_from_toml_string() {
        #[derive(Deserialize)]
        struct Wrapper {
            usage: BufferUsage,
        }

        let parsed: Wrapper = toml::from_str(r#"usage = "HW_FB | HW_RENDER""#).unwrap();
        assert_eq!(parsed.usage, BufferUsage::HW_FB | BufferUsage::HW_RENDER);
    }
}
