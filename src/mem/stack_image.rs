//! Heap buffers holding the saved stack image of a suspended fiber.
//!
//! A fiber's live stack is the region `[SP, stack_base)` of the one
//! physical stack. When the fiber is switched out that region is copied
//! into a `StackImage`, top-aligned: the last byte of the live stack lands
//! on the last byte of the buffer. Buffers only ever grow.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec;

const WORD: usize = core::mem::size_of::<u32>();

/// Word-aligned, grow-only buffer for one fiber's stack image.
pub struct StackImage {
    words: Box<[u32]>,
}

impl StackImage {
    /// A buffer with no storage. Fibers in the pool that never ran have one.
    pub fn empty() -> Self {
        Self {
            words: Box::default(),
        }
    }

    /// Allocate a zeroed buffer of at least `bytes` bytes.
    pub fn new(bytes: usize) -> Self {
        Self {
            words: vec![0u32; (bytes + WORD - 1) / WORD].into_boxed_slice(),
        }
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.words.len() * WORD
    }

    /// Whether the buffer has any storage.
    pub fn is_allocated(&self) -> bool {
        !self.words.is_empty()
    }

    /// Lowest address of the buffer (`stack_bottom` of the fiber).
    pub fn bottom(&self) -> usize {
        self.words.as_ptr() as usize
    }

    /// One past the highest address of the buffer (`stack_top` of the
    /// fiber). Images are stored immediately below it.
    pub fn top(&self) -> usize {
        self.bottom() + self.capacity()
    }

    /// Mutable variant of [`top`](Self::top) for the copy-out primitives.
    pub fn top_mut(&mut self) -> usize {
        self.words.as_mut_ptr() as usize + self.capacity()
    }

    /// Make room for an image of `depth` bytes.
    ///
    /// Reallocates to `(depth + granularity) & !(granularity - 1)` bytes when
    /// the current capacity is smaller; the old contents are discarded.
    /// Returns `true` when the buffer was replaced.
    pub fn ensure(&mut self, depth: usize, granularity: usize) -> bool {
        if self.capacity() >= depth {
            return false;
        }
        let bytes = (depth + granularity) & !(granularity - 1);
        *self = Self::new(bytes);
        true
    }

    /// The top-aligned `len` bytes of the image.
    pub fn image(&self, len: usize) -> &[u8] {
        let len = len.min(self.capacity());
        // SAFETY: the words are initialized and `len` is within the buffer.
        let bytes = unsafe {
            core::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.capacity())
        };
        &bytes[bytes.len() - len..]
    }
}

impl Default for StackImage {
    fn default() -> Self {
        Self::empty()
    }
}

impl core::fmt::Debug for StackImage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StackImage")
            .field("bottom", &format_args!("{:#x}", self.bottom()))
            .field("capacity", &self.capacity())
            .finish()
    }
}
