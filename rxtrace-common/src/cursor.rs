//! Bounded access to packet memory.
//!
//! Two layers keep every read provably in bounds:
//!
//! * a [`Frame`] backend copies plain values out of packet memory and refuses
//!   any load that does not fit, so even the raw layer cannot over-read;
//! * a [`HeaderCursor`] hands out a [`HeaderView`] only after `can_read` has
//!   confirmed the whole header fits, and a view can only read the
//!   [`Field`]s declared for its header type, whose extents are checked
//!   against the header length at compile time.
//!
//! There is no API that yields a pointer or a reference into the packet.

use core::{marker::PhantomData, mem, ptr};

/// Types for which every bit pattern is a valid value.
///
/// # Safety
///
/// Implementors must be `Copy`, contain no padding and accept any byte
/// sequence of their size. Enums and `bool` must never implement this.
pub unsafe trait Plain: Copy {}

unsafe impl Plain for u8 {}
unsafe impl Plain for u16 {}
unsafe impl Plain for u32 {}
unsafe impl Plain for u64 {}
unsafe impl<const N: usize> Plain for [u8; N] {}

/// A byte region observed by a hook.
pub trait Frame {
    /// Readable bytes counted from offset zero.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies a `T` from `offset`, or `None` when `[offset, offset + size_of::<T>())`
    /// is not entirely inside the frame or the backend cannot read it.
    fn load<T: Plain>(&self, offset: usize) -> Option<T>;
}

/// Host backend over an ordinary byte slice.
#[derive(Clone, Copy, Debug)]
pub struct SliceFrame<'a> {
    bytes: &'a [u8],
}

impl<'a> SliceFrame<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }
}

impl Frame for SliceFrame<'_> {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    fn load<T: Plain>(&self, offset: usize) -> Option<T> {
        let end = offset.checked_add(mem::size_of::<T>())?;
        let bytes = self.bytes.get(offset..end)?;
        // SAFETY: `bytes` holds exactly size_of::<T>() initialised bytes and
        // T: Plain accepts any bit pattern.
        Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }
}

/// A protocol header with a fixed minimum length.
pub trait Header {
    const LEN: usize;
}

/// A typed field of header `H` at a fixed offset.
///
/// Built with [`Field::at`] in a `const` item, where an extent past `H::LEN`
/// fails compilation.
pub struct Field<H, T> {
    offset: usize,
    _marker: PhantomData<fn() -> (H, T)>,
}

impl<H, T> Clone for Field<H, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<H, T> Copy for Field<H, T> {}

impl<H: Header, T: Plain> Field<H, T> {
    pub const fn at(offset: usize) -> Self {
        assert!(offset + mem::size_of::<T>() <= H::LEN, "field exceeds header");
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    pub const fn offset(&self) -> usize {
        self.offset
    }
}

/// Proof that a whole `H` fits at `base`.
pub struct HeaderView<'f, F, H> {
    frame: &'f F,
    base: usize,
    _header: PhantomData<H>,
}

impl<'f, F: Frame, H: Header> HeaderView<'f, F, H> {
    #[inline(always)]
    pub fn get<T: Plain>(&self, field: Field<H, T>) -> Option<T> {
        self.frame.load(self.base + field.offset)
    }

    /// Offset of the first byte after this header's fixed part.
    pub fn end(&self) -> usize {
        self.base + H::LEN
    }
}

/// Bounded cursor over one [`Frame`].
pub struct HeaderCursor<'f, F> {
    frame: &'f F,
}

impl<'f, F: Frame> HeaderCursor<'f, F> {
    pub fn new(frame: &'f F) -> Self {
        Self { frame }
    }

    /// Whether `[offset, offset + size)` lies within the frame.
    #[inline(always)]
    pub fn can_read(&self, offset: usize, size: usize) -> bool {
        match offset.checked_add(size) {
            Some(end) => end <= self.frame.len(),
            None => false,
        }
    }

    #[inline(always)]
    pub fn header<H: Header>(&self, offset: usize) -> Option<HeaderView<'f, F, H>> {
        if !self.can_read(offset, H::LEN) {
            return None;
        }
        Some(HeaderView {
            frame: self.frame,
            base: offset,
            _header: PhantomData,
        })
    }

    pub fn frame_len(&self) -> usize {
        self.frame.len()
    }
}
