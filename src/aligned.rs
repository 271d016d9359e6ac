use bytemuck::{Pod, Zeroable};
use std::{
    fmt,
    ops::{Deref, DerefMut},
};

const LINE_FLOATS: usize = 16;

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C, align(64))]
struct Line([f32; LINE_FLOATS]);

/// Heap buffer of `f32` whose first element sits on a cache line boundary.
/// Storage is rounded up to whole 64-byte lines; only the first `len` values
/// are ever visible.
#[derive(Clone)]
pub struct AlignedBuffer {
    lines: Vec<Line>,
    len: usize,
}

impl AlignedBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            lines: vec![Line::zeroed(); len.div_ceil(LINE_FLOATS)],
            len,
        }
    }

    pub fn from_slice(values: &[f32]) -> Self {
        let mut buf = Self::zeroed(values.len());
        buf.copy_from_slice(values);
        buf
    }

    pub fn as_slice(&self) -> &[f32] {
        &bytemuck::cast_slice(&self.lines)[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut bytemuck::cast_slice_mut(&mut self.lines)[..self.len]
    }

    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0.);
    }

    /// Row `i` when the buffer is viewed as rows of `width` values.
    pub fn row(&self, i: usize, width: usize) -> &[f32] {
        &self.as_slice()[i * width..(i + 1) * width]
    }

    pub fn row_mut(&mut self, i: usize, width: usize) -> &mut [f32] {
        &mut self.as_mut_slice()[i * width..(i + 1) * width]
    }
}

impl Deref for AlignedBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [f32] {
        self.as_mut_slice()
    }
}

impl PartialEq for AlignedBuffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}
