//! Scatter-gather data buffers.
//!
//! A [`DataBuffer`] is an ordered list of [`Segment`]s, each a window onto a
//! shared [`Page`]. Cutting a buffer into per-task pieces clones segment
//! descriptors and never copies payload bytes.

use std::collections::TryReserveError;
use std::sync::Arc;

use parking_lot::Mutex;

/// Backing memory shared between frontend, engine and backend.
#[derive(Debug, Default)]
pub struct Page {
    bytes: Mutex<Vec<u8>>,
}

impl Page {
    pub fn new(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(bytes),
        })
    }

    pub fn zeroed(len: usize) -> Arc<Self> {
        Self::new(vec![0; len])
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A contiguous window `[offset, offset + len)` of a page.
#[derive(Debug, Clone)]
pub struct Segment {
    page: Arc<Page>,
    offset: usize,
    len: usize,
}

impl Segment {
    /// # Panics
    /// If the window does not fit inside the page.
    pub fn new(page: Arc<Page>, offset: usize, len: usize) -> Self {
        let page_len = page.len();
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= page_len),
            "segment {offset}+{len} outside page of {page_len} bytes"
        );
        Self { page, offset, len }
    }

    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            page: Page::new(bytes),
            offset: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Window of `len` bytes starting `start` bytes into this segment.
    pub fn window(&self, start: usize, len: usize) -> Segment {
        assert!(start + len <= self.len, "window outside segment");
        Segment {
            page: Arc::clone(&self.page),
            offset: self.offset + start,
            len,
        }
    }

    /// Copy the segment's bytes into `dst`, which must be exactly `len()` long.
    pub fn read_into(&self, dst: &mut [u8]) {
        let page = self.page.bytes.lock();
        dst.copy_from_slice(&page[self.offset..self.offset + self.len]);
    }

    /// Overwrite the segment's bytes from `src`, which must be exactly `len()` long.
    pub fn write_from(&self, src: &[u8]) {
        let mut page = self.page.bytes.lock();
        page[self.offset..self.offset + self.len].copy_from_slice(src);
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0; self.len];
        self.read_into(&mut out);
        out
    }
}

/// A command's payload as an ordered segment list.
#[derive(Debug, Clone, Default)]
pub struct DataBuffer {
    segments: Vec<Segment>,
}

impl DataBuffer {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Zero-filled buffer of `len` bytes laid out in pages of `page_size`.
    pub fn zeroed(len: usize, page_size: usize) -> Self {
        let page_size = page_size.max(1);
        let mut segments = Vec::with_capacity(len.div_ceil(page_size));
        let mut left = len;
        while left > 0 {
            let chunk = left.min(page_size);
            segments.push(Segment::from_vec(vec![0; chunk]));
            left -= chunk;
        }
        Self { segments }
    }

    /// Buffer holding a copy of `bytes`, laid out in pages of `page_size`.
    pub fn from_bytes(bytes: &[u8], page_size: usize) -> Self {
        Self {
            segments: bytes
                .chunks(page_size.max(1))
                .map(|chunk| Segment::from_vec(chunk.to_vec()))
                .collect(),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    /// Gather the whole payload into one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for segment in &self.segments {
            out.extend_from_slice(&segment.to_vec());
        }
        out
    }

    /// Scatter `src` across the segments, starting at the first byte.
    /// Returns how many bytes were written.
    pub fn copy_from(&self, src: &[u8]) -> usize {
        let mut done = 0;
        for segment in &self.segments {
            if done == src.len() {
                break;
            }
            let n = segment.len().min(src.len() - done);
            segment.window(0, n).write_from(&src[done..done + n]);
            done += n;
        }
        done
    }

    /// Cut `[start, start + len)` out as a new buffer sharing the same pages.
    /// A boundary falling inside a segment splits that segment.
    pub fn slice(&self, start: usize, len: usize) -> Result<DataBuffer, TryReserveError> {
        let mut segments = Vec::new();
        let end = start + len;
        let mut cursor = 0;
        for segment in &self.segments {
            let seg_start = cursor;
            let seg_end = cursor + segment.len();
            cursor = seg_end;
            if seg_end <= start || segment.is_empty() {
                continue;
            }
            if seg_start >= end {
                break;
            }
            let from = start.max(seg_start) - seg_start;
            let to = end.min(seg_end) - seg_start;
            segments.try_reserve(1)?;
            segments.push(segment.window(from, to - from));
        }
        Ok(DataBuffer { segments })
    }
}
