//! LIFO scoped allocator for transient native buffers.
//!
//! Memory is carved out of chunks by bumping an offset. Frames record the
//! bump position so popping a frame releases everything allocated since it
//! was pushed. Allocations made for the interpreter are additionally
//! tracked as safe pointers and unregistered when their frame pops.

use std::{
    alloc::{self, Layout},
    ptr::NonNull,
};

use crate::{AlienError, Context, PointerValue, Result};

/// Alignment of every block handed out.
pub const ARENA_ALIGN: usize = 16;

struct Chunk {
    base: NonNull<u8>,
    capacity: usize,
    used: usize,
}

impl Chunk {
    fn new(capacity: usize) -> Result<Self> {
        let layout = Layout::from_size_align(capacity, ARENA_ALIGN)
            .map_err(|_| AlienError::allocation("Invalid arena chunk size."))?;
        // SAFETY: capacity is never zero
        let raw = unsafe { alloc::alloc(layout) };
        let base = NonNull::new(raw).ok_or_else(|| {
            AlienError::allocation(format!("Could not allocate {capacity} bytes."))
        })?;
        Ok(Self {
            base,
            capacity,
            used: 0,
        })
    }

    fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: layout matches the one used in Chunk::new
        unsafe {
            alloc::dealloc(
                self.base.as_ptr(),
                Layout::from_size_align_unchecked(self.capacity, ARENA_ALIGN),
            )
        };
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameRecord {
    chunk: usize,
    used: usize,
    blocks: usize,
}

#[derive(Debug, Clone)]
struct Block {
    address: usize,
    size: usize,
    tracked: Option<PointerValue>,
}

/// Identifies a pushed frame. Frames are numbered by depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHandle(usize);

pub struct Arena {
    chunks: Vec<Chunk>,
    frames: Vec<FrameRecord>,
    blocks: Vec<Block>,
    chunk_size: usize,
}

// SAFETY: chunk memory is owned exclusively by the arena
unsafe impl Send for Arena {}

impl Arena {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunks: Vec::new(),
            frames: Vec::new(),
            blocks: Vec::new(),
            chunk_size: chunk_size.max(ARENA_ALIGN),
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn position(&self) -> (usize, usize) {
        match self.chunks.last() {
            Some(chunk) => (self.chunks.len() - 1, chunk.used),
            None => (0, 0),
        }
    }

    fn ensure_room(&mut self, size: usize) -> Result<()> {
        let fits = self.chunks.last().is_some_and(|c| c.remaining() >= size);
        if !fits {
            let capacity = self.chunk_size.max(size.next_multiple_of(ARENA_ALIGN));
            self.chunks.push(Chunk::new(capacity)?);
        }
        Ok(())
    }

    /// Pushes a frame, making sure `min_size` bytes can be allocated in it
    /// without growing.
    pub fn push_frame(&mut self, min_size: usize) -> Result<FrameHandle> {
        if min_size > 0 {
            self.ensure_room(min_size.next_multiple_of(ARENA_ALIGN))?;
        }
        let (chunk, used) = self.position();
        self.frames.push(FrameRecord {
            chunk,
            used,
            blocks: self.blocks.len(),
        });
        log::trace!("arena push frame {}", self.frames.len());
        Ok(FrameHandle(self.frames.len()))
    }

    /// Pops `handle` and any frame pushed after it. Returns the tracked
    /// pointers whose memory was released so the caller can unregister
    /// them.
    pub fn pop_frame(&mut self, handle: FrameHandle) -> Vec<PointerValue> {
        if handle.0 != self.frames.len() {
            log::warn!(
                "arena frame {} popped with {} frames live",
                handle.0,
                self.frames.len()
            );
        }
        if handle.0 == 0 || handle.0 > self.frames.len() {
            return Vec::new();
        }
        let record = self.frames[handle.0 - 1];
        self.frames.truncate(handle.0 - 1);
        let released: Vec<PointerValue> = self
            .blocks
            .drain(record.blocks..)
            .filter_map(|b| b.tracked)
            .collect();
        if self.chunks.is_empty() {
            return released;
        }
        // Chunks created after the frame are freed, except the one the
        // frame started in, which is rewound.
        let keep = (record.chunk + 1).min(self.chunks.len());
        self.chunks.truncate(keep);
        if let Some(chunk) = self.chunks.get_mut(record.chunk) {
            chunk.used = record.used;
        }
        log::trace!("arena pop frame {}", handle.0);
        released
    }

    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>> {
        if self.frames.is_empty() {
            return Err(AlienError::allocation("No arena frame is active."));
        }
        let rounded = size.max(1).next_multiple_of(ARENA_ALIGN);
        self.ensure_room(rounded)?;
        let Some(chunk) = self.chunks.last_mut() else {
            unreachable!("ensure_room always leaves a chunk")
        };
        // SAFETY: used + rounded <= capacity
        let ptr = unsafe { chunk.base.as_ptr().add(chunk.used) };
        chunk.used += rounded;
        self.blocks.push(Block {
            address: ptr as usize,
            size: rounded,
            tracked: None,
        });
        // SAFETY: derived from a non-null chunk base
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    pub fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>> {
        let ptr = self.allocate(size)?;
        // SAFETY: the block is at least `size` bytes
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Allocates a block whose identity is tracked as an interpreter
    /// visible pointer.
    pub fn allocate_tracked(&mut self, size: usize, tag: Option<&str>) -> Result<PointerValue> {
        let ptr = self.allocate_zeroed(size)?;
        let value = PointerValue::new(ptr.as_ptr() as usize, tag);
        if let Some(block) = self.blocks.last_mut() {
            block.tracked = Some(value.clone());
        }
        Ok(value)
    }

    /// Walks all frames and blocks checking the LIFO invariants.
    pub fn validate(&self) -> bool {
        let mut last = (0usize, 0usize, 0usize);
        for frame in &self.frames {
            let pos = (frame.chunk, frame.used, frame.blocks);
            if pos.0 < last.0 || (pos.0 == last.0 && pos.1 < last.1) || pos.2 < last.2 {
                return false;
            }
            if frame.blocks > self.blocks.len() {
                return false;
            }
            if let Some(chunk) = self.chunks.get(frame.chunk)
                && frame.used > chunk.capacity
            {
                return false;
            }
            last = pos;
        }
        if self.chunks.iter().any(|c| c.used > c.capacity) {
            return false;
        }
        self.blocks.iter().all(|b| {
            self.chunks.iter().any(|c| {
                let base = c.base.as_ptr() as usize;
                b.address >= base && b.address + b.size <= base + c.used
            })
        })
    }
}

/// Scope guard for one arena frame. The frame is popped, and tracked
/// allocations unregistered, when the guard is dropped.
pub struct ArenaFrame<'a> {
    ctx: &'a Context,
    handle: FrameHandle,
}

impl ArenaFrame<'_> {
    pub fn allocate(&self, size: usize) -> Result<*mut u8> {
        Ok(self.ctx.arena.lock().allocate(size)?.as_ptr())
    }

    pub fn allocate_zeroed(&self, size: usize) -> Result<*mut u8> {
        Ok(self.ctx.arena.lock().allocate_zeroed(size)?.as_ptr())
    }
}

impl Drop for ArenaFrame<'_> {
    fn drop(&mut self) {
        self.ctx.release_frame(self.handle);
    }
}

impl Context {
    pub fn arena_frame(&self, min_size: usize) -> Result<ArenaFrame<'_>> {
        let handle = self.arena.lock().push_frame(min_size)?;
        Ok(ArenaFrame { ctx: self, handle })
    }

    fn release_frame(&self, handle: FrameHandle) {
        let released = self.arena.lock().pop_frame(handle);
        for ptr in released {
            if let Err(err) = self.pointers.unregister(&ptr) {
                log::warn!("arena pointer {ptr} was already released: {err}");
            }
        }
    }

    pub fn arena_push(&self) -> Result<FrameHandle> {
        self.arena.lock().push_frame(0)
    }

    /// Pops the innermost frame.
    pub fn arena_pop(&self) -> Result<()> {
        let depth = self.arena.lock().depth();
        if depth == 0 {
            return Err(AlienError::oper_failed("Arena frame stack is empty."));
        }
        self.release_frame(FrameHandle(depth));
        Ok(())
    }

    /// Allocates zeroed memory in the innermost frame and returns it as a
    /// safe pointer.
    pub fn arena_allocate(&self, size: usize, tag: Option<&str>) -> Result<PointerValue> {
        let ptr = self.arena.lock().allocate_tracked(size, tag)?;
        self.pointers.register(&ptr, false)?;
        Ok(ptr)
    }

    pub fn arena_validate(&self) -> bool {
        self.arena.lock().validate()
    }
}
