//! Buffer Ring Implementation

use crate::{BufferState, RingError};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

/// One acquisition buffer
pub struct FrameSlot {
    /// Encoded [`BufferState`]
    state: AtomicU8,
    /// Raw payload, always `frame_size` bytes
    data: Mutex<Vec<u8>>,
}

impl FrameSlot {
    fn new(frame_size: usize) -> Self {
        Self {
            state: AtomicU8::new(BufferState::Empty.into()),
            data: Mutex::new(vec![0u8; frame_size]),
        }
    }

    /// Current fill state
    pub fn state(&self) -> BufferState {
        BufferState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: BufferState) {
        self.state.store(state.into(), Ordering::Release);
    }
}

/// Ring of N acquisition buffers with a single "current" read index
///
/// The stream fills buffers in order and never overwrites a buffer the
/// reader has not consumed yet. The reader only advances after it has
/// converted the current buffer.
pub struct BufferRing {
    /// Pre-allocated buffers
    slots: Box<[FrameSlot]>,
    /// Bytes per buffer
    frame_size: usize,
    /// Reader position (`curFrameIndex`)
    current: AtomicUsize,
    /// Stream write position
    write: AtomicUsize,
    /// Frames transferred into the ring
    total_written: AtomicUsize,
    /// Frames consumed by the reader
    total_consumed: AtomicUsize,
}

impl BufferRing {
    /// Allocate `count` buffers of `frame_size` bytes each, all EMPTY
    pub fn new(count: usize, frame_size: usize) -> Result<Self, RingError> {
        if count == 0 {
            return Err(RingError::ZeroCapacity);
        }
        if frame_size == 0 {
            return Err(RingError::ZeroFrameSize);
        }

        let slots: Vec<FrameSlot> = (0..count).map(|_| FrameSlot::new(frame_size)).collect();
        Ok(Self {
            slots: slots.into_boxed_slice(),
            frame_size,
            current: AtomicUsize::new(0),
            write: AtomicUsize::new(0),
            total_written: AtomicUsize::new(0),
            total_consumed: AtomicUsize::new(0),
        })
    }

    /// Number of buffers in the ring
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false: a ring holds at least one buffer
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bytes per buffer
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Reader position
    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Next buffer the stream will fill
    pub fn write_index(&self) -> usize {
        self.write.load(Ordering::Acquire)
    }

    /// State of buffer `index`
    pub fn state(&self, index: usize) -> Result<BufferState, RingError> {
        self.slots
            .get(index)
            .map(FrameSlot::state)
            .ok_or(RingError::OutOfRange { index, len: self.slots.len() })
    }

    /// State of the buffer at the reader position
    pub fn current_state(&self) -> BufferState {
        self.slots[self.current_index()].state()
    }

    /// Snapshot of every buffer state, in ring order
    pub fn states(&self) -> Vec<BufferState> {
        self.slots.iter().map(FrameSlot::state).collect()
    }

    /// Number of buffers holding an unread frame
    pub fn filled_count(&self) -> usize {
        self.slots.iter().filter(|s| s.state().is_readable()).count()
    }

    /// Transfer a frame into the next buffer (stream side)
    ///
    /// `complete == false` marks the buffer INCOMPLETE. Payloads shorter
    /// than the buffer leave the tail untouched; longer ones are truncated.
    /// Returns the index written.
    pub fn write_next(&self, payload: &[u8], complete: bool) -> Result<usize, RingError> {
        let index = self.write.load(Ordering::Acquire);
        let slot = &self.slots[index];

        if slot.state() != BufferState::Empty {
            return Err(RingError::Overrun(index));
        }

        {
            let mut data = slot
                .data
                .lock()
                .map_err(|e| RingError::Lock(e.to_string()))?;
            let n = payload.len().min(self.frame_size);
            data[..n].copy_from_slice(&payload[..n]);
        }

        slot.set_state(if complete {
            BufferState::Full
        } else {
            BufferState::Incomplete
        });
        self.write.store((index + 1) % self.slots.len(), Ordering::Release);
        self.total_written.fetch_add(1, Ordering::Relaxed);
        Ok(index)
    }

    /// Consume the current buffer if it is readable (reader side)
    ///
    /// Calls `f` with the buffer state and payload, then resets the buffer
    /// to EMPTY and advances the reader position. Returns `Ok(None)` without
    /// side effects when the current buffer is EMPTY.
    pub fn consume_current<R>(
        &self,
        f: impl FnOnce(BufferState, &[u8]) -> R,
    ) -> Result<Option<R>, RingError> {
        let index = self.current.load(Ordering::Acquire);
        let slot = &self.slots[index];
        let state = slot.state();

        if !state.is_readable() {
            return Ok(None);
        }

        let result = {
            let data = slot
                .data
                .lock()
                .map_err(|e| RingError::Lock(e.to_string()))?;
            f(state, &data)
        };

        slot.set_state(BufferState::Empty);
        self.current.store((index + 1) % self.slots.len(), Ordering::Release);
        self.total_consumed.fetch_add(1, Ordering::Relaxed);
        Ok(Some(result))
    }

    /// Mark every buffer EMPTY and rewind both positions
    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.set_state(BufferState::Empty);
        }
        self.current.store(0, Ordering::Release);
        self.write.store(0, Ordering::Release);
    }

    /// Frames transferred into the ring since allocation
    pub fn total_written(&self) -> usize {
        self.total_written.load(Ordering::Relaxed)
    }

    /// Frames consumed since allocation
    pub fn total_consumed(&self) -> usize {
        self.total_consumed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for BufferRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRing")
            .field("len", &self.slots.len())
            .field("frame_size", &self.frame_size)
            .field("current", &self.current_index())
            .field("write", &self.write_index())
            .field("states", &self.states())
            .finish()
    }
}
