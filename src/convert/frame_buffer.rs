/// Reusable destination for converted pixels
///
/// Owned by exactly one worker. The backing allocation is replaced only when
/// the required size changes, so a steady stream converts into the same memory.
#[derive(Debug)]
pub struct FrameBuffer {
    data: Vec<u8>,
    max_bytes: usize,
    allocations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("frame of {required} bytes exceeds the {max} byte limit")]
    TooLarge { required: usize, max: usize },
    #[error("failed to allocate {0} bytes")]
    OutOfMemory(usize),
}

impl FrameBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            data: Vec::new(),
            max_bytes,
            allocations: 0,
        }
    }

    /// Make the buffer exactly `required` bytes long
    pub fn ensure_capacity(&mut self, required: usize) -> Result<&mut [u8], BufferError> {
        if required == self.data.len() {
            return Ok(&mut self.data);
        }
        if required > self.max_bytes {
            return Err(BufferError::TooLarge {
                required,
                max: self.max_bytes,
            });
        }

        // Drop the old block first so peak usage stays at one frame
        self.data = Vec::new();
        let mut fresh = Vec::new();
        fresh
            .try_reserve_exact(required)
            .map_err(|_| BufferError::OutOfMemory(required))?;
        fresh.resize(required, 0);
        self.data = fresh;
        self.allocations += 1;

        Ok(&mut self.data)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of backing allocations made so far
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Free the backing memory, returns whether there was any
    pub fn release(&mut self) -> bool {
        let held = self.data.capacity() > 0;
        self.data = Vec::new();
        held
    }
}
