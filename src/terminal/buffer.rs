use std::collections::VecDeque;

/// Bounded scrollback of raw terminal output, addressed by absolute byte cursors.
#[derive(Debug)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    start_cursor: u64,
    max_bytes: usize,
    max_lines: usize,
    line_count: usize,
}

#[derive(Debug, Clone)]
pub struct BufferSlice {
    pub bytes: Vec<u8>,
    pub truncated: bool,
    pub start_cursor: u64,
    pub end_cursor: u64,
}

impl BufferSlice {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

impl OutputBuffer {
    pub fn new(max_bytes: usize, max_lines: usize) -> Self {
        Self {
            data: VecDeque::new(),
            start_cursor: 0,
            max_bytes: max_bytes.max(1),
            max_lines: max_lines.max(1),
            line_count: 0,
        }
    }

    /// Appends output and returns how many old bytes were evicted.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        self.line_count += bytes.iter().filter(|&&byte| byte == b'\n').count();
        self.data.extend(bytes);
        self.enforce_limits()
    }

    pub fn buffer_start(&self) -> u64 {
        self.start_cursor
    }

    pub fn buffer_end(&self) -> u64 {
        self.start_cursor + self.data.len() as u64
    }

    pub fn buffered_bytes(&self) -> usize {
        self.data.len()
    }

    /// Everything from `cursor` to the end. A cursor that fell behind the
    /// retained window is clamped and reported as truncated.
    pub fn slice_from(&self, cursor: u64) -> BufferSlice {
        let end_cursor = self.buffer_end();
        let truncated = cursor < self.start_cursor;
        let effective = cursor.clamp(self.start_cursor, end_cursor);
        let start_index = (effective - self.start_cursor) as usize;
        BufferSlice {
            bytes: self.data.range(start_index..).copied().collect(),
            truncated,
            start_cursor: effective,
            end_cursor,
        }
    }

    /// Last `max_bytes` of output.
    pub fn tail(&self, max_bytes: usize) -> BufferSlice {
        let len = self.data.len();
        let start_index = len.saturating_sub(max_bytes);
        BufferSlice {
            bytes: self.data.range(start_index..).copied().collect(),
            truncated: start_index > 0,
            start_cursor: self.start_cursor + start_index as u64,
            end_cursor: self.buffer_end(),
        }
    }

    fn enforce_limits(&mut self) -> u64 {
        let mut dropped = 0u64;
        while self.data.len() > self.max_bytes || self.line_count > self.max_lines {
            let Some(byte) = self.data.pop_front() else {
                break;
            };
            dropped += 1;
            self.start_cursor += 1;
            if byte == b'\n' {
                self.line_count = self.line_count.saturating_sub(1);
            }
        }
        dropped
    }
}
