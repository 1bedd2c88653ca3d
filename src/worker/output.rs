use std::collections::VecDeque;

/// Keeps the last `capacity` lines of a job's output.
#[derive(Debug, Clone)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn push_text(&mut self, text: &str) {
        for line in text.lines() {
            self.push(line);
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The kept lines, newline-terminated.
    pub fn render(&self) -> String {
        self.lines.iter().fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
    }
}

/// Last `max_lines` lines of `text`.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let mut tail = OutputTail::new(max_lines);
    tail.push_text(text);
    tail.render()
}

/// Accumulates streamed lines into chunks of at most `max_lines`.
#[derive(Debug)]
pub struct LogChunker {
    buffer: Vec<String>,
    max_lines: usize,
}

impl LogChunker {
    pub fn new(max_lines: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_lines: max_lines.max(1),
        }
    }

    /// Add a line; returns a full chunk once `max_lines` is reached.
    pub fn push(&mut self, line: String) -> Option<Vec<String>> {
        self.buffer.push(line);
        if self.buffer.len() >= self.max_lines {
            self.take()
        } else {
            None
        }
    }

    /// Whatever is buffered, if anything.
    pub fn take(&mut self) -> Option<Vec<String>> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}
