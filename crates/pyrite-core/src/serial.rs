//! Serial-port capture.
//!
//! The link cable itself is not emulated; the serial registers exist so that
//! hardware test ROMs, which print their results one byte at a time by
//! writing SB and then 0x81 to SC, can be scored. Captured bytes accumulate
//! in a bounded buffer and flip the result latch when "Passed" or "Failed"
//! appears.

/// Outcome latch for a running test ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestResult {
    Running,
    Passed,
    Failed,
}

pub struct Serial {
    buffer: Vec<u8>,
    result: TestResult,
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|chunk| chunk == needle)
}

impl Serial {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            result: TestResult::Running,
        }
    }

    /// Record one transferred byte (the SB value at the moment SC was written
    /// with 0x81).
    pub fn capture(&mut self, byte: u8) {
        self.buffer.push(byte);

        if self.result == TestResult::Running {
            if contains(&self.buffer, b"Passed") {
                self.result = TestResult::Passed;
            } else if contains(&self.buffer, b"Failed") {
                self.result = TestResult::Failed;
            }
        }

        // Keep only the tail so long-running ROMs cannot grow the buffer
        // without bound.
        if self.buffer.len() > 100 {
            let cut = self.buffer.len() - 50;
            self.buffer.drain(..cut);
        }
    }

    pub fn test_result(&self) -> TestResult {
        self.result
    }

    /// Recently captured output, for host-side diagnostics.
    pub fn output(&self) -> &[u8] {
        &self.buffer
    }
}

impl Default for Serial {
    fn default() -> Self {
        Self::new()
    }
}
