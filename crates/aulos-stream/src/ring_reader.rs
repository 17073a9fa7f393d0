use std::time::Duration;

use aulos_buf::{ByteRingBuffer, WaitOutcome};
use aulos_mp4::{ScanRead, ScanReadError};

/// [`ScanRead`] adapter over a ring buffer being filled by a fetch session.
///
/// `read` blocks (via the ring's own bounded wait) until at least one byte
/// is available, end of data is reached, or the buffer is aborted.
pub struct RingScanReader {
    ring: ByteRingBuffer,
    offset: u64,
    read_timeout: Duration,
}

impl RingScanReader {
    pub fn new(ring: ByteRingBuffer, start_offset: u64, read_timeout: Duration) -> Self {
        Self {
            ring,
            offset: start_offset,
            read_timeout,
        }
    }
}

impl ScanRead for RingScanReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ScanReadError> {
        loop {
            let n = self.ring.pop_into(buf);
            if n > 0 {
                self.offset += n as u64;
                return Ok(n);
            }

            match self.ring.wait_for_size(1, self.read_timeout) {
                WaitOutcome::Ready => {}
                WaitOutcome::EndOfData => return Ok(0),
                WaitOutcome::Aborted => {
                    return Err(ScanReadError::new("ring buffer aborted"))
                }
                WaitOutcome::TimedOut => {
                    return Err(ScanReadError::new("timed out waiting for stream data"))
                }
            }
        }
    }

    fn has_reached_eof(&self) -> bool {
        self.ring.is_end_of_data() && self.ring.occupied() == 0
    }

    fn current_offset(&self) -> u64 {
        self.offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_across_pushes_and_reports_offsets() {
        let ring = ByteRingBuffer::new(16);
        let mut reader = RingScanReader::new(ring.clone(), 0, Duration::from_secs(1));

        let producer = ring.clone();
        let handle = std::thread::spawn(move || {
            producer.push(b"abcd");
            std::thread::sleep(Duration::from_millis(20));
            producer.push(b"efgh");
            producer.signal_end_of_data();
        });

        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdefgh");
        assert_eq!(reader.current_offset(), 8);
        assert!(reader.has_reached_eof());
        handle.join().unwrap();
    }

    #[test]
    fn abort_surfaces_as_read_error() {
        let ring = ByteRingBuffer::new(16);
        let mut reader = RingScanReader::new(ring.clone(), 0, Duration::from_secs(5));

        let aborter = ring.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            aborter.abort();
        });

        let mut buf = [0u8; 4];
        assert!(reader.read(&mut buf).is_err());
        handle.join().unwrap();
    }
}
