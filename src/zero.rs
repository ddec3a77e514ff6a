use std::io::{self, Read};

/// A forward-only reader producing a fixed number of zero bytes.
///
/// Serves as the synthetic benchmark payload: the perf tools copy it into a
/// stream instead of generating real data.
pub struct ZeroReader {
    len: u64,
    position: u64,
}

impl ZeroReader {
    /// A reader that yields `len` zero bytes and then end-of-data.
    pub fn new(len: u64) -> ZeroReader {
        ZeroReader { len, position: 0 }
    }

    /// Total number of bytes this reader produces.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the reader produces no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of bytes already read.
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for ZeroReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len - self.position;
        let n = remaining.min(buf.len() as u64) as usize;
        buf[..n].fill(0);
        self.position += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_exactly_its_length_then_eof() {
        let mut zero = ZeroReader::new(10);
        let mut buf = [1u8; 8];

        assert_eq!(zero.read(&mut buf).unwrap(), 8);
        assert_eq!(buf, [0u8; 8]);
        assert_eq!(zero.read(&mut buf).unwrap(), 2);
        assert_eq!(zero.read(&mut buf).unwrap(), 0);
        assert_eq!(zero.position(), 10);
    }
}
