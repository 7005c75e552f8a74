//! Growable owned byte buffer for outbound packets.
//!
//! Applications assemble a packet here (or let a serialization library
//! write into it) and hand it to the engine's packet send entry point.

/// Owned binary packet data.
///
/// `len` tracks the bytes in use; the backing vector only grows.
#[derive(Default, Clone)]
pub struct PacketBuffer {
    data: Vec<u8>,
}

impl PacketBuffer {
    pub fn new() -> Self {
        PacketBuffer { data: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        PacketBuffer {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        PacketBuffer {
            data: data.to_vec(),
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    pub fn resize(&mut self, new_len: usize) {
        self.data.resize(new_len, 0);
    }

    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// Replace the contents entirely.
    pub fn set_data(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_set() {
        let mut pb = PacketBuffer::new();
        assert!(pb.is_empty());
        pb.append(b"head");
        pb.append(b"tail");
        assert_eq!(pb.as_slice(), b"headtail");

        pb.set_data(b"fresh");
        assert_eq!(pb.as_slice(), b"fresh");
        assert_eq!(pb.len(), 5);
    }
}
