//! Reusable encode buffer for NUL-terminated text
//!
//! The interpreter's C API takes global names, field names and chunk names as
//! NUL-terminated strings. Rust strings are neither NUL-terminated nor
//! guaranteed free of interior NULs, so every such name needs a copy.
//!
//! `EncodeBuffer` keeps one fixed-size allocation per environment and copies
//! into it on the common path. Text that does not fit falls back to a one-off
//! heap allocation, so arbitrarily long names still work.
//!
//! ```text
//! text.len() + 1 <= capacity   ->  Cow::Borrowed(&CStr)  (no allocation)
//! text.len() + 1 >  capacity   ->  Cow::Owned(CString)   (heap fallback)
//! ```

use crate::error::{Error, Result};
use std::borrow::Cow;
use std::ffi::{CStr, CString};

/// Default buffer size (64 KiB)
pub const DEFAULT_ENCODE_BUFFER_SIZE: usize = 64 * 1024;

/// Fixed-size scratch buffer with heap fallback
pub struct EncodeBuffer {
    buf: Box<[u8]>,
    fallbacks: u64,
}

impl EncodeBuffer {
    /// Create a buffer holding up to `capacity - 1` bytes of text
    pub fn new(capacity: usize) -> Self {
        EncodeBuffer {
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            fallbacks: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// How many encodes needed the heap path
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks
    }

    /// Encode `text` as a C string
    ///
    /// The borrowed result is only valid until the next call, which the
    /// `&mut self` borrow enforces. Interior NUL bytes are rejected.
    pub fn encode<'a>(&'a mut self, text: &str) -> Result<Cow<'a, CStr>> {
        let bytes = text.as_bytes();
        if let Some(pos) = bytes.iter().position(|&b| b == 0) {
            return Err(Error::InvalidArgument(format!(
                "name contains a NUL byte at offset {}",
                pos
            )));
        }

        if bytes.len() < self.buf.len() {
            let end = bytes.len();
            self.buf[..end].copy_from_slice(bytes);
            self.buf[end] = 0;
            let cstr = CStr::from_bytes_with_nul(&self.buf[..=end])
                .map_err(|e| Error::InvalidArgument(e.to_string()))?;
            Ok(Cow::Borrowed(cstr))
        } else {
            self.fallbacks += 1;
            let owned = CString::new(bytes).map_err(|e| Error::InvalidArgument(e.to_string()))?;
            Ok(Cow::Owned(owned))
        }
    }
}

impl Default for EncodeBuffer {
    fn default() -> Self {
        EncodeBuffer::new(DEFAULT_ENCODE_BUFFER_SIZE)
    }
}

impl std::fmt::Debug for EncodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeBuffer")
            .field("capacity", &self.buf.len())
            .field("fallbacks", &self.fallbacks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_uses_buffer() {
        let mut buffer = EncodeBuffer::new(16);
        let encoded = buffer.encode("print").unwrap();
        assert!(matches!(encoded, Cow::Borrowed(_)));
        assert_eq!(encoded.to_bytes(), b"print");
        assert_eq!(buffer.fallback_count(), 0);
    }

    #[test]
    fn test_buffer_is_reused() {
        let mut buffer = EncodeBuffer::new(16);
        assert_eq!(buffer.encode("longer_name").unwrap().to_bytes(), b"longer_name");
        // A shorter name must not see leftovers from the previous one
        assert_eq!(buffer.encode("x").unwrap().to_bytes(), b"x");
    }

    #[test]
    fn test_exact_fit_boundary() {
        let mut buffer = EncodeBuffer::new(4);
        // 3 bytes + NUL fits exactly
        assert!(matches!(buffer.encode("abc").unwrap(), Cow::Borrowed(_)));
        // 4 bytes + NUL does not
        let encoded = buffer.encode("abcd").unwrap();
        assert!(matches!(encoded, Cow::Owned(_)));
        assert_eq!(encoded.to_bytes(), b"abcd");
        assert_eq!(buffer.fallback_count(), 1);
    }

    #[test]
    fn test_long_text_falls_back_to_heap() {
        let mut buffer = EncodeBuffer::default();
        let long = "n".repeat(DEFAULT_ENCODE_BUFFER_SIZE * 2);
        let encoded = buffer.encode(&long).unwrap();
        assert_eq!(encoded.to_bytes().len(), long.len());
        assert_eq!(buffer.fallback_count(), 1);
    }

    #[test]
    fn test_multibyte_text() {
        let mut buffer = EncodeBuffer::new(64);
        let encoded = buffer.encode("größe_名前").unwrap();
        assert_eq!(encoded.to_str().unwrap(), "größe_名前");
    }

    #[test]
    fn test_interior_nul_rejected() {
        let mut buffer = EncodeBuffer::new(64);
        let err = buffer.encode("bad\0name").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_empty_text() {
        let mut buffer = EncodeBuffer::new(1);
        assert_eq!(buffer.encode("").unwrap().to_bytes(), b"");
    }
}
