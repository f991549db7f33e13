use bytes::{Bytes, BytesMut};
use std::fmt::Write;

pub fn is_recoverable_error(e: &bollard::errors::Error) -> bool {
    matches!(
        &e,
        bollard::errors::Error::JsonDataError { .. }
            | bollard::errors::Error::JsonSerdeError { .. }
            | bollard::errors::Error::StrParseError { .. }
            | bollard::errors::Error::StrFmtError { .. }
            | bollard::errors::Error::URLEncodedError { .. }
    )
}

/// The signal a shell would have reported as exit code `code`, if any.
pub fn signal_from_code(code: i64) -> Option<u32> {
    if (129..=159).contains(&code) {
        Some((code - 128) as u32)
    } else {
        None
    }
}

/// A byte buffer that silently drops everything past `size_limit`.
pub struct SizeConstraintBytesMut {
    size_limit: usize,
    bytes: BytesMut,
    overflowed: bool,
}

impl SizeConstraintBytesMut {
    pub fn new(size_limit: usize) -> Self {
        SizeConstraintBytesMut {
            size_limit,
            bytes: BytesMut::new(),
            overflowed: false,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        if self.bytes.len() + bytes.len() > self.size_limit {
            let cut_at = self.size_limit - self.bytes.len();
            self.bytes.extend_from_slice(&bytes[0..cut_at]);
            self.overflowed = true;
        } else {
            self.bytes.extend_from_slice(bytes);
        }
    }

    pub fn is_oversized(&self) -> bool {
        self.overflowed
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes.freeze()
    }

    pub fn into_string(self) -> String {
        let oversized = self.is_oversized();
        let mut s = String::from_utf8_lossy(&self.bytes).into_owned();
        if oversized {
            let _ = writeln!(s);
            let _ = writeln!(
                s,
                "--- output buffer capped out at {} bytes ---",
                self.size_limit
            );
        }
        s
    }
}
