use std::fmt;
use std::io::Read;

use md5::{Digest, Md5};

use crate::error::KegError;

/// A 16 byte MD5 digest naming a persistent object.
///
/// Every object on disk and on the wire is addressed by one of these,
/// rendered as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; 16]);

impl Key {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Key(bytes)
    }

    pub fn from_hex(text: &str) -> Result<Self, KegError> {
        let raw = hex::decode(text).map_err(|e| KegError::Malformed {
            what: "key",
            detail: format!("{:?}: {}", text, e),
        })?;
        let bytes: [u8; 16] = raw.try_into().map_err(|_| KegError::Malformed {
            what: "key",
            detail: format!("{:?}: expected 16 bytes", text),
        })?;
        Ok(Key(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Digest of an in-memory slice.
    pub fn of_slice(data: &[u8]) -> Self {
        Key(Md5::digest(data).into())
    }

    /// Digest of everything remaining in the reader.
    pub fn of_reader<R: Read>(reader: &mut R) -> Result<Self, std::io::Error> {
        let mut hasher = Md5::new();
        std::io::copy(reader, &mut hasher)?;
        Ok(Key(hasher.finalize().into()))
    }

    /// The partitioned form `aa/bb/aabb...` used for every on-disk and
    /// on-wire path.
    pub fn partition(&self) -> String {
        let hex = self.to_hex();
        format!("{}/{}/{}", &hex[0..2], &hex[2..4], hex)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

/// Reader adapter that digests everything passing through it.
///
/// Used to verify a BLTE envelope against its content key while the codec
/// consumes the stream.
pub struct DigestReader<R> {
    inner: R,
    hasher: Md5,
}

impl<R: Read> DigestReader<R> {
    pub fn new(inner: R) -> Self {
        DigestReader {
            inner,
            hasher: Md5::new(),
        }
    }

    pub fn finalize(self) -> Key {
        Key(self.hasher.finalize().into())
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let len = self.inner.read(buf)?;
        self.hasher.update(&buf[..len]);
        Ok(len)
    }
}

#[cfg(test)]
mod test_key {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn hex_roundtrip() {
        let key = Key::of_slice(b"hello");
        let hex = key.to_hex();

        assert_eq!(hex.len(), 32);
        assert_eq!(Key::from_hex(&hex).unwrap(), key);
    }

    #[test]
    fn known_digest() {
        // md5("hello")
        let key = Key::of_slice(b"hello");
        assert_eq!(key.to_hex(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn reader_matches_slice() {
        let data = b"some longer data that exercises the reader path";
        let mut cursor = Cursor::new(&data[..]);

        assert_eq!(Key::of_reader(&mut cursor).unwrap(), Key::of_slice(data));
    }

    #[test]
    fn partition_layout() {
        let key = Key::from_hex("5d41402abc4b2a76b9719d911017c592").unwrap();
        assert_eq!(key.partition(), "5d/41/5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn reject_bad_hex() {
        assert!(Key::from_hex("5d4140").is_err());
        assert!(Key::from_hex("not hex at all, but thirty-two!!").is_err());
    }

    #[test]
    fn digest_reader_sees_all_bytes() {
        let data = b"digest me";
        let mut reader = DigestReader::new(Cursor::new(&data[..]));

        let mut sink = Vec::new();
        std::io::copy(&mut reader, &mut sink).unwrap();

        assert_eq!(sink, data);
        assert_eq!(reader.finalize(), Key::of_slice(data));
    }
}
