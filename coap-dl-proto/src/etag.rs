use std::fmt;

use thiserror::Error;

/// Opaque validator the server attaches to a representation
///
/// An empty tag means the server asserted no identity at all. Two tags are equal iff they have the
/// same length and the same bytes.
#[derive(Default, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ETag {
    len: u8,
    bytes: [u8; ETag::MAX_SIZE],
}

impl ETag {
    /// The longest tag allowed by the ETag option
    pub const MAX_SIZE: usize = 8;

    /// A tag asserting no identity
    pub const EMPTY: Self = Self {
        len: 0,
        bytes: [0; Self::MAX_SIZE],
    };

    /// Copy `bytes` into a new tag
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ETagTooLong> {
        if bytes.len() > Self::MAX_SIZE {
            return Err(ETagTooLong(bytes.len()));
        }
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; Self::MAX_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok(res)
    }

    /// Whether the server asserted no identity
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of bytes in the tag
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// The raw tag bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl AsRef<[u8]> for ETag {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ETag({self})")
    }
}

impl fmt::Display for ETag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.as_bytes() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// A tag longer than [`ETag::MAX_SIZE`] was supplied
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
#[error("ETag of {0} bytes exceeds the {max} byte limit", max = ETag::MAX_SIZE)]
pub struct ETagTooLong(pub usize);

/// Tracks the identity of the resource being downloaded
///
/// The first non-empty tag observed (or supplied up front when resuming) becomes the established
/// identity; every later block must carry exactly that tag.
#[derive(Debug, Default, Copy, Clone)]
pub(crate) struct IdentityTracker {
    established: Option<ETag>,
}

impl IdentityTracker {
    pub(crate) fn new(hint: Option<ETag>) -> Self {
        Self {
            established: hint.filter(|tag| !tag.is_empty()),
        }
    }

    /// Record the tag carried by a block, failing if it contradicts the established identity
    pub(crate) fn observe(&mut self, tag: &ETag) -> Result<(), IdentityChanged> {
        match self.established {
            Some(ref established) if established != tag => Err(IdentityChanged {
                expected: *established,
                got: *tag,
            }),
            Some(_) => Ok(()),
            None => {
                if !tag.is_empty() {
                    self.established = Some(*tag);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn established(&self) -> Option<&ETag> {
        self.established.as_ref()
    }
}

#[derive(Debug, Copy, Clone)]
pub(crate) struct IdentityChanged {
    pub(crate) expected: ETag,
    pub(crate) got: ETag,
}
