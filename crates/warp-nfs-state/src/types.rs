//! Shared vocabulary for the state engine

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;

/// Server-assigned client identifier: the server's boot epoch in the high
/// word, a per-boot allocation index in the low word. The epoch word is how
/// stale handles from a previous server instance are detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    /// Boot instance that issued this id
    pub boot_epoch: u32,
    /// Per-boot allocation index
    pub index: u32,
}

impl ClientId {
    /// Create a client id from its two words
    pub fn new(boot_epoch: u32, index: u32) -> Self {
        Self { boot_epoch, index }
    }

    /// Unpack from the wire's 64-bit representation
    pub fn from_u64(v: u64) -> Self {
        Self {
            boot_epoch: (v >> 32) as u32,
            index: v as u32,
        }
    }

    /// Pack into the wire's 64-bit representation
    pub fn as_u64(&self) -> u64 {
        ((self.boot_epoch as u64) << 32) | self.index as u64
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.boot_epoch, self.index)
    }
}

/// Share access bits requested by an open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenAccess(u32);

impl OpenAccess {
    /// OPEN4_SHARE_ACCESS_READ
    pub const READ: OpenAccess = OpenAccess(0x1);
    /// OPEN4_SHARE_ACCESS_WRITE
    pub const WRITE: OpenAccess = OpenAccess(0x2);
    /// OPEN4_SHARE_ACCESS_BOTH
    pub const BOTH: OpenAccess = OpenAccess(0x3);

    /// Construct from raw bits (low two bits only)
    pub fn from_bits(bits: u32) -> Self {
        Self(bits & 0x3)
    }

    /// Raw bit representation
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// True if all of `other`'s bits are present
    pub fn contains(&self, other: OpenAccess) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if this is a subset of `other` (downgrade legality check)
    pub fn is_subset_of(&self, other: OpenAccess) -> bool {
        other.contains(*self) && self.0 != 0
    }

    /// Union of two access sets
    pub fn union(&self, other: OpenAccess) -> OpenAccess {
        OpenAccess(self.0 | other.0)
    }

    /// True if any bit overlaps with a deny set
    pub fn denied_by(&self, deny: OpenDeny) -> bool {
        self.0 & deny.0 != 0
    }
}

/// Share deny bits requested by an open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenDeny(u32);

impl OpenDeny {
    /// OPEN4_SHARE_DENY_NONE
    pub const NONE: OpenDeny = OpenDeny(0x0);
    /// OPEN4_SHARE_DENY_READ
    pub const READ: OpenDeny = OpenDeny(0x1);
    /// OPEN4_SHARE_DENY_WRITE
    pub const WRITE: OpenDeny = OpenDeny(0x2);
    /// OPEN4_SHARE_DENY_BOTH
    pub const BOTH: OpenDeny = OpenDeny(0x3);

    /// Construct from raw bits (low two bits only)
    pub fn from_bits(bits: u32) -> Self {
        Self(bits & 0x3)
    }

    /// Raw bit representation
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// True if all of `other`'s bits are present
    pub fn contains(&self, other: OpenDeny) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if this is a subset of `other` (downgrade legality check)
    pub fn is_subset_of(&self, other: OpenDeny) -> bool {
        other.contains(*self)
    }

    /// Union of two deny sets
    pub fn union(&self, other: OpenDeny) -> OpenDeny {
        OpenDeny(self.0 | other.0)
    }
}

/// Byte-range lock flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared (read) lock
    Read,
    /// Exclusive (write) lock
    Write,
}

impl LockKind {
    /// True for exclusive locks
    pub fn is_write(&self) -> bool {
        matches!(self, LockKind::Write)
    }
}

/// Opaque credential identity of the requester, as established by the RPC
/// authentication layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(String);

impl Principal {
    /// Wrap a credential name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Credential name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where and how to reach a client's callback service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackInfo {
    /// Callback service address
    pub addr: SocketAddr,
    /// Callback RPC program number; zero means callbacks are unavailable
    pub program: u32,
}

impl CallbackInfo {
    /// True if the client advertised a usable callback service
    pub fn callbacks_possible(&self) -> bool {
        self.program != 0
    }
}

/// Fixed-size opaque file handle supplied by the filesystem collaborator.
/// The engine never looks inside it; it is only a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle([u8; 32]);

impl FileHandle {
    /// Wrap raw handle bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Construct from a slice; `None` if the length is wrong
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Raw handle bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..")
    }
}

/// Transport-level identity of a request, used to tell replays apart from
/// genuinely out-of-order requests carrying a repeated sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTag {
    /// RPC transaction id
    pub xid: u64,
    /// Request length on the wire
    pub req_len: u32,
    /// Checksum over the request body
    pub req_cksum: u32,
}

/// Opaque identifiers (client ids, owner names) are carried as [`Bytes`]
pub type OpaqueId = Bytes;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clientid_round_trip() {
        let id = ClientId::new(0x6523_aa01, 42);
        assert_eq!(ClientId::from_u64(id.as_u64()), id);
    }

    #[test]
    fn test_access_deny_interaction() {
        assert!(OpenAccess::READ.denied_by(OpenDeny::READ));
        assert!(!OpenAccess::READ.denied_by(OpenDeny::WRITE));
        assert!(OpenAccess::BOTH.denied_by(OpenDeny::WRITE));
        assert!(!OpenAccess::WRITE.denied_by(OpenDeny::NONE));
    }

    #[test]
    fn test_access_subset() {
        assert!(OpenAccess::READ.is_subset_of(OpenAccess::BOTH));
        assert!(!OpenAccess::BOTH.is_subset_of(OpenAccess::READ));
        // a downgrade to nothing is not a downgrade
        assert!(!OpenAccess::from_bits(0).is_subset_of(OpenAccess::BOTH));
    }

    #[test]
    fn test_filehandle_from_slice() {
        assert!(FileHandle::from_slice(&[0u8; 31]).is_none());
        assert!(FileHandle::from_slice(&[7u8; 32]).is_some());
    }
}
