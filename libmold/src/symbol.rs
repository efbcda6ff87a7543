use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use std::fmt::Display;
use std::ops::BitXor as _;

/// The name of a global symbol, without any version attached.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SymbolName<'data> {
    bytes: &'data [u8],
}

/// A symbol name qualified by a version, e.g. `malloc@GLIBC_2.2.5`. Stored
/// separately from unversioned names so that the common (unversioned) case
/// keeps its map entries small.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct VersionedSymbolName<'data> {
    pub(crate) name: SymbolName<'data>,
    pub(crate) version: &'data [u8],
}

/// A prehashed name that may or may not carry a version. The enum is the
/// outer layer so that the unversioned map never pays for an optional
/// version field.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum PreHashedSymbolName<'data> {
    Unversioned(PreHashed<SymbolName<'data>>),
    Versioned(PreHashed<VersionedSymbolName<'data>>),
}

impl<'data> SymbolName<'data> {
    pub(crate) fn new(bytes: &'data [u8]) -> SymbolName<'data> {
        Self { bytes }
    }

    pub(crate) fn prehashed(bytes: &'data [u8]) -> PreHashed<SymbolName<'data>> {
        PreHashed::new(Self::new(bytes), hash_bytes(bytes))
    }

    pub(crate) fn bytes(&self) -> &'data [u8] {
        self.bytes
    }
}

impl<'data> VersionedSymbolName<'data> {
    pub(crate) fn prehashed(
        name: PreHashed<SymbolName<'data>>,
        version: &'data [u8],
    ) -> PreHashed<VersionedSymbolName<'data>> {
        PreHashed::new(
            VersionedSymbolName {
                name: *name,
                version,
            },
            name.hash().bitxor(hash_bytes(version)),
        )
    }
}

impl Display for SymbolName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&String::from_utf8_lossy(self.bytes), f)
    }
}

impl Display for VersionedSymbolName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}@{}",
            self.name,
            String::from_utf8_lossy(self.version)
        )
    }
}

impl std::fmt::Debug for SymbolName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.bytes))
    }
}

impl std::fmt::Debug for VersionedSymbolName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}
