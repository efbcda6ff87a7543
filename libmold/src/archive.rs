//! A reader for System V (`!<arch>\n`) and thin archives. We borrow the data
//! of each member directly from the mapped archive rather than copying it
//! out, which is why we don't use an off-the-shelf archive crate.

use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use bytemuck::Pod;
use bytemuck::Zeroable;
use std::ffi::OsStr;
use std::ops::Range;
use std::os::unix::ffi::OsStrExt as _;
use std::path::Path;

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct MemberHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const HEADER_SIZE: usize = size_of::<MemberHeader>();

const _ASSERTS: () = {
    assert!(HEADER_SIZE == 60);
};

pub(crate) enum ArchiveEntry<'data> {
    /// The archive's own symbol index. We ignore it and read the symbol
    /// tables of the members instead.
    SymbolTable,
    Regular(ArchiveMember<'data>),
    Filenames(ExtendedFilenames<'data>),
    Thin(ThinMember<'data>),
}

pub(crate) struct ArchiveMember<'data> {
    ident: &'data str,

    pub(crate) data: &'data [u8],

    /// Offset of the member's data within the archive file.
    pub(crate) data_offset: usize,
}

pub(crate) struct ThinMember<'data> {
    ident: &'data str,
}

/// The `//` member holding names too long for the 16 byte header field.
#[derive(Clone, Copy)]
pub(crate) struct ExtendedFilenames<'data> {
    data: &'data [u8],
}

/// The name of a member together with where in the archive it came from.
/// Mostly used when reporting errors.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MemberIdent<'data> {
    /// Start of the identifier. We find the end lazily, since we mostly only
    /// need identifiers for diagnostics.
    data: &'data [u8],
}

#[derive(Clone, Debug)]
pub(crate) struct EntryMeta<'data> {
    pub(crate) ident: MemberIdent<'data>,

    /// The range of the original archive file that the member's data
    /// occupies, not including the member header.
    pub(crate) range: Range<usize>,
}

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
    offset: usize,
    is_thin: bool,
}

impl<'data> ArchiveIterator<'data> {
    /// Creates an iterator from the bytes of a whole archive, including the
    /// magic.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        if let Some(rest) = data.strip_prefix(&object::archive::MAGIC) {
            Ok(Self {
                data: rest,
                offset: object::archive::MAGIC.len(),
                is_thin: false,
            })
        } else if let Some(rest) = data.strip_prefix(&object::archive::THIN_MAGIC) {
            Ok(Self {
                data: rest,
                offset: object::archive::THIN_MAGIC.len(),
                is_thin: true,
            })
        } else {
            bail!("Missing archive magic");
        }
    }

    fn next_entry(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        if self.data.len() < HEADER_SIZE {
            bail!("Short member header at offset {}", self.offset);
        }
        let (header, rest) = self.data.split_at(HEADER_SIZE);
        let header: &MemberHeader = bytemuck::from_bytes(header);
        let size = parse_decimal(&header.size)
            .with_context(|| format!("Invalid member size at offset {}", self.offset))?;
        self.data = rest;
        self.offset += HEADER_SIZE;

        let ident = std::str::from_utf8(&header.ident)
            .context("Archive member identifier is invalid UTF-8")?
            .trim_end();

        // A thin archive stores only a reference to the member file; the
        // size field describes the referenced file, not the entry.
        let is_reference = self.is_thin && ident != "/" && ident != "//";
        let stored_size = if is_reference { 0 } else { size };
        if self.data.len() < stored_size {
            bail!(
                "Member size is {size}, but only {} bytes left in archive",
                self.data.len()
            );
        }

        let entry = match ident {
            "/" => ArchiveEntry::SymbolTable,
            "//" => ArchiveEntry::Filenames(ExtendedFilenames {
                data: &self.data[..stored_size],
            }),
            _ if is_reference => ArchiveEntry::Thin(ThinMember { ident }),
            _ => ArchiveEntry::Regular(ArchiveMember {
                ident,
                data: &self.data[..stored_size],
                data_offset: self.offset,
            }),
        };

        // Member data is padded to an even size.
        let advance = stored_size.next_multiple_of(2).min(self.data.len());
        self.data = &self.data[advance..];
        self.offset += advance;
        Ok(Some(entry))
    }
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_entry().transpose()
    }
}

fn parse_decimal(field: &[u8]) -> Result<usize> {
    let end = field
        .iter()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(field.len());
    if end == 0 {
        bail!("Empty decimal field");
    }
    let text = std::str::from_utf8(&field[..end]).expect("digits are ASCII");
    Ok(text.parse()?)
}

/// Resolves a member's identifier, indirecting through the extended filename
/// table for `/nnn` style identifiers.
fn resolve_ident<'data>(
    ident: &'data str,
    extended_filenames: Option<ExtendedFilenames<'data>>,
) -> MemberIdent<'data> {
    if let (Some(filenames), Some(rest)) = (extended_filenames, ident.strip_prefix('/')) {
        // GNU ar appends a trailing '/' to the offset when the member name is
        // exactly 15 bytes, so strip it before parsing.
        if let Ok(offset) = rest.trim_end_matches('/').trim().parse::<usize>() {
            if offset < filenames.data.len() {
                return MemberIdent {
                    data: &filenames.data[offset..],
                };
            }
        }
    }
    MemberIdent {
        data: ident.as_bytes(),
    }
}

impl<'data> ArchiveMember<'data> {
    pub(crate) fn ident(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> MemberIdent<'data> {
        resolve_ident(self.ident, extended_filenames)
    }

    pub(crate) fn data_range(&self) -> Range<usize> {
        self.data_offset..self.data_offset + self.data.len()
    }
}

impl<'data> ThinMember<'data> {
    pub(crate) fn ident(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> MemberIdent<'data> {
        resolve_ident(self.ident, extended_filenames)
    }
}

impl<'data> MemberIdent<'data> {
    pub(crate) fn as_slice(&self) -> &'data [u8] {
        // Entries in the extended filename table end with "/\n". Member names
        // may contain '/', so scan for the newline, then drop the slash.
        match memchr::memchr(b'\n', self.data) {
            Some(end) => self.data[..end].strip_suffix(b"/").unwrap_or(&self.data[..end]),
            None => self.data.strip_suffix(b"/").unwrap_or(self.data),
        }
    }

    pub(crate) fn as_path(&self) -> &'data Path {
        Path::new(OsStr::from_bytes(self.as_slice()))
    }
}

impl std::fmt::Display for MemberIdent<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&String::from_utf8_lossy(self.as_slice()), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member_header(ident: &str, size: usize) -> Vec<u8> {
        let mut header = Vec::new();
        header.extend_from_slice(format!("{ident:<16}").as_bytes());
        header.extend_from_slice(b"0           "); // timestamp
        header.extend_from_slice(b"0     "); // owner
        header.extend_from_slice(b"0     "); // group
        header.extend_from_slice(b"644     "); // mode
        header.extend_from_slice(format!("{size:<10}").as_bytes());
        header.extend_from_slice(b"`\n");
        assert_eq!(header.len(), HEADER_SIZE);
        header
    }

    fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut data = object::archive::MAGIC.to_vec();
        for (ident, content) in members {
            data.extend_from_slice(&member_header(ident, content.len()));
            data.extend_from_slice(content);
            if content.len() % 2 == 1 {
                data.push(b'\n');
            }
        }
        data
    }

    #[test]
    fn test_iterate_regular_archive() {
        let data = build_archive(&[("a.o/", b"aaa"), ("b.o/", b"bbbb")]);
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&data)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let contents: Vec<&[u8]> = entries
            .iter()
            .filter_map(|e| match e {
                ArchiveEntry::Regular(m) => Some(m.data),
                _ => None,
            })
            .collect();
        assert_eq!(contents, vec![b"aaa".as_slice(), b"bbbb".as_slice()]);
    }

    #[test]
    fn test_extended_filenames() {
        let filenames = b"first_long_member_name.o/\nsecond.o/\n";
        let data = build_archive(&[("//", filenames), ("/0", b"xy"), ("/26", b"zw")]);
        let mut table = None;
        let mut idents = Vec::new();
        for entry in ArchiveIterator::from_archive_bytes(&data).unwrap() {
            match entry.unwrap() {
                ArchiveEntry::Filenames(t) => table = Some(t),
                ArchiveEntry::Regular(m) => {
                    idents.push(m.ident(table).as_slice().to_vec());
                }
                _ => {}
            }
        }
        assert_eq!(
            idents,
            vec![
                b"first_long_member_name.o".to_vec(),
                b"second.o".to_vec()
            ]
        );
    }

    #[test]
    fn test_symbol_table_ignored() {
        let data = build_archive(&[("/", b"\x00\x00\x00\x00"), ("m.o/", b"mm")]);
        let entries: Vec<_> = ArchiveIterator::from_archive_bytes(&data)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert!(matches!(entries[0], ArchiveEntry::SymbolTable));
        assert!(matches!(entries[1], ArchiveEntry::Regular(_)));
    }

    #[test]
    fn test_truncated_member() {
        let mut data = build_archive(&[("a.o/", b"aaaa")]);
        data.truncate(data.len() - 2);
        let result: Result<Vec<_>> = ArchiveIterator::from_archive_bytes(&data)
            .unwrap()
            .collect();
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal(b"123       ").unwrap(), 123);
        assert_eq!(parse_decimal(b"0         ").unwrap(), 0);
        assert!(parse_decimal(b"          ").is_err());
    }
}
