//! Reads ELF relocatable objects and shared objects into our input file
//! representation. We use the `object` crate's low-level typed ELF layer so
//! that section and symbol data stay borrowed from the file mapping.

use crate::arch::Architecture;
use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use object::LittleEndian;
use object::read::elf::CompressionHeader as _;
use object::read::elf::Dyn as _;
use object::read::elf::FileHeader as _;
use object::read::elf::Rel as _;
use object::read::elf::Rela as _;
use object::read::elf::RelocationSections;
use object::read::elf::SectionHeader as _;
use object::read::elf::Sym as _;
use std::borrow::Cow;
use std::io::Read as _;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;
pub(crate) type SectionHeader = object::elf::SectionHeader64<LittleEndian>;
pub(crate) type Symbol = object::elf::Sym64<LittleEndian>;
pub(crate) type SymtabEntry = object::elf::Sym64<LittleEndian>;
pub(crate) type DynamicEntry = object::elf::Dyn64<LittleEndian>;
pub(crate) type Rela = object::elf::Rela64<LittleEndian>;
pub(crate) type Rel = object::elf::Rel64<LittleEndian>;
pub(crate) type Verdef = object::elf::Verdef<LittleEndian>;
pub(crate) type Verdaux = object::elf::Verdaux<LittleEndian>;
pub(crate) type Verneed = object::elf::Verneed<LittleEndian>;
pub(crate) type Vernaux = object::elf::Vernaux<LittleEndian>;
pub(crate) type Versym = object::elf::Versym<LittleEndian>;
pub(crate) type NoteHeader = object::elf::NoteHeader64<LittleEndian>;
pub(crate) type VerdefIterator<'data> = object::read::elf::VerdefIterator<'data, FileHeader>;

pub(crate) type SectionTable<'data> = object::read::elf::SectionTable<'data, FileHeader>;
pub(crate) type SymbolTable<'data> = object::read::elf::SymbolTable<'data, FileHeader>;

/// Our base address when linking a non-relocatable executable. The same value
/// ld uses; a distinctive non-zero value makes mixed-up file and memory
/// offsets obvious.
pub(crate) const NON_PIE_START_MEM_ADDRESS: u64 = 0x400_000;

/// These sizes are fixed by the 64 bit ELF spec.
pub(crate) const FILE_HEADER_SIZE: u16 = 0x40;
pub(crate) const PROGRAM_HEADER_SIZE: u16 = 0x38;
pub(crate) const SECTION_HEADER_SIZE: u16 = 0x40;

/// Program headers are stored straight after the file header.
pub(crate) const PHEADER_OFFSET: u64 = FILE_HEADER_SIZE as u64;

pub(crate) const GOT_ENTRY_SIZE: u64 = 8;
pub(crate) const PLT_ENTRY_SIZE: u64 = 16;
pub(crate) const RELA_ENTRY_SIZE: u64 = size_of::<Rela>() as u64;
pub(crate) const SYMTAB_ENTRY_SIZE: u64 = size_of::<SymtabEntry>() as u64;
pub(crate) const VERSYM_ENTRY_SIZE: u64 = size_of::<Versym>() as u64;

const COMPRESSION_HEADER_SIZE: usize =
    size_of::<object::elf::CompressionHeader64<LittleEndian>>();

/// The module number for TLS variables in the current executable.
pub(crate) const CURRENT_EXE_TLS_MOD: u64 = 1;

/// Section flag bits. A thin wrapper rather than raw u64 so that flag
/// formatting and queries read naturally.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub(crate) struct SectionFlags(u64);

#[allow(unused)]
pub(crate) mod shf {
    use super::SectionFlags;

    pub(crate) const WRITE: SectionFlags = SectionFlags::from_u32(object::elf::SHF_WRITE);
    pub(crate) const ALLOC: SectionFlags = SectionFlags::from_u32(object::elf::SHF_ALLOC);
    pub(crate) const EXECINSTR: SectionFlags = SectionFlags::from_u32(object::elf::SHF_EXECINSTR);
    pub(crate) const MERGE: SectionFlags = SectionFlags::from_u32(object::elf::SHF_MERGE);
    pub(crate) const STRINGS: SectionFlags = SectionFlags::from_u32(object::elf::SHF_STRINGS);
    pub(crate) const INFO_LINK: SectionFlags = SectionFlags::from_u32(object::elf::SHF_INFO_LINK);
    pub(crate) const LINK_ORDER: SectionFlags =
        SectionFlags::from_u32(object::elf::SHF_LINK_ORDER);
    pub(crate) const GROUP: SectionFlags = SectionFlags::from_u32(object::elf::SHF_GROUP);
    pub(crate) const TLS: SectionFlags = SectionFlags::from_u32(object::elf::SHF_TLS);
    pub(crate) const COMPRESSED: SectionFlags =
        SectionFlags::from_u32(object::elf::SHF_COMPRESSED);
    pub(crate) const GNU_RETAIN: SectionFlags =
        SectionFlags::from_u32(object::elf::SHF_GNU_RETAIN);
    pub(crate) const EXCLUDE: SectionFlags = SectionFlags::from_u32(object::elf::SHF_EXCLUDE);
}

impl SectionFlags {
    pub(crate) const fn empty() -> Self {
        Self(0)
    }

    pub(crate) fn from_header(header: &SectionHeader) -> Self {
        Self(header.sh_flags(LittleEndian))
    }

    pub(crate) const fn from_u32(raw: u32) -> Self {
        Self(raw as u64)
    }

    pub(crate) fn contains(self, flag: SectionFlags) -> bool {
        self.0 & flag.0 != 0
    }

    #[must_use]
    pub(crate) const fn with(self, flags: SectionFlags) -> Self {
        Self(self.0 | flags.0)
    }

    #[must_use]
    pub(crate) const fn without(self, flags: SectionFlags) -> Self {
        Self(self.0 & !flags.0)
    }

    pub(crate) const fn raw(self) -> u64 {
        self.0
    }

    /// The subset of flags that determine which output section input
    /// sections get grouped into.
    pub(crate) fn retained_for_grouping(self) -> Self {
        self.without(shf::MERGE)
            .without(shf::STRINGS)
            .without(shf::GROUP)
            .without(shf::COMPRESSED)
            .without(shf::GNU_RETAIN)
            .without(shf::INFO_LINK)
            .without(shf::LINK_ORDER)
    }
}

impl From<u64> for SectionFlags {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (flag, ch) in [
            (shf::WRITE, 'W'),
            (shf::ALLOC, 'A'),
            (shf::EXECINSTR, 'X'),
            (shf::MERGE, 'M'),
            (shf::STRINGS, 'S'),
            (shf::GROUP, 'G'),
            (shf::TLS, 'T'),
            (shf::COMPRESSED, 'C'),
        ] {
            if self.contains(flag) {
                f.write_str(ch.encode_utf8(&mut [0; 4]))?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for SectionFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// A normalized relocation record. REL records get a zero addend here; the
/// implicit addend stored in the section bytes is read when the relocation
/// is applied.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Relocation {
    pub(crate) r_offset: u64,
    pub(crate) symbol: object::SymbolIndex,
    pub(crate) r_type: u32,
    pub(crate) addend: i64,
    pub(crate) has_explicit_addend: bool,
}

#[derive(Clone, Copy)]
pub(crate) enum RelocationList<'data> {
    Rela(&'data [Rela]),
    Rel(&'data [Rel]),
}

impl<'data> RelocationList<'data> {
    pub(crate) fn empty() -> Self {
        RelocationList::Rela(&[])
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            RelocationList::Rela(r) => r.len(),
            RelocationList::Rel(r) => r.len(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = Relocation> + 'data {
        let e = LittleEndian;
        let rela = match *self {
            RelocationList::Rela(r) => Some(r.iter()),
            RelocationList::Rel(_) => None,
        };
        let rel = match *self {
            RelocationList::Rel(r) => Some(r.iter()),
            RelocationList::Rela(_) => None,
        };
        rela.into_iter()
            .flatten()
            .map(move |r| Relocation {
                r_offset: r.r_offset(e),
                symbol: object::SymbolIndex(r.r_sym(e, false) as usize),
                r_type: r.r_type(e, false),
                addend: r.r_addend(e),
                has_explicit_addend: true,
            })
            .chain(rel.into_iter().flatten().map(move |r| Relocation {
                r_offset: r.r_offset(e),
                symbol: object::SymbolIndex(r.r_sym(e) as usize),
                r_type: r.r_type(e),
                addend: 0,
                has_explicit_addend: false,
            }))
    }
}

/// A comdat group read from an input file. At most one group with a given
/// signature contributes its members to the link.
#[derive(Debug, Clone)]
pub(crate) struct ComdatGroup<'data> {
    pub(crate) signature: &'data [u8],
    pub(crate) members: Vec<object::SectionIndex>,
}

#[derive(Debug)]
pub(crate) struct File<'data> {
    pub(crate) arch: Architecture,
    pub(crate) data: &'data [u8],
    pub(crate) sections: SectionTable<'data>,

    /// symtab for relocatable objects, dynsym for shared objects.
    pub(crate) symbols: SymbolTable<'data>,

    pub(crate) versym: &'data [Versym],

    /// Version definitions and the linked string table section.
    pub(crate) verdef: Option<(VerdefIterator<'data>, object::SectionIndex)>,

    /// e_flags from the file header.
    pub(crate) eflags: u32,

    pub(crate) is_dynamic: bool,
}

// Not needing Drop means the type can live in an arena that never runs
// destructors.
const _: () = assert!(!core::mem::needs_drop::<File>());

impl<'data> File<'data> {
    pub(crate) fn parse(data: &'data [u8], is_dynamic: bool) -> Result<Self> {
        let header = FileHeader::parse(data)?;
        let e = header.endian()?;
        let arch = Architecture::try_from(header.e_machine(e))?;
        let sections = header.sections(e, data)?;
        let eflags = header.e_flags(e);

        let mut symbols = SymbolTable::default();
        let mut versym: &[Versym] = &[];
        let mut verdef = None;

        // Single scan of the section table for everything we care about.
        for (section_index, section) in sections.enumerate() {
            match section.sh_type(e) {
                object::elf::SHT_DYNSYM if is_dynamic => {
                    symbols = SymbolTable::parse(e, data, &sections, section_index, section)?;
                }
                object::elf::SHT_SYMTAB if !is_dynamic => {
                    symbols = SymbolTable::parse(e, data, &sections, section_index, section)?;
                }
                object::elf::SHT_GNU_VERSYM => {
                    versym = section.data_as_array(e, data)?;
                }
                object::elf::SHT_GNU_VERDEF => {
                    verdef = section.gnu_verdef(e, data)?;
                }
                _ => {}
            }
        }

        Ok(Self {
            arch,
            data,
            sections,
            symbols,
            versym,
            verdef,
            eflags,
            is_dynamic,
        })
    }

    pub(crate) fn section(&self, index: object::SectionIndex) -> Result<&'data SectionHeader> {
        Ok(self.sections.section(index)?)
    }

    pub(crate) fn section_name(&self, section: &SectionHeader) -> Result<&'data [u8]> {
        Ok(self.sections.section_name(LittleEndian, section)?)
    }

    pub(crate) fn section_display_name(&self, index: object::SectionIndex) -> Cow<'data, str> {
        self.section(index)
            .and_then(|section| self.section_name(section))
            .map_or_else(
                |_| format!("<index {}>", index.0).into(),
                String::from_utf8_lossy,
            )
    }

    /// Raw section bytes without decompression.
    pub(crate) fn raw_section_data(&self, section: &SectionHeader) -> Result<&'data [u8]> {
        Ok(section.data(LittleEndian, self.data)?)
    }

    /// Copies the section's bytes into `out`, which must have the right
    /// size. Decompresses if necessary.
    pub(crate) fn copy_section_data(&self, section: &SectionHeader, out: &mut [u8]) -> Result {
        let data = section.data(LittleEndian, self.data)?;
        if let Some((compression, _, _)) = section.compression(LittleEndian, self.data)? {
            decompress_into(compression, &data[COMPRESSION_HEADER_SIZE..], out)?;
        } else if section.sh_type(LittleEndian) == object::elf::SHT_NOBITS {
            out.fill(0);
        } else {
            out.copy_from_slice(data);
        }
        Ok(())
    }

    /// The section's size after decompression.
    pub(crate) fn section_size(&self, section: &SectionHeader) -> Result<u64> {
        Ok(section.compression(LittleEndian, self.data)?.map_or_else(
            || section.sh_size(LittleEndian),
            |compression| compression.0.ch_size(LittleEndian),
        ))
    }

    pub(crate) fn section_alignment(&self, section: &SectionHeader) -> Result<u64> {
        Ok(section.compression(LittleEndian, self.data)?.map_or_else(
            || section.sh_addralign(LittleEndian),
            |compression| compression.0.ch_addralign(LittleEndian),
        ))
    }

    /// Builds the map from section index to the index of the relocation
    /// section that targets it.
    pub(crate) fn parse_relocation_sections(&self) -> Result<RelocationSections> {
        Ok(self
            .sections
            .relocation_sections(LittleEndian, self.symbols.section())?)
    }

    pub(crate) fn relocations(
        &self,
        index: object::SectionIndex,
        relocations: &RelocationSections,
    ) -> Result<RelocationList<'data>> {
        let Some(rel_section_index) = relocations.get(index) else {
            return Ok(RelocationList::empty());
        };
        let section = self.sections.section(rel_section_index)?;
        let e = LittleEndian;
        Ok(if let Some((rela, _)) = section.rela(e, self.data)? {
            RelocationList::Rela(rela)
        } else if let Some((rel, _)) = section.rel(e, self.data)? {
            RelocationList::Rel(rel)
        } else {
            RelocationList::empty()
        })
    }

    pub(crate) fn symbol(&self, index: object::SymbolIndex) -> Result<&'data Symbol> {
        Ok(self.symbols.symbol(index)?)
    }

    pub(crate) fn symbol_name(&self, symbol: &Symbol) -> Result<&'data [u8]> {
        Ok(self.symbols.symbol_name(LittleEndian, symbol)?)
    }

    pub(crate) fn symbol_section(
        &self,
        symbol: &Symbol,
        index: object::SymbolIndex,
    ) -> Result<Option<object::SectionIndex>> {
        Ok(self.symbols.symbol_section(LittleEndian, symbol, index)?)
    }

    pub(crate) fn dynamic_tags(&self) -> Result<&'data [DynamicEntry]> {
        let e = LittleEndian;
        if let Some(dynamic) = self.sections.dynamic(e, self.data).transpose() {
            return dynamic
                .map(|(dynamic, _)| dynamic)
                .context("Failed to read dynamic table");
        }
        Ok(&[])
    }

    /// The DT_SONAME of a shared object, if set.
    pub(crate) fn soname(&self) -> Result<Option<&'data [u8]>> {
        let e = LittleEndian;
        for entry in self.dynamic_tags()? {
            if entry.d_tag(e) as u32 == object::elf::DT_SONAME {
                return Ok(self.symbols.strings().get(entry.d_val(e) as u32).ok());
            }
        }
        Ok(None)
    }

    /// Parses the comdat group defined by `section`, which must have type
    /// `SHT_GROUP`. The signature is the name of the symbol identified by the
    /// section's `sh_info`.
    pub(crate) fn parse_comdat_group(
        &self,
        index: object::SectionIndex,
        section: &SectionHeader,
    ) -> Result<ComdatGroup<'data>> {
        let e = LittleEndian;
        let words: &[object::U32Bytes<LittleEndian>] = section.data_as_array(e, self.data)?;
        let Some((flags, members)) = words.split_first() else {
            bail!("Empty SHT_GROUP section");
        };
        if flags.get(e) & object::elf::GRP_COMDAT == 0 {
            bail!("Unsupported non-COMDAT section group");
        }
        let signature_symbol = object::SymbolIndex(section.sh_info(e) as usize);
        let signature = self
            .symbol_name(self.symbol(signature_symbol)?)
            .with_context(|| {
                format!(
                    "Invalid group signature symbol in section {}",
                    self.section_display_name(index)
                )
            })?;
        Ok(ComdatGroup {
            signature,
            members: members
                .iter()
                .map(|m| object::SectionIndex(m.get(e) as usize))
                .collect(),
        })
    }

    /// Reads the version name table of a shared object: index i holds the
    /// name of version i as found in the verdef section.
    pub(crate) fn version_names(&self) -> Result<Vec<Option<&'data [u8]>>> {
        let Some((mut iter, link)) = self.verdef.clone() else {
            return Ok(Vec::new());
        };
        let strings = self
            .sections
            .strings(LittleEndian, self.data, link)
            .context("Invalid verdef string table link")?;
        let mut names = Vec::new();
        while let Some((verdef, mut aux_iter)) = iter.next()? {
            let e = LittleEndian;
            let index = (verdef.vd_ndx.get(e) & object::elf::VERSYM_VERSION) as usize;
            if let Some(aux) = aux_iter.next()? {
                let name = aux.name(e, strings)?;
                if names.len() <= index {
                    names.resize(index + 1, None);
                }
                names[index] = Some(name);
            }
        }
        Ok(names)
    }
}

fn decompress_into(
    compression: &object::elf::CompressionHeader64<LittleEndian>,
    input: &[u8],
    out: &mut [u8],
) -> Result {
    match compression.ch_type.get(LittleEndian) {
        object::elf::ELFCOMPRESS_ZLIB => {
            flate2::Decompress::new(true).decompress(
                input,
                out,
                flate2::FlushDecompress::Finish,
            )?;
        }
        object::elf::ELFCOMPRESS_ZSTD => {
            zstd::stream::Decoder::new(input)?.read_exact(out)?;
        }
        c => bail!("Unsupported compression format: {c}"),
    }
    Ok(())
}

/// See https://refspecs.linuxfoundation.org/LSB_1.3.0/gLSB/gLSB/ehframehdr.html
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub(crate) struct EhFrameHdr {
    pub(crate) version: u8,
    pub(crate) frame_pointer_encoding: u8,
    pub(crate) count_encoding: u8,
    pub(crate) table_encoding: u8,
    // 32 bit pointer and count keep the fields naturally aligned.
    pub(crate) frame_pointer: i32,
    pub(crate) entry_count: u32,
}

#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub(crate) struct EhFrameHdrEntry {
    pub(crate) frame_ptr: i32,
    pub(crate) frame_info_ptr: i32,
}

pub(crate) const EH_FRAME_HDR_SIZE: u64 = size_of::<EhFrameHdr>() as u64;
pub(crate) const EH_FRAME_HDR_ENTRY_SIZE: u64 = size_of::<EhFrameHdrEntry>() as u64;

/// The offset of the pc_begin field within an FDE.
pub(crate) const FDE_PC_BEGIN_OFFSET: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_flags_display() {
        let flags = shf::ALLOC.with(shf::EXECINSTR);
        assert_eq!(format!("{flags}"), "AX");
        assert!(flags.contains(shf::ALLOC));
        assert!(!flags.contains(shf::WRITE));
        assert_eq!(flags.without(shf::EXECINSTR), shf::ALLOC);
    }

    #[test]
    fn test_grouping_flags_drop_merge_bits() {
        let flags = shf::ALLOC.with(shf::MERGE).with(shf::STRINGS);
        assert_eq!(flags.retained_for_grouping(), shf::ALLOC);
    }

    #[test]
    fn test_relocation_list_empty() {
        assert!(RelocationList::empty().is_empty());
        assert_eq!(RelocationList::empty().iter().count(), 0);
    }
}
