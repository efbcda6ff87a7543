//! Output sections and their ordering. Every output section has an
//! `OutputSectionId`: the built-in ones get fixed IDs, custom sections (one
//! per distinct (name, flags, type) triple seen across live input sections)
//! get IDs allocated after the built-ins. IDs are independent of output
//! order; the order is a separate event stream that interleaves segment
//! boundaries with sections, grouped by access flags so that the number of
//! PT_LOAD segments stays minimal.

use crate::alignment;
use crate::alignment::Alignment;
use crate::elf::SectionFlags;
use crate::elf::shf;
use crate::program_segments;
use crate::program_segments::ProgramSegmentId;
use hashbrown::HashMap;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct OutputSectionId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SectionName<'data>(pub(crate) &'data [u8]);

impl Display for SectionName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&String::from_utf8_lossy(self.0), f)
    }
}

macro_rules! built_in_ids {
    ($($name:ident = $index:literal;)*) => {
        $(pub(crate) const $name: OutputSectionId = OutputSectionId($index);)*
    };
}

built_in_ids! {
    FILE_HEADER = 0;
    PROGRAM_HEADERS = 1;
    INTERP = 2;
    NOTE_GNU_BUILD_ID = 3;
    HASH = 4;
    GNU_HASH = 5;
    DYNSYM = 6;
    DYNSTR = 7;
    GNU_VERSION = 8;
    GNU_VERSION_R = 9;
    GNU_VERSION_D = 10;
    RELA_DYN = 11;
    RELA_PLT = 12;
    INIT = 13;
    PLT = 14;
    TEXT = 15;
    FINI = 16;
    RODATA = 17;
    EH_FRAME_HDR = 18;
    EH_FRAME = 19;
    GCC_EXCEPT_TABLE = 20;
    TDATA = 21;
    TBSS = 22;
    PREINIT_ARRAY = 23;
    INIT_ARRAY = 24;
    FINI_ARRAY = 25;
    DATA_REL_RO = 26;
    DYNAMIC = 27;
    GOT = 28;
    GOT_PLT = 29;
    DATA = 30;
    BSS = 31;
    COMMENT = 32;
    SYMTAB = 33;
    STRTAB = 34;
    SHSTRTAB = 35;
}

pub(crate) const NUM_BUILT_IN_SECTIONS: usize = 36;

impl OutputSectionId {
    pub(crate) fn from_usize(raw: usize) -> Self {
        Self(raw as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn built_in_details(self) -> &'static BuiltInSectionDetails {
        &SECTION_DEFINITIONS[self.as_usize()]
    }
}

pub(crate) struct BuiltInSectionDetails {
    pub(crate) name: &'static [u8],
    pub(crate) ty: u32,
    pub(crate) section_flags: SectionFlags,
    pub(crate) min_alignment: Alignment,
    pub(crate) element_size: u64,

    /// Section to point sh_link at, if we emit it.
    pub(crate) link: Option<OutputSectionId>,

    /// Emit the section header even when the section is empty.
    pub(crate) keep_if_empty: bool,
}

const DEFAULT_DEFS: BuiltInSectionDetails = BuiltInSectionDetails {
    name: b"",
    ty: object::elf::SHT_PROGBITS,
    section_flags: SectionFlags::empty(),
    min_alignment: alignment::MIN,
    element_size: 0,
    link: None,
    keep_if_empty: false,
};

const ALLOC: SectionFlags = shf::ALLOC;

const SECTION_DEFINITIONS: [BuiltInSectionDetails; NUM_BUILT_IN_SECTIONS] = [
    // FILE_HEADER
    BuiltInSectionDetails {
        ty: object::elf::SHT_NULL,
        section_flags: ALLOC,
        keep_if_empty: true,
        ..DEFAULT_DEFS
    },
    // PROGRAM_HEADERS
    BuiltInSectionDetails {
        ty: object::elf::SHT_NULL,
        section_flags: ALLOC,
        min_alignment: alignment::PROGRAM_HEADER_ENTRY,
        keep_if_empty: true,
        ..DEFAULT_DEFS
    },
    // INTERP
    BuiltInSectionDetails {
        name: b".interp",
        section_flags: ALLOC,
        ..DEFAULT_DEFS
    },
    // NOTE_GNU_BUILD_ID
    BuiltInSectionDetails {
        name: b".note.gnu.build-id",
        ty: object::elf::SHT_NOTE,
        section_flags: ALLOC,
        min_alignment: alignment::NOTE_GNU_BUILD_ID,
        ..DEFAULT_DEFS
    },
    // HASH
    BuiltInSectionDetails {
        name: b".hash",
        ty: object::elf::SHT_HASH,
        section_flags: ALLOC,
        min_alignment: alignment::SYSV_HASH,
        element_size: 4,
        link: Some(DYNSYM),
        ..DEFAULT_DEFS
    },
    // GNU_HASH
    BuiltInSectionDetails {
        name: b".gnu.hash",
        ty: object::elf::SHT_GNU_HASH,
        section_flags: ALLOC,
        min_alignment: alignment::GNU_HASH,
        link: Some(DYNSYM),
        ..DEFAULT_DEFS
    },
    // DYNSYM
    BuiltInSectionDetails {
        name: b".dynsym",
        ty: object::elf::SHT_DYNSYM,
        section_flags: ALLOC,
        min_alignment: alignment::SYMTAB_ENTRY,
        element_size: crate::elf::SYMTAB_ENTRY_SIZE,
        link: Some(DYNSTR),
        ..DEFAULT_DEFS
    },
    // DYNSTR
    BuiltInSectionDetails {
        name: b".dynstr",
        ty: object::elf::SHT_STRTAB,
        section_flags: ALLOC,
        ..DEFAULT_DEFS
    },
    // GNU_VERSION
    BuiltInSectionDetails {
        name: b".gnu.version",
        ty: object::elf::SHT_GNU_VERSYM,
        section_flags: ALLOC,
        min_alignment: alignment::VERSYM,
        element_size: crate::elf::VERSYM_ENTRY_SIZE,
        link: Some(DYNSYM),
        ..DEFAULT_DEFS
    },
    // GNU_VERSION_R
    BuiltInSectionDetails {
        name: b".gnu.version_r",
        ty: object::elf::SHT_GNU_VERNEED,
        section_flags: ALLOC,
        min_alignment: alignment::VERSION_R,
        link: Some(DYNSTR),
        ..DEFAULT_DEFS
    },
    // GNU_VERSION_D
    BuiltInSectionDetails {
        name: b".gnu.version_d",
        ty: object::elf::SHT_GNU_VERDEF,
        section_flags: ALLOC,
        min_alignment: alignment::VERSION_D,
        link: Some(DYNSTR),
        ..DEFAULT_DEFS
    },
    // RELA_DYN
    BuiltInSectionDetails {
        name: b".rela.dyn",
        ty: object::elf::SHT_RELA,
        section_flags: ALLOC,
        min_alignment: alignment::RELA_ENTRY,
        element_size: crate::elf::RELA_ENTRY_SIZE,
        link: Some(DYNSYM),
        ..DEFAULT_DEFS
    },
    // RELA_PLT
    BuiltInSectionDetails {
        name: b".rela.plt",
        ty: object::elf::SHT_RELA,
        section_flags: ALLOC,
        min_alignment: alignment::RELA_ENTRY,
        element_size: crate::elf::RELA_ENTRY_SIZE,
        link: Some(DYNSYM),
        ..DEFAULT_DEFS
    },
    // INIT
    BuiltInSectionDetails {
        name: b".init",
        section_flags: ALLOC.with(shf::EXECINSTR),
        min_alignment: Alignment { exponent: 2 },
        ..DEFAULT_DEFS
    },
    // PLT
    BuiltInSectionDetails {
        name: b".plt",
        section_flags: ALLOC.with(shf::EXECINSTR),
        min_alignment: alignment::PLT,
        element_size: crate::elf::PLT_ENTRY_SIZE,
        ..DEFAULT_DEFS
    },
    // TEXT
    BuiltInSectionDetails {
        name: b".text",
        section_flags: ALLOC.with(shf::EXECINSTR),
        min_alignment: Alignment { exponent: 2 },
        ..DEFAULT_DEFS
    },
    // FINI
    BuiltInSectionDetails {
        name: b".fini",
        section_flags: ALLOC.with(shf::EXECINSTR),
        min_alignment: Alignment { exponent: 2 },
        ..DEFAULT_DEFS
    },
    // RODATA
    BuiltInSectionDetails {
        name: b".rodata",
        section_flags: ALLOC,
        ..DEFAULT_DEFS
    },
    // EH_FRAME_HDR
    BuiltInSectionDetails {
        name: b".eh_frame_hdr",
        section_flags: ALLOC,
        min_alignment: alignment::EH_FRAME_HDR,
        ..DEFAULT_DEFS
    },
    // EH_FRAME
    BuiltInSectionDetails {
        name: b".eh_frame",
        section_flags: ALLOC,
        min_alignment: alignment::USIZE,
        ..DEFAULT_DEFS
    },
    // GCC_EXCEPT_TABLE
    BuiltInSectionDetails {
        name: b".gcc_except_table",
        section_flags: ALLOC,
        ..DEFAULT_DEFS
    },
    // TDATA
    BuiltInSectionDetails {
        name: b".tdata",
        section_flags: ALLOC.with(shf::WRITE).with(shf::TLS),
        ..DEFAULT_DEFS
    },
    // TBSS
    BuiltInSectionDetails {
        name: b".tbss",
        ty: object::elf::SHT_NOBITS,
        section_flags: ALLOC.with(shf::WRITE).with(shf::TLS),
        ..DEFAULT_DEFS
    },
    // PREINIT_ARRAY
    BuiltInSectionDetails {
        name: b".preinit_array",
        ty: object::elf::SHT_PREINIT_ARRAY,
        section_flags: ALLOC.with(shf::WRITE),
        min_alignment: alignment::USIZE,
        element_size: 8,
        ..DEFAULT_DEFS
    },
    // INIT_ARRAY
    BuiltInSectionDetails {
        name: b".init_array",
        ty: object::elf::SHT_INIT_ARRAY,
        section_flags: ALLOC.with(shf::WRITE),
        min_alignment: alignment::USIZE,
        element_size: 8,
        ..DEFAULT_DEFS
    },
    // FINI_ARRAY
    BuiltInSectionDetails {
        name: b".fini_array",
        ty: object::elf::SHT_FINI_ARRAY,
        section_flags: ALLOC.with(shf::WRITE),
        min_alignment: alignment::USIZE,
        element_size: 8,
        ..DEFAULT_DEFS
    },
    // DATA_REL_RO
    BuiltInSectionDetails {
        name: b".data.rel.ro",
        section_flags: ALLOC.with(shf::WRITE),
        min_alignment: alignment::USIZE,
        ..DEFAULT_DEFS
    },
    // DYNAMIC
    BuiltInSectionDetails {
        name: b".dynamic",
        ty: object::elf::SHT_DYNAMIC,
        section_flags: ALLOC.with(shf::WRITE),
        min_alignment: alignment::USIZE,
        element_size: size_of::<crate::elf::DynamicEntry>() as u64,
        link: Some(DYNSTR),
        ..DEFAULT_DEFS
    },
    // GOT
    BuiltInSectionDetails {
        name: b".got",
        section_flags: ALLOC.with(shf::WRITE),
        min_alignment: alignment::GOT_ENTRY,
        element_size: crate::elf::GOT_ENTRY_SIZE,
        ..DEFAULT_DEFS
    },
    // GOT_PLT
    BuiltInSectionDetails {
        name: b".got.plt",
        section_flags: ALLOC.with(shf::WRITE),
        min_alignment: alignment::GOT_ENTRY,
        element_size: crate::elf::GOT_ENTRY_SIZE,
        ..DEFAULT_DEFS
    },
    // DATA
    BuiltInSectionDetails {
        name: b".data",
        section_flags: ALLOC.with(shf::WRITE),
        ..DEFAULT_DEFS
    },
    // BSS
    BuiltInSectionDetails {
        name: b".bss",
        ty: object::elf::SHT_NOBITS,
        section_flags: ALLOC.with(shf::WRITE),
        ..DEFAULT_DEFS
    },
    // COMMENT
    BuiltInSectionDetails {
        name: b".comment",
        section_flags: SectionFlags::from_u32(object::elf::SHF_MERGE | object::elf::SHF_STRINGS),
        element_size: 1,
        ..DEFAULT_DEFS
    },
    // SYMTAB
    BuiltInSectionDetails {
        name: b".symtab",
        ty: object::elf::SHT_SYMTAB,
        min_alignment: alignment::SYMTAB_ENTRY,
        element_size: crate::elf::SYMTAB_ENTRY_SIZE,
        link: Some(STRTAB),
        ..DEFAULT_DEFS
    },
    // STRTAB
    BuiltInSectionDetails {
        name: b".strtab",
        ty: object::elf::SHT_STRTAB,
        ..DEFAULT_DEFS
    },
    // SHSTRTAB
    BuiltInSectionDetails {
        name: b".shstrtab",
        ty: object::elf::SHT_STRTAB,
        keep_if_empty: true,
        ..DEFAULT_DEFS
    },
];

/// Well-known input section name prefixes that map to built-in output
/// sections. Checked before falling back to a custom section.
const BUILT_IN_MAPPINGS: &[(&[u8], OutputSectionId)] = &[
    (b".text", TEXT),
    (b".init_array", INIT_ARRAY),
    (b".fini_array", FINI_ARRAY),
    (b".preinit_array", PREINIT_ARRAY),
    (b".ctors", INIT_ARRAY),
    (b".dtors", FINI_ARRAY),
    (b".init", INIT),
    (b".fini", FINI),
    (b".rodata", RODATA),
    (b".data.rel.ro", DATA_REL_RO),
    (b".data", DATA),
    (b".bss", BSS),
    (b".tdata", TDATA),
    (b".tbss", TBSS),
    (b".eh_frame_hdr", EH_FRAME_HDR),
    (b".eh_frame", EH_FRAME),
    (b".gcc_except_table", GCC_EXCEPT_TABLE),
    (b".comment", COMMENT),
    (b".got.plt", GOT_PLT),
    (b".got", GOT),
];

/// Matches `.name` or `.name.anything`, which is how -ffunction-sections
/// style names compose.
pub(crate) fn prefix_matches(section_name: &[u8], prefix: &[u8]) -> bool {
    section_name == prefix
        || (section_name.len() > prefix.len()
            && section_name.starts_with(prefix)
            && section_name[prefix.len()] == b'.')
}

#[derive(Debug, Clone)]
pub(crate) struct SectionOutputInfo<'data> {
    pub(crate) name: SectionName<'data>,
    pub(crate) ty: u32,
    pub(crate) section_flags: SectionFlags,
    pub(crate) element_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OrderEvent {
    SegmentStart(ProgramSegmentId),
    SegmentEnd(ProgramSegmentId),
    Section(OutputSectionId),
}

pub(crate) struct OutputSections<'data> {
    pub(crate) section_infos: Vec<SectionOutputInfo<'data>>,
    custom_by_name: HashMap<(SectionName<'data>, u32, u64), OutputSectionId>,
}

impl<'data> OutputSections<'data> {
    pub(crate) fn new() -> Self {
        let section_infos = SECTION_DEFINITIONS
            .iter()
            .map(|def| SectionOutputInfo {
                name: SectionName(def.name),
                ty: def.ty,
                section_flags: def.section_flags,
                element_size: def.element_size,
            })
            .collect();
        Self {
            section_infos,
            custom_by_name: HashMap::new(),
        }
    }

    pub(crate) fn num_sections(&self) -> usize {
        self.section_infos.len()
    }

    pub(crate) fn info(&self, id: OutputSectionId) -> &SectionOutputInfo<'data> {
        &self.section_infos[id.as_usize()]
    }

    pub(crate) fn name(&self, id: OutputSectionId) -> SectionName<'data> {
        self.info(id).name
    }

    pub(crate) fn section_flags(&self, id: OutputSectionId) -> SectionFlags {
        self.info(id).section_flags
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = OutputSectionId> {
        (0..self.num_sections()).map(OutputSectionId::from_usize)
    }

    /// Picks (creating if necessary) the output section for an input section
    /// with the given name, flags and type.
    pub(crate) fn output_section_for_input(
        &mut self,
        name: &'data [u8],
        section_flags: SectionFlags,
        ty: u32,
        element_size: u64,
    ) -> OutputSectionId {
        for (prefix, id) in BUILT_IN_MAPPINGS {
            if prefix_matches(name, prefix) {
                return *id;
            }
        }
        self.add_custom(SectionName(name), section_flags, ty, element_size)
    }

    pub(crate) fn add_custom(
        &mut self,
        name: SectionName<'data>,
        section_flags: SectionFlags,
        ty: u32,
        element_size: u64,
    ) -> OutputSectionId {
        // Distinct (name, flags, type) triples become distinct output
        // sections. Flags that only affect in-section processing (merge
        // bits and similar) don't split sections.
        let grouping_flags = section_flags.retained_for_grouping();
        let key = (name, ty, grouping_flags.raw());
        if let Some(&existing) = self.custom_by_name.get(&key) {
            return existing;
        }
        let id = OutputSectionId::from_usize(self.section_infos.len());
        self.section_infos.push(SectionOutputInfo {
            name,
            ty,
            section_flags: grouping_flags,
            element_size,
        });
        self.custom_by_name.insert(key, id);
        id
    }

    pub(crate) fn custom_name_to_id(&self, name: &[u8]) -> Option<OutputSectionId> {
        self.custom_by_name
            .iter()
            .find(|((n, _, _), _)| n.0 == name)
            .map(|(_, id)| *id)
    }

    /// Emits the canonical output order: section IDs interleaved with
    /// segment boundaries. Custom sections are slotted into the group
    /// matching their access flags.
    pub(crate) fn sections_and_segments_events(&self) -> Vec<OrderEvent> {
        use OrderEvent::SegmentEnd as End;
        use OrderEvent::SegmentStart as Start;
        let s = OrderEvent::Section;

        let mut ro_custom = Vec::new();
        let mut exec_custom = Vec::new();
        let mut data_custom = Vec::new();
        let mut bss_custom = Vec::new();
        let mut nonalloc_custom = Vec::new();
        for raw in NUM_BUILT_IN_SECTIONS..self.num_sections() {
            let id = OutputSectionId::from_usize(raw);
            let info = self.info(id);
            let flags = info.section_flags;
            if !flags.contains(shf::ALLOC) {
                nonalloc_custom.push(s(id));
            } else if flags.contains(shf::EXECINSTR) {
                exec_custom.push(s(id));
            } else if !flags.contains(shf::WRITE) {
                ro_custom.push(s(id));
            } else if info.ty == object::elf::SHT_NOBITS {
                bss_custom.push(s(id));
            } else {
                data_custom.push(s(id));
            }
        }

        let mut events = vec![
            Start(program_segments::LOAD_RO),
            s(FILE_HEADER),
            Start(program_segments::PHDR),
            s(PROGRAM_HEADERS),
            End(program_segments::PHDR),
            Start(program_segments::INTERP),
            s(INTERP),
            End(program_segments::INTERP),
            Start(program_segments::NOTE),
            s(NOTE_GNU_BUILD_ID),
            End(program_segments::NOTE),
            s(HASH),
            s(GNU_HASH),
            s(DYNSYM),
            s(DYNSTR),
            s(GNU_VERSION),
            s(GNU_VERSION_R),
            s(GNU_VERSION_D),
            s(RELA_DYN),
            s(RELA_PLT),
            s(RODATA),
        ];
        events.extend(ro_custom);
        events.extend([
            Start(program_segments::EH_FRAME_HDR),
            s(EH_FRAME_HDR),
            End(program_segments::EH_FRAME_HDR),
            s(EH_FRAME),
            s(GCC_EXCEPT_TABLE),
            End(program_segments::LOAD_RO),
            Start(program_segments::LOAD_EXEC),
            s(INIT),
            s(PLT),
            s(TEXT),
        ]);
        events.extend(exec_custom);
        events.extend([
            s(FINI),
            End(program_segments::LOAD_EXEC),
            Start(program_segments::LOAD_RW),
            Start(program_segments::GNU_RELRO),
            Start(program_segments::TLS),
            s(TDATA),
            s(TBSS),
            End(program_segments::TLS),
            s(PREINIT_ARRAY),
            s(INIT_ARRAY),
            s(FINI_ARRAY),
            s(DATA_REL_RO),
            Start(program_segments::DYNAMIC),
            s(DYNAMIC),
            End(program_segments::DYNAMIC),
            s(GOT),
            End(program_segments::GNU_RELRO),
            s(GOT_PLT),
            s(DATA),
        ]);
        events.extend(data_custom);
        events.push(s(BSS));
        events.extend(bss_custom);
        events.push(End(program_segments::LOAD_RW));
        events.push(s(COMMENT));
        events.extend(nonalloc_custom);
        events.extend([s(SYMTAB), s(STRTAB), s(SHSTRTAB)]);
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_ids_match_definitions() {
        assert_eq!(SECTION_DEFINITIONS.len(), NUM_BUILT_IN_SECTIONS);
        assert_eq!(TEXT.built_in_details().name, b".text");
        assert_eq!(GOT_PLT.built_in_details().name, b".got.plt");
        assert_eq!(SHSTRTAB.built_in_details().name, b".shstrtab");
    }

    #[test]
    fn test_every_section_appears_in_order_exactly_once() {
        let mut sections = OutputSections::new();
        sections.add_custom(
            SectionName(b".custom"),
            shf::ALLOC,
            object::elf::SHT_PROGBITS,
            0,
        );
        let mut seen = vec![false; sections.num_sections()];
        for event in sections.sections_and_segments_events() {
            if let OrderEvent::Section(id) = event {
                assert!(!seen[id.as_usize()], "section appears twice in order");
                seen[id.as_usize()] = true;
            }
        }
        assert!(seen.iter().all(|&s| s), "section missing from output order");
    }

    #[test]
    fn test_segments_properly_nested() {
        let sections = OutputSections::new();
        let mut load_segment = None;
        for event in sections.sections_and_segments_events() {
            match event {
                OrderEvent::SegmentStart(id) if id.is_load() => {
                    assert!(load_segment.is_none());
                    load_segment = Some(id);
                }
                OrderEvent::SegmentEnd(id) if id.is_load() => {
                    assert_eq!(load_segment, Some(id));
                    load_segment = None;
                }
                _ => {}
            }
        }
        assert!(load_segment.is_none());
    }

    #[test]
    fn test_input_name_mapping() {
        let mut sections = OutputSections::new();
        assert_eq!(
            sections.output_section_for_input(b".text.foo", shf::ALLOC, 1, 0),
            TEXT
        );
        assert_eq!(
            sections.output_section_for_input(b".textual", shf::ALLOC, 1, 0)
                == TEXT,
            false
        );
        assert_eq!(
            sections.output_section_for_input(b".data.rel.ro.local", shf::ALLOC, 1, 0),
            DATA_REL_RO
        );
        let custom1 = sections.output_section_for_input(b".mysec", shf::ALLOC, 1, 0);
        let custom2 = sections.output_section_for_input(b".mysec", shf::ALLOC, 1, 0);
        assert_eq!(custom1, custom2);
        assert!(custom1.as_usize() >= NUM_BUILT_IN_SECTIONS);
    }
}
