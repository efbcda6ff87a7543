//! The layout engine. Decides what goes where in the output file: which
//! symbols need GOT/PLT entries and dynamic relocations, how large every
//! synthetic chunk is, the virtual address and file offset of every output
//! section, and the final resolution (value, GOT address, PLT address) of
//! every symbol. Addresses depend on thunks and thunks depend on addresses,
//! so the address assignment runs as a bounded fixpoint.

use crate::alignment;
use crate::alignment::Alignment;
use crate::arch::Arch;
use crate::arch::TlsLayout;
use crate::args::Args;
use crate::args::BuildIdOption;
use crate::args::CompressionStyle;
use crate::args::OutputKind;
use crate::bail;
use crate::diagnostics::Diagnostics;
use crate::elf;
use crate::elf::shf;
use crate::error::Context as _;
use crate::error::Result;
use crate::input_data::FileId;
use crate::input_data::PRELUDE_FILE_ID;
use crate::input_data::ScriptInput;
use crate::linker_script::EvalContext;
use crate::output_section_id;
use crate::output_section_id::OrderEvent;
use crate::output_section_id::OutputSectionId;
use crate::output_section_id::OutputSections;
use crate::parsing::SymbolPlacement;
use crate::program_segments;
use crate::program_segments::ProgramSegmentId;
use crate::relocation::RelocationKind;
use crate::resolution::ResolutionOutputs;
use crate::resolution::Section;
use crate::resolution::SectionSlot;
use crate::string_merging::MergedStrings;
use crate::symbol::SymbolName;
use crate::symbol_db::FileEntry;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::value_flags::AtomicValueFlags;
use crate::value_flags::ValueFlags;
use object::LittleEndian;
use object::read::elf::Sym as _;
use rayon::iter::IntoParallelRefIterator as _;
use rayon::iter::ParallelIterator as _;

/// Maximum rounds of the address/thunk fixpoint. Two is typical; three
/// covers pathological growth.
const MAX_THUNK_ITERATIONS: usize = 3;

/// Reserved entries at the start of .got.plt: the address of .dynamic plus
/// two slots for the dynamic loader.
const GOT_PLT_RESERVED_ENTRIES: u64 = 3;

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct OutputRecordLayout {
    pub(crate) address: u64,
    pub(crate) file_offset: u64,
    pub(crate) mem_size: u64,
    pub(crate) file_size: u64,
    pub(crate) alignment: Alignment,

    /// Whether the section is present in the output at all.
    pub(crate) active: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SegmentLayout {
    pub(crate) address: u64,
    pub(crate) file_offset: u64,
    pub(crate) mem_size: u64,
    pub(crate) file_size: u64,
    pub(crate) alignment: Alignment,
    pub(crate) active: bool,
}

/// The final resolution of one (canonical) symbol.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SymbolResolution {
    pub(crate) value: u64,
    pub(crate) got_address: Option<u64>,
    pub(crate) tlsgd_got_address: Option<u64>,
    pub(crate) gottpoff_address: Option<u64>,
    pub(crate) tlsdesc_got_address: Option<u64>,
    pub(crate) plt_address: Option<u64>,
    pub(crate) value_flags: ValueFlags,

    /// Index in .dynsym, if exported or imported.
    pub(crate) dynsym_index: Option<u32>,
}

/// What one GOT slot holds and which dynamic relocation (if any) it needs.
#[derive(Debug, Clone, Copy)]
pub(crate) enum GotEntry {
    /// The symbol's address, fully known at link time (but still needing a
    /// RELATIVE relocation in position-independent output).
    Value(SymbolId),

    /// Filled in by the dynamic loader (GLOB_DAT).
    Dynamic(SymbolId),

    /// The address of an ifunc resolver, applied via IRELATIVE.
    IfuncResolver(SymbolId),

    /// TLS module ID: 1 for the executable, dynamic for shared output.
    TlsModule(SymbolId),

    /// Offset of the symbol within its module's TLS block.
    TlsOffset(SymbolId),

    /// TP-relative offset (initial-exec model).
    TpOff(SymbolId),

    /// First word of a TLS descriptor pair; always a TLSDESC dynamic
    /// relocation. The second word is zero.
    TlsDescriptor(SymbolId),

    Zero,
}

pub(crate) struct GotPlan {
    pub(crate) entries: Vec<GotEntry>,

    /// PLT entries in order; each has a .got.plt slot.
    pub(crate) plt_symbols: Vec<SymbolId>,

    /// Number of dynamic relocations contributed by GOT entries and copy
    /// relocations; section-relative entries come after these in .rela.dyn.
    pub(crate) num_planned_rela_dyn: u64,

    /// Per (object index, section index): the index in .rela.dyn where this
    /// section's relative relocations start.
    pub(crate) section_rela_dyn_start: hashbrown::HashMap<(usize, usize), u64>,

    pub(crate) total_rela_dyn: u64,

    /// Symbols that get a copy relocation, with their .bss offset and size.
    pub(crate) copy_relocations: Vec<(SymbolId, u64, u64)>,
}

pub(crate) struct DynSymEntry<'data> {
    pub(crate) symbol_id: SymbolId,
    pub(crate) name: &'data [u8],
    pub(crate) name_offset: u32,
    pub(crate) gnu_hash: u32,
    pub(crate) versym: u16,
}

pub(crate) struct VerneedLib<'data> {
    pub(crate) lib_name_offset: u32,
    pub(crate) versions: Vec<(&'data [u8], u32, u16)>, // (name, dynstr offset, index)
}

pub(crate) struct DynamicPlan<'data> {
    /// Entry 0 is the null symbol. Imports precede exports; exports are
    /// sorted by gnu-hash bucket so that .gnu.hash can index them.
    pub(crate) dynsyms: Vec<DynSymEntry<'data>>,

    /// Index of the first exported (defined) symbol; this is the gnu hash
    /// table's symbol offset.
    pub(crate) first_export_index: u32,

    pub(crate) dynstr: Vec<u8>,

    pub(crate) needed: Vec<u32>, // dynstr offsets of DT_NEEDED entries

    pub(crate) soname_offset: Option<u32>,
    pub(crate) runpath_offset: Option<u32>,

    pub(crate) gnu_hash_bucket_count: u32,
    pub(crate) gnu_hash_bloom_count: u32,

    pub(crate) verneed: Vec<VerneedLib<'data>>,
    pub(crate) verdef_names: Vec<(u32, Option<u16>)>, // (dynstr offset, parent)

    pub(crate) num_dynamic_entries: u64,
}

/// One symbol table entry planned for .symtab.
pub(crate) struct SymtabEntryPlan {
    pub(crate) symbol_id: SymbolId,
    pub(crate) name_offset: u32,
    pub(crate) value: u64,
    pub(crate) size: u64,
    pub(crate) info: u8,
    pub(crate) other: u8,
    pub(crate) output_section: Option<OutputSectionId>,
}

#[derive(Default)]
pub(crate) struct SymtabPlan {
    pub(crate) entries: Vec<SymtabEntryPlan>,
    pub(crate) num_locals: u32,
    pub(crate) strtab: Vec<u8>,

    /// Symtab index of each named symbol we emitted.
    pub(crate) index_by_symbol: hashbrown::HashMap<SymbolId, u32>,

    /// For relocatable output: the STT_SECTION symbol for each output
    /// section.
    pub(crate) section_symbol_indexes: hashbrown::HashMap<OutputSectionId, u32>,
}

/// One record planned from an input .eh_frame section.
pub(crate) enum EhFrameRecord {
    /// A CIE that the output keeps at the given output offset.
    Cie { input_offset: u64, output_offset: u64, size: u64 },

    /// A CIE that duplicated an earlier one; records map to the kept copy.
    DuplicateCie { output_offset: u64 },

    /// A kept FDE; `cie_output_offset` is where its (deduplicated) CIE went.
    Fde {
        input_offset: u64,
        output_offset: u64,
        size: u64,
        cie_output_offset: u64,
    },

    /// An FDE whose function was garbage-collected.
    DroppedFde,
}

#[derive(Default)]
pub(crate) struct EhFramePlan {
    /// Records per object, in section order.
    pub(crate) per_object: Vec<Vec<(object::SectionIndex, Vec<EhFrameRecord>)>>,

    pub(crate) total_size: u64,

    pub(crate) num_fdes: u32,
}

/// A range-extension thunk: a small stub placed at the end of an output
/// section that jumps to an out-of-range target.
pub(crate) struct Thunk {
    pub(crate) target: SymbolId,
    pub(crate) section_id: OutputSectionId,
    pub(crate) address: u64,
}

#[derive(Default)]
pub(crate) struct ThunkPlan {
    pub(crate) thunks: Vec<Thunk>,

    /// Lookup from (output section, target symbol) to thunk index.
    pub(crate) by_target: hashbrown::HashMap<(OutputSectionId, SymbolId), u32>,

    /// Extra bytes appended to each output section for thunks.
    pub(crate) extra_size: hashbrown::HashMap<OutputSectionId, u64>,
}

impl ThunkPlan {
    pub(crate) fn thunk_address(
        &self,
        section_id: OutputSectionId,
        target: SymbolId,
    ) -> Option<u64> {
        self.by_target
            .get(&(section_id, target))
            .map(|&i| self.thunks[i as usize].address)
    }
}

pub(crate) struct Layout<'data> {
    pub(crate) args: &'data Args,
    pub(crate) output_kind: OutputKind,
    pub(crate) symbol_db: SymbolDb<'data>,
    pub(crate) resolution: ResolutionOutputs<'data>,
    pub(crate) merged_strings: MergedStrings<'data>,
    pub(crate) output_sections: OutputSections<'data>,
    pub(crate) output_order: Vec<OrderEvent>,

    pub(crate) section_layouts: Vec<OutputRecordLayout>,
    pub(crate) segment_layouts: Vec<SegmentLayout>,

    pub(crate) resolutions: Vec<Option<SymbolResolution>>,

    pub(crate) got_plan: GotPlan,
    pub(crate) dynamic_plan: DynamicPlan<'data>,
    pub(crate) symtab_plan: SymtabPlan,
    pub(crate) eh_frame_plan: EhFramePlan,
    pub(crate) thunk_plan: ThunkPlan,

    pub(crate) tls: TlsLayout,
    pub(crate) entry_address: u64,
    pub(crate) merged_eflags: u32,
    pub(crate) file_size: u64,

    /// File offset of the section header table (after all section content).
    pub(crate) shdr_offset: u64,

    /// For relocatable output: per output section with relocations, its
    /// .rela section and the number of entries it holds.
    pub(crate) rela_sections: hashbrown::HashMap<OutputSectionId, (OutputSectionId, u64)>,

    /// Debug sections that were compressed for output: the finished bytes
    /// (compression header plus payload), ready to copy.
    pub(crate) compressed_debug: hashbrown::HashMap<OutputSectionId, Vec<u8>>,

    /// Section header string table contents and per-section name offsets.
    pub(crate) shstrtab: Vec<u8>,
    pub(crate) section_name_offsets: Vec<u32>,

    /// Output section header index per OutputSectionId (None if omitted).
    pub(crate) output_section_indexes: Vec<Option<u16>>,
    pub(crate) num_output_sections: u16,

    /// The build-id note's payload length.
    pub(crate) build_id_size: u64,
}

impl<'data> Layout<'data> {
    pub(crate) fn section_layout(&self, id: OutputSectionId) -> &OutputRecordLayout {
        &self.section_layouts[id.as_usize()]
    }

    pub(crate) fn tp_offset_base<A: Arch>(&self) -> u64 {
        A::tp_offset_start(self.tls)
    }

    pub(crate) fn got_base(&self) -> u64 {
        self.section_layout(output_section_id::GOT).address
    }
}

#[tracing::instrument(skip_all, name = "Layout")]
pub(crate) fn compute<'data, A: Arch>(
    symbol_db: SymbolDb<'data>,
    resolution: ResolutionOutputs<'data>,
    merged_strings: MergedStrings<'data>,
    mut output_sections: OutputSections<'data>,
    scripts: &[ScriptInput<'data>],
    diagnostics: &Diagnostics,
) -> Result<Layout<'data>> {
    let args = symbol_db.args;
    let output_kind = symbol_db.output_kind;

    // Pass 1: scan relocations of live sections, accumulating per-symbol
    // GOT/PLT/TLS requests and marking which shared objects are used.
    let per_symbol_flags = scan_relocations::<A>(&symbol_db, &resolution)?;
    let mut flags: Vec<ValueFlags> = per_symbol_flags
        .into_iter()
        .map(AtomicValueFlags::into_inner)
        .collect();
    apply_export_rules(&symbol_db, &mut flags);

    // Pass 2: plan the dynamic symbol table and GOT.
    let dynamic_plan = plan_dynamic(&symbol_db, &resolution, &flags, output_kind)?;
    let mut got_plan = plan_got(&symbol_db, &flags, output_kind);
    count_section_relative_relocations::<A>(
        &symbol_db,
        &resolution,
        &flags,
        output_kind,
        &mut got_plan,
    )?;

    // Pass 3: plan .eh_frame contents (CIE dedup, dead FDE pruning).
    let eh_frame_plan = plan_eh_frame(&symbol_db, &resolution)?;

    // Pass 4: plan .symtab.
    let symtab_plan = plan_symtab(&symbol_db, &resolution, &output_sections, args)?;

    // Relocatable output keeps relocations: one .rela section per output
    // section that has any.
    let rela_sections = if output_kind.is_relocatable_object() {
        plan_rela_sections(&symbol_db, &resolution, &mut output_sections)?
    } else {
        Default::default()
    };

    let merged_eflags = merge_eflags::<A>(&symbol_db, &resolution)?;

    let build_id_size = match &args.build_id {
        BuildIdOption::None => 0,
        BuildIdOption::Fast => 20,
        BuildIdOption::Uuid => 16,
        BuildIdOption::Hex(bytes) => bytes.len() as u64,
    };

    let mut layout = Layout {
        args,
        output_kind,
        symbol_db,
        resolution,
        merged_strings,
        output_order: output_sections.sections_and_segments_events(),
        output_sections,
        section_layouts: Vec::new(),
        segment_layouts: Vec::new(),
        resolutions: Vec::new(),
        got_plan,
        dynamic_plan,
        symtab_plan,
        eh_frame_plan,
        thunk_plan: ThunkPlan::default(),
        tls: TlsLayout::default(),
        entry_address: 0,
        merged_eflags,
        file_size: 0,
        shstrtab: Vec::new(),
        section_name_offsets: Vec::new(),
        output_section_indexes: Vec::new(),
        num_output_sections: 0,
        build_id_size,
        shdr_offset: 0,
        rela_sections,
        compressed_debug: Default::default(),
    };
    // Record the final per-symbol flags.
    for (i, symbol_flags) in flags.iter().enumerate() {
        layout.symbol_db.symbol_value_flags[i] |= *symbol_flags;
    }

    // Address assignment iterates with thunk creation until stable.
    let mut iteration = 0;
    loop {
        assign_section_contents(&mut layout)?;
        assign_addresses(&mut layout, scripts)?;
        iteration += 1;
        if layout.symbol_db.args.relocatable
            || A::MAX_BRANCH_DISPLACEMENT.is_none()
            || iteration >= MAX_THUNK_ITERATIONS
        {
            break;
        }
        compute_symbol_resolutions::<A>(&mut layout)?;
        if !create_thunks::<A>(&mut layout)? {
            break;
        }
    }

    // Two final passes: the second sees stable addresses, which is what
    // alias (--defsym) values and the symtab need.
    compute_symbol_resolutions::<A>(&mut layout)?;
    compute_symbol_resolutions::<A>(&mut layout)?;
    finalise_entry_address(&mut layout, diagnostics);

    // Debug sections carry no addresses, so their relocated contents can be
    // compressed now and only the file offsets of later non-alloc sections
    // move.
    if layout.args.compress_debug_sections != CompressionStyle::None
        && !layout.output_kind.is_relocatable_object()
        && crate::elf_writer::compress_debug_sections::<A>(&mut layout, diagnostics)?
    {
        assign_addresses(&mut layout, scripts)?;
    }

    check_script_assertions(&layout, scripts)?;

    Ok(layout)
}

/// Evaluates `ASSERT(expr, message)` commands once addresses are final.
fn check_script_assertions(layout: &Layout<'_>, scripts: &[ScriptInput<'_>]) -> Result {
    let end_address = layout
        .section_layouts
        .iter()
        .filter(|record| record.active)
        .map(|record| record.address + record.mem_size)
        .max()
        .unwrap_or(0);
    let lookup = |name: &str| {
        layout
            .symbol_db
            .lookup(&SymbolName::prehashed(name.as_bytes()))
            .map(|first| layout.symbol_db.definition(first))
            .and_then(|def| layout.resolutions.get(def.as_usize()))
            .and_then(|r| r.as_ref())
            .map(|r| r.value)
    };
    for script in scripts {
        for command in &script.script.commands {
            let crate::linker_script::Command::Assert {
                expression,
                message,
            } = command
            else {
                continue;
            };
            let value = expression.evaluate(&EvalContext {
                dot: end_address,
                lookup_symbol: &lookup,
            })?;
            if value == 0 {
                bail!("Linker script assertion failed: {message}");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Relocation scanning
// ---------------------------------------------------------------------------

fn scan_relocations<'data, A: Arch>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
) -> Result<Vec<AtomicValueFlags>> {
    let per_symbol_flags: Vec<AtomicValueFlags> = (0..symbol_db.num_symbols())
        .map(|i| AtomicValueFlags::new(symbol_db.value_flags(SymbolId::from_usize(i))))
        .collect();

    resolution
        .objects
        .par_iter()
        .try_for_each(|object| -> Result {
            if !object.is_loaded || object.is_dynamic {
                return Ok(());
            }
            let file = symbol_db.file(object.file_id);
            let parsed = file.object().expect("loaded object");
            for (section_index, slot) in object.sections.iter().enumerate() {
                let Some(section) = slot.as_loaded() else {
                    continue;
                };
                if !section.is_alive() && section.folded_into.is_none() {
                    continue;
                }
                if matches!(slot, SectionSlot::EhFrame(_)) {
                    continue;
                }
                let relocations = parsed
                    .object
                    .relocations(object::SectionIndex(section_index), &object.relocation_sections)?;
                let is_writable = section.flags.contains(shf::WRITE);
                for relocation in relocations.iter() {
                    let info = A::relocation_from_raw(relocation.r_type)?;
                    let id = file.symbol_id_range.input_to_id(relocation.symbol);
                    let canonical = symbol_db.definition(id);
                    let request = resolution_flags(info.kind);
                    let previous = per_symbol_flags[canonical.as_usize()].fetch_or(request);

                    // Local-dynamic TLS uses one shared (module, 0) GOT pair,
                    // tracked on the undefined symbol's slot.
                    if info.kind == RelocationKind::TlsLd {
                        per_symbol_flags[0].fetch_or(ValueFlags::GOT_TLS_MODULE);
                    }

                    // A direct data reference to a symbol in a shared object
                    // from non-writable memory needs a copy relocation.
                    if info.kind == RelocationKind::Absolute
                        && !is_writable
                        && previous.contains(ValueFlags::DYNAMIC)
                        && !previous.contains(ValueFlags::FUNCTION)
                        && symbol_db.output_kind.is_executable()
                    {
                        per_symbol_flags[canonical.as_usize()]
                            .fetch_or(ValueFlags::COPY_RELOCATION);
                    }
                }
            }
            Ok(())
        })?;

    Ok(per_symbol_flags)
}

/// Maps a relocation kind to the per-symbol requests it makes.
pub(crate) fn resolution_flags(kind: RelocationKind) -> ValueFlags {
    match kind {
        RelocationKind::PltRelative | RelocationKind::PltRelGotBase => {
            ValueFlags::PLT | ValueFlags::GOT
        }
        RelocationKind::GotRelative
        | RelocationKind::GotRelativePage
        | RelocationKind::GotPageOffset
        | RelocationKind::GotRelGotBase => ValueFlags::GOT,
        RelocationKind::GotTpOff
        | RelocationKind::GotTpOffPage
        | RelocationKind::GotTpOffPageOffset => ValueFlags::GOT_TLS_OFFSET,
        RelocationKind::TlsGd => ValueFlags::GOT_TLS_MODULE,
        RelocationKind::TlsLd => ValueFlags::empty(),
        RelocationKind::TlsDesc
        | RelocationKind::TlsDescPage
        | RelocationKind::TlsDescPageOffset => ValueFlags::GOT_TLS_DESCRIPTOR,
        RelocationKind::Absolute
        | RelocationKind::Relative
        | RelocationKind::RelativePage
        | RelocationKind::PageOffset
        | RelocationKind::SymRelGotBase => ValueFlags::DIRECT,
        RelocationKind::DtpOff | RelocationKind::TpOff => ValueFlags::DIRECT,
        RelocationKind::TlsDescCall | RelocationKind::None => ValueFlags::empty(),
    }
}

/// Applies export rules: which defined symbols appear in .dynsym.
fn apply_export_rules(symbol_db: &SymbolDb<'_>, flags: &mut [ValueFlags]) {
    let output_kind = symbol_db.output_kind;
    if !output_kind.needs_dynamic() {
        return;
    }
    let export_all = output_kind.is_shared_object() || symbol_db.args.export_all_dynamic_symbols;
    for file in &symbol_db.files {
        let FileEntry::Object(parsed) = &file.entry else {
            continue;
        };
        if parsed.is_dynamic {
            continue;
        }
        // --exclude-libs ALL: archive members don't export their symbols.
        if symbol_db.args.exclude_libs_all && parsed.is_optional {
            continue;
        }
        let e = LittleEndian;
        for (index, symbol) in parsed.object.symbols.enumerate() {
            if symbol.is_local() || symbol.is_undefined(e) {
                continue;
            }
            let id = file.symbol_id_range.input_to_id(index);
            if !symbol_db.is_canonical(id) {
                continue;
            }
            let slot = &mut flags[id.as_usize()];
            // The strictest visibility among all definitions of the name
            // decides; a hidden losing definition suppresses the export of
            // a default-visibility winner.
            if !slot.is_exportable() {
                continue;
            }
            if slot.contains(ValueFlags::DOWNGRADE_TO_LOCAL) {
                continue;
            }
            let name = symbol_db.symbol_name(id).ok();
            let in_export_list = name.as_ref().is_some_and(|n| {
                let prehashed = SymbolName::prehashed(n.bytes());
                symbol_db
                    .export_list
                    .classify(&prehashed)
                    .is_some_and(|c| !c.is_local)
            });
            let version_class = name.as_ref().and_then(|n| {
                symbol_db
                    .version_script
                    .classify(&SymbolName::prehashed(n.bytes()))
            });
            if let Some(class) = version_class {
                if class.is_local {
                    *slot |= ValueFlags::DOWNGRADE_TO_LOCAL | ValueFlags::CAN_BYPASS_GOT;
                    continue;
                }
            }
            if export_all || in_export_list {
                *slot |= ValueFlags::EXPORT_DYNAMIC;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Dynamic planning
// ---------------------------------------------------------------------------

fn gnu_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 5381;
    for &b in name {
        h = h.wrapping_mul(33).wrapping_add(u32::from(b));
    }
    h
}

fn plan_dynamic<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    flags: &[ValueFlags],
    output_kind: OutputKind,
) -> Result<DynamicPlan<'data>> {
    let mut plan = DynamicPlan {
        dynsyms: Vec::new(),
        first_export_index: 1,
        dynstr: vec![0],
        needed: Vec::new(),
        soname_offset: None,
        runpath_offset: None,
        gnu_hash_bucket_count: 1,
        gnu_hash_bloom_count: 1,
        verneed: Vec::new(),
        verdef_names: Vec::new(),
        num_dynamic_entries: 0,
    };
    if !output_kind.needs_dynamic() {
        return Ok(plan);
    }

    let mut add_string = |dynstr: &mut Vec<u8>, bytes: &[u8]| -> u32 {
        let offset = dynstr.len() as u32;
        dynstr.extend_from_slice(bytes);
        dynstr.push(0);
        offset
    };

    // The null symbol.
    plan.dynsyms.push(DynSymEntry {
        symbol_id: SymbolId::undefined(),
        name: b"",
        name_offset: 0,
        gnu_hash: 0,
        versym: 0,
    });

    // Imports: referenced symbols defined by used shared objects, plus
    // undefined symbols that remain (allowed in shared output).
    let mut imports: Vec<(SymbolId, &'data [u8], u16)> = Vec::new();
    let mut verneed_by_lib: hashbrown::HashMap<FileId, Vec<(&'data [u8], u16)>> =
        Default::default();
    let mut next_version_index: u16 = 2 + symbol_db.version_script.version_count() as u16;

    for object in resolution.objects.iter() {
        if !object.is_dynamic || !object.is_loaded {
            continue;
        }
        let file = symbol_db.file(object.file_id);
        let parsed = file.object().expect("object");
        let versions = parsed.object.version_names()?;
        let e = LittleEndian;
        let mut lib_used = false;
        for (index, symbol) in parsed.object.symbols.enumerate() {
            let id = file.symbol_id_range.input_to_id(index);
            if !symbol_db.is_canonical(id) || symbol.is_undefined(e) {
                continue;
            }
            let symbol_flags = flags[id.as_usize()];
            let referenced = symbol_flags.intersects(
                ValueFlags::DIRECT
                    | ValueFlags::GOT
                    | ValueFlags::PLT
                    | ValueFlags::GOT_TLS_MODULE
                    | ValueFlags::GOT_TLS_OFFSET
                    | ValueFlags::GOT_TLS_DESCRIPTOR
                    | ValueFlags::COPY_RELOCATION,
            );
            if !referenced {
                continue;
            }
            lib_used = true;
            let raw_name = parsed.object.symbol_name(symbol)?;
            let (name, _, _) = crate::symbol_db::split_version(raw_name);

            // Work out the version this import binds to.
            let mut versym = object::elf::VER_NDX_GLOBAL;
            if let Some(raw_versym) = parsed.object.versym.get(index.0) {
                let raw = raw_versym.0.get(e) & object::elf::VERSYM_VERSION;
                if raw > object::elf::VER_NDX_GLOBAL {
                    if let Some(Some(version_name)) = versions.get(raw as usize).copied() {
                        let lib_versions = verneed_by_lib.entry(object.file_id).or_default();
                        let index = match lib_versions
                            .iter()
                            .find(|(existing, _)| *existing == version_name)
                        {
                            Some((_, existing_index)) => *existing_index,
                            None => {
                                let new_index = next_version_index;
                                next_version_index += 1;
                                lib_versions.push((version_name, new_index));
                                new_index
                            }
                        };
                        versym = index;
                    }
                }
            }
            imports.push((id, name, versym));
        }
        let needed = lib_used || !parsed.modifiers.as_needed;
        if needed {
            let offset = add_string(&mut plan.dynstr, parsed.lib_name);
            plan.needed.push(offset);
        }
    }

    // Undefined symbols referenced from regular objects also land in dynsym
    // when producing a shared object.
    let mut undefined_imports: Vec<(SymbolId, &'data [u8], u16)> = Vec::new();
    if output_kind.is_shared_object() {
        for file in &symbol_db.files {
            let FileEntry::Object(parsed) = &file.entry else {
                continue;
            };
            if parsed.is_dynamic {
                continue;
            }
            let object_loaded = resolution.objects[file.file_id.as_usize() - 1].is_loaded;
            if !object_loaded {
                continue;
            }
            let e = LittleEndian;
            for (index, symbol) in parsed.object.symbols.enumerate() {
                if symbol.is_local() || !symbol.is_undefined(e) {
                    continue;
                }
                let id = file.symbol_id_range.input_to_id(index);
                // Still undefined after resolution?
                if symbol_db.definition(id) == id {
                    let name = parsed.object.symbol_name(symbol)?;
                    if !name.is_empty() {
                        undefined_imports.push((id, name, object::elf::VER_NDX_GLOBAL));
                    }
                }
            }
        }
    }

    // Exports: defined symbols flagged for the dynamic table.
    let mut exports: Vec<(SymbolId, &'data [u8])> = Vec::new();
    for file in &symbol_db.files {
        let FileEntry::Object(parsed) = &file.entry else {
            continue;
        };
        if parsed.is_dynamic {
            continue;
        }
        for id in file.symbol_id_range.iter() {
            if !symbol_db.is_canonical(id) {
                continue;
            }
            if !flags[id.as_usize()].contains(ValueFlags::EXPORT_DYNAMIC) {
                continue;
            }
            let Ok(name) = symbol_db.symbol_name(id) else {
                continue;
            };
            exports.push((id, name.bytes()));
        }
    }

    // Version definitions for shared output with a version script.
    if output_kind.is_shared_object() && symbol_db.version_script.version_count() > 0 {
        for (_, version) in symbol_db.version_script.versions() {
            let offset = add_string(&mut plan.dynstr, version.name());
            plan.verdef_names.push((offset, version.parent_index));
        }
    }

    // Dedup imports (a symbol may appear in several shared objects; the
    // canonical check above already keeps one).
    imports.extend(undefined_imports);
    imports.sort_by_key(|(id, _, _)| *id);
    imports.dedup_by_key(|(id, _, _)| *id);
    exports.sort_by_key(|(id, _)| *id);
    exports.dedup_by_key(|(id, _)| *id);

    // Size the gnu hash table and sort exports by bucket.
    let num_exports = exports.len();
    plan.gnu_hash_bucket_count = (num_exports.div_ceil(2) as u32).max(1);
    plan.gnu_hash_bloom_count = (num_exports.div_ceil(8) as u32).next_power_of_two();
    let bucket_count = plan.gnu_hash_bucket_count;
    let mut exports_with_hash: Vec<(SymbolId, &'data [u8], u32)> = exports
        .into_iter()
        .map(|(id, name)| (id, name, gnu_hash(name)))
        .collect();
    exports_with_hash.sort_by_key(|(id, _, hash)| (hash % bucket_count, *id));

    for (id, name, versym) in imports {
        let name_offset = add_string(&mut plan.dynstr, name);
        plan.dynsyms.push(DynSymEntry {
            symbol_id: id,
            name,
            name_offset,
            gnu_hash: 0,
            versym,
        });
    }
    plan.first_export_index = plan.dynsyms.len() as u32;

    for (id, name, hash) in exports_with_hash {
        let name_offset = add_string(&mut plan.dynstr, name);
        let versym = symbol_db
            .version_script
            .classify(&SymbolName::prehashed(name))
            .map(|c| c.version_index)
            .unwrap_or(object::elf::VER_NDX_GLOBAL);
        plan.dynsyms.push(DynSymEntry {
            symbol_id: id,
            name,
            name_offset,
            gnu_hash: hash,
            versym,
        });
    }

    // Library metadata.
    if let Some(soname) = &symbol_db.args.soname {
        plan.soname_offset = Some(add_string(&mut plan.dynstr, soname.as_bytes()));
    }
    if !symbol_db.args.rpaths.is_empty() {
        let joined = symbol_db.args.rpaths.join(":");
        plan.runpath_offset = Some(add_string(&mut plan.dynstr, joined.as_bytes()));
    }

    // Iterate libraries in file order so dynstr contents are deterministic.
    let mut verneed_list: Vec<(FileId, Vec<(&'data [u8], u16)>)> =
        verneed_by_lib.into_iter().collect();
    verneed_list.sort_by_key(|(file_id, _)| *file_id);
    plan.verneed = verneed_list
        .into_iter()
        .map(|(file_id, versions)| {
            let parsed = symbol_db.file(file_id).object().expect("object");
            let lib_name_offset = {
                let offset = plan.dynstr.len() as u32;
                plan.dynstr.extend_from_slice(parsed.lib_name);
                plan.dynstr.push(0);
                offset
            };
            VerneedLib {
                lib_name_offset,
                versions: versions
                    .into_iter()
                    .map(|(name, index)| {
                        let offset = plan.dynstr.len() as u32;
                        plan.dynstr.extend_from_slice(name);
                        plan.dynstr.push(0);
                        (name, offset, index)
                    })
                    .collect(),
            }
        })
        .collect();

    plan.num_dynamic_entries = count_dynamic_entries(symbol_db, &plan);

    Ok(plan)
}

/// The number of entries we'll write into .dynamic, including DT_NULL.
fn count_dynamic_entries(symbol_db: &SymbolDb<'_>, plan: &DynamicPlan<'_>) -> u64 {
    let args = symbol_db.args;
    let mut count = plan.needed.len() as u64;
    count += u64::from(plan.soname_offset.is_some());
    count += u64::from(plan.runpath_offset.is_some());
    // HASH-style tables.
    count += u64::from(args.hash_style.includes_sysv());
    count += u64::from(args.hash_style.includes_gnu());
    // STRTAB, STRSZ, SYMTAB, SYMENT.
    count += 4;
    // RELA, RELASZ, RELAENT + JMPREL/PLTRELSZ/PLTREL/PLTGOT.
    count += 3 + 4;
    // INIT_ARRAY(+SZ), FINI_ARRAY(+SZ).
    count += 4;
    // DEBUG for executables.
    count += u64::from(symbol_db.output_kind.is_executable());
    // FLAGS, FLAGS_1.
    count += 2;
    if !plan.verneed.is_empty() {
        count += 2; // VERNEED, VERNEEDNUM
    }
    if !plan.verdef_names.is_empty() {
        count += 2; // VERDEF, VERDEFNUM
    }
    if !plan.verneed.is_empty() || !plan.verdef_names.is_empty() {
        count += 1; // VERSYM
    }
    count += 1; // DT_NULL
    count
}

// ---------------------------------------------------------------------------
// GOT planning
// ---------------------------------------------------------------------------

fn plan_got<'data>(
    symbol_db: &SymbolDb<'data>,
    flags: &[ValueFlags],
    output_kind: OutputKind,
) -> GotPlan {
    let mut plan = GotPlan {
        entries: Vec::new(),
        plt_symbols: Vec::new(),
        num_planned_rela_dyn: 0,
        section_rela_dyn_start: Default::default(),
        total_rela_dyn: 0,
        copy_relocations: Vec::new(),
    };

    // Iterate symbols in ID order for determinism.
    for raw in 0..symbol_db.num_symbols() {
        let id = SymbolId::from_usize(raw);
        if !symbol_db.is_canonical(id) {
            continue;
        }
        let symbol_flags = flags[raw];
        let is_dynamic = symbol_flags.contains(ValueFlags::DYNAMIC)
            && !symbol_flags.contains(ValueFlags::COPY_RELOCATION);
        let is_ifunc = symbol_flags.contains(ValueFlags::IFUNC);

        if symbol_flags.contains(ValueFlags::GOT) {
            if is_ifunc {
                plan.entries.push(GotEntry::IfuncResolver(id));
            } else if is_dynamic {
                plan.entries.push(GotEntry::Dynamic(id));
            } else {
                plan.entries.push(GotEntry::Value(id));
            }
        }
        if symbol_flags.contains(ValueFlags::GOT_TLS_MODULE) {
            plan.entries.push(GotEntry::TlsModule(id));
            plan.entries.push(GotEntry::TlsOffset(id));
        }
        if symbol_flags.contains(ValueFlags::GOT_TLS_OFFSET) {
            plan.entries.push(GotEntry::TpOff(id));
        }
        if symbol_flags.contains(ValueFlags::GOT_TLS_DESCRIPTOR) {
            plan.entries.push(GotEntry::TlsDescriptor(id));
            plan.entries.push(GotEntry::Zero);
        }

        // PLT entries for calls that can't be direct.
        if symbol_flags.contains(ValueFlags::PLT)
            && (is_dynamic || is_ifunc || !symbol_flags.contains(ValueFlags::CAN_BYPASS_GOT))
        {
            plan.plt_symbols.push(id);
        }

        if symbol_flags.contains(ValueFlags::COPY_RELOCATION) {
            if let Some(size) = dynamic_symbol_size(symbol_db, id) {
                plan.copy_relocations.push((id, 0, size));
            }
        }
    }

    // The writer walks the same entry list and must emit exactly this many
    // dynamic relocations, so the per-entry decision lives in one place.
    plan.num_planned_rela_dyn = plan
        .entries
        .iter()
        .map(|entry| u64::from(got_entry_needs_dyn_reloc(entry, flags, output_kind)))
        .sum::<u64>()
        + plan.copy_relocations.len() as u64;
    plan.total_rela_dyn = plan.num_planned_rela_dyn;
    plan
}

/// Whether the supplied GOT entry requires a dynamic relocation. Shared
/// between planning (counting) and the writer (emission).
pub(crate) fn got_entry_needs_dyn_reloc(
    entry: &GotEntry,
    flags: &[ValueFlags],
    output_kind: OutputKind,
) -> bool {
    let is_pic = output_kind.is_position_independent();
    let symbol_is_dynamic = |id: &SymbolId| {
        let f = flags[id.as_usize()];
        f.contains(ValueFlags::DYNAMIC) && !f.contains(ValueFlags::COPY_RELOCATION)
    };
    match entry {
        GotEntry::Value(id) => {
            is_pic && !flags[id.as_usize()].contains(ValueFlags::ABSOLUTE)
        }
        GotEntry::Dynamic(_) | GotEntry::IfuncResolver(_) => true,
        GotEntry::TlsModule(id) => output_kind.is_shared_object() || symbol_is_dynamic(id),
        GotEntry::TlsOffset(id) => symbol_is_dynamic(id),
        GotEntry::TpOff(id) => symbol_is_dynamic(id) || output_kind.is_shared_object(),
        GotEntry::TlsDescriptor(id) => {
            !output_kind.is_static_executable() || symbol_is_dynamic(id)
        }
        GotEntry::Zero => false,
    }
}

fn dynamic_symbol_size(symbol_db: &SymbolDb<'_>, id: SymbolId) -> Option<u64> {
    let file = symbol_db.file(symbol_db.file_id_for_symbol(id));
    let parsed = file.object()?;
    let index = file.symbol_id_range.id_to_input(id);
    let symbol = parsed.object.symbol(index).ok()?;
    Some(symbol.st_size(LittleEndian))
}

/// Counts dynamic relocations that the writer will emit while copying
/// section contents (RELATIVE and symbolic entries for absolute
/// relocations in position-independent output), and reserves their slots.
fn count_section_relative_relocations<'data, A: Arch>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    flags: &[ValueFlags],
    output_kind: OutputKind,
    plan: &mut GotPlan,
) -> Result {
    let mut next = plan.num_planned_rela_dyn;
    for (object_index, object) in resolution.objects.iter().enumerate() {
        if !object.is_loaded || object.is_dynamic {
            continue;
        }
        let file = symbol_db.file(object.file_id);
        let parsed = file.object().expect("loaded");
        for (section_index, slot) in object.sections.iter().enumerate() {
            let Some(section) = slot.as_loaded() else {
                continue;
            };
            if !section.is_alive() || matches!(slot, SectionSlot::EhFrame(_)) {
                continue;
            }
            // Only allocated sections get dynamic relocations; debug info
            // is fixed up statically.
            if !section.flags.contains(shf::ALLOC) {
                continue;
            }
            let relocations = parsed
                .object
                .relocations(object::SectionIndex(section_index), &object.relocation_sections)?;
            let mut count = 0u64;
            for relocation in relocations.iter() {
                let info = A::relocation_from_raw(relocation.r_type)?;
                let id = file.symbol_id_range.input_to_id(relocation.symbol);
                let canonical = symbol_db.definition(id);
                if needs_dynamic_absolute_relocation(
                    output_kind,
                    &info,
                    flags[canonical.as_usize()],
                ) {
                    count += 1;
                }
            }
            if count > 0 {
                plan.section_rela_dyn_start
                    .insert((object_index, section_index), next);
                next += count;
            }
        }
    }
    plan.total_rela_dyn = next;
    Ok(())
}

/// Shared between layout counting and the writer: whether applying this
/// relocation also requires a dynamic relocation entry.
pub(crate) fn needs_dynamic_absolute_relocation(
    output_kind: OutputKind,
    info: &crate::relocation::RelocationKindInfo,
    value_flags: ValueFlags,
) -> bool {
    if info.kind != RelocationKind::Absolute {
        return false;
    }
    if !matches!(info.size, crate::relocation::RelocationSize::ByteSize(8)) {
        return false;
    }
    if value_flags.contains(ValueFlags::DYNAMIC)
        && !value_flags.contains(ValueFlags::COPY_RELOCATION)
    {
        return true;
    }
    output_kind.is_position_independent() && !value_flags.contains(ValueFlags::ABSOLUTE)
}

// ---------------------------------------------------------------------------
// .eh_frame planning
// ---------------------------------------------------------------------------

fn plan_eh_frame<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
) -> Result<EhFramePlan> {
    let mut plan = EhFramePlan::default();
    let mut output_offset = 0u64;
    // CIE dedup across all objects, keyed by the CIE's bytes.
    let mut cie_offsets: hashbrown::HashMap<Vec<u8>, u64> = Default::default();

    for object in &resolution.objects {
        let mut records_for_object = Vec::new();
        if object.is_loaded && !object.is_dynamic {
            let file = symbol_db.file(object.file_id);
            let parsed = file.object().expect("loaded");
            for (section_index, slot) in object.sections.iter().enumerate() {
                let SectionSlot::EhFrame(_) = slot else {
                    continue;
                };
                let section_index = object::SectionIndex(section_index);
                let header = parsed.object.section(section_index)?;
                let data = parsed.object.raw_section_data(header)?;
                let relocations = parsed
                    .object
                    .relocations(section_index, &object.relocation_sections)?;
                let records = plan_eh_frame_section(
                    symbol_db,
                    resolution,
                    object,
                    data,
                    &relocations,
                    &mut output_offset,
                    &mut cie_offsets,
                    &mut plan.num_fdes,
                )?;
                records_for_object.push((section_index, records));
            }
        }
        plan.per_object.push(records_for_object);
    }

    // Null terminator record, but only if there are any frames at all.
    plan.total_size = if output_offset > 0 {
        output_offset + 4
    } else {
        0
    };
    Ok(plan)
}

#[allow(clippy::too_many_arguments)]
fn plan_eh_frame_section<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    object: &crate::resolution::ResolvedObject<'data>,
    data: &'data [u8],
    relocations: &crate::elf::RelocationList<'data>,
    output_offset: &mut u64,
    cie_offsets: &mut hashbrown::HashMap<Vec<u8>, u64>,
    num_fdes: &mut u32,
) -> Result<Vec<EhFrameRecord>> {
    let file = symbol_db.file(object.file_id);
    let mut records = Vec::new();
    let mut offset = 0usize;
    let all_relocations: Vec<_> = relocations.iter().collect();
    // Map from input offset within this section to its planned CIE output
    // offset, for FDE CIE-pointer fixups.
    let mut local_cie_offsets: hashbrown::HashMap<u64, u64> = Default::default();

    while offset + 8 <= data.len() {
        let length = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap()) as usize;
        if length == 0 {
            break;
        }
        let record_size = length + 4;
        if offset + record_size > data.len() {
            bail!("Truncated .eh_frame record");
        }
        let cie_id = u32::from_le_bytes(data[offset + 4..offset + 8].try_into().unwrap());
        let record_bytes = &data[offset..offset + record_size];

        if cie_id == 0 {
            // A CIE. Content-keyed dedup: identical CIEs collapse. The key
            // includes the relocation structure so that CIEs with different
            // personality routines stay separate.
            let mut key = record_bytes.to_vec();
            for relocation in all_relocations.iter().filter(|r| {
                r.r_offset >= offset as u64 && r.r_offset < (offset + record_size) as u64
            }) {
                let id = file.symbol_id_range.input_to_id(relocation.symbol);
                let canonical = symbol_db.definition(id);
                key.extend_from_slice(&(relocation.r_offset - offset as u64).to_le_bytes());
                key.extend_from_slice(&relocation.r_type.to_le_bytes());
                key.extend_from_slice(&(canonical.as_usize() as u64).to_le_bytes());
                key.extend_from_slice(&relocation.addend.to_le_bytes());
            }
            match cie_offsets.entry(key) {
                hashbrown::hash_map::Entry::Occupied(entry) => {
                    local_cie_offsets.insert(offset as u64, *entry.get());
                    records.push(EhFrameRecord::DuplicateCie {
                        output_offset: *entry.get(),
                    });
                }
                hashbrown::hash_map::Entry::Vacant(entry) => {
                    entry.insert(*output_offset);
                    local_cie_offsets.insert(offset as u64, *output_offset);
                    records.push(EhFrameRecord::Cie {
                        input_offset: offset as u64,
                        output_offset: *output_offset,
                        size: record_size as u64,
                    });
                    *output_offset += record_size as u64;
                }
            }
        } else {
            // An FDE. Find the relocation that provides pc_begin; the FDE is
            // dead if the function's section was collected.
            let pc_begin_offset = (offset + crate::elf::FDE_PC_BEGIN_OFFSET) as u64;
            let target_alive = all_relocations
                .iter()
                .find(|r| r.r_offset == pc_begin_offset)
                .map(|r| {
                    let id = file.symbol_id_range.input_to_id(r.symbol);
                    symbol_target_section_alive(symbol_db, resolution, id)
                })
                .unwrap_or(true);
            if target_alive {
                let cie_input_offset = offset as u64 + 4 - u64::from(cie_id);
                let cie_output_offset = local_cie_offsets
                    .get(&cie_input_offset)
                    .copied()
                    .context("FDE references a CIE we didn't see")?;
                records.push(EhFrameRecord::Fde {
                    input_offset: offset as u64,
                    output_offset: *output_offset,
                    size: record_size as u64,
                    cie_output_offset,
                });
                *output_offset += record_size as u64;
                *num_fdes += 1;
            } else {
                records.push(EhFrameRecord::DroppedFde);
            }
        }
        offset += record_size;
    }
    Ok(records)
}

fn symbol_target_section_alive(
    symbol_db: &SymbolDb<'_>,
    resolution: &ResolutionOutputs<'_>,
    id: SymbolId,
) -> bool {
    let definition = symbol_db.definition(id);
    let file_id = symbol_db.file_id_for_symbol(definition);
    if file_id == PRELUDE_FILE_ID {
        return true;
    }
    let object = &resolution.objects[file_id.as_usize() - 1];
    if object.is_dynamic {
        return true;
    }
    let file = symbol_db.file(file_id);
    let Some(parsed) = file.object() else {
        return true;
    };
    let index = file.symbol_id_range.id_to_input(definition);
    let Ok(symbol) = parsed.object.symbol(index) else {
        return true;
    };
    let Ok(Some(section_index)) = parsed.object.symbol_section(symbol, index) else {
        return true;
    };
    match object.sections.get(section_index.0) {
        Some(slot) => slot.as_loaded().is_none_or(|s| s.is_alive()),
        None => true,
    }
}

// ---------------------------------------------------------------------------
// .symtab planning
// ---------------------------------------------------------------------------

fn plan_symtab<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    output_sections: &OutputSections<'data>,
    args: &Args,
) -> Result<SymtabPlan> {
    let mut plan = SymtabPlan::default();
    if args.strip == crate::args::Strip::All && !args.relocatable {
        return Ok(plan);
    }
    plan.strtab.push(0);
    // The null symbol.
    plan.entries.push(SymtabEntryPlan {
        symbol_id: SymbolId::undefined(),
        name_offset: 0,
        value: 0,
        size: 0,
        info: 0,
        other: 0,
        output_section: None,
    });

    // Relocatable output needs a section symbol per output section so that
    // the rewritten relocations have something section-relative to target.
    if args.relocatable {
        for id in output_sections.ids() {
            if output_sections.name(id).0.is_empty() {
                continue;
            }
            plan.section_symbol_indexes
                .insert(id, plan.entries.len() as u32);
            plan.entries.push(SymtabEntryPlan {
                symbol_id: SymbolId::undefined(),
                name_offset: 0,
                value: 0,
                size: 0,
                info: object::elf::STT_SECTION,
                other: 0,
                output_section: Some(id),
            });
        }
    }

    let e = LittleEndian;
    // Locals first (required by ELF), then globals, both in file order.
    for &locals in &[true, false] {
        for object in &resolution.objects {
            if !object.is_loaded || object.is_dynamic {
                continue;
            }
            let file = symbol_db.file(object.file_id);
            let parsed = file.object().expect("loaded");
            for (index, symbol) in parsed.object.symbols.enumerate() {
                if symbol.is_local() != locals {
                    continue;
                }
                if index.0 == 0 {
                    continue;
                }
                let st_type = symbol.st_type();
                if st_type == object::elf::STT_SECTION || st_type == object::elf::STT_FILE {
                    continue;
                }
                let id = file.symbol_id_range.input_to_id(index);
                if !locals && !symbol_db.is_canonical(id) {
                    continue;
                }
                let name = parsed.object.symbol_name(symbol)?;
                if name.is_empty() {
                    continue;
                }
                // Skip symbols in dead or discarded sections. Folded
                // sections keep their symbols; they resolve to the
                // representative's addresses.
                let mut output_section = None;
                if let Some(section_index) = parsed.object.symbol_section(symbol, index)? {
                    match object.sections.get(section_index.0) {
                        Some(slot) => match slot.as_loaded() {
                            Some(section)
                                if section.is_alive() || section.folded_into.is_some() =>
                            {
                                output_section = Some(section.output_section);
                            }
                            Some(_) => continue,
                            None => match &object.sections[section_index.0] {
                                SectionSlot::MergeStrings(merge) => {
                                    output_section = Some(merge.output_section);
                                }
                                _ => continue,
                            },
                        },
                        None => continue,
                    }
                } else if symbol.is_undefined(e) && !locals {
                    // Keep undefined globals; their value stays 0.
                }
                let name_offset = plan.strtab.len() as u32;
                plan.strtab.extend_from_slice(name);
                plan.strtab.push(0);
                plan.index_by_symbol.insert(id, plan.entries.len() as u32);
                plan.entries.push(SymtabEntryPlan {
                    symbol_id: id,
                    name_offset,
                    value: 0, // filled in during resolution finalisation
                    size: symbol.st_size(e),
                    info: symbol.st_info(),
                    other: symbol.st_other(),
                    output_section,
                });
                if locals {
                    plan.num_locals += 1;
                }
            }
        }
    }
    // Linker-defined symbols that the user asked for by name (--defsym,
    // PROVIDE) show up in the symbol table too.
    if let Some(prelude) = symbol_db.files[0].prelude() {
        let range = symbol_db.files[0].symbol_id_range;
        for (offset, def) in prelude.symbol_definitions.iter().enumerate() {
            if !matches!(
                def.placement,
                crate::parsing::SymbolPlacement::Absolute(_)
                    | crate::parsing::SymbolPlacement::Alias(..)
                    | crate::parsing::SymbolPlacement::Provide(_)
            ) {
                continue;
            }
            let id = range.offset_to_id(offset);
            if !symbol_db.is_canonical(id) {
                continue;
            }
            let name_offset = plan.strtab.len() as u32;
            plan.strtab.extend_from_slice(def.name);
            plan.strtab.push(0);
            plan.index_by_symbol.insert(id, plan.entries.len() as u32);
            plan.entries.push(SymtabEntryPlan {
                symbol_id: id,
                name_offset,
                value: 0,
                size: 0,
                info: (object::elf::STB_GLOBAL << 4) | object::elf::STT_NOTYPE,
                other: 0,
                output_section: None,
            });
        }
    }

    plan.num_locals += 1 + plan.section_symbol_indexes.len() as u32; // + null
    Ok(plan)
}

/// For `-r` output: creates a `.rela<name>` section for every output
/// section that has relocations from live input sections.
fn plan_rela_sections<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    output_sections: &mut OutputSections<'data>,
) -> Result<hashbrown::HashMap<OutputSectionId, (OutputSectionId, u64)>> {
    let mut counts: hashbrown::HashMap<OutputSectionId, u64> = Default::default();
    for object in &resolution.objects {
        if !object.is_loaded || object.is_dynamic {
            continue;
        }
        let file = symbol_db.file(object.file_id);
        let parsed = file.object().expect("loaded");
        for (section_index, slot) in object.sections.iter().enumerate() {
            let Some(section) = slot.as_loaded() else {
                continue;
            };
            if !section.is_alive() {
                continue;
            }
            let relocations = parsed
                .object
                .relocations(object::SectionIndex(section_index), &object.relocation_sections)?;
            if !relocations.is_empty() {
                *counts.entry(section.output_section).or_default() += relocations.len() as u64;
            }
        }
    }
    let mut out = hashbrown::HashMap::new();
    let mut targets: Vec<(OutputSectionId, u64)> = counts.into_iter().collect();
    targets.sort_by_key(|(id, _)| *id);
    for (target, count) in targets {
        let target_name = output_sections.name(target);
        // The name has to outlive the layout; a handful of section names
        // leaked once per link is fine.
        let rela_name: &'data [u8] =
            Box::leak([b".rela", target_name.0].concat().into_boxed_slice());
        let rela_id = output_sections.add_custom(
            crate::output_section_id::SectionName(rela_name),
            crate::elf::SectionFlags::empty(),
            object::elf::SHT_RELA,
            elf::RELA_ENTRY_SIZE,
        );
        out.insert(target, (rela_id, count));
    }
    Ok(out)
}

fn merge_eflags<'data, A: Arch>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
) -> Result<u32> {
    let eflags: Vec<u32> = resolution
        .objects
        .iter()
        .filter(|o| o.is_loaded && !o.is_dynamic)
        .map(|o| {
            symbol_db
                .file(o.file_id)
                .object()
                .map(|parsed| parsed.object.eflags)
                .unwrap_or(0)
        })
        .collect();
    A::merge_eflags(&eflags)
}

// ---------------------------------------------------------------------------
// Section content assignment (sizes and intra-section offsets)
// ---------------------------------------------------------------------------

fn assign_section_contents(layout: &mut Layout<'_>) -> Result {
    let num_sections = layout.output_sections.num_sections();
    let mut sizes = vec![0u64; num_sections];
    let mut alignments: Vec<Alignment> = (0..num_sections)
        .map(|raw| {
            let id = OutputSectionId::from_usize(raw);
            if raw < output_section_id::NUM_BUILT_IN_SECTIONS {
                id.built_in_details().min_alignment
            } else {
                alignment::MIN
            }
        })
        .collect();

    // Merged strings go first within their output section.
    for raw in 0..num_sections {
        let id = OutputSectionId::from_usize(raw);
        sizes[raw] = layout.merged_strings.section_size(id);
        if let Some(alignment) = layout.merged_strings.section_alignment(id) {
            alignments[raw] = alignments[raw].merge(alignment);
        }
    }

    // Then regular input sections in (file, section) order.
    for object in &mut layout.resolution.objects {
        if !object.is_loaded || object.is_dynamic {
            continue;
        }
        for slot in &mut object.sections {
            let is_eh_frame = matches!(slot, SectionSlot::EhFrame(_));
            let Some(section) = slot.as_loaded_mut() else {
                continue;
            };
            if is_eh_frame || !section.is_alive() {
                continue;
            }
            let raw = section.output_section.as_usize();
            alignments[raw] = alignments[raw].merge(section.alignment);
            let offset = section.alignment.align_up(sizes[raw]);
            section.output_offset = offset;
            sizes[raw] = offset + section.size;
        }
    }

    // Commons and copy-relocated symbols are appended to .bss.
    {
        let bss = output_section_id::BSS.as_usize();
        let mut commons: Vec<(SymbolId, crate::resolution::CommonSymbol)> = layout
            .resolution
            .commons
            .iter()
            .map(|(&id, &common)| (id, common))
            .collect();
        commons.sort_by_key(|(id, _)| *id);
        let commons_base = alignment::USIZE.align_up(sizes[bss]);
        let mut cursor = commons_base;
        for (id, common) in commons {
            alignments[bss] = alignments[bss].merge(common.alignment);
            cursor = common.alignment.align_up(cursor);
            layout
                .resolution
                .commons
                .insert(id, crate::resolution::CommonSymbol { offset: cursor, ..common });
            cursor += common.size;
        }
        let mut copy_cursor = alignment::USIZE.align_up(cursor);
        for entry in &mut layout.got_plan.copy_relocations {
            entry.1 = copy_cursor;
            copy_cursor += entry.2.max(1).next_multiple_of(8);
        }
        sizes[bss] = copy_cursor;
    }

    // Synthetic chunk sizes.
    let set = |sizes: &mut Vec<u64>, id: OutputSectionId, size: u64| {
        sizes[id.as_usize()] = size;
    };
    use output_section_id as osid;
    let args = layout.args;
    let needs_dynamic = layout.output_kind.needs_dynamic() && !args.relocatable;

    set(&mut sizes, osid::FILE_HEADER, u64::from(elf::FILE_HEADER_SIZE));
    let num_segments = active_segment_estimate(layout);
    set(
        &mut sizes,
        osid::PROGRAM_HEADERS,
        num_segments * u64::from(elf::PROGRAM_HEADER_SIZE),
    );
    if layout.output_kind.is_relocatable_object() {
        set(&mut sizes, osid::FILE_HEADER, u64::from(elf::FILE_HEADER_SIZE));
        set(&mut sizes, osid::PROGRAM_HEADERS, 0);
    }

    let interp_needed = matches!(
        layout.output_kind,
        OutputKind::DynamicExecutable(_)
    );
    if interp_needed {
        let path = args
            .dynamic_linker
            .as_deref()
            .map(|p| p.as_os_str().len() + 1)
            .unwrap_or_else(|| args.arch.default_dynamic_linker().len() + 1);
        set(&mut sizes, osid::INTERP, path as u64);
    }

    if layout.build_id_size > 0 {
        // Note header + "GNU\0" + payload.
        set(
            &mut sizes,
            osid::NOTE_GNU_BUILD_ID,
            size_of::<elf::NoteHeader>() as u64 + 4 + layout.build_id_size,
        );
    }

    let num_dynsyms = layout.dynamic_plan.dynsyms.len() as u64;
    if needs_dynamic {
        set(&mut sizes, osid::DYNSYM, num_dynsyms * elf::SYMTAB_ENTRY_SIZE);
        set(
            &mut sizes,
            osid::DYNSTR,
            layout.dynamic_plan.dynstr.len() as u64,
        );
        if args.hash_style.includes_sysv() {
            // nbucket + nchain + buckets + chains
            let nbucket = num_dynsyms.max(1);
            set(&mut sizes, osid::HASH, 4 * (2 + nbucket + num_dynsyms));
        }
        if args.hash_style.includes_gnu() {
            let num_exports =
                num_dynsyms - u64::from(layout.dynamic_plan.first_export_index);
            set(
                &mut sizes,
                osid::GNU_HASH,
                16 + u64::from(layout.dynamic_plan.gnu_hash_bloom_count) * 8
                    + u64::from(layout.dynamic_plan.gnu_hash_bucket_count) * 4
                    + num_exports * 4,
            );
        }
        let has_versions = !layout.dynamic_plan.verneed.is_empty()
            || !layout.dynamic_plan.verdef_names.is_empty();
        if has_versions {
            set(
                &mut sizes,
                osid::GNU_VERSION,
                num_dynsyms * elf::VERSYM_ENTRY_SIZE,
            );
        }
        if !layout.dynamic_plan.verneed.is_empty() {
            let total: u64 = layout
                .dynamic_plan
                .verneed
                .iter()
                .map(|lib| {
                    size_of::<elf::Verneed>() as u64
                        + lib.versions.len() as u64 * size_of::<elf::Vernaux>() as u64
                })
                .sum();
            set(&mut sizes, osid::GNU_VERSION_R, total);
        }
        if !layout.dynamic_plan.verdef_names.is_empty() {
            // Base version plus named versions, one aux each.
            let count = layout.dynamic_plan.verdef_names.len() as u64 + 1;
            set(
                &mut sizes,
                osid::GNU_VERSION_D,
                count * (size_of::<elf::Verdef>() as u64 + size_of::<elf::Verdaux>() as u64),
            );
        }
        set(
            &mut sizes,
            osid::RELA_DYN,
            layout.got_plan.total_rela_dyn * elf::RELA_ENTRY_SIZE,
        );
        set(
            &mut sizes,
            osid::RELA_PLT,
            layout.got_plan.plt_symbols.len() as u64 * elf::RELA_ENTRY_SIZE,
        );
        set(
            &mut sizes,
            osid::DYNAMIC,
            layout.dynamic_plan.num_dynamic_entries * size_of::<elf::DynamicEntry>() as u64,
        );
    }

    if !layout.output_kind.is_relocatable_object() {
        set(
            &mut sizes,
            osid::GOT,
            (1 + layout.got_plan.entries.len() as u64) * elf::GOT_ENTRY_SIZE,
        );
        let num_plt = layout.got_plan.plt_symbols.len() as u64;
        if num_plt > 0 {
            set(&mut sizes, osid::PLT, num_plt * elf::PLT_ENTRY_SIZE);
            set(
                &mut sizes,
                osid::GOT_PLT,
                (GOT_PLT_RESERVED_ENTRIES + num_plt) * elf::GOT_ENTRY_SIZE,
            );
        }
        sizes[osid::EH_FRAME.as_usize()] = layout.eh_frame_plan.total_size;
        if args.should_write_eh_frame_hdr && layout.eh_frame_plan.num_fdes > 0 {
            set(
                &mut sizes,
                osid::EH_FRAME_HDR,
                elf::EH_FRAME_HDR_SIZE
                    + u64::from(layout.eh_frame_plan.num_fdes) * elf::EH_FRAME_HDR_ENTRY_SIZE,
            );
        }
    }

    set(
        &mut sizes,
        osid::SYMTAB,
        layout.symtab_plan.entries.len() as u64 * elf::SYMTAB_ENTRY_SIZE,
    );
    set(
        &mut sizes,
        osid::STRTAB,
        layout.symtab_plan.strtab.len() as u64,
    );

    // Relocatable output: the .rela sections we planned.
    for &(rela_id, count) in layout.rela_sections.values() {
        sizes[rela_id.as_usize()] = count * elf::RELA_ENTRY_SIZE;
    }

    // Thunks appended from a previous iteration.
    for (&section_id, &extra) in &layout.thunk_plan.extra_size {
        sizes[section_id.as_usize()] += extra;
    }

    // shstrtab: names of all non-empty sections.
    let mut shstrtab = vec![0u8];
    let mut name_offsets = vec![0u32; num_sections];
    let mut output_section_indexes = vec![None; num_sections];
    let mut next_index: u16 = 1; // section 0 is the null section
    for event in &layout.output_order {
        let OrderEvent::Section(id) = event else {
            continue;
        };
        let raw = id.as_usize();
        let keep_if_empty = raw < output_section_id::NUM_BUILT_IN_SECTIONS
            && id.built_in_details().keep_if_empty;
        let has_name = !layout.output_sections.name(*id).0.is_empty();
        if sizes[raw] == 0 && !keep_if_empty {
            continue;
        }
        if *id == output_section_id::FILE_HEADER || *id == output_section_id::PROGRAM_HEADERS {
            // Headers aren't sections in the section header table.
            continue;
        }
        if has_name {
            name_offsets[raw] = shstrtab.len() as u32;
            shstrtab.extend_from_slice(layout.output_sections.name(*id).0);
            shstrtab.push(0);
        }
        output_section_indexes[raw] = Some(next_index);
        next_index += 1;
    }
    sizes[osid::SHSTRTAB.as_usize()] = shstrtab.len() as u64;
    // Adding the shstrtab name itself may have changed the size; it was
    // already added above as part of the order walk.

    layout.shstrtab = shstrtab;
    layout.section_name_offsets = name_offsets;
    layout.output_section_indexes = output_section_indexes;
    layout.num_output_sections = next_index;

    layout.section_layouts = sizes
        .iter()
        .zip(&alignments)
        .enumerate()
        .map(|(raw, (&size, &alignment))| {
            let id = OutputSectionId::from_usize(raw);
            let keep_if_empty = raw < output_section_id::NUM_BUILT_IN_SECTIONS
                && id.built_in_details().keep_if_empty;
            OutputRecordLayout {
                address: 0,
                file_offset: 0,
                mem_size: size,
                file_size: size,
                alignment,
                active: size > 0 || keep_if_empty,
            }
        })
        .collect();
    Ok(())
}

/// An upper bound on the number of program headers, used to size the phdr
/// table before we know exactly which segments are active.
fn active_segment_estimate(layout: &Layout<'_>) -> u64 {
    let _ = layout;
    program_segments::NUM_SEGMENTS as u64 + 1
}

// ---------------------------------------------------------------------------
// Address assignment
// ---------------------------------------------------------------------------

fn assign_addresses(layout: &mut Layout<'_>, scripts: &[ScriptInput<'_>]) -> Result {
    let page = layout.args.max_page_size;
    let base_address = layout.output_kind.base_address();

    // Collect script-driven address overrides keyed by output section name.
    let mut address_overrides: Vec<(&[u8], &crate::linker_script::Expression)> = Vec::new();
    for script in scripts {
        for rule in script.script.section_rules().into_iter().flatten() {
            if let Some(expression) = &rule.address {
                address_overrides.push((rule.output_name.as_bytes(), expression));
            }
        }
    }

    let mut dot = base_address;
    let mut file_offset = 0u64;
    let mut segments = vec![SegmentLayout::default(); program_segments::NUM_SEGMENTS];
    let mut segment_stack: Vec<ProgramSegmentId> = Vec::new();
    let is_relocatable_object = layout.output_kind.is_relocatable_object();

    for event_index in 0..layout.output_order.len() {
        let event = layout.output_order[event_index];
        match event {
            OrderEvent::SegmentStart(segment_id) => {
                if is_relocatable_object {
                    continue;
                }
                if segment_id.is_load() {
                    // Separate load segments must start on separate pages.
                    dot = page.align_up(dot);
                }
                segment_stack.push(segment_id);
                let segment = &mut segments[segment_id.as_usize()];
                segment.address = dot;
                segment.file_offset = u64::MAX; // set at first section
                segment.alignment = segment_id.def().min_alignment;
            }
            OrderEvent::SegmentEnd(segment_id) => {
                if is_relocatable_object {
                    continue;
                }
                segment_stack.pop();
                let segment = &mut segments[segment_id.as_usize()];
                if segment.file_offset == u64::MAX {
                    segment.file_offset = file_offset;
                    segment.address = dot;
                }
                segment.mem_size = dot.saturating_sub(segment.address);
                segment.file_size = file_offset.saturating_sub(segment.file_offset);
                segment.active = segment.mem_size > 0
                    || segment_id == program_segments::GNU_STACK;
            }
            OrderEvent::Section(id) => {
                let info_name = layout.output_sections.name(id);
                let record = &mut layout.section_layouts[id.as_usize()];
                if !record.active {
                    continue;
                }
                let is_alloc = layout
                    .output_sections
                    .section_flags(id)
                    .contains(shf::ALLOC)
                    && !is_relocatable_object;
                let is_nobits = layout.output_sections.info(id).ty == object::elf::SHT_NOBITS;

                if is_alloc {
                    for (name, expression) in &address_overrides {
                        if *name == info_name.0 {
                            let lookup = |_: &str| None;
                            dot = expression
                                .evaluate(&EvalContext {
                                    dot,
                                    lookup_symbol: &lookup,
                                })
                                .context("Failed to evaluate section address")?;
                        }
                    }
                    dot = record.alignment.align_up(dot);
                    // File offsets must be congruent to addresses modulo the
                    // page size.
                    if !is_nobits {
                        let needed = dot & page.mask();
                        let current = file_offset & page.mask();
                        if needed != current {
                            file_offset += (needed + page.value() - current) & page.mask();
                        }
                    }
                    record.address = dot;
                    record.file_offset = file_offset;
                    if is_nobits {
                        record.file_size = 0;
                    }
                    dot += record.mem_size;
                    file_offset += record.file_size;

                    for &segment_id in &segment_stack {
                        let segment = &mut segments[segment_id.as_usize()];
                        if segment.file_offset == u64::MAX {
                            segment.file_offset = record.file_offset;
                            segment.address = record.address;
                        }
                        if record.alignment > segment.alignment {
                            segment.alignment = record.alignment;
                        }
                    }
                } else {
                    // Non-alloc: file space only.
                    record.address = 0;
                    if is_nobits {
                        record.file_size = 0;
                    }
                    record.file_offset = record.alignment.align_up(file_offset);
                    file_offset = record.file_offset + record.file_size;
                }
            }
        }
    }

    layout.segment_layouts = segments;

    // The section header table goes after all section content.
    layout.shdr_offset = alignment::USIZE.align_up(file_offset);
    layout.file_size = layout.shdr_offset
        + u64::from(layout.num_output_sections) * u64::from(elf::SECTION_HEADER_SIZE);

    // TLS layout for TP-relative offsets.
    let tdata = layout.section_layout(output_section_id::TDATA);
    let tbss = layout.section_layout(output_section_id::TBSS);
    let tls_start = if tdata.active {
        tdata.address
    } else {
        tbss.address
    };
    let tls_end = if tbss.active {
        tbss.address + tbss.mem_size
    } else if tdata.active {
        tdata.address + tdata.mem_size
    } else {
        tls_start
    };
    layout.tls = TlsLayout {
        start: tls_start,
        end: tls_end,
        alignment: tdata.alignment.merge(tbss.alignment),
    };

    Ok(())
}

// ---------------------------------------------------------------------------
// Thunks
// ---------------------------------------------------------------------------

/// Scans branch relocations for out-of-range targets and creates thunks for
/// them. Returns whether any new thunks were created (in which case the
/// address assignment must run again).
fn create_thunks<'data, A: Arch>(layout: &mut Layout<'data>) -> Result<bool> {
    let Some(max_displacement) = A::MAX_BRANCH_DISPLACEMENT else {
        return Ok(false);
    };

    struct NeededThunk {
        section_id: OutputSectionId,
        target: SymbolId,
    }

    let mut needed: Vec<NeededThunk> = Vec::new();
    for object in &layout.resolution.objects {
        if !object.is_loaded || object.is_dynamic {
            continue;
        }
        let file = layout.symbol_db.file(object.file_id);
        let parsed = file.object().expect("loaded");
        for (section_index, slot) in object.sections.iter().enumerate() {
            let SectionSlot::Loaded(section) = slot else {
                continue;
            };
            if !section.is_alive() || !section.flags.contains(shf::EXECINSTR) {
                continue;
            }
            let relocations = parsed
                .object
                .relocations(object::SectionIndex(section_index), &object.relocation_sections)?;
            for relocation in relocations.iter() {
                if !A::is_branch_relocation(relocation.r_type) {
                    continue;
                }
                let id = file.symbol_id_range.input_to_id(relocation.symbol);
                let canonical = layout.symbol_db.definition(id);
                let Some(resolution) = layout.resolutions[canonical.as_usize()].as_ref() else {
                    continue;
                };
                let target_address = resolution.plt_address.unwrap_or(resolution.value);
                if target_address == 0 {
                    continue;
                }
                let place = section.address + relocation.r_offset;
                let displacement = target_address.wrapping_add(relocation.addend as u64) as i64
                    - place as i64;
                if displacement.abs() <= max_displacement {
                    continue;
                }
                if layout
                    .thunk_plan
                    .by_target
                    .contains_key(&(section.output_section, canonical))
                {
                    continue;
                }
                needed.push(NeededThunk {
                    section_id: section.output_section,
                    target: canonical,
                });
            }
        }
    }

    if needed.is_empty() {
        return Ok(false);
    }

    for thunk in needed {
        let key = (thunk.section_id, thunk.target);
        if layout.thunk_plan.by_target.contains_key(&key) {
            continue;
        }
        let index = layout.thunk_plan.thunks.len() as u32;
        layout.thunk_plan.thunks.push(Thunk {
            target: thunk.target,
            section_id: thunk.section_id,
            address: 0,
        });
        layout.thunk_plan.by_target.insert(key, index);
        *layout
            .thunk_plan
            .extra_size
            .entry(thunk.section_id)
            .or_default() += A::THUNK_SIZE;
    }

    Ok(true)
}

/// Positions thunks at the end of their output sections. Called after
/// address assignment.
fn place_thunks<A: Arch>(layout: &mut Layout<'_>) {
    let mut cursor_by_section: hashbrown::HashMap<OutputSectionId, u64> = Default::default();
    for thunk in &mut layout.thunk_plan.thunks {
        let record = &layout.section_layouts[thunk.section_id.as_usize()];
        let extra = layout
            .thunk_plan
            .extra_size
            .get(&thunk.section_id)
            .copied()
            .unwrap_or(0);
        let thunk_region_start = record.address + record.mem_size - extra;
        let cursor = cursor_by_section.entry(thunk.section_id).or_insert(0);
        thunk.address = thunk_region_start + *cursor;
        *cursor += A::THUNK_SIZE;
    }
}

// ---------------------------------------------------------------------------
// Symbol resolution finalisation
// ---------------------------------------------------------------------------

fn compute_symbol_resolutions<'data, A: Arch>(layout: &mut Layout<'data>) -> Result {
    place_thunks::<A>(layout);

    // Record each input section's final address; the relocation applier and
    // thunk scan read it.
    let section_addresses: Vec<u64> = layout
        .section_layouts
        .iter()
        .map(|record| record.address)
        .collect();
    for object in &mut layout.resolution.objects {
        for slot in &mut object.sections {
            if let Some(section) = slot.as_loaded_mut() {
                section.address =
                    section_addresses[section.output_section.as_usize()] + section.output_offset;
            }
        }
    }

    let num_symbols = layout.symbol_db.num_symbols();
    let mut resolutions: Vec<Option<SymbolResolution>> = vec![None; num_symbols];

    // GOT/PLT addresses per symbol, from the plan.
    let got_base = layout.section_layout(output_section_id::GOT).address;
    let plt_base = layout.section_layout(output_section_id::PLT).address;
    let mut got_cursor = got_base + elf::GOT_ENTRY_SIZE; // slot 0 holds .dynamic
    let mut got_addresses: hashbrown::HashMap<(SymbolId, u8), u64> = Default::default();
    for entry in &layout.got_plan.entries {
        let (symbol, kind) = match entry {
            GotEntry::Value(s) | GotEntry::Dynamic(s) | GotEntry::IfuncResolver(s) => (*s, 0u8),
            GotEntry::TlsModule(s) => (*s, 1),
            GotEntry::TlsOffset(s) => (*s, 255), // second word of the pair
            GotEntry::TpOff(s) => (*s, 2),
            GotEntry::TlsDescriptor(s) => (*s, 3),
            GotEntry::Zero => (SymbolId::undefined(), 254),
        };
        if kind != 255 && kind != 254 {
            got_addresses.insert((symbol, kind), got_cursor);
        }
        got_cursor += elf::GOT_ENTRY_SIZE;
    }
    let mut plt_addresses: hashbrown::HashMap<SymbolId, u64> = Default::default();
    for (i, &symbol) in layout.got_plan.plt_symbols.iter().enumerate() {
        plt_addresses.insert(symbol, plt_base + i as u64 * elf::PLT_ENTRY_SIZE);
    }

    // Dynsym indexes.
    let mut dynsym_indexes: hashbrown::HashMap<SymbolId, u32> = Default::default();
    for (i, entry) in layout.dynamic_plan.dynsyms.iter().enumerate() {
        if i > 0 {
            dynsym_indexes.insert(entry.symbol_id, i as u32);
        }
    }

    // Copy-relocated symbols live at their .bss slot.
    let bss_address = layout.section_layout(output_section_id::BSS).address;
    let mut copy_reloc_addresses: hashbrown::HashMap<SymbolId, u64> = Default::default();
    for &(symbol, offset, _) in &layout.got_plan.copy_relocations {
        copy_reloc_addresses.insert(symbol, bss_address + offset);
    }

    for raw in 0..num_symbols {
        let id = SymbolId::from_usize(raw);
        if !layout.symbol_db.is_canonical(id) {
            continue;
        }
        let value_flags = layout.symbol_db.value_flags(id);
        let value = compute_symbol_value(layout, id, value_flags, &copy_reloc_addresses)?;
        resolutions[raw] = Some(SymbolResolution {
            value,
            got_address: got_addresses.get(&(id, 0)).copied(),
            tlsgd_got_address: got_addresses.get(&(id, 1)).copied(),
            gottpoff_address: got_addresses.get(&(id, 2)).copied(),
            tlsdesc_got_address: got_addresses.get(&(id, 3)).copied(),
            plt_address: plt_addresses.get(&id).copied(),
            value_flags,
            dynsym_index: dynsym_indexes.get(&id).copied(),
        });
    }

    // Start/stop references resolve to section boundaries.
    for reference in &layout.resolution.start_stop_refs {
        let record = layout.section_layout(reference.section_id);
        let value = if reference.is_stop {
            record.address + record.mem_size
        } else {
            record.address
        };
        resolutions[reference.symbol_id.as_usize()] = Some(SymbolResolution {
            value,
            value_flags: ValueFlags::CAN_BYPASS_GOT,
            ..Default::default()
        });
    }

    // Fill planned symtab values now that everything has an address.
    finalise_symtab_values(layout, &resolutions);

    layout.resolutions = resolutions;
    Ok(())
}

fn compute_symbol_value<'data>(
    layout: &Layout<'data>,
    id: SymbolId,
    value_flags: ValueFlags,
    copy_reloc_addresses: &hashbrown::HashMap<SymbolId, u64>,
) -> Result<u64> {
    let symbol_db = &layout.symbol_db;
    let file_id = symbol_db.file_id_for_symbol(id);
    let file = symbol_db.file(file_id);

    if let Some(&address) = copy_reloc_addresses.get(&id) {
        return Ok(address);
    }

    match &file.entry {
        FileEntry::Prelude(prelude) => {
            let offset = file.symbol_id_range.id_to_offset(id);
            let def = &prelude.symbol_definitions[offset];
            Ok(match &def.placement {
                SymbolPlacement::Undefined | SymbolPlacement::ForceUndefined => 0,
                SymbolPlacement::SectionStart(section_id) => {
                    layout.section_layout(*section_id).address
                }
                SymbolPlacement::SectionEnd(section_id) => {
                    let record = layout.section_layout(*section_id);
                    record.address + record.mem_size
                }
                SymbolPlacement::Absolute(value) => *value,
                SymbolPlacement::Alias(target, offset) => {
                    let target_name = SymbolName::prehashed(target.as_bytes());
                    let value = symbol_db
                        .lookup(&target_name)
                        .map(|first| symbol_db.definition(first))
                        .and_then(|def| {
                            layout.resolutions.get(def.as_usize()).and_then(|r| r.as_ref())
                        })
                        .map(|r| r.value)
                        .unwrap_or(0);
                    value.wrapping_add(*offset as u64)
                }
                SymbolPlacement::Provide(expression) => {
                    let lookup = |_: &str| None;
                    expression
                        .evaluate(&EvalContext {
                            dot: 0,
                            lookup_symbol: &lookup,
                        })
                        .unwrap_or(0)
                }
                SymbolPlacement::LoadBaseAddress => layout.output_kind.base_address(),
            })
        }
        FileEntry::Object(parsed) => {
            if value_flags.contains(ValueFlags::DYNAMIC) {
                return Ok(0);
            }
            let index = file.symbol_id_range.id_to_input(id);
            let symbol = parsed.object.symbol(index)?;
            let e = LittleEndian;
            if symbol.is_undefined(e) {
                return Ok(0);
            }
            if symbol.is_absolute(e) {
                return Ok(symbol.st_value(e));
            }
            if symbol.is_common(e) {
                let common = layout
                    .resolution
                    .commons
                    .get(&id)
                    .context("Common symbol without allocation")?;
                let bss = layout.section_layout(output_section_id::BSS);
                return Ok(bss.address + common.offset);
            }
            let Some(section_index) = parsed.object.symbol_section(symbol, index)? else {
                return Ok(0);
            };
            let object_index = file_id.as_usize() - 1;
            let object = &layout.resolution.objects[object_index];
            let st_value = symbol.st_value(e);
            match object.sections.get(section_index.0) {
                Some(SectionSlot::Loaded(section)) | Some(SectionSlot::EhFrame(section)) => {
                    Ok(resolve_section_address(layout, section)? + st_value)
                }
                Some(SectionSlot::MergeStrings(merge)) => {
                    let merged_offset = layout.merged_strings.resolve(
                        object_index,
                        section_index,
                        st_value,
                    )?;
                    let record = layout.section_layout(merge.output_section);
                    Ok(record.address + merged_offset)
                }
                _ => Ok(0),
            }
        }
    }
}

/// The address of an input section, following ICF folds.
fn resolve_section_address<'data>(
    layout: &Layout<'data>,
    section: &Section<'data>,
) -> Result<u64> {
    if let Some((target_file, target_section)) = section.folded_into {
        let target_object = &layout.resolution.objects[target_file.as_usize() - 1];
        if let Some(target) = target_object.sections[target_section.0].as_loaded() {
            let record = layout.section_layout(target.output_section);
            return Ok(record.address + target.output_offset);
        }
    }
    if !section.is_alive() {
        return Ok(0);
    }
    let record = layout.section_layout(section.output_section);
    Ok(record.address + section.output_offset)
}

fn finalise_symtab_values(layout: &mut Layout<'_>, resolutions: &[Option<SymbolResolution>]) {
    let symbol_db = &layout.symbol_db;
    for entry in layout.symtab_plan.entries.iter_mut().skip(1) {
        let canonical = symbol_db.definition(entry.symbol_id);
        entry.value = resolutions
            .get(canonical.as_usize())
            .and_then(|r| r.as_ref())
            .map(|r| r.value)
            .unwrap_or(0);
    }
}

fn finalise_entry_address(layout: &mut Layout<'_>, diagnostics: &Diagnostics) {
    if !layout.output_kind.is_executable() {
        return;
    }
    let entry_name = layout
        .symbol_db
        .script_entry
        .map(|s| s.to_owned())
        .or_else(|| layout.args.entry.clone())
        .unwrap_or_else(|| "_start".to_owned());
    // -e takes precedence over script ENTRY.
    let entry_name = layout.args.entry.clone().unwrap_or(entry_name);
    let prehashed = SymbolName::prehashed(entry_name.as_bytes());
    match layout
        .symbol_db
        .lookup(&prehashed)
        .map(|first| layout.symbol_db.definition(first))
        .and_then(|def| layout.resolutions[def.as_usize()].as_ref())
    {
        Some(resolution) if resolution.value != 0 => layout.entry_address = resolution.value,
        _ => {
            diagnostics.warning(
                (0, 0),
                format!("cannot find entry symbol `{entry_name}`; defaulting to start of .text"),
            );
            layout.entry_address = layout.section_layout(output_section_id::TEXT).address;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gnu_hash() {
        // Known values for the DJB hash used by .gnu.hash.
        assert_eq!(gnu_hash(b""), 5381);
        assert_eq!(gnu_hash(b"printf"), 0x156b2bb8);
        assert_eq!(gnu_hash(b"exit"), 0x7c967e3f);
    }

    #[test]
    fn test_resolution_flags_for_relocation_kinds() {
        assert!(resolution_flags(RelocationKind::PltRelative).contains(ValueFlags::PLT));
        assert!(resolution_flags(RelocationKind::GotRelative).contains(ValueFlags::GOT));
        assert!(
            resolution_flags(RelocationKind::TlsGd).contains(ValueFlags::GOT_TLS_MODULE)
        );
        assert!(resolution_flags(RelocationKind::Absolute).contains(ValueFlags::DIRECT));
        assert_eq!(resolution_flags(RelocationKind::None), ValueFlags::empty());
    }
}
