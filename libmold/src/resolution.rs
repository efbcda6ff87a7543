//! Resolves symbol references between objects. In the process, decides which
//! archive members are needed, elects comdat groups, assigns each input
//! section to an output section and selects the winning definition for every
//! global symbol name.

use crate::alignment::Alignment;
use crate::args::UnresolvedSymbols;
use crate::diagnostics::Diagnostics;
use crate::elf::SectionFlags;
use crate::elf::shf;
use crate::error::Result;
use crate::input_data::FileId;
use crate::input_data::PRELUDE_FILE_ID;
use crate::output_section_id;
use crate::output_section_id::OutputSectionId;
use crate::output_section_id::OutputSections;
use crate::symbol::SymbolName;
use crate::symbol_db::FileEntry;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolIdRange;
use crate::symbol_db::SymbolStrength;
use crate::value_flags::ValueFlags;
use crossbeam_queue::SegQueue;
use object::LittleEndian;
use object::read::elf::RelocationSections;
use object::read::elf::SectionHeader as _;
use object::read::elf::Sym as _;
use rayon::iter::IndexedParallelIterator as _;
use rayon::iter::IntoParallelRefMutIterator as _;
use rayon::iter::ParallelIterator as _;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// An input section that will be copied to the output.
#[derive(Debug)]
pub(crate) struct Section<'data> {
    pub(crate) index: object::SectionIndex,
    pub(crate) name: &'data [u8],
    pub(crate) flags: SectionFlags,
    pub(crate) ty: u32,
    pub(crate) alignment: Alignment,
    pub(crate) size: u64,
    pub(crate) output_section: OutputSectionId,

    /// Set by the GC mark pass (or unconditionally when GC is off). Once a
    /// section is alive it stays alive.
    pub(crate) is_alive: AtomicBool,

    /// If identical-code-folding deactivated this section, the file and
    /// section it was folded into.
    pub(crate) folded_into: Option<(FileId, object::SectionIndex)>,

    /// Offset of this section within its output section. Set during layout.
    pub(crate) output_offset: u64,

    /// Virtual address. Set during layout.
    pub(crate) address: u64,
}

impl Section<'_> {
    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_alive(&self) -> bool {
        !self.is_alive.swap(true, Ordering::Relaxed)
    }
}

/// A string-merge input section awaiting interning.
#[derive(Debug)]
pub(crate) struct MergeStringsSlot<'data> {
    pub(crate) index: object::SectionIndex,
    pub(crate) name: &'data [u8],
    pub(crate) data: &'data [u8],
    pub(crate) entry_size: u64,
    pub(crate) is_strings: bool,
    pub(crate) alignment: Alignment,
    pub(crate) output_section: OutputSectionId,
}

#[derive(Debug)]
pub(crate) enum SectionSlot<'data> {
    /// Not copied to the output.
    Discard,

    /// A regular section that gets copied.
    Loaded(Section<'data>),

    /// SHF_MERGE section whose pieces get interned.
    MergeStrings(MergeStringsSlot<'data>),

    /// An exception-frame section, split into CIEs/FDEs during layout.
    EhFrame(Section<'data>),
}

impl<'data> SectionSlot<'data> {
    pub(crate) fn as_loaded(&self) -> Option<&Section<'data>> {
        match self {
            SectionSlot::Loaded(s) | SectionSlot::EhFrame(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn as_loaded_mut(&mut self) -> Option<&mut Section<'data>> {
        match self {
            SectionSlot::Loaded(s) | SectionSlot::EhFrame(s) => Some(s),
            _ => None,
        }
    }
}

pub(crate) struct ResolvedObject<'data> {
    pub(crate) file_id: FileId,
    pub(crate) symbol_id_range: SymbolIdRange,
    pub(crate) is_dynamic: bool,

    /// Whether the file contributes to the link. Non-archive members always
    /// do; archive members only when they resolve an undefined symbol.
    pub(crate) is_loaded: bool,

    /// One slot per input section. Empty for dynamic objects and unloaded
    /// archive members.
    pub(crate) sections: Vec<SectionSlot<'data>>,

    /// Map from section index to the relocation section targeting it.
    pub(crate) relocation_sections: RelocationSections,
}

pub(crate) struct ResolutionOutputs<'data> {
    pub(crate) objects: Vec<ResolvedObject<'data>>,

    /// Merged common-symbol allocation info, keyed by the winning symbol.
    pub(crate) commons: hashbrown::HashMap<SymbolId, CommonSymbol>,

    /// Undefined references to `__start_SEC`/`__stop_SEC` that we'll define
    /// once output section addresses are known.
    pub(crate) start_stop_refs: Vec<StartStopRef>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CommonSymbol {
    pub(crate) size: u64,
    pub(crate) alignment: Alignment,

    /// Offset within .bss, assigned during layout.
    pub(crate) offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StartStopRef {
    pub(crate) symbol_id: SymbolId,
    pub(crate) section_id: OutputSectionId,
    pub(crate) is_stop: bool,
}

#[tracing::instrument(skip_all, name = "Symbol resolution")]
pub(crate) fn resolve_symbols_and_sections<'data>(
    symbol_db: &mut SymbolDb<'data>,
    scripts: &[crate::input_data::ScriptInput<'data>],
    output_sections: &mut OutputSections<'data>,
    diagnostics: &Diagnostics,
) -> Result<ResolutionOutputs<'data>> {
    let mut objects = create_resolved_objects(symbol_db);

    select_archive_members(symbol_db, &mut objects);

    let comdat_losers = elect_comdat_groups(symbol_db, &objects)?;

    populate_section_slots(symbol_db, &mut objects, &comdat_losers)?;

    assign_output_sections(&mut objects, scripts, output_sections);

    let commons = select_definitions(symbol_db, &objects, diagnostics);

    let start_stop_refs =
        canonicalise_undefined_symbols(symbol_db, &objects, output_sections, diagnostics);

    Ok(ResolutionOutputs {
        objects,
        commons,
        start_stop_refs,
    })
}

fn create_resolved_objects<'data>(symbol_db: &SymbolDb<'data>) -> Vec<ResolvedObject<'data>> {
    symbol_db
        .files
        .iter()
        .skip(1)
        .map(|file| {
            let object = file.object().expect("non-prelude files are objects");
            ResolvedObject {
                file_id: file.file_id,
                symbol_id_range: file.symbol_id_range,
                is_dynamic: object.is_dynamic,
                is_loaded: !object.is_optional,
                sections: Vec::new(),
                relocation_sections: RelocationSections::default(),
            }
        })
        .collect()
}

/// Runs the archive member selection work-list to fixpoint: whenever a loaded
/// file references an undefined symbol that some archive member defines, that
/// member becomes loaded, which may add further undefined references. This
/// subsumes `--start-group` semantics because all archives participate in the
/// same fixpoint.
#[tracing::instrument(skip_all, name = "Select archive members")]
fn select_archive_members<'data>(
    symbol_db: &SymbolDb<'data>,
    objects: &mut [ResolvedObject<'data>],
) {
    let load_flags: Vec<AtomicBool> = objects
        .iter()
        .map(|o| AtomicBool::new(o.is_loaded))
        .collect();

    let queue = SegQueue::new();
    queue.push(PRELUDE_FILE_ID);
    for object in objects.iter() {
        if object.is_loaded {
            queue.push(object.file_id);
        }
    }

    let process_file = |file_id: FileId, queue: &SegQueue<FileId>| {
        let file = symbol_db.file(file_id);
        match &file.entry {
            FileEntry::Prelude(prelude) => {
                for (offset, def) in prelude.symbol_definitions.iter().enumerate() {
                    if matches!(
                        def.placement,
                        crate::parsing::SymbolPlacement::ForceUndefined
                    ) {
                        let id = file.symbol_id_range.offset_to_id(offset);
                        request_definition(symbol_db, id, &load_flags, queue);
                    }
                }
            }
            FileEntry::Object(object) => {
                let e = LittleEndian;
                for (index, symbol) in object.object.symbols.enumerate() {
                    if symbol.is_local() || !symbol.is_undefined(e) || symbol.is_weak() {
                        continue;
                    }
                    let id = file.symbol_id_range.input_to_id(index);
                    request_definition(symbol_db, id, &load_flags, queue);
                }
            }
        }
    };

    rayon::in_place_scope(|scope| {
        fn drain<'scope, 'env: 'scope>(
            queue: &'env SegQueue<FileId>,
            scope: &rayon::Scope<'scope>,
            process_file: &'env (dyn Fn(FileId, &SegQueue<FileId>) + Sync),
        ) {
            while let Some(file_id) = queue.pop() {
                scope.spawn(move |scope| {
                    process_file(file_id, queue);
                    drain(queue, scope, process_file);
                });
            }
        }
        drain(&queue, scope, &process_file);
    });

    for (object, flag) in objects.iter_mut().zip(&load_flags) {
        object.is_loaded = flag.load(Ordering::Relaxed);
    }
}

/// Ensures some definition of the symbol referenced by `reference` is
/// loaded, activating an archive member if necessary.
fn request_definition(
    symbol_db: &SymbolDb<'_>,
    reference: SymbolId,
    load_flags: &[AtomicBool],
    queue: &SegQueue<FileId>,
) {
    let Ok(name) = symbol_db.symbol_name(reference) else {
        return;
    };
    let prehashed = SymbolName::prehashed(name.bytes());
    let Some(first) = symbol_db.lookup_with_wrap(&prehashed) else {
        return;
    };

    let is_loaded = |file_id: FileId| -> bool {
        file_id == PRELUDE_FILE_ID
            || load_flags[file_id.as_usize() - 1].load(Ordering::Relaxed)
    };

    let mut best_unloaded: Option<(SymbolStrength, FileId)> = None;
    for candidate in symbol_db.candidate_definitions(first) {
        let strength = symbol_db.symbol_strength(candidate);
        if strength == SymbolStrength::Undefined {
            continue;
        }
        let file_id = symbol_db.file_id_for_symbol(candidate);
        if is_loaded(file_id) {
            // A loaded file already defines the symbol; nothing to pull in.
            return;
        }
        // Prefer the strongest definition; break ties by command-line order.
        let is_better = match best_unloaded {
            None => true,
            Some((best_strength, best_file)) => {
                strength > best_strength || (strength == best_strength && file_id < best_file)
            }
        };
        if is_better {
            best_unloaded = Some((strength, file_id));
        }
    }

    if let Some((_, file_id)) = best_unloaded {
        let flag = &load_flags[file_id.as_usize() - 1];
        if !flag.swap(true, Ordering::Relaxed) {
            queue.push(file_id);
        }
    }
}

/// At most one comdat group with a given signature contributes its members.
/// The winner is the group in the lowest-priority (earliest) loaded file.
/// Returns the set of discarded sections per file.
#[tracing::instrument(skip_all, name = "Elect comdat groups")]
fn elect_comdat_groups<'data>(
    symbol_db: &SymbolDb<'data>,
    objects: &[ResolvedObject<'data>],
) -> Result<Vec<hashbrown::HashSet<object::SectionIndex>>> {
    let mut losers: Vec<hashbrown::HashSet<object::SectionIndex>> =
        vec![Default::default(); objects.len()];
    let mut signatures: hashbrown::HashMap<&'data [u8], FileId> = Default::default();

    for object in objects {
        if !object.is_loaded || object.is_dynamic {
            continue;
        }
        let file = symbol_db.file(object.file_id);
        let Some(parsed) = file.object() else {
            continue;
        };
        let elf_file = &parsed.object;
        for (index, section) in elf_file.sections.enumerate() {
            if section.sh_type(LittleEndian) != object::elf::SHT_GROUP {
                continue;
            }
            let group = elf_file.parse_comdat_group(index, section)?;
            match signatures.entry(group.signature) {
                hashbrown::hash_map::Entry::Vacant(entry) => {
                    entry.insert(object.file_id);
                }
                hashbrown::hash_map::Entry::Occupied(_) => {
                    let set = &mut losers[object.file_id.as_usize() - 1];
                    set.extend(group.members);
                }
            }
        }
    }

    Ok(losers)
}

#[tracing::instrument(skip_all, name = "Populate section slots")]
fn populate_section_slots<'data>(
    symbol_db: &SymbolDb<'data>,
    objects: &mut [ResolvedObject<'data>],
    comdat_losers: &[hashbrown::HashSet<object::SectionIndex>],
) -> Result {
    let args = symbol_db.args;
    objects
        .par_iter_mut()
        .enumerate()
        .try_for_each(|(object_index, resolved)| -> Result {
            if !resolved.is_loaded || resolved.is_dynamic {
                return Ok(());
            }
            let file = symbol_db.file(resolved.file_id);
            let parsed = file.object().expect("loaded object");
            let elf_file = &parsed.object;
            resolved.relocation_sections = elf_file.parse_relocation_sections()?;

            let losers = &comdat_losers[object_index];
            let num_sections = elf_file.sections.len();
            let mut slots = Vec::with_capacity(num_sections);
            for (index, section) in elf_file.sections.enumerate() {
                if slots.len() < index.0 {
                    slots.resize_with(index.0, || SectionSlot::Discard);
                }
                let slot = classify_section(elf_file, index, section, losers, args)?;
                slots.push(slot);
            }
            resolved.sections = slots;
            Ok(())
        })
}

fn classify_section<'data>(
    elf_file: &crate::elf::File<'data>,
    index: object::SectionIndex,
    section: &'data crate::elf::SectionHeader,
    comdat_losers: &hashbrown::HashSet<object::SectionIndex>,
    args: &crate::args::Args,
) -> Result<SectionSlot<'data>> {
    let e = LittleEndian;
    let ty = section.sh_type(e);
    let flags = SectionFlags::from_header(section);
    let name = elf_file.section_name(section)?;

    if comdat_losers.contains(&index) || flags.contains(shf::EXCLUDE) {
        return Ok(SectionSlot::Discard);
    }

    match ty {
        object::elf::SHT_NULL
        | object::elf::SHT_GROUP
        | object::elf::SHT_SYMTAB
        | object::elf::SHT_STRTAB
        | object::elf::SHT_RELA
        | object::elf::SHT_REL
        | object::elf::SHT_SYMTAB_SHNDX => return Ok(SectionSlot::Discard),
        _ => {}
    }

    // .note.GNU-stack and friends only carry metadata.
    if name.starts_with(b".note.GNU-stack") {
        return Ok(SectionSlot::Discard);
    }

    let alignment = Alignment::new(elf_file.section_alignment(section)?)?;
    let size = elf_file.section_size(section)?;

    if !flags.contains(shf::ALLOC) {
        // Non-alloc sections are kept (debug info and similar) unless
        // stripped. They never get addresses.
        let keep = match args.strip {
            crate::args::Strip::Nothing => true,
            crate::args::Strip::Debug | crate::args::Strip::All => {
                !name.starts_with(b".debug_") && !name.starts_with(b".comment")
            }
        };
        if !keep || flags.contains(shf::GROUP) {
            return Ok(SectionSlot::Discard);
        }
    }

    if flags.contains(shf::MERGE) && args.merge_sections && ty == object::elf::SHT_PROGBITS {
        let entry_size = section.sh_entsize(e);
        let is_strings = flags.contains(shf::STRINGS);
        // Zero or irregular entry sizes fall back to regular copying.
        if entry_size > 0 && (!is_strings || entry_size == 1) {
            return Ok(SectionSlot::MergeStrings(MergeStringsSlot {
                index,
                name,
                data: elf_file.raw_section_data(section)?,
                entry_size,
                is_strings,
                alignment,
                output_section: output_section_id::RODATA,
            }));
        }
    }

    let section_record = Section {
        index,
        name,
        flags,
        ty,
        alignment,
        size,
        output_section: output_section_id::TEXT,
        is_alive: AtomicBool::new(!args.gc_sections || !flags.contains(shf::ALLOC)),
        folded_into: None,
        output_offset: 0,
        address: 0,
    };

    // Exception frames get FDE-level treatment (CIE dedup, dead-FDE
    // pruning), except in relocatable output where they pass through.
    if name == b".eh_frame" && !args.relocatable {
        return Ok(SectionSlot::EhFrame(section_record));
    }

    Ok(SectionSlot::Loaded(section_record))
}

/// Assigns every loaded section to an output section. Linker-script
/// `SECTIONS` patterns take precedence over the built-in name mappings.
#[tracing::instrument(skip_all, name = "Assign output sections")]
fn assign_output_sections<'data>(
    objects: &mut [ResolvedObject<'data>],
    scripts: &[crate::input_data::ScriptInput<'data>],
    output_sections: &mut OutputSections<'data>,
) {
    let mut script_rules: Vec<(crate::linker_script::SectionPattern<'data>, &'data str)> =
        Vec::new();
    for script in scripts {
        for rule in script.script.section_rules().into_iter().flatten() {
            if rule.output_name.is_empty() {
                continue;
            }
            for pattern in &rule.input_patterns {
                script_rules.push((*pattern, rule.output_name));
            }
        }
    }

    let mut pick = |name: &'data [u8], flags: SectionFlags, ty: u32, element_size: u64| {
        for (pattern, output_name) in &script_rules {
            if pattern.matches(name) {
                return output_sections.output_section_for_input(
                    output_name.as_bytes(),
                    flags,
                    ty,
                    element_size,
                );
            }
        }
        output_sections.output_section_for_input(name, flags, ty, element_size)
    };

    for resolved in objects.iter_mut() {
        for slot in &mut resolved.sections {
            match slot {
                SectionSlot::Loaded(section) => {
                    section.output_section = pick(section.name, section.flags, section.ty, 0);
                }
                SectionSlot::EhFrame(section) => {
                    section.output_section = output_section_id::EH_FRAME;
                }
                SectionSlot::MergeStrings(merge_slot) => {
                    merge_slot.output_section = pick(
                        merge_slot.name,
                        SectionFlags::from_u32(object::elf::SHF_ALLOC),
                        object::elf::SHT_PROGBITS,
                        merge_slot.entry_size,
                    );
                }
                SectionSlot::Discard => {}
            }
        }
    }
}

/// Selects the winning definition for every global name and records it as
/// the canonical definition of all symbols with that name.
#[tracing::instrument(skip_all, name = "Select definitions")]
fn select_definitions<'data>(
    symbol_db: &mut SymbolDb<'data>,
    objects: &[ResolvedObject<'data>],
    diagnostics: &Diagnostics,
) -> hashbrown::HashMap<SymbolId, CommonSymbol> {
    let mut commons = hashbrown::HashMap::new();

    // Gather the first-symbol for every name, then decide each name's winner.
    let firsts: Vec<SymbolId> = symbol_db.all_first_symbols();

    for first in firsts {
        let candidates = symbol_db.candidate_definitions(first);

        let mut winner: Option<(SymbolStrength, SymbolId)> = None;
        let mut strong_defs: Vec<SymbolId> = Vec::new();
        let mut common_size = 0u64;
        let mut common_alignment = Alignment::default();
        let mut have_common = false;
        let mut merged_flags = ValueFlags::empty();

        for &candidate in &candidates {
            let file_id = symbol_db.file_id_for_symbol(candidate);
            if !file_is_loaded(objects, file_id) {
                continue;
            }
            let strength = symbol_db.symbol_strength(candidate);
            if strength == SymbolStrength::Undefined {
                continue;
            }
            // Visibility strengthens across every defining occurrence,
            // including definitions in discarded comdat groups.
            merged_flags.merge(symbol_db.value_flags(candidate));
            if in_discarded_section(symbol_db, objects, candidate) {
                continue;
            }

            if strength == SymbolStrength::Common {
                have_common = true;
                if let Some((size, alignment)) = symbol_db.common_size_and_alignment(candidate) {
                    common_size = common_size.max(size);
                    common_alignment = common_alignment.merge(alignment);
                }
            }
            if strength == SymbolStrength::Strong
                && !symbol_db.value_flags(candidate).contains(ValueFlags::DYNAMIC)
            {
                strong_defs.push(candidate);
            }
            // Ties break to the earlier file, and candidates arrive in file
            // order, so a strictly-stronger candidate is the only thing that
            // displaces the current winner.
            match winner {
                Some((best_strength, _)) if strength <= best_strength => {}
                _ => winner = Some((strength, candidate)),
            }
        }

        let Some((winner_strength, winner_id)) = winner else {
            continue;
        };

        if strong_defs.len() > 1 && !symbol_db.args.allow_multiple_definitions {
            diagnostics.multiple_definition(symbol_db, &strong_defs);
        }

        if winner_strength == SymbolStrength::Common && have_common {
            commons.insert(
                winner_id,
                CommonSymbol {
                    size: common_size,
                    alignment: common_alignment,
                    offset: 0,
                },
            );
        }

        // Redirect every candidate (and the name's first symbol) at the
        // winner.
        symbol_db.set_definition(first, winner_id);
        for &candidate in &candidates {
            symbol_db.set_definition(candidate, winner_id);
        }
        symbol_db.merge_value_flags(winner_id, merged_flags);
    }

    commons
}

fn file_is_loaded(objects: &[ResolvedObject<'_>], file_id: FileId) -> bool {
    file_id == PRELUDE_FILE_ID || objects[file_id.as_usize() - 1].is_loaded
}

/// Whether the symbol is defined in a section that resolution discarded
/// (e.g. the members of a losing comdat group).
fn in_discarded_section(
    symbol_db: &SymbolDb<'_>,
    objects: &[ResolvedObject<'_>],
    id: SymbolId,
) -> bool {
    let file_id = symbol_db.file_id_for_symbol(id);
    if file_id == PRELUDE_FILE_ID {
        return false;
    }
    let object = &objects[file_id.as_usize() - 1];
    if object.is_dynamic || !object.is_loaded {
        return false;
    }
    let file = symbol_db.file(file_id);
    let Some(parsed) = file.object() else {
        return false;
    };
    let index = file.symbol_id_range.id_to_input(id);
    let Ok(symbol) = parsed.object.symbol(index) else {
        return false;
    };
    let Ok(Some(section_index)) = parsed.object.symbol_section(symbol, index) else {
        return false;
    };
    matches!(
        object.sections.get(section_index.0),
        Some(SectionSlot::Discard)
    )
}

/// Points every remaining symbol (undefined references in each file) at the
/// canonical definition of its name, reporting unresolved references.
#[tracing::instrument(skip_all, name = "Canonicalise undefined symbols")]
fn canonicalise_undefined_symbols<'data>(
    symbol_db: &mut SymbolDb<'data>,
    objects: &[ResolvedObject<'data>],
    output_sections: &OutputSections<'data>,
    diagnostics: &Diagnostics,
) -> Vec<StartStopRef> {
    let mut start_stop_refs = Vec::new();
    let mut updates: Vec<(SymbolId, SymbolId)> = Vec::new();

    for file_index in 0..symbol_db.files.len() {
        let file = &symbol_db.files[file_index];
        let range = file.symbol_id_range;
        let is_prelude = file.file_id == PRELUDE_FILE_ID;
        if !is_prelude {
            let object = &objects[file.file_id.as_usize() - 1];
            if !object.is_loaded {
                continue;
            }
        }

        for id in range.iter() {
            if symbol_db.definition(id) != id {
                continue;
            }
            if symbol_db.symbol_strength(id) != SymbolStrength::Undefined {
                continue;
            }
            if id.is_undefined() {
                continue;
            }
            let Ok(name) = symbol_db.symbol_name(id) else {
                continue;
            };
            if name.bytes().is_empty() {
                continue;
            }
            let prehashed = SymbolName::prehashed(name.bytes());
            // Versioned references (`foo@VER`) bind to the matching
            // versioned definition; everything else goes through the
            // unversioned map with --wrap applied.
            let first = match symbol_db.symbol_version(id) {
                Some(version) => symbol_db.lookup_versioned(
                    &crate::symbol::VersionedSymbolName::prehashed(prehashed, version),
                ),
                None => symbol_db.lookup_with_wrap(&prehashed),
            };
            let target = first
                .map(|first| symbol_db.definition(first))
                .filter(|&def| {
                    def != id && symbol_db.symbol_strength(def) != SymbolStrength::Undefined
                });

            if let Some(definition) = target {
                updates.push((id, definition));
                continue;
            }

            // References to __start_SEC / __stop_SEC of a present output
            // section become defined during layout.
            if let Some(start_stop) = start_stop_ref(name.bytes(), output_sections, id) {
                start_stop_refs.push(start_stop);
                continue;
            }

            report_undefined(symbol_db, objects, id, diagnostics);
        }
    }

    for (id, definition) in updates {
        symbol_db.set_definition(id, definition);
    }

    start_stop_refs
}

fn start_stop_ref(
    name: &[u8],
    output_sections: &OutputSections<'_>,
    symbol_id: SymbolId,
) -> Option<StartStopRef> {
    let (section_name, is_stop) = if let Some(rest) = name.strip_prefix(b"__start_") {
        (rest, false)
    } else if let Some(rest) = name.strip_prefix(b"__stop_") {
        (rest, true)
    } else {
        return None;
    };
    let section_id = output_sections.custom_name_to_id(section_name)?;
    Some(StartStopRef {
        symbol_id,
        section_id,
        is_stop,
    })
}

fn report_undefined(
    symbol_db: &SymbolDb<'_>,
    objects: &[ResolvedObject<'_>],
    id: SymbolId,
    diagnostics: &Diagnostics,
) {
    let file_id = symbol_db.file_id_for_symbol(id);

    // Weak references resolve to zero.
    let is_weak = {
        let file = symbol_db.file(file_id);
        match &file.entry {
            FileEntry::Prelude(_) => false,
            FileEntry::Object(parsed) => {
                let index = file.symbol_id_range.id_to_input(id);
                parsed
                    .object
                    .symbol(index)
                    .map(|s| s.is_weak())
                    .unwrap_or(false)
            }
        }
    };
    if is_weak {
        return;
    }

    let from_shared = file_id != PRELUDE_FILE_ID
        && objects
            .get(file_id.as_usize() - 1)
            .is_some_and(|o| o.is_dynamic);

    let policy = symbol_db.args.unresolved_symbols;
    let ignore = match policy {
        UnresolvedSymbols::ReportAll => false,
        UnresolvedSymbols::IgnoreAll => true,
        UnresolvedSymbols::IgnoreInSharedLibs => from_shared,
        UnresolvedSymbols::IgnoreInObjectFiles => !from_shared,
    };
    // Shared objects are allowed undefined symbols unless -z defs.
    let allowed = (from_shared || symbol_db.output_kind.is_shared_object())
        && !symbol_db.args.no_undefined;
    // Relocatable output keeps undefined symbols as-is.
    if ignore || allowed || symbol_db.output_kind.is_relocatable_object() {
        return;
    }

    diagnostics.undefined_symbol(symbol_db, id);
}

impl SymbolDb<'_> {
    /// Returns the size and alignment of a common symbol.
    pub(crate) fn common_size_and_alignment(&self, id: SymbolId) -> Option<(u64, Alignment)> {
        let file = self.file(self.file_id_for_symbol(id));
        let parsed = file.object()?;
        let index = file.symbol_id_range.id_to_input(id);
        let symbol = parsed.object.symbol(index).ok()?;
        let e = LittleEndian;
        if !symbol.is_common(e) {
            return None;
        }
        // For commons, st_value holds the required alignment.
        let alignment = Alignment::new(symbol.st_value(e).max(1)).ok()?;
        Some((symbol.st_size(e), alignment))
    }
}

