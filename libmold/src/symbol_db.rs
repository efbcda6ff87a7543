//! The global symbol database: reads the global symbols of every input file
//! and builds a map from names to symbol IDs together with where each symbol
//! can be obtained. The actual choice of winning definition happens during
//! resolution; this module owns the storage and the name lookup.

use crate::args::Args;
use crate::args::OutputKind;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::input_data::FileId;
use crate::input_data::PRELUDE_FILE_ID;
use crate::parsing::ParsedInputObject;
use crate::parsing::Prelude;
use crate::parsing::SymbolPlacement;
use crate::symbol::PreHashedSymbolName;
use crate::symbol::SymbolName;
use crate::symbol::VersionedSymbolName;
use crate::value_flags::ValueFlags;
use crate::version_script::VersionScript;
use object::LittleEndian;
use object::read::elf::Sym as _;
use rayon::iter::IndexedParallelIterator as _;
use rayon::iter::IntoParallelRefIterator as _;
use rayon::iter::IntoParallelRefMutIterator as _;
use rayon::iter::ParallelIterator as _;
use std::fmt::Display;

/// An ID for a symbol. All symbols of all input files get a unique ID; ID 0
/// is the undefined symbol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SymbolId(u32);

impl SymbolId {
    pub(crate) const fn undefined() -> Self {
        Self(0)
    }

    pub(crate) fn from_usize(raw: usize) -> Self {
        Self(raw as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn is_undefined(self) -> bool {
        self.0 == 0
    }
}

impl Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The range of symbol IDs belonging to one file. Translates between global
/// symbol IDs, input symtab indexes and offsets into our per-file arrays.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SymbolIdRange {
    start: SymbolId,
    num_symbols: usize,
}

impl SymbolIdRange {
    pub(crate) fn new(start: SymbolId, num_symbols: usize) -> Self {
        Self { start, num_symbols }
    }

    pub(crate) fn len(&self) -> usize {
        self.num_symbols
    }

    pub(crate) fn start(&self) -> SymbolId {
        self.start
    }

    pub(crate) fn as_usize(&self) -> std::ops::Range<usize> {
        self.start.as_usize()..self.start.as_usize() + self.num_symbols
    }

    pub(crate) fn contains(&self, id: SymbolId) -> bool {
        self.as_usize().contains(&id.as_usize())
    }

    pub(crate) fn offset_to_id(&self, offset: usize) -> SymbolId {
        debug_assert!(offset < self.num_symbols);
        SymbolId::from_usize(self.start.as_usize() + offset)
    }

    pub(crate) fn id_to_offset(&self, id: SymbolId) -> usize {
        let offset = id.as_usize() - self.start.as_usize();
        debug_assert!(offset < self.num_symbols);
        offset
    }

    pub(crate) fn input_to_id(&self, index: object::SymbolIndex) -> SymbolId {
        self.offset_to_id(index.0)
    }

    pub(crate) fn id_to_input(&self, id: SymbolId) -> object::SymbolIndex {
        object::SymbolIndex(self.id_to_offset(id))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = SymbolId> {
        self.as_usize().map(SymbolId::from_usize)
    }
}

pub(crate) enum FileEntry<'data> {
    Prelude(Prelude<'data>),
    Object(Box<ParsedInputObject<'data>>),
}

pub(crate) struct SymbolFileInfo<'data> {
    pub(crate) entry: FileEntry<'data>,
    pub(crate) file_id: FileId,
    pub(crate) symbol_id_range: SymbolIdRange,
}

impl<'data> SymbolFileInfo<'data> {
    pub(crate) fn object(&self) -> Option<&ParsedInputObject<'data>> {
        match &self.entry {
            FileEntry::Object(o) => Some(o),
            FileEntry::Prelude(_) => None,
        }
    }

    pub(crate) fn prelude(&self) -> Option<&Prelude<'data>> {
        match &self.entry {
            FileEntry::Prelude(p) => Some(p),
            FileEntry::Object(_) => None,
        }
    }
}

/// How strongly a symbol occurrence binds during resolution. The ladder
/// follows the ELF rules: a defined strong beats a defined weak beats a
/// common beats undefined, and definitions in shared objects are overridden
/// by any regular definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SymbolStrength {
    Undefined,
    DynamicWeak,
    Dynamic,
    Common,
    Weak,
    Strong,
}

struct SymbolBucket<'data> {
    /// Maps names to the first symbol with that name. This may not be the
    /// selected definition; resolution consults `alternatives` too.
    name_to_id: PassThroughHashMap<SymbolName<'data>, SymbolId>,

    versioned_name_to_id: PassThroughHashMap<VersionedSymbolName<'data>, SymbolId>,

    /// Additional definitions for names that have more than one, keyed by
    /// the first symbol with the name.
    alternatives: hashbrown::HashMap<SymbolId, Vec<SymbolId>>,
}

pub(crate) struct SymbolDb<'data> {
    pub(crate) args: &'data Args,
    pub(crate) output_kind: OutputKind,

    pub(crate) files: Vec<SymbolFileInfo<'data>>,

    buckets: Vec<SymbolBucket<'data>>,

    /// Which file each symbol belongs to.
    symbol_file_ids: Vec<FileId>,

    /// The canonical definition of each symbol. Locals and winning globals
    /// point at themselves.
    pub(crate) symbol_definitions: Vec<SymbolId>,

    pub(crate) symbol_value_flags: Vec<ValueFlags>,

    pub(crate) version_script: VersionScript<'data>,
    pub(crate) export_list: VersionScript<'data>,

    /// Entry point named by a linker script (overridden by -e).
    pub(crate) script_entry: Option<&'data str>,
}

#[derive(Clone, Copy)]
struct PendingSymbol<'data> {
    symbol_id: SymbolId,
    name: PreHashedSymbolName<'data>,
    is_definition: bool,
}

struct SymbolLoadOutputs<'data> {
    pending_by_bucket: Vec<Vec<PendingSymbol<'data>>>,
}

fn num_symbol_hash_buckets(args: &Args) -> usize {
    (args.available_threads().get() * 2).next_power_of_two()
}

impl<'data> SymbolDb<'data> {
    #[tracing::instrument(skip_all, name = "Build symbol DB")]
    pub(crate) fn build(
        prelude: Prelude<'data>,
        objects: Vec<Box<ParsedInputObject<'data>>>,
        version_script_data: Option<&'data [u8]>,
        dynamic_list_data: Option<&'data [u8]>,
        script_entry: Option<&'data str>,
        output_kind: OutputKind,
        args: &'data Args,
    ) -> Result<Self> {
        let version_script = version_script_data
            .map(VersionScript::parse)
            .transpose()?
            .unwrap_or_default();
        let export_list = dynamic_list_data
            .map(VersionScript::parse_dynamic_list)
            .transpose()?
            .unwrap_or_default();

        let mut files = Vec::with_capacity(objects.len() + 1);
        let mut next_symbol_id = 0usize;
        let prelude_range = SymbolIdRange::new(SymbolId::undefined(), prelude.num_symbols());
        next_symbol_id += prelude.num_symbols();
        files.push(SymbolFileInfo {
            entry: FileEntry::Prelude(prelude),
            file_id: PRELUDE_FILE_ID,
            symbol_id_range: prelude_range,
        });
        for (i, object) in objects.into_iter().enumerate() {
            let num_symbols = object.num_symbols();
            let range = SymbolIdRange::new(SymbolId::from_usize(next_symbol_id), num_symbols);
            next_symbol_id += num_symbols;
            files.push(SymbolFileInfo {
                entry: FileEntry::Object(object),
                file_id: FileId::from_usize(i + 1),
                symbol_id_range: range,
            });
        }
        let num_symbols = next_symbol_id;

        let mut db = SymbolDb {
            args,
            output_kind,
            files,
            buckets: Vec::new(),
            symbol_file_ids: vec![PRELUDE_FILE_ID; num_symbols],
            symbol_definitions: (0..num_symbols).map(SymbolId::from_usize).collect(),
            symbol_value_flags: vec![ValueFlags::default(); num_symbols],
            version_script,
            export_list,
            script_entry,
        };

        let num_buckets = num_symbol_hash_buckets(args);
        let per_file_outputs: Vec<SymbolLoadOutputs> = db
            .files
            .par_iter()
            .map(|file| read_symbols(file, num_buckets))
            .collect::<Result<Vec<_>>>()?;

        // Record file ownership and value flags serially (cheap, and keeps
        // the arrays free of atomics).
        for file in &db.files {
            for id in file.symbol_id_range.iter() {
                db.symbol_file_ids[id.as_usize()] = file.file_id;
            }
        }
        let flags_outputs: Vec<(SymbolIdRange, Vec<ValueFlags>)> = db
            .files
            .par_iter()
            .map(|file| {
                (
                    file.symbol_id_range,
                    compute_file_value_flags(file, output_kind),
                )
            })
            .collect();
        for (range, flags) in flags_outputs {
            db.symbol_value_flags[range.as_usize()].copy_from_slice(&flags);
        }

        db.buckets = (0..num_buckets)
            .map(|_| SymbolBucket {
                name_to_id: Default::default(),
                versioned_name_to_id: Default::default(),
                alternatives: Default::default(),
            })
            .collect();
        db.buckets
            .par_iter_mut()
            .enumerate()
            .for_each(|(bucket_index, bucket)| {
                for outputs in &per_file_outputs {
                    for pending in &outputs.pending_by_bucket[bucket_index] {
                        bucket.add(pending);
                    }
                }
            });

        Ok(db)
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.symbol_definitions.len()
    }

    pub(crate) fn file(&self, file_id: FileId) -> &SymbolFileInfo<'data> {
        &self.files[file_id.as_usize()]
    }

    pub(crate) fn file_id_for_symbol(&self, id: SymbolId) -> FileId {
        self.symbol_file_ids[id.as_usize()]
    }

    pub(crate) fn definition(&self, id: SymbolId) -> SymbolId {
        self.symbol_definitions[id.as_usize()]
    }

    pub(crate) fn set_definition(&mut self, id: SymbolId, definition: SymbolId) {
        self.symbol_definitions[id.as_usize()] = definition;
    }

    pub(crate) fn is_canonical(&self, id: SymbolId) -> bool {
        self.definition(id) == id
    }

    pub(crate) fn value_flags(&self, id: SymbolId) -> ValueFlags {
        self.symbol_value_flags[id.as_usize()]
    }

    pub(crate) fn merge_value_flags(&mut self, id: SymbolId, other: ValueFlags) {
        self.symbol_value_flags[id.as_usize()].merge(other);
    }

    fn bucket_for_hash(&self, hash: u64) -> &SymbolBucket<'data> {
        &self.buckets[hash as usize % self.buckets.len()]
    }

    /// Finds the first symbol with the given unversioned name.
    pub(crate) fn lookup(&self, name: &PreHashed<SymbolName<'data>>) -> Option<SymbolId> {
        self.bucket_for_hash(name.hash())
            .name_to_id
            .get(name)
            .copied()
    }

    pub(crate) fn lookup_versioned(
        &self,
        name: &PreHashed<VersionedSymbolName<'data>>,
    ) -> Option<SymbolId> {
        self.bucket_for_hash(name.hash())
            .versioned_name_to_id
            .get(name)
            .copied()
    }

    /// Looks a name up, applying `--wrap` substitutions: references to a
    /// wrapped symbol go to `__wrap_sym`, references to `__real_sym` go to
    /// the original definition.
    pub(crate) fn lookup_with_wrap(
        &self,
        name: &PreHashed<SymbolName<'data>>,
    ) -> Option<SymbolId> {
        if !self.args.wrap.is_empty() {
            let bytes = name.bytes();
            if let Some(real) = bytes.strip_prefix(b"__real_") {
                if self.is_wrapped(real) {
                    return self.lookup(&SymbolName::prehashed(real));
                }
            } else if self.is_wrapped(bytes) {
                let wrapped = [b"__wrap_".as_slice(), bytes].concat();
                if let Some(id) = self.lookup_owned_name(&wrapped) {
                    return Some(id);
                }
            }
        }
        self.lookup(name)
    }

    fn lookup_owned_name(&self, name_bytes: &[u8]) -> Option<SymbolId> {
        let name = SymbolName::prehashed(name_bytes);
        self.bucket_for_hash(name.hash())
            .name_to_id
            .get(&name)
            .copied()
    }

    fn is_wrapped(&self, name: &[u8]) -> bool {
        self.args.wrap.iter().any(|w| w.as_bytes() == name)
    }

    /// The first symbol of every distinct name in the database, versioned
    /// and unversioned. Sorted for determinism.
    pub(crate) fn all_first_symbols(&self) -> Vec<SymbolId> {
        let mut out: Vec<SymbolId> = self
            .buckets
            .iter()
            .flat_map(|bucket| {
                bucket
                    .name_to_id
                    .values()
                    .chain(bucket.versioned_name_to_id.values())
                    .copied()
            })
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// All definition candidates for the name owned by `first`: the first
    /// symbol plus any alternatives recorded for it. A name's alternatives
    /// live in exactly one bucket, and the bucket count is small, so we just
    /// check them all.
    pub(crate) fn candidate_definitions(&self, first: SymbolId) -> Vec<SymbolId> {
        let mut out = vec![first];
        for bucket in &self.buckets {
            if let Some(alternatives) = bucket.alternatives.get(&first) {
                out.extend_from_slice(alternatives);
            }
        }
        out
    }

    /// The version spelled in the symbol's name (`foo@VER` / `foo@@VER`),
    /// if any.
    pub(crate) fn symbol_version(&self, id: SymbolId) -> Option<&'data [u8]> {
        let file = self.file(self.file_id_for_symbol(id));
        let object = file.object()?;
        let index = file.symbol_id_range.id_to_input(id);
        let symbol = object.object.symbol(index).ok()?;
        let raw_name = object.object.symbol_name(symbol).ok()?;
        split_version(raw_name).1
    }

    /// The name of the supplied symbol as spelled in its file, minus any
    /// version suffix.
    pub(crate) fn symbol_name(&self, id: SymbolId) -> Result<SymbolName<'data>> {
        let file = self.file(self.file_id_for_symbol(id));
        match &file.entry {
            FileEntry::Prelude(prelude) => {
                let offset = file.symbol_id_range.id_to_offset(id);
                Ok(SymbolName::new(prelude.symbol_definitions[offset].name))
            }
            FileEntry::Object(object) => {
                let index = file.symbol_id_range.id_to_input(id);
                let symbol = object.object.symbol(index)?;
                let raw_name = object.object.symbol_name(symbol)?;
                Ok(SymbolName::new(split_version(raw_name).0))
            }
        }
    }

    pub(crate) fn symbol_name_for_display(&self, id: SymbolId) -> String {
        self.symbol_name(id)
            .map(|n| n.to_string())
            .unwrap_or_else(|_| format!("<invalid symbol {id}>"))
    }

    /// How strongly the supplied symbol binds. Symbols in discarded comdat
    /// sections are reported by the caller as `Undefined` via
    /// `discarded_sections`.
    pub(crate) fn symbol_strength(&self, id: SymbolId) -> SymbolStrength {
        let file = self.file(self.file_id_for_symbol(id));
        match &file.entry {
            FileEntry::Prelude(prelude) => {
                let offset = file.symbol_id_range.id_to_offset(id);
                let def = &prelude.symbol_definitions[offset];
                match def.placement {
                    SymbolPlacement::Undefined | SymbolPlacement::ForceUndefined => {
                        SymbolStrength::Undefined
                    }
                    _ if def.is_weak => SymbolStrength::Weak,
                    _ => SymbolStrength::Strong,
                }
            }
            FileEntry::Object(object) => {
                let e = LittleEndian;
                let index = file.symbol_id_range.id_to_input(id);
                let Ok(symbol) = object.object.symbol(index) else {
                    return SymbolStrength::Undefined;
                };
                if symbol.is_undefined(e) {
                    SymbolStrength::Undefined
                } else if object.is_dynamic {
                    if symbol.is_weak() {
                        SymbolStrength::DynamicWeak
                    } else {
                        SymbolStrength::Dynamic
                    }
                } else if symbol.is_common(e) {
                    SymbolStrength::Common
                } else if symbol.is_weak() {
                    SymbolStrength::Weak
                } else {
                    SymbolStrength::Strong
                }
            }
        }
    }
}

impl<'data> SymbolBucket<'data> {
    fn add(&mut self, pending: &PendingSymbol<'data>) {
        match pending.name {
            PreHashedSymbolName::Unversioned(name) => {
                match self.name_to_id.entry(name) {
                    hashbrown::hash_map::Entry::Vacant(entry) => {
                        entry.insert(pending.symbol_id);
                    }
                    hashbrown::hash_map::Entry::Occupied(entry) => {
                        if pending.is_definition {
                            let first = *entry.get();
                            self.alternatives
                                .entry(first)
                                .or_default()
                                .push(pending.symbol_id);
                        }
                    }
                }
            }
            PreHashedSymbolName::Versioned(name) => {
                match self.versioned_name_to_id.entry(name) {
                    hashbrown::hash_map::Entry::Vacant(entry) => {
                        entry.insert(pending.symbol_id);
                    }
                    hashbrown::hash_map::Entry::Occupied(entry) => {
                        if pending.is_definition {
                            let first = *entry.get();
                            self.alternatives
                                .entry(first)
                                .or_default()
                                .push(pending.symbol_id);
                        }
                    }
                }
            }
        }
    }
}

/// Splits a symbol name at a version delimiter. Returns the bare name, the
/// version (if any) and whether the version is the default (`@@`).
pub(crate) fn split_version(raw_name: &[u8]) -> (&[u8], Option<&[u8]>, bool) {
    let Some(at) = memchr::memchr(b'@', raw_name) else {
        return (raw_name, None, false);
    };
    let name = &raw_name[..at];
    let rest = &raw_name[at + 1..];
    if let Some(version) = rest.strip_prefix(b"@") {
        (name, Some(version), true)
    } else {
        (name, Some(rest), false)
    }
}

fn read_symbols<'data>(
    file: &SymbolFileInfo<'data>,
    num_buckets: usize,
) -> Result<SymbolLoadOutputs<'data>> {
    let mut outputs = SymbolLoadOutputs {
        pending_by_bucket: vec![Vec::new(); num_buckets],
    };
    let mut push = |pending: PendingSymbol<'data>| {
        let hash = match &pending.name {
            PreHashedSymbolName::Unversioned(n) => n.hash(),
            PreHashedSymbolName::Versioned(n) => n.hash(),
        };
        outputs.pending_by_bucket[hash as usize % num_buckets].push(pending);
    };

    match &file.entry {
        FileEntry::Prelude(prelude) => {
            for (offset, def) in prelude.symbol_definitions.iter().enumerate() {
                if def.name.is_empty() {
                    continue;
                }
                push(PendingSymbol {
                    symbol_id: file.symbol_id_range.offset_to_id(offset),
                    name: PreHashedSymbolName::Unversioned(SymbolName::prehashed(def.name)),
                    is_definition: !matches!(
                        def.placement,
                        SymbolPlacement::Undefined | SymbolPlacement::ForceUndefined
                    ),
                });
            }
        }
        FileEntry::Object(object) => {
            let e = LittleEndian;
            let elf_file = &object.object;
            let versions = if object.is_dynamic {
                elf_file.version_names()?
            } else {
                Vec::new()
            };
            for (index, symbol) in elf_file.symbols.enumerate() {
                if symbol.is_local() {
                    continue;
                }
                let symbol_id = file.symbol_id_range.input_to_id(index);
                let raw_name = elf_file.symbol_name(symbol)?;
                let (name_bytes, mut version, mut is_default) = split_version(raw_name);
                if name_bytes.is_empty() {
                    continue;
                }
                let is_definition = !symbol.is_undefined(e);

                // Shared objects carry versions in the versym table rather
                // than in symbol names.
                if object.is_dynamic && version.is_none() {
                    if let Some(versym) = elf_file.versym.get(index.0) {
                        let raw = versym.0.get(e);
                        let version_index = (raw & object::elf::VERSYM_VERSION) as usize;
                        is_default = raw & object::elf::VERSYM_HIDDEN == 0;
                        if version_index > object::elf::VER_NDX_GLOBAL as usize {
                            version = versions.get(version_index).copied().flatten();
                        }
                    }
                }

                let name = SymbolName::prehashed(name_bytes);
                match version {
                    Some(version_bytes) if is_definition => {
                        push(PendingSymbol {
                            symbol_id,
                            name: PreHashedSymbolName::Versioned(VersionedSymbolName::prehashed(
                                name,
                                version_bytes,
                            )),
                            is_definition,
                        });
                        // The default version also satisfies unversioned
                        // references.
                        if is_default {
                            push(PendingSymbol {
                                symbol_id,
                                name: PreHashedSymbolName::Unversioned(name),
                                is_definition,
                            });
                        }
                    }
                    Some(version_bytes) => {
                        push(PendingSymbol {
                            symbol_id,
                            name: PreHashedSymbolName::Versioned(VersionedSymbolName::prehashed(
                                name,
                                version_bytes,
                            )),
                            is_definition,
                        });
                    }
                    None => {
                        push(PendingSymbol {
                            symbol_id,
                            name: PreHashedSymbolName::Unversioned(name),
                            is_definition,
                        });
                    }
                }
            }
        }
    }
    Ok(outputs)
}

/// Computes the initial value flags for every symbol of a file.
fn compute_file_value_flags(
    file: &SymbolFileInfo<'_>,
    output_kind: OutputKind,
) -> Vec<ValueFlags> {
    match &file.entry {
        FileEntry::Prelude(prelude) => prelude
            .symbol_definitions
            .iter()
            .map(|def| {
                let mut flags = ValueFlags::CAN_BYPASS_GOT;
                if matches!(
                    def.placement,
                    SymbolPlacement::Undefined
                        | SymbolPlacement::ForceUndefined
                        | SymbolPlacement::Absolute(_)
                ) {
                    flags |= ValueFlags::ABSOLUTE;
                }
                flags
            })
            .collect(),
        FileEntry::Object(object) => {
            let e = LittleEndian;
            object
                .object
                .symbols
                .iter()
                .map(|symbol| {
                    let mut flags = ValueFlags::empty();
                    let is_undefined = symbol.is_undefined(e);
                    if is_undefined || symbol.is_absolute(e) {
                        flags |= ValueFlags::ABSOLUTE;
                    }
                    match symbol.st_type() {
                        object::elf::STT_FUNC => flags |= ValueFlags::FUNCTION,
                        object::elf::STT_GNU_IFUNC => {
                            flags |= ValueFlags::IFUNC | ValueFlags::FUNCTION;
                        }
                        object::elf::STT_TLS => flags |= ValueFlags::TLS,
                        _ => {}
                    }
                    if object.is_dynamic {
                        if !is_undefined {
                            flags |= ValueFlags::DYNAMIC;
                        }
                    } else {
                        if !is_undefined {
                            match symbol.st_visibility() {
                                object::elf::STV_PROTECTED => {
                                    flags |= ValueFlags::VISIBILITY_PROTECTED;
                                }
                                object::elf::STV_HIDDEN | object::elf::STV_INTERNAL => {
                                    flags |= ValueFlags::VISIBILITY_HIDDEN;
                                }
                                _ => {}
                            }
                        }
                        let non_interposable = symbol.is_local()
                            || symbol.st_visibility() != object::elf::STV_DEFAULT
                            || !output_kind.is_shared_object();
                        if non_interposable && !flags.contains(ValueFlags::IFUNC) {
                            flags |= ValueFlags::CAN_BYPASS_GOT;
                        }
                    }
                    flags
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_version() {
        assert_eq!(split_version(b"foo"), (b"foo".as_slice(), None, false));
        assert_eq!(
            split_version(b"foo@VER_1"),
            (b"foo".as_slice(), Some(b"VER_1".as_slice()), false)
        );
        assert_eq!(
            split_version(b"foo@@VER_1"),
            (b"foo".as_slice(), Some(b"VER_1".as_slice()), true)
        );
    }

    #[test]
    fn test_strength_ordering_follows_precedence() {
        assert!(SymbolStrength::Strong > SymbolStrength::Weak);
        assert!(SymbolStrength::Weak > SymbolStrength::Common);
        assert!(SymbolStrength::Common > SymbolStrength::Dynamic);
        assert!(SymbolStrength::Dynamic > SymbolStrength::DynamicWeak);
        assert!(SymbolStrength::DynamicWeak > SymbolStrength::Undefined);
    }

    #[test]
    fn test_symbol_id_range_translation() {
        let range = SymbolIdRange::new(SymbolId::from_usize(10), 5);
        assert_eq!(range.offset_to_id(2), SymbolId::from_usize(12));
        assert_eq!(range.id_to_offset(SymbolId::from_usize(12)), 2);
        assert_eq!(range.input_to_id(object::SymbolIndex(4)), SymbolId::from_usize(14));
        assert_eq!(
            range.id_to_input(SymbolId::from_usize(14)),
            object::SymbolIndex(4)
        );
        assert!(range.contains(SymbolId::from_usize(14)));
        assert!(!range.contains(SymbolId::from_usize(15)));
    }
}
