//! `--gc-sections`: a parallel mark pass over the section reference graph.
//! Roots are the entry symbol, symbols the user asked to keep, exported
//! dynamic symbols, `SHF_GNU_RETAIN` sections, init/fini machinery and
//! anything a linker script `KEEP` pattern matches. Edges go from a section
//! to the defining section of every symbol it relocates against. Sections
//! not reached are dead; their symbols become undefined for the rest of the
//! link.

use crate::input_data::PRELUDE_FILE_ID;
use crate::input_data::ScriptInput;
use crate::linker_script::SectionPattern;
use crate::resolution::ResolutionOutputs;
use crate::resolution::SectionSlot;
use crate::symbol::SymbolName;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crossbeam_queue::SegQueue;
use object::LittleEndian;
use object::read::elf::Sym as _;

/// A section to visit: (object index, section index).
type WorkItem = (usize, object::SectionIndex);

#[tracing::instrument(skip_all, name = "Garbage collect sections")]
pub(crate) fn mark_live_sections<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    scripts: &[ScriptInput<'data>],
) {
    let queue: SegQueue<WorkItem> = SegQueue::new();
    let keep_patterns: Vec<SectionPattern> = scripts
        .iter()
        .flat_map(|script| script.script.keep_patterns())
        .collect();

    add_roots(symbol_db, resolution, &keep_patterns, &queue);

    let process = |item: WorkItem, queue: &SegQueue<WorkItem>| {
        mark_neighbours(symbol_db, resolution, item, queue);
    };

    rayon::in_place_scope(|scope| {
        fn drain<'scope, 'env: 'scope>(
            queue: &'env SegQueue<WorkItem>,
            scope: &rayon::Scope<'scope>,
            process: &'env (dyn Fn(WorkItem, &SegQueue<WorkItem>) + Sync),
        ) {
            while let Some(item) = queue.pop() {
                scope.spawn(move |scope| {
                    process(item, queue);
                    drain(queue, scope, process);
                });
            }
        }
        drain(&queue, scope, &process);
    });

    if symbol_db.args.print_gc_sections {
        print_removed_sections(symbol_db, resolution);
    }
}

fn add_roots<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    keep_patterns: &[SectionPattern],
    queue: &SegQueue<WorkItem>,
) {
    // Symbol roots: the entry point and any force-kept symbols.
    let mut root_symbols: Vec<SymbolId> = Vec::new();
    let entry_name = symbol_db.args.entry_symbol_name().as_bytes().to_vec();
    if let Some(first) = symbol_db.lookup(&SymbolName::prehashed(&entry_name)) {
        root_symbols.push(symbol_db.definition(first));
    }
    for name in &symbol_db.args.undefined {
        if let Some(first) = symbol_db.lookup(&SymbolName::prehashed(name.as_bytes())) {
            root_symbols.push(symbol_db.definition(first));
        }
    }

    let export_all = symbol_db.output_kind.is_shared_object()
        || symbol_db.args.export_all_dynamic_symbols;

    for (object_index, object) in resolution.objects.iter().enumerate() {
        if !object.is_loaded || object.is_dynamic {
            continue;
        }
        let file = symbol_db.file(object.file_id);
        let Some(parsed) = file.object() else {
            continue;
        };

        for (section_index, slot) in object.sections.iter().enumerate() {
            let Some(section) = slot.as_loaded() else {
                continue;
            };
            if matches!(slot, SectionSlot::EhFrame(_)) {
                // Exception frames never keep their functions alive; the
                // layout pass prunes FDEs of dead functions instead.
                section.mark_alive();
                continue;
            }
            let is_root = section.flags.contains(crate::elf::shf::GNU_RETAIN)
                || is_retained_name(section.name)
                || keep_patterns.iter().any(|p| p.matches(section.name));
            if is_root && section.mark_alive() {
                queue.push((object_index, object::SectionIndex(section_index)));
            }
        }

        // Exported definitions are roots when we export everything. The
        // merged flags carry the strictest visibility across all
        // definitions of the name, so a hidden losing definition stops the
        // winner from being a root.
        if export_all {
            let e = LittleEndian;
            for (index, symbol) in parsed.object.symbols.enumerate() {
                if symbol.is_local() || symbol.is_undefined(e) {
                    continue;
                }
                let id = file.symbol_id_range.input_to_id(index);
                if symbol_db.is_canonical(id) && symbol_db.value_flags(id).is_exportable() {
                    root_symbols.push(id);
                }
            }
        }
    }

    for id in root_symbols {
        if let Some(item) = defining_section(symbol_db, resolution, id) {
            let (object_index, section_index) = item;
            let object = &resolution.objects[object_index];
            if let Some(section) = object.sections[section_index.0].as_loaded() {
                if section.mark_alive() {
                    queue.push(item);
                }
            }
        }
    }
}

/// Sections whose name alone keeps them alive: initialisation machinery and
/// notes.
fn is_retained_name(name: &[u8]) -> bool {
    const RETAINED_PREFIXES: &[&[u8]] = &[
        b".init",
        b".fini",
        b".init_array",
        b".fini_array",
        b".preinit_array",
        b".ctors",
        b".dtors",
        b".note",
        b".gcc_except_table",
    ];
    RETAINED_PREFIXES
        .iter()
        .any(|prefix| crate::output_section_id::prefix_matches(name, prefix))
}

fn defining_section(
    symbol_db: &SymbolDb<'_>,
    resolution: &ResolutionOutputs<'_>,
    id: SymbolId,
) -> Option<WorkItem> {
    let definition = symbol_db.definition(id);
    let file_id = symbol_db.file_id_for_symbol(definition);
    if file_id == PRELUDE_FILE_ID {
        return None;
    }
    let object_index = file_id.as_usize() - 1;
    let object = &resolution.objects[object_index];
    if object.is_dynamic || !object.is_loaded {
        return None;
    }
    let file = symbol_db.file(file_id);
    let parsed = file.object()?;
    let index = file.symbol_id_range.id_to_input(definition);
    let symbol = parsed.object.symbol(index).ok()?;
    let section_index = parsed.object.symbol_section(symbol, index).ok()??;
    Some((object_index, section_index))
}

fn mark_neighbours<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    (object_index, section_index): WorkItem,
    queue: &SegQueue<WorkItem>,
) {
    let object = &resolution.objects[object_index];
    let file = symbol_db.file(object.file_id);
    let Some(parsed) = file.object() else {
        return;
    };
    let Ok(relocations) = parsed
        .object
        .relocations(section_index, &object.relocation_sections)
    else {
        return;
    };
    for relocation in relocations.iter() {
        let id = file.symbol_id_range.input_to_id(relocation.symbol);
        let Some(item) = defining_section(symbol_db, resolution, id) else {
            continue;
        };
        let target_object = &resolution.objects[item.0];
        let Some(slot) = target_object.sections.get(item.1.0) else {
            continue;
        };
        if let Some(section) = slot.as_loaded() {
            if section.mark_alive() {
                queue.push(item);
            }
        }
    }
}

fn print_removed_sections<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
) {
    for object in &resolution.objects {
        if !object.is_loaded || object.is_dynamic {
            continue;
        }
        let file = symbol_db.file(object.file_id);
        let Some(parsed) = file.object() else {
            continue;
        };
        for slot in &object.sections {
            if let SectionSlot::Loaded(section) = slot {
                if !section.is_alive() {
                    eprintln!(
                        "mold: removing unused section {} in {}",
                        String::from_utf8_lossy(section.name),
                        parsed.input,
                    );
                }
            }
        }
    }
}
