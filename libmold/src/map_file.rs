//! `-M` / `--print-map`: prints a link map in roughly the format of the GNU
//! linkers: output sections with their addresses and sizes, the input
//! sections placed in them, and the symbols defined in each.

use crate::layout::Layout;
use crate::output_section_id::OrderEvent;
use crate::resolution::SectionSlot;
use std::io::Write as _;

pub(crate) fn print_map(layout: &Layout<'_>) {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = write_map(layout, &mut out);
}

fn write_map(layout: &Layout<'_>, out: &mut dyn std::io::Write) -> std::io::Result<()> {
    writeln!(out, "             VMA       Size Align Out     In      Symbol")?;

    for event in &layout.output_order {
        let OrderEvent::Section(id) = event else {
            continue;
        };
        let record = layout.section_layout(*id);
        if !record.active || record.mem_size == 0 {
            continue;
        }
        let name = layout.output_sections.name(*id);
        writeln!(
            out,
            "{:>16x} {:>10x} {:>5} {}",
            record.address,
            record.mem_size,
            record.alignment.value(),
            name,
        )?;

        for object in &layout.resolution.objects {
            if !object.is_loaded || object.is_dynamic {
                continue;
            }
            let file = layout.symbol_db.file(object.file_id);
            let Some(parsed) = file.object() else {
                continue;
            };
            for slot in &object.sections {
                let SectionSlot::Loaded(section) = slot else {
                    continue;
                };
                if section.output_section != *id || !section.is_alive() {
                    continue;
                }
                writeln!(
                    out,
                    "{:>16x} {:>10x} {:>5}         {}:({})",
                    record.address + section.output_offset,
                    section.size,
                    section.alignment.value(),
                    parsed.input,
                    String::from_utf8_lossy(section.name),
                )?;
            }
        }
    }

    // Global symbols with their final addresses.
    writeln!(out)?;
    for entry in layout.symtab_plan.entries.iter().skip(1) {
        if entry.value == 0 {
            continue;
        }
        let canonical = layout.symbol_db.definition(entry.symbol_id);
        writeln!(
            out,
            "{:>16x}                        {}",
            entry.value,
            layout.symbol_db.symbol_name_for_display(canonical),
        )?;
    }
    Ok(())
}
