//! Writes the output file. The buffer is split into one slice per output
//! section and the sections are written in parallel: synthetic chunks
//! (headers, dynamic structures, GOT/PLT, hash tables) are generated, input
//! sections are copied with their relocations applied against the finalized
//! symbol addresses. Dynamic relocations discovered while copying are
//! collected and written into their pre-reserved `.rela.dyn` slots
//! afterwards, so output bytes never depend on scheduling.

use crate::arch::Arch;
use crate::arch::Relaxation as _;
use crate::arch::RelocationModifier;
use crate::args::BuildIdOption;
use crate::args::CompressionStyle;
use crate::args::OutputKind;
use crate::bail;
use crate::diagnostics::Diagnostics;
use crate::elf;
use crate::elf::shf;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_writer::SizedOutput;
use crate::layout::EhFrameRecord;
use crate::layout::GotEntry;
use crate::layout::Layout;
use crate::layout::SymbolResolution;
use crate::output_section_id;
use crate::output_section_id::OrderEvent;
use crate::output_section_id::OutputSectionId;
use crate::program_segments;
use crate::relocation::DynamicRelocationKind;
use crate::relocation::RelocationKind;
use crate::relocation::RelocationKindInfo;
use crate::relocation::RelocationSize;
use crate::relocation::page;
use crate::relocation::write_relocation_value;
use crate::resolution::SectionSlot;
use crate::symbol_db::SymbolId;
use crate::value_flags::ValueFlags;
use object::LittleEndian;
use object::read::elf::Sym as _;
use rayon::iter::IntoParallelIterator as _;
use rayon::iter::ParallelIterator as _;
use std::io::Write as _;

const E: LittleEndian = LittleEndian;

/// A dynamic relocation to be written at a reserved index in .rela.dyn.
struct PendingDynReloc {
    index: u64,
    address: u64,
    r_type: u32,
    dynsym_index: u32,
    addend: i64,
}

#[tracing::instrument(skip_all, name = "Write output file")]
pub(crate) fn write<A: Arch>(
    layout: &Layout<'_>,
    output_path: &std::path::Path,
    diagnostics: &Diagnostics,
) -> Result {
    let mut output = SizedOutput::new(output_path, layout.file_size)?;

    write_file_contents::<A>(layout, &mut output.out, diagnostics)?;

    if layout.build_id_size > 0 {
        write_build_id(layout, &mut output.out)?;
    }

    let make_executable = layout.output_kind.is_executable();
    output.flush(make_executable)?;
    Ok(())
}

fn write_file_contents<A: Arch>(
    layout: &Layout<'_>,
    data: &mut [u8],
    diagnostics: &Diagnostics,
) -> Result {
    // Split the buffer: the section header table, then one slice per output
    // section with file content.
    let (section_data, shdr_slice) = {
        let (rest, shdrs) = data.split_at_mut(layout.shdr_offset as usize);
        (rest, shdrs)
    };

    let mut allocations: Vec<(OutputSectionId, usize, usize)> = layout
        .output_sections
        .ids()
        .filter_map(|id| {
            let record = layout.section_layout(id);
            if !record.active || record.file_size == 0 {
                return None;
            }
            Some((id, record.file_offset as usize, record.file_size as usize))
        })
        .collect();
    allocations.sort_by_key(|&(_, offset, _)| offset);

    let mut slices: Vec<(OutputSectionId, &mut [u8])> = Vec::with_capacity(allocations.len());
    let mut rest = section_data;
    let mut position = 0usize;
    for (id, offset, size) in allocations {
        let padding = offset
            .checked_sub(position)
            .context("Output section offsets overlap")?;
        let (_, after_padding) = rest.split_at_mut(padding);
        let (slice, remaining) = after_padding.split_at_mut(size);
        slices.push((id, slice));
        rest = remaining;
        position = offset + size;
    }

    // Which input sections land in each output section.
    let inputs_by_section = collect_inputs_by_section(layout);

    // Pull the .rela.dyn slice out; it's written after the parallel phase.
    let mut rela_dyn_slice = None;
    let mut parallel_slices = Vec::new();
    for (id, slice) in slices {
        if id == output_section_id::RELA_DYN {
            rela_dyn_slice = Some(slice);
        } else {
            parallel_slices.push((id, slice));
        }
    }

    let pending: Vec<Vec<PendingDynReloc>> = parallel_slices
        .into_par_iter()
        .map(|(id, slice)| write_section::<A>(layout, id, slice, &inputs_by_section, diagnostics))
        .collect::<Result<Vec<_>>>()?;

    if let Some(rela_dyn) = rela_dyn_slice {
        for relocation in pending.iter().flatten() {
            write_rela_entry(
                rela_dyn,
                relocation.index,
                relocation.address,
                relocation.r_type,
                relocation.dynsym_index,
                relocation.addend,
            )?;
        }
    }

    write_section_headers(layout, shdr_slice)?;
    Ok(())
}

fn collect_inputs_by_section(layout: &Layout<'_>) -> Vec<Vec<(usize, usize)>> {
    let mut inputs_by_section: Vec<Vec<(usize, usize)>> =
        vec![Vec::new(); layout.output_sections.num_sections()];
    for (object_index, object) in layout.resolution.objects.iter().enumerate() {
        if !object.is_loaded || object.is_dynamic {
            continue;
        }
        for (section_index, slot) in object.sections.iter().enumerate() {
            if let SectionSlot::Loaded(section) = slot {
                if section.is_alive() {
                    inputs_by_section[section.output_section.as_usize()]
                        .push((object_index, section_index));
                }
            }
        }
    }
    inputs_by_section
}

fn write_rela_entry(
    out: &mut [u8],
    index: u64,
    address: u64,
    r_type: u32,
    dynsym_index: u32,
    addend: i64,
) -> Result {
    let offset = (index * elf::RELA_ENTRY_SIZE) as usize;
    let end = offset + elf::RELA_ENTRY_SIZE as usize;
    if end > out.len() {
        bail!("Insufficient .rela allocation");
    }
    let entry = &mut out[offset..end];
    entry[..8].copy_from_slice(&address.to_le_bytes());
    let r_info = (u64::from(dynsym_index) << 32) | u64::from(r_type);
    entry[8..16].copy_from_slice(&r_info.to_le_bytes());
    entry[16..24].copy_from_slice(&addend.to_le_bytes());
    Ok(())
}

fn write_section<A: Arch>(
    layout: &Layout<'_>,
    id: OutputSectionId,
    out: &mut [u8],
    inputs_by_section: &[Vec<(usize, usize)>],
    diagnostics: &Diagnostics,
) -> Result<Vec<PendingDynReloc>> {
    use output_section_id as osid;
    match id {
        _ if id == osid::FILE_HEADER => write_file_header::<A>(layout, out)?,
        _ if id == osid::PROGRAM_HEADERS => write_program_headers(layout, out)?,
        _ if id == osid::INTERP => write_interp(layout, out),
        _ if id == osid::NOTE_GNU_BUILD_ID => write_build_id_note_header(layout, out)?,
        _ if id == osid::HASH => write_sysv_hash(layout, out)?,
        _ if id == osid::GNU_HASH => write_gnu_hash(layout, out)?,
        _ if id == osid::DYNSYM => write_dynsym(layout, out)?,
        _ if id == osid::DYNSTR => out.copy_from_slice(&layout.dynamic_plan.dynstr),
        _ if id == osid::GNU_VERSION => write_gnu_version(layout, out)?,
        _ if id == osid::GNU_VERSION_R => write_gnu_version_r(layout, out)?,
        _ if id == osid::GNU_VERSION_D => write_gnu_version_d(layout, out)?,
        _ if id == osid::RELA_PLT => write_rela_plt::<A>(layout, out)?,
        _ if id == osid::DYNAMIC => write_dynamic_section(layout, out)?,
        _ if id == osid::GOT => return write_got::<A>(layout, out),
        _ if id == osid::GOT_PLT => write_got_plt(layout, out)?,
        _ if id == osid::PLT => write_plt::<A>(layout, out)?,
        _ if id == osid::EH_FRAME && !layout.output_kind.is_relocatable_object() => {
            return write_eh_frame::<A>(layout, out, diagnostics);
        }
        _ if id == osid::EH_FRAME_HDR => write_eh_frame_hdr::<A>(layout, out)?,
        _ if id == osid::SYMTAB => write_symtab(layout, out)?,
        _ if id == osid::STRTAB => out.copy_from_slice(&layout.symtab_plan.strtab),
        _ if id == osid::SHSTRTAB => out.copy_from_slice(&layout.shstrtab),
        _ => {
            // A .rela section for relocatable output?
            if let Some((&target, _)) = layout
                .rela_sections
                .iter()
                .find(|(_, (rela_id, _))| *rela_id == id)
            {
                write_rela_section(layout, target, out, inputs_by_section)?;
                return Ok(Vec::new());
            }
            return write_regular_section::<A>(layout, id, out, inputs_by_section, diagnostics);
        }
    }
    Ok(Vec::new())
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

fn write_file_header<A: Arch>(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    let header = &mut out[..elf::FILE_HEADER_SIZE as usize];
    header[..4].copy_from_slice(&object::elf::ELFMAG);
    header[4] = object::elf::ELFCLASS64;
    header[5] = object::elf::ELFDATA2LSB;
    header[6] = 1; // EV_CURRENT
    header[7] = 0; // ELFOSABI_NONE
    header[8..16].fill(0);

    let e_type = match layout.output_kind {
        OutputKind::Relocatable => object::elf::ET_REL,
        OutputKind::SharedObject => object::elf::ET_DYN,
        OutputKind::StaticExecutable(model) | OutputKind::DynamicExecutable(model) => {
            if model == crate::args::RelocationModel::Relocatable {
                object::elf::ET_DYN
            } else {
                object::elf::ET_EXEC
            }
        }
    };
    header[16..18].copy_from_slice(&e_type.to_le_bytes());
    header[18..20].copy_from_slice(&A::elf_header_arch_magic().to_le_bytes());
    header[20..24].copy_from_slice(&1u32.to_le_bytes()); // e_version
    header[24..32].copy_from_slice(&layout.entry_address.to_le_bytes());
    let e_phoff = if layout.output_kind.is_relocatable_object() {
        0
    } else {
        elf::PHEADER_OFFSET
    };
    header[32..40].copy_from_slice(&e_phoff.to_le_bytes());
    header[40..48].copy_from_slice(&layout.shdr_offset.to_le_bytes());
    header[48..52].copy_from_slice(&layout.merged_eflags.to_le_bytes());
    header[52..54].copy_from_slice(&elf::FILE_HEADER_SIZE.to_le_bytes());
    header[54..56].copy_from_slice(&elf::PROGRAM_HEADER_SIZE.to_le_bytes());
    let phnum = if layout.output_kind.is_relocatable_object() {
        0
    } else {
        num_program_headers(layout)
    };
    header[56..58].copy_from_slice(&phnum.to_le_bytes());
    header[58..60].copy_from_slice(&elf::SECTION_HEADER_SIZE.to_le_bytes());
    header[60..62].copy_from_slice(&layout.num_output_sections.to_le_bytes());
    let shstrndx = layout.output_section_indexes[output_section_id::SHSTRTAB.as_usize()]
        .context("No .shstrtab section")?;
    header[62..64].copy_from_slice(&shstrndx.to_le_bytes());
    Ok(())
}

fn num_program_headers(layout: &Layout<'_>) -> u16 {
    let mut count = 0u16;
    for segment_id in program_segments::ProgramSegmentId::all() {
        if layout.segment_layouts[segment_id.as_usize()].active {
            count += 1;
        }
    }
    count + 1 // PT_GNU_STACK is always emitted
}

fn write_program_headers(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    let mut cursor = 0usize;
    let mut write_phdr = |p_type: u32,
                          flags: u32,
                          offset: u64,
                          vaddr: u64,
                          filesz: u64,
                          memsz: u64,
                          align: u64|
     -> Result {
        let end = cursor + elf::PROGRAM_HEADER_SIZE as usize;
        if end > out.len() {
            bail!("Insufficient program header allocation");
        }
        let entry = &mut out[cursor..end];
        entry[0..4].copy_from_slice(&p_type.to_le_bytes());
        entry[4..8].copy_from_slice(&flags.to_le_bytes());
        entry[8..16].copy_from_slice(&offset.to_le_bytes());
        entry[16..24].copy_from_slice(&vaddr.to_le_bytes());
        entry[24..32].copy_from_slice(&vaddr.to_le_bytes()); // p_paddr
        entry[32..40].copy_from_slice(&filesz.to_le_bytes());
        entry[40..48].copy_from_slice(&memsz.to_le_bytes());
        entry[48..56].copy_from_slice(&align.to_le_bytes());
        cursor = end;
        Ok(())
    };

    for segment_id in program_segments::ProgramSegmentId::all() {
        let segment = &layout.segment_layouts[segment_id.as_usize()];
        if !segment.active {
            continue;
        }
        let def = segment_id.def();
        let flags = def.flags;
        let mut alignment = segment.alignment.value().max(def.min_alignment.value());
        if segment_id.is_load() {
            alignment = alignment.max(layout.args.max_page_size.value());
        }
        if segment_id == program_segments::PHDR {
            // PT_PHDR describes exactly the program header table.
            let size = u64::from(num_program_headers(layout))
                * u64::from(elf::PROGRAM_HEADER_SIZE);
            write_phdr(
                def.segment_type,
                flags,
                segment.file_offset,
                segment.address,
                size,
                size,
                alignment,
            )?;
            continue;
        }
        write_phdr(
            def.segment_type,
            flags,
            segment.file_offset,
            segment.address,
            segment.file_size,
            segment.mem_size,
            alignment,
        )?;
    }

    // PT_GNU_STACK carries no content; its flags say whether the stack is
    // executable.
    let mut stack_flags = object::elf::PF_R | object::elf::PF_W;
    if layout.args.execstack {
        stack_flags |= object::elf::PF_X;
    }
    write_phdr(
        object::elf::PT_GNU_STACK,
        stack_flags,
        0,
        0,
        0,
        0,
        crate::alignment::STACK.value(),
    )?;
    Ok(())
}

fn write_section_headers(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    let mut cursor = elf::SECTION_HEADER_SIZE as usize; // the null section
    for event in &layout.output_order {
        let OrderEvent::Section(id) = event else {
            continue;
        };
        let raw = id.as_usize();
        if layout.output_section_indexes[raw].is_none() {
            continue;
        }
        let record = layout.section_layout(*id);
        let info = layout.output_sections.info(*id);
        let end = cursor + elf::SECTION_HEADER_SIZE as usize;
        if end > out.len() {
            bail!("Insufficient section header allocation");
        }
        let entry = &mut out[cursor..end];
        entry[0..4].copy_from_slice(&layout.section_name_offsets[raw].to_le_bytes());
        entry[4..8].copy_from_slice(&info.ty.to_le_bytes());
        let mut sh_flags = info.section_flags.raw();
        if layout.output_kind.is_relocatable_object() {
            // Relocatable output keeps merge flags off; we've already
            // regrouped the sections.
            sh_flags &= !(u64::from(object::elf::SHF_MERGE | object::elf::SHF_STRINGS));
        }
        if layout.compressed_debug.contains_key(id) {
            sh_flags |= u64::from(object::elf::SHF_COMPRESSED);
        }
        entry[8..16].copy_from_slice(&sh_flags.to_le_bytes());
        entry[16..24].copy_from_slice(&record.address.to_le_bytes());
        entry[24..32].copy_from_slice(&record.file_offset.to_le_bytes());
        let sh_size = if info.ty == object::elf::SHT_NOBITS {
            record.mem_size
        } else {
            record.file_size
        };
        entry[32..40].copy_from_slice(&sh_size.to_le_bytes());
        let (link, sh_info) = section_link_and_info(layout, *id);
        entry[40..44].copy_from_slice(&link.to_le_bytes());
        entry[44..48].copy_from_slice(&sh_info.to_le_bytes());
        entry[48..56].copy_from_slice(&record.alignment.value().to_le_bytes());
        entry[56..64].copy_from_slice(&info.element_size.to_le_bytes());
        cursor = end;
    }
    Ok(())
}

fn section_link_and_info(layout: &Layout<'_>, id: OutputSectionId) -> (u32, u32) {
    use output_section_id as osid;
    let index_of = |target: OutputSectionId| -> u32 {
        layout.output_section_indexes[target.as_usize()]
            .map(u32::from)
            .unwrap_or(0)
    };
    if id.as_usize() < osid::NUM_BUILT_IN_SECTIONS {
        if let Some(link) = id.built_in_details().link {
            let info = match id {
                _ if id == osid::DYNSYM => 1, // index of first non-local
                _ if id == osid::SYMTAB => layout.symtab_plan.num_locals,
                _ if id == osid::RELA_PLT => index_of(osid::GOT_PLT),
                _ if id == osid::GNU_VERSION_R => layout.dynamic_plan.verneed.len() as u32,
                _ if id == osid::GNU_VERSION_D => {
                    layout.dynamic_plan.verdef_names.len() as u32 + 1
                }
                _ => 0,
            };
            return (index_of(link), info);
        }
    }
    // .rela sections for relocatable output link to .symtab and point at
    // their target section.
    if let Some((&target, _)) = layout
        .rela_sections
        .iter()
        .find(|(_, (rela_id, _))| *rela_id == id)
    {
        return (index_of(osid::SYMTAB), index_of(target));
    }
    (0, 0)
}

// ---------------------------------------------------------------------------
// Simple synthetic sections
// ---------------------------------------------------------------------------

fn write_interp(layout: &Layout<'_>, out: &mut [u8]) {
    let default = layout.args.arch.default_dynamic_linker();
    let path = layout
        .args
        .dynamic_linker
        .as_deref()
        .map(|p| p.as_os_str().as_encoded_bytes())
        .unwrap_or(default.as_bytes());
    out[..path.len()].copy_from_slice(path);
}

fn write_build_id_note_header(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    // namesz, descsz, type, "GNU\0"; the payload is written after hashing.
    let mut cursor = std::io::Cursor::new(out);
    cursor.write_all(&4u32.to_le_bytes())?;
    cursor.write_all(&(layout.build_id_size as u32).to_le_bytes())?;
    cursor.write_all(&object::elf::NT_GNU_BUILD_ID.to_le_bytes())?;
    cursor.write_all(b"GNU\0")?;
    Ok(())
}

fn write_build_id(layout: &Layout<'_>, data: &mut [u8]) -> Result {
    let record = layout.section_layout(output_section_id::NOTE_GNU_BUILD_ID);
    let payload_offset =
        record.file_offset as usize + size_of::<elf::NoteHeader>() + 4;
    let payload_len = layout.build_id_size as usize;

    let payload: Vec<u8> = match &layout.args.build_id {
        BuildIdOption::Hex(bytes) => bytes.clone(),
        BuildIdOption::Uuid if !layout.args.deterministic => {
            uuid::Uuid::new_v4().as_bytes().to_vec()
        }
        // Fast (and deterministic uuid): a hash of the whole image with the
        // build-id bytes themselves still zero.
        _ => {
            let hash = blake3::hash(data);
            hash.as_bytes()[..payload_len.min(32)].to_vec()
        }
    };
    data[payload_offset..payload_offset + payload_len]
        .copy_from_slice(&payload[..payload_len]);
    Ok(())
}

// ---------------------------------------------------------------------------
// Dynamic linking structures
// ---------------------------------------------------------------------------

fn write_dynsym(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    for (i, entry) in layout.dynamic_plan.dynsyms.iter().enumerate() {
        let offset = i * elf::SYMTAB_ENTRY_SIZE as usize;
        let sym = &mut out[offset..offset + elf::SYMTAB_ENTRY_SIZE as usize];
        if i == 0 {
            continue;
        }
        let id = entry.symbol_id;
        let resolution = layout.resolutions[id.as_usize()].as_ref();
        let value_flags = layout.symbol_db.value_flags(id);
        let is_import = (i as u32) < layout.dynamic_plan.first_export_index;

        sym[0..4].copy_from_slice(&entry.name_offset.to_le_bytes());
        let st_type = if value_flags.contains(ValueFlags::FUNCTION) {
            object::elf::STT_FUNC
        } else if value_flags.contains(ValueFlags::TLS) {
            object::elf::STT_TLS
        } else {
            object::elf::STT_OBJECT
        };
        let bind = object::elf::STB_GLOBAL;
        sym[4] = (bind << 4) | st_type;
        sym[5] = value_flags.st_visibility();

        let copy_address = layout
            .got_plan
            .copy_relocations
            .iter()
            .find(|(s, _, _)| *s == id)
            .map(|(_, offset, _)| {
                layout.section_layout(output_section_id::BSS).address + offset
            });

        if let Some(address) = copy_address {
            // Copy-relocated symbols are exported at their .bss location.
            let shndx =
                layout.output_section_indexes[output_section_id::BSS.as_usize()].unwrap_or(0);
            sym[6..8].copy_from_slice(&shndx.to_le_bytes());
            sym[8..16].copy_from_slice(&address.to_le_bytes());
        } else if is_import {
            sym[6..8].copy_from_slice(&object::elf::SHN_UNDEF.to_le_bytes());
            sym[8..16].fill(0);
        } else if let Some(resolution) = resolution {
            let shndx = shndx_for_address(layout, resolution.value);
            sym[6..8].copy_from_slice(&shndx.to_le_bytes());
            sym[8..16].copy_from_slice(&resolution.value.to_le_bytes());
        }
        let size = defining_symbol_size(layout, id);
        sym[16..24].copy_from_slice(&size.to_le_bytes());
    }
    Ok(())
}

fn defining_symbol_size(layout: &Layout<'_>, id: SymbolId) -> u64 {
    let file = layout.symbol_db.file(layout.symbol_db.file_id_for_symbol(id));
    let Some(parsed) = file.object() else {
        return 0;
    };
    let index = file.symbol_id_range.id_to_input(id);
    parsed
        .object
        .symbol(index)
        .map(|s| s.st_size(E))
        .unwrap_or(0)
}

/// Finds the output section header index containing the given address.
fn shndx_for_address(layout: &Layout<'_>, address: u64) -> u16 {
    if address == 0 {
        return object::elf::SHN_ABS;
    }
    for id in layout.output_sections.ids() {
        let record = layout.section_layout(id);
        if record.active
            && address >= record.address
            && address < record.address + record.mem_size.max(1)
        {
            if let Some(index) = layout.output_section_indexes[id.as_usize()] {
                return index;
            }
        }
    }
    object::elf::SHN_ABS
}

fn write_sysv_hash(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    let num_syms = layout.dynamic_plan.dynsyms.len() as u32;
    let nbucket = num_syms.max(1);
    let mut cursor = std::io::Cursor::new(&mut *out);
    cursor.write_all(&nbucket.to_le_bytes())?;
    cursor.write_all(&num_syms.to_le_bytes())?;

    let mut buckets = vec![0u32; nbucket as usize];
    let mut chains = vec![0u32; num_syms as usize];
    for (i, entry) in layout.dynamic_plan.dynsyms.iter().enumerate().skip(1) {
        let hash = sysv_hash(entry.name);
        let bucket = (hash % nbucket) as usize;
        chains[i] = buckets[bucket];
        buckets[bucket] = i as u32;
    }
    for bucket in buckets {
        cursor.write_all(&bucket.to_le_bytes())?;
    }
    for chain in chains {
        cursor.write_all(&chain.to_le_bytes())?;
    }
    Ok(())
}

fn sysv_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in name {
        h = (h << 4).wrapping_add(u32::from(b));
        let g = h & 0xf000_0000;
        h ^= g >> 24;
        h &= !g;
    }
    h
}

fn write_gnu_hash(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    let plan = &layout.dynamic_plan;
    let nbucket = plan.gnu_hash_bucket_count;
    let bloom_count = plan.gnu_hash_bloom_count;
    let symoffset = plan.first_export_index;
    let exports = &plan.dynsyms[symoffset as usize..];

    let mut cursor = std::io::Cursor::new(&mut *out);
    cursor.write_all(&nbucket.to_le_bytes())?;
    cursor.write_all(&symoffset.to_le_bytes())?;
    cursor.write_all(&bloom_count.to_le_bytes())?;
    const BLOOM_SHIFT: u32 = 6;
    cursor.write_all(&BLOOM_SHIFT.to_le_bytes())?;

    let mut bloom = vec![0u64; bloom_count as usize];
    for entry in exports {
        let h = entry.gnu_hash;
        let word = (h / 64) % bloom_count;
        bloom[word as usize] |=
            (1u64 << (h % 64)) | (1u64 << ((h >> BLOOM_SHIFT) % 64));
    }
    for word in bloom {
        cursor.write_all(&word.to_le_bytes())?;
    }

    // Buckets: index of the first symbol of each bucket. Exports are sorted
    // by bucket.
    let mut buckets = vec![0u32; nbucket as usize];
    for (i, entry) in exports.iter().enumerate() {
        let bucket = (entry.gnu_hash % nbucket) as usize;
        if buckets[bucket] == 0 {
            buckets[bucket] = symoffset + i as u32;
        }
    }
    for bucket in buckets {
        cursor.write_all(&bucket.to_le_bytes())?;
    }

    // The chain: hash values with the low bit marking end-of-bucket.
    for (i, entry) in exports.iter().enumerate() {
        let bucket = entry.gnu_hash % nbucket;
        let is_last = exports
            .get(i + 1)
            .is_none_or(|next| next.gnu_hash % nbucket != bucket);
        let value = (entry.gnu_hash & !1) | u32::from(is_last);
        cursor.write_all(&value.to_le_bytes())?;
    }
    Ok(())
}

fn write_gnu_version(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    for (i, entry) in layout.dynamic_plan.dynsyms.iter().enumerate() {
        let offset = i * elf::VERSYM_ENTRY_SIZE as usize;
        out[offset..offset + 2].copy_from_slice(&entry.versym.to_le_bytes());
    }
    Ok(())
}

fn write_gnu_version_r(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    let libs = &layout.dynamic_plan.verneed;
    let mut offset = 0usize;
    for (lib_index, lib) in libs.iter().enumerate() {
        let verneed_size = size_of::<elf::Verneed>();
        let vernaux_size = size_of::<elf::Vernaux>();
        let next = if lib_index + 1 == libs.len() {
            0u32
        } else {
            (verneed_size + lib.versions.len() * vernaux_size) as u32
        };
        let entry = &mut out[offset..offset + verneed_size];
        entry[0..2].copy_from_slice(&1u16.to_le_bytes()); // vn_version
        entry[2..4].copy_from_slice(&(lib.versions.len() as u16).to_le_bytes());
        entry[4..8].copy_from_slice(&lib.lib_name_offset.to_le_bytes());
        entry[8..12].copy_from_slice(&(verneed_size as u32).to_le_bytes()); // vn_aux
        entry[12..16].copy_from_slice(&next.to_le_bytes());
        offset += verneed_size;

        for (version_index, (name, name_offset, index)) in lib.versions.iter().enumerate() {
            let aux_next = if version_index + 1 == lib.versions.len() {
                0u32
            } else {
                vernaux_size as u32
            };
            let aux = &mut out[offset..offset + vernaux_size];
            aux[0..4].copy_from_slice(&gnu_hash_for_version(name).to_le_bytes());
            aux[4] = 0; // flags
            aux[5] = 0;
            aux[6..8].copy_from_slice(&index.to_le_bytes());
            aux[8..12].copy_from_slice(&name_offset.to_le_bytes());
            aux[12..16].copy_from_slice(&aux_next.to_le_bytes());
            offset += vernaux_size;
        }
    }
    Ok(())
}

fn gnu_hash_for_version(name: &[u8]) -> u32 {
    // Version hashes use the SysV ELF hash function.
    sysv_hash(name)
}

fn write_gnu_version_d(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    // The base version (the soname or output name) followed by the named
    // versions from the version script.
    let verdef_size = size_of::<elf::Verdef>();
    let verdaux_size = size_of::<elf::Verdaux>();
    let base_name_offset = layout.dynamic_plan.soname_offset.unwrap_or(0);
    let mut entries: Vec<(u32, u16, u16, u16)> = Vec::new(); // (name, index, flags, parent count)
    entries.push((base_name_offset, 1, object::elf::VER_FLG_BASE, 0));
    for (i, (name_offset, parent)) in layout.dynamic_plan.verdef_names.iter().enumerate() {
        let count = 1 + u16::from(parent.is_some());
        entries.push((*name_offset, i as u16 + 2, 0, count));
    }

    let mut offset = 0usize;
    let total = entries.len();
    for (i, (name_offset, index, flags, _)) in entries.iter().enumerate() {
        let next = if i + 1 == total {
            0u32
        } else {
            (verdef_size + verdaux_size) as u32
        };
        let entry = &mut out[offset..offset + verdef_size];
        entry[0..2].copy_from_slice(&1u16.to_le_bytes()); // vd_version
        entry[2..4].copy_from_slice(&flags.to_le_bytes());
        entry[4..6].copy_from_slice(&index.to_le_bytes());
        entry[6..8].copy_from_slice(&1u16.to_le_bytes()); // vd_cnt
        entry[8..12].copy_from_slice(&0u32.to_le_bytes()); // vd_hash (optional)
        entry[12..16].copy_from_slice(&(verdef_size as u32).to_le_bytes());
        entry[16..20].copy_from_slice(&next.to_le_bytes());
        offset += verdef_size;

        let aux = &mut out[offset..offset + verdaux_size];
        aux[0..4].copy_from_slice(&name_offset.to_le_bytes());
        aux[4..8].copy_from_slice(&0u32.to_le_bytes());
        offset += verdaux_size;
    }
    Ok(())
}

fn write_rela_plt<A: Arch>(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    let got_plt_base = layout.section_layout(output_section_id::GOT_PLT).address
        + 3 * elf::GOT_ENTRY_SIZE;
    for (i, &symbol) in layout.got_plan.plt_symbols.iter().enumerate() {
        let slot_address = got_plt_base + i as u64 * elf::GOT_ENTRY_SIZE;
        let resolution = layout.resolutions[symbol.as_usize()]
            .as_ref()
            .context("PLT symbol without resolution")?;
        let value_flags = resolution.value_flags;
        if value_flags.contains(ValueFlags::IFUNC)
            && !value_flags.contains(ValueFlags::DYNAMIC)
        {
            write_rela_entry(
                out,
                i as u64,
                slot_address,
                A::get_dynamic_relocation_type(DynamicRelocationKind::Irelative),
                0,
                resolution.value as i64,
            )?;
        } else {
            write_rela_entry(
                out,
                i as u64,
                slot_address,
                A::get_dynamic_relocation_type(DynamicRelocationKind::JumpSlot),
                resolution.dynsym_index.unwrap_or(0),
                0,
            )?;
        }
    }
    Ok(())
}

fn write_dynamic_section(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    let mut cursor = 0usize;
    let mut push = |tag: i64, value: u64| {
        let end = cursor + size_of::<elf::DynamicEntry>();
        if end <= out.len() {
            out[cursor..cursor + 8].copy_from_slice(&tag.to_le_bytes());
            out[cursor + 8..end].copy_from_slice(&value.to_le_bytes());
            cursor = end;
        }
    };
    let section_address = |id: OutputSectionId| layout.section_layout(id).address;
    let section_size = |id: OutputSectionId| layout.section_layout(id).file_size;
    use output_section_id as osid;
    let args = layout.args;

    for &needed in &layout.dynamic_plan.needed {
        push(object::elf::DT_NEEDED.into(), needed.into());
    }
    if let Some(soname) = layout.dynamic_plan.soname_offset {
        push(object::elf::DT_SONAME.into(), soname.into());
    }
    if let Some(runpath) = layout.dynamic_plan.runpath_offset {
        push(object::elf::DT_RUNPATH.into(), runpath.into());
    }
    if args.hash_style.includes_sysv() {
        push(object::elf::DT_HASH.into(), section_address(osid::HASH));
    }
    if args.hash_style.includes_gnu() {
        push(object::elf::DT_GNU_HASH.into(), section_address(osid::GNU_HASH));
    }
    push(object::elf::DT_STRTAB.into(), section_address(osid::DYNSTR));
    push(object::elf::DT_STRSZ.into(), section_size(osid::DYNSTR));
    push(object::elf::DT_SYMTAB.into(), section_address(osid::DYNSYM));
    push(object::elf::DT_SYMENT.into(), elf::SYMTAB_ENTRY_SIZE);
    push(object::elf::DT_RELA.into(), section_address(osid::RELA_DYN));
    push(object::elf::DT_RELASZ.into(), section_size(osid::RELA_DYN));
    push(object::elf::DT_RELAENT.into(), elf::RELA_ENTRY_SIZE);
    if !layout.got_plan.plt_symbols.is_empty() {
        push(object::elf::DT_JMPREL.into(), section_address(osid::RELA_PLT));
        push(object::elf::DT_PLTRELSZ.into(), section_size(osid::RELA_PLT));
        push(object::elf::DT_PLTREL.into(), object::elf::DT_RELA as u64);
        push(object::elf::DT_PLTGOT.into(), section_address(osid::GOT_PLT));
    }
    let init_array = layout.section_layout(osid::INIT_ARRAY);
    if init_array.active && init_array.mem_size > 0 {
        push(object::elf::DT_INIT_ARRAY.into(), init_array.address);
        push(object::elf::DT_INIT_ARRAYSZ.into(), init_array.mem_size);
    }
    let fini_array = layout.section_layout(osid::FINI_ARRAY);
    if fini_array.active && fini_array.mem_size > 0 {
        push(object::elf::DT_FINI_ARRAY.into(), fini_array.address);
        push(object::elf::DT_FINI_ARRAYSZ.into(), fini_array.mem_size);
    }
    if layout.output_kind.is_executable() {
        push(object::elf::DT_DEBUG.into(), 0);
    }
    let mut dt_flags: u64 = u64::from(object::elf::DF_BIND_NOW);
    if args.z_origin {
        dt_flags |= u64::from(object::elf::DF_ORIGIN);
    }
    if args.z_text {
        dt_flags |= u64::from(object::elf::DF_TEXTREL);
    }
    push(object::elf::DT_FLAGS.into(), dt_flags);
    let mut dt_flags_1: u64 = u64::from(object::elf::DF_1_NOW);
    if layout.output_kind.is_executable() && layout.output_kind.is_position_independent() {
        dt_flags_1 |= u64::from(object::elf::DF_1_PIE);
    }
    if args.z_nodelete {
        dt_flags_1 |= u64::from(object::elf::DF_1_NODELETE);
    }
    push(object::elf::DT_FLAGS_1.into(), dt_flags_1);
    if !layout.dynamic_plan.verneed.is_empty() {
        push(
            object::elf::DT_VERNEED.into(),
            section_address(osid::GNU_VERSION_R),
        );
        push(
            object::elf::DT_VERNEEDNUM.into(),
            layout.dynamic_plan.verneed.len() as u64,
        );
    }
    if !layout.dynamic_plan.verdef_names.is_empty() {
        push(
            object::elf::DT_VERDEF.into(),
            section_address(osid::GNU_VERSION_D),
        );
        push(
            object::elf::DT_VERDEFNUM.into(),
            layout.dynamic_plan.verdef_names.len() as u64 + 1,
        );
    }
    if !layout.dynamic_plan.verneed.is_empty() || !layout.dynamic_plan.verdef_names.is_empty() {
        push(
            object::elf::DT_VERSYM.into(),
            section_address(osid::GNU_VERSION),
        );
    }
    // The remaining reserved entries are DT_NULL (zero), which the buffer
    // already holds.
    Ok(())
}

// ---------------------------------------------------------------------------
// GOT / PLT
// ---------------------------------------------------------------------------

fn write_got<A: Arch>(layout: &Layout<'_>, out: &mut [u8]) -> Result<Vec<PendingDynReloc>> {
    let mut pending = Vec::new();
    let got_base = layout.section_layout(output_section_id::GOT).address;
    let dynamic_address = layout.section_layout(output_section_id::DYNAMIC).address;

    // Slot 0 conventionally holds the address of .dynamic.
    out[..8].copy_from_slice(&dynamic_address.to_le_bytes());

    let mut reloc_index = 0u64;
    let output_kind = layout.output_kind;
    let symbol_flags =
        |id: SymbolId| layout.symbol_db.value_flags(id);
    let all_flags = &layout.symbol_db.symbol_value_flags;

    for (i, entry) in layout.got_plan.entries.iter().enumerate() {
        let slot_offset = (1 + i) * elf::GOT_ENTRY_SIZE as usize;
        let slot_address = got_base + slot_offset as u64;
        let slot = &mut out[slot_offset..slot_offset + 8];
        let needs_reloc =
            crate::layout::got_entry_needs_dyn_reloc(entry, all_flags, output_kind);

        let resolution_of = |id: &SymbolId| layout.resolutions[id.as_usize()].as_ref();

        match entry {
            GotEntry::Value(id) => {
                let value = resolution_of(id).map(|r| r.value).unwrap_or(0);
                slot.copy_from_slice(&value.to_le_bytes());
                if needs_reloc {
                    pending.push(PendingDynReloc {
                        index: reloc_index,
                        address: slot_address,
                        r_type: A::get_dynamic_relocation_type(DynamicRelocationKind::Relative),
                        dynsym_index: 0,
                        addend: value as i64,
                    });
                }
            }
            GotEntry::Dynamic(id) => {
                if needs_reloc {
                    pending.push(PendingDynReloc {
                        index: reloc_index,
                        address: slot_address,
                        r_type: A::get_dynamic_relocation_type(
                            DynamicRelocationKind::DynamicSymbol,
                        ),
                        dynsym_index: resolution_of(id)
                            .and_then(|r| r.dynsym_index)
                            .unwrap_or(0),
                        addend: 0,
                    });
                }
            }
            GotEntry::IfuncResolver(id) => {
                let value = resolution_of(id).map(|r| r.value).unwrap_or(0);
                pending.push(PendingDynReloc {
                    index: reloc_index,
                    address: slot_address,
                    r_type: A::get_dynamic_relocation_type(DynamicRelocationKind::Irelative),
                    dynsym_index: 0,
                    addend: value as i64,
                });
            }
            GotEntry::TlsModule(id) => {
                if needs_reloc {
                    pending.push(PendingDynReloc {
                        index: reloc_index,
                        address: slot_address,
                        r_type: A::get_dynamic_relocation_type(DynamicRelocationKind::DtpMod),
                        dynsym_index: resolution_of(id)
                            .and_then(|r| r.dynsym_index)
                            .filter(|_| symbol_flags(*id).contains(ValueFlags::DYNAMIC))
                            .unwrap_or(0),
                        addend: 0,
                    });
                } else {
                    slot.copy_from_slice(&elf::CURRENT_EXE_TLS_MOD.to_le_bytes());
                }
            }
            GotEntry::TlsOffset(id) => {
                if needs_reloc {
                    pending.push(PendingDynReloc {
                        index: reloc_index,
                        address: slot_address,
                        r_type: A::get_dynamic_relocation_type(DynamicRelocationKind::DtpOff),
                        dynsym_index: resolution_of(id)
                            .and_then(|r| r.dynsym_index)
                            .unwrap_or(0),
                        addend: 0,
                    });
                } else {
                    let value = resolution_of(id)
                        .map(|r| r.value.wrapping_sub(layout.tls.start))
                        .unwrap_or(0);
                    slot.copy_from_slice(&value.to_le_bytes());
                }
            }
            GotEntry::TpOff(id) => {
                if needs_reloc {
                    pending.push(PendingDynReloc {
                        index: reloc_index,
                        address: slot_address,
                        r_type: A::get_dynamic_relocation_type(DynamicRelocationKind::TpOff),
                        dynsym_index: resolution_of(id)
                            .and_then(|r| r.dynsym_index)
                            .unwrap_or(0),
                        addend: 0,
                    });
                } else {
                    let tp = layout.tp_offset_base::<A>();
                    let value = resolution_of(id)
                        .map(|r| r.value.wrapping_sub(tp))
                        .unwrap_or(0);
                    slot.copy_from_slice(&value.to_le_bytes());
                }
            }
            GotEntry::TlsDescriptor(id) => {
                if needs_reloc {
                    pending.push(PendingDynReloc {
                        index: reloc_index,
                        address: slot_address,
                        r_type: A::get_dynamic_relocation_type(DynamicRelocationKind::TlsDesc),
                        dynsym_index: resolution_of(id)
                            .and_then(|r| r.dynsym_index)
                            .unwrap_or(0),
                        addend: 0,
                    });
                }
            }
            GotEntry::Zero => {}
        }
        if needs_reloc {
            reloc_index += 1;
        }
    }

    // Copy relocations follow the GOT-derived entries.
    let bss_address = layout.section_layout(output_section_id::BSS).address;
    for &(symbol, offset, _) in &layout.got_plan.copy_relocations {
        let resolution = layout.resolutions[symbol.as_usize()].as_ref();
        pending.push(PendingDynReloc {
            index: reloc_index,
            address: bss_address + offset,
            r_type: A::get_dynamic_relocation_type(DynamicRelocationKind::Copy),
            dynsym_index: resolution.and_then(|r| r.dynsym_index).unwrap_or(0),
            addend: 0,
        });
        reloc_index += 1;
    }

    Ok(pending)
}

fn write_got_plt(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    let dynamic_address = layout.section_layout(output_section_id::DYNAMIC).address;
    out[..8].copy_from_slice(&dynamic_address.to_le_bytes());
    // Slots 1 and 2 are for the dynamic loader; the remaining slots are
    // filled by JUMP_SLOT/IRELATIVE relocations at load time.
    Ok(())
}

fn write_plt<A: Arch>(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    let plt_base = layout.section_layout(output_section_id::PLT).address;
    let got_plt_base = layout.section_layout(output_section_id::GOT_PLT).address
        + 3 * elf::GOT_ENTRY_SIZE;
    for (i, _symbol) in layout.got_plan.plt_symbols.iter().enumerate() {
        let offset = i * elf::PLT_ENTRY_SIZE as usize;
        let plt_address = plt_base + offset as u64;
        let got_address = got_plt_base + i as u64 * elf::GOT_ENTRY_SIZE;
        A::write_plt_entry(
            &mut out[offset..offset + elf::PLT_ENTRY_SIZE as usize],
            got_address,
            plt_address,
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Regular sections
// ---------------------------------------------------------------------------

/// Compresses the relocated contents of every non-alloc `.debug_*` section.
/// Runs at the end of layout: debug sections have no addresses, so applying
/// their relocations early produces the same bytes the writer would, and the
/// compressed sizes can still move later file offsets. Returns whether
/// anything was compressed.
pub(crate) fn compress_debug_sections<A: Arch>(
    layout: &mut Layout<'_>,
    diagnostics: &Diagnostics,
) -> Result<bool> {
    let style = layout.args.compress_debug_sections;
    let inputs_by_section = collect_inputs_by_section(layout);

    let mut compressed: Vec<(OutputSectionId, Vec<u8>)> = Vec::new();
    for id in layout.output_sections.ids() {
        let record = layout.section_layout(id);
        if !record.active || record.file_size == 0 {
            continue;
        }
        if layout.output_sections.section_flags(id).contains(shf::ALLOC) {
            continue;
        }
        if !layout.output_sections.name(id).0.starts_with(b".debug_") {
            continue;
        }
        let mut contents = vec![0u8; record.file_size as usize];
        // Debug relocations never produce dynamic relocations, so the
        // pending list is always empty here.
        write_regular_section::<A>(layout, id, &mut contents, &inputs_by_section, diagnostics)?;
        let blob = compress_section_contents(style, &contents, record.alignment.value())?;
        compressed.push((id, blob));
    }

    if compressed.is_empty() {
        return Ok(false);
    }
    for (id, blob) in compressed {
        let record = &mut layout.section_layouts[id.as_usize()];
        record.file_size = blob.len() as u64;
        record.mem_size = blob.len() as u64;
        record.alignment = crate::alignment::USIZE;
        layout.compressed_debug.insert(id, blob);
    }
    Ok(true)
}

/// Prepends a 64 bit compression header and compresses `data` with the
/// requested codec. `ch_size`/`ch_addralign` describe the uncompressed data.
fn compress_section_contents(
    style: CompressionStyle,
    data: &[u8],
    addralign: u64,
) -> Result<Vec<u8>> {
    let (ch_type, payload) = match style {
        CompressionStyle::Zlib => {
            let mut encoder = flate2::write::ZlibEncoder::new(
                Vec::new(),
                flate2::Compression::default(),
            );
            encoder.write_all(data)?;
            (object::elf::ELFCOMPRESS_ZLIB, encoder.finish()?)
        }
        CompressionStyle::Zstd => (
            object::elf::ELFCOMPRESS_ZSTD,
            zstd::stream::encode_all(data, 0)?,
        ),
        CompressionStyle::None => bail!("No compression style selected"),
    };
    let mut blob =
        Vec::with_capacity(size_of::<object::elf::CompressionHeader64<LittleEndian>>() + payload.len());
    blob.extend_from_slice(&ch_type.to_le_bytes());
    blob.extend_from_slice(&0u32.to_le_bytes()); // ch_reserved
    blob.extend_from_slice(&(data.len() as u64).to_le_bytes());
    blob.extend_from_slice(&addralign.to_le_bytes());
    blob.extend_from_slice(&payload);
    Ok(blob)
}

fn write_regular_section<A: Arch>(
    layout: &Layout<'_>,
    id: OutputSectionId,
    out: &mut [u8],
    inputs_by_section: &[Vec<(usize, usize)>],
    diagnostics: &Diagnostics,
) -> Result<Vec<PendingDynReloc>> {
    let mut pending = Vec::new();

    // A debug section that layout already relocated and compressed just
    // gets its finished bytes copied.
    if let Some(blob) = layout.compressed_debug.get(&id) {
        out[..blob.len()].copy_from_slice(blob);
        return Ok(pending);
    }

    // Merged strings come first.
    if let Some(merged) = layout.merged_strings.by_section.get(&id) {
        let mut offset = 0usize;
        for string in &merged.strings {
            let aligned = merged.alignment.align_up_usize(offset);
            out[aligned..aligned + string.len()].copy_from_slice(string);
            offset = aligned + string.len();
        }
    }

    for &(object_index, section_index) in &inputs_by_section[id.as_usize()] {
        let object = &layout.resolution.objects[object_index];
        let file = layout.symbol_db.file(object.file_id);
        let parsed = file.object().expect("loaded");
        let SectionSlot::Loaded(section) = &object.sections[section_index] else {
            continue;
        };
        let header = parsed.object.section(object::SectionIndex(section_index))?;
        let out_range =
            section.output_offset as usize..(section.output_offset + section.size) as usize;
        let section_out = &mut out[out_range];
        parsed.object.copy_section_data(header, section_out)?;

        if layout.output_kind.is_relocatable_object() {
            continue;
        }

        let relocations = parsed
            .object
            .relocations(object::SectionIndex(section_index), &object.relocation_sections)?;
        apply_relocations::<A>(
            layout,
            object_index,
            section,
            &relocations,
            section_out,
            &mut pending,
            diagnostics,
        )?;
    }

    // Thunks appended at the end of the section.
    for thunk in &layout.thunk_plan.thunks {
        if thunk.section_id != id {
            continue;
        }
        let record = layout.section_layout(id);
        let offset = (thunk.address - record.address) as usize;
        let target = layout.resolutions[thunk.target.as_usize()]
            .as_ref()
            .context("Thunk target missing resolution")?;
        let target_address = target.plt_address.unwrap_or(target.value);
        A::write_thunk(
            &mut out[offset..offset + A::THUNK_SIZE as usize],
            thunk.address,
            target_address,
        )?;
    }

    Ok(pending)
}

#[allow(clippy::too_many_arguments)]
fn apply_relocations<A: Arch>(
    layout: &Layout<'_>,
    object_index: usize,
    section: &crate::resolution::Section<'_>,
    relocations: &crate::elf::RelocationList<'_>,
    out: &mut [u8],
    pending: &mut Vec<PendingDynReloc>,
    diagnostics: &Diagnostics,
) -> Result {
    let object = &layout.resolution.objects[object_index];
    let file = layout.symbol_db.file(object.file_id);
    let section_address = section.address;
    let mut next_modifier = RelocationModifier::Normal;
    let mut relative_index = layout
        .got_plan
        .section_rela_dyn_start
        .get(&(object_index, section.index.0))
        .copied();

    for relocation in relocations.iter() {
        if next_modifier == RelocationModifier::SkipNextRelocation {
            next_modifier = RelocationModifier::Normal;
            continue;
        }
        let result = apply_relocation::<A>(
            layout,
            object_index,
            section,
            section_address,
            &relocation,
            out,
            pending,
            &mut relative_index,
            &mut next_modifier,
        );
        if let Err(error) = result {
            diagnostics.relocation_error(
                file.object()
                    .map(|o| o.input.to_string())
                    .unwrap_or_default(),
                String::from_utf8_lossy(section.name).into_owned(),
                relocation.r_offset,
                format!("{error:#}"),
            );
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn apply_relocation<A: Arch>(
    layout: &Layout<'_>,
    object_index: usize,
    section: &crate::resolution::Section<'_>,
    section_address: u64,
    relocation: &crate::elf::Relocation,
    out: &mut [u8],
    pending: &mut Vec<PendingDynReloc>,
    relative_index: &mut Option<u64>,
    next_modifier: &mut RelocationModifier,
) -> Result {
    let object = &layout.resolution.objects[object_index];
    let file = layout.symbol_db.file(object.file_id);
    let symbol_id = file.symbol_id_range.input_to_id(relocation.symbol);
    let canonical = layout.symbol_db.definition(symbol_id);
    let resolution = layout.resolutions[canonical.as_usize()]
        .as_ref()
        .copied()
        .unwrap_or_default();
    let value_flags = resolution.value_flags;

    let mut info = A::relocation_from_raw(relocation.r_type)?;
    let mut offset = relocation.r_offset;
    let mut addend = relocation.addend;
    if !relocation.has_explicit_addend {
        addend = read_implicit_addend(out, offset as usize, &info)?;
    }

    // Merge-section references resolve through the interning table; the
    // addend picks the fragment.
    let mut symbol_value = resolution.value;
    if let Some(merge_value) = merge_resolved_value(layout, object, relocation, addend)? {
        symbol_value = merge_value.wrapping_sub(addend as u64);
    }

    // Try an instruction relaxation. Only accept it if the GOT resources
    // the relaxed form needs were actually allocated.
    if let Some(relaxation) = A::Relaxation::new(
        relocation.r_type,
        out,
        offset,
        value_flags,
        layout.output_kind,
        section.flags,
    ) {
        let new_info = relaxation.rel_info();
        if relocation_resources_available(layout, &resolution, new_info.kind) {
            relaxation.apply(out, &mut offset, &mut addend);
            info = new_info;
            *next_modifier = relaxation.next_modifier();
        }
    }

    let place = section_address + offset;
    let got_base = layout.got_base();
    let tp = layout.tp_offset_base::<A>();

    let value: i64 = match info.kind {
        RelocationKind::None | RelocationKind::TlsDescCall => return Ok(()),
        RelocationKind::Absolute => {
            if section.flags.contains(shf::ALLOC)
                && crate::layout::needs_dynamic_absolute_relocation(
                    layout.output_kind,
                    &info,
                    value_flags,
                )
            {
                let index = relative_index
                    .as_mut()
                    .context("Unplanned dynamic relocation")?;
                emit_absolute_dynamic_relocation::<A>(
                    &resolution,
                    place,
                    symbol_value,
                    addend,
                    *index,
                    pending,
                );
                *index += 1;
                // The static value is still written below so that
                // non-relocating loaders see something sensible.
            }
            symbol_value.wrapping_add(addend as u64) as i64
        }
        RelocationKind::Relative => {
            (symbol_value.wrapping_add(addend as u64)).wrapping_sub(place) as i64
        }
        RelocationKind::RelativePage => {
            (page(symbol_value.wrapping_add(addend as u64))).wrapping_sub(page(place)) as i64
        }
        RelocationKind::PageOffset => symbol_value.wrapping_add(addend as u64) as i64,
        RelocationKind::SymRelGotBase => {
            (symbol_value.wrapping_add(addend as u64)).wrapping_sub(got_base) as i64
        }
        RelocationKind::GotRelGotBase => {
            let got = resolution.got_address.context("Missing GOT entry")?;
            got.wrapping_add(addend as u64).wrapping_sub(got_base) as i64
        }
        RelocationKind::GotRelative => {
            let got = resolution.got_address.context("Missing GOT entry")?;
            got.wrapping_add(addend as u64).wrapping_sub(place) as i64
        }
        RelocationKind::GotRelativePage => {
            let got = resolution.got_address.context("Missing GOT entry")?;
            page(got.wrapping_add(addend as u64)).wrapping_sub(page(place)) as i64
        }
        RelocationKind::GotPageOffset => {
            let got = resolution.got_address.context("Missing GOT entry")?;
            got.wrapping_add(addend as u64) as i64
        }
        RelocationKind::PltRelative | RelocationKind::PltRelGotBase => {
            let mut target = resolution.plt_address.unwrap_or(symbol_value);
            // Redirect through a range-extension thunk if the direct branch
            // can't reach.
            if let Some(max) = A::MAX_BRANCH_DISPLACEMENT {
                let displacement =
                    target.wrapping_add(addend as u64) as i64 - place as i64;
                if displacement.abs() > max {
                    if let Some(thunk) = layout
                        .thunk_plan
                        .thunk_address(section.output_section, canonical)
                    {
                        target = thunk;
                    }
                }
            }
            if info.kind == RelocationKind::PltRelative {
                target.wrapping_add(addend as u64).wrapping_sub(place) as i64
            } else {
                target.wrapping_add(addend as u64).wrapping_sub(got_base) as i64
            }
        }
        RelocationKind::TlsGd => {
            let got = resolution
                .tlsgd_got_address
                .context("Missing TLSGD GOT entry")?;
            got.wrapping_add(addend as u64).wrapping_sub(place) as i64
        }
        RelocationKind::TlsLd => {
            let got = layout.resolutions[0]
                .as_ref()
                .and_then(|r| r.tlsgd_got_address)
                .context("Missing TLSLD GOT entry")?;
            got.wrapping_add(addend as u64).wrapping_sub(place) as i64
        }
        RelocationKind::DtpOff => {
            (symbol_value.wrapping_sub(layout.tls.start)).wrapping_add(addend as u64) as i64
        }
        RelocationKind::GotTpOff | RelocationKind::GotTpOffPage
        | RelocationKind::GotTpOffPageOffset => {
            let got = resolution
                .gottpoff_address
                .context("Missing GOTTPOFF entry")?;
            match info.kind {
                RelocationKind::GotTpOffPage => {
                    page(got.wrapping_add(addend as u64)).wrapping_sub(page(place)) as i64
                }
                RelocationKind::GotTpOffPageOffset => got.wrapping_add(addend as u64) as i64,
                _ => got.wrapping_add(addend as u64).wrapping_sub(place) as i64,
            }
        }
        RelocationKind::TpOff => {
            (symbol_value.wrapping_sub(tp)).wrapping_add(addend as u64) as i64
        }
        RelocationKind::TlsDesc | RelocationKind::TlsDescPage
        | RelocationKind::TlsDescPageOffset => {
            let got = resolution
                .tlsdesc_got_address
                .context("Missing TLSDESC entry")?;
            match info.kind {
                RelocationKind::TlsDescPage => {
                    page(got.wrapping_add(addend as u64)).wrapping_sub(page(place)) as i64
                }
                RelocationKind::TlsDescPageOffset => got.wrapping_add(addend as u64) as i64,
                _ => got.wrapping_add(addend as u64).wrapping_sub(place) as i64,
            }
        }
    };

    write_relocation_value(value, &info, out, offset as usize)
}

/// After relaxation, the relocation might need different GOT resources than
/// the original allocated. Only relax when they're available.
fn relocation_resources_available(
    layout: &Layout<'_>,
    resolution: &SymbolResolution,
    kind: RelocationKind,
) -> bool {
    match kind {
        RelocationKind::GotRelative
        | RelocationKind::GotRelativePage
        | RelocationKind::GotPageOffset
        | RelocationKind::GotRelGotBase => resolution.got_address.is_some(),
        RelocationKind::GotTpOff
        | RelocationKind::GotTpOffPage
        | RelocationKind::GotTpOffPageOffset => resolution.gottpoff_address.is_some(),
        RelocationKind::TlsGd => resolution.tlsgd_got_address.is_some(),
        RelocationKind::TlsLd => layout.resolutions[0]
            .as_ref()
            .is_some_and(|r| r.tlsgd_got_address.is_some()),
        RelocationKind::TlsDesc
        | RelocationKind::TlsDescPage
        | RelocationKind::TlsDescPageOffset => resolution.tlsdesc_got_address.is_some(),
        _ => true,
    }
}

fn emit_absolute_dynamic_relocation<A: Arch>(
    resolution: &SymbolResolution,
    place: u64,
    symbol_value: u64,
    addend: i64,
    index: u64,
    pending: &mut Vec<PendingDynReloc>,
) {
    let value_flags = resolution.value_flags;
    if value_flags.contains(ValueFlags::DYNAMIC) {
        pending.push(PendingDynReloc {
            index,
            address: place,
            r_type: A::get_dynamic_relocation_type(DynamicRelocationKind::DynamicSymbol),
            dynsym_index: resolution.dynsym_index.unwrap_or(0),
            addend,
        });
    } else {
        pending.push(PendingDynReloc {
            index,
            address: place,
            r_type: A::get_dynamic_relocation_type(DynamicRelocationKind::Relative),
            dynsym_index: 0,
            addend: symbol_value.wrapping_add(addend as u64) as i64,
        });
    }
}

fn read_implicit_addend(
    out: &[u8],
    offset: usize,
    info: &RelocationKindInfo,
) -> Result<i64> {
    match info.size {
        RelocationSize::ByteSize(n @ 1..=8) => {
            let mut bytes = [0u8; 8];
            let end = offset + n;
            if end > out.len() {
                bail!("REL relocation offset out of bounds");
            }
            bytes[..n].copy_from_slice(&out[offset..end]);
            let value = i64::from_le_bytes(bytes);
            // Sign extend from the field width.
            let shift = 64 - n * 8;
            Ok((value << shift) >> shift)
        }
        _ => Ok(0),
    }
}

/// Resolves a relocation that points into a string-merge section: returns
/// the final address of the fragment byte the (symbol value + addend)
/// identifies.
fn merge_resolved_value(
    layout: &Layout<'_>,
    object: &crate::resolution::ResolvedObject<'_>,
    relocation: &crate::elf::Relocation,
    addend: i64,
) -> Result<Option<u64>> {
    let file = layout.symbol_db.file(object.file_id);
    let symbol_id = file.symbol_id_range.input_to_id(relocation.symbol);
    let canonical = layout.symbol_db.definition(symbol_id);
    let def_file_id = layout.symbol_db.file_id_for_symbol(canonical);
    if def_file_id == crate::input_data::PRELUDE_FILE_ID {
        return Ok(None);
    }
    let def_file = layout.symbol_db.file(def_file_id);
    let Some(parsed) = def_file.object() else {
        return Ok(None);
    };
    let index = def_file.symbol_id_range.id_to_input(canonical);
    let symbol = parsed.object.symbol(index)?;
    let Some(section_index) = parsed.object.symbol_section(symbol, index)? else {
        return Ok(None);
    };
    let def_object_index = def_file_id.as_usize() - 1;
    let def_object = &layout.resolution.objects[def_object_index];
    let Some(SectionSlot::MergeStrings(merge)) = def_object.sections.get(section_index.0)
    else {
        return Ok(None);
    };
    let input_offset = symbol.st_value(E).wrapping_add(addend as u64);
    let output_offset =
        layout
            .merged_strings
            .resolve(def_object_index, section_index, input_offset)?;
    let record = layout.section_layout(merge.output_section);
    Ok(Some(record.address + output_offset))
}

// ---------------------------------------------------------------------------
// .eh_frame and .eh_frame_hdr
// ---------------------------------------------------------------------------

fn write_eh_frame<A: Arch>(
    layout: &Layout<'_>,
    out: &mut [u8],
    diagnostics: &Diagnostics,
) -> Result<Vec<PendingDynReloc>> {
    let eh_frame_base = layout.section_layout(output_section_id::EH_FRAME).address;
    let mut pending = Vec::new();

    for (object_index, per_section) in layout.eh_frame_plan.per_object.iter().enumerate() {
        let object = &layout.resolution.objects[object_index];
        let file = layout.symbol_db.file(object.file_id);
        let Some(parsed) = file.object() else {
            continue;
        };
        for (section_index, records) in per_section {
            let header = parsed.object.section(*section_index)?;
            let data = parsed.object.raw_section_data(header)?;
            let relocations = parsed
                .object
                .relocations(*section_index, &object.relocation_sections)?;
            let all_relocations: Vec<_> = relocations.iter().collect();

            for record in records {
                let (input_offset, output_offset, size, cie_fixup) = match record {
                    EhFrameRecord::Cie {
                        input_offset,
                        output_offset,
                        size,
                    } => (*input_offset, *output_offset, *size, None),
                    EhFrameRecord::Fde {
                        input_offset,
                        output_offset,
                        size,
                        cie_output_offset,
                    } => (*input_offset, *output_offset, *size, Some(*cie_output_offset)),
                    EhFrameRecord::DuplicateCie { .. } | EhFrameRecord::DroppedFde => continue,
                };
                let out_range = output_offset as usize..(output_offset + size) as usize;
                out[out_range.clone()].copy_from_slice(
                    &data[input_offset as usize..(input_offset + size) as usize],
                );

                if let Some(cie_output_offset) = cie_fixup {
                    // The CIE pointer is the distance from this field back
                    // to the CIE.
                    let field_offset = output_offset + 4;
                    let distance = (field_offset - cie_output_offset) as u32;
                    out[field_offset as usize..field_offset as usize + 4]
                        .copy_from_slice(&distance.to_le_bytes());
                }

                // Apply the record's relocations, shifted to their output
                // positions.
                for relocation in all_relocations
                    .iter()
                    .filter(|r| {
                        r.r_offset >= input_offset && r.r_offset < input_offset + size
                    })
                {
                    let mut shifted = *relocation;
                    shifted.r_offset = relocation.r_offset - input_offset + output_offset;
                    let pseudo_section = crate::resolution::Section {
                        index: *section_index,
                        name: b".eh_frame",
                        flags: shf::ALLOC,
                        ty: object::elf::SHT_PROGBITS,
                        alignment: crate::alignment::USIZE,
                        size,
                        output_section: output_section_id::EH_FRAME,
                        is_alive: std::sync::atomic::AtomicBool::new(true),
                        folded_into: None,
                        output_offset,
                        address: eh_frame_base + output_offset,
                    };
                    let mut next_modifier = RelocationModifier::Normal;
                    let result = apply_relocation::<A>(
                        layout,
                        object_index,
                        &pseudo_section,
                        eh_frame_base,
                        &shifted,
                        out,
                        &mut pending,
                        &mut None,
                        &mut next_modifier,
                    );
                    if let Err(error) = result {
                        diagnostics.relocation_error(
                            parsed.input.to_string(),
                            ".eh_frame".to_owned(),
                            relocation.r_offset,
                            format!("{error:#}"),
                        );
                    }
                }
            }
        }
    }
    // The terminator (a zero length field) is already present because the
    // buffer starts zeroed.
    Ok(pending)
}

fn write_eh_frame_hdr<A: Arch>(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    let hdr_record = layout.section_layout(output_section_id::EH_FRAME_HDR);
    let eh_frame_record = layout.section_layout(output_section_id::EH_FRAME);
    let hdr_address = hdr_record.address;
    let eh_frame_base = eh_frame_record.address;

    // DWARF pointer encodings used in the header.
    const DW_EH_PE_PCREL: u8 = 0x10;
    const DW_EH_PE_DATAREL: u8 = 0x30;
    const DW_EH_PE_UDATA4: u8 = 0x03;
    const DW_EH_PE_SDATA4: u8 = 0x0b;

    // Version 1; eh_frame_ptr: pcrel sdata4; count: udata4;
    // table: datarel sdata4.
    out[0] = 1;
    out[1] = DW_EH_PE_PCREL | DW_EH_PE_SDATA4;
    out[2] = DW_EH_PE_UDATA4;
    out[3] = DW_EH_PE_DATAREL | DW_EH_PE_SDATA4;
    let frame_pointer = (eh_frame_base as i64 - (hdr_address as i64 + 4)) as i32;
    out[4..8].copy_from_slice(&frame_pointer.to_le_bytes());
    out[8..12].copy_from_slice(&layout.eh_frame_plan.num_fdes.to_le_bytes());

    // One (pc, fde) pair per kept FDE, sorted by pc.
    let mut entries: Vec<(i32, i32)> = Vec::with_capacity(layout.eh_frame_plan.num_fdes as usize);
    for (object_index, per_section) in layout.eh_frame_plan.per_object.iter().enumerate() {
        let object = &layout.resolution.objects[object_index];
        let file = layout.symbol_db.file(object.file_id);
        let Some(parsed) = file.object() else {
            continue;
        };
        for (section_index, records) in per_section {
            let relocations = parsed
                .object
                .relocations(*section_index, &object.relocation_sections)?;
            let all_relocations: Vec<_> = relocations.iter().collect();
            for record in records {
                let EhFrameRecord::Fde {
                    input_offset,
                    output_offset,
                    ..
                } = record
                else {
                    continue;
                };
                let pc_begin_offset = input_offset + elf::FDE_PC_BEGIN_OFFSET as u64;
                let Some(relocation) = all_relocations
                    .iter()
                    .find(|r| r.r_offset == pc_begin_offset)
                else {
                    continue;
                };
                let symbol_id = file.symbol_id_range.input_to_id(relocation.symbol);
                let canonical = layout.symbol_db.definition(symbol_id);
                let pc = layout.resolutions[canonical.as_usize()]
                    .as_ref()
                    .map(|r| r.value.wrapping_add(relocation.addend as u64))
                    .unwrap_or(0);
                let fde_address = eh_frame_base + output_offset;
                entries.push((
                    (pc as i64 - hdr_address as i64) as i32,
                    (fde_address as i64 - hdr_address as i64) as i32,
                ));
            }
        }
    }
    entries.sort_unstable();
    let mut cursor = elf::EH_FRAME_HDR_SIZE as usize;
    for (pc, fde) in entries {
        out[cursor..cursor + 4].copy_from_slice(&pc.to_le_bytes());
        out[cursor + 4..cursor + 8].copy_from_slice(&fde.to_le_bytes());
        cursor += 8;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Symbol table
// ---------------------------------------------------------------------------

fn write_symtab(layout: &Layout<'_>, out: &mut [u8]) -> Result {
    for (i, entry) in layout.symtab_plan.entries.iter().enumerate() {
        let offset = i * elf::SYMTAB_ENTRY_SIZE as usize;
        let sym = &mut out[offset..offset + elf::SYMTAB_ENTRY_SIZE as usize];
        if i == 0 {
            continue;
        }
        sym[0..4].copy_from_slice(&entry.name_offset.to_le_bytes());
        sym[4] = entry.info;
        sym[5] = entry.other;
        let shndx = match entry.output_section {
            Some(id) => layout.output_section_indexes[id.as_usize()]
                .unwrap_or(object::elf::SHN_ABS),
            None => {
                if entry.value == 0 {
                    object::elf::SHN_UNDEF
                } else {
                    object::elf::SHN_ABS
                }
            }
        };
        sym[6..8].copy_from_slice(&shndx.to_le_bytes());
        sym[8..16].copy_from_slice(&entry.value.to_le_bytes());
        sym[16..24].copy_from_slice(&entry.size.to_le_bytes());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Relocatable output
// ---------------------------------------------------------------------------

/// For `-r`: writes the rewritten relocation entries targeting `target`.
fn write_rela_section(
    layout: &Layout<'_>,
    target: OutputSectionId,
    out: &mut [u8],
    inputs_by_section: &[Vec<(usize, usize)>],
) -> Result {
    let mut index = 0u64;
    for &(object_index, section_index) in &inputs_by_section[target.as_usize()] {
        let object = &layout.resolution.objects[object_index];
        let file = layout.symbol_db.file(object.file_id);
        let parsed = file.object().expect("loaded");
        let SectionSlot::Loaded(section) = &object.sections[section_index] else {
            continue;
        };
        let relocations = parsed
            .object
            .relocations(object::SectionIndex(section_index), &object.relocation_sections)?;
        for relocation in relocations.iter() {
            let symbol_id = file.symbol_id_range.input_to_id(relocation.symbol);
            let canonical = layout.symbol_db.definition(symbol_id);
            let mut addend = relocation.addend;

            // Named symbols keep their symtab reference. Anonymous locals
            // (section symbols) are rewritten against the output section's
            // section symbol, with the addend adjusted for the input
            // section's placement within it.
            let symtab_index = if let Some(&index) =
                layout.symtab_plan.index_by_symbol.get(&canonical)
            {
                index
            } else {
                let (target_output, extra) =
                    section_symbol_target(layout, canonical)?;
                addend += extra as i64;
                layout
                    .symtab_plan
                    .section_symbol_indexes
                    .get(&target_output)
                    .copied()
                    .unwrap_or(0)
            };

            write_rela_entry(
                out,
                index,
                section.output_offset + relocation.r_offset,
                relocation.r_type,
                symtab_index,
                addend,
            )?;
            index += 1;
        }
    }
    Ok(())
}

/// For a symbol not present in the output symtab (e.g. a section symbol),
/// finds the output section its definition landed in plus the offset of
/// that definition within the output section.
fn section_symbol_target(
    layout: &Layout<'_>,
    canonical: SymbolId,
) -> Result<(OutputSectionId, u64)> {
    let file_id = layout.symbol_db.file_id_for_symbol(canonical);
    let file = layout.symbol_db.file(file_id);
    let Some(parsed) = file.object() else {
        return Ok((output_section_id::TEXT, 0));
    };
    let index = file.symbol_id_range.id_to_input(canonical);
    let symbol = parsed.object.symbol(index)?;
    let Some(section_index) = parsed.object.symbol_section(symbol, index)? else {
        return Ok((output_section_id::TEXT, 0));
    };
    let object_index = file_id.as_usize() - 1;
    let object = &layout.resolution.objects[object_index];
    match object.sections.get(section_index.0) {
        Some(SectionSlot::Loaded(section)) => Ok((
            section.output_section,
            section.output_offset + symbol.st_value(E),
        )),
        Some(SectionSlot::MergeStrings(merge)) => {
            let offset = layout
                .merged_strings
                .resolve(object_index, section_index, symbol.st_value(E))
                .unwrap_or(0);
            Ok((merge.output_section, offset))
        }
        _ => Ok((output_section_id::TEXT, 0)),
    }
}
