//! Identical code folding. Partitions foldable sections into equivalence
//! classes by iterative refinement: the initial class is a hash of the
//! section's bytes with relocation targets replaced by placeholders, then
//! each round re-hashes with the current class of every relocation target,
//! splitting classes until a fixpoint. One representative per class
//! survives; the rest are deactivated and their symbols resolve to the
//! representative's addresses.

use crate::args::IcfMode;
use crate::elf::shf;
use crate::input_data::FileId;
use crate::input_data::PRELUDE_FILE_ID;
use crate::relocation::RelocationKind;
use crate::arch::Arch;
use crate::resolution::ResolutionOutputs;
use crate::resolution::SectionSlot;
use crate::symbol_db::SymbolDb;
use object::LittleEndian;
use object::read::elf::Sym as _;
use rayon::iter::IntoParallelIterator as _;
use rayon::iter::IntoParallelRefIterator as _;
use rayon::iter::ParallelIterator as _;
use std::hash::Hash as _;
use std::hash::Hasher as _;

const MAX_REFINEMENT_ROUNDS: usize = 10;

/// A section eligible for folding.
#[derive(Clone, Copy)]
struct Candidate {
    object_index: usize,
    section_index: object::SectionIndex,
}

#[tracing::instrument(skip_all, name = "Identical code folding")]
pub(crate) fn fold_identical_sections<'data, A: Arch>(
    symbol_db: &SymbolDb<'data>,
    resolution: &mut ResolutionOutputs<'data>,
) {
    let mode = symbol_db.args.icf;
    if mode == IcfMode::None {
        return;
    }

    let address_taken = if mode == IcfMode::Safe {
        compute_address_taken::<A>(symbol_db, resolution)
    } else {
        Vec::new()
    };

    // Candidate collection is in (file, section) order, which is what makes
    // representative election deterministic.
    let mut candidates = Vec::new();
    let mut candidate_index_by_section: Vec<Vec<Option<u32>>> = Vec::new();
    for (object_index, object) in resolution.objects.iter().enumerate() {
        let mut by_section = vec![None; object.sections.len()];
        if object.is_loaded && !object.is_dynamic {
            for (section_index, slot) in object.sections.iter().enumerate() {
                let SectionSlot::Loaded(section) = slot else {
                    continue;
                };
                if !section.is_alive() || section.size == 0 {
                    continue;
                }
                let flags = section.flags;
                let foldable = flags.contains(shf::EXECINSTR)
                    || (flags.contains(shf::ALLOC)
                        && !flags.contains(shf::WRITE)
                        && !flags.contains(shf::TLS));
                if !foldable || section.ty != object::elf::SHT_PROGBITS {
                    continue;
                }
                if mode == IcfMode::Safe
                    && address_taken
                        .get(object_index)
                        .is_some_and(|taken| taken[section_index])
                {
                    continue;
                }
                by_section[section_index] = Some(candidates.len() as u32);
                candidates.push(Candidate {
                    object_index,
                    section_index: object::SectionIndex(section_index),
                });
            }
        }
        candidate_index_by_section.push(by_section);
    }

    if candidates.is_empty() {
        return;
    }

    // Round zero: content hash with relocation targets canonicalised.
    let mut classes: Vec<u64> = candidates
        .par_iter()
        .map(|candidate| initial_hash::<A>(symbol_db, resolution, candidate))
        .collect();

    // Refinement: re-hash including the classes of relocation targets until
    // the partition stops changing.
    for _ in 0..MAX_REFINEMENT_ROUNDS {
        let next: Vec<u64> = (0..candidates.len())
            .into_par_iter()
            .map(|i| {
                refined_hash(
                    symbol_db,
                    resolution,
                    &candidates[i],
                    classes[i],
                    &classes,
                    &candidate_index_by_section,
                )
            })
            .collect();
        let stable = partition_signature(&classes) == partition_signature(&next);
        classes = next;
        if stable {
            break;
        }
    }

    // Fold each class onto its first member.
    let mut by_class: hashbrown::HashMap<u64, u32> = hashbrown::HashMap::new();
    let mut folds: Vec<(usize, object::SectionIndex, FileId, object::SectionIndex)> = Vec::new();
    for (i, candidate) in candidates.iter().enumerate() {
        match by_class.entry(classes[i]) {
            hashbrown::hash_map::Entry::Vacant(entry) => {
                entry.insert(i as u32);
            }
            hashbrown::hash_map::Entry::Occupied(entry) => {
                let representative = &candidates[*entry.get() as usize];
                if verify_equivalent(symbol_db, resolution, representative, candidate) {
                    let rep_file = resolution.objects[representative.object_index].file_id;
                    folds.push((
                        candidate.object_index,
                        candidate.section_index,
                        rep_file,
                        representative.section_index,
                    ));
                }
            }
        }
    }

    for (object_index, section_index, rep_file, rep_section) in folds {
        if let Some(section) =
            resolution.objects[object_index].sections[section_index.0].as_loaded_mut()
        {
            section.folded_into = Some((rep_file, rep_section));
            section.is_alive = std::sync::atomic::AtomicBool::new(false);
        }
    }
}

/// For `--icf=safe`: a section whose address escapes through anything other
/// than a branch must not be folded, because folding changes address
/// equality.
fn compute_address_taken<'data, A: Arch>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
) -> Vec<Vec<bool>> {
    let mut taken: Vec<Vec<bool>> = resolution
        .objects
        .iter()
        .map(|o| vec![false; o.sections.len()])
        .collect();

    for object in &resolution.objects {
        if !object.is_loaded || object.is_dynamic {
            continue;
        }
        let file = symbol_db.file(object.file_id);
        let Some(parsed) = file.object() else {
            continue;
        };
        for (section_index, _) in object.sections.iter().enumerate() {
            let Ok(relocations) = parsed
                .object
                .relocations(object::SectionIndex(section_index), &object.relocation_sections)
            else {
                continue;
            };
            for relocation in relocations.iter() {
                let is_branch = A::relocation_from_raw(relocation.r_type)
                    .map(|info| info.kind == RelocationKind::PltRelative)
                    .unwrap_or(false);
                if is_branch {
                    continue;
                }
                let id = file.symbol_id_range.input_to_id(relocation.symbol);
                let definition = symbol_db.definition(id);
                let def_file = symbol_db.file_id_for_symbol(definition);
                if def_file == PRELUDE_FILE_ID {
                    continue;
                }
                let def_info = symbol_db.file(def_file);
                let Some(def_parsed) = def_info.object() else {
                    continue;
                };
                let index = def_info.symbol_id_range.id_to_input(definition);
                let Ok(symbol) = def_parsed.object.symbol(index) else {
                    continue;
                };
                if let Ok(Some(target_section)) =
                    def_parsed.object.symbol_section(symbol, index)
                {
                    taken[def_file.as_usize() - 1][target_section.0] = true;
                }
            }
        }
    }
    taken
}

fn section_bytes_with_relocs_zeroed<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    candidate: &Candidate,
) -> Option<(Vec<u8>, Vec<crate::elf::Relocation>)> {
    let object = &resolution.objects[candidate.object_index];
    let file = symbol_db.file(object.file_id);
    let parsed = file.object()?;
    let header = parsed.object.section(candidate.section_index).ok()?;
    let mut bytes = parsed.object.raw_section_data(header).ok()?.to_vec();
    let relocations: Vec<_> = parsed
        .object
        .relocations(candidate.section_index, &object.relocation_sections)
        .ok()?
        .iter()
        .collect();
    for relocation in &relocations {
        let offset = relocation.r_offset as usize;
        // Patch widths vary; zeroing eight bytes covers every relocation we
        // support and keeps the hash stable across addend encodings.
        let end = (offset + 8).min(bytes.len());
        if offset < bytes.len() {
            bytes[offset..end].fill(0);
        }
    }
    Some((bytes, relocations))
}

fn initial_hash<'data, A: Arch>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    candidate: &Candidate,
) -> u64 {
    let object = &resolution.objects[candidate.object_index];
    let Some(section) = object.sections[candidate.section_index.0].as_loaded() else {
        return 0;
    };
    let Some((bytes, relocations)) = section_bytes_with_relocs_zeroed(symbol_db, resolution, candidate)
    else {
        return 0;
    };

    let mut hasher = std::hash::BuildHasher::build_hasher(&foldhash::fast::FixedState::default());
    section.flags.raw().hash(&mut hasher);
    section.ty.hash(&mut hasher);
    section.alignment.exponent.hash(&mut hasher);
    hasher.write(&bytes);
    for relocation in &relocations {
        relocation.r_offset.hash(&mut hasher);
        relocation.r_type.hash(&mut hasher);
        relocation.addend.hash(&mut hasher);
    }
    hasher.finish()
}

fn refined_hash<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    candidate: &Candidate,
    current_class: u64,
    classes: &[u64],
    candidate_index_by_section: &[Vec<Option<u32>>],
) -> u64 {
    let object = &resolution.objects[candidate.object_index];
    let file = symbol_db.file(object.file_id);
    let Some(parsed) = file.object() else {
        return current_class;
    };
    let Ok(relocations) = parsed
        .object
        .relocations(candidate.section_index, &object.relocation_sections)
    else {
        return current_class;
    };

    let mut hasher = std::hash::BuildHasher::build_hasher(&foldhash::fast::FixedState::default());
    current_class.hash(&mut hasher);
    for relocation in relocations.iter() {
        let id = file.symbol_id_range.input_to_id(relocation.symbol);
        let definition = symbol_db.definition(id);
        let def_file = symbol_db.file_id_for_symbol(definition);

        let mut target_class: Option<u64> = None;
        let mut target_offset = 0u64;
        if def_file != PRELUDE_FILE_ID {
            let def_info = symbol_db.file(def_file);
            if let Some(def_parsed) = def_info.object() {
                let index = def_info.symbol_id_range.id_to_input(definition);
                if let Ok(symbol) = def_parsed.object.symbol(index) {
                    if let Ok(Some(target_section)) =
                        def_parsed.object.symbol_section(symbol, index)
                    {
                        target_offset = symbol.st_value(LittleEndian);
                        target_class = candidate_index_by_section[def_file.as_usize() - 1]
                            [target_section.0]
                            .map(|i| classes[i as usize]);
                    }
                }
            }
        }

        match target_class {
            Some(class) => {
                // Relocation-isomorphic: what matters is the class of the
                // target, not its identity.
                1u8.hash(&mut hasher);
                class.hash(&mut hasher);
                target_offset.hash(&mut hasher);
            }
            None => {
                0u8.hash(&mut hasher);
                definition.as_usize().hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}

/// Normalises a class assignment into first-occurrence group numbers so two
/// partitions can be compared structurally.
fn partition_signature(classes: &[u64]) -> Vec<u32> {
    let mut mapping: hashbrown::HashMap<u64, u32> = hashbrown::HashMap::new();
    classes
        .iter()
        .map(|&class| {
            let next = mapping.len() as u32;
            *mapping.entry(class).or_insert(next)
        })
        .collect()
}

/// Hash collisions must not fold distinct sections: verify bytes and
/// relocation structure before trusting a class match.
fn verify_equivalent<'data>(
    symbol_db: &SymbolDb<'data>,
    resolution: &ResolutionOutputs<'data>,
    a: &Candidate,
    b: &Candidate,
) -> bool {
    let (Some((bytes_a, relocations_a)), Some((bytes_b, relocations_b))) = (
        section_bytes_with_relocs_zeroed(symbol_db, resolution, a),
        section_bytes_with_relocs_zeroed(symbol_db, resolution, b),
    ) else {
        return false;
    };
    if bytes_a != bytes_b || relocations_a.len() != relocations_b.len() {
        return false;
    }
    relocations_a.iter().zip(&relocations_b).all(|(x, y)| {
        x.r_offset == y.r_offset && x.r_type == y.r_type && x.addend == y.addend
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_signature() {
        assert_eq!(partition_signature(&[7, 7, 9]), vec![0, 0, 1]);
        assert_eq!(partition_signature(&[9, 7, 7]), vec![0, 1, 1]);
        // Same partition structure, different hash values.
        assert_eq!(
            partition_signature(&[1, 2, 1]),
            partition_signature(&[5, 9, 5])
        );
        assert_ne!(
            partition_signature(&[1, 2, 1]),
            partition_signature(&[5, 5, 9])
        );
    }
}
