//! Interning of `SHF_MERGE` sections. Fragments from all inputs with the
//! same output section are interned into a single table keyed by the
//! fragment's bytes; the first insertion wins the offset and the output is
//! the insertion-order concatenation. Splitting and hashing runs in
//! parallel; insertion happens in deterministic input order so that offsets
//! (and therefore output bytes) don't depend on thread count.

use crate::alignment::Alignment;
use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::hash::PreHashed;
use crate::hash::hash_bytes;
use crate::output_section_id::OutputSectionId;
use crate::resolution::ResolutionOutputs;
use crate::resolution::SectionSlot;
use rayon::iter::IntoParallelRefIterator as _;
use rayon::iter::ParallelIterator as _;

/// A fragment from a string-merge section, including its NUL terminator for
/// string sections.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) struct MergeString<'data> {
    bytes: &'data [u8],
}

impl<'data> MergeString<'data> {
    pub(crate) fn bytes(&self) -> &'data [u8] {
        self.bytes
    }
}

/// One output section's interned contents.
#[derive(Default)]
pub(crate) struct MergedStringsSection<'data> {
    /// The fragments in output order.
    pub(crate) strings: Vec<&'data [u8]>,

    pub(crate) total_size: u64,

    pub(crate) alignment: Alignment,

    string_offsets: PassThroughHashMap<MergeString<'data>, u64>,
}

/// Everything produced by string merging: contents per output section plus
/// the per-input-section maps needed to resolve references into merged data.
#[derive(Default)]
pub(crate) struct MergedStrings<'data> {
    pub(crate) by_section: hashbrown::HashMap<OutputSectionId, MergedStringsSection<'data>>,

    /// (object index, section index) -> sorted (input offset, output offset)
    /// pairs, one per fragment.
    offset_maps: hashbrown::HashMap<(usize, usize), Vec<(u64, u64)>>,
}

impl<'data> MergedStrings<'data> {
    /// Translates an offset into an input merge section to the offset within
    /// the merged output contents. Offsets that point into the middle of a
    /// fragment stay middle-relative, which is what references into the
    /// middle of strings need.
    pub(crate) fn resolve(
        &self,
        object_index: usize,
        section_index: object::SectionIndex,
        input_offset: u64,
    ) -> Result<u64> {
        let map = self
            .offset_maps
            .get(&(object_index, section_index.0))
            .context("Reference into a section that wasn't string-merged")?;
        let position = map.partition_point(|&(input, _)| input <= input_offset);
        if position == 0 {
            bail!("Reference before the first merge fragment");
        }
        let (piece_input, piece_output) = map[position - 1];
        Ok(piece_output + (input_offset - piece_input))
    }

    pub(crate) fn section_size(&self, id: OutputSectionId) -> u64 {
        self.by_section.get(&id).map_or(0, |s| s.total_size)
    }

    pub(crate) fn section_alignment(&self, id: OutputSectionId) -> Option<Alignment> {
        self.by_section.get(&id).map(|s| s.alignment)
    }
}

struct PendingFragment<'data> {
    string: PreHashed<MergeString<'data>>,
    input_offset: u64,
}

struct SplitSection<'data> {
    object_index: usize,
    section_index: object::SectionIndex,
    output_section: OutputSectionId,
    alignment: Alignment,
    fragments: Vec<PendingFragment<'data>>,
}

#[tracing::instrument(skip_all, name = "Merge strings")]
pub(crate) fn merge_strings<'data>(
    resolution: &ResolutionOutputs<'data>,
) -> Result<MergedStrings<'data>> {
    // Collect merge slots in deterministic (file, section) order.
    let mut inputs = Vec::new();
    for (object_index, object) in resolution.objects.iter().enumerate() {
        if !object.is_loaded || object.is_dynamic {
            continue;
        }
        for slot in &object.sections {
            if let SectionSlot::MergeStrings(merge) = slot {
                inputs.push((object_index, merge));
            }
        }
    }

    // Phase 1 (parallel): split into fragments and hash them.
    let split: Vec<SplitSection> = inputs
        .par_iter()
        .map(|(object_index, merge)| -> Result<SplitSection> {
            let fragments = if merge.is_strings {
                split_strings(merge.data)?
            } else {
                split_fixed(merge.data, merge.entry_size)?
            };
            Ok(SplitSection {
                object_index: *object_index,
                section_index: merge.index,
                output_section: merge.output_section,
                alignment: merge.alignment,
                fragments,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // Phase 2 (serial, deterministic): intern in input order.
    let mut merged = MergedStrings::default();
    for section in &split {
        let out = merged.by_section.entry(section.output_section).or_default();
        out.alignment = out.alignment.merge(section.alignment);
    }
    for section in &split {
        let out = merged
            .by_section
            .get_mut(&section.output_section)
            .expect("populated above");
        let mut map = Vec::with_capacity(section.fragments.len());
        for fragment in &section.fragments {
            let offset = match out.string_offsets.entry(fragment.string) {
                hashbrown::hash_map::Entry::Occupied(entry) => *entry.get(),
                hashbrown::hash_map::Entry::Vacant(entry) => {
                    let offset = out.alignment.align_up(out.total_size);
                    out.total_size = offset + fragment.string.bytes.len() as u64;
                    out.strings.push(fragment.string.bytes);
                    entry.insert(offset);
                    offset
                }
            };
            map.push((fragment.input_offset, offset));
        }
        merged
            .offset_maps
            .insert((section.object_index, section.section_index.0), map);
    }

    Ok(merged)
}

fn split_strings<'data>(data: &'data [u8]) -> Result<Vec<PendingFragment<'data>>> {
    let mut fragments = Vec::new();
    let mut offset = 0u64;
    let mut rest = data;
    while !rest.is_empty() {
        let end = memchr::memchr(0, rest)
            .context("String-merge section is not NUL terminated")?;
        let bytes = &rest[..=end];
        fragments.push(PendingFragment {
            string: PreHashed::new(MergeString { bytes }, hash_bytes(bytes)),
            input_offset: offset,
        });
        offset += bytes.len() as u64;
        rest = &rest[end + 1..];
    }
    Ok(fragments)
}

fn split_fixed<'data>(data: &'data [u8], entry_size: u64) -> Result<Vec<PendingFragment<'data>>> {
    let entry_size = entry_size as usize;
    if data.len() % entry_size != 0 {
        bail!(
            "Merge section size {} is not a multiple of its entry size {entry_size}",
            data.len()
        );
    }
    Ok(data
        .chunks_exact(entry_size)
        .enumerate()
        .map(|(i, bytes)| PendingFragment {
            string: PreHashed::new(MergeString { bytes }, hash_bytes(bytes)),
            input_offset: (i * entry_size) as u64,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_strings() {
        let fragments = split_strings(b"foo\0barbar\0\0").unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].string.bytes(), b"foo\0");
        assert_eq!(fragments[1].string.bytes(), b"barbar\0");
        assert_eq!(fragments[1].input_offset, 4);
        assert_eq!(fragments[2].string.bytes(), b"\0");
    }

    #[test]
    fn test_unterminated_string_is_error() {
        assert!(split_strings(b"foo\0bar").is_err());
    }

    #[test]
    fn test_split_fixed() {
        let fragments = split_fixed(b"aabbccdd", 2).unwrap();
        assert_eq!(fragments.len(), 4);
        assert_eq!(fragments[2].input_offset, 4);
        assert!(split_fixed(b"aabbc", 2).is_err());
    }

    #[test]
    fn test_interning_dedupes_and_preserves_first_offset() {
        let mut out = MergedStringsSection::default();
        out.alignment = Alignment::default();
        for (bytes, expected_offset) in
            [(b"aa\0".as_slice(), 0), (b"b\0".as_slice(), 3), (b"aa\0".as_slice(), 0)]
        {
            let string = PreHashed::new(MergeString { bytes }, hash_bytes(bytes));
            let offset = match out.string_offsets.entry(string) {
                hashbrown::hash_map::Entry::Occupied(entry) => *entry.get(),
                hashbrown::hash_map::Entry::Vacant(entry) => {
                    let offset = out.total_size;
                    out.total_size += bytes.len() as u64;
                    out.strings.push(bytes);
                    entry.insert(offset);
                    offset
                }
            };
            assert_eq!(offset, expected_offset);
        }
        assert_eq!(out.strings.len(), 2);
    }
}
