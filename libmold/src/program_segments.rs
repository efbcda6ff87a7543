use crate::alignment;
use crate::alignment::Alignment;

/// An ID for a program segment (a phdr in the output file).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ProgramSegmentId(u8);

pub(crate) const PHDR: ProgramSegmentId = ProgramSegmentId(0);
pub(crate) const INTERP: ProgramSegmentId = ProgramSegmentId(1);
pub(crate) const LOAD_RO: ProgramSegmentId = ProgramSegmentId(2);
pub(crate) const LOAD_EXEC: ProgramSegmentId = ProgramSegmentId(3);
pub(crate) const LOAD_RW: ProgramSegmentId = ProgramSegmentId(4);
pub(crate) const TLS: ProgramSegmentId = ProgramSegmentId(5);
pub(crate) const DYNAMIC: ProgramSegmentId = ProgramSegmentId(6);
pub(crate) const GNU_RELRO: ProgramSegmentId = ProgramSegmentId(7);
pub(crate) const EH_FRAME_HDR: ProgramSegmentId = ProgramSegmentId(8);
pub(crate) const NOTE: ProgramSegmentId = ProgramSegmentId(9);
pub(crate) const GNU_STACK: ProgramSegmentId = ProgramSegmentId(10);

pub(crate) const NUM_SEGMENTS: usize = 11;

pub(crate) struct ProgramSegmentDef {
    pub(crate) segment_type: u32,
    pub(crate) flags: u32,
    pub(crate) min_alignment: Alignment,
}

impl ProgramSegmentId {
    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_usize(raw: usize) -> Self {
        Self(raw as u8)
    }

    pub(crate) fn all() -> impl Iterator<Item = ProgramSegmentId> {
        (0..NUM_SEGMENTS).map(ProgramSegmentId::from_usize)
    }

    pub(crate) fn def(self) -> &'static ProgramSegmentDef {
        &SEGMENT_DEFS[self.as_usize()]
    }

    pub(crate) fn is_load(self) -> bool {
        self.def().segment_type == object::elf::PT_LOAD
    }
}

const SEGMENT_DEFS: [ProgramSegmentDef; NUM_SEGMENTS] = [
    // PHDR
    ProgramSegmentDef {
        segment_type: object::elf::PT_PHDR,
        flags: object::elf::PF_R,
        min_alignment: alignment::USIZE,
    },
    // INTERP
    ProgramSegmentDef {
        segment_type: object::elf::PT_INTERP,
        flags: object::elf::PF_R,
        min_alignment: alignment::MIN,
    },
    // LOAD_RO
    ProgramSegmentDef {
        segment_type: object::elf::PT_LOAD,
        flags: object::elf::PF_R,
        min_alignment: alignment::MIN,
    },
    // LOAD_EXEC
    ProgramSegmentDef {
        segment_type: object::elf::PT_LOAD,
        flags: object::elf::PF_R | object::elf::PF_X,
        min_alignment: alignment::MIN,
    },
    // LOAD_RW
    ProgramSegmentDef {
        segment_type: object::elf::PT_LOAD,
        flags: object::elf::PF_R | object::elf::PF_W,
        min_alignment: alignment::MIN,
    },
    // TLS
    ProgramSegmentDef {
        segment_type: object::elf::PT_TLS,
        flags: object::elf::PF_R,
        min_alignment: alignment::USIZE,
    },
    // DYNAMIC
    ProgramSegmentDef {
        segment_type: object::elf::PT_DYNAMIC,
        flags: object::elf::PF_R | object::elf::PF_W,
        min_alignment: alignment::USIZE,
    },
    // GNU_RELRO
    ProgramSegmentDef {
        segment_type: object::elf::PT_GNU_RELRO,
        flags: object::elf::PF_R,
        min_alignment: alignment::MIN,
    },
    // EH_FRAME_HDR
    ProgramSegmentDef {
        segment_type: object::elf::PT_GNU_EH_FRAME,
        flags: object::elf::PF_R,
        min_alignment: alignment::EH_FRAME_HDR,
    },
    // NOTE
    ProgramSegmentDef {
        segment_type: object::elf::PT_NOTE,
        flags: object::elf::PF_R,
        min_alignment: alignment::NOTE_GNU_BUILD_ID,
    },
    // GNU_STACK
    ProgramSegmentDef {
        segment_type: object::elf::PT_GNU_STACK,
        flags: object::elf::PF_R | object::elf::PF_W,
        min_alignment: alignment::STACK,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_segments() {
        assert!(LOAD_RO.is_load());
        assert!(LOAD_EXEC.is_load());
        assert!(LOAD_RW.is_load());
        assert!(!TLS.is_load());
        assert!(!GNU_RELRO.is_load());
    }
}
