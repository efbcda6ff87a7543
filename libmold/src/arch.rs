//! Abstraction over the CPU architectures we can link for. Everything
//! target-specific is reached through the `Arch` trait, which the link
//! pipeline is monomorphized over, keeping the per-relocation hot path free
//! of dynamic dispatch.

use crate::alignment::Alignment;
use crate::args::OutputKind;
use crate::bail;
use crate::elf::SectionFlags;
use crate::error::Result;
use crate::relocation::DynamicRelocationKind;
use crate::relocation::RelocationKindInfo;
use crate::value_flags::ValueFlags;
use object::elf::EM_AARCH64;
use object::elf::EM_X86_64;
use std::borrow::Cow;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Architecture {
    X86_64,
    AArch64,
}

impl TryFrom<u16> for Architecture {
    type Error = crate::error::Error;

    fn try_from(e_machine: u16) -> Result<Self> {
        match e_machine {
            EM_X86_64 => Ok(Self::X86_64),
            EM_AARCH64 => Ok(Self::AArch64),
            _ => bail!("Unsupported architecture: 0x{e_machine:x}"),
        }
    }
}

impl Architecture {
    /// Parses the argument of `-m`, accepting GNU emulation names.
    pub(crate) fn from_emulation_name(name: &str) -> Result<Self> {
        match name {
            "elf_x86_64" => Ok(Self::X86_64),
            "aarch64elf" | "aarch64linux" => Ok(Self::AArch64),
            _ => bail!("Unsupported emulation `{name}`"),
        }
    }

    pub(crate) fn default_dynamic_linker(self) -> &'static str {
        match self {
            Architecture::X86_64 => "/lib64/ld-linux-x86-64.so.2",
            Architecture::AArch64 => "/lib/ld-linux-aarch64.so.1",
        }
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Architecture::X86_64 => "x86_64",
            Architecture::AArch64 => "aarch64",
        };
        write!(f, "{name}")
    }
}

/// Layout of the TLS segment, used when computing TP-relative offsets.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TlsLayout {
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) alignment: Alignment,
}

pub(crate) trait Arch {
    type Relaxation: Relaxation;

    const KIND: Architecture;

    /// Value for `e_machine` in the output file header.
    fn elf_header_arch_magic() -> u16;

    /// Decodes a raw relocation type into the target-independent model.
    fn relocation_from_raw(r_type: u32) -> Result<RelocationKindInfo>;

    /// Maps a dynamic relocation into the architecture's `r_type` space.
    fn get_dynamic_relocation_type(relocation: DynamicRelocationKind) -> u32;

    fn rel_type_to_string(r_type: u32) -> Cow<'static, str>;

    /// Writes one PLT entry that jumps through the GOT slot at `got_address`.
    fn write_plt_entry(plt_entry: &mut [u8], got_address: u64, plt_address: u64) -> Result;

    /// The address of the thread pointer given the TLS segment layout. TLS
    /// relocations compute offsets relative to this.
    fn tp_offset_start(tls: TlsLayout) -> u64;

    /// Merges the `e_flags` of all input files, failing on incompatibility.
    fn merge_eflags(eflags: &[u32]) -> Result<u32> {
        Ok(eflags.first().copied().unwrap_or(0))
    }

    /// The maximum forward displacement of a direct branch, if branches on
    /// this architecture have a limited range. `None` means branches can
    /// reach anywhere and no thunks are ever needed.
    const MAX_BRANCH_DISPLACEMENT: Option<i64> = None;

    /// Size in bytes of one range-extension thunk.
    const THUNK_SIZE: u64 = 0;

    /// Returns whether the relocation is a direct branch that may need to be
    /// redirected through a thunk if its target is out of range.
    fn is_branch_relocation(_r_type: u32) -> bool {
        false
    }

    /// Writes a thunk at `thunk_address` that transfers control to
    /// `target_address` without clobbering argument registers.
    fn write_thunk(_bytes: &mut [u8], _thunk_address: u64, _target_address: u64) -> Result {
        bail!("This architecture doesn't use thunks");
    }
}

/// An optional instruction rewrite attached to a relocation, e.g. relaxing a
/// GOT load into a direct address computation, or a TLS model downgrade.
pub(crate) trait Relaxation: Sized {
    /// Tries to create a relaxation for a relocation of the specified type at
    /// the given offset. Returns `None` if no rewrite applies.
    fn new(
        r_type: u32,
        section_bytes: &[u8],
        offset_in_section: u64,
        value_flags: ValueFlags,
        output_kind: OutputKind,
        section_flags: SectionFlags,
    ) -> Option<Self>;

    /// Patches the instruction bytes. May adjust the relocation offset and
    /// addend.
    fn apply(&self, section_bytes: &mut [u8], offset_in_section: &mut u64, addend: &mut i64);

    /// The relocation to apply after the rewrite.
    fn rel_info(&self) -> RelocationKindInfo;

    /// Whether the relocation that follows this one should be skipped (TLS
    /// call sequences consume two relocations).
    fn next_modifier(&self) -> RelocationModifier;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocationModifier {
    Normal,
    SkipNextRelocation,
}
