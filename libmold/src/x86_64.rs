//! x86-64 specific relocation handling, including the relocation relaxation
//! optimisations. Relaxations are nominally optional, but libc in some cases
//! won't work without them. e.g. it uses GOT relocations in `_start`, which
//! cannot work in a static binary because dynamic relocations haven't been
//! applied to the GOT yet.

use crate::arch::Arch;
use crate::arch::Architecture;
use crate::arch::RelocationModifier;
use crate::arch::TlsLayout;
use crate::args::OutputKind;
use crate::const_name_by_value;
use crate::elf::PLT_ENTRY_SIZE;
use crate::elf::SectionFlags;
use crate::elf::shf;
use crate::error::Result;
use crate::relocation::AllowedRange;
use crate::relocation::DynamicRelocationKind;
use crate::relocation::RelocationKind;
use crate::relocation::RelocationKindInfo;
use crate::relocation::RelocationSize;
use crate::value_flags::ValueFlags;
use anyhow::anyhow;
use std::borrow::Cow;

pub(crate) struct X86_64;

const PLT_ENTRY_TEMPLATE: &[u8] = &[
    0xf3, 0x0f, 0x1e, 0xfa, // endbr64
    0xf2, 0xff, 0x25, 0x0, 0x0, 0x0, 0x0, // bnd jmp *{relative GOT address}(%rip)
    0x0f, 0x1f, 0x44, 0x0, 0x0, // nopl 0x0(%rax,%rax,1)
];

const _ASSERTS: () = {
    assert!(PLT_ENTRY_TEMPLATE.len() as u64 == PLT_ENTRY_SIZE);
};

impl Arch for X86_64 {
    type Relaxation = Relaxation;

    const KIND: Architecture = Architecture::X86_64;

    fn elf_header_arch_magic() -> u16 {
        object::elf::EM_X86_64
    }

    fn relocation_from_raw(r_type: u32) -> Result<RelocationKindInfo> {
        let (kind, size) = match r_type {
            object::elf::R_X86_64_64 => (RelocationKind::Absolute, 8),
            object::elf::R_X86_64_PC32 => (RelocationKind::Relative, 4),
            object::elf::R_X86_64_PC64 => (RelocationKind::Relative, 8),
            object::elf::R_X86_64_GOT32 => (RelocationKind::GotRelGotBase, 4),
            object::elf::R_X86_64_GOT64 => (RelocationKind::GotRelGotBase, 8),
            object::elf::R_X86_64_GOTOFF64 => (RelocationKind::SymRelGotBase, 8),
            object::elf::R_X86_64_PLT32 => (RelocationKind::PltRelative, 4),
            object::elf::R_X86_64_PLTOFF64 => (RelocationKind::PltRelGotBase, 8),
            object::elf::R_X86_64_GOTPCREL => (RelocationKind::GotRelative, 4),

            // GOTPC64 and GOTPC32 always reference _GLOBAL_OFFSET_TABLE_, so
            // they reduce to plain relative relocations.
            object::elf::R_X86_64_GOTPC64 => (RelocationKind::Relative, 8),
            object::elf::R_X86_64_GOTPC32 => (RelocationKind::Relative, 4),

            object::elf::R_X86_64_32 | object::elf::R_X86_64_32S => (RelocationKind::Absolute, 4),
            object::elf::R_X86_64_16 => (RelocationKind::Absolute, 2),
            object::elf::R_X86_64_PC16 => (RelocationKind::Relative, 2),
            object::elf::R_X86_64_8 => (RelocationKind::Absolute, 1),
            object::elf::R_X86_64_PC8 => (RelocationKind::Relative, 1),
            object::elf::R_X86_64_TLSGD => (RelocationKind::TlsGd, 4),
            object::elf::R_X86_64_TLSLD => (RelocationKind::TlsLd, 4),
            object::elf::R_X86_64_DTPOFF32 => (RelocationKind::DtpOff, 4),
            object::elf::R_X86_64_DTPOFF64 => (RelocationKind::DtpOff, 8),
            object::elf::R_X86_64_GOTTPOFF => (RelocationKind::GotTpOff, 4),
            object::elf::R_X86_64_GOTPCRELX | object::elf::R_X86_64_REX_GOTPCRELX => {
                (RelocationKind::GotRelative, 4)
            }
            object::elf::R_X86_64_TPOFF32 => (RelocationKind::TpOff, 4),
            object::elf::R_X86_64_TPOFF64 => (RelocationKind::TpOff, 8),
            object::elf::R_X86_64_GOTPC32_TLSDESC => (RelocationKind::TlsDesc, 4),
            object::elf::R_X86_64_TLSDESC_CALL => (RelocationKind::TlsDescCall, 0),
            object::elf::R_X86_64_NONE => (RelocationKind::None, 0),
            _ => {
                return Err(anyhow!(
                    "Unsupported relocation type {}",
                    Self::rel_type_to_string(r_type)
                ));
            }
        };
        Ok(RelocationKindInfo {
            kind,
            size: RelocationSize::ByteSize(size),
            range: AllowedRange::from_byte_size(size),
        })
    }

    fn get_dynamic_relocation_type(relocation: DynamicRelocationKind) -> u32 {
        match relocation {
            DynamicRelocationKind::Copy => object::elf::R_X86_64_COPY,
            DynamicRelocationKind::Irelative => object::elf::R_X86_64_IRELATIVE,
            DynamicRelocationKind::DtpMod => object::elf::R_X86_64_DTPMOD64,
            DynamicRelocationKind::DtpOff => object::elf::R_X86_64_DTPOFF64,
            DynamicRelocationKind::TpOff => object::elf::R_X86_64_TPOFF64,
            DynamicRelocationKind::Relative => object::elf::R_X86_64_RELATIVE,
            DynamicRelocationKind::DynamicSymbol => object::elf::R_X86_64_GLOB_DAT,
            DynamicRelocationKind::JumpSlot => object::elf::R_X86_64_JUMP_SLOT,
            DynamicRelocationKind::TlsDesc => object::elf::R_X86_64_TLSDESC,
        }
    }

    fn rel_type_to_string(r_type: u32) -> Cow<'static, str> {
        if let Some(name) = const_name_by_value![
            r_type,
            R_X86_64_NONE,
            R_X86_64_64,
            R_X86_64_PC32,
            R_X86_64_GOT32,
            R_X86_64_PLT32,
            R_X86_64_COPY,
            R_X86_64_GLOB_DAT,
            R_X86_64_JUMP_SLOT,
            R_X86_64_RELATIVE,
            R_X86_64_GOTPCREL,
            R_X86_64_32,
            R_X86_64_32S,
            R_X86_64_16,
            R_X86_64_PC16,
            R_X86_64_8,
            R_X86_64_PC8,
            R_X86_64_DTPMOD64,
            R_X86_64_DTPOFF64,
            R_X86_64_TPOFF64,
            R_X86_64_TLSGD,
            R_X86_64_TLSLD,
            R_X86_64_DTPOFF32,
            R_X86_64_GOTTPOFF,
            R_X86_64_TPOFF32,
            R_X86_64_PC64,
            R_X86_64_GOTOFF64,
            R_X86_64_GOTPC32,
            R_X86_64_GOT64,
            R_X86_64_GOTPC64,
            R_X86_64_PLTOFF64,
            R_X86_64_GOTPC32_TLSDESC,
            R_X86_64_TLSDESC_CALL,
            R_X86_64_TLSDESC,
            R_X86_64_IRELATIVE,
            R_X86_64_GOTPCRELX,
            R_X86_64_REX_GOTPCRELX
        ] {
            Cow::Borrowed(name)
        } else {
            Cow::Owned(format!("Unknown relocation type 0x{r_type:x}"))
        }
    }

    fn write_plt_entry(plt_entry: &mut [u8], got_address: u64, plt_address: u64) -> Result {
        plt_entry.copy_from_slice(PLT_ENTRY_TEMPLATE);
        let offset: i32 = ((got_address.wrapping_sub(plt_address + 0xb)) as i64)
            .try_into()
            .map_err(|_| anyhow!("PLT is more than 2GiB away from GOT"))?;
        plt_entry[7..11].copy_from_slice(&offset.to_le_bytes());
        Ok(())
    }

    /// x86-64 uses TLS variant II: the thread pointer sits just past the end
    /// of the TLS block and offsets are negative.
    fn tp_offset_start(tls: TlsLayout) -> u64 {
        tls.alignment.align_up(tls.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelaxationKind {
    /// Leave the instruction alone, only change the relocation kind.
    NoOp,

    /// `mov *x(%rip), reg` -> `lea x(%rip), reg`.
    MovIndirectToLea,

    /// `mov *x(%rip), reg` -> `mov $x, reg` (REX prefixed form).
    RexMovIndirectToAbsolute,

    /// `call *x(%rip)` -> `addr32 call x`.
    CallIndirectToRelative,

    /// `jmp *x(%rip)` -> `jmp x; nop`.
    JmpIndirectToRelative,

    /// Transform general dynamic (GD) into initial exec.
    TlsGdToInitialExec,

    /// Transform general dynamic (GD) into local exec.
    TlsGdToLocalExec,

    /// Transform local dynamic (LD) into local exec.
    TlsLdToLocalExec,
}

#[derive(Debug, Clone)]
pub(crate) struct Relaxation {
    kind: RelaxationKind,
    rel_info: RelocationKindInfo,
}

impl Relaxation {
    fn create(kind: RelaxationKind, new_r_type: u32) -> Option<Relaxation> {
        // This only fails for relocation types we don't support, and
        // relaxing to an unsupported type would be a bug.
        let rel_info = X86_64::relocation_from_raw(new_r_type).unwrap();
        Some(Relaxation { kind, rel_info })
    }
}

impl crate::arch::Relaxation for Relaxation {
    fn new(
        r_type: u32,
        section_bytes: &[u8],
        offset_in_section: u64,
        value_flags: ValueFlags,
        output_kind: OutputKind,
        section_flags: SectionFlags,
    ) -> Option<Self> {
        // All relaxations rewrite executable code.
        if !section_flags.contains(shf::EXECINSTR) {
            return None;
        }

        let can_bypass_got = value_flags.contains(ValueFlags::CAN_BYPASS_GOT)
            && !value_flags.contains(ValueFlags::DYNAMIC)
            && !value_flags.contains(ValueFlags::IFUNC);
        let offset = offset_in_section as usize;

        match r_type {
            object::elf::R_X86_64_REX_GOTPCRELX if can_bypass_got && offset >= 3 => {
                let rex = section_bytes[offset - 3];
                if rex != 0x48 && rex != 0x4c {
                    return None;
                }
                // mov *x(%rip), reg
                if section_bytes[offset - 2] == 0x8b {
                    return Self::create(
                        RelaxationKind::MovIndirectToLea,
                        object::elf::R_X86_64_PC32,
                    );
                }
                None
            }
            object::elf::R_X86_64_GOTPCRELX if can_bypass_got && offset >= 2 => {
                match section_bytes.get(offset - 2..offset)? {
                    // call *x(%rip)
                    [0xff, 0x15] => Self::create(
                        RelaxationKind::CallIndirectToRelative,
                        object::elf::R_X86_64_PC32,
                    ),
                    // jmp *x(%rip)
                    [0xff, 0x25] => Self::create(
                        RelaxationKind::JmpIndirectToRelative,
                        object::elf::R_X86_64_PC32,
                    ),
                    [_, 0x8b] => Self::create(
                        RelaxationKind::MovIndirectToLea,
                        object::elf::R_X86_64_PC32,
                    ),
                    _ => None,
                }
            }
            object::elf::R_X86_64_PLT32 if can_bypass_got => {
                Self::create(RelaxationKind::NoOp, object::elf::R_X86_64_PC32)
            }
            object::elf::R_X86_64_GOTTPOFF
                if can_bypass_got && output_kind.is_executable() && offset >= 3 => {
                // mov *x(%rip), reg
                match section_bytes.get(offset - 3..offset - 1)? {
                    [0x48 | 0x4c, 0x8b] => Self::create(
                        RelaxationKind::RexMovIndirectToAbsolute,
                        object::elf::R_X86_64_TPOFF32,
                    ),
                    _ => None,
                }
            }
            object::elf::R_X86_64_TLSGD if output_kind.is_executable() && offset >= 4 => {
                // data16 lea 0x0(%rip),%rdi; data16 data16 rex.W call __tls_get_addr
                if section_bytes.get(offset - 4..offset)? != [0x66, 0x48, 0x8d, 0x3d]
                    || section_bytes.get(offset + 4..offset + 8)? != [0x66, 0x66, 0x48, 0xe8]
                {
                    return None;
                }
                if can_bypass_got && !value_flags.contains(ValueFlags::DYNAMIC) {
                    Self::create(RelaxationKind::TlsGdToLocalExec, object::elf::R_X86_64_TPOFF32)
                } else {
                    Self::create(
                        RelaxationKind::TlsGdToInitialExec,
                        object::elf::R_X86_64_GOTTPOFF,
                    )
                }
            }
            object::elf::R_X86_64_TLSLD if output_kind.is_executable() && offset >= 3 => {
                // lea 0x0(%rip),%rdi
                if section_bytes.get(offset - 3..offset)? != [0x48, 0x8d, 0x3d] {
                    return None;
                }
                Self::create(RelaxationKind::TlsLdToLocalExec, object::elf::R_X86_64_NONE)
            }
            _ => None,
        }
    }

    fn apply(&self, section_bytes: &mut [u8], offset_in_section: &mut u64, addend: &mut i64) {
        let offset = *offset_in_section as usize;
        match self.kind {
            RelaxationKind::NoOp => {}
            RelaxationKind::MovIndirectToLea => {
                section_bytes[offset - 2] = 0x8d;
            }
            RelaxationKind::RexMovIndirectToAbsolute => {
                let rex = section_bytes[offset - 3];
                section_bytes[offset - 3] = (rex & !4) | ((rex & 4) >> 2);
                section_bytes[offset - 2] = 0xc7;
                let mod_rm = &mut section_bytes[offset - 1];
                *mod_rm = (*mod_rm >> 3) & 0x7 | 0xc0;
                *addend = 0;
            }
            RelaxationKind::CallIndirectToRelative => {
                section_bytes[offset - 2..offset].copy_from_slice(&[0x67, 0xe8]);
            }
            RelaxationKind::JmpIndirectToRelative => {
                section_bytes[offset - 2..offset + 4].copy_from_slice(&[0xe9, 0, 0, 0, 0, 0x90]);
                *offset_in_section -= 1;
            }
            RelaxationKind::TlsGdToInitialExec => {
                section_bytes[offset - 4..offset + 8].copy_from_slice(&[
                    0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0,%rax
                    0x48, 0x03, 0x05, // add *x(%rip),%rax
                ]);
                *offset_in_section += 8;
            }
            RelaxationKind::TlsGdToLocalExec => {
                section_bytes[offset - 4..offset + 8].copy_from_slice(&[
                    0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0, // mov %fs:0,%rax
                    0x48, 0x8d, 0x80, // lea {offset}(%rax),%rax
                ]);
                *offset_in_section += 8;
                *addend = 0;
            }
            RelaxationKind::TlsLdToLocalExec => {
                section_bytes[offset - 3..offset + 9].copy_from_slice(&[
                    // mov %fs:0,%rax padded to cover the call that follows
                    0x66, 0x66, 0x66, 0x64, 0x48, 0x8b, 0x04, 0x25, 0, 0, 0, 0,
                ]);
                *offset_in_section += 5;
            }
        }
    }

    fn rel_info(&self) -> RelocationKindInfo {
        self.rel_info
    }

    fn next_modifier(&self) -> RelocationModifier {
        match self.kind {
            RelaxationKind::TlsGdToInitialExec
            | RelaxationKind::TlsGdToLocalExec
            | RelaxationKind::TlsLdToLocalExec => RelocationModifier::SkipNextRelocation,
            _ => RelocationModifier::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Relaxation as _;
    use crate::args::RelocationModel;

    #[test]
    fn test_plt_entry_offsets() {
        let mut entry = [0u8; PLT_ENTRY_TEMPLATE.len()];
        X86_64::write_plt_entry(&mut entry, 0x404000, 0x401020).unwrap();
        let offset = i32::from_le_bytes(entry[7..11].try_into().unwrap());
        assert_eq!(offset, (0x404000i64 - (0x401020 + 0xb)) as i32);
    }

    #[test]
    fn test_mov_relaxation() {
        // mov 0x0(%rip),%rbp with a REX_GOTPCRELX against a local symbol
        let bytes = [0x48, 0x8b, 0x2d];
        let relaxation = Relaxation::new(
            object::elf::R_X86_64_REX_GOTPCRELX,
            &bytes,
            3,
            ValueFlags::CAN_BYPASS_GOT,
            OutputKind::StaticExecutable(RelocationModel::NonRelocatable),
            shf::EXECINSTR,
        )
        .unwrap();
        let mut out = bytes;
        let mut offset = 3;
        let mut addend = -4i64;
        relaxation.apply(&mut out, &mut offset, &mut addend);
        assert_eq!(out, [0x48, 0x8d, 0x2d]);
        assert_eq!(relaxation.rel_info().kind, RelocationKind::Relative);
    }

    #[test]
    fn test_no_relaxation_in_data_section(){
        assert!(
            Relaxation::new(
                object::elf::R_X86_64_REX_GOTPCRELX,
                &[0x48, 0x8b, 0x2d],
                3,
                ValueFlags::CAN_BYPASS_GOT,
                OutputKind::StaticExecutable(RelocationModel::NonRelocatable),
                SectionFlags::empty(),
            )
            .is_none()
        );
    }

    #[test]
    fn test_tls_ld_relaxation() {
        // lea 0x0(%rip),%rdi followed by call
        let mut bytes = vec![0x48, 0x8d, 0x3d, 0, 0, 0, 0, 0xe8, 0, 0, 0, 0];
        let relaxation = Relaxation::new(
            object::elf::R_X86_64_TLSLD,
            &bytes,
            3,
            ValueFlags::CAN_BYPASS_GOT,
            OutputKind::DynamicExecutable(RelocationModel::Relocatable),
            shf::EXECINSTR,
        )
        .unwrap();
        let mut offset = 3;
        relaxation.apply(&mut bytes, &mut offset, &mut 0);
        assert_eq!(relaxation.next_modifier(), RelocationModifier::SkipNextRelocation);
        assert_eq!(&bytes[..8], &[0x66, 0x66, 0x66, 0x64, 0x48, 0x8b, 0x04, 0x25]);
    }
}
