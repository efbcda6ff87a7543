//! AArch64 specific relocation handling. Unlike x86-64, most relocations
//! here patch immediate fields of fixed-width instructions, and direct
//! branches have a limited ±128 MiB range, which is where range-extension
//! thunks come in.

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
use crate::relocation::BitRange;
use crate::relocation::DynamicRelocationKind;
use crate::relocation::RelocationInstruction;
use crate::relocation::RelocationKind;
use crate::relocation::RelocationKindInfo;
use crate::relocation::RelocationSize;
use crate::relocation::page;
use crate::value_flags::ValueFlags;
use anyhow::anyhow;
use anyhow::bail;
use std::borrow::Cow;

pub(crate) struct AArch64;

const PLT_ENTRY_TEMPLATE: &[u8] = &[
    0x10, 0x00, 0x00, 0x90, // adrp x16, page(&(.got.plt[n]))
    0x11, 0x02, 0x40, 0xf9, // ldr x17, [x16, offset(&(.got.plt[n]))]
    0x20, 0x02, 0x1f, 0xd6, // br x17
    0x1f, 0x20, 0x03, 0xd5, // nop
];

/// A range-extension thunk: materialise the full target address then branch.
/// x16 is the inter-procedure scratch register, so it's safe to clobber.
const THUNK_TEMPLATE: &[u8] = &[
    0x10, 0x00, 0x00, 0x90, // adrp x16, page(target)
    0x10, 0x02, 0x00, 0x91, // add x16, x16, lo12(target)
    0x00, 0x02, 0x1f, 0xd6, // br x16
    0x1f, 0x20, 0x03, 0xd5, // nop
];

const _ASSERTS: () = {
    assert!(PLT_ENTRY_TEMPLATE.len() as u64 == PLT_ENTRY_SIZE);
    assert!(THUNK_TEMPLATE.len() as u64 == AArch64::THUNK_SIZE);
};

const fn bits(
    kind: RelocationKind,
    start: u32,
    end: u32,
    insn: RelocationInstruction,
    check_bits: Option<u32>,
) -> RelocationKindInfo {
    RelocationKindInfo {
        kind,
        size: RelocationSize::BitMasking {
            range: BitRange { start, end },
            insn,
        },
        range: match check_bits {
            Some(n) => AllowedRange::from_bits(n),
            None => AllowedRange::no_check(),
        },
    }
}

impl Arch for AArch64 {
    type Relaxation = Relaxation;

    const KIND: Architecture = Architecture::AArch64;

    /// Direct branches encode a signed 26-bit word displacement.
    const MAX_BRANCH_DISPLACEMENT: Option<i64> = Some((1 << 27) - 4);

    const THUNK_SIZE: u64 = 16;

    fn elf_header_arch_magic() -> u16 {
        object::elf::EM_AARCH64
    }

    // The relocation table is documented in the aaelf64 psABI supplement:
    // https://github.com/ARM-software/abi-aa/blob/main/aaelf64/aaelf64.rst
    fn relocation_from_raw(r_type: u32) -> Result<RelocationKindInfo> {
        use RelocationInstruction as Insn;
        use RelocationKind as Kind;

        let info = match r_type {
            object::elf::R_AARCH64_NONE => RelocationKindInfo::bytes(Kind::None, 0),

            object::elf::R_AARCH64_ABS64 => RelocationKindInfo::bytes(Kind::Absolute, 8),
            object::elf::R_AARCH64_ABS32 => RelocationKindInfo::bytes(Kind::Absolute, 4),
            object::elf::R_AARCH64_ABS16 => RelocationKindInfo::bytes(Kind::Absolute, 2),
            object::elf::R_AARCH64_PREL64 => RelocationKindInfo::bytes(Kind::Relative, 8),
            object::elf::R_AARCH64_PREL32 => RelocationKindInfo::bytes(Kind::Relative, 4),
            object::elf::R_AARCH64_PREL16 => RelocationKindInfo::bytes(Kind::Relative, 2),

            object::elf::R_AARCH64_MOVW_UABS_G0 => {
                bits(Kind::Absolute, 0, 16, Insn::Movkz, Some(17))
            }
            object::elf::R_AARCH64_MOVW_UABS_G0_NC => {
                bits(Kind::Absolute, 0, 16, Insn::Movkz, None)
            }
            object::elf::R_AARCH64_MOVW_UABS_G1 => {
                bits(Kind::Absolute, 16, 32, Insn::Movkz, Some(33))
            }
            object::elf::R_AARCH64_MOVW_UABS_G1_NC => {
                bits(Kind::Absolute, 16, 32, Insn::Movkz, None)
            }
            object::elf::R_AARCH64_MOVW_UABS_G2 => {
                bits(Kind::Absolute, 32, 48, Insn::Movkz, Some(49))
            }
            object::elf::R_AARCH64_MOVW_UABS_G2_NC => {
                bits(Kind::Absolute, 32, 48, Insn::Movkz, None)
            }
            object::elf::R_AARCH64_MOVW_UABS_G3 => {
                bits(Kind::Absolute, 48, 64, Insn::Movkz, None)
            }
            object::elf::R_AARCH64_MOVW_SABS_G0 => {
                bits(Kind::Absolute, 0, 16, Insn::Movnz, Some(17))
            }
            object::elf::R_AARCH64_MOVW_SABS_G1 => {
                bits(Kind::Absolute, 16, 32, Insn::Movnz, Some(33))
            }
            object::elf::R_AARCH64_MOVW_SABS_G2 => {
                bits(Kind::Absolute, 32, 48, Insn::Movnz, Some(49))
            }

            object::elf::R_AARCH64_ADR_PREL_LO21 => {
                bits(Kind::Relative, 0, 21, Insn::Adr, Some(21))
            }
            object::elf::R_AARCH64_ADR_PREL_PG_HI21 => {
                bits(Kind::RelativePage, 12, 33, Insn::Adr, Some(33))
            }
            object::elf::R_AARCH64_ADD_ABS_LO12_NC => {
                bits(Kind::PageOffset, 0, 12, Insn::Add, None)
            }
            object::elf::R_AARCH64_LDST8_ABS_LO12_NC => {
                bits(Kind::PageOffset, 0, 12, Insn::LdSt, None)
            }
            object::elf::R_AARCH64_LDST16_ABS_LO12_NC => {
                bits(Kind::PageOffset, 1, 12, Insn::LdSt, None)
            }
            object::elf::R_AARCH64_LDST32_ABS_LO12_NC => {
                bits(Kind::PageOffset, 2, 12, Insn::LdSt, None)
            }
            object::elf::R_AARCH64_LDST64_ABS_LO12_NC => {
                bits(Kind::PageOffset, 3, 12, Insn::LdSt, None)
            }
            object::elf::R_AARCH64_LDST128_ABS_LO12_NC => {
                bits(Kind::PageOffset, 4, 12, Insn::LdSt, None)
            }

            object::elf::R_AARCH64_LD_PREL_LO19 => {
                bits(Kind::Relative, 2, 21, Insn::LdrLiteral, Some(21))
            }
            object::elf::R_AARCH64_CONDBR19 => {
                bits(Kind::Relative, 2, 21, Insn::Branch19, Some(21))
            }
            object::elf::R_AARCH64_TSTBR14 => {
                bits(Kind::Relative, 2, 16, Insn::Branch14, Some(16))
            }
            object::elf::R_AARCH64_CALL26 | object::elf::R_AARCH64_JUMP26 => {
                bits(Kind::PltRelative, 2, 28, Insn::Branch26, Some(28))
            }

            object::elf::R_AARCH64_ADR_GOT_PAGE => {
                bits(Kind::GotRelativePage, 12, 33, Insn::Adr, Some(33))
            }
            object::elf::R_AARCH64_LD64_GOT_LO12_NC => {
                bits(Kind::GotPageOffset, 3, 12, Insn::LdSt, None)
            }

            object::elf::R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 => {
                bits(Kind::GotTpOffPage, 12, 33, Insn::Adr, Some(33))
            }
            object::elf::R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC => {
                bits(Kind::GotTpOffPageOffset, 3, 12, Insn::LdSt, None)
            }

            object::elf::R_AARCH64_TLSLE_ADD_TPREL_HI12 => {
                bits(Kind::TpOff, 12, 24, Insn::Add, Some(24))
            }
            object::elf::R_AARCH64_TLSLE_ADD_TPREL_LO12
            | object::elf::R_AARCH64_TLSLE_ADD_TPREL_LO12_NC => {
                bits(Kind::TpOff, 0, 12, Insn::Add, None)
            }

            object::elf::R_AARCH64_TLSDESC_ADR_PAGE21 => {
                bits(Kind::TlsDescPage, 12, 33, Insn::Adr, Some(33))
            }
            object::elf::R_AARCH64_TLSDESC_LD64_LO12 => {
                bits(Kind::TlsDescPageOffset, 3, 12, Insn::LdSt, None)
            }
            object::elf::R_AARCH64_TLSDESC_ADD_LO12 => {
                bits(Kind::TlsDescPageOffset, 0, 12, Insn::Add, None)
            }
            object::elf::R_AARCH64_TLSDESC_CALL => RelocationKindInfo::bytes(Kind::TlsDescCall, 0),

            _ => {
                return Err(anyhow!(
                    "Unsupported relocation type {}",
                    Self::rel_type_to_string(r_type)
                ));
            }
        };
        Ok(info)
    }

    fn get_dynamic_relocation_type(relocation: DynamicRelocationKind) -> u32 {
        match relocation {
            DynamicRelocationKind::Copy => object::elf::R_AARCH64_COPY,
            DynamicRelocationKind::Irelative => object::elf::R_AARCH64_IRELATIVE,
            DynamicRelocationKind::DtpMod => object::elf::R_AARCH64_TLS_DTPMOD,
            DynamicRelocationKind::DtpOff => object::elf::R_AARCH64_TLS_DTPREL,
            DynamicRelocationKind::TpOff => object::elf::R_AARCH64_TLS_TPREL,
            DynamicRelocationKind::Relative => object::elf::R_AARCH64_RELATIVE,
            DynamicRelocationKind::DynamicSymbol => object::elf::R_AARCH64_GLOB_DAT,
            DynamicRelocationKind::JumpSlot => object::elf::R_AARCH64_JUMP_SLOT,
            DynamicRelocationKind::TlsDesc => object::elf::R_AARCH64_TLSDESC,
        }
    }

    fn rel_type_to_string(r_type: u32) -> Cow<'static, str> {
        if let Some(name) = const_name_by_value![
            r_type,
            R_AARCH64_NONE,
            R_AARCH64_ABS64,
            R_AARCH64_ABS32,
            R_AARCH64_ABS16,
            R_AARCH64_PREL64,
            R_AARCH64_PREL32,
            R_AARCH64_PREL16,
            R_AARCH64_MOVW_UABS_G0,
            R_AARCH64_MOVW_UABS_G0_NC,
            R_AARCH64_MOVW_UABS_G1,
            R_AARCH64_MOVW_UABS_G1_NC,
            R_AARCH64_MOVW_UABS_G2,
            R_AARCH64_MOVW_UABS_G2_NC,
            R_AARCH64_MOVW_UABS_G3,
            R_AARCH64_ADR_PREL_LO21,
            R_AARCH64_ADR_PREL_PG_HI21,
            R_AARCH64_ADD_ABS_LO12_NC,
            R_AARCH64_LDST8_ABS_LO12_NC,
            R_AARCH64_LDST16_ABS_LO12_NC,
            R_AARCH64_LDST32_ABS_LO12_NC,
            R_AARCH64_LDST64_ABS_LO12_NC,
            R_AARCH64_LDST128_ABS_LO12_NC,
            R_AARCH64_LD_PREL_LO19,
            R_AARCH64_CONDBR19,
            R_AARCH64_TSTBR14,
            R_AARCH64_CALL26,
            R_AARCH64_JUMP26,
            R_AARCH64_ADR_GOT_PAGE,
            R_AARCH64_LD64_GOT_LO12_NC,
            R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21,
            R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC,
            R_AARCH64_TLSLE_ADD_TPREL_HI12,
            R_AARCH64_TLSLE_ADD_TPREL_LO12,
            R_AARCH64_TLSLE_ADD_TPREL_LO12_NC,
            R_AARCH64_TLSDESC_ADR_PAGE21,
            R_AARCH64_TLSDESC_LD64_LO12,
            R_AARCH64_TLSDESC_ADD_LO12,
            R_AARCH64_TLSDESC_CALL,
            R_AARCH64_COPY,
            R_AARCH64_GLOB_DAT,
            R_AARCH64_JUMP_SLOT,
            R_AARCH64_RELATIVE,
            R_AARCH64_IRELATIVE
        ] {
            Cow::Borrowed(name)
        } else {
            Cow::Owned(format!("Unknown relocation type 0x{r_type:x}"))
        }
    }

    fn write_plt_entry(plt_entry: &mut [u8], got_address: u64, plt_address: u64) -> Result {
        plt_entry.copy_from_slice(PLT_ENTRY_TEMPLATE);
        write_adrp_add_pair(plt_entry, plt_address, got_address, true)
    }

    /// AArch64 uses TLS variant I: the thread pointer sits at the start of a
    /// 16-byte TCB that precedes the TLS block.
    fn tp_offset_start(tls: TlsLayout) -> u64 {
        tls.start.wrapping_sub(tls.alignment.align_up(16))
    }

    fn is_branch_relocation(r_type: u32) -> bool {
        matches!(
            r_type,
            object::elf::R_AARCH64_CALL26 | object::elf::R_AARCH64_JUMP26
        )
    }

    fn write_thunk(bytes: &mut [u8], thunk_address: u64, target_address: u64) -> Result {
        bytes.copy_from_slice(THUNK_TEMPLATE);
        write_adrp_add_pair(bytes, thunk_address, target_address, false)
    }
}

/// Patches the first two instructions of `bytes`: an `adrp` that computes the
/// page of `target` relative to `place`, followed by either an `ldr`
/// (`is_load`) or an `add` consuming the low 12 bits of `target`.
fn write_adrp_add_pair(bytes: &mut [u8], place: u64, target: u64, is_load: bool) -> Result {
    let page_delta = (page(target) as i64).wrapping_sub(page(place) as i64);
    if page_delta.unsigned_abs() >= 1 << 32 {
        bail!("adrp target is more than 4GiB away");
    }
    RelocationInstruction::Adr.write_to(bytes, ((page_delta as u64) >> 12) & 0x1f_ffff);
    let low = target & 0xfff;
    if is_load {
        RelocationInstruction::LdSt.write_to(&mut bytes[4..], low >> 3);
    } else {
        RelocationInstruction::Add.write_to(&mut bytes[4..], low);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelaxationKind {
    /// Leave the instruction alone, only change the relocation kind.
    NoOp,

    /// `ldr xN, [xM, :got_lo12:sym]` -> `add xN, xM, :lo12:sym`.
    GotLdrToAdd,

    /// Replace the instruction with `movz x0, #:tprel_g1:sym`.
    TlsToMovz,

    /// Replace the instruction with `movk x0, #:tprel_g0_nc:sym`.
    TlsToMovk,

    /// Replace the instruction with a nop.
    ReplaceWithNop,
}

#[derive(Debug, Clone)]
pub(crate) struct Relaxation {
    kind: RelaxationKind,
    rel_info: RelocationKindInfo,
}

impl Relaxation {
    fn create(kind: RelaxationKind, rel_info: RelocationKindInfo) -> Option<Relaxation> {
        Some(Relaxation { kind, rel_info })
    }
}

const TPREL_G1: RelocationKindInfo = bits(
    RelocationKind::TpOff,
    16,
    32,
    RelocationInstruction::Movkz,
    Some(33),
);

const TPREL_G0_NC: RelocationKindInfo = bits(
    RelocationKind::TpOff,
    0,
    16,
    RelocationInstruction::Movkz,
    None,
);

const NO_RELOC: RelocationKindInfo = RelocationKindInfo::bytes(RelocationKind::None, 0);

impl crate::arch::Relaxation for Relaxation {
    fn new(
        r_type: u32,
        _section_bytes: &[u8],
        _offset_in_section: u64,
        value_flags: ValueFlags,
        output_kind: OutputKind,
        section_flags: SectionFlags,
    ) -> Option<Self> {
        if !section_flags.contains(shf::EXECINSTR) {
            return None;
        }

        let can_bypass_got = value_flags.contains(ValueFlags::CAN_BYPASS_GOT)
            && !value_flags.contains(ValueFlags::DYNAMIC)
            && !value_flags.contains(ValueFlags::IFUNC);

        // TLS descriptor sequences are relaxed to local-exec when the offset
        // is known at link time. The descriptor ABI fixes the sequence to x0,
        // which is what the replacement movz/movk pair targets.
        let can_use_local_exec = can_bypass_got && output_kind.is_executable();

        match r_type {
            object::elf::R_AARCH64_ADR_GOT_PAGE if can_bypass_got => Self::create(
                RelaxationKind::NoOp,
                bits(
                    RelocationKind::RelativePage,
                    12,
                    33,
                    RelocationInstruction::Adr,
                    Some(33),
                ),
            ),
            object::elf::R_AARCH64_LD64_GOT_LO12_NC if can_bypass_got => Self::create(
                RelaxationKind::GotLdrToAdd,
                bits(
                    RelocationKind::PageOffset,
                    0,
                    12,
                    RelocationInstruction::Add,
                    None,
                ),
            ),
            object::elf::R_AARCH64_TLSDESC_ADR_PAGE21 if can_use_local_exec => {
                Self::create(RelaxationKind::TlsToMovz, TPREL_G1)
            }
            object::elf::R_AARCH64_TLSDESC_LD64_LO12 if can_use_local_exec => {
                Self::create(RelaxationKind::TlsToMovk, TPREL_G0_NC)
            }
            object::elf::R_AARCH64_TLSDESC_ADD_LO12 if can_use_local_exec => {
                Self::create(RelaxationKind::ReplaceWithNop, NO_RELOC)
            }
            object::elf::R_AARCH64_TLSDESC_CALL if can_use_local_exec => {
                Self::create(RelaxationKind::ReplaceWithNop, NO_RELOC)
            }
            object::elf::R_AARCH64_TLSIE_ADR_GOTTPREL_PAGE21 if can_use_local_exec => {
                Self::create(RelaxationKind::TlsToMovz, TPREL_G1)
            }
            object::elf::R_AARCH64_TLSIE_LD64_GOTTPREL_LO12_NC if can_use_local_exec => {
                Self::create(RelaxationKind::TlsToMovk, TPREL_G0_NC)
            }
            _ => None,
        }
    }

    fn apply(&self, section_bytes: &mut [u8], offset_in_section: &mut u64, _addend: &mut i64) {
        let offset = *offset_in_section as usize;
        let insn_bytes = &mut section_bytes[offset..offset + 4];
        match self.kind {
            RelaxationKind::NoOp => {}
            RelaxationKind::GotLdrToAdd => {
                let insn = u32::from_le_bytes(insn_bytes.try_into().unwrap());
                let rd = insn & 0x1f;
                let rn = (insn >> 5) & 0x1f;
                let add = 0x9100_0000 | (rn << 5) | rd;
                insn_bytes.copy_from_slice(&add.to_le_bytes());
            }
            RelaxationKind::TlsToMovz => {
                // movz x0, #0, lsl #16
                insn_bytes.copy_from_slice(&0xd2a0_0000u32.to_le_bytes());
            }
            RelaxationKind::TlsToMovk => {
                // movk x0, #0
                insn_bytes.copy_from_slice(&0xf280_0000u32.to_le_bytes());
            }
            RelaxationKind::ReplaceWithNop => {
                insn_bytes.copy_from_slice(&0xd503_201fu32.to_le_bytes());
            }
        }
    }

    fn rel_info(&self) -> RelocationKindInfo {
        self.rel_info
    }

    fn next_modifier(&self) -> RelocationModifier {
        RelocationModifier::Normal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Relaxation as _;
    use crate::args::RelocationModel;

    #[test]
    fn test_plt_entry_patching() {
        let mut entry = [0u8; 16];
        AArch64::write_plt_entry(&mut entry, 0x41f000 + 0x18, 0x401020).unwrap();
        let adrp = u32::from_le_bytes(entry[..4].try_into().unwrap());
        // adrp keeps its opcode bits
        assert_eq!(adrp & 0x9f00_001f, 0x9000_0010);
        let ldr = u32::from_le_bytes(entry[4..8].try_into().unwrap());
        // ldr offset field holds (got & 0xfff) / 8
        assert_eq!((ldr >> 10) & 0xfff, 0x18 / 8);
    }

    #[test]
    fn test_thunk_reaches_anywhere_nearby() {
        let mut thunk = [0u8; AArch64::THUNK_SIZE as usize];
        AArch64::write_thunk(&mut thunk, 0x1000_0000, 0x9000_0123).unwrap();
        let add = u32::from_le_bytes(thunk[4..8].try_into().unwrap());
        assert_eq!((add >> 10) & 0xfff, 0x123);
        let br = u32::from_le_bytes(thunk[8..12].try_into().unwrap());
        assert_eq!(br, 0xd61f_0200);
    }

    #[test]
    fn test_branch_range() {
        let max = AArch64::MAX_BRANCH_DISPLACEMENT.unwrap();
        assert_eq!(max, 128 * 1024 * 1024 - 4);
        assert!(AArch64::is_branch_relocation(object::elf::R_AARCH64_CALL26));
        assert!(!AArch64::is_branch_relocation(object::elf::R_AARCH64_ABS64));
    }

    #[test]
    fn test_got_load_relaxes_to_add() {
        let relaxation = Relaxation::new(
            object::elf::R_AARCH64_LD64_GOT_LO12_NC,
            &[],
            0,
            ValueFlags::CAN_BYPASS_GOT,
            OutputKind::StaticExecutable(RelocationModel::NonRelocatable),
            shf::EXECINSTR,
        )
        .unwrap();
        // ldr x17, [x16, #0]
        let mut bytes = 0xf940_0211u32.to_le_bytes().to_vec();
        let mut offset = 0;
        relaxation.apply(&mut bytes, &mut offset, &mut 0);
        let insn = u32::from_le_bytes(bytes[..4].try_into().unwrap());
        // add x17, x16, #0
        assert_eq!(insn, 0x9100_0211);
    }
}
