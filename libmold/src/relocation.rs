//! The target-independent relocation model. Each architecture maps its raw
//! `r_type` values into a `RelocationKindInfo`, which tells the generic code
//! what value to compute (the kind) and how to patch it into the output (the
//! size). Bit-masked sizes cover instruction-immediate patching on RISC
//! targets; plain byte sizes cover data relocations and x86-64.

use crate::bail;
use crate::error::Result;

/// Maps a raw constant back to its name, for relocation-type display.
#[macro_export]
macro_rules! const_name_by_value {
    ($needle: expr, $( $const:ident ),*) => {
        match $needle {
            $(object::elf::$const => Some(stringify!($const)),)*
            _ => None
        }
    };
}

/// What value the relocation expression produces. `S` is the symbol value,
/// `A` the addend, `P` the place, `GOT` the base of the global offset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocationKind {
    /// S + A
    Absolute,

    /// S + A - P
    Relative,

    /// S + A - GOT
    SymRelGotBase,

    /// The offset of the symbol's GOT entry, relative to the start of the GOT.
    GotRelGotBase,

    /// The address of the symbol's GOT entry, relative to the place.
    GotRelative,

    /// The page address of the symbol's GOT entry, relative to the page of
    /// the place (AArch64 `ADRP` forms).
    GotRelativePage,

    /// The low bits of the address of the symbol's GOT entry.
    GotPageOffset,

    /// The address of the symbol, in terms of the page it's on (AArch64).
    RelativePage,

    /// The low bits of the symbol's address within its page.
    PageOffset,

    /// The address of the symbol's PLT entry, relative to the place.
    PltRelative,

    /// The address of the symbol's PLT entry, relative to the GOT base.
    PltRelGotBase,

    /// The address of a TLSGD (module ID, offset) pair in the GOT, relative
    /// to the place.
    TlsGd,

    /// The address of the current module's TLS module ID in the GOT,
    /// relative to the place.
    TlsLd,

    /// The offset of a thread-local within its module's TLS block.
    DtpOff,

    /// The address of a GOT entry holding a TP-relative offset, relative to
    /// the place.
    GotTpOff,

    /// Page forms of `GotTpOff` (AArch64 initial-exec).
    GotTpOffPage,
    GotTpOffPageOffset,

    /// The offset of a thread-local within the static TLS block.
    TpOff,

    /// The address of a TLS descriptor structure, relative to the place.
    TlsDesc,

    /// Page forms of `TlsDesc` (AArch64).
    TlsDescPage,
    TlsDescPageOffset,

    /// Marker relocation on the call through a TLS descriptor.
    TlsDescCall,

    /// Nothing to apply. Produced when an optimisation eliminates a
    /// relocation.
    None,
}

/// An instruction whose immediate field receives relocated bits. The
/// encodings are AArch64; other RISC targets would add variants here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocationInstruction {
    /// ADR / ADRP: immlo in bits 29..31, immhi in bits 5..24.
    Adr,
    /// MOVK/MOVZ: 16-bit immediate at bits 5..21.
    Movkz,
    /// MOVN/MOVZ pair selected by the sign of the value.
    Movnz,
    /// Load/store unsigned offset, scaled: immediate at bits 10..22.
    LdSt,
    /// LDR (literal): 19-bit immediate at bits 5..24.
    LdrLiteral,
    /// ADD (immediate): 12-bit immediate at bits 10..22.
    Add,
    /// B / BL: 26-bit immediate at bits 0..26.
    Branch26,
    /// B.cond / CBZ: 19-bit immediate at bits 5..24.
    Branch19,
    /// TBZ / TBNZ: 14-bit immediate at bits 5..19.
    Branch14,
}

/// Half-open range of bits taken from the computed value before insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BitRange {
    pub(crate) start: u32,
    pub(crate) end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocationSize {
    /// Write the low `n` bytes of the value, little endian.
    ByteSize(usize),

    /// Extract `range` from the value and insert it into the immediate field
    /// of `insn`.
    BitMasking {
        range: BitRange,
        insn: RelocationInstruction,
    },
}

/// The range of computed values that the relocation can represent. Values
/// outside the range are a fatal overflow error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AllowedRange {
    pub(crate) min: i64,
    pub(crate) max: i64,
}

impl AllowedRange {
    pub(crate) const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub(crate) const fn no_check() -> Self {
        Self {
            min: i64::MIN,
            max: i64::MAX,
        }
    }

    pub(crate) const fn from_byte_size(byte_size: usize) -> Self {
        match byte_size {
            // An 8-byte relocation can hold any value.
            0 | 8 => Self::no_check(),
            // Sub-8-byte relocations may be either signed or unsigned, so we
            // accept either interpretation.
            _ => Self {
                min: -(1 << (byte_size * 8 - 1)),
                max: 1 << (byte_size * 8),
            },
        }
    }

    pub(crate) const fn from_bits(bits: u32) -> Self {
        Self {
            min: -(1 << (bits - 1)),
            max: 1 << bits,
        }
    }
}

pub(crate) const PAGE_BITS: u32 = 12;
pub(crate) const PAGE_SIZE: u64 = 1 << PAGE_BITS;

pub(crate) fn page(value: u64) -> u64 {
    value & !(PAGE_SIZE - 1)
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct RelocationKindInfo {
    pub(crate) kind: RelocationKind,
    pub(crate) size: RelocationSize,
    pub(crate) range: AllowedRange,
}

impl RelocationKindInfo {
    pub(crate) const fn bytes(kind: RelocationKind, byte_size: usize) -> Self {
        Self {
            kind,
            size: RelocationSize::ByteSize(byte_size),
            range: AllowedRange::from_byte_size(byte_size),
        }
    }
}

/// Relocations applied by the dynamic loader rather than by us. Each
/// architecture maps these to its own `r_type` space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DynamicRelocationKind {
    Copy,
    Irelative,
    DtpMod,
    DtpOff,
    TpOff,
    Relative,
    DynamicSymbol,
    JumpSlot,
    TlsDesc,
}

pub(crate) trait BitExtraction {
    /// Extracts a half-open range of bits.
    fn extract_bits(self, range: BitRange) -> u64;

    /// Sign-extends from the given sign bit.
    fn sign_extend(self, sign_bit: u32) -> u64;
}

impl BitExtraction for u64 {
    fn extract_bits(self, range: BitRange) -> u64 {
        debug_assert!(range.start < range.end && range.end <= 64);
        if range.end == 64 && range.start == 0 {
            return self;
        }
        (self >> range.start) & ((1 << (range.end - range.start)) - 1)
    }

    fn sign_extend(self, sign_bit: u32) -> u64 {
        if self & (1 << sign_bit) != 0 {
            self | !((2 << sign_bit) - 1)
        } else {
            self
        }
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[..4].try_into().unwrap())
}

fn write_u32(bytes: &mut [u8], value: u32) {
    bytes[..4].copy_from_slice(&value.to_le_bytes());
}

impl RelocationInstruction {
    /// Inserts `value` (already shifted and masked to the instruction's
    /// immediate width) into the instruction at the start of `bytes`.
    pub(crate) fn write_to(self, bytes: &mut [u8], value: u64) {
        let insn = read_u32(bytes);
        let patched = match self {
            RelocationInstruction::Adr => {
                let immlo = (value & 0x3) as u32;
                let immhi = ((value >> 2) & 0x7ffff) as u32;
                (insn & 0x9f00_001f) | (immlo << 29) | (immhi << 5)
            }
            RelocationInstruction::Movkz => {
                (insn & 0xffe0_001f) | (((value & 0xffff) as u32) << 5)
            }
            RelocationInstruction::Movnz => {
                // Select MOVZ for non-negative values, MOVN (with inverted
                // immediate) for negative ones.
                let value = value as i64;
                let (opcode_bit, imm) = if value >= 0 {
                    (1u32, value as u64)
                } else {
                    (0u32, !(value as u64))
                };
                (insn & 0xbfe0_001f) | (opcode_bit << 30) | ((imm & 0xffff) as u32) << 5
            }
            RelocationInstruction::LdSt | RelocationInstruction::Add => {
                (insn & 0xffc0_03ff) | (((value & 0xfff) as u32) << 10)
            }
            RelocationInstruction::LdrLiteral | RelocationInstruction::Branch19 => {
                (insn & 0xff00_001f) | (((value & 0x7ffff) as u32) << 5)
            }
            RelocationInstruction::Branch26 => (insn & 0xfc00_0000) | (value as u32 & 0x3ff_ffff),
            RelocationInstruction::Branch14 => {
                (insn & 0xfff8_001f) | (((value & 0x3fff) as u32) << 5)
            }
        };
        write_u32(bytes, patched);
    }
}

/// Applies a computed relocation value at `offset` within `section_bytes`,
/// checking the allowed range first. `place_context` is used only for error
/// messages.
pub(crate) fn write_relocation_value(
    value: i64,
    info: &RelocationKindInfo,
    section_bytes: &mut [u8],
    offset: usize,
) -> Result {
    if value < info.range.min || value >= info.range.max {
        bail!(
            "Relocation value 0x{value:x} out of range [{:#x}, {:#x})",
            info.range.min,
            info.range.max
        );
    }
    match info.size {
        RelocationSize::ByteSize(n) => {
            let end = offset + n;
            if end > section_bytes.len() {
                bail!("Relocation output range 0x{offset:x}..0x{end:x} is out of bounds");
            }
            section_bytes[offset..end].copy_from_slice(&value.to_le_bytes()[..n]);
        }
        RelocationSize::BitMasking { range, insn } => {
            if offset + 4 > section_bytes.len() {
                bail!("Relocation output offset 0x{offset:x} is out of bounds");
            }
            let bits = (value as u64).extract_bits(range);
            insn.write_to(&mut section_bytes[offset..], bits);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bits() {
        assert_eq!(
            0b1100_0000u64.extract_bits(BitRange { start: 3, end: 8 }),
            0b11000
        );
        assert_eq!(u64::MAX.extract_bits(BitRange { start: 0, end: 32 }), u32::MAX as u64);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(0u64.sign_extend(5), 0);
        assert_eq!(32u64.sign_extend(5) as i64, -32);
        assert_eq!(63u64.sign_extend(5) as i64, -1);
    }

    #[test]
    fn test_byte_size_write() {
        let info = RelocationKindInfo::bytes(RelocationKind::Absolute, 4);
        let mut bytes = [0u8; 8];
        write_relocation_value(0x1234_5678, &info, &mut bytes, 2).unwrap();
        assert_eq!(bytes, [0, 0, 0x78, 0x56, 0x34, 0x12, 0, 0]);
    }

    #[test]
    fn test_range_overflow() {
        let info = RelocationKindInfo::bytes(RelocationKind::Relative, 4);
        let mut bytes = [0u8; 4];
        assert!(write_relocation_value(1 << 33, &info, &mut bytes, 0).is_err());
        assert!(write_relocation_value(-(1i64 << 33), &info, &mut bytes, 0).is_err());
    }

    #[test]
    fn test_branch26_patch() {
        // bl 0 == 0x94000000
        let mut bytes = 0x9400_0000u32.to_le_bytes();
        let displacement: i64 = 0x1000;
        let bits = (displacement as u64).extract_bits(BitRange { start: 2, end: 28 });
        RelocationInstruction::Branch26.write_to(&mut bytes, bits);
        assert_eq!(u32::from_le_bytes(bytes), 0x9400_0400);
    }

    #[test]
    fn test_adr_patch() {
        // adrp x16, 0 == 0x90000010
        let mut bytes = 0x9000_0010u32.to_le_bytes();
        let pages: u64 = 3;
        RelocationInstruction::Adr.write_to(&mut bytes, pages);
        let insn = u32::from_le_bytes(bytes);
        // immlo == 3 & 3, immhi == 0
        assert_eq!(insn, 0x9000_0010 | (3 << 29));
    }
}
