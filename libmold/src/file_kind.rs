//! Identifies what sort of file we're dealing with based on the bytes of the
//! file. Classification is by magic bytes, never by file extension.

use crate::bail;
use crate::error::Result;
use object::LittleEndian;
use object::read::elf::FileHeader as _;
use object::read::elf::SectionHeader as _;

pub(crate) type FileHeader = object::elf::FileHeader64<LittleEndian>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    ElfObject,
    ElfDynamic,
    Archive,
    ThinArchive,
    Text,
    LlvmIr,
    GccIr,
}

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(&object::archive::MAGIC) {
            Ok(FileKind::Archive)
        } else if bytes.starts_with(&object::archive::THIN_MAGIC) {
            Ok(FileKind::ThinArchive)
        } else if bytes.starts_with(&object::elf::ELFMAG) {
            const HEADER_LEN: usize = size_of::<FileHeader>();
            if bytes.len() < HEADER_LEN {
                bail!("Invalid ELF file");
            }
            let header: &FileHeader = object::from_bytes(&bytes[..HEADER_LEN]).unwrap().0;
            if header.e_ident.class != object::elf::ELFCLASS64 {
                bail!("Only 64 bit ELF is currently supported");
            }
            if header.e_ident.data != object::elf::ELFDATA2LSB {
                bail!("Only little endian is currently supported");
            }
            match header.e_type.get(LittleEndian) {
                object::elf::ET_REL => {
                    if contains_gcc_lto_sections(bytes, header) {
                        Ok(FileKind::GccIr)
                    } else {
                        Ok(FileKind::ElfObject)
                    }
                }
                object::elf::ET_DYN => Ok(FileKind::ElfDynamic),
                t => bail!("Unsupported ELF kind {t}"),
            }
        } else if bytes.starts_with(b"BC\xc0\xde") {
            Ok(FileKind::LlvmIr)
        } else if bytes.is_ascii() {
            Ok(FileKind::Text)
        } else {
            bail!("Couldn't identify file type");
        }
    }

    pub(crate) fn is_compiler_ir(self) -> bool {
        matches!(self, FileKind::LlvmIr | FileKind::GccIr)
    }
}

/// Returns whether the object carries GCC LTO sections. We scan the section
/// header string table for `.gnu.lto_` rather than walking every section
/// header. GCC unfortunately doesn't tag IR objects in any fast-to-check way.
fn contains_gcc_lto_sections(data: &[u8], header: &FileHeader) -> bool {
    fn strings<'a>(data: &'a [u8], header: &FileHeader) -> Option<&'a [u8]> {
        let e = LittleEndian;
        let section_headers = header.section_headers(e, data).ok()?;
        let sh_str_index = header.shstrndx(e, data).ok()?;
        let strings_header = section_headers.get(sh_str_index as usize)?;
        let start = strings_header.sh_offset(e) as usize;
        let len = strings_header.sh_size(e) as usize;
        data.get(start..start + len)
    }
    strings(data, header)
        .is_some_and(|strings| memchr::memmem::find(strings, b"\0.gnu.lto_").is_some())
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileKind::ElfObject => "ELF object",
            FileKind::ElfDynamic => "ELF shared object",
            FileKind::Archive => "archive",
            FileKind::ThinArchive => "thin archive",
            FileKind::Text => "text",
            FileKind::LlvmIr => "LLVM IR",
            FileKind::GccIr => "GCC IR",
        };
        std::fmt::Display::fmt(s, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_archive() {
        assert_eq!(
            FileKind::identify_bytes(b"!<arch>\x0a").unwrap(),
            FileKind::Archive
        );
        assert_eq!(
            FileKind::identify_bytes(b"!<thin>\x0a").unwrap(),
            FileKind::ThinArchive
        );
    }

    #[test]
    fn test_identify_text() {
        assert_eq!(
            FileKind::identify_bytes(b"GROUP ( libfoo.so.1 )").unwrap(),
            FileKind::Text
        );
    }

    #[test]
    fn test_identify_garbage() {
        assert!(FileKind::identify_bytes(&[0xff, 0xfe, 0x01]).is_err());
    }

    #[test]
    fn test_truncated_elf() {
        assert!(FileKind::identify_bytes(&object::elf::ELFMAG).is_err());
    }
}
