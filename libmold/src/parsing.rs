//! Parallel parsing of input files and construction of the prelude, the
//! internal "file" that defines linker-generated symbols.

use crate::args::Args;
use crate::args::Modifiers;
use crate::bail;
use crate::elf::File;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::InputBytes;
use crate::input_data::InputData;
use crate::input_data::InputRef;
use crate::linker_script::Expression;
use crate::output_section_id;
use crate::output_section_id::OutputSectionId;
use rayon::iter::IntoParallelRefIterator as _;
use rayon::iter::ParallelIterator as _;

#[derive(Debug)]
pub(crate) struct ParsedInputObject<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) object: File<'data>,
    pub(crate) modifiers: Modifiers,
    pub(crate) is_dynamic: bool,

    /// True for an archive member that's only loaded if it resolves an
    /// undefined symbol.
    pub(crate) is_optional: bool,

    /// The DT_SONAME for shared objects, falling back to the file name.
    pub(crate) lib_name: &'data [u8],
}

impl<'data> ParsedInputObject<'data> {
    fn new(input: &'data InputBytes<'data>, args: &Args) -> Result<Box<Self>> {
        let is_dynamic = input.kind == FileKind::ElfDynamic;
        let object = File::parse(input.data, is_dynamic)
            .with_context(|| format!("Failed to parse object file `{}`", input.input))?;

        if object.arch != args.arch {
            bail!(
                "`{}` has incompatible architecture: {}, expecting {}",
                input.input,
                object.arch,
                args.arch,
            );
        }

        let lib_name = if is_dynamic {
            object.soname()?.unwrap_or_else(|| input.input.lib_name())
        } else {
            &[]
        };

        Ok(Box::new(Self {
            input: input.input.clone(),
            object,
            modifiers: input.modifiers,
            is_dynamic,
            is_optional: input.is_archive_member,
            lib_name,
        }))
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.object.symbols.len()
    }
}

impl std::fmt::Display for ParsedInputObject<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.input, f)
    }
}

#[tracing::instrument(skip_all, name = "Parse input files")]
pub(crate) fn parse_input_files<'data>(
    input_data: &'data InputData<'data>,
    args: &Args,
) -> Result<Vec<Box<ParsedInputObject<'data>>>> {
    input_data
        .files
        .par_iter()
        .map(|bytes| ParsedInputObject::new(bytes, args))
        .collect()
}

/// How the value of a linker-defined symbol is computed.
#[derive(Debug, Clone)]
pub(crate) enum SymbolPlacement<'data> {
    /// Symbol 0, the undefined symbol.
    Undefined,

    /// Points at the start of an output section.
    SectionStart(OutputSectionId),

    /// Points one byte past the last byte of an output section.
    SectionEnd(OutputSectionId),

    /// An undefined symbol requested with `--undefined` or
    /// `--require-defined`. Forces archive extraction.
    ForceUndefined,

    /// `--defsym` with an absolute address.
    Absolute(u64),

    /// `--defsym` naming another symbol, plus an offset.
    Alias(&'data str, i64),

    /// A `PROVIDE(...)` from a linker script, evaluated once addresses are
    /// known.
    Provide(Expression<'data>),

    /// Points at the start of the first loadable segment.
    LoadBaseAddress,
}

#[derive(Debug, Clone)]
pub(crate) struct InternalSymDefInfo<'data> {
    pub(crate) placement: SymbolPlacement<'data>,
    pub(crate) name: &'data [u8],

    /// Weak linker-defined symbols lose to any regular definition.
    pub(crate) is_weak: bool,
}

impl<'data> InternalSymDefInfo<'data> {
    fn strong(placement: SymbolPlacement<'data>, name: &'data [u8]) -> Self {
        Self {
            placement,
            name,
            is_weak: false,
        }
    }

    fn weak(placement: SymbolPlacement<'data>, name: &'data [u8]) -> Self {
        Self {
            placement,
            name,
            is_weak: true,
        }
    }
}

/// The prelude defines the symbols that don't come from any input file.
#[derive(Debug)]
pub(crate) struct Prelude<'data> {
    pub(crate) symbol_definitions: Vec<InternalSymDefInfo<'data>>,
}

impl<'data> Prelude<'data> {
    pub(crate) fn new(args: &'data Args, input_data: &InputData<'data>) -> Self {
        use SymbolPlacement as P;

        // The undefined symbol must always be symbol 0.
        let mut defs = vec![InternalSymDefInfo::strong(P::Undefined, &[])];

        defs.push(InternalSymDefInfo::strong(
            P::LoadBaseAddress,
            b"__executable_start",
        ));
        defs.push(InternalSymDefInfo::strong(
            P::SectionStart(output_section_id::FILE_HEADER),
            b"__ehdr_start",
        ));
        defs.push(InternalSymDefInfo::strong(
            P::SectionStart(output_section_id::GOT),
            b"_GLOBAL_OFFSET_TABLE_",
        ));
        defs.push(InternalSymDefInfo::strong(
            P::SectionStart(output_section_id::DYNAMIC),
            b"_DYNAMIC",
        ));
        for (section_id, start, end) in [
            (
                output_section_id::INIT_ARRAY,
                b"__init_array_start".as_slice(),
                b"__init_array_end".as_slice(),
            ),
            (
                output_section_id::FINI_ARRAY,
                b"__fini_array_start".as_slice(),
                b"__fini_array_end".as_slice(),
            ),
            (
                output_section_id::PREINIT_ARRAY,
                b"__preinit_array_start".as_slice(),
                b"__preinit_array_end".as_slice(),
            ),
            (
                output_section_id::RELA_PLT,
                b"__rela_iplt_start".as_slice(),
                b"__rela_iplt_end".as_slice(),
            ),
        ] {
            defs.push(InternalSymDefInfo::strong(P::SectionStart(section_id), start));
            defs.push(InternalSymDefInfo::strong(P::SectionEnd(section_id), end));
        }
        defs.push(InternalSymDefInfo::weak(
            P::SectionStart(output_section_id::BSS),
            b"__bss_start",
        ));
        defs.push(InternalSymDefInfo::weak(
            P::SectionEnd(output_section_id::TEXT),
            b"_etext",
        ));
        defs.push(InternalSymDefInfo::weak(
            P::SectionEnd(output_section_id::DATA),
            b"_edata",
        ));
        defs.push(InternalSymDefInfo::weak(
            P::SectionEnd(output_section_id::BSS),
            b"_end",
        ));

        // _TLS_MODULE_BASE_ is the reference point for TLSDESC.
        defs.push(InternalSymDefInfo::weak(
            if args.shared {
                P::SectionStart(output_section_id::TDATA)
            } else {
                P::SectionEnd(output_section_id::TBSS)
            },
            b"_TLS_MODULE_BASE_",
        ));

        defs.extend(
            args.undefined
                .iter()
                .map(|name| InternalSymDefInfo::strong(P::ForceUndefined, name.as_bytes())),
        );

        // The entry symbol behaves like an undefined reference so that it
        // can pull in an archive member.
        if !args.shared && !args.relocatable {
            let entry = input_data
                .linker_scripts
                .iter()
                .find_map(|script| script.script.entry())
                .map(str::as_bytes)
                .unwrap_or_else(|| args.entry_symbol_name().as_bytes());
            defs.push(InternalSymDefInfo::strong(P::ForceUndefined, entry));
        }

        defs.extend(args.defsym.iter().map(|(name, expression)| {
            let placement = match parse_defsym_expression(expression) {
                DefsymValue::Absolute(value) => P::Absolute(value),
                DefsymValue::Alias(symbol, offset) => P::Alias(symbol, offset),
            };
            InternalSymDefInfo::strong(placement, name.as_bytes())
        }));

        for script in &input_data.linker_scripts {
            for (name, expression) in script.script.provides() {
                defs.push(InternalSymDefInfo::weak(
                    P::Provide(expression.clone()),
                    name.as_bytes(),
                ));
            }
        }

        Prelude {
            symbol_definitions: defs,
        }
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.symbol_definitions.len()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DefsymValue<'a> {
    Absolute(u64),
    Alias(&'a str, i64),
}

/// Parses a defsym-style expression: "0x1000", "symbol" or "symbol+0x40".
pub(crate) fn parse_defsym_expression(s: &str) -> DefsymValue<'_> {
    if let Ok(value) = crate::args::parse_number(s) {
        return DefsymValue::Absolute(value);
    }
    for (i, b) in s.bytes().enumerate().skip(1) {
        if b == b'+' || b == b'-' {
            let symbol = s[..i].trim();
            let sign = if b == b'+' { 1 } else { -1 };
            if let Ok(offset) = crate::args::parse_number(s[i + 1..].trim()) {
                return DefsymValue::Alias(symbol, sign * offset as i64);
            }
        }
    }
    DefsymValue::Alias(s.trim(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defsym() {
        assert_eq!(parse_defsym_expression("0x1000"), DefsymValue::Absolute(0x1000));
        assert_eq!(parse_defsym_expression("other"), DefsymValue::Alias("other", 0));
        assert_eq!(
            parse_defsym_expression("base+0x40"),
            DefsymValue::Alias("base", 0x40)
        );
        assert_eq!(
            parse_defsym_expression("base-8"),
            DefsymValue::Alias("base", -8)
        );
    }
}
