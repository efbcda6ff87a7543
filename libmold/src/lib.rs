//! The mold linker library. The binary in the `mold` crate is a thin
//! wrapper around `Linker`; everything interesting happens here, as the
//! ordered sequence of passes in `link`.

pub(crate) use anyhow::bail;
pub(crate) use anyhow::ensure;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

pub(crate) mod aarch64;
pub(crate) mod alignment;
pub(crate) mod arch;
pub(crate) mod archive;
pub mod args;
pub(crate) mod diagnostics;
pub(crate) mod elf;
pub(crate) mod elf_writer;
pub mod error;
pub(crate) mod file_kind;
pub(crate) mod file_writer;
pub(crate) mod fs;
pub(crate) mod gc;
pub(crate) mod hash;
pub(crate) mod icf;
pub(crate) mod input_data;
pub(crate) mod layout;
pub(crate) mod linker_script;
pub(crate) mod map_file;
pub(crate) mod output_section_id;
pub(crate) mod parsing;
pub(crate) mod program_segments;
pub(crate) mod relocation;
pub(crate) mod resolution;
pub(crate) mod string_merging;
pub(crate) mod symbol;
pub(crate) mod symbol_db;
pub(crate) mod value_flags;
pub(crate) mod version_script;
pub(crate) mod x86_64;

use crate::arch::Arch;
use crate::arch::Architecture;
use crate::args::Action;
use crate::args::Args;
use crate::diagnostics::Diagnostics;
use crate::error::Result;

pub struct Linker {
    action: Action,
}

impl Linker {
    pub fn from_args<S: AsRef<str>, I: Iterator<Item = S>>(args: I) -> Result<Self> {
        Ok(Linker {
            action: args::parse(args)?,
        })
    }

    pub fn run(&self) -> Result {
        match &self.action {
            Action::Link(args) => {
                let _ = tracing_subscriber::registry()
                    .with(fmt::layer())
                    .with(EnvFilter::from_default_env())
                    .try_init();
                match args.arch {
                    Architecture::X86_64 => link::<x86_64::X86_64>(args),
                    Architecture::AArch64 => link::<aarch64::AArch64>(args),
                }
            }
            Action::Version => {
                println!("mold {} (compatible with GNU ld)", args::VERSION);
                Ok(())
            }
        }
    }
}

#[tracing::instrument(skip_all, name = "Link")]
fn link<A: Arch>(args: &Args) -> Result {
    args.setup_thread_pool()?;

    let inputs_arena = colosseum::sync::Arena::new();
    let input_data = input_data::InputData::from_args(args, &inputs_arena)?;
    let output_kind = args.output_kind(input_data.has_dynamic);

    let objects = parsing::parse_input_files(&input_data, args)?;
    let prelude = parsing::Prelude::new(args, &input_data);
    let script_entry = input_data
        .linker_scripts
        .iter()
        .find_map(|script| script.script.entry());

    let mut symbol_db = symbol_db::SymbolDb::build(
        prelude,
        objects,
        input_data.version_script_data,
        input_data.dynamic_list_data,
        script_entry,
        output_kind,
        args,
    )?;

    let diagnostics = Diagnostics::new();
    let mut output_sections = output_section_id::OutputSections::new();
    let mut resolution = resolution::resolve_symbols_and_sections(
        &mut symbol_db,
        &input_data.linker_scripts,
        &mut output_sections,
        &diagnostics,
    )?;

    if args.gc_sections {
        gc::mark_live_sections(&symbol_db, &resolution, &input_data.linker_scripts);
    }

    icf::fold_identical_sections::<A>(&symbol_db, &mut resolution);

    let merged_strings = string_merging::merge_strings(&resolution)?;

    let layout = layout::compute::<A>(
        symbol_db,
        resolution,
        merged_strings,
        output_sections,
        &input_data.linker_scripts,
        &diagnostics,
    )?;

    // Resolution-stage errors (undefined references, duplicate symbols) are
    // fatal before we touch the output file.
    if diagnostics.has_errors() {
        if let Some(report) = diagnostics.finish(args.fatal_warnings) {
            bail!("{report}");
        }
    }

    // A script OUTPUT(name) names the output unless -o was given.
    let output_path: &std::path::Path =
        if args.output.as_ref() == std::path::Path::new("a.out") {
            input_data
                .linker_scripts
                .iter()
                .find_map(|script| script.script.output())
                .map(std::path::Path::new)
                .unwrap_or(args.output.as_ref())
        } else {
            args.output.as_ref()
        };
    elf_writer::write::<A>(&layout, output_path, &diagnostics)?;

    if args.print_map {
        map_file::print_map(&layout);
    }

    // Relocation errors (range overflows and similar) accumulate during
    // writing and are reported together, in deterministic order.
    if let Some(report) = diagnostics.finish(args.fatal_warnings) {
        bail!("{report}");
    }

    Ok(())
}
