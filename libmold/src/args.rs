//! A handwritten parser for our arguments.
//!
//! We don't use a CLI framework because we need to parse arguments the same
//! way as the other linkers on the platform. Long arguments must be accepted
//! with a single '-' in addition to the more common double-dash. Flags like
//! `--push-state` manipulate a state stack and positional arguments (input
//! files) capture the state that's current when they appear.

use crate::alignment::Alignment;
use crate::arch::Architecture;
use crate::bail;
use crate::ensure;
use crate::error::Context as _;
use crate::error::Result;
use itertools::Itertools as _;
use rayon::ThreadPoolBuilder;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug)]
pub enum Action {
    Link(Box<Args>),
    Version,
}

#[derive(Debug)]
pub struct Args {
    pub(crate) arch: Architecture,
    pub(crate) inputs: Vec<Input>,
    pub(crate) lib_search_path: Vec<Box<Path>>,
    pub(crate) output: Arc<Path>,
    pub(crate) dynamic_linker: Option<Box<Path>>,
    pub(crate) sysroot: Option<Box<Path>>,
    pub num_threads: Option<NonZeroUsize>,

    pub(crate) entry: Option<String>,
    pub(crate) soname: Option<String>,
    pub(crate) rpaths: Vec<String>,
    pub(crate) version_script_path: Option<PathBuf>,
    pub(crate) dynamic_list_path: Option<PathBuf>,
    pub(crate) linker_script_paths: Vec<PathBuf>,
    pub(crate) wrap: Vec<String>,
    pub(crate) defsym: Vec<(String, String)>,
    pub(crate) undefined: Vec<String>,

    pub(crate) shared: bool,
    pub(crate) relocatable: bool,
    pie: Option<bool>,
    is_static: bool,

    pub(crate) gc_sections: bool,
    pub(crate) print_gc_sections: bool,
    pub(crate) icf: IcfMode,
    pub(crate) merge_sections: bool,
    pub(crate) build_id: BuildIdOption,
    pub(crate) compress_debug_sections: CompressionStyle,
    pub(crate) hash_style: HashStyle,
    pub(crate) should_write_eh_frame_hdr: bool,
    pub(crate) relro: bool,
    pub(crate) execstack: bool,
    pub(crate) z_now: bool,
    pub(crate) z_nodelete: bool,
    pub(crate) z_origin: bool,
    pub(crate) z_text: bool,
    pub(crate) no_undefined: bool,
    pub(crate) allow_multiple_definitions: bool,
    pub(crate) unresolved_symbols: UnresolvedSymbols,
    pub(crate) fatal_warnings: bool,
    pub(crate) export_all_dynamic_symbols: bool,
    pub(crate) exclude_libs_all: bool,
    pub(crate) strip: Strip,
    pub(crate) print_map: bool,
    pub(crate) max_page_size: Alignment,

    /// Produce byte-identical output for identical inputs, e.g. no real
    /// timestamps or random UUIDs.
    pub(crate) deterministic: bool,

}

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub struct Modifiers {
    /// Whether shared objects should only get a DT_NEEDED if referenced.
    pub(crate) as_needed: bool,

    /// Whether we're currently allowed to link against shared libraries.
    pub(crate) allow_shared: bool,

    /// Whether archive members should be loaded whether or not they're
    /// referenced.
    pub(crate) whole_archive: bool,
}

impl Default for Modifiers {
    fn default() -> Self {
        Self {
            as_needed: false,
            allow_shared: true,
            whole_archive: false,
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) struct Input {
    pub(crate) spec: InputSpec,

    /// A directory to search first. Set for inputs that came from a linker
    /// script, to the directory containing the script.
    pub(crate) search_first: Option<PathBuf>,

    pub(crate) modifiers: Modifiers,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum InputSpec {
    /// A path (possibly just a filename) of the file.
    File(Box<Path>),

    /// Name of a library, without the `lib` prefix or extension.
    Lib(Box<str>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelocationModel {
    NonRelocatable,
    Relocatable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputKind {
    StaticExecutable(RelocationModel),
    DynamicExecutable(RelocationModel),
    SharedObject,
    Relocatable,
}

impl OutputKind {
    pub(crate) fn is_executable(self) -> bool {
        matches!(
            self,
            OutputKind::StaticExecutable(_) | OutputKind::DynamicExecutable(_)
        )
    }

    pub(crate) fn is_static_executable(self) -> bool {
        matches!(self, OutputKind::StaticExecutable(_))
    }

    pub(crate) fn is_shared_object(self) -> bool {
        self == OutputKind::SharedObject
    }

    pub(crate) fn is_relocatable_object(self) -> bool {
        self == OutputKind::Relocatable
    }

    /// Whether the output can be loaded at an arbitrary address.
    pub(crate) fn is_position_independent(self) -> bool {
        match self {
            OutputKind::StaticExecutable(model) | OutputKind::DynamicExecutable(model) => {
                model == RelocationModel::Relocatable
            }
            OutputKind::SharedObject => true,
            OutputKind::Relocatable => false,
        }
    }

    /// Whether the output needs a dynamic section, dynamic symbol table etc.
    pub(crate) fn needs_dynamic(self) -> bool {
        match self {
            OutputKind::StaticExecutable(model) => model == RelocationModel::Relocatable,
            OutputKind::DynamicExecutable(_) | OutputKind::SharedObject => true,
            OutputKind::Relocatable => false,
        }
    }

    pub(crate) fn base_address(self) -> u64 {
        if self.is_position_independent() {
            0
        } else {
            crate::elf::NON_PIE_START_MEM_ADDRESS
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IcfMode {
    None,
    Safe,
    All,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum BuildIdOption {
    None,
    Fast,
    Hex(Vec<u8>),
    Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompressionStyle {
    None,
    Zlib,
    Zstd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HashStyle {
    Sysv,
    Gnu,
    Both,
}

impl HashStyle {
    pub(crate) fn includes_gnu(self) -> bool {
        matches!(self, HashStyle::Gnu | HashStyle::Both)
    }

    pub(crate) fn includes_sysv(self) -> bool {
        matches!(self, HashStyle::Sysv | HashStyle::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Strip {
    Nothing,
    Debug,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnresolvedSymbols {
    ReportAll,
    IgnoreInSharedLibs,
    IgnoreInObjectFiles,
    IgnoreAll,
}

/// Flags that don't change our behaviour and that we don't warn about.
/// Groups don't affect us because our archive member selection already runs
/// to a global fixpoint across all archives.
const SILENTLY_IGNORED_FLAGS: &[&str] = &[
    "start-group",
    "end-group",
    "nostdlib",
    "no-undefined-version",
    "color-diagnostics",
    "sort-common",
    "stats",
    "gdb-index",
    "disable-new-dtags",
    "enable-new-dtags",
    "discard-all",
    "discard-locals",
    "no-copy-dt-needed-entries",
    "no-add-needed",
    "no-call-graph-profile-sort",
];

const SILENTLY_IGNORED_SHORT_FLAGS: &[&str] = &["(", ")", "X", "x", "EL"];

fn default_target_arch() -> Architecture {
    if cfg!(target_arch = "aarch64") {
        Architecture::AArch64
    } else {
        Architecture::X86_64
    }
}

impl Default for Args {
    fn default() -> Self {
        Args {
            arch: default_target_arch(),
            inputs: Vec::new(),
            lib_search_path: Vec::new(),
            output: Arc::from(Path::new("a.out")),
            dynamic_linker: None,
            sysroot: None,
            num_threads: None,
            entry: None,
            soname: None,
            rpaths: Vec::new(),
            version_script_path: None,
            dynamic_list_path: None,
            linker_script_paths: Vec::new(),
            wrap: Vec::new(),
            defsym: Vec::new(),
            undefined: Vec::new(),
            shared: false,
            relocatable: false,
            pie: None,
            is_static: false,
            gc_sections: false,
            print_gc_sections: false,
            icf: IcfMode::None,
            merge_sections: true,
            build_id: BuildIdOption::None,
            compress_debug_sections: CompressionStyle::None,
            hash_style: HashStyle::Both,
            should_write_eh_frame_hdr: false,
            relro: true,
            execstack: false,
            z_now: false,
            z_nodelete: false,
            z_origin: false,
            z_text: false,
            no_undefined: false,
            allow_multiple_definitions: false,
            unresolved_symbols: UnresolvedSymbols::ReportAll,
            fatal_warnings: false,
            export_all_dynamic_symbols: false,
            exclude_libs_all: false,
            strip: Strip::Nothing,
            print_map: false,
            max_page_size: Alignment { exponent: 12 },
            deterministic: false,
        }
    }
}

impl Args {
    /// The kind of output we're producing. `has_dynamic` is whether any
    /// shared object made it into the link, which isn't known until inputs
    /// have been opened.
    pub(crate) fn output_kind(&self, has_dynamic: bool) -> OutputKind {
        if self.relocatable {
            return OutputKind::Relocatable;
        }
        if self.shared {
            return OutputKind::SharedObject;
        }
        let model = if self.pie.unwrap_or(false) {
            RelocationModel::Relocatable
        } else {
            RelocationModel::NonRelocatable
        };
        if self.is_static || !has_dynamic {
            OutputKind::StaticExecutable(model)
        } else {
            OutputKind::DynamicExecutable(model)
        }
    }

    pub(crate) fn available_threads(&self) -> NonZeroUsize {
        self.num_threads
            .or_else(|| std::thread::available_parallelism().ok())
            .unwrap_or(NonZeroUsize::new(1).unwrap())
    }

    pub fn setup_thread_pool(&self) -> Result {
        // Ignore the error from building a second pool in the same process;
        // tests link repeatedly.
        let _ = ThreadPoolBuilder::new()
            .num_threads(self.available_threads().get())
            .build_global();
        Ok(())
    }

    pub(crate) fn entry_symbol_name(&self) -> &str {
        self.entry.as_deref().unwrap_or("_start")
    }
}

/// The value of the option currently being parsed: either attached with
/// `=`, or the next argument.
struct ValueSource<'iter, S, I> {
    inline: Option<String>,
    iter: &'iter mut I,
    _marker: std::marker::PhantomData<S>,
}

impl<S: AsRef<str>, I: Iterator<Item = S>> ValueSource<'_, S, I> {
    fn take(&mut self, option_name: &str) -> Result<String> {
        if let Some(value) = self.inline.take() {
            Ok(value)
        } else {
            self.iter
                .next()
                .map(|v| v.as_ref().to_owned())
                .with_context(|| format!("Missing value for argument `{option_name}`"))
        }
    }

    /// For options like `--build-id[=value]` where a following argument is
    /// never consumed.
    fn take_inline(&mut self) -> Option<String> {
        self.inline.take()
    }
}

// Parses the supplied input arguments, which should not include the program
// name.
pub(crate) fn parse<S: AsRef<str>, I: Iterator<Item = S>>(input: I) -> Result<Action> {
    let mut args = Args::default();
    let mut input_iter = input.fuse();
    let mut modifiers = Modifiers::default();
    let mut modifier_stack: Vec<Modifiers> = Vec::new();
    let mut should_print_version = false;

    if std::env::var("SOURCE_DATE_EPOCH").is_ok() {
        args.deterministic = true;
    }

    while let Some(arg) = input_iter.next() {
        let arg = arg.as_ref();

        fn strip_option(arg: &str) -> Option<&str> {
            arg.strip_prefix("--")
                .or_else(|| arg.strip_prefix('-').filter(|a| !a.is_empty()))
        }
        let option = strip_option(arg);
        let (option, inline_value) = match option {
            Some(option) => match option.split_once('=') {
                Some((o, v)) => (Some(o), Some(v.to_owned())),
                None => (Some(option), None),
            },
            None => (None, None),
        };

        let mut values = ValueSource {
            inline: inline_value,
            iter: &mut input_iter,
            _marker: std::marker::PhantomData,
        };

        match option {
            None => {
                args.inputs.push(Input {
                    spec: InputSpec::File(Box::from(Path::new(arg))),
                    search_first: None,
                    modifiers,
                });
            }
            Some(option) => match option {
                "o" | "output" => args.output = Arc::from(Path::new(&values.take("o")?)),
                "L" | "library-path" => {
                    args.lib_search_path
                        .push(Box::from(Path::new(&values.take("L")?)));
                }
                "l" | "library" => {
                    args.inputs.push(Input {
                        spec: InputSpec::Lib(Box::from(values.take("l")?.as_str())),
                        search_first: None,
                        modifiers,
                    });
                }
                "m" => args.arch = Architecture::from_emulation_name(&values.take("m")?)?,
                "e" | "entry" => args.entry = Some(values.take("entry")?),
                "T" | "script" => {
                    args.linker_script_paths
                        .push(PathBuf::from(values.take("script")?));
                }
                "dynamic-linker" | "I" => {
                    args.dynamic_linker = Some(Box::from(Path::new(&values.take("I")?)));
                }
                "no-dynamic-linker" => args.dynamic_linker = None,
                "sysroot" => args.sysroot = Some(Box::from(Path::new(&values.take("sysroot")?))),
                "shared" | "Bshareable" => args.shared = true,
                "r" | "relocatable" => args.relocatable = true,
                "static" | "Bstatic" | "dn" | "non_shared" => {
                    // -static and -Bstatic are distinct in GNU ld only in
                    // that -static also affects the output kind; for member
                    // selection both just forbid shared libraries.
                    modifiers.allow_shared = false;
                    args.is_static = true;
                }
                "Bdynamic" | "dy" | "call_shared" => modifiers.allow_shared = true,
                "pie" => args.pie = Some(true),
                "no-pie" => args.pie = Some(false),
                "whole-archive" => modifiers.whole_archive = true,
                "no-whole-archive" => modifiers.whole_archive = false,
                "as-needed" => modifiers.as_needed = true,
                "no-as-needed" => modifiers.as_needed = false,
                "push-state" => modifier_stack.push(modifiers),
                "pop-state" => {
                    modifiers = modifier_stack
                        .pop()
                        .context("--pop-state without matching --push-state")?;
                }
                "gc-sections" => args.gc_sections = true,
                "no-gc-sections" => args.gc_sections = false,
                "print-gc-sections" => args.print_gc_sections = true,
                "icf" => {
                    args.icf = match values.take("icf")?.as_str() {
                        "none" => IcfMode::None,
                        "safe" => IcfMode::Safe,
                        "all" => IcfMode::All,
                        other => bail!("Invalid --icf value `{other}`"),
                    };
                }
                "no-icf" => args.icf = IcfMode::None,
                "merge-strings" => args.merge_sections = true,
                "no-merge-strings" => args.merge_sections = false,
                "build-id" => {
                    let value = values.take_inline();
                    args.build_id = match value.as_deref() {
                        None | Some("fast") | Some("sha1") | Some("md5") => BuildIdOption::Fast,
                        Some("none") => BuildIdOption::None,
                        Some("uuid") => BuildIdOption::Uuid,
                        Some(hex) => {
                            let hex = hex.strip_prefix("0x").unwrap_or(hex);
                            BuildIdOption::Hex(parse_hex_bytes(hex).with_context(|| {
                                format!("Invalid --build-id value `{hex}`")
                            })?)
                        }
                    };
                }
                "no-build-id" => args.build_id = BuildIdOption::None,
                "compress-debug-sections" => {
                    args.compress_debug_sections =
                        match values.take("compress-debug-sections")?.as_str() {
                            "none" => CompressionStyle::None,
                            "zlib" | "zlib-gabi" => CompressionStyle::Zlib,
                            "zstd" => CompressionStyle::Zstd,
                            other => bail!("Unsupported --compress-debug-sections `{other}`"),
                        };
                }
                "hash-style" => {
                    args.hash_style = match values.take("hash-style")?.as_str() {
                        "sysv" => HashStyle::Sysv,
                        "gnu" => HashStyle::Gnu,
                        "both" => HashStyle::Both,
                        other => bail!("Invalid --hash-style `{other}`"),
                    };
                }
                "eh-frame-hdr" => args.should_write_eh_frame_hdr = true,
                "no-eh-frame-hdr" => args.should_write_eh_frame_hdr = false,
                "z" => {
                    let keyword = values.take("z")?;
                    parse_z_option(&mut args, &keyword)?;
                }
                "version-script" => {
                    args.version_script_path = Some(PathBuf::from(values.take("version-script")?));
                }
                "dynamic-list" | "export-dynamic-symbol-list" => {
                    args.dynamic_list_path = Some(PathBuf::from(values.take("dynamic-list")?));
                }
                "wrap" => args.wrap.push(values.take("wrap")?),
                "defsym" => {
                    let value = values.take("defsym")?;
                    let (name, expression) = value
                        .split_once('=')
                        .with_context(|| format!("Invalid --defsym `{value}`"))?;
                    args.defsym
                        .push((name.to_owned(), expression.to_owned()));
                }
                "u" | "undefined" | "require-defined" => {
                    args.undefined.push(values.take("undefined")?);
                }
                "M" | "print-map" => args.print_map = true,
                "Map" => {
                    // -Map writes to a file; we accept the flag and print to
                    // stdout like -M, claiming the output path.
                    let _ = values.take("Map")?;
                    args.print_map = true;
                }
                "soname" | "h" => args.soname = Some(values.take("soname")?),
                "rpath" | "R" => args.rpaths.push(values.take("rpath")?),
                "export-dynamic" | "E" => args.export_all_dynamic_symbols = true,
                "no-export-dynamic" => args.export_all_dynamic_symbols = false,
                "exclude-libs" => {
                    // The only value we've seen in practice is ALL.
                    let value = values.take("exclude-libs")?;
                    ensure!(value == "ALL", "Unsupported --exclude-libs value `{value}`");
                    args.exclude_libs_all = true;
                }
                "no-undefined" => args.no_undefined = true,
                "allow-multiple-definition" => args.allow_multiple_definitions = true,
                "unresolved-symbols" => {
                    args.unresolved_symbols = match values.take("unresolved-symbols")?.as_str() {
                        "report-all" => UnresolvedSymbols::ReportAll,
                        "ignore-in-shared-libs" => UnresolvedSymbols::IgnoreInSharedLibs,
                        "ignore-in-object-files" => UnresolvedSymbols::IgnoreInObjectFiles,
                        "ignore-all" => UnresolvedSymbols::IgnoreAll,
                        other => bail!("Invalid --unresolved-symbols `{other}`"),
                    };
                }
                "fatal-warnings" => args.fatal_warnings = true,
                "no-fatal-warnings" => args.fatal_warnings = false,
                "s" | "strip-all" => args.strip = Strip::All,
                "S" | "strip-debug" => args.strip = Strip::Debug,
                "threads" => {
                    if let Some(value) = values.take_inline() {
                        args.num_threads = Some(value.parse()?);
                    }
                }
                "thread-count" => args.num_threads = Some(values.take("thread-count")?.parse()?),
                "no-threads" => args.num_threads = NonZeroUsize::new(1),
                "max-page-size" => {
                    args.max_page_size = Alignment::new(parse_number(&values.take("max-page-size")?)?)?;
                }
                "reproduce" | "deterministic" => args.deterministic = true,
                "v" | "V" | "version" => should_print_version = true,
                "help" => {
                    bail!("mold {VERSION}: no help text yet; see the GNU ld documentation")
                }
                "EB" => bail!("Big-endian targets are not supported"),
                other => {
                    if SILENTLY_IGNORED_FLAGS.contains(&other)
                        || SILENTLY_IGNORED_SHORT_FLAGS.contains(&other)
                    {
                        // Consume "-plugin-opt x" style values? None of the
                        // flags we ignore take separate values.
                    } else if let Some(rest) = arg.strip_prefix("-l") {
                        // Attached short-option value, e.g. -lfoo.
                        args.inputs.push(Input {
                            spec: InputSpec::Lib(Box::from(rest)),
                            search_first: None,
                            modifiers,
                        });
                    } else if let Some(rest) = arg.strip_prefix("-L") {
                        args.lib_search_path.push(Box::from(Path::new(rest)));
                    } else if let Some(rest) = arg.strip_prefix("-o") {
                        args.output = Arc::from(Path::new(rest));
                    } else if let Some(rest) = arg.strip_prefix("-m") {
                        args.arch = Architecture::from_emulation_name(rest)?;
                    } else {
                        bail!("Unrecognized argument `{arg}`");
                    }
                }
            },
        }
    }

    // LD_LIBRARY_PATH participates in the search, after explicit -L paths.
    if let Ok(ld_library_path) = std::env::var("LD_LIBRARY_PATH") {
        for dir in ld_library_path.split(':').filter(|d| !d.is_empty()) {
            args.lib_search_path.push(Box::from(Path::new(dir)));
        }
    }

    if should_print_version {
        if args.inputs.is_empty() {
            return Ok(Action::Version);
        }
        eprintln!("mold {VERSION} (compatible with GNU ld)");
    }

    ensure!(
        !(args.shared && args.relocatable),
        "-shared and --relocatable cannot be combined"
    );

    Ok(Action::Link(Box::new(args)))
}

fn parse_z_option(args: &mut Args, keyword: &str) -> Result {
    match keyword {
        "now" => args.z_now = true,
        "lazy" => args.z_now = false,
        "relro" => args.relro = true,
        "norelro" => args.relro = false,
        "execstack" => args.execstack = true,
        "noexecstack" => args.execstack = false,
        "defs" => args.no_undefined = true,
        "undefs" => args.no_undefined = false,
        "muldefs" => args.allow_multiple_definitions = true,
        "nodelete" => args.z_nodelete = true,
        "origin" => args.z_origin = true,
        "text" => args.z_text = true,
        "notext" | "textoff" => args.z_text = false,
        "nocopyreloc" | "nodlopen" | "noextern-protected-data" | "nognustack" => {
            // Accepted for compatibility; no behavioural difference for us.
        }
        _ if keyword.starts_with("max-page-size=") => {
            let value = &keyword["max-page-size=".len()..];
            args.max_page_size = Alignment::new(parse_number(value)?)?;
        }
        _ if keyword.starts_with("common-page-size=") => {}
        _ if keyword.starts_with("stack-size=") => {}
        other => bail!("Unsupported -z option `{other}`"),
    }
    Ok(())
}

pub(crate) fn parse_number(s: &str) -> Result<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Ok(u64::from_str_radix(hex, 16)?)
    } else {
        Ok(s.parse::<u64>()?)
    }
}

fn parse_hex_bytes(hex: &str) -> Result<Vec<u8>> {
    ensure!(
        hex.len() % 2 == 0 && !hex.is_empty(),
        "hex string must have an even number of digits"
    );
    hex.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).unwrap();
            Ok(u8::from_str_radix(text, 16)?)
        })
        .try_collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_args(args: &[&str]) -> Args {
        match parse(args.iter()).unwrap() {
            Action::Link(args) => *args,
            Action::Version => panic!("expected link action"),
        }
    }

    #[test]
    fn test_basic_invocation() {
        let args = parse_args(&[
            "-o", "out", "crt1.o", "-L/usr/lib", "-lc", "main.o", "--gc-sections",
        ]);
        assert_eq!(args.output.as_ref(), Path::new("out"));
        assert_eq!(args.inputs.len(), 3);
        assert!(args.gc_sections);
        assert!(matches!(args.inputs[1].spec, InputSpec::Lib(ref l) if &**l == "c"));
    }

    #[test]
    fn test_sticky_modifiers() {
        let args = parse_args(&[
            "a.o",
            "--whole-archive",
            "libx.a",
            "--no-whole-archive",
            "--as-needed",
            "-lm",
        ]);
        assert!(!args.inputs[0].modifiers.whole_archive);
        assert!(args.inputs[1].modifiers.whole_archive);
        assert!(args.inputs[2].modifiers.as_needed);
        assert!(!args.inputs[2].modifiers.whole_archive);
    }

    #[test]
    fn test_push_pop_state() {
        let args = parse_args(&[
            "--push-state",
            "--whole-archive",
            "a.a",
            "--pop-state",
            "b.a",
        ]);
        assert!(args.inputs[0].modifiers.whole_archive);
        assert!(!args.inputs[1].modifiers.whole_archive);
    }

    #[test]
    fn test_z_keywords() {
        let args = parse_args(&["-z", "now", "-z", "norelro", "-z", "muldefs", "a.o"]);
        assert!(args.z_now);
        assert!(!args.relro);
        assert!(args.allow_multiple_definitions);
    }

    #[test]
    fn test_single_dash_long_options() {
        let args = parse_args(&["-shared", "-soname", "libfoo.so.1", "a.o"]);
        assert!(args.shared);
        assert_eq!(args.soname.as_deref(), Some("libfoo.so.1"));
        assert_eq!(args.output_kind(true), OutputKind::SharedObject);
    }

    #[test]
    fn test_output_kind_derivation() {
        let args = parse_args(&["a.o"]);
        assert_eq!(
            args.output_kind(false),
            OutputKind::StaticExecutable(RelocationModel::NonRelocatable)
        );
        assert_eq!(
            args.output_kind(true),
            OutputKind::DynamicExecutable(RelocationModel::NonRelocatable)
        );

        let args = parse_args(&["-pie", "a.o"]);
        assert_eq!(
            args.output_kind(true),
            OutputKind::DynamicExecutable(RelocationModel::Relocatable)
        );

        let args = parse_args(&["-r", "a.o"]);
        assert_eq!(args.output_kind(false), OutputKind::Relocatable);
    }

    #[test]
    fn test_build_id_values() {
        assert_eq!(parse_args(&["--build-id", "a.o"]).build_id, BuildIdOption::Fast);
        assert_eq!(
            parse_args(&["--build-id=none", "a.o"]).build_id,
            BuildIdOption::None
        );
        assert_eq!(
            parse_args(&["--build-id=0xdeadbeef", "a.o"]).build_id,
            BuildIdOption::Hex(vec![0xde, 0xad, 0xbe, 0xef])
        );
    }

    #[test]
    fn test_unknown_option_is_fatal() {
        assert!(parse(["--definitely-not-an-option", "a.o"].iter()).is_err());
    }

    #[test]
    fn test_group_markers_accepted() {
        let args = parse_args(&["--start-group", "a.a", "b.a", "--end-group", "m.o"]);
        assert_eq!(args.inputs.len(), 3);
    }

    #[test]
    fn test_defsym() {
        let args = parse_args(&["--defsym=foo=0x1000", "--defsym", "bar=baz", "a.o"]);
        assert_eq!(args.defsym[0], ("foo".to_owned(), "0x1000".to_owned()));
        assert_eq!(args.defsym[1], ("bar".to_owned(), "baz".to_owned()));
    }
}
