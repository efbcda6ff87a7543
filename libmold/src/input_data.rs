//! Figures out which input files we need to read, maps them into memory and
//! splits archives into their members. The output is an ordered list of
//! candidate object/shared-object files paired with their provenance. Order
//! matters: a file's position is its priority for symbol resolution
//! tie-breaks, so everything here is deterministic.

use crate::archive::ArchiveEntry;
use crate::archive::ArchiveIterator;
use crate::archive::EntryMeta;
use crate::args::Args;
use crate::args::Input;
use crate::args::InputSpec;
use crate::args::Modifiers;
use crate::bail;
use crate::error::Context as _;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::linker_script::LinkerScript;
use colosseum::sync::Arena;
use memmap2::Mmap;
use std::fmt::Display;
use std::path::Path;
use std::path::PathBuf;

/// Identifies an input file. ID 0 is reserved for the prelude, the
/// internal file that defines linker-generated symbols. Higher IDs follow
/// command-line order, which makes the ID usable as a resolution priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FileId(u32);

pub(crate) const PRELUDE_FILE_ID: FileId = FileId(0);

impl FileId {
    pub(crate) fn from_usize(raw: usize) -> Self {
        Self(raw as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "file-{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,

    pub(crate) modifiers: Modifiers,

    data: Option<Mmap>,
}

impl InputFile {
    pub(crate) fn data(&self) -> &[u8] {
        self.data.as_deref().unwrap_or_default()
    }
}

/// An input object that may be a regular file or an entry in an archive.
#[derive(Clone, Debug)]
pub(crate) struct InputRef<'data> {
    pub(crate) file: &'data InputFile,
    pub(crate) entry: Option<EntryMeta<'data>>,
}

impl InputRef<'_> {
    pub(crate) fn lib_name(&self) -> &[u8] {
        self.file
            .filename
            .file_name()
            .map(|n| n.as_encoded_bytes())
            .unwrap_or_default()
    }
}

impl Display for InputRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file.filename.display())?;
        if let Some(entry) = &self.entry {
            write!(f, "({})", entry.ident)?;
        }
        Ok(())
    }
}

/// The bytes of one candidate object, ready to parse.
pub(crate) struct InputBytes<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) kind: FileKind,
    pub(crate) data: &'data [u8],
    pub(crate) modifiers: Modifiers,

    /// Whether the file is an archive member that should only be loaded if
    /// it resolves an undefined symbol.
    pub(crate) is_archive_member: bool,
}

pub(crate) struct ScriptInput<'data> {
    pub(crate) script: LinkerScript<'data>,
    pub(crate) path: PathBuf,
}

pub(crate) struct InputData<'data> {
    /// Parsed candidates in command-line order, archives expanded.
    pub(crate) files: Vec<InputBytes<'data>>,

    /// Linker scripts given with -T or found as plain-text inputs.
    pub(crate) linker_scripts: Vec<ScriptInput<'data>>,

    pub(crate) version_script_data: Option<&'data [u8]>,
    pub(crate) dynamic_list_data: Option<&'data [u8]>,

    pub(crate) has_dynamic: bool,
}

impl<'data> InputData<'data> {
    #[tracing::instrument(skip_all, name = "Open input files")]
    pub(crate) fn from_args(args: &Args, inputs_arena: &'data Arena<InputFile>) -> Result<Self> {
        let mut loader = Loader {
            args,
            inputs_arena,
            loaded_paths: hashbrown::HashSet::new(),
            extra_search_path: args
                .sysroot
                .as_deref()
                .map(|sysroot| sysroot.to_owned())
                .into_iter()
                .collect(),
            out: InputData {
                files: Vec::new(),
                linker_scripts: Vec::new(),
                version_script_data: None,
                dynamic_list_data: None,
                has_dynamic: false,
            },
        };

        let mut queue: Vec<Input> = Vec::new();
        for path in &args.linker_script_paths {
            let file = loader.open_aux(path)?;
            queue.extend(loader.process_linker_script(file, Modifiers::default())?);
        }
        queue.extend(args.inputs.iter().map(|input| Input {
            spec: clone_spec(&input.spec),
            search_first: input.search_first.clone(),
            modifiers: input.modifiers,
        }));

        // Process in order; linker scripts insert their inputs directly
        // after themselves so that resolution priority follows script order.
        let mut i = 0;
        while i < queue.len() {
            let modifiers = queue[i].modifiers;
            let path = loader.resolve_input_path(&queue[i])?;
            let extra = loader.load_path(&path, modifiers)?;
            for (j, new_input) in extra.into_iter().enumerate() {
                queue.insert(i + 1 + j, new_input);
            }
            i += 1;
        }

        if let Some(path) = &args.version_script_path {
            let file = loader.open_aux(path)?;
            loader.out.version_script_data = Some(file.data());
        }
        if let Some(path) = &args.dynamic_list_path {
            let file = loader.open_aux(path)?;
            loader.out.dynamic_list_data = Some(file.data());
        }

        if loader.out.files.is_empty() {
            bail!("no input files");
        }

        Ok(loader.out)
    }
}

struct Loader<'data, 'args> {
    args: &'args Args,
    inputs_arena: &'data Arena<InputFile>,

    /// Absolute paths we've already loaded. Scripts sometimes mention the
    /// same library twice; the first mention wins.
    loaded_paths: hashbrown::HashSet<PathBuf>,

    /// Extra directories from SEARCH_DIR commands and the sysroot.
    extra_search_path: Vec<PathBuf>,

    out: InputData<'data>,
}

fn clone_spec(spec: &InputSpec) -> InputSpec {
    match spec {
        InputSpec::File(p) => InputSpec::File(p.clone()),
        InputSpec::Lib(l) => InputSpec::Lib(l.clone()),
    }
}

impl<'data> Loader<'data, '_> {
    fn resolve_input_path(&self, input: &Input) -> Result<PathBuf> {
        match &input.spec {
            InputSpec::File(path) => {
                let path = self.apply_sysroot(path);
                if path.exists() {
                    return Ok(path.into_owned());
                }
                if path.is_absolute() || path.components().count() > 1 {
                    bail!("Cannot open input file `{}`", path.display());
                }
                let filename = path.to_string_lossy();
                self.search(input.search_first.as_deref(), &[filename.as_ref()])
                    .with_context(|| format!("Cannot find input file `{}`", path.display()))
            }
            InputSpec::Lib(name) => {
                let mut candidates = Vec::new();
                if input.modifiers.allow_shared {
                    candidates.push(format!("lib{name}.so"));
                }
                candidates.push(format!("lib{name}.a"));
                let candidate_refs: Vec<&str> =
                    candidates.iter().map(|c| c.as_str()).collect();
                self.search(input.search_first.as_deref(), &candidate_refs)
                    .with_context(|| format!("Cannot find library `-l{name}`"))
            }
        }
    }

    fn apply_sysroot<'p>(&self, path: &'p Path) -> std::borrow::Cow<'p, Path> {
        if let Some(sysroot) = self.args.sysroot.as_deref() {
            if let Some(forced) = crate::linker_script::maybe_forced_sysroot(path, sysroot) {
                return std::borrow::Cow::Owned(forced.into_path_buf());
            }
        }
        std::borrow::Cow::Borrowed(path)
    }

    fn search(&self, search_first: Option<&Path>, filenames: &[&str]) -> Result<PathBuf> {
        let dirs = search_first
            .map(|d| d.to_owned())
            .into_iter()
            .chain(self.args.lib_search_path.iter().map(|d| d.to_path_buf()))
            .chain(self.extra_search_path.iter().cloned());
        for dir in dirs {
            for filename in filenames {
                let candidate = dir.join(filename);
                if candidate.exists() {
                    return Ok(candidate);
                }
            }
        }
        bail!("Not found in search path");
    }

    fn open(&mut self, path: &Path, modifiers: Modifiers) -> Result<&'data InputFile> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open input file `{}`", path.display()))?;
        // Safety: mmapped input files must not be modified while we run.
        // Like the other linkers, we rely on build systems not doing that.
        let data = unsafe { Mmap::map(&file) }
            .with_context(|| format!("Failed to mmap input file `{}`", path.display()))?;
        Ok(self.inputs_arena.alloc(InputFile {
            filename: path.to_owned(),
            modifiers,
            data: Some(data),
        }))
    }

    fn open_aux(&mut self, path: &Path) -> Result<&'data InputFile> {
        let resolved = if path.exists() {
            path.to_owned()
        } else {
            let filename = path.to_string_lossy();
            self.search(None, &[filename.as_ref()])
                .unwrap_or_else(|_| path.to_owned())
        };
        self.open(&resolved, Modifiers::default())
    }

    /// Loads one resolved path. Returns any extra inputs requested by a
    /// linker script.
    fn load_path(&mut self, path: &Path, modifiers: Modifiers) -> Result<Vec<Input>> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_owned());
        if !self.loaded_paths.insert(canonical) {
            return Ok(Vec::new());
        }
        let file = self.open(path, modifiers)?;
        let kind = FileKind::identify_bytes(file.data())
            .with_context(|| format!("Failed to process `{}`", path.display()))?;
        match kind {
            FileKind::ElfObject => self.push_object(file, kind, modifiers, None, false),
            FileKind::ElfDynamic => {
                self.out.has_dynamic = true;
                self.push_object(file, kind, modifiers, None, false);
            }
            FileKind::Archive => self.split_archive(file, modifiers)?,
            FileKind::ThinArchive => return self.split_thin_archive(file, modifiers),
            FileKind::Text => return self.process_linker_script(file, modifiers),
            FileKind::LlvmIr | FileKind::GccIr => {
                bail!(
                    "`{}` is a compiler IR file; LTO inputs are not supported",
                    path.display()
                );
            }
        }
        Ok(Vec::new())
    }

    fn push_object(
        &mut self,
        file: &'data InputFile,
        kind: FileKind,
        modifiers: Modifiers,
        entry: Option<EntryMeta<'data>>,
        is_archive_member: bool,
    ) {
        let data = match &entry {
            Some(meta) => &file.data()[meta.range.clone()],
            None => file.data(),
        };
        self.out.files.push(InputBytes {
            input: InputRef { file, entry },
            kind,
            data,
            modifiers,
            is_archive_member,
        });
    }

    fn split_archive(&mut self, file: &'data InputFile, modifiers: Modifiers) -> Result {
        let mut extended_filenames = None;
        for entry in ArchiveIterator::from_archive_bytes(file.data())? {
            let entry = entry.with_context(|| {
                format!("Invalid archive `{}`", file.filename.display())
            })?;
            match entry {
                ArchiveEntry::SymbolTable => {}
                ArchiveEntry::Filenames(table) => extended_filenames = Some(table),
                ArchiveEntry::Regular(member) => {
                    let kind =
                        FileKind::identify_bytes(member.data).with_context(|| {
                            format!(
                                "Invalid member `{}` in `{}`",
                                member.ident(extended_filenames),
                                file.filename.display()
                            )
                        })?;
                    if kind.is_compiler_ir() {
                        bail!(
                            "`{}({})` is a compiler IR file; LTO inputs are not supported",
                            file.filename.display(),
                            member.ident(extended_filenames),
                        );
                    }
                    if kind == FileKind::ElfDynamic {
                        self.out.has_dynamic = true;
                    }
                    let meta = EntryMeta {
                        ident: member.ident(extended_filenames),
                        range: member.data_range(),
                    };
                    self.push_object(
                        file,
                        kind,
                        modifiers,
                        Some(meta),
                        !modifiers.whole_archive,
                    );
                }
                ArchiveEntry::Thin(_) => {
                    bail!(
                        "`{}` has thin members but a regular archive header",
                        file.filename.display()
                    );
                }
            }
        }
        Ok(())
    }

    /// Thin archives reference their members as separate files relative to
    /// the archive's directory.
    fn split_thin_archive(
        &mut self,
        file: &'data InputFile,
        modifiers: Modifiers,
    ) -> Result<Vec<Input>> {
        let dir = file.filename.parent().unwrap_or(Path::new("."));
        let mut extended_filenames = None;
        let mut extra = Vec::new();
        for entry in ArchiveIterator::from_archive_bytes(file.data())? {
            match entry? {
                ArchiveEntry::Filenames(table) => extended_filenames = Some(table),
                ArchiveEntry::Thin(member) => {
                    let member_path = member.ident(extended_filenames).as_path();
                    let path = if member_path.is_absolute() {
                        member_path.to_owned()
                    } else {
                        dir.join(member_path)
                    };
                    extra.push(Input {
                        spec: InputSpec::File(Box::from(path.as_path())),
                        search_first: None,
                        // Members of thin archives still have archive
                        // semantics unless --whole-archive is in force.
                        modifiers,
                    });
                }
                _ => {}
            }
        }
        Ok(extra)
    }

    fn process_linker_script(
        &mut self,
        file: &'data InputFile,
        modifiers: Modifiers,
    ) -> Result<Vec<Input>> {
        let text = std::str::from_utf8(file.data())
            .with_context(|| format!("`{}` is not valid UTF-8", file.filename.display()))?;
        let script = LinkerScript::parse(text, &file.filename)?;
        for dir in script.search_dirs() {
            self.extra_search_path.push(PathBuf::from(dir));
        }
        let inputs = script.inputs(
            modifiers,
            &file.filename,
            self.args.sysroot.as_deref(),
        );
        self.out.linker_scripts.push(ScriptInput {
            script,
            path: file.filename.clone(),
        });
        Ok(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_id_ordering_follows_command_line() {
        let a = FileId::from_usize(1);
        let b = FileId::from_usize(2);
        assert!(a < b);
        assert_eq!(PRELUDE_FILE_ID.as_usize(), 0);
    }
}
