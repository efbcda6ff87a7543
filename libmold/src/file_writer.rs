//! The sized output buffer. We mmap the output file once its final size is
//! known and patch bytes in place; if mmapping fails (e.g. the output is a
//! pipe) we fall back to an in-memory buffer flushed at the end. The mapping
//! is scope-owned: dropping `SizedOutput` unmaps on every exit path.

use crate::error::Context as _;
use crate::error::Result;
use memmap2::MmapOptions;
use std::io::Write as _;
use std::ops::Deref;
use std::ops::DerefMut;
use std::path::Path;

pub(crate) struct SizedOutput {
    file: std::fs::File,
    pub(crate) out: OutputBuffer,
    path: Box<Path>,
}

pub(crate) enum OutputBuffer {
    Mmap(memmap2::MmapMut),
    InMemory(Vec<u8>),
}

impl OutputBuffer {
    fn new(file: &std::fs::File, file_size: u64) -> Self {
        Self::new_mmapped(file, file_size)
            .unwrap_or_else(|| Self::InMemory(vec![0; file_size as usize]))
    }

    fn new_mmapped(file: &std::fs::File, file_size: u64) -> Option<Self> {
        file.set_len(file_size).ok()?;
        let mmap = unsafe { MmapOptions::new().map_mut(file) }.ok()?;
        Some(Self::Mmap(mmap))
    }
}

impl Deref for OutputBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap.deref(),
            OutputBuffer::InMemory(vec) => vec.deref(),
        }
    }
}

impl DerefMut for OutputBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            OutputBuffer::Mmap(mmap) => mmap.deref_mut(),
            OutputBuffer::InMemory(vec) => vec.deref_mut(),
        }
    }
}

impl SizedOutput {
    pub(crate) fn new(path: &Path, file_size: u64) -> Result<SizedOutput> {
        let path: Box<Path> = Box::from(path);

        // Unlink any old output so that an existing (possibly running)
        // binary isn't modified in place.
        let _ = std::fs::remove_file(&path);

        let mut open_options = std::fs::OpenOptions::new();
        std::os::unix::fs::OpenOptionsExt::custom_flags(&mut open_options, libc::O_CLOEXEC);
        let file = open_options
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to open `{}` for writing", path.display()))?;

        let out = OutputBuffer::new(&file, file_size);
        Ok(SizedOutput { file, out, path })
    }

    pub(crate) fn flush(&mut self, make_executable: bool) -> Result {
        match &self.out {
            OutputBuffer::Mmap(_) => {}
            OutputBuffer::InMemory(bytes) => self
                .file
                .write_all(bytes)
                .with_context(|| format!("Failed to write `{}`", self.path.display()))?,
        }
        if make_executable {
            // Best-effort: fails for pipes and that's fine.
            let _ = crate::fs::make_executable(&self.file);
        }
        Ok(())
    }
}
