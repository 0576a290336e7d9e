use std::cmp::Ordering;
use std::collections::BTreeMap;

/// The identity under which a mapped file is known, independent of its
/// path. Anonymous and pseudo mappings carry the all-zero identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FileId {
    pub major: u32,
    pub minor: u32,
    pub inode: u64,
    pub generation: u64,
}

impl FileId {
    pub fn is_anonymous(&self) -> bool {
        *self == FileId::default()
    }
}

impl Ord for FileId {
    fn cmp(&self, other: &Self) -> Ordering {
        // Inode first as it is likely to be unique most often; the device
        // pair next; the generation should rarely differ so it goes last.
        self.inode
            .cmp(&other.inode)
            .then(self.major.cmp(&other.major))
            .then(self.minor.cmp(&other.minor))
            .then(self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for FileId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Key of the aggregation stores: a location inside a mapped file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleKey {
    pub file_id: FileId,
    pub offset: u64,
}

impl Ord for SampleKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // The offset varies most within one file, so it sorts right after
        // the inode.
        self.file_id
            .inode
            .cmp(&other.file_id.inode)
            .then(self.offset.cmp(&other.offset))
            .then(self.file_id.major.cmp(&other.file_id.major))
            .then(self.file_id.minor.cmp(&other.file_id.minor))
            .then(self.file_id.generation.cmp(&other.file_id.generation))
    }
}

impl PartialOrd for SampleKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Registry of file identity to path, filled from MMAP2 records and the
/// startup bootstrap. Exists so the hot aggregation path never touches
/// strings; paths are only looked up again at serialization time.
#[derive(Debug, Default)]
pub struct FileRegistry {
    paths: BTreeMap<FileId, String>,
}

impl FileRegistry {
    pub fn new() -> FileRegistry {
        FileRegistry::default()
    }

    /// Registers (or re-registers) the path a file identity was last
    /// mapped under.
    pub fn register(&mut self, file_id: FileId, path: &str) {
        self.paths.insert(file_id, path.to_owned());
    }

    pub fn path_of(&self, file_id: &FileId) -> Option<&str> {
        self.paths.get(file_id).map(|p| p.as_str())
    }
}

/// Identity of the file behind a bootstrap mapping. Pseudo entries
/// (`[heap]`, `[vdso]`, `anon_inode:…`) and paths that can no longer be
/// stat'ed get the zero identity and are never resolved against.
pub fn file_id_for_path(path: &str) -> FileId {
    if path.is_empty() || path.starts_with('[') || path.starts_with("anon_inode:") {
        return FileId::default();
    }

    match nix::sys::stat::lstat(path) {
        Ok(stat) => FileId {
            major: nix::sys::stat::major(stat.st_dev) as u32,
            minor: nix::sys::stat::minor(stat.st_dev) as u32,
            inode: stat.st_ino,
            generation: 0,
        },
        Err(_) => FileId::default(),
    }
}
