use std::{
    fs::{self, DirEntry, File, ReadDir},
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use tracing::debug;

// Directory entries whose file name starts with a given prefix.
// Every call to iter() restarts the traversal from scratch
#[derive(Debug, Clone)]
pub struct PrefixedDir {
    dir: PathBuf,
    prefix: String,
}

// Lazy iterator over the entries of a PrefixedDir
pub struct PrefixedEntries {
    read_dir: ReadDir,
    prefix: String,
}

impl PrefixedDir {
    pub fn new(dir: &Path, prefix: &str) -> Self {
        Self {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
        }
    }

    // Open the directory and start a new traversal
    pub fn iter(&self) -> io::Result<PrefixedEntries> {
        Ok(PrefixedEntries {
            read_dir: fs::read_dir(&self.dir)?,
            prefix: self.prefix.clone(),
        })
    }

    // Matching entries sorted by file name, for callers that
    // need a stable enumeration order
    pub fn sorted(&self) -> io::Result<Vec<DirEntry>> {
        let mut entries: Vec<DirEntry> = self.iter()?.collect();
        entries.sort_by_key(|e| e.file_name());

        Ok(entries)
    }
}

impl Iterator for PrefixedEntries {
    type Item = DirEntry;

    fn next(&mut self) -> Option<Self::Item> {
        // Unreadable entries are skipped, not fatal
        for entry in self.read_dir.by_ref().flatten() {
            if entry.file_name().to_string_lossy().starts_with(&self.prefix) {
                return Some(entry);
            }
        }

        None
    }
}

// True when the path exists and is not an empty file
pub fn exists_not_empty(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() == 0 => {
            debug!("{path:?} is empty");
            false
        }
        Ok(_) => true,
        Err(_) => {
            debug!("Can't access {path:?}");
            false
        }
    }
}

// Case insensitive search for a pattern in any line of a file.
// A missing file contains nothing
pub fn file_contains_ignore_case(path: &Path, pattern: &str) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };

    let pattern = pattern.to_lowercase();

    BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .any(|line| line.to_lowercase().contains(&pattern))
}

// Return the first line of a file without the line terminator
pub fn read_first_line(path: &Path) -> io::Result<Option<String>> {
    let file = File::open(path)?;
    let mut lines = BufReader::new(file).lines();

    lines.next().transpose()
}

// Return the final component of a symlink target,
// e.g. the driver name behind a sysfs "driver" link
pub fn link_target_name(path: &Path) -> Option<String> {
    let target = fs::read_link(path).ok()?;

    target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
