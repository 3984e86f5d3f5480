use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;

use crate::core_path::VirtualPath;

/// Filesystem collaborator for the session and the data worker. All paths
/// are absolute virtual paths; the backend decides what they map onto.
///
/// Injected into each component at construction so tests can substitute a
/// scratch directory for the real tree.
pub trait VirtualFs: Send + Sync {
    fn exists(&self, path: &VirtualPath) -> bool;
    fn is_directory(&self, path: &VirtualPath) -> bool;
    fn size(&self, path: &VirtualPath) -> io::Result<u64>;
    fn can_read(&self, path: &VirtualPath) -> bool;
    fn can_write(&self, path: &VirtualPath) -> bool;
    fn create_file(&self, path: &VirtualPath) -> io::Result<()>;
    fn create_dir(&self, path: &VirtualPath) -> io::Result<()>;
    fn truncate(&self, path: &VirtualPath) -> io::Result<()>;
    fn rename(&self, from: &VirtualPath, to: &VirtualPath) -> io::Result<()>;
    /// Names of the direct children of a directory.
    fn list_children(&self, path: &VirtualPath) -> io::Result<Vec<String>>;
    /// Names of the mount roots listed for the virtual root.
    fn list_roots(&self) -> io::Result<Vec<String>>;
    fn open_read(&self, path: &VirtualPath) -> io::Result<Box<dyn io::Read + Send>>;
    fn open_write(&self, path: &VirtualPath) -> io::Result<Box<dyn io::Write + Send>>;
}

/// Maps the virtual root onto a base directory on the local filesystem.
/// The base directory's immediate subdirectories are the mount roots.
pub struct LocalFs {
    base: PathBuf,
}

impl LocalFs {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn real_path(&self, path: &VirtualPath) -> PathBuf {
        self.base.join(path.as_str().trim_start_matches('/'))
    }
}

impl VirtualFs for LocalFs {
    fn exists(&self, path: &VirtualPath) -> bool {
        self.real_path(path).exists()
    }

    fn is_directory(&self, path: &VirtualPath) -> bool {
        self.real_path(path).is_dir()
    }

    fn size(&self, path: &VirtualPath) -> io::Result<u64> {
        Ok(fs::metadata(self.real_path(path))?.len())
    }

    fn can_read(&self, path: &VirtualPath) -> bool {
        fs::metadata(self.real_path(path)).is_ok()
    }

    fn can_write(&self, path: &VirtualPath) -> bool {
        fs::metadata(self.real_path(path))
            .map(|meta| !meta.permissions().readonly())
            .unwrap_or(false)
    }

    fn create_file(&self, path: &VirtualPath) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.real_path(path))
            .map(|_| ())
    }

    fn create_dir(&self, path: &VirtualPath) -> io::Result<()> {
        fs::create_dir(self.real_path(path))
    }

    fn truncate(&self, path: &VirtualPath) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.real_path(path))
            .map(|_| ())
    }

    fn rename(&self, from: &VirtualPath, to: &VirtualPath) -> io::Result<()> {
        fs::rename(self.real_path(from), self.real_path(to))
    }

    fn list_children(&self, path: &VirtualPath) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.real_path(path))? {
            names.push(entry?.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn list_roots(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    fn open_read(&self, path: &VirtualPath) -> io::Result<Box<dyn io::Read + Send>> {
        Ok(Box::new(fs::File::open(self.real_path(path))?))
    }

    fn open_write(&self, path: &VirtualPath) -> io::Result<Box<dyn io::Write + Send>> {
        Ok(Box::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(self.real_path(path))?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_path::{resolve, VirtualPath};
    use std::io::{Read, Write};

    fn scratch() -> (tempfile::TempDir, LocalFs) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("root1")).unwrap();
        std::fs::create_dir(dir.path().join("root2")).unwrap();
        std::fs::write(dir.path().join("root1/hello.txt"), b"hello world").unwrap();
        let fs = LocalFs::new(dir.path());
        (dir, fs)
    }

    fn vpath(path: &str) -> VirtualPath {
        resolve(&VirtualPath::root(), path).unwrap()
    }

    #[test]
    fn exists_and_type_checks() {
        let (_dir, fs) = scratch();
        assert!(fs.exists(&vpath("/root1")));
        assert!(fs.is_directory(&vpath("/root1")));
        assert!(fs.exists(&vpath("/root1/hello.txt")));
        assert!(!fs.is_directory(&vpath("/root1/hello.txt")));
        assert!(!fs.exists(&vpath("/root1/missing")));
    }

    #[test]
    fn size_of_file() {
        let (_dir, fs) = scratch();
        assert_eq!(fs.size(&vpath("/root1/hello.txt")).unwrap(), 11);
    }

    #[test]
    fn list_roots_returns_top_level_directories() {
        let (_dir, fs) = scratch();
        assert_eq!(fs.list_roots().unwrap(), vec!["root1", "root2"]);
    }

    #[test]
    fn list_children_of_directory() {
        let (_dir, fs) = scratch();
        assert_eq!(fs.list_children(&vpath("/root1")).unwrap(), vec!["hello.txt"]);
        assert!(fs.list_children(&vpath("/root2")).unwrap().is_empty());
    }

    #[test]
    fn create_truncate_and_rename() {
        let (_dir, fs) = scratch();
        let file = vpath("/root2/new.txt");
        fs.create_file(&file).unwrap();
        assert!(fs.exists(&file));
        // creating the same file twice is an error
        assert!(fs.create_file(&file).is_err());

        let mut writer = fs.open_write(&file).unwrap();
        writer.write_all(b"data").unwrap();
        drop(writer);
        assert_eq!(fs.size(&file).unwrap(), 4);

        fs.truncate(&file).unwrap();
        assert_eq!(fs.size(&file).unwrap(), 0);

        let renamed = vpath("/root2/renamed.txt");
        fs.rename(&file, &renamed).unwrap();
        assert!(!fs.exists(&file));
        assert!(fs.exists(&renamed));
    }

    #[test]
    fn open_read_streams_contents() {
        let (_dir, fs) = scratch();
        let mut reader = fs.open_read(&vpath("/root1/hello.txt")).unwrap();
        let mut contents = String::new();
        reader.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello world");
    }

    #[test]
    fn create_dir_rejects_existing() {
        let (_dir, fs) = scratch();
        assert!(fs.create_dir(&vpath("/root1/sub")).is_ok());
        assert!(fs.is_directory(&vpath("/root1/sub")));
        assert!(fs.create_dir(&vpath("/root1/sub")).is_err());
    }
}
