//! Distributed file system collaborator.
//!
//! The scheduler only needs file metadata (size and the hosts holding the
//! data) to derive locality; task processes use the rest. [`LocalFileSystem`]
//! backs the interface with a directory on one host.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    /// Hosts holding a replica of the file's data.
    pub hosts: Vec<String>,
}

pub trait FileSystem: Send + Sync {
    fn open_file(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    fn create_file(&self, path: &str) -> Result<Box<dyn Write + Send>>;

    fn move_file(&self, from: &str, to: &str) -> Result<()>;

    fn get_file_info(&self, path: &str) -> Result<FileInfo>;
}

pub struct LocalFileSystem {
    root: PathBuf,
    hosts: Vec<String>,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            hosts: Vec::new(),
        }
    }

    /// Reports every file as resident on `hosts`.
    pub fn with_hosts(mut self, hosts: Vec<String>) -> Self {
        self.hosts = hosts;
        self
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidArgument(format!(
                "path {path:?} escapes the file system root"
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl FileSystem for LocalFileSystem {
    fn open_file(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let full = self.resolve(path)?;
        let file = File::open(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
            _ => Error::Io(e),
        })?;
        Ok(Box::new(file))
    }

    fn create_file(&self, path: &str) -> Result<Box<dyn Write + Send>> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Box::new(File::create(full)?))
    }

    fn move_file(&self, from: &str, to: &str) -> Result<()> {
        let src = self.resolve(from)?;
        let dst = self.resolve(to)?;
        if !src.exists() {
            return Err(Error::NotFound(from.to_string()));
        }
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src, dst)?;
        Ok(())
    }

    fn get_file_info(&self, path: &str) -> Result<FileInfo> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.to_string()),
            _ => Error::Io(e),
        })?;
        Ok(FileInfo {
            path: path.to_string(),
            size: meta.len(),
            hosts: self.hosts.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_move_and_stat() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::new(dir.path()).with_hosts(vec!["node-1".to_string()]);

        {
            let mut w = fs.create_file("/jobs/a/part.tmp").unwrap();
            w.write_all(b"hello").unwrap();
        }
        fs.move_file("/jobs/a/part.tmp", "/jobs/a/part").unwrap();

        let info = fs.get_file_info("/jobs/a/part").unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.hosts, vec!["node-1".to_string()]);

        let mut buf = String::new();
        fs.open_file("/jobs/a/part")
            .unwrap()
            .read_to_string(&mut buf)
            .unwrap();
        assert_eq!(buf, "hello");

        assert!(matches!(
            fs.get_file_info("/jobs/a/part.tmp"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn rejects_parent_components() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::new(dir.path());
        assert!(matches!(
            fs.get_file_info("../etc/passwd"),
            Err(Error::InvalidArgument(_))
        ));
    }
}
