use std::io;

use walkdir::WalkDir;

pub trait FsWalker: Send + Sync {
    /// Calls `f` with the path of every regular file below `dir` until it
    /// returns `false`.
    fn list_files_recursive(&self, dir: &str, f: &mut dyn FnMut(&str) -> bool) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WalkDirFs;

impl FsWalker for WalkDirFs {
    fn list_files_recursive(&self, dir: &str, f: &mut dyn FnMut(&str) -> bool) -> io::Result<()> {
        for entry in WalkDir::new(dir).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(path) = entry.path().to_str() else {
                continue;
            };
            if !f(path) {
                break;
            }
        }
        Ok(())
    }
}
