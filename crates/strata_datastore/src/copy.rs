//! File transfer strategies: copy, move and symlink.
//!
//! Every strategy checks that the source exists (without following links),
//! performs the transfer, and write-protects what it produced. Failures are
//! wrapped into [`DatastoreError::Copy`] naming both paths; nothing is rolled
//! back.

use crate::error::{DatastoreError, Result};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Read-only permissions applied to produced files: `r--r--r--`.
pub const FILE_READONLY_MODE: u32 = 0o444;
/// Read-only permissions applied to produced directories: `r-xr-xr-x`.
pub const DIR_READONLY_MODE: u32 = 0o555;
/// Permissions applied to files about to be overwritten: `rw-rw-r--`.
pub const FILE_OVERWRITE_MODE: u32 = 0o664;
/// Permissions applied to directories about to be overwritten: `rwxrwxr-x`.
pub const DIR_OVERWRITE_MODE: u32 = 0o775;

/// Symlink chains longer than this are treated as loops.
const MAX_SYMLINK_DEPTH: usize = 40;

/// Which transfer to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyMode {
    Copy,
    Move,
    Symlink,
}

impl CopyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyMode::Copy => "copy",
            CopyMode::Move => "move",
            CopyMode::Symlink => "symlink",
        }
    }

    pub(crate) fn failure_message(&self, src: &Path, dest: &Path) -> String {
        match self {
            CopyMode::Copy => format!(
                "Unable to copy file {} to {}",
                src.display(),
                dest.display()
            ),
            CopyMode::Move => format!(
                "Unable to move file {} to {}",
                src.display(),
                dest.display()
            ),
            CopyMode::Symlink => format!(
                "Unable to create symlink {} from {}",
                dest.display(),
                src.display()
            ),
        }
    }

    /// Build the strategy for this mode. Move and symlink resolve sources
    /// against `datastore_root`.
    pub fn strategy(self, datastore_root: &Path) -> Box<dyn TransferStrategy> {
        match self {
            CopyMode::Copy => Box::new(CopyTransfer),
            CopyMode::Move => Box::new(MoveTransfer::new(datastore_root)),
            CopyMode::Symlink => Box::new(SymlinkTransfer::new(datastore_root)),
        }
    }
}

impl fmt::Display for CopyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One way of getting a file or directory from `src` to `dest`.
pub trait TransferStrategy: Send + Sync {
    fn mode(&self) -> CopyMode;

    /// Perform the transfer of one path.
    fn transfer(&self, src: &Path, dest: &Path) -> Result<()> {
        check_source(src)?;
        debug!(
            mode = %self.mode(),
            src = %src.display(),
            dest = %dest.display(),
            "Transferring file"
        );
        self.transfer_unchecked(src, dest)
            .map_err(|source| DatastoreError::Copy {
                mode: self.mode(),
                src: src.to_path_buf(),
                dest: dest.to_path_buf(),
                source,
            })
    }

    /// Transfer body, run after the source check.
    fn transfer_unchecked(&self, src: &Path, dest: &Path) -> io::Result<()>;
}

fn check_source(src: &Path) -> Result<()> {
    match fs::symlink_metadata(src) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(DatastoreError::MissingSource(src.to_path_buf()))
        }
        Err(e) => Err(DatastoreError::io("stat", src, e)),
    }
}

/// Recursive copy; an existing destination is overwritten.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyTransfer;

impl TransferStrategy for CopyTransfer {
    fn mode(&self) -> CopyMode {
        CopyMode::Copy
    }

    fn transfer_unchecked(&self, src: &Path, dest: &Path) -> io::Result<()> {
        if let Ok(meta) = fs::symlink_metadata(dest) {
            if meta.file_type().is_symlink() {
                // Writing through a link would overwrite its target.
                fs::remove_file(dest)?;
            } else {
                prepare_tree_for_overwrite(dest)?;
            }
        }

        if src.is_dir() {
            copy_dir_recursive(src, dest)?;
        } else {
            fs::copy(src, dest)?;
        }
        write_protect_tree(dest)
    }
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Ok(meta) = fs::symlink_metadata(&target) {
                if meta.file_type().is_symlink() {
                    fs::remove_file(&target)?;
                }
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Atomic rename of the resolved source.
///
/// When the source was a symlink, the link is replaced with a new one
/// pointing at the moved file so existing references stay valid.
#[derive(Debug, Clone)]
pub struct MoveTransfer {
    datastore_root: PathBuf,
}

impl MoveTransfer {
    pub fn new(datastore_root: &Path) -> Self {
        Self {
            datastore_root: datastore_root.to_path_buf(),
        }
    }
}

impl TransferStrategy for MoveTransfer {
    fn mode(&self) -> CopyMode {
        CopyMode::Move
    }

    fn transfer_unchecked(&self, src: &Path, dest: &Path) -> io::Result<()> {
        let true_src = resolve_source(src, &self.datastore_root)?;
        if fs::symlink_metadata(dest).is_ok() {
            prepare_tree_for_overwrite(dest)?;
        }
        fs::rename(&true_src, dest)?;
        write_protect_tree(dest)?;

        if true_src.as_path() != src {
            fs::remove_file(src)?;
            make_symlink(dest, src)?;
        }
        Ok(())
    }
}

/// Destination becomes a link to the resolved source.
#[derive(Debug, Clone)]
pub struct SymlinkTransfer {
    datastore_root: PathBuf,
}

impl SymlinkTransfer {
    pub fn new(datastore_root: &Path) -> Self {
        Self {
            datastore_root: datastore_root.to_path_buf(),
        }
    }
}

impl TransferStrategy for SymlinkTransfer {
    fn mode(&self) -> CopyMode {
        CopyMode::Symlink
    }

    fn transfer_unchecked(&self, src: &Path, dest: &Path) -> io::Result<()> {
        let true_src = resolve_source(src, &self.datastore_root)?;
        remove_existing(dest)?;
        make_symlink(&true_src, dest)
    }
}

/// Move `src` to `dest`, or, when `src` is a symlink, link `dest` to the
/// resolved source and delete `src`.
pub fn move_or_symlink(src: &Path, dest: &Path, datastore_root: &Path) -> Result<()> {
    let is_symlink = fs::symlink_metadata(src)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if is_symlink {
        SymlinkTransfer::new(datastore_root).transfer(src, dest)?;
        fs::remove_file(src).map_err(|e| DatastoreError::io("delete", src, e))
    } else {
        MoveTransfer::new(datastore_root).transfer(src, dest)
    }
}

/// Follow a symlink chain until it reaches a non-link or a path already
/// inside `datastore_root`.
///
/// Relative link targets are resolved against the link's directory.
pub fn resolve_source(src: &Path, datastore_root: &Path) -> io::Result<PathBuf> {
    let mut current = src.to_path_buf();
    for _ in 0..MAX_SYMLINK_DEPTH {
        let is_symlink = fs::symlink_metadata(&current)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink || current.starts_with(datastore_root) {
            return Ok(current);
        }
        let target = fs::read_link(&current)?;
        current = match current.parent() {
            Some(parent) if target.is_relative() => parent.join(target),
            _ => target,
        };
    }
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!("too many levels of symbolic links at {}", src.display()),
    ))
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            prepare_tree_for_overwrite(path)?;
            fs::remove_dir_all(path)
        }
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    if target.is_dir() {
        std::os::windows::fs::symlink_dir(target, link)
    } else {
        std::os::windows::fs::symlink_file(target, link)
    }
}

/// Make a file or directory tree read-only and world-readable.
pub fn write_protect_tree(top: &Path) -> io::Result<()> {
    set_permissions_recursively(top, FILE_READONLY_MODE, DIR_READONLY_MODE)
}

/// Make a file or directory tree writable by its owner and group.
pub fn prepare_tree_for_overwrite(top: &Path) -> io::Result<()> {
    set_permissions_recursively(top, FILE_OVERWRITE_MODE, DIR_OVERWRITE_MODE)
}

/// Symlinks are skipped; their targets keep their permissions.
fn set_permissions_recursively(top: &Path, file_mode: u32, dir_mode: u32) -> io::Result<()> {
    let meta = fs::symlink_metadata(top)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if !meta.is_dir() {
        return set_mode(top, file_mode);
    }

    for entry in WalkDir::new(top).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }
        let mode = if file_type.is_dir() { dir_mode } else { file_mode };
        set_mode(entry.path(), mode)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)
}
