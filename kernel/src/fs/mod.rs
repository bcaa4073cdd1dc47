//! Virtual filesystem layer.
//!
//! A fixed-capacity mount table maps path prefixes to filesystems; path
//! resolution starts at the root node and walks each component through the
//! directory's `readdir` operation, matching children by name. All file and
//! directory operations dispatch through the node's trait object.

pub mod ramfs;

use alloc::{string::String, sync::Arc, vec};

use spin::{Mutex, RwLock};

use crate::console;
use crate::error::KernelError;

pub const MAX_FILENAME: usize = 64;
pub const MAX_PATH: usize = 256;
pub const MAX_MOUNTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Regular,
    Directory,
}

/// Polymorphic node operations, one implementation per filesystem.
pub trait VfsNode: Send + Sync {
    fn name(&self) -> &str;
    fn node_type(&self) -> NodeType;
    fn size(&self) -> usize;
    fn parent(&self) -> Option<Arc<dyn VfsNode>>;

    fn open(&self) -> Result<(), KernelError> {
        Ok(())
    }

    fn close(&self) -> Result<(), KernelError> {
        Ok(())
    }

    /// Copy up to `buffer.len()` bytes of file content, from the start.
    fn read(&self, buffer: &mut [u8]) -> Result<usize, KernelError>;

    /// Replace the file content with `data`.
    fn write(&self, data: &[u8]) -> Result<usize, KernelError>;

    /// Create a child in this directory.
    fn create(&self, name: &str, kind: NodeType) -> Result<Arc<dyn VfsNode>, KernelError>;

    /// Unlink this node from its parent and free it.
    fn delete(&self) -> Result<(), KernelError>;

    /// Child at `index`, in a stable order given stable mutation.
    fn readdir(&self, index: usize) -> Option<Arc<dyn VfsNode>>;
}

/// A mountable filesystem back-end.
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &str;
    fn root(&self) -> Option<Arc<dyn VfsNode>>;
    fn mount(&self) -> Result<(), KernelError>;
    /// Must free every node the filesystem owns.
    fn unmount(&self) -> Result<(), KernelError>;
}

struct MountPoint {
    path: String,
    fs: Arc<dyn Filesystem>,
}

static MOUNTS: Mutex<[Option<MountPoint>; MAX_MOUNTS]> =
    Mutex::new([const { None }; MAX_MOUNTS]);

static ROOT: RwLock<Option<Arc<dyn VfsNode>>> = RwLock::new(None);

pub fn init() -> Result<(), KernelError> {
    *MOUNTS.lock() = [const { None }; MAX_MOUNTS];
    *ROOT.write() = None;
    Ok(())
}

/// Mount a filesystem at a path prefix. Mounting at "/" installs its root
/// as the resolution root.
pub fn mount(fs: Arc<dyn Filesystem>, path: &str) -> Result<(), KernelError> {
    if path.is_empty() || !path.starts_with('/') || path.len() >= MAX_PATH {
        return Err(KernelError::InvalidArgument);
    }

    let mut mounts = MOUNTS.lock();
    let slot = mounts
        .iter()
        .position(|m| m.is_none())
        .ok_or(KernelError::OutOfMemory)?;

    fs.mount()?;

    if path == "/" {
        *ROOT.write() = fs.root();
    }

    mounts[slot] = Some(MountPoint {
        path: String::from(path),
        fs,
    });
    Ok(())
}

/// Unmount the filesystem at `path`, freeing every node it owns.
pub fn unmount(path: &str) -> Result<(), KernelError> {
    let mut mounts = MOUNTS.lock();

    let slot = mounts
        .iter()
        .position(|m| m.as_ref().is_some_and(|m| m.path == path))
        .ok_or(KernelError::NotFound)?;

    if path == "/" {
        *ROOT.write() = None;
    }

    let mount_point = mounts[slot].take();
    drop(mounts);

    if let Some(mount_point) = mount_point {
        mount_point.fs.unmount()?;
    }
    Ok(())
}

/// Resolve an absolute path to a node by walking `readdir` per component.
pub fn resolve_path(path: &str) -> Option<Arc<dyn VfsNode>> {
    if !path.starts_with('/') {
        return None;
    }

    let mut current = ROOT.read().clone()?;
    if path == "/" {
        return Some(current);
    }

    for component in path.split('/').filter(|c| !c.is_empty()) {
        let mut found = None;
        let mut index = 0;
        while let Some(child) = current.readdir(index) {
            if child.name() == component {
                found = Some(child);
                break;
            }
            index += 1;
        }
        current = found?;
    }

    Some(current)
}

/// Final path component.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Directory part of a path; "/" when there is none.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

/// Resolve and open a node.
pub fn open(path: &str) -> Result<Arc<dyn VfsNode>, KernelError> {
    let node = resolve_path(path).ok_or(KernelError::NotFound)?;
    node.open()?;
    Ok(node)
}

pub fn close(node: &Arc<dyn VfsNode>) -> Result<(), KernelError> {
    node.close()
}

fn create_at(path: &str, kind: NodeType) -> Result<Arc<dyn VfsNode>, KernelError> {
    let name = basename(path);
    if name.is_empty() || name.len() >= MAX_FILENAME {
        return Err(KernelError::InvalidArgument);
    }

    let parent = resolve_path(dirname(path)).ok_or(KernelError::NotFound)?;
    if parent.node_type() != NodeType::Directory {
        return Err(KernelError::NotADirectory);
    }

    parent.create(name, kind)
}

/// Create a regular file at `path`. The parent directory must exist.
pub fn create_file(path: &str) -> Result<Arc<dyn VfsNode>, KernelError> {
    create_at(path, NodeType::Regular)
}

/// Create a directory at `path`. The parent directory must exist.
pub fn create_directory(path: &str) -> Result<Arc<dyn VfsNode>, KernelError> {
    create_at(path, NodeType::Directory)
}

/// Delete the node at `path`.
pub fn delete(path: &str) -> Result<(), KernelError> {
    let node = resolve_path(path).ok_or(KernelError::NotFound)?;
    node.delete()
}

/// Copy a regular file's content to a new (or existing) destination file.
pub fn copy_file(dest: &str, source: &str) -> Result<(), KernelError> {
    let src = resolve_path(source).ok_or(KernelError::NotFound)?;
    if src.node_type() != NodeType::Regular {
        return Err(KernelError::IsADirectory);
    }

    let mut buffer = vec![0u8; src.size()];
    let n = src.read(&mut buffer)?;

    let dst = match create_file(dest) {
        Ok(node) => node,
        Err(KernelError::AlreadyExists) => resolve_path(dest).ok_or(KernelError::NotFound)?,
        Err(err) => return Err(err),
    };
    dst.write(&buffer[..n])?;
    Ok(())
}

/// Print a directory listing (`ls`): directories in light blue with a
/// trailing slash, files with their size.
pub fn list(path: &str) -> Result<(), KernelError> {
    let dir = resolve_path(path).ok_or(KernelError::NotFound)?;
    if dir.node_type() != NodeType::Directory {
        return Err(KernelError::NotADirectory);
    }

    let mut index = 0;
    while let Some(child) = dir.readdir(index) {
        match child.node_type() {
            NodeType::Directory => {
                console::puts_color(child.name(), console::ColorAttr::new(
                    console::Color::LightBlue,
                    console::Color::Black,
                ));
                println!("/");
            }
            NodeType::Regular => {
                println!("{} {} bytes", child.name(), child.size());
            }
        }
        index += 1;
    }
    Ok(())
}

/// Recursive tree dump starting at `path`.
pub fn print_tree(path: &str) -> Result<(), KernelError> {
    let node = resolve_path(path).ok_or(KernelError::NotFound)?;
    print_tree_node(&node, 0);
    Ok(())
}

fn print_tree_node(node: &Arc<dyn VfsNode>, depth: usize) {
    for _ in 0..depth {
        print!("  ");
    }

    match node.node_type() {
        NodeType::Directory => {
            console::puts_color(node.name(), console::ColorAttr::new(
                console::Color::LightBlue,
                console::Color::Black,
            ));
            println!("/");

            let mut index = 0;
            while let Some(child) = node.readdir(index) {
                print_tree_node(&child, depth + 1);
                index += 1;
            }
        }
        NodeType::Regular => {
            println!("{}", node.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn path_helpers() {
        assert_eq!(basename("/tmp/a.txt"), "a.txt");
        assert_eq!(basename("/a"), "a");
        assert_eq!(dirname("/tmp/a.txt"), "/tmp");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("a"), "/");
    }
}
