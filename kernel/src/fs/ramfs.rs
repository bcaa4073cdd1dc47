//! RAM filesystem.
//!
//! Nodes form a first-child/next-sibling tree: the child and sibling links
//! are owning (`Arc`) and the parent back-pointer is a non-owning `Weak`,
//! so dropping the root releases the whole tree. File content is an owned
//! byte buffer that `write` replaces wholesale.

use alloc::{
    string::String,
    sync::{Arc, Weak},
    vec::Vec,
};

use spin::RwLock;

use super::{Filesystem, NodeType, VfsNode};
use crate::error::KernelError;

struct RamNode {
    name: String,
    kind: NodeType,
    /// File content; `None` for directories.
    data: RwLock<Option<Vec<u8>>>,
    parent: RwLock<Weak<RamNode>>,
    first_child: RwLock<Option<Arc<RamNode>>>,
    next_sibling: RwLock<Option<Arc<RamNode>>>,
    self_weak: Weak<RamNode>,
}

impl RamNode {
    fn new(name: &str, kind: NodeType, parent: Weak<RamNode>) -> Arc<RamNode> {
        Arc::new_cyclic(|weak| RamNode {
            name: String::from(name),
            kind,
            data: RwLock::new(match kind {
                NodeType::Regular => Some(Vec::new()),
                NodeType::Directory => None,
            }),
            parent: RwLock::new(parent),
            first_child: RwLock::new(None),
            next_sibling: RwLock::new(None),
            self_weak: weak.clone(),
        })
    }

    /// Find a child by name along the sibling chain.
    fn find_child(&self, name: &str) -> Option<Arc<RamNode>> {
        let mut cursor = self.first_child.read().clone();
        while let Some(node) = cursor {
            if node.name == name {
                return Some(node);
            }
            cursor = node.next_sibling.read().clone();
        }
        None
    }
}

impl VfsNode for RamNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn node_type(&self) -> NodeType {
        self.kind
    }

    fn size(&self) -> usize {
        self.data.read().as_ref().map_or(0, Vec::len)
    }

    fn parent(&self) -> Option<Arc<dyn VfsNode>> {
        let parent = self.parent.read().upgrade()?;
        Some(parent as Arc<dyn VfsNode>)
    }

    fn read(&self, buffer: &mut [u8]) -> Result<usize, KernelError> {
        if self.kind != NodeType::Regular {
            return Err(KernelError::IsADirectory);
        }

        let data = self.data.read();
        let Some(content) = data.as_ref() else {
            return Ok(0);
        };

        let to_read = buffer.len().min(content.len());
        buffer[..to_read].copy_from_slice(&content[..to_read]);
        Ok(to_read)
    }

    fn write(&self, data: &[u8]) -> Result<usize, KernelError> {
        if self.kind != NodeType::Regular {
            return Err(KernelError::IsADirectory);
        }

        // The buffer is reallocated to exactly the written size.
        *self.data.write() = Some(Vec::from(data));
        Ok(data.len())
    }

    fn create(&self, name: &str, kind: NodeType) -> Result<Arc<dyn VfsNode>, KernelError> {
        if self.kind != NodeType::Directory {
            return Err(KernelError::NotADirectory);
        }
        if self.find_child(name).is_some() {
            return Err(KernelError::AlreadyExists);
        }

        let node = RamNode::new(name, kind, self.self_weak.clone());

        // Prepend to the child list.
        let mut first = self.first_child.write();
        *node.next_sibling.write() = first.take();
        *first = Some(node.clone());

        Ok(node as Arc<dyn VfsNode>)
    }

    fn delete(&self) -> Result<(), KernelError> {
        let parent = self
            .parent
            .read()
            .upgrade()
            .ok_or(KernelError::PermissionDenied)?;
        let me = self.self_weak.upgrade().ok_or(KernelError::NotFound)?;

        let successor = self.next_sibling.write().take();

        // Unlink from the parent's sibling chain.
        let mut unlinked = false;
        {
            let mut first = parent.first_child.write();
            if let Some(head) = first.as_ref() {
                if Arc::ptr_eq(head, &me) {
                    *first = successor.clone();
                    unlinked = true;
                }
            }
        }
        if !unlinked {
            let mut cursor = parent.first_child.read().clone();
            while let Some(node) = cursor {
                let next = node.next_sibling.read().clone();
                if let Some(next_node) = next.as_ref() {
                    if Arc::ptr_eq(next_node, &me) {
                        *node.next_sibling.write() = successor;
                        unlinked = true;
                        break;
                    }
                }
                cursor = next;
            }
        }

        if !unlinked {
            return Err(KernelError::NotFound);
        }

        *self.data.write() = None;
        Ok(())
    }

    fn readdir(&self, index: usize) -> Option<Arc<dyn VfsNode>> {
        if self.kind != NodeType::Directory {
            return None;
        }

        let mut cursor = self.first_child.read().clone();
        let mut current = 0;
        while let Some(node) = cursor {
            if current == index {
                return Some(node as Arc<dyn VfsNode>);
            }
            cursor = node.next_sibling.read().clone();
            current += 1;
        }
        None
    }
}

/// The RAM filesystem instance.
pub struct RamFs {
    root: RwLock<Option<Arc<RamNode>>>,
}

impl RamFs {
    pub fn new() -> Arc<RamFs> {
        Arc::new(RamFs {
            root: RwLock::new(None),
        })
    }
}

impl Filesystem for RamFs {
    fn name(&self) -> &str {
        "ramfs"
    }

    fn root(&self) -> Option<Arc<dyn VfsNode>> {
        let root = self.root.read().clone()?;
        Some(root as Arc<dyn VfsNode>)
    }

    fn mount(&self) -> Result<(), KernelError> {
        *self.root.write() = Some(RamNode::new("/", NodeType::Directory, Weak::new()));
        Ok(())
    }

    fn unmount(&self) -> Result<(), KernelError> {
        // The owning child/sibling links cascade: dropping the root frees
        // every node of the tree.
        *self.root.write() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::fs::{self, NodeType};

    fn fresh_root() -> Arc<dyn VfsNode> {
        let fs = RamFs::new();
        fs.mount().unwrap();
        fs.root().unwrap()
    }

    #[test_case]
    fn create_then_read_back() {
        let root = fresh_root();
        let file = root.create("a.txt", NodeType::Regular).unwrap();
        assert_eq!(file.node_type(), NodeType::Regular);

        file.write(b"hello").unwrap();
        assert_eq!(file.size(), 5);

        let mut buffer = [0u8; 16];
        let n = file.read(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"hello");
    }

    #[test_case]
    fn duplicate_names_are_rejected() {
        let root = fresh_root();
        root.create("x", NodeType::Regular).unwrap();
        assert!(matches!(
            root.create("x", NodeType::Directory),
            Err(KernelError::AlreadyExists)
        ));
    }

    #[test_case]
    fn delete_leaves_directory_empty() {
        let root = fresh_root();
        let dir = root.create("d", NodeType::Directory).unwrap();
        let file = dir.create("x", NodeType::Regular).unwrap();

        file.delete().unwrap();
        assert!(dir.readdir(0).is_none());
        // The directory itself is still reachable.
        assert_eq!(root.readdir(0).unwrap().name(), "d");
    }

    #[test_case]
    fn readdir_walks_siblings_in_order() {
        let root = fresh_root();
        root.create("one", NodeType::Regular).unwrap();
        root.create("two", NodeType::Regular).unwrap();

        // Creation prepends, so the newest child comes first.
        assert_eq!(root.readdir(0).unwrap().name(), "two");
        assert_eq!(root.readdir(1).unwrap().name(), "one");
        assert!(root.readdir(2).is_none());
    }

    #[test_case]
    fn root_cannot_be_deleted() {
        let root = fresh_root();
        assert!(matches!(root.delete(), Err(KernelError::PermissionDenied)));
    }

    #[test_case]
    fn unmount_frees_every_node() {
        let fs = RamFs::new();
        fs.mount().unwrap();
        let root = fs.root().unwrap();
        let dir = root.create("d", NodeType::Directory).unwrap();
        let file = dir.create("x", NodeType::Regular).unwrap();
        file.write(b"payload").unwrap();

        let probe = Arc::downgrade(&dir);
        drop(dir);
        drop(file);
        drop(root);

        fs.unmount().unwrap();
        // Every node was released: the weak probe no longer upgrades.
        assert!(probe.upgrade().is_none());
    }

    #[test_case]
    fn resolves_through_the_vfs() {
        fs::init().unwrap();
        let ram = RamFs::new();
        fs::mount(ram, "/").unwrap();

        fs::create_directory("/tmp").unwrap();
        fs::create_file("/tmp/a.txt").unwrap();

        let node = fs::resolve_path("/tmp/a.txt").unwrap();
        node.write(b"hello").unwrap();

        let mut buffer = [0u8; 8];
        let n = fs::open("/tmp/a.txt").unwrap().read(&mut buffer).unwrap();
        assert_eq!(&buffer[..n], b"hello");

        fs::delete("/tmp/a.txt").unwrap();
        assert!(fs::resolve_path("/tmp/a.txt").is_none());
        assert!(fs::resolve_path("/tmp").is_some());

        fs::unmount("/").unwrap();
    }
}
