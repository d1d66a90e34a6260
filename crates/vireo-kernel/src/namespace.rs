//! The `/`-rooted tree of named objects userland reaches through `get_obj`.
//! Conventional top-level prefixes are `$devices/`, `$files/`, `$gui/`.

use crate::error::{KernelError, KernelResult};
use crate::object::{DirectoryObject, Object, ObjectKind};
use crate::rights::Rights;
use std::collections::BTreeMap;
use std::sync::Arc;

enum NsNode {
    Dir(BTreeMap<String, NsNode>),
    Leaf(Arc<Object>, Rights),
}

/// `ns_init` / `ns_register` / `ns_unregister` / `ns_lookup`.
pub struct Namespace {
    root: NsNode,
}

impl Namespace {
    pub fn new() -> Self {
        Self { root: NsNode::Dir(BTreeMap::new()) }
    }

    fn split(path: &str) -> Vec<&str> {
        path.split('/').filter(|s| !s.is_empty()).collect()
    }

    /// `ns_register(path, object, max_rights)`: create any missing
    /// intermediate directories and bind `object` at the leaf, clipped to
    /// `max_rights` on every future lookup.
    pub fn register(&mut self, path: &str, object: Arc<Object>, max_rights: Rights) -> KernelResult<()> {
        let segments = Self::split(path);
        let Some((last, dirs)) = segments.split_last() else {
            return Err(KernelError::InvalidArgument);
        };

        let mut node = &mut self.root;
        for seg in dirs {
            let NsNode::Dir(children) = node else {
                return Err(KernelError::InvalidArgument);
            };
            node = children
                .entry(seg.to_string())
                .or_insert_with(|| NsNode::Dir(BTreeMap::new()));
        }

        let NsNode::Dir(children) = node else {
            return Err(KernelError::InvalidArgument);
        };
        children.insert(last.to_string(), NsNode::Leaf(object, max_rights));
        Ok(())
    }

    pub fn unregister(&mut self, path: &str) -> KernelResult<()> {
        let segments = Self::split(path);
        let Some((last, dirs)) = segments.split_last() else {
            return Err(KernelError::InvalidArgument);
        };
        let mut node = &mut self.root;
        for seg in dirs {
            let NsNode::Dir(children) = node else {
                return Err(KernelError::NotFound);
            };
            node = children.get_mut(*seg).ok_or(KernelError::NotFound)?;
        }
        let NsNode::Dir(children) = node else {
            return Err(KernelError::NotFound);
        };
        children.remove(*last).ok_or(KernelError::NotFound)?;
        Ok(())
    }

    /// `ns_lookup(path, rights)`: resolve to a leaf and return a handle-ready
    /// object plus rights clipped to the object's advertised maximum. A
    /// path resolving to an intermediate directory returns a synthesized
    /// directory object exposing that level's leaf children.
    pub fn lookup(&self, path: &str, requested_rights: Rights) -> KernelResult<(Arc<Object>, Rights)> {
        let segments = Self::split(path);
        let mut node = &self.root;
        for seg in &segments {
            let NsNode::Dir(children) = node else {
                return Err(KernelError::NotFound);
            };
            node = children.get(*seg).ok_or(KernelError::NotFound)?;
        }

        match node {
            NsNode::Leaf(object, max_rights) => Ok((object.clone(), requested_rights & *max_rights)),
            NsNode::Dir(children) => {
                let dir_children: Vec<(String, Arc<Object>)> = children
                    .iter()
                    .filter_map(|(name, child)| match child {
                        NsNode::Leaf(object, _) => Some((name.clone(), object.clone())),
                        NsNode::Dir(_) => None,
                    })
                    .collect();
                let dir = Arc::new(Object::new(ObjectKind::Directory(DirectoryObject {
                    name: segments.last().copied().unwrap_or("/").to_string(),
                    children: dir_children,
                })));
                Ok((dir, requested_rights))
            }
        }
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{DeviceObject, ObjectKind};

    fn device(name: &str) -> Arc<Object> {
        Arc::new(Object::new(ObjectKind::Device(DeviceObject {
            name: name.to_string(),
            contents: vec![1, 2, 3],
        })))
    }

    #[test]
    fn register_then_lookup_roundtrips() {
        let mut ns = Namespace::new();
        let dev = device("serial0");
        ns.register("$devices/serial0", dev.clone(), Rights::READ | Rights::WRITE).unwrap();

        let (found, rights) = ns.lookup("$devices/serial0", Rights::READ | Rights::WRITE | Rights::MAP).unwrap();
        assert!(Arc::ptr_eq(&found, &dev));
        assert_eq!(rights, Rights::READ | Rights::WRITE);
    }

    #[test]
    fn lookup_clips_rights_to_advertised_maximum() {
        let mut ns = Namespace::new();
        ns.register("$devices/serial0", device("serial0"), Rights::READ).unwrap();
        let (_, rights) = ns.lookup("$devices/serial0", Rights::READ | Rights::WRITE).unwrap();
        assert_eq!(rights, Rights::READ);
    }

    #[test]
    fn missing_path_not_found() {
        let ns = Namespace::new();
        assert_eq!(ns.lookup("$devices/nope", Rights::READ).unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn unregister_removes_leaf() {
        let mut ns = Namespace::new();
        ns.register("$files/a", device("a"), Rights::READ).unwrap();
        ns.unregister("$files/a").unwrap();
        assert!(ns.lookup("$files/a", Rights::READ).is_err());
    }
}
