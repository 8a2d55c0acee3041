//! Union-filesystem merge of layer tars.
//!
//! Header metadata (mode, ownership, mtime, link targets) is kept in memory so
//! ownership survives without privileges; regular file bodies are spilled to
//! a working directory and streamed back when the merged layer is packed.

use crate::SquashError;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Prefix of a deletion marker: `.wh.<name>` hides `<name>` in lower layers.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Marks a directory as opaque: nothing from lower layers shows through.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file whose content was spilled to `body`.
    File { body: PathBuf, size: u64 },
    Directory,
    Symlink(String),
    HardLink(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
}

impl TreeEntry {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }
}

/// One layer's entries in archive order.
pub type LayerEntries = Vec<(String, TreeEntry)>;

/// Read a layer tar, spilling regular file bodies into `body_dir`.
///
/// Only regular files, directories, symlinks and hard links are accepted;
/// anything else (device nodes, FIFOs) is an error.
pub fn read_layer<R: Read>(reader: R, body_dir: &Path) -> Result<LayerEntries, SquashError> {
    fs::create_dir_all(body_dir)?;
    let mut archive = tar::Archive::new(reader);
    let mut entries = Vec::new();
    let mut spilled = 0usize;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.to_string_lossy().into_owned();
        let entry_type = entry.header().entry_type();
        if entry_type == tar::EntryType::XGlobalHeader {
            continue;
        }
        let Some(path) = normalize_path(&raw_path) else {
            continue;
        };

        let link_target = || -> Result<String, SquashError> {
            Ok(entry
                .link_name()?
                .map(|l| l.to_string_lossy().into_owned())
                .unwrap_or_default())
        };
        let kind = match entry_type {
            tar::EntryType::Regular | tar::EntryType::Continuous => None,
            tar::EntryType::Directory => Some(EntryKind::Directory),
            tar::EntryType::Symlink => Some(EntryKind::Symlink(link_target()?)),
            tar::EntryType::Link => Some(EntryKind::HardLink(
                normalize_path(&link_target()?).unwrap_or_default(),
            )),
            other => {
                return Err(SquashError::InvalidEntryType {
                    path,
                    kind: format!("{other:?}"),
                })
            }
        };

        let header = entry.header();
        let mode = header.mode()?;
        let uid = header.uid()?;
        let gid = header.gid()?;
        let mtime = header.mtime()?;

        let kind = match kind {
            Some(kind) => kind,
            None => {
                let body = body_dir.join(format!("{spilled:08}"));
                spilled += 1;
                let mut file = File::create(&body)?;
                let size = io::copy(&mut entry, &mut file)?;
                EntryKind::File { body, size }
            }
        };

        entries.push((
            path,
            TreeEntry {
                kind,
                mode,
                uid,
                gid,
                mtime,
            },
        ));
    }

    Ok(entries)
}

/// Strip `./`, leading and trailing slashes. The archive root maps to `None`.
fn normalize_path(raw: &str) -> Option<String> {
    let mut path = raw;
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    let path = path.trim_start_matches('/').trim_end_matches('/');
    if path.is_empty() || path == "." {
        None
    } else {
        Some(path.to_owned())
    }
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_owned()
    } else {
        format!("{parent}/{name}")
    }
}

/// Accumulated file tree of a range of layers, keyed by relative path.
#[derive(Debug, Default)]
pub struct LayerTree {
    entries: BTreeMap<String, TreeEntry>,
}

impl LayerTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay one layer onto the tree.
    ///
    /// Markers are processed first so that an opaque marker only hides
    /// content from earlier layers, never siblings added by the same layer.
    /// Markers themselves stay in the tree so the merged layer still masks
    /// content below it.
    pub fn apply(&mut self, layer: LayerEntries) {
        for (path, _) in &layer {
            let (parent, name) = split_parent(path);
            if name == OPAQUE_MARKER {
                debug!("opaque directory '{parent}'");
                self.remove_children(parent);
            } else if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                self.remove_path(&join(parent, hidden));
            }
        }

        for (path, entry) in layer {
            let (parent, name) = split_parent(&path);
            if !name.starts_with(WHITEOUT_PREFIX) {
                self.entries
                    .remove(&join(parent, &format!("{WHITEOUT_PREFIX}{name}")));
                if !entry.is_dir() {
                    self.remove_children(&path);
                }
            }
            let entry = self.resolve_hard_link(entry);
            self.entries.insert(path, entry);
        }
    }

    /// Hard links become copies of their target when the target is a file
    /// already in the tree; the target may not survive later whiteouts.
    fn resolve_hard_link(&self, entry: TreeEntry) -> TreeEntry {
        let EntryKind::HardLink(target) = &entry.kind else {
            return entry;
        };
        match self.entries.get(target) {
            Some(TreeEntry {
                kind: kind @ EntryKind::File { .. },
                ..
            }) => TreeEntry {
                kind: kind.clone(),
                ..entry
            },
            _ => entry,
        }
    }

    fn remove_path(&mut self, path: &str) {
        let prefix = format!("{path}/");
        self.entries
            .retain(|k, _| k != path && !k.starts_with(&prefix));
    }

    fn remove_children(&mut self, dir: &str) {
        if dir.is_empty() {
            self.entries.clear();
            return;
        }
        let prefix = format!("{dir}/");
        self.entries.retain(|k, _| !k.starts_with(&prefix));
    }

    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the tree as a layer tar. Entries are emitted in path order,
    /// which places every directory before its contents.
    pub fn pack<W: Write>(&self, out: W) -> Result<W, SquashError> {
        let mut builder = tar::Builder::new(out);
        builder.follow_symlinks(false);

        for (path, entry) in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_mode(entry.mode);
            header.set_uid(entry.uid);
            header.set_gid(entry.gid);
            header.set_mtime(entry.mtime);

            match &entry.kind {
                EntryKind::File { body, size } => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(*size);
                    builder.append_data(&mut header, path, File::open(body)?)?;
                }
                EntryKind::Directory => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_size(0);
                    builder.append_data(&mut header, format!("{path}/"), io::empty())?;
                }
                EntryKind::Symlink(target) => {
                    header.set_entry_type(tar::EntryType::Symlink);
                    header.set_size(0);
                    builder.append_link(&mut header, path, target)?;
                }
                EntryKind::HardLink(target) => {
                    header.set_entry_type(tar::EntryType::Link);
                    header.set_size(0);
                    builder.append_link(&mut header, path, target)?;
                }
            }
        }

        Ok(builder.into_inner()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum Fixture<'a> {
        File(&'a str, &'a str),
        Dir(&'a str),
        Link(&'a str, &'a str),
    }

    fn layer_tar(entries: &[Fixture<'_>]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for entry in entries {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_uid(1000);
            header.set_gid(1000);
            header.set_mtime(1_700_000_000);
            match entry {
                Fixture::File(path, content) => {
                    header.set_entry_type(tar::EntryType::Regular);
                    header.set_size(content.len() as u64);
                    builder
                        .append_data(&mut header, path, content.as_bytes())
                        .unwrap();
                }
                Fixture::Dir(path) => {
                    header.set_entry_type(tar::EntryType::Directory);
                    header.set_mode(0o755);
                    header.set_size(0);
                    builder.append_data(&mut header, path, io::empty()).unwrap();
                }
                Fixture::Link(path, target) => {
                    header.set_entry_type(tar::EntryType::Link);
                    header.set_size(0);
                    builder.append_link(&mut header, path, target).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    fn read(dir: &Path, name: &str, entries: &[Fixture<'_>]) -> LayerEntries {
        read_layer(layer_tar(entries).as_slice(), &dir.join(name)).unwrap()
    }

    fn content(tree: &LayerTree, path: &str) -> String {
        match &tree.get(path).unwrap().kind {
            EntryKind::File { body, .. } => fs::read_to_string(body).unwrap(),
            other => panic!("{path} is not a file: {other:?}"),
        }
    }

    #[test]
    fn normalize_strips_prefixes() {
        assert_eq!(normalize_path("./etc/hosts"), Some("etc/hosts".to_owned()));
        assert_eq!(normalize_path("/usr/"), Some("usr".to_owned()));
        assert_eq!(normalize_path("./"), None);
        assert_eq!(normalize_path("."), None);
    }

    #[test]
    fn later_layer_overwrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = LayerTree::new();
        tree.apply(read(dir.path(), "l1", &[Fixture::Dir("etc/"), Fixture::File("etc/motd", "one")]));
        tree.apply(read(dir.path(), "l2", &[Fixture::File("etc/motd", "two")]));
        assert_eq!(content(&tree, "etc/motd"), "two");
        assert!(tree.get("etc").unwrap().is_dir());
    }

    #[test]
    fn whiteout_removes_path_and_keeps_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = LayerTree::new();
        tree.apply(read(
            dir.path(),
            "l1",
            &[
                Fixture::Dir("tmp/"),
                Fixture::Dir("tmp/cache/"),
                Fixture::File("tmp/cache/a", "a"),
                Fixture::File("tmp/keep", "k"),
            ],
        ));
        tree.apply(read(dir.path(), "l2", &[Fixture::File("tmp/.wh.cache", "")]));
        assert!(!tree.contains("tmp/cache"));
        assert!(!tree.contains("tmp/cache/a"));
        assert!(tree.contains("tmp/keep"));
        assert!(tree.contains("tmp/.wh.cache"));
    }

    #[test]
    fn readding_path_drops_its_marker() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = LayerTree::new();
        tree.apply(read(dir.path(), "l1", &[Fixture::File(".wh.app", "")]));
        tree.apply(read(dir.path(), "l2", &[Fixture::File("app", "new")]));
        assert!(!tree.contains(".wh.app"));
        assert_eq!(content(&tree, "app"), "new");
    }

    #[test]
    fn opaque_marker_hides_only_earlier_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = LayerTree::new();
        tree.apply(read(
            dir.path(),
            "l1",
            &[Fixture::Dir("var/"), Fixture::File("var/old", "o")],
        ));
        tree.apply(read(
            dir.path(),
            "l2",
            &[
                Fixture::Dir("var/"),
                Fixture::File("var/.wh..wh..opq", ""),
                Fixture::File("var/new", "n"),
            ],
        ));
        assert!(!tree.contains("var/old"));
        assert!(tree.contains("var/new"));
        assert!(tree.contains("var/.wh..wh..opq"));
    }

    #[test]
    fn file_replacing_directory_drops_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = LayerTree::new();
        tree.apply(read(
            dir.path(),
            "l1",
            &[Fixture::Dir("opt/"), Fixture::File("opt/tool", "t")],
        ));
        tree.apply(read(dir.path(), "l2", &[Fixture::File("opt", "flat")]));
        assert!(!tree.contains("opt/tool"));
        assert_eq!(content(&tree, "opt"), "flat");
    }

    #[test]
    fn hard_link_resolved_to_file_copy() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = LayerTree::new();
        tree.apply(read(
            dir.path(),
            "l1",
            &[Fixture::File("bin/a", "payload"), Fixture::Link("bin/b", "bin/a")],
        ));
        tree.apply(read(dir.path(), "l2", &[Fixture::File("bin/.wh.a", "")]));
        assert!(!tree.contains("bin/a"));
        assert_eq!(content(&tree, "bin/b"), "payload");
    }

    #[test]
    fn device_nodes_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Char);
        header.set_size(0);
        header.set_mode(0o600);
        builder
            .append_data(&mut header, "dev/null", io::empty())
            .unwrap();
        let data = builder.into_inner().unwrap();

        let err = read_layer(data.as_slice(), dir.path()).unwrap_err();
        assert!(matches!(err, SquashError::InvalidEntryType { ref path, .. } if path == "dev/null"));
    }

    #[test]
    fn pack_preserves_ownership_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut tree = LayerTree::new();
        tree.apply(read(
            dir.path(),
            "l1",
            &[Fixture::File("srv/data", "x"), Fixture::Dir("srv/")],
        ));
        let packed = tree.pack(Vec::new()).unwrap();

        let mut archive = tar::Archive::new(packed.as_slice());
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            assert_eq!(entry.header().uid().unwrap(), 1000);
            assert_eq!(entry.header().mtime().unwrap(), 1_700_000_000);
            let path = entry.path().unwrap().to_string_lossy().into_owned();
            seen.push(path.trim_end_matches('/').to_owned());
        }
        assert_eq!(seen, vec!["srv", "srv/data"]);
    }
}
