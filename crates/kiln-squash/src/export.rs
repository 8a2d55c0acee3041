use crate::SquashError;
use kiln_schema::LayerId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// `repo -> tag -> layer id`, as stored in the export's `repositories` file.
pub type Repositories = BTreeMap<String, BTreeMap<String, String>>;

const REPOSITORIES_FILE: &str = "repositories";
const REPOSITORIES_JSON_FILE: &str = "repositories.json";
const LAYER_VERSION: &str = "1.0";

/// Command marker left on a layer produced by an earlier squash.
pub const SQUASH_MARKER: &str = "#(squash)";
/// Command of the layer that adds a base image's root filesystem.
pub const FROM_MARKER: &str = "#(nop) ADD file";

/// Per-layer `json` metadata. Fields this crate does not interpret are kept
/// verbatim in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub id: LayerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<LayerId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LayerConfig {
    fn container_config(&self) -> Option<&Map<String, Value>> {
        ["container_config", "ContainerConfig"]
            .iter()
            .find_map(|key| self.extra.get(*key))
            .and_then(Value::as_object)
    }

    /// The command that produced this layer, joined by spaces.
    pub fn command(&self) -> String {
        self.container_config()
            .and_then(|c| c.get("Cmd"))
            .and_then(Value::as_array)
            .map(|cmd| {
                cmd.iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default()
    }

    pub fn set_command(&mut self, cmd: &[&str]) {
        let key = if self.extra.contains_key("ContainerConfig") {
            "ContainerConfig"
        } else {
            "container_config"
        };
        let entry = self
            .extra
            .entry(key)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(config) = entry {
            config.insert(
                "Cmd".to_owned(),
                Value::Array(cmd.iter().map(|c| Value::String((*c).to_owned())).collect()),
            );
        }
    }
}

/// Split an image reference into repository and optional tag.
///
/// A colon followed by a `/` belongs to a registry port, not a tag.
pub fn split_tag(name: &str) -> (&str, Option<&str>) {
    match name.rfind(':') {
        Some(idx) if !name[idx + 1..].contains('/') => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}

/// Split `repo[:tag]` into its parts; the tag defaults to `latest`.
pub fn parse_tag(tag: &str) -> Result<(String, String), SquashError> {
    let (repo, tag_part) = match split_tag(tag) {
        (repo, Some(t)) => (repo, t),
        (repo, None) => (repo, "latest"),
    };
    if repo.is_empty() || tag_part.is_empty() {
        return Err(SquashError::BadTag(tag.to_owned()));
    }
    Ok((repo.to_owned(), tag_part.to_owned()))
}

pub fn validate_tag(tag: &str) -> Result<(), SquashError> {
    parse_tag(tag).map(|_| ())
}

/// An image export unpacked into a working directory, with its layers
/// ordered root first.
#[derive(Debug)]
pub struct Export {
    dir: PathBuf,
    layers: Vec<LayerConfig>,
    pub repositories: Repositories,
}

impl Export {
    /// Unpack `input` into `dir` and validate the layer chain.
    pub fn load<R: Read>(input: R, dir: &Path) -> Result<Self, SquashError> {
        fs::create_dir_all(dir)?;
        let mut archive = tar::Archive::new(input);
        archive.unpack(dir)?;

        let repositories = read_repositories(dir)?;
        for (repo, tags) in &repositories {
            let ids: BTreeSet<&String> = tags.values().collect();
            if ids.len() > 1 {
                return Err(SquashError::MultipleImages(repo.clone()));
            }
        }

        let mut configs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let json = entry.path().join("json");
            if !entry.file_type()?.is_dir() || !json.is_file() {
                continue;
            }
            let mut config: LayerConfig = serde_json::from_slice(&fs::read(&json)?)?;
            if config.parent.as_ref().is_some_and(|p| p.is_empty()) {
                config.parent = None;
            }
            configs.push(config);
        }

        let layers = order_chain(configs)?;
        debug!("loaded export with {} layers", layers.len());
        Ok(Self {
            dir: dir.to_path_buf(),
            layers,
            repositories,
        })
    }

    pub fn layers(&self) -> &[LayerConfig] {
        &self.layers
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Index of the layer with the given id or unique id prefix.
    pub fn position(&self, id: &str) -> Result<usize, SquashError> {
        if let Some(idx) = self.layers.iter().position(|l| l.id == id) {
            return Ok(idx);
        }
        let matches: Vec<usize> = self
            .layers
            .iter()
            .enumerate()
            .filter(|(_, l)| !id.is_empty() && l.id.starts_with(id))
            .map(|(i, _)| i)
            .collect();
        match matches.as_slice() {
            [idx] => Ok(*idx),
            _ => Err(SquashError::LayerNotFound(id.to_owned())),
        }
    }

    /// The last layer produced by an earlier squash.
    pub fn last_squash(&self) -> Option<usize> {
        self.layers
            .iter()
            .rposition(|l| l.command().contains(SQUASH_MARKER))
    }

    /// The first layer that adds a base image filesystem.
    pub fn first_from(&self) -> Option<usize> {
        self.layers
            .iter()
            .position(|l| l.command().contains(FROM_MARKER))
    }

    pub fn layer_dir(&self, id: &LayerId) -> PathBuf {
        self.dir.join(id.as_str())
    }

    pub fn layer_tar(&self, id: &LayerId) -> Result<PathBuf, SquashError> {
        let path = self.layer_dir(id).join("layer.tar");
        if path.is_file() {
            Ok(path)
        } else {
            Err(SquashError::MissingLayerFile {
                id: id.to_string(),
                file: "layer.tar",
            })
        }
    }

    /// Replace every layer after `point` with `layer`, whose content must
    /// already be in place under [`Export::layer_dir`].
    pub fn replace_descendants(&mut self, point: usize, layer: LayerConfig) {
        for dropped in self.layers.drain(point + 1..) {
            debug!("dropping merged layer {}", dropped.id.short());
        }
        self.layers.push(layer);
    }

    /// Point `repo:tag` at `id`, replacing every earlier tag of `repo`.
    pub fn set_tag(&mut self, repo: &str, tag: &str, id: &LayerId) {
        let mut tags = BTreeMap::new();
        tags.insert(tag.to_owned(), id.to_string());
        self.repositories.insert(repo.to_owned(), tags);
    }

    /// Serialise the chain in the daemon's load format, root first.
    pub fn write<W: Write>(&self, out: W) -> Result<W, SquashError> {
        let mut builder = tar::Builder::new(out);

        if !self.repositories.is_empty() {
            let data = serde_json::to_vec(&self.repositories)?;
            append_bytes(&mut builder, REPOSITORIES_FILE, &data)?;
        }

        for layer in &self.layers {
            let id = layer.id.as_str();
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_mode(0o755);
            header.set_size(0);
            builder.append_data(&mut header, format!("{id}/"), std::io::empty())?;

            append_bytes(&mut builder, &format!("{id}/VERSION"), LAYER_VERSION.as_bytes())?;
            append_bytes(
                &mut builder,
                &format!("{id}/json"),
                &serde_json::to_vec(layer)?,
            )?;

            let tar_path = self.layer_tar(&layer.id)?;
            let mut file = File::open(&tar_path)?;
            builder.append_file(format!("{id}/layer.tar"), &mut file)?;
        }

        Ok(builder.into_inner()?)
    }
}

fn append_bytes<W: Write>(
    builder: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> Result<(), SquashError> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_mode(0o644);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}

fn read_repositories(dir: &Path) -> Result<Repositories, SquashError> {
    for name in [REPOSITORIES_FILE, REPOSITORIES_JSON_FILE] {
        let path = dir.join(name);
        if path.is_file() {
            return Ok(serde_json::from_slice(&fs::read(&path)?)?);
        }
    }
    Ok(Repositories::new())
}

/// Order layers from the single root to the leaf. Branches are rejected.
fn order_chain(configs: Vec<LayerConfig>) -> Result<Vec<LayerConfig>, SquashError> {
    if configs.is_empty() {
        return Err(SquashError::EmptyExport);
    }

    let ids: BTreeSet<&str> = configs.iter().map(|c| c.id.as_str()).collect();
    let mut children: HashMap<&str, usize> = HashMap::new();
    let mut roots = Vec::new();
    for (idx, config) in configs.iter().enumerate() {
        match &config.parent {
            None => roots.push(idx),
            Some(parent) => {
                if !ids.contains(parent.as_str()) {
                    return Err(SquashError::MissingParent {
                        id: config.id.to_string(),
                        parent: parent.to_string(),
                    });
                }
                if children.insert(parent.as_str(), idx).is_some() {
                    return Err(SquashError::Branched(parent.to_string()));
                }
            }
        }
    }

    let [root] = roots.as_slice() else {
        return Err(SquashError::RootCount(roots.len()));
    };

    let mut order = vec![*root];
    while let Some(&next) = order
        .last()
        .and_then(|&last| children.get(configs[last].id.as_str()))
    {
        order.push(next);
    }
    if order.len() != configs.len() {
        return Err(SquashError::Unreachable(configs.len() - order.len()));
    }

    let mut slots: Vec<Option<LayerConfig>> = configs.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str, parent: Option<&str>, cmd: &str) -> LayerConfig {
        let mut c = LayerConfig {
            id: LayerId::new(id),
            parent: parent.map(LayerId::new),
            created: "2016-03-14T00:00:00Z".to_owned(),
            extra: Map::new(),
        };
        c.set_command(&["/bin/sh", "-c", cmd]);
        c
    }

    #[test]
    fn parse_tag_defaults_to_latest() {
        assert_eq!(
            parse_tag("myimage").unwrap(),
            ("myimage".to_owned(), "latest".to_owned())
        );
        assert_eq!(
            parse_tag("myimage:1.0").unwrap(),
            ("myimage".to_owned(), "1.0".to_owned())
        );
    }

    #[test]
    fn parse_tag_handles_registry_port() {
        assert_eq!(
            parse_tag("registry:5000/team/app").unwrap(),
            ("registry:5000/team/app".to_owned(), "latest".to_owned())
        );
        assert_eq!(
            parse_tag("registry:5000/team/app:v2").unwrap(),
            ("registry:5000/team/app".to_owned(), "v2".to_owned())
        );
    }

    #[test]
    fn split_tag_leaves_untagged_names() {
        assert_eq!(split_tag("app"), ("app", None));
        assert_eq!(split_tag("host:5000/app"), ("host:5000/app", None));
        assert_eq!(split_tag("host:5000/app:dev"), ("host:5000/app", Some("dev")));
    }

    #[test]
    fn bad_tags_rejected() {
        for tag in [":latest", "app:", ""] {
            assert!(
                matches!(parse_tag(tag), Err(SquashError::BadTag(_))),
                "{tag:?} should be rejected"
            );
        }
    }

    #[test]
    fn command_reads_either_config_key() {
        let c = config("a", None, "#(nop) ADD file:abc in /");
        assert_eq!(c.command(), "/bin/sh -c #(nop) ADD file:abc in /");

        let mut extra = Map::new();
        extra.insert(
            "ContainerConfig".to_owned(),
            serde_json::json!({"Cmd": ["echo", "hi"]}),
        );
        let c = LayerConfig {
            id: LayerId::new("b"),
            parent: None,
            created: String::new(),
            extra,
        };
        assert_eq!(c.command(), "echo hi");
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let json = r#"{"id":"aa","parent":"bb","created":"now","Size":12,"config":{"Env":["A=1"]}}"#;
        let c: LayerConfig = serde_json::from_str(json).unwrap();
        let back = serde_json::to_value(&c).unwrap();
        assert_eq!(back["Size"], 12);
        assert_eq!(back["config"]["Env"][0], "A=1");
        assert_eq!(back["parent"], "bb");
    }

    #[test]
    fn chain_ordered_from_root() {
        let layers = order_chain(vec![
            config("c", Some("b"), "run"),
            config("a", None, "base"),
            config("b", Some("a"), "run"),
        ])
        .unwrap();
        let ids: Vec<&str> = layers.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn branched_chain_rejected() {
        let err = order_chain(vec![
            config("a", None, "base"),
            config("b", Some("a"), "x"),
            config("c", Some("a"), "y"),
        ])
        .unwrap_err();
        assert!(matches!(err, SquashError::Branched(ref p) if p == "a"));
    }

    #[test]
    fn missing_parent_rejected() {
        let err = order_chain(vec![config("b", Some("ghost"), "x")]).unwrap_err();
        assert!(matches!(err, SquashError::MissingParent { .. }));
    }

    #[test]
    fn two_roots_rejected() {
        let err = order_chain(vec![config("a", None, "x"), config("b", None, "y")]).unwrap_err();
        assert!(matches!(err, SquashError::RootCount(2)));
    }

    #[test]
    fn empty_export_rejected() {
        assert!(matches!(order_chain(Vec::new()), Err(SquashError::EmptyExport)));
    }
}
