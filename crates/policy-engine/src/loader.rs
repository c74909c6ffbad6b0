use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use serde_json::Value;
use tracing::debug;

use crate::errors::PolicyError;
use crate::store::StorePath;

const REGO_EXTENSION: &str = "rego";
const DATA_FILE: &str = "data.json";

#[derive(Clone, Debug, PartialEq)]
pub struct PolicySource {
    pub name: String,
    pub rego: String,
}

impl PolicySource {
    pub fn new(name: impl Into<String>, rego: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rego: rego.into(),
        }
    }
}

/// JSON document to be mounted into the store at `path`.
#[derive(Clone, Debug, PartialEq)]
pub struct DataDocument {
    pub path: StorePath,
    pub value: Value,
}

#[derive(Clone, Debug, Default)]
pub struct LoadedSources {
    pub policies: Vec<PolicySource>,
    pub data: Vec<DataDocument>,
}

impl LoadedSources {
    pub(crate) fn extend(&mut self, other: LoadedSources) {
        self.policies.extend(other.policies);
        self.data.extend(other.data);
    }
}

/// Reads `.rego` files, and `data.json` documents found inside directories.
/// A `.json` file named explicitly is mounted at the root of the store.
pub fn read_sources(paths: &[PathBuf]) -> Result<LoadedSources, PolicyError> {
    let mut loaded = LoadedSources::default();
    for path in paths {
        let metadata = fs::metadata(path)
            .map_err(|err| PolicyError::Io(format!("{}: {err}", path.display())))?;
        if metadata.is_dir() {
            loaded.extend(read_directory(path)?);
        } else if has_extension(path, "json") {
            loaded.data.push(DataDocument {
                path: StorePath::root(),
                value: parse_json(path, &fs::read_to_string(path)?)?,
            });
        } else {
            loaded
                .policies
                .push(PolicySource::new(display_name(path), fs::read_to_string(path)?));
        }
    }
    if loaded.policies.is_empty() {
        let joined = paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(PolicyError::NoSources(joined));
    }
    Ok(loaded)
}

/// Reads a bundle from a directory or a gzip-compressed tarball.
pub fn read_bundle(path: &Path) -> Result<LoadedSources, PolicyError> {
    let loaded = if path.is_dir() {
        read_directory(path)?
    } else if is_tarball(path) {
        read_tarball(path)?
    } else {
        return Err(PolicyError::Bundle(format!(
            "{}: expected a directory or .tar.gz archive",
            path.display()
        )));
    };
    if loaded.policies.is_empty() {
        return Err(PolicyError::NoSources(path.display().to_string()));
    }
    debug!(
        bundle = %path.display(),
        policies = loaded.policies.len(),
        documents = loaded.data.len(),
        "bundle read"
    );
    Ok(loaded)
}

fn read_directory(root: &Path) -> Result<LoadedSources, PolicyError> {
    let mut files = Vec::new();
    collect_files(root, &mut files)?;
    files.sort();

    let mut loaded = LoadedSources::default();
    for file in files {
        let relative = file.strip_prefix(root).unwrap_or(&file).to_path_buf();
        let contents = fs::read_to_string(&file)?;
        classify(&relative, &file.display().to_string(), contents, &mut loaded)?;
    }
    Ok(loaded)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), PolicyError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn read_tarball(path: &Path) -> Result<LoadedSources, PolicyError> {
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut entries = Vec::new();
    for entry in archive
        .entries()
        .map_err(|err| PolicyError::Bundle(format!("{}: {err}", path.display())))?
    {
        let mut entry =
            entry.map_err(|err| PolicyError::Bundle(format!("{}: {err}", path.display())))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .map_err(|err| PolicyError::Bundle(format!("{}: {err}", path.display())))?
            .into_owned();
        let mut contents = String::new();
        entry.read_to_string(&mut contents)?;
        entries.push((relative, contents));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    let mut loaded = LoadedSources::default();
    for (relative, contents) in entries {
        let origin = format!("{}:{}", path.display(), relative.display());
        classify(&relative, &origin, contents, &mut loaded)?;
    }
    Ok(loaded)
}

fn classify(
    relative: &Path,
    origin: &str,
    contents: String,
    loaded: &mut LoadedSources,
) -> Result<(), PolicyError> {
    if has_extension(relative, REGO_EXTENSION) {
        loaded.policies.push(PolicySource::new(origin, contents));
    } else if relative.file_name().and_then(|n| n.to_str()) == Some(DATA_FILE) {
        let value = parse_json(Path::new(origin), &contents)?;
        loaded.data.push(DataDocument {
            path: mount_point(relative)?,
            value,
        });
    }
    Ok(())
}

/// `a/b/data.json` is mounted at `/a/b`.
fn mount_point(relative: &Path) -> Result<StorePath, PolicyError> {
    let mut segments = Vec::new();
    if let Some(parent) = relative.parent() {
        for component in parent.components() {
            match component {
                Component::Normal(part) => segments.push(part.to_string_lossy().into_owned()),
                Component::CurDir | Component::RootDir => {}
                _ => {
                    return Err(PolicyError::Bundle(format!(
                        "data path escapes bundle root: {}",
                        relative.display()
                    )))
                }
            }
        }
    }
    StorePath::parse(&segments.join("/"))
}

fn parse_json(path: &Path, contents: &str) -> Result<Value, PolicyError> {
    serde_json::from_str(contents)
        .map_err(|err| PolicyError::Bundle(format!("{}: {err}", path.display())))
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ext)
}

pub fn is_tarball(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

fn display_name(path: &Path) -> String {
    path.display().to_string()
}
