// Copyright 2024-2026 Gyre Engine Contributors
// Licensed under the Apache License, Version 2.0

//! Weight sources: local folders, the model hub and explicit URLs.
//!
//! Each source turns a descriptor into a directory of weights or a
//! [`SourceError`]. Network transfer itself is delegated to the
//! [`HubClient`] and [`UrlFetcher`] collaborators.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Component as PathComponent, Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;

use super::descriptor::{ConfigDescriptor, Fp16Policy};
use super::error::{ModelError, SourceError};
use super::patterns::filter_repo_objects;

/// Weight file extensions the hub may hold. Only one is downloaded.
const KNOWN_EXTENSIONS: [&str; 6] = ["ckpt", "bin", "pt", "safetensors", "msgpack", "h5"];

/// Name of the shared staging directory under the cache root.
pub const TEMP_DIR: &str = "temp";

/// File listing of a hub repository.
#[derive(Debug, Clone, Default)]
pub struct RepoInfo {
    pub files: Vec<String>,
    /// Whether every `.bin` in the repo has a `.safetensors` counterpart.
    pub safetensors_compatible: bool,
}

/// One snapshot download (or cache lookup when `local_only`).
#[derive(Debug, Clone, Default)]
pub struct SnapshotRequest {
    pub repo: String,
    pub revision: Option<String>,
    pub local_only: bool,
    pub allow_patterns: Vec<String>,
    pub ignore_patterns: Vec<String>,
    pub token: Option<String>,
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Revision {0} not found")]
    RevisionNotFound(String),
    #[error("Not found in cache: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

/// Remote model hub with a local snapshot cache.
pub trait HubClient: Send + Sync {
    fn model_info(
        &self,
        repo: &str,
        revision: Option<&str>,
        token: Option<&str>,
    ) -> Result<RepoInfo, HubError>;

    /// Return the local snapshot directory, downloading first unless
    /// `request.local_only`.
    fn snapshot_download(&self, request: &SnapshotRequest) -> Result<PathBuf, HubError>;

    /// Drop every cached revision of `repo`.
    fn evict_cache(&self, repo: &str) -> Result<(), HubError>;
}

/// Raw URL transfer.
pub trait UrlFetcher: Send + Sync {
    fn fetch(&self, url: &str, out: &mut dyn Write) -> std::io::Result<()>;
}

/// Hub client for hosts without hub access. Every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineHub;

impl HubClient for OfflineHub {
    fn model_info(&self, repo: &str, _: Option<&str>, _: Option<&str>) -> Result<RepoInfo, HubError> {
        Err(HubError::Other(format!("hub access is disabled ({repo})")))
    }

    fn snapshot_download(&self, request: &SnapshotRequest) -> Result<PathBuf, HubError> {
        Err(HubError::NotFound(request.repo.clone()))
    }

    fn evict_cache(&self, _: &str) -> Result<(), HubError> {
        Ok(())
    }
}

/// URL fetcher for hosts without network access.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineFetcher;

impl UrlFetcher for OfflineFetcher {
    fn fetch(&self, url: &str, _: &mut dyn Write) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            format!("network access is disabled ({url})"),
        ))
    }
}

/// Weight file format picked for a hub download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    Safetensors,
    Bin,
    Pt,
    Ckpt,
}

impl WeightFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            WeightFormat::Safetensors => "safetensors",
            WeightFormat::Bin => "bin",
            WeightFormat::Pt => "pt",
            WeightFormat::Ckpt => "ckpt",
        }
    }
}

/// Split `path` into (stem-with-directories, extension-with-dot).
fn split_ext(path: &str) -> (&str, &str) {
    let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => path.split_at(name_start + dot),
        _ => (path, ""),
    }
}

/// Choose one weight format from a filtered repo listing.
///
/// Returns the format plus extra ignore patterns for safetensors files that
/// merely shadow a same-named `.ckpt`.
pub fn select_weight_format(
    files: &[String],
    safe_only: bool,
    safetensors_compatible: bool,
) -> Result<(WeightFormat, Vec<String>), String> {
    let mut grouped: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for file in files {
        let (stem, ext) = split_ext(file);
        grouped.entry(ext).or_default().insert(stem);
    }

    let has = |ext: &str| grouped.contains_key(ext);
    let mut shadowed = Vec::new();

    let format = if safe_only {
        WeightFormat::Safetensors
    } else if has(".bin") {
        if has(".safetensors") && safetensors_compatible {
            if let (Some(ckpt), Some(safe)) = (grouped.get(".ckpt"), grouped.get(".safetensors")) {
                shadowed = ckpt
                    .intersection(safe)
                    .map(|stem| format!("{stem}.safetensors"))
                    .collect();
            }
            WeightFormat::Safetensors
        } else {
            WeightFormat::Bin
        }
    } else if has(".safetensors") {
        WeightFormat::Safetensors
    } else if has(".pt") {
        WeightFormat::Pt
    } else if has(".ckpt") {
        WeightFormat::Ckpt
    } else {
        return Err("Repo doesn't appear to contain any model files.".to_string());
    };

    Ok((format, shadowed))
}

/// Resolve weights from the hub (cache only when `local_only`).
pub fn hub_path(
    client: &dyn HubClient,
    desc: &ConfigDescriptor,
    fp16_mode: bool,
    token: Option<&str>,
    local_only: bool,
) -> Result<PathBuf, SourceError> {
    let repo = match desc.model_text() {
        Some(repo) if !repo.is_empty() => repo,
        _ => {
            return Err(SourceError::Unavailable(
                "No remote model name was provided".into(),
            ))
        }
    };

    fetch_from_hub(client, desc, repo, fp16_mode, token, local_only).map_err(|reason| {
        if local_only {
            SourceError::Unavailable(format!("Couldn't query local HuggingFace cache. {reason}"))
        } else {
            SourceError::Unavailable(format!("Downloading from HuggingFace failed. {reason}"))
        }
    })
}

/// Evict the hub cache for this repo, then fetch it fresh.
pub fn hub_forced_path(
    client: &dyn HubClient,
    desc: &ConfigDescriptor,
    fp16_mode: bool,
    token: Option<&str>,
) -> Result<PathBuf, SourceError> {
    let repo = match desc.model_text() {
        Some(repo) if !repo.is_empty() => repo,
        _ => {
            return Err(SourceError::Unavailable(
                "No remote model name was provided".into(),
            ))
        }
    };

    if let Err(e) = client.evict_cache(repo) {
        tracing::debug!(repo, error = %e, "Hub cache eviction failed");
    }

    hub_path(client, desc, fp16_mode, token, false)
}

fn fetch_from_hub(
    client: &dyn HubClient,
    desc: &ConfigDescriptor,
    repo: &str,
    fp16_mode: bool,
    token: Option<&str>,
    local_only: bool,
) -> Result<PathBuf, String> {
    let policy = desc.fp16().map_err(|e| e.to_string())?;
    let require_fp16 = fp16_mode && policy == Fp16Policy::Only;
    let mut prefer_fp16 = fp16_mode && policy == Fp16Policy::Auto;
    let mut has_fp16 = None;

    let token = if desc.use_auth_token() { token } else { None };
    let subfolder = desc.subfolder().map(|s| format!("{s}/")).unwrap_or_default();

    let mut ignore: Vec<String> = desc
        .ignore_patterns()
        .into_iter()
        .map(|p| format!("{subfolder}{p}"))
        .collect();
    let mut allow: Vec<String> = desc
        .allow_patterns()
        .into_iter()
        .map(|p| format!("{subfolder}{p}"))
        .collect();
    if !subfolder.is_empty() && allow.is_empty() {
        allow.push(format!("{subfolder}*"));
    }

    if !local_only {
        let mut info = None;
        if require_fp16 || prefer_fp16 {
            match client.model_info(repo, Some("fp16"), token) {
                Ok(found) => {
                    info = Some(found);
                    has_fp16 = Some(true);
                }
                Err(HubError::RevisionNotFound(e)) if require_fp16 => {
                    return Err(format!(
                        "fp16 for {} is set to 'only', but no fp16 available. {e}",
                        desc.human_id()
                    ));
                }
                Err(HubError::RevisionNotFound(_)) => {}
                Err(e) => return Err(e.to_string()),
            }
        }

        let info = match info {
            Some(info) => info,
            None => {
                has_fp16 = Some(false);
                prefer_fp16 = false;
                client.model_info(repo, None, token).map_err(|e| e.to_string())?
            }
        };

        let files = filter_repo_objects(&info.files, &allow, &ignore);
        let (format, shadowed) =
            select_weight_format(&files, desc.safe_only(), info.safetensors_compatible)
                .map_err(|e| format!("{e} ({repo})"))?;

        ignore.extend(shadowed);
        ignore.extend(
            KNOWN_EXTENSIONS
                .iter()
                .filter(|ext| **ext != format.extension())
                .map(|ext| format!("{subfolder}*.{ext}")),
        );
        tracing::debug!(repo, format = format.extension(), "Selected weight format");
    }

    let mut request = SnapshotRequest {
        repo: repo.to_string(),
        revision: None,
        local_only,
        allow_patterns: allow,
        ignore_patterns: ignore,
        token: token.map(str::to_string),
    };

    if require_fp16 || prefer_fp16 {
        request.revision = Some("fp16".to_string());
        match client.snapshot_download(&request) {
            Ok(base) => return Ok(join_subfolder(base, desc.subfolder())),
            Err(HubError::NotFound(_)) | Err(HubError::RevisionNotFound(_)) => {
                if has_fp16 == Some(true) {
                    return Err("HuggingFace reported FP16 model is available on query, but \
                                failed to provide it on download."
                        .to_string());
                }
                if require_fp16 {
                    return Err(format!(
                        "fp16 for {} is set to 'only', but no fp16 available.",
                        desc.human_id()
                    ));
                }
            }
            Err(e) => return Err(e.to_string()),
        }
        request.revision = None;
    }

    let base = client.snapshot_download(&request).map_err(|e| e.to_string())?;
    Ok(join_subfolder(base, desc.subfolder()))
}

fn join_subfolder(base: PathBuf, subfolder: Option<&str>) -> PathBuf {
    match subfolder {
        Some(sub) => base.join(sub),
        None => base,
    }
}

/// Cache id and file name → URL table for a descriptor's `urls` value.
pub fn url_manifest(urls: &Value) -> Result<(String, BTreeMap<String, String>), ModelError> {
    match urls {
        Value::String(url) => {
            let id = hex::encode(Sha256::digest(url.as_bytes()));
            let mut files = BTreeMap::new();
            files.insert(url_filename(url), url.clone());
            Ok((id, files))
        }
        Value::Object(map) => {
            let id = map
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| ModelError::Config("a urls map needs an explicit id".into()))?;
            let mut files = BTreeMap::new();
            for (name, url) in map.iter().filter(|(k, _)| k.as_str() != "id") {
                let url = url.as_str().ok_or_else(|| {
                    ModelError::Config(format!("url for {name} must be a string"))
                })?;
                files.insert(name.clone(), url.to_string());
            }
            Ok((id.to_string(), files))
        }
        other => Err(ModelError::Config(format!(
            "urls must be a string or a map, got {other}"
        ))),
    }
}

/// Last path segment of a URL, ignoring query and fragment.
fn url_filename(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let path = path.split_once('/').map(|(_, p)| p).unwrap_or("");
    path.rsplit('/').next().unwrap_or_default().to_string()
}

/// Resolve weights named by `urls`, downloading missing files unless
/// `local_only`.
pub fn url_path(
    fetcher: &dyn UrlFetcher,
    cache_root: &Path,
    desc: &ConfigDescriptor,
    local_only: bool,
) -> Result<PathBuf, SourceError> {
    let urls = match desc.urls() {
        Some(urls) if !urls.is_null() => urls,
        _ => return Err(SourceError::Unavailable("No URL was provided".into())),
    };

    let (id, files) = url_manifest(urls)?;
    let cache_path = cache_root.join(&id);
    let temp_path = cache_root.join(TEMP_DIR);

    if cache_path.is_dir() {
        let missing: Vec<&str> = files
            .keys()
            .filter(|name| !cache_path.join(name).is_file())
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            return Ok(cache_path);
        }
        if local_only {
            return Err(SourceError::Unavailable(format!(
                "Items missing from cache: {missing:?}"
            )));
        }
    } else if local_only {
        return Err(SourceError::Unavailable("No local cache for URL".into()));
    }

    std::fs::create_dir_all(&cache_path).map_err(ModelError::from)?;
    std::fs::create_dir_all(&temp_path).map_err(ModelError::from)?;

    for (name, url) in &files {
        let target = cache_path.join(name);
        if target.exists() {
            continue;
        }

        tracing::info!(url = %url, target = %target.display(), "Downloading weights");
        let mut staged = NamedTempFile::new_in(&temp_path).map_err(ModelError::from)?;
        fetcher
            .fetch(url, staged.as_file_mut())
            .map_err(ModelError::from)?;
        staged
            .persist(&target)
            .map_err(|e| ModelError::from(e.error))?;
    }

    Ok(cache_path)
}

/// Lexically normalise a path: drop `.` and fold `..` without touching the
/// filesystem.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            PathComponent::CurDir => {}
            PathComponent::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `local_model` (or `local_model_fp16`) under the weight root.
pub fn local_path(
    weight_root: &Path,
    desc: &ConfigDescriptor,
    fp16: bool,
) -> Result<PathBuf, SourceError> {
    let configured = if fp16 {
        desc.local_model_fp16()
    } else {
        desc.local_model().filter(|p| !p.is_empty()).map(str::to_string)
    };

    let configured = configured.ok_or_else(|| {
        SourceError::Unavailable("No local model field was provided".into())
    })?;

    let path = Path::new(&configured);
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        weight_root.join(path)
    };
    let path = normalize_path(&path);

    if !path.is_dir() {
        return Err(SourceError::Unavailable(format!(
            "Path '{}' isn't a directory",
            path.display()
        )));
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(files: &[&str]) -> Vec<String> {
        files.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_format_prefers_compatible_safetensors_over_bin() {
        let files = names(&["unet/model.bin", "unet/model.safetensors"]);
        let (format, shadowed) = select_weight_format(&files, false, true).unwrap();
        assert_eq!(format, WeightFormat::Safetensors);
        assert!(shadowed.is_empty());

        let (format, _) = select_weight_format(&files, false, false).unwrap();
        assert_eq!(format, WeightFormat::Bin);
    }

    #[test]
    fn test_format_ignores_safetensors_shadowing_ckpt() {
        let files = names(&["model.bin", "sd.ckpt", "sd.safetensors", "unet/x.safetensors"]);
        let (format, shadowed) = select_weight_format(&files, false, true).unwrap();
        assert_eq!(format, WeightFormat::Safetensors);
        assert_eq!(shadowed, vec!["sd.safetensors"]);
    }

    #[test]
    fn test_format_fallback_order() {
        assert_eq!(
            select_weight_format(&names(&["a.pt", "b.ckpt"]), false, false).unwrap().0,
            WeightFormat::Pt
        );
        assert_eq!(
            select_weight_format(&names(&["b.ckpt"]), false, false).unwrap().0,
            WeightFormat::Ckpt
        );
        assert_eq!(
            select_weight_format(&names(&["b.ckpt"]), true, false).unwrap().0,
            WeightFormat::Safetensors
        );
        assert!(select_weight_format(&names(&["README.md"]), false, false).is_err());
    }

    #[test]
    fn test_split_ext_handles_dotted_directories() {
        assert_eq!(split_ext("v1.5/model.bin"), ("v1.5/model", ".bin"));
        assert_eq!(split_ext("v1.5/README"), ("v1.5/README", ""));
        assert_eq!(split_ext(".hidden"), (".hidden", ""));
    }

    #[test]
    fn test_url_manifest_single_and_grouped() {
        let (id, files) = url_manifest(&json!("https://host/path/model.ckpt?dl=1")).unwrap();
        assert_eq!(id.len(), 64);
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["model.ckpt"]);

        let (id, files) = url_manifest(&json!({
            "id": "grouped",
            "a.bin": "https://host/a",
            "b.json": "https://host/b"
        }))
        .unwrap();
        assert_eq!(id, "grouped");
        assert_eq!(files.len(), 2);

        assert!(url_manifest(&json!({"a.bin": "https://host/a"})).is_err());
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(
            normalize_path(Path::new("/w/./a/../b")),
            PathBuf::from("/w/b")
        );
    }

    #[test]
    fn test_local_path_requires_directory() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("sd")).unwrap();

        let desc = ConfigDescriptor::from_value(json!({"id": "e", "local_model": "./sd"})).unwrap();
        assert_eq!(
            local_path(root.path(), &desc, false).unwrap(),
            normalize_path(&root.path().join("sd"))
        );

        let missing = local_path(root.path(), &desc, true).unwrap_err();
        assert!(missing.to_string().contains("isn't a directory"));

        let bare = ConfigDescriptor::from_value(json!({"id": "e"})).unwrap();
        assert!(matches!(
            local_path(root.path(), &bare, false),
            Err(SourceError::Unavailable(_))
        ));
    }
}
