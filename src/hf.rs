//! HuggingFace snapshot fetcher
//!
//! Resolves an `OWNER/REPO` reference to a set of local safetensors files,
//! downloading whatever the cache is missing. The cache mirrors the hub
//! layout (`models--OWNER--REPO/snapshots/REVISION/FILE`) so partially
//! fetched repositories resume cleanly.
//!
//! The client is blocking; callers inside an async runtime run it on a
//! blocking task.

use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{MedirError, Result};

const HUB_BASE: &str = "https://huggingface.co";
const REVISION: &str = "main";

/// A HuggingFace repository reference, `OWNER/REPO`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    /// Repository owner (user or organization)
    pub owner: String,
    /// Repository name
    pub repo: String,
}

impl FromStr for RepoRef {
    type Err = MedirError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || MedirError::Config {
            message: format!("expected OWNER/REPO, got '{s}'"),
        };
        let (owner, repo) = s.split_once('/').ok_or_else(bad)?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(bad());
        }
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Hub model info (internal)
#[derive(Debug, Deserialize)]
struct ModelInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Deserialize)]
struct Sibling {
    rfilename: String,
}

/// Blocking HuggingFace hub client with a local snapshot cache.
pub struct HubClient {
    http: reqwest::blocking::Client,
    token: Option<String>,
    cache_root: PathBuf,
}

impl HubClient {
    /// Create a client. `token` falls back to the `HF_TOKEN` environment
    /// variable; the cache root honors `MEDIR_CACHE` and defaults to the
    /// user cache directory.
    ///
    /// # Errors
    ///
    /// Returns [`MedirError::Config`] when no cache directory can be
    /// determined, [`MedirError::Http`] when the client cannot be built.
    pub fn new(token: Option<String>) -> Result<Self> {
        let cache_root = match std::env::var_os("MEDIR_CACHE") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::cache_dir()
                .ok_or_else(|| MedirError::Config {
                    message: "no cache directory available; set MEDIR_CACHE".to_string(),
                })?
                .join("medir"),
        };
        Self::with_cache_root(token, cache_root)
    }

    /// Create a client with an explicit cache root.
    ///
    /// # Errors
    ///
    /// Returns [`MedirError::Http`] when the client cannot be built.
    pub fn with_cache_root(token: Option<String>, cache_root: PathBuf) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("medir/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MedirError::Http {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        let token = token.or_else(|| std::env::var("HF_TOKEN").ok().filter(|t| !t.is_empty()));
        Ok(Self {
            http,
            token,
            cache_root,
        })
    }

    /// The local snapshot directory for one repository.
    #[must_use]
    pub fn snapshot_dir(&self, repo: &RepoRef) -> PathBuf {
        self.cache_root
            .join(format!("models--{}--{}", repo.owner, repo.repo))
            .join("snapshots")
            .join(REVISION)
    }

    fn get(&self, url: &str) -> reqwest::blocking::RequestBuilder {
        let mut req = self.http.get(url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// List the repository's files.
    ///
    /// # Errors
    ///
    /// Returns [`MedirError::Http`] on request or decode failure.
    pub fn list_files(&self, repo: &RepoRef) -> Result<Vec<String>> {
        let url = format!("{HUB_BASE}/api/models/{}/{}", repo.owner, repo.repo);
        let resp = self.get(&url).send().map_err(|e| MedirError::Http {
            message: format!("{repo}: {e}"),
        })?;
        if !resp.status().is_success() {
            return Err(MedirError::Http {
                message: format!("{repo}: listing failed with HTTP {}", resp.status()),
            });
        }
        let info: ModelInfo = resp.json().map_err(|e| MedirError::Http {
            message: format!("{repo}: invalid model info: {e}"),
        })?;
        Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
    }

    /// Ensure every repository file matching `glob` is present locally,
    /// downloading the missing ones. Returns the local paths.
    ///
    /// # Errors
    ///
    /// Returns [`MedirError::Config`] when nothing matches the glob,
    /// [`MedirError::Http`] or [`MedirError::Io`] on download failure.
    pub fn ensure_snapshot(&self, repo: &RepoRef, glob: &str) -> Result<Vec<PathBuf>> {
        let matching: Vec<String> = self
            .list_files(repo)?
            .into_iter()
            .filter(|f| glob_match(glob, f))
            .collect();
        if matching.is_empty() {
            return Err(MedirError::Config {
                message: format!("{repo}: no files match '{glob}'"),
            });
        }
        let snapshot = self.snapshot_dir(repo);
        let mut out = Vec::with_capacity(matching.len());
        for rfilename in matching {
            let target = snapshot.join(&rfilename);
            if target.is_file() {
                debug!(file = %rfilename, "cached");
            } else {
                self.download(repo, &rfilename, &target)?;
            }
            out.push(target);
        }
        Ok(out)
    }

    fn download(&self, repo: &RepoRef, rfilename: &str, target: &std::path::Path) -> Result<()> {
        let url = format!(
            "{HUB_BASE}/{}/{}/resolve/{REVISION}/{rfilename}",
            repo.owner, repo.repo
        );
        info!(file = %rfilename, "downloading");
        let mut resp = self.get(&url).send().map_err(|e| MedirError::Http {
            message: format!("{repo}/{rfilename}: {e}"),
        })?;
        if !resp.status().is_success() {
            return Err(MedirError::Http {
                message: format!("{repo}/{rfilename}: download failed with HTTP {}", resp.status()),
            });
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(MedirError::io)?;
        }
        // Download to a scratch name, rename once complete, so interrupted
        // transfers never masquerade as cached files.
        let partial = target.with_extension("part");
        let mut out = fs::File::create(&partial).map_err(MedirError::io)?;
        resp.copy_to(&mut out).map_err(|e| MedirError::Http {
            message: format!("{repo}/{rfilename}: {e}"),
        })?;
        fs::rename(&partial, target).map_err(MedirError::io)?;
        Ok(())
    }
}

/// Minimal glob matching: `*` matches any run, `?` any single byte.
#[must_use]
pub fn glob_match(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match p.split_first() {
            None => n.is_empty(),
            Some((b'*', rest)) => (0..=n.len()).any(|i| inner(rest, &n[i..])),
            Some((b'?', rest)) => !n.is_empty() && inner(rest, &n[1..]),
            Some((&c, rest)) => n.split_first().is_some_and(|(&d, nr)| c == d && inner(rest, nr)),
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_ref_parse() {
        let r: RepoRef = "meta-llama/Llama-3.2-1B".parse().expect("parse");
        assert_eq!(r.owner, "meta-llama");
        assert_eq!(r.repo, "Llama-3.2-1B");
        assert_eq!(r.to_string(), "meta-llama/Llama-3.2-1B");
    }

    #[test]
    fn test_repo_ref_rejects_malformed() {
        for bad in ["", "noslash", "/repo", "owner/", "a/b/c"] {
            assert!(bad.parse::<RepoRef>().is_err(), "{bad:?}");
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.safetensors", "model.safetensors"));
        assert!(glob_match("*.safetensors", "model-00001-of-00002.safetensors"));
        assert!(!glob_match("*.safetensors", "model.gguf"));
        assert!(glob_match("model-?????-of-?????.safetensors", "model-00001-of-00002.safetensors"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("", ""));
        assert!(!glob_match("", "x"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
    }

    #[test]
    fn test_snapshot_dir_layout() {
        let hub = HubClient::with_cache_root(None, PathBuf::from("/tmp/cache")).expect("client");
        let repo: RepoRef = "org/model".parse().expect("parse");
        assert_eq!(
            hub.snapshot_dir(&repo),
            PathBuf::from("/tmp/cache/models--org--model/snapshots/main")
        );
    }
}
