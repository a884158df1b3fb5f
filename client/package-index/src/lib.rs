//! APT `Packages` index.
//!
//! Maps repository URL paths and content fingerprints to package
//! metadata. The proxy feeds `Packages` files it proxies through
//! [`PackageIndex::ingest`]; lookups answer "what are the expected hash
//! and size of the `.deb` behind this URL".

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use dsc_common::{ContentFingerprint, PackageMeta};

const LOG_TARGET: &str = "package-index";

/// Lookup surface the proxy drives. Implementations are internally
/// synchronized; lookups take only shared access.
pub trait PackageIndex: Send + Sync + 'static {
    /// Resolve a repository URL path (host and leading slash already
    /// stripped or not, both accepted) to package metadata by matching
    /// the indexed `Filename` as a path suffix.
    fn lookup_by_url_path(&self, path: &str) -> Option<PackageMeta>;

    fn lookup_by_hash(&self, hash: &ContentFingerprint) -> Option<PackageMeta>;

    /// Parse a `Packages` file and merge its stanzas. `repo` names the
    /// repository the file came from. Returns how many entries were
    /// added or replaced.
    fn ingest(&self, repo: &str, text: &str) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct MemoryPackageIndex {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    // Keyed by the basename of `Filename`; the full filename is matched
    // as a suffix at lookup time to disambiguate collisions.
    by_basename: HashMap<String, Vec<Arc<PackageMeta>>>,
    by_hash: HashMap<ContentFingerprint, Arc<PackageMeta>>,
}

impl MemoryPackageIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parse one stanza into its interesting fields.
fn parse_stanza(repo: &str, stanza: &str) -> Option<PackageMeta> {
    let mut name = None;
    let mut version = None;
    let mut architecture = None;
    let mut filename = None;
    let mut size = None;
    let mut sha256 = None;

    for line in stanza.lines() {
        // Continuation lines belong to multi-line fields we don't index.
        if line.starts_with(' ') || line.starts_with('\t') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "Package" => name = Some(value.to_owned()),
            "Version" => version = Some(value.to_owned()),
            "Architecture" => architecture = Some(value.to_owned()),
            "Filename" => filename = Some(value.trim_start_matches("./").to_owned()),
            "Size" => size = value.parse::<u64>().ok(),
            "SHA256" => sha256 = value.parse::<ContentFingerprint>().ok(),
            _ => {}
        }
    }

    Some(PackageMeta {
        sha256: sha256?,
        size: size?,
        filename: filename?,
        repo: repo.to_owned(),
        name,
        version,
        architecture,
    })
}

impl PackageIndex for MemoryPackageIndex {
    fn lookup_by_url_path(&self, path: &str) -> Option<PackageMeta> {
        let path = path.trim_end_matches('/');
        let inner = self.inner.read();
        let candidates = inner.by_basename.get(basename(path))?;
        candidates
            .iter()
            .find(|meta| {
                path == meta.filename || path.ends_with(&format!("/{}", meta.filename))
            })
            .map(|meta| (**meta).clone())
    }

    fn lookup_by_hash(&self, hash: &ContentFingerprint) -> Option<PackageMeta> {
        self.inner
            .read()
            .by_hash
            .get(hash)
            .map(|meta| (**meta).clone())
    }

    fn ingest(&self, repo: &str, text: &str) -> usize {
        let mut added = 0;
        let mut inner = self.inner.write();
        for stanza in text.split("\n\n") {
            let stanza = stanza.trim();
            if stanza.is_empty() {
                continue;
            }
            let Some(meta) = parse_stanza(repo, stanza) else {
                continue;
            };
            let meta = Arc::new(meta);
            let entries = inner
                .by_basename
                .entry(basename(&meta.filename).to_owned())
                .or_default();
            entries.retain(|existing| existing.filename != meta.filename);
            entries.push(Arc::clone(&meta));
            inner.by_hash.insert(meta.sha256, Arc::clone(&meta));
            added += 1;
        }
        if added > 0 {
            tracing::info!(target: LOG_TARGET, repo, entries = added, "index ingested");
        }
        added
    }

    fn len(&self) -> usize {
        self.inner.read().by_hash.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packages() -> String {
        let hello_hash = ContentFingerprint::digest(b"hello package").to_hex();
        let world_hash = ContentFingerprint::digest(b"world package").to_hex();
        format!(
            "Package: hello\n\
             Version: 2.10-3\n\
             Architecture: amd64\n\
             Filename: pool/main/h/hello/hello_2.10-3_amd64.deb\n\
             Size: 56132\n\
             SHA256: {hello_hash}\n\
             Description: example package\n\
              with a continuation line\n\
             \n\
             Package: world\n\
             Version: 1.0\n\
             Architecture: all\n\
             Filename: pool/main/w/world/world_1.0_all.deb\n\
             Size: 1024\n\
             SHA256: {world_hash}\n"
        )
    }

    #[test]
    fn ingest_and_lookup_by_path() {
        let index = MemoryPackageIndex::new();
        let added = index.ingest("http://deb.debian.org/debian", &sample_packages());
        assert_eq!(added, 2);
        assert_eq!(index.len(), 2);

        let meta = index
            .lookup_by_url_path(
                "deb.debian.org/debian/pool/main/h/hello/hello_2.10-3_amd64.deb",
            )
            .unwrap();
        assert_eq!(meta.name.as_deref(), Some("hello"));
        assert_eq!(meta.size, 56132);
        assert_eq!(meta.architecture.as_deref(), Some("amd64"));
    }

    #[test]
    fn lookup_by_hash() {
        let index = MemoryPackageIndex::new();
        index.ingest("repo", &sample_packages());
        let hash = ContentFingerprint::digest(b"world package");
        let meta = index.lookup_by_hash(&hash).unwrap();
        assert_eq!(meta.name.as_deref(), Some("world"));
    }

    #[test]
    fn lookup_requires_full_filename_suffix() {
        let index = MemoryPackageIndex::new();
        index.ingest("repo", &sample_packages());
        // Same basename, wrong directory.
        assert!(index
            .lookup_by_url_path("mirror/otherpool/hello_2.10-3_amd64.deb")
            .is_none());
        assert!(index.lookup_by_url_path("unknown.deb").is_none());
    }

    #[test]
    fn reingest_replaces_entries() {
        let index = MemoryPackageIndex::new();
        index.ingest("repo", &sample_packages());
        index.ingest("repo", &sample_packages());
        assert_eq!(index.len(), 2);
        let meta = index
            .lookup_by_url_path("x/pool/main/w/world/world_1.0_all.deb")
            .unwrap();
        assert_eq!(meta.size, 1024);
    }

    #[test]
    fn stanzas_missing_required_fields_are_skipped() {
        let index = MemoryPackageIndex::new();
        let added = index.ingest("repo", "Package: broken\nVersion: 1\n");
        assert_eq!(added, 0);
    }
}
