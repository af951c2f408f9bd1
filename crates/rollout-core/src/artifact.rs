//! Content-addressed artifacts: digest, staging and activation.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Result, RolloutError};
use crate::io;
use crate::paths;
use crate::types::SiteKind;

/// SHA-256 (hex) of a file, or of a directory's files in sorted
/// relative-path order (path, NUL, contents).
pub fn digest(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)
        .map_err(|_| RolloutError::InvalidArtifact(format!("{} does not exist", path.display())))?;
    let mut hasher = Sha256::new();
    if meta.is_file() {
        let mut file = std::fs::File::open(path)?;
        std::io::copy(&mut file, &mut hasher)?;
        return Ok(hex::encode(hasher.finalize()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(path)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push((rel, entry.into_path()));
    }
    if files.is_empty() {
        return Err(RolloutError::InvalidArtifact(format!(
            "{} is empty",
            path.display()
        )));
    }
    files.sort_by(|a, b| a.0.cmp(&b.0));
    for (rel, abs) in files {
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        let mut file = std::fs::File::open(&abs)?;
        std::io::copy(&mut file, &mut hasher)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Reject artifacts the site kind cannot serve.
pub fn validate(kind: SiteKind, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(RolloutError::InvalidArtifact(format!(
            "{} does not exist",
            path.display()
        )));
    }
    if kind == SiteKind::Static {
        if !path.is_dir() {
            return Err(RolloutError::InvalidArtifact(
                "static artifacts must be a directory".to_string(),
            ));
        }
        if !path.join("index.html").is_file() {
            return Err(RolloutError::InvalidArtifact(format!(
                "{} has no index.html",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Copy `src` into the release directory. The copy lands in a `.partial`
/// sibling first and is renamed into place, so a release directory is
/// either absent or complete. An existing directory is reused.
pub fn stage(src: &Path, deploy_root: &Path, domain: &str, release_id: &str) -> Result<PathBuf> {
    let dest = paths::release_dir(deploy_root, domain, release_id);
    if dest.is_dir() {
        tracing::debug!(domain, release = release_id, "release directory already staged");
        return Ok(dest);
    }
    let partial = dest.with_file_name(format!("{release_id}.partial"));
    if partial.exists() {
        std::fs::remove_dir_all(&partial)?;
    }
    io::ensure_dir(&partial)?;
    if src.is_file() {
        let name = src
            .file_name()
            .ok_or_else(|| RolloutError::InvalidArtifact(src.display().to_string()))?;
        io::copy_tree(src, &partial.join(name))?;
    } else {
        io::copy_tree(src, &partial)?;
    }
    std::fs::rename(&partial, &dest)?;
    tracing::info!(domain, release = release_id, path = %dest.display(), "artifact staged");
    Ok(dest)
}

/// Repoint `current` at the release in one rename.
pub fn activate(deploy_root: &Path, domain: &str, release_id: &str) -> Result<()> {
    let target = paths::release_dir(deploy_root, domain, release_id);
    if !target.is_dir() {
        return Err(RolloutError::InvalidArtifact(format!(
            "release {release_id} is not staged at {}",
            target.display()
        )));
    }
    io::swap_symlink(&target, &paths::current_link(deploy_root, domain))?;
    tracing::info!(domain, release = release_id, "current link swapped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spa(dir: &Path, body: &str) {
        std::fs::create_dir_all(dir.join("assets")).unwrap();
        std::fs::write(dir.join("index.html"), body).unwrap();
        std::fs::write(dir.join("assets/main.1a2b.js"), "console.log(1)").unwrap();
    }

    #[test]
    fn digest_depends_on_content_not_location() {
        let dir = TempDir::new().unwrap();
        spa(&dir.path().join("a"), "<html>v1</html>");
        spa(&dir.path().join("b"), "<html>v1</html>");
        spa(&dir.path().join("c"), "<html>v2</html>");
        let a = digest(&dir.path().join("a")).unwrap();
        assert_eq!(a, digest(&dir.path().join("b")).unwrap());
        assert_ne!(a, digest(&dir.path().join("c")).unwrap());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn digest_includes_file_names() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        std::fs::write(a.join("x.txt"), "same").unwrap();
        std::fs::write(b.join("y.txt"), "same").unwrap();
        assert_ne!(digest(&a).unwrap(), digest(&b).unwrap());
    }

    #[test]
    fn static_artifact_needs_index() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("dist");
        std::fs::create_dir_all(&bundle).unwrap();
        std::fs::write(bundle.join("app.js"), "x").unwrap();
        assert!(matches!(
            validate(SiteKind::Static, &bundle),
            Err(RolloutError::InvalidArtifact(_))
        ));
        std::fs::write(bundle.join("index.html"), "<html>").unwrap();
        validate(SiteKind::Static, &bundle).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn stage_then_activate_swaps_current() {
        let dir = TempDir::new().unwrap();
        let deploy = dir.path().join("www");
        let v1 = dir.path().join("v1");
        let v2 = dir.path().join("v2");
        spa(&v1, "one");
        spa(&v2, "two");

        stage(&v1, &deploy, "front.example.com", "0001-aaaa").unwrap();
        activate(&deploy, "front.example.com", "0001-aaaa").unwrap();
        stage(&v2, &deploy, "front.example.com", "0002-bbbb").unwrap();
        activate(&deploy, "front.example.com", "0002-bbbb").unwrap();

        let current = paths::current_link(&deploy, "front.example.com");
        assert_eq!(std::fs::read_to_string(current.join("index.html")).unwrap(), "two");
        assert!(!deploy
            .join("front.example.com/releases/0002-bbbb.partial")
            .exists());
    }

    #[test]
    fn activate_unstaged_release_fails() {
        let dir = TempDir::new().unwrap();
        assert!(activate(dir.path(), "front.example.com", "0009-missing").is_err());
    }
}
