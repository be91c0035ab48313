//! Post-extraction normalization: canonical relocation, case-folding of the
//! SDK surface, `#include` directive rewriting, and optional patching
//! (spec §4.8).

use crate::{extract::merge_trees, Path, PathBuf};
use anyhow::{Context as _, Error};
use std::fs;

/// Moves the canonical subtrees (`VC`, `Windows Kits`, and optionally
/// `MSBuild`, `DIA SDK`, `Common7/Tools`) out of `staging` into `dest`,
/// stripping a leading `Program Files` component (present when the SDK MSIs
/// were extracted with their installed-on-Windows layout).
pub fn relocate_canonical(staging: &Path, dest: &Path) -> Result<(), Error> {
    const SUBTREES: &[&str] = &["VC", "Windows Kits", "MSBuild", "DIA SDK", "Common7/Tools"];

    for subtree in SUBTREES {
        if let Some(found) = find_subtree(staging, subtree)? {
            let target = dest.join(subtree);
            merge_trees(&found, &target)
                .with_context(|| format!("unable to relocate '{subtree}' into '{target}'"))?;
        }
    }

    Ok(())
}

/// Locates `subtree` directly under `staging`, or under `staging/Program
/// Files`/`staging/Program Files (x86)` when the MSI preserved its
/// Windows-installed layout.
fn find_subtree(staging: &Path, subtree: &str) -> Result<Option<PathBuf>, Error> {
    for candidate in [
        staging.join(subtree),
        staging.join("Program Files").join(subtree),
        staging.join("Program Files (x86)").join(subtree),
    ] {
        if candidate.exists() {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Recursively lowercases every file/directory name under `root`, rewriting
/// symlink targets so they still resolve. Processes deepest entries first so
/// a rename never invalidates a not-yet-visited child path.
pub fn lowercase_tree(root: &Path) -> Result<(), Error> {
    let mut dirs = walkdir::WalkDir::new(root)
        .contents_first(true)
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .context("failed to walk tree for lowercasing")?;

    dirs.retain(|e| e.path() != root.as_std_path());

    for entry in dirs {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let lower = file_name.to_lowercase();
        if lower == file_name {
            continue;
        }

        let new_path = path.with_file_name(&lower);

        if entry.path_is_symlink() {
            let target = fs::read_link(path)
                .with_context(|| format!("unable to read symlink '{}'", path.display()))?;
            let target_str = target.to_string_lossy().to_lowercase();
            fs::remove_file(path)?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target_str, &new_path)
                .with_context(|| format!("unable to relink '{}'", new_path.display()))?;
            #[cfg(windows)]
            {
                let _ = (&target_str, &new_path);
            }
            continue;
        }

        if new_path.exists() {
            // Case-insensitive collision with an already-lowercased sibling;
            // treat it like a merge so no content is lost.
            let src = PathBuf::from_path_buf(path.to_path_buf())
                .map_err(|p| anyhow::anyhow!("non-utf8 path '{}'", p.display()))?;
            let dst = PathBuf::from_path_buf(new_path.clone())
                .map_err(|p| anyhow::anyhow!("non-utf8 path '{}'", p.display()))?;
            if src.is_dir() {
                merge_trees(&src, &dst)?;
            } else {
                fs::remove_file(&new_path)?;
                fs::rename(path, &new_path)?;
            }
        } else {
            fs::rename(path, &new_path)
                .with_context(|| format!("unable to lowercase '{}'", path.display()))?;
        }
    }

    Ok(())
}

/// Matches a `#include <path>` or `#include "path"` line (byte-level,
/// multiline), capturing the directive prefix, the bracketed/quoted include
/// path, and anything trailing it (e.g. a `//` comment), mirroring the
/// original tool's include-fixing regex.
fn include_regex() -> regex::bytes::Regex {
    regex::bytes::Regex::new(r#"(?m-s)^(\s*#\s*include\s*)(<[^>]*>|"(?:[^"\\]|\\.)*")(.*)$"#)
        .expect("static include regex is valid")
}

/// Rewrites every `#include` directive under `root` to use a lowercase,
/// forward-slash path, leaving non-matching lines byte-identical. Running
/// this twice produces the same bytes (spec P8).
pub fn rewrite_includes(root: &Path) -> Result<(), Error> {
    let regex = include_regex();

    for entry in walkdir::WalkDir::new(root) {
        let entry = entry.context("failed to walk include tree")?;
        if !entry.file_type().is_file() || entry.path_is_symlink() {
            continue;
        }

        let path = entry.path();
        let contents = fs::read(path)
            .with_context(|| format!("unable to read '{}'", path.display()))?;

        let rewritten = regex.replace_all(&contents, |caps: &regex::bytes::Captures<'_>| {
            let prefix = &caps[1];
            let include_path = &caps[2];
            let suffix = &caps[3];

            let lowered: Vec<u8> = include_path
                .iter()
                .map(|b| {
                    if *b == b'\\' {
                        b'/'
                    } else {
                        b.to_ascii_lowercase()
                    }
                })
                .collect();

            let mut out = Vec::with_capacity(prefix.len() + lowered.len() + suffix.len());
            out.extend_from_slice(prefix);
            out.extend_from_slice(&lowered);
            out.extend_from_slice(suffix);
            out
        });

        if rewritten.as_ref() != contents.as_slice() {
            fs::write(path, rewritten.as_ref())
                .with_context(|| format!("unable to rewrite '{}'", path.display()))?;
        }
    }

    Ok(())
}

/// Applies a `patches/` directory mirroring `dest`'s layout: `.patch` files
/// are applied via the host `patch` tool (skipped if a reverse-apply dry run
/// already succeeds), `.remove` files delete their target, anything else is
/// copied in as a new file.
pub fn apply_patches(dest: &Path, patches_dir: &Path) -> Result<(), Error> {
    for entry in walkdir::WalkDir::new(patches_dir) {
        let entry = entry.context("failed to walk patches directory")?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path
            .strip_prefix(patches_dir.as_std_path())
            .expect("walkdir entries are under patches_dir");

        if path.extension().and_then(|e| e.to_str()) == Some("patch") {
            let target_relative = relative.with_extension("");
            let target = dest.join(
                target_relative
                    .to_str()
                    .context("non-utf8 patch target path")?,
            );
            apply_single_patch(path, target.as_std_path())?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("remove") {
            let target_relative = relative.with_extension("");
            let target = dest.join(
                target_relative
                    .to_str()
                    .context("non-utf8 remove target path")?,
            );
            if target.exists() {
                fs::remove_file(&target)
                    .with_context(|| format!("unable to remove '{target}'"))?;
            }
        } else {
            let target = dest.join(relative.to_str().context("non-utf8 patch source path")?);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(path, target.as_std_path())
                .with_context(|| format!("unable to copy patch payload to '{target}'"))?;
        }
    }

    Ok(())
}

fn apply_single_patch(patch_path: &std::path::Path, target: &std::path::Path) -> Result<(), Error> {
    let already_applied = std::process::Command::new("patch")
        .args(["--dry-run", "-R", "-i"])
        .arg(patch_path)
        .arg(target)
        .status()
        .map(|status| status.success())
        .unwrap_or(false);

    if already_applied {
        tracing::debug!(patch = %patch_path.display(), "already applied, skipping");
        return Ok(());
    }

    let status = std::process::Command::new("patch")
        .arg("-i")
        .arg(patch_path)
        .arg(target)
        .status()
        .with_context(|| format!("unable to invoke patch tool for '{}'", patch_path.display()))?;

    anyhow::ensure!(
        status.success(),
        "SubprocessFailure: patch tool exited with {status} applying '{}'",
        patch_path.display()
    );

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn include_rewrite_lowercases_and_normalizes_slashes() {
        let input = b"#include <Windows.h>\n#include \"Foo\\Bar.h\" // keep me\nnot an include\n";
        let regex = include_regex();
        let out = regex.replace_all(input, |caps: &regex::bytes::Captures<'_>| {
            let prefix = &caps[1];
            let include_path = &caps[2];
            let suffix = &caps[3];
            let lowered: Vec<u8> = include_path
                .iter()
                .map(|b| if *b == b'\\' { b'/' } else { b.to_ascii_lowercase() })
                .collect();
            let mut v = prefix.to_vec();
            v.extend_from_slice(&lowered);
            v.extend_from_slice(suffix);
            v
        });

        assert_eq!(
            out.as_ref(),
            b"#include <windows.h>\n#include \"foo/bar.h\" // keep me\nnot an include\n".as_slice()
        );
    }

    #[test]
    fn include_rewrite_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        fs::write(root.join("a.h"), b"#include <Windows.H>\n").unwrap();

        rewrite_includes(&root).unwrap();
        let once = fs::read(root.join("a.h")).unwrap();
        rewrite_includes(&root).unwrap();
        let twice = fs::read(root.join("a.h")).unwrap();

        assert_eq!(once, twice);
        assert_eq!(once, b"#include <windows.h>\n");
    }

    #[test]
    fn lowercase_tree_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let root = PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("Include/Um")).unwrap();
        fs::write(root.join("Include/Um/Windows.h"), b"content").unwrap();

        lowercase_tree(&root).unwrap();
        assert!(root.join("include/um/windows.h").exists());

        lowercase_tree(&root).unwrap();
        let hash_after = fs::read(root.join("include/um/windows.h")).unwrap();
        assert_eq!(hash_after, b"content");
    }
}
