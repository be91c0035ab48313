//! Typed extraction of selected packages into a staging tree, with
//! case-insensitive tree merging (spec §4.7).

use crate::{resolve::PackageKey, Path, PathBuf};
use anyhow::{Context as _, Error};
use std::fs;

/// Decodes the `%XX` percent-encoding used by VSIX archive entry names. The
/// decoded form is used for every directory/file operation from this point
/// on, including the scratch extraction directory, so raw and decoded forms
/// never diverge between the intermediate and final trees.
fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_digit(bytes[i + 1]), hex_digit(bytes[i + 2])) {
                out.push((hi << 4) | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Extracts every entry of a VSIX/ZIP archive accepted by `filter` into a
/// scratch `<dest>.extract` directory, without merging it anywhere. `filter`
/// maps a percent-decoded archive entry name to the relative path it should
/// land at under the scratch directory, or `None` to skip it. Returns the
/// scratch directory path and the list of extracted relative paths.
pub fn unzip_filtered(
    archive_path: &Path,
    dest: &Path,
    filter: impl Fn(&str) -> Option<String>,
) -> Result<(PathBuf, Vec<String>), Error> {
    let file = fs::File::open(archive_path)
        .with_context(|| format!("unable to open archive '{archive_path}'"))?;
    let mut zip = zip::ZipArchive::new(file)
        .with_context(|| format!("'{archive_path}' is not a valid zip/vsix archive"))?;

    let scratch = dest
        .parent()
        .unwrap_or(dest)
        .join(format!("{}.extract", dest.file_name().unwrap_or("pkg")));
    fs::create_dir_all(&scratch)
        .with_context(|| format!("unable to create scratch dir '{scratch}'"))?;

    let mut entries = Vec::new();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let raw_name = entry.name().to_owned();
        let decoded = percent_decode(&raw_name);

        let Some(relative) = filter(&decoded) else {
            continue;
        };

        entries.push(relative.clone());

        let out_path = scratch.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("unable to create '{parent}'"))?;
        }

        let mut out_file = fs::File::create(&out_path)
            .with_context(|| format!("unable to create '{out_path}'"))?;
        std::io::copy(&mut entry, &mut out_file)
            .with_context(|| format!("unable to extract '{decoded}'"))?;
    }

    Ok((scratch, entries))
}

/// A VSIX archive carries two distinguished top-level prefixes: `Contents/`
/// (merged into the destination root) and `$MSBuild/` (merged into
/// `<dest>/MSBuild`). This buckets a decoded entry name into a `(root |
/// msbuild)/<relative>` scratch path so both can be extracted in one zip pass
/// and then merged into their respective destinations separately.
fn vsix_contents_filter(name: &str) -> Option<String> {
    if let Some(rest) = name.strip_prefix("Contents/") {
        Some(format!("root/{rest}"))
    } else if let Some(rest) = name.strip_prefix("$MSBuild/") {
        Some(format!("msbuild/{rest}"))
    } else {
        None
    }
}

/// Merges `src` into `dest`, treating names that are equal only up to case as
/// the same directory rather than duplicating them. This is the one routine
/// that tolerates upstream packages' case inconsistencies (spec §4.7/§9).
pub fn merge_trees(src: &Path, dest: &Path) -> Result<(), Error> {
    if !dest.exists() {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src, dest)
            .with_context(|| format!("unable to move '{src}' to '{dest}'"))?;
        return Ok(());
    }

    for entry in fs::read_dir(src).with_context(|| format!("unable to read '{src}'"))? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name
            .to_str()
            .with_context(|| format!("non-utf8 entry under '{src}'"))?;

        let src_child = src.join(name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            let existing = find_case_insensitive_child(dest, name)?;
            match existing {
                Some(existing_name) => {
                    merge_trees(&src_child, &dest.join(existing_name))?;
                }
                None => {
                    fs::rename(&src_child, dest.join(name))
                        .with_context(|| format!("unable to move '{src_child}' into '{dest}'"))?;
                }
            }
        } else {
            let dest_child = dest.join(name);
            if dest_child.exists() {
                let _ = fs::remove_file(&dest_child);
            }
            fs::rename(&src_child, &dest_child)
                .with_context(|| format!("unable to move '{src_child}' to '{dest_child}'"))?;
        }
    }

    let _ = fs::remove_dir_all(src);

    Ok(())
}

fn find_case_insensitive_child(dir: &Path, name: &str) -> Result<Option<String>, Error> {
    if dir.join(name).exists() {
        return Ok(Some(name.to_owned()));
    }

    for entry in fs::read_dir(dir).with_context(|| format!("unable to read '{dir}'"))? {
        let entry = entry?;
        let entry_name = entry.file_name();
        if let Some(entry_name) = entry_name.to_str() {
            if entry_name.eq_ignore_ascii_case(name) {
                return Ok(Some(entry_name.to_owned()));
            }
        }
    }

    Ok(None)
}

/// Invokes the platform MSI extractor (`msiexec /a` on Windows, `msiextract`
/// elsewhere) against `msi_path`, capturing its stdout to `listing_path`.
pub fn extract_msi(msi_path: &Path, dest: &Path, listing_path: &Path) -> Result<(), Error> {
    fs::create_dir_all(dest).with_context(|| format!("unable to create '{dest}'"))?;

    let output = if cfg!(windows) {
        std::process::Command::new("msiexec")
            .arg("/a")
            .arg(msi_path.as_std_path())
            .arg("/qn")
            .arg(format!("TARGETDIR={dest}"))
            .output()
    } else {
        std::process::Command::new("msiextract")
            .arg("-C")
            .arg(dest.as_std_path())
            .arg(msi_path.as_std_path())
            .output()
    }
    .with_context(|| format!("unable to invoke MSI extractor for '{msi_path}'"))?;

    fs::write(listing_path, &output.stdout)
        .with_context(|| format!("unable to write listing '{listing_path}'"))?;

    anyhow::ensure!(
        output.status.success(),
        "SubprocessFailure: MSI extractor exited with {} for '{msi_path}'",
        output.status
    );

    Ok(())
}

/// What to do with one selected variant's payloads during extraction.
pub enum ExtractAction<'a> {
    /// `Component`/`Workload`/`Group`: no payloads, nothing to do.
    Skip,
    /// A VSIX (ZIP) archive; only entries under `Contents/` are installed,
    /// with that prefix stripped.
    Vsix { payload_path: &'a Path },
    /// A Windows/Win11 SDK or WDK MSI.
    Msi { payload_path: &'a Path },
}

/// Extracts one payload per [`ExtractAction`] into `staging`, writing a
/// `<key>-listing.txt` manifest of extracted entries alongside it.
pub fn extract_variant(
    key: &PackageKey,
    action: ExtractAction<'_>,
    staging: &Path,
) -> Result<(), Error> {
    match action {
        ExtractAction::Skip => Ok(()),
        ExtractAction::Vsix { payload_path } => {
            let (scratch, entries) = unzip_filtered(payload_path, staging, vsix_contents_filter)?;

            let root_src = scratch.join("root");
            if root_src.exists() {
                merge_trees(&root_src, staging)?;
            }
            let msbuild_src = scratch.join("msbuild");
            if msbuild_src.exists() {
                merge_trees(&msbuild_src, &staging.join("MSBuild"))?;
            }
            let _ = fs::remove_dir_all(&scratch);

            let listing = staging.join(format!("{key}-listing.txt"));
            fs::write(&listing, entries.join("\n"))
                .with_context(|| format!("unable to write '{listing}'"))?;
            Ok(())
        }
        ExtractAction::Msi { payload_path } => {
            let listing = staging.join(format!(
                "WinSDK-{}-listing.txt",
                payload_path.file_name().unwrap_or("payload")
            ));
            extract_msi(payload_path, staging, &listing)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn percent_decode_handles_spaces() {
        assert_eq!(percent_decode("Contents/Some%20File.h"), "Contents/Some File.h");
        assert_eq!(percent_decode("plain"), "plain");
    }

    #[test]
    fn merge_trees_moves_when_dest_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let src = PathBuf::from_path_buf(tmp.path().join("src")).unwrap();
        let dest = PathBuf::from_path_buf(tmp.path().join("dest")).unwrap();
        fs::create_dir_all(src.join("a")).unwrap();
        fs::write(src.join("a/file.txt"), b"hi").unwrap();

        merge_trees(&src, &dest).unwrap();
        assert!(dest.join("a/file.txt").exists());
    }

    #[test]
    fn merge_trees_collapses_case_variant_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let src = PathBuf::from_path_buf(tmp.path().join("src")).unwrap();
        let dest = PathBuf::from_path_buf(tmp.path().join("dest")).unwrap();

        fs::create_dir_all(dest.join("Include")).unwrap();
        fs::write(dest.join("Include/a.h"), b"a").unwrap();

        fs::create_dir_all(src.join("include")).unwrap();
        fs::write(src.join("include/b.h"), b"b").unwrap();

        merge_trees(&src, &dest).unwrap();

        // Both files should end up under the single pre-existing `Include`
        // directory rather than creating a sibling `include`.
        assert!(dest.join("Include/a.h").exists());
        assert!(dest.join("Include/b.h").exists());
        assert!(!dest.join("include").exists());
    }
}
