//! Channel and installer manifest acquisition (spec §4.1).

use crate::{util::Sha256, Ctx, Path, PathBuf};
use anyhow::{Context as _, Error};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Deserialize)]
pub struct Payload {
    #[serde(rename = "fileName")]
    pub file_name: String,
    pub url: String,
    pub size: Option<u64>,
    pub sha256: Option<Sha256>,
}

impl Payload {
    /// The payload's file name may contain a `\`-separated installer-relative
    /// path (e.g. `Installers\foo.cab`); only the final component is used
    /// when writing the payload to the cache.
    pub fn basename(&self) -> &str {
        self.file_name
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(&self.file_name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ConstraintType {
    Required,
    Recommended,
    Optional,
}

impl Default for ConstraintType {
    fn default() -> Self {
        Self::Required
    }
}

/// A dependency constraint, which in the manifest is either a bare version
/// string, or a record with optional `version`/`id`/`chip`/`machineArch`/`type`.
#[derive(Clone, Debug, Default)]
pub struct Constraint {
    pub version: Option<String>,
    pub id: Option<String>,
    pub chip: Option<String>,
    pub machine_arch: Option<String>,
    pub typ: ConstraintType,
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Version(String),
            Record {
                version: Option<String>,
                id: Option<String>,
                chip: Option<String>,
                #[serde(rename = "machineArch")]
                machine_arch: Option<String>,
                #[serde(rename = "type", default)]
                typ: ConstraintType,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Version(version) => Constraint {
                version: Some(version),
                ..Default::default()
            },
            Repr::Record {
                version,
                id,
                chip,
                machine_arch,
                typ,
            } => Constraint {
                version,
                id,
                chip,
                machine_arch,
                typ,
            },
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct InstallSizes {
    #[serde(rename = "targetDrive")]
    pub target_drive: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LocalizedResource {
    pub license: Option<String>,
}

/// One package variant from the installer manifest.
#[derive(Clone, Debug, Deserialize)]
pub struct Variant {
    pub id: String,
    pub version: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub chip: Option<String>,
    #[serde(rename = "machineArch")]
    pub machine_arch: Option<String>,
    #[serde(rename = "productArch")]
    pub product_arch: Option<String>,
    pub language: Option<String>,
    #[serde(default)]
    pub payloads: Vec<Payload>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, Constraint>,
    #[serde(rename = "installSizes")]
    pub install_sizes: Option<InstallSizes>,
    #[serde(rename = "localizedResources", default)]
    pub localized_resources: Vec<LocalizedResource>,
}

impl Variant {
    pub fn license_url(&self) -> Option<&str> {
        self.localized_resources
            .first()
            .and_then(|lr| lr.license.as_deref())
    }
}

#[derive(Deserialize)]
struct ChannelItem {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payloads: Vec<Payload>,
}

#[derive(Deserialize)]
struct Channel {
    #[serde(rename = "channelItems")]
    channel_items: Vec<ChannelItem>,
}

#[derive(Deserialize)]
struct RawInstallerManifest {
    packages: Vec<Variant>,
    #[serde(rename = "info")]
    info: Option<ManifestInfo>,
}

#[derive(Deserialize)]
struct ManifestInfo {
    #[serde(rename = "productDisplayVersion")]
    product_display_version: Option<String>,
}

pub struct InstallerManifest {
    pub variants: Vec<Variant>,
    /// The `info.productDisplayVersion` field, used to name the
    /// `--save-manifest` output file when the caller doesn't override it.
    pub product_display_version: Option<String>,
}

/// Locates and fetches the installer manifest, following the channel manifest
/// unless the user supplied one explicitly.
///
/// `manifest` may be a local path or a `http(s)://` URL; when absent the
/// official `https://aka.ms/vs/<major>/<channel>/channel` channel manifest is
/// consulted for the `Manifest`-typed channel item.
pub fn get_manifest(
    ctx: &Ctx,
    manifest: Option<&Path>,
    major: &str,
    channel: &str,
    save_manifest: Option<&Path>,
    progress: indicatif::ProgressBar,
) -> Result<InstallerManifest, Error> {
    let bytes = match manifest {
        Some(path) if path.as_str().starts_with("http") => {
            progress.set_message("fetching user-specified manifest");
            ctx.get(path.as_str())?
        }
        Some(path) => std::fs::read(path)
            .with_context(|| format!("ManifestNotFound: unable to read '{path}'"))?,
        None => {
            progress.set_message("fetching channel manifest");
            let channel_url = format!("https://aka.ms/vs/{major}/{channel}/channel");
            let channel_bytes = ctx
                .get(&channel_url)
                .with_context(|| format!("ManifestNotFound: unable to fetch '{channel_url}'"))?;

            let channel: Channel = serde_json::from_slice(&channel_bytes)
                .context("ManifestNotFound: channel payload is not valid JSON")?;

            let item = channel
                .channel_items
                .iter()
                .find(|ci| ci.kind == "Manifest" && !ci.payloads.is_empty())
                .context("ManifestNotFound: no Manifest channel item in channel payload")?;

            let url = &item.payloads[0].url;
            progress.set_message("fetching installer manifest");
            ctx.get(url)
                .with_context(|| format!("ManifestNotFound: unable to fetch '{url}'"))?
        }
    };

    let raw: RawInstallerManifest =
        serde_json::from_slice(&bytes).context("installer manifest is not valid JSON")?;
    let product_display_version = raw.info.and_then(|info| info.product_display_version);

    if let Some(save_path) = save_manifest {
        let default_name = product_display_version
            .as_deref()
            .map(|v| format!("{v}.manifest"));
        let save_path = if save_path.as_str().is_empty() {
            PathBuf::from(default_name.as_deref().unwrap_or("vs.manifest"))
        } else {
            save_path.to_owned()
        };
        save_manifest_bytes(&save_path, &bytes)?;
    }

    Ok(InstallerManifest {
        variants: raw.packages,
        product_display_version,
    })
}

/// Persists the raw manifest bytes to `path`, refusing to overwrite a file
/// whose contents already differ (per spec §4.1, the check is byte-for-byte).
fn save_manifest_bytes(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    if path.exists() {
        let existing = std::fs::read(path)
            .with_context(|| format!("unable to read existing manifest at '{path}'"))?;
        if existing == bytes {
            return Ok(());
        }
        tracing::warn!(%path, "existing saved manifest differs from fetched manifest, not overwriting");
        return Ok(());
    }

    std::fs::write(path, bytes).with_context(|| format!("unable to write manifest to '{path}'"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constraint_accepts_bare_version() {
        let c: Constraint = serde_json::from_str("\"1.2.3\"").unwrap();
        assert_eq!(c.version.as_deref(), Some("1.2.3"));
        assert_eq!(c.typ, ConstraintType::Required);
    }

    #[test]
    fn constraint_accepts_record() {
        let c: Constraint =
            serde_json::from_str(r#"{"version":"1.0","type":"Optional","chip":"x64"}"#).unwrap();
        assert_eq!(c.version.as_deref(), Some("1.0"));
        assert_eq!(c.typ, ConstraintType::Optional);
        assert_eq!(c.chip.as_deref(), Some("x64"));
    }

    #[test]
    fn basename_strips_installer_prefix() {
        let p = Payload {
            file_name: r"Installers\foo.cab".to_owned(),
            url: String::new(),
            size: None,
            sha256: None,
        };
        assert_eq!(p.basename(), "foo.cab");
    }
}
