//! Selection presets: map a friendly MSVC/SDK version selector to concrete
//! manifest package ids (spec §4.5). This generalizes the original tool's
//! hardcoded CRT/SDK-only lookup into root selection for the full resolver.

use crate::{index::PackageIndex, Arch};
use anyhow::{Context as _, Error};
use std::collections::BTreeSet;

const DEFAULT_WORKLOAD: &str = "Microsoft.VisualStudio.Workload.VCTools";

/// Finds the highest-priority `Win10SDK_*`/`Win11SDK_*` id in the index,
/// using `Win11SDK_` once the SDK's minor version is `>= 22000` exactly as
/// the original tool's sdk-major detection does.
pub fn latest_sdk_id(index: &PackageIndex) -> Option<String> {
    let regex = regex::Regex::new(r"(?i)^win(10|11)sdk_(.+)").ok()?;

    index
        .ids()
        .filter_map(|id| {
            let caps = regex.captures(id)?;
            let version = versions::Version::new(&caps[2])?;
            Some((version, id.to_owned()))
        })
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, id)| id)
}

/// Applies `--sdk-version`: keeps only the matching `winXXsdk_<version>` id
/// and adds every other SDK id to `ignore`. Fails with **SDKNotFound** and a
/// list of available versions if no match exists.
pub fn pin_sdk_version(
    index: &PackageIndex,
    requested: &str,
    ignore: &mut BTreeSet<String>,
) -> Result<String, Error> {
    let regex = regex::Regex::new(r"(?i)^win(10|11)sdk_(.+)")?;

    let mut available = Vec::new();
    let mut matched = None;

    for id in index.ids() {
        let Some(caps) = regex.captures(id) else {
            continue;
        };
        let version = &caps[2];
        available.push(version.to_owned());
        if version == requested {
            matched = Some(id.to_owned());
        } else {
            ignore.insert(id.to_lowercase());
        }
    }

    match matched {
        Some(id) => Ok(id),
        None => {
            available.sort();
            available.dedup();
            anyhow::bail!(
                "SDKNotFound: WinSDK version '{requested}' not found, available versions: {}",
                available.join(", ")
            )
        }
    }
}

/// Returns `Win11SDK_<sdk>` once the SDK's build number is `>= 22000`, else
/// `Win10SDK_<sdk>`, per spec §4.5's VS16+ schema rule.
fn sdk_package_id(sdk: &str) -> String {
    let is_win11 = sdk
        .strip_prefix("10.0.")
        .and_then(|rest| rest.split('.').next())
        .and_then(|build| build.parse::<u32>().ok())
        .is_some_and(|build| build >= 22000);

    if is_win11 {
        format!("Win11SDK_{sdk}")
    } else {
        format!("Win10SDK_{sdk}")
    }
}

/// `(sdkVersion, toolchainMicroVersion)` for one two-level MSVC version,
/// taken from the original tool's explicit version table (spec §4.5).
fn version_table(msvc_version: &str) -> Option<(&'static str, &'static str)> {
    Some(match msvc_version {
        "15.4" => ("10.0.16299", "14.11"),
        "15.5" => ("10.0.16299", "14.12"),
        "15.6" => ("10.0.16299", "14.13"),
        "15.7" => ("10.0.17134", "14.14"),
        "15.8" => ("10.0.17134", "14.15"),
        "15.9" => ("10.0.17763", "14.16"),
        "16.0" => ("10.0.17763", "14.20"),
        "16.1" => ("10.0.18362", "14.21"),
        "16.2" => ("10.0.18362", "14.22"),
        "16.3" => ("10.0.18362", "14.23"),
        "16.4" => ("10.0.18362", "14.24"),
        "16.5" => ("10.0.18362", "14.25"),
        "16.6" => ("10.0.18362", "14.26"),
        "16.7" => ("10.0.18362", "14.27"),
        "16.8" => ("10.0.18362", "14.28"),
        "16.9" => ("10.0.19041", "14.28.16.9"),
        "16.10" => ("10.0.19041", "14.29.16.10"),
        "16.11" => ("10.0.19041", "14.29.16.11"),
        "17.0" => ("10.0.19041", "14.30.17.0"),
        "17.1" => ("10.0.19041", "14.31.17.1"),
        "17.2" => ("10.0.19041", "14.32.17.2"),
        "17.3" => ("10.0.19041", "14.33.17.3"),
        "17.4" => ("10.0.22621", "14.34.17.4"),
        "17.5" => ("10.0.22621", "14.35.17.5"),
        "17.6" => ("10.0.22621", "14.36.17.6"),
        "17.7" => ("10.0.22621", "14.37.17.7"),
        "17.8" => ("10.0.22621", "14.38.17.8"),
        "17.9" => ("10.0.22621", "14.39.17.9"),
        "17.10" => ("10.0.22621", "14.40.17.10"),
        "17.11" => ("10.0.22621", "14.41.17.11"),
        "18.0" => ("10.0.22621", "14.42.18.0"),
        _ => return None,
    })
}

/// VS15 (`15.x`) and VS16+ (`16.x`-`18.x`) manifests use different component
/// id schemas for the same concept.
enum Family {
    Vs15,
    Vs16Plus,
}

fn family_for(msvc_version: &str) -> Result<Family, Error> {
    if msvc_version.starts_with("15.") {
        Ok(Family::Vs15)
    } else {
        let major: u32 = msvc_version
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .with_context(|| format!("UnsupportedVersion: malformed MSVC version '{msvc_version}'"))?;
        if (16..=18).contains(&major) {
            Ok(Family::Vs16Plus)
        } else {
            anyhow::bail!("UnsupportedVersion: unknown MSVC version '{msvc_version}'")
        }
    }
}

/// The ARM/ARM64 component id arch suffix, uppercase, matching the original
/// tool's `ARM`/`ARM64` literal (x86/x64 are carried by the unsuffixed
/// `x86.x64` toolchain/workload ids and never appear as a suffix).
fn extra_arch_suffix(arch: Arch) -> Option<&'static str> {
    match arch {
        Arch::Arm => Some("ARM"),
        Arch::Arm64 => Some("ARM64"),
        Arch::X86 | Arch::X64 => None,
    }
}

/// Appends `id` to `roots` only if the index actually carries a variant for
/// it, avoiding noisy `ConstraintUnsatisfied` fallback warnings for
/// optional per-arch add-ons (ATL, ASAN) that a given manifest may lack.
fn push_if_present(index: &PackageIndex, roots: &mut Vec<String>, id: String) {
    if index.preferred(&id).is_some() {
        roots.push(id);
    }
}

/// Resolves the root package id set to hand to the dependency resolver,
/// given an optional `--msvc-version` pin, an optional `--sdk-version` pin,
/// and the set of requested target architectures.
///
/// Mirrors the original tool's `setPackageSelection`: without a pinned MSVC
/// version, the default workload is accompanied by ATL (and, for VS16+
/// manifests carrying it, ASAN) add-ons for every non-x86/x64 target arch,
/// since `x86.x64` coverage already comes from the workload itself.
pub fn resolve_roots(
    index: &PackageIndex,
    msvc_version: Option<&str>,
    sdk_version: Option<&str>,
    target_arches: &BTreeSet<Arch>,
    ignore: &mut BTreeSet<String>,
) -> Result<Vec<String>, Error> {
    let mut roots = vec![DEFAULT_WORKLOAD.to_owned()];
    // Set once a preset has already pinned its own SDK package id, so the
    // unpinned-default "latest SDK" add-on below isn't also appended.
    let mut preset_pinned_sdk = false;

    match msvc_version {
        Some(msvc_version) => {
            let family = family_for(msvc_version)?;
            let resolved = version_table(msvc_version).and_then(|(sdk, toolversion)| {
                let toolchain_id = match family {
                    Family::Vs15 => format!("Microsoft.VisualStudio.Component.VC.Tools.{toolversion}"),
                    Family::Vs16Plus => format!("Microsoft.VisualStudio.Component.VC.{toolversion}.x86.x64"),
                };
                index
                    .preferred(&toolchain_id)
                    .is_some()
                    .then_some((sdk, toolversion, toolchain_id))
            });

            match resolved {
                Some((sdk, toolversion, toolchain_id)) => {
                    preset_pinned_sdk = true;
                    match family {
                        Family::Vs15 => {
                            roots.push(format!("Win10SDK_{sdk}"));
                            roots.push(toolchain_id);
                        }
                        Family::Vs16Plus => {
                            roots.push(sdk_package_id(sdk));
                            roots.push(toolchain_id);
                            push_if_present(
                                index,
                                &mut roots,
                                format!("Microsoft.VisualStudio.Component.VC.{toolversion}.ATL"),
                            );
                            push_if_present(
                                index,
                                &mut roots,
                                format!("Microsoft.VisualStudio.Component.VC.{toolversion}.ASAN"),
                            );
                            for arch in target_arches {
                                let Some(suffix) = extra_arch_suffix(*arch) else {
                                    continue;
                                };
                                push_if_present(
                                    index,
                                    &mut roots,
                                    format!("Microsoft.VisualStudio.Component.VC.{toolversion}.{suffix}"),
                                );
                                push_if_present(
                                    index,
                                    &mut roots,
                                    format!("Microsoft.VisualStudio.Component.VC.{toolversion}.ATL.{suffix}"),
                                );
                            }
                        }
                    }
                }
                None => {
                    tracing::warn!(
                        msvc_version,
                        "Didn't find exact version packages for {msvc_version}, falling back to default workload"
                    );
                    append_default_addons(index, &mut roots, target_arches);
                }
            }
        }
        None => append_default_addons(index, &mut roots, target_arches),
    }

    // An explicit `--sdk-version` always pins and ignores every other SDK,
    // even when a preset above already pinned its own. Otherwise, only fall
    // back to "latest SDK" when nothing above already pinned one.
    if sdk_version.is_some() || !preset_pinned_sdk {
        return finish_sdk(index, sdk_version, ignore, roots);
    }

    Ok(roots)
}

/// ATL/ASAN add-ons for the default (no `--msvc-version`) root set, covering
/// every non-x86/x64 target arch. x86/x64 coverage comes from the workload.
fn append_default_addons(index: &PackageIndex, roots: &mut Vec<String>, target_arches: &BTreeSet<Arch>) {
    push_if_present(index, roots, "Microsoft.VisualStudio.Component.VC.ATL".to_owned());

    for arch in target_arches {
        let Some(suffix) = extra_arch_suffix(*arch) else {
            continue;
        };
        push_if_present(
            index,
            roots,
            format!("Microsoft.VisualStudio.Component.VC.Tools.{suffix}"),
        );
        push_if_present(
            index,
            roots,
            format!("Microsoft.VisualStudio.Component.VC.ATL.{suffix}"),
        );
    }
}

fn finish_sdk(
    index: &PackageIndex,
    sdk_version: Option<&str>,
    ignore: &mut BTreeSet<String>,
    mut roots: Vec<String>,
) -> Result<Vec<String>, Error> {
    match sdk_version {
        Some(sdk_version) => {
            let id = pin_sdk_version(index, sdk_version, ignore)?;
            roots.push(id);
        }
        None => {
            if let Some(id) = latest_sdk_id(index) {
                roots.push(id);
            }
        }
    }

    Ok(roots)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manifest::Variant;

    fn sdk_variant(id: &str) -> Variant {
        Variant {
            id: id.to_owned(),
            version: None,
            kind: "Product".to_owned(),
            chip: None,
            machine_arch: None,
            product_arch: None,
            language: None,
            payloads: Vec::new(),
            dependencies: Default::default(),
            install_sizes: None,
            localized_resources: Vec::new(),
        }
    }

    #[test]
    fn latest_sdk_prefers_newer_build_regardless_of_major_label() {
        let index = PackageIndex::build(
            vec![
                sdk_variant("Win10SDK_10.0.17763"),
                sdk_variant("Win11SDK_10.0.22000"),
                sdk_variant("Win10SDK_10.0.19041"),
            ],
            Arch::X64,
        );

        assert_eq!(latest_sdk_id(&index).as_deref(), Some("Win11SDK_10.0.22000"));
    }

    #[test]
    fn pin_sdk_version_ignores_others() {
        let index = PackageIndex::build(
            vec![
                sdk_variant("Win10SDK_10.0.17763"),
                sdk_variant("Win10SDK_10.0.19041"),
            ],
            Arch::X64,
        );

        let mut ignore = BTreeSet::new();
        let id = pin_sdk_version(&index, "10.0.19041", &mut ignore).unwrap();
        assert_eq!(id, "Win10SDK_10.0.19041");
        assert!(ignore.contains("win10sdk_10.0.17763"));
        assert!(!ignore.contains("win10sdk_10.0.19041"));
    }

    #[test]
    fn pin_sdk_version_missing_lists_available() {
        let index = PackageIndex::build(vec![sdk_variant("Win10SDK_10.0.17763")], Arch::X64);
        let mut ignore = BTreeSet::new();
        let err = pin_sdk_version(&index, "10.0.99999", &mut ignore).unwrap_err();
        assert!(err.to_string().contains("SDKNotFound"));
        assert!(err.to_string().contains("10.0.17763"));
    }

    #[test]
    fn sdk_package_id_switches_to_win11_at_22000() {
        assert_eq!(sdk_package_id("10.0.19041"), "Win10SDK_10.0.19041");
        assert_eq!(sdk_package_id("10.0.22621"), "Win11SDK_10.0.22621");
    }

    #[test]
    fn vs16_preset_pins_toolchain_sdk_and_arch_addons() {
        let variants = vec![
            sdk_variant("Microsoft.VisualStudio.Component.VC.14.38.17.8.x86.x64"),
            sdk_variant("Microsoft.VisualStudio.Component.VC.14.38.17.8.ATL"),
            sdk_variant("Microsoft.VisualStudio.Component.VC.14.38.17.8.ARM64"),
            sdk_variant("Microsoft.VisualStudio.Component.VC.14.38.17.8.ATL.ARM64"),
            sdk_variant("Win11SDK_10.0.22621"),
        ];
        let index = PackageIndex::build(variants, Arch::X64);
        let mut ignore = BTreeSet::new();
        let target_arches: BTreeSet<Arch> = [Arch::X64, Arch::Arm64].into_iter().collect();

        let roots = resolve_roots(&index, Some("17.8"), None, &target_arches, &mut ignore).unwrap();

        assert!(roots.contains(&"Win11SDK_10.0.22621".to_owned()));
        assert!(roots.contains(&"Microsoft.VisualStudio.Component.VC.14.38.17.8.x86.x64".to_owned()));
        assert!(roots.contains(&"Microsoft.VisualStudio.Component.VC.14.38.17.8.ATL".to_owned()));
        assert!(roots.contains(&"Microsoft.VisualStudio.Component.VC.14.38.17.8.ARM64".to_owned()));
        assert!(roots.contains(&"Microsoft.VisualStudio.Component.VC.14.38.17.8.ATL.ARM64".to_owned()));
    }

    #[test]
    fn unknown_msvc_version_is_fatal() {
        let index = PackageIndex::build(Vec::new(), Arch::X64);
        let mut ignore = BTreeSet::new();
        let err = resolve_roots(&index, Some("99.9"), None, &BTreeSet::new(), &mut ignore).unwrap_err();
        assert!(err.to_string().contains("UnsupportedVersion"));
    }

    #[test]
    fn missing_version_specific_toolchain_falls_back_to_default() {
        let index = PackageIndex::build(Vec::new(), Arch::X64);
        let mut ignore = BTreeSet::new();
        let roots = resolve_roots(&index, Some("17.8"), None, &BTreeSet::new(), &mut ignore).unwrap();
        assert_eq!(roots, vec![DEFAULT_WORKLOAD.to_owned()]);
    }
}
