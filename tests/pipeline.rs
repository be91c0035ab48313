//! End-to-end exercise of manifest parsing -> index -> resolve -> extract ->
//! post-process against synthetic, local-only data (no network).

use camino::Utf8PathBuf as PathBuf;
use std::{collections::BTreeMap, fs};
use vsget::{
    constraints::ConstraintOptions,
    extract,
    manifest::{Constraint, ConstraintType, Variant},
    index::PackageIndex,
    postprocess, resolve, Arch,
};

fn variant(id: &str, deps: &[(&str, ConstraintType)]) -> Variant {
    let mut dependencies = BTreeMap::new();
    for (dep_id, typ) in deps {
        dependencies.insert(
            (*dep_id).to_owned(),
            Constraint {
                typ: *typ,
                ..Default::default()
            },
        );
    }

    Variant {
        id: id.to_owned(),
        version: Some("1.0".to_owned()),
        kind: "Component".to_owned(),
        chip: Some("x64".to_owned()),
        machine_arch: None,
        product_arch: None,
        language: Some("en-us".to_owned()),
        payloads: Vec::new(),
        dependencies,
        install_sizes: None,
        localized_resources: Vec::new(),
    }
}

fn write_fixture_vsix(path: &PathBuf) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();

    zip.start_file("Contents/VC/Include/Windows.h", options).unwrap();
    zip.write_all(b"#include <Other.H>\n").unwrap();

    zip.start_file("Contents/VC/Include/Other.H", options).unwrap();
    zip.write_all(b"// nothing\n").unwrap();

    zip.start_file("$MSBuild/Microsoft.Cpp.props", options).unwrap();
    zip.write_all(b"<Project/>\n").unwrap();

    zip.finish().unwrap();
}

/// A second package's payload, landing under a different canonical subtree
/// (`Windows Kits`) than [`write_fixture_vsix`]'s `VC`, so a test extracting
/// both into one shared staging root (as `main.rs` does for every selected
/// variant) actually exercises cross-package tree-merging.
fn write_fixture_sdk_vsix(path: &PathBuf) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();

    zip.start_file("Contents/Windows Kits/10/Include/um/Winbase.h", options)
        .unwrap();
    zip.write_all(b"// sdk header\n").unwrap();

    zip.finish().unwrap();
}

#[test]
fn resolves_downloads_and_normalizes_a_small_toolchain() {
    use std::io::Write as _;

    let tmp = tempfile::tempdir().unwrap();
    let root = PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();

    // Build a tiny manifest: a root component depending on one required and
    // one optional package, plus a second required package (the SDK) whose
    // payload lands under a different canonical subtree, so extracting the
    // whole selection must merge both into one shared staging tree.
    let variants = vec![
        variant(
            "Microsoft.VisualStudio.Workload.VCTools",
            &[
                ("Microsoft.VC.Tools.Base", ConstraintType::Required),
                ("Microsoft.VC.Tools.Docs", ConstraintType::Optional),
                ("Win10SDK_10.0.19041", ConstraintType::Required),
            ],
        ),
        variant("Microsoft.VC.Tools.Base", &[]),
        variant("Microsoft.VC.Tools.Docs", &[]),
        variant("Win10SDK_10.0.19041", &[]),
    ];

    let index = PackageIndex::build(variants, Arch::X64);

    let opts = ConstraintOptions {
        ignore: Default::default(),
        include_optional: false,
        skip_recommended: false,
        only_host: true,
        host: Arch::X64,
        target_arches: [Arch::X64].into_iter().collect(),
    };

    let roots = vec!["Microsoft.VisualStudio.Workload.VCTools".to_owned()];
    let selection = resolve::aggregate(&index, &roots, &opts);

    // The optional doc package must be excluded, both required packages must
    // be present.
    let ids: Vec<_> = selection.entries.iter().map(|v| v.id.as_str()).collect();
    assert!(ids.contains(&"Microsoft.VC.Tools.Base"));
    assert!(ids.contains(&"Win10SDK_10.0.19041"));
    assert!(!ids.contains(&"Microsoft.VC.Tools.Docs"));

    // Simulate two payloads already sitting in staging VSIXes and extract
    // every selected package straight into one shared staging root, exactly
    // as `main.rs`'s pipeline does for the whole selection (no per-package
    // subdirectory), so the two packages' canonical subtrees must merge.
    let vc_vsix_path = root.join("base.vsix");
    write_fixture_vsix(&vc_vsix_path);
    let sdk_vsix_path = root.join("sdk.vsix");
    write_fixture_sdk_vsix(&sdk_vsix_path);

    let staging = root.join("staging");
    fs::create_dir_all(&staging).unwrap();

    let base_key = resolve::PackageKey::new(
        selection
            .entries
            .iter()
            .find(|v| v.id == "Microsoft.VC.Tools.Base")
            .unwrap(),
    );
    extract::extract_variant(
        &base_key,
        extract::ExtractAction::Vsix {
            payload_path: &vc_vsix_path,
        },
        &staging,
    )
    .unwrap();

    let sdk_key = resolve::PackageKey::new(
        selection
            .entries
            .iter()
            .find(|v| v.id == "Win10SDK_10.0.19041")
            .unwrap(),
    );
    extract::extract_variant(
        &sdk_key,
        extract::ExtractAction::Vsix {
            payload_path: &sdk_vsix_path,
        },
        &staging,
    )
    .unwrap();

    assert!(staging.join("VC/Include/Windows.h").exists());
    assert!(staging.join("MSBuild/Microsoft.Cpp.props").exists());
    assert!(staging.join("Windows Kits/10/Include/um/Winbase.h").exists());

    // Relocating the *shared* staging root (not a per-package subdirectory)
    // must find both canonical subtrees.
    let dest = root.join("dest");
    fs::create_dir_all(&dest).unwrap();
    postprocess::relocate_canonical(&staging, &dest).unwrap();

    let include_dir = dest.join("VC/Include");
    assert!(include_dir.exists());
    assert!(dest.join("Windows Kits/10/Include/um/Winbase.h").exists());

    postprocess::lowercase_tree(&include_dir).unwrap();
    postprocess::rewrite_includes(&include_dir).unwrap();

    assert!(include_dir.join("windows.h").exists());
    assert!(include_dir.join("other.h").exists());

    let rewritten = fs::read_to_string(include_dir.join("windows.h")).unwrap();
    assert_eq!(rewritten, "#include <other.h>\n");
}

#[test]
fn ignored_and_arch_mismatched_packages_never_appear_in_selection() {
    let variants = vec![
        variant("Root", &[("Ignored", ConstraintType::Required)]),
        variant("Ignored", &[]),
    ];
    let index = PackageIndex::build(variants, Arch::X64);

    let mut opts = ConstraintOptions {
        ignore: Default::default(),
        include_optional: true,
        skip_recommended: false,
        only_host: false,
        host: Arch::X64,
        target_arches: [Arch::X64].into_iter().collect(),
    };
    opts.ignore.insert("ignored".to_owned());

    let selection = resolve::aggregate(&index, &["Root".to_owned()], &opts);
    assert_eq!(selection.entries.len(), 1);
    assert_eq!(selection.entries[0].id, "Root");
}
