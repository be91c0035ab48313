//! Transitive dependency closure resolution (spec §4.4) and the tree /
//! reverse-tree diagnostic printers (spec §6).

use crate::{
    constraints::{ConstraintOptions, Rejection},
    index::PackageIndex,
    manifest::{Constraint, Variant},
};
use std::{collections::BTreeSet, fmt};

/// Deterministic cache/dedup identifier over
/// `(id, version, chip, machineArch, productArch)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageKey(String);

impl PackageKey {
    pub fn new(v: &Variant) -> Self {
        let mut s = format!("{}-{}", v.id, v.version.as_deref().unwrap_or(""));
        if let Some(c) = &v.chip {
            s.push_str("-chip.");
            s.push_str(c);
        }
        if let Some(m) = &v.machine_arch {
            s.push_str("-machineArch.");
            s.push_str(m);
        }
        if let Some(p) = &v.product_arch {
            s.push_str("-productArch.");
            s.push_str(p);
        }
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The first-DFS-visit-order, duplicate-free (by [`PackageKey`]) closure of a
/// set of root package ids.
pub struct Selection {
    pub entries: Vec<Variant>,
}

/// Resolves `id` against `constraint` using only `chip`/`machineArch` (never
/// `productArch`) as documented in spec §4.3; falls back to the
/// priority-index-0 variant with a warning when nothing matches
/// (**ConstraintUnsatisfied**).
pub fn find_package<'a>(
    index: &'a PackageIndex,
    id: &str,
    constraint: &Constraint,
) -> Option<&'a Variant> {
    let group = index.get(id)?;

    let matched = group.iter().find(|v| {
        constraint.chip.as_deref().map_or(true, |c| {
            v.chip.as_deref().map_or(false, |vc| vc.eq_ignore_ascii_case(c))
        }) && constraint.machine_arch.as_deref().map_or(true, |c| {
            v.machine_arch
                .as_deref()
                .map_or(false, |vc| vc.eq_ignore_ascii_case(c))
        })
    });

    match matched {
        Some(v) => Some(v),
        None => {
            tracing::warn!(
                id,
                "ConstraintUnsatisfied: no variant matched constraints, falling back to priority variant"
            );
            group.first()
        }
    }
}

fn normalized_dependencies(variant: &Variant) -> impl Iterator<Item = (&str, &Constraint)> {
    variant
        .dependencies
        .iter()
        .map(|(dep_id, constraint)| (constraint.id.as_deref().unwrap_or(dep_id), constraint))
}

/// Builds the [`Selection`] by depth-first traversal from `roots`, applying
/// the constraint engine at every edge.
pub fn aggregate(index: &PackageIndex, roots: &[String], opts: &ConstraintOptions) -> Selection {
    let mut included = BTreeSet::new();
    let mut entries = Vec::new();

    for root in roots {
        visit(index, root, &Constraint::default(), opts, &mut included, &mut entries);
    }

    Selection { entries }
}

fn visit(
    index: &PackageIndex,
    id: &str,
    constraint: &Constraint,
    opts: &ConstraintOptions,
    included: &mut BTreeSet<PackageKey>,
    entries: &mut Vec<Variant>,
) {
    if opts.is_ignored(id) {
        tracing::debug!(id, "dependency ignored");
        return;
    }

    if let Some(rejection) = opts.type_rejection(constraint.typ) {
        tracing::debug!(id, reason = rejection.label(), "dependency skipped");
        return;
    }

    let Some(variant) = find_package(index, id, constraint) else {
        tracing::warn!(id, "PackageNotFound: dependency not present in manifest");
        return;
    };

    if !opts.matches_host_arch(variant) {
        tracing::debug!(id, reason = Rejection::HostArchMismatch.label(), "dependency skipped");
        return;
    }

    if !opts.matches_target_arch(variant) {
        tracing::debug!(id, reason = Rejection::TargetArchMismatch.label(), "dependency skipped");
        return;
    }

    let key = PackageKey::new(variant);
    if !included.insert(key) {
        return;
    }

    entries.push(variant.clone());

    for (dep_id, dep_constraint) in normalized_dependencies(variant) {
        visit(index, dep_id, dep_constraint, opts, included, entries);
    }
}

/// Status of one edge as seen by the diagnostic printers; `None` means the
/// edge was followed.
fn edge_status(
    index: &PackageIndex,
    id: &str,
    constraint: &Constraint,
    opts: &ConstraintOptions,
) -> (Option<Rejection>, Option<Variant>) {
    if opts.is_ignored(id) {
        return (Some(Rejection::Ignored), None);
    }
    if let Some(rejection) = opts.type_rejection(constraint.typ) {
        return (Some(rejection), None);
    }
    let Some(variant) = find_package(index, id, constraint) else {
        return (Some(Rejection::NotFound), None);
    };
    if !opts.matches_host_arch(variant) {
        return (Some(Rejection::HostArchMismatch), None);
    }
    if !opts.matches_target_arch(variant) {
        return (Some(Rejection::TargetArchMismatch), None);
    }
    (None, Some(variant.clone()))
}

/// Prints the dependency tree rooted at `roots`, annotating every dropped
/// edge; does not recurse through dropped nodes.
pub fn print_deps_tree(index: &PackageIndex, roots: &[String], opts: &ConstraintOptions) {
    for root in roots {
        print_tree_node(index, root, &Constraint::default(), opts, 0);
    }
}

fn print_tree_node(
    index: &PackageIndex,
    id: &str,
    constraint: &Constraint,
    opts: &ConstraintOptions,
    depth: usize,
) {
    let indent = "  ".repeat(depth);
    let (rejection, variant) = edge_status(index, id, constraint, opts);

    match (&rejection, &variant) {
        (Some(r), _) => println!("{indent}{id} ({})", r.label()),
        (None, Some(v)) => {
            println!("{indent}{id}");
            for (dep_id, dep_constraint) in normalized_dependencies(v) {
                print_tree_node(index, dep_id, dep_constraint, opts, depth + 1);
            }
        }
        (None, None) => unreachable!(),
    }
}

/// Prints, for each selected package, the set of other selected packages that
/// depend on it.
pub fn print_reverse_deps(selection: &Selection) {
    use std::collections::BTreeMap;

    let mut reverse: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for variant in &selection.entries {
        for (dep_id, _) in normalized_dependencies(variant) {
            reverse
                .entry(dep_id.to_lowercase())
                .or_default()
                .push(variant.id.clone());
        }
    }

    for variant in &selection.entries {
        let dependents = reverse.get(&variant.id.to_lowercase());
        println!("{}", variant.id);
        if let Some(dependents) = dependents {
            for dependent in dependents {
                println!("  <- {dependent}");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manifest::Payload;
    use std::collections::BTreeMap;

    fn variant(id: &str, deps: &[(&str, &str)]) -> Variant {
        let mut dependencies = BTreeMap::new();
        for (dep_id, version) in deps {
            dependencies.insert(
                (*dep_id).to_owned(),
                Constraint {
                    version: Some((*version).to_owned()),
                    ..Default::default()
                },
            );
        }

        Variant {
            id: id.to_owned(),
            version: Some("1.0".to_owned()),
            kind: "Component".to_owned(),
            chip: None,
            machine_arch: None,
            product_arch: None,
            language: None,
            payloads: vec![Payload {
                file_name: format!("{id}.bin"),
                url: format!("https://example/{id}"),
                size: Some(1),
                sha256: None,
            }],
            dependencies,
            install_sizes: None,
            localized_resources: Vec::new(),
        }
    }

    fn opts() -> ConstraintOptions {
        ConstraintOptions {
            ignore: Default::default(),
            include_optional: true,
            skip_recommended: false,
            only_host: false,
            host: crate::Arch::X64,
            target_arches: [crate::Arch::X64].into_iter().collect(),
        }
    }

    #[test]
    fn aggregate_is_duplicate_free_and_idempotent() {
        let variants = vec![
            variant("Root", &[("A", "1.0"), ("B", "1.0")]),
            variant("A", &[("B", "1.0")]),
            variant("B", &[]),
        ];

        let index = PackageIndex::build(variants, crate::Arch::X64);
        let roots = vec!["Root".to_owned()];
        let selection = aggregate(&index, &roots, &opts());

        assert_eq!(selection.entries.len(), 3);

        let mut keys: Vec<_> = selection.entries.iter().map(PackageKey::new).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 3);

        // P1: re-aggregating from the resulting ids is idempotent.
        let ids: Vec<_> = selection.entries.iter().map(|v| v.id.clone()).collect();
        let second = aggregate(&index, &ids, &opts());
        let mut second_keys: Vec<_> = second.entries.iter().map(PackageKey::new).collect();
        second_keys.sort();
        assert_eq!(keys, second_keys);
    }

    #[test]
    fn ignore_list_is_honored() {
        let variants = vec![
            variant("Root", &[("A", "1.0")]),
            variant("A", &[]),
        ];
        let index = PackageIndex::build(variants, crate::Arch::X64);
        let mut options = opts();
        options.ignore.insert("a".to_owned());

        let selection = aggregate(&index, &["Root".to_owned()], &options);
        assert!(selection.entries.iter().all(|v| v.id != "A"));
    }
}
