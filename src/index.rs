//! Package indexing and arch-aware variant priority (spec §4.2).

use crate::{manifest::Variant, Arch};
use std::collections::BTreeMap;

/// Variants grouped by lowercased id, each group sorted so the best-fit
/// variant under the host architecture is at index 0.
pub struct PackageIndex {
    groups: BTreeMap<String, Vec<Variant>>,
}

fn arch_rank(tag: Option<&str>, host: Arch) -> u8 {
    match tag {
        None => 1,
        Some(t) if t.eq_ignore_ascii_case("neutral") => 1,
        Some(t) if t.eq_ignore_ascii_case(host.as_str()) => 0,
        Some(_) => 2,
    }
}

fn lang_rank(language: Option<&str>) -> u8 {
    match language {
        Some(l) if l.to_ascii_lowercase().starts_with("en") => 0,
        _ => 1,
    }
}

/// Total order used to sort variants of the same id; lower sorts first.
fn priority_key(v: &Variant, host: Arch) -> (u8, u8, u8, u8) {
    (
        arch_rank(v.chip.as_deref(), host),
        arch_rank(v.machine_arch.as_deref(), host),
        arch_rank(v.product_arch.as_deref(), host),
        lang_rank(v.language.as_deref()),
    )
}

impl PackageIndex {
    pub fn build(variants: Vec<Variant>, host: Arch) -> Self {
        let mut groups: BTreeMap<String, Vec<Variant>> = BTreeMap::new();
        for variant in variants {
            groups
                .entry(variant.id.to_lowercase())
                .or_default()
                .push(variant);
        }

        for group in groups.values_mut() {
            group.sort_by_key(|v| priority_key(v, host));
        }

        Self { groups }
    }

    /// All variants sharing `id` (case-insensitive), in priority order.
    pub fn get(&self, id: &str) -> Option<&[Variant]> {
        self.groups.get(&id.to_lowercase()).map(Vec::as_slice)
    }

    /// The highest-priority variant for `id`, if any exist.
    pub fn preferred(&self, id: &str) -> Option<&Variant> {
        self.get(id).and_then(|g| g.first())
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variant> {
        self.groups.values().flatten()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manifest::Variant;

    fn variant(id: &str, chip: Option<&str>, language: Option<&str>) -> Variant {
        Variant {
            id: id.to_owned(),
            version: None,
            kind: "Component".to_owned(),
            chip: chip.map(str::to_owned),
            machine_arch: None,
            product_arch: None,
            language: language.map(str::to_owned),
            payloads: Vec::new(),
            dependencies: Default::default(),
            install_sizes: None,
            localized_resources: Vec::new(),
        }
    }

    #[test]
    fn host_arch_wins_priority() {
        let variants = vec![
            variant("Foo", Some("arm64"), Some("en-us")),
            variant("Foo", Some("x64"), Some("en-us")),
            variant("Foo", None, Some("en-us")),
        ];

        let index = PackageIndex::build(variants, Arch::X64);
        let preferred = index.preferred("foo").unwrap();
        assert_eq!(preferred.chip.as_deref(), Some("x64"));
    }

    #[test]
    fn language_tiebreaks_after_arch() {
        let variants = vec![
            variant("Foo", Some("x64"), Some("de-de")),
            variant("Foo", Some("x64"), Some("en-us")),
        ];

        let index = PackageIndex::build(variants, Arch::X64);
        let preferred = index.preferred("foo").unwrap();
        assert_eq!(preferred.language.as_deref(), Some("en-us"));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let index = PackageIndex::build(vec![variant("Microsoft.Foo.Bar", None, None)], Arch::X64);
        assert!(index.get("microsoft.foo.bar").is_some());
    }
}
