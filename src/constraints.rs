//! Constraint filters applied at every dependency edge (spec §4.3).

use crate::{
    manifest::{ConstraintType, Variant},
    Arch,
};
use std::collections::BTreeSet;

/// Why a candidate variant was rejected, used by the resolver's diagnostic
/// printers to annotate dropped edges.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    Ignored,
    Optional,
    Recommended,
    HostArchMismatch,
    TargetArchMismatch,
    NotFound,
}

impl Rejection {
    pub fn label(self) -> &'static str {
        match self {
            Self::Ignored => "Ignored",
            Self::Optional => "Optional",
            Self::Recommended => "Recommended",
            Self::HostArchMismatch => "HostArchMismatch",
            Self::TargetArchMismatch => "TargetArchMismatch",
            Self::NotFound => "NotFound",
        }
    }
}

pub struct ConstraintOptions {
    /// Lowercased ids that are never selected.
    pub ignore: BTreeSet<String>,
    pub include_optional: bool,
    pub skip_recommended: bool,
    pub only_host: bool,
    pub host: Arch,
    pub target_arches: BTreeSet<Arch>,
}

impl ConstraintOptions {
    pub fn is_ignored(&self, id: &str) -> bool {
        self.ignore.contains(&id.to_lowercase())
    }

    pub fn type_rejection(&self, typ: ConstraintType) -> Option<Rejection> {
        match typ {
            ConstraintType::Optional if !self.include_optional => Some(Rejection::Optional),
            ConstraintType::Recommended if self.skip_recommended => Some(Rejection::Recommended),
            _ => None,
        }
    }

    /// A variant matches the host architecture if none of its arch tags
    /// (when present and not `neutral`) disagree with `host`, and its id does
    /// not contain a `hostX` marker for a different architecture.
    pub fn matches_host_arch(&self, variant: &Variant) -> bool {
        if !self.only_host {
            return true;
        }

        let lower_id = variant.id.to_lowercase();
        for arch in Arch::ALL {
            let marker = format!("host{}", arch.as_str());
            if lower_id.contains(&marker) && arch != self.host {
                return false;
            }
        }

        for tag in [
            variant.chip.as_deref(),
            variant.machine_arch.as_deref(),
            variant.product_arch.as_deref(),
        ] {
            if let Some(t) = tag {
                if !t.eq_ignore_ascii_case("neutral") && !t.eq_ignore_ascii_case(self.host.as_str())
                {
                    return false;
                }
            }
        }

        true
    }

    /// A variant matches the requested target architectures unless its id
    /// carries an explicit `.target<arch>` marker for an arch outside the set.
    pub fn matches_target_arch(&self, variant: &Variant) -> bool {
        match target_arch_marker(&variant.id) {
            Some(arch) => self.target_arches.contains(&arch),
            None => true,
        }
    }
}

/// Extracts the architecture captured by a `.target(x86|x64|arm|arm64)`
/// marker in a package id, matching the `\.target(x86|x64|arm|arm64)(\W|$)`
/// pattern from the original tooling.
fn target_arch_marker(id: &str) -> Option<Arch> {
    let lower = id.to_lowercase();
    let idx = lower.find(".target")?;
    let rest = &lower[idx + ".target".len()..];

    for arch in Arch::ALL {
        if let Some(tail) = rest.strip_prefix(arch.as_str()) {
            let ends = tail
                .chars()
                .next()
                .map_or(true, |c| !c.is_ascii_alphanumeric());
            if ends {
                return Some(arch);
            }
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manifest::Variant;

    fn variant(id: &str) -> Variant {
        Variant {
            id: id.to_owned(),
            version: None,
            kind: "Component".to_owned(),
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
    fn target_marker_is_detected() {
        assert_eq!(
            target_arch_marker("Microsoft.VC.Tools.targetx64"),
            Some(Arch::X64)
        );
        assert_eq!(
            target_arch_marker("Microsoft.VC.Tools.targetarm64.base"),
            Some(Arch::Arm64)
        );
        assert_eq!(target_arch_marker("Microsoft.VC.Tools.base"), None);
    }

    #[test]
    fn host_marker_disqualifies_other_hosts() {
        let opts = ConstraintOptions {
            ignore: Default::default(),
            include_optional: false,
            skip_recommended: false,
            only_host: true,
            host: Arch::X64,
            target_arches: [Arch::X64].into_iter().collect(),
        };

        let v = variant("Microsoft.VC.Tools.HostX86.Targetx64");
        assert!(!opts.matches_host_arch(&v));

        let v = variant("Microsoft.VC.Tools.HostX64.Targetx64");
        assert!(opts.matches_host_arch(&v));
    }
}
