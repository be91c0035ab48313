//! Resolution and acquisition pipeline for a self-contained MSVC C++ toolchain
//! tree: fetch the official channel/installer manifest, resolve a transitive
//! dependency closure under user constraints, download hash-verified payloads
//! through a content-addressed cache, extract VSIX/MSI payloads with tree
//! merging, and post-process the result for use on case-sensitive filesystems.

use anyhow::Error;
pub use camino::{Utf8Path as Path, Utf8PathBuf as PathBuf};
use std::fmt;

pub mod constraints;
mod ctx;
pub mod download;
pub mod extract;
pub mod index;
pub mod manifest;
pub mod postprocess;
pub mod presets;
pub mod resolve;
pub mod util;

pub use ctx::Ctx;
pub use ureq;

/// A target/host architecture, using the same notation Microsoft's manifests
/// use (`x86`, `x64`, `arm`, `arm64`), rather than LLVM triple components.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Arch {
    X86,
    X64,
    Arm,
    Arm64,
}

impl Arch {
    pub const ALL: [Self; 4] = [Self::X86, Self::X64, Self::Arm, Self::Arm64];

    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::X64 => "x64",
            Self::Arm => "arm",
            Self::Arm64 => "arm64",
        }
    }

    /// Best-effort detection of the architecture of the host this process is
    /// running on, used as the default `--host-arch`.
    pub fn host() -> Self {
        match std::env::consts::ARCH {
            "x86" => Self::X86,
            "aarch64" => Self::Arm64,
            "arm" => Self::Arm,
            _ => Self::X64,
        }
    }
}

impl std::str::FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "x86" => Self::X86,
            "x64" | "x86_64" => Self::X64,
            "arm" => Self::Arm,
            "arm64" | "aarch64" => Self::Arm64,
            o => anyhow::bail!("unknown architecture '{o}'"),
        })
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arch_roundtrip() {
        for arch in Arch::ALL {
            assert_eq!(arch, arch.as_str().parse().unwrap());
        }
    }
}
