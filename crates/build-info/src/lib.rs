//! Build provenance for the Starlight binaries.

use once_cell::sync::Lazy;

#[derive(Debug)]
struct Provenance {
    id: &'static str,
    stamp: &'static str,
    revision: &'static str,
}

static PROVENANCE: Lazy<Provenance> = Lazy::new(|| Provenance {
    id: option_env!("STARLIGHT_BUILD_ID").unwrap_or("dev"),
    stamp: option_env!("STARLIGHT_BUILD_STAMP").unwrap_or("unknown"),
    revision: option_env!("STARLIGHT_BUILD_REVISION").unwrap_or("nogit"),
});

/// Full build identifier, `<revision>@<timestamp>` unless overridden at build time.
pub fn build_id() -> &'static str {
    PROVENANCE.id
}

/// UTC timestamp recorded when the crate was compiled.
pub fn build_stamp() -> &'static str {
    PROVENANCE.stamp
}

pub fn revision() -> &'static str {
    PROVENANCE.revision
}

/// One-line startup banner, e.g. `starlightd 0.1.0 (a1b2c3d4e5@2026-01-01T00:00:00Z)`.
pub fn banner(binary: &str, version: &str) -> String {
    format!("{binary} {version} ({})", build_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_carries_binary_and_version() {
        let line = banner("starlightd", "9.9.9");
        assert!(line.starts_with("starlightd 9.9.9 ("));
        assert!(line.ends_with(')'));
        assert!(line.contains(build_id()));
    }

    #[test]
    fn provenance_fields_are_populated() {
        assert!(!build_stamp().is_empty());
        assert!(!revision().is_empty());
    }
}
