//! Canonical path identity for archive entries.
//!
//! Layers are inconsistent about how they spell top-level entries (`x` vs
//! `./x`, `dir` vs `dir/`). Every shadowing and deletion decision is made on
//! the canonical form so equivalent spellings compare equal across layers.

/// Basename prefix marking an AUFS whiteout entry.
pub(crate) const WHITEOUT_PREFIX: &str = ".wh.";

/// Canonicalize an archive entry path: strip a single leading `./` and the
/// trailing `/` of non-root paths. `..` components are never collapsed.
pub(crate) fn canonicalize(raw: &str) -> String {
    let path = raw.strip_prefix("./").unwrap_or(raw);
    let path = match path.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => path,
    };
    if path.is_empty() {
        String::from(".")
    } else {
        path.to_string()
    }
}

/// Whether `candidate` is `prefix` itself or inside its subtree.
///
/// Membership requires a whole component boundary: `foo` contains `foo/bar`
/// but not `foobar`.
pub(crate) fn is_under(prefix: &str, candidate: &str) -> bool {
    match candidate.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Decode a whiteout entry name into the canonical path it deletes.
///
/// Returns `None` when the basename does not carry the whiteout prefix.
pub(crate) fn whiteout_target(canonical: &str) -> Option<String> {
    let (parent, name) = match canonical.rsplit_once('/') {
        Some((parent, name)) => (Some(parent), name),
        None => (None, canonical),
    };
    let deleted = name.strip_prefix(WHITEOUT_PREFIX)?;
    Some(match parent {
        Some(parent) => format!("{parent}/{deleted}"),
        None => deleted.to_string(),
    })
}
