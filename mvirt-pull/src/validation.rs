//! Name validation for image names and local machine names.

use regex::Regex;
use std::sync::LazyLock;

/// AC identifiers: lower-case alphanumerics separated by single `-._~/`.
static AC_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+([-._~/][a-z0-9]+)*$").expect("valid regex"));

/// One hostname label.
static HOST_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid regex"));

const MAX_ACI_NAME_LEN: usize = 512;
const MAX_MACHINE_NAME_LEN: usize = 64;

/// Check that `name` is a valid ACI image name, e.g. `example.com/app`.
pub fn aci_name_is_valid(name: &str) -> bool {
    name.len() <= MAX_ACI_NAME_LEN && AC_IDENTIFIER.is_match(name)
}

/// Check that `name` can be used as a local machine image name.
///
/// Follows hostname rules: dot-separated labels, no empty labels, at most 64 bytes.
pub fn machine_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_MACHINE_NAME_LEN {
        return false;
    }

    name.split('.').all(|label| HOST_LABEL.is_match(label))
}
