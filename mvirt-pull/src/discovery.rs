//! Simple and meta discovery of ACI asset locations.
//!
//! Simple discovery builds the asset URL directly from name, version, OS and
//! architecture. Meta discovery fetches `https://{name}?ac-discovery=1` and
//! renders the URL template announced in its `ac-discovery` meta tags.

use crate::error::{PullError, Result};
use regex::Regex;
use reqwest::Url;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::debug;

pub const DEFAULT_EXTENSION: &str = "aci";

static META_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta\s[^>]*>").expect("valid regex"));

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z][a-z0-9-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid regex")
});

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*\}").expect("valid regex"));

/// Operating system and architecture tokens as used in ACI asset names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Detect the running kernel and machine via uname(2).
    pub fn detect() -> Self {
        match nix::sys::utsname::uname() {
            Ok(uts) => Self {
                os: normalize_os(&uts.sysname().to_string_lossy()),
                arch: normalize_arch(&uts.machine().to_string_lossy()),
            },
            Err(e) => {
                debug!(error = %e, "uname failed, using compile-time platform");
                Self {
                    os: normalize_os(std::env::consts::OS),
                    arch: normalize_arch(std::env::consts::ARCH),
                }
            }
        }
    }
}

/// Lower-case the kernel name (`Linux` → `linux`).
pub fn normalize_os(sysname: &str) -> String {
    sysname.to_lowercase()
}

/// Map a machine name to the spelling ACI asset names use.
pub fn normalize_arch(machine: &str) -> String {
    match machine {
        "x86_64" | "x86-64" | "amd64" => "amd64",
        "i386" | "i486" | "i586" | "i686" | "x86" => "i386",
        "aarch64" | "arm64" => "aarch64",
        "aarch64_be" | "arm64-be" => "aarch64_be",
        "ppc64le" | "powerpc64le" | "ppc64-le" => "ppc64le",
        "ppc64" | "powerpc64" => "ppc64",
        other => other,
    }
    .to_string()
}

/// Parsed version label.
///
/// Either a bare version (`v2.0.0`) or `key=value` pairs
/// (`version=v2.0.0,os=linux`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub version: String,
    pub os: Option<String>,
    pub arch: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl Labels {
    pub fn parse(label: &str) -> Result<Self> {
        let label = label.trim();
        if !label.contains('=') {
            if label.is_empty() || label.contains(',') {
                return Err(PullError::InvalidArgument(format!(
                    "invalid version label '{label}'"
                )));
            }
            return Ok(Self {
                version: label.to_string(),
                os: None,
                arch: None,
                extra: BTreeMap::new(),
            });
        }

        let mut version = None;
        let mut os = None;
        let mut arch = None;
        let mut extra = BTreeMap::new();

        for pair in label.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(PullError::InvalidArgument(format!(
                    "label '{pair}' is not a key=value pair"
                )));
            };
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(PullError::InvalidArgument(format!("empty label in '{pair}'")));
            }
            match key {
                "version" => version = Some(value.to_string()),
                "os" => os = Some(value.to_string()),
                "arch" => arch = Some(normalize_arch(value)),
                _ => {
                    extra.insert(key.to_string(), value.to_string());
                }
            }
        }

        let version = version.ok_or_else(|| {
            PullError::InvalidArgument(format!("label '{label}' has no version"))
        })?;

        Ok(Self {
            version,
            os,
            arch,
            extra,
        })
    }
}

/// Everything needed to locate one image.
#[derive(Debug, Clone)]
pub struct DiscoveryTarget {
    pub name: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub ext: String,
    pub extra: BTreeMap<String, String>,
}

impl DiscoveryTarget {
    /// Label overrides win over the detected platform.
    pub fn new(name: &str, labels: Labels, platform: Platform, ext: &str) -> Self {
        Self {
            name: name.to_string(),
            version: labels.version,
            os: labels.os.unwrap_or(platform.os),
            arch: labels.arch.unwrap_or(platform.arch),
            ext: ext.to_string(),
            extra: labels.extra,
        }
    }

    /// `{scheme}://{name}-{version}-{os}-{arch}.{ext}`
    pub fn simple_url(&self, scheme: &str) -> Result<Url> {
        let raw = format!(
            "{scheme}://{}-{}-{}-{}.{}",
            self.name, self.version, self.os, self.arch, self.ext
        );
        Url::parse(&raw)
            .map_err(|e| PullError::InvalidArgument(format!("invalid discovery URL {raw}: {e}")))
    }

    /// `{scheme}://{name}?ac-discovery=1`
    pub fn meta_url(&self, scheme: &str) -> Result<Url> {
        let raw = format!("{scheme}://{}?ac-discovery=1", self.name);
        Url::parse(&raw)
            .map_err(|e| PullError::InvalidArgument(format!("invalid discovery URL {raw}: {e}")))
    }

    /// Resolve the asset URL from a meta discovery document.
    ///
    /// Picks the `ac-discovery` entry with the longest prefix matching the
    /// image name whose template can be fully rendered.
    pub fn resolve(&self, document: &str) -> Result<Url> {
        let mut candidates: Vec<(String, String)> = discovery_entries(document)
            .into_iter()
            .filter(|(prefix, _)| self.name.starts_with(prefix.as_str()))
            .collect();
        candidates.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        for (prefix, template) in candidates {
            let Some(rendered) = self.render(&template) else {
                debug!(prefix = %prefix, template = %template, "Skipping template with unknown placeholders");
                continue;
            };
            return Url::parse(&rendered).map_err(|e| {
                PullError::Discovery(format!("invalid asset URL {rendered}: {e}"))
            });
        }

        Err(PullError::Discovery(format!(
            "no ac-discovery entry matches {}",
            self.name
        )))
    }

    fn render(&self, template: &str) -> Option<String> {
        let mut rendered = template
            .replace("{name}", &self.name)
            .replace("{version}", &self.version)
            .replace("{os}", &self.os)
            .replace("{arch}", &self.arch)
            .replace("{ext}", &self.ext);
        for (key, value) in &self.extra {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }

        if PLACEHOLDER.is_match(&rendered) {
            None
        } else {
            Some(rendered)
        }
    }
}

/// Collect `(prefix, template)` pairs from `ac-discovery` meta tags.
fn discovery_entries(document: &str) -> Vec<(String, String)> {
    let mut entries = Vec::new();

    for tag in META_TAG.find_iter(document) {
        let mut name = None;
        let mut content = None;
        for attr in ATTRIBUTE.captures_iter(tag.as_str()) {
            let value = attr.get(2).or_else(|| attr.get(3)).map(|m| m.as_str());
            match attr[1].to_ascii_lowercase().as_str() {
                "name" => name = value,
                "content" => content = value,
                _ => {}
            }
        }

        if name != Some("ac-discovery") {
            continue;
        }
        let mut parts = content.unwrap_or_default().split_whitespace();
        if let (Some(prefix), Some(template)) = (parts.next(), parts.next()) {
            entries.push((prefix.to_string(), template.to_string()));
        }
    }

    entries
}
