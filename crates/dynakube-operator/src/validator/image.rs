//! Container image references as understood by container runtimes.

use std::sync::LazyLock;

use regex::Regex;

const PATH_COMPONENT_FMT: &str = "[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*";
const TAG_FMT: &str = r"[\w][\w.-]{0,127}";
const DIGEST_FMT: &str = "[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}";
const REGISTRY_FMT: &str = r"(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*(?::[0-9]+)?|\[[0-9a-fA-F:]+\](?::[0-9]+)?";

static PATH_COMPONENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{PATH_COMPONENT_FMT}$"))
        .expect("failed to compile image path component regex")
});

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{TAG_FMT}$")).expect("failed to compile image tag regex"));

static DIGEST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{DIGEST_FMT}$")).expect("failed to compile image digest regex")
});

static REGISTRY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^(?:{REGISTRY_FMT})$")).expect("failed to compile image registry regex")
});

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference<'a> {
    /// Only set if the reference names a registry explicitly.
    pub registry: Option<&'a str>,
    pub repository: &'a str,
    pub tag: Option<&'a str>,
    pub digest: Option<&'a str>,
}

impl<'a> ImageReference<'a> {
    /// Parses `registry/repository:tag@digest`. Returns `None` if `image` is not a valid reference.
    pub fn parse(image: &'a str) -> Option<Self> {
        let (name_and_tag, digest) = match image.split_once('@') {
            Some((name, digest)) => (name, Some(digest)),
            None => (image, None),
        };
        if digest.is_some_and(|digest| !DIGEST_REGEX.is_match(digest)) {
            return None;
        }

        // A colon after the last slash separates the tag, any other colon belongs to the registry port.
        let last_slash = name_and_tag.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
            Some(i) => (
                &name_and_tag[..last_slash + i],
                Some(&name_and_tag[last_slash + i + 1..]),
            ),
            None => (name_and_tag, None),
        };
        if tag.is_some_and(|tag| !TAG_REGEX.is_match(tag)) {
            return None;
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_registry(first) => (Some(first), rest),
            _ => (None, name),
        };
        if registry.is_some_and(|registry| !REGISTRY_REGEX.is_match(registry)) {
            return None;
        }
        if repository.is_empty()
            || !repository
                .split('/')
                .all(|component| PATH_COMPONENT_REGEX.is_match(component))
        {
            return None;
        }

        Some(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host without port.
    pub fn registry_host(&self) -> Option<&'a str> {
        let registry = self.registry?;
        if let Some(rest) = registry.strip_prefix('[') {
            return rest.split(']').next();
        }
        registry.split(':').next()
    }
}

/// The first path component is a registry if it looks like a host name.
fn is_registry(component: &str) -> bool {
    component.contains(['.', ':']) || component == "localhost" || component.starts_with('[')
}
