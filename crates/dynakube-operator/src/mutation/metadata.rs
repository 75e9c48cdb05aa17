//! Enriches pods with metadata of their namespace and workload.
//!
//! The enrichment ends up in two places: pod annotations below [`METADATA_PREFIX`], summarized as
//! one JSON document in [`METADATA_ANNOTATION`], and `--attribute` arguments for the init container.

use std::collections::BTreeMap;

use const_format::concatcp;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use snafu::{ResultExt, Snafu};

use crate::{
    crd::{
        DynaKube,
        status::{EnrichmentRule, EnrichmentRuleType},
    },
    mutation::{args::InitArgs, workload::Workload},
    selector::LabelSelectorExt,
};

pub const METADATA_PREFIX: &str = "metadata.dynatrace.com/";

/// Holds all emitted metadata as a JSON object, keys without prefix.
pub const METADATA_ANNOTATION: &str = "metadata.dynatrace.com";

pub const WORKLOAD_KIND_ANNOTATION: &str = concatcp!(METADATA_PREFIX, "k8s.workload.kind");
pub const WORKLOAD_NAME_ANNOTATION: &str = concatcp!(METADATA_PREFIX, "k8s.workload.name");

const ATTRIBUTE_ARG: &str = "attribute";
const METADATA_ENRICHMENT_FLAG: &str = "metadata-enrichment";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize the pod metadata"))]
    SerializeMetadata { source: serde_json::Error },

    #[snafu(display("failed to encode metadata attribute {key:?}"))]
    EncodeAttribute {
        source: crate::mutation::args::Error,
        key: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Whether pods in `namespace` get enriched by `dynakube`.
pub fn is_enabled(dynakube: &DynaKube, namespace: &Namespace) -> bool {
    if !dynakube.is_metadata_enrichment_enabled()
        || !dynakube.feature_flags().is_metadata_enrichment_injection()
    {
        return false;
    }

    let Some(selector) = &dynakube.spec.metadata_enrichment.namespace_selector else {
        return true;
    };
    let labels = namespace.metadata.labels.clone().unwrap_or_default();
    selector.matches(&labels).unwrap_or_else(|error| {
        tracing::warn!(%error, "invalid metadata enrichment namespace selector, skipping enrichment");
        false
    })
}

/// Writes namespace and workload metadata onto `pod` and appends the matching init arguments.
pub fn enrich(
    pod: &mut Pod,
    namespace: &Namespace,
    rules: &[EnrichmentRule],
    workload: &Workload,
    args: &mut InitArgs,
) -> Result<()> {
    let annotations = pod.metadata.annotations.get_or_insert_default();

    for (key, value) in namespace.metadata.annotations.iter().flatten() {
        if key.starts_with(METADATA_PREFIX) {
            annotations
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }

    let mut emitted: BTreeMap<String, String> = annotations
        .iter()
        .filter_map(|(key, value)| {
            let key = key.strip_prefix(METADATA_PREFIX)?;
            Some((key.to_owned(), value.clone()))
        })
        .collect();

    for rule in rules {
        let Some(value) = rule_source(namespace, rule) else {
            tracing::debug!(rule.source = %rule.source, "namespace lacks the rule's source, skipping");
            continue;
        };

        if rule.target.is_empty() {
            let key = format!("k8s.namespace.{}.{}", rule.type_, rule.source);
            emitted.insert(key, value.to_owned());
        } else {
            let value = annotations
                .entry(format!("{METADATA_PREFIX}{}", rule.target))
                .or_insert_with(|| value.to_owned());
            emitted.insert(rule.target.clone(), value.clone());
        }
    }

    let serialized = serde_json::to_string(&emitted).context(SerializeMetadataSnafu)?;
    annotations
        .entry(METADATA_ANNOTATION.to_owned())
        .or_insert(serialized);

    for (key, value) in &emitted {
        add_attribute(args, key, value)?;
    }
    add_attribute(args, "k8s.workload.kind", &workload.kind)?;
    add_attribute(args, "k8s.workload.name", &workload.name)?;
    add_attribute(args, "dt.kubernetes.workload.kind", &workload.kind)?;
    add_attribute(args, "dt.kubernetes.workload.name", &workload.name)?;
    args.flag(METADATA_ENRICHMENT_FLAG)
        .context(EncodeAttributeSnafu {
            key: METADATA_ENRICHMENT_FLAG,
        })?;

    annotations.insert(WORKLOAD_KIND_ANNOTATION.to_owned(), workload.kind.to_lowercase());
    annotations.insert(WORKLOAD_NAME_ANNOTATION.to_owned(), workload.name.clone());

    Ok(())
}

fn rule_source<'a>(namespace: &'a Namespace, rule: &EnrichmentRule) -> Option<&'a str> {
    let source = match rule.type_ {
        EnrichmentRuleType::Label => namespace.metadata.labels.as_ref(),
        EnrichmentRuleType::Annotation => namespace.metadata.annotations.as_ref(),
    };
    source?.get(&rule.source).map(String::as_str)
}

fn add_attribute(args: &mut InitArgs, key: &str, value: &str) -> Result<()> {
    args.arg(ATTRIBUTE_ARG, format!("{key}={value}"))
        .context(EncodeAttributeSnafu { key })?;
    Ok(())
}
