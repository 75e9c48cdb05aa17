//! Name and label checks mirroring the rules of the Kubernetes API server.
//!
//! Running them at admission time lets us deny a DynaKube with a readable message instead of
//! failing later while creating the derived resources.

use std::{fmt::Display, sync::LazyLock};

use const_format::concatcp;
use regex::Regex;
use snafu::Snafu;

/// DynaKube names are used as a prefix for derived resources (e.g. `<name>-oneagent-tenant-secret`),
/// so they are capped well below the DNS limit.
pub const DYNAKUBE_NAME_MAX_LENGTH: usize = 40;

const RFC_1035_LABEL_FMT: &str = "[a-z]([-a-z0-9]*[a-z0-9])?";
const RFC_1035_LABEL_ERROR_MSG: &str = "a DNS-1035 label must consist of lower case alphanumeric characters or '-', start with an alphabetic character, and end with an alphanumeric character";

const LABEL_VALUE_MAX_LENGTH: usize = 63;
const LABEL_VALUE_FMT: &str = "(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?";
const LABEL_VALUE_ERROR_MSG: &str = "a valid label value must be an empty string or consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character";

const LABEL_NAME_MAX_LENGTH: usize = 63;
const LABEL_NAME_FMT: &str = "([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]";
const RFC_1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";
const LABEL_PREFIX_FMT: &str = concatcp!(RFC_1123_LABEL_FMT, "(\\.", RFC_1123_LABEL_FMT, ")*");
const LABEL_PREFIX_MAX_LENGTH: usize = 253;
const LABEL_KEY_ERROR_MSG: &str = "a valid label key must consist of an optional DNS subdomain prefix and '/', followed by a name of alphanumeric characters, '-', '_' or '.' that starts and ends with an alphanumeric character";

static RFC_1035_LABEL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1035_LABEL_FMT}$")).expect("failed to compile RFC 1035 label regex")
});

static LABEL_VALUE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{LABEL_VALUE_FMT}$")).expect("failed to compile label value regex")
});

static LABEL_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{LABEL_NAME_FMT}$")).expect("failed to compile label name regex")
});

static LABEL_PREFIX_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{LABEL_PREFIX_FMT}$")).expect("failed to compile label prefix regex")
});

type Result<T = (), E = Errors> = std::result::Result<T, E>;

/// A collection of errors discovered during validation.
#[derive(Debug)]
pub struct Errors(Vec<Error>);

impl Display for Errors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Errors {}

/// A single validation error.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("{msg} (regex used for validation is {regex:?})"))]
    Regex {
        msg: &'static str,
        regex: &'static str,
    },

    #[snafu(display("input is {length} bytes long but must be no more than {max_length}"))]
    TooLong { length: usize, max_length: usize },
}

fn validate_str_length(value: &str, max_length: usize) -> Result<(), Error> {
    if value.len() > max_length {
        return TooLongSnafu {
            length: value.len(),
            max_length,
        }
        .fail();
    }
    Ok(())
}

fn validate_str_regex(value: &str, regex: &'static Regex, msg: &'static str) -> Result<(), Error> {
    if regex.is_match(value) {
        return Ok(());
    }

    RegexSnafu {
        msg,
        regex: regex
            .as_str()
            .trim_start_matches('^')
            .trim_end_matches('$'),
    }
    .fail()
}

/// Returns [`Ok`] if *all* validations are [`Ok`], otherwise returns all errors.
fn validate_all(validations: impl IntoIterator<Item = Result<(), Error>>) -> Result {
    let errors: Vec<_> = validations.into_iter().filter_map(Result::err).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Errors(errors))
    }
}

/// Checks that `name` is a DNS-1035 label short enough to be used as a DynaKube name.
pub fn is_dynakube_name(name: &str) -> Result {
    validate_all([
        validate_str_length(name, DYNAKUBE_NAME_MAX_LENGTH),
        validate_str_regex(name, &RFC_1035_LABEL_REGEX, RFC_1035_LABEL_ERROR_MSG),
    ])
}

/// Checks a label value the same way the API server does. The empty string is a valid value.
pub fn is_label_value(value: &str) -> Result {
    validate_all([
        validate_str_length(value, LABEL_VALUE_MAX_LENGTH),
        validate_str_regex(value, &LABEL_VALUE_REGEX, LABEL_VALUE_ERROR_MSG),
    ])
}

/// Checks a (possibly prefixed) label key such as `app.kubernetes.io/name`.
pub fn is_label_key(key: &str) -> Result {
    match key.split_once('/') {
        Some((prefix, name)) => validate_all([
            validate_str_length(prefix, LABEL_PREFIX_MAX_LENGTH),
            validate_str_regex(prefix, &LABEL_PREFIX_REGEX, LABEL_KEY_ERROR_MSG),
            validate_str_length(name, LABEL_NAME_MAX_LENGTH),
            validate_str_regex(name, &LABEL_NAME_REGEX, LABEL_KEY_ERROR_MSG),
        ]),
        None => validate_all([
            validate_str_length(key, LABEL_NAME_MAX_LENGTH),
            validate_str_regex(key, &LABEL_NAME_REGEX, LABEL_KEY_ERROR_MSG),
        ]),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("dynakube")]
    #[case("a")]
    #[case("dynakube-1")]
    #[case("a-b-c-d")]
    #[case(&"a".repeat(40))]
    fn dynakube_name_pass(#[case] name: &str) {
        assert!(is_dynakube_name(name).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("-dynakube")]
    #[case("dynakube-")]
    #[case("1dynakube")]
    #[case("DynaKube")]
    #[case("dyna_kube")]
    #[case("dyna.kube")]
    #[case(&"a".repeat(41))]
    fn dynakube_name_fail(#[case] name: &str) {
        assert!(is_dynakube_name(name).is_err());
    }

    #[test]
    fn too_long_and_malformed_reports_both() {
        let name = format!("-{}", "a".repeat(40));
        let err = is_dynakube_name(&name).expect_err("name must be rejected");
        assert_eq!(err.0.len(), 2);
        assert!(err.to_string().contains("no more than 40"));
    }

    #[rstest]
    #[case("")]
    #[case("value")]
    #[case("v1.2.3")]
    #[case("my_value-1")]
    #[case(&"a".repeat(63))]
    fn label_value_pass(#[case] value: &str) {
        assert!(is_label_value(value).is_ok());
    }

    #[rstest]
    #[case("-value")]
    #[case("value_")]
    #[case("with space")]
    #[case("a/b")]
    #[case(&"a".repeat(64))]
    fn label_value_fail(#[case] value: &str) {
        assert!(is_label_value(value).is_err());
    }

    #[rstest]
    #[case("app")]
    #[case("app.kubernetes.io/name")]
    #[case("dynatrace.com/inject")]
    fn label_key_pass(#[case] key: &str) {
        assert!(is_label_key(key).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("/name")]
    #[case("Example.com/name")]
    #[case("example.com/-name")]
    fn label_key_fail(#[case] key: &str) {
        assert!(is_label_key(key).is_err());
    }
}
