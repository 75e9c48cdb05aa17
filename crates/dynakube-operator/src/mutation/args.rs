//! Command line of the init container.
//!
//! The bootstrapper splits its command line on whitespace and reads arguments in order, so
//! argument names must not contain whitespace or `=`. Values are passed through unquoted.
//! Repeated arguments are kept, the consumer decides what a repetition means.

use snafu::{Snafu, ensure};

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("argument name must not be empty"))]
    EmptyName,

    #[snafu(display("argument name {name:?} must not contain '=' or whitespace"))]
    InvalidName { name: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitArgs {
    args: Vec<String>,
}

impl InitArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues an existing argument vector, e.g. the args of an already injected init container.
    pub fn from_existing(args: Vec<String>) -> Self {
        Self { args }
    }

    /// Appends `--<name>`.
    pub fn flag(&mut self, name: &str) -> Result<&mut Self> {
        validate_name(name)?;
        self.args.push(format!("--{name}"));
        Ok(self)
    }

    /// Appends `--<name>=<value>`.
    pub fn arg(&mut self, name: &str, value: impl AsRef<str>) -> Result<&mut Self> {
        validate_name(name)?;
        self.args.push(format!("--{name}={}", value.as_ref()));
        Ok(self)
    }

    /// Appends `--<name>=<value>` if `value` is set and not empty.
    pub fn optional_arg(&mut self, name: &str, value: Option<&str>) -> Result<&mut Self> {
        match value.filter(|value| !value.is_empty()) {
            Some(value) => self.arg(name, value),
            None => Ok(self),
        }
    }

    pub fn contains_flag(&self, name: &str) -> bool {
        let flag = format!("--{name}");
        self.args.iter().any(|arg| *arg == flag)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.args
    }

    pub fn build(self) -> Vec<String> {
        self.args
    }
}

fn validate_name(name: &str) -> Result<()> {
    ensure!(!name.is_empty(), EmptyNameSnafu);
    ensure!(
        !name.contains('=') && !name.contains(char::is_whitespace),
        InvalidNameSnafu { name }
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn keeps_order_and_duplicates() {
        let mut args = InitArgs::new();
        args.arg("attribute", "k8s.pod.name=app")
            .unwrap()
            .flag("is-fullstack")
            .unwrap()
            .arg("attribute", "k8s.pod.name=app")
            .unwrap()
            .optional_arg("flavor", None)
            .unwrap()
            .optional_arg("technology", Some(""))
            .unwrap();

        assert!(args.contains_flag("is-fullstack"));
        assert!(!args.contains_flag("attribute"));
        assert_eq!(
            args.build(),
            [
                "--attribute=k8s.pod.name=app",
                "--is-fullstack",
                "--attribute=k8s.pod.name=app"
            ]
        );
    }

    #[rstest]
    #[case("", Error::EmptyName)]
    #[case("key=value", Error::InvalidName { name: "key=value".to_owned() })]
    #[case("two words", Error::InvalidName { name: "two words".to_owned() })]
    #[case("tab\tbed", Error::InvalidName { name: "tab\tbed".to_owned() })]
    fn invalid_names(#[case] name: &str, #[case] expected: Error) {
        let mut args = InitArgs::new();
        assert_eq!(args.flag(name).unwrap_err(), expected);
        assert_eq!(args.arg(name, "value").unwrap_err(), expected);
        assert!(args.as_slice().is_empty());
    }

    #[test]
    fn continues_existing_args() {
        let mut args = InitArgs::from_existing(vec!["bootstrap".to_owned()]);
        args.arg("target", "/mnt/bin").unwrap();
        assert_eq!(args.build(), ["bootstrap", "--target=/mnt/bin"]);
    }
}
