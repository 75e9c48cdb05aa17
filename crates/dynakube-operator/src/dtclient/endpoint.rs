//! Parsing of the communication endpoints the Dynatrace API hands out.

use std::{fmt::Display, ops::Range};

use indexmap::IndexSet;
use snafu::{OptionExt, Snafu, ensure};
use url::Url;

use crate::crd::status::CommunicationHostStatus;

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum EndpointError {
    #[snafu(display("endpoint is empty"))]
    EmptyEndpoint,

    #[snafu(display("endpoint {endpoint:?} is malformed"))]
    MalformedEndpoint { endpoint: String },

    #[snafu(display("endpoint {endpoint:?} has a malformed port"))]
    MalformedPort { endpoint: String },

    #[snafu(display("endpoint {endpoint:?} uses unsupported scheme {scheme:?}, expected http or https"))]
    UnsupportedScheme { endpoint: String, scheme: String },
}

/// A single `{protocol, host, port}` triple a OneAgent can connect to.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct CommunicationHost {
    pub protocol: String,
    pub host: String,
    pub port: u32,
}

impl Display for CommunicationHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.protocol, self.host, self.port)
    }
}

impl From<CommunicationHost> for CommunicationHostStatus {
    fn from(value: CommunicationHost) -> Self {
        Self {
            protocol: value.protocol,
            host: value.host,
            port: value.port,
        }
    }
}

/// Parses a single absolute `http` or `https` URL.
///
/// An explicit port may be any unsigned 32-bit number. Without one, 80 is used for `http` and 443
/// for `https`.
pub fn parse_endpoint(endpoint: &str) -> Result<CommunicationHost, EndpointError> {
    let endpoint = endpoint.trim();
    ensure!(!endpoint.is_empty(), EmptyEndpointSnafu);

    // The url crate only knows 16-bit ports, so the port is cut out and parsed separately.
    let (without_port, explicit_port) = match explicit_port_range(endpoint) {
        Some(range) => (
            format!("{}{}", &endpoint[..range.start - 1], &endpoint[range.end..]),
            Some(&endpoint[range]).filter(|port| !port.is_empty()),
        ),
        None => (endpoint.to_owned(), None),
    };

    let url = Url::parse(&without_port).map_err(|error| match error {
        url::ParseError::InvalidPort => EndpointError::MalformedPort {
            endpoint: endpoint.to_owned(),
        },
        url::ParseError::RelativeUrlWithoutBase => EndpointError::UnsupportedScheme {
            endpoint: endpoint.to_owned(),
            scheme: String::new(),
        },
        _ => EndpointError::MalformedEndpoint {
            endpoint: endpoint.to_owned(),
        },
    })?;

    let protocol = url.scheme();
    ensure!(
        matches!(protocol, "http" | "https"),
        UnsupportedSchemeSnafu {
            endpoint,
            scheme: protocol
        }
    );

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .context(MalformedEndpointSnafu { endpoint })?;

    let port = match explicit_port {
        Some(port) => port
            .parse::<u32>()
            .ok()
            .context(MalformedPortSnafu { endpoint })?,
        None => url
            .port_or_known_default()
            .map(u32::from)
            .context(MalformedPortSnafu { endpoint })?,
    };

    Ok(CommunicationHost {
        protocol: protocol.to_owned(),
        host: host.trim_start_matches('[').trim_end_matches(']').to_owned(),
        port,
    })
}

/// Byte range of the port in the authority of `endpoint`, excluding the colon.
fn explicit_port_range(endpoint: &str) -> Option<Range<usize>> {
    let authority_start = endpoint.find("://")? + 3;
    let authority_end = endpoint[authority_start..]
        .find(['/', '?', '#'])
        .map_or(endpoint.len(), |end| authority_start + end);
    let authority = &endpoint[authority_start..authority_end];

    let host_start = authority.rfind('@').map_or(0, |at| at + 1);
    let colon = authority.rfind(':').filter(|colon| *colon >= host_start)?;

    // IPv6 literals contain colons
    let host = &authority[host_start..colon];
    if host.starts_with('[') && !host.ends_with(']') {
        return None;
    }

    Some(authority_start + colon + 1..authority_end)
}

/// Parses every entry of a comma separated endpoint list.
///
/// Entries that fail to parse are logged and skipped, duplicates are collapsed.
pub fn parse_endpoints(endpoints: &str) -> Vec<CommunicationHost> {
    parse_endpoint_list(endpoints.split(','))
}

pub fn parse_endpoint_list<'a>(endpoints: impl IntoIterator<Item = &'a str>) -> Vec<CommunicationHost> {
    let mut hosts = IndexSet::new();

    for endpoint in endpoints {
        match parse_endpoint(endpoint) {
            Ok(host) => {
                hosts.insert(host);
            }
            Err(error) => tracing::warn!(%error, "skipping invalid communication endpoint"),
        }
    }

    hosts.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn host(protocol: &str, host: &str, port: u32) -> CommunicationHost {
        CommunicationHost {
            protocol: protocol.to_owned(),
            host: host.to_owned(),
            port,
        }
    }

    #[rstest]
    #[case("https://h/p", host("https", "h", 443))]
    #[case("https://h:9/p", host("https", "h", 9))]
    #[case("http://h/p", host("http", "h", 80))]
    #[case("http://h:8080", host("http", "h", 8080))]
    #[case("https://10.0.0.1:9999/communication", host("https", "10.0.0.1", 9999))]
    #[case("https://[::1]:9999/communication", host("https", "::1", 9999))]
    #[case("  https://h/p  ", host("https", "h", 443))]
    #[case("https://h:99999/p", host("https", "h", 99999))]
    #[case("https://h:4294967295", host("https", "h", u32::MAX))]
    #[case("https://user:secret@h:9999/p", host("https", "h", 9999))]
    #[case("https://[::1]/communication", host("https", "::1", 443))]
    #[case("http://h:/p", host("http", "h", 80))]
    fn parse_valid(#[case] input: &str, #[case] expected: CommunicationHost) {
        assert_eq!(parse_endpoint(input), Ok(expected));
    }

    #[rstest]
    #[case("", EndpointError::EmptyEndpoint)]
    #[case("x://h", EndpointError::UnsupportedScheme { endpoint: "x://h".to_owned(), scheme: "x".to_owned() })]
    #[case("unix:///f", EndpointError::UnsupportedScheme { endpoint: "unix:///f".to_owned(), scheme: "unix".to_owned() })]
    #[case("ftp://h/file", EndpointError::UnsupportedScheme { endpoint: "ftp://h/file".to_owned(), scheme: "ftp".to_owned() })]
    #[case("https://h:port/p", EndpointError::MalformedPort { endpoint: "https://h:port/p".to_owned() })]
    #[case("https://h:4294967296/p", EndpointError::MalformedPort { endpoint: "https://h:4294967296/p".to_owned() })]
    #[case("https://h:-1/p", EndpointError::MalformedPort { endpoint: "https://h:-1/p".to_owned() })]
    fn parse_invalid(#[case] input: &str, #[case] expected: EndpointError) {
        assert_eq!(parse_endpoint(input), Err(expected));
    }

    #[rstest]
    #[case("h:80/p")]
    #[case("/relative/path")]
    #[case("https://")]
    fn parse_invalid_any_kind(#[case] input: &str) {
        assert!(parse_endpoint(input).is_err());
    }

    #[test]
    fn list_drops_invalid_and_duplicates() {
        let hosts = parse_endpoints(
            "https://a.example.com/communication,ftp://b,https://a.example.com:443/communication,,http://c:8080",
        );
        assert_eq!(hosts, [
            host("https", "a.example.com", 443),
            host("http", "c", 8080)
        ]);
    }

    #[test]
    fn list_is_empty_if_everything_fails() {
        assert!(parse_endpoints("ftp://a,unix:///b").is_empty());
    }
}
