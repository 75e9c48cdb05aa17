use std::collections::BTreeSet;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use strum::Display;

use crate::dtclient::{Client, Result};

/// Key of the API token in the tokens secret.
pub const API_TOKEN_KEY: &str = "apiToken";
/// Key of the PaaS token in the tokens secret.
pub const PAAS_TOKEN_KEY: &str = "paasToken";
pub const DATA_INGEST_TOKEN_KEY: &str = "dataIngestToken";

pub const SCOPE_INSTALLER_DOWNLOAD: &str = "InstallerDownload";
pub const SCOPE_DATA_EXPORT: &str = "DataExport";
pub const SCOPE_READ_CONFIG: &str = "ReadConfig";
pub const SCOPE_WRITE_CONFIG: &str = "WriteConfig";
pub const SCOPE_ACTIVEGATE_TOKEN_CREATE: &str = "activeGateTokenManagement.create";
pub const SCOPE_ENTITIES_READ: &str = "entities.read";
pub const SCOPE_SETTINGS_READ: &str = "settings.read";
pub const SCOPE_SETTINGS_WRITE: &str = "settings.write";
pub const SCOPE_METRICS_INGEST: &str = "metrics.ingest";
pub const SCOPE_LOGS_INGEST: &str = "logs.ingest";
pub const SCOPE_OTLP_TRACE_INGEST: &str = "openTelemetryTrace.ingest";

/// The purpose a token is used for.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[strum(serialize_all = "kebab-case")]
pub enum TokenKind {
    /// The API token, used for everything that reads or writes tenant data.
    DataPlane,
    /// The PaaS token, used to download installers and fetch connection info.
    Installer,
}

/// The two tokens a [`Client`] authenticates with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tokens {
    data_plane: String,
    installer: String,
}

impl Tokens {
    pub fn new(data_plane: impl Into<String>, installer: impl Into<String>) -> Self {
        Self {
            data_plane: data_plane.into(),
            installer: installer.into(),
        }
    }

    /// Reads both tokens from the data of the tokens secret. Without a PaaS token the API token
    /// is used for installer requests as well.
    pub fn from_secret_data<'a>(mut get: impl FnMut(&str) -> Option<&'a str>) -> Self {
        let api_token = get(API_TOKEN_KEY).unwrap_or_default().trim();
        let paas_token = get(PAAS_TOKEN_KEY)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .unwrap_or(api_token);
        Self::new(api_token, paas_token)
    }

    pub fn is_empty(&self) -> bool {
        self.data_plane.is_empty() && self.installer.is_empty()
    }

    /// Returns the token for `kind`, or `None` if it is not set.
    pub fn select(&self, kind: TokenKind) -> Option<&str> {
        let token = match kind {
            TokenKind::DataPlane => &self.data_plane,
            TokenKind::Installer => &self.installer,
        };

        Some(token.as_str()).filter(|token| !token.is_empty())
    }
}

/// Set of scopes granted to a token.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct TokenScopes(BTreeSet<String>);

impl TokenScopes {
    pub fn contains(&self, scope: &str) -> bool {
        self.0.contains(scope)
    }

    pub fn contains_all(&self, scopes: &[&str]) -> bool {
        self.missing(scopes).is_empty()
    }

    pub fn missing<'a>(&self, scopes: &[&'a str]) -> Vec<&'a str> {
        scopes
            .iter()
            .copied()
            .filter(|scope| !self.contains(scope))
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for TokenScopes {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Serialize)]
struct TokenLookupRequest<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct TokenLookupResponse {
    #[serde(default)]
    scopes: TokenScopes,
}

impl Client {
    /// Looks up which scopes `token` has been granted.
    #[tracing::instrument(skip_all)]
    pub async fn get_token_scopes(&self, token: &str) -> Result<TokenScopes> {
        let request = self
            .request(Method::POST, "/v1/tokens/lookup", TokenKind::DataPlane)?
            .json(&TokenLookupRequest { token });

        let response: TokenLookupResponse = self.execute_json(request).await?;
        Ok(response.scopes)
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};
    use rstest::rstest;

    use super::*;
    use crate::dtclient::tests::{API_TOKEN, client};

    #[rstest]
    #[case(Tokens::new("api", "paas"), TokenKind::DataPlane, Some("api"))]
    #[case(Tokens::new("api", "paas"), TokenKind::Installer, Some("paas"))]
    #[case(Tokens::new("api", ""), TokenKind::Installer, None)]
    #[case(Tokens::new("", "paas"), TokenKind::DataPlane, None)]
    #[case(Tokens::default(), TokenKind::Installer, None)]
    fn select(#[case] tokens: Tokens, #[case] kind: TokenKind, #[case] expected: Option<&str>) {
        assert_eq!(tokens.select(kind), expected);
    }

    #[test]
    fn from_secret_data_falls_back_to_api_token() {
        let tokens = Tokens::from_secret_data(|key| match key {
            API_TOKEN_KEY => Some(" api\n"),
            _ => None,
        });
        assert_eq!(tokens, Tokens::new("api", "api"));
    }

    #[test]
    fn scopes() {
        let scopes: TokenScopes = [SCOPE_DATA_EXPORT, SCOPE_READ_CONFIG].into_iter().collect();
        assert!(scopes.contains_all(&[SCOPE_DATA_EXPORT]));
        assert!(!scopes.contains_all(&[SCOPE_DATA_EXPORT, SCOPE_SETTINGS_WRITE]));
        assert_eq!(
            scopes.missing(&[SCOPE_SETTINGS_WRITE, SCOPE_READ_CONFIG]),
            [SCOPE_SETTINGS_WRITE]
        );
    }

    #[tokio::test]
    async fn lookup_scopes() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/tokens/lookup")
            .match_header("authorization", format!("Api-Token {API_TOKEN}").as_str())
            .match_body(Matcher::Json(serde_json::json!({"token": "some-token"})))
            .with_body(r#"{"id":"dt0c01.ABC","scopes":["DataExport","InstallerDownload"]}"#)
            .create_async()
            .await;

        let scopes = client(&server).get_token_scopes("some-token").await.unwrap();
        assert!(scopes.contains_all(&[SCOPE_DATA_EXPORT, SCOPE_INSTALLER_DOWNLOAD]));
        mock.assert_async().await;
    }
}
