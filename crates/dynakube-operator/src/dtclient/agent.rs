//! OneAgent installer metadata and downloads.

use md5::{Digest, Md5};
use reqwest::Method;
use serde::Deserialize;
use snafu::{ResultExt, ensure};
use strum::{AsRefStr, Display};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::dtclient::{
    BodyReadSnafu, CancelledSnafu, Client, EmptyVersionSnafu, Result, TokenKind,
    WriteDownloadSnafu,
};

pub const FLAVOR_DEFAULT: &str = "default";
pub const FLAVOR_MULTIDISTRO: &str = "multidistro";
pub const FLAVOR_MUSL: &str = "musl";

pub const ARCH_X86: &str = "x86";
pub const ARCH_ARM: &str = "arm";
pub const ARCH_PPCLE: &str = "ppcle";
pub const ARCH_S390: &str = "s390";

#[derive(Clone, Copy, Debug, AsRefStr, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum Os {
    Unix,
    Windows,
}

#[derive(Clone, Copy, Debug, AsRefStr, Display, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum InstallerType {
    Default,
    Paas,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestVersionResponse {
    #[serde(default)]
    latest_agent_version: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionsResponse {
    #[serde(default)]
    available_versions: Vec<String>,
}

impl Client {
    /// Returns the newest agent version the tenant offers for `os` and `installer_type`.
    #[tracing::instrument(skip(self))]
    pub async fn get_latest_agent_version(
        &self,
        os: Os,
        installer_type: InstallerType,
    ) -> Result<String> {
        let path = format!("/v1/deployment/installer/agent/{os}/{installer_type}/latest/metainfo");
        let response: LatestVersionResponse = self.get_json(&path, TokenKind::Installer).await?;

        ensure!(!response.latest_agent_version.is_empty(), EmptyVersionSnafu);
        Ok(response.latest_agent_version)
    }

    /// Lists every agent version available for the given platform.
    #[tracing::instrument(skip(self))]
    pub async fn get_agent_versions(
        &self,
        os: Os,
        installer_type: InstallerType,
        flavor: &str,
        arch: &str,
    ) -> Result<Vec<String>> {
        let path = format!("/v1/deployment/installer/agent/versions/{os}/{installer_type}");
        let request = self
            .request(Method::GET, &path, TokenKind::Installer)?
            .query(&platform_query(flavor, arch));

        let response: VersionsResponse = self.execute_json(request).await?;
        Ok(response.available_versions)
    }

    /// Streams the installer for `version` into `sink` and returns the MD5 of the download.
    #[tracing::instrument(skip(self, sink))]
    pub async fn download_agent<W>(
        &self,
        os: Os,
        installer_type: InstallerType,
        flavor: &str,
        arch: &str,
        version: &str,
        sink: &mut W,
    ) -> Result<String>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let path = format!("/v1/deployment/installer/agent/{os}/{installer_type}/version/{version}");
        let request = self
            .request(Method::GET, &path, TokenKind::Installer)?
            .query(&platform_query(flavor, arch));

        let mut response = self.send(request).await?;
        if !response.status().is_success() {
            let status = response.status();
            let headers = response.headers().clone();
            let body = self.read_body(response).await?;
            return Err(self.error_from_response(status, &headers, &body));
        }

        let url = response.url().to_string();
        let mut hasher = Md5::new();
        loop {
            let chunk = tokio::select! {
                () = self.cancellation.cancelled() => return CancelledSnafu { url }.fail(),
                chunk = response.chunk() => chunk.context(BodyReadSnafu { url: url.clone() })?,
            };
            let Some(chunk) = chunk else {
                break;
            };

            hasher.update(&chunk);
            sink.write_all(&chunk).await.context(WriteDownloadSnafu)?;
        }
        sink.flush().await.context(WriteDownloadSnafu)?;

        let md5 = format!("{:x}", hasher.finalize());
        tracing::info!(%version, %md5, "downloaded agent installer");
        Ok(md5)
    }
}

fn platform_query<'a>(flavor: &'a str, arch: &'a str) -> Vec<(&'static str, &'a str)> {
    let mut query = Vec::with_capacity(3);
    if !flavor.is_empty() {
        query.push(("flavor", flavor));
    }
    if !arch.is_empty() {
        query.push(("arch", arch));
    }
    query.push(("bitness", "64"));
    query
}
