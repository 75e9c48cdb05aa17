use serde::Deserialize;

use crate::dtclient::{Client, Result, TokenKind};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ClusterInfo {
    #[serde(default)]
    pub version: String,
}

impl Client {
    /// Returns the version of the Dynatrace cluster the tenant runs on.
    pub async fn get_cluster_info(&self) -> Result<ClusterInfo> {
        self.get_json("/v1/config/clusterversion", TokenKind::DataPlane)
            .await
    }
}
