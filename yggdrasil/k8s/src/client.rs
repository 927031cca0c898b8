use anyhow::{ensure, Context, Result};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Connection settings for one source cluster, as they appear in the
/// `clusters` section of the config file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceCluster {
    /// Logical name used in metric labels and on normalized ingresses.
    pub name: String,

    pub api_server: String,
    pub ca: Option<PathBuf>,

    /// Bearer token, either inline or read from a file at request time.
    pub token: Option<String>,
    pub token_path: Option<PathBuf>,

    /// Excludes this cluster's endpoints from serving whenever another
    /// cluster can serve the same host.
    pub maintenance: bool,
}

impl SourceCluster {
    /// The label identifying this cluster in logs and metrics.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.api_server
        } else {
            &self.name
        }
    }
}

/// Builds an API client for one source cluster.
pub fn make_client(source: &SourceCluster) -> Result<Client> {
    let url = source
        .api_server
        .parse::<http::Uri>()
        .with_context(|| format!("invalid API server address {:?}", source.api_server))?;
    let mut config = Config::new(url);

    if let Some(path) = &source.ca {
        let pem = std::fs::read(path)
            .with_context(|| format!("failed to read CA bundle {}", path.display()))?;
        let certs = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("failed to parse CA bundle {}", path.display()))?;
        ensure!(
            !certs.is_empty(),
            "CA bundle {} contains no certificates",
            path.display()
        );
        config.root_cert = Some(certs.into_iter().map(|c| c.as_ref().to_vec()).collect());
    }

    if let Some(path) = &source.token_path {
        config.auth_info.token_file = Some(path.display().to_string());
    } else if let Some(token) = &source.token {
        config.auth_info.token = Some(token.clone().into());
    }

    Client::try_from(config)
        .with_context(|| format!("failed to build client for {}", source.label()))
}

/// Builds an API client from a kubeconfig file.
pub async fn kubeconfig_client(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("invalid kubeconfig {}", path.display()))?;
    Client::try_from(config)
        .with_context(|| format!("failed to build client for kubeconfig {}", path.display()))
}
