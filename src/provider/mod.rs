//! Cluster provider abstraction
//!
//! A test environment needs exactly one cluster. It either comes from a
//! kubeconfig the caller already has, from a long-lived kind cluster that is
//! reused between runs, or from a throwaway kind cluster the harness creates
//! and deletes. The [`ClusterProvider`] trait hides the `kind` CLI so the
//! lifecycle decisions here can be unit tested.
//!
//! # Supported Providers
//!
//! - [`KindProvider`] - kind clusters via the `kind` CLI

mod kind;

pub use kind::KindProvider;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::config::EnvConfig;
use crate::namespace::random_suffix;
use crate::{Error, CLUSTER_NAME_PREFIX};

/// Name reported for clusters reached through a caller-supplied kubeconfig
pub const EXTERNAL_CLUSTER_NAME: &str = "external";

/// Everything needed to create one cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateClusterRequest {
    /// Cluster name
    pub name: String,
    /// Where the provider writes the cluster's kubeconfig
    pub kubeconfig: PathBuf,
    /// Node image override
    pub node_image: Option<String>,
}

/// Creates, inspects and deletes clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Create a cluster and write its kubeconfig
    async fn create_cluster(&self, request: &CreateClusterRequest) -> Result<(), Error>;

    /// Delete a cluster (missing clusters are not an error)
    async fn delete_cluster(&self, name: &str) -> Result<(), Error>;

    /// Whether a cluster with this name exists
    async fn cluster_exists(&self, name: &str) -> Result<bool, Error>;

    /// Write the kubeconfig of an existing cluster to `path`
    async fn export_kubeconfig(&self, name: &str, path: &Path) -> Result<(), Error>;
}

/// A cluster the environment is connected to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterHandle {
    /// Cluster name
    pub name: String,
    /// Kubeconfig used to reach it
    pub kubeconfig: PathBuf,
    /// Whether the harness created it and must delete it
    pub owned: bool,
}

/// Obtain the cluster described by `config`.
///
/// - a kubeconfig is used as-is and never torn down;
/// - with `reuse_existing` the named kind cluster is created only if missing
///   and is kept afterwards;
/// - otherwise a fresh `vap-library-<random>` cluster is created and owned.
pub async fn provision_cluster(
    provider: &dyn ClusterProvider,
    config: &EnvConfig,
) -> Result<ClusterHandle, Error> {
    if let Some(kubeconfig) = &config.kubeconfig {
        info!(kubeconfig = %kubeconfig.display(), "using existing cluster");
        return Ok(ClusterHandle {
            name: EXTERNAL_CLUSTER_NAME.to_string(),
            kubeconfig: kubeconfig.clone(),
            owned: false,
        });
    }

    if config.reuse_existing {
        let name = config.reuse_cluster_name().to_string();
        let kubeconfig = kubeconfig_path(&name);
        if provider.cluster_exists(&name).await? {
            info!(cluster = %name, "reusing kind cluster");
            provider.export_kubeconfig(&name, &kubeconfig).await?;
        } else {
            info!(cluster = %name, "creating reusable kind cluster");
            provider
                .create_cluster(&CreateClusterRequest {
                    name: name.clone(),
                    kubeconfig: kubeconfig.clone(),
                    node_image: config.node_image.clone(),
                })
                .await?;
        }
        return Ok(ClusterHandle {
            name,
            kubeconfig,
            owned: false,
        });
    }

    let name = format!("{}{}", CLUSTER_NAME_PREFIX, random_suffix(8));
    let kubeconfig = kubeconfig_path(&name);
    info!(cluster = %name, "creating kind cluster");
    provider
        .create_cluster(&CreateClusterRequest {
            name: name.clone(),
            kubeconfig: kubeconfig.clone(),
            node_image: config.node_image.clone(),
        })
        .await?;

    Ok(ClusterHandle {
        name,
        kubeconfig,
        owned: true,
    })
}

/// Release a cluster obtained from [`provision_cluster`].
///
/// Only owned clusters are deleted; reused and external clusters are left
/// running.
pub async fn release_cluster(
    provider: &dyn ClusterProvider,
    handle: &ClusterHandle,
) -> Result<(), Error> {
    if !handle.owned {
        info!(cluster = %handle.name, "leaving cluster running");
        return Ok(());
    }

    info!(cluster = %handle.name, "deleting kind cluster");
    provider.delete_cluster(&handle.name).await?;
    if let Err(e) = std::fs::remove_file(&handle.kubeconfig) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %handle.kubeconfig.display(), error = %e, "failed to remove kubeconfig");
        }
    }
    Ok(())
}

fn kubeconfig_path(cluster: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.kubeconfig", cluster))
}
