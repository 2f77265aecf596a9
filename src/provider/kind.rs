//! kind provider
//!
//! Drives the `kind` CLI through `tokio::process`. Commands capture their
//! output; stderr becomes the error message on failure.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{ClusterProvider, CreateClusterRequest};
use crate::Error;

const INSTALL_HINT: &str = "install kind: https://kind.sigs.k8s.io/docs/user/quick-start/#installation";

/// Clusters managed by the `kind` CLI
#[derive(Clone, Debug)]
pub struct KindProvider {
    binary: String,
    wait: Duration,
}

impl Default for KindProvider {
    fn default() -> Self {
        Self {
            binary: "kind".to_string(),
            wait: Duration::from_secs(120),
        }
    }
}

impl KindProvider {
    /// Provider using `kind` from `PATH`
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `kind` binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// How long `kind create cluster` waits for the control plane
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    fn create_args(&self, request: &CreateClusterRequest) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "cluster".to_string(),
            "--name".to_string(),
            request.name.clone(),
            "--kubeconfig".to_string(),
            request.kubeconfig.to_string_lossy().into_owned(),
            "--wait".to_string(),
            format!("{}s", self.wait.as_secs()),
        ];
        if let Some(image) = &request.node_image {
            args.push("--image".to_string());
            args.push(image.clone());
        }
        args
    }

    async fn run(&self, cluster: &str, args: &[String]) -> Result<String, Error> {
        debug!(cluster = %cluster, command = %format!("{} {}", self.binary, args.join(" ")), "running kind");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                Error::provision(
                    cluster,
                    format!("failed to run {}: {} ({})", self.binary, e, INSTALL_HINT),
                )
            })?;

        if !output.status.success() {
            return Err(Error::provision(
                cluster,
                format!(
                    "{} {} failed: {}",
                    self.binary,
                    args.first().map(String::as_str).unwrap_or_default(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Whether `kind get clusters` output lists `name`
fn cluster_listed(stdout: &str, name: &str) -> bool {
    stdout.lines().any(|line| line.trim() == name)
}

#[async_trait]
impl ClusterProvider for KindProvider {
    async fn create_cluster(&self, request: &CreateClusterRequest) -> Result<(), Error> {
        self.run(&request.name, &self.create_args(request)).await?;
        Ok(())
    }

    async fn delete_cluster(&self, name: &str) -> Result<(), Error> {
        let args = ["delete", "cluster", "--name", name].map(String::from);
        self.run(name, &args).await?;
        Ok(())
    }

    async fn cluster_exists(&self, name: &str) -> Result<bool, Error> {
        let args = ["get", "clusters"].map(String::from);
        let stdout = self.run(name, &args).await?;
        Ok(cluster_listed(&stdout, name))
    }

    async fn export_kubeconfig(&self, name: &str, path: &Path) -> Result<(), Error> {
        let args = vec![
            "export".to_string(),
            "kubeconfig".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--kubeconfig".to_string(),
            path.to_string_lossy().into_owned(),
        ];
        self.run(name, &args).await?;
        Ok(())
    }
}
