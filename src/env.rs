//! Test environment lifecycle
//!
//! [`TestEnvironment::provision`] takes an [`EnvConfig`] to a cluster with
//! the policy under test installed and enforceable:
//!
//! 1. validate the configuration and load the policy bundle
//! 2. obtain a cluster (kubeconfig, reused kind cluster or fresh kind cluster)
//! 3. connect and wait for every node to be Ready
//! 4. install extra resources, parameter CRDs, the policy and its bindings
//!
//! A failure after step 2 releases a cluster the harness created, so a broken
//! run never leaks kind clusters. [`TestEnvironment::run`] executes a suite
//! and tears the environment down on every exit path, panics included.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use kube::Client;
use tracing::{error, info, warn};

use crate::config::EnvConfig;
use crate::kube_utils::{create_client, wait_for_nodes_ready, ApiResolver};
use crate::namespace::{NamespaceIsolator, NamespaceRegistry};
use crate::policy::PolicyInstallationSet;
use crate::probe::{AdmissionProbe, ResourceSubmitter};
use crate::provider::{provision_cluster, release_cluster, ClusterHandle, ClusterProvider, KindProvider};
use crate::scenario::{panic_message, StepContext};
use crate::template::TemplateEngine;
use crate::Error;

/// A provisioned cluster with the policy under test installed
pub struct TestEnvironment {
    config: EnvConfig,
    provider: Arc<dyn ClusterProvider>,
    cluster: ClusterHandle,
    client: Client,
    resolver: Arc<ApiResolver>,
    isolator: NamespaceIsolator,
    submitter: Arc<dyn ResourceSubmitter>,
    templates: Arc<TemplateEngine>,
    installation: PolicyInstallationSet,
}

impl TestEnvironment {
    /// Provision with kind as the cluster provider
    pub async fn provision(config: EnvConfig) -> Result<Self, Error> {
        Self::provision_with(config, Arc::new(KindProvider::default())).await
    }

    /// Provision with an explicit cluster provider
    pub async fn provision_with(
        config: EnvConfig,
        provider: Arc<dyn ClusterProvider>,
    ) -> Result<Self, Error> {
        config.validate()?;
        // Load everything from disk before paying for a cluster
        let installation = PolicyInstallationSet::from_config(&config)?;
        let templates = Arc::new(TemplateEngine::new()?);

        let cluster = provision_cluster(provider.as_ref(), &config).await?;
        info!(
            policy = %config.policy_name,
            cluster = %cluster.name,
            owned = cluster.owned,
            "cluster ready for installation"
        );

        match connect(&config, &cluster, &installation).await {
            Ok((client, resolver)) => {
                let isolator = NamespaceIsolator::new(
                    client.clone(),
                    config.namespace_labels.clone(),
                    Arc::new(NamespaceRegistry::new()),
                );
                let submitter: Arc<dyn ResourceSubmitter> =
                    Arc::new(AdmissionProbe::new(resolver.clone()));
                Ok(Self {
                    config,
                    provider,
                    cluster,
                    client,
                    resolver,
                    isolator,
                    submitter,
                    templates,
                    installation,
                })
            }
            Err(e) => {
                error!(cluster = %cluster.name, error = %e, "environment setup failed");
                if let Err(release_err) = release_cluster(provider.as_ref(), &cluster).await {
                    warn!(cluster = %cluster.name, error = %release_err, "failed to release cluster");
                }
                Err(e)
            }
        }
    }

    /// Configuration the environment was built from
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// The cluster in use
    pub fn cluster(&self) -> &ClusterHandle {
        &self.cluster
    }

    /// Client connected to the cluster
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Discovery-backed kind resolver
    pub fn resolver(&self) -> &Arc<ApiResolver> {
        &self.resolver
    }

    /// Namespace isolator
    pub fn isolator(&self) -> &NamespaceIsolator {
        &self.isolator
    }

    /// Live test namespaces
    pub fn namespaces(&self) -> &Arc<NamespaceRegistry> {
        self.isolator.registry()
    }

    /// Submitter used for probes
    pub fn submitter(&self) -> &Arc<dyn ResourceSubmitter> {
        &self.submitter
    }

    /// Step context for `namespace`, bounded by the configured timeouts
    pub fn step_context(&self, namespace: &str) -> StepContext {
        StepContext::new(namespace, self.submitter.clone(), self.templates.clone())
            .with_wait(self.config.ready_timeout, self.config.poll_interval)
    }

    /// Delete leftover namespaces, uninstall from clusters that outlive the
    /// run and release the cluster
    pub async fn teardown(self) -> Result<(), Error> {
        for ctx in self.namespaces().contexts() {
            if let Err(e) = self.isolator.delete_namespace(&ctx).await {
                warn!(namespace = %ctx.name, error = %e, "failed to delete leftover namespace");
            }
        }

        if !self.cluster.owned {
            self.installation.uninstall(&self.resolver).await;
        }

        release_cluster(self.provider.as_ref(), &self.cluster).await
    }

    /// Run `suite` and tear down afterwards, whatever happens
    pub async fn run<F>(self, suite: F) -> ExitCode
    where
        F: for<'a> FnOnce(&'a TestEnvironment) -> BoxFuture<'a, Result<(), String>>,
    {
        let outcome = match AssertUnwindSafe(suite(&self)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(panic_message(panic)),
        };

        if let Err(e) = self.teardown().await {
            error!(error = %e, "teardown failed");
        }

        match outcome {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "suite failed");
                ExitCode::FAILURE
            }
        }
    }
}

async fn connect(
    config: &EnvConfig,
    cluster: &ClusterHandle,
    installation: &PolicyInstallationSet,
) -> Result<(Client, Arc<ApiResolver>), Error> {
    let client = create_client(Some(&cluster.kubeconfig)).await?;
    wait_for_nodes_ready(&client, config.ready_timeout, config.poll_interval).await?;

    let resolver = Arc::new(ApiResolver::new(client.clone()).await?);
    install_or_roll_back(
        cluster.owned,
        installation.install(&resolver, config),
        || installation.uninstall(&resolver),
    )
    .await?;
    info!(policy = %config.policy_name, "policy installed");
    Ok((client, resolver))
}

/// Await `install`. If it fails on a cluster the harness does not own (and
/// so will not delete), run `roll_back` to remove what was applied.
async fn install_or_roll_back<I, R, RF>(owned: bool, install: I, roll_back: R) -> Result<(), Error>
where
    I: Future<Output = Result<(), Error>>,
    R: FnOnce() -> RF,
    RF: Future<Output = ()>,
{
    let result = install.await;
    if let Err(e) = &result {
        if !owned {
            warn!(error = %e, "installation failed, removing partially installed policy");
            roll_back().await;
        }
    }
    result
}

/// Entry point for a suite binary: logging, runtime, provisioning, run,
/// teardown. Provisioning failure exits non-zero.
pub fn run_suite<F>(config: EnvConfig, suite: F) -> ExitCode
where
    F: for<'a> FnOnce(&'a TestEnvironment) -> BoxFuture<'a, Result<(), String>>,
{
    crate::telemetry::init_test_logging();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async move {
        match TestEnvironment::provision(config).await {
            Ok(env) => env.run(suite).await,
            Err(e) => {
                error!(error = %e, "failed to provision test environment");
                ExitCode::FAILURE
            }
        }
    })
}
