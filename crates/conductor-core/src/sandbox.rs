use async_trait::async_trait;

use conductor_types::ResourceLimits;

/// Container driver seam. The real implementation talks to the container
/// runtime; runs with `exec_mode` of `sandbox` or `hybrid` get a container
/// created and started before `run.start` is published.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    async fn create(&self, run_id: &str, limits: &ResourceLimits) -> anyhow::Result<String>;

    async fn start(&self, container_id: &str) -> anyhow::Result<()>;

    async fn stop(&self, container_id: &str) -> anyhow::Result<()>;

    async fn remove(&self, container_id: &str) -> anyhow::Result<()>;
}

/// No-op driver for mount-mode deployments and tests.
pub struct NullSandbox;

#[async_trait]
impl SandboxDriver for NullSandbox {
    async fn create(&self, run_id: &str, _limits: &ResourceLimits) -> anyhow::Result<String> {
        Ok(format!("sbx-{run_id}"))
    }

    async fn start(&self, _container_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _container_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn remove(&self, _container_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
