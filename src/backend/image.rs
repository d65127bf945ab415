//! Image acquisition policy.

use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::ImagePullPolicy;
use crate::engine::client::EngineClient;
use crate::engine::retry::retry;
use crate::engine::Result;

/// Pull the configured image when the policy calls for it.
pub(crate) async fn ensure_image(client: &EngineClient, deadline: Instant) -> Result<()> {
    if !pull_needed(client, deadline).await? {
        return Ok(());
    }
    retry("pull image", deadline, client.metrics(), || {
        client.pull_image()
    })
    .await
    .inspect_err(|err| {
        error!(
            "failed to pull image {}, giving up ({})",
            client.image_name(),
            err
        )
    })
}

/// Decide whether a pull is needed.
///
/// `IfNotPresent` forces a pull for untagged or `latest`-tagged references:
/// their local copy may be arbitrarily stale.
async fn pull_needed(client: &EngineClient, deadline: Instant) -> Result<bool> {
    debug!("Checking if an image pull is needed...");
    match client.config().execution.image_pull_policy {
        ImagePullPolicy::Never => return Ok(false),
        ImagePullPolicy::Always => return Ok(true),
        ImagePullPolicy::IfNotPresent => {}
    }

    if tag_requires_pull(client.image_name()) {
        return Ok(true);
    }

    let present = retry("list images", deadline, client.metrics(), || {
        client.has_image()
    })
    .await
    .inspect_err(|err| error!("failed to list images, giving up ({})", err))?;
    Ok(!present)
}

fn tag_requires_pull(image: &str) -> bool {
    !image.contains(':') || image.ends_with(":latest")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::metrics::BackendMetrics;

    async fn offline_client(policy: ImagePullPolicy, image: &str) -> EngineClient {
        let mut config = Config::default();
        config.connection.host = "unix:///nonexistent/engine.sock".to_string();
        config.execution.image_pull_policy = policy;
        config
            .execution
            .launch
            .container
            .as_mut()
            .unwrap()
            .image = Some(image.to_string());
        EngineClient::connect(Arc::new(config), BackendMetrics::unregistered())
            .await
            .unwrap()
    }

    #[test]
    fn test_tag_requires_pull() {
        assert!(tag_requires_pull("busybox"));
        assert!(tag_requires_pull("busybox:latest"));
        assert!(!tag_requires_pull("busybox:1.36"));
        assert!(!tag_requires_pull("quay.io/org/image:v2"));
    }

    #[tokio::test]
    async fn test_policy_never_skips_engine_entirely() {
        let client = offline_client(ImagePullPolicy::Never, "busybox:1.36").await;
        let deadline = Instant::now() + std::time::Duration::from_secs(1);
        assert!(!pull_needed(&client, deadline).await.unwrap());
    }

    #[tokio::test]
    async fn test_policy_if_not_present_pulls_untagged_without_engine() {
        let client = offline_client(ImagePullPolicy::IfNotPresent, "busybox").await;
        let deadline = Instant::now() + std::time::Duration::from_secs(1);
        assert!(pull_needed(&client, deadline).await.unwrap());

        let client = offline_client(ImagePullPolicy::IfNotPresent, "busybox:latest").await;
        assert!(pull_needed(&client, deadline).await.unwrap());
    }
}
