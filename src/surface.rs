use std::sync::Arc;

use tracing::warn;

use crate::errors::ServiceError;
use crate::lifecycle::{LifecycleController, StartReport, StopReport};
use crate::status::{ServiceStatus, StatusReporter};

/// Operation set exposed over IPC and HTTP. Every request is validated here
/// before the controller or the OS is touched.
pub struct CommandSurface {
    controller: Arc<LifecycleController>,
    reporter: Arc<StatusReporter>,
}

impl CommandSurface {
    pub fn new(controller: Arc<LifecycleController>, reporter: Arc<StatusReporter>) -> Self {
        Self {
            controller,
            reporter,
        }
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub async fn list(&self) -> Vec<ServiceStatus> {
        self.reporter.get_status_all().await
    }

    pub async fn status(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        self.reporter.get_status(name).await
    }

    pub async fn start(&self, name: &str) -> Result<StartReport, ServiceError> {
        self.ensure_known(name)?;
        self.controller.start(name).await
    }

    pub async fn stop(
        &self,
        name: &str,
        force: bool,
        operator: Option<&str>,
    ) -> Result<StopReport, ServiceError> {
        self.ensure_not_host(name, operator)?;
        self.ensure_known(name)?;
        self.controller.stop(name, force, operator).await
    }

    pub async fn restart(
        &self,
        name: &str,
        force: bool,
        operator: Option<&str>,
    ) -> Result<StartReport, ServiceError> {
        self.ensure_not_host(name, operator)?;
        self.ensure_known(name)?;
        self.controller.restart(name, force, operator).await
    }

    fn ensure_known(&self, name: &str) -> Result<(), ServiceError> {
        self.controller.catalog().get(name).map(|_| ())
    }

    fn ensure_not_host(&self, name: &str, operator: Option<&str>) -> Result<(), ServiceError> {
        if self.controller.catalog().host_service() == Some(name) {
            warn!(
                "rejected stop of host service {name} requested by {}",
                operator.unwrap_or("unknown")
            );
            return Err(ServiceError::SelfStopForbidden(name.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::ErrorKind;
    use crate::status::ServiceState;
    use crate::testing::{sleeper_catalog, Harness};

    #[tokio::test(start_paused = true)]
    async fn stopping_the_host_service_is_forbidden_without_side_effects() {
        let harness = Harness::new(
            "surface-self-stop",
            sleeper_catalog(&[("admin", 9300), ("crawler", 9301)], Some("admin")),
        );
        let pid = harness.host.occupy(9300);

        let err = harness
            .surface
            .stop("admin", true, Some("root"))
            .await
            .expect_err("self-stop must be rejected");
        assert_eq!(err.kind(), ErrorKind::SelfStopForbidden);

        let err = harness
            .surface
            .restart("admin", false, None)
            .await
            .expect_err("self-restart must be rejected");
        assert_eq!(err.kind(), ErrorKind::SelfStopForbidden);

        assert_eq!(harness.host.probe_calls(), 0);
        assert!(harness.host.is_running(pid));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_names_are_rejected_before_any_probe() {
        let harness = Harness::new(
            "surface-unknown",
            sleeper_catalog(&[("admin", 9302)], Some("admin")),
        );

        let start = harness.surface.start("ghost").await.map(|_| ());
        let stop = harness.surface.stop("ghost", false, None).await.map(|_| ());
        let status = harness.surface.status("ghost").await.map(|_| ());

        for result in [start, stop, status] {
            assert_eq!(
                result.expect_err("unknown name must fail").kind(),
                ErrorKind::UnknownService
            );
        }
        assert_eq!(harness.host.probe_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn host_service_can_still_be_started_and_listed() {
        let harness = Harness::new(
            "surface-host-start",
            sleeper_catalog(&[("admin", 9303), ("crawler", 9304)], Some("admin")),
        );

        harness.surface.start("admin").await.expect("start failed");
        let listing = harness.surface.list().await;
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].state, ServiceState::Running);
        assert_eq!(listing[1].state, ServiceState::Stopped);
    }
}
