//! Single-stage execution: install, then wait for readiness

use std::sync::atomic::AtomicBool;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::core::{RunContext, Stage};
use crate::exec::EngineError;
use crate::probe::{Check, ProbeError, ReadinessProbe};
use crate::stages::StageDriver;

/// Adapts a driver's readiness observation to the probe's Check trait
struct DriverCheck<'a, D: StageDriver> {
    driver: &'a D,
    stage: &'a Stage,
}

#[async_trait]
impl<D: StageDriver> Check for DriverCheck<'_, D> {
    async fn check(&self) -> anyhow::Result<bool> {
        self.driver.ready(self.stage).await
    }
}

/// Runs one stage to readiness
pub struct StageRunner<'a, D: StageDriver> {
    driver: &'a D,
}

impl<'a, D: StageDriver> StageRunner<'a, D> {
    pub fn new(driver: &'a D) -> Self {
        Self { driver }
    }

    /// Install the stage and poll until its readiness condition holds.
    /// Returns the readiness wait duration.
    pub async fn run(
        &self,
        stage: &Stage,
        ctx: &mut RunContext,
        cancel: &AtomicBool,
    ) -> Result<Duration, EngineError> {
        self.install(stage, ctx).await?;
        self.wait_ready(stage, cancel).await
    }

    /// Run the stage's install action
    pub async fn install(&self, stage: &Stage, ctx: &mut RunContext) -> Result<(), EngineError> {
        info!(stage = %stage.id, "Installing stage");
        self.driver
            .install(stage, ctx)
            .await
            .map_err(|source| EngineError::Install {
                stage: stage.id.clone(),
                source,
            })
    }

    /// Poll the stage's readiness condition until it holds
    pub async fn wait_ready(
        &self,
        stage: &Stage,
        cancel: &AtomicBool,
    ) -> Result<Duration, EngineError> {
        let probe = ReadinessProbe::new(
            stage.readiness.describe(),
            stage.poll_interval,
            stage.deadline,
        );
        let check = DriverCheck {
            driver: self.driver,
            stage,
        };

        info!(stage = %stage.id, target = %probe.description, "Waiting for readiness");
        probe.wait(cancel, &check).await.map_err(|e| match e {
            ProbeError::Cancelled(_) => EngineError::Cancelled {
                stage: stage.id.clone(),
            },
            other => EngineError::Readiness {
                stage: stage.id.clone(),
                source: other,
            },
        })
    }
}
