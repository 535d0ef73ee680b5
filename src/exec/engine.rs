//! Bootstrap and teardown orchestration over a plan

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::{Plan, RunContext, RunStatus, StageState};
use crate::exec::{EngineError, StageRunner};
use crate::secrets::input::InputProvider;
use crate::stages::StageDriver;

/// Events emitted while a run progresses
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: Uuid,
        plan_name: String,
        total_stages: usize,
    },
    StageStarted {
        stage_id: String,
        stage_name: String,
        position: usize,
    },
    StageWaiting {
        stage_id: String,
        target: String,
    },
    StageReady {
        stage_id: String,
        waited: Duration,
    },
    StageFailed {
        stage_id: String,
        error: String,
    },
    RunCompleted {
        run_id: Uuid,
        status: RunStatus,
    },
    TeardownStarted {
        plan_name: String,
    },
    StageRemoved {
        stage_id: String,
    },
    StageSkipped {
        stage_id: String,
        reason: String,
    },
    TeardownCompleted {
        removed: usize,
        skipped: usize,
        failed: usize,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(RunEvent) + Send + Sync>;

/// Outcome of a teardown run
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub removed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl TeardownReport {
    /// A clean teardown removed everything. Stages the operator
    /// declined count against it: resources are still in place.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Drives a plan through its stages in dependency order
pub struct BootstrapEngine<D> {
    driver: Arc<D>,
    event_handlers: Arc<Mutex<Vec<EventHandler>>>,
}

impl<D: StageDriver + 'static> BootstrapEngine<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
            event_handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(RunEvent) + Send + Sync + 'static,
    {
        let handlers = self.event_handlers.clone();
        tokio::spawn(async move {
            handlers.lock().await.push(Arc::new(handler));
        });
    }

    /// Emit an event to all handlers
    async fn emit_event(&self, event: RunEvent) {
        let handlers = self.event_handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Install every stage in dependency order. The first failure stops
    /// the run; later stages stay Pending.
    pub async fn bootstrap(
        &self,
        plan: &mut Plan,
        ctx: &mut RunContext,
        cancel: &AtomicBool,
    ) -> Result<(), EngineError> {
        let run_id = plan.state.run_id;
        info!(plan = %plan.name, %run_id, "Starting bootstrap run");
        plan.state.start(plan.stages.len());
        self.emit_event(RunEvent::RunStarted {
            run_id,
            plan_name: plan.name.clone(),
            total_stages: plan.stages.len(),
        })
        .await;

        let order = plan.bootstrap_order().to_vec();
        let runner = StageRunner::new(self.driver.as_ref());

        for (position, stage_id) in order.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                warn!(stage = %stage_id, "Run cancelled by operator");
                plan.state.cancel();
                self.emit_event(RunEvent::RunCompleted {
                    run_id,
                    status: RunStatus::Cancelled,
                })
                .await;
                return Err(EngineError::Cancelled {
                    stage: stage_id.clone(),
                });
            }

            let stage = plan
                .stage(stage_id)
                .cloned()
                .ok_or_else(|| EngineError::UnknownStage {
                    stage: stage_id.clone(),
                })?;

            if let Some(s) = plan.stage_mut(stage_id) {
                s.state = StageState::Installing {
                    started_at: Utc::now(),
                };
            }
            self.emit_event(RunEvent::StageStarted {
                stage_id: stage_id.clone(),
                stage_name: stage.name.clone(),
                position: position + 1,
            })
            .await;

            if let Err(e) = runner.install(&stage, ctx).await {
                return self.fail_run(plan, stage_id, e).await;
            }

            let started_at = Utc::now();
            if let Some(s) = plan.stage_mut(stage_id) {
                s.state = StageState::Waiting { started_at };
            }
            self.emit_event(RunEvent::StageWaiting {
                stage_id: stage_id.clone(),
                target: stage.readiness.describe(),
            })
            .await;

            match runner.wait_ready(&stage, cancel).await {
                Ok(waited) => {
                    if let Some(s) = plan.stage_mut(stage_id) {
                        s.state = StageState::Ready {
                            started_at,
                            ready_at: Utc::now(),
                        };
                    }
                    plan.state.ready_stages += 1;
                    self.emit_event(RunEvent::StageReady {
                        stage_id: stage_id.clone(),
                        waited,
                    })
                    .await;
                }
                Err(EngineError::Cancelled { stage }) => {
                    plan.state.cancel();
                    self.emit_event(RunEvent::RunCompleted {
                        run_id,
                        status: RunStatus::Cancelled,
                    })
                    .await;
                    return Err(EngineError::Cancelled { stage });
                }
                Err(e) => {
                    return self.fail_run(plan, stage_id, e).await;
                }
            }
        }

        plan.state.complete();
        // The store token has served its purpose once all stages are up
        ctx.scrub();
        info!(plan = %plan.name, "Bootstrap run completed");
        self.emit_event(RunEvent::RunCompleted {
            run_id,
            status: RunStatus::Completed,
        })
        .await;
        Ok(())
    }

    async fn fail_run(
        &self,
        plan: &mut Plan,
        stage_id: &str,
        error: EngineError,
    ) -> Result<(), EngineError> {
        error!(stage = %stage_id, %error, "Stage failed, stopping run");
        if let Some(s) = plan.stage_mut(stage_id) {
            s.state = StageState::Failed {
                error: error.to_string(),
                failed_at: Utc::now(),
            };
        }
        plan.state.failed_stages += 1;
        plan.state.fail();
        self.emit_event(RunEvent::StageFailed {
            stage_id: stage_id.to_string(),
            error: error.to_string(),
        })
        .await;
        self.emit_event(RunEvent::RunCompleted {
            run_id: plan.state.run_id,
            status: RunStatus::Failed,
        })
        .await;
        Err(error)
    }

    /// Remove stages in reverse install order. Unlike bootstrap this
    /// keeps going past failures so a half-broken lab still gets as
    /// clean as possible.
    pub async fn teardown(
        &self,
        plan: &Plan,
        ctx: &RunContext,
        input: &dyn InputProvider,
    ) -> TeardownReport {
        info!(plan = %plan.name, "Starting teardown");
        self.emit_event(RunEvent::TeardownStarted {
            plan_name: plan.name.clone(),
        })
        .await;

        let mut report = TeardownReport::default();

        for stage_id in plan.teardown_order() {
            let Some(stage) = plan.stage(&stage_id) else {
                continue;
            };

            if let Some(warning) = &stage.confirm_teardown {
                match input.confirm(warning, false) {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(stage = %stage_id, "Teardown declined by operator");
                        self.emit_event(RunEvent::StageSkipped {
                            stage_id: stage_id.clone(),
                            reason: "declined by operator".to_string(),
                        })
                        .await;
                        report.skipped.push(stage_id.clone());
                        continue;
                    }
                    Err(e) => {
                        warn!(stage = %stage_id, error = %e, "Confirmation failed, skipping");
                        report.skipped.push(stage_id.clone());
                        continue;
                    }
                }
            }

            match self.driver.uninstall(stage, ctx).await {
                Ok(()) => {
                    info!(stage = %stage_id, "Stage removed");
                    self.emit_event(RunEvent::StageRemoved {
                        stage_id: stage_id.clone(),
                    })
                    .await;
                    report.removed.push(stage_id.clone());
                }
                Err(e) => {
                    error!(stage = %stage_id, error = %e, "Stage removal failed, continuing");
                    self.emit_event(RunEvent::StageFailed {
                        stage_id: stage_id.clone(),
                        error: e.to_string(),
                    })
                    .await;
                    report.failed.push((stage_id.clone(), e.to_string()));
                }
            }
        }

        self.emit_event(RunEvent::TeardownCompleted {
            removed: report.removed.len(),
            skipped: report.skipped.len(),
            failed: report.failed.len(),
        })
        .await;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PlanConfig, Sensitive, Stage};
    use async_trait::async_trait;
    use std::path::PathBuf;

    struct AlwaysReadyDriver {
        installed: std::sync::Mutex<Vec<String>>,
    }

    impl AlwaysReadyDriver {
        fn new() -> Self {
            Self {
                installed: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StageDriver for AlwaysReadyDriver {
        async fn install(&self, stage: &Stage, _ctx: &mut RunContext) -> anyhow::Result<()> {
            self.installed.lock().unwrap().push(stage.id.clone());
            Ok(())
        }

        async fn uninstall(&self, _stage: &Stage, _ctx: &RunContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn ready(&self, _stage: &Stage) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    fn test_ctx() -> RunContext {
        RunContext::new(
            "http://127.0.0.1:8200".to_string(),
            Sensitive::new("root".to_string()),
            PathBuf::from("/tmp/test_key"),
        )
    }

    #[tokio::test]
    async fn test_bootstrap_runs_in_dependency_order() {
        let yaml = r#"
name: "Order"
stages:
  - id: "second"
    name: "Second"
    kind: secret-seed
    readiness:
      check: immediate
    depends_on: ["first"]
  - id: "first"
    name: "First"
    kind: k3s
    readiness:
      check: immediate
"#;
        let mut plan = PlanConfig::from_yaml(yaml).unwrap().to_plan();
        let engine = BootstrapEngine::new(AlwaysReadyDriver::new());
        let cancel = AtomicBool::new(false);
        let mut ctx = test_ctx();

        engine.bootstrap(&mut plan, &mut ctx, &cancel).await.unwrap();

        let installed = engine.driver.installed.lock().unwrap().clone();
        assert_eq!(installed, vec!["first".to_string(), "second".to_string()]);
        assert!(plan.is_complete());
        assert_eq!(plan.state.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_bootstrap_scrubs_token_on_success() {
        let yaml = r#"
name: "Scrub"
stages:
  - id: "only"
    name: "Only"
    kind: k3s
    readiness:
      check: immediate
"#;
        let mut plan = PlanConfig::from_yaml(yaml).unwrap().to_plan();
        let engine = BootstrapEngine::new(AlwaysReadyDriver::new());
        let cancel = AtomicBool::new(false);
        let mut ctx = test_ctx();
        assert!(ctx.store_token().is_some());

        engine.bootstrap(&mut plan, &mut ctx, &cancel).await.unwrap();
        assert!(ctx.store_token().is_none());
    }

    #[test]
    fn test_teardown_report_clean_only_when_nothing_remains() {
        let mut report = TeardownReport::default();
        report.removed.push("vault".to_string());
        assert!(report.is_clean());

        report.skipped.push("netbox".to_string());
        assert!(!report.is_clean());

        report.skipped.clear();
        report.failed.push(("vault".to_string(), "boom".to_string()));
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn test_cancelled_run_stops_before_next_stage() {
        let yaml = r#"
name: "Cancel"
stages:
  - id: "only"
    name: "Only"
    kind: k3s
    readiness:
      check: immediate
"#;
        let mut plan = PlanConfig::from_yaml(yaml).unwrap().to_plan();
        let engine = BootstrapEngine::new(AlwaysReadyDriver::new());
        let cancel = AtomicBool::new(true);
        let mut ctx = test_ctx();

        let err = engine
            .bootstrap(&mut plan, &mut ctx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));
        assert_eq!(plan.state.status, RunStatus::Cancelled);
        assert!(engine.driver.installed.lock().unwrap().is_empty());
    }
}
