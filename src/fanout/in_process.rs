// ABOUTME: Cooperative in-process isolation for fan-out units
// ABOUTME: Runs actions as tokio tasks and awaits commands, both interruptible on fail-fast

use async_trait::async_trait;

use super::process::run_command;
use super::{Payload, UnitExecutor, WorkUnit};
use crate::engine::dispatch::execute_attempt;
use crate::engine::{ActionResult, ExecutionContext};

/// Executes units as tasks on the current tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcess;

#[async_trait]
impl UnitExecutor for InProcess {
    fn label(&self) -> &'static str {
        "in_process"
    }

    fn interrupts_in_flight(&self) -> bool {
        true
    }

    async fn execute(&self, unit: WorkUnit, context: ExecutionContext) -> ActionResult {
        match unit.payload {
            Payload::Action(action) => execute_attempt(action, context, None).await,
            Payload::Command(spec) => run_command(&spec).await,
        }
    }
}
