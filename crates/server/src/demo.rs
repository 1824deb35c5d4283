// Demo workflows served by the binary

use std::time::Duration;

use async_trait::async_trait;
use leaseflow_durable::{
    CallbackRequest, InterpreterError, Meta, Workflow, WorkflowContext, WorkflowRegistry,
    WorkflowStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// How long an order waits for payment before it is cancelled
pub const PAYMENT_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Registry with every demo workflow
pub fn registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry.register::<Checkout>();
    registry
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStage {
    #[default]
    New,
    AwaitingPayment,
    Paid,
    Shipped,
    Cancelled,
}

/// Order checkout
///
/// Waits for a `pay` event with a deadline, then for a `ship` event.
/// A deadline firing before payment cancels the order. `cancel` works
/// until the order ships.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkout {
    pub stage: CheckoutStage,
    pub amount: i64,
    pub tracking: Option<String>,
    pub deadline: Option<CallbackRequest>,
}

impl Checkout {
    async fn disarm(&mut self, ctx: &WorkflowContext<'_>) -> Result<(), InterpreterError> {
        if let Some(deadline) = self.deadline.take() {
            ctx.teardown_timeout(&deadline, false).await?;
        }
        Ok(())
    }

    fn ignored(&self) -> Value {
        json!({ "status": "ignored", "stage": self.stage })
    }
}

#[async_trait]
impl Workflow for Checkout {
    const TYPE: &'static str = "checkout";

    async fn resume(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
    ) -> Result<usize, InterpreterError> {
        match self.stage {
            CheckoutStage::New => {
                let request =
                    CallbackRequest::new(&meta.id, meta.pc, "payment_deadline", "main");
                let handle = ctx.setup_timeout(&request, PAYMENT_WINDOW).await?;
                self.deadline = Some(request.with_setup_data(handle));
                self.stage = CheckoutStage::AwaitingPayment;
                meta.pc += 1;
                Ok(1)
            }
            CheckoutStage::Shipped | CheckoutStage::Cancelled if !meta.is_finished() => {
                meta.status = WorkflowStatus::Finished;
                meta.pc += 1;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn handle_event(
        &mut self,
        ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
        event: &str,
        input: Value,
    ) -> Result<Value, InterpreterError> {
        match (event, self.stage) {
            ("pay", CheckoutStage::AwaitingPayment) => {
                let amount = input["amount"]
                    .as_i64()
                    .filter(|amount| *amount > 0)
                    .ok_or_else(|| {
                        InterpreterError::validation("amount", "must be a positive integer")
                    })?;
                self.disarm(ctx).await?;
                self.amount = amount;
                self.stage = CheckoutStage::Paid;
                meta.pc += 1;
                Ok(json!({ "status": "paid", "amount": amount }))
            }
            ("ship", CheckoutStage::Paid) => {
                let tracking = input["tracking"]
                    .as_str()
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| InterpreterError::validation("tracking", "is required"))?;
                self.tracking = Some(tracking.to_string());
                self.stage = CheckoutStage::Shipped;
                meta.pc += 1;
                Ok(json!({ "status": "shipped", "tracking": tracking }))
            }
            ("cancel", CheckoutStage::AwaitingPayment | CheckoutStage::Paid) => {
                self.disarm(ctx).await?;
                self.stage = CheckoutStage::Cancelled;
                meta.pc += 1;
                Ok(json!({ "status": "cancelled" }))
            }
            ("pay" | "ship" | "cancel", _) => Ok(self.ignored()),
            _ => Err(InterpreterError::validation("event", "unknown event")),
        }
    }

    async fn handle_callback(
        &mut self,
        _ctx: &WorkflowContext<'_>,
        meta: &mut Meta,
        request: &CallbackRequest,
        _input: Value,
    ) -> Result<Value, InterpreterError> {
        // Stale or duplicate deliveries
        let armed = self
            .deadline
            .as_ref()
            .is_some_and(|d| d.name == request.name && d.pc == request.pc);
        if !armed || self.stage != CheckoutStage::AwaitingPayment {
            return Ok(self.ignored());
        }

        self.deadline = None;
        self.stage = CheckoutStage::Cancelled;
        meta.pc += 1;
        Ok(json!({ "status": "cancelled", "reason": "payment_deadline" }))
    }
}
