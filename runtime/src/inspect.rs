//! Logging middleware.

use fetchline_core::{Middleware, Next, Operation, PipelineError, Plugin, PluginContext};

/// Logs every operation that passes through it at `debug` level.
///
/// Place it first to see everything the client dispatches (including
/// operations swallowed further down), or after other plugins to see only what
/// they let through.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingPlugin;

impl TracingPlugin {
    /// Name the plugin registers under.
    pub const NAME: &'static str = "tracing";
}

impl Plugin for TracingPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn init(self: Box<Self>, _ctx: PluginContext) -> Result<Box<dyn Middleware>, PipelineError> {
        Ok(Box::new(|op: Operation, next: &Next| {
            tracing::debug!(id = %op.key(), op = %op.kind(), lazy = op.is_lazy(), "Operation");
            next.run(op);
        }))
    }
}
