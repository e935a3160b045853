//! Run-scoped plumbing shared by every pipeline task: the run token, fatal
//! error propagation, the metrics reporter and panic supervision.

use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, Telemetry};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    fatal_handler: Arc<FatalErrorHandler>,
    metrics_handle: Option<JoinHandle<()>>,
}

pub(crate) struct LifecycleSpawnParams<'a> {
    pub shutdown_root: &'a CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub metrics_interval: Duration,
}

impl LifecycleHandles {
    pub(crate) fn spawn(params: LifecycleSpawnParams<'_>) -> Self {
        let LifecycleSpawnParams {
            shutdown_root,
            telemetry,
            metrics_interval,
        } = params;

        let run_token = shutdown_root.child_token();
        let fatal_handler = Arc::new(FatalErrorHandler::new(
            shutdown_root.clone(),
            run_token.clone(),
        ));
        let metrics_handle =
            telemetry::spawn_metrics_reporter(telemetry, run_token.clone(), metrics_interval);

        Self {
            run_token,
            fatal_handler,
            metrics_handle: Some(metrics_handle),
        }
    }

    pub(crate) fn fatal_handler(&self) -> Arc<FatalErrorHandler> {
        self.fatal_handler.clone()
    }

    pub(crate) async fn shutdown(mut self) {
        self.run_token.cancel();
        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }
    }
}

/// Spawns a pipeline task whose panic is turned into a fatal error instead
/// of silently killing the task.
pub(crate) fn spawn_supervised<Fut>(
    task: String,
    fatal_handler: Arc<FatalErrorHandler>,
    future: Fut,
) -> JoinHandle<()>
where
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let result = std::panic::AssertUnwindSafe(future).catch_unwind().await;

        if let Err(panic_payload) = result {
            let panic_msg = panic_message(panic_payload.as_ref());
            tracing::error!(task = %task, panic = %panic_msg, "pipeline task panicked");
            let context = format!("{task} panicked");
            fatal_handler.trigger_external(
                context.as_str(),
                anyhow::anyhow!("{task} panicked: {panic_msg}"),
            );
        }
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
