//! Stage runner contract and the built-in table-to-table worker stage.
//!
//! A stage is one of the three pipeline workers. The engine starts each
//! stage with a finalized option bundle and from then on only talks to its
//! control endpoint: `suspend` and `continue` messages that must be
//! acknowledged once the stage has quiesced or resumed, and a `stop` for
//! teardown. What a stage does between those messages is its own business.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kanal::{unbounded_async, AsyncSender};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace};

use crate::error::EngineError;
use crate::options::{self, Options};
use crate::table::{TableHandle, TableRole};

/// One of the three pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    Downloader,
    Spider,
    ItemProcessor,
}

impl Component {
    /// Setup and teardown walk the stages in this order.
    pub const ALL: [Component; 3] = [
        Component::Downloader,
        Component::Spider,
        Component::ItemProcessor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Downloader => "downloader",
            Component::Spider => "spider",
            Component::ItemProcessor => "item_processor",
        }
    }

    /// The stage's own data table.
    pub fn table_role(&self) -> TableRole {
        match self {
            Component::Downloader => TableRole::Downloader,
            Component::Spider => TableRole::Spider,
            Component::ItemProcessor => TableRole::ItemProcessor,
        }
    }

    /// The stage's own pipeline table.
    pub fn pipeline_role(&self) -> TableRole {
        match self {
            Component::Downloader => TableRole::DownloaderPipeline,
            Component::Spider => TableRole::SpiderPipeline,
            Component::ItemProcessor => TableRole::ItemProcessorPipeline,
        }
    }

    /// The registry key this stage's data table is published under.
    pub fn tid_key(&self) -> &'static str {
        match self {
            Component::Downloader => "downloader_tid",
            Component::Spider => "spider_tid",
            Component::ItemProcessor => "item_processor_tid",
        }
    }

    /// The downstream stage, if any.
    pub fn next(&self) -> Option<Component> {
        match self {
            Component::Downloader => Some(Component::Spider),
            Component::Spider => Some(Component::ItemProcessor),
            Component::ItemProcessor => None,
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to a suspend or continue control message.
///
/// Anything other than [`ControlAck::Ok`] is a contract violation and
/// terminates the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAck {
    Ok,
    Refused(String),
}

/// Messages a stage's control endpoint must accept.
pub enum StageCommand {
    /// Quiesce, then acknowledge. A suspended stage must not mutate its own
    /// table or any downstream table until resumed.
    Suspend { responder: oneshot::Sender<ControlAck> },
    /// Resume, then acknowledge.
    Resume { responder: oneshot::Sender<ControlAck> },
    /// Stop the stage; no reply, the worker exits and drops its endpoint.
    Stop,
}

/// A started stage: its control endpoint plus the worker task.
#[derive(Debug)]
pub struct StageHandle {
    component: Component,
    control: AsyncSender<StageCommand>,
    abort: AbortHandle,
    worker: Option<JoinHandle<()>>,
}

impl StageHandle {
    pub fn new(
        component: Component,
        control: AsyncSender<StageCommand>,
        worker: JoinHandle<()>,
    ) -> Self {
        StageHandle {
            component,
            control,
            abort: worker.abort_handle(),
            worker: Some(worker),
        }
    }

    pub fn component(&self) -> Component {
        self.component
    }

    /// Hands the worker task to the caller, once. The engine uses this to
    /// monitor the stage for unexpected exits.
    pub(crate) fn take_worker(&mut self) -> Option<JoinHandle<()>> {
        self.worker.take()
    }

    pub async fn suspend(&self) -> Result<ControlAck, EngineError> {
        self.control_call(|responder| StageCommand::Suspend { responder })
            .await
    }

    pub async fn resume(&self) -> Result<ControlAck, EngineError> {
        self.control_call(|responder| StageCommand::Resume { responder })
            .await
    }

    async fn control_call(
        &self,
        command: impl FnOnce(oneshot::Sender<ControlAck>) -> StageCommand,
    ) -> Result<ControlAck, EngineError> {
        let (responder, reply) = oneshot::channel();
        self.control
            .send(command(responder))
            .await
            .map_err(|_| EngineError::ControlContract {
                component: self.component,
                reply: "control endpoint closed".into(),
            })?;
        reply.await.map_err(|_| EngineError::ControlContract {
            component: self.component,
            reply: "no acknowledgement".into(),
        })
    }

    /// Asks the worker to stop; the endpoint closes once it has.
    pub async fn stop(&self) {
        let _ = self.control.send(StageCommand::Stop).await;
    }

    /// True once the worker has exited and dropped its endpoint.
    pub fn is_stopped(&self) -> bool {
        self.control.is_closed()
    }

    /// Force-kills the worker. Teardown uses this when the shutdown budget
    /// runs out.
    pub fn abort(&self) {
        self.abort.abort();
    }
}

/// Constructor contract for a pipeline stage.
///
/// `start` is synchronous from the engine's point of view: it must return a
/// fully started stage or an error, and an error aborts engine setup.
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    async fn start(
        &self,
        component: Component,
        options: &Options,
    ) -> Result<StageHandle, EngineError>;
}

/// Per-entry transform of the built-in worker stage: `None` drops the entry,
/// `Some(value)` forwards it downstream under the same key.
pub type TransformFn = dyn Fn(&str, Value) -> Option<Value> + Send + Sync;

/// Built-in stage: a worker loop that drains entries from the stage's `tid`
/// table through a transform into `next_tid` (or drops them on the terminal
/// stage), honoring the suspend/continue protocol with quiesce-before-ack.
pub struct WorkerStage {
    batch: usize,
    poll_interval: Duration,
    transform: Arc<TransformFn>,
}

impl WorkerStage {
    pub fn new(transform: Arc<TransformFn>) -> Self {
        WorkerStage {
            batch: num_cpus::get().clamp(1, 8),
            poll_interval: Duration::from_millis(25),
            transform,
        }
    }

    /// Forwards every entry downstream unchanged.
    pub fn passthrough() -> Self {
        WorkerStage::new(Arc::new(|_, value| Some(value)))
    }

    pub fn batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn required_table(
        component: Component,
        options: &Options,
        key: &str,
    ) -> Result<TableHandle, EngineError> {
        options
            .get(key)
            .and_then(|value| value.as_table())
            .cloned()
            .ok_or_else(|| EngineError::StageStart {
                component,
                reason: format!("missing {key} table in options"),
            })
    }
}

impl Default for WorkerStage {
    fn default() -> Self {
        WorkerStage::passthrough()
    }
}

#[async_trait]
impl Stage for WorkerStage {
    async fn start(
        &self,
        component: Component,
        options: &Options,
    ) -> Result<StageHandle, EngineError> {
        let tid = Self::required_table(component, options, options::TID)?;
        let next_tid = options
            .get(options::NEXT_TID)
            .and_then(|value| value.as_table())
            .cloned();

        let (control_tx, control_rx) = unbounded_async();
        let batch = self.batch;
        let poll_interval = self.poll_interval;
        let transform = Arc::clone(&self.transform);

        let worker = tokio::spawn(async move {
            debug!(%component, batch, "stage worker started");
            let mut suspended = false;
            loop {
                if suspended {
                    match control_rx.recv().await {
                        Ok(StageCommand::Resume { responder }) => {
                            suspended = false;
                            let _ = responder.send(ControlAck::Ok);
                        }
                        Ok(StageCommand::Suspend { responder }) => {
                            let _ = responder.send(ControlAck::Ok);
                        }
                        Ok(StageCommand::Stop) | Err(_) => break,
                    }
                    continue;
                }

                tokio::select! {
                    biased;
                    command = control_rx.recv() => match command {
                        Ok(StageCommand::Suspend { responder }) => {
                            // The current batch finished before this branch
                            // ran, so the stage is already quiescent.
                            suspended = true;
                            let _ = responder.send(ControlAck::Ok);
                        }
                        Ok(StageCommand::Resume { responder }) => {
                            let _ = responder.send(ControlAck::Ok);
                        }
                        Ok(StageCommand::Stop) | Err(_) => break,
                    },
                    _ = tokio::time::sleep(poll_interval) => {
                        for (key, value) in tid.take_batch(batch) {
                            trace!(%component, key, "processing entry");
                            match (transform(&key, value), &next_tid) {
                                (Some(out), Some(next)) => {
                                    next.insert(key, out);
                                }
                                (Some(_), None) | (None, _) => {}
                            }
                        }
                    }
                }
            }
            debug!(%component, "stage worker stopped");
        });

        Ok(StageHandle::new(component, control_tx, worker))
    }
}
