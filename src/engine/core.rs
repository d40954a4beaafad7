//! The engine state machine: setup, control transitions, snapshot, teardown.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use kanal::AsyncSender;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::options::{self, OptionValue, Options};
use crate::pipeline;
use crate::plugin;
use crate::registry;
use crate::spider::{EngineContext, SpiderHooks, SpiderId};
use crate::stage::{Component, ControlAck, Stage, StageHandle};
use crate::table::{TableRole, TableSet};

use super::commands::{EngineCommand, StopReason};

/// How long the detached teardown task may spend stopping the three stages
/// before aborting them. A supervisor embedding the engine must not kill it
/// earlier.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(60);

/// Lifecycle status of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Preparing,
    Running,
    Suspended,
    Terminating,
}

impl EngineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineStatus::Preparing => "preparing",
            EngineStatus::Running => "running",
            EngineStatus::Suspended => "suspended",
            EngineStatus::Terminating => "terminating",
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the engine is constructed with.
pub(crate) struct EngineConfig {
    pub(crate) spider: SpiderId,
    pub(crate) hooks: Option<Arc<dyn SpiderHooks>>,
    pub(crate) downloader_stage: Arc<dyn Stage>,
    pub(crate) spider_stage: Arc<dyn Stage>,
    pub(crate) item_processor_stage: Arc<dyn Stage>,
    pub(crate) downloader_options: Options,
    pub(crate) spider_options: Options,
    pub(crate) item_processor_options: Options,
    pub(crate) load_from_file: Option<PathBuf>,
}

impl EngineConfig {
    fn stage_for(&self, component: Component) -> Arc<dyn Stage> {
        match component {
            Component::Downloader => Arc::clone(&self.downloader_stage),
            Component::Spider => Arc::clone(&self.spider_stage),
            Component::ItemProcessor => Arc::clone(&self.item_processor_stage),
        }
    }
}

/// The three finalized option bundles, retained unchanged from the end of
/// setup so teardown sees exactly what start used.
struct Bundles {
    downloader: Options,
    spider: Options,
    item_processor: Options,
}

impl Bundles {
    fn get(&self, component: Component) -> &Options {
        match component {
            Component::Downloader => &self.downloader,
            Component::Spider => &self.spider,
            Component::ItemProcessor => &self.item_processor,
        }
    }
}

/// State owned exclusively by the engine actor.
pub(crate) struct Engine {
    config: EngineConfig,
    status: EngineStatus,
    tables: Option<TableSet>,
    bundles: Option<Bundles>,
    children: Vec<StageHandle>,
    mailbox: AsyncSender<EngineCommand>,
}

impl Engine {
    pub(crate) fn new(config: EngineConfig, mailbox: AsyncSender<EngineCommand>) -> Self {
        Engine {
            config,
            status: EngineStatus::Preparing,
            tables: None,
            bundles: None,
            children: Vec::with_capacity(3),
            mailbox,
        }
    }

    pub(crate) fn status(&self) -> EngineStatus {
        self.status
    }

    /// The setup protocol. Runs once, before the actor serves its mailbox:
    /// tables, registry publication, bundle assembly, plugin resolution,
    /// component hooks, ordered stage start, then the running transition
    /// and the spider's start hook.
    pub(crate) async fn start_components(&mut self) -> Result<(), EngineError> {
        let spider = self.config.spider.clone();
        info!(spider = %spider, "setting up engine components");

        let tables = match &self.config.load_from_file {
            Some(base) => TableSet::load(base)?,
            None => TableSet::create(),
        };

        registry::publish_table(
            &spider,
            options::COMMON_PIPELINE_TID,
            tables.get(TableRole::CommonPipeline).clone(),
        );
        for component in Component::ALL {
            registry::publish_table(
                &spider,
                component.tid_key(),
                tables.get(component.table_role()).clone(),
            );
        }

        let downloader =
            plugin::resolve_requester(self.assemble(Component::Downloader, &tables)).await?;
        let spider_bundle = self.assemble(Component::Spider, &tables);
        let item_processor =
            plugin::resolve_storage(self.assemble(Component::ItemProcessor, &tables)).await?;

        let bundles = match &self.config.hooks {
            Some(hooks) => Bundles {
                downloader: hooks
                    .prepare_for_start_component(Component::Downloader, downloader)
                    .await?,
                spider: hooks
                    .prepare_for_start_component(Component::Spider, spider_bundle)
                    .await?,
                item_processor: hooks
                    .prepare_for_start_component(Component::ItemProcessor, item_processor)
                    .await?,
            },
            None => Bundles {
                downloader,
                spider: spider_bundle,
                item_processor,
            },
        };

        for component in Component::ALL {
            let stage = self.config.stage_for(component);
            let mut handle = stage.start(component, bundles.get(component)).await?;
            self.monitor(component, &mut handle);
            self.children.push(handle);
            debug!(spider = %spider, %component, "stage started");
        }

        self.bundles = Some(bundles);
        self.tables = Some(tables.clone());
        self.status = EngineStatus::Running;

        if let Some(hooks) = &self.config.hooks {
            let ctx = EngineContext::new(spider.clone(), tables);
            hooks.prepare_for_start(&ctx).await?;
        }

        info!(spider = %spider, "engine running");
        Ok(())
    }

    /// Framework prefix concatenated ahead of the user overrides: `spider`,
    /// this stage's `tid`, the downstream `next_tid` when there is one, and
    /// the two pipeline table handles.
    fn assemble(&self, component: Component, tables: &TableSet) -> Options {
        let mut prefix = vec![
            (
                options::SPIDER.to_string(),
                OptionValue::Text(self.config.spider.to_string()),
            ),
            (
                options::TID.to_string(),
                OptionValue::Table(tables.get(component.table_role()).clone()),
            ),
        ];
        if let Some(next) = component.next() {
            prefix.push((
                options::NEXT_TID.to_string(),
                OptionValue::Table(tables.get(next.table_role()).clone()),
            ));
        }
        prefix.push((
            options::COMMON_PIPELINE_TID.to_string(),
            OptionValue::Table(tables.get(TableRole::CommonPipeline).clone()),
        ));
        prefix.push((
            options::PIPELINE_TID.to_string(),
            OptionValue::Table(tables.get(component.pipeline_role()).clone()),
        ));

        let user = match component {
            Component::Downloader => &self.config.downloader_options,
            Component::Spider => &self.config.spider_options,
            Component::ItemProcessor => &self.config.item_processor_options,
        };
        Options::prefixed(prefix, user)
    }

    /// Watches a stage's worker task and posts back when it exits on its
    /// own; the actor treats that as a fatal child crash.
    fn monitor(&self, component: Component, handle: &mut StageHandle) {
        if let Some(worker) = handle.take_worker() {
            let mailbox = self.mailbox.clone();
            tokio::spawn(async move {
                let _ = worker.await;
                let _ = mailbox.send(EngineCommand::StageExited { component }).await;
            });
        }
    }

    pub(crate) async fn suspend(&mut self) -> Result<(), EngineError> {
        match self.status {
            EngineStatus::Suspended => Ok(()),
            EngineStatus::Running => {
                self.broadcast(true).await?;
                self.status = EngineStatus::Suspended;
                debug!(spider = %self.config.spider, "engine suspended");
                Ok(())
            }
            status => Err(EngineError::StatusError { status }),
        }
    }

    pub(crate) async fn resume(&mut self) -> Result<(), EngineError> {
        match self.status {
            EngineStatus::Running => Ok(()),
            EngineStatus::Suspended => {
                self.broadcast(false).await?;
                self.status = EngineStatus::Running;
                debug!(spider = %self.config.spider, "engine resumed");
                Ok(())
            }
            status => Err(EngineError::StatusError { status }),
        }
    }

    /// Sends the control message to all three stages concurrently and
    /// requires three acknowledgements. Anything else is a contract
    /// violation; the status field is only advanced on full success.
    async fn broadcast(&self, suspend: bool) -> Result<(), EngineError> {
        let acks = if suspend {
            join_all(self.children.iter().map(|child| child.suspend())).await
        } else {
            join_all(self.children.iter().map(|child| child.resume())).await
        };

        for (child, ack) in self.children.iter().zip(acks) {
            match ack? {
                ControlAck::Ok => {}
                ControlAck::Refused(reason) => {
                    return Err(EngineError::ControlContract {
                        component: child.component(),
                        reply: reason,
                    });
                }
            }
        }
        Ok(())
    }

    /// Dumps the seven tables under `base` (derived when absent). Gated on
    /// the suspended status; rejected calls touch nothing on disk.
    pub(crate) fn dump(&self, base: Option<PathBuf>) -> Result<PathBuf, EngineError> {
        if self.status != EngineStatus::Suspended {
            return Err(EngineError::StatusError {
                status: self.status,
            });
        }
        let Some(tables) = self.tables.as_ref() else {
            return Err(EngineError::StatusError {
                status: self.status,
            });
        };

        let base = base.unwrap_or_else(|| default_dump_base(&self.config.spider));
        tables.dump(&base)?;
        Ok(base)
    }

    /// The teardown sequence: log the reason, run the per-stage stop hooks
    /// and pipeline hooks, run the spider stop hook, unpublish the registry
    /// entries, then hand the children to a detached stop task bounded by
    /// [`SHUTDOWN_BUDGET`]. Returns as soon as that task is scheduled.
    pub(crate) async fn teardown(&mut self, reason: &StopReason) {
        match reason {
            StopReason::Normal => info!(spider = %self.config.spider, "engine stopping"),
            StopReason::Abnormal(why) => {
                warn!(spider = %self.config.spider, reason = %why, "engine stopping abnormally")
            }
        }
        self.status = EngineStatus::Terminating;

        if let Some(bundles) = &self.bundles {
            for component in Component::ALL {
                let bundle = bundles.get(component);
                if let Some(hooks) = &self.config.hooks {
                    if let Err(error) = hooks.prepare_for_stop_component(component, bundle).await {
                        warn!(%component, %error, "component stop hook failed");
                    }
                }
                pipeline::prepare_for_stop_all(bundle).await;
            }
        }
        if let Some(hooks) = &self.config.hooks {
            if let Err(error) = hooks.prepare_for_stop().await {
                warn!(spider = %self.config.spider, %error, "spider stop hook failed");
            }
        }

        registry::unpublish_spider(&self.config.spider);
        registry::unregister_engine(&self.config.spider);

        let children = std::mem::take(&mut self.children);
        if !children.is_empty() {
            tokio::spawn(stop_children(children));
        }
    }

    /// Cleanup after a failed setup: any stages that did start are stopped,
    /// published tables are withdrawn.
    pub(crate) async fn abandon_setup(&mut self) {
        registry::unpublish_spider(&self.config.spider);
        let children = std::mem::take(&mut self.children);
        if !children.is_empty() {
            tokio::spawn(stop_children(children));
        }
    }
}

/// Stops the stages gracefully, aborting whatever is still alive once the
/// shutdown budget is exhausted.
async fn stop_children(children: Vec<StageHandle>) {
    for child in &children {
        child.stop().await;
    }

    let deadline = tokio::time::Instant::now() + SHUTDOWN_BUDGET;
    loop {
        if children.iter().all(StageHandle::is_stopped) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("shutdown budget exhausted, aborting remaining stages");
            for child in children.iter().filter(|child| !child.is_stopped()) {
                child.abort();
            }
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    debug!("all stages stopped");
}

fn default_dump_base(spider: &SpiderId) -> PathBuf {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    PathBuf::from(format!("./data/{spider}_{seconds}"))
}
