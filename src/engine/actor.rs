//! Actor loop for the engine.

use kanal::{unbounded_async, AsyncReceiver, AsyncSender};
use tracing::{debug, error};

use crate::error::EngineError;
use crate::registry;

use super::commands::{EngineCommand, StopReason};
use super::core::{Engine, EngineConfig};
use super::handle::EngineHandle;

/// Registers the engine name and spawns the actor.
///
/// Returns once the actor task exists; setup runs as the actor's first work
/// item, so the handle is live before the engine is. Commands sent in the
/// meantime queue behind setup.
pub(crate) fn spawn_engine(config: EngineConfig) -> Result<EngineHandle, EngineError> {
    let (sender, receiver) = unbounded_async();
    let handle = EngineHandle::new(config.spider.clone(), sender.clone());
    registry::register_engine(handle.clone())?;

    tokio::spawn(run_engine(config, sender, receiver));
    Ok(handle)
}

/// Runs setup, then serves the mailbox one command at a time until a stop
/// command or a fatal condition ends the loop.
async fn run_engine(
    config: EngineConfig,
    sender: AsyncSender<EngineCommand>,
    receiver: AsyncReceiver<EngineCommand>,
) {
    let spider = config.spider.clone();
    let mut engine = Engine::new(config, sender);
    debug!(spider = %spider, "engine actor started");

    if let Err(error) = engine.start_components().await {
        error!(spider = %spider, %error, "engine setup failed");
        engine.abandon_setup().await;
        registry::unregister_engine(&spider);
        return;
    }

    while let Ok(command) = receiver.recv().await {
        match command {
            EngineCommand::Status { responder } => {
                let _ = responder.send(engine.status());
            }
            EngineCommand::Suspend { responder } => match engine.suspend().await {
                Err(error @ EngineError::ControlContract { .. }) => {
                    let reason = error.to_string();
                    let _ = responder.send(Err(error));
                    engine.teardown(&StopReason::Abnormal(reason)).await;
                    break;
                }
                result => {
                    let _ = responder.send(result);
                }
            },
            EngineCommand::Resume { responder } => match engine.resume().await {
                Err(error @ EngineError::ControlContract { .. }) => {
                    let reason = error.to_string();
                    let _ = responder.send(Err(error));
                    engine.teardown(&StopReason::Abnormal(reason)).await;
                    break;
                }
                result => {
                    let _ = responder.send(result);
                }
            },
            EngineCommand::Dump { base, responder } => {
                let _ = responder.send(engine.dump(base));
            }
            EngineCommand::Stop { reason, responder } => {
                engine.teardown(&reason).await;
                let _ = responder.send(());
                break;
            }
            EngineCommand::StageExited { component } => {
                error!(spider = %spider, %component, "stage exited unexpectedly");
                let reason = format!("{component} stage exited unexpectedly");
                engine.teardown(&StopReason::Abnormal(reason)).await;
                break;
            }
        }
    }

    debug!(spider = %spider, "engine actor stopped");
}
