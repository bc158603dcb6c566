//! Engine facade.
//!
//! Owns the devices and their worker tasks and exposes the operations a
//! frontend uses: [`Engine::submit`], [`Engine::submit_tmr`],
//! [`Engine::wait_quiescent`] and, for backends, [`task_done`](crate::task_done).


use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::abort::{self, TmrRequest, TmrResponse};
use crate::completion;
use crate::config::{ConfigError, DeviceConfig, EngineConfig, RetryConfig};
use crate::device::{Device, DeviceId};
use crate::emulation::StandardResponses;
use crate::exec;
use crate::interfaces::{
    CommandSequencer, Frontend, ResponseBuilder, StorageBackend, SubmitError,
};
use crate::model::{
    CommandHandle, CommandKind, CommandParts, CommandRequest, DataDirection, Lun, StopReason,
};
use crate::sequencer::BasicSequencer;
use crate::split::{self, SplitLimits, SplitRequest};

/// Result type for engine lifecycle operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid configuration")]
    Config(#[from] ConfigError),

    #[error("Device name '{0}' already attached")]
    DuplicateDevice(String),

    #[error("Unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("Engine needs a running tokio runtime")]
    NoRuntime,
}

/// What [`Engine::wait_quiescent`] waits for.
#[derive(Debug, Clone)]
pub enum QuiesceTarget {
    /// One command, withdrawn by its frontend. It receives no status.
    Command(CommandHandle),
    /// Every command on a LUN that is going away. Each receives CHECK
    /// CONDITION (LOGICAL UNIT NOT SUPPORTED).
    Lun { device: DeviceId, lun: Lun },
}

/// Handle to a device's worker tasks.
struct DeviceWorkers {
    cancel: watch::Sender<bool>,
    exec: JoinHandle<()>,
    retry: JoinHandle<()>,
}

impl DeviceWorkers {
    fn spawn(runtime: &Handle, device: &Arc<Device>, retry: RetryConfig) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);
        let exec = runtime.spawn(exec::run(Arc::clone(device), cancel_rx.clone()));
        let retry = runtime.spawn(completion::retry::run(Arc::clone(device), retry, cancel_rx));
        Self {
            cancel,
            exec,
            retry,
        }
    }

    async fn stop(self) {
        let _ = self.cancel.send(true);
        for (name, handle) in [("exec", self.exec), ("retry", self.retry)] {
            if let Err(e) = handle.await {
                warn!(worker = name, error = %e, "Device worker ended abnormally");
            }
        }
    }
}

struct Attached {
    device: Arc<Device>,
    workers: DeviceWorkers,
}

/// The command execution engine.
pub struct Engine {
    config: EngineConfig,
    sequencer: Arc<dyn CommandSequencer>,
    responses: Arc<dyn ResponseBuilder>,
    devices: RwLock<HashMap<DeviceId, Attached>>,
    next_device: AtomicU32,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        sequencer: Arc<dyn CommandSequencer>,
        responses: Arc<dyn ResponseBuilder>,
    ) -> Self {
        Self {
            config,
            sequencer,
            responses,
            devices: RwLock::new(HashMap::new()),
            next_device: AtomicU32::new(0),
        }
    }

    /// Engine using the reference sequencer and sense mapping.
    pub fn with_defaults(config: EngineConfig) -> Self {
        Self::new(
            config,
            Arc::new(BasicSequencer::new()),
            Arc::new(StandardResponses),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Attach a device and start its execution loop and retry sweep.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_device(
        &self,
        config: DeviceConfig,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Arc<Device>> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let mut devices = self.devices.write();
        if devices.values().any(|a| a.device.name() == config.name) {
            return Err(EngineError::DuplicateDevice(config.name));
        }

        let id = DeviceId(self.next_device.fetch_add(1, Ordering::Relaxed));
        let device = Device::new(id, config, backend, Arc::clone(&self.responses));
        let workers = DeviceWorkers::spawn(&runtime, &device, self.config.retry.clone());
        devices.insert(
            id,
            Attached {
                device: Arc::clone(&device),
                workers,
            },
        );
        Ok(device)
    }

    /// Attach every device listed in the engine configuration.
    pub fn attach_configured<F>(&self, mut backend_for: F) -> Result<Vec<Arc<Device>>>
    where
        F: FnMut(&DeviceConfig) -> Arc<dyn StorageBackend>,
    {
        self.config
            .devices
            .iter()
            .map(|config| self.add_device(config.clone(), backend_for(config)))
            .collect()
    }

    pub fn device(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices.read().get(&id).map(|a| Arc::clone(&a.device))
    }

    pub fn device_by_name(&self, name: &str) -> Option<Arc<Device>> {
        self.devices
            .read()
            .values()
            .find(|a| a.device.name() == name)
            .map(|a| Arc::clone(&a.device))
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        let mut devices: Vec<_> = self
            .devices
            .read()
            .values()
            .map(|a| Arc::clone(&a.device))
            .collect();
        devices.sort_by_key(|d| d.id());
        devices
    }

    /// Accept a command for execution.
    pub fn submit(
        &self,
        device: DeviceId,
        request: CommandRequest,
    ) -> std::result::Result<CommandHandle, SubmitError> {
        let device = self.device(device).ok_or(SubmitError::UnknownDevice(device))?;
        submit(&device, self.sequencer.as_ref(), request)
    }

    /// Start a task management request. The response goes to `frontend`
    /// through [`Frontend::queue_tm_response`]; the returned handle resolves
    /// to the same response.
    pub fn submit_tmr(
        &self,
        device: DeviceId,
        request: TmrRequest,
        frontend: Arc<dyn Frontend>,
    ) -> Result<JoinHandle<TmrResponse>> {
        let device = self.device(device).ok_or(EngineError::UnknownDevice(device))?;
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        Ok(runtime.spawn(async move {
            let response = abort::handle_tmr(&device, &request).await;
            frontend.queue_tm_response(&request, response);
            response
        }))
    }

    /// Stop a command or a LUN and wait until the engine holds nothing of
    /// it. Returns whether anything was still owned by the engine.
    pub async fn wait_quiescent(&self, target: QuiesceTarget) -> bool {
        match target {
            QuiesceTarget::Command(command) => {
                abort::stop_command(&command, StopReason::Withdrawn).await
            }
            QuiesceTarget::Lun { device, lun } => match self.device(device) {
                Some(device) => {
                    abort::quiesce_lun(&device, lun, StopReason::LunShutdown).await > 0
                }
                None => false,
            },
        }
    }

    /// Take a device offline, stop everything on it and detach it.
    pub async fn remove_device(&self, id: DeviceId) -> Result<()> {
        let attached = {
            let devices = self.devices.read();
            let attached = devices.get(&id).ok_or(EngineError::UnknownDevice(id))?;
            Arc::clone(&attached.device)
        };
        shutdown_device(&attached).await;

        let detached = self.devices.write().remove(&id);
        if let Some(attached) = detached {
            attached.workers.stop().await;
        }
        info!(device = %id, "Device detached");
        Ok(())
    }

    /// Stop every LUN on every device, then stop the device workers.
    pub async fn shutdown(&self) {
        let devices = self.devices();
        join_all(devices.iter().map(shutdown_device)).await;

        let attached: Vec<_> = self.devices.write().drain().map(|(_, a)| a).collect();
        join_all(attached.into_iter().map(|a| a.workers.stop())).await;
        info!("Engine stopped");
    }
}

/// Take `device` offline and stop everything it accepted before that.
async fn shutdown_device(device: &Arc<Device>) {
    device.set_online(false);
    loop {
        let luns = device.active_luns();
        if luns.is_empty() {
            break;
        }
        for lun in luns {
            abort::quiesce_lun(device, lun, StopReason::LunShutdown).await;
        }
    }
}

/// Classify, split and admit one command on `device`.
///
/// Commands the sequencer refuses are still accepted: they complete at once
/// with CHECK CONDITION. Errors returned here mean nothing was accepted and
/// no status will be sent.
#[tracing::instrument(name = "engine.submit", skip_all, fields(device = %device.id(), lun = request.lun, tag = request.tag))]
pub fn submit(
    device: &Arc<Device>,
    sequencer: &dyn CommandSequencer,
    request: CommandRequest,
) -> std::result::Result<CommandHandle, SubmitError> {
    if !device.is_online() {
        return Err(SubmitError::DeviceOffline(device.id()));
    }

    let CommandRequest {
        lun,
        tag,
        cdb,
        attribute,
        buffer,
        frontend,
    } = request;

    let parts = match sequencer.classify(&cdb, &device.geometry()) {
        Ok(class) => {
            if class.data_length > 0 && buffer.len() < class.data_length {
                return Err(SubmitError::BufferTooSmall {
                    expected: class.data_length,
                    actual: buffer.len(),
                });
            }
            let config = device.config();
            let tasks = split::split(
                &SplitRequest {
                    lba: class.lba,
                    sectors: class.sectors,
                    data_length: class.data_length,
                    direction: class.direction,
                    kind: class.kind,
                },
                &buffer,
                &SplitLimits {
                    block_size: config.block_size,
                    max_sectors: config.max_sectors,
                    max_tasks: config.max_tasks_per_command,
                },
            )?;
            CommandParts {
                lun,
                tag,
                cdb: cdb.into_boxed_slice(),
                attribute,
                lba: class.lba,
                sectors: class.sectors,
                data_length: class.data_length,
                direction: class.direction,
                kind: class.kind,
                tasks,
                buffer,
                executor: class.emulation,
                rejection: None,
                frontend,
            }
        }
        Err(reason) => {
            debug!(?reason, "Command refused by sequencer");
            CommandParts {
                lun,
                tag,
                cdb: cdb.into_boxed_slice(),
                attribute,
                lba: 0,
                sectors: 0,
                data_length: 0,
                direction: DataDirection::None,
                kind: CommandKind::Control,
                tasks: Vec::new(),
                buffer,
                executor: None,
                rejection: Some(reason),
                frontend,
            }
        }
    };

    let command = device.admit(parts)?;
    debug!(
        command = %command.id(),
        tasks = command.tasks().len(),
        attribute = ?command.attribute(),
        "Command accepted"
    );
    if command.tasks().is_empty() {
        completion::finish(&command);
    }
    Ok(command)
}
