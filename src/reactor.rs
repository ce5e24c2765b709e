//! The Drive Manager Reactor (§4.7): the single background task that
//! reacts to hotplug events, mutates the registry, and signals consumers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_lite::StreamExt;
use tokio::sync::{Mutex, Notify};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::drive::{self, Drive};
use crate::error::CoreError;
use crate::fs_adapter::FilesystemDriver;
use crate::registry::Registry;
use crate::usb::host;

/// The Reactor's own lifecycle state (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

/// The single user-visible "status changed" signal (§4.7 "Observable
/// signal"): level-triggered and autoclear on read.
#[derive(Default)]
pub struct StatusChangeEvent {
    notify: Notify,
}

impl StatusChangeEvent {
    pub fn set(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

/// Shared state the Reactor task and the foreground API both touch.
pub struct Core {
    pub registry: Mutex<Registry>,
    pub status_change: StatusChangeEvent,
    pub config: Mutex<Config>,
    pub drivers: Vec<Arc<dyn FilesystemDriver>>,
    next_device_index: AtomicU32,
    shutdown: Notify,
    shutdown_ack: Notify,
}

impl Core {
    pub fn new(config: Config, drivers: Vec<Arc<dyn FilesystemDriver>>) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::new()),
            status_change: StatusChangeEvent::default(),
            config: Mutex::new(config),
            drivers,
            next_device_index: AtomicU32::new(0),
            shutdown: Notify::new(),
            shutdown_ack: Notify::new(),
        })
    }

    fn next_device_index(&self) -> u32 {
        self.next_device_index.fetch_add(1, Ordering::Relaxed)
    }

    /// Signals the Reactor task to stop and waits for it to acknowledge
    /// (§4.7 "On Shutdown": the reactor wakes the foreground waiter after
    /// it has released the mutex, avoiding the deadlock of both sides
    /// trying to hold it at once).
    pub async fn request_shutdown(&self) {
        self.shutdown.notify_one();
        self.shutdown_ack.notified().await;
    }
}

/// Runs the Reactor loop until shutdown. Spawned as a supervised `tokio`
/// task by `init()` (§2.1: a single task is one logical actor, same
/// ordering guarantees as a dedicated OS thread).
#[instrument(skip(core))]
pub async fn run(core: Arc<Core>) {
    let mut state = ReactorState::Starting;
    state = ReactorState::Running;
    info!("reactor running");

    let mut hotplug = match nusb::watch_devices() {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!(error = %e, "hotplug watch unavailable; running without live attach/detach events");
            None
        }
    };

    // Pick up devices already attached before the reactor started.
    handle_interface_available(&core).await;

    loop {
        tokio::select! {
            _ = core.shutdown.notified() => {
                state = ReactorState::ShuttingDown;
                break;
            }
            event = async {
                match &mut hotplug {
                    Some(stream) => stream.next().await,
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    Some(nusb::hotplug::HotplugEvent::Connected(_)) => handle_interface_available(&core).await,
                    Some(nusb::hotplug::HotplugEvent::Disconnected(_)) => handle_interface_state_change(&core).await,
                    None => {}
                }
            }
        }
    }

    shut_down(&core).await;
    state = ReactorState::Stopped;
    debug_assert_eq!(state, ReactorState::Stopped);
    core.shutdown_ack.notify_one();
}

#[instrument(skip(core))]
async fn handle_interface_available(core: &Arc<Core>) {
    let devices = match host::enumerate_mass_storage_devices().await {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "failed to enumerate mass storage devices");
            return;
        }
    };

    for device_info in devices {
        let interface_number = match device_info
            .interfaces()
            .find(|i| i.class() == host::MASS_STORAGE_CLASS && i.subclass() == host::SCSI_TRANSPARENT_SUBCLASS)
        {
            Some(i) => i.interface_number(),
            None => continue,
        };

        {
            let registry = core.registry.lock().await;
            if registry.iter().any(|d| d.interface_number == interface_number) {
                continue;
            }
        }

        if let Some(drive) = construct_and_log(core, &device_info, interface_number).await {
            let mut registry = core.registry.lock().await;
            registry.insert(Arc::new(drive));
            drop(registry);
            core.status_change.set();
        }
    }
}

async fn construct_and_log(core: &Arc<Core>, device_info: &nusb::DeviceInfo, interface_number: u8) -> Option<Drive> {
    let claimed = match host::claim_mass_storage_interface(device_info).await {
        Ok(c) => c,
        Err(e) => {
            warn!(interface_number, error = %e, "failed to claim interface");
            return None;
        }
    };
    let cfg = core.config.lock().await.clone();
    let device_index = core.next_device_index();
    let result: Result<Option<Drive>, CoreError> = drive::construct(
        claimed,
        device_info,
        device_info.vendor_id(),
        device_info.product_id(),
        device_index,
        &core.drivers,
        cfg,
    )
    .await;
    match result {
        Ok(Some(d)) => {
            info!(interface_number, device_index, "drive mounted");
            Some(d)
        }
        Ok(None) => {
            info!(interface_number, "no mountable filesystem found; not registering drive");
            None
        }
        Err(e) => {
            warn!(interface_number, error = %e, "drive construction failed");
            None
        }
    }
}

#[instrument(skip(core))]
async fn handle_interface_state_change(core: &Arc<Core>) {
    let still_present: Vec<u8> = match host::enumerate_mass_storage_devices().await {
        Ok(devices) => devices
            .iter()
            .flat_map(|d| d.interfaces())
            .filter(|i| i.class() == host::MASS_STORAGE_CLASS)
            .map(|i| i.interface_number())
            .collect(),
        Err(_) => Vec::new(),
    };

    let gone: Vec<u8> = {
        let registry = core.registry.lock().await;
        registry.iter().map(|d| d.interface_number).filter(|n| !still_present.contains(n)).collect()
    };

    if gone.is_empty() {
        return;
    }

    let mut registry = core.registry.lock().await;
    for interface_number in gone {
        if registry.remove_by_interface(interface_number).await.is_some() {
            info!(interface_number, "drive removed");
        }
    }
    drop(registry);
    core.status_change.set();
}

async fn shut_down(core: &Arc<Core>) {
    let mut registry = core.registry.lock().await;
    while !registry.is_empty() {
        let interface_number = registry.iter().next().map(|d| d.interface_number);
        if let Some(interface_number) = interface_number {
            registry.remove_by_interface(interface_number).await;
        } else {
            break;
        }
    }
    info!("reactor shut down, all drives destroyed");
}
