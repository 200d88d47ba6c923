//! Threaded shell around [`XhciController`] for embedding in a VMM.
//!
//! One device-wide mutex covers every MMIO access, hot-plug callback,
//! transfer notification and worker pass; the controller underneath never
//! blocks while it is held. The only thread the shell owns is the S3/hot-plug
//! worker, which sleeps on a condvar until a Disable-Slot command (or other
//! bookkeeping) signals that the suspend cache may have an entry to replay.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::warn;

use crate::{DeviceInfo, IrqPin, MemoryBus, UsbDeviceModel, UsbPath};

use super::ports::PortError;
use super::{ConfigError, NotifyResult, XhciConfig, XhciController};

struct DeviceState<M> {
    ctrl: XhciController,
    mem: M,
    /// Worker wakeups not yet consumed.
    pending_wakeups: u32,
    /// Cleared on shutdown; the worker exits on its next wake.
    polling: bool,
}

struct Shared<M> {
    state: Mutex<DeviceState<M>>,
    wakeup: Condvar,
}

/// The lock shell: owns the controller, the guest-memory handle and the
/// worker thread.
pub struct XhciDevice<M: MemoryBus + Send + 'static> {
    shared: Arc<Shared<M>>,
    worker: Option<JoinHandle<()>>,
}

impl<M: MemoryBus + Send + 'static> XhciDevice<M> {
    pub fn new(config: XhciConfig, mem: M) -> Result<Self, ConfigError> {
        let ctrl = XhciController::with_config(config, None)?;
        Ok(Self::with_controller(ctrl, mem))
    }

    pub fn with_controller(ctrl: XhciController, mem: M) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(DeviceState {
                ctrl,
                mem,
                pending_wakeups: 0,
                polling: true,
            }),
            wakeup: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("xhci-vbdp".into())
            .spawn(move || Self::worker_loop(worker_shared))
            .ok();
        if worker.is_none() {
            warn!("xhci: could not spawn vbdp worker; S3 replay disabled");
        }

        Self { shared, worker }
    }

    /// The worker blocks until signalled, then replays one suspend-cache
    /// entry per wakeup. It runs on its own thread so a Disable-Slot command
    /// can signal it without blocking the MMIO write that carried the
    /// command.
    fn worker_loop(shared: Arc<Shared<M>>) {
        let mut state = match shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            while state.polling && state.pending_wakeups == 0 {
                state = match shared.wakeup.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
            if !state.polling {
                return;
            }
            state.pending_wakeups -= 1;
            let DeviceState { ctrl, mem, .. } = &mut *state;
            ctrl.vbdp_service(mem);
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut XhciController, &mut M) -> R) -> R {
        let mut state = match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = {
            let DeviceState { ctrl, mem, .. } = &mut *state;
            f(ctrl, mem)
        };
        if state.ctrl.take_worker_signal() {
            state.pending_wakeups += 1;
            self.shared.wakeup.notify_one();
        }
        result
    }

    pub fn set_irq_pin(&self, pin: Arc<dyn IrqPin>) {
        self.with_state(|ctrl, _| ctrl.set_irq_pin(pin));
    }

    // ---- guest-facing MMIO ------------------------------------------------

    pub fn mmio_read(&self, offset: u64, size: u8) -> u64 {
        self.with_state(|ctrl, mem| ctrl.mmio_read(mem, offset, size))
    }

    pub fn mmio_write(&self, offset: u64, size: u8, value: u64) {
        self.with_state(|ctrl, mem| ctrl.mmio_write(mem, offset, size, value));
    }

    // ---- hot-plug callback surface ----------------------------------------

    pub fn on_connect(
        &self,
        info: DeviceInfo,
        dev: Option<Box<dyn UsbDeviceModel>>,
    ) -> Result<u8, PortError> {
        self.with_state(|ctrl, mem| ctrl.connect_device(mem, info, dev))
    }

    pub fn on_disconnect(&self, path: UsbPath) {
        self.with_state(|ctrl, mem| ctrl.disconnect_device(mem, path));
    }

    /// Completion notification from an asynchronous device backend.
    pub fn on_notify(&self, slot_id: u8, epid: u8) -> NotifyResult {
        self.with_state(|ctrl, mem| ctrl.notify_transfer(mem, slot_id, epid))
    }

    /// Unconditional interrupter assertion.
    pub fn on_interrupt(&self) {
        self.with_state(|ctrl, _| ctrl.raise_interrupt());
    }

    pub fn irq_level(&self) -> bool {
        self.with_state(|ctrl, _| ctrl.irq_level())
    }

    /// Run a closure against the locked controller; test and embedder hook.
    pub fn with_controller_locked<R>(
        &self,
        f: impl FnOnce(&mut XhciController, &mut M) -> R,
    ) -> R {
        self.with_state(f)
    }
}

impl<M: MemoryBus + Send + 'static> Drop for XhciDevice<M> {
    fn drop(&mut self) {
        // Stop the worker before slots go away: clear the polling flag,
        // wake it, join.
        {
            let mut state = match self.shared.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.polling = false;
        }
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
