//! USB worker thread
//!
//! Dedicated thread owning the `UsbManager`. It alternates between draining
//! commands from the Tokio side and pumping USB events, so every libusb
//! callback runs here and nothing else ever touches the registry.

use std::rc::Rc;

use common::{UsbCommand, UsbWorker};
use tracing::{debug, error, info};

use crate::device::MuxDeviceLayer;
use crate::usb::manager::UsbManager;
use crate::usb::SharedDeviceLayer;

/// Upper bound on one pump slice so commands stay responsive
const MAX_SLICE_MS: u64 = 100;

pub struct UsbWorkerThread {
    manager: UsbManager,
    worker: UsbWorker,
}

impl UsbWorkerThread {
    pub fn new(
        worker: UsbWorker,
        layer: SharedDeviceLayer,
        default_mode: u8,
    ) -> Result<Self, rusb::Error> {
        let manager = UsbManager::new(layer, default_mode)?;
        Ok(Self { manager, worker })
    }

    /// Run until a Shutdown command arrives or the USB layer reports a fatal
    /// error. Devices are torn down before returning either way.
    pub fn run(mut self) -> common::Result<()> {
        info!("USB worker thread started");
        debug!("libusb exposes {} poll fds", self.manager.get_fds().len());
        let result = self.pump();
        self.manager.shutdown();
        info!("USB worker thread stopped");
        result
    }

    fn pump(&mut self) -> common::Result<()> {
        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => return Ok(()),
                Some(cmd) => self.handle_command(cmd),
                None => {}
            }

            let slice = self.manager.get_timeout().min(MAX_SLICE_MS);
            self.manager
                .process_for(slice)
                .map_err(|e| common::Error::Usb(e.to_string()))?;
            self.manager
                .process()
                .map_err(|e| common::Error::Usb(e.to_string()))?;
        }
    }

    fn handle_command(&mut self, cmd: UsbCommand) {
        match cmd {
            UsbCommand::ListDevices { response } => {
                let _ = response.send(self.manager.list_devices());
            }

            UsbCommand::Discover { response } => {
                let _ = response.send(self.manager.discover().map_err(|e| e.to_string()));
            }

            UsbCommand::Send {
                location,
                data,
                response,
            } => {
                let _ = response.send(self.manager.send(location, data).map_err(|e| e.to_string()));
            }

            UsbCommand::Autodiscover { enable } => self.manager.autodiscover(enable),

            UsbCommand::Shutdown => {
                // handled in the pump loop
                unreachable!()
            }
        }
    }
}

/// Spawn the USB worker on its own OS thread. The device layer must be
/// created inside the thread because records and layers never cross threads.
pub fn spawn_usb_worker(
    worker: UsbWorker,
    default_mode: u8,
) -> std::thread::JoinHandle<common::Result<()>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || {
            let layer: SharedDeviceLayer = Rc::new(MuxDeviceLayer::new(worker.event_tx.clone()));
            let thread = UsbWorkerThread::new(worker, layer, default_mode).map_err(|e| {
                error!("USB subsystem initialization failed: {}", e);
                common::Error::Usb(e.to_string())
            })?;
            thread.run()
        })
        .expect("Failed to spawn USB worker thread")
}
