//! Async channel bridge between the Tokio runtime and the USB thread

use async_channel::{Receiver, Sender, bounded};

use crate::types::DeviceEntry;

/// Commands from the Tokio runtime to the USB thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List devices that finished initialization
    ListDevices {
        /// Channel to send the response back
        response: tokio::sync::oneshot::Sender<Vec<DeviceEntry>>,
    },

    /// Force an enumeration pass; answers with the number of candidate
    /// devices seen
    Discover {
        response: tokio::sync::oneshot::Sender<std::result::Result<usize, String>>,
    },

    /// Submit payload bytes to a device's bulk-out endpoint
    Send {
        /// `(bus << 16) | address` of the target device
        location: u32,
        data: Vec<u8>,
        response: tokio::sync::oneshot::Sender<std::result::Result<(), String>>,
    },

    /// Enable or disable device polling and hotplug add handling
    Autodiscover { enable: bool },

    /// Shut down the USB thread gracefully
    Shutdown,
}

/// Events from the USB core
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// A device completed initialization and its read loops are running
    DeviceArrived { device: DeviceEntry },

    /// A device was unplugged or torn down
    DeviceRemoved { location: u32 },
}

/// Handle for the Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the USB thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB thread
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the USB thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (public so the worker can hand it to the device layer)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command from the Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to the Tokio runtime (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between the Tokio runtime and the USB thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for the USB thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(256);
    let (event_tx, event_rx) = bounded(256);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, worker) = create_usb_bridge();

        // Simulated USB worker on its own thread
        let handle = std::thread::spawn(move || {
            let cmd = worker.recv_command().unwrap();
            matches!(cmd, UsbCommand::ListDevices { .. })
        });

        let (tx, _rx) = tokio::sync::oneshot::channel();
        bridge
            .send_command(UsbCommand::ListDevices { response: tx })
            .await
            .unwrap();

        assert!(handle.join().unwrap());
    }

    #[tokio::test]
    async fn test_event_roundtrip() {
        let (bridge, worker) = create_usb_bridge();

        worker
            .send_event(UsbEvent::DeviceRemoved {
                location: (1 << 16) | 4,
            })
            .unwrap();

        match bridge.recv_event().await.unwrap() {
            UsbEvent::DeviceRemoved { location } => assert_eq!(location, (1 << 16) | 4),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
