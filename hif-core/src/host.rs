//! Registry of the devices a host driver has brought up.

use crate::bus::Bus;
use crate::config::DeviceConfig;
use crate::device::Device;
use crate::error::SetupError;
use crate::lock;
use log::{debug, info};
use std::sync::{Arc, Mutex};

/// Callbacks a host driver registers to learn about devices coming and going.
pub trait DeviceHandlers<C>: Send + Sync {
    /// A device was started. Returns `true` to claim it.
    ///
    /// An unclaimed device keeps running, but [`on_removed`](Self::on_removed) is not called for
    /// it.
    fn on_attached(&self, device: &Arc<Device<C>>) -> bool;

    /// A claimed device is about to be stopped.
    fn on_removed(&self, device: &Arc<Device<C>>);
}

struct Entry<C> {
    device: Arc<Device<C>>,
    claimed: bool,
}

/// Owns every device probed through it, and tells its handlers about them.
pub struct HostDriver<C> {
    handlers: Arc<dyn DeviceHandlers<C>>,
    devices: Mutex<Vec<Entry<C>>>,
}

impl<C> std::fmt::Debug for HostDriver<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDriver")
            .field("devices", &lock(&self.devices).len())
            .finish_non_exhaustive()
    }
}

impl<C: Send + 'static> HostDriver<C> {
    pub fn new(handlers: Arc<dyn DeviceHandlers<C>>) -> Self {
        Self {
            handlers,
            devices: Mutex::new(Vec::new()),
        }
    }

    /// Bring up a device on `bus` and offer it to the handlers.
    pub fn probe(
        &self,
        bus: Arc<dyn Bus>,
        config: DeviceConfig,
    ) -> Result<Arc<Device<C>>, SetupError> {
        let device = Arc::new(Device::new(bus, config));
        device.start()?;
        let claimed = self.handlers.on_attached(&device);
        info!("Probed device, claimed: {claimed}");
        lock(&self.devices).push(Entry {
            device: Arc::clone(&device),
            claimed,
        });
        Ok(device)
    }

    /// Stop `device` and forget it. Returns `false` if it was not probed through this driver.
    pub fn remove(&self, device: &Arc<Device<C>>) -> bool {
        let entry = {
            let mut devices = lock(&self.devices);
            let Some(position) = devices
                .iter()
                .position(|entry| Arc::ptr_eq(&entry.device, device))
            else {
                return false;
            };
            devices.remove(position)
        };
        self.teardown(entry);
        true
    }

    /// Remove every device, most recently probed first.
    pub fn shutdown(&self) {
        let entries = std::mem::take(&mut *lock(&self.devices));
        debug!("Shutting down {} devices", entries.len());
        for entry in entries.into_iter().rev() {
            self.teardown(entry);
        }
    }

    pub fn devices(&self) -> Vec<Arc<Device<C>>> {
        lock(&self.devices)
            .iter()
            .map(|entry| Arc::clone(&entry.device))
            .collect()
    }

    fn teardown(&self, entry: Entry<C>) {
        if entry.claimed {
            self.handlers.on_removed(&entry.device);
        }
        entry.device.stop();
        debug!("Removed device {:?}", entry.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Request, RequestMode};
    use crate::sim::{SimTarget, RAM_BASE_ADDRESS};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        decline: AtomicBool,
        attached: AtomicUsize,
        removed: AtomicUsize,
    }

    impl DeviceHandlers<()> for Counting {
        fn on_attached(&self, device: &Arc<Device<()>>) -> bool {
            assert!(device.is_running());
            self.attached.fetch_add(1, Ordering::SeqCst);
            !self.decline.load(Ordering::SeqCst)
        }

        fn on_removed(&self, device: &Arc<Device<()>>) {
            assert!(device.is_running());
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn probe(driver: &HostDriver<()>) -> Arc<Device<()>> {
        driver
            .probe(Arc::new(SimTarget::new()), DeviceConfig::default())
            .unwrap()
    }

    #[test]
    fn probed_device_is_running_and_usable() {
        let handlers = Arc::new(Counting::default());
        let driver: HostDriver<()> = HostDriver::new(handlers.clone());
        let device = probe(&driver);
        assert_eq!(1, handlers.attached.load(Ordering::SeqCst));
        assert!(device
            .submit(Request::write(RAM_BASE_ADDRESS, &[1], RequestMode::WR_SYNC_BYTE_INC))
            .is_ok());

        assert!(driver.remove(&device));
        assert!(!device.is_running());
        assert_eq!(1, handlers.removed.load(Ordering::SeqCst));
        assert!(!driver.remove(&device));
    }

    #[test]
    fn declined_device_is_not_reported_removed() {
        let handlers = Arc::new(Counting::default());
        handlers.decline.store(true, Ordering::SeqCst);
        let driver: HostDriver<()> = HostDriver::new(handlers.clone());
        let device = probe(&driver);
        driver.shutdown();
        assert!(!device.is_running());
        assert_eq!(0, handlers.removed.load(Ordering::SeqCst));
    }

    #[test]
    fn shutdown_removes_everything() {
        let handlers = Arc::new(Counting::default());
        let driver: HostDriver<()> = HostDriver::new(handlers.clone());
        let devices = [probe(&driver), probe(&driver), probe(&driver)];
        assert_eq!(3, driver.devices().len());
        driver.shutdown();
        assert!(driver.devices().is_empty());
        assert!(devices.iter().all(|device| !device.is_running()));
        assert_eq!(3, handlers.removed.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_start_is_not_offered() {
        let handlers = Arc::new(Counting::default());
        let driver: HostDriver<()> = HostDriver::new(handlers.clone());
        let config = DeviceConfig {
            pool_capacity: 0,
            ..DeviceConfig::default()
        };
        assert!(matches!(
            driver.probe(Arc::new(SimTarget::new()), config),
            Err(SetupError::EmptyPool)
        ));
        assert_eq!(0, handlers.attached.load(Ordering::SeqCst));
    }
}
