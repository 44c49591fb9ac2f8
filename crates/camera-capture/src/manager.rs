//! Camera Manager
//!
//! Registry of cameras by logical name. Cameras are created from their
//! configurations through a [`DeviceFactory`], which is where a vendor SDK
//! plugs in.

use crate::config::CameraConfig;
use crate::device::AcquisitionDevice;
use crate::driver::CameraDriver;
use crate::mock::MockCamera;
use crate::sim::{SimulatedDevice, SimulatedSensor};
use crate::{Camera, CameraError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

/// Creates the acquisition device for a hardware camera
pub trait DeviceFactory: Send + Sync {
    fn create(&self, config: &CameraConfig) -> Result<Box<dyn AcquisitionDevice>, CameraError>;
}

/// Factory producing free-running simulated devices
///
/// Each device fires frames at the configured fps. The sensor handles stay
/// reachable for fault injection.
#[derive(Default)]
pub struct SimulatedDeviceFactory {
    sensors: Mutex<BTreeMap<String, SimulatedSensor>>,
}

impl SimulatedDeviceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sensor behind the device with serial number `device_name`
    pub fn sensor(&self, device_name: &str) -> Option<SimulatedSensor> {
        self.sensors.lock().ok()?.get(device_name).cloned()
    }
}

impl DeviceFactory for SimulatedDeviceFactory {
    fn create(&self, config: &CameraConfig) -> Result<Box<dyn AcquisitionDevice>, CameraError> {
        let sensor = SimulatedSensor::new(&config.device_name);
        self.sensors
            .lock()
            .map_err(|e| CameraError::Lock(e.to_string()))?
            .insert(config.device_name.clone(), sensor.clone());

        let interval = if config.fps > 0.0 {
            Duration::from_secs_f64(1.0 / config.fps)
        } else {
            Duration::from_millis(100)
        };
        Ok(Box::new(SimulatedDevice::free_running(sensor, interval)))
    }
}

/// Cameras by logical name
#[derive(Default)]
pub struct CameraManager {
    cameras: BTreeMap<String, Arc<dyn Camera>>,
}

impl CameraManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every camera in `configs`; mock configs never touch the factory
    pub fn from_configs(
        configs: &[CameraConfig],
        factory: &dyn DeviceFactory,
        restart_backoff: Duration,
    ) -> Result<Self, CameraError> {
        let mut manager = Self::new();
        for config in configs {
            let camera: Arc<dyn Camera> = if config.is_mock() {
                Arc::new(MockCamera::new(config.clone()))
            } else {
                let device = factory.create(config)?;
                Arc::new(CameraDriver::new(config.clone(), device).with_restart_backoff(restart_backoff))
            };
            manager.add(camera)?;
        }
        info!("Camera manager holds {} cameras", manager.len());
        Ok(manager)
    }

    /// Register a camera; names must be unique
    pub fn add(&mut self, camera: Arc<dyn Camera>) -> Result<(), CameraError> {
        let name = camera.name().to_string();
        if self.cameras.contains_key(&name) {
            return Err(CameraError::Config(format!("duplicate camera name {}", name)));
        }
        self.cameras.insert(name, camera);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Camera>> {
        self.cameras.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.cameras.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// Start every camera, returning how many are running
    ///
    /// A camera that fails to start is logged and left stopped.
    pub fn start_all(&self) -> usize {
        let mut started = 0;
        for (name, camera) in &self.cameras {
            match camera.start() {
                Ok(()) => started += 1,
                Err(e) => error!("Failed to start camera {}: {}", name, e),
            }
        }
        info!("Started {}/{} cameras", started, self.cameras.len());
        started
    }

    /// Shut every camera down, closing devices
    pub fn stop_all(&self) {
        for (name, camera) in &self.cameras {
            if let Err(e) = camera.shutdown() {
                warn!("Failed to shut down camera {}: {}", name, e);
            }
        }
    }

    /// Whether at least one of `names` is started
    pub fn any_started(&self, names: &[String]) -> bool {
        names
            .iter()
            .filter_map(|n| self.cameras.get(n))
            .any(|c| c.is_started())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configs() -> Vec<CameraConfig> {
        let mut top = CameraConfig::area_array("top", "SN1");
        top.pixel_format = "Mono8".to_string();
        top.width = 32;
        top.height = 16;
        top.fps = 200.0;
        vec![top, CameraConfig::mock("side", None)]
    }

    #[test]
    fn test_from_configs_and_lookup() {
        let factory = SimulatedDeviceFactory::new();
        let manager = CameraManager::from_configs(&configs(), &factory, Duration::from_millis(1)).unwrap();
        assert_eq!(manager.names(), vec!["side".to_string(), "top".to_string()]);
        assert!(manager.get("top").is_some());
        assert!(manager.get("missing").is_none());
        assert!(factory.sensor("SN1").is_some());
        assert!(manager.get("side").unwrap().is_mock());
    }

    #[test]
    fn test_start_all_and_read() {
        let factory = SimulatedDeviceFactory::new();
        let manager = CameraManager::from_configs(&configs(), &factory, Duration::from_millis(1)).unwrap();
        assert!(!manager.any_started(&["top".to_string()]));
        assert_eq!(manager.start_all(), 2);
        assert!(manager.any_started(&["top".to_string(), "missing".to_string()]));

        let frame = manager.get("top").unwrap().read(2000).unwrap();
        assert_eq!((frame.width, frame.height), (32, 16));
        manager.stop_all();
        assert!(!manager.get("top").unwrap().is_opened());
        assert!(!manager.get("top").unwrap().is_started());
        assert!(!manager.get("side").unwrap().is_started());
        assert!(!factory.sensor("SN1").unwrap().is_open());
    }

    #[test]
    fn test_start_all_counts_failures() {
        let factory = SimulatedDeviceFactory::new();
        let manager = CameraManager::from_configs(&configs(), &factory, Duration::from_millis(1)).unwrap();
        factory.sensor("SN1").unwrap().set_present(false);
        assert_eq!(manager.start_all(), 1);
        assert!(!manager.any_started(&["top".to_string()]));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut manager = CameraManager::new();
        manager.add(Arc::new(MockCamera::new(CameraConfig::mock("a", None)))).unwrap();
        assert!(manager.add(Arc::new(MockCamera::new(CameraConfig::mock("a", None)))).is_err());
        assert_eq!(manager.len(), 1);
    }
}
