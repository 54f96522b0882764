//! Network-brokered remote device backend.
//!
//! The resource manager client itself is pluggable: callers register a
//! factory under a name in a [`ClientRegistry`], and the device inventory
//! refers to that name.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::traits::{Connector, TransportError};

/// Requirement set used to allocate a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationRequirements {
    pub platform_name: String,
    pub power_on: bool,
    pub connected: bool,
    #[serde(default)]
    pub tags: BTreeMap<String, bool>,
}

impl AllocationRequirements {
    pub fn for_platform(platform_name: impl Into<String>, tags: &[String]) -> Self {
        Self {
            platform_name: platform_name.into(),
            power_on: true,
            connected: true,
            tags: tags.iter().map(|t| (t.clone(), true)).collect(),
        }
    }
}

/// Client side of a remote resource manager.
pub trait ResourceManager: Send {
    /// List the platform names the manager can serve.
    fn get_resources(&mut self) -> Result<Vec<String>, TransportError>;

    fn allocate(
        &mut self,
        requirements: &AllocationRequirements,
    ) -> Result<Box<dyn RemoteResource>, TransportError>;

    fn disconnect(&mut self);
}

/// One allocated remote device.
pub trait RemoteResource: Send {
    fn resource_id(&self) -> &str;
    fn flash(&mut self, image: &std::path::Path, force: bool) -> Result<(), TransportError>;
    fn open_connection(&mut self, baud_rate: u32) -> Result<(), TransportError>;
    fn read(&mut self, max_bytes: usize) -> Result<Vec<u8>, TransportError>;
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;
    fn reset(&mut self) -> Result<(), TransportError>;
    fn is_connected(&self) -> bool;
    fn release(&mut self);
}

/// Creates a connected client from `(host, port)`.
pub type ClientFactory =
    Box<dyn Fn(&str, u16) -> Result<Box<dyn ResourceManager>, TransportError> + Send + Sync>;

/// Name to factory table of resource manager clients.
#[derive(Default)]
pub struct ClientRegistry {
    factories: HashMap<String, ClientFactory>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&str, u16) -> Result<Box<dyn ResourceManager>, TransportError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn create(
        &self,
        name: &str,
        host: &str,
        port: u16,
    ) -> Result<Box<dyn ResourceManager>, TransportError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| TransportError::UnknownClient(name.to_string()))?;
        factory(host, port)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub client: String,
    pub host: String,
    pub port: u16,
    pub platform_name: String,
    pub tags: Vec<String>,
    pub baud_rate: u32,
    /// Image flashed right after allocation.
    pub image: Option<PathBuf>,
    pub forced_reset_timeout: Duration,
}

pub struct RemoteConnector {
    config: RemoteConfig,
    client: Option<Box<dyn ResourceManager>>,
    resource: Option<Box<dyn RemoteResource>>,
    last_error: Option<TransportError>,
}

impl RemoteConnector {
    /// Create the client, allocate a matching device, flash, open and reset.
    ///
    /// Any partially acquired resource is released before an error returns.
    pub fn open(registry: &ClientRegistry, config: RemoteConfig) -> Result<Self, TransportError> {
        let client = registry.create(&config.client, &config.host, config.port)?;
        let mut connector = Self {
            config,
            client: Some(client),
            resource: None,
            last_error: None,
        };
        match connector.allocate_and_prepare() {
            Ok(()) => Ok(connector),
            Err(e) => {
                connector.close();
                Err(e)
            }
        }
    }

    fn allocate_and_prepare(&mut self) -> Result<(), TransportError> {
        let client = self.client.as_mut().ok_or(TransportError::Disconnected)?;
        let platforms = client.get_resources()?;
        if !platforms.iter().any(|p| p == &self.config.platform_name) {
            return Err(TransportError::Remote(format!(
                "no remote resources for platform {}",
                self.config.platform_name
            )));
        }

        let requirements =
            AllocationRequirements::for_platform(&self.config.platform_name, &self.config.tags);
        let resource = client.allocate(&requirements)?;
        info!(
            resource = %resource.resource_id(),
            platform = %self.config.platform_name,
            "Remote resource allocated"
        );
        // Stored before flashing so close() releases it on any later failure.
        let resource = self.resource.insert(resource);

        if let Some(image) = &self.config.image {
            resource.flash(image, true)?;
        }
        resource.open_connection(self.config.baud_rate)?;
        resource.reset()?;
        thread::sleep(self.config.forced_reset_timeout);
        Ok(())
    }

    fn fail(&mut self, err: TransportError) {
        warn!(error = %err, "Remote resource error");
        self.last_error = Some(err);
    }
}

impl Connector for RemoteConnector {
    fn name(&self) -> &str {
        "REMO"
    }

    fn read(&mut self, max_bytes: usize) -> Vec<u8> {
        let Some(resource) = self.resource.as_mut() else {
            return Vec::new();
        };
        match resource.read(max_bytes) {
            Ok(data) => data,
            Err(e) => {
                self.fail(e);
                Vec::new()
            }
        }
    }

    fn write(&mut self, payload: &[u8], log_it: bool) -> bool {
        let Some(resource) = self.resource.as_mut() else {
            return false;
        };
        match resource.write(payload) {
            Ok(()) => {
                if log_it {
                    debug!(data = %String::from_utf8_lossy(payload).trim_end(), "Remote write");
                }
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn flush(&mut self) {}

    fn reset(&mut self) -> bool {
        let Some(resource) = self.resource.as_mut() else {
            return false;
        };
        match resource.reset() {
            Ok(()) => {
                thread::sleep(self.config.forced_reset_timeout);
                true
            }
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn connected(&self) -> bool {
        self.resource.as_ref().is_some_and(|r| r.is_connected())
    }

    fn last_error(&self) -> Option<TransportError> {
        self.last_error.clone()
    }

    fn close(&mut self) {
        if let Some(mut resource) = self.resource.take() {
            debug!(resource = %resource.resource_id(), "Releasing remote resource");
            resource.release();
        }
        if let Some(mut client) = self.client.take() {
            client.disconnect();
        }
    }
}

impl Drop for RemoteConnector {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        flashed: Vec<PathBuf>,
        released: usize,
        disconnected: usize,
        written: Vec<u8>,
    }

    struct FakeManager {
        state: Arc<Mutex<FakeState>>,
        platforms: Vec<String>,
    }

    struct FakeResource {
        state: Arc<Mutex<FakeState>>,
    }

    impl ResourceManager for FakeManager {
        fn get_resources(&mut self) -> Result<Vec<String>, TransportError> {
            Ok(self.platforms.clone())
        }

        fn allocate(
            &mut self,
            requirements: &AllocationRequirements,
        ) -> Result<Box<dyn RemoteResource>, TransportError> {
            assert!(requirements.power_on && requirements.connected);
            Ok(Box::new(FakeResource {
                state: self.state.clone(),
            }))
        }

        fn disconnect(&mut self) {
            self.state.lock().unwrap().disconnected += 1;
        }
    }

    impl RemoteResource for FakeResource {
        fn resource_id(&self) -> &str {
            "fake-1"
        }

        fn flash(&mut self, image: &std::path::Path, _force: bool) -> Result<(), TransportError> {
            self.state.lock().unwrap().flashed.push(image.to_path_buf());
            Ok(())
        }

        fn open_connection(&mut self, _baud_rate: u32) -> Result<(), TransportError> {
            Ok(())
        }

        fn read(&mut self, _max_bytes: usize) -> Result<Vec<u8>, TransportError> {
            Ok(b"{{__sync;x}}\n".to_vec())
        }

        fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.state.lock().unwrap().written.extend_from_slice(data);
            Ok(())
        }

        fn reset(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn release(&mut self) {
            self.state.lock().unwrap().released += 1;
        }
    }

    fn registry(state: Arc<Mutex<FakeState>>, platforms: Vec<String>) -> ClientRegistry {
        let mut registry = ClientRegistry::new();
        registry.register("fake", move |_host, _port| {
            Ok(Box::new(FakeManager {
                state: state.clone(),
                platforms: platforms.clone(),
            }) as Box<dyn ResourceManager>)
        });
        registry
    }

    fn config() -> RemoteConfig {
        RemoteConfig {
            client: "fake".into(),
            host: "localhost".into(),
            port: 8000,
            platform_name: "K64F".into(),
            tags: vec!["usb".into()],
            baud_rate: 115200,
            image: Some(PathBuf::from("app.bin")),
            forced_reset_timeout: Duration::ZERO,
        }
    }

    #[test]
    fn test_remote_open_flashes_and_releases() {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let reg = registry(state.clone(), vec!["K64F".into()]);
        let mut conn = RemoteConnector::open(&reg, config()).unwrap();
        assert!(conn.connected());
        assert!(conn.write_kv("a", "b").is_some());
        assert_eq!(conn.read(64), b"{{__sync;x}}\n");

        conn.close();
        conn.close();
        drop(conn);
        let s = state.lock().unwrap();
        assert_eq!(s.flashed, vec![PathBuf::from("app.bin")]);
        assert_eq!(s.released, 1);
        assert_eq!(s.disconnected, 1);
        assert_eq!(s.written, b"{{a;b}}\n");
    }

    #[test]
    fn test_remote_unknown_platform_disconnects() {
        let state = Arc::new(Mutex::new(FakeState::default()));
        let reg = registry(state.clone(), vec!["NUCLEO".into()]);
        assert!(RemoteConnector::open(&reg, config()).is_err());
        assert_eq!(state.lock().unwrap().disconnected, 1);
    }

    #[test]
    fn test_unknown_client() {
        let reg = ClientRegistry::new();
        let err = RemoteConnector::open(&reg, config()).err().unwrap();
        assert_eq!(err, TransportError::UnknownClient("fake".into()));
    }

    #[test]
    fn test_requirements_tags() {
        let req = AllocationRequirements::for_platform("K64F", &["a".into()]);
        assert_eq!(req.tags.get("a"), Some(&true));
    }
}
