use alloc::string::{String, ToString};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use log::{debug, trace};
use spin::RwLock;

use crate::device::DriverObject;
use crate::manager::IoManager;
use crate::status::DriverStatus;

/// Driver initializer: receives the fresh driver object and its registry
/// path, fills the dispatch table and creates devices.
pub type DriverEntry = Arc<dyn Fn(&Arc<IoManager>, &Arc<DriverObject>, &str) -> DriverStatus + Send + Sync>;

pub const ENTRY_SYMBOL: &str = "DriverEntry";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub path: String,
    pub image_base: u64,
}

/// Resolves service names to images and images to entry points.
pub trait DriverLoader: Send + Sync {
    fn resolve_driver_path(&self, service: &str) -> Result<String, DriverStatus>;
    fn load_module(&self, path: &str) -> Result<LoadedModule, DriverStatus>;
    fn find_entry_point(&self, module: &LoadedModule) -> Result<DriverEntry, DriverStatus>;
    fn unload_module(&self, _module: &LoadedModule) {}
}

struct Image {
    symbols: HashMap<String, DriverEntry>,
    loads: u32,
}

/// Loader for drivers linked into the host binary.
pub struct BuiltinLoader {
    services: RwLock<HashMap<String, String>>,
    images: RwLock<HashMap<String, Image>>,
    next_base: AtomicU64,
}

impl Default for BuiltinLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinLoader {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            images: RwLock::new(HashMap::new()),
            next_base: AtomicU64::new(0x1_4000_0000),
        }
    }

    /// Registers `entry` as the image at `path` and binds `service` to it.
    pub fn register<F>(&self, service: &str, path: &str, entry: F)
    where
        F: Fn(&Arc<IoManager>, &Arc<DriverObject>, &str) -> DriverStatus + Send + Sync + 'static,
    {
        self.register_image(path, Some(Arc::new(entry)));
        self.bind_service(service, path);
    }

    /// Adds an image. `None` registers one without an entry symbol.
    pub fn register_image(&self, path: &str, entry: Option<DriverEntry>) {
        let mut symbols = HashMap::new();
        if let Some(e) = entry {
            symbols.insert(ENTRY_SYMBOL.to_string(), e);
        }
        self.images
            .write()
            .insert(path.to_string(), Image { symbols, loads: 0 });
    }

    pub fn bind_service(&self, service: &str, path: &str) {
        self.services
            .write()
            .insert(service.to_string(), path.to_string());
    }

    /// Number of times the image at `path` is currently loaded.
    pub fn load_count(&self, path: &str) -> u32 {
        self.images.read().get(path).map_or(0, |i| i.loads)
    }
}

impl DriverLoader for BuiltinLoader {
    fn resolve_driver_path(&self, service: &str) -> Result<String, DriverStatus> {
        self.services
            .read()
            .get(service)
            .cloned()
            .ok_or(DriverStatus::ObjectNameNotFound)
    }

    fn load_module(&self, path: &str) -> Result<LoadedModule, DriverStatus> {
        let mut images = self.images.write();
        let img = images.get_mut(path).ok_or(DriverStatus::NoSuchFile)?;
        img.loads += 1;
        let image_base = self.next_base.fetch_add(0x10_0000, Ordering::Relaxed);
        debug!("loaded {} at {:#x}", path, image_base);
        Ok(LoadedModule {
            path: path.to_string(),
            image_base,
        })
    }

    fn find_entry_point(&self, module: &LoadedModule) -> Result<DriverEntry, DriverStatus> {
        self.images
            .read()
            .get(&module.path)
            .and_then(|i| i.symbols.get(ENTRY_SYMBOL).cloned())
            .ok_or(DriverStatus::DriverUnableToLoad)
    }

    fn unload_module(&self, module: &LoadedModule) {
        if let Some(img) = self.images.write().get_mut(&module.path) {
            img.loads = img.loads.saturating_sub(1);
            trace!("unloaded {} ({} left)", module.path, img.loads);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_and_load() {
        let l = BuiltinLoader::new();
        l.register("null", "null.sys", |_, _, _| DriverStatus::Success);
        let path = l.resolve_driver_path("null").unwrap();
        assert_eq!(path, "null.sys");
        let m = l.load_module(&path).unwrap();
        assert_eq!(l.load_count("null.sys"), 1);
        assert!(l.find_entry_point(&m).is_ok());
        l.unload_module(&m);
        assert_eq!(l.load_count("null.sys"), 0);
    }

    #[test]
    fn missing_pieces() {
        let l = BuiltinLoader::new();
        assert_eq!(l.resolve_driver_path("x").unwrap_err(), DriverStatus::ObjectNameNotFound);
        assert_eq!(l.load_module("x.sys").unwrap_err(), DriverStatus::NoSuchFile);
        l.register_image("bare.sys", None);
        let m = l.load_module("bare.sys").unwrap();
        assert_eq!(
            l.find_entry_point(&m).err(),
            Some(DriverStatus::DriverUnableToLoad)
        );
    }
}
