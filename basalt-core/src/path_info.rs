use crate::error::{BasaltError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Description of one published path and the root servers serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathInfo {
    path_name: String,
    path_type: String,
    version: u64,
    root_leader: String,
    root_servers: Vec<String>,
}

impl PathInfo {
    pub fn new(
        path_name: impl Into<String>,
        path_type: impl Into<String>,
        version: u64,
        root_leader: impl Into<String>,
        root_servers: Vec<String>,
    ) -> Result<Self> {
        let path_name = path_name.into();
        let root_leader = root_leader.into();

        if path_name.trim().is_empty() {
            return Err(BasaltError::InvalidRequest(
                "path name cannot be empty".to_string(),
            ));
        }

        if !root_servers.iter().any(|server| server == &root_leader) {
            return Err(BasaltError::InvalidRequest(format!(
                "root leader {} is not one of the root servers of path {}",
                root_leader, path_name
            )));
        }

        Ok(Self {
            path_name,
            path_type: path_type.into(),
            version,
            root_leader,
            root_servers,
        })
    }

    pub fn path_name(&self) -> &str {
        &self.path_name
    }

    pub fn path_type(&self) -> &str {
        &self.path_type
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn root_leader(&self) -> &str {
        &self.root_leader
    }

    pub fn root_servers(&self) -> &[String] {
        &self.root_servers
    }

    /// Issues the superseding version with a new leader and server set.
    pub fn next_version(
        &self,
        root_leader: impl Into<String>,
        root_servers: Vec<String>,
    ) -> Result<Self> {
        Self::new(
            self.path_name.clone(),
            self.path_type.clone(),
            self.version + 1,
            root_leader,
            root_servers,
        )
    }
}

pub trait PathProcessor: Send + Sync {
    fn path_type(&self) -> &str;
}

type PathProcessorFactory = Arc<dyn Fn() -> Box<dyn PathProcessor> + Send + Sync>;

/// Registry of path processor factories, populated at startup.
#[derive(Clone, Default)]
pub struct PathTypeRegistry {
    factories: Arc<RwLock<HashMap<String, PathProcessorFactory>>>,
}

impl PathTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, path_type: impl Into<String>, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn PathProcessor> + Send + Sync + 'static,
    {
        let mut factories = self
            .factories
            .write()
            .map_err(|_| BasaltError::Internal("path type registry poisoned".to_string()))?;
        factories.insert(path_type.into(), Arc::new(factory));
        Ok(())
    }

    pub fn contains(&self, path_type: &str) -> bool {
        self.factories
            .read()
            .map(|factories| factories.contains_key(path_type))
            .unwrap_or(false)
    }

    pub fn create(&self, path_type: &str) -> Result<Box<dyn PathProcessor>> {
        let factory = {
            let factories = self
                .factories
                .read()
                .map_err(|_| BasaltError::Internal("path type registry poisoned".to_string()))?;
            factories
                .get(path_type)
                .cloned()
                .ok_or_else(|| BasaltError::UnknownPathType(path_type.to_string()))?
        };

        Ok(factory())
    }

    /// Checks that the path's type can be instantiated on this process.
    pub fn validate(&self, info: &PathInfo) -> Result<()> {
        if self.contains(info.path_type()) {
            Ok(())
        } else {
            Err(BasaltError::UnknownPathType(info.path_type().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullProcessor;

    impl PathProcessor for NullProcessor {
        fn path_type(&self) -> &str {
            "null"
        }
    }

    fn servers(addresses: &[&str]) -> Vec<String> {
        addresses.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn leader_must_be_a_root_server() {
        let result = PathInfo::new("accounts", "null", 1, "r3:9000", servers(&["r1:9000"]));
        assert!(matches!(result, Err(BasaltError::InvalidRequest(_))));

        let info = PathInfo::new(
            "accounts",
            "null",
            1,
            "r1:9000",
            servers(&["r1:9000", "r2:9000"]),
        )
        .unwrap();
        assert_eq!(info.root_leader(), "r1:9000");

        let next = info.next_version("r2:9000", servers(&["r2:9000"])).unwrap();
        assert_eq!(next.version(), 2);
        assert!(info.next_version("r1:9000", servers(&["r2:9000"])).is_err());
    }

    #[test]
    fn registry_reports_unknown_types() {
        let registry = PathTypeRegistry::new();
        registry
            .register("null", || Box::new(NullProcessor) as Box<dyn PathProcessor>)
            .unwrap();

        assert_eq!(registry.create("null").unwrap().path_type(), "null");
        assert!(matches!(
            registry.create("missing"),
            Err(BasaltError::UnknownPathType(name)) if name == "missing"
        ));

        let info = PathInfo::new("p", "missing", 1, "a:1", servers(&["a:1"])).unwrap();
        assert!(registry.validate(&info).is_err());
    }
}
