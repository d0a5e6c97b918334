//! Registration-table object factory.
//!
//! Maps a class name to a constructor closure, resolved once per create.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::traits::{HostedObject, ObjectFactory};
use crate::codec::Payload;
use crate::config::ConfigSnapshot;
use crate::error::{Error, Missing, Result};

type Constructor = Arc<
    dyn Fn(&Payload, &ConfigSnapshot) -> std::result::Result<Arc<dyn HostedObject>, String>
        + Send
        + Sync,
>;

/// Factory backed by a `class name -> constructor` table.
#[derive(Clone, Default)]
pub struct FactoryTable {
    constructors: HashMap<String, Constructor>,
}

impl FactoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor under `class_name`, replacing any previous one.
    pub fn register<F>(mut self, class_name: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&Payload, &ConfigSnapshot) -> std::result::Result<Arc<dyn HostedObject>, String>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(class_name.into(), Arc::new(constructor));
        self
    }

    pub fn classes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.constructors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for FactoryTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryTable").field("classes", &self.classes()).finish()
    }
}

#[async_trait]
impl ObjectFactory for FactoryTable {
    async fn construct(
        &self,
        class_name: &str,
        init_args: &Payload,
        config: &ConfigSnapshot,
    ) -> Result<Arc<dyn HostedObject>> {
        let constructor = self.constructors.get(class_name).ok_or_else(|| Error::NotFound {
            kind: Missing::Class,
            id: class_name.to_string(),
        })?;
        constructor(init_args, config).map_err(Error::ConstructionFailed)
    }
}
