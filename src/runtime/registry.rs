use super::{FnOrchestration, OrchestrationHandler};
use crate::OrchestrationContext;
use crate::_typed_codec::{Codec, Json};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone)]
pub(crate) struct OrchestrationEntry {
    pub(crate) handler: Arc<dyn OrchestrationHandler>,
    /// Activities this orchestration schedules; checked against the activity registry at startup.
    pub(crate) activities: Vec<String>,
}

#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    pub(crate) inner: Arc<HashMap<String, OrchestrationEntry>>,
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name).map(|e| e.handler.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_orchestration_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check that every activity an orchestration declared is registered.
    pub fn validate_against(&self, activities: &ActivityRegistry) -> Result<(), String> {
        let mut missing = Vec::new();
        for (orch, entry) in self.inner.iter() {
            for act in &entry.activities {
                if activities.get(act).is_none() {
                    missing.push(format!("{orch} requires unregistered activity {act}"));
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            missing.sort();
            Err(missing.join("; "))
        }
    }
}

pub struct OrchestrationRegistryBuilder {
    map: HashMap<String, OrchestrationEntry>,
    errors: Vec<String>,
}

impl OrchestrationRegistryBuilder {
    fn insert(mut self, name: String, handler: Arc<dyn OrchestrationHandler>, activities: &[&str]) -> Self {
        if name.trim().is_empty() {
            self.errors.push("orchestration name must not be empty".to_string());
            return self;
        }
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate orchestration registration: {name}"));
            return self;
        }
        let activities = activities.iter().map(|a| a.to_string()).collect();
        self.map.insert(name, OrchestrationEntry { handler, activities });
        self
    }

    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)), &[])
    }

    /// Register an orchestration together with the activity names it schedules.
    pub fn register_with_activities<F, Fut>(self, name: impl Into<String>, activities: &[&str], f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)), activities)
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnOrchestration(wrapper)), &[])
    }

    /// Build, silently keeping the first registration of duplicate names.
    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<OrchestrationRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

// ---------------- Activity registry

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
    errors: Vec<String>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }
}

impl ActivityRegistryBuilder {
    /// Start from an existing registry, e.g. to add test doubles next to real activities.
    pub fn from_registry(reg: &ActivityRegistry) -> Self {
        ActivityRegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    fn insert(mut self, name: String, handler: Arc<dyn ActivityHandler>) -> Self {
        if name.trim().is_empty() {
            self.errors.push("activity name must not be empty".to_string());
            return self;
        }
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate activity registration: {name}"));
            return self;
        }
        self.map.insert(name, handler);
        self
    }

    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)))
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = (f_inner)(input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnActivity(wrapper)))
    }

    /// Replace (or add) a handler without duplicate checks.
    pub fn override_with<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.map.insert(name.into(), Arc::new(FnActivity(f)));
        self
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<ActivityRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}
