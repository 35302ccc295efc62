//! Versioned handler registries for orchestrations and activities.
//!
//! One generic `Registry<H>` serves both handler kinds. Orchestrations carry
//! real semver versions and start-time policies; activities are pinned at
//! 1.0.0 with `Latest` because activity code is free to change between
//! invocations. Replay resolution (which code runs an instance whose history
//! already pinned a version) is a separate axis, controlled by
//! [`VersionMatch`] and [`VersionMiss`].

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::_typed_codec::Codec;
use crate::OrchestrationContext;
use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Version assigned when a handler is registered without one.
pub(crate) const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// Start-time version selection for new instances.
#[derive(Clone, Debug)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

/// How a replay turn matches the version pinned in history against the
/// registry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VersionMatch {
    /// Only the exact pinned version may run the replay.
    #[default]
    Exact,
    /// The greatest registered version that is not newer than the pinned one
    /// may run it.
    CurrentOrOlder,
}

/// What happens when [`VersionMatch`] finds nothing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VersionMiss {
    /// Fail the instance with a configuration error.
    #[default]
    Fail,
    /// Fall back to the start-time policy resolution.
    UseLatest,
}

/// Versioned registry keyed by handler name.
///
/// Cheap to clone; the handler map is immutable after build, only policies
/// can change at runtime.
pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, BTreeMap<Version, Arc<H>>>>,
    pub(crate) policy: Arc<Mutex<HashMap<String, VersionPolicy>>>,
}

// H: ?Sized blocks the derive
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
            policy: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, BTreeMap<Version, Arc<H>>>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Start a builder seeded with everything already registered here.
    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            policy: reg.policy.lock().expect("Mutex should not be poisoned").clone(),
            errors: Vec::new(),
        }
    }

    /// Resolve a handler for a new instance using the start-time policy.
    pub fn resolve_handler(&self, name: &str) -> Option<(Version, Arc<H>)> {
        let pol = self
            .policy
            .lock()
            .expect("Mutex should not be poisoned")
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest);

        let result = match &pol {
            VersionPolicy::Latest => self
                .inner
                .get(name)
                .and_then(|versions| versions.iter().next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
            VersionPolicy::Exact(v) => self
                .inner
                .get(name)
                .and_then(|versions| versions.get(v))
                .map(|h| (v.clone(), Arc::clone(h))),
        };

        if result.is_none() {
            self.log_registry_miss(name, None, Some(&pol));
        }

        result
    }

    /// Version the start-time policy would pick, without the handler.
    pub fn resolve_version(&self, name: &str) -> Option<Version> {
        self.resolve_handler(name).map(|(v, _h)| v)
    }

    /// Resolve a handler at an exact version.
    pub fn resolve_handler_exact(&self, name: &str, v: &Version) -> Option<Arc<H>> {
        let result = self.inner.get(name).and_then(|versions| versions.get(v).cloned());

        if result.is_none() {
            self.log_registry_miss(name, Some(v), None);
        }

        result
    }

    /// Resolve the handler that may replay an instance whose history pinned
    /// `pinned`. `match_mode` picks the candidate; `on_miss` decides whether
    /// a miss falls back to the start-time policy or surfaces as `None`.
    pub fn resolve_for_replay(
        &self,
        name: &str,
        pinned: &Version,
        match_mode: VersionMatch,
        on_miss: VersionMiss,
    ) -> Option<(Version, Arc<H>)> {
        let hit = match match_mode {
            VersionMatch::Exact => self
                .inner
                .get(name)
                .and_then(|versions| versions.get(pinned))
                .map(|h| (pinned.clone(), Arc::clone(h))),
            VersionMatch::CurrentOrOlder => self
                .inner
                .get(name)
                .and_then(|versions| versions.range(..=pinned).next_back())
                .map(|(v, h)| (v.clone(), Arc::clone(h))),
        };

        match hit {
            Some(found) => Some(found),
            None => match on_miss {
                VersionMiss::UseLatest => self.resolve_handler(name),
                VersionMiss::Fail => {
                    self.log_registry_miss(name, Some(pinned), None);
                    None
                }
            },
        }
    }

    pub fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy
            .lock()
            .expect("Mutex should not be poisoned")
            .insert(name.to_string(), policy);
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn list_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn debug_dump(&self) -> HashMap<String, Vec<String>> {
        self.inner
            .iter()
            .map(|(name, versions)| (name.clone(), versions.keys().map(|v| v.to_string()).collect()))
            .collect()
    }

    fn log_registry_miss(
        &self,
        name: &str,
        requested_version: Option<&Version>,
        requested_policy: Option<&VersionPolicy>,
    ) {
        let all_names = self.list_names();
        let policy_map = self.policy.lock().expect("Mutex should not be poisoned").clone();

        tracing::debug!(
            target: "duraflow::runtime::registry",
            requested_name = %name,
            requested_version = ?requested_version,
            requested_policy = ?requested_policy,
            available_versions_for_name = ?self.list_versions(name),
            registered_count = all_names.len(),
            registered_names = ?all_names,
            full_registry_contents = ?self.debug_dump(),
            current_policies = ?policy_map,
            "registry lookup miss"
        );
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
            policy: Arc::new(Mutex::new(self.policy)),
        }
    }

    /// Build, surfacing registration errors instead of swallowing them.
    ///
    /// # Errors
    ///
    /// Returns the accumulated registration errors joined with `; `.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn merge_registry(mut self, other: Registry<H>, error_prefix: &str) -> Self {
        for (name, versions) in other.inner.iter() {
            let entry = self.map.entry(name.clone()).or_default();
            for (version, handler) in versions.iter() {
                if entry.contains_key(version) {
                    self.errors
                        .push(format!("duplicate {error_prefix} in merge: {name}@{version}"));
                } else {
                    entry.insert(version.clone(), handler.clone());
                }
            }
        }
        self
    }

    /// Insert at `version`, recording a duplicate as an error and refusing
    /// versions that do not move forward. Registration order is author
    /// intent, so going backwards is a programming error worth a panic.
    fn insert_versioned(&mut self, name: &str, version: Version, handler: Arc<H>, error_prefix: &str) {
        let entry = self.map.entry(name.to_string()).or_default();
        if entry.contains_key(&version) {
            self.errors
                .push(format!("duplicate {error_prefix} registration: {name}@{version}"));
            return;
        }
        if let Some((latest, _)) = entry.iter().next_back() {
            if &version <= latest {
                panic!(
                    "non-monotonic {error_prefix} version for {name}: {version} is not later than existing latest {latest}"
                );
            }
        }
        entry.insert(version, handler);
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        self.insert_versioned(&name, DEFAULT_VERSION, Arc::new(FnOrchestration(f)), "orchestration");
        self
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
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        let v = Version::parse(version.as_ref()).expect("Version should be valid semver");
        self.insert_versioned(&name, v, Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    pub fn register_versioned_typed<In, Out, F, Fut>(
        self,
        name: impl Into<String>,
        version: impl AsRef<str>,
        f: F,
    ) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.register_versioned(name, version, wrapper)
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }

    pub fn register_all<F, Fut>(self, items: Vec<(&str, F)>) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static + Clone,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        items
            .into_iter()
            .fold(self, |builder, (name, f)| builder.register(name, f))
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(crate::ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        self.insert_versioned(&name, DEFAULT_VERSION, Arc::new(FnActivity(f)), "activity");
        // Activities always resolve latest
        self.policy.insert(name, VersionPolicy::Latest);
        self
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(crate::ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: crate::ActivityContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = (f_inner)(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.register(name, wrapper)
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }

    pub fn register_all<F, Fut>(self, items: Vec<(&str, F)>) -> Self
    where
        F: Fn(crate::ActivityContext, String) -> Fut + Send + Sync + 'static + Clone,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        items
            .into_iter()
            .fold(self, |builder, (name, f)| builder.register(name, f))
    }
}
