pub mod github;

use std::{collections::HashMap, sync::Arc};

use anyhow::{Result, bail};
use commit_status_core::models::{
    BuildRef, Comment, Event, PublisherDescriptor, VcsRootInstance,
};
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, RwLock};

/// Everything a publisher needs to report one event for one revision.
#[derive(Debug, Clone, Copy)]
pub struct PublishRequest<'a> {
    pub event: Event,
    pub build: &'a BuildRef,
    pub root: Option<&'a VcsRootInstance>,
    pub revision: Option<&'a str>,
    pub comment: Option<&'a Comment>,
}

/// Gateway to one external status endpoint.
pub trait StatusPublisher: Send + Sync {
    /// Publishes a single event. Returns `false` if the event does not apply to this target.
    fn publish<'a>(&'a self, request: PublishRequest<'a>) -> BoxFuture<'a, Result<bool>>;
}

/// Creates publisher instances for features of one publisher type.
pub trait PublisherFactory: Send + Sync {
    /// Publisher type id, matched against [`PublisherDescriptor::publisher_id`].
    fn id(&self) -> &str;

    fn display_name(&self) -> &str;

    fn create(&self, descriptor: &PublisherDescriptor) -> Result<Arc<dyn StatusPublisher>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FeatureKey {
    build_type_id: String,
    feature_id: String,
}

impl From<&PublisherDescriptor> for FeatureKey {
    fn from(descriptor: &PublisherDescriptor) -> Self {
        Self { build_type_id: descriptor.build_type_id.clone(), feature_id: descriptor.id.clone() }
    }
}

/// Maps the publisher features of build configurations to live publisher instances.
#[derive(Default)]
pub struct PublisherRegistry {
    factories: HashMap<String, Arc<dyn PublisherFactory>>,
    features: RwLock<HashMap<String, Vec<PublisherDescriptor>>>,
    instances: Mutex<HashMap<FeatureKey, Arc<dyn StatusPublisher>>>,
}

impl PublisherRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn with_factory(mut self, factory: impl PublisherFactory + 'static) -> Self {
        self.factories.insert(factory.id().to_string(), Arc::new(factory));
        self
    }

    pub fn has_factory(&self, publisher_id: &str) -> bool {
        self.factories.contains_key(publisher_id)
    }

    /// Adds or replaces a feature (by build configuration and feature id).
    pub async fn add_feature(&self, descriptor: PublisherDescriptor) -> Result<()> {
        if !self.has_factory(&descriptor.publisher_id) {
            bail!(
                "Unknown publisher type {} for feature {} of {}",
                descriptor.publisher_id,
                descriptor.id,
                descriptor.build_type_id
            );
        }
        self.instances.lock().await.remove(&FeatureKey::from(&descriptor));
        let mut features = self.features.write().await;
        let list = features.entry(descriptor.build_type_id.clone()).or_default();
        match list.iter_mut().find(|existing| existing.id == descriptor.id) {
            Some(existing) => *existing = descriptor,
            None => list.push(descriptor),
        }
        Ok(())
    }

    pub async fn remove_feature(&self, build_type_id: &str, feature_id: &str) -> bool {
        self.instances.lock().await.remove(&FeatureKey {
            build_type_id: build_type_id.to_string(),
            feature_id: feature_id.to_string(),
        });
        let mut features = self.features.write().await;
        let Some(list) = features.get_mut(build_type_id) else {
            return false;
        };
        let len = list.len();
        list.retain(|descriptor| descriptor.id != feature_id);
        len != list.len()
    }

    /// All features of a build configuration.
    pub async fn features(&self, build_type_id: &str) -> Vec<PublisherDescriptor> {
        self.features.read().await.get(build_type_id).cloned().unwrap_or_default()
    }

    pub async fn feature(
        &self,
        build_type_id: &str,
        feature_id: &str,
    ) -> Option<PublisherDescriptor> {
        let features = self.features.read().await;
        features.get(build_type_id)?.iter().find(|descriptor| descriptor.id == feature_id).cloned()
    }

    /// Returns the publisher instance for a feature, creating it on first use.
    pub async fn publisher(
        &self,
        descriptor: &PublisherDescriptor,
    ) -> Result<Arc<dyn StatusPublisher>> {
        let key = FeatureKey::from(descriptor);
        let mut instances = self.instances.lock().await;
        if let Some(publisher) = instances.get(&key) {
            return Ok(publisher.clone());
        }
        let Some(factory) = self.factories.get(&descriptor.publisher_id) else {
            bail!("Unknown publisher type {}", descriptor.publisher_id);
        };
        let publisher = factory.create(descriptor)?;
        tracing::debug!(
            feature = %descriptor.id,
            build_type = %descriptor.build_type_id,
            "Created {} publisher",
            factory.display_name()
        );
        instances.insert(key, publisher.clone());
        Ok(publisher)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct NoopPublisher;

    impl StatusPublisher for NoopPublisher {
        fn publish<'a>(&'a self, _request: PublishRequest<'a>) -> BoxFuture<'a, Result<bool>> {
            Box::pin(async { Ok(true) })
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        created: Arc<AtomicUsize>,
    }

    impl PublisherFactory for CountingFactory {
        fn id(&self) -> &str { "noop" }

        fn display_name(&self) -> &str { "No-op" }

        fn create(&self, _descriptor: &PublisherDescriptor) -> Result<Arc<dyn StatusPublisher>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NoopPublisher))
        }
    }

    fn descriptor(id: &str, vcs_root_id: Option<&str>) -> PublisherDescriptor {
        PublisherDescriptor {
            id: id.to_string(),
            publisher_id: "noop".to_string(),
            build_type_id: "Project_Build".to_string(),
            vcs_root_id: vcs_root_id.map(str::to_string),
            params: HashMap::new(),
        }
    }

    fn root(root_id: u64, external_id: &str) -> VcsRootInstance {
        VcsRootInstance {
            id: root_id * 10,
            root_id,
            external_id: external_id.to_string(),
            name: external_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_unknown_publisher_type_is_rejected() {
        let registry = PublisherRegistry::new();
        assert!(registry.add_feature(descriptor("BUILD_EXT_1", None)).await.is_err());
        assert!(registry.features("Project_Build").await.is_empty());
    }

    #[tokio::test]
    async fn test_features_filter_by_root() {
        let registry = PublisherRegistry::new().with_factory(CountingFactory::default());
        registry.add_feature(descriptor("BUILD_EXT_1", None)).await.unwrap();
        registry.add_feature(descriptor("BUILD_EXT_2", Some("Vcs2"))).await.unwrap();
        registry.add_feature(descriptor("BUILD_EXT_3", Some("3"))).await.unwrap();

        let features = registry.features("Project_Build").await;
        let ids = |root: VcsRootInstance| {
            let matching = features.iter().filter(|d| d.applies_to(&root));
            matching.map(|d| d.id.as_str()).collect::<Vec<_>>()
        };
        assert_eq!(ids(root(1, "Vcs1")), vec!["BUILD_EXT_1"]);
        assert_eq!(ids(root(2, "Vcs2")), vec!["BUILD_EXT_1", "BUILD_EXT_2"]);
        assert_eq!(ids(root(3, "Vcs3")), vec!["BUILD_EXT_1", "BUILD_EXT_3"]);
        assert!(registry.features("Project_Other").await.is_empty());
    }

    #[tokio::test]
    async fn test_instances_are_cached_until_feature_changes() {
        let factory = CountingFactory::default();
        let created = factory.created.clone();
        let registry = PublisherRegistry::new().with_factory(factory);
        let feature = descriptor("BUILD_EXT_1", None);
        registry.add_feature(feature.clone()).await.unwrap();

        registry.publisher(&feature).await.unwrap();
        registry.publisher(&feature).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);

        // Replacing the feature drops the cached instance
        registry.add_feature(feature.clone()).await.unwrap();
        assert_eq!(registry.features("Project_Build").await.len(), 1);
        registry.publisher(&feature).await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);

        assert!(registry.remove_feature("Project_Build", "BUILD_EXT_1").await);
        assert!(!registry.remove_feature("Project_Build", "BUILD_EXT_1").await);
        assert!(registry.feature("Project_Build", "BUILD_EXT_1").await.is_none());
    }
}
