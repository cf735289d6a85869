//! Resource-identity keys
//!
//! Every request is reduced to a (component, group, version, resource,
//! namespace, name) tuple. The cache storage layer turns that tuple into a
//! key; the registry uses the same key so that a watch session and the cache
//! entries it populates line up.

use crate::error::KeyError;

/// Opaque key identifying one watched resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input to a [`KeyFunc`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyBuildInfo {
    pub component: String,
    pub group: String,
    pub version: String,
    pub resources: String,
    pub namespace: String,
    pub name: String,
}

/// Computes resource-identity keys
///
/// Must be deterministic: equal inputs give equal keys, distinct inputs give
/// distinct keys.
pub trait KeyFunc: Send + Sync {
    fn key(&self, info: &KeyBuildInfo) -> Result<ResourceKey, KeyError>;
}

/// Key layout of the on-disk cache: `component/resource.version.group/namespace/name`
///
/// The core group is spelled `core`. Empty namespace and name segments are
/// kept, so a cluster-wide list and a namespaced list never share a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageKeyFunc;

impl KeyFunc for StorageKeyFunc {
    fn key(&self, info: &KeyBuildInfo) -> Result<ResourceKey, KeyError> {
        if info.component.is_empty() {
            return Err(KeyError::EmptyComponent);
        }
        if info.resources.is_empty() {
            return Err(KeyError::EmptyResource);
        }

        let group = if info.group.is_empty() {
            "core"
        } else {
            info.group.as_str()
        };

        Ok(ResourceKey(format!(
            "{}/{}.{}.{}/{}/{}",
            info.component, info.resources, info.version, group, info.namespace, info.name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(component: &str, ns: &str, name: &str) -> KeyBuildInfo {
        KeyBuildInfo {
            component: component.into(),
            group: String::new(),
            version: "v1".into(),
            resources: "pods".into(),
            namespace: ns.into(),
            name: name.into(),
        }
    }

    #[test]
    fn test_key_is_stable() {
        let a = StorageKeyFunc.key(&info("kubelet", "default", "web")).unwrap();
        let b = StorageKeyFunc.key(&info("kubelet", "default", "web")).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.as_str(), "kubelet/pods.v1.core/default/web");
    }

    #[test]
    fn test_distinct_tuples_distinct_keys() {
        let keys = [
            info("kubelet", "default", "web"),
            info("kube-proxy", "default", "web"),
            info("kubelet", "", "web"),
            info("kubelet", "web", ""),
            info("kubelet", "", ""),
        ]
        .iter()
        .map(|i| StorageKeyFunc.key(i).unwrap())
        .collect::<std::collections::HashSet<_>>();

        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn test_grouped_resource() {
        let mut build = info("coredns", "", "");
        build.group = "discovery.k8s.io".into();
        build.resources = "endpointslices".into();

        let key = StorageKeyFunc.key(&build).unwrap();
        assert_eq!(key.as_str(), "coredns/endpointslices.v1.discovery.k8s.io//");
    }

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            StorageKeyFunc.key(&info("", "default", "web")),
            Err(KeyError::EmptyComponent)
        );

        let mut build = info("kubelet", "default", "web");
        build.resources.clear();
        assert_eq!(StorageKeyFunc.key(&build), Err(KeyError::EmptyResource));
    }
}
