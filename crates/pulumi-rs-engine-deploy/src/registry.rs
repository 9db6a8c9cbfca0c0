use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use pulumi_rs_engine_resource::provider_ref::{self, ProviderReference};
use pulumi_rs_engine_resource::{PropertyMap, Urn};

use crate::error::BailError;
use crate::provider::{HandshakeResponse, Provider, ProviderError, ProviderHost, INTERNAL_KEY};

/// The identity of a default provider: the only keys that produce a
/// distinct default provider for the same package.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DefaultProviderKey {
    pub package: String,
    pub version: Option<String>,
    pub plugin_download_url: Option<String>,
}

struct Inner {
    /// Configured provider instances keyed by reference string. During a
    /// provider replacement the old and the new instance are both present.
    instances: HashMap<String, Arc<dyn Provider>>,
    /// References whose instance has been configured.
    configured: HashSet<String>,
    /// Handshake results per reference.
    handshakes: HashMap<String, HandshakeResponse>,
    /// Canonical default providers created so far.
    defaults: HashMap<DefaultProviderKey, ProviderReference>,
    /// Program-supplied default overrides, by package.
    overrides: HashMap<String, ProviderReference>,
}

/// Resolves resources to configured provider instances and maintains
/// provider lifecycle across replacements and aliases.
///
/// This is the engine's only shared mutable map. The lock is never held
/// across a provider call.
pub struct ProviderRegistry {
    host: Arc<dyn ProviderHost>,
    project: String,
    stack: String,
    disabled: Vec<String>,
    inner: Mutex<Inner>,
}

impl ProviderRegistry {
    pub fn new(
        host: Arc<dyn ProviderHost>,
        project: &str,
        stack: &str,
        disable_default_providers: Vec<String>,
    ) -> Self {
        Self {
            host,
            project: project.to_string(),
            stack: stack.to_string(),
            disabled: disable_default_providers,
            inner: Mutex::new(Inner {
                instances: HashMap::new(),
                configured: HashSet::new(),
                handshakes: HashMap::new(),
                defaults: HashMap::new(),
                overrides: HashMap::new(),
            }),
        }
    }

    /// Fails when default providers are denied for the package.
    pub fn check_default_allowed(&self, package: &str) -> Result<(), BailError> {
        if self.disabled.iter().any(|p| p == "*" || p == package) {
            return Err(BailError::DefaultProviderDenied {
                package: package.to_string(),
            });
        }
        Ok(())
    }

    /// The URN a default provider for this key would have.
    pub fn default_provider_urn(&self, key: &DefaultProviderKey) -> Urn {
        provider_ref::default_provider_urn(
            &self.stack,
            &self.project,
            &key.package,
            key.version.as_deref(),
        )
    }

    /// Looks up the canonical default provider for a key, if one has been
    /// created. Program-registered overrides win over synthesized defaults.
    pub fn lookup_default(&self, key: &DefaultProviderKey) -> Option<ProviderReference> {
        let inner = self.inner.lock().unwrap();
        if let Some(reference) = inner.overrides.get(&key.package) {
            return Some(reference.clone());
        }
        inner.defaults.get(key).cloned()
    }

    /// Records the canonical default provider for a key.
    pub fn note_default(&self, key: DefaultProviderKey, reference: ProviderReference) {
        self.inner.lock().unwrap().defaults.insert(key, reference);
    }

    /// Registers a program-supplied default provider override.
    pub fn set_default_override(&self, reference: &str) -> Result<(), BailError> {
        let parsed = ProviderReference::parse(reference)?;
        let package = parsed.package().to_string();
        self.inner.lock().unwrap().overrides.insert(package, parsed);
        Ok(())
    }

    /// Loads a fresh, unconfigured instance for a package. The version
    /// string, when present, must be valid semver.
    pub fn new_instance(
        &self,
        package: &str,
        version: Option<&str>,
    ) -> Result<Arc<dyn Provider>, BailError> {
        let parsed = match version {
            Some(v) if !v.is_empty() => Some(semver::Version::parse(v).map_err(|source| {
                BailError::BadProviderVersion {
                    package: package.to_string(),
                    version: v.to_string(),
                    source,
                }
            })?),
            _ => None,
        };
        self.host
            .new_instance(package, parsed.as_ref())
            .map_err(|e| BailError::Config(e.to_string()))
    }

    /// Configures an instance and registers it under its reference. The
    /// `__internal` input key is filtered out before the provider sees its
    /// inputs. Configuring an already-configured reference is a no-op:
    /// configuration happens once per instance.
    pub async fn configure(
        &self,
        reference: &ProviderReference,
        provider: Arc<dyn Provider>,
        inputs: &PropertyMap,
    ) -> Result<HandshakeResponse, ProviderError> {
        let key = reference.to_string();
        {
            let inner = self.inner.lock().unwrap();
            if inner.configured.contains(&key) {
                return Ok(inner.handshakes.get(&key).copied().unwrap_or_default());
            }
        }

        let handshake = provider.handshake().await?;
        let mut filtered = inputs.clone();
        filtered.remove(INTERNAL_KEY);
        provider.configure(&filtered).await?;

        let mut inner = self.inner.lock().unwrap();
        inner.instances.insert(key.clone(), provider);
        inner.handshakes.insert(key.clone(), handshake);
        inner.configured.insert(key);
        Ok(handshake)
    }

    /// The configured instance for a reference string.
    pub fn instance(&self, reference: &str) -> Option<Arc<dyn Provider>> {
        self.inner.lock().unwrap().instances.get(reference).cloned()
    }

    /// The handshake recorded for a reference string.
    pub fn handshake_for(&self, reference: &str) -> HandshakeResponse {
        self.inner
            .lock()
            .unwrap()
            .handshakes
            .get(reference)
            .copied()
            .unwrap_or_default()
    }

    /// Drops a provider instance once its resource has been deleted.
    pub fn forget(&self, reference: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.instances.remove(reference);
        inner.configured.remove(reference);
        inner.handshakes.remove(reference);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestProviderHost;
    use pulumi_rs_engine_resource::provider_ref::UNKNOWN_ID;
    use pulumi_rs_engine_resource::PropertyValue;

    fn registry(disabled: Vec<String>) -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(TestProviderHost::new()), "test", "test", disabled)
    }

    fn reference(name: &str) -> ProviderReference {
        ProviderReference::new(
            Urn::new("test", "test", None, "pulumi:providers:pkgA", name),
            "id-1",
        )
    }

    #[test]
    fn test_default_denied_by_package_and_wildcard() {
        let r = registry(vec!["pkgA".to_string()]);
        assert!(r.check_default_allowed("pkgA").is_err());
        assert!(r.check_default_allowed("pkgB").is_ok());

        let r = registry(vec!["*".to_string()]);
        assert!(r.check_default_allowed("pkgB").is_err());
    }

    #[test]
    fn test_default_key_includes_version() {
        let r = registry(Vec::new());
        let v1 = DefaultProviderKey {
            package: "pkgA".to_string(),
            version: Some("0.17.10".to_string()),
            plugin_download_url: None,
        };
        let v2 = DefaultProviderKey {
            version: Some("0.17.11".to_string()),
            ..v1.clone()
        };
        r.note_default(
            v1.clone(),
            ProviderReference::new(r.default_provider_urn(&v1), UNKNOWN_ID),
        );
        assert!(r.lookup_default(&v1).is_some());
        assert!(r.lookup_default(&v2).is_none());
        assert_eq!(
            r.default_provider_urn(&v2).name(),
            "default_0_17_11"
        );
    }

    #[test]
    fn test_override_wins_over_default() {
        let r = registry(Vec::new());
        let key = DefaultProviderKey {
            package: "pkgA".to_string(),
            version: None,
            plugin_download_url: None,
        };
        let explicit = reference("provA");
        r.set_default_override(&explicit.to_string()).unwrap();
        assert_eq!(r.lookup_default(&key), Some(explicit));
    }

    #[test]
    fn test_malformed_override_rejected() {
        let r = registry(Vec::new());
        assert!(r.set_default_override("not-a-reference").is_err());
    }

    #[test]
    fn test_bad_version_rejected() {
        let r = registry(Vec::new());
        let err = r.new_instance("pkgA", Some("not-semver")).unwrap_err();
        assert!(matches!(err, BailError::BadProviderVersion { .. }));
    }

    #[tokio::test]
    async fn test_configure_once_filters_internal_key() {
        let host = Arc::new(TestProviderHost::new());
        let r = ProviderRegistry::new(host.clone(), "test", "test", Vec::new());
        let provider = r.new_instance("pkgA", None).unwrap();

        let mut inputs = PropertyMap::new();
        inputs.insert("region".to_string(), PropertyValue::string("us-east-1"));
        inputs.insert(
            INTERNAL_KEY.to_string(),
            PropertyValue::string("pluginDownloadURL=https://example.com"),
        );

        let reference = reference("provA");
        r.configure(&reference, provider.clone(), &inputs)
            .await
            .unwrap();
        // Second configure for the same reference is a no-op.
        r.configure(&reference, provider, &inputs).await.unwrap();

        let configs = host.recorded().configure_calls();
        assert_eq!(configs.len(), 1);
        assert!(!configs[0].contains_key(INTERNAL_KEY));
        assert!(configs[0].contains_key("region"));

        assert!(r.instance(&reference.to_string()).is_some());
        r.forget(&reference.to_string());
        assert!(r.instance(&reference.to_string()).is_none());
    }
}
