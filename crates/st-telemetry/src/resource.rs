use std::sync::Arc;

use opentelemetry::{Key, KeyValue, Value};
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions as semconv;

use crate::config::ServiceConfig;
use crate::error::TelemetryError;

/// Immutable identity attached to every span and metric this process emits.
///
/// Built once during bootstrap and shared by `Arc` with both providers.
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    resource: Resource,
}

impl ResourceDescriptor {
    /// Build the descriptor from service settings, layered over the SDK's
    /// default detectors (`OTEL_RESOURCE_ATTRIBUTES`, SDK name/version).
    pub fn from_config(service: &ServiceConfig) -> Result<Arc<Self>, TelemetryError> {
        if service.name.trim().is_empty() {
            return Err(TelemetryError::Resource("service name must not be empty".into()));
        }
        if service.version.trim().is_empty() {
            return Err(TelemetryError::Resource("service version must not be empty".into()));
        }

        let mut attrs = Vec::with_capacity(service.attributes.len() + 3);
        for (key, value) in &service.attributes {
            if key.trim().is_empty() {
                return Err(TelemetryError::Resource(format!(
                    "resource tag with empty key (value `{value}`)"
                )));
            }
            attrs.push(KeyValue::new(key.clone(), value.clone()));
        }
        // Identity keys win over operator tags of the same name.
        attrs.push(semconv::resource::SERVICE_NAME.string(service.name.clone()));
        attrs.push(semconv::resource::SERVICE_VERSION.string(service.version.clone()));
        attrs.push(semconv::resource::DEPLOYMENT_ENVIRONMENT.string(service.environment.clone()));

        let ours = Resource::from_schema_url(attrs, semconv::SCHEMA_URL);
        let resource = Resource::default().merge(&ours);
        Ok(Arc::new(Self { resource }))
    }

    pub fn service_name(&self) -> String {
        self.get_str(semconv::resource::SERVICE_NAME)
            .unwrap_or_default()
    }

    pub fn get(&self, key: impl Into<Key>) -> Option<Value> {
        self.resource.get(key.into())
    }

    pub fn get_str(&self, key: impl Into<Key>) -> Option<String> {
        self.get(key).map(|v| v.as_str().into_owned())
    }

    /// All attributes as owned key/value pairs, sorted by key.
    pub fn attributes(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .resource
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.as_str().into_owned()))
            .collect();
        out.sort();
        out
    }

    pub fn schema_url(&self) -> Option<&str> {
        self.resource.schema_url()
    }

    /// The SDK resource, cloned into each provider.
    pub fn resource(&self) -> Resource {
        self.resource.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ServiceConfig {
        let mut cfg = ServiceConfig::default();
        cfg.attributes.insert("team".into(), "markets".into());
        cfg.attributes.insert("service.name".into(), "shadowed".into());
        cfg
    }

    #[test]
    fn test_identity_attributes_present() {
        let res = ResourceDescriptor::from_config(&service()).unwrap();
        assert_eq!(res.service_name(), "stock-tracker-service");
        assert_eq!(res.get_str("deployment.environment").as_deref(), Some("development"));
        assert_eq!(res.get_str("team").as_deref(), Some("markets"));
        assert_eq!(res.schema_url(), Some(semconv::SCHEMA_URL));
    }

    #[test]
    fn test_operator_tag_cannot_shadow_service_name() {
        let res = ResourceDescriptor::from_config(&service()).unwrap();
        assert_eq!(res.get_str("service.name").as_deref(), Some("stock-tracker-service"));
    }

    #[test]
    fn test_blank_name_rejected() {
        let mut cfg = ServiceConfig::default();
        cfg.name = "  ".into();
        let err = ResourceDescriptor::from_config(&cfg).unwrap_err();
        assert!(matches!(err, TelemetryError::Resource(_)));
    }

    #[test]
    fn test_attributes_sorted() {
        let res = ResourceDescriptor::from_config(&service()).unwrap();
        let attrs = res.attributes();
        let keys: Vec<&str> = attrs.iter().map(|(k, _)| k.as_str()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
