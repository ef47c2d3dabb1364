//! DID documents
//!
//! Typed view of a DID document with a structural well-formedness check.
//! Unknown members are kept in `extra` so documents survive a decode/encode
//! cycle untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DocumentError {
    #[error("Invalid DID: {0}")]
    InvalidDid(String),

    #[error("Invalid verification method {id}: {reason}")]
    InvalidVerificationMethod { id: String, reason: String },

    #[error("Invalid service {id}: {reason}")]
    InvalidService { id: String, reason: String },

    #[error("Invalid controller: {0}")]
    InvalidController(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    pub id: String,

    /// A DID or list of DIDs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_known_as: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification_method: Vec<VerificationMethod>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authentication: Vec<VerificationRelationship>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertion_method: Vec<VerificationRelationship>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_agreement: Vec<VerificationRelationship>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capability_invocation: Vec<VerificationRelationship>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capability_delegation: Vec<VerificationRelationship>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service: Vec<Service>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationMethod {
    pub id: String,

    #[serde(rename = "type")]
    pub method_type: String,

    pub controller: String,

    /// Key material (`publicKeyMultibase`, `publicKeyJwk`, ...)
    #[serde(flatten)]
    pub key: BTreeMap<String, Value>,
}

/// Either a reference to a verification method or an embedded one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VerificationRelationship {
    Reference(String),
    Embedded(VerificationMethod),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,

    #[serde(rename = "type")]
    pub service_type: String,

    /// URI, map or list of either
    pub service_endpoint: Value,
}

impl DidDocument {
    /// Minimal document with only an id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            context: Some(Value::String("https://www.w3.org/ns/did/v1".to_string())),
            id: id.into(),
            controller: None,
            also_known_as: Vec::new(),
            verification_method: Vec::new(),
            authentication: Vec::new(),
            assertion_method: Vec::new(),
            key_agreement: Vec::new(),
            capability_invocation: Vec::new(),
            capability_delegation: Vec::new(),
            service: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Structural well-formedness
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Like `is_valid`, but says what is wrong
    pub fn validate(&self) -> Result<(), DocumentError> {
        if !is_did(&self.id) {
            return Err(DocumentError::InvalidDid(self.id.clone()));
        }

        match &self.controller {
            None => {}
            Some(Value::String(did)) if is_did(did) => {}
            Some(Value::Array(dids))
                if dids
                    .iter()
                    .all(|d| d.as_str().map(is_did).unwrap_or(false)) => {}
            Some(other) => return Err(DocumentError::InvalidController(other.to_string())),
        }

        for method in &self.verification_method {
            validate_method(method)?;
        }

        let relationships = self
            .authentication
            .iter()
            .chain(&self.assertion_method)
            .chain(&self.key_agreement)
            .chain(&self.capability_invocation)
            .chain(&self.capability_delegation);
        for relationship in relationships {
            match relationship {
                VerificationRelationship::Reference(id) if is_did_url(id) => {}
                VerificationRelationship::Reference(id) => {
                    return Err(DocumentError::InvalidVerificationMethod {
                        id: id.clone(),
                        reason: "reference is not a DID URL".to_string(),
                    })
                }
                VerificationRelationship::Embedded(method) => validate_method(method)?,
            }
        }

        for service in &self.service {
            let reason = if !is_did_url(&service.id) && !is_uri(&service.id) {
                Some("id is not a URI")
            } else if service.service_type.is_empty() {
                Some("missing type")
            } else if !is_endpoint(&service.service_endpoint) {
                Some("endpoint must be a URI, a map, or a list of them")
            } else {
                None
            };

            if let Some(reason) = reason {
                return Err(DocumentError::InvalidService {
                    id: service.id.clone(),
                    reason: reason.to_string(),
                });
            }
        }

        Ok(())
    }
}

fn validate_method(method: &VerificationMethod) -> Result<(), DocumentError> {
    let reason = if !is_did_url(&method.id) {
        Some("id is not a DID URL")
    } else if method.method_type.is_empty() {
        Some("missing type")
    } else if !is_did(&method.controller) {
        Some("controller is not a DID")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(DocumentError::InvalidVerificationMethod {
            id: method.id.clone(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// `did:<method>:<method-specific-id>`
pub fn is_did(s: &str) -> bool {
    let Some(rest) = s.strip_prefix("did:") else {
        return false;
    };
    let Some((method, id)) = rest.split_once(':') else {
        return false;
    };

    !method.is_empty()
        && method
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && !id.is_empty()
        && !id.contains(|c: char| c.is_whitespace() || matches!(c, '/' | '?' | '#'))
}

/// A DID with optional path/query/fragment, or a relative `#fragment`
fn is_did_url(s: &str) -> bool {
    if let Some(fragment) = s.strip_prefix('#') {
        return !fragment.is_empty();
    }
    let end = s.find(['/', '?', '#']).unwrap_or(s.len());
    is_did(&s[..end])
}

fn is_uri(s: &str) -> bool {
    match s.split_once(':') {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                && !rest.is_empty()
        }
        None => false,
    }
}

fn is_endpoint(endpoint: &Value) -> bool {
    match endpoint {
        Value::String(uri) => is_uri(uri),
        Value::Object(_) => true,
        Value::Array(items) => {
            !items.is_empty()
                && items
                    .iter()
                    .all(|item| {
                        matches!(item, Value::Object(_))
                            || item.as_str().map(is_uri).unwrap_or(false)
                    })
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_doc() -> Value {
        json!({
            "@context": ["https://www.w3.org/ns/did/v1"],
            "id": "did:ipns:example.com",
            "controller": "did:ipns:example.com",
            "verificationMethod": [{
                "id": "did:ipns:example.com#key-1",
                "type": "Ed25519VerificationKey2020",
                "controller": "did:ipns:example.com",
                "publicKeyMultibase": "z6MkhaXgBZDvotDkL5257faiztiGiC2QtKLGpbnnEGta2doK"
            }],
            "authentication": ["#key-1", {
                "id": "did:ipns:example.com#key-2",
                "type": "Ed25519VerificationKey2020",
                "controller": "did:ipns:example.com",
                "publicKeyMultibase": "z6MkhaXgBZDvotDkL5257faiztiGiC2QtKLGpbnnEGta2doK"
            }],
            "service": [{
                "id": "did:ipns:example.com#hub",
                "type": "IdentityHub",
                "serviceEndpoint": {"nodes": ["https://hub.example.com"]}
            }],
            "created": "2024-01-01T00:00:00Z"
        })
    }

    #[test]
    fn test_full_document_is_valid() {
        let doc: DidDocument = serde_json::from_value(full_doc()).unwrap();
        assert!(doc.is_valid(), "{:?}", doc.validate());
        assert_eq!(doc.authentication.len(), 2);
        assert!(matches!(doc.authentication[0], VerificationRelationship::Reference(_)));
        assert!(matches!(doc.authentication[1], VerificationRelationship::Embedded(_)));
    }

    #[test]
    fn test_unknown_members_survive_roundtrip() {
        let doc: DidDocument = serde_json::from_value(full_doc()).unwrap();
        assert_eq!(doc.extra.get("created"), Some(&json!("2024-01-01T00:00:00Z")));
        assert_eq!(serde_json::to_value(&doc).unwrap(), full_doc());
    }

    #[test]
    fn test_minimal_document_is_valid() {
        assert!(DidDocument::new("did:ipns:example.com").is_valid());
    }

    #[test]
    fn test_bad_id() {
        for id in ["", "example.com", "did:ipns", "did::x", "did:IPNS:x", "did:ipns:a b"] {
            let doc = DidDocument::new(id);
            assert!(
                matches!(doc.validate(), Err(DocumentError::InvalidDid(_))),
                "{:?} accepted",
                id
            );
        }
    }

    #[test]
    fn test_bad_controller() {
        let mut doc = DidDocument::new("did:ipns:example.com");
        doc.controller = Some(json!(["did:ipns:example.com", 42]));
        assert!(matches!(doc.validate(), Err(DocumentError::InvalidController(_))));
    }

    #[test]
    fn test_bad_verification_method() {
        let mut doc = DidDocument::new("did:ipns:example.com");
        doc.verification_method.push(VerificationMethod {
            id: "key-1".to_string(),
            method_type: "Ed25519VerificationKey2020".to_string(),
            controller: "did:ipns:example.com".to_string(),
            key: BTreeMap::new(),
        });
        assert!(!doc.is_valid());
    }

    #[test]
    fn test_bad_service_endpoint() {
        let mut doc = DidDocument::new("did:ipns:example.com");
        doc.service.push(Service {
            id: "did:ipns:example.com#hub".to_string(),
            service_type: "Hub".to_string(),
            service_endpoint: json!(7),
        });
        assert!(matches!(doc.validate(), Err(DocumentError::InvalidService { .. })));
    }
}
