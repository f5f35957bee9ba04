//! Certificate authority rotation collaborators.
//!
//! [`CaGenerator`] produces fresh root and issuer material; [`SecretBackend`]
//! persists it where the mesh CA reloads it from. The watchdog only decides
//! when to rotate, so the shipped generator builds plain ECDSA P-256 CAs.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{Result, WatchdogError};

/// Trust bundle key holding the root certificate.
pub const ROOT_CERT_KEY: &str = "ca.crt";
/// Trust bundle key holding the issuer certificate.
pub const ISSUER_CERT_KEY: &str = "issuer.crt";
/// Trust bundle key holding the issuer private key.
pub const ISSUER_KEY_KEY: &str = "issuer.key";

/// Freshly generated CA material, all PEM encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct RotatedCredentials {
    pub root_key_pem: Vec<u8>,
    pub root_cert_pem: Vec<u8>,
    pub issuer_cert_pem: Vec<u8>,
    pub issuer_key_pem: Vec<u8>,
}

// Keys stay out of logs.
impl fmt::Debug for RotatedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotatedCredentials")
            .field("root_cert_pem_len", &self.root_cert_pem.len())
            .field("issuer_cert_pem_len", &self.issuer_cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// Generates a self-signed root and an issuer certificate signed by it.
pub trait CaGenerator: Send + Sync {
    /// Validity is `[now - clock_skew, now + lifetime)`.
    fn generate_ca(&self, lifetime: Duration, clock_skew: Duration) -> Result<RotatedCredentials>;
}

/// Durable storage for rotated credentials.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn store(&self, credentials: &RotatedCredentials) -> Result<()>;
}

/// ECDSA P-256 CA generator stamping the self-managed issuer organization.
#[derive(Debug, Clone)]
pub struct SelfSignedCa {
    organization: String,
}

impl SelfSignedCa {
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
        }
    }

    fn ca_params(
        &self,
        common_name: &str,
        constraints: BasicConstraints,
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> CertificateParams {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, self.organization.as_str());
        dn.push(DnType::CommonName, common_name);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(constraints);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.not_before = not_before;
        params.not_after = not_after;
        params
    }
}

fn to_time_duration(value: Duration, what: &str) -> Result<time::Duration> {
    time::Duration::try_from(value)
        .map_err(|e| WatchdogError::CertificateGeneration(format!("invalid {what}: {e}")))
}

fn generation_error(e: &rcgen::Error) -> WatchdogError {
    WatchdogError::CertificateGeneration(e.to_string())
}

impl CaGenerator for SelfSignedCa {
    fn generate_ca(&self, lifetime: Duration, clock_skew: Duration) -> Result<RotatedCredentials> {
        let now = OffsetDateTime::now_utc();
        let not_before = now - to_time_duration(clock_skew, "clock skew")?;
        let not_after = now + to_time_duration(lifetime, "lifetime")?;

        let root_key =
            KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| generation_error(&e))?;
        let root_cert: Certificate = self
            .ca_params("cluster.local", BasicConstraints::Unconstrained, not_before, not_after)
            .self_signed(&root_key)
            .map_err(|e| generation_error(&e))?;

        let issuer_key =
            KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| generation_error(&e))?;
        let issuer_cert = self
            .ca_params("cluster.local", BasicConstraints::Constrained(0), not_before, not_after)
            .signed_by(&issuer_key, &root_cert, &root_key)
            .map_err(|e| generation_error(&e))?;

        debug!(organization = %self.organization, "Generated root and issuer certificates");

        Ok(RotatedCredentials {
            root_key_pem: root_key.serialize_pem().into_bytes(),
            root_cert_pem: root_cert.pem().into_bytes(),
            issuer_cert_pem: issuer_cert.pem().into_bytes(),
            issuer_key_pem: issuer_key.serialize_pem().into_bytes(),
        })
    }
}

/// Build the trust bundle data map written to the secret.
pub fn trust_bundle_data(credentials: &RotatedCredentials) -> BTreeMap<String, ByteString> {
    BTreeMap::from([
        (
            ROOT_CERT_KEY.to_string(),
            ByteString(credentials.root_cert_pem.clone()),
        ),
        (
            ISSUER_CERT_KEY.to_string(),
            ByteString(credentials.issuer_cert_pem.clone()),
        ),
        (
            ISSUER_KEY_KEY.to_string(),
            ByteString(credentials.issuer_key_pem.clone()),
        ),
    ])
}

/// Writes rotated credentials into the mesh trust bundle `Secret`.
pub struct TrustBundleSecret {
    secrets: Api<Secret>,
    namespace: String,
    name: String,
}

impl TrustBundleSecret {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            secrets: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn resource(&self) -> String {
        format!("secret {}/{}", self.namespace, self.name)
    }
}

#[async_trait]
impl SecretBackend for TrustBundleSecret {
    async fn store(&self, credentials: &RotatedCredentials) -> Result<()> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            data: Some(trust_bundle_data(credentials)),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        let persist_error =
            |e: WatchdogError| WatchdogError::SecretPersistence(format!("{}: {e}", self.resource()));

        match self.secrets.get_opt(&self.name).await {
            Ok(Some(_)) => {
                self.secrets
                    .replace(&self.name, &PostParams::default(), &secret)
                    .await
                    .map_err(|e| {
                        persist_error(WatchdogError::from_kube("replace secret", &self.resource(), e))
                    })?;
                info!(secret = %self.resource(), "Updated trust bundle");
            }
            Ok(None) => {
                self.secrets
                    .create(&PostParams::default(), &secret)
                    .await
                    .map_err(|e| {
                        persist_error(WatchdogError::from_kube("create secret", &self.resource(), e))
                    })?;
                info!(secret = %self.resource(), "Created trust bundle");
            }
            Err(e) => {
                return Err(persist_error(WatchdogError::from_kube(
                    "get secret",
                    &self.resource(),
                    e,
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_ca_produces_pem_material() {
        let ca = SelfSignedCa::new("dapr.io/sentry");
        let creds = ca
            .generate_ca(Duration::from_secs(56 * 3600), Duration::from_secs(900))
            .unwrap();

        let root = String::from_utf8(creds.root_cert_pem.clone()).unwrap();
        let issuer = String::from_utf8(creds.issuer_cert_pem.clone()).unwrap();
        let key = String::from_utf8(creds.issuer_key_pem.clone()).unwrap();
        assert!(root.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(issuer.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(key.contains("PRIVATE KEY-----"));
        assert_ne!(creds.root_cert_pem, creds.issuer_cert_pem);
        assert_ne!(creds.root_key_pem, creds.issuer_key_pem);
    }

    #[test]
    fn test_each_rotation_uses_new_keys() {
        let ca = SelfSignedCa::new("dapr.io/sentry");
        let first = ca.generate_ca(Duration::from_secs(3600), Duration::ZERO).unwrap();
        let second = ca.generate_ca(Duration::from_secs(3600), Duration::ZERO).unwrap();
        assert_ne!(first.issuer_key_pem, second.issuer_key_pem);
    }

    #[test]
    fn test_trust_bundle_layout() {
        let creds = RotatedCredentials {
            root_key_pem: b"root-key".to_vec(),
            root_cert_pem: b"root".to_vec(),
            issuer_cert_pem: b"issuer".to_vec(),
            issuer_key_pem: b"issuer-key".to_vec(),
        };
        let data = trust_bundle_data(&creds);
        assert_eq!(data.len(), 3);
        assert_eq!(data[ROOT_CERT_KEY].0, b"root");
        assert_eq!(data[ISSUER_CERT_KEY].0, b"issuer");
        assert_eq!(data[ISSUER_KEY_KEY].0, b"issuer-key");
    }

    #[test]
    fn test_debug_hides_key_material() {
        let creds = RotatedCredentials {
            root_key_pem: b"SECRET-ROOT".to_vec(),
            root_cert_pem: Vec::new(),
            issuer_cert_pem: Vec::new(),
            issuer_key_pem: b"SECRET-ISSUER".to_vec(),
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("SECRET"));
    }
}
