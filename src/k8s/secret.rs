//! TLS secrets for ingress tests
//!
//! Certificates are short-lived: a self-signed ECDSA P-256 CA that lives five
//! minutes and a serving certificate for the requested hosts signed by it. The
//! CA goes into the caller's [`TrustStore`], the serving pair into a
//! `kubernetes.io/tls` Secret.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use rand::Rng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::CertificateDer;
use time::OffsetDateTime;
use tracing::info;

use super::client::{ResourceKind, ResourceRef};
use crate::context::{Cleanup, TestContext};
use crate::error::{ConformanceError, Result};
use crate::http::TrustStore;

pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

const ORGANIZATION: &str = "Knative Ingress Conformance Testing";
const VALIDITY: time::Duration = time::Duration::minutes(5);

/// PEM material for one TLS secret
#[derive(Clone, Debug)]
pub struct TlsCertificate {
    /// Serving certificate followed by the CA that signed it
    pub chain_pem: String,
    /// PKCS#8 private key of the serving certificate
    pub key_pem: String,
    /// CA certificate to trust
    pub ca_der: CertificateDer<'static>,
}

fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    // Keep the DER integer positive.
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

fn base_params(hosts: Vec<String>) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(hosts)?;

    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, ORGANIZATION);
    params.distinguished_name = name;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + VALIDITY;
    params.serial_number = Some(random_serial());

    Ok(params)
}

/// Generate a CA and a serving certificate for `hosts`
pub fn generate_certificate(hosts: &[String]) -> Result<TlsCertificate> {
    if hosts.is_empty() {
        return Err(ConformanceError::Certificate(
            "at least one host is required".to_string(),
        ));
    }

    let ca_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let mut ca_params = base_params(hosts.to_vec())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];
    ca_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let ca = ca_params.self_signed(&ca_key)?;

    let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let mut params = base_params(hosts.to_vec())?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    let serving = params.signed_by(&key, &ca, &ca_key)?;

    Ok(TlsCertificate {
        chain_pem: format!("{}{}", serving.pem(), ca.pem()),
        key_pem: key.serialize_pem(),
        ca_der: ca.der().clone(),
    })
}

/// Secret object carrying `certificate`
pub fn tls_secret(name: &str, namespace: &str, certificate: &TlsCertificate) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([("test-secret".to_string(), name.to_string())])),
            ..Default::default()
        },
        type_: Some(TLS_SECRET_TYPE.to_string()),
        string_data: Some(BTreeMap::from([
            (TLS_CERT_KEY.to_string(), certificate.chain_pem.clone()),
            (TLS_PRIVATE_KEY_KEY.to_string(), certificate.key_pem.clone()),
        ])),
        ..Default::default()
    }
}

/// Create a TLS secret for `hosts` in the serving namespace, trusted by the
/// context's trust store
pub async fn create_tls_secret(ctx: &TestContext, hosts: &[String]) -> Result<(String, Cleanup)> {
    let namespace = ctx.config().namespace.clone();
    create_tls_secret_with_trust_store(ctx, hosts, &namespace, ctx.trust_store()).await
}

/// Create a TLS secret for `hosts` in `namespace`, adding its CA to `store`
///
/// The returned cleanup deletes the secret and removes the CA again.
pub async fn create_tls_secret_with_trust_store(
    ctx: &TestContext,
    hosts: &[String],
    namespace: &str,
    store: &TrustStore,
) -> Result<(String, Cleanup)> {
    let certificate = generate_certificate(hosts)?;
    let name = ctx.object_name();

    let cleanup = Cleanup::new()
        .delete(ResourceRef::new(ResourceKind::Secret, namespace, &name))
        .untrust(store.clone(), certificate.ca_der.clone());
    ctx.register(&cleanup);

    store.add(certificate.ca_der.clone());

    let secrets: Api<Secret> = ctx.client().namespaced_api(namespace);
    secrets
        .create(&PostParams::default(), &tls_secret(&name, namespace, &certificate))
        .await?;

    info!(namespace = %namespace, name = %name, hosts = ?hosts, "Created TLS secret");
    Ok((name, cleanup))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::fake::{deleted, FakeApiServer, CORE};
    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;

    fn hosts() -> Vec<String> {
        vec!["foo.example.com".to_string(), "bar.example.com".to_string()]
    }

    #[test]
    fn test_certificate_chain_shape() {
        let certificate = generate_certificate(&hosts()).unwrap();

        let blocks = pem::parse_many(&certificate.chain_pem).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.tag() == "CERTIFICATE"));
        assert_eq!(blocks[1].contents(), certificate.ca_der.as_ref());

        let key = pem::parse(&certificate.key_pem).unwrap();
        assert_eq!(key.tag(), "PRIVATE KEY");
    }

    #[test]
    fn test_serving_certificate() {
        let certificate = generate_certificate(&hosts()).unwrap();
        let blocks = pem::parse_many(&certificate.chain_pem).unwrap();
        let (_, cert) = parse_x509_certificate(blocks[0].contents()).unwrap();

        assert!(!cert.is_ca());
        let org = cert.subject().iter_organization().next().unwrap();
        assert_eq!(org.as_str().unwrap(), ORGANIZATION);

        let san = cert.subject_alternative_name().unwrap().unwrap();
        let names: Vec<_> = san
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::DNSName(name) => Some(name.to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(names, hosts());

        let eku = cert.extended_key_usage().unwrap().unwrap();
        assert!(eku.value.server_auth);

        let validity = cert.validity();
        let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert_eq!(lifetime, 300);
    }

    #[test]
    fn test_ca_certificate() {
        let certificate = generate_certificate(&hosts()).unwrap();
        let (_, ca) = parse_x509_certificate(certificate.ca_der.as_ref()).unwrap();

        assert!(ca.is_ca());
        let usage = ca.key_usage().unwrap().unwrap();
        assert!(usage.value.key_cert_sign());
        assert!(usage.value.digital_signature());
        assert!(usage.value.key_encipherment());

        // 127-bit positive serial
        assert!(ca.tbs_certificate.raw_serial().len() <= 16);
        assert_eq!(ca.tbs_certificate.raw_serial()[0] & 0x80, 0);
    }

    #[test]
    fn test_serials_differ() {
        let a = generate_certificate(&hosts()).unwrap();
        let b = generate_certificate(&hosts()).unwrap();
        assert_ne!(a.ca_der, b.ca_der);
    }

    #[test]
    fn test_no_hosts_is_rejected() {
        assert!(matches!(
            generate_certificate(&[]),
            Err(ConformanceError::Certificate(_))
        ));
    }

    #[test]
    fn test_tls_secret_shape() {
        let certificate = generate_certificate(&hosts()).unwrap();
        let secret = tls_secret("cert-abc", "serving-tests", &certificate);

        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        assert_eq!(
            secret.metadata.labels.unwrap()["test-secret"],
            "cert-abc"
        );
        let data = secret.string_data.unwrap();
        assert_eq!(data[TLS_CERT_KEY], certificate.chain_pem);
        assert_eq!(data[TLS_PRIVATE_KEY_KEY], certificate.key_pem);
    }

    #[tokio::test]
    async fn test_create_tls_secret_trusts_ca_until_cleanup() {
        let server = FakeApiServer::start(|req| match req.method.as_str() {
            "POST" => (201, req.body.clone().unwrap_or_default()),
            _ => deleted("v1", "Secret", req.path.rsplit('/').next().unwrap_or_default()),
        })
        .await;
        let store = TrustStore::new();
        let ctx = server.context("TestIngressTls").with_trust_store(store.clone());

        let (name, cleanup) = create_tls_secret(&ctx, &hosts()).await.unwrap();
        assert!(!store.is_empty());

        let request = &server.requests()[0];
        assert!(request.is("POST", &format!("{CORE}/secrets")));
        let body = request.body.as_ref().unwrap();
        assert_eq!(body["metadata"]["name"], name.as_str());
        assert_eq!(body["type"], TLS_SECRET_TYPE);
        assert!(body["stringData"][TLS_CERT_KEY]
            .as_str()
            .unwrap()
            .contains("BEGIN CERTIFICATE"));

        cleanup.run(&ctx).await.unwrap();
        assert!(store.is_empty());
        assert!(server.requests()[1].is("DELETE", &format!("{CORE}/secrets/{name}")));
        assert_eq!(ctx.pending_cleanups(), 0);
    }
}
