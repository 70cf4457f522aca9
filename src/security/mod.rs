//! Certificate provisioning for the control plane
//!
//! A local certificate authority issues TLS material for this process and for
//! services listed in the mesh configuration. Entries with a secret name are
//! maintained inside cluster Secrets by a rotation loop; the control plane's
//! own pair is written to the key-cert directory at startup.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::Api;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::{info, warn};
use x509_parser::prelude::*;

use crate::lifecycle::ShutdownSignal;
use crate::{Error, Result};

/// Fraction of a certificate's lifetime treated as the rotation grace period.
pub const CERT_GRACE_PERIOD_RATIO: f64 = 0.5;

/// Floor on the rotation grace period.
pub const MIN_CERT_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// How often maintained secrets are re-examined.
pub const ROTATION_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// A freshly issued certificate and its key.
pub struct IssuedCert {
    cert_chain_pem: String,
    key_pem: String,
}

impl IssuedCert {
    /// The certificate chain in PEM format.
    pub fn cert_chain_pem(&self) -> &str {
        &self.cert_chain_pem
    }

    /// The private key in PEM format.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }
}

/// Certificate authority issuing the mesh's TLS material.
pub struct CertificateAuthority {
    // CA key pair serialized as PEM; KeyPair isn't Clone, so it is
    // deserialized on each signing operation.
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA.
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Trellis".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        // 10 year validity
        params.not_before = rcgen::date_time_ymd(2025, 1, 1);
        params.not_after = rcgen::date_time_ymd(2035, 1, 1);

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::pki(format!("failed to generate CA key: {e}")))?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::pki(format!("failed to create CA cert: {e}")))?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from PEM material.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| Error::pki(format!("failed to parse CA key: {e}")))?;
        let _ = ::pem::parse(cert_pem.as_bytes())
            .map_err(|e| Error::pki(format!("failed to parse CA cert: {e}")))?;
        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// The CA certificate in PEM format (the mesh root of trust).
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Issue a serving certificate for the given DNS names, generating a
    /// fresh key pair.
    pub fn issue_server_cert(&self, dns_names: &[String]) -> Result<IssuedCert> {
        if dns_names.is_empty() {
            return Err(Error::pki("certificate entry without DNS names"));
        }

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::pki(format!("failed to generate key: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(dns_names[0].clone()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Trellis".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];

        // 1 year validity
        params.not_before = rcgen::date_time_ymd(2025, 1, 1);
        params.not_after = rcgen::date_time_ymd(2026, 1, 1);

        params.subject_alt_names = dns_names
            .iter()
            .map(|name| {
                Ia5String::try_from(name.as_str())
                    .map(SanType::DnsName)
                    .map_err(|e| Error::pki(format!("invalid DNS name {name:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| Error::pki(format!("failed to load CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, ca_key)
            .map_err(|e| Error::pki(format!("failed to create issuer: {e}")))?;
        let cert = params
            .signed_by(&key_pair, &issuer)
            .map_err(|e| Error::pki(format!("failed to sign certificate: {e}")))?;

        Ok(IssuedCert {
            cert_chain_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// Parse the validity window out of a PEM certificate.
pub fn cert_validity(cert_pem: &str) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let der = ::pem::parse(cert_pem.as_bytes())
        .map_err(|e| Error::pki(format!("failed to parse PEM: {e}")))?;
    let (_, cert) = X509Certificate::from_der(der.contents())
        .map_err(|e| Error::pki(format!("failed to parse certificate: {e}")))?;
    let validity = cert.validity();
    let not_before = Utc
        .timestamp_opt(validity.not_before.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::pki("certificate notBefore out of range"))?;
    let not_after = Utc
        .timestamp_opt(validity.not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::pki("certificate notAfter out of range"))?;
    Ok((not_before, not_after))
}

/// Whether a certificate is inside its rotation grace window at `now`.
///
/// The grace period is `lifetime * ratio`, floored at `min_grace`. Unparseable
/// certificates always rotate.
pub fn needs_rotation(cert_pem: &str, now: DateTime<Utc>, ratio: f64, min_grace: Duration) -> bool {
    let Ok((not_before, not_after)) = cert_validity(cert_pem) else {
        return true;
    };
    let lifetime = (not_after - not_before).to_std().unwrap_or_default();
    let grace = lifetime.mul_f64(ratio).max(min_grace);
    let grace = chrono::Duration::from_std(grace).unwrap_or(chrono::Duration::zero());
    now + grace >= not_after
}

/// Write the well-known key/cert trio into `dir`, creating it if missing.
/// Certificates are world-readable, the key is owner-only.
pub fn write_key_cert_dir(dir: &Path, issued: &IssuedCert, ca_cert_pem: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let write = |name: &str, content: &str, mode: u32| -> Result<()> {
        let path = dir.join(name);
        std::fs::write(&path, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
        Ok(())
    };

    write(crate::CERT_CHAIN_FILENAME, issued.cert_chain_pem(), 0o644)?;
    write(crate::ROOT_CERT_FILENAME, ca_cert_pem, 0o644)?;
    write(crate::KEY_FILENAME, issued.key_pem(), 0o600)?;
    info!(dir = %dir.display(), "wrote control-plane key and certificate");
    Ok(())
}

/// One Secret maintained by the rotation loop.
#[derive(Debug, Clone)]
pub struct RotationEntry {
    /// Secret name.
    pub secret_name: String,
    /// Secret namespace.
    pub namespace: String,
    /// DNS names in the certificate.
    pub dns_names: Vec<String>,
}

/// Maintains TLS Secrets for listed services, rotating inside the grace
/// window.
pub struct CertController {
    ca: Arc<CertificateAuthority>,
    client: kube::Client,
    entries: Vec<RotationEntry>,
    grace_ratio: f64,
    min_grace: Duration,
    interval: Duration,
}

impl CertController {
    /// Create a controller over the given entries.
    pub fn new(ca: Arc<CertificateAuthority>, client: kube::Client, entries: Vec<RotationEntry>) -> Self {
        Self {
            ca,
            client,
            entries,
            grace_ratio: CERT_GRACE_PERIOD_RATIO,
            min_grace: MIN_CERT_GRACE_PERIOD,
            interval: ROTATION_CHECK_INTERVAL,
        }
    }

    /// Number of maintained entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    async fn reconcile_entry(&self, entry: &RotationEntry) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &entry.namespace);

        let rotate = match api.get_opt(&entry.secret_name).await? {
            None => true,
            Some(secret) => {
                let current = secret
                    .data
                    .as_ref()
                    .and_then(|d| d.get("tls.crt"))
                    .map(|bytes| String::from_utf8_lossy(&bytes.0).to_string());
                match current {
                    Some(pem) => needs_rotation(&pem, Utc::now(), self.grace_ratio, self.min_grace),
                    None => true,
                }
            }
        };
        if !rotate {
            return Ok(());
        }

        info!(secret = %entry.secret_name, namespace = %entry.namespace, "rotating certificate secret");
        let issued = self.ca.issue_server_cert(&entry.dns_names)?;
        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": entry.secret_name, "namespace": entry.namespace },
            "type": "kubernetes.io/tls",
            "stringData": {
                "tls.crt": issued.cert_chain_pem(),
                "tls.key": issued.key_pem(),
                "ca.crt": self.ca.ca_cert_pem(),
            },
        });
        api.patch(
            &entry.secret_name,
            &PatchParams::apply("trellis-cert-controller").force(),
            &Patch::Apply(&manifest),
        )
        .await?;
        Ok(())
    }

    /// One pass over all entries.
    pub async fn reconcile_once(&self) {
        for entry in &self.entries {
            if let Err(e) = self.reconcile_entry(entry).await {
                warn!(secret = %entry.secret_name, error = %e, "certificate reconciliation failed");
            }
        }
    }

    /// Drive the rotation loop until shutdown. Does nothing when no entries
    /// are listed.
    pub async fn run(&self, mut stop: ShutdownSignal) {
        if self.entries.is_empty() {
            stop.recv().await;
            return;
        }
        loop {
            self.reconcile_once().await;
            tokio::select! {
                _ = stop.recv() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("certificate controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_issues_verifiable_server_certs() {
        let ca = CertificateAuthority::new("trellis-ca").unwrap();
        let issued = ca
            .issue_server_cert(&["discovery.trellis-system.svc".to_string()])
            .unwrap();

        assert!(issued.cert_chain_pem().contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem().contains("PRIVATE KEY"));

        let (not_before, not_after) = cert_validity(issued.cert_chain_pem()).unwrap();
        assert!(not_after > not_before);
    }

    #[test]
    fn issuing_without_names_fails() {
        let ca = CertificateAuthority::new("trellis-ca").unwrap();
        assert!(ca.issue_server_cert(&[]).is_err());
    }

    #[test]
    fn ca_roundtrips_through_pem() {
        let ca = CertificateAuthority::new("trellis-ca").unwrap();
        let reloaded =
            CertificateAuthority::from_pem(ca.ca_cert_pem(), &ca.ca_key_pem.clone()).unwrap();
        reloaded
            .issue_server_cert(&["svc.local".to_string()])
            .unwrap();
    }

    #[test]
    fn rotation_grace_window() {
        let ca = CertificateAuthority::new("trellis-ca").unwrap();
        let issued = ca.issue_server_cert(&["svc.local".to_string()]).unwrap();
        let (not_before, not_after) = cert_validity(issued.cert_chain_pem()).unwrap();

        // Well before the window: no rotation.
        assert!(!needs_rotation(
            issued.cert_chain_pem(),
            not_before,
            CERT_GRACE_PERIOD_RATIO,
            MIN_CERT_GRACE_PERIOD
        ));
        // Past expiry: rotate.
        assert!(needs_rotation(
            issued.cert_chain_pem(),
            not_after,
            CERT_GRACE_PERIOD_RATIO,
            MIN_CERT_GRACE_PERIOD
        ));
        // Halfway through the lifetime sits exactly on a 0.5 ratio window.
        let midpoint = not_before + (not_after - not_before) / 2;
        assert!(needs_rotation(
            issued.cert_chain_pem(),
            midpoint,
            CERT_GRACE_PERIOD_RATIO,
            MIN_CERT_GRACE_PERIOD
        ));
        // Garbage rotates.
        assert!(needs_rotation(
            "not a cert",
            not_before,
            CERT_GRACE_PERIOD_RATIO,
            MIN_CERT_GRACE_PERIOD
        ));
    }

    #[test]
    #[cfg(unix)]
    fn key_cert_dir_has_expected_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("key-cert");
        let ca = CertificateAuthority::new("trellis-ca").unwrap();
        let issued = ca.issue_server_cert(&["svc.local".to_string()]).unwrap();

        write_key_cert_dir(&out, &issued, ca.ca_cert_pem()).unwrap();

        let mode = |name: &str| {
            std::fs::metadata(out.join(name))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };
        assert_eq!(mode(crate::CERT_CHAIN_FILENAME), 0o644);
        assert_eq!(mode(crate::ROOT_CERT_FILENAME), 0o644);
        assert_eq!(mode(crate::KEY_FILENAME), 0o600);
    }
}
