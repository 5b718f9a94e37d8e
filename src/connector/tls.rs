//! Loading of client identity and trust anchors for `amqps` connections.
//!
//! Problems with the configured stores never fail the endpoint: they are
//! logged and the connection proceeds with the default TLS context (system
//! roots, no client certificate).

use std::fs;

use tracing::{debug, warn};

use crate::config::{StoreSettings, TlsSettings};
use crate::utils::error::{InboundError, Result};

pub const KEYSTORE_TYPE_PKCS12: &str = "PKCS12";
pub const TRUSTSTORE_TYPE_PEM: &str = "PEM";

const SUPPORTED_VERSIONS: &[&str] = &["TLS", "TLSv1.2", "TLSv1.3"];

/// How an endpoint secures its connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsMode {
    Disabled,
    /// TLS with the backend's default configuration.
    SystemDefault,
    Custom(TlsMaterial),
}

impl TlsMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, TlsMode::Disabled)
    }
}

/// Client identity plus the certificates to trust.
#[derive(Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    /// PKCS#12 archive holding the client certificate and key.
    pub identity_der: Vec<u8>,
    pub identity_password: String,
    /// PEM encoded CA certificates.
    pub cert_chain: String,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("identity_der", &format_args!("{} bytes", self.identity_der.len()))
            .field("cert_chain", &format_args!("{} bytes", self.cert_chain.len()))
            .finish()
    }
}

pub fn resolve(tls: &TlsSettings, name: &str) -> TlsMode {
    if !tls.enabled {
        return TlsMode::Disabled;
    }
    match load(tls) {
        Ok(material) => {
            debug!(inbound = %name, "Loaded keystore and truststore for TLS connection");
            TlsMode::Custom(material)
        }
        Err(e) => {
            warn!(
                inbound = %name,
                error = %e,
                "Truststore and keystore information is not usable, proceeding with default TLS configuration"
            );
            TlsMode::SystemDefault
        }
    }
}

fn load(tls: &TlsSettings) -> Result<TlsMaterial> {
    let (Some(keystore), Some(truststore)) = (&tls.keystore, &tls.truststore) else {
        return Err(InboundError::configuration(
            "keystore and truststore location, type and password are all required",
        ));
    };

    if let Some(version) = &tls.version {
        if !SUPPORTED_VERSIONS
            .iter()
            .any(|v| v.eq_ignore_ascii_case(version))
        {
            return Err(InboundError::configuration(format!(
                "unsupported TLS protocol version '{version}'"
            )));
        }
    }

    expect_kind(keystore, KEYSTORE_TYPE_PKCS12)?;
    expect_kind(truststore, TRUSTSTORE_TYPE_PEM)?;

    let identity_der = fs::read(&keystore.path).map_err(|e| {
        InboundError::configuration(format!(
            "cannot read keystore {}: {e}",
            keystore.path.display()
        ))
    })?;
    let cert_chain = fs::read_to_string(&truststore.path).map_err(|e| {
        InboundError::configuration(format!(
            "cannot read truststore {}: {e}",
            truststore.path.display()
        ))
    })?;
    if !cert_chain.contains("-----BEGIN CERTIFICATE-----") {
        return Err(InboundError::configuration(format!(
            "truststore {} holds no PEM certificate",
            truststore.path.display()
        )));
    }

    Ok(TlsMaterial {
        identity_der,
        identity_password: keystore.password.clone(),
        cert_chain,
    })
}

fn expect_kind(store: &StoreSettings, expected: &str) -> Result<()> {
    if store.kind.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(InboundError::configuration(format!(
            "store {} has unsupported type '{}', expected {expected}",
            store.path.display(),
            store.kind
        )))
    }
}
