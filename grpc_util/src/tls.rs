// Copyright 2022 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt::Write;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};

/// TLS material for a single remote (§3 `RemoteSpec`: `server_cert`, `client_cert`, `client_key`).
#[derive(Default, Clone)]
pub struct Config {
    pub root_ca_certs: Option<Vec<CertificateDer<'static>>>,
    pub mtls: Option<MtlsConfig>,
    pub certificate_check: CertificateCheck,
}

impl Config {
    pub fn new<Buf: AsRef<[u8]>>(
        root_ca_certs: Option<Buf>,
        mtls: Option<(Buf, Buf)>,
    ) -> Result<Self, String> {
        let root_ca_certs = root_ca_certs
            .map(|raw_certs| parse_certs(raw_certs.as_ref()))
            .transpose()?;

        let mtls = mtls
            .map(|buffers| MtlsConfig::from_pem_buffers(buffers.0.as_ref(), buffers.1.as_ref()))
            .transpose()?;

        Ok(Self {
            root_ca_certs,
            mtls,
            certificate_check: CertificateCheck::Enabled,
        })
    }
}

fn parse_certs(raw: &[u8]) -> Result<Vec<CertificateDer<'static>>, String> {
    rustls_pemfile::certs(&mut std::io::Cursor::new(raw))
        .try_fold(vec![], |mut xs, result| {
            xs.push(result?);
            Ok(xs)
        })
        .map_err(|e: std::io::Error| format!("Failed to parse TLS certs data: {e:?}"))
}

impl TryFrom<Config> for ClientConfig {
    type Error = String;

    /// Builds a rustls `ClientConfig` from the spec's cert material, falling back to the
    /// platform's native root store when no explicit `server_cert` was configured.
    fn try_from(config: Config) -> Result<Self, Self::Error> {
        let tls_config = ClientConfig::builder();

        let tls_config = match config.certificate_check {
            CertificateCheck::DangerouslyDisabled => {
                let tls_config = tls_config
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(NoVerifier));
                apply_client_auth(tls_config, config.mtls)?
            }
            CertificateCheck::Enabled => {
                let mut root_cert_store = RootCertStore::empty();
                match config.root_ca_certs {
                    Some(certs) => {
                        for cert in certs {
                            root_cert_store
                                .add(cert)
                                .map_err(|e| format!("failed adding CA cert to store: {e:?}"))?;
                        }
                    }
                    None => {
                        let native = rustls_native_certs::load_native_certs();
                        if !native.errors.is_empty() {
                            let mut msg = String::from(
                                "Could not discover root CA cert files to use TLS with a \
                                 remote. Consider configuring server_cert explicitly. Error(s):\n\n",
                            );
                            for error in &native.errors {
                                writeln!(&mut msg, "{error}\n").expect("write into String");
                            }
                            return Err(msg);
                        }
                        root_cert_store.add_parsable_certificates(native.certs);
                    }
                }
                let tls_config = tls_config.with_root_certificates(root_cert_store);
                apply_client_auth(tls_config, config.mtls)?
            }
        };

        Ok(tls_config)
    }
}

fn apply_client_auth(
    builder: rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>,
    mtls: Option<MtlsConfig>,
) -> Result<ClientConfig, String> {
    if let Some(MtlsConfig { cert_chain, key }) = mtls {
        let key = key.clone_key();
        builder
            .with_client_auth_cert(cert_chain, key)
            .map_err(|err| format!("Error setting client authentication configuration: {err:?}"))
    } else {
        Ok(builder.with_no_client_auth())
    }
}

#[derive(Clone)]
pub struct MtlsConfig {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: Arc<PrivateKeyDer<'static>>,
}

impl MtlsConfig {
    pub fn from_pem_buffers(certs: &[u8], key: &[u8]) -> Result<Self, String> {
        let cert_chain = parse_certs(certs)
            .map_err(|e| format!("Failed to parse client authentication (mTLS) certs: {e}"))?;

        let key = rustls_pemfile::private_key(&mut std::io::Cursor::new(key))
            .map_err(|e| format!("Failed to parse client authentication (mTLS) key data: {e:?}"))?
            .ok_or_else(|| {
                "No private key found in client authentication (mTLS) key data".to_owned()
            })?;

        Ok(Self {
            cert_chain,
            key: Arc::new(key),
        })
    }
}

#[derive(Clone, Default)]
pub enum CertificateCheck {
    #[default]
    Enabled,
    DangerouslyDisabled,
}

#[derive(Debug)]
pub(crate) struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_certificate_check_is_enabled() {
        let config = Config::default();
        assert!(matches!(config.certificate_check, CertificateCheck::Enabled));
    }

    #[test]
    fn new_without_any_material_has_no_certs() {
        let config = Config::new::<&[u8]>(None, None).unwrap();
        assert!(config.root_ca_certs.is_none());
        assert!(config.mtls.is_none());
    }
}
