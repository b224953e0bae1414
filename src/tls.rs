use anyhow::{Context, Result, anyhow};
use rustls_pemfile::{certs, private_key};
use std::{fs::File, io::BufReader, sync::Arc};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        ServerConfig,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
};

use crate::config::TlsConfig;

/// Builds the acceptor used to terminate TLS on the inbound listener.
pub fn build_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_chain = read_cert_chain(&tls_config.cert_file)?;
    let key = read_private_key(&tls_config.key_file)?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("Certificate and private key do not form a usable TLS identity")?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn read_cert_chain(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open certificate file: {path}"))?;
    let chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {path}"))?;
    if chain.is_empty() {
        return Err(anyhow!("No certificates found in {path}"));
    }
    Ok(chain)
}

fn read_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open private key file: {path}"))?;
    private_key(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key in {path}"))?
        .ok_or_else(|| anyhow!("No private key found in {path}"))
}
