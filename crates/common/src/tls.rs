use std::{
    env,
    fs,
    path::Path,
};

use anyhow::Context;
use rustls::{
    ClientConfig,
    RootCertStore,
};
use rustls_pki_types::{
    pem::PemObject,
    CertificateDer,
};
use tokio_postgres_rustls::MakeRustlsConnect;

/// Builds the TLS connector used for every database connection: native
/// roots, plus an optional extra CA bundle from `PG_CA_FILE`.
pub fn tls_connect() -> anyhow::Result<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    anyhow::ensure!(
        native_certs.errors.is_empty(),
        "failed to load native certs: {:?}",
        native_certs.errors
    );
    for cert in native_certs.certs {
        roots.add(cert)?;
    }
    if let Some(ca_file_path) = env::var_os("PG_CA_FILE") {
        if !ca_file_path.is_empty() {
            let ca_file_path = Path::new(&ca_file_path);
            let ca_file_content = fs::read(ca_file_path)
                .with_context(|| format!("Failed to read CA file: {}", ca_file_path.display()))?;
            for ca_cert in CertificateDer::pem_slice_iter(&ca_file_content) {
                roots.add(ca_cert.with_context(|| {
                    format!("Failed to parse CA file as PEM: {}", ca_file_path.display())
                })?)?;
            }
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}
