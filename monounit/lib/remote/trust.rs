use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::tls::TlsInfo;
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::{
    management::Rollback,
    runtime::Connector,
    utils::{run_command, HomeLayout},
    MonounitError, MonounitResult,
};

use super::{record::discard_remote, Remote, RemoteConnector, RemoteProtocol};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const CERT_VALIDITY_DAYS: &str = "3650";
const PEM_LINE_WIDTH: usize = 64;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Adds a remote and establishes trust with it.
///
/// For HTTPS endpoints the server certificate is fetched, pinned and its fingerprint returned
/// for out-of-band verification. Private endpoints additionally get the client certificate
/// registered with `password`. Any failure removes the saved record again.
pub async fn add_remote(
    layout: &HomeLayout,
    remote: &Remote,
    password: Option<&str>,
    user: &str,
) -> MonounitResult<Option<String>> {
    if *remote.get_protocol() == RemoteProtocol::Unix {
        remote.save(layout).await?;
        return Ok(None);
    }

    ensure_client_certificate(layout, user).await?;
    let server_cert = probe_server_certificate(remote.get_url()).await?;
    let connector = RemoteConnector::new(layout.clone(), remote.clone());

    register_remote(layout, remote, Some(&server_cert), password, &connector).await
}

/// Saves `remote`, pins `server_cert` and registers the client certificate through
/// `connector` when the endpoint needs it.
///
/// A fresh handle must report the client as trusted afterwards. On failure the record and the
/// pinned certificate are removed before the error is returned.
pub async fn register_remote(
    layout: &HomeLayout,
    remote: &Remote,
    server_cert: Option<&str>,
    password: Option<&str>,
    connector: &dyn Connector,
) -> MonounitResult<Option<String>> {
    remote.save(layout).await?;

    let mut rollback = Rollback::new();
    {
        let layout = layout.clone();
        let name = remote.get_name().clone();
        rollback.push(format!("remove remote {name}"), move || async move {
            discard_remote(&layout, &name).await
        });
    }

    let result = async {
        let fingerprint = match server_cert {
            Some(pem) => {
                fs::create_dir_all(layout.server_certs_dir()).await?;
                fs::write(layout.server_cert(remote.get_name()), pem).await?;
                let fingerprint = certificate_fingerprint(pem)?;
                tracing::info!(
                    "certificate fingerprint of remote {}: {}",
                    remote.get_name(),
                    fingerprint
                );
                Some(fingerprint)
            }
            None => None,
        };

        if remote.needs_registration() {
            register_client(layout, remote, password, connector).await?;
        }

        Ok(fingerprint)
    }
    .await;

    let fingerprint = rollback.guard(result).await?;
    rollback.commit();
    Ok(fingerprint)
}

async fn register_client(
    layout: &HomeLayout,
    remote: &Remote,
    password: Option<&str>,
    connector: &dyn Connector,
) -> MonounitResult<()> {
    let handle = connector.connect().await?;
    if handle.server_info().await?.trusted {
        tracing::debug!("client already trusted by remote {}", remote.get_name());
        return Ok(());
    }

    let password = password.ok_or_else(|| {
        MonounitError::Validation(format!(
            "remote {} requires a trust password",
            remote.get_name()
        ))
    })?;
    let certificate = fs::read_to_string(layout.client_cert()).await?;
    handle.add_certificate(&certificate, password).await?;

    // Trust is only established once a brand new handle sees it.
    let verified = connector.connect().await?.server_info().await?;
    if !verified.trusted {
        return Err(MonounitError::Connectivity(format!(
            "remote {} did not accept the client certificate",
            remote.get_name()
        )));
    }

    tracing::info!("client certificate registered with remote {}", remote.get_name());
    Ok(())
}

/// Generates the client key pair unless both halves already exist.
pub async fn ensure_client_certificate(layout: &HomeLayout, user: &str) -> MonounitResult<()> {
    let key = layout.client_key();
    let cert = layout.client_cert();
    if fs::try_exists(&key).await? && fs::try_exists(&cert).await? {
        return Ok(());
    }

    fs::create_dir_all(layout.certs_dir()).await?;
    tracing::info!("generating client certificate in {}", layout.certs_dir().display());

    let key_arg = key.to_string_lossy().to_string();
    let cert_arg = cert.to_string_lossy().to_string();
    let subject = format!("/CN=monounit-{user}");
    run_command(
        "openssl",
        [
            "req",
            "-x509",
            "-newkey",
            "ec",
            "-pkeyopt",
            "ec_paramgen_curve:secp384r1",
            "-nodes",
            "-days",
            CERT_VALIDITY_DAYS,
            "-subj",
            subject.as_str(),
            "-keyout",
            key_arg.as_str(),
            "-out",
            cert_arg.as_str(),
        ],
    )
    .await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

/// Fetches the certificate an HTTPS endpoint presents, as PEM, without verifying it.
pub async fn probe_server_certificate(url: &str) -> MonounitResult<String> {
    let client = reqwest::Client::builder()
        .use_native_tls()
        .danger_accept_invalid_certs(true)
        .tls_info(true)
        .build()?;

    let response = client
        .get(format!("{}/1.0", url.trim_end_matches('/')))
        .send()
        .await
        .map_err(|e| MonounitError::Connectivity(format!("cannot reach {url}: {e}")))?;

    let der = response
        .extensions()
        .get::<TlsInfo>()
        .and_then(|info| info.peer_certificate())
        .ok_or_else(|| {
            MonounitError::Connectivity(format!("{url} presented no server certificate"))
        })?;

    Ok(der_to_pem(der))
}

/// SHA-256 of a PEM certificate's DER body, as colon separated hex.
pub fn certificate_fingerprint(pem: &str) -> MonounitResult<String> {
    let der = pem_to_der(pem)?;
    let digest = Sha256::digest(&der);
    Ok(digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Wraps DER bytes in a PEM certificate block.
pub fn der_to_pem(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in body.as_bytes().chunks(PEM_LINE_WIDTH) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Extracts the DER bytes of the first block of a PEM document.
pub fn pem_to_der(pem: &str) -> MonounitResult<Vec<u8>> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.starts_with("-----BEGIN"))
        .skip(1)
        .take_while(|line| !line.starts_with("-----END"))
        .collect();

    if body.is_empty() {
        return Err(MonounitError::Validation("not a PEM certificate".into()));
    }

    STANDARD
        .decode(body)
        .map_err(|e| MonounitError::Validation(format!("malformed PEM certificate: {e}")))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::{remote::list_remotes, runtime::MemoryServer};

    const FAKE_CLIENT_CERT: &str = "-----BEGIN CERTIFICATE-----\nY2xpZW50\n-----END CERTIFICATE-----\n";

    fn lab() -> Remote {
        Remote::builder()
            .name("lab")
            .url("https://10.1.2.3:8443")
            .protocol(RemoteProtocol::Https)
            .build()
    }

    async fn layout_with_client_cert(root: &std::path::Path) -> anyhow::Result<HomeLayout> {
        let layout = HomeLayout::new(root);
        layout.ensure().await?;
        fs::write(layout.client_cert(), FAKE_CLIENT_CERT).await?;
        Ok(layout)
    }

    #[test]
    fn test_fingerprint_of_der_body() -> anyhow::Result<()> {
        let pem = der_to_pem(b"hello");
        assert_eq!(pem_to_der(&pem)?, b"hello");
        assert_eq!(
            certificate_fingerprint(&pem)?,
            "2c:f2:4d:ba:5f:b0:a3:0e:26:e8:3b:2a:c5:b9:e2:9e:1b:16:1e:5c:1f:a7:42:5e:73:04:33:62:93:8b:98:24"
        );
        assert!(pem_to_der("garbage").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_registration_with_trust_password() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let layout = layout_with_client_cert(dir.path()).await?;

        let server = MemoryServer::new();
        server.set_trusted(false);
        server.set_trust_password("s3cret");

        let pem = der_to_pem(b"server");
        let fingerprint =
            register_remote(&layout, &lab(), Some(&pem), Some("s3cret"), &server).await?;

        assert!(fingerprint.is_some());
        assert_eq!(server.certificates(), vec![FAKE_CLIENT_CERT.to_string()]);
        assert_eq!(fs::read_to_string(layout.server_cert("lab")).await?, pem);
        assert_eq!(list_remotes(&layout).await?, vec!["lab"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_registration_removes_record() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let layout = layout_with_client_cert(dir.path()).await?;

        let server = MemoryServer::new();
        server.set_trusted(false);
        server.set_trust_password("s3cret");

        let pem = der_to_pem(b"server");
        let result = register_remote(&layout, &lab(), Some(&pem), Some("wrong"), &server).await;

        assert!(result.is_err());
        assert!(list_remotes(&layout).await?.is_empty());
        assert!(!fs::try_exists(layout.server_cert("lab")).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_public_remote_skips_registration() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let layout = layout_with_client_cert(dir.path()).await?;

        let server = MemoryServer::new();
        server.set_trusted(false);

        let public = Remote::builder()
            .name("images")
            .url("https://images.example")
            .protocol(RemoteProtocol::Https)
            .public(true)
            .build();
        register_remote(&layout, &public, None, None, &server).await?;

        assert!(server.certificates().is_empty());
        assert_eq!(list_remotes(&layout).await?, vec!["images"]);
        Ok(())
    }
}
