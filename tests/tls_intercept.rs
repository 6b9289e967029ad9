//! End-to-end TLS interception pieces: a client that trusts the generated
//! CA completes a handshake against a minted leaf, and concurrent
//! connections for the same SNI share one leaf.

use netwarden::ca::CertificateAuthority;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn server_config(ca: &CertificateAuthority, sni: &str) -> Arc<rustls::ServerConfig> {
    let leaf = ca.leaf_for(sni).unwrap();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![
                CertificateDer::from(leaf.cert_der.clone()),
                CertificateDer::from(ca.export_der().to_vec()),
            ],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf.key_der.clone())),
        )
        .unwrap();
    Arc::new(config)
}

fn client_config(ca: &CertificateAuthority) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots
        .add(CertificateDer::from(ca.export_der().to_vec()))
        .unwrap();
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

#[tokio::test]
async fn client_trusting_ca_completes_handshake_with_minted_leaf() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::open(dir.path(), "wifi_security").unwrap();

    let acceptor = TlsAcceptor::from(server_config(&ca, "example.com"));
    let connector = TlsConnector::from(client_config(&ca));

    let (client_side, server_side) = tokio::io::duplex(64 * 1024);

    let server = tokio::spawn(async move {
        let mut tls = acceptor.accept(server_side).await.unwrap();
        let mut buf = [0u8; 5];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        tls.write_all(b"world").await.unwrap();
        tls.shutdown().await.ok();
    });

    let name = ServerName::try_from("example.com".to_string()).unwrap();
    let mut tls = connector.connect(name, client_side).await.unwrap();
    tls.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    server.await.unwrap();
}

#[tokio::test]
async fn handshake_fails_for_wrong_hostname() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::open(dir.path(), "wifi_security").unwrap();

    let acceptor = TlsAcceptor::from(server_config(&ca, "example.com"));
    let connector = TlsConnector::from(client_config(&ca));

    let (client_side, server_side) = tokio::io::duplex(64 * 1024);
    tokio::spawn(async move {
        let _ = acceptor.accept(server_side).await;
    });

    // The leaf is for example.com; connecting as other.test must fail.
    let name = ServerName::try_from("other.test".to_string()).unwrap();
    assert!(connector.connect(name, client_side).await.is_err());
}

#[tokio::test]
async fn concurrent_handshakes_share_one_leaf() {
    let dir = tempfile::tempdir().unwrap();
    let ca = Arc::new(CertificateAuthority::open(dir.path(), "wifi_security").unwrap());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let ca = ca.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            ca.leaf_for("shared.example").unwrap()
        }));
    }
    let mut leaves = Vec::new();
    for task in tasks {
        leaves.push(task.await.unwrap());
    }
    // Coalesced minting: every handshake got the same cached leaf.
    assert_eq!(ca.cached_leaves(), 1);
    for leaf in &leaves[1..] {
        assert_eq!(leaf.cert_der, leaves[0].cert_der);
    }
}
