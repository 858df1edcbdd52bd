//! LAP (Lutron Authentication Protocol) pairing: a one-shot exchange that
//! trades a physical button press on the bridge for a client certificate
//! signed by the bridge's own CA.

use std::time::Duration;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rsa::pkcs8::EncodePrivateKey;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

use crate::connection::{build_connector, server_name, Connection, Credentials};
use crate::error::{LeapError, Result};

const PAIRING_PORT: u16 = 8083;
const DEFAULT_BUTTON_TIMEOUT: Duration = Duration::from_secs(60);

/// The bootstrap client certificate, key and CA every LEAP client shares
/// before it has its own pairing-issued identity. These are Lutron's
/// publicly documented LAP pairing credentials, embedded so the first
/// connection to port 8083 can be mutually authenticated at all.
pub const LAP_CA_PEM: &str = include_str!("certs/lap_ca.pem");
pub const LAP_CERT_PEM: &str = include_str!("certs/lap_cert.pem");
pub const LAP_KEY_PEM: &str = include_str!("certs/lap_key.pem");

/// Result of a successful pairing exchange.
pub struct PairingResult {
    pub credentials: Credentials,
    /// The bridge's reported firmware version, when present on the wire.
    pub version: Option<String>,
}

/// Options controlling one pairing attempt.
pub struct PairingOptions {
    pub host: String,
    pub port: u16,
    pub button_timeout: Duration,
    /// Common Name used on the generated CSR. Lutron bridges do not
    /// constrain this value; it only needs to be stable for diagnostics.
    pub common_name: String,
}

impl PairingOptions {
    pub fn new(host: impl Into<String>) -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Self {
            host: host.into(),
            port: PAIRING_PORT,
            button_timeout: DEFAULT_BUTTON_TIMEOUT,
            common_name: format!("pylutron_caseta-{nonce}"),
        }
    }
}

/// Run the pairing flow against `opts.host`. `ready` is invoked exactly once
/// after the bridge has accepted the pairing request and is waiting for the
/// physical button to be pressed.
pub async fn pair(opts: PairingOptions, ready: impl FnOnce()) -> Result<PairingResult> {
    let key_pair = generate_key_pair()?;
    let csr_pem = build_csr(&key_pair, &opts.common_name)?;

    let connector = build_connector(
        LAP_CA_PEM.as_bytes(),
        LAP_CERT_PEM.as_bytes(),
        LAP_KEY_PEM.as_bytes(),
    )?;
    let tcp = TcpStream::connect((opts.host.as_str(), opts.port))
        .await
        .map_err(|e| LeapError::PairingTransport(e.to_string()))?;
    let name = server_name(&opts.host)?;
    let tls = connector
        .connect(name, tcp)
        .await
        .map_err(|e| LeapError::PairingTransport(e.to_string()))?;

    let mut conn = Connection::from_tls(tls);

    let pair_request = serde_json::json!({
        "CommuniqueType": "CreateRequest",
        "Header": {"Url": "/pair", "ClientTag": "pair"},
        "Body": {
            "CommandType": "CSR",
            "Parameters": {
                "DeviceUID": "000000000000",
                "Role": "Admin",
                "Type": "RemoteAccess",
            }
        }
    });
    conn.write_line(&pair_request).await?;

    info!(
        "Waiting for physical button press on {} (timeout {:?})",
        opts.host, opts.button_timeout
    );

    let wait_for_access = async {
        loop {
            let msg = conn
                .read_line()
                .await?
                .ok_or(LeapError::PairingTransport("connection closed".into()))?;
            if has_physical_access(&msg) {
                return Ok::<(), LeapError>(());
            }
        }
    };

    match timeout(opts.button_timeout, wait_for_access).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(LeapError::PairingTimeout),
    }
    ready();

    let csr_request = serde_json::json!({
        "CommuniqueType": "CreateRequest",
        "Header": {"Url": "/pair", "ClientTag": "get-cert"},
        "Body": {
            "CommandType": "CSR",
            "Parameters": {
                "CSR": csr_pem,
                "DisplayName": opts.common_name,
                "DeviceUID": "000000000000",
                "Role": "Admin",
            }
        }
    });
    conn.write_line(&csr_request).await?;

    let cert_response = timeout(Duration::from_secs(10), async {
        loop {
            let msg = conn
                .read_line()
                .await?
                .ok_or(LeapError::PairingTransport("connection closed".into()))?;
            if msg.pointer("/Body/SigningResult").is_some() {
                return Ok::<_, LeapError>(msg);
            }
            if let Some(code) = msg.pointer("/Header/StatusCode").and_then(|c| c.as_str()) {
                if !code.starts_with('2') {
                    return Err(LeapError::PairingRejected);
                }
            }
        }
    })
    .await
    .map_err(|_| LeapError::PairingTimeout)??;

    let signed_cert = cert_response
        .pointer("/Body/SigningResult/Certificate")
        .and_then(|v| v.as_str())
        .ok_or(LeapError::PairingRejected)?;
    let root_cert = cert_response
        .pointer("/Body/SigningResult/RootCertificate")
        .and_then(|v| v.as_str())
        .unwrap_or(LAP_CA_PEM);
    let version = cert_response
        .pointer("/Body/SigningResult/Version")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(PairingResult {
        credentials: Credentials {
            ca_pem: root_cert.as_bytes().to_vec(),
            cert_pem: signed_cert.as_bytes().to_vec(),
            key_pem: key_pair.serialize_pem().into_bytes(),
        },
        version,
    })
}

/// Write the three credential files pairing produced, as named in
/// `<host>-bridge.crt` / `<host>.crt` / `<host>.key`. No partial state is
/// left behind: files are only written once all three artifacts are ready.
pub async fn write_credentials(dir: &std::path::Path, host: &str, creds: &Credentials) -> Result<()> {
    let dir = dir.to_path_buf();
    let host = host.to_string();
    let creds = creds.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(format!("{host}-bridge.crt")), &creds.ca_pem)?;
        std::fs::write(dir.join(format!("{host}.crt")), &creds.cert_pem)?;
        std::fs::write(dir.join(format!("{host}.key")), &creds.key_pem)?;
        Ok(())
    })
    .await
    .map_err(|e| LeapError::Protocol(format!("credential writer panicked: {e}")))?
}

fn has_physical_access(msg: &serde_json::Value) -> bool {
    msg.pointer("/Body/Status/Permissions")
        .and_then(|p| p.as_array())
        .map(|perms| perms.iter().any(|p| p.as_str() == Some("PhysicalAccess")))
        .unwrap_or(false)
}

fn generate_key_pair() -> Result<KeyPair> {
    let rsa_key = rsa::RsaPrivateKey::new(&mut rsa::rand_core::OsRng, 2048)
        .map_err(|e| LeapError::Protocol(format!("failed to generate RSA key: {e}")))?;
    let key_der = rsa_key
        .to_pkcs8_der()
        .map_err(|e| LeapError::Protocol(format!("failed to encode key: {e}")))?;
    KeyPair::try_from(key_der.as_bytes())
        .map_err(|e| LeapError::Protocol(format!("failed to build key pair: {e}")))
}

fn build_csr(key_pair: &KeyPair, common_name: &str) -> Result<String> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    let csr = params
        .serialize_request(key_pair)
        .map_err(|e| LeapError::Protocol(format!("failed to build CSR: {e}")))?;
    csr.pem()
        .map_err(|e| LeapError::Protocol(format!("failed to encode CSR: {e}")))
}
