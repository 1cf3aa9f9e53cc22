use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

use crate::util::types::DeviceId;

const PUBLIC_CERT_SUFFIX: &str = "-public.pem";
const PRIVATE_KEY_SUFFIX: &str = "-private.pem";

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("connection string is missing the {0} field")]
    MissingField(&'static str),

    #[error("malformed connection string segment: {0:?}")]
    Malformed(String),

    #[error("certificate file name must end in {PUBLIC_CERT_SUFFIX}: {0}")]
    CertificateName(String),

    #[error("failed to read certificate material: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decrypt private key: {0}")]
    Key(#[from] openssl::error::ErrorStack),

    #[error("failed to build TLS identity: {0}")]
    Identity(#[from] reqwest::Error),
}

/// Credential material for one device session.
#[derive(Debug, Clone)]
pub enum DeviceCredentials {
    X509(X509Credentials),
    ConnectionString(ConnectionString),
}

impl DeviceCredentials {
    pub fn device_id(&self) -> &DeviceId {
        match self {
            DeviceCredentials::X509(x509) => &x509.device_id,
            DeviceCredentials::ConnectionString(cs) => &cs.device_id,
        }
    }
}

/// An X.509 certificate triple: public cert, private key, passphrase.
///
/// The device identity is the certificate file name stem; the private key
/// is expected next to the certificate with the matching name.
#[derive(Debug, Clone)]
pub struct X509Credentials {
    pub device_id: DeviceId,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub passphrase: Option<String>,
}

impl X509Credentials {
    pub fn from_cert_path(
        cert_path: &Path,
        passphrase: Option<String>,
    ) -> Result<Self, CredentialsError> {
        let file_name = cert_path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| CredentialsError::CertificateName(cert_path.display().to_string()))?;

        let device_id = file_name
            .strip_suffix(PUBLIC_CERT_SUFFIX)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CredentialsError::CertificateName(cert_path.display().to_string()))?;

        let key_path = cert_path.with_file_name(format!("{device_id}{PRIVATE_KEY_SUFFIX}"));

        Ok(Self {
            device_id: device_id.into(),
            cert_path: cert_path.to_path_buf(),
            key_path,
            passphrase,
        })
    }

    /// Load the certificate pair into a TLS client identity, decrypting
    /// the private key first when a passphrase is configured.
    pub fn identity(&self) -> Result<reqwest::Identity, CredentialsError> {
        let cert = fs::read(&self.cert_path)?;
        let key = fs::read(&self.key_path)?;

        let identity = match &self.passphrase {
            Some(passphrase) => {
                let key = openssl::pkey::PKey::private_key_from_pem_passphrase(
                    &key,
                    passphrase.as_bytes(),
                )?;
                let key = key.private_key_to_pem_pkcs8()?;
                reqwest::Identity::from_pkcs8_pem(&cert, &key)?
            }
            None => reqwest::Identity::from_pkcs8_pem(&cert, &key)?,
        };

        Ok(identity)
    }
}

/// Scan `dir` for `*-public.pem` certificates, one device each.
///
/// Returned in device-id order so session establishment is deterministic.
pub fn discover_x509(
    dir: &Path,
    passphrase: Option<&str>,
) -> Result<Vec<X509Credentials>, CredentialsError> {
    let mut credentials = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_cert = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(PUBLIC_CERT_SUFFIX));
        if path.is_file() && is_cert {
            credentials.push(X509Credentials::from_cert_path(
                &path,
                passphrase.map(String::from),
            )?);
        }
    }
    credentials.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    Ok(credentials)
}

/// A device connection string:
/// `HostName=<host>;DeviceId=<id>;SharedAccessKey=<base64>`.
#[derive(Debug, Clone)]
pub struct ConnectionString {
    pub hostname: String,
    pub device_id: DeviceId,
    pub shared_access_key: String,
}

impl FromStr for ConnectionString {
    type Err = CredentialsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = parse_fields(s)?;
        Ok(Self {
            hostname: require(&fields, "HostName")?.to_owned(),
            device_id: require(&fields, "DeviceId")?.into(),
            shared_access_key: require(&fields, "SharedAccessKey")?.to_owned(),
        })
    }
}

/// A service (registry) connection string:
/// `HostName=<host>;SharedAccessKeyName=<policy>;SharedAccessKey=<base64>`.
#[derive(Debug, Clone)]
pub struct ServiceConnectionString {
    pub hostname: String,
    pub policy_name: String,
    pub shared_access_key: String,
}

impl FromStr for ServiceConnectionString {
    type Err = CredentialsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = parse_fields(s)?;
        Ok(Self {
            hostname: require(&fields, "HostName")?.to_owned(),
            policy_name: require(&fields, "SharedAccessKeyName")?.to_owned(),
            shared_access_key: require(&fields, "SharedAccessKey")?.to_owned(),
        })
    }
}

fn parse_fields(s: &str) -> Result<Vec<(&str, &str)>, CredentialsError> {
    s.split(';')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .split_once('=')
                .ok_or_else(|| CredentialsError::Malformed(segment.to_owned()))
        })
        .collect()
}

fn require<'a>(
    fields: &[(&'a str, &'a str)],
    name: &'static str,
) -> Result<&'a str, CredentialsError> {
    fields
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, value)| *value)
        .filter(|value| !value.is_empty())
        .ok_or(CredentialsError::MissingField(name))
}
