//! Reads mounted dataset credentials into a typed record

use std::path::Path;
use tracing::{Level, event};

use datasets::consts::{
    SECRET_KEY_ACCESS_KEY, SECRET_KEY_PASSWORD, SECRET_KEY_PRIVATE_KEY,
    SECRET_KEY_PRIVATE_KEY_PASSPHRASE, SECRET_KEY_SECRET_KEY, SECRET_KEY_TOKEN,
    SECRET_KEY_USERNAME,
};

/// The credentials mounted into a loader job
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    /// A username for basic auth
    pub username: Option<String>,
    /// A password for basic auth
    pub password: Option<String>,
    /// A private key for ssh auth
    pub ssh_private_key: Option<String>,
    /// The passphrase protecting the private key
    pub ssh_private_key_passphrase: Option<String>,
    /// A bearer token
    pub token: Option<String>,
    /// An access key id for s3 style auth
    pub access_key: Option<String>,
    /// A secret access key for s3 style auth
    pub secret_key: Option<String>,
}

/// Read a single secret file if it exists
///
/// # Arguments
///
/// * `dir` - The directory the secret is mounted at
/// * `key` - The file name to read
fn read_key(dir: &Path, key: &str) -> Option<String> {
    match std::fs::read_to_string(dir.join(key)) {
        Ok(content) => Some(content),
        Err(error) => {
            // absent files are expected so only log at debug
            event!(
                Level::DEBUG,
                secret_mount_dir = %dir.display(),
                secret_data_key = key,
                error = %error,
                "failed to read secret"
            );
            None
        }
    }
}

/// Read every well known credential file from a mounted directory
///
/// Missing files are skipped, this never fails for absent credentials.
///
/// # Arguments
///
/// * `dir` - The directory the secret is mounted at
pub fn read_secrets(dir: &Path) -> Secrets {
    Secrets {
        username: read_key(dir, SECRET_KEY_USERNAME),
        password: read_key(dir, SECRET_KEY_PASSWORD),
        ssh_private_key: read_key(dir, SECRET_KEY_PRIVATE_KEY),
        ssh_private_key_passphrase: read_key(dir, SECRET_KEY_PRIVATE_KEY_PASSPHRASE),
        token: read_key(dir, SECRET_KEY_TOKEN),
        access_key: read_key(dir, SECRET_KEY_ACCESS_KEY),
        secret_key: read_key(dir, SECRET_KEY_SECRET_KEY),
    }
}
