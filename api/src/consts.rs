//! Constants shared between the dataset controller and its loader workers

/// The label key claims and volumes owned by a dataset carry
pub const DATASET_NAME_LABEL: &str = "dataset.name";

/// The finalizer the controller stores on every observed dataset
pub const DATASET_FINALIZER: &str = "dataset-controller";

/// Where the loader job mounts the dataset claim
pub const DATA_MOUNT_PATH: &str = "/data";

/// Where the loader job mounts the dataset secret
pub const SECRETS_MOUNT_PATH: &str = "/secrets";

/// The file names read from the mounted secret directory
pub const SECRET_KEY_USERNAME: &str = "username";
pub const SECRET_KEY_PASSWORD: &str = "password";
pub const SECRET_KEY_PRIVATE_KEY: &str = "ssh-privatekey";
pub const SECRET_KEY_PRIVATE_KEY_PASSPHRASE: &str = "ssh-privatekey-passphrase";
pub const SECRET_KEY_TOKEN: &str = "token";
pub const SECRET_KEY_ACCESS_KEY: &str = "access-key";
pub const SECRET_KEY_SECRET_KEY: &str = "secret-key";
