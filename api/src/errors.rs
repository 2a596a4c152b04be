//! An error from the dataset controller or one of its loaders

/// An error from the dataset controller or one of its loaders
#[derive(Debug)]
pub enum Error {
    /// A generic error with a message
    Generic(String),
    /// An IO Error
    IO(std::io::Error),
    /// An error from the k8s client
    K8s(kube::Error),
    /// An error from converting a value with serde
    Serde(serde_json::Error),
    /// An error from converting a value with serde to YAML
    SerdeYaml(serde_yaml::Error),
    /// An error from parsing a URL
    UrlParse(url::ParseError),
    /// An error from using a regex
    Regex(regex::Error),
    /// An error from loading a config
    Config(config::ConfigError),
    /// An error from sending or recieving a request
    Reqwest(reqwest::Error),
    /// An error casting bytes to a utf8 formatted string
    StringFromUtf8(std::string::FromUtf8Error),
    /// An error from joining a tokio task
    JoinError(tokio::task::JoinError),
}

impl Error {
    /// Create a new generic error
    ///
    /// # Arguments
    ///
    /// * `msg` - The error message to set
    pub fn new<T: Into<String>>(msg: T) -> Self {
        Error::Generic(msg.into())
    }

    /// Get the error message for this error
    pub fn msg(&self) -> String {
        // get the msg from any error types that support it
        match self {
            Error::Generic(msg) => msg.clone(),
            Error::IO(err) => err.to_string(),
            Error::K8s(err) => err.to_string(),
            Error::Serde(err) => err.to_string(),
            Error::SerdeYaml(err) => err.to_string(),
            Error::UrlParse(err) => err.to_string(),
            Error::Regex(err) => err.to_string(),
            Error::Config(err) => err.to_string(),
            Error::Reqwest(err) => err.to_string(),
            Error::StringFromUtf8(err) => err.to_string(),
            Error::JoinError(err) => err.to_string(),
        }
    }

    /// Check whether this error is a k8s 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::K8s(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

impl std::fmt::Display for Error {
    /// display this error in a easy readble format
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.msg())
    }
}

// mark that this is an error struct
impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<kube::Error> for Error {
    fn from(error: kube::Error) -> Self {
        Error::K8s(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serde(error)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::SerdeYaml(error)
    }
}

impl From<url::ParseError> for Error {
    fn from(error: url::ParseError) -> Self {
        Error::UrlParse(error)
    }
}

impl From<regex::Error> for Error {
    fn from(error: regex::Error) -> Self {
        Error::Regex(error)
    }
}

impl From<config::ConfigError> for Error {
    fn from(error: config::ConfigError) -> Self {
        Error::Config(error)
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Reqwest(error)
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(error: std::string::FromUtf8Error) -> Self {
        Error::StringFromUtf8(error)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(error: tokio::task::JoinError) -> Self {
        Error::JoinError(error)
    }
}
