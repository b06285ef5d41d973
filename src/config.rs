use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use url::Url;

use crate::couch::ViewMode;
use crate::verifier::VerifierOptions;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "STORE_ENDPOINT", default = "http://127.0.0.1:8092")]
    pub endpoint: Url,

    #[envconfig(from = "STORE_BUCKET", default = "default")]
    pub bucket: NonEmptyString,

    #[envconfig(from = "STORE_USERNAME")]
    pub username: Option<NonEmptyString>,

    #[envconfig(from = "STORE_PASSWORD")]
    pub password: Option<String>,

    #[envconfig(default = "production")]
    pub view_mode: ViewMode,

    #[envconfig(default = "probes")]
    pub index_name: NonEmptyString,

    #[envconfig(default = "by_id")]
    pub view_name: NonEmptyString,

    #[envconfig(default = "false")]
    pub include_docs: bool,

    pub row_limit: Option<u64>,

    #[envconfig(default = "10000")]
    pub connect_timeout: EnvMsDuration,

    #[envconfig(default = "40000")]
    pub op_timeout: EnvMsDuration,

    #[envconfig(default = "55000")]
    pub durability_timeout: EnvMsDuration,

    #[envconfig(default = "125000")]
    pub view_timeout: EnvMsDuration,
}

impl Config {
    /// Produce the verifier knobs carried by this configuration.
    pub fn verifier_options(&self) -> VerifierOptions {
        VerifierOptions {
            index: self.index_name.as_str().to_owned(),
            view: self.view_name.as_str().to_owned(),
            include_docs: self.include_docs,
            row_limit: self.row_limit,
            ..VerifierOptions::default()
        }
    }

    /// Username and password for HTTP basic auth, if configured.
    pub fn credentials(&self) -> Option<(String, Option<String>)> {
        self.username
            .as_ref()
            .map(|username| (username.as_str().to_owned(), self.password.clone()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
