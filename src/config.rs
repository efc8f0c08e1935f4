// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{fmt, fs};

use anyhow::anyhow;
use bytes::Bytes;

const CONFIG_PATH: &str = "CONFIG_PATH";
const SDS_ADDRESS: &str = "SDS_ADDRESS";
const ADMIN_ADDRESS: &str = "ADMIN_ADDRESS";
const AUTH_MODE: &str = "AUTH_MODE";
const TOKEN_SIGNING_KEY: &str = "TOKEN_SIGNING_KEY";
const TOKEN_SIGNING_KEY_PATH: &str = "TOKEN_SIGNING_KEY_PATH";
const LOCAL_RESOURCES_PATH: &str = "LOCAL_RESOURCES_PATH";
const RECONCILE_INTERVAL: &str = "RECONCILE_INTERVAL";
const CERT_VALIDITY: &str = "CERT_VALIDITY";
const REMOTE_SECRET_ADDRESS: &str = "REMOTE_SECRET_ADDRESS";
const REMOTE_SECRET_TOKEN_PATH: &str = "REMOTE_SECRET_TOKEN_PATH";
const REMOTE_SECRET_MOUNT_PREFIX: &str = "REMOTE_SECRET_MOUNT_PREFIX";
const REMOTE_SECRET_ROOT_CERT: &str = "REMOTE_SECRET_ROOT_CERT";
const TERMINATION_GRACE_PERIOD: &str = "TERMINATION_GRACE_PERIOD";
const WORKER_THREADS: &str = "WORKER_THREADS";
const STREAM_QUEUE_SIZE: &str = "STREAM_QUEUE_SIZE";

const DEFAULT_SDS_PORT: u16 = 5677;
const DEFAULT_ADMIN_PORT: u16 = 5679;
const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_CERT_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_DRAIN_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_WORKER_THREADS: usize = 2;
const DEFAULT_STREAM_QUEUE_SIZE: usize = 16;
const DEFAULT_MOUNT_PREFIX: &str = "kuma-pki-";

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub enum RootCert {
    File(PathBuf),
    Static(Bytes),
    Default,
}

#[derive(serde::Serialize, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Static(Bytes),
}

impl fmt::Debug for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(p) => f.debug_tuple("File").field(p).finish(),
            ConfigSource::Static(b) => write!(f, "Static({} bytes)", b.len()),
        }
    }
}

impl ConfigSource {
    pub async fn read_to_string(&self) -> anyhow::Result<String> {
        Ok(match self {
            ConfigSource::File(path) => tokio::fs::read_to_string(path).await?,
            ConfigSource::Static(data) => std::str::from_utf8(data).map(|s| s.to_string())?,
        })
    }

    pub async fn read(&self) -> anyhow::Result<Bytes> {
        Ok(match self {
            ConfigSource::File(path) => Bytes::from(tokio::fs::read(path).await?),
            ConfigSource::Static(data) => data.clone(),
        })
    }
}

/// How proxies prove who they are on the SDS stream.
#[derive(serde::Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Tokens signed by this server, see the `/token` admin endpoint.
    Token,
    /// Kubernetes service account tokens, checked with a TokenReview.
    Kubernetes,
    /// Trust the node id. Only suitable for local development.
    None,
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token" => Ok(AuthMode::Token),
            "kubernetes" => Ok(AuthMode::Kubernetes),
            "none" => Ok(AuthMode::None),
            other => Err(format!("unknown auth mode {other}")),
        }
    }
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RemoteSecretConfig {
    /// Base address, e.g. `https://vault.mesh-system:8200`.
    pub address: String,
    pub token_path: Option<PathBuf>,
    pub mount_prefix: String,
    pub root_cert: RootCert,
}

#[derive(serde::Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub sds_addr: SocketAddr,
    pub admin_addr: SocketAddr,

    pub auth_mode: AuthMode,
    /// Key for signing and verifying proxy tokens.
    #[serde(skip_serializing)]
    pub token_signing_key: Option<ConfigSource>,

    /// YAML meshes and dataplanes to serve.
    pub local_resources: Option<ConfigSource>,

    /// How often an active proxy's snapshot is reconciled.
    pub reconcile_interval: Duration,
    /// Validity of workload certificates issued by the builtin CA.
    pub cert_validity: Duration,

    /// If set, secrets are issued by a remote secret management system instead of the
    /// local CA managers.
    pub remote_secret: Option<RemoteSecretConfig>,

    pub termination_grace_period: Duration,

    /// Specify the number of worker threads the Tokio Runtime will use.
    pub num_worker_threads: usize,

    /// Capacity of the queue between a stream's reader and its processor.
    pub stream_queue_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sds_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_SDS_PORT),
            admin_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), DEFAULT_ADMIN_PORT),
            auth_mode: AuthMode::Token,
            token_signing_key: None,
            local_resources: None,
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            cert_validity: DEFAULT_CERT_VALIDITY,
            remote_secret: None,
            termination_grace_period: DEFAULT_DRAIN_DURATION,
            num_worker_threads: DEFAULT_WORKER_THREADS,
            stream_queue_size: DEFAULT_STREAM_QUEUE_SIZE,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid env var {0}={1}")]
    EnvVar(String, String),
    #[error("error parsing config file: {0}")]
    ConfigFile(anyhow::Error),
    #[error("auth mode token requires {TOKEN_SIGNING_KEY} or {TOKEN_SIGNING_KEY_PATH}")]
    MissingSigningKey,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// GoDuration wraps a Duration to implement golang Duration parsing semantics
struct GoDuration(Duration);

impl FromStr for GoDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        duration_str::parse(s)
            .map(GoDuration)
            .map_err(|e| e.to_string())
    }
}

/// Where settings come from, in order of precedence: the environment, then the config file.
struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn parse<T: FromStr>(&self, env: &str) -> Result<Option<T>, Error> {
        match (self.lookup)(env) {
            Some(val) => val
                .parse()
                .map(Some)
                .map_err(|_| Error::EnvVar(env.to_string(), val)),
            None => Ok(None),
        }
    }

    fn string(&self, env: &str) -> Option<String> {
        empty_to_none((self.lookup)(env))
    }
}

fn parse_file<T: FromStr>(field: &str, val: Option<String>) -> Result<Option<T>, Error> {
    match val {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| Error::ConfigFile(anyhow!("invalid {field}: {v}"))),
        None => Ok(None),
    }
}

pub fn parse_config() -> Result<Config, Error> {
    let lookup = |k: &str| std::env::var(k).ok();
    let path = empty_to_none(lookup(CONFIG_PATH));
    let fc = match path {
        Some(path) => read_file_config(&path).map_err(Error::ConfigFile)?,
        None => FileConfig::default(),
    };
    construct_config(fc, &lookup)
}

pub fn construct_config(
    fc: FileConfig,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<Config, Error> {
    let env = Env { lookup };
    let default = Config::default();

    let token_signing_key = env
        .string(TOKEN_SIGNING_KEY)
        .map(|k| ConfigSource::Static(Bytes::from(k)))
        .or_else(|| {
            env.string(TOKEN_SIGNING_KEY_PATH)
                .or(fc.token_signing_key_path.clone())
                .map(|p| ConfigSource::File(PathBuf::from(p)))
        });

    let auth_mode = match env.parse(AUTH_MODE)? {
        Some(m) => m,
        None => parse_file("authMode", fc.auth_mode)?.unwrap_or(default.auth_mode),
    };
    if auth_mode == AuthMode::Token && token_signing_key.is_none() {
        return Err(Error::MissingSigningKey);
    }

    let duration = |key: &str, field: &str, file: Option<String>, default: Duration| {
        let d: Option<GoDuration> = match env.parse(key)? {
            Some(d) => Some(d),
            None => parse_file(field, file)?,
        };
        Ok::<_, Error>(d.map(|d| d.0).unwrap_or(default))
    };

    let remote_secret = env
        .string(REMOTE_SECRET_ADDRESS)
        .or(fc.remote_secret_address.clone())
        .map(|address| RemoteSecretConfig {
            address,
            token_path: env
                .string(REMOTE_SECRET_TOKEN_PATH)
                .or(fc.remote_secret_token_path.clone())
                .map(PathBuf::from),
            mount_prefix: env
                .string(REMOTE_SECRET_MOUNT_PREFIX)
                .or(fc.remote_secret_mount_prefix.clone())
                .unwrap_or_else(|| DEFAULT_MOUNT_PREFIX.to_string()),
            root_cert: env
                .string(REMOTE_SECRET_ROOT_CERT)
                .or(fc.remote_secret_root_cert.clone())
                .map(|p| RootCert::File(PathBuf::from(p)))
                .unwrap_or(RootCert::Default),
        });

    let cfg = Config {
        sds_addr: env
            .parse(SDS_ADDRESS)?
            .or(parse_file("sdsAddress", fc.sds_address)?)
            .unwrap_or(default.sds_addr),
        admin_addr: env
            .parse(ADMIN_ADDRESS)?
            .or(parse_file("adminAddress", fc.admin_address)?)
            .unwrap_or(default.admin_addr),
        auth_mode,
        token_signing_key,
        local_resources: env
            .string(LOCAL_RESOURCES_PATH)
            .or(fc.local_resources_path)
            .map(|p| ConfigSource::File(PathBuf::from(p))),
        reconcile_interval: duration(
            RECONCILE_INTERVAL,
            "reconcileInterval",
            fc.reconcile_interval,
            default.reconcile_interval,
        )?,
        cert_validity: duration(
            CERT_VALIDITY,
            "certValidity",
            fc.cert_validity,
            default.cert_validity,
        )?,
        remote_secret,
        termination_grace_period: duration(
            TERMINATION_GRACE_PERIOD,
            "terminationGracePeriod",
            fc.termination_grace_period,
            default.termination_grace_period,
        )?,
        num_worker_threads: env
            .parse(WORKER_THREADS)?
            .or(fc.worker_threads)
            .unwrap_or(default.num_worker_threads),
        stream_queue_size: env
            .parse(STREAM_QUEUE_SIZE)?
            .or(fc.stream_queue_size)
            .unwrap_or(default.stream_queue_size),
    };
    if cfg.reconcile_interval.is_zero() {
        return Err(Error::Zero(RECONCILE_INTERVAL));
    }
    if cfg.stream_queue_size == 0 {
        return Err(Error::Zero(STREAM_QUEUE_SIZE));
    }
    if cfg.num_worker_threads == 0 {
        return Err(Error::Zero(WORKER_THREADS));
    }
    Ok(cfg)
}

/// Settings read from the optional YAML config file. Environment variables take precedence.
#[derive(serde::Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    pub sds_address: Option<String>,
    pub admin_address: Option<String>,
    pub auth_mode: Option<String>,
    pub token_signing_key_path: Option<String>,
    pub local_resources_path: Option<String>,
    pub reconcile_interval: Option<String>,
    pub cert_validity: Option<String>,
    pub remote_secret_address: Option<String>,
    pub remote_secret_token_path: Option<String>,
    pub remote_secret_mount_prefix: Option<String>,
    pub remote_secret_root_cert: Option<String>,
    pub termination_grace_period: Option<String>,
    pub worker_threads: Option<usize>,
    pub stream_queue_size: Option<usize>,
}

fn read_file_config(path: &str) -> anyhow::Result<FileConfig> {
    let f = fs::File::open(path).map_err(|e| anyhow!("failed opening config file {path}: {e}"))?;
    serde_yaml::from_reader(f).map_err(|e| anyhow!("failed parsing config file {path}: {e}"))
}

pub fn empty_to_none<A: AsRef<str>>(inp: Option<A>) -> Option<A> {
    if let Some(inner) = &inp {
        if inner.as_ref().is_empty() {
            return None;
        }
    }
    inp
}
