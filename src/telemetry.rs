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

use std::env;
use std::str::FromStr;
use std::time::Instant;

use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{Layer, Registry, filter, filter::EnvFilter, prelude::*, reload};

pub static APPLICATION_START_TIME: Lazy<Instant> = Lazy::new(Instant::now);
static LOG_HANDLE: OnceCell<LogHandle> = OnceCell::new();

type BoxLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;
type FilteredLayer = filter::Filtered<BoxLayer, EnvFilter, Registry>;
type LogHandle = reload::Handle<FilteredLayer, Registry>;

/// Output encoding of log lines, selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Single line per event, span fields inline, no colors.
    #[default]
    Plain,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "plain" | "text" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            _ => Err(Error::UnknownFormat(s.to_string())),
        }
    }
}

impl LogFormat {
    fn from_env() -> LogFormat {
        match env::var("LOG_FORMAT") {
            Ok(v) => v.parse().unwrap_or_else(|e| {
                eprintln!("{e}, falling back to plain logs");
                LogFormat::Plain
            }),
            Err(_) => LogFormat::Plain,
        }
    }

    fn layer(self) -> BoxLayer {
        match self {
            LogFormat::Plain => Box::new(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(false)
                    .with_target(true),
            ),
            LogFormat::Json => Box::new(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false),
            ),
        }
    }
}

pub fn setup_logging() {
    Lazy::force(&APPLICATION_START_TIME);
    tracing_subscriber::registry()
        .with(reloadable(LogFormat::from_env()))
        .init();
}

/// Wraps the output layer in a filter that `set_level` can swap at runtime.
fn reloadable(format: LogFormat) -> BoxLayer {
    let (layer, handle) = reload::Layer::new(format.layer().with_filter(default_env_filter()));
    if LOG_HANDLE.set(handle).is_err() {
        warn!("log handle already installed, runtime level changes apply to the first subscriber");
    }
    Box::new(layer)
}

fn default_env_filter() -> EnvFilter {
    // tonic's h2 transport logs every stream reset at debug; keep it quiet unless asked for.
    let var: String = env::var(EnvFilter::DEFAULT_ENV)
        .map(|v| format!("h2=warn,{v}"))
        .unwrap_or_else(|_| "h2=warn,info".to_string());
    EnvFilter::builder()
        .with_regex(false)
        .parse(&var)
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Adds `level` to the active filter, or replaces everything but the defaults when `reset`.
pub fn set_level(reset: bool, level: &str) -> Result<(), Error> {
    let handle = LOG_HANDLE.get().ok_or(Error::Uninitialized)?;
    let base = if reset {
        default_env_filter().to_string()
    } else {
        handle.with_current(|f| f.filter().to_string())?
    };
    // directives may repeat; the last one for a target wins
    let filter = EnvFilter::builder().parse(format!("{base},{level}"))?;
    info!(%filter, "updated log filter");
    handle.modify(|layer| *layer.filter_mut() = filter)?;
    Ok(())
}

pub fn get_current_loglevel() -> Result<String, Error> {
    let handle = LOG_HANDLE.get().ok_or(Error::Uninitialized)?;
    Ok(handle.with_current(|f| f.filter().to_string())?)
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("parse failure: {0}")]
    InvalidFilter(#[from] filter::ParseError),
    #[error("reload failure: {0}")]
    Reload(#[from] reload::Error),
    #[error("logging is not initialized")]
    Uninitialized,
    #[error("unknown log format {0:?}")]
    UnknownFormat(String),
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use once_cell::sync::Lazy;
    use tracing_subscriber::prelude::*;

    static TRACING: Lazy<()> = Lazy::new(|| {
        Lazy::force(&super::APPLICATION_START_TIME);
        let _ = tracing_subscriber::registry()
            .with(super::reloadable(super::LogFormat::Plain))
            .try_init();
    });

    /// Installs the global subscriber once per test binary.
    pub fn setup_test_logging() {
        Lazy::force(&TRACING);
    }
}
