// Copyright ⓒ 2025 Peter Morgan <peter.james.morgan@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Tansu Consumer
//!
//! A consumer group member: joins a group, consumes the partitions
//! assigned to it in each session and marks every record once it has
//! been processed.
//!
//! The [`group::Coordinator`] trait is the boundary with the group
//! membership protocol. [`kafka`] implements it with librdkafka, each
//! assignment starting a session and each revocation ending it.

use std::{
    fmt, io,
    path::PathBuf,
    result,
    sync::{Arc, LazyLock, PoisonError},
};

use opentelemetry::{InstrumentationScope, global, metrics::Meter};
use opentelemetry_semantic_conventions::SCHEMA_URL;
use tokio::task::JoinError;

pub mod config;
pub mod consumer;
pub mod group;
pub mod handler;
pub mod kafka;
pub mod ready;
pub mod record;
pub mod shutdown;
pub mod tls;

pub use config::{Configuration, Version};
pub use consumer::Consumer;
pub use group::{Claim, Coordinator, Handler, Session};
pub use handler::{Log, Process, SessionHandler};
pub use kafka::Kafka;
pub use record::{Record, Topition};
pub use shutdown::{CancelKind, Shutdown, Signals};
pub use tls::{Tls, TlsContext};

pub(crate) static METER: LazyLock<Meter> = LazyLock::new(|| {
    global::meter_with_scope(
        InstrumentationScope::builder(env!("CARGO_PKG_NAME"))
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(SCHEMA_URL)
            .build(),
    )
});

#[derive(thiserror::Error, Debug)]
pub enum Error {
    Closed,
    InvalidVersion(String),
    Io(Arc<io::Error>),
    Join(#[from] JoinError),
    Kafka(#[from] rdkafka::error::KafkaError),
    Message(String),
    MissingBrokers,
    MissingGroup,
    MissingTopics,
    NoCertificates(PathBuf),
    NoPrivateKey(PathBuf),
    Poison,
    ReadinessAbandoned,
    Regex(#[from] regex::Error),
    Rustls(#[from] rustls::Error),
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_value: PoisonError<T>) -> Self {
        Self::Poison
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(msg) => write!(f, "{msg}"),
            error => write!(f, "{error:?}"),
        }
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;
