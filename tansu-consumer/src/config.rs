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

use std::{fmt, marker::PhantomData, str::FromStr, sync::LazyLock};

use regex::Regex;

use crate::{Error, Result, tls::Tls};

pub const DEFAULT_VERSION: Version = Version([2, 1, 1, 0]);

const API_VERSIONS: Version = Version([0, 10, 0, 0]);

static VERSION: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"^(?:0\.(?<minor>\d+)\.(?<patch>\d+)\.(?<build>\d+)|(?<major>[1-9]\d*)\.(?<major_minor>\d+)\.(?<major_patch>\d+))$")
});

/// protocol version of the cluster: `MAJOR.MINOR.PATCH` or `0.MINOR.PATCH.BUILD`
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Version([u32; 4]);

impl Version {
    pub fn major(&self) -> u32 {
        self.0[0]
    }

    pub fn minor(&self) -> u32 {
        self.0[1]
    }

    pub fn patch(&self) -> u32 {
        self.0[2]
    }

    /// brokers from 0.10 answer an api versions request
    pub fn api_version_request(&self) -> bool {
        *self >= API_VERSIONS
    }
}

impl Default for Version {
    fn default() -> Self {
        DEFAULT_VERSION
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let re = VERSION
            .as_ref()
            .map_err(|err| Error::Message(err.to_string()))?;

        let captures = re
            .captures(s)
            .ok_or_else(|| Error::InvalidVersion(s.to_owned()))?;

        let number = |name: &str| {
            captures.name(name).map_or(Ok(0), |capture| {
                capture
                    .as_str()
                    .parse::<u32>()
                    .map_err(|_| Error::InvalidVersion(s.to_owned()))
            })
        };

        if captures.name("major").is_some() {
            Ok(Self([
                number("major")?,
                number("major_minor")?,
                number("major_patch")?,
                0,
            ]))
        } else {
            Ok(Self([0, number("minor")?, number("patch")?, number("build")?]))
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch, build] = self.0;

        if major == 0 {
            write!(f, "0.{minor}.{patch}.{build}")
        } else {
            write!(f, "{major}.{minor}.{patch}")
        }
    }
}

/// immutable configuration established once at startup
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Configuration {
    brokers: Vec<String>,
    version: Version,
    group_id: String,
    topics: Vec<String>,
    client_id: Option<String>,
    verbose: bool,
    tls: Tls,
}

impl Configuration {
    pub fn builder() -> PhantomBuilder {
        Builder::default()
    }

    /// bootstrap brokers as `host:port`
    pub fn brokers(&self) -> &[String] {
        &self.brokers
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn tls(&self) -> &Tls {
        &self.tls
    }
}

#[derive(Clone, Debug, Default)]
pub struct Builder<B, G, T> {
    brokers: B,
    group_id: G,
    topics: T,
    version: Version,
    client_id: Option<String>,
    verbose: bool,
    tls: Tls,
}

pub type PhantomBuilder =
    Builder<PhantomData<Vec<String>>, PhantomData<String>, PhantomData<Vec<String>>>;

impl<B, G, T> Builder<B, G, T> {
    pub fn brokers(self, brokers: Vec<String>) -> Builder<Vec<String>, G, T> {
        Builder {
            brokers,
            group_id: self.group_id,
            topics: self.topics,
            version: self.version,
            client_id: self.client_id,
            verbose: self.verbose,
            tls: self.tls,
        }
    }

    pub fn group_id(self, group_id: impl Into<String>) -> Builder<B, String, T> {
        Builder {
            brokers: self.brokers,
            group_id: group_id.into(),
            topics: self.topics,
            version: self.version,
            client_id: self.client_id,
            verbose: self.verbose,
            tls: self.tls,
        }
    }

    pub fn topics(self, topics: Vec<String>) -> Builder<B, G, Vec<String>> {
        Builder {
            brokers: self.brokers,
            group_id: self.group_id,
            topics,
            version: self.version,
            client_id: self.client_id,
            verbose: self.verbose,
            tls: self.tls,
        }
    }

    pub fn version(self, version: Version) -> Self {
        Self { version, ..self }
    }

    pub fn client_id(self, client_id: Option<String>) -> Self {
        Self { client_id, ..self }
    }

    pub fn verbose(self, verbose: bool) -> Self {
        Self { verbose, ..self }
    }

    pub fn tls(self, tls: Tls) -> Self {
        Self { tls, ..self }
    }
}

impl Builder<Vec<String>, String, Vec<String>> {
    /// brokers, group and topics are mandatory
    pub fn build(self) -> Result<Configuration> {
        let brokers = self
            .brokers
            .iter()
            .map(|broker| broker.trim())
            .filter(|broker| !broker.is_empty())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();

        if brokers.is_empty() {
            return Err(Error::MissingBrokers);
        }

        let group_id = self.group_id.trim().to_owned();
        if group_id.is_empty() {
            return Err(Error::MissingGroup);
        }

        let topics = self
            .topics
            .iter()
            .map(|topic| topic.trim())
            .filter(|topic| !topic.is_empty())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();

        if topics.is_empty() {
            return Err(Error::MissingTopics);
        }

        Ok(Configuration {
            brokers,
            version: self.version,
            group_id,
            topics,
            client_id: self.client_id,
            verbose: self.verbose,
            tls: self.tls,
        })
    }
}
