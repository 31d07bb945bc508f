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

use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;

/// a topic and partition
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Topition {
    topic: String,
    partition: i32,
}

impl Topition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for Topition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Header {
    key: Bytes,
    value: Option<Bytes>,
}

impl Header {
    pub fn new(key: impl Into<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }
}

/// an immutable record at an offset within a topic partition
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Record {
    key: Option<Bytes>,
    value: Option<Bytes>,
    headers: Vec<Header>,
    timestamp: SystemTime,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Record {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// milliseconds since the unix epoch, negative when before it
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.duration_since(UNIX_EPOCH).map_or_else(
            |before| -(before.duration().as_millis() as i64),
            |after| after.as_millis() as i64,
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn topition(&self) -> Topition {
        Topition::new(self.topic.clone(), self.partition)
    }
}

#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Builder {
    key: Option<Bytes>,
    value: Option<Bytes>,
    headers: Vec<Header>,
    timestamp: Option<SystemTime>,
}

impl Builder {
    pub fn key(self, key: Option<Bytes>) -> Self {
        Self { key, ..self }
    }

    pub fn value(self, value: Option<Bytes>) -> Self {
        Self { value, ..self }
    }

    pub fn header(mut self, header: Header) -> Self {
        self.headers.push(header);
        self
    }

    pub fn timestamp(self, timestamp: SystemTime) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..self
        }
    }

    pub fn timestamp_millis(self, millis: u64) -> Self {
        self.timestamp(UNIX_EPOCH + Duration::from_millis(millis))
    }

    /// place this record at an offset within a topic partition
    pub fn build(self, topition: &Topition, offset: i64) -> Record {
        Record {
            key: self.key,
            value: self.value,
            headers: self.headers,
            timestamp: self.timestamp.unwrap_or_else(SystemTime::now),
            topic: topition.topic().to_owned(),
            partition: topition.partition(),
            offset,
        }
    }
}
