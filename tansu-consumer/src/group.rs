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

//! Consumer group membership
//!
//! A [`Coordinator`] joins a group and runs sessions until it is closed.
//! Each session calls [`Handler::setup`], then [`Handler::consume_claim`]
//! concurrently for every assigned partition and finally
//! [`Handler::cleanup`] once every claim has returned.

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    Result,
    record::{Record, Topition},
};

/// a period of stable partition assignment between rebalances
#[async_trait]
pub trait Session: Debug + Send + Sync {
    fn member_id(&self) -> &str;

    fn generation_id(&self) -> i32;

    /// partitions assigned to this member by topic
    fn claims(&self) -> &BTreeMap<String, Vec<i32>>;

    /// mark a record as processed, committing the offset that follows it
    async fn mark(&self, record: &Record) -> Result<()>;
}

/// session callbacks made by a coordinator
#[async_trait]
pub trait Handler: Debug + Send + Sync + 'static {
    /// before any claim of a new session is consumed
    async fn setup(&self, session: &dyn Session) -> Result<()>;

    /// consume the records of a claim until it is closed
    async fn consume_claim(&self, session: &dyn Session, claim: Claim) -> Result<()>;

    /// after every claim of the session has returned
    async fn cleanup(&self, session: &dyn Session) -> Result<()>;
}

/// group membership over a set of topics
#[async_trait]
pub trait Coordinator: Debug + Send + Sync + 'static {
    /// run sessions until closed or a fatal error occurs
    async fn consume(&self, topics: &[String], handler: Arc<dyn Handler>) -> Result<()>;

    /// leave the group, returning once any running consume has finished
    async fn close(&self) -> Result<()>;
}

/// the records of one partition assigned for the duration of a session
#[derive(Debug)]
pub struct Claim {
    topition: Topition,
    initial_offset: i64,
    high_water_mark: watch::Receiver<i64>,
    records: mpsc::Receiver<Record>,
    revoked: CancellationToken,
    closed: bool,
}

impl Claim {
    pub fn new(
        topition: Topition,
        initial_offset: i64,
        high_water_mark: watch::Receiver<i64>,
        records: mpsc::Receiver<Record>,
        revoked: CancellationToken,
    ) -> Self {
        Self {
            topition,
            initial_offset,
            high_water_mark,
            records,
            revoked,
            closed: false,
        }
    }

    pub fn topic(&self) -> &str {
        self.topition.topic()
    }

    pub fn partition(&self) -> i32 {
        self.topition.partition()
    }

    pub fn topition(&self) -> &Topition {
        &self.topition
    }

    /// the offset of the first record delivered by this claim
    pub fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    /// the offset that the next record produced to this partition will have
    pub fn high_water_mark(&self) -> i64 {
        *self.high_water_mark.borrow()
    }

    /// the next record, or none once the claim has been revoked or the session is closing
    pub async fn next(&mut self) -> Option<Record> {
        if self.closed {
            return None;
        }

        let record = tokio::select! {
            biased;
            _ = self.revoked.cancelled() => None,
            record = self.records.recv() => record,
        };

        self.closed = record.is_none();
        record
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
