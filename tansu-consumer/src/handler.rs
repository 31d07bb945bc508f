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

use std::{fmt::Debug, sync::LazyLock};

use async_trait::async_trait;
use opentelemetry::{KeyValue, metrics::Counter};
use tracing::{Instrument, Level, debug, info, span};

use crate::{
    METER, Result,
    group::{Claim, Handler, Session},
    ready::Readiness,
    record::Record,
};

static SESSIONS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_consumer_sessions")
        .with_description("consumer group sessions set up")
        .build()
});

static RECORDS_PROCESSED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_consumer_records_processed")
        .with_description("records processed")
        .build()
});

static RECORDS_MARKED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tansu_consumer_records_marked")
        .with_description("records marked as processed")
        .build()
});

/// the side effect of consuming a record
#[async_trait]
pub trait Process: Debug + Send + Sync + 'static {
    async fn process(&self, record: &Record);
}

/// log the value, timestamp and topic of each record
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Log;

#[async_trait]
impl Process for Log {
    async fn process(&self, record: &Record) {
        info!(
            value = %record
                .value()
                .map(|value| String::from_utf8_lossy(value))
                .unwrap_or_default(),
            timestamp = record.timestamp_millis(),
            topic = record.topic(),
            "message claimed"
        );
    }
}

/// Session lifecycle: raises readiness on the first setup, then
/// processes and marks every record of each claim in offset order.
#[derive(Clone, Debug)]
pub struct SessionHandler<P = Log> {
    readiness: Readiness,
    process: P,
}

impl SessionHandler<Log> {
    pub fn new(readiness: Readiness) -> Self {
        Self {
            readiness,
            process: Log,
        }
    }
}

impl<P> SessionHandler<P> {
    pub fn with_process<Q>(self, process: Q) -> SessionHandler<Q> {
        SessionHandler {
            readiness: self.readiness,
            process,
        }
    }
}

#[async_trait]
impl<P> Handler for SessionHandler<P>
where
    P: Process,
{
    async fn setup(&self, session: &dyn Session) -> Result<()> {
        debug!(
            member_id = session.member_id(),
            generation_id = session.generation_id(),
            claims = ?session.claims()
        );

        SESSIONS.add(1, &[]);

        if self.readiness.set() {
            debug!(ready = true);
        }

        Ok(())
    }

    async fn consume_claim(&self, session: &dyn Session, mut claim: Claim) -> Result<()> {
        let span = span!(
            Level::DEBUG,
            "claim",
            topic = claim.topic(),
            partition = claim.partition()
        );

        async move {
            debug!(
                initial_offset = claim.initial_offset(),
                high_water_mark = claim.high_water_mark()
            );

            let attributes = [KeyValue::new("topic", claim.topic().to_owned())];

            while let Some(record) = claim.next().await {
                self.process.process(&record).await;
                RECORDS_PROCESSED.add(1, &attributes);

                session.mark(&record).await?;
                RECORDS_MARKED.add(1, &attributes);
            }

            debug!(closed = claim.is_closed());
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn cleanup(&self, session: &dyn Session) -> Result<()> {
        debug!(
            member_id = session.member_id(),
            generation_id = session.generation_id()
        );

        Ok(())
    }
}
