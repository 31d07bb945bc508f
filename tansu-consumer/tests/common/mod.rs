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

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use memory::Broker;
use tansu_consumer::{
    Claim, Coordinator, Error, Handler, Process, Record, Result, Session, Topition,
    ready::Readiness,
};
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, subscriber::DefaultGuard};
use tracing_subscriber::{EnvFilter, filter::ParseError};


const DEADLINE: Duration = Duration::from_secs(10);

pub(crate) fn init_tracing() -> Result<DefaultGuard> {
    Ok(tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_level(true)
            .with_line_number(true)
            .with_thread_names(false)
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(
                    "tansu_consumer=debug"
                        .parse()
                        .map_err(|err: ParseError| Error::Message(err.to_string()))?,
                ),
            )
            .with_test_writer()
            .finish(),
    ))
}

/// the future output, or an error if it takes too long
pub(crate) async fn within<F>(future: F) -> Result<F::Output>
where
    F: Future,
{
    tokio::time::timeout(DEADLINE, future)
        .await
        .map_err(|elapsed| Error::Message(elapsed.to_string()))
}

/// wait until the committed offset of a group reaches an offset
pub(crate) async fn committed(
    broker: &Broker,
    group_id: &str,
    topition: &Topition,
    offset: i64,
) -> Result<()> {
    within(async {
        while broker.committed(group_id, topition)? < Some(offset) {
            sleep(Duration::from_millis(5)).await;
        }

        Ok::<(), Error>(())
    })
    .await?
}

pub(crate) fn produce(broker: &Broker, topition: &Topition, n: usize) -> Result<Vec<i64>> {
    (0..n)
        .map(|i| {
            broker.produce(
                topition,
                Record::builder().value(Some(Bytes::from(format!("{topition}:{i}")))),
            )
        })
        .collect()
}

/// what was observed as each record was processed
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct Processed {
    pub(crate) partition: i32,
    pub(crate) offset: i64,
    pub(crate) ready: bool,
    pub(crate) committed: Option<i64>,
}

/// records what it processes, optionally taking its time about it
#[derive(Clone, Debug)]
pub(crate) struct Recorder {
    broker: Broker,
    group_id: String,
    readiness: Readiness,
    delay: Duration,
    processed: mpsc::UnboundedSender<Processed>,
}

impl Recorder {
    pub(crate) fn new(
        broker: Broker,
        group_id: &str,
        readiness: Readiness,
    ) -> (Self, mpsc::UnboundedReceiver<Processed>) {
        let (processed, receiver) = mpsc::unbounded_channel();

        (
            Self {
                broker,
                group_id: group_id.to_owned(),
                readiness,
                delay: Duration::ZERO,
                processed,
            },
            receiver,
        )
    }

    pub(crate) fn delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }
}

#[async_trait]
impl Process for Recorder {
    async fn process(&self, record: &Record) {
        let committed = self
            .broker
            .committed(&self.group_id, &record.topition())
            .ok()
            .flatten();

        let processed = Processed {
            partition: record.partition(),
            offset: record.offset(),
            ready: self.readiness.is_set(),
            committed,
        };

        debug!(?processed);
        _ = self.processed.send(processed);

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }
}

/// receive a number of processed records
pub(crate) async fn processed(
    receiver: &mut mpsc::UnboundedReceiver<Processed>,
    n: usize,
) -> Result<Vec<Processed>> {
    within(async {
        let mut processed = Vec::with_capacity(n);

        while processed.len() < n {
            processed.push(receiver.recv().await.ok_or(Error::Closed)?);
        }

        Ok::<_, Error>(processed)
    })
    .await?
}

/// counts the lifecycle callbacks of an inner handler
#[derive(Debug)]
pub(crate) struct Tracking {
    inner: Arc<dyn Handler>,
    setups: AtomicUsize,
    cleanups: AtomicUsize,
    active: AtomicI64,
    sessions: mpsc::UnboundedSender<BTreeMap<String, Vec<i32>>>,
    claims: Mutex<Vec<Topition>>,
}

impl Tracking {
    pub(crate) fn new(
        inner: Arc<dyn Handler>,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<BTreeMap<String, Vec<i32>>>,
    ) {
        let (sessions, receiver) = mpsc::unbounded_channel();

        (
            Arc::new(Self {
                inner,
                setups: AtomicUsize::new(0),
                cleanups: AtomicUsize::new(0),
                active: AtomicI64::new(0),
                sessions,
                claims: Mutex::new(Vec::new()),
            }),
            receiver,
        )
    }

    pub(crate) fn setups(&self) -> usize {
        self.setups.load(Ordering::SeqCst)
    }

    pub(crate) fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }

    pub(crate) fn active(&self) -> i64 {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn claims(&self) -> Result<Vec<Topition>> {
        self.claims
            .lock()
            .map(|claims| claims.clone())
            .map_err(Into::into)
    }
}

#[async_trait]
impl Handler for Tracking {
    async fn setup(&self, session: &dyn Session) -> Result<()> {
        assert_eq!(self.setups(), self.cleanups());
        assert_eq!(0, self.active());

        _ = self.setups.fetch_add(1, Ordering::SeqCst);
        _ = self.sessions.send(session.claims().clone());
        self.inner.setup(session).await
    }

    async fn consume_claim(&self, session: &dyn Session, claim: Claim) -> Result<()> {
        assert_eq!(self.setups(), self.cleanups() + 1);

        self.claims.lock()?.push(claim.topition().clone());

        _ = self.active.fetch_add(1, Ordering::SeqCst);
        let consumed = self.inner.consume_claim(session, claim).await;
        _ = self.active.fetch_sub(1, Ordering::SeqCst);
        consumed
    }

    async fn cleanup(&self, session: &dyn Session) -> Result<()> {
        assert_eq!(0, self.active());

        _ = self.cleanups.fetch_add(1, Ordering::SeqCst);
        self.inner.cleanup(session).await
    }
}

/// receive the claims of the next session
pub(crate) async fn session(
    receiver: &mut mpsc::UnboundedReceiver<BTreeMap<String, Vec<i32>>>,
) -> Result<BTreeMap<String, Vec<i32>>> {
    within(receiver.recv()).await?.ok_or(Error::Closed)
}

/// tracks the handler given to an inner coordinator
#[derive(Debug)]
pub(crate) struct Tracked<C> {
    inner: C,
    handler: Mutex<Option<Arc<Tracking>>>,
}

impl<C> Tracked<C> {
    pub(crate) fn new(inner: C) -> Self {
        Self {
            inner,
            handler: Mutex::new(None),
        }
    }

    pub(crate) fn inner(&self) -> &C {
        &self.inner
    }

    /// the tracking handler of the most recent consume
    pub(crate) fn handler(&self) -> Result<Arc<Tracking>> {
        self.handler
            .lock()?
            .clone()
            .ok_or(Error::Message("not consumed".into()))
    }
}

#[async_trait]
impl<C> Coordinator for Tracked<C>
where
    C: Coordinator,
{
    async fn consume(&self, topics: &[String], handler: Arc<dyn Handler>) -> Result<()> {
        let (tracking, _sessions) = Tracking::new(handler);
        _ = self.handler.lock()?.replace(tracking.clone());
        self.inner.consume(topics, tracking).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
