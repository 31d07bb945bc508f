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

//! Kafka group membership
//!
//! [`Kafka`] subscribes a librdkafka consumer to the topics of a group.
//! Each partition assignment starts a session: setup, then a claim for
//! every assigned partition fed by the consumer. A revocation stops
//! delivery to the claims from within the rebalance callback, before the
//! partitions are handed back, and ends the session once every claim has
//! returned and cleanup has been called.
//!
//! Marking a record stores its offset, stored offsets are committed by
//! the client periodically, on revocation and when the member leaves.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::{
    ClientConfig, ClientContext, Message, Offset, TopicPartitionList,
    config::RDKafkaLogLevel,
    consumer::{Consumer as _, ConsumerContext, Rebalance, StreamConsumer},
    error::KafkaResult,
    message::Headers as _,
};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, watch},
    task::{self, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, error, span, warn};
use uuid::Uuid;

use crate::{
    Error, Result,
    config::Configuration,
    group::{Claim, Coordinator, Handler, Session},
    record::{Header, Record, Topition},
    tls::TlsContext,
};

const CHANNEL_BUFFER_SIZE: usize = 64;
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const DEBUG_CONTEXTS: &str = "consumer,cgrp,topic,fetch";

type GroupConsumer = StreamConsumer<GroupContext>;

/// `host:port` of a broker, dropping any scheme or path
fn bootstrap(broker: &str) -> &str {
    let authority = broker
        .split_once("://")
        .map_or(broker, |(_, authority)| authority);

    authority
        .split_once('/')
        .map_or(authority, |(authority, _)| authority)
}

/// librdkafka properties of a group member
pub fn client_config(configuration: &Configuration, tls: Option<&TlsContext>) -> ClientConfig {
    let mut config = ClientConfig::new();

    _ = config
        .set(
            "bootstrap.servers",
            configuration
                .brokers()
                .iter()
                .map(|broker| bootstrap(broker))
                .collect::<Vec<_>>()
                .join(","),
        )
        .set("group.id", configuration.group_id())
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set(
            "api.version.request",
            configuration.version().api_version_request().to_string(),
        )
        .set(
            "broker.version.fallback",
            configuration.version().to_string(),
        );

    if let Some(client_id) = configuration.client_id() {
        _ = config.set("client.id", client_id);
    }

    if configuration.verbose() {
        _ = config
            .set("debug", DEBUG_CONTEXTS)
            .set_log_level(RDKafkaLogLevel::Debug);
    }

    if let Some(tls) = tls {
        _ = config
            .set("security.protocol", "ssl")
            .set(
                "ssl.certificate.location",
                tls.certificate_location().to_string_lossy(),
            )
            .set("ssl.key.location", tls.key_location().to_string_lossy())
            .set("ssl.ca.location", tls.ca_location().to_string_lossy())
            .set(
                "enable.ssl.certificate.verification",
                (!tls.skip_verify()).to_string(),
            );

        if tls.skip_verify() {
            _ = config.set("ssl.endpoint.identification.algorithm", "none");
        }
    }

    config
}

fn record<M: Message>(message: &M) -> Record {
    let builder = Record::builder()
        .key(message.key().map(Bytes::copy_from_slice))
        .value(message.payload().map(Bytes::copy_from_slice));

    let builder = match message
        .timestamp()
        .to_millis()
        .and_then(|millis| u64::try_from(millis).ok())
    {
        Some(millis) => builder.timestamp_millis(millis),
        None => builder,
    };

    message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    Header::new(
                        Bytes::copy_from_slice(header.key.as_bytes()),
                        header.value.map(Bytes::copy_from_slice),
                    )
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
        .into_iter()
        .fold(builder, |builder, header| builder.header(header))
        .build(
            &Topition::new(message.topic(), message.partition()),
            message.offset(),
        )
}

fn assignment(partitions: &TopicPartitionList) -> BTreeMap<String, Vec<i32>> {
    let mut assignment: BTreeMap<String, Vec<i32>> = BTreeMap::new();

    for element in partitions.elements() {
        assignment
            .entry(element.topic().to_owned())
            .or_default()
            .push(element.partition());
    }

    for partitions in assignment.values_mut() {
        partitions.sort_unstable();
    }

    assignment
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Rebalanced {
    Assigned(BTreeMap<String, Vec<i32>>),
    Revoked,
}

/// rebalance callbacks, made on the task polling the consumer
#[derive(Debug)]
struct GroupContext {
    rebalanced: mpsc::UnboundedSender<Rebalanced>,
    revoked: Mutex<Option<CancellationToken>>,
}

impl GroupContext {
    fn new(rebalanced: mpsc::UnboundedSender<Rebalanced>) -> Self {
        Self {
            rebalanced,
            revoked: Mutex::new(None),
        }
    }

    /// cancelled when the partitions of the session are revoked
    fn session(&self, revoked: CancellationToken) -> Result<()> {
        _ = self.revoked.lock()?.replace(revoked);
        Ok(())
    }
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            debug!(revoked = ?assignment(partitions));

            if let Ok(mut revoked) = self.revoked.lock()
                && let Some(revoked) = revoked.take()
            {
                revoked.cancel();
            }

            _ = self.rebalanced.send(Rebalanced::Revoked);
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                let assigned = assignment(partitions);
                debug!(?assigned);
                _ = self.rebalanced.send(Rebalanced::Assigned(assigned));
            }

            Rebalance::Revoke(_) => {}

            Rebalance::Error(err) => error!(?err),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(committed = ?offsets),
            Err(err) => warn!(?err, ?offsets),
        }
    }
}

struct KafkaSession {
    consumer: Arc<GroupConsumer>,
    member_id: String,
    generation_id: i32,
    claims: BTreeMap<String, Vec<i32>>,
    revoked: CancellationToken,
}

impl fmt::Debug for KafkaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(KafkaSession))
            .field("member_id", &self.member_id)
            .field("generation_id", &self.generation_id)
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Session for KafkaSession {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn generation_id(&self) -> i32 {
        self.generation_id
    }

    fn claims(&self) -> &BTreeMap<String, Vec<i32>> {
        &self.claims
    }

    async fn mark(&self, record: &Record) -> Result<()> {
        // librdkafka stores the offset following the one given
        match self
            .consumer
            .store_offset(record.topic(), record.partition(), record.offset())
        {
            Ok(()) => Ok(()),

            Err(err) if self.revoked.is_cancelled() => {
                debug!(
                    ?err,
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset()
                );
                Ok(())
            }

            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct Position {
    initial_offset: i64,
    high_water_mark: i64,
}

/// committed offsets and high water marks of the claimed partitions
fn positions(
    consumer: &GroupConsumer,
    claims: &BTreeMap<String, Vec<i32>>,
) -> BTreeMap<Topition, Position> {
    let mut partitions = TopicPartitionList::new();

    for (topic, claimed) in claims {
        for partition in claimed {
            _ = partitions.add_partition(topic, *partition);
        }
    }

    if partitions.count() == 0 {
        return BTreeMap::new();
    }

    let committed = consumer
        .committed_offsets(partitions.clone(), LOOKUP_TIMEOUT)
        .inspect_err(|err| warn!(?err))
        .unwrap_or(partitions);

    committed
        .elements()
        .iter()
        .map(|element| {
            let topition = Topition::new(element.topic(), element.partition());

            let high_water_mark = consumer
                .fetch_watermarks(element.topic(), element.partition(), LOOKUP_TIMEOUT)
                .map(|(_low, high)| high)
                .inspect_err(|err| debug!(%topition, ?err))
                .unwrap_or_default();

            let initial_offset = match element.offset() {
                Offset::Offset(offset) => offset,
                _ => high_water_mark,
            };

            (
                topition,
                Position {
                    initial_offset,
                    high_water_mark,
                },
            )
        })
        .collect()
}

struct Running {
    session: Arc<KafkaSession>,
    claims: BTreeMap<Topition, mpsc::Sender<Record>>,
    high_water_marks: BTreeMap<Topition, watch::Sender<i64>>,
    consumers: JoinSet<Result<()>>,
}

/// the sessions of one subscription
struct Sessions {
    consumer: Arc<GroupConsumer>,
    handler: Arc<dyn Handler>,
    member_id: String,
    generation_id: i32,
    running: Option<Running>,
}

impl Sessions {
    async fn rebalance(&mut self, rebalanced: Rebalanced) -> Result<()> {
        debug!(?rebalanced);

        match rebalanced {
            Rebalanced::Revoked => self.end().await,

            Rebalanced::Assigned(claims) => {
                self.end().await?;
                self.start(claims).await
            }
        }
    }

    async fn start(&mut self, claims: BTreeMap<String, Vec<i32>>) -> Result<()> {
        self.generation_id += 1;

        let revoked = CancellationToken::new();
        self.consumer.context().session(revoked.clone())?;

        let session = Arc::new(KafkaSession {
            consumer: self.consumer.clone(),
            member_id: self.member_id.clone(),
            generation_id: self.generation_id,
            claims,
            revoked: revoked.clone(),
        });

        self.handler.setup(session.as_ref()).await?;

        let positions = task::spawn_blocking({
            let consumer = self.consumer.clone();
            let claims = session.claims().clone();
            move || positions(&consumer, &claims)
        })
        .await?;

        let mut running = Running {
            session: session.clone(),
            claims: BTreeMap::new(),
            high_water_marks: BTreeMap::new(),
            consumers: JoinSet::new(),
        };

        for (topition, position) in positions {
            debug!(%topition, ?position);

            let (sender, receiver) = mpsc::channel(CHANNEL_BUFFER_SIZE);
            let (high_water_mark_tx, high_water_mark) = watch::channel(position.high_water_mark);

            let claim = Claim::new(
                topition.clone(),
                position.initial_offset,
                high_water_mark,
                receiver,
                revoked.clone(),
            );

            _ = running.claims.insert(topition.clone(), sender);
            _ = running.high_water_marks.insert(topition, high_water_mark_tx);

            let handler = self.handler.clone();
            let session = session.clone();

            _ = running
                .consumers
                .spawn(async move { handler.consume_claim(session.as_ref(), claim).await });
        }

        self.running = Some(running);
        Ok(())
    }

    /// revoke the claims of any running session, cleaning up once they have returned
    async fn end(&mut self) -> Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };

        running.session.revoked.cancel();
        running.claims.clear();

        let mut failure = None;

        while let Some(joined) = running.consumers.join_next().await {
            if let Err(err) = joined.map_err(Error::from).and_then(|consumed| consumed) {
                error!(?err);
                _ = failure.get_or_insert(err);
            }
        }

        debug!(generation_id = running.session.generation_id, "session ended");
        self.handler.cleanup(running.session.as_ref()).await?;

        failure.map_or(Ok(()), Err)
    }

    /// a claim that has returned before its session ended
    async fn returned(&mut self) -> Option<Result<()>> {
        match self.running.as_mut() {
            Some(running) => running
                .consumers
                .join_next()
                .await
                .map(|joined| joined.map_err(Error::from).and_then(|consumed| consumed)),
            None => None,
        }
    }

    async fn deliver(&mut self, record: Record, closing: &CancellationToken) {
        let Some(running) = self.running.as_ref() else {
            debug!(
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset(),
                "no session"
            );
            return;
        };

        let topition = record.topition();

        if let Some(high_water_mark) = running.high_water_marks.get(&topition) {
            _ = high_water_mark.send_if_modified(|high_water_mark| {
                if record.offset() >= *high_water_mark {
                    *high_water_mark = record.offset() + 1;
                    true
                } else {
                    false
                }
            });
        }

        let Some(sender) = running.claims.get(&topition) else {
            debug!(%topition, offset = record.offset(), "unclaimed");
            return;
        };

        tokio::select! {
            _ = closing.cancelled() => {}

            _ = running.session.revoked.cancelled() => {}

            sent = sender.send(record) => {
                if sent.is_err() {
                    debug!(%topition, "claim returned");
                }
            }
        }
    }
}

/// a consumer group member of a Kafka cluster
#[derive(Clone, Debug)]
pub struct Kafka {
    config: ClientConfig,
    group_id: String,
    member_id: String,
    closing: CancellationToken,
    consuming: Arc<AsyncMutex<()>>,
}

impl Kafka {
    pub fn new(configuration: &Configuration, tls: Option<&TlsContext>) -> Self {
        Self {
            config: client_config(configuration, tls),
            group_id: configuration.group_id().to_owned(),
            member_id: Uuid::now_v7().to_string(),
            closing: CancellationToken::new(),
            consuming: Arc::new(AsyncMutex::new(())),
        }
    }

    /// the librdkafka properties used by this member
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// identifies the sessions of this member, the client does not expose
    /// the member id assigned by the group coordinator
    pub fn member_id(&self) -> &str {
        &self.member_id
    }
}

#[async_trait]
impl Coordinator for Kafka {
    async fn consume(&self, topics: &[String], handler: Arc<dyn Handler>) -> Result<()> {
        let _consuming = self.consuming.lock().await;

        if self.closing.is_cancelled() {
            return Err(Error::Closed);
        }

        let span = span!(
            Level::DEBUG,
            "kafka",
            group_id = %self.group_id,
            member_id = %self.member_id
        );

        async move {
            let (rebalanced, mut rebalances) = mpsc::unbounded_channel();

            let consumer = Arc::new(
                self.config
                    .create_with_context::<_, GroupConsumer>(GroupContext::new(rebalanced))?,
            );

            consumer.subscribe(&topics.iter().map(String::as_str).collect::<Vec<_>>())?;
            debug!(?topics);

            let mut sessions = Sessions {
                consumer: consumer.clone(),
                handler,
                member_id: self.member_id.clone(),
                generation_id: 0,
                running: None,
            };

            let result = loop {
                tokio::select! {
                    biased;

                    _ = self.closing.cancelled() => break Ok(()),

                    Some(rebalanced) = rebalances.recv() => {
                        if let Err(err) = sessions.rebalance(rebalanced).await {
                            break Err(err);
                        }
                    }

                    Some(returned) = sessions.returned() => {
                        if let Err(err) = returned {
                            error!(?err);
                            break Err(err);
                        }
                    }

                    received = async { consumer.recv().await.map(|message| record(&message)) } => {
                        match received {
                            Ok(record) => {
                                let mut rebalanced = Ok(());

                                // assignment callbacks are served while polling for the record
                                while let Ok(pending) = rebalances.try_recv() {
                                    rebalanced = sessions.rebalance(pending).await;

                                    if rebalanced.is_err() {
                                        break;
                                    }
                                }

                                if let Err(err) = rebalanced {
                                    break Err(err);
                                }

                                sessions.deliver(record, &self.closing).await;
                            }

                            Err(err) => warn!(?err),
                        }
                    }
                }
            };

            let ended = sessions.end().await;
            drop(sessions);

            consumer.unsubscribe();

            // leaving the group commits any stored offsets and blocks until done
            task::spawn_blocking(move || drop(consumer)).await?;

            result.and(ended)
        }
        .instrument(span)
        .await
    }

    async fn close(&self) -> Result<()> {
        debug!(member_id = %self.member_id, closed = self.closing.is_cancelled());
        self.closing.cancel();

        let _consuming = self.consuming.lock().await;
        Ok(())
    }
}
