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

//! Process runner
//!
//! Starts consuming in the background, waits for the first session to be
//! set up, then waits for a termination signal before closing the group
//! member and waiting for consumption to finish.

use std::sync::Arc;

use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info};

use crate::{
    Error, Result,
    config::Configuration,
    group::{Coordinator, Handler},
    handler::{Log, Process, SessionHandler},
    kafka::Kafka,
    ready,
    shutdown::{CancelKind, Shutdown, Signals},
    tls::TlsContext,
};

#[derive(Clone, Debug)]
pub struct Consumer<P = Log> {
    configuration: Configuration,
    coordinator: Option<Arc<dyn Coordinator>>,
    process: P,
}

impl Consumer<Log> {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            coordinator: None,
            process: Log,
        }
    }
}

impl<P> Consumer<P>
where
    P: Process,
{
    /// consume with this coordinator rather than a member of the configured brokers
    pub fn with_coordinator(self, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            coordinator: Some(coordinator),
            ..self
        }
    }

    pub fn with_process<Q>(self, process: Q) -> Consumer<Q> {
        Consumer {
            configuration: self.configuration,
            coordinator: self.coordinator,
            process,
        }
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    fn coordinator(&self, tls: Option<&TlsContext>) -> Arc<dyn Coordinator> {
        self.coordinator.clone().unwrap_or_else(|| {
            let kafka = Kafka::new(&self.configuration, tls);
            debug!(member_id = kafka.member_id());
            Arc::new(kafka)
        })
    }

    /// run until SIGINT or SIGTERM
    pub async fn main(self) -> Result<Option<CancelKind>> {
        let mut signals = Signals::new()?;
        self.run(async move { signals.recv().await }).await
    }

    /// run until the signal completes, returning the signal received if any
    pub async fn run<F>(self, signal: F) -> Result<Option<CancelKind>>
    where
        F: Future<Output = CancelKind>,
    {
        let tls = self.configuration.tls().context()?;
        debug!(
            tls = tls.is_some(),
            skip_verify = tls.as_ref().is_some_and(TlsContext::skip_verify)
        );

        let coordinator = self.coordinator(tls.as_ref());

        debug!(
            brokers = ?self.configuration.brokers(),
            group_id = self.configuration.group_id(),
            version = %self.configuration.version(),
            topics = ?self.configuration.topics()
        );

        let shutdown = Shutdown::new(coordinator.clone());

        let (readiness, ready) = ready::channel();
        let handler: Arc<dyn Handler> =
            Arc::new(SessionHandler::new(readiness).with_process(self.process));

        let mut set = JoinSet::new();

        _ = set.spawn({
            let topics = self.configuration.topics().to_vec();
            let coordinator = coordinator.clone();
            async move { coordinator.consume(&topics, handler).await }
        });

        tokio::pin!(signal);

        let cancellation = tokio::select! {
            joined = set.join_next() => {
                consumed(joined)?;
                None
            }

            cancel = &mut signal => Some(cancel),

            waited = ready.wait() => {
                match waited {
                    Ok(()) => {
                        info!(
                            group_id = self.configuration.group_id(),
                            topics = ?self.configuration.topics(),
                            "consumer up and running"
                        );

                        tokio::select! {
                            joined = set.join_next() => {
                                consumed(joined)?;
                                None
                            }

                            cancel = &mut signal => Some(cancel),
                        }
                    }

                    Err(abandoned) => {
                        debug!(?abandoned);
                        consumed(set.join_next().await)?;
                        None
                    }
                }
            }
        };

        if let Some(cancel) = cancellation {
            _ = shutdown.request(cancel).await?;

            match consumed(set.join_next().await) {
                Err(Error::Closed) if shutdown.is_requested() => debug!(closed = true),
                otherwise => otherwise?,
            }
        }

        debug!(?cancellation);
        Ok(cancellation)
    }
}

fn consumed(joined: Option<Result<Result<()>, JoinError>>) -> Result<()> {
    joined.map_or(Ok(()), |joined| {
        joined
            .map_err(Error::from)
            .and_then(|consumed| consumed)
            .inspect_err(|err| debug!(?err))
    })
}
