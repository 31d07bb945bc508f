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
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{debug, info};

use crate::{Result, group::Coordinator};

#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CancelKind {
    Interrupt,
    Terminate,
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => f.write_str("interrupt"),
            Self::Terminate => f.write_str("terminate"),
        }
    }
}

/// SIGINT and SIGTERM
#[derive(Debug)]
pub struct Signals {
    interrupt: Signal,
    terminate: Signal,
}

impl Signals {
    pub fn new() -> Result<Self> {
        let interrupt = signal(SignalKind::interrupt())?;
        debug!(?interrupt);

        let terminate = signal(SignalKind::terminate())?;
        debug!(?terminate);

        Ok(Self {
            interrupt,
            terminate,
        })
    }

    /// wait for the first of either signal
    pub async fn recv(&mut self) -> CancelKind {
        tokio::select! {
            interrupt = self.interrupt.recv() => {
                debug!(?interrupt);
                CancelKind::Interrupt
            }

            terminate = self.terminate.recv() => {
                debug!(?terminate);
                CancelKind::Terminate
            }
        }
    }
}

/// close a coordinator at most once
#[derive(Clone, Debug)]
pub struct Shutdown {
    coordinator: Arc<dyn Coordinator>,
    requested: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            coordinator,
            requested: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// true only for the request that closed the coordinator
    pub async fn request(&self, cancel: CancelKind) -> Result<bool> {
        if self.requested.swap(true, Ordering::AcqRel) {
            debug!(%cancel, requested = true);
            return Ok(false);
        }

        info!(%cancel, "terminating");
        self.coordinator.close().await.map(|()| true)
    }

    /// request shutdown once the signal arrives
    pub async fn on<F>(&self, signal: F) -> Result<CancelKind>
    where
        F: Future<Output = CancelKind>,
    {
        let cancel = signal.await;
        _ = self.request(cancel).await?;
        Ok(cancel)
    }
}
