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

//! One shot readiness
//!
//! [`Readiness`] is set by the first session setup, [`Ready`] is waited on
//! by the process entry point. The transition happens at most once.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::{Error, Result};

pub fn channel() -> (Readiness, Ready) {
    let (sender, receiver) = watch::channel(false);

    (
        Readiness {
            sender: Arc::new(sender),
        },
        Ready { receiver },
    )
}

#[derive(Clone, Debug)]
pub struct Readiness {
    sender: Arc<watch::Sender<bool>>,
}

impl Readiness {
    /// true only for the call that performed the transition
    pub fn set(&self) -> bool {
        self.sender.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_set(&self) -> bool {
        *self.sender.borrow()
    }
}

#[derive(Debug)]
pub struct Ready {
    receiver: watch::Receiver<bool>,
}

impl Ready {
    pub fn is_ready(&self) -> bool {
        *self.receiver.borrow()
    }

    /// wait until set, returning immediately when already set
    pub async fn wait(mut self) -> Result<()> {
        self.receiver
            .wait_for(|ready| *ready)
            .await
            .map(|ready| debug!(ready = *ready))
            .map_err(|_| Error::ReadinessAbandoned)
    }
}
