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

use std::{path::PathBuf, process};

use clap::Parser;
use tansu_consumer::{CancelKind, Configuration, Consumer, Tls, Version};
use tracing::{debug, info};
use url::Url;

use crate::{EnvVarExp, Result, TracingFormat, otel};

const DEFAULT_CLIENT_ID: &str = "tansu-consumer";

/// Consumer group member, logging every record claimed from its assigned partitions
#[derive(Clone, Debug, Parser)]
#[command(name = "tansu-consumer", about, long_about = None)]
pub struct Cli {
    /// Comma separated brokers, for example: localhost:9092
    #[arg(long, env = "KAFKA_PEERS", value_delimiter = ',')]
    brokers: Vec<EnvVarExp<String>>,

    /// Protocol version of the cluster
    #[arg(long, env = "KAFKA_VERSION", default_value = "2.1.1")]
    version: Version,

    /// Consumer group
    #[arg(long, env = "CONSUMER_GROUP")]
    group: Option<String>,

    /// Comma separated topics to consume
    #[arg(long, env = "TOPICS", value_delimiter = ',')]
    topics: Vec<String>,

    /// Debug logging of group coordination and the Kafka client
    #[arg(long)]
    verbose: bool,

    /// Client certificate chain (PEM)
    #[arg(long)]
    certificate: Option<PathBuf>,

    /// Client private key (PEM)
    #[arg(long)]
    key: Option<PathBuf>,

    /// Certificate authority (PEM)
    #[arg(long)]
    ca: Option<PathBuf>,

    /// Skip verification of the server certificate chain
    #[arg(long)]
    skip_verify: bool,

    /// Client id reported to the group
    #[arg(long, env = "CLIENT_ID", default_value = DEFAULT_CLIENT_ID)]
    client_id: String,

    /// Log output format: text or json
    #[arg(long, env = "TRACING_FORMAT", default_value = "text")]
    tracing_format: TracingFormat,

    /// OTEL Exporter OTLP endpoint
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint_url: Option<EnvVarExp<Url>>,
}

impl Cli {
    pub async fn main() -> Result<Option<CancelKind>> {
        let cli = Cli::parse();

        let _guard = otel::init(
            cli.tracing_format,
            cli.verbose,
            cli.otlp_endpoint_url
                .clone()
                .map(|otlp_endpoint_url| otlp_endpoint_url.into_inner()),
        )?;

        debug!(pid = process::id());

        let configuration = cli.configuration()?;
        debug!(?configuration);

        Consumer::new(configuration)
            .main()
            .await
            .inspect(|cancel| info!(?cancel, "consumer stopped"))
            .map_err(Into::into)
    }

    pub fn configuration(&self) -> Result<Configuration> {
        Configuration::builder()
            .brokers(
                self.brokers
                    .iter()
                    .cloned()
                    .map(EnvVarExp::into_inner)
                    .collect(),
            )
            .group_id(self.group.clone().unwrap_or_default())
            .topics(self.topics.clone())
            .version(self.version)
            .client_id(Some(self.client_id.clone()))
            .verbose(self.verbose)
            .tls(
                Tls::default()
                    .certificate(self.certificate.clone())
                    .key(self.key.clone())
                    .ca(self.ca.clone())
                    .skip_verify(self.skip_verify),
            )
            .build()
            .map_err(Into::into)
    }
}
