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

//! Logging and metrics export

use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::{Protocol, WithExportConfig as _};
use opentelemetry_sdk::{Resource, metrics::SdkMeterProvider};
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;
use tracing::debug;
use tracing_subscriber::{
    EnvFilter,
    filter::LevelFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use url::Url;

use crate::{Result, TracingFormat};

const VERBOSE: [&str; 2] = ["librdkafka=debug", "tansu_consumer=debug"];

/// flushes any metrics on drop
#[derive(Debug)]
pub struct Guard {
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for Guard {
    fn drop(&mut self) {
        if let Some(meter_provider) = self.meter_provider.as_ref()
            && let Err(err) = meter_provider.shutdown()
        {
            eprintln!("{err:?}")
        }
    }
}

pub fn init(
    tracing_format: TracingFormat,
    verbose: bool,
    otlp_endpoint_url: Option<Url>,
) -> Result<Guard> {
    init_tracing_subscriber(tracing_format, verbose)?;

    otlp_endpoint_url
        .map(|otlp_endpoint_url| meter_provider(otlp_endpoint_url, env!("CARGO_PKG_NAME")))
        .transpose()
        .map(|meter_provider| Guard { meter_provider })
}

fn env_filter(verbose: bool) -> Result<EnvFilter> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    if verbose {
        VERBOSE.iter().try_fold(filter, |filter, directive| {
            directive
                .parse()
                .map(|directive| filter.add_directive(directive))
                .map_err(Into::into)
        })
    } else {
        Ok(filter)
    }
}

fn init_tracing_subscriber(tracing_format: TracingFormat, verbose: bool) -> Result<()> {
    let filter = env_filter(verbose)?;

    match tracing_format {
        TracingFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_level(true)
                    .with_line_number(true)
                    .with_thread_ids(false)
                    .with_span_events(FmtSpan::NONE),
            )
            .try_init(),

        TracingFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    }
    .map_err(Into::into)
}

pub fn meter_provider(
    otlp_endpoint_url: Url,
    service_name: impl Into<String>,
) -> Result<SdkMeterProvider> {
    otlp_endpoint_url
        .join("v1/metrics")
        .inspect(|endpoint| debug!(%endpoint))
        .map_err(Into::into)
        .and_then(|endpoint| {
            opentelemetry_otlp::MetricExporter::builder()
                .with_http()
                .with_protocol(Protocol::HttpBinary)
                .with_endpoint(endpoint.to_string())
                .build()
                .map_err(Into::into)
        })
        .map(|exporter| {
            let meter_provider = SdkMeterProvider::builder()
                .with_periodic_exporter(exporter)
                .with_resource(
                    Resource::builder_empty()
                        .with_attributes([KeyValue::new(SERVICE_NAME, service_name.into())])
                        .build(),
                )
                .build();

            global::set_meter_provider(meter_provider.clone());

            meter_provider
        })
}
