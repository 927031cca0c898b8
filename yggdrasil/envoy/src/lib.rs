#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod boilerplate;
mod configurator;
mod metrics;
mod snapshotter;
mod tls;
mod translator;

pub use self::{
    configurator::{
        Certificate, Configurator, HttpExtAuthz, HttpGrpcLogger, Options, TracingProvider,
        UpstreamHealthCheck,
    },
    metrics::Metrics,
    snapshotter::Snapshotter,
    tls::validate_tls_secret,
    translator::translate_ingresses,
};
