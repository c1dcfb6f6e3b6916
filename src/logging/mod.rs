// SPDX-License-Identifier: Apache-2.0 OR MIT
// Facility/severity logging for mgproxy.
//
// The proxy control plane is low-rate (membership reports and timers), so
// log entries travel over an unbounded tokio channel to a single consumer
// task instead of a shared-memory ring.

mod consumer;
mod facility;
mod logger;
#[macro_use]
mod macros;
mod severity;

pub use consumer::{LogConsumer, LogSink, StderrSink};
pub use facility::Facility;
pub use logger::{LogRegistry, Logger};
pub use severity::Severity;
