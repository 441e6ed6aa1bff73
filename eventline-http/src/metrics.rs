//! Client and server counters, exposed through the metriken registry.

use metriken::{metric, Counter};

#[metric(
    name = "eventline_http/fetches/started",
    description = "Total client fetches started"
)]
pub static FETCHES_STARTED: Counter = Counter::new();

#[metric(
    name = "eventline_http/fetches/completed",
    description = "Total client fetches resolved with a response"
)]
pub static FETCHES_COMPLETED: Counter = Counter::new();

#[metric(
    name = "eventline_http/fetches/failed",
    description = "Total client fetches resolved with an error"
)]
pub static FETCHES_FAILED: Counter = Counter::new();

#[metric(
    name = "eventline_http/bytes/sent",
    description = "Request bytes written to the wire"
)]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "eventline_http/bytes/received",
    description = "Response bytes read from the wire"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "eventline_http/server/connections_accepted",
    description = "Total server connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "eventline_http/server/connections_closed",
    description = "Total server connections closed"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();
