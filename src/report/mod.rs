//! Best-effort reporting of outcomes.
//!
//! Neither sink ever returns an error to the caller: delivery failures are
//! logged and dropped, the next pass reports again.

pub mod metrics;
pub mod notify;

use std::time::Duration;

pub use metrics::{DisabledGateway, MetricGateway, MetricSample, Pushgateway};
pub use notify::{LogNotifier, Notify, TelegramNotifier};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client() -> reqwest::Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
}
