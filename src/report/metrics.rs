//! Success gauges pushed to a Prometheus Pushgateway.

use std::fmt;

use reqwest::blocking::Client;
use reqwest::Url;

use crate::artifact::ResourceId;

/// A single gauge sample: 1 on success, 0 on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    /// Metric name, also used as job name of the push.
    pub metric: String,
    /// Label holding the resource id, e.g. `vm` or `db`.
    pub label: String,
    pub resource: ResourceId,
    pub node: String,
    pub success: bool,
}

impl MetricSample {
    pub fn new(metric: &str, label: &str, resource: &ResourceId, node: &str, success: bool) -> Self {
        Self {
            metric: metric.to_string(),
            label: label.to_string(),
            resource: resource.clone(),
            node: node.to_string(),
            success,
        }
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace('"', r#"\""#)
        .replace('\n', r"\n")
}

/// Text exposition format, e.g. `vm_backup{vm="101", node="10.0.0.5"} 1`.
impl fmt::Display for MetricSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"{}{{{}="{}", node="{}"}} {}"#,
            self.metric,
            self.label,
            escape(self.resource.as_str()),
            escape(&self.node),
            u8::from(self.success)
        )
    }
}

/// Sink for [MetricSample]s.
///
/// Implementations must not fail: errors are logged and swallowed.
pub trait MetricGateway {
    fn push(&self, sample: &MetricSample);
}

impl<M: MetricGateway + ?Sized> MetricGateway for &M {
    fn push(&self, sample: &MetricSample) {
        (**self).push(sample)
    }
}

impl<M: MetricGateway + ?Sized> MetricGateway for Box<M> {
    fn push(&self, sample: &MetricSample) {
        (**self).push(sample)
    }
}

/// Pushes samples to `{base}/metrics/job/{metric}/instance/{resource}`.
pub struct Pushgateway {
    client: Client,
    base: Url,
}

impl Pushgateway {
    pub fn new(base: Url) -> reqwest::Result<Self> {
        Ok(Self {
            client: super::http_client()?,
            base,
        })
    }

    pub fn push_url(&self, sample: &MetricSample) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([
                "metrics",
                "job",
                sample.metric.as_str(),
                "instance",
                sample.resource.as_str(),
            ]);
        }
        url
    }

    fn send(&self, sample: &MetricSample) -> reqwest::Result<()> {
        self.client
            .post(self.push_url(sample))
            .header(reqwest::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(format!("{sample}\n"))
            .send()?
            .error_for_status()?;

        Ok(())
    }
}

impl MetricGateway for Pushgateway {
    fn push(&self, sample: &MetricSample) {
        log::debug!(target: "metrics", "Pushing {sample}");

        if let Err(e) = self.send(sample) {
            log::error!(target: "metrics", "Pushing metric for {} failed: {e}", sample.resource);
        }
    }
}

/// Used when no Pushgateway is configured.
pub struct DisabledGateway;

impl MetricGateway for DisabledGateway {
    fn push(&self, sample: &MetricSample) {
        log::trace!(target: "metrics", "No Pushgateway configured, dropping {sample}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_exposition_line() {
        let ok = MetricSample::new("vm_backup", "vm", &"101".into(), "10.0.0.5", true);
        assert_eq!(ok.to_string(), r#"vm_backup{vm="101", node="10.0.0.5"} 1"#);

        let failed = MetricSample::new("vm_backup", "vm", &"101".into(), "10.0.0.5", false);
        assert_eq!(failed.to_string(), r#"vm_backup{vm="101", node="10.0.0.5"} 0"#);
    }

    #[test]
    fn escapes_label_values() {
        let sample = MetricSample::new("db_backup", "db", &r#"we"ird"#.into(), "node", true);
        assert_eq!(sample.to_string(), r#"db_backup{db="we\"ird", node="node"} 1"#);
    }

    #[test]
    fn scopes_url_by_job_and_instance() {
        let gateway = Pushgateway::new(Url::parse("http://pushgateway:9091/").unwrap()).unwrap();
        let sample = MetricSample::new("vm_backup", "vm", &"101".into(), "10.0.0.5", true);

        assert_eq!(
            gateway.push_url(&sample).as_str(),
            "http://pushgateway:9091/metrics/job/vm_backup/instance/101"
        );
    }

    #[test]
    fn pushes_sample_body() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/metrics/job/vm_backup/instance/101")
            .match_body("vm_backup{vm=\"101\", node=\"10.0.0.5\"} 0\n")
            .with_status(200)
            .create();

        let gateway = Pushgateway::new(Url::parse(&server.url()).unwrap()).unwrap();
        gateway.push(&MetricSample::new("vm_backup", "vm", &"101".into(), "10.0.0.5", false));

        mock.assert();
    }

    #[test]
    fn swallows_unreachable_gateway() {
        // nothing listens on the discard port
        let gateway = Pushgateway::new(Url::parse("http://127.0.0.1:9/").unwrap()).unwrap();
        gateway.push(&MetricSample::new("vm_backup", "vm", &"101".into(), "node", true));
    }
}
