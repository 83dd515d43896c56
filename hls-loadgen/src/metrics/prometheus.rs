//! Renders a `MetricsCollector` snapshot as Prometheus text exposition
//! format. Mirrors the teacher's exporter shape: one `write_*` helper per
//! metric kind, namespace-prefixed names, `# HELP`/`# TYPE` lines ahead of
//! every series.

use std::sync::Arc;

use super::collector::MetricsCollector;

pub struct PrometheusExporter {
    collector: Arc<MetricsCollector>,
    namespace: String,
}

impl PrometheusExporter {
    pub fn new(collector: Arc<MetricsCollector>) -> Self {
        Self::with_namespace(collector, "hls_loadgen")
    }

    pub fn with_namespace(collector: Arc<MetricsCollector>, namespace: impl Into<String>) -> Self {
        Self {
            collector,
            namespace: namespace.into(),
        }
    }

    pub fn export(&self) -> String {
        let snapshot = self.collector.snapshot();
        let mut out = String::new();

        self.write_gauge(&mut out, "clients_active", "Number of actively running clients", snapshot.active_clients as f64);
        self.write_gauge(&mut out, "clients_target", "Configured target client count", snapshot.target_clients as f64);
        self.write_gauge(&mut out, "clients_ramp_started", "Clients released by the ramp scheduler so far", snapshot.ramp_started as f64);
        self.write_gauge(&mut out, "clients_stalled", "Clients with no progress update past the stall threshold", snapshot.stalled_clients as f64);
        self.write_gauge(&mut out, "clients_degraded", "Clients whose pipeline drop ratio exceeds the configured threshold", snapshot.degraded_clients as f64);
        self.write_gauge(&mut out, "clients_above_realtime", "Clients downloading faster than realtime (speed > 1.0x)", snapshot.count_above_realtime as f64);
        self.write_gauge(&mut out, "clients_below_realtime", "Clients downloading slower than realtime (0 < speed < 1.0x)", snapshot.count_below_realtime as f64);
        self.write_gauge(&mut out, "clients_high_drift", "Clients whose playhead drift exceeds the high-drift threshold", snapshot.clients_with_high_drift as f64);

        self.write_counter(&mut out, "restarts_total", "Total worker restarts across all clients", snapshot.total_restarts as f64);
        self.write_counter(&mut out, "fatal_total", "Clients that gave up after exhausting max restarts", snapshot.total_fatal as f64);
        for (code, count) in &snapshot.restarts_by_exit_code {
            self.write_counter_with_labels(
                &mut out,
                "exits_total",
                "Total worker exits by exit code",
                *count as f64,
                &[("exit_code", &code.to_string())],
            );
        }

        self.write_gauge(&mut out, "uptime_ms_p50", "Worker uptime P50 in milliseconds", snapshot.uptime_p50_ms as f64);
        self.write_gauge(&mut out, "uptime_ms_p90", "Worker uptime P90 in milliseconds", snapshot.uptime_p90_ms as f64);
        self.write_gauge(&mut out, "uptime_ms_p99", "Worker uptime P99 in milliseconds", snapshot.uptime_p99_ms as f64);
        self.write_gauge(&mut out, "uptime_ms_max", "Maximum observed worker uptime in milliseconds", snapshot.uptime_max_ms as f64);

        for (code, count) in &snapshot.http_errors {
            self.write_counter_with_labels(
                &mut out,
                "http_errors_total",
                "Total HTTP error responses observed in worker logs, by status code",
                *count as f64,
                &[("status", &code.to_string())],
            );
        }
        self.write_counter(&mut out, "http_errors_other_total", "HTTP error mentions outside the 400-599 range", snapshot.http_other as f64);

        self.write_counter(&mut out, "bytes_downloaded_total", "Total bytes downloaded across all clients", snapshot.total_bytes as f64);
        self.write_gauge(&mut out, "throughput_bytes_per_sec_instant", "Instantaneous aggregate throughput since the previous snapshot", snapshot.instant_bytes_per_sec);
        self.write_gauge(&mut out, "throughput_bytes_per_sec_1s", "Aggregate throughput, 1s rolling window", snapshot.throughput_w1s);
        self.write_gauge(&mut out, "throughput_bytes_per_sec_30s", "Aggregate throughput, 30s rolling window", snapshot.throughput_w30s);
        self.write_gauge(&mut out, "throughput_bytes_per_sec_60s", "Aggregate throughput, 60s rolling window", snapshot.throughput_w60s);
        self.write_gauge(&mut out, "throughput_bytes_per_sec_300s", "Aggregate throughput, 300s rolling window", snapshot.throughput_w300s);

        for (client_id, bytes) in &snapshot.per_client_bytes {
            self.write_gauge_with_labels(
                &mut out,
                "client_bytes_downloaded",
                "Bytes downloaded by one client (enabled via --per-client-metrics)",
                *bytes as f64,
                &[("client_id", &client_id.to_string())],
            );
        }

        if let Some(v) = snapshot.origin_cpu_percent {
            self.write_gauge(&mut out, "origin_cpu_percent", "Origin host CPU utilization, percent", v);
        }
        if let Some(v) = snapshot.origin_memory_used_bytes {
            self.write_gauge(&mut out, "origin_memory_used_bytes", "Origin host memory in use", v);
        }
        if let Some(v) = snapshot.origin_memory_total_bytes {
            self.write_gauge(&mut out, "origin_memory_total_bytes", "Origin host total memory", v);
        }
        if let Some(v) = snapshot.origin_net_in_bytes_per_sec {
            self.write_gauge(&mut out, "origin_network_in_bytes_per_sec", "Origin host inbound network rate", v);
        }
        if let Some(v) = snapshot.origin_net_out_bytes_per_sec {
            self.write_gauge(&mut out, "origin_network_out_bytes_per_sec", "Origin host outbound network rate", v);
        }
        if let Some(v) = snapshot.origin_nginx_requests_per_sec {
            self.write_gauge(&mut out, "origin_nginx_requests_per_sec", "Origin nginx request rate", v);
        }
        if let Some(v) = snapshot.origin_nginx_connections {
            self.write_gauge(&mut out, "origin_nginx_connections_active", "Origin nginx active connections", v);
        }

        out
    }

    fn write_gauge(&self, out: &mut String, name: &str, help: &str, value: f64) {
        let full = format!("{}_{}", self.namespace, name);
        out.push_str(&format!("# HELP {full} {help}\n"));
        out.push_str(&format!("# TYPE {full} gauge\n"));
        out.push_str(&format!("{full} {value}\n"));
    }

    fn write_gauge_with_labels(&self, out: &mut String, name: &str, help: &str, value: f64, labels: &[(&str, &str)]) {
        let full = format!("{}_{}", self.namespace, name);
        out.push_str(&format!("# HELP {full} {help}\n"));
        out.push_str(&format!("# TYPE {full} gauge\n"));
        out.push_str(&format!("{full}{{{}}} {value}\n", format_labels(labels)));
    }

    fn write_counter(&self, out: &mut String, name: &str, help: &str, value: f64) {
        let full = format!("{}_{}", self.namespace, name);
        out.push_str(&format!("# HELP {full} {help}\n"));
        out.push_str(&format!("# TYPE {full} counter\n"));
        out.push_str(&format!("{full} {value}\n"));
    }

    fn write_counter_with_labels(&self, out: &mut String, name: &str, help: &str, value: f64, labels: &[(&str, &str)]) {
        let full = format!("{}_{}", self.namespace, name);
        out.push_str(&format!("# HELP {full} {help}\n"));
        out.push_str(&format!("# TYPE {full} counter\n"));
        out.push_str(&format!("{full}{{{}}} {value}\n", format_labels(labels)));
    }
}

fn format_labels(labels: &[(&str, &str)]) -> String {
    labels.iter().map(|(k, v)| format!("{k}=\"{v}\"")).collect::<Vec<_>>().join(",")
}
