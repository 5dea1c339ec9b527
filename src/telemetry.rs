use metrics::{Unit, describe_counter, describe_gauge};

pub(crate) const TELEMETRY_COUNTER_HTTP_REQUESTS_TOTAL: &str = "burrow_http_requests_total";
pub(crate) const TELEMETRY_COUNTER_TCP_CONNECTIONS_TOTAL: &str = "burrow_tcp_connections_total";
pub(crate) const TELEMETRY_COUNTER_PROXY_TIMEOUTS_TOTAL: &str = "burrow_proxy_timeouts_total";
pub(crate) const TELEMETRY_COUNTER_ORPHAN_PROXIES_TOTAL: &str = "burrow_orphan_proxies_total";
pub(crate) const TELEMETRY_GAUGE_CONTROL_CONNECTIONS: &str = "burrow_control_connections";
pub(crate) const TELEMETRY_GAUGE_TCP_PORTS: &str = "burrow_tcp_ports";

pub(crate) const TELEMETRY_KEY_HOST: &str = "host";
pub(crate) const TELEMETRY_KEY_PORT: &str = "port";

// Describe every metric emitted by the broker. Recording works without a recorder installed.
pub(crate) fn describe_metrics() {
    describe_counter!(
        TELEMETRY_COUNTER_HTTP_REQUESTS_TOTAL,
        Unit::Count,
        "Public HTTP requests routed to a tunnel"
    );
    describe_counter!(
        TELEMETRY_COUNTER_TCP_CONNECTIONS_TOTAL,
        Unit::Count,
        "Public TCP connections routed to a tunnel"
    );
    describe_counter!(
        TELEMETRY_COUNTER_PROXY_TIMEOUTS_TOTAL,
        Unit::Count,
        "Pending proxy requests that timed out"
    );
    describe_counter!(
        TELEMETRY_COUNTER_ORPHAN_PROXIES_TOTAL,
        Unit::Count,
        "Proxy connections closed for not matching any pending request"
    );
    describe_gauge!(
        TELEMETRY_GAUGE_CONTROL_CONNECTIONS,
        Unit::Count,
        "Authenticated control connections"
    );
    describe_gauge!(TELEMETRY_GAUGE_TCP_PORTS, Unit::Count, "Leased TCP ports");
}
