use shared::metrics_defs::{MetricDef, MetricType};

pub const ENVELOPE_ACCEPTED: MetricDef = MetricDef {
    name: "envelope.accepted",
    metric_type: MetricType::Counter,
    description: "Envelopes that passed parsing, resolution and the trust check",
};

pub const ENVELOPE_REJECTED: MetricDef = MetricDef {
    name: "envelope.rejected",
    metric_type: MetricType::Counter,
    description: "Envelopes rejected before forwarding: malformed, unresolvable or untrusted",
};

pub const FORWARD_SUCCESS: MetricDef = MetricDef {
    name: "forward.success",
    metric_type: MetricType::Counter,
    description: "Envelopes for which the upstream returned a 2xx status",
};

pub const FORWARD_ERROR: MetricDef = MetricDef {
    name: "forward.error",
    metric_type: MetricType::Counter,
    description: "Envelopes that could not be delivered or got a non-2xx upstream status",
};

pub const FORWARD_ATTEMPTS: MetricDef = MetricDef {
    name: "forward.attempts",
    metric_type: MetricType::Histogram,
    description: "Upstream attempts made per forwarded envelope",
};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Tunnel request duration in seconds. Tagged with status.",
};

pub const REQUESTS_IN_FLIGHT: MetricDef = MetricDef {
    name: "request.in_flight",
    metric_type: MetricType::Gauge,
    description: "Tunnel requests currently being handled",
};

pub const ALL_METRICS: &[MetricDef] = &[
    ENVELOPE_ACCEPTED,
    ENVELOPE_REJECTED,
    FORWARD_SUCCESS,
    FORWARD_ERROR,
    FORWARD_ATTEMPTS,
    REQUEST_DURATION,
    REQUESTS_IN_FLIGHT,
];
