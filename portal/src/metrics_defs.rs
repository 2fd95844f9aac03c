use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Portal request duration in seconds. Tagged with route, status.",
};

pub const UPLOADS: MetricDef = MetricDef {
    name: "uploads",
    metric_type: MetricType::Counter,
    description: "Files staged for ingestion. Tagged with format.",
};

pub const PREVIEW_RUNS: MetricDef = MetricDef {
    name: "preview.runs",
    metric_type: MetricType::Counter,
    description: "Preview runs. Tagged with outcome (ok, failed).",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUEST_DURATION, UPLOADS, PREVIEW_RUNS];
