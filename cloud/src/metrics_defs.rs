use shared::metrics_defs::{MetricDef, MetricType};

pub const WAREHOUSE_JOB_DURATION: MetricDef = MetricDef {
    name: "cloud.warehouse.job.duration",
    metric_type: MetricType::Histogram,
    description: "Time from job insertion until the job finished or the wait expired, in seconds.",
};

pub const WAREHOUSE_JOB_FAILURES: MetricDef = MetricDef {
    name: "cloud.warehouse.job.failures",
    metric_type: MetricType::Counter,
    description: "Warehouse jobs that failed or timed out.",
};

pub const MESSAGES_PUBLISHED: MetricDef = MetricDef {
    name: "cloud.pubsub.published",
    metric_type: MetricType::Counter,
    description: "Messages published to the SQL import topic.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    WAREHOUSE_JOB_DURATION,
    WAREHOUSE_JOB_FAILURES,
    MESSAGES_PUBLISHED,
];
