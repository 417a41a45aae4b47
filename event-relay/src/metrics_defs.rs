use shared::metrics_defs::{MetricDef, MetricType};

pub const EVENTS_RECEIVED: MetricDef = MetricDef {
    name: "events.received",
    metric_type: MetricType::Counter,
    description: "Push deliveries received on the stream path",
};

pub const EVENTS_ACKED: MetricDef = MetricDef {
    name: "events.acked",
    metric_type: MetricType::Counter,
    description: "Events persisted to the warehouse and acknowledged",
};

pub const EVENTS_MALFORMED: MetricDef = MetricDef {
    name: "events.malformed",
    metric_type: MetricType::Counter,
    description: "Push deliveries rejected before decoding finished. Tagged with reason.",
};

pub const EVENTS_INSERT_FAILED: MetricDef = MetricDef {
    name: "events.insert_failed",
    metric_type: MetricType::Counter,
    description: "Decoded events the warehouse did not accept. Tagged with reason.",
};

pub const WAREHOUSE_INSERT_DURATION: MetricDef = MetricDef {
    name: "warehouse.insert.duration",
    metric_type: MetricType::Histogram,
    description: "Warehouse insert duration in seconds. Tagged with writer.",
};

pub const SPANS_DROPPED: MetricDef = MetricDef {
    name: "spans.dropped",
    metric_type: MetricType::Counter,
    description: "Finished spans dropped because the export queue was full",
};

pub const SPANS_EXPORT_FAILED: MetricDef = MetricDef {
    name: "spans.export_failed",
    metric_type: MetricType::Counter,
    description: "Spans the exporter failed to deliver. Tagged with exporter.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    EVENTS_RECEIVED,
    EVENTS_ACKED,
    EVENTS_MALFORMED,
    EVENTS_INSERT_FAILED,
    WAREHOUSE_INSERT_DURATION,
    SPANS_DROPPED,
    SPANS_EXPORT_FAILED,
];
