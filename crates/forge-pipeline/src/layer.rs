//! `tracing` layer that turns log events into pipeline submissions, which is
//! how the process's own logs reach the `logs` channel.

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use forge_core::{DomainEvent, EventLevel};

use crate::pipeline::BatchPipeline;

pub struct PipelineLayer {
    pipeline: BatchPipeline,
}

impl PipelineLayer {
    pub fn new(pipeline: BatchPipeline) -> Self {
        Self { pipeline }
    }
}

impl<S: Subscriber> Layer<S> for PipelineLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if self.pipeline.is_shut_down() {
            return;
        }
        let meta = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut domain = DomainEvent::new(
            level_of(meta.level()),
            meta.target(),
            visitor.message.unwrap_or_default(),
        );
        domain.details = visitor.fields;
        // Filtered and shut-down outcomes are both fine to ignore here.
        let _ = self.pipeline.submit(domain);
    }
}

fn level_of(level: &Level) -> EventLevel {
    match *level {
        Level::TRACE => EventLevel::Trace,
        Level::DEBUG => EventLevel::Debug,
        Level::INFO => EventLevel::Info,
        Level::WARN => EventLevel::Warn,
        Level::ERROR => EventLevel::Error,
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl FieldVisitor {
    fn record(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = Some(match value {
                Value::String(s) => s,
                other => other.to_string(),
            });
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record(field, Value::String(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.record(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.record(field, Value::from(value));
    }
}
