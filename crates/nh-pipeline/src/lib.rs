//! Delivery pipeline: template rendering, channel adapters, the claim-based
//! notification processor, escalation, and the audit trail.

pub mod adapter;
pub mod audit;
pub mod escalation;
pub mod processor;
pub mod template;

pub use adapter::{build_adapter, build_http_client, AdapterRegistry, ChannelAdapter};
pub use audit::{AuditSink, LogAuditSink, WebhookAuditSink};
pub use escalation::{EscalationDecision, EscalationEngine, EscalationPolicy};
pub use processor::{
    dispatch_notification, PipelineError, Processor, ProcessorOptions, RetryPolicy,
};
pub use template::{TemplateEngine, TemplateError};
