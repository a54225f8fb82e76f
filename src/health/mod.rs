//! Local resource monitoring with webhook alerts. Shares nothing with the gateway.

mod alert;
mod reporter;
mod sampler;

pub use alert::WebhookSink;
pub use reporter::HealthReporter;
pub use sampler::ProcSampler;
