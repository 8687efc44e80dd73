//! Forwards orchestrator events to workers.

use orbit_core::{BoxError, Record, StreamRoute};

pub const ID: &str = "NOTIFY_WORKER";
pub const INPUT_TOPIC: &str = "net.ion.orchestrator.listen";
pub const OUTPUT_TOPIC: &str = "net.ion.orchestrator.notify";

async fn consume(record: Record) -> Result<String, BoxError> {
    Ok(record.value_lossy())
}

async fn process(event: String) -> Result<String, BoxError> {
    Ok(event)
}

async fn produce(event: String) -> Result<String, BoxError> {
    Ok(format!("Worker notified: {event}"))
}

pub fn route() -> StreamRoute<String, String, String> {
    StreamRoute::builder(ID, INPUT_TOPIC, OUTPUT_TOPIC)
        .description("Notify workers of orchestrator events")
        .consume(consume)
        .process(process)
        .produce(produce)
}
