//! Filtering demo: keep a request's logs only if the request failed.
//!
//! Three request ids each emit ten info records; `ID003` also hits an
//! error. The pipeline drops `ID001` record-by-record and suppresses every
//! group without an error, so only `ID003`'s records reach stdout.

use rand::Rng;
use spillway_stream::{flow, AggregateOptions, Metadata, StreamWriter};
use std::io;
use std::thread;
use std::time::Duration;

fn extract(record: &[u8]) -> Metadata {
    let mut meta = Metadata::new();
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(record) {
        for field in ["uuid", "level"] {
            if let Some(text) = value.get(field).and_then(serde_json::Value::as_str) {
                meta.insert(field.to_owned(), text.to_owned());
            }
        }
    }
    meta
}

fn main() {
    tracing_subscriber::fmt::init();

    let stages = flow::grouped(
        |record| {
            let meta = extract(&record);
            (meta, record)
        },
        // Drop everything from ID001 outright.
        |meta| meta.get("uuid").map(String::as_str) != Some("ID001"),
        // Group by request id.
        |meta| meta.get("uuid").cloned().unwrap_or_default(),
        // Keep only groups that saw at least one error.
        |metas| {
            metas
                .iter()
                .any(|m| m.get("level").map(String::as_str) == Some("error"))
        },
        AggregateOptions::new().with_delay_threshold(Duration::from_millis(250)),
    );
    let writer = StreamWriter::new(io::stdout(), stages);

    let handles: Vec<_> = ["ID001", "ID002", "ID003"]
        .into_iter()
        .map(|uuid| {
            let mut writer = writer.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for iter in 0..10 {
                    let record = serde_json::json!({
                        "uuid": uuid,
                        "level": "info",
                        "msg": "hello",
                        "iter": iter,
                        "latency_ms": rng.gen_range(1..100),
                    });
                    writer
                        .write(format!("{record}\n").as_bytes())
                        .expect("pipeline write");
                }
                if uuid == "ID003" {
                    let record = serde_json::json!({
                        "uuid": uuid,
                        "level": "error",
                        "msg": "request failed",
                    });
                    writer
                        .write(format!("{record}\n").as_bytes())
                        .expect("pipeline write");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("producer thread");
    }

    let mut writer = writer;
    writer.close().expect("pipeline close");
}
