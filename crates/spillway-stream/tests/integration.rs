//! End-to-end tests for the streaming pipeline writer.

use spillway_stream::{
    flow, is_closed, AggregateOptions, Metadata, Stage, StreamOptions, StreamWriter,
};
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.contents())
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn parity_stages() -> Vec<Stage> {
    vec![
        Stage::map(|record: Vec<u8>| {
            let digit: u32 = String::from_utf8_lossy(&record).trim().parse().unwrap();
            let mut meta = Metadata::new();
            meta.insert(
                "parity".into(),
                if digit % 2 == 0 { "even" } else { "odd" }.into(),
            );
            (meta, record)
        }),
        Stage::aggregate(|meta: &Metadata| meta["parity"].clone()),
    ]
}

#[test]
fn test_empty_pipeline_round_trip() {
    let buf = SharedBuf::default();
    let mut writer = StreamWriter::new(buf.clone(), Vec::new());

    let mut expected = Vec::new();
    for i in 0..100 {
        let record = format!("record-{i}\n");
        writer.write(record.as_bytes()).unwrap();
        expected.extend_from_slice(record.as_bytes());
    }
    writer.close().unwrap();

    // Zero stages: sink output is the exact concatenation of the inputs.
    assert_eq!(buf.contents(), expected);
}

#[test]
fn test_passthrough_messages_survive_verbatim() {
    for msg in ["Hello, World!", "1234567890", "@#$^%&*()!~"] {
        let buf = SharedBuf::default();
        let mut writer = StreamWriter::new(buf.clone(), vec![Stage::pass_through()]);

        writer.write(msg.as_bytes()).unwrap();
        writer.close().unwrap();

        assert_eq!(buf.contents(), msg.as_bytes());
    }
}

#[test]
fn test_aggregator_partitions_by_parity() {
    let buf = SharedBuf::default();
    let mut writer = StreamWriter::new(buf.clone(), parity_stages());

    for n in 1..=9 {
        writer.write(format!("{n}\n").as_bytes()).unwrap();
    }
    writer.close().unwrap();

    let lines = buf.lines();
    assert_eq!(lines.len(), 9);

    // Per-key order is preserved; the order of the two batches is not.
    let odds: Vec<&str> = lines
        .iter()
        .map(String::as_str)
        .filter(|l| l.parse::<u32>().unwrap() % 2 == 1)
        .collect();
    let evens: Vec<&str> = lines
        .iter()
        .map(String::as_str)
        .filter(|l| l.parse::<u32>().unwrap() % 2 == 0)
        .collect();
    assert_eq!(odds, vec!["1", "3", "5", "7", "9"]);
    assert_eq!(evens, vec!["2", "4", "6", "8"]);

    // Each batch is written contiguously.
    let first_parity = lines[0].parse::<u32>().unwrap() % 2;
    let flips = lines
        .windows(2)
        .filter(|w| w[0].parse::<u32>().unwrap() % 2 != w[1].parse::<u32>().unwrap() % 2)
        .count();
    assert_eq!(flips, 1, "groups interleaved: {lines:?} (first {first_parity})");
}

fn extract_trace_metadata(record: &[u8]) -> Metadata {
    let mut meta = Metadata::new();
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(record) {
        for field in ["uuid", "level", "path"] {
            if let Some(text) = value.get(field).and_then(serde_json::Value::as_str) {
                meta.insert(field.to_owned(), text.to_owned());
            }
        }
    }
    meta
}

#[test]
fn test_group_filter_keeps_only_traces_with_errors() {
    let buf = SharedBuf::default();
    let stages = flow::grouped(
        |record| {
            let meta = extract_trace_metadata(&record);
            (meta, record)
        },
        |meta| meta.get("uuid").map(String::as_str) != Some("ID001"),
        |meta| meta.get("uuid").cloned().unwrap_or_default(),
        |metas| {
            metas
                .iter()
                .any(|m| m.get("level").map(String::as_str) == Some("error"))
        },
        AggregateOptions::default(),
    );
    let writer = StreamWriter::new(buf.clone(), stages);

    let handles: Vec<_> = ["ID001", "ID002", "ID003"]
        .into_iter()
        .map(|uuid| {
            let mut writer = writer.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    let record = serde_json::json!({
                        "uuid": uuid,
                        "level": "info",
                        "iter": i,
                    });
                    writer
                        .write(format!("{record}\n").as_bytes())
                        .unwrap();
                }
                if uuid == "ID003" {
                    let record = serde_json::json!({
                        "uuid": uuid,
                        "level": "error",
                        "msg": "error occurred",
                    });
                    writer
                        .write(format!("{record}\n").as_bytes())
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut writer = writer;
    writer.close().unwrap();

    // ID001 was filtered record-by-record, ID002's group had no error, so
    // exactly ID003's 10 info records plus its error survive.
    let lines = buf.lines();
    assert_eq!(lines.len(), 11);
    assert!(lines.iter().all(|l| l.contains("ID003")));
    assert_eq!(lines.iter().filter(|l| l.contains("error")).count(), 1);
}

#[test]
fn test_group_filter_rejecting_everything_suppresses_all_records() {
    let buf = SharedBuf::default();
    let stages = vec![
        Stage::map(|record: Vec<u8>| (Metadata::new(), record)),
        Stage::aggregate(|_: &Metadata| "all".to_owned()),
        Stage::group_filter(|_: &[Metadata]| false),
    ];
    let mut writer = StreamWriter::new(buf.clone(), stages);

    for i in 0..50 {
        writer.write(format!("record-{i}\n").as_bytes()).unwrap();
    }
    writer.close().unwrap();

    assert!(buf.contents().is_empty());
}

#[test]
fn test_concurrent_producers_lose_nothing() {
    let buf = SharedBuf::default();
    let writer = StreamWriter::with_options(
        buf.clone(),
        Vec::new(),
        StreamOptions::new().with_channel_capacity(16),
    );

    let handles: Vec<_> = (0..2)
        .map(|producer| {
            let mut writer = writer.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    writer
                        .write(format!("Hello World, {producer}-{i}\n").as_bytes())
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut writer = writer;
    writer.close().unwrap();

    let lines = buf.lines();
    assert_eq!(lines.len(), 1000);
    for producer in 0..2 {
        let prefix = format!("Hello World, {producer}-");
        let seen: Vec<_> = lines.iter().filter(|l| l.starts_with(&prefix)).collect();
        assert_eq!(seen.len(), 500);
        for (i, line) in seen.iter().enumerate() {
            assert_eq!(**line, format!("Hello World, {producer}-{i}"));
        }
    }

    let err = writer.write(b"late").unwrap_err();
    assert!(is_closed(&err));
}

#[test]
fn test_aged_group_fires_while_pipeline_stays_open() {
    let buf = SharedBuf::default();
    let stages = vec![
        Stage::map(|record: Vec<u8>| (Metadata::new(), record)),
        Stage::aggregate_with(
            |_: &Metadata| "slow".to_owned(),
            AggregateOptions::new().with_delay_threshold(Duration::from_millis(30)),
        ),
    ];
    let mut writer = StreamWriter::new(buf.clone(), stages);

    writer.write(b"aged-out\n").unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while buf.contents().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(buf.lines(), vec!["aged-out"]);

    writer.close().unwrap();
}

#[test]
fn test_stage_panic_does_not_take_down_the_pipeline() {
    let buf = SharedBuf::default();
    let stages = vec![Stage::map(|record: Vec<u8>| {
        if record == b"boom\n" {
            panic!("poisoned record");
        }
        (Metadata::new(), record)
    })];
    let mut writer = StreamWriter::new(buf.clone(), stages);

    writer.write(b"first\n").unwrap();
    writer.write(b"boom\n").unwrap();
    writer.write(b"last\n").unwrap();
    writer.close().unwrap();

    assert_eq!(buf.lines(), vec!["first", "last"]);
    assert!(writer.errored());
}

#[test]
fn test_write_after_close_fails_and_close_is_idempotent() {
    let mut writer = StreamWriter::new(Vec::new(), vec![Stage::pass_through()]);
    writer.write(b"x").unwrap();
    writer.close().unwrap();
    writer.close().unwrap();

    let err = writer.write(b"late").unwrap_err();
    assert!(is_closed(&err));
}
