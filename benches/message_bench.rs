use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use netref_protocol::core::serialization::{MultiFormat, SerializationFormat};
use netref_protocol::protocol::message::{Handler, Message};
use netref_protocol::protocol::value::{RefMarker, TypeInfo, Value};

fn sample_messages() -> Vec<Message> {
    vec![
        Message::request(1, Handler::Ping, vec![Value::Int(1)]),
        Message::request(
            2,
            Handler::CallAttr,
            vec![
                Value::LocalRef(1),
                Value::Str("add".into()),
                Value::Tuple(vec![Value::Int(2), Value::Int(3)]),
                Value::Map(Vec::new()),
            ],
        ),
        Message::reply(
            3,
            Handler::GetAttr,
            Value::Ref(RefMarker {
                object_id: 42,
                type_info: TypeInfo::new("Widget"),
            }),
        ),
        Message::reply(4, Handler::Call, Value::Str("a".repeat(1024))),
        Message::reply(
            5,
            Handler::BuffIter,
            Value::List((0..256).map(Value::Int).collect()),
        ),
    ]
}

#[allow(clippy::unwrap_used)]
fn bench_message_formats(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_formats");
    let messages = sample_messages();

    for format in [
        SerializationFormat::Bincode,
        SerializationFormat::Json,
        SerializationFormat::MessagePack,
    ] {
        group.bench_function(format!("serialize_{}", format.name()), |b| {
            b.iter_batched(
                || messages.clone(),
                |msgs| {
                    for m in msgs {
                        let _ = m.serialize_format(format).unwrap();
                    }
                },
                BatchSize::SmallInput,
            )
        });

        let blobs: Vec<Vec<u8>> = messages
            .iter()
            .map(|m| m.serialize_format(format).unwrap())
            .collect();
        group.bench_function(format!("deserialize_{}", format.name()), |b| {
            b.iter(|| {
                for blob in &blobs {
                    let _ = Message::deserialize_format(blob, format).unwrap();
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_message_formats);
criterion_main!(benches);
