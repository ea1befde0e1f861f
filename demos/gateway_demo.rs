//! End-to-end demonstration of the library surface: builds a tiny
//! single-RPC registry/router, mounts it under an HTTP [`Trigger`], and
//! drives one JSON request through it in-process. Not a CLI front end
//! (clap-based command-line tooling is out of scope) — this binary
//! exists purely so the pieces can be exercised without standing up a
//! real listener.

use std::sync::Arc;

use bytes::Bytes;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use ic_rpc::asn1::descriptor::{Descriptor, DescriptorKind, Field, SemanticType};
use ic_rpc::asn1::value::Value;
use ic_rpc::asn1::{pack, unpack};
use ic_rpc::ber::ByteCursor;
use ic_rpc::dispatch::{Cbe, DispatchOutcome, Registration, Router};
use ic_rpc::logging::ColorizedFormatter;
use ic_rpc::{DescriptorRef, GatewayConfig, IcStatus, Registry, RpcEntry, Trigger};

fn build_double_rpc(registry: &Registry) -> (DescriptorRef, DescriptorRef) {
    let request = registry.register(
        Descriptor::sequence(
            "Args",
            DescriptorKind::Sequence,
            vec![Field::scalar("n", SemanticType::I32, 0x80)],
        )
        .expect("valid descriptor"),
    );
    let response = registry.register(
        Descriptor::sequence(
            "Result",
            DescriptorKind::Sequence,
            vec![Field::scalar("r", SemanticType::I32, 0x80)],
        )
        .expect("valid descriptor"),
    );
    (request, response)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(LevelFilter::INFO),
        )
        .init();

    let registry = Arc::new(Registry::new());
    let (request_ref, response_ref) = build_double_rpc(&registry);
    registry.close();

    let mut router = Router::new();
    let impl_registry = registry.clone();
    router.register(
        1,
        2,
        Registration::new(Cbe::Normal(Arc::new(move |reply, slot, payload, _hdr| {
            let request_desc = impl_registry.get(request_ref);
            let mut cursor = ByteCursor::new(&payload);
            let n = match unpack(&impl_registry, &request_desc, &mut cursor, false) {
                Ok(v) => v.as_sequence().and_then(|f| f[0].as_ref()).and_then(Value::as_i64).unwrap_or(0),
                Err(e) => {
                    reply.reply(slot, e.status, Vec::new());
                    return DispatchOutcome::Deferred;
                }
            };

            let response_desc = impl_registry.get(response_ref);
            let out = Value::Sequence(vec![Some(Value::I32((n * 2) as i32))]);
            match pack(&impl_registry, &response_desc, &out) {
                Ok(bytes) => DispatchOutcome::Reply(IcStatus::Ok, bytes),
                Err(e) => DispatchOutcome::Reply(e.status, Vec::new()),
            }
        }))),
    );
    let router = Arc::new(router);

    let gateway_config = GatewayConfig::default();
    let mut trigger = Trigger::new(
        "/v1",
        "Calc",
        "http://example.invalid/calc.schema",
        router.clone(),
        registry.clone(),
        &gateway_config,
    );
    trigger.register(
        "Calc/Double",
        "Double",
        RpcEntry {
            cmd: (1u32 << 16) | 2,
            request: request_ref,
            response: response_ref,
        },
    );

    let request = http::Request::builder()
        .method("POST")
        .uri("/v1/Calc/Double")
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(())
        .expect("well-formed request");
    let (parts, _) = request.into_parts();
    let body = Bytes::from_static(br#"{"n":21}"#);

    let response = trigger.handle(&parts, body, "127.0.0.1:0").await;
    tracing::info!(
        status = response.status().as_u16(),
        body = %String::from_utf8_lossy(response.body()),
        "dispatched one JSON request through the gateway"
    );
}
