//! Drives one RPC through the full gateway → dispatch → codec stack
//! over both modalities the `Trigger` negotiates (spec.md §6: JSON by
//! `Content-Type`, SOAP/XML otherwise), including gzip response
//! negotiation and the 404 path for an unregistered RPC — the parts of
//! `Trigger::handle` its own unit tests don't already cover end to end.

use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzDecoder;
use std::io::Read as _;

use ic_rpc::asn1::descriptor::{Descriptor, DescriptorKind, Field, SemanticType};
use ic_rpc::asn1::value::Value;
use ic_rpc::asn1::{pack, unpack};
use ic_rpc::ber::ByteCursor;
use ic_rpc::dispatch::{Cbe, DispatchOutcome, Registration, Router};
use ic_rpc::{GatewayConfig, IcStatus, Registry, RpcEntry, Trigger};

fn build_trigger() -> Trigger {
    let registry = Arc::new(Registry::new());
    let request = registry.register(
        Descriptor::sequence(
            "Args",
            DescriptorKind::Sequence,
            vec![Field::scalar("n", SemanticType::I32, 0x80)],
        )
        .unwrap(),
    );
    let response = registry.register(
        Descriptor::sequence(
            "Result",
            DescriptorKind::Sequence,
            vec![Field::scalar("r", SemanticType::I32, 0x80)],
        )
        .unwrap(),
    );
    registry.close();

    let mut router = Router::new();
    let impl_registry = registry.clone();
    router.register(
        1,
        1,
        Registration::new(Cbe::Normal(Arc::new(move |_reply, _slot, payload, _hdr| {
            let request_desc = impl_registry.get(request);
            let mut cursor = ByteCursor::new(&payload);
            let value = unpack(&impl_registry, &request_desc, &mut cursor, false).unwrap();
            let n = value.as_sequence().unwrap()[0].as_ref().unwrap().as_i64().unwrap();

            let response_desc = impl_registry.get(response);
            let out = Value::Sequence(vec![Some(Value::I32((n * 2) as i32))]);
            let bytes = pack(&impl_registry, &response_desc, &out).unwrap();
            DispatchOutcome::Reply(IcStatus::Ok, bytes)
        }))),
    );
    let router = Arc::new(router);

    let gateway_config = GatewayConfig::default();
    let mut trigger = Trigger::new("/v1", "Calc", "http://example.invalid/calc.schema", router, registry, &gateway_config);
    trigger.register(
        "Calc/Double",
        "Double",
        RpcEntry {
            cmd: (1u32 << 16) | 1,
            request,
            response,
        },
    );
    trigger
}

fn parts_for(uri: &str, content_type: &str, accept_encoding: Option<&str>) -> http::request::Parts {
    let mut builder = http::Request::builder()
        .method("POST")
        .uri(uri)
        .header(http::header::CONTENT_TYPE, content_type);
    if let Some(enc) = accept_encoding {
        builder = builder.header(http::header::ACCEPT_ENCODING, enc);
    }
    let (parts, _) = builder.body(()).unwrap().into_parts();
    parts
}

#[tokio::test]
async fn json_request_gets_doubled_and_gzip_negotiated() {
    let trigger = build_trigger();
    let parts = parts_for("/v1/Calc/Double", "application/json", Some("gzip, deflate"));
    let response = trigger.handle(&parts, Bytes::from_static(br#"{"n":10}"#), "127.0.0.1:0").await;

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(
        response.headers().get(http::header::CONTENT_ENCODING).unwrap(),
        "gzip"
    );

    let mut decompressed = String::new();
    GzDecoder::new(response.body().as_ref())
        .read_to_string(&mut decompressed)
        .unwrap();
    let json: serde_json::Value = serde_json::from_str(&decompressed).unwrap();
    assert_eq!(json["r"], 20);
}

#[tokio::test]
async fn soap_request_reaches_the_same_rpc_by_body_first_child_name() {
    let trigger = build_trigger();
    let parts = parts_for("/v1/", "text/xml", None);
    let envelope = br#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
        <soap:Body><Double><n>7</n></Double></soap:Body>
    </soap:Envelope>"#;
    let response = trigger.handle(&parts, Bytes::from_static(envelope), "127.0.0.1:0").await;

    assert_eq!(response.status(), http::StatusCode::OK);
    let body = String::from_utf8_lossy(response.body());
    assert!(body.contains("<r>14</r>"), "unexpected SOAP reply body: {body}");
}

#[tokio::test]
async fn unregistered_rpc_returns_404() {
    let trigger = build_trigger();
    let parts = parts_for("/v1/Calc/Missing", "application/json", None);
    let response = trigger
        .handle(&parts, Bytes::from_static(b"{}"), "127.0.0.1:0")
        .await;
    assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
}
